pub mod auth;
pub mod client;
pub mod command;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod registry;
pub mod session;
pub mod state;

pub use auth::{Credentials, InMemoryCredentials};
pub use listener::Listener;
pub use registry::{SessionGuard, SessionInfo, SessionRegistry};
pub use session::{Backends, Session, SessionConfig};
pub use state::{Context, State};
