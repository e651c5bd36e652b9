pub mod address;
pub mod config;
pub mod error;
pub mod logging;
pub mod status;
pub mod traits;

pub use tracing;

/// Lifecycle notifications fanned out over a broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
