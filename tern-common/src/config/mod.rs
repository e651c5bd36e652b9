//! Configuration types shared between the inbound and outbound sides.

pub mod timeouts;

pub use timeouts::{ClientTimeouts, ServerTimeouts, TimeoutConfig};
