//! Wiring for the `tern` server: configuration loading and the controller
//! that starts storage, the delivery engine and the SMTP listener.

pub mod config;
pub mod controller;

pub use config::Tern;
pub use controller::Running;
