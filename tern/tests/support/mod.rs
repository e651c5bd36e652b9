//! Test support for end-to-end runs of the whole server.

pub mod harness;
#[path = "../../../tern-delivery/tests/support/mock_server.rs"]
pub mod mock_server;

pub use harness::TestHarness;
pub use mock_server::SmtpCommand;
