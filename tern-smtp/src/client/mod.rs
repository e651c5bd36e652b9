//! Plain-TCP SMTP client.
//!
//! Used by the delivery engine for outbound transfers and by tests to talk
//! to a running listener.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tern_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect_timeout("localhost:2525", Duration::from_secs(5)).await?;
//! client.read_greeting().await?;
//! client.ehlo("client.example.com").await?;
//! client.mail_from("sender@example.com").await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//! let accepted = client.send_data(b"Subject: Test\r\n\r\nHello World").await?;
//! assert_eq!(accepted.code, 250);
//! # Ok(())
//! # }
//! ```

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, dot_stuff};
