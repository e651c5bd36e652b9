//! Outbound relay.
//!
//! Messages for non-local recipients are stored in a [`MessageStore`] by the
//! inbound session and handed to the [`DeliveryEngine`] by id. The engine's
//! workers resolve each recipient's exchangers with the [`MxResolver`] and
//! hand the body to a [`Transport`], retrying failed tasks on a fixed
//! interval until the retry budget is spent.
//!
//! [`MessageStore`]: tern_mailbox::MessageStore

mod config;
mod dns;
mod engine;
mod error;
mod stats;
mod task;
mod transfer;

pub use config::{DeliveryConfig, DomainConfig, DomainConfigRegistry};
pub use dns::{DnsConfig, MailServer, MxResolver};
pub use engine::DeliveryEngine;
pub use error::{DeliveryError, TransferError};
pub use stats::DeliveryStats;
pub use task::{DeliveryStatus, DeliveryTask};
pub use transfer::{OutboundTransferClient, Transport};
