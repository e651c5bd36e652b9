//! The outbound half of the protocol: one message to one recipient via one
//! exchanger.

use async_trait::async_trait;
use tern_common::{
    config::{ClientTimeouts, TimeoutConfig},
    internal,
};
use tern_smtp::client::{Response, SmtpClient};

use crate::error::TransferError;

/// Something that can hand a message to an exchanger.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn transfer(
        &self,
        host: &str,
        port: u16,
        from: &str,
        to: &str,
        body: &[u8],
    ) -> Result<(), TransferError>;
}

/// Plain-TCP transfer client.
#[derive(Debug, Clone)]
pub struct OutboundTransferClient {
    helo_name: String,
    timeouts: ClientTimeouts,
}

fn expect(stage: &'static str, response: Response, code: u16) -> Result<Response, TransferError> {
    if response.code == code {
        Ok(response)
    } else {
        Err(TransferError::UnexpectedReply {
            stage,
            code: response.code,
            message: response.message(),
        })
    }
}

impl OutboundTransferClient {
    #[must_use]
    pub fn new(helo_name: impl Into<String>, timeouts: ClientTimeouts) -> Self {
        Self {
            helo_name: helo_name.into(),
            timeouts,
        }
    }

    async fn exchange(
        &self,
        client: &mut SmtpClient,
        from: &str,
        to: &str,
        body: &[u8],
    ) -> Result<(), TransferError> {
        expect("greeting", client.read_greeting().await?, 220)?;
        expect("EHLO", client.ehlo(&self.helo_name).await?, 250)?;
        expect("MAIL FROM", client.mail_from(from).await?, 250)?;
        expect("RCPT TO", client.rcpt_to(to).await?, 250)?;
        expect("DATA", client.data().await?, 354)?;

        client.set_read_timeout(self.timeouts.data_timeout());
        expect("end of data", client.send_data(body).await?, 250)?;

        Ok(())
    }
}

#[async_trait]
impl Transport for OutboundTransferClient {
    /// Greeting 220, EHLO 250, MAIL 250, RCPT 250, DATA 354, body 250.
    /// Any other reply aborts the transfer. QUIT is sent after a successful
    /// transfer but its outcome is ignored. The connection is closed when
    /// this returns, whatever the outcome.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, body), err)]
    async fn transfer(
        &self,
        host: &str,
        port: u16,
        from: &str,
        to: &str,
        body: &[u8],
    ) -> Result<(), TransferError> {
        let mut client = SmtpClient::connect_timeout((host, port), self.timeouts.connect_timeout())
            .await
            .map_err(|source| TransferError::Connect {
                address: format!("{host}:{port}"),
                source,
            })?
            .with_read_timeout(self.timeouts.command_timeout());

        self.exchange(&mut client, from, to, body).await?;

        client.set_read_timeout(self.timeouts.quit_timeout());
        if let Err(err) = client.quit().await {
            internal!(level = DEBUG, "QUIT to {host}:{port} failed after delivery: {err}");
        }

        Ok(())
    }
}
