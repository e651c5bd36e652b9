use tern_common::{error::SessionError, incoming};
use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::{
    command::Command,
    dispatch::{self, Event},
    state::State,
};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// Route one received line to the body, an AUTH exchange or the
    /// command dispatcher and send whatever reply results.
    pub(super) async fn handle_line(&mut self, line: &[u8]) -> Result<Event, SessionError> {
        if self.context.state == State::ReceivingData {
            if !self.append_body_line(line) {
                return Ok(Event::ConnectionKeepAlive);
            }

            let reply = self.complete_data().await;
            self.reply(&reply).await?;
            return Ok(Event::ConnectionKeepAlive);
        }

        let text = String::from_utf8_lossy(line);

        let (reply, event) = if self.context.auth_step.is_some() {
            incoming!("<credentials>");
            dispatch::auth_continuation(&mut self.context, &self.config, &text)
        } else {
            let command = Command::parse(&text);
            incoming!("{command}");
            dispatch::dispatch(&mut self.context, &self.config, &command)
        };

        self.reply(&reply).await?;
        Ok(event)
    }

    /// Add one DATA line to the body, undoing dot-stuffing.
    ///
    /// Returns `true` on the terminating `.` line. Once the body passes the
    /// size limit it is dropped and the remaining lines are discarded.
    pub(super) fn append_body_line(&mut self, line: &[u8]) -> bool {
        if line == b"." {
            return true;
        }

        if self.context.body_overflow {
            return false;
        }

        let line = if line.starts_with(b"..") { &line[1..] } else { line };
        let limit = self.config.max_message_size;

        if limit > 0 && self.context.body.len() + line.len() + 2 > limit {
            self.context.overflow_body();
            return false;
        }

        self.context.body.extend_from_slice(line);
        self.context.body.extend_from_slice(b"\r\n");
        false
    }
}
