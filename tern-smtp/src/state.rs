use core::fmt::{self, Display, Formatter};

/// Where a session is in the command sequence.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum State {
    #[default]
    Connected,
    Greeted,
    MailSet,
    RcptSet,
    ReceivingData,
    Closed,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Connected => "Connected",
            Self::Greeted => "Greeted",
            Self::MailSet => "MailSet",
            Self::RcptSet => "RcptSet",
            Self::ReceivingData => "ReceivingData",
            Self::Closed => "Closed",
        })
    }
}

/// A credential exchange waiting on the client's next line.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AuthStep {
    /// `AUTH PLAIN` sent without an initial response.
    Plain,
    LoginUsername,
    LoginPassword { username: String },
}

/// Everything a session remembers between commands.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Context {
    pub state: State,
    pub authenticated: bool,
    pub auth_user: Option<String>,
    pub auth_step: Option<AuthStep>,
    pub client_host: Option<String>,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
    /// Set once the body has grown past the size limit or carried an
    /// over-long line; the rest of the data is read and discarded.
    pub body_overflow: bool,
}

impl Context {
    /// Drop sender, recipients and body. Authentication and the client's
    /// greeting survive.
    pub fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.body.clear();
        self.body_overflow = false;
        self.state = if self.client_host.is_some() {
            State::Greeted
        } else {
            State::Connected
        };
    }

    /// Give up on the body being received. The client is told at the
    /// terminating `.`.
    pub fn overflow_body(&mut self) {
        self.body_overflow = true;
        self.body = Vec::new();
    }

    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        self.sender.is_some()
    }
}
