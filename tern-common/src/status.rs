use core::fmt::{self, Display, Formatter};

/// SMTP reply codes used by the server and understood by the client.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug, Hash)]
pub enum Status {
    HelpMessage,
    ServiceReady,
    GoodBye,
    AuthSuccessful,
    Ok,
    CannotVerify,
    AuthChallenge,
    StartMailInput,
    Unavailable,
    ActionUnavailable,
    Unrecognised,
    SyntaxError,
    NotImplemented,
    InvalidCommandSequence,
    ParameterNotImplemented,
    AuthRequired,
    InvalidCredentials,
    Error,
    ExceededStorage,
    TransactionFailed,
    Unknown(u32),
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u32::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u32::from(self))
    }

    /// 2xx and 3xx replies
    #[must_use]
    pub fn is_positive(self) -> bool {
        (200..400).contains(&u32::from(self))
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        match value {
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSuccessful,
            250 => Self::Ok,
            252 => Self::CannotVerify,
            334 => Self::AuthChallenge,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            451 => Self::ActionUnavailable,
            500 => Self::Unrecognised,
            501 => Self::SyntaxError,
            502 => Self::NotImplemented,
            503 => Self::InvalidCommandSequence,
            504 => Self::ParameterNotImplemented,
            530 => Self::AuthRequired,
            535 => Self::InvalidCredentials,
            550 => Self::Error,
            552 => Self::ExceededStorage,
            554 => Self::TransactionFailed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        match value {
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSuccessful => 235,
            Status::Ok => 250,
            Status::CannotVerify => 252,
            Status::AuthChallenge => 334,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::ActionUnavailable => 451,
            Status::Unrecognised => 500,
            Status::SyntaxError => 501,
            Status::NotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::ParameterNotImplemented => 504,
            Status::AuthRequired => 530,
            Status::InvalidCredentials => 535,
            Status::Error => 550,
            Status::ExceededStorage => 552,
            Status::TransactionFailed => 554,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}
