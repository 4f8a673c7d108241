use core::fmt::{self, Display, Formatter};

/// SMTP reply codes emitted by the ingest core.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    HelpMessage,
    ServiceReady,
    GoodBye,
    AuthSuccessful,
    Ok,
    CannotVerify,
    StartMailInput,
    Unavailable,
    RateLimited,
    ActionAborted,
    TooManyRecipients,
    AuthTemporaryFailure,
    SyntaxError,
    InvalidParameter,
    NotImplemented,
    BadSequence,
    UnknownAuthMechanism,
    AuthFailed,
    ExceededStorage,
    TransactionFailed,
    Unknown(u16),
}

impl Status {
    /// Checks if the status is a permanent rejection
    pub fn is_permanent(self) -> bool {
        u16::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    pub fn is_temporary(self) -> bool {
        u16::from(self) >= 400 && u16::from(self) < 500
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        match value {
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSuccessful,
            250 => Self::Ok,
            252 => Self::CannotVerify,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            450 => Self::RateLimited,
            451 => Self::ActionAborted,
            452 => Self::TooManyRecipients,
            454 => Self::AuthTemporaryFailure,
            500 => Self::SyntaxError,
            501 => Self::InvalidParameter,
            502 => Self::NotImplemented,
            503 => Self::BadSequence,
            504 => Self::UnknownAuthMechanism,
            535 => Self::AuthFailed,
            552 => Self::ExceededStorage,
            554 => Self::TransactionFailed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        match value {
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSuccessful => 235,
            Status::Ok => 250,
            Status::CannotVerify => 252,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::RateLimited => 450,
            Status::ActionAborted => 451,
            Status::TooManyRecipients => 452,
            Status::AuthTemporaryFailure => 454,
            Status::SyntaxError => 500,
            Status::InvalidParameter => 501,
            Status::NotImplemented => 502,
            Status::BadSequence => 503,
            Status::UnknownAuthMechanism => 504,
            Status::AuthFailed => 535,
            Status::ExceededStorage => 552,
            Status::TransactionFailed => 554,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u16::from(*self))
    }
}
