use core::fmt::{self, Display, Formatter};

/// Per-connection protocol state.
///
/// `Authenticated` is `Greeted` plus a successful AUTH; both are "ready"
/// states from which a mail transaction may begin, and RSET returns to
/// whichever of the two applies. STARTTLS acceptance drops the session back
/// to `Initial` so the client must EHLO again before MAIL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Initial,
    Greeted,
    Authenticated,
    MailFrom,
    RcptTo,
    DataInProgress,
    BdatInProgress,
}

impl State {
    /// May a MAIL command begin a transaction from here?
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Greeted | Self::Authenticated)
    }

    /// Is a mail transaction open?
    #[must_use]
    pub const fn in_transaction(self) -> bool {
        matches!(
            self,
            Self::MailFrom | Self::RcptTo | Self::DataInProgress | Self::BdatInProgress
        )
    }

    /// May RCPT add a recipient from here?
    #[must_use]
    pub const fn accepts_recipients(self) -> bool {
        matches!(self, Self::MailFrom | Self::RcptTo)
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Initial => "Initial",
            Self::Greeted => "Greeted",
            Self::Authenticated => "Authenticated",
            Self::MailFrom => "MAIL",
            Self::RcptTo => "RCPT",
            Self::DataInProgress => "DATA",
            Self::BdatInProgress => "BDAT",
        })
    }
}
