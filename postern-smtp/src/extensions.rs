use core::fmt::{self, Display};

/// SMTP protocol extensions advertised in the EHLO response.
///
/// The server advertises supported extensions after receiving EHLO from the
/// client; advertisement is driven by configuration and by whether the
/// connection has already been upgraded to TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// SIZE extension (RFC 1870). The value is the advertised maximum
    /// message size in bytes; 0 advertises no fixed maximum.
    Size(u64),

    /// 8BITMIME (RFC 6152).
    EightBitMime,

    /// PIPELINING (RFC 2920). Clients may stream commands; replies stay
    /// ordered.
    Pipelining,

    /// SMTPUTF8 (RFC 6531). Envelope addresses are carried as opaque
    /// strings, so nothing extra is enforced here.
    SmtpUtf8,

    /// CHUNKING (RFC 3030) - the BDAT alternative to DATA.
    Chunking,

    /// AUTH with the mechanisms this core advertises.
    Auth,

    /// STARTTLS (RFC 3207). Only advertised while the connection is still
    /// plaintext.
    StartTls,

    /// HELP command availability.
    Help,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Size(max) => {
                if *max == 0 {
                    fmt.write_str("SIZE")
                } else {
                    write!(fmt, "SIZE {max}")
                }
            }
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::Pipelining => fmt.write_str("PIPELINING"),
            Self::SmtpUtf8 => fmt.write_str("SMTPUTF8"),
            Self::Chunking => fmt.write_str("CHUNKING"),
            Self::Auth => fmt.write_str("AUTH PLAIN LOGIN"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Help => fmt.write_str("HELP"),
        }
    }
}
