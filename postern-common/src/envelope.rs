use core::fmt::{self, Display, Formatter};

/// BODY parameter on MAIL FROM (RFC 6152, RFC 3030).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
    BinaryMime,
}

impl Display for BodyType {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::SevenBit => "7BIT",
            Self::EightBitMime => "8BITMIME",
            Self::BinaryMime => "BINARYMIME",
        })
    }
}

/// RET parameter on MAIL FROM (RFC 3461).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnReturn {
    Full,
    Headers,
}

/// NOTIFY parameter values on RCPT TO (RFC 3461).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnNotify {
    Never,
    Success,
    Failure,
    Delay,
}

/// One accepted forward path with its per-recipient ESMTP parameters.
///
/// Addresses are opaque strings once the parser has extracted them; the
/// core neither normalises nor semantically validates them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub notify: Option<Vec<DsnNotify>>,
    pub orcpt: Option<String>,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            notify: None,
            orcpt: None,
        }
    }
}

/// The reverse path, forward paths and ESMTP parameters collected by one
/// MAIL/RCPT exchange. Distinct from the message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    sender: Option<String>,
    declared_size: Option<u64>,
    body: Option<BodyType>,
    ret: Option<DsnReturn>,
    envid: Option<String>,
    recipients: Vec<Recipient>,
}

impl Envelope {
    /// A `None` sender is the null reverse-path (`MAIL FROM:<>`).
    #[inline]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    #[inline]
    pub fn sender_mut(&mut self) -> &mut Option<String> {
        &mut self.sender
    }

    #[inline]
    pub const fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    #[inline]
    pub fn declared_size_mut(&mut self) -> &mut Option<u64> {
        &mut self.declared_size
    }

    #[inline]
    pub const fn body(&self) -> Option<BodyType> {
        self.body
    }

    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<BodyType> {
        &mut self.body
    }

    #[inline]
    pub const fn ret(&self) -> Option<DsnReturn> {
        self.ret
    }

    #[inline]
    pub fn ret_mut(&mut self) -> &mut Option<DsnReturn> {
        &mut self.ret
    }

    #[inline]
    pub fn envid(&self) -> Option<&str> {
        self.envid.as_deref()
    }

    #[inline]
    pub fn envid_mut(&mut self) -> &mut Option<String> {
        &mut self.envid
    }

    #[inline]
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    #[inline]
    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    pub fn push_recipient(&mut self, recipient: Recipient) {
        self.recipients.push(recipient);
    }
}
