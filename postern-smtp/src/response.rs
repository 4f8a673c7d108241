//! SMTP reply construction.
//!
//! Every free-text segment passes through [`sanitize`] before it can reach
//! the wire; stripping CR and LF is the defence against reply-splitting via
//! attacker-controlled strings (envelope addresses, EHLO identifiers) that
//! get echoed in responses.

use std::borrow::Cow;

use postern_common::status::Status;

/// Strip every CR and LF from a free-text reply segment. No other
/// transformation is applied.
pub fn sanitize(text: &str) -> Cow<'_, str> {
    if text.contains(['\r', '\n']) {
        Cow::Owned(text.replace(['\r', '\n'], ""))
    } else {
        Cow::Borrowed(text)
    }
}

/// A single- or multi-line SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    status: Status,
    lines: Vec<String>,
}

impl Reply {
    /// Single-line reply. The text is sanitized.
    pub fn new(status: Status, text: impl AsRef<str>) -> Self {
        Self {
            status,
            lines: vec![sanitize(text.as_ref()).into_owned()],
        }
    }

    /// Multi-line reply; every line is sanitized. An empty set collapses to
    /// a bare status line.
    pub fn multi(status: Status, lines: Vec<String>) -> Self {
        let lines = if lines.is_empty() {
            vec![String::new()]
        } else {
            lines
                .iter()
                .map(|line| sanitize(line).into_owned())
                .collect()
        };

        Self { status, lines }
    }

    pub const fn status(&self) -> Status {
        self.status
    }

    /// The reply rendered line by line, without terminators. Multi-line
    /// replies use `<code>-` for all but the last line.
    pub fn wire_lines(&self) -> Vec<String> {
        let last = self.lines.len() - 1;
        self.lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let sep = if i == last { ' ' } else { '-' };
                if line.is_empty() && i == last {
                    format!("{}", self.status)
                } else {
                    format!("{}{}{}", self.status, sep, line)
                }
            })
            .collect()
    }

    /// The full wire form, every line CRLF-terminated, coalesced into one
    /// buffer so the transport can emit it with a single write.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(64 * self.lines.len());
        for line in self.wire_lines() {
            wire.extend_from_slice(line.as_bytes());
            wire.extend_from_slice(b"\r\n");
        }
        wire
    }
}
