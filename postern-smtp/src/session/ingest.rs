//! Message body ingest.
//!
//! DATA reads the body line by line, removing the dot-stuffing the client
//! added, until the lone-dot terminator. BDAT reads length-prefixed binary
//! chunks. Both keep a running byte count against the configured maximum
//! and never hand an oversized message to the queue; both end in the same
//! commit path: enqueue, webhook, `250 OK: <queue-id>`, implicit RSET.

use std::time::Duration;

use postern_common::{error::SessionError, internal, status::Status, traits::DeliveryNotice};
use postern_queue::QueueError;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    connection::LineRead,
    response::Reply,
    state::State,
};

use super::{Flow, Session};

/// Longest accepted body line. Far above RFC 5321's 1000-octet text line
/// limit; anything beyond this is size abuse, not mail.
const MAX_DATA_LINE: usize = 1024 * 1024;

enum DataOutcome {
    /// Terminator seen; the unstuffed body is complete.
    Complete(Vec<u8>),
    /// Size cap hit; the remainder was drained up to the terminator.
    TooLarge,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(crate) async fn handle_data(&mut self) -> Result<Flow, SessionError> {
        if self.state == State::BdatInProgress {
            return self.bad_sequence("DATA may not be mixed with BDAT").await;
        }
        if self.state != State::RcptTo {
            return self.bad_sequence("Need RCPT before DATA").await;
        }

        // Transaction commit point: the rate limiter runs here, not on
        // cheap commands.
        let user = self.authenticated.clone();
        if let Err(reject) = self
            .config
            .admission
            .check_rate(self.peer().ip(), user.as_deref())
        {
            self.refuse(reject).await?;
            return Ok(Flow::Continue);
        }

        self.reply(Reply::new(
            Status::StartMailInput,
            "End data with <CR><LF>.<CR><LF>",
        ))
        .await?;
        self.state = State::DataInProgress;

        match self.read_data_body().await? {
            DataOutcome::Complete(body) => self.commit_message(body).await,
            DataOutcome::TooLarge => {
                self.reset_transaction();
                self.reply(Reply::new(
                    Status::ExceededStorage,
                    "Message exceeds maximum size, discarded",
                ))
                .await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Read the DATA body up to the lone-dot terminator. The whole transfer
    /// shares one deadline: `data_s` from the 354 to the terminator.
    async fn read_data_body(&mut self) -> Result<DataOutcome, SessionError> {
        let max = self.config.admission.max_message_size();
        let data_secs = self.config.timeouts.data_s;
        let deadline = self.config.clock.monotonic() + Duration::from_secs(data_secs);

        let mut body: Vec<u8> = Vec::new();
        let mut too_large = false;

        loop {
            let remaining = deadline.saturating_duration_since(self.config.clock.monotonic());
            if remaining.is_zero() {
                return Err(self.fail_timeout(data_secs).await);
            }

            let read = tokio::time::timeout(
                remaining,
                self.connection.read_data_line(MAX_DATA_LINE),
            )
            .await;
            let Ok(read) = read else {
                return Err(self.fail_timeout(data_secs).await);
            };

            match read? {
                LineRead::Eof => {
                    return Err(SessionError::Protocol(
                        "Connection closed during message data".to_string(),
                    ));
                }
                // A line this long cannot be the terminator; treat it as
                // size abuse and keep draining.
                LineRead::TooLong | LineRead::ForbiddenByte => {
                    too_large = true;
                    body = Vec::new();
                }
                LineRead::Line(line) => {
                    if line == b"." {
                        break;
                    }

                    // Dot unstuffing: the client doubled a leading dot.
                    let content = if line.first() == Some(&b'.') {
                        &line[1..]
                    } else {
                        &line[..]
                    };

                    if !too_large {
                        let projected = (body.len() + content.len() + 2) as u64;
                        if max > 0 && projected > max {
                            too_large = true;
                            body = Vec::new();
                        } else {
                            body.extend_from_slice(content);
                            body.extend_from_slice(b"\r\n");
                        }
                    }
                }
            }
        }

        Ok(if too_large {
            DataOutcome::TooLarge
        } else {
            DataOutcome::Complete(body)
        })
    }

    pub(crate) async fn handle_bdat(&mut self, size: u64, last: bool) -> Result<Flow, SessionError> {
        if self.state == State::DataInProgress {
            return self.bad_sequence("BDAT may not be mixed with DATA").await;
        }
        if self.state != State::RcptTo && self.state != State::BdatInProgress {
            // The chunk payload is already on the wire; drain it so the
            // command stream stays synchronised before refusing.
            self.drain_chunk(size).await?;
            return self.bad_sequence("BDAT requires a transaction with recipients").await;
        }

        // Rate limit applies to every chunk.
        let user = self.authenticated.clone();
        if let Err(reject) = self
            .config
            .admission
            .check_rate(self.peer().ip(), user.as_deref())
        {
            self.drain_chunk(size).await?;
            self.reset_transaction();
            self.refuse(reject).await?;
            return Ok(Flow::Continue);
        }

        let accumulated = self.bdat.as_ref().map_or(0, Vec::len) as u64;
        let max = self.config.admission.max_message_size();
        if max > 0 && accumulated.saturating_add(size) > max {
            self.drain_chunk(size).await?;
            self.reset_transaction();
            self.reply(Reply::new(
                Status::ExceededStorage,
                "Message exceeds maximum size, discarded",
            ))
            .await?;
            return Ok(Flow::Continue);
        }

        let chunk = self.read_chunk(size).await?;
        self.bdat.get_or_insert_with(Vec::new).extend_from_slice(&chunk);

        if last {
            let body = self.bdat.take().unwrap_or_default();
            self.commit_message(body).await
        } else {
            self.state = State::BdatInProgress;
            self.reply(Reply::new(Status::Ok, format!("Accepted {size} octets")))
                .await?;
            Ok(Flow::Continue)
        }
    }

    /// Read one BDAT chunk payload under the data timeout.
    async fn read_chunk(&mut self, size: u64) -> Result<Vec<u8>, SessionError> {
        let data_secs = self.config.timeouts.data_s;
        let budget = Duration::from_secs(data_secs);

        let chunk = tokio::time::timeout(
            budget,
            self.connection.read_exact(usize::try_from(size).unwrap_or(usize::MAX)),
        )
        .await;

        match chunk {
            Err(_) => Err(self.fail_timeout(data_secs).await),
            Ok(chunk) => Ok(chunk?),
        }
    }

    /// Consume and discard a declared chunk that will not be kept.
    async fn drain_chunk(&mut self, size: u64) -> Result<(), SessionError> {
        let data_secs = self.config.timeouts.data_s;
        let budget = Duration::from_secs(data_secs);

        let drained = tokio::time::timeout(
            budget,
            self.connection
                .discard_exact(usize::try_from(size).unwrap_or(usize::MAX)),
        )
        .await;

        match drained {
            Err(_) => Err(self.fail_timeout(data_secs).await),
            Ok(drained) => Ok(drained?),
        }
    }

    /// Transaction commit: hand the message to the queue sink, fire the
    /// webhook, answer `250 OK: <queue-id>`, implicit RSET.
    async fn commit_message(&mut self, body: Vec<u8>) -> Result<Flow, SessionError> {
        let Some(envelope) = self.envelope.take() else {
            return self.bad_sequence("No transaction in progress").await;
        };

        let size = body.len() as u64;
        match self.config.queue.enqueue(envelope.clone(), body).await {
            Ok(id) => {
                self.config.stats.message_received(size);
                internal!(
                    level = INFO,
                    "Message accepted as {id}: {size} bytes for {} recipient(s)",
                    envelope.recipient_count()
                );

                if let Some(webhook) = self.config.webhook.clone() {
                    let notice = DeliveryNotice {
                        queue_id: id.to_string(),
                        sender: envelope.sender().map(str::to_string),
                        recipients: envelope
                            .recipients()
                            .iter()
                            .map(|recipient| recipient.address.clone())
                            .collect(),
                        size,
                        peer: self.peer().to_string(),
                    };
                    // Fire and forget; a webhook failure never touches the
                    // SMTP reply.
                    tokio::spawn(async move {
                        webhook.notify(notice).await;
                    });
                }

                self.reset_transaction();
                self.reply(Reply::new(Status::Ok, format!("OK: {id}"))).await?;
                Ok(Flow::Continue)
            }
            Err(QueueError::Transient(reason)) => {
                internal!(level = WARN, "Queue sink transient failure: {reason}");
                self.reset_transaction();
                self.reply(Reply::new(Status::ActionAborted, "Try again later"))
                    .await?;
                Ok(Flow::Continue)
            }
            Err(QueueError::Permanent(reason)) => {
                internal!(level = ERROR, "Queue sink permanent failure: {reason}");
                self.reset_transaction();
                self.reply(Reply::new(Status::TransactionFailed, "Transaction failed"))
                    .await?;
                // A permanent handoff failure ends the session.
                Ok(Flow::Close)
            }
        }
    }
}
