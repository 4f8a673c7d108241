use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use postern_common::{
    clock::{Clock, SystemClock},
    envelope::Envelope,
    error::SessionError,
    internal, outgoing,
    stats::ServerStats,
    status::Status,
    traits::{CredentialVerifier, WebhookNotifier},
    Signal,
};
use postern_policy::{AdmissionControl, ConnectionPermit, PolicyReject};
use postern_queue::QueueSink;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    command::MAX_COMMAND_LINE,
    connection::{Connection, LineRead},
    extensions::Extension,
    response::Reply,
    state::State,
    tls::TlsMaterialProvider,
    SmtpTimeouts,
};

// Submodules containing implementation details
mod commands;
mod ingest;

/// What the dispatcher decided about the connection after one command.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub(crate) enum Flow {
    Continue,
    Close,
}

/// Everything a session needs besides its stream: identity, limits and the
/// shared collaborators. Cheap to clone, one per connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) hostname: Arc<str>,
    pub(crate) timeouts: SmtpTimeouts,
    pub(crate) strict_esmtp_params: bool,
    pub(crate) tls: Option<Arc<dyn TlsMaterialProvider>>,
    pub(crate) verifier: Option<Arc<dyn CredentialVerifier>>,
    pub(crate) webhook: Option<Arc<dyn WebhookNotifier>>,
    pub(crate) queue: Arc<dyn QueueSink>,
    pub(crate) admission: Arc<AdmissionControl>,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl SessionConfig {
    /// Create a new `SessionConfig` builder
    #[must_use]
    pub fn builder(
        queue: Arc<dyn QueueSink>,
        admission: Arc<AdmissionControl>,
    ) -> SessionConfigBuilder {
        SessionConfigBuilder {
            hostname: String::new(),
            timeouts: SmtpTimeouts::default(),
            strict_esmtp_params: false,
            tls: None,
            verifier: None,
            webhook: None,
            queue,
            admission,
            stats: None,
            clock: None,
        }
    }
}

/// Builder for `SessionConfig`
#[derive(Debug)]
pub struct SessionConfigBuilder {
    hostname: String,
    timeouts: SmtpTimeouts,
    strict_esmtp_params: bool,
    tls: Option<Arc<dyn TlsMaterialProvider>>,
    verifier: Option<Arc<dyn CredentialVerifier>>,
    webhook: Option<Arc<dyn WebhookNotifier>>,
    queue: Arc<dyn QueueSink>,
    admission: Arc<AdmissionControl>,
    stats: Option<Arc<ServerStats>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionConfigBuilder {
    /// Set the hostname used in the banner and EHLO response
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the timeout configuration for this session
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SmtpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Reject unknown ESMTP parameters with 501 instead of ignoring them
    #[must_use]
    pub const fn with_strict_esmtp_params(mut self, strict: bool) -> Self {
        self.strict_esmtp_params = strict;
        self
    }

    /// Enable STARTTLS with the given certificate material provider
    #[must_use]
    pub fn with_tls(mut self, provider: Arc<dyn TlsMaterialProvider>) -> Self {
        self.tls = Some(provider);
        self
    }

    /// Enable AUTH against the given credential verifier
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Fire a webhook after each accepted message
    #[must_use]
    pub fn with_webhook(mut self, webhook: Arc<dyn WebhookNotifier>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Share server statistics counters
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<ServerStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Override the time source (tests)
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the final `SessionConfig`
    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            hostname: if self.hostname.is_empty() {
                std::env::var("HOSTNAME")
                    .unwrap_or_else(|_| "localhost".to_string())
                    .into()
            } else {
                self.hostname.into()
            },
            timeouts: self.timeouts,
            strict_esmtp_params: self.strict_esmtp_params,
            tls: self.tls,
            verifier: self.verifier,
            webhook: self.webhook,
            queue: self.queue,
            admission: self.admission,
            stats: self.stats.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        }
    }
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    pub(crate) connection: Connection<Stream>,
    pub(crate) state: State,
    pub(crate) client_hostname: Option<String>,
    pub(crate) extended: bool,
    pub(crate) authenticated: Option<String>,
    pub(crate) envelope: Option<Envelope>,
    /// BDAT chunk accumulator; `Some` from the first chunk until commit.
    pub(crate) bdat: Option<Vec<u8>>,
    pub(crate) config: SessionConfig,
    start_time: Instant,
    /// Connection-cap slot; released on drop.
    _permit: Option<ConnectionPermit>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(
        stream: Stream,
        peer: SocketAddr,
        config: SessionConfig,
        permit: Option<ConnectionPermit>,
    ) -> Self {
        let start_time = config.clock.monotonic();

        Self {
            peer,
            connection: Connection::plain(stream),
            state: State::default(),
            client_hostname: None,
            extended: false,
            authenticated: None,
            envelope: None,
            bdat: None,
            config,
            start_time,
            _permit: permit,
        }
    }

    pub(crate) const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Drive the session until the client quits, the connection drops, a
    /// timeout fires or shutdown is signalled.
    pub async fn run(
        mut self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected");

        let result = self.run_inner(&mut signal).await;

        internal!("Connection closed");
        result
    }

    async fn run_inner(
        &mut self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        self.reply(Reply::new(
            Status::ServiceReady,
            format!("{} ESMTP Postern ready", self.config.hostname),
        ))
        .await?;

        loop {
            let Some(wait) = self.read_budget() else {
                let session_secs = self.config.timeouts.session_s;
                return Err(self.fail_timeout(session_secs).await);
            };

            tokio::select! {
                _ = signal.recv() => {
                    // Best effort; the client may already be gone.
                    let _ = self
                        .connection
                        .send_reply(&Reply::new(Status::Unavailable, "Server shutting down"))
                        .await;
                    return Ok(());
                }
                line = tokio::time::timeout(wait, self.connection.read_line(MAX_COMMAND_LINE)) => {
                    let Ok(line) = line else {
                        return Err(self.fail_timeout(wait.as_secs()).await);
                    };

                    match line? {
                        LineRead::Eof => {
                            // Peer closed or is done writing, then so are we.
                            return Ok(());
                        }
                        LineRead::TooLong => {
                            self.reply(Reply::new(Status::SyntaxError, "Command line too long"))
                                .await?;
                        }
                        LineRead::ForbiddenByte => {
                            self.reply(Reply::new(Status::SyntaxError, "NUL not permitted"))
                                .await?;
                        }
                        LineRead::Line(line) => {
                            if self.handle_line(&line).await? == Flow::Close {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Remaining read budget for the current state: the idle timeout before
    /// the first EHLO, the command timeout between commands, both capped by
    /// what is left of the session lifetime. `None` means the session has
    /// outlived its cap.
    fn read_budget(&self) -> Option<Duration> {
        let timeouts = &self.config.timeouts;
        let state_budget = Duration::from_secs(match self.state {
            State::Initial => timeouts.idle_s,
            _ => timeouts.command_s,
        });

        if timeouts.session_s == 0 {
            return Some(state_budget);
        }

        let elapsed = self
            .config
            .clock
            .monotonic()
            .duration_since(self.start_time);
        let session_budget = Duration::from_secs(timeouts.session_s).checked_sub(elapsed)?;
        Some(state_budget.min(session_budget))
    }

    /// A timeout treats the connection as lost: best-effort 451, close.
    pub(crate) async fn fail_timeout(&mut self, after_secs: u64) -> SessionError {
        self.config.stats.timeout();
        tracing::warn!(
            peer = %self.peer,
            state = %self.state,
            timeout_secs = after_secs,
            "Client connection timed out"
        );

        let _ = self
            .connection
            .send_reply(&Reply::new(Status::ActionAborted, "Timeout, closing connection"))
            .await;
        SessionError::Timeout(after_secs)
    }

    pub(crate) async fn reply(&mut self, reply: Reply) -> Result<(), SessionError> {
        for line in reply.wire_lines() {
            outgoing!("{line}");
        }
        self.connection.send_reply(&reply).await?;
        Ok(())
    }

    pub(crate) async fn refuse(&mut self, reject: PolicyReject) -> Result<(), SessionError> {
        self.reply(Reply::new(reject.status, reject.reason)).await
    }

    /// The state a transaction-clearing command returns to.
    pub(crate) fn ready_state(&self) -> State {
        if self.client_hostname.is_none() {
            State::Initial
        } else if self.authenticated.is_some() {
            State::Authenticated
        } else {
            State::Greeted
        }
    }

    /// Clear the envelope and any partial body; implicit or explicit RSET.
    pub(crate) fn reset_transaction(&mut self) {
        self.envelope = None;
        self.bdat = None;
        self.state = self.ready_state();
    }

    /// Extension lines for the EHLO reply, in advertisement order.
    pub(crate) fn advertised_extensions(&self) -> Vec<Extension> {
        let mut extensions = vec![
            Extension::Size(self.config.admission.max_message_size()),
            Extension::EightBitMime,
            Extension::Pipelining,
            Extension::SmtpUtf8,
            Extension::Chunking,
        ];

        if self.config.verifier.is_some() {
            extensions.push(Extension::Auth);
        }
        if self.config.tls.is_some() && !self.connection.is_tls() {
            extensions.push(Extension::StartTls);
        }
        extensions.push(Extension::Help);
        extensions
    }
}
