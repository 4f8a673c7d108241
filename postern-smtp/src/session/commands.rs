//! Per-command dispatch.
//!
//! Every received line elicits exactly one reply. Failure shapes map to
//! reply codes here; only I/O problems, timeouts and failed TLS handshakes
//! terminate the session from within a handler.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use postern_common::{
    envelope::{Envelope, Recipient},
    error::SessionError,
    incoming, internal,
    status::Status,
    traits::VerifyError,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    command::{Command, HeloVariant, MailParameters, ParseError, RcptParameters},
    response::Reply,
    state::State,
    tls,
};

use super::{Flow, Session};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(crate) async fn handle_line(&mut self, line: &[u8]) -> Result<Flow, SessionError> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(err) => {
                let status = match err {
                    ParseError::Parameter(_) => Status::InvalidParameter,
                    ParseError::LineTooLong | ParseError::Syntax(_) => Status::SyntaxError,
                };
                self.reply(Reply::new(status, err.to_string())).await?;
                return Ok(Flow::Continue);
            }
        };

        incoming!("{command}");

        match command {
            Command::Helo(variant) => self.handle_helo(variant).await,
            Command::MailFrom(sender, params) => self.handle_mail(sender, params).await,
            Command::RcptTo(recipient, params) => self.handle_rcpt(recipient, params).await,
            Command::Data => self.handle_data().await,
            Command::Bdat { size, last } => self.handle_bdat(size, last).await,
            Command::Rset => {
                self.reset_transaction();
                self.reply(Reply::new(Status::Ok, "Ok")).await?;
                Ok(Flow::Continue)
            }
            Command::Noop => {
                self.reply(Reply::new(Status::Ok, "Ok")).await?;
                Ok(Flow::Continue)
            }
            Command::Quit => {
                self.reply(Reply::new(Status::GoodBye, "Bye")).await?;
                Ok(Flow::Close)
            }
            Command::StartTls => self.handle_starttls().await,
            Command::Auth { mechanism, initial } => {
                self.handle_auth(&mechanism, initial.as_deref()).await
            }
            // 252 for both, to avoid address enumeration.
            Command::Vrfy(_) | Command::Expn(_) => {
                self.reply(Reply::new(
                    Status::CannotVerify,
                    "Cannot verify, message will be attempted",
                ))
                .await?;
                Ok(Flow::Continue)
            }
            Command::Help(_) => {
                self.reply(Reply::multi(
                    Status::HelpMessage,
                    vec![
                        "Commands supported:".to_string(),
                        "HELO EHLO MAIL RCPT DATA BDAT RSET NOOP VRFY EXPN HELP AUTH STARTTLS QUIT"
                            .to_string(),
                    ],
                ))
                .await?;
                Ok(Flow::Continue)
            }
            Command::Unknown(_) => {
                self.reply(Reply::new(Status::SyntaxError, "Command not recognised"))
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_helo(&mut self, variant: HeloVariant) -> Result<Flow, SessionError> {
        if self.state.in_transaction() {
            return self.bad_sequence("EHLO not allowed during a mail transaction").await;
        }

        let (extended, id) = match variant {
            HeloVariant::Ehlo(id) => (true, id),
            HeloVariant::Helo(id) => (false, id),
        };

        self.client_hostname = Some(id.clone());
        self.extended = extended;
        self.envelope = None;
        self.state = self.ready_state();

        if extended {
            let mut lines = vec![self.config.hostname.to_string()];
            lines.extend(
                self.advertised_extensions()
                    .iter()
                    .map(ToString::to_string),
            );
            self.reply(Reply::multi(Status::Ok, lines)).await?;
        } else {
            self.reply(Reply::new(
                Status::Ok,
                format!("{} says hello to {}", self.config.hostname, id),
            ))
            .await?;
        }

        Ok(Flow::Continue)
    }

    async fn handle_mail(
        &mut self,
        sender: Option<String>,
        params: MailParameters,
    ) -> Result<Flow, SessionError> {
        if !self.state.is_ready() {
            return self.bad_sequence("Send EHLO first").await;
        }

        if !params.unknown.is_empty() {
            if self.config.strict_esmtp_params {
                self.reply(Reply::new(
                    Status::InvalidParameter,
                    "Unrecognised MAIL parameters",
                ))
                .await?;
                return Ok(Flow::Continue);
            }
            internal!(
                level = DEBUG,
                "Ignoring unknown MAIL parameters: {:?}",
                params.unknown
            );
        }

        if let Some(declared) = params.declared_size {
            if let Err(reject) = self.config.admission.check_size(declared) {
                self.refuse(reject).await?;
                return Ok(Flow::Continue);
            }
        }

        let mut envelope = Envelope::default();
        *envelope.sender_mut() = sender;
        *envelope.declared_size_mut() = params.declared_size;
        *envelope.body_mut() = params.body;
        *envelope.ret_mut() = params.ret;
        *envelope.envid_mut() = params.envid;

        self.envelope = Some(envelope);
        self.state = State::MailFrom;
        self.reply(Reply::new(Status::Ok, "Ok")).await?;
        Ok(Flow::Continue)
    }

    async fn handle_rcpt(
        &mut self,
        recipient: String,
        params: RcptParameters,
    ) -> Result<Flow, SessionError> {
        if !self.state.accepts_recipients() {
            return self.bad_sequence("Send MAIL first").await;
        }

        if !params.unknown.is_empty() {
            if self.config.strict_esmtp_params {
                self.reply(Reply::new(
                    Status::InvalidParameter,
                    "Unrecognised RCPT parameters",
                ))
                .await?;
                return Ok(Flow::Continue);
            }
            internal!(
                level = DEBUG,
                "Ignoring unknown RCPT parameters: {:?}",
                params.unknown
            );
        }

        let (count, sender) = {
            let Some(envelope) = self.envelope.as_ref() else {
                return self.bad_sequence("Send MAIL first").await;
            };
            (
                envelope.recipient_count(),
                envelope.sender().unwrap_or("<>").to_string(),
            )
        };

        if let Err(reject) = self.config.admission.check_recipients(count) {
            self.refuse(reject).await?;
            return Ok(Flow::Continue);
        }

        let peer_ip = self.peer().ip().to_string();
        if let Err(reject) = self
            .config
            .admission
            .check_greylist(&peer_ip, &sender, &recipient)
        {
            self.refuse(reject).await?;
            return Ok(Flow::Continue);
        }

        if let Some(envelope) = self.envelope.as_mut() {
            envelope.push_recipient(Recipient {
                address: recipient,
                notify: params.notify,
                orcpt: params.orcpt,
            });
        }
        self.state = State::RcptTo;
        self.reply(Reply::new(Status::Ok, "Ok")).await?;
        Ok(Flow::Continue)
    }

    async fn handle_starttls(&mut self) -> Result<Flow, SessionError> {
        let Some(provider) = self.config.tls.clone() else {
            self.reply(Reply::new(Status::AuthTemporaryFailure, "TLS not available"))
                .await?;
            return Ok(Flow::Continue);
        };

        if self.connection.is_tls() {
            return self.bad_sequence("Connection is already TLS").await;
        }
        if !self.state.is_ready() {
            return self.bad_sequence("STARTTLS not allowed here").await;
        }

        let tls_config = match tls::server_config(provider.as_ref()) {
            Ok(config) => config,
            Err(err) => {
                internal!(level = ERROR, "TLS material unavailable: {err}");
                self.reply(Reply::new(
                    Status::AuthTemporaryFailure,
                    "TLS temporarily unavailable",
                ))
                .await?;
                return Ok(Flow::Continue);
            }
        };

        self.reply(Reply::new(Status::ServiceReady, "Ready to start TLS"))
            .await?;

        match self.connection.upgrade(tls_config).await {
            Ok(info) => {
                internal!(
                    level = DEBUG,
                    "Connection upgraded to {} with {}",
                    info.proto(),
                    info.cipher()
                );

                // Everything the client told us in cleartext is void; it
                // must EHLO again before any transaction.
                self.client_hostname = None;
                self.extended = false;
                self.authenticated = None;
                self.envelope = None;
                self.bdat = None;
                self.state = State::Initial;
                Ok(Flow::Continue)
            }
            Err(err) => Err(SessionError::Tls(err.to_string())),
        }
    }

    async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial: Option<&str>,
    ) -> Result<Flow, SessionError> {
        let Some(verifier) = self.config.verifier.clone() else {
            self.reply(Reply::new(
                Status::NotImplemented,
                "Authentication not available",
            ))
            .await?;
            return Ok(Flow::Continue);
        };

        if self.authenticated.is_some() {
            return self.bad_sequence("Already authenticated").await;
        }
        if !self.state.is_ready() {
            return self.bad_sequence("AUTH not allowed here").await;
        }

        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            // LOGIN is advertised for legacy clients but the challenge
            // round-trip is not implemented in this core.
            self.reply(Reply::new(
                Status::UnknownAuthMechanism,
                "Mechanism not supported, use PLAIN",
            ))
            .await?;
            return Ok(Flow::Continue);
        }

        let Some(initial) = initial else {
            self.reply(Reply::new(
                Status::InvalidParameter,
                "PLAIN requires an initial response",
            ))
            .await?;
            return Ok(Flow::Continue);
        };

        let Some((username, password)) = BASE64
            .decode(initial)
            .ok()
            .and_then(|decoded| parse_plain_credentials(&decoded))
        else {
            self.reply(Reply::new(
                Status::InvalidParameter,
                "Malformed PLAIN initial response",
            ))
            .await?;
            return Ok(Flow::Continue);
        };

        match verifier.verify(&username, &password).await {
            Ok(true) => {
                self.config.stats.auth_succeeded();
                internal!(level = INFO, "Authenticated as {username}");
                self.authenticated = Some(username);
                self.state = State::Authenticated;
                self.reply(Reply::new(
                    Status::AuthSuccessful,
                    "Authentication successful",
                ))
                .await?;
            }
            Ok(false) => {
                self.config.stats.auth_failed();
                internal!(level = WARN, "Authentication failed for {username}");
                self.reply(Reply::new(Status::AuthFailed, "Authentication failed"))
                    .await?;
            }
            Err(VerifyError::Transient(reason)) => {
                internal!(level = WARN, "Credential verifier unavailable: {reason}");
                self.reply(Reply::new(
                    Status::AuthTemporaryFailure,
                    "Temporary authentication failure, try again later",
                ))
                .await?;
            }
            Err(VerifyError::Permanent(reason)) => {
                self.config.stats.auth_failed();
                internal!(level = WARN, "Credential verifier refused {username}: {reason}");
                self.reply(Reply::new(Status::AuthFailed, "Authentication failed"))
                    .await?;
            }
        }

        Ok(Flow::Continue)
    }

    pub(crate) async fn bad_sequence(&mut self, reason: &str) -> Result<Flow, SessionError> {
        self.reply(Reply::new(Status::BadSequence, reason)).await?;
        Ok(Flow::Continue)
    }
}

/// Split a PLAIN initial response (RFC 4616): authzid NUL authcid NUL
/// password. The authzid is ignored; authcid and password must be UTF-8.
fn parse_plain_credentials(credentials: &[u8]) -> Option<(String, String)> {
    let mut parts = credentials.splitn(3, |&byte| byte == 0);

    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;

    if authcid.is_empty() {
        return None;
    }

    Some((
        String::from_utf8(authcid.to_vec()).ok()?,
        String::from_utf8(password.to_vec()).ok()?,
    ))
}

#[cfg(test)]
mod test {
    use super::parse_plain_credentials;

    #[test]
    fn plain_credentials_split_on_nul() {
        assert_eq!(
            parse_plain_credentials(b"\0alice\0wonderland"),
            Some(("alice".to_string(), "wonderland".to_string()))
        );

        // Authzid present and ignored.
        assert_eq!(
            parse_plain_credentials(b"admin\0alice\0wonderland"),
            Some(("alice".to_string(), "wonderland".to_string()))
        );

        // Empty password is representable.
        assert_eq!(
            parse_plain_credentials(b"\0alice\0"),
            Some(("alice".to_string(), String::new()))
        );
    }

    #[test]
    fn malformed_plain_credentials() {
        assert_eq!(parse_plain_credentials(b""), None);
        assert_eq!(parse_plain_credentials(b"no-separators"), None);
        assert_eq!(parse_plain_credentials(b"\0\0password"), None);
        assert_eq!(parse_plain_credentials(b"\0bad\xff\xfe\0pw"), None);
    }

    #[test]
    fn password_may_contain_further_nul() {
        // splitn keeps everything after the second NUL as the password.
        assert_eq!(
            parse_plain_credentials(b"\0alice\0pass\0word"),
            Some(("alice".to_string(), "pass\0word".to_string()))
        );
    }
}
