use std::{net::SocketAddr, time::Duration};

use postern_common::{error::ListenerError, internal, Signal};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::JoinSet,
};

use crate::{response::Reply, session::Session, SessionConfig};

const DEFAULT_DRAIN_SECS: u64 = 30;

/// One bound socket: accepts connections, runs admission at accept time,
/// spawns a task per session, and drains on shutdown.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    socket: SocketAddr,
    config: SessionConfig,
    drain: Duration,
}

impl Listener {
    /// Bind the socket up front so configuration errors surface before the
    /// server starts serving, and so an OS-assigned port is knowable.
    pub async fn bind(socket: SocketAddr, config: SessionConfig) -> Result<Self, ListenerError> {
        let inner = TcpListener::bind(socket)
            .await
            .map_err(|source| ListenerError::BindFailed {
                address: socket.to_string(),
                source,
            })?;
        let socket = inner
            .local_addr()
            .map_err(|source| ListenerError::BindFailed {
                address: socket.to_string(),
                source,
            })?;

        Ok(Self {
            inner,
            socket,
            config,
            drain: Duration::from_secs(DEFAULT_DRAIN_SECS),
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.socket
    }

    /// How long in-flight sessions get to finish after shutdown before
    /// their tasks are aborted.
    #[must_use]
    pub const fn with_drain_deadline(mut self, drain: Duration) -> Self {
        self.drain = drain;
        self
    }

    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        internal!(level = INFO, "SMTP listener serving {}", self.socket);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        internal!(
                            level = INFO,
                            "SMTP listener {} received shutdown signal, finishing sessions ...",
                            self.socket
                        );
                        break;
                    }
                }

                connection = self.inner.accept() => {
                    match connection {
                        Ok((stream, peer)) => self.dispatch(stream, peer, &shutdown, &mut sessions),
                        Err(err) => {
                            // Transient accept failures (fd exhaustion and
                            // friends) must not take the listener down.
                            internal!(level = WARN, "Accept failed: {err}");
                        }
                    }
                }

                // Reap finished sessions as we go.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        self.drain(sessions).await;
        Ok(())
    }

    fn dispatch(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &tokio::sync::broadcast::Receiver<Signal>,
        sessions: &mut JoinSet<()>,
    ) {
        tracing::debug!("Connection received on {} from {peer}", self.socket);

        match self.config.admission.check_connect(peer.ip()) {
            Err(reject) => {
                // Refused at the door: one reply, then close.
                sessions.spawn(async move {
                    let mut stream = stream;
                    let reply = Reply::new(reject.status, reject.reason);
                    let _ = stream.write_all(&reply.to_wire()).await;
                    let _ = stream.shutdown().await;
                });
            }
            Ok(permit) => {
                let session = Session::create(stream, peer, self.config.clone(), Some(permit));
                let receiver = shutdown.resubscribe();

                sessions.spawn(async move {
                    if let Err(err) = session.run(receiver).await {
                        if !err.is_shutdown() {
                            internal!(level = ERROR, "Session from {peer} failed: {err}");
                        }
                    }
                });
            }
        }
    }

    /// Wait for in-flight sessions up to the drain deadline, then abort
    /// whatever is left.
    async fn drain(&self, mut sessions: JoinSet<()>) {
        if sessions.is_empty() {
            return;
        }

        internal!(
            level = INFO,
            "Draining {} live session(s) on {}",
            sessions.len(),
            self.socket
        );

        let finished = tokio::time::timeout(self.drain, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            internal!(
                level = WARN,
                "Drain deadline reached on {}, aborting {} session(s)",
                self.socket,
                sessions.len()
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
    }
}
