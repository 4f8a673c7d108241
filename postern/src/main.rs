use std::{path::Path, sync::Arc, time::Duration};

use postern_common::{
    clock::{Clock, SystemClock},
    internal, logging,
    stats::ServerStats,
    traits::StaticCredentialVerifier,
    Signal,
};
use postern_policy::AdmissionControl;
use postern_queue::{MemoryQueue, QueueSink};
use postern_smtp::{tls::FilePemProvider, Listener, Server, SessionConfig};
use tokio::sync::broadcast;

mod config;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None if Path::new("postern.toml").exists() => Config::load("postern.toml")?,
        None => {
            internal!(level = WARN, "No configuration file found, using defaults");
            Config::default()
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stats = Arc::new(ServerStats::default());
    let admission = Arc::new(AdmissionControl::new(
        config.policy.clone(),
        Arc::clone(&clock),
        Arc::clone(&stats),
    ));

    // Reference wiring: accepted mail accumulates in process memory. A
    // durable deployment implements `QueueSink` against its spool.
    let queue: Arc<dyn QueueSink> = Arc::new(MemoryQueue::default());

    let mut builder = SessionConfig::builder(queue, Arc::clone(&admission))
        .with_hostname(config.hostname.clone())
        .with_timeouts(config.timeouts.clone())
        .with_strict_esmtp_params(config.strict_esmtp_params)
        .with_stats(Arc::clone(&stats))
        .with_clock(clock);

    if let Some(tls) = config.tls.as_ref().filter(|tls| tls.enabled) {
        builder = builder.with_tls(Arc::new(FilePemProvider::new(&tls.certificate, &tls.key)));
    }

    if let Some(auth) = config.auth.as_ref().filter(|auth| auth.enabled) {
        builder = builder.with_verifier(Arc::new(StaticCredentialVerifier::new(
            auth.users.clone(),
        )));
    }

    let listener = Listener::bind(config.socket(), builder.build())
        .await?
        .with_drain_deadline(Duration::from_secs(config.shutdown.drain_s));
    let server = Server::new(admission).with_listener(listener);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
    tokio::spawn(async move {
        shutdown_signal().await;
        internal!(level = INFO, "Shutdown requested, draining sessions ...");
        let _ = shutdown_tx.send(Signal::Shutdown);
    });

    server.serve(shutdown_rx).await
}

/// Resolves when the process is asked to stop: ctrl-c everywhere, plus
/// SIGTERM where there is one.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(signal) => signal,
            Err(err) => {
                internal!(level = ERROR, "Unable to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
