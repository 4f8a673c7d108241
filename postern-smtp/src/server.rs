use std::{sync::Arc, time::Duration};

use postern_common::{internal, Signal};
use postern_policy::AdmissionControl;

use crate::listener::Listener;

/// Supervises the listeners and the shared admission state's maintenance.
#[derive(Debug)]
pub struct Server {
    listeners: Vec<Listener>,
    admission: Arc<AdmissionControl>,
}

impl Server {
    pub fn new(admission: Arc<AdmissionControl>) -> Self {
        Self {
            listeners: Vec::new(),
            admission,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Serve every listener until shutdown is signalled, running the
    /// periodic policy sweep alongside them.
    pub async fn serve(
        &self,
        shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        let sweeper = {
            let admission = Arc::clone(&self.admission);
            let mut shutdown = shutdown.resubscribe();
            let period = admission.cleanup_interval().max(Duration::from_secs(1));

            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(period);
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticks.tick() => admission.sweep(),
                    }
                }
            })
        };

        let results = futures_util::future::join_all(
            self.listeners
                .iter()
                .map(|listener| listener.serve(shutdown.resubscribe())),
        )
        .await;

        let _ = sweeper.await;
        internal!(level = INFO, "All listeners stopped");

        results.into_iter().try_for_each(|result| result)
    }
}
