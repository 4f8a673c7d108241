//! Admission control.
//!
//! Composes the connection caps, rate limiters, greylist and size checks
//! into policy verdicts. Each rejection carries the one SMTP status
//! appropriate to the sub-policy that fired, so the session never needs to
//! know which one it was.

use std::{borrow::Cow, net::IpAddr, sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use postern_common::{clock::Clock, stats::ServerStats, status::Status};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    config::PolicyConfig,
    greylist::{Greylist, GreylistVerdict},
    rate::{RateLimiter, RateVerdict},
    store::GreylistStore,
};

/// A denied admission check, carrying the reply the session should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyReject {
    pub status: Status,
    pub reason: Cow<'static, str>,
}

impl PolicyReject {
    fn new(status: Status, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

type PerIpConnections = Arc<DashMap<IpAddr, u32, ahash::RandomState>>;

/// Holds one live-session slot. Dropping it releases both the global slot
/// and the per-address count.
#[derive(Debug)]
pub struct ConnectionPermit {
    _slot: OwnedSemaphorePermit,
    peer: IpAddr,
    per_ip: PerIpConnections,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        if let Entry::Occupied(mut slot) = self.per_ip.entry(self.peer) {
            let count = slot.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                slot.remove();
            }
        }
    }
}

#[derive(Debug)]
pub struct AdmissionControl {
    config: PolicyConfig,
    connection_slots: Arc<Semaphore>,
    per_ip_connections: PerIpConnections,
    per_ip_rate: RateLimiter<IpAddr>,
    per_user_rate: RateLimiter<String>,
    greylist: Greylist,
    stats: Arc<ServerStats>,
}

impl AdmissionControl {
    pub fn new(config: PolicyConfig, clock: Arc<dyn Clock>, stats: Arc<ServerStats>) -> Self {
        let window = Duration::from_secs(config.rate.window_s);

        Self {
            connection_slots: Arc::new(Semaphore::new(config.max_connections)),
            per_ip_connections: Arc::default(),
            per_ip_rate: RateLimiter::new(config.rate.per_ip, window, clock.clone()),
            per_user_rate: RateLimiter::new(config.rate.per_user, window, clock.clone()),
            greylist: Greylist::new(config.greylist.clone(), clock),
            stats,
            config,
        }
    }

    /// Attach a greylist persistence contract; repopulates the table.
    #[must_use]
    pub fn with_greylist_store(mut self, store: Arc<dyn GreylistStore>) -> Self {
        self.greylist = self.greylist.with_store(store);
        self
    }

    /// Consulted at accept time, before the session is spawned.
    pub fn check_connect(&self, peer: IpAddr) -> Result<ConnectionPermit, PolicyReject> {
        let Ok(slot) = self.connection_slots.clone().try_acquire_owned() else {
            self.stats.connection_rejected();
            return Err(PolicyReject::new(
                Status::Unavailable,
                "Too many connections, try again later",
            ));
        };

        {
            let mut count = self.per_ip_connections.entry(peer).or_insert(0);
            if *count >= self.config.max_per_ip {
                drop(count);
                self.stats.connection_rejected();
                return Err(PolicyReject::new(
                    Status::Unavailable,
                    "Too many connections from your address",
                ));
            }
            *count += 1;
        }

        self.stats.connection_accepted();
        Ok(ConnectionPermit {
            _slot: slot,
            peer,
            per_ip: self.per_ip_connections.clone(),
        })
    }

    /// Consulted at the transaction-commit points (DATA start and each BDAT
    /// chunk), never on cheap commands.
    pub fn check_rate(&self, peer: IpAddr, user: Option<&str>) -> Result<(), PolicyReject> {
        if self.per_ip_rate.check_and_increment(peer) == RateVerdict::Denied {
            self.stats.rate_limit_rejection();
            return Err(PolicyReject::new(
                Status::RateLimited,
                "Rate limit exceeded, try again later",
            ));
        }

        if let Some(user) = user {
            if self.per_user_rate.check_and_increment(user.to_string()) == RateVerdict::Denied {
                self.stats.rate_limit_rejection();
                return Err(PolicyReject::new(
                    Status::RateLimited,
                    "Rate limit exceeded, try again later",
                ));
            }
        }

        Ok(())
    }

    /// Consulted at RCPT, so a defer is tied to a specific recipient.
    pub fn check_greylist(
        &self,
        peer: &str,
        sender: &str,
        recipient: &str,
    ) -> Result<(), PolicyReject> {
        if self.greylist.check(peer, sender, recipient) == GreylistVerdict::Defer {
            self.stats.greylist_defer();
            return Err(PolicyReject::new(
                Status::ActionAborted,
                "Greylisted, try again later",
            ));
        }
        Ok(())
    }

    /// `current` recipients already accepted; may one more be added?
    pub fn check_recipients(&self, current: usize) -> Result<(), PolicyReject> {
        if current >= self.config.max_recipients {
            return Err(PolicyReject::new(
                Status::TooManyRecipients,
                "Too many recipients",
            ));
        }
        Ok(())
    }

    /// Declared SIZE parameter or running ingest total against the cap.
    pub fn check_size(&self, size: u64) -> Result<(), PolicyReject> {
        let max = self.config.max_message_size;
        if max > 0 && size > max {
            return Err(PolicyReject::new(
                Status::ExceededStorage,
                format!("Message size {size} bytes exceeds maximum of {max} bytes"),
            ));
        }
        Ok(())
    }

    pub const fn max_message_size(&self) -> u64 {
        self.config.max_message_size
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.config.rate.cleanup_interval_s)
    }

    /// Periodic maintenance: expire rate counters and greylist rows.
    pub fn sweep(&self) {
        self.per_ip_rate.sweep();
        self.per_user_rate.sweep();
        self.greylist.sweep();
    }

    /// Live sessions currently holding a permit.
    pub fn live_connections(&self) -> usize {
        self.config.max_connections - self.connection_slots.available_permits()
    }
}
