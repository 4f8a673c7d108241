//! Greylisting.
//!
//! A first-seen (peer, sender, recipient) triplet is temporarily deferred;
//! a legitimate server retries after its queue delay and is accepted once
//! the configured delay has passed. Repeatedly accepted triplets are
//! promoted to a whitelist and skip the delay entirely until their row
//! expires.

use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use postern_common::{clock::Clock, internal};

use crate::{config::GreylistConfig, store::GreylistStore};

/// Outcome of a greylist lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreylistVerdict {
    Accept,
    Defer,
}

/// One triplet row. Wall-clock timestamps so rows survive a restart via the
/// persistence contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreylistEntry {
    pub first_seen: std::time::SystemTime,
    pub attempts: u32,
    pub whitelisted_at: Option<std::time::SystemTime>,
}

/// Stable 64-bit FNV-1a over the triplet. Deliberately not the map's
/// SipHash/aHash: the persistence key must be identical across processes
/// and restarts.
fn triplet_key(peer: &str, sender: &str, recipient: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for part in [peer.as_bytes(), sender.as_bytes(), recipient.as_bytes()] {
        for &byte in part {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
        hash ^= 0xff;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[derive(Debug)]
pub struct Greylist {
    rows: DashMap<u64, GreylistEntry, ahash::RandomState>,
    config: GreylistConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn GreylistStore>>,
}

impl Greylist {
    pub fn new(config: GreylistConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: DashMap::default(),
            config,
            clock,
            store: None,
        }
    }

    /// Attach a persistence contract and repopulate the table from it.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn GreylistStore>) -> Self {
        match store.load() {
            Ok(rows) => {
                for (key, entry) in rows {
                    self.rows.insert(key, entry);
                }
            }
            Err(err) => {
                internal!(level = WARN, "Greylist store load failed: {err}");
            }
        }
        self.store = Some(store);
        self
    }

    /// Look up the triplet, inserting a fresh deferred row on first sight.
    pub fn check(&self, peer: &str, sender: &str, recipient: &str) -> GreylistVerdict {
        if !self.config.enabled {
            return GreylistVerdict::Accept;
        }

        let key = triplet_key(peer, sender, recipient);
        let now = self.clock.wall();

        match self.rows.entry(key) {
            Entry::Vacant(slot) => {
                let entry = GreylistEntry {
                    first_seen: now,
                    attempts: 0,
                    whitelisted_at: None,
                };
                self.persist(key, &entry);
                slot.insert(entry);
                GreylistVerdict::Defer
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();

                if entry.whitelisted_at.is_some() {
                    return GreylistVerdict::Accept;
                }

                let elapsed = now
                    .duration_since(entry.first_seen)
                    .unwrap_or(Duration::ZERO);

                if elapsed >= Duration::from_secs(self.config.delay_s) {
                    entry.attempts += 1;
                    if entry.attempts >= self.config.whitelist_threshold {
                        entry.whitelisted_at = Some(now);
                    }
                    let entry = entry.clone();
                    self.persist(key, &entry);
                    GreylistVerdict::Accept
                } else {
                    GreylistVerdict::Defer
                }
            }
        }
    }

    /// Evict rows older than the TTL.
    pub fn sweep(&self) {
        let now = self.clock.wall();
        let ttl = Duration::from_secs(self.config.ttl_s);
        let mut evicted = Vec::new();

        self.rows.retain(|key, entry| {
            let age = now
                .duration_since(entry.first_seen)
                .unwrap_or(Duration::ZERO);
            if age >= ttl {
                evicted.push(*key);
                false
            } else {
                true
            }
        });

        if let Some(store) = self.store.as_ref() {
            for key in evicted {
                if let Err(err) = store.remove(key) {
                    internal!(level = WARN, "Greylist store eviction failed: {err}");
                }
            }
        }
    }

    /// Number of live rows, for observability.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn persist(&self, key: u64, entry: &GreylistEntry) {
        if let Some(store) = self.store.as_ref() {
            if let Err(err) = store.upsert(key, entry) {
                internal!(level = WARN, "Greylist store upsert failed: {err}");
            }
        }
    }
}
