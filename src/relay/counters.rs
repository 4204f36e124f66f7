//! Per-site ack bookkeeping
//!
//! Owns one atomic counter per server site, holding the next-expected ack
//! sequence number. The ack-receive loop is the only mutator; external
//! observers read snapshots without taking any lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::SiteId;
use super::RelayError;

pub struct AckCounters {
    counters: HashMap<SiteId, AtomicU64>,
}

impl AckCounters {
    /// Fixed key set: one counter per remote server site, starting at 0.
    /// Membership never changes after startup.
    pub fn new(sites: impl IntoIterator<Item = SiteId>) -> Self {
        Self {
            counters: sites
                .into_iter()
                .map(|site_id| (site_id, AtomicU64::new(0)))
                .collect(),
        }
    }

    /// Count one ack from `site_id`.
    ///
    /// Acks from a peer arrive in the exact order its worker processed the
    /// messages, so `seqno` must equal the current counter; anything else
    /// means a duplicated, reordered, or misdirected ack and is fatal.
    /// Returns the counter value after the increment.
    pub fn record_ack(&self, site_id: SiteId, seqno: u64) -> Result<u64, RelayError> {
        let Some(counter) = self.counters.get(&site_id) else {
            return Err(RelayError::UnknownAckSite { site_id });
        };
        let expected = counter.load(Ordering::Acquire);
        if expected != seqno {
            return Err(RelayError::AckOutOfOrder {
                site_id,
                counter: expected,
                seqno,
            });
        }
        counter.store(expected + 1, Ordering::Release);
        Ok(expected + 1)
    }

    pub fn get(&self, site_id: SiteId) -> Option<u64> {
        self.counters
            .get(&site_id)
            .map(|counter| counter.load(Ordering::Acquire))
    }

    /// Current ack vector, one entry per configured site.
    pub fn snapshot(&self) -> HashMap<SiteId, u64> {
        self.counters
            .iter()
            .map(|(&site_id, counter)| (site_id, counter.load(Ordering::Acquire)))
            .collect()
    }
}
