// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Pre-dispatch policy: block/mute enforcement, a keyed per-sender rate
//! limit, and the suspend queue for envelopes whose sender key is not yet
//! known. Suspended envelopes are released when the missing meta or visa
//! arrives; queues are bounded by count and age, overflow drops the oldest.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::Mutex;

use dashmap::DashMap;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::time::{Duration, Instant};
use tracing::debug;

use hamn_wire::{Envelope, Id};

use crate::error::StationError;

/// Suspended envelopes per awaited sender.
const MAX_SUSPENDED_PER_SENDER: usize = 32;
/// Suspended envelopes older than this are dropped at the next sweep.
pub const SUSPEND_TTL: Duration = Duration::from_secs(300);

pub const DENY_BLOCKED: &str = "Sender is blocked";
pub const DENY_MUTED: &str = "Sender is muted";
pub const DENY_RATE: &str = "Too many envelopes";

struct Suspended {
    envelope: Envelope,
    since: Instant,
}

pub struct Policy {
    /// owner address → sender addresses the owner blocks.
    blocked: DashMap<String, HashSet<String>>,
    /// owner address → sender addresses the owner mutes.
    muted: DashMap<String, HashSet<String>>,
    limiter: DefaultKeyedRateLimiter<String>,
    suspended: Mutex<HashMap<String, VecDeque<Suspended>>>,
}

impl Policy {
    pub fn new(rate_per_min: u32, burst: u32) -> Self {
        let per_min = NonZeroU32::new(rate_per_min.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            blocked: DashMap::new(),
            muted: DashMap::new(),
            limiter: RateLimiter::keyed(Quota::per_minute(per_min).allow_burst(burst)),
            suspended: Mutex::new(HashMap::new()),
        }
    }

    /// Enforce block/mute/rate before dispatch.
    pub fn check(&self, envelope: &Envelope) -> Result<(), StationError> {
        let sender = envelope.sender.address.to_string();
        let receiver = envelope.receiver.address.to_string();

        if self
            .blocked
            .get(&receiver)
            .is_some_and(|set| set.contains(&sender))
        {
            return Err(StationError::PolicyDenied(DENY_BLOCKED.into()));
        }
        if self
            .muted
            .get(&receiver)
            .is_some_and(|set| set.contains(&sender))
        {
            return Err(StationError::PolicyDenied(DENY_MUTED.into()));
        }
        if self.limiter.check_key(&sender).is_err() {
            return Err(StationError::PolicyDenied(DENY_RATE.into()));
        }
        Ok(())
    }

    pub fn set_block_list(&self, owner: &Id, senders: &[Id]) {
        let set = senders.iter().map(|id| id.address.to_string()).collect();
        self.blocked.insert(owner.address.to_string(), set);
    }

    pub fn set_mute_list(&self, owner: &Id, senders: &[Id]) {
        let set = senders.iter().map(|id| id.address.to_string()).collect();
        self.muted.insert(owner.address.to_string(), set);
    }

    /// Park an envelope until its sender's key shows up.
    pub fn suspend(&self, envelope: Envelope) {
        let mut suspended = self.suspended.lock().unwrap_or_else(|e| e.into_inner());
        let queue = suspended
            .entry(envelope.sender.address.to_string())
            .or_default();
        if queue.len() >= MAX_SUSPENDED_PER_SENDER {
            queue.pop_front();
        }
        debug!(sender = %envelope.sender, queued = queue.len() + 1, "envelope suspended");
        queue.push_back(Suspended {
            envelope,
            since: Instant::now(),
        });
    }

    /// Release everything waiting on `sender`, oldest first.
    pub fn wake(&self, sender: &Id) -> Vec<Envelope> {
        let mut suspended = self.suspended.lock().unwrap_or_else(|e| e.into_inner());
        suspended
            .remove(&sender.address.to_string())
            .map(|queue| queue.into_iter().map(|s| s.envelope).collect())
            .unwrap_or_default()
    }

    /// Drop envelopes past the TTL; returns them so the caller can issue
    /// receipts to senders that are still reachable.
    pub fn sweep(&self) -> Vec<Envelope> {
        let mut suspended = self.suspended.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut expired = Vec::new();
        suspended.retain(|_, queue| {
            while queue
                .front()
                .is_some_and(|s| now.duration_since(s.since) > SUSPEND_TTL)
            {
                if let Some(s) = queue.pop_front() {
                    expired.push(s.envelope);
                }
            }
            !queue.is_empty()
        });
        expired
    }

    #[cfg(test)]
    fn suspended_count(&self, sender: &Id) -> usize {
        self.suspended
            .lock()
            .unwrap()
            .get(&sender.address.to_string())
            .map_or(0, |q| q.len())
    }
}
