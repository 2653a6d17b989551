//! Background eviction of expired and over-budget store entries.
//!
//! A sweep lists the store, asks [`EvictionPolicy::plan`] which entries to
//! remove and then evicts them one at a time. Eviction re-checks state, readers
//! and last access under the store lock, so an entry that picked up a reader or
//! a cache hit after listing is skipped and left for a later sweep.

use crate::config::JanitorConfig;
use crate::errors::StoreError;
use crate::store::{ArtifactStore, EntrySnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Source of sweep ticks.
#[async_trait]
pub trait Ticker: Send {
    /// Waits for the next tick. Returns false once no more ticks will come.
    async fn tick(&mut self) -> bool;
}

#[async_trait]
impl Ticker for tokio::time::Interval {
    async fn tick(&mut self) -> bool {
        tokio::time::Interval::tick(self).await;
        true
    }
}

#[async_trait]
impl Ticker for mpsc::Receiver<()> {
    async fn tick(&mut self) -> bool {
        self.recv().await.is_some()
    }
}

/// Decides which entries to evict. Holds no state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub ttl: Duration,
    pub max_store_bytes: u64,
}

impl EvictionPolicy {
    pub fn new(ttl: Duration, max_store_bytes: u64) -> Self {
        Self {
            ttl,
            max_store_bytes,
        }
    }

    pub fn from_config(config: &JanitorConfig) -> Self {
        Self::new(config.ttl(), config.max_store_bytes)
    }

    /// Returns the entries to evict, expired ones first and then the oldest
    /// by last access until the store fits the budget.
    ///
    /// Reserved entries and entries with readers are never returned, but still
    /// count towards the store size.
    pub fn plan(&self, entries: &[EntrySnapshot], now: DateTime<Utc>) -> Vec<EntrySnapshot> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let mut remaining: u64 = entries.iter().map(|e| e.size_bytes).sum();

        let mut evictable: Vec<&EntrySnapshot> = entries
            .iter()
            .filter(|e| e.terminal && e.readers == 0)
            .collect();
        evictable.sort_by(|a, b| {
            a.last_access_at
                .cmp(&b.last_access_at)
                .then_with(|| a.fingerprint.as_str().cmp(b.fingerprint.as_str()))
        });

        let mut plan = Vec::new();
        let mut kept = Vec::new();
        for entry in evictable {
            if now.signed_duration_since(entry.last_access_at) >= ttl {
                remaining = remaining.saturating_sub(entry.size_bytes);
                plan.push(entry.clone());
            } else {
                kept.push(entry);
            }
        }

        for entry in kept {
            if remaining <= self.max_store_bytes {
                break;
            }
            remaining = remaining.saturating_sub(entry.size_bytes);
            plan.push(entry.clone());
        }
        plan
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub evicted: usize,
    pub skipped: usize,
    pub freed_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Janitor {
    store: ArtifactStore,
    policy: EvictionPolicy,
}

impl Janitor {
    pub fn new(store: ArtifactStore, policy: EvictionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Runs one sweep to completion.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_until_cancelled(&CancellationToken::new()).await
    }

    /// Runs one sweep, stopping between evictions once `cancel` fires.
    pub async fn sweep_until_cancelled(&self, cancel: &CancellationToken) -> SweepReport {
        let entries = self.store.snapshot().await;
        let now = self.store.clock().now();
        let plan = self.policy.plan(&entries, now);

        let mut report = SweepReport {
            scanned: entries.len(),
            ..Default::default()
        };

        for candidate in plan {
            if cancel.is_cancelled() {
                log::debug!("Sweep cancelled with evictions pending");
                break;
            }
            match self
                .store
                .evict_if_idle(&candidate.fingerprint, candidate.last_access_at)
                .await
            {
                Ok(freed) => {
                    report.evicted += 1;
                    report.freed_bytes += freed;
                }
                Err(StoreError::EntryBusy(_)) | Err(StoreError::NotFound(_)) => {
                    log::debug!(
                        "Skipping eviction of {}, entry changed since listing",
                        candidate.fingerprint.short()
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    log::warn!(
                        "Failed to evict {}: {}",
                        candidate.fingerprint.short(),
                        e
                    );
                    report.skipped += 1;
                }
            }
        }

        if report.evicted > 0 {
            log::info!(
                "Janitor evicted {} of {} entries ({} bytes freed, {} skipped)",
                report.evicted,
                report.scanned,
                report.freed_bytes,
                report.skipped
            );
        } else {
            log::debug!("Janitor sweep found nothing to evict ({} entries)", report.scanned);
        }
        report
    }

    /// Sweeps on every tick until `cancel` fires or the ticker runs dry.
    pub async fn run<T: Ticker>(self, mut ticker: T, cancel: CancellationToken) {
        log::info!(
            "Janitor started (ttl {:?}, budget {} bytes)",
            self.policy.ttl,
            self.policy.max_store_bytes
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                more = ticker.tick() => {
                    if !more {
                        break;
                    }
                    self.sweep_until_cancelled(&cancel).await;
                }
            }
        }
        log::info!("Janitor stopped");
    }
}

/// Interval ticker that skips missed ticks instead of bursting.
pub fn interval_ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}
