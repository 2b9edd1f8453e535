//! Announce timer queues.
//!
//! Two independent queues, one for public trackers and one for private
//! trackers, so a slow public tracker with many torrents cannot starve
//! private-tracker announces. Scheduling state is time-explicit: every
//! operation takes the current unix time, and the async driver is a thin
//! loop over `fire_due`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::announcer::{Announcer, NEVER};
use super::types::InfoHash;
use crate::config::AnnounceConfig;

/// Which timer queue a torrent's announces run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerQueueKind {
    Public,
    Private,
}

impl TimerQueueKind {
    /// Queue for a torrent based on its private flag.
    pub fn for_torrent(is_private: bool) -> Self {
        if is_private {
            TimerQueueKind::Private
        } else {
            TimerQueueKind::Public
        }
    }
}

struct Scheduled {
    announcer: Arc<Announcer>,
    kind: TimerQueueKind,
    fire_at: u64,
    /// Bumped on every (re)schedule and cancel; a tick finishing against a
    /// stale generation must not reschedule.
    generation: u64,
    last_forced: Option<u64>,
}

/// Timer queues driving per-torrent announce ticks.
pub struct AnnounceScheduler {
    config: AnnounceConfig,
    entries: Mutex<HashMap<InfoHash, Scheduled>>,
}

impl AnnounceScheduler {
    pub fn new(config: AnnounceConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a torrent's announcer, due immediately.
    pub fn register(&self, announcer: Arc<Announcer>, now: u64) {
        let kind = TimerQueueKind::for_torrent(announcer.is_private());
        let hash = announcer.info_hash();
        let mut entries = self.entries.lock();
        let generation = entries.get(&hash).map_or(0, |e| e.generation) + 1;
        entries.insert(
            hash,
            Scheduled {
                announcer,
                kind,
                fire_at: now,
                generation,
                last_forced: None,
            },
        );
    }

    pub fn deregister(&self, hash: &InfoHash) {
        self.entries.lock().remove(hash);
    }

    /// Next fire time for a torrent, if scheduled.
    pub fn scheduled_at(&self, hash: &InfoHash) -> Option<u64> {
        self.entries
            .lock()
            .get(hash)
            .map(|e| e.fire_at)
            .filter(|&t| t != u64::MAX)
    }

    /// Moves a torrent's next announce to `fire_at` if the generation still
    /// matches; a stale generation means the entry was cancelled or moved
    /// while the tick ran.
    fn reschedule(&self, hash: &InfoHash, generation: u64, fire_at: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(hash) {
            if entry.generation == generation {
                entry.generation += 1;
                entry.fire_at = fire_at;
            }
        }
    }

    /// Cancels the pending announce unless it is within the grace window of
    /// firing, in which case it is left alone so a final event (typically
    /// `stopped`) is not lost. Returns true when the event was cancelled.
    pub fn cancel_pending(&self, hash: &InfoHash, now: u64) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(hash) else {
            return false;
        };
        if entry.fire_at <= now + self.config.cancel_grace.as_secs() {
            return false;
        }
        entry.generation += 1;
        entry.fire_at = u64::MAX;
        true
    }

    /// Forces an immediate announce, rate-limited per torrent to once per
    /// override period. Returns false when the request was dropped by the
    /// rate limit or the pending event is about to fire anyway.
    pub fn force_update(&self, hash: &InfoHash, now: u64) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(hash) else {
            return false;
        };

        let period = self.config.override_period.as_secs();
        if entry.last_forced.is_some_and(|last| now < last + period) {
            return false;
        }
        if entry.fire_at != u64::MAX && entry.fire_at <= now + self.config.cancel_grace.as_secs() {
            // Already about to fire; let it.
            return false;
        }

        entry.last_forced = Some(now);
        entry.generation += 1;
        entry.fire_at = now;
        if entry.announcer.state() == super::announcer::AnnouncerState::Stopped {
            entry.announcer.reactivate();
        }
        true
    }

    /// Runs every due announce on the given queue, rescheduling each torrent
    /// from its tick result. Returns the number fired.
    pub async fn fire_due(self: &Arc<Self>, kind: TimerQueueKind, now: u64) -> usize {
        let due: Vec<(InfoHash, Arc<Announcer>, u64)> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|(_, e)| e.kind == kind && e.fire_at <= now)
                .map(|(hash, e)| {
                    // Park the entry so a concurrent sweep cannot double-fire.
                    e.fire_at = u64::MAX;
                    (*hash, e.announcer.clone(), e.generation)
                })
                .collect()
        };

        let fired = due.len();
        for (hash, announcer, generation) in due {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                let wait = announcer.tick().await;
                if wait != NEVER {
                    scheduler.reschedule(&hash, generation, now + u64::from(wait));
                }
            });
        }
        fired
    }

    /// Load-smoothing pass over the next 15 minutes of one queue.
    ///
    /// Events are bucketed into 60-second slots; a slot holding more than
    /// half of the fullest slot's events (the imminent first slot excluded)
    /// has its events spread evenly across the slot.
    pub fn flatten(&self, kind: TimerQueueKind, now: u64) {
        const BUCKET_SECS: u64 = 60;
        const LOOKAHEAD_BUCKETS: u64 = 15;

        let mut entries = self.entries.lock();

        let mut buckets: HashMap<u64, Vec<InfoHash>> = HashMap::new();
        for (hash, entry) in entries.iter() {
            if entry.kind != kind || entry.fire_at < now || entry.fire_at == u64::MAX {
                continue;
            }
            let bucket = (entry.fire_at - now) / BUCKET_SECS;
            if bucket >= LOOKAHEAD_BUCKETS {
                continue;
            }
            buckets.entry(bucket).or_default().push(*hash);
        }

        let Some(max_len) = buckets.values().map(Vec::len).max() else {
            return;
        };
        let threshold = (max_len / 2).max(1);

        for (bucket, hashes) in buckets {
            if bucket == 0 || hashes.len() <= threshold {
                continue;
            }
            let start = now + bucket * BUCKET_SECS;
            let count = hashes.len() as u64;
            for (i, hash) in hashes.iter().enumerate() {
                if let Some(entry) = entries.get_mut(hash) {
                    // Fractional spacing: buckets holding more events than
                    // seconds still spread instead of collapsing onto the
                    // bucket's first second.
                    entry.fire_at = start + i as u64 * BUCKET_SECS / count;
                }
            }
        }
    }

    /// Background driver: fires both queues once a second and flattens each
    /// minute. Runs until every entry is deregistered or the task is
    /// dropped.
    pub async fn run(self: Arc<Self>) {
        let mut last_flatten = 0u64;
        loop {
            let now = unix_now();
            self.fire_due(TimerQueueKind::Public, now).await;
            self.fire_due(TimerQueueKind::Private, now).await;

            if now >= last_flatten + 60 {
                self.flatten(TimerQueueKind::Public, now);
                self.flatten(TimerQueueKind::Private, now);
                last_flatten = now;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
