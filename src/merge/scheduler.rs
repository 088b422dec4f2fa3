//! Merge schedulers: where registered merges run.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{QuireError, Result};
use crate::merge::one_merge::OneMerge;
use crate::merge::policy::MergeTrigger;

/// The writer side of scheduling: hands out registered merges and runs them.
pub trait MergeProvider: Send + Sync {
    /// Take the next pending merge, marking it running.
    fn next_merge(&self) -> Option<Arc<OneMerge>>;

    fn has_pending_merges(&self) -> bool;

    /// Pending plus running merges.
    fn merge_count(&self) -> usize;

    /// Execute `merge`, which came from [`MergeProvider::next_merge`].
    fn run_merge(&self, merge: &Arc<OneMerge>) -> Result<()>;
}

/// Decides when and on which thread merges run.
pub trait MergeScheduler: Send + Sync + fmt::Debug {
    /// Called whenever merges may be needed; `new_merges_found` tells
    /// whether the last policy round registered any.
    fn merge(
        &self,
        provider: Arc<dyn MergeProvider>,
        trigger: MergeTrigger,
        new_merges_found: bool,
    ) -> Result<()>;

    /// Wait for every merge this scheduler started.
    fn close(&self) -> Result<()>;
}

/// Runs merges on the calling thread, one at a time.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler {
    lock: Mutex<()>,
}

impl SerialMergeScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(
        &self,
        provider: Arc<dyn MergeProvider>,
        _trigger: MergeTrigger,
        _new_merges_found: bool,
    ) -> Result<()> {
        let _serial = self.lock.lock();
        while let Some(merge) = provider.next_merge() {
            debug!("serial merge: {merge}");
            provider.run_merge(&merge)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Tunables of [`ConcurrentMergeScheduler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrentMergeSchedulerConfig {
    /// Merges running at the same time.
    pub max_thread_count: usize,

    /// Pending plus running merges tolerated before indexing threads that
    /// ask for more merges are stalled.
    pub max_merge_count: usize,

    /// How often a stalled caller rechecks the backlog, in milliseconds.
    pub stall_poll_interval_ms: u64,

    /// Prefix of the worker thread names.
    pub thread_name_prefix: String,
}

impl Default for ConcurrentMergeSchedulerConfig {
    fn default() -> Self {
        let max_thread_count = (num_cpus::get() / 2).clamp(1, 4);
        ConcurrentMergeSchedulerConfig {
            max_thread_count,
            max_merge_count: max_thread_count + 5,
            stall_poll_interval_ms: 250,
            thread_name_prefix: "quire-merge".to_string(),
        }
    }
}

/// Counters of a [`ConcurrentMergeScheduler`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSchedulerStats {
    /// Merges that completed.
    pub merges_completed: u64,

    /// Merges that failed or were aborted.
    pub merges_failed: u64,

    /// Times a caller was stalled behind the backlog.
    pub stalls: u64,

    /// Worker threads alive.
    pub active_threads: usize,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    stalls: AtomicU64,
    active: AtomicUsize,
}

struct Workers {
    sender: Sender<Arc<dyn MergeProvider>>,
    handles: Vec<JoinHandle<()>>,
}

/// Runs merges on a small pool of named background threads.
///
/// Workers are started on first use. Each wake-up sends the provider to a
/// worker, which keeps taking merges until none are pending. A caller asking
/// for merges while the backlog exceeds `max_merge_count` waits until it
/// shrinks, so indexing cannot outrun merging indefinitely.
pub struct ConcurrentMergeScheduler {
    config: ConcurrentMergeSchedulerConfig,
    workers: Mutex<Option<Workers>>,
    counters: Arc<Counters>,
    progress: Arc<(Mutex<()>, Condvar)>,
}

impl fmt::Debug for ConcurrentMergeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMergeScheduler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for ConcurrentMergeScheduler {
    fn default() -> Self {
        Self::new(ConcurrentMergeSchedulerConfig::default())
    }
}

impl ConcurrentMergeScheduler {
    pub fn new(config: ConcurrentMergeSchedulerConfig) -> Self {
        let max_thread_count = config.max_thread_count.max(1);
        let config = ConcurrentMergeSchedulerConfig {
            max_thread_count,
            max_merge_count: config.max_merge_count.max(max_thread_count),
            ..config
        };
        ConcurrentMergeScheduler {
            config,
            workers: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            progress: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    pub fn config(&self) -> &ConcurrentMergeSchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> MergeSchedulerStats {
        MergeSchedulerStats {
            merges_completed: self.counters.completed.load(Ordering::Relaxed),
            merges_failed: self.counters.failed.load(Ordering::Relaxed),
            stalls: self.counters.stalls.load(Ordering::Relaxed),
            active_threads: self.counters.active.load(Ordering::Relaxed),
        }
    }

    fn is_merge_thread(&self) -> bool {
        thread::current()
            .name()
            .is_some_and(|name| name.starts_with(&self.config.thread_name_prefix))
    }

    /// Block while the provider's backlog is too deep.
    fn maybe_stall(&self, provider: &dyn MergeProvider) {
        // A merge thread waiting on its own backlog would never wake up.
        if self.is_merge_thread() {
            return;
        }
        let (lock, cond) = &*self.progress;
        let mut guard = lock.lock();
        let mut stalled = false;
        while provider.has_pending_merges() && provider.merge_count() > self.config.max_merge_count {
            if !stalled {
                stalled = true;
                self.counters.stalls.fetch_add(1, Ordering::Relaxed);
                info!(
                    "too many merges ({} > {}); stalling",
                    provider.merge_count(),
                    self.config.max_merge_count
                );
            }
            cond.wait_for(
                &mut guard,
                Duration::from_millis(self.config.stall_poll_interval_ms),
            );
        }
    }

    fn ensure_workers(&self) -> Result<Sender<Arc<dyn MergeProvider>>> {
        let mut workers = self.workers.lock();
        if let Some(workers) = workers.as_ref() {
            return Ok(workers.sender.clone());
        }

        let (sender, receiver) = unbounded::<Arc<dyn MergeProvider>>();
        let mut handles = Vec::with_capacity(self.config.max_thread_count);
        for worker_id in 0..self.config.max_thread_count {
            let receiver = receiver.clone();
            let counters = Arc::clone(&self.counters);
            let progress = Arc::clone(&self.progress);
            let handle = thread::Builder::new()
                .name(format!("{}-{worker_id}", self.config.thread_name_prefix))
                .spawn(move || worker_loop(receiver, counters, progress))
                .map_err(|e| QuireError::other(format!("failed to spawn merge thread: {e}")))?;
            handles.push(handle);
        }
        debug!("started {} merge threads", handles.len());
        *workers = Some(Workers {
            sender: sender.clone(),
            handles,
        });
        Ok(sender)
    }
}

fn worker_loop(
    receiver: Receiver<Arc<dyn MergeProvider>>,
    counters: Arc<Counters>,
    progress: Arc<(Mutex<()>, Condvar)>,
) {
    counters.active.fetch_add(1, Ordering::Relaxed);
    while let Ok(provider) = receiver.recv() {
        while let Some(merge) = provider.next_merge() {
            match provider.run_merge(&merge) {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_merge_aborted() => {
                    debug!("merge aborted: {merge}");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Already recorded on the merge for whoever waits on it.
                    warn!("merge failed: {merge}: {e}");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            let (lock, cond) = &*progress;
            let _guard = lock.lock();
            cond.notify_all();
        }
    }
    counters.active.fetch_sub(1, Ordering::Relaxed);
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(
        &self,
        provider: Arc<dyn MergeProvider>,
        trigger: MergeTrigger,
        new_merges_found: bool,
    ) -> Result<()> {
        if !provider.has_pending_merges() {
            return Ok(());
        }
        debug!("scheduling merges ({trigger:?}, new={new_merges_found})");
        let sender = self.ensure_workers()?;
        let wakeups = provider.merge_count().clamp(1, self.config.max_thread_count);
        for _ in 0..wakeups {
            if sender.send(Arc::clone(&provider)).is_err() {
                return Err(QuireError::other("merge threads are gone"));
            }
        }

        self.maybe_stall(provider.as_ref());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let workers = self.workers.lock().take();
        let Some(Workers { sender, handles }) = workers else {
            return Ok(());
        };
        // Workers drain the queue, then see the channel disconnect.
        drop(sender);
        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(QuireError::merge(format!("{panicked} merge threads panicked")));
        }
        debug!("merge threads stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    /// Hands out `n` trivial merges and counts how many ran.
    struct FakeProvider {
        pending: Mutex<VecDeque<Arc<OneMerge>>>,
        running: AtomicUsize,
        ran: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl FakeProvider {
        fn new(n: usize, delay: Duration) -> Arc<Self> {
            let pending = (0..n)
                .map(|i| {
                    let info = SegmentInfo::new(format!("_{i}"), 1, "Simple");
                    OneMerge::new(vec![SegmentCommitInfo::fresh(info)])
                })
                .collect();
            Arc::new(FakeProvider {
                pending: Mutex::new(pending),
                running: AtomicUsize::new(0),
                ran: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay,
            })
        }
    }

    impl MergeProvider for FakeProvider {
        fn next_merge(&self) -> Option<Arc<OneMerge>> {
            let merge = self.pending.lock().pop_front();
            if merge.is_some() {
                self.running.fetch_add(1, Ordering::SeqCst);
            }
            merge
        }

        fn has_pending_merges(&self) -> bool {
            !self.pending.lock().is_empty()
        }

        fn merge_count(&self) -> usize {
            self.pending.lock().len() + self.running.load(Ordering::SeqCst)
        }

        fn run_merge(&self, _merge: &Arc<OneMerge>) -> Result<()> {
            thread::sleep(self.delay);
            self.ran.fetch_add(1, Ordering::SeqCst);
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(QuireError::storage("disk full"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_serial_runs_everything_inline() {
        let provider = FakeProvider::new(3, Duration::ZERO);
        let scheduler = SerialMergeScheduler::new();
        scheduler
            .merge(provider.clone(), MergeTrigger::Explicit, true)
            .unwrap();
        assert_eq!(provider.ran.load(Ordering::SeqCst), 3);
        assert!(!provider.has_pending_merges());
    }

    #[test]
    fn test_serial_propagates_failure() {
        let provider = FakeProvider::new(2, Duration::ZERO);
        provider.fail.store(true, Ordering::SeqCst);
        let scheduler = SerialMergeScheduler::new();
        assert!(scheduler
            .merge(provider.clone(), MergeTrigger::Explicit, true)
            .is_err());
        assert_eq!(provider.ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_runs_in_background() {
        let provider = FakeProvider::new(8, Duration::from_millis(5));
        let scheduler = ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig {
            max_thread_count: 2,
            max_merge_count: 100,
            ..Default::default()
        });
        scheduler
            .merge(provider.clone(), MergeTrigger::FullFlush, true)
            .unwrap();
        scheduler.close().unwrap();

        assert_eq!(provider.ran.load(Ordering::SeqCst), 8);
        let stats = scheduler.stats();
        assert_eq!(stats.merges_completed, 8);
        assert_eq!(stats.active_threads, 0);
    }

    #[test]
    fn test_concurrent_stalls_on_backlog() {
        let provider = FakeProvider::new(6, Duration::from_millis(5));
        let scheduler = ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig {
            max_thread_count: 1,
            max_merge_count: 2,
            stall_poll_interval_ms: 5,
            ..Default::default()
        });
        scheduler
            .merge(provider.clone(), MergeTrigger::FullFlush, true)
            .unwrap();
        // The caller only returns once the backlog is back under the limit.
        assert!(provider.merge_count() <= 2 || !provider.has_pending_merges());
        assert!(scheduler.stats().stalls >= 1);
        scheduler.close().unwrap();
        assert_eq!(provider.ran.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_concurrent_failures_are_counted() {
        let provider = FakeProvider::new(2, Duration::ZERO);
        provider.fail.store(true, Ordering::SeqCst);
        let scheduler = ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig {
            max_thread_count: 1,
            ..Default::default()
        });
        scheduler
            .merge(provider.clone(), MergeTrigger::Explicit, true)
            .unwrap();
        scheduler.close().unwrap();
        assert_eq!(scheduler.stats().merges_failed, 2);
    }

    #[test]
    fn test_config_defaults() {
        let config = ConcurrentMergeSchedulerConfig::default();
        assert!(config.max_thread_count >= 1 && config.max_thread_count <= 4);
        assert_eq!(config.max_merge_count, config.max_thread_count + 5);
        let json = serde_json::to_string(&config).unwrap();
        let back: ConcurrentMergeSchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.thread_name_prefix, "quire-merge");
    }
}
