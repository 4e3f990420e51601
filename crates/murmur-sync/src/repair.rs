//! Background repair of cache state that fell behind the source of truth.
//!
//! Request paths never rebuild inline: they hand a [`RepairJob`] to the
//! [`RepairHandle`] and answer from the database. A single worker thread
//! drains the queue. A job stays pending until it has run successfully, and a
//! pending job is not queued twice. Jobs that fail because the cache is
//! unreachable are retried with a growing delay.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use murmur_types::{ChannelId, UserId};
use tracing::{debug, info, warn};

use crate::error::SyncResult;

/// First delay before a failed job is retried.
const RETRY_MIN: Duration = Duration::from_millis(50);
/// Upper bound for the retry delay while the cache stays down.
const RETRY_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairJob {
    /// Rebuild a channel's message log, count and allocator seed.
    Channel(ChannelId),
    /// Reload a user's read positions.
    ReadPositions(UserId),
}

/// Whatever can carry out a repair job.
pub trait Repairer: Send + Sync {
    fn repair(&self, job: RepairJob) -> SyncResult<()>;
}

#[derive(Default)]
struct Backlog {
    /// Queued or waiting for a retry.
    pending: HashSet<RepairJob>,
    /// Last attempt failed on a cache outage.
    deferred: Vec<RepairJob>,
}

type Shared = Arc<Mutex<Backlog>>;

#[derive(Clone)]
pub struct RepairHandle {
    tx: Sender<RepairJob>,
    backlog: Shared,
}

#[derive(Clone)]
pub struct RepairQueue {
    rx: Receiver<RepairJob>,
    backlog: Shared,
}

pub fn queue() -> (RepairHandle, RepairQueue) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let backlog = Shared::default();
    (
        RepairHandle {
            tx,
            backlog: backlog.clone(),
        },
        RepairQueue { rx, backlog },
    )
}

impl RepairHandle {
    pub fn schedule(&self, job: RepairJob) {
        let fresh = match self.backlog.lock() {
            Ok(mut backlog) => backlog.pending.insert(job),
            Err(_) => true,
        };
        if !fresh {
            return;
        }
        debug!(?job, "scheduled cache repair");
        if self.tx.send(job).is_err() {
            debug!(?job, "repair queue closed, dropping job");
        }
    }

    /// Jobs that have not run successfully yet.
    pub fn pending(&self) -> usize {
        self.backlog.lock().map(|b| b.pending.len()).unwrap_or(0)
    }

    /// Whether `job` is queued or waiting for a retry. The cached state it
    /// would repair is not to be trusted until it has run.
    pub fn is_pending(&self, job: RepairJob) -> bool {
        self.backlog.lock().map(|b| b.pending.contains(&job)).unwrap_or(true)
    }
}

impl RepairQueue {
    /// Run every queued job on the calling thread, starting with the ones
    /// waiting for a retry. Returns how many ran.
    pub fn drain<R: Repairer + ?Sized>(&self, target: &R) -> usize {
        let mut ran = 0;
        for job in self.take_deferred() {
            self.attempt(target, job);
            ran += 1;
        }
        while let Ok(job) = self.rx.try_recv() {
            self.attempt(target, job);
            ran += 1;
        }
        ran
    }

    /// Spawn the worker thread. It exits once the target is dropped and every
    /// handle is gone.
    pub fn spawn<R: Repairer + 'static>(self, target: Weak<R>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("murmur-repair".into())
            .spawn(move || {
                info!("repair worker started");
                let mut backoff = RETRY_MIN;
                let mut retry_at: Option<Instant> = None;
                loop {
                    let received = match retry_at {
                        Some(at) => self.rx.recv_deadline(at),
                        None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    let (jobs, retrying) = match received {
                        Ok(job) => (vec![job], false),
                        Err(RecvTimeoutError::Timeout) => (self.take_deferred(), true),
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let Some(target) = target.upgrade() else {
                        break;
                    };
                    for job in jobs {
                        self.attempt(target.as_ref(), job);
                    }

                    if self.has_deferred() {
                        if retrying {
                            backoff = (backoff * 2).min(RETRY_MAX);
                        }
                        if retrying || retry_at.is_none() {
                            retry_at = Some(Instant::now() + backoff);
                        }
                    } else {
                        backoff = RETRY_MIN;
                        retry_at = None;
                    }
                }
                info!("repair worker stopped");
            })
    }

    /// Run one job. A job that fails on a cache outage goes back into the
    /// backlog; any other failure is logged and dropped.
    fn attempt<R: Repairer + ?Sized>(&self, target: &R, job: RepairJob) {
        if let Ok(mut backlog) = self.backlog.lock() {
            backlog.pending.remove(&job);
        }
        match target.repair(job) {
            Ok(()) => debug!(?job, "cache repair finished"),
            Err(e) if e.is_recoverable() => {
                warn!(?job, "cache repair failed, will retry: {}", e);
                if let Ok(mut backlog) = self.backlog.lock() {
                    // rescheduled while it ran: the queued copy covers it
                    if backlog.pending.insert(job) {
                        backlog.deferred.push(job);
                    }
                }
            }
            Err(e) => warn!(?job, "cache repair failed: {}", e),
        }
    }

    fn take_deferred(&self) -> Vec<RepairJob> {
        self.backlog
            .lock()
            .map(|mut b| std::mem::take(&mut b.deferred))
            .unwrap_or_default()
    }

    fn has_deferred(&self) -> bool {
        self.backlog.lock().map(|b| !b.deferred.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use murmur_cache::CacheError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<RepairJob>>);

    /// Fails like an unreachable cache until brought back online.
    #[derive(Default)]
    struct Outage {
        online: AtomicBool,
        done: Mutex<Vec<RepairJob>>,
    }

    impl Repairer for Outage {
        fn repair(&self, job: RepairJob) -> SyncResult<()> {
            if !self.online.load(Ordering::SeqCst) {
                return Err(CacheError::Unavailable("connection refused".into()).into());
            }
            self.done.lock().unwrap().push(job);
            Ok(())
        }
    }

    impl Repairer for Recorder {
        fn repair(&self, job: RepairJob) -> SyncResult<()> {
            self.0.lock().unwrap().push(job);
            Ok(())
        }
    }

    #[test]
    fn duplicate_jobs_collapse_while_pending() {
        let (handle, queue) = queue();
        handle.schedule(RepairJob::Channel(ChannelId(1)));
        handle.schedule(RepairJob::Channel(ChannelId(1)));
        handle.schedule(RepairJob::ReadPositions(UserId(1)));
        assert_eq!(handle.pending(), 2);

        let recorder = Recorder::default();
        assert_eq!(queue.drain(&recorder), 2);
        assert_eq!(handle.pending(), 0);

        handle.schedule(RepairJob::Channel(ChannelId(1)));
        assert_eq!(queue.drain(&recorder), 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn worker_runs_jobs_and_stops_with_its_handles() {
        let (handle, queue) = queue();
        let recorder = Arc::new(Recorder::default());
        let worker = queue.spawn(Arc::downgrade(&recorder)).unwrap();

        handle.schedule(RepairJob::Channel(ChannelId(7)));
        drop(handle);
        worker.join().unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![RepairJob::Channel(ChannelId(7))]);
    }

    #[test]
    fn jobs_failing_on_an_outage_stay_pending() {
        let (handle, queue) = queue();
        let outage = Outage::default();
        handle.schedule(RepairJob::Channel(ChannelId(3)));

        assert_eq!(queue.drain(&outage), 1);
        assert_eq!(handle.pending(), 1);
        assert!(handle.is_pending(RepairJob::Channel(ChannelId(3))));

        // still pending, so scheduling again does not queue a second copy
        handle.schedule(RepairJob::Channel(ChannelId(3)));
        outage.online.store(true, Ordering::SeqCst);
        assert_eq!(queue.drain(&outage), 1);
        assert_eq!(handle.pending(), 0);
        assert_eq!(*outage.done.lock().unwrap(), vec![RepairJob::Channel(ChannelId(3))]);
    }

    #[test]
    fn other_failures_are_dropped() {
        struct Broken;
        impl Repairer for Broken {
            fn repair(&self, _job: RepairJob) -> SyncResult<()> {
                Err(SyncError::Source(anyhow::anyhow!("disk I/O error")))
            }
        }

        let (handle, queue) = queue();
        handle.schedule(RepairJob::ReadPositions(UserId(2)));
        assert_eq!(queue.drain(&Broken), 1);
        assert_eq!(handle.pending(), 0);
        assert_eq!(queue.drain(&Broken), 0);
    }

    #[test]
    fn worker_retries_until_the_cache_is_back() {
        let (handle, queue) = queue();
        let outage = Arc::new(Outage::default());
        let worker = queue.spawn(Arc::downgrade(&outage)).unwrap();

        handle.schedule(RepairJob::ReadPositions(UserId(5)));
        std::thread::sleep(Duration::from_millis(120));
        assert!(outage.done.lock().unwrap().is_empty());

        outage.online.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while outage.done.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "job was never retried");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.pending(), 0);

        drop(handle);
        worker.join().unwrap();
    }
}
