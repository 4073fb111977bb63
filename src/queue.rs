//! Puts are handed off to a small pool of low-priority worker threads,
//! so that callers never block on compression or disk I/O.
//!
//! The queue is unbounded: under sustained overload it grows rather
//! than blocking producers or dropping work.
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::store::DiskStore;
use crate::writer;
use crate::CacheKey;
use crate::EntryMetadata;

/// Default number of background writers.
pub const DEFAULT_WORKERS: usize = 4;

/// One deferred write.  The queue owns copies of the caller's data.
#[derive(Debug)]
pub(crate) struct PutJob {
    pub key: CacheKey,
    pub data: Vec<u8>,
    pub metadata: Option<EntryMetadata>,
}

/// Counts submitted jobs that haven't finished yet.
#[derive(Debug, Default)]
struct Outstanding {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Outstanding {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();

        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_for_zero(&self) {
        let mut count = self.count.lock();

        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Marks a job done when dropped, including when the write panics.
struct JobDone<'a>(&'a Outstanding);

impl Drop for JobDone<'_> {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

#[derive(Debug)]
pub(crate) struct PutQueue {
    // `None` once we start shutting down.
    sender: Option<Sender<PutJob>>,
    workers: Vec<JoinHandle<()>>,
    outstanding: Arc<Outstanding>,
}

#[cfg(target_os = "linux")]
fn lower_thread_priority() {
    // On Linux, this only affects the calling thread.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 19) };

    if ret != 0 {
        tracing::debug!(
            error = %std::io::Error::last_os_error(),
            "failed to lower cache writer priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn lower_thread_priority() {}

fn run_worker(store: Arc<DiskStore>, jobs: Receiver<PutJob>, outstanding: Arc<Outstanding>) {
    lower_thread_priority();

    for job in jobs.iter() {
        let _done = JobDone(&outstanding);

        if let Err(e) = writer::write_entry(&store, &job.key, &job.data, job.metadata.as_ref()) {
            tracing::debug!(key = %job.key, error = %e, "failed to store cache entry");
        }
    }
}

impl PutQueue {
    /// Spawns `num_workers` (at least one) writer threads for `store`.
    ///
    /// Fails only if no thread at all could be spawned.
    pub fn new(store: Arc<DiskStore>, num_workers: usize) -> std::io::Result<PutQueue> {
        let (sender, receiver) = crossbeam::channel::unbounded();
        let outstanding = Arc::new(Outstanding::default());
        let mut workers = Vec::new();
        let mut last_error = None;

        for i in 0..num_workers.max(1) {
            let store = store.clone();
            let receiver = receiver.clone();
            let outstanding = outstanding.clone();

            match std::thread::Builder::new()
                .name(format!("disk-cache-put-{}", i))
                .spawn(move || run_worker(store, receiver, outstanding))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to spawn cache writer");
                    last_error = Some(e);
                }
            }
        }

        if workers.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "no cache writer")
            }));
        }

        Ok(PutQueue {
            sender: Some(sender),
            workers,
            outstanding,
        })
    }

    /// Enqueues `job`.  Never blocks on I/O.
    pub fn submit(&self, job: PutJob) {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return,
        };

        self.outstanding.increment();
        if sender.send(job).is_err() {
            // Every worker is gone; the job will never run.
            self.outstanding.decrement();
        }
    }

    /// Blocks until every job submitted so far has been processed.
    pub fn wait_for_idle(&self) {
        self.outstanding.wait_for_zero();
    }
}

impl Drop for PutQueue {
    /// Drains the queue: closing the channel lets each worker finish
    /// the remaining jobs and exit.
    fn drop(&mut self) {
        self.sender = None;

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("cache writer panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reader::read_entry;
    use crate::DriverIdentity;
    use test_dir::{DirBuilder, TestDir};

    fn open_store(temp: &TestDir) -> Arc<DiskStore> {
        Arc::new(
            DiskStore::open(
                temp.root().to_owned(),
                DriverIdentity::new("queue-test", "cpu", 0),
                1 << 30,
            )
            .expect("open must succeed"),
        )
    }

    fn job(i: u8) -> PutJob {
        PutJob {
            key: CacheKey::from_bytes([i; crate::CACHE_KEY_SIZE]),
            data: vec![i; 100 + i as usize],
            metadata: None,
        }
    }

    #[test]
    fn test_wait_for_idle() {
        let temp = TestDir::temp();
        let store = open_store(&temp);
        let queue = PutQueue::new(store.clone(), DEFAULT_WORKERS).expect("spawn must succeed");

        for i in 0..32 {
            queue.submit(job(i));
        }

        queue.wait_for_idle();
        for i in 0..32 {
            let expected = job(i);
            let entry = read_entry(&store, &expected.key)
                .expect("read must succeed")
                .expect("must hit");
            assert_eq!(entry.data, expected.data);
        }
    }

    /// Dropping the queue finishes pending work.
    #[test]
    fn test_drop_drains() {
        let temp = TestDir::temp();
        let store = open_store(&temp);
        let queue = PutQueue::new(store.clone(), 1).expect("spawn must succeed");

        for i in 0..16 {
            queue.submit(job(i));
        }

        std::mem::drop(queue);
        for i in 0..16 {
            assert!(store.index().has_key(&job(i).key));
        }
    }

    /// Failed writes still count as processed.
    #[test]
    fn test_failures_do_not_wedge() {
        let temp = TestDir::temp().create("05", test_dir::FileType::ZeroFile(1));
        let store = open_store(&temp);
        let queue = PutQueue::new(store.clone(), 2).expect("spawn must succeed");

        queue.submit(job(5));
        queue.submit(job(6));
        queue.wait_for_idle();

        assert!(!store.index().has_key(&job(5).key));
        assert!(read_entry(&store, &job(6).key)
            .expect("read must succeed")
            .is_some());
    }

    #[test]
    fn test_zero_workers_means_one() {
        let temp = TestDir::temp();
        let queue = PutQueue::new(open_store(&temp), 0).expect("spawn must succeed");

        assert_eq!(queue.workers.len(), 1);
    }
}
