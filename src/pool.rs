//! Sorting worker pool and spill registry.
//!
//! Batches are handed to the workers over a rendezvous channel, so the producer blocks until
//! a worker is idle. Workers forward spill files to a single registry collector thread over
//! a second rendezvous channel. The collector owns the registry list and hands it back only
//! after every worker sender has been dropped.

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::buffer::Batch;
use crate::chunk::{ChunkSorter, SpillFile};
use crate::sort::SortError;

/// Creates the worker output channel.
pub fn spill_channel() -> (Sender<SpillFile>, Receiver<SpillFile>) {
    bounded(0)
}

/// Fixed size pool of chunk sorting workers.
pub struct WorkerPool {
    sender: Sender<Batch>,
    workers: Vec<JoinHandle<Result<usize, SortError>>>,
    failed: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts the workers.
    ///
    /// # Arguments
    /// * `parallelism` - Number of workers
    /// * `sorter` - Chunk sorter shared by the workers
    /// * `spills` - Worker output channel, closed when the last worker terminates
    pub fn start(parallelism: usize, sorter: Arc<ChunkSorter>, spills: Sender<SpillFile>) -> Result<Self, SortError> {
        log::info!("starting worker pool (workers: {})", parallelism);

        let (sender, receiver) = bounded::<Batch>(0);
        let failed = Arc::new(AtomicBool::new(false));
        let mut pool = WorkerPool {
            sender,
            workers: Vec::with_capacity(parallelism),
            failed,
        };

        for idx in 0..parallelism {
            let receiver = receiver.clone();
            let spills = spills.clone();
            let sorter = sorter.clone();
            let failed = pool.failed.clone();

            let worker = thread::Builder::new()
                .name(format!("sort-worker-{}", idx))
                .spawn(move || Self::worker(receiver, spills, &sorter, &failed))
                .map_err(SortError::WorkerSpawn)?;
            pool.workers.push(worker);
        }

        return Ok(pool);
    }

    fn worker(
        batches: Receiver<Batch>,
        spills: Sender<SpillFile>,
        sorter: &ChunkSorter,
        failed: &AtomicBool,
    ) -> Result<usize, SortError> {
        let mut spilled = 0;

        for batch in batches {
            let spill = match sorter.sort_and_spill(batch) {
                Ok(spill) => spill,
                Err(err) => {
                    log::error!("batch spilling failed: {}", err);
                    failed.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            };
            // the registry outlives the workers, a send error drops (and removes) the spill
            if spills.send(spill).is_err() {
                log::warn!("spill registry is gone, dropping spill file");
            }
            spilled += 1;
        }

        return Ok(spilled);
    }

    /// Hands the batch to an idle worker, blocking until one accepts it.
    pub fn submit(&self, batch: Batch) -> Result<(), SortError> {
        self.sender
            .send(batch)
            .map_err(|_| SortError::WorkersTerminated)
    }

    /// Checks if any worker failed.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Closes the batch channel and waits for every worker to terminate.
    /// Returns the first worker error.
    pub fn join(self) -> Result<usize, SortError> {
        drop(self.sender);

        let mut spilled = 0;
        let mut first_err = None;
        for worker in self.workers {
            let result = worker
                .join()
                .unwrap_or_else(|panic| Err(SortError::WorkerPanicked(panic_message(&*panic))));
            match result {
                Ok(count) => spilled += count,
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        log::debug!("worker pool drained ({} spills)", spilled);

        return match first_err {
            Some(err) => Err(err),
            None => Ok(spilled),
        };
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// List of spill files produced by the worker pool.
#[derive(Debug, Default)]
pub struct SpillRegistry {
    spills: Vec<SpillFile>,
}

/// Running spill registry collector.
pub struct RegistryHandle {
    collector: JoinHandle<SpillRegistry>,
}

impl SpillRegistry {
    /// Starts the registry collector draining the worker output channel.
    pub fn spawn(spills: Receiver<SpillFile>) -> Result<RegistryHandle, SortError> {
        let collector = thread::Builder::new()
            .name("spill-registry".to_string())
            .spawn(move || {
                let mut registry = SpillRegistry::default();
                for spill in spills {
                    registry.spills.push(spill);
                }
                registry
            })
            .map_err(SortError::WorkerSpawn)?;

        return Ok(RegistryHandle { collector });
    }

    pub fn len(&self) -> usize {
        self.spills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spills.is_empty()
    }

    /// Returns the total number of spilled records.
    pub fn records(&self) -> u64 {
        self.spills.iter().map(|spill| spill.records() as u64).sum()
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.spills.iter().map(SpillFile::path).collect()
    }

    /// Removes all the spill files. Removal errors are logged and skipped.
    pub fn cleanup(self) {
        for spill in self.spills {
            let path = spill.path().to_path_buf();
            if let Err(err) = spill.remove() {
                log::warn!("spill file {} removal failed: {}", path.display(), err);
            }
        }
    }
}

impl RegistryHandle {
    /// Waits until the worker output channel is closed and returns the complete registry.
    pub fn wait(self) -> Result<SpillRegistry, SortError> {
        self.collector
            .join()
            .map_err(|panic| SortError::WorkerPanicked(panic_message(&*panic)))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::*;

    use super::{spill_channel, SpillRegistry, WorkerPool};
    use crate::buffer::Batch;
    use crate::chunk::ChunkSorter;
    use crate::sort::SortError;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn sorter(dir: &std::path::Path) -> Arc<ChunkSorter> {
        let thread_pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        Arc::new(ChunkSorter::new(thread_pool, dir, "part", None))
    }

    fn batch(idx: usize) -> Batch {
        let mut batch = Batch::new(2);
        batch.push(format!("{}b\n", idx).into_bytes());
        batch.push(format!("{}a\n", idx).into_bytes());
        batch
    }

    #[rstest]
    #[case(1, 0)]
    #[case(1, 5)]
    #[case(4, 3)]
    #[case(3, 20)]
    fn test_pool_spills_every_batch(tmp_dir: tempfile::TempDir, #[case] parallelism: usize, #[case] batches: usize) {
        let (spill_tx, spill_rx) = spill_channel();
        let registry = SpillRegistry::spawn(spill_rx).unwrap();
        let pool = WorkerPool::start(parallelism, sorter(tmp_dir.path()), spill_tx).unwrap();

        for idx in 0..batches {
            pool.submit(batch(idx)).unwrap();
        }
        assert_eq!(pool.join().unwrap(), batches);

        let registry = registry.wait().unwrap();
        assert_eq!(registry.len(), batches);
        assert_eq!(registry.records(), 2 * batches as u64);

        let paths: Vec<_> = registry.paths().iter().map(|path| path.to_path_buf()).collect();
        assert!(paths.iter().all(|path| path.exists()));

        registry.cleanup();
        assert!(paths.iter().all(|path| !path.exists()));
        assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_pool_worker_failure(tmp_dir: tempfile::TempDir) {
        let missing = tmp_dir.path().join("missing");
        let (spill_tx, spill_rx) = spill_channel();
        let registry = SpillRegistry::spawn(spill_rx).unwrap();
        let pool = WorkerPool::start(2, sorter(&missing), spill_tx).unwrap();

        // every worker fails on its first batch, then the batch channel has no receivers
        let mut submitted = 0;
        while !pool.is_failed() && pool.submit(batch(submitted)).is_ok() {
            submitted += 1;
        }
        assert!(submitted <= 2);

        assert!(matches!(pool.join(), Err(SortError::Spill(_))));
        assert!(registry.wait().unwrap().is_empty());
    }

    #[rstest]
    fn test_submit_after_workers_terminated(tmp_dir: tempfile::TempDir) {
        let missing = tmp_dir.path().join("missing");
        let (spill_tx, spill_rx) = spill_channel();
        let registry = SpillRegistry::spawn(spill_rx).unwrap();
        let pool = WorkerPool::start(1, sorter(&missing), spill_tx).unwrap();

        // the only worker takes the first batch and exits on its spill error
        pool.submit(batch(0)).unwrap();
        assert!(matches!(pool.submit(batch(1)), Err(SortError::WorkersTerminated)));
        assert!(pool.is_failed());

        assert!(matches!(pool.join(), Err(SortError::Spill(_))));
        assert!(registry.wait().unwrap().is_empty());
    }
}
