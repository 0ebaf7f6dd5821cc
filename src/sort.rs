//! External sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::RecordReader;
use crate::chunk::ChunkSorter;
use crate::merger::{self, MergeOptions, MergeStrategy, DEFAULT_READ_AHEAD};
use crate::pool::{spill_channel, SpillRegistry, WorkerPool};

/// Default number of sorting workers.
pub const DEFAULT_PARALLELISM: usize = 16;
/// Default maximum number of records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 512 * 1024;
/// Default spill file name prefix.
pub const DEFAULT_SPILL_PREFIX: &str = "part";

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Sorter configuration error.
    InvalidConfig(String),
    /// Sorting thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Worker or registry thread creation error.
    WorkerSpawn(io::Error),
    /// A worker or registry thread terminated abnormally.
    WorkerPanicked(String),
    /// No sorting worker is left to accept a batch.
    WorkersTerminated,
    /// Input file opening or reading error.
    Input(io::Error),
    /// Spill file creation or writing error.
    Spill(io::Error),
    /// Spill file reading error during the merge.
    Merge(io::Error),
    /// Output file creation or writing error.
    Output(io::Error),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::InvalidConfig(_) => None,
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::WorkerSpawn(err) => Some(err),
            SortError::WorkerPanicked(_) => None,
            SortError::WorkersTerminated => None,
            SortError::Input(err) => Some(err),
            SortError::Spill(err) => Some(err),
            SortError::Merge(err) => Some(err),
            SortError::Output(err) => Some(err),
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::WorkerSpawn(err) => write!(f, "worker thread not started: {}", err),
            SortError::WorkerPanicked(msg) => write!(f, "worker thread terminated abnormally: {}", msg),
            SortError::WorkersTerminated => write!(f, "no sorting worker is running"),
            SortError::Input(err) => write!(f, "input data stream error: {}", err),
            SortError::Spill(err) => write!(f, "spill file not saved: {}", err),
            SortError::Merge(err) => write!(f, "spill file reading error: {}", err),
            SortError::Output(err) => write!(f, "output file writing error: {}", err),
        }
    }
}

/// Sorting run statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SortSummary {
    /// Number of records read from the input.
    pub records: u64,
    /// Number of batches dispatched to the workers.
    pub batches: usize,
    /// Number of spill files merged.
    pub spill_files: usize,
    /// Number of records written to the output.
    pub output_records: u64,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone, Debug)]
pub struct ExternalSorterBuilder {
    /// Number of workers sorting and spilling batches concurrently.
    parallelism: usize,
    /// Maximum number of records per batch.
    batch_size: usize,
    /// Number of threads a single batch is sorted with.
    threads_number: Option<usize>,
    /// Directory to be used to store spill files.
    tmp_dir: Option<PathBuf>,
    /// Spill file name prefix.
    spill_prefix: String,
    /// Spill, input and output files read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Number of records a merge cursor reads ahead.
    merge_read_ahead: usize,
    /// Merge cursor head selection strategy.
    merge_strategy: MergeStrategy,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        ExternalSorter::new(self)
    }

    /// Sets number of workers sorting batches concurrently.
    pub fn with_parallelism(mut self, parallelism: usize) -> ExternalSorterBuilder {
        self.parallelism = parallelism;
        return self;
    }

    /// Sets maximum number of records per batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> ExternalSorterBuilder {
        self.batch_size = batch_size;
        return self;
    }

    /// Sets number of threads to be used to sort a batch in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store spill files.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets spill file name prefix.
    pub fn with_spill_prefix(mut self, prefix: &str) -> ExternalSorterBuilder {
        self.spill_prefix = prefix.to_string();
        return self;
    }

    /// Sets files read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets number of records a merge cursor reads ahead.
    pub fn with_merge_read_ahead(mut self, read_ahead: usize) -> ExternalSorterBuilder {
        self.merge_read_ahead = read_ahead;
        return self;
    }

    /// Sets merge strategy.
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> ExternalSorterBuilder {
        self.merge_strategy = strategy;
        return self;
    }
}

impl Default for ExternalSorterBuilder {
    fn default() -> Self {
        ExternalSorterBuilder {
            parallelism: DEFAULT_PARALLELISM,
            batch_size: DEFAULT_BATCH_SIZE,
            threads_number: None,
            tmp_dir: None,
            spill_prefix: DEFAULT_SPILL_PREFIX.to_string(),
            rw_buf_size: None,
            merge_read_ahead: DEFAULT_READ_AHEAD,
            merge_strategy: MergeStrategy::default(),
        }
    }
}

/// External sorter.
pub struct ExternalSorter {
    /// Number of sorting workers.
    parallelism: usize,
    /// Maximum number of records per batch.
    batch_size: usize,
    /// Chunk sorter shared by the workers.
    sorter: Arc<ChunkSorter>,
    /// Input file read buffer size.
    rw_buf_size: Option<usize>,
    merge_options: MergeOptions,
}

impl ExternalSorter {
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `config` - Sorter configuration. If the temporary directory is not set the current
    ///   working directory is used.
    pub fn new(config: ExternalSorterBuilder) -> Result<Self, SortError> {
        if config.parallelism == 0 {
            return Err(SortError::InvalidConfig("parallelism must be positive".to_string()));
        }
        if config.batch_size == 0 {
            return Err(SortError::InvalidConfig("batch size must be positive".to_string()));
        }
        if config.merge_read_ahead == 0 {
            return Err(SortError::InvalidConfig("merge read-ahead must be positive".to_string()));
        }

        let tmp_dir = config.tmp_dir.unwrap_or_else(|| PathBuf::from("."));
        log::info!("using {} as a temporary directory", tmp_dir.display());

        let thread_pool = Self::init_thread_pool(config.threads_number)?;
        let sorter = ChunkSorter::new(thread_pool, &tmp_dir, &config.spill_prefix, config.rw_buf_size);

        return Ok(ExternalSorter {
            parallelism: config.parallelism,
            batch_size: config.batch_size,
            sorter: Arc::new(sorter),
            rw_buf_size: config.rw_buf_size,
            merge_options: MergeOptions {
                strategy: config.merge_strategy,
                read_ahead: config.merge_read_ahead,
                rw_buf_size: config.rw_buf_size,
            },
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new().thread_name(|idx| format!("sort-{}", idx));

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    /// Sorts the input file into the output file.
    ///
    /// # Arguments
    /// * `input` - File to be sorted
    /// * `output` - Result file, created or truncated
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<SortSummary, SortError> {
        let input_file = fs::File::open(input).map_err(SortError::Input)?;
        let input_stream = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, input_file),
            None => io::BufReader::new(input_file),
        };
        log::info!("sorting {} into {}", input.display(), output.display());

        self.sort(input_stream, output)
    }

    /// Sorts records from the input stream into the output file.
    /// Spill files are removed on every exit path.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    /// * `output` - Result file, created or truncated
    pub fn sort<R: BufRead>(&self, input: R, output: &Path) -> Result<SortSummary, SortError> {
        let mut reader = RecordReader::new(input);

        // the registry is started first so every spill is tracked for cleanup
        let (spill_sender, spill_receiver) = spill_channel();
        let registry = SpillRegistry::spawn(spill_receiver)?;
        let pool = WorkerPool::start(self.parallelism, self.sorter.clone(), spill_sender)?;

        let fed = self.feed(&mut reader, &pool);
        let spilled = pool.join();
        let registry = registry.wait()?;

        let batches = match (fed, spilled) {
            (Ok(batches), Ok(_)) => batches,
            (_, Err(err)) | (Err(err), Ok(_)) => {
                log::info!("sorting aborted, removing {} spill files", registry.len());
                registry.cleanup();
                return Err(err);
            }
        };
        log::debug!("external sort preparation done ({} spill files)", registry.len());

        let merged = merger::merge(&registry.paths(), output, &self.merge_options);

        let summary = SortSummary {
            records: reader.records_read(),
            batches,
            spill_files: registry.len(),
            output_records: 0,
        };
        registry.cleanup();

        return Ok(SortSummary {
            output_records: merged?,
            ..summary
        });
    }

    fn feed<R: BufRead>(&self, reader: &mut RecordReader<R>, pool: &WorkerPool) -> Result<usize, SortError> {
        let mut batches = 0;

        while !pool.is_failed() {
            let batch = reader.read_batch(self.batch_size).map_err(SortError::Input)?;
            if batch.is_empty() {
                return Ok(batches);
            }

            log::debug!("dispatching batch #{} ({} records)", batches, batch.len());
            pool.submit(batch)?;
            batches += 1;
        }

        log::warn!("worker failure, input reading stopped after {} batches", batches);
        return Ok(batches);
    }
}
