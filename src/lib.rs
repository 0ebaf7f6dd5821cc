//! `line-sort` is a parallel external sort for line-oriented text files.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. Sorting is achieved in two passes. During the
//! first pass it sorts chunks of data that each fit in RAM, during the second pass it merges the sorted chunks
//! together. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! Records are `\n` terminated lines compared byte by byte, the delimiter included.
//!
//! * **Batching:**
//!   the input is read in batches limited by records count.
//! * **Backpressure:**
//!   batches are handed to a fixed number of sorting workers over a rendezvous channel,
//!   so at most about `(workers + 1) * batch size` records are held in memory.
//! * **Spilling:**
//!   every sorted batch is saved to its own temporary file. Spill files are removed at the end
//!   of the run whether it succeeded or failed.
//! * **Merging:**
//!   spill files are merged by a single k-way merge pass using either a linear scan
//!   or a binary heap over the cursor heads.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use line_sort::ExternalSorterBuilder;
//!
//! let sorter = ExternalSorterBuilder::new()
//!     .with_parallelism(4)
//!     .with_batch_size(100_000)
//!     .with_tmp_dir(Path::new("./"))
//!     .build()
//!     .unwrap();
//!
//! let summary = sorter.sort_file(Path::new("in.tmp"), Path::new("out.tmp")).unwrap();
//! println!("{} records sorted", summary.output_records);
//! ```

pub mod buffer;
pub mod chunk;
pub mod merger;
pub mod pool;
pub mod sort;

pub use buffer::{Batch, Record, RecordReader};
pub use chunk::{ChunkSorter, SpillFile};
pub use merger::{merge, BinaryHeapMerger, LinearScanMerger, MergeCursor, MergeOptions, MergeStrategy};
pub use pool::{SpillRegistry, WorkerPool};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortSummary};
