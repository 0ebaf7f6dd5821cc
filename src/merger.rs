//! K-way mergers of sorted record streams.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use crate::buffer::{Record, RecordReader};
use crate::chunk::open_buffered;
use crate::sort::SortError;

/// Default number of records a cursor reads ahead.
pub const DEFAULT_READ_AHEAD: usize = 256 * 1024;

/// Merge cursor head selection strategy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Linear scan over the cursor heads, *O(k)* per record.
    LinearScan,
    /// Binary heap over the cursor heads, *O(log k)* per record.
    BinaryHeap,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        MergeStrategy::LinearScan
    }
}

/// Merge options.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    /// Number of records a cursor reads ahead from its source.
    pub read_ahead: usize,
    /// Spill and output files read/write buffer size.
    pub rw_buf_size: Option<usize>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            strategy: MergeStrategy::default(),
            read_ahead: DEFAULT_READ_AHEAD,
            rw_buf_size: None,
        }
    }
}

/// Per-source merge state: a read-ahead head over a sorted record stream.
pub struct MergeCursor<R> {
    reader: RecordReader<R>,
    head: VecDeque<Record>,
    read_ahead: usize,
}

impl<R: BufRead> MergeCursor<R> {
    pub fn new(reader: R, read_ahead: usize) -> Self {
        MergeCursor {
            reader: RecordReader::new(reader),
            head: VecDeque::new(),
            read_ahead: read_ahead.max(1),
        }
    }

    /// Refills the head if it is empty. Returns `false` if the source is exhausted.
    pub fn refill(&mut self) -> io::Result<bool> {
        if self.head.is_empty() {
            self.head = self.reader.read_batch(self.read_ahead)?.into_records().into();
        }
        return Ok(!self.head.is_empty());
    }

    /// Returns the current head record without advancing.
    pub fn peek(&self) -> Option<&Record> {
        self.head.front()
    }

    /// Advances the cursor past the current head record.
    pub fn advance(&mut self) -> Option<Record> {
        self.head.pop_front()
    }

    /// Returns the next record refilling the head if needed.
    pub fn next_record(&mut self) -> io::Result<Option<Record>> {
        if !self.refill()? {
            return Ok(None);
        }
        return Ok(self.advance());
    }
}

/// Linear scan merger.
/// Merges multiple sorted inputs into a single sorted output selecting the smallest head
/// by scanning all active cursors. Time complexity is *m* \* *k* where *m* is the number of records,
/// *k* is the number of cursors. On equal heads the earliest cursor wins.
pub struct LinearScanMerger<R> {
    cursors: Vec<MergeCursor<R>>,
}

impl<R: BufRead> LinearScanMerger<R> {
    /// Creates an instance of a linear scan merger.
    /// Cursor records should be sorted in ascending order otherwise the result is undefined.
    pub fn new<I>(cursors: I) -> Self
    where
        I: IntoIterator<Item = MergeCursor<R>>,
    {
        LinearScanMerger {
            cursors: Vec::from_iter(cursors),
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        let mut idx = 0;
        while idx < self.cursors.len() {
            if self.cursors[idx].refill()? {
                idx += 1;
            } else {
                // keeps the remaining cursors order
                self.cursors.remove(idx);
            }
        }
        return Ok(());
    }

    fn lowest(&self) -> Option<usize> {
        let mut lowest: Option<(usize, &Record)> = None;

        for (idx, cursor) in self.cursors.iter().enumerate() {
            if let Some(record) = cursor.peek() {
                match lowest {
                    Some((_, current)) if current <= record => {}
                    _ => lowest = Some((idx, record)),
                }
            }
        }

        lowest.map(|(idx, _)| idx)
    }
}

impl<R: BufRead> Iterator for LinearScanMerger<R> {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(err) = self.refill() {
            self.cursors.clear();
            return Some(Err(err));
        }

        let idx = self.lowest()?;
        return self.cursors[idx].advance().map(Ok);
    }
}

/// Binary heap merger.
/// Time complexity is *m* \* log(*k*) where *m* is the number of records,
/// *k* is the number of cursors. On equal heads the earliest cursor wins.
pub struct BinaryHeapMerger<R> {
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<(Record, usize)>>,
    cursors: Vec<MergeCursor<R>>,
    initiated: bool,
}

impl<R: BufRead> BinaryHeapMerger<R> {
    /// Creates an instance of a binary heap merger.
    /// Cursor records should be sorted in ascending order otherwise the result is undefined.
    pub fn new<I>(cursors: I) -> Self
    where
        I: IntoIterator<Item = MergeCursor<R>>,
    {
        let cursors = Vec::from_iter(cursors);
        let items = BinaryHeap::with_capacity(cursors.len());

        return BinaryHeapMerger {
            cursors,
            items,
            initiated: false,
        };
    }

    fn pull(&mut self, idx: usize) -> io::Result<()> {
        if let Some(record) = self.cursors[idx].next_record()? {
            self.items.push(Reverse((record, idx)));
        }
        return Ok(());
    }

    fn fail(&mut self, err: io::Error) -> Option<io::Result<Record>> {
        self.items.clear();
        self.cursors.clear();
        return Some(Err(err));
    }
}

impl<R: BufRead> Iterator for BinaryHeapMerger<R> {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            self.initiated = true;
            for idx in 0..self.cursors.len() {
                if let Err(err) = self.pull(idx) {
                    return self.fail(err);
                }
            }
        }

        let Reverse((record, idx)) = self.items.pop()?;
        if let Err(err) = self.pull(idx) {
            return self.fail(err);
        }

        return Some(Ok(record));
    }
}

/// Writes the merged stream to the output. Returns the number of written records.
pub fn write_merged<I, W>(merged: I, output: &mut W) -> Result<u64, SortError>
where
    I: IntoIterator<Item = io::Result<Record>>,
    W: Write,
{
    let mut written = 0;
    for record in merged {
        let record = record.map_err(SortError::Merge)?;
        output.write_all(&record).map_err(SortError::Output)?;
        written += 1;
    }
    output.flush().map_err(SortError::Output)?;

    return Ok(written);
}

/// Merges sorted spill files into the output file. The output is created or truncated.
/// Returns the number of written records.
///
/// # Arguments
/// * `spill_paths` - Sorted files to be merged
/// * `output_path` - Result file
/// * `options` - Merge options
pub fn merge<P: AsRef<Path>>(
    spill_paths: &[P],
    output_path: &Path,
    options: &MergeOptions,
) -> Result<u64, SortError> {
    log::info!(
        "merging {} spill files into {} ({:?})",
        spill_paths.len(),
        output_path.display(),
        options.strategy
    );

    let mut cursors = Vec::with_capacity(spill_paths.len());
    for path in spill_paths {
        let reader = open_buffered(path.as_ref(), options.rw_buf_size).map_err(SortError::Merge)?;
        cursors.push(MergeCursor::new(reader, options.read_ahead));
    }

    let output = fs::File::create(output_path).map_err(SortError::Output)?;
    let mut output = match options.rw_buf_size {
        Some(buf_size) => io::BufWriter::with_capacity(buf_size, output),
        None => io::BufWriter::new(output),
    };

    let written = match options.strategy {
        MergeStrategy::LinearScan => write_merged(LinearScanMerger::new(cursors), &mut output)?,
        MergeStrategy::BinaryHeap => write_merged(BinaryHeapMerger::new(cursors), &mut output)?,
    };
    log::info!("merge done ({} records)", written);

    return Ok(written);
}
