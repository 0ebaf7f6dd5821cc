//! Chunk sorter and spill files.

use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use rayon::slice::ParallelSliceMut;
use tempfile;

use crate::buffer::Batch;
use crate::sort::SortError;

/// Sorted batch persisted to a temporary file.
/// The file is removed when the spill is dropped.
#[derive(Debug)]
pub struct SpillFile {
    path: tempfile::TempPath,
    records: usize,
}

impl SpillFile {
    /// Returns the spill file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of records stored in the file.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Opens the spill file for reading.
    pub fn open(&self, buf_size: Option<usize>) -> io::Result<io::BufReader<fs::File>> {
        open_buffered(&self.path, buf_size)
    }

    /// Removes the spill file reporting a removal error if any.
    pub fn remove(self) -> io::Result<()> {
        self.path.close()
    }
}

pub(crate) fn open_buffered(path: &Path, buf_size: Option<usize>) -> io::Result<io::BufReader<fs::File>> {
    let file = fs::File::open(path)?;

    return Ok(match buf_size {
        Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
        None => io::BufReader::new(file),
    });
}

/// Sorts record batches and spills them to temporary files.
pub struct ChunkSorter {
    /// Batch sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory spill files are created in.
    tmp_dir: PathBuf,
    /// Spill file name prefix.
    prefix: String,
    /// Spill file write buffer size.
    rw_buf_size: Option<usize>,
}

impl ChunkSorter {
    pub fn new(thread_pool: rayon::ThreadPool, tmp_dir: &Path, prefix: &str, rw_buf_size: Option<usize>) -> Self {
        ChunkSorter {
            thread_pool,
            tmp_dir: tmp_dir.to_path_buf(),
            prefix: prefix.to_string(),
            rw_buf_size,
        }
    }

    /// Sorts the batch in byte-lexicographic order and writes it to a new spill file.
    ///
    /// # Arguments
    /// * `batch` - Records to be sorted
    pub fn sort_and_spill(&self, mut batch: Batch) -> Result<SpillFile, SortError> {
        log::debug!("sorting batch ({} records) ...", batch.len());
        self.thread_pool.install(|| {
            batch.par_sort_unstable();
        });

        let records = batch.len();
        let path = self.dump(batch).map_err(SortError::Spill)?;
        log::debug!("batch saved to {} ({} records)", path.display(), records);

        return Ok(SpillFile { path, records });
    }

    fn dump(&self, batch: Batch) -> io::Result<tempfile::TempPath> {
        let tmp_file = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempfile_in(&self.tmp_dir)?;

        let mut spill_writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, tmp_file),
            None => io::BufWriter::new(tmp_file),
        };

        for record in batch {
            spill_writer.write_all(&record)?;
        }

        // dropping the temp file on error removes the partial spill
        let tmp_file = spill_writer.into_inner().map_err(io::IntoInnerError::into_error)?;

        return Ok(tmp_file.into_temp_path());
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::prelude::*;

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::ChunkSorter;
    use crate::buffer::Batch;
    use crate::sort::SortError;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn sorter(dir: &std::path::Path) -> ChunkSorter {
        let thread_pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        ChunkSorter::new(thread_pool, dir, "part", None)
    }

    fn batch(records: &[&[u8]]) -> Batch {
        let mut batch = Batch::new(records.len());
        for record in records {
            batch.push(record.to_vec());
        }
        batch
    }

    #[rstest]
    fn test_sort_and_spill(tmp_dir: tempfile::TempDir) {
        let mut lines = Vec::from_iter((0..100).map(|i| format!("{:03}\n", i)));
        let expected = lines.concat();
        lines.shuffle(&mut rand::thread_rng());

        let records: Vec<&[u8]> = lines.iter().map(|line| line.as_bytes()).collect();
        let spill = sorter(tmp_dir.path()).sort_and_spill(batch(&records)).unwrap();

        assert_eq!(spill.records(), 100);
        assert!(spill.path().starts_with(tmp_dir.path()));
        let name = spill.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("part"));

        let mut actual = String::new();
        spill.open(Some(16)).unwrap().read_to_string(&mut actual).unwrap();
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_byte_order_includes_delimiter(tmp_dir: tempfile::TempDir) {
        let spill = sorter(tmp_dir.path())
            .sort_and_spill(batch(&[b"ab\n", b"a\n", b"B\n", b"a b\n"]))
            .unwrap();

        let content = fs::read(spill.path()).unwrap();
        assert_eq!(content, b"B\na\na b\nab\n".to_vec());
    }

    #[rstest]
    fn test_spill_removed(tmp_dir: tempfile::TempDir) {
        let sorter = sorter(tmp_dir.path());

        let dropped = sorter.sort_and_spill(batch(&[b"a\n"])).unwrap();
        let dropped_path = dropped.path().to_path_buf();
        drop(dropped);
        assert!(!dropped_path.exists());

        let removed = sorter.sort_and_spill(batch(&[b"b\n"])).unwrap();
        let removed_path = removed.path().to_path_buf();
        removed.remove().unwrap();
        assert!(!removed_path.exists());
    }

    #[rstest]
    fn test_spill_dir_missing(tmp_dir: tempfile::TempDir) {
        let missing = tmp_dir.path().join("missing");

        let result = sorter(&missing).sort_and_spill(batch(&[b"a\n"]));
        assert!(matches!(result, Err(SortError::Spill(_))));
    }
}
