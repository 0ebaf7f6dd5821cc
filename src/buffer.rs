//! Record batches and the batch reader.

use std::io::{self, prelude::*};

use rayon;

/// Single line record. Always ends with the record delimiter.
pub type Record = Vec<u8>;

/// Record delimiter.
pub const DELIMITER: u8 = b'\n';

/// Batch of records limited by records count.
#[derive(Debug, Default)]
pub struct Batch {
    limit: usize,
    records: Vec<Record>,
}

impl Batch {
    pub fn new(limit: usize) -> Self {
        Batch {
            limit,
            records: Vec::new(),
        }
    }

    /// Adds a new record to the batch.
    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// Returns batch length.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Checks if the batch reached the limit.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.limit
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

impl IntoIterator for Batch {
    type Item = Record;
    type IntoIter = <Vec<Record> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl rayon::slice::ParallelSliceMut<Record> for Batch {
    fn as_parallel_slice_mut(&mut self) -> &mut [Record] {
        self.records.as_mut_slice()
    }
}

/// Sequential batch reader over a buffered record stream.
///
/// A record missing the trailing delimiter at the end of the stream is still returned,
/// terminated with the delimiter. It is ordered by its terminated bytes, so `ab` sorts after `ab\t\n`.
pub struct RecordReader<R> {
    inner: R,
    exhausted: bool,
    records_read: u64,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        RecordReader {
            inner,
            exhausted: false,
            records_read: 0,
        }
    }

    /// Reads up to `max_records` records.
    /// An empty batch means the stream is exhausted, no more records will be returned.
    ///
    /// # Arguments
    /// * `max_records` - Maximum number of records in the batch
    pub fn read_batch(&mut self, max_records: usize) -> io::Result<Batch> {
        let mut batch = Batch::new(max_records);

        while !self.exhausted && !batch.is_full() {
            match self.read_record()? {
                Some(record) => batch.push(record),
                None => self.exhausted = true,
            }
        }

        return Ok(batch);
    }

    fn read_record(&mut self) -> io::Result<Option<Record>> {
        let mut record = Vec::new();
        if self.inner.read_until(DELIMITER, &mut record)? == 0 {
            return Ok(None);
        }

        if record.last() != Some(&DELIMITER) {
            log::debug!("unterminated tail record ({} bytes) at end of stream", record.len());
            record.push(DELIMITER);
            self.exhausted = true;
        }
        self.records_read += 1;

        return Ok(Some(record));
    }

    /// Returns the number of records read so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }
}

#[cfg(test)]
mod test {
    use std::io::{self, prelude::*, ErrorKind};

    use rstest::*;

    use super::{Batch, Record, RecordReader};

    fn records(lines: &[&str]) -> Vec<Record> {
        lines.iter().map(|line| line.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_limited_batch() {
        let mut batch = Batch::new(2);

        batch.push(b"a\n".to_vec());
        assert_eq!(batch.is_full(), false);
        batch.push(b"b\n".to_vec());
        assert_eq!(batch.is_full(), true);

        let data = Vec::from_iter(batch);
        assert_eq!(data, records(&["a\n", "b\n"]));
    }

    #[rstest]
    #[case("", 2, vec![])]
    #[case("a\n", 2, vec![vec!["a\n"]])]
    #[case("a\nb\nc\n", 2, vec![vec!["a\n", "b\n"], vec!["c\n"]])]
    #[case("a\nb\nc\nd\n", 2, vec![vec!["a\n", "b\n"], vec!["c\n", "d\n"]])]
    #[case("a\nb\nc", 2, vec![vec!["a\n", "b\n"], vec!["c\n"]])]
    #[case("\n\nx\n", 5, vec![vec!["\n", "\n", "x\n"]])]
    #[case("ab\t\nab", 5, vec![vec!["ab\t\n", "ab\n"]])]
    fn test_read_batches(#[case] input: &str, #[case] max_records: usize, #[case] expected: Vec<Vec<&str>>) {
        let mut reader = RecordReader::new(io::Cursor::new(input.as_bytes()));

        let mut actual = Vec::new();
        loop {
            let batch = reader.read_batch(max_records).unwrap();
            if batch.is_empty() {
                break;
            }
            actual.push(batch.into_records());
        }

        let expected: Vec<Vec<Record>> = expected.iter().map(|batch| records(batch)).collect();
        assert_eq!(actual, expected);
        assert_eq!(reader.records_read(), expected.iter().map(Vec::len).sum::<usize>() as u64);

        // keeps signalling the end of the stream
        assert!(reader.read_batch(max_records).unwrap().is_empty());
    }

    struct FailingReader {
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(ErrorKind::Other, "disk failure"));
            }
            self.served = true;
            let data = b"a\nb";
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
    }

    #[test]
    fn test_read_error() {
        let mut reader = RecordReader::new(io::BufReader::new(FailingReader { served: false }));

        let err = reader.read_batch(10).unwrap_err();
        assert_eq!(err.to_string(), "disk failure");
    }
}
