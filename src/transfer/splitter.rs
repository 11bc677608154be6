use crate::{FileshareError, Result};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader, SeekFrom, Take};

/// A contiguous slice of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Reader over one part: positioned at the range's offset and reporting
/// end-of-data after `length` bytes.
pub type PartReader = Take<BufReader<File>>;

/// Tiles `size` bytes into `part_count` ascending, non-overlapping ranges.
/// Every part gets `size / part_count` bytes except the last, which also
/// takes the remainder.
pub fn split_ranges(size: u64, part_count: u32) -> Result<Vec<ByteRange>> {
    if part_count == 0 {
        return Err(FileshareError::Transfer(
            "cannot split a file into zero parts".to_string(),
        ));
    }

    let count = u64::from(part_count);
    let base = size / count;
    let ranges = (0..count)
        .map(|index| {
            let offset = base * index;
            let length = if index == count - 1 {
                size - base * (count - 1)
            } else {
                base
            };
            ByteRange { offset, length }
        })
        .collect();

    Ok(ranges)
}

pub async fn open_part(path: &Path, range: ByteRange, buffer_size: usize) -> Result<PartReader> {
    let mut file = File::open(path).await.map_err(|e| {
        FileshareError::FileOperation(format!("Failed to open {:?}: {}", path, e))
    })?;
    file.seek(SeekFrom::Start(range.offset)).await?;

    Ok(BufReader::with_capacity(buffer_size, file).take(range.length))
}
