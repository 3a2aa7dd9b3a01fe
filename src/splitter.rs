//! Block splitting for parallel range downloads.
use crate::error::{DownloadError, Result};
use crate::metadata::BlockRecord;

/// Hard ceiling on parallel connections per file.
pub const MAX_BLOCKS: u32 = 32;

/// Files below this size are not worth splitting.
const MIN_SPLIT_SIZE: i64 = 2 * 1024 * 1024;

/// Divide a file into contiguous download blocks.
///
/// The ranges cover `[0, file_size - 1]` exactly, with the last block
/// absorbing the division remainder. A server without range support, or a
/// file under 2 MiB, yields a single block. When the file is smaller than the
/// requested block count, the count shrinks so every block is at least one
/// byte.
///
/// # Errors
///
/// [`DownloadError::InvalidArgument`] when `file_size <= 0` or `num_blocks`
/// is outside `[1, 32]`.
pub fn split_blocks(
    file_size: i64,
    num_blocks: u32,
    supports_range: bool,
) -> Result<Vec<BlockRecord>> {
    if file_size <= 0 {
        return Err(DownloadError::InvalidArgument(format!(
            "file_size must be positive, got {file_size}"
        )));
    }
    if !(1..=MAX_BLOCKS).contains(&num_blocks) {
        return Err(DownloadError::InvalidArgument(format!(
            "num_blocks must be in [1, {MAX_BLOCKS}], got {num_blocks}"
        )));
    }

    if !supports_range || file_size < MIN_SPLIT_SIZE {
        return Ok(vec![BlockRecord {
            block_id: 0,
            range_start: 0,
            range_end: file_size - 1,
            downloaded: 0,
            completed: false,
        }]);
    }

    let actual_blocks = (num_blocks as i64).min(file_size);
    let block_size = file_size / actual_blocks;

    let mut blocks = Vec::with_capacity(actual_blocks as usize);
    let mut offset = 0;
    for i in 0..actual_blocks {
        let this_size = if i == actual_blocks - 1 {
            file_size - offset
        } else {
            block_size
        };
        blocks.push(BlockRecord {
            block_id: i as u32,
            range_start: offset,
            range_end: offset + this_size - 1,
            downloaded: 0,
            completed: false,
        });
        offset += this_size;
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(blocks: &[BlockRecord]) -> Vec<(i64, i64)> {
        blocks.iter().map(|b| (b.range_start, b.range_end)).collect()
    }

    #[test]
    fn even_split() {
        let blocks = split_blocks(100, 4, true).unwrap();
        assert_eq!(ranges(&blocks), vec![(0, 24), (25, 49), (50, 74), (75, 99)]);
        assert_eq!(
            blocks.iter().map(|b| b.block_id).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert!(blocks.iter().all(|b| b.downloaded == 0 && !b.completed));
    }

    #[test]
    fn last_block_absorbs_remainder() {
        let blocks = split_blocks(103, 4, true).unwrap();
        let sizes: Vec<i64> = blocks.iter().map(BlockRecord::len).collect();
        assert_eq!(sizes, vec![25, 25, 25, 28]);
        assert_eq!(blocks.last().unwrap().range_end, 102);
    }

    #[test]
    fn no_range_support_means_one_block() {
        let blocks = split_blocks(1000, 8, false).unwrap();
        assert_eq!(ranges(&blocks), vec![(0, 999)]);
    }

    #[test]
    fn small_files_are_not_split() {
        let blocks = split_blocks(MIN_SPLIT_SIZE - 1, 8, true).unwrap();
        assert_eq!(blocks.len(), 1);

        let blocks = split_blocks(MIN_SPLIT_SIZE, 8, true).unwrap();
        assert_eq!(blocks.len(), 8);
    }

    #[test]
    fn tiny_files_fall_under_the_single_block_rule() {
        // 3 bytes could never feed 32 one-byte-minimum blocks, but the 2 MiB
        // threshold catches it first.
        let blocks = split_blocks(3, 32, true).unwrap();
        assert_eq!(ranges(&blocks), vec![(0, 2)]);
    }

    #[test]
    fn blocks_are_contiguous_and_cover_the_file() {
        let size = 5 * 1024 * 1024;
        let blocks = split_blocks(size, 32, true).unwrap();
        assert_eq!(blocks.len(), 32);
        assert_eq!(blocks[0].range_start, 0);
        assert_eq!(blocks.last().unwrap().range_end, size - 1);
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].range_end + 1, pair[1].range_start);
        }
        assert_eq!(blocks.iter().map(BlockRecord::len).sum::<i64>(), size);
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        assert!(matches!(
            split_blocks(0, 4, true),
            Err(DownloadError::InvalidArgument(_))
        ));
        assert!(matches!(
            split_blocks(-1, 4, true),
            Err(DownloadError::InvalidArgument(_))
        ));
        assert!(matches!(
            split_blocks(100, 0, true),
            Err(DownloadError::InvalidArgument(_))
        ));
        assert!(matches!(
            split_blocks(100, 33, true),
            Err(DownloadError::InvalidArgument(_))
        ));
    }
}
