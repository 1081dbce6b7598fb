// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{io, ops::Range, sync::atomic::AtomicBool};

use num_traits::ToPrimitive;
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};
use ring::digest::{Algorithm, Context};
use thiserror::Error;

use crate::{format::padding, stream, util};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hash tree should have size {expected} for input size {input}, but has size {actual}")]
    InvalidHashTreeSize {
        input: u64,
        expected: usize,
        actual: usize,
    },
    #[error("Expected root digest {expected}, but have {actual}")]
    InvalidRootDigest { expected: String, actual: String },
    #[error("Expected hash tree {expected}, but have {actual}")]
    InvalidHashTree { expected: String, actual: String },
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// dm-verity style hash tree over an in-memory image. Each block is hashed
/// with the salt prepended. Digests are padded to a power of two and every
/// level is padded to the block size.
pub struct HashTree {
    block_size: u32,
    salted_context: Context,
}

impl HashTree {
    pub fn new(block_size: u32, algorithm: &'static Algorithm, salt: &[u8]) -> Self {
        let mut salted_context = Context::new(algorithm);
        salted_context.update(salt);

        Self {
            block_size,
            salted_context,
        }
    }

    fn digest_size(&self) -> usize {
        self.salted_context.algorithm().output_len().next_power_of_two()
    }

    /// Compute the list of offset ranges that each level occupies in the hash
    /// tree data. The items are returned with the bottom level's offsets first
    /// in the list. Note that the bottom level is stored at the end of the hash
    /// tree data.
    pub fn compute_level_offsets(&self, image_size: u64) -> Result<Vec<Range<usize>>> {
        let digest_size = self.digest_size() as u64;
        let mut ranges = vec![];
        let mut level_size = image_size;

        while level_size > u64::from(self.block_size) {
            let blocks = level_size.div_ceil(u64::from(self.block_size));
            level_size = blocks
                .checked_mul(digest_size)
                .and_then(|s| padding::round(s, u64::from(self.block_size)))
                .ok_or(Error::FieldOutOfBounds("level_size"))?;

            let level_size_usize = level_size
                .to_usize()
                .ok_or(Error::FieldOutOfBounds("level_size"))?;

            ranges.push(0..level_size_usize);
        }

        // The hash tree puts the leaves at the end.
        let mut offset = 0;
        for range in ranges.iter_mut().rev() {
            let level_size = range.end - range.start;
            range.start += offset;
            range.end += offset;
            offset += level_size;
        }

        Ok(ranges)
    }

    /// Size of the hash tree for an image of the given size.
    pub fn tree_size(&self, image_size: u64) -> Result<usize> {
        let offsets = self.compute_level_offsets(image_size)?;

        Ok(offsets.first().map(|r| r.end).unwrap_or(0))
    }

    /// Convert a list of ranges of byte offsets to a sorted, non-overlapping
    /// list of block ranges.
    fn blocks_for_ranges(&self, image_size: u64, ranges: &[Range<u64>]) -> Result<Vec<Range<u64>>> {
        let ranges = util::merge_overlapping(ranges);
        if let Some(last) = ranges.last()
            && last.end > image_size
        {
            return Err(Error::FieldOutOfBounds("ranges"));
        }

        let block_size = u64::from(self.block_size);
        let result = ranges
            .into_iter()
            .filter(|r| r.start < r.end)
            .map(|r| r.start / block_size..r.end.div_ceil(block_size))
            .collect::<Vec<_>>();

        Ok(util::merge_overlapping(&result))
    }

    /// Hash consecutive blocks of `data` into `level_data`. The final block is
    /// zero padded to the block size before hashing.
    fn hash_partial_level(
        &self,
        data: &[u8],
        mut level_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        let algorithm = self.salted_context.algorithm();
        let digest_padding = self.digest_size() - algorithm.output_len();
        let mut buf = vec![0u8; self.block_size as usize];

        for block in data.chunks(buf.len()) {
            stream::check_cancel(cancel_signal)?;

            buf[..block.len()].copy_from_slice(block);
            buf[block.len()..].fill(0);

            let mut context = self.salted_context.clone();
            context.update(&buf);
            let digest = context.finish();

            level_data[..digest.as_ref().len()].copy_from_slice(digest.as_ref());
            level_data = &mut level_data[digest.as_ref().len()..];

            level_data[..digest_padding].fill(0);
            level_data = &mut level_data[digest_padding..];
        }

        Ok(())
    }

    /// Hash the leaf level in parallel.
    fn hash_one_level_parallel(
        &self,
        data: &[u8],
        level_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        let digest_size = self.digest_size();
        let block_size = self.block_size as usize;
        let multiplier = 1024usize;

        level_data
            .par_chunks_mut(digest_size * multiplier)
            .enumerate()
            .map(|(chunk, out_data)| -> io::Result<()> {
                let digests = out_data.len() / digest_size;
                let in_start = (chunk * multiplier * block_size).min(data.len());
                let in_end = (in_start + digests * block_size).min(data.len());

                self.hash_partial_level(&data[in_start..in_end], out_data, cancel_signal)
            })
            .collect::<io::Result<()>>()
    }

    /// Rehash only the leaf digests covering the specified blocks.
    fn hash_partial_level_parallel(
        &self,
        data: &[u8],
        block_ranges: &[Range<u64>],
        level_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        let digest_size = self.digest_size();
        let block_size = self.block_size as usize;

        level_data
            .par_chunks_exact_mut(digest_size)
            .enumerate()
            .filter(|(chunk, _)| util::ranges_contains(block_ranges, &(*chunk as u64)))
            .map(|(chunk, out_data)| -> io::Result<()> {
                let in_start = (chunk * block_size).min(data.len());
                let in_end = (in_start + block_size).min(data.len());

                self.hash_partial_level(&data[in_start..in_end], out_data, cancel_signal)
            })
            .collect::<io::Result<()>>()
    }

    /// Compute the hash tree and return the root digest. If `ranges` is
    /// specified, then only the leaves covering those ranges are recomputed.
    fn calculate(
        &self,
        data: &[u8],
        ranges: Option<&[Range<u64>]>,
        level_offsets: &[Range<usize>],
        hash_tree_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> Result<Vec<u8>> {
        // Small inputs are hashed directly.
        let Some(root_level) = level_offsets.last() else {
            let mut context = self.salted_context.clone();
            context.update(data);

            return Ok(context.finish().as_ref().to_vec());
        };

        for (i, level_range) in level_offsets.iter().enumerate() {
            let (front, back) = hash_tree_data.split_at_mut(level_range.end);
            let level_data = &mut front[level_range.clone()];

            if i > 0 {
                // Hash the previous level, which sits right after this one.
                let prev_range = &level_offsets[i - 1];
                let prev_data = &back[..prev_range.end - prev_range.start];

                self.hash_partial_level(prev_data, level_data, cancel_signal)?;
            } else if let Some(r) = ranges {
                let block_ranges = self.blocks_for_ranges(data.len() as u64, r)?;

                self.hash_partial_level_parallel(data, &block_ranges, level_data, cancel_signal)?;
            } else {
                self.hash_one_level_parallel(data, level_data, cancel_signal)?;
            }
        }

        let mut context = self.salted_context.clone();
        context.update(&hash_tree_data[root_level.clone()]);

        Ok(context.finish().as_ref().to_vec())
    }

    fn check_tree_size(&self, image_size: u64, hash_tree_data: &[u8]) -> Result<Vec<Range<usize>>> {
        let offsets = self.compute_level_offsets(image_size)?;
        let expected = offsets.first().map(|r| r.end).unwrap_or(0);

        if hash_tree_data.len() != expected {
            return Err(Error::InvalidHashTreeSize {
                input: image_size,
                expected,
                actual: hash_tree_data.len(),
            });
        }

        Ok(offsets)
    }

    /// Generate hash tree data for the input. Returns the root digest and the
    /// hash tree data.
    pub fn generate(&self, data: &[u8], cancel_signal: &AtomicBool) -> Result<(Vec<u8>, Vec<u8>)> {
        let offsets = self.compute_level_offsets(data.len() as u64)?;
        let hash_tree_size = offsets.first().map(|r| r.end).unwrap_or(0);
        let mut hash_tree_data = vec![0u8; hash_tree_size];

        let root_digest =
            self.calculate(data, None, &offsets, &mut hash_tree_data, cancel_signal)?;

        Ok((root_digest, hash_tree_data))
    }

    /// Update hash tree data corresponding to the specified byte ranges of the
    /// input. Returns the new root digest.
    pub fn update(
        &self,
        data: &[u8],
        ranges: &[Range<u64>],
        hash_tree_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> Result<Vec<u8>> {
        let offsets = self.check_tree_size(data.len() as u64, hash_tree_data)?;

        self.calculate(data, Some(ranges), &offsets, hash_tree_data, cancel_signal)
    }

    /// Verify that the input matches the root digest and hash tree.
    pub fn verify(
        &self,
        data: &[u8],
        root_digest: &[u8],
        hash_tree_data: &[u8],
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        self.check_tree_size(data.len() as u64, hash_tree_data)?;

        let (actual_root_digest, actual_hash_tree_data) = self.generate(data, cancel_signal)?;

        if root_digest != actual_root_digest {
            return Err(Error::InvalidRootDigest {
                expected: hex::encode(root_digest),
                actual: hex::encode(&actual_root_digest),
            });
        }

        if hash_tree_data != actual_hash_tree_data {
            // These are multiple megabytes, so only report the hashes.
            let algorithm = self.salted_context.algorithm();
            let expected = ring::digest::digest(algorithm, hash_tree_data);
            let actual = ring::digest::digest(algorithm, &actual_hash_tree_data);

            return Err(Error::InvalidHashTree {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn calculate_level_ranges() {
        let hash_tree = HashTree::new(4096, &ring::digest::SHA256, &[]);
        assert_eq!(
            hash_tree.compute_level_offsets(0).unwrap(),
            &[] as &[Range<usize>],
        );
        assert_eq!(
            hash_tree.compute_level_offsets(1024 * 1024 * 1024).unwrap(),
            &[69632..8458240, 4096..69632, 0..4096],
        );
        assert_eq!(hash_tree.tree_size(4096).unwrap(), 0);
        assert_eq!(hash_tree.tree_size(4097).unwrap(), 4096);
    }

    #[test]
    fn blocks_for_ranges() {
        let hash_tree = HashTree::new(4096, &ring::digest::SHA256, b"Salt");
        assert_eq!(
            hash_tree.blocks_for_ranges(16384, &[0..16384]).unwrap(),
            &[0..4],
        );
        assert_eq!(hash_tree.blocks_for_ranges(16384, &[0..0]).unwrap(), &[]);
        assert_eq!(
            hash_tree
                .blocks_for_ranges(16384, &[12287..12289, 0..1, 5000..5001])
                .unwrap(),
            &[0..4],
        );
        assert_matches!(
            hash_tree.blocks_for_ranges(16384, &[0..16385]),
            Err(Error::FieldOutOfBounds(_))
        );
    }

    #[test]
    fn generate_update_verify() {
        let cancel_signal = AtomicBool::new(false);
        let hash_tree = HashTree::new(64, &ring::digest::SHA256, b"Salt");

        // Input smaller than one block is hashed directly.
        let (root_digest, hash_tree_data) = hash_tree.generate(&[], &cancel_signal).unwrap();
        assert_eq!(
            root_digest,
            &[
                0x15, 0x0f, 0xe5, 0x51, 0x40, 0x30, 0xb1, 0x43, 0x4a, 0x5d, 0xea, 0xf4, 0x91, 0xec,
                0xe9, 0x2c, 0x0e, 0x64, 0x97, 0x44, 0x7d, 0x6d, 0xe7, 0xbd, 0x6b, 0xa8, 0x5e, 0x8c,
                0xae, 0x1e, 0x00, 0xa3
            ],
        );
        assert_eq!(hash_tree_data, &[]);

        let mut input = b"Data".repeat(25);

        let (root_digest, mut hash_tree_data) = hash_tree.generate(&input, &cancel_signal).unwrap();
        assert_eq!(
            root_digest,
            &[
                0x92, 0xc3, 0xd7, 0x4a, 0x64, 0x03, 0x4b, 0xcc, 0xa9, 0x9a, 0x44, 0xf6, 0x81, 0xa2,
                0x4d, 0xdd, 0x97, 0xd3, 0xda, 0x84, 0xdc, 0xe2, 0x1b, 0x83, 0xd1, 0x7b, 0xab, 0x60,
                0x59, 0xe8, 0x45, 0x59
            ],
        );
        assert_eq!(hash_tree_data.len(), 64);

        input[..7].copy_from_slice(b"Changed");

        let root_digest = hash_tree
            .update(&input, &[0..7], &mut hash_tree_data, &cancel_signal)
            .unwrap();
        assert_eq!(
            root_digest,
            &[
                0x8d, 0x03, 0xad, 0x18, 0xf2, 0x53, 0x13, 0x59, 0xf5, 0xbf, 0x68, 0x0e, 0x0c, 0x4a,
                0x86, 0xe2, 0x6e, 0xaa, 0x3d, 0x4b, 0x0f, 0x1b, 0x57, 0xad, 0x92, 0xe7, 0xbf, 0x3e,
                0xa6, 0xb1, 0x2e, 0xcc
            ],
        );

        // Partial update must match a full rebuild.
        let (new_root_digest, new_hash_tree_data) =
            hash_tree.generate(&input, &cancel_signal).unwrap();
        assert_eq!(new_root_digest, root_digest);
        assert_eq!(new_hash_tree_data, hash_tree_data);

        hash_tree
            .verify(&input, &root_digest, &hash_tree_data, &cancel_signal)
            .unwrap();

        input[..3].copy_from_slice(b"Bad");

        assert_matches!(
            hash_tree.verify(&input, &root_digest, &hash_tree_data, &cancel_signal),
            Err(Error::InvalidRootDigest { .. })
        );
    }

    #[test]
    fn wrong_tree_size() {
        let cancel_signal = AtomicBool::new(false);
        let hash_tree = HashTree::new(64, &ring::digest::SHA256, b"");
        let mut tree = vec![0u8; 3];

        assert_matches!(
            hash_tree.update(&[0u8; 128], &[0..1], &mut tree, &cancel_signal),
            Err(Error::InvalidHashTreeSize { expected: 64, .. })
        );
    }
}
