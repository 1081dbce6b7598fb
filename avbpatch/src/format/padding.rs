// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a page boundary.
pub fn calc<N: PrimInt>(offset: N, page_size: N) -> N {
    let r = offset % page_size;
    if r == N::zero() {
        N::zero()
    } else {
        page_size - r
    }
}

/// Round to the next multiple of the page size.
pub fn round<N: PrimInt>(offset: N, page_size: N) -> Option<N> {
    let remain = calc(offset, page_size);
    offset.checked_add(&remain)
}

/// Append zeros to the buffer until its length is a multiple of the page size.
/// Returns the number of bytes added.
pub fn pad_vec(buf: &mut Vec<u8>, page_size: usize) -> usize {
    let padding = calc(buf.len(), page_size);
    buf.resize(buf.len() + padding, 0);
    padding
}

pub trait ZeroPadding {
    /// Trim trailing zeros. Intermediate zeros before the last non-zero byte
    /// are kept.
    fn trim_end_padding(&self) -> &[u8];

    /// Return the slice as an array padded with zeros at the end.
    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]>;
}

impl ZeroPadding for [u8] {
    fn trim_end_padding(&self) -> &[u8] {
        let first_ending_zero = self
            .iter()
            .rposition(|b| *b != 0)
            .map(|pos| pos + 1)
            .unwrap_or_default();

        &self[..first_ending_zero]
    }

    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]> {
        if self.len() > N {
            return None;
        }

        let mut result = [0u8; N];
        result[..self.len()].copy_from_slice(self);

        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(calc(0u64, 4096), 0);
        assert_eq!(calc(1u64, 4096), 4095);
        assert_eq!(calc(4096u64, 4096), 0);
        assert_eq!(round(4097u64, 4096), Some(8192));
        assert_eq!(round(u64::MAX, 4096), None);
    }

    #[test]
    fn vec_padding() {
        let mut buf = vec![1u8; 5];
        assert_eq!(pad_vec(&mut buf, 8), 3);
        assert_eq!(buf, [1, 1, 1, 1, 1, 0, 0, 0]);
        assert_eq!(pad_vec(&mut buf, 8), 0);
    }

    #[test]
    fn zero_padding() {
        assert_eq!(b"abc\0\0".trim_end_padding(), b"abc");
        assert_eq!(b"a\0c\0".trim_end_padding(), b"a\0c");
        assert_eq!(b"ab".to_padded_array::<4>(), Some(*b"ab\0\0"));
        assert_eq!(b"abcde".to_padded_array::<4>(), None);
    }
}
