// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::util;

/// A cursor over a borrowed byte slice for decoding binary structures without
/// copying the payloads. All reads are bounds checked and fail with
/// [`io::ErrorKind::UnexpectedEof`] when the input is too short.
#[derive(Clone, Copy, Debug)]
pub struct SliceReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current offset from the start of the underlying slice.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    pub fn is_empty(&self) -> bool {
        self.offset == self.data.len()
    }

    pub fn seek(&mut self, offset: usize) -> io::Result<()> {
        if offset > self.data.len() {
            return Err(eof(offset, 0, self.data.len()));
        }

        self.offset = offset;
        Ok(())
    }

    /// Borrow the next `size` bytes and advance past them.
    pub fn read_slice(&mut self, size: usize) -> io::Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(size)
            .filter(|e| *e <= self.data.len())
            .ok_or_else(|| eof(self.offset, size, self.data.len()))?;

        let result = &self.data[self.offset..end];
        self.offset = end;

        Ok(result)
    }

    pub fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_slice(N)?);
        Ok(buf)
    }

    /// Read a plain-old-data structure. The type must not have alignment
    /// requirements, which is the case for all of the on-disk structures.
    pub fn read_obj<T: FromBytes + KnownLayout + Immutable>(&mut self) -> io::Result<T> {
        let slice = self.read_slice(size_of::<T>())?;

        T::read_from_bytes(slice).map_err(|_| eof(self.offset, size_of::<T>(), self.data.len()))
    }

    /// Skip to the next multiple of `alignment` relative to the start of the
    /// slice, returning the skipped bytes.
    pub fn read_padding(&mut self, alignment: usize) -> io::Result<&'a [u8]> {
        let padding = crate::format::padding::calc(self.offset, alignment);
        self.read_slice(padding)
    }

    /// Like [`Self::read_padding`], but fails if the padding contains non-zero
    /// bytes. Decoders use this to reject inputs that would not survive an
    /// encode round trip unchanged.
    pub fn read_zero_padding(&mut self, alignment: usize) -> io::Result<()> {
        let padding = self.read_padding(alignment)?;
        if !util::is_zero(padding) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Padding before offset {} is not zero", self.offset),
            ));
        }

        Ok(())
    }
}

fn eof(offset: usize, needed: usize, available: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("Needed {needed} bytes at offset {offset}, but input is {available} bytes"),
    )
}

/// Extensions for writers to easily write zeros (eg. for padding).
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to write {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        // We don't use std::io::copy() on std::io::repeat(0) because it fails
        // if the writer hits EOF before all data is written.
        let mut written = 0;

        while written < size {
            let to_write = (size - written).min(util::ZEROS.len() as u64) as usize;
            let n = self.write(&util::ZEROS[..to_write])?;
            written += n as u64;

            if n < to_write {
                break;
            }
        }

        Ok(written)
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicBool, Ordering},
    };

    use zerocopy::big_endian::U32;

    use super::*;

    #[test]
    fn slice_reader_bounds() {
        let data = b"\x00\x00\x00\x2afoobar\x00\x00";
        let mut reader = SliceReader::new(data);

        assert_eq!(reader.read_obj::<U32>().unwrap().get(), 42);
        assert_eq!(reader.read_slice(6).unwrap(), b"foobar");
        assert_eq!(reader.offset(), 10);

        let err = reader.read_slice(3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(reader.offset(), 10);

        reader.read_zero_padding(4).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn slice_reader_nonzero_padding() {
        let mut reader = SliceReader::new(b"a\x00\x01\x00");
        reader.read_slice(1).unwrap();

        let err = reader.read_zero_padding(4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn write_zeros() {
        let mut buf = Vec::new();
        buf.write_zeros_exact(20000).unwrap();
        assert_eq!(buf.len(), 20000);
        assert!(util::is_zero(&buf));

        let mut small = [1u8; 4];
        let mut writer = small.as_mut_slice();
        assert_eq!(writer.write_zeros(8).unwrap(), 4);
        assert_eq!(small, [0u8; 4]);
    }

    #[test]
    fn cancel() {
        let signal = AtomicBool::new(false);
        check_cancel(&signal).unwrap();

        signal.store(true, Ordering::SeqCst);
        let err = check_cancel(&signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
