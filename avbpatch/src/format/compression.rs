// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use lz4_flex::frame::FrameDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static GZIP_MAGIC: &[u8; 2] = b"\x1f\x8b";
static LZ4_LEGACY_MAGIC: &[u8; 4] = b"\x02\x21\x4c\x18";

/// Legacy LZ4 frames always use the maximum block size.
const LZ4_LEGACY_BLOCK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown compression format")]
    UnknownFormat,
    #[error("Failed to decompress {0:?} data")]
    Decompress(CompressedFormat, #[source] io::Error),
    #[error("Failed to compress {0:?} data")]
    Compress(CompressedFormat, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Writer for the legacy LZ4 framing used by Linux kernels. Each block is
/// prefixed by its little-endian compressed size.
pub struct Lz4LegacyEncoder<W: Write> {
    writer: W,
    buf: Vec<u8>,
}

impl<W: Write> Lz4LegacyEncoder<W> {
    pub fn new(mut writer: W) -> io::Result<Self> {
        writer.write_all(LZ4_LEGACY_MAGIC)?;

        Ok(Self {
            writer,
            buf: Vec::new(),
        })
    }

    fn write_block(&mut self) -> io::Result<()> {
        // HC is currently not supported:
        // https://github.com/PSeitz/lz4_flex/issues/21
        let compressed = lz4_flex::block::compress(&self.buf);

        self.writer
            .write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.writer.write_all(&compressed)?;

        self.buf.clear();

        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        if !self.buf.is_empty() {
            self.write_block()?;
        }

        Ok(self.writer)
    }
}

impl<W: Write> Write for Lz4LegacyEncoder<W> {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let total = buf.len();

        while !buf.is_empty() {
            let to_write = buf.len().min(LZ4_LEGACY_BLOCK_SIZE - self.buf.len());
            self.buf.extend_from_slice(&buf[..to_write]);

            if self.buf.len() == LZ4_LEGACY_BLOCK_SIZE {
                self.write_block()?;
            }

            buf = &buf[to_write..];
        }

        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum CompressedFormat {
    None,
    Gzip,
    Lz4Legacy,
}

impl CompressedFormat {
    /// Detect the format from the magic bytes. Data with an unknown magic is
    /// treated as uncompressed if `raw_if_unknown` is set.
    pub fn detect(data: &[u8], raw_if_unknown: bool) -> Result<Self> {
        if data.starts_with(GZIP_MAGIC) {
            Ok(Self::Gzip)
        } else if data.starts_with(LZ4_LEGACY_MAGIC) {
            Ok(Self::Lz4Legacy)
        } else if raw_if_unknown {
            Ok(Self::None)
        } else {
            Err(Error::UnknownFormat)
        }
    }
}

/// Decompress data, autodetecting the format.
pub fn decompress(data: &[u8], raw_if_unknown: bool) -> Result<(CompressedFormat, Vec<u8>)> {
    let format = CompressedFormat::detect(data, raw_if_unknown)?;
    let mut result = Vec::new();

    let ret = match format {
        CompressedFormat::None => {
            result.extend_from_slice(data);
            Ok(0)
        }
        CompressedFormat::Gzip => GzDecoder::new(data).read_to_end(&mut result),
        CompressedFormat::Lz4Legacy => FrameDecoder::new(data).read_to_end(&mut result),
    };
    ret.map_err(|e| Error::Decompress(format, e))?;

    Ok((format, result))
}

pub fn compress(format: CompressedFormat, data: &[u8]) -> Result<Vec<u8>> {
    let ret = match format {
        CompressedFormat::None => Ok(data.to_vec()),
        CompressedFormat::Gzip => {
            let mut writer = GzEncoder::new(Vec::new(), Compression::default());
            writer.write_all(data).and_then(|_| writer.finish())
        }
        CompressedFormat::Lz4Legacy => Lz4LegacyEncoder::new(Vec::new()).and_then(|mut w| {
            w.write_all(data)?;
            w.finish()
        }),
    };

    ret.map_err(|e| Error::Compress(format, e))
}
