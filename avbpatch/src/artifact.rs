// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{Cursor, Read, Write},
};

use thiserror::Error;
use tracing::trace;
use zip::{
    CompressionMethod, DateTime, ZipArchive, ZipWriter, result::ZipError, write::SimpleFileOptions,
};

use crate::util::NumBytes;

const IMAGE_EXTENSION: &str = ".img";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Duplicate image in artifact: {0:?}")]
    DuplicateImage(String),
    #[error("Artifact entry is not a partition image: {0:?}")]
    InvalidEntryName(String),
    #[error("Failed to read artifact")]
    ZipRead(#[source] ZipError),
    #[error("Failed to write artifact")]
    ZipWrite(#[source] ZipError),
    #[error("Failed to read {0:?} from artifact")]
    EntryRead(String, #[source] std::io::Error),
    #[error("Failed to write {0:?} to artifact")]
    EntryWrite(String, #[source] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Partition images keyed by partition name, in insertion order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ImageSet {
    images: Vec<(String, Vec<u8>)>,
}

impl fmt::Debug for ImageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.images.iter().map(|(n, d)| (n, NumBytes(d.len()))))
            .finish()
    }
}

impl ImageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an image. Replacing keeps the original position.
    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        if let Some((_, d)) = self.images.iter_mut().find(|(n, _)| n == name) {
            *d = data;
        } else {
            self.images.push((name.to_owned(), data));
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.images
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.images.iter().map(|(n, d)| (n.as_str(), d.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Serialize the images as a zip with one stored `<name>.img` entry per
    /// image. Timestamps are fixed, so the output only depends on the names
    /// and contents.
    pub fn to_artifact(&self) -> Result<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        for (name, data) in &self.images {
            let options = SimpleFileOptions::default()
                .last_modified_time(DateTime::default())
                .compression_method(CompressionMethod::Stored)
                .unix_permissions(0o644)
                .large_file(data.len() as u64 >= u64::from(u32::MAX));
            let entry_name = format!("{name}{IMAGE_EXTENSION}");

            writer
                .start_file(entry_name.as_str(), options)
                .map_err(Error::ZipWrite)?;
            writer
                .write_all(data)
                .map_err(|e| Error::EntryWrite(entry_name, e))?;
        }

        let raw_writer = writer.finish().map_err(Error::ZipWrite)?;
        let artifact = raw_writer.into_inner();

        trace!("Wrote {:?} artifact", NumBytes(artifact.len()));

        Ok(artifact)
    }

    /// Parse an artifact produced by [`Self::to_artifact`].
    pub fn from_artifact(data: &[u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(data)).map_err(Error::ZipRead)?;
        let mut result = Self::new();

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(Error::ZipRead)?;
            let entry_name = entry.name().to_owned();

            let Some(name) = entry_name.strip_suffix(IMAGE_EXTENSION) else {
                return Err(Error::InvalidEntryName(entry_name));
            };
            if result.get(name).is_some() {
                return Err(Error::DuplicateImage(name.to_owned()));
            }

            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| Error::EntryRead(entry_name.clone(), e))?;

            result.insert(name, buf);
        }

        Ok(result)
    }
}

impl FromIterator<(String, Vec<u8>)> for ImageSet {
    fn from_iter<T: IntoIterator<Item = (String, Vec<u8>)>>(iter: T) -> Self {
        let mut result = Self::new();
        for (name, data) in iter {
            result.insert(&name, data);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_is_deterministic() {
        let mut images = ImageSet::new();
        images.insert("boot", b"boot data".to_vec());
        images.insert("vbmeta", b"vbmeta data".to_vec());
        images.insert("boot", b"new boot data".to_vec());

        let first = images.to_artifact().unwrap();
        let second = images.clone().to_artifact().unwrap();
        assert_eq!(first, second);

        let parsed = ImageSet::from_artifact(&first).unwrap();
        assert_eq!(parsed, images);
        assert_eq!(
            parsed.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            ["boot", "vbmeta"],
        );
    }
}
