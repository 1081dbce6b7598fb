// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{io::Cursor, ops::Range, sync::atomic::AtomicBool};

use memchr::memmem;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use thiserror::Error;
use tracing::debug;
use x509_cert::Certificate;
use zip::ZipArchive;

use crate::{
    format::verity::{self, DmVerityImage},
    patch::otacert::{self, ZIP_EOCD_MAGIC, ZIP_EOCD_SIZE},
    stream::{self, SliceReader},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Old otacerts.zip not found in image")]
    OldZipNotFound,
    #[error("dm-verity error")]
    Verity(#[from] verity::Error),
    #[error("OTA certificate error")]
    OtaCert(#[from] otacert::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_size_constraint(&self) -> bool {
        match self {
            Self::Verity(e) => e.is_size_constraint(),
            Self::OtaCert(otacert::Error::ZipTooLarge(_) | otacert::Error::ZipTooSmall(_)) => true,
            _ => false,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Read the central directory size, central directory offset, and comment
/// size from a zip EOCD record.
fn read_eocd_fields(eocd: &[u8]) -> Option<(usize, usize, usize)> {
    let mut reader = SliceReader::new(eocd);
    reader.seek(12).ok()?;

    let cd_size = u32::from_le_bytes(reader.read_array().ok()?);
    let cd_offset = u32::from_le_bytes(reader.read_array().ok()?);
    let comment_size = u16::from_le_bytes(reader.read_array().ok()?);

    Some((cd_size as usize, cd_offset as usize, usize::from(comment_size)))
}

/// Find the bounds of a non-zip64 zip starting from the EOCD magic offset.
/// Only zips that look like `otacerts.zip` files are reported.
fn find_zip_bounds(data: &[u8], eocd_offset: usize) -> Option<Range<usize>> {
    let eocd = &data[eocd_offset..];
    if eocd.len() < ZIP_EOCD_SIZE {
        return None;
    }

    let (cd_size, cd_offset, comment_size) = read_eocd_fields(eocd)?;

    let start = eocd_offset.checked_sub(cd_size)?.checked_sub(cd_offset)?;
    let end = eocd_offset
        .checked_add(ZIP_EOCD_SIZE)?
        .checked_add(comment_size)?;
    if end > data.len() {
        return None;
    }

    let mut zip_reader = ZipArchive::new(Cursor::new(&data[start..end])).ok()?;

    if zip_reader.is_empty() {
        // otacerts.zip files contain at least one cert.
        return None;
    }

    for index in 0..zip_reader.len() {
        let entry = zip_reader.by_index_raw(index).ok()?;

        if !entry.name().ends_with(".x509.pem") {
            // otacerts.zip files only contain files named this way.
            return None;
        }
    }

    // There's one or more entries and every one is named *.x509.pem.
    Some(start..end)
}

/// Find every `otacerts.zip` embedded in `data`. The returned ranges are
/// sorted and never overlap.
pub fn find_otacerts(data: &[u8], cancel_signal: &AtomicBool) -> Result<Vec<Range<usize>>> {
    let eocd_offsets = memmem::find_iter(data, ZIP_EOCD_MAGIC).collect::<Vec<_>>();

    let mut candidates = eocd_offsets
        .par_iter()
        .map(|offset| -> Result<Option<Range<usize>>> {
            stream::check_cancel(cancel_signal)?;
            Ok(find_zip_bounds(data, *offset))
        })
        .filter_map(|r| r.transpose())
        .collect::<Result<Vec<_>>>()?;

    candidates.sort_by_key(|r| r.start);

    let mut result: Vec<Range<usize>> = vec![];
    for range in candidates {
        if result.last().is_some_and(|last| range.start < last.end) {
            debug!("Skipping overlapping zip at {range:?}");
            continue;
        }

        result.push(range);
    }

    Ok(result)
}

/// Replace every `otacerts.zip` in the dm-verity data region with a new one
/// containing the new certificate, but padded to the same size. If the new zip
/// is too large, the certificate will be modified to remove unnecessary
/// components until it fits. The hash tree and root digest are updated to
/// match. The header is not signed.
///
/// If [`Error::OldZipNotFound`] is returned, the image will not have been
/// modified.
pub fn patch_system_image(
    image: &mut DmVerityImage,
    certificate: &Certificate,
    cancel_signal: &AtomicBool,
) -> Result<Vec<Range<u64>>> {
    let bounds = find_otacerts(image.data(), cancel_signal)?;
    if bounds.is_empty() {
        return Err(Error::OldZipNotFound);
    }

    let replacements = bounds
        .par_iter()
        .map(|range| -> Result<(Range<u64>, Vec<u8>)> {
            stream::check_cancel(cancel_signal)?;

            let new_zip = otacert::create_zip_with_size(certificate, range.end - range.start)?;

            Ok((range.start as u64..range.end as u64, new_zip))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut modified_ranges = vec![];

    for (range, new_zip) in replacements {
        debug!("Replacing otacerts.zip at {range:?}");

        image.replace_data(range.clone(), &new_zip)?;
        modified_ranges.push(range);
    }

    image.update_root(cancel_signal)?;

    Ok(modified_ranges)
}
