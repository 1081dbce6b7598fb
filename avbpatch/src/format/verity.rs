// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, ops::Range, sync::atomic::AtomicBool};

use num_traits::ToPrimitive;
use thiserror::Error;
use tracing::debug;

use crate::{
    format::avb::{self, AppendedDescriptorMut, AppendedDescriptorRef, Footer, Header},
    util::{self, NumBytes},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image has no AVB footer")]
    MissingFooter,
    #[error("Image has no hash tree descriptor")]
    MissingHashTreeDescriptor,
    #[error("Range {range:?} is outside of the {size} byte data region")]
    RangeOutOfBounds { range: Range<u64>, size: u64 },
    #[error("Replacing range {range:?} with {new_len} bytes would change the data region size")]
    SizeChanged { range: Range<u64>, new_len: usize },
    #[error("Patched image does not fit in the original {0} byte partition")]
    PartitionTooSmall(u64, #[source] avb::Error),
    #[error("AVB error")]
    Avb(#[from] avb::Error),
}

impl Error {
    /// Whether the error is caused by data that no longer fits where it needs
    /// to go, as opposed to malformed input.
    pub fn is_size_constraint(&self) -> bool {
        matches!(self, Self::SizeChanged { .. } | Self::PartitionTooSmall(..))
    }
}

type Result<T> = std::result::Result<T, Error>;

/// An appended AVB image whose data region is protected by a dm-verity hash
/// tree stored immediately after the data.
#[derive(Clone)]
pub struct DmVerityImage {
    data: Vec<u8>,
    tree: Vec<u8>,
    header: Header,
    footer: Footer,
    partition_size: u64,
    dirty: Vec<Range<u64>>,
}

impl fmt::Debug for DmVerityImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmVerityImage")
            .field("data", &NumBytes(self.data.len()))
            .field("tree", &NumBytes(self.tree.len()))
            .field("header", &self.header)
            .field("footer", &self.footer)
            .field("partition_size", &self.partition_size)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl DmVerityImage {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (header, footer) = avb::load_image(data)?;
        let footer = footer.ok_or(Error::MissingFooter)?;

        let descriptor = match header.appended_descriptor() {
            Ok(AppendedDescriptorRef::HashTree(d)) => d,
            Ok(AppendedDescriptorRef::Hash(_)) | Err(avb::Error::NoAppendedDescriptor) => {
                return Err(Error::MissingHashTreeDescriptor);
            }
            Err(e) => return Err(e.into()),
        };

        if descriptor.tree_offset != descriptor.image_size {
            return Err(avb::Error::HashTreeGap.into());
        } else if descriptor.fec_num_roots != 0 || descriptor.fec_size != 0 {
            return Err(avb::Error::FecUnsupported.into());
        }

        let data_range = 0..descriptor.image_size;
        let tree_range = descriptor.tree_offset
            ..descriptor
                .tree_offset
                .checked_add(descriptor.tree_size)
                .ok_or(avb::Error::FieldOutOfBounds("tree_size"))?;

        let image_data = slice_range(data, &data_range, "image_size")?;
        let tree_data = slice_range(data, &tree_range, "tree_size")?;

        debug!(
            "Loaded dm-verity image: data={:?}, tree={:?}, partition={:?}",
            NumBytes(image_data.len()),
            NumBytes(tree_data.len()),
            NumBytes(data.len()),
        );

        Ok(Self {
            data: image_data.to_vec(),
            tree: tree_data.to_vec(),
            header,
            footer,
            partition_size: data.len() as u64,
            dirty: vec![],
        })
    }

    /// The dm-verity protected data region.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn tree(&self) -> &[u8] {
        &self.tree
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    /// Overwrite `range` of the data region with `new`. The data region size
    /// never changes.
    pub fn replace_data(&mut self, range: Range<u64>, new: &[u8]) -> Result<()> {
        let size = self.data.len() as u64;
        if range.start > range.end || range.end > size {
            return Err(Error::RangeOutOfBounds { range, size });
        } else if range.end - range.start != new.len() as u64 {
            return Err(Error::SizeChanged {
                range,
                new_len: new.len(),
            });
        }

        // Cannot fail because the range is within the in-memory data.
        let start = range.start as usize;
        self.data[start..start + new.len()].copy_from_slice(new);
        self.dirty.push(range);

        Ok(())
    }

    /// Recompute the hash tree blocks covering every range modified since the
    /// last call and update the root digest.
    pub fn update_root(&mut self, cancel_signal: &AtomicBool) -> Result<()> {
        let ranges = util::merge_overlapping(&self.dirty);

        let AppendedDescriptorMut::HashTree(descriptor) = self.header.appended_descriptor_mut()?
        else {
            return Err(Error::MissingHashTreeDescriptor);
        };

        debug!("Updating hash tree for ranges: {ranges:?}");
        descriptor.update(&self.data, &mut self.tree, &ranges, cancel_signal)?;

        self.dirty.clear();

        Ok(())
    }

    /// Check the hash tree and root digest against the data region.
    pub fn verify(&self, cancel_signal: &AtomicBool) -> Result<()> {
        let AppendedDescriptorRef::HashTree(descriptor) = self.header.appended_descriptor()? else {
            return Err(Error::MissingHashTreeDescriptor);
        };

        descriptor.verify(&self.data, &self.tree, cancel_signal)?;

        Ok(())
    }

    /// Write the image back out at exactly the original partition size.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut logical = Vec::with_capacity(self.data.len() + self.tree.len());
        logical.extend_from_slice(&self.data);
        logical.extend_from_slice(&self.tree);

        let mut footer = self.footer.clone();

        avb::write_footer(&logical, &self.header, &mut footer, Some(self.partition_size)).map_err(
            |e| match e {
                avb::Error::TooSmallForHeader(_) | avb::Error::TooSmallForFooter(_) => {
                    Error::PartitionTooSmall(self.partition_size, e)
                }
                e => e.into(),
            },
        )
    }
}

fn slice_range<'a>(data: &'a [u8], range: &Range<u64>, field: &'static str) -> Result<&'a [u8]> {
    range
        .start
        .to_usize()
        .zip(range.end.to_usize())
        .and_then(|(start, end)| data.get(start..end))
        .ok_or_else(|| avb::Error::FieldOutOfBounds(field).into())
}
