// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::debug;

use crate::format::avb::{self, AppendedDescriptorRef, Descriptor, Header};

#[derive(Debug, Error)]
pub enum Error {
    #[error("AVB is disabled by header flags: {0:#x}")]
    AvbDisabled(u32),
    #[error("{0:?} is not protected by any descriptor")]
    NotProtected(String),
    #[error("{0:?} is protected by {1} descriptors")]
    ProtectedMultipleTimes(String, usize),
    #[error("{0:?} is signed, but is covered by a {1} descriptor instead of a chain descriptor")]
    ChainRequired(String, &'static str),
    #[error("{0:?} is unsigned, but is covered by a {1} descriptor")]
    DigestRequired(String, &'static str),
    #[error("AVB error")]
    Avb(#[from] avb::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The final state of a partition covered by a vbmeta header.
#[derive(Clone, Copy, Debug)]
pub enum DependencyInfo<'a> {
    /// The partition carries its own signature and is chained to with the
    /// public key that signed it.
    Signed(&'a RsaPublicKey),
    /// The partition's contents are attested to directly by its hash or hash
    /// tree descriptor.
    Unsigned(AppendedDescriptorRef<'a>),
}

/// Refuse to operate on headers where AVB has been disabled, since the
/// bootloader would never check the result.
pub fn ensure_avb_enabled(header: &Header) -> Result<()> {
    if header.flags != 0 {
        return Err(Error::AvbDisabled(header.flags));
    }

    Ok(())
}

/// Ensure that every partition in `names` is covered by exactly one hash, hash
/// tree, or chain partition descriptor.
pub fn ensure_partitions_protected<'a>(
    header: &Header,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let mut counts = HashMap::<&str, usize>::new();

    for descriptor in &header.descriptors {
        if let Some(name) = descriptor.partition_name() {
            *counts.entry(name).or_default() += 1;
        }
    }

    for name in names {
        match counts.get(name).copied().unwrap_or_default() {
            0 => return Err(Error::NotProtected(name.to_owned())),
            1 => {}
            n => return Err(Error::ProtectedMultipleTimes(name.to_owned(), n)),
        }
    }

    Ok(())
}

/// Rebuild the descriptors of a vbmeta header from the final state of the
/// partitions it covers. Chain descriptors get the new public key. Hash and
/// hash tree descriptors are replaced by the dependency's own descriptor.
/// Descriptors for other partitions are left untouched. The header is not
/// signed.
pub fn update_descriptors(header: &mut Header, deps: &[(&str, DependencyInfo)]) -> Result<()> {
    ensure_avb_enabled(header)?;
    ensure_partitions_protected(header, deps.iter().map(|(n, _)| *n))?;

    for (name, info) in deps {
        let Some(descriptor) = header
            .descriptors
            .iter_mut()
            .find(|d| d.partition_name() == Some(*name))
        else {
            return Err(Error::NotProtected((*name).to_owned()));
        };

        match (descriptor, info) {
            (Descriptor::ChainPartition(d), DependencyInfo::Signed(key)) => {
                d.public_key = avb::encode_public_key(key)?;
                debug!("Updated chain descriptor for {name:?}");
            }
            (d, DependencyInfo::Signed(_)) => {
                return Err(Error::ChainRequired((*name).to_owned(), d.type_name()));
            }
            (d, DependencyInfo::Unsigned(new))
                if matches!(d, Descriptor::Hash(_) | Descriptor::HashTree(_)) =>
            {
                *d = match new {
                    AppendedDescriptorRef::Hash(h) => Descriptor::Hash((*h).clone()),
                    AppendedDescriptorRef::HashTree(h) => Descriptor::HashTree((*h).clone()),
                };
                debug!("Copied {} descriptor for {name:?}", d.type_name());
            }
            (d, DependencyInfo::Unsigned(_)) => {
                return Err(Error::DigestRequired((*name).to_owned(), d.type_name()));
            }
        }
    }

    Ok(())
}
