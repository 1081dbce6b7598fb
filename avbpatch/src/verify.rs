// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Checks performed on the output of a patch run: artifact digests, the AVB
//! chain of trust, and the embedded OTA certificates.

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::atomic::AtomicBool,
};

use num_traits::ToPrimitive;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use ring::digest::{Context, SHA256};
use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::{debug, warn};
use x509_cert::Certificate;

use crate::{
    artifact::ImageSet,
    error,
    format::{
        avb::{self, Descriptor, Footer, Header},
        verity::{self, DmVerityImage},
    },
    patch::{
        boot::{self, BootImageInfo, OtaCertPatcher},
        otacert,
        system,
    },
    profile::{PartitionKind, Profile, Sha256Hash},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image not found: {0:?}")]
    MissingImage(String),
    #[error("{0:?} is reachable through more than one path")]
    VisitedTwice(String),
    #[error("{0:?} is not reachable from any vbmeta root")]
    NotReachable(String),
    #[error("{0:?} is expected to be signed, but has an unsigned header")]
    NotSigned(String),
    #[error("{0:?} is signed by an untrusted key")]
    UntrustedKey(String),
    #[error("{0:?} is chained to with an untrusted key")]
    UntrustedChainKey(String),
    #[error("{0:?} has descriptors that do not match each other")]
    DescriptorMismatch(String),
    #[error("{0:?} is covered by a digest, but has no AVB footer")]
    MissingFooter(String),
    #[error("{partition:?} does not contain exactly the expected OTA certificate")]
    OtacertsMismatch { partition: String },
    #[error("AVB error in {partition:?}")]
    Avb {
        partition: String,
        #[source]
        source: avb::Error,
    },
    #[error("Failed to load boot image {partition:?}")]
    Boot {
        partition: String,
        #[source]
        source: boot::Error,
    },
    #[error("Failed to load dm-verity image {partition:?}")]
    Verity {
        partition: String,
        #[source]
        source: verity::Error,
    },
    #[error("Failed to search {partition:?} for otacerts.zip")]
    System {
        partition: String,
        #[source]
        source: system::Error,
    },
    #[error("Failed to read otacerts.zip in {partition:?}")]
    OtaCert {
        partition: String,
        #[source]
        source: otacert::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Compute the SHA-256 digest of a complete artifact.
pub fn sha256(data: &[u8]) -> Sha256Hash {
    let mut context = Context::new(&SHA256);
    context.update(data);

    let mut result = [0u8; 32];
    result.copy_from_slice(context.finish().as_ref());

    Sha256Hash(result)
}

/// Compare a digest against its expected value. Both digests are included in
/// the error on mismatch.
pub fn check_digest(what: &str, expected: &Sha256Hash, actual: &Sha256Hash) -> error::Result<()> {
    if expected != actual {
        return Err(error::Error::Verification {
            what: what.to_owned(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(())
}

struct LoadedImage<'a> {
    data: &'a [u8],
    header: Header,
    footer: Option<Footer>,
}

fn load_images(images: &ImageSet) -> Result<HashMap<&str, LoadedImage<'_>>> {
    images
        .iter()
        .map(|(name, data)| {
            let (header, footer) = avb::load_image(data).map_err(|e| Error::Avb {
                partition: name.to_owned(),
                source: e,
            })?;

            Ok((
                name,
                LoadedImage {
                    data,
                    header,
                    footer,
                },
            ))
        })
        .collect()
}

fn verify_headers<'a>(
    loaded: &'a HashMap<&str, LoadedImage>,
    name: &str,
    expected_key: Option<&RsaPublicKey>,
    trusted_key: &RsaPublicKey,
    seen: &mut HashSet<String>,
    descriptors: &mut HashMap<String, &'a Descriptor>,
) -> Result<()> {
    if !seen.insert(name.to_owned()) {
        return Err(Error::VisitedTwice(name.to_owned()));
    }

    let image = loaded
        .get(name)
        .ok_or_else(|| Error::MissingImage(name.to_owned()))?;

    let public_key = image.header.verify().map_err(|e| Error::Avb {
        partition: name.to_owned(),
        source: e,
    })?;

    match (&public_key, expected_key) {
        (Some(k), Some(e)) if k != e => return Err(Error::UntrustedKey(name.to_owned())),
        (Some(k), None) if k != trusted_key => return Err(Error::UntrustedKey(name.to_owned())),
        (None, Some(_)) => return Err(Error::NotSigned(name.to_owned())),
        (Some(_), _) => debug!("{name} has a signed vbmeta header"),
        (None, None) => debug!("{name} has an unsigned vbmeta header"),
    }

    for descriptor in &image.header.descriptors {
        let Some(target_name) = descriptor.partition_name() else {
            continue;
        };

        match descriptor {
            Descriptor::HashTree(_) | Descriptor::Hash(_) => {
                if let Some(prev) = descriptors.get(target_name) {
                    if *prev != descriptor {
                        return Err(Error::DescriptorMismatch(target_name.to_owned()));
                    }
                } else {
                    descriptors.insert(target_name.to_owned(), descriptor);
                }

                if target_name != name && !seen.contains(target_name) {
                    verify_headers(loaded, target_name, None, trusted_key, seen, descriptors)?;
                }
            }
            Descriptor::ChainPartition(d) => {
                let target_key =
                    avb::decode_public_key(&d.public_key).map_err(|e| Error::Avb {
                        partition: target_name.to_owned(),
                        source: e,
                    })?;
                if target_key != *trusted_key {
                    return Err(Error::UntrustedChainKey(target_name.to_owned()));
                }

                verify_headers(
                    loaded,
                    target_name,
                    Some(&target_key),
                    trusted_key,
                    seen,
                    descriptors,
                )?;
            }
            _ => {}
        }
    }

    Ok(())
}

fn slice_range<'a>(
    data: &'a [u8],
    range: Range<u64>,
    name: &str,
    field: &'static str,
) -> Result<&'a [u8]> {
    range
        .start
        .to_usize()
        .zip(range.end.to_usize())
        .and_then(|(start, end)| data.get(start..end))
        .ok_or_else(|| Error::Avb {
            partition: name.to_owned(),
            source: avb::Error::FieldOutOfBounds(field),
        })
}

fn verify_descriptor(
    image: &LoadedImage,
    name: &str,
    descriptor: &Descriptor,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    if image.footer.is_none() {
        return Err(Error::MissingFooter(name.to_owned()));
    }

    let result = match descriptor {
        Descriptor::HashTree(d) => {
            debug!("Verifying hash tree descriptor for: {name}");

            let data = slice_range(image.data, 0..d.image_size, name, "image_size")?;
            let tree_end = d.tree_offset.checked_add(d.tree_size).unwrap_or(u64::MAX);
            let tree = slice_range(image.data, d.tree_offset..tree_end, name, "tree_size")?;

            d.verify(data, tree, cancel_signal)
        }
        Descriptor::Hash(d) => {
            debug!("Verifying hash descriptor for: {name}");

            let data = slice_range(image.data, 0..d.image_size, name, "image_size")?;

            d.verify(data)
        }
        _ => Ok(()),
    };

    result.map_err(|e| Error::Avb {
        partition: name.to_owned(),
        source: e,
    })
}

/// Verify the AVB chain of trust formed by `images`. Every image that is not
/// referenced by another image is a root and must be signed by `public_key`.
/// Chain descriptors are followed into the chained partition's header, which
/// must also be signed by `public_key`. Every hash and hash tree descriptor is
/// checked against the partition's data. Each image must be reached exactly
/// once.
pub fn verify_chain(
    images: &ImageSet,
    public_key: &RsaPublicKey,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let loaded = load_images(images)?;

    let mut referenced = HashSet::new();
    for (name, image) in &loaded {
        referenced.extend(
            image
                .header
                .descriptors
                .iter()
                .filter_map(|d| d.partition_name())
                .filter(|n| n != name),
        );
    }

    let roots = images
        .iter()
        .map(|(n, _)| n)
        .filter(|n| !referenced.contains(n))
        .collect::<Vec<_>>();
    debug!("vbmeta roots: {roots:?}");

    let mut seen = HashSet::new();
    let mut descriptors = HashMap::new();

    for root in roots {
        verify_headers(
            &loaded,
            root,
            Some(public_key),
            public_key,
            &mut seen,
            &mut descriptors,
        )?;
    }

    if let Some((name, _)) = images.iter().find(|(n, _)| !seen.contains(*n)) {
        return Err(Error::NotReachable(name.to_owned()));
    }

    descriptors
        .par_iter()
        .map(|(name, descriptor)| {
            let image = loaded
                .get(name.as_str())
                .ok_or_else(|| Error::MissingImage(name.clone()))?;

            verify_descriptor(image, name, descriptor, cancel_signal)
        })
        .collect()
}

fn check_certificates(
    partition: &str,
    certs: &[Certificate],
    expected: &Certificate,
) -> Result<()> {
    if certs.len() != 1 || certs[0] != *expected {
        return Err(Error::OtacertsMismatch {
            partition: partition.to_owned(),
        });
    }

    Ok(())
}

/// Check that every `otacerts.zip` that the profile declares contains exactly
/// the expected certificate.
pub fn verify_otacerts(
    images: &ImageSet,
    profile: &Profile,
    cert: &Certificate,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    for partition in profile.partitions() {
        let name = partition.name.as_str();

        match &partition.kind {
            PartitionKind::Boot {
                version, ramdisks, ..
            } => {
                let num_bundles = ramdisks.iter().filter(|t| t.carries_otacerts()).count();
                if num_bundles == 0 {
                    continue;
                }

                let data = images
                    .get(name)
                    .ok_or_else(|| Error::MissingImage(name.to_owned()))?;
                let map_err = |e| Error::Boot {
                    partition: name.to_owned(),
                    source: e,
                };

                let info = BootImageInfo::load(data, *version).map_err(map_err)?;
                let certs =
                    OtaCertPatcher::get_certificates(&info.boot_image, ramdisks, cancel_signal)
                        .map_err(map_err)?;

                // Each bundle must contribute exactly one certificate.
                if certs.len() != num_bundles || certs.iter().any(|c| c != cert) {
                    return Err(Error::OtacertsMismatch {
                        partition: name.to_owned(),
                    });
                }
            }
            PartitionKind::DmVerity { .. } => {
                let data = images
                    .get(name)
                    .ok_or_else(|| Error::MissingImage(name.to_owned()))?;
                let image = DmVerityImage::decode(data).map_err(|e| Error::Verity {
                    partition: name.to_owned(),
                    source: e,
                })?;

                let ranges =
                    system::find_otacerts(image.data(), cancel_signal).map_err(|e| {
                        Error::System {
                            partition: name.to_owned(),
                            source: e,
                        }
                    })?;
                if ranges.is_empty() {
                    warn!("No otacerts.zip found in {name}");
                    return Err(Error::OtacertsMismatch {
                        partition: name.to_owned(),
                    });
                }

                for range in ranges {
                    let certs =
                        otacert::read_zip(&image.data()[range]).map_err(|e| Error::OtaCert {
                            partition: name.to_owned(),
                            source: e,
                        })?;

                    check_certificates(name, &certs, cert)?;
                }
            }
            PartitionKind::Vbmeta { .. } => {}
        }

        debug!("Verified OTA certificates in {name}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn digest_mismatch_reports_both() {
        let expected = sha256(b"foo");
        let actual = sha256(b"bar");

        check_digest("patched", &expected, &expected).unwrap();

        assert_matches!(
            check_digest("patched", &expected, &actual),
            Err(error::Error::Verification { what, expected: e, actual: a })
                if what == "patched" && e == expected.to_string() && a == actual.to_string()
        );
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256(b"").to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        );
    }
}
