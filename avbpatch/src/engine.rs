// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Patch and re-sign every partition of a profile in dependency order.
//!
//! Each partition moves through [`PartitionState::Unpatched`],
//! [`PartitionState::ContentFinalized`], and, if it is signed,
//! [`PartitionState::Signed`]. Partitions are processed one dependency level
//! at a time. Partitions within a level do not depend on each other and are
//! processed in parallel.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{Span, debug, info, info_span};
use x509_cert::Certificate;

use crate::{
    artifact::ImageSet,
    error::{CodecError, Error, Result},
    format::{
        avb::{self, Header},
        verity::DmVerityImage,
    },
    graph::DependencyGraph,
    patch::{
        boot::{self, BootImageInfo, OtaCertPatcher},
        system,
        vbmeta::{self, DependencyInfo},
    },
    profile::{Partition, PartitionKind, Profile},
    util::NumBytes,
};

/// Block size for root vbmeta images.
const VBMETA_BLOCK_SIZE: u64 = 4096;

/// Key material for a run. It is only ever read.
pub struct SigningKeys {
    pub avb: RsaPrivateKey,
    pub ota_cert: Certificate,
}

impl fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeys")
            .field("avb", &"<private key>")
            .field("ota_cert", &self.ota_cert.tbs_certificate.subject)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionState {
    Unpatched,
    ContentFinalized,
    Signed,
}

/// A partition's decoded image while it is being transformed.
enum WorkingImage {
    Boot(Box<BootImageInfo>),
    DmVerity(Box<DmVerityImage>),
    Vbmeta(Header),
}

impl WorkingImage {
    fn header(&self) -> &Header {
        match self {
            Self::Boot(info) => &info.header,
            Self::DmVerity(image) => image.header(),
            Self::Vbmeta(header) => header,
        }
    }

    fn header_mut(&mut self) -> &mut Header {
        match self {
            Self::Boot(info) => &mut info.header,
            Self::DmVerity(image) => image.header_mut(),
            Self::Vbmeta(header) => header,
        }
    }

    fn encode(&self) -> std::result::Result<Vec<u8>, CodecError> {
        let data = match self {
            Self::Boot(info) => info.encode()?,
            Self::DmVerity(image) => image.encode()?,
            Self::Vbmeta(header) => avb::write_vbmeta(header, VBMETA_BLOCK_SIZE)?,
        };

        Ok(data)
    }
}

struct FinishedPartition {
    state: PartitionState,
    header: Header,
    data: Vec<u8>,
}

/// Per-run state: the current state and output of every partition, indexed
/// by declaration order.
pub struct SigningContext<'a> {
    profile: &'a Profile,
    keys: &'a SigningKeys,
    public_key: RsaPublicKey,
    patcher: OtaCertPatcher,
    states: Vec<PartitionState>,
    finished: Vec<Option<FinishedPartition>>,
}

impl<'a> SigningContext<'a> {
    pub fn new(profile: &'a Profile, keys: &'a SigningKeys) -> Self {
        let num_partitions = profile.partitions().len();

        Self {
            profile,
            keys,
            public_key: keys.avb.to_public_key(),
            patcher: OtaCertPatcher::new(keys.ota_cert.clone()),
            states: vec![PartitionState::Unpatched; num_partitions],
            finished: (0..num_partitions).map(|_| None).collect(),
        }
    }

    pub fn state(&self, name: &str) -> Option<PartitionState> {
        self.profile.index_of(name).map(|i| self.states[i])
    }

    /// The state a partition must reach before anything covering it can be
    /// signed.
    fn final_state(partition: &Partition) -> PartitionState {
        if partition.signed {
            PartitionState::Signed
        } else {
            PartitionState::ContentFinalized
        }
    }

    fn check_deps_final(&self, partition: &Partition) -> Result<()> {
        for dep in partition.deps() {
            let final_state = self
                .profile
                .partition(dep)
                .map(Self::final_state)
                .ok_or_else(|| crate::profile::Error::UnknownDependency {
                    partition: partition.name.clone(),
                    dependency: dep.clone(),
                })?;

            if self.state(dep) != Some(final_state) {
                return Err(Error::SigningOrder {
                    partition: partition.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        Ok(())
    }

    fn finished(&self, name: &str) -> Option<&FinishedPartition> {
        self.profile
            .index_of(name)
            .and_then(|i| self.finished[i].as_ref())
    }

    /// Apply the type-specific content transform.
    fn finalize_content(
        &self,
        partition: &Partition,
        input: &[u8],
        cancel_signal: &AtomicBool,
    ) -> Result<WorkingImage> {
        let name = partition.name.as_str();
        let codec_err = |e: CodecError| Error::codec(name, e);

        match &partition.kind {
            PartitionKind::Boot {
                version, ramdisks, ..
            } => {
                let boot_err = |e: boot::Error| codec_err(e.into());

                let mut info = BootImageInfo::load(input, *version).map_err(boot_err)?;

                let patched = self
                    .patcher
                    .patch(&mut info.boot_image, ramdisks, cancel_signal)
                    .map_err(boot_err)?;
                debug!("Patched {patched} ramdisk fragments");

                if partition.signed {
                    boot::sign_vts(&mut info.boot_image, &self.keys.avb).map_err(boot_err)?;
                }

                info.update_descriptor().map_err(boot_err)?;

                Ok(WorkingImage::Boot(Box::new(info)))
            }
            PartitionKind::DmVerity { .. } => {
                let mut image =
                    DmVerityImage::decode(input).map_err(|e| codec_err(e.into()))?;

                let ranges = system::patch_system_image(
                    &mut image,
                    &self.keys.ota_cert,
                    cancel_signal,
                )
                .map_err(|e| codec_err(e.into()))?;
                debug!("Replaced otacerts.zip at: {ranges:?}");

                Ok(WorkingImage::DmVerity(Box::new(image)))
            }
            PartitionKind::Vbmeta { deps } => {
                self.check_deps_final(partition)?;

                let mut header = avb::read_vbmeta(input).map_err(|e| codec_err(e.into()))?;

                let mut dep_infos = Vec::with_capacity(deps.len());

                for dep in deps {
                    let Some(finished) = self.finished(dep) else {
                        return Err(Error::SigningOrder {
                            partition: name.to_owned(),
                            dependency: dep.clone(),
                        });
                    };

                    let info = if finished.state == PartitionState::Signed {
                        DependencyInfo::Signed(&self.public_key)
                    } else {
                        let descriptor = finished
                            .header
                            .appended_descriptor()
                            .map_err(|e| Error::codec(dep, e))?;
                        DependencyInfo::Unsigned(descriptor)
                    };

                    dep_infos.push((dep.as_str(), info));
                }

                vbmeta::update_descriptors(&mut header, &dep_infos)
                    .map_err(|e| codec_err(e.into()))?;

                Ok(WorkingImage::Vbmeta(header))
            }
        }
    }

    /// Move a single partition from [`PartitionState::Unpatched`] to its final
    /// state.
    fn process(
        &self,
        partition: &Partition,
        input: &[u8],
        cancel_signal: &AtomicBool,
    ) -> Result<FinishedPartition> {
        let name = partition.name.as_str();

        let mut working = self.finalize_content(partition, input, cancel_signal)?;
        let mut state = PartitionState::ContentFinalized;

        if partition.signed {
            self.check_deps_final(partition)?;

            let header = working.header_mut();
            header
                .set_algo_for_key(&self.keys.avb)
                .map_err(|e| Error::codec(name, e))?;
            header
                .sign(&self.keys.avb)
                .map_err(|e| Error::codec(name, e))?;

            state = PartitionState::Signed;
        } else {
            working.header_mut().clear_sig();
        }

        let data = working.encode().map_err(|e| Error::codec(name, e))?;

        info!("Finalized {name} as {state:?} ({:?})", NumBytes(data.len()));

        Ok(FinishedPartition {
            state,
            header: working.header().clone(),
            data,
        })
    }

    /// Process every partition of the profile. Nothing is returned unless
    /// every partition reaches its final state.
    pub fn run(mut self, images: &ImageSet, cancel_signal: &AtomicBool) -> Result<ImageSet> {
        let graph = DependencyGraph::new(self.profile)?;
        let levels = graph
            .levels()?
            .into_iter()
            .map(|level| {
                level
                    .into_iter()
                    .filter_map(|n| self.profile.index_of(n))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let roots = graph.roots();
        if roots.len() != 1 {
            info!("Profile has {} vbmeta roots: {roots:?}", roots.len());
        }

        for partition in self.profile.partitions() {
            if images.get(&partition.name).is_none() {
                return Err(Error::codec(&partition.name, CodecError::MissingImage));
            }
        }

        for (depth, level) in levels.iter().enumerate() {
            if cancel_signal.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let _span = info_span!("level", depth).entered();
            let parent_span = Span::current();

            let pending = level
                .iter()
                .copied()
                .filter(|i| {
                    let partition = &self.profile.partitions()[*i];
                    let unpatched = self.states[*i] == PartitionState::Unpatched;
                    if !unpatched {
                        debug!("Skipping finalized partition: {}", partition.name);
                    }
                    unpatched
                })
                .collect::<Vec<_>>();

            let results = pending
                .par_iter()
                .map(|index| {
                    let partition = &self.profile.partitions()[*index];
                    let name = partition.name.as_str();
                    let _span = info_span!(parent: &parent_span, "partition", name).entered();

                    let result = match images.get(&partition.name) {
                        Some(input) => self.process(partition, input, cancel_signal),
                        None => Err(Error::codec(&partition.name, CodecError::MissingImage)),
                    };

                    (*index, result)
                })
                .collect::<Vec<_>>();

            let mut first_error: Option<(usize, Error)> = None;

            for (index, result) in results {
                match result {
                    Ok(finished) => {
                        self.states[index] = finished.state;
                        self.finished[index] = Some(finished);
                    }
                    Err(e) => {
                        if first_error.as_ref().is_none_or(|(i, _)| index < *i) {
                            first_error = Some((index, e));
                        }
                    }
                }
            }

            if let Some((_, e)) = first_error {
                if cancel_signal.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }

                return Err(e);
            }
        }

        self.finish()
    }

    fn finish(self) -> Result<ImageSet> {
        let mut output = ImageSet::new();

        for (partition, finished) in self.profile.partitions().iter().zip(self.finished) {
            let Some(finished) = finished else {
                return Err(Error::SigningOrder {
                    partition: partition.name.clone(),
                    dependency: partition.name.clone(),
                });
            };

            if !partition.deps().is_empty() {
                vbmeta::ensure_partitions_protected(
                    &finished.header,
                    partition.deps().iter().map(|d| d.as_str()),
                )
                .map_err(|e| Error::codec(&partition.name, e))?;
            }

            output.insert(&partition.name, finished.data);
        }

        Ok(output)
    }
}

/// Patch and re-sign the images of a profile. Every partition in the profile
/// must have an image. The inputs are not modified.
pub fn patch_images(
    profile: &Profile,
    images: &ImageSet,
    keys: &SigningKeys,
    cancel_signal: &AtomicBool,
) -> Result<ImageSet> {
    SigningContext::new(profile, keys).run(images, cancel_signal)
}

/// Like [`patch_images`], but operates on serialized artifacts.
pub fn patch_artifact(
    profile: &Profile,
    artifact: &[u8],
    keys: &SigningKeys,
    cancel_signal: &AtomicBool,
) -> Result<Vec<u8>> {
    let images = ImageSet::from_artifact(artifact)?;
    let patched = patch_images(profile, &images, keys, cancel_signal)?;

    Ok(patched.to_artifact()?)
}
