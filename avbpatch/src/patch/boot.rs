// SPDX-FileCopyrightText: 2022-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, sync::atomic::AtomicBool};

use bstr::ByteSlice;
use num_traits::ToPrimitive;
use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::{debug, trace};
use x509_cert::Certificate;

use crate::{
    crypto,
    format::{
        avb::{self, AppendedDescriptorMut, AppendedDescriptorRef, Footer, Header},
        bootimage::{self, BootImage, BootVersion},
        compression::{self, CompressedFormat},
        cpio::{self, CpioEntryNew},
    },
    patch::otacert::{self, OTACERTS_PATH, OtaCertBuildFlags},
    profile::RamdiskTag,
    stream,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Boot image has no vbmeta footer")]
    NoFooter,
    #[error("No hash descriptor found in vbmeta header")]
    NoHashDescriptor,
    #[error("Boot image has {fragments} ramdisk fragments, but {tags} are declared")]
    FragmentCountMismatch { fragments: usize, tags: usize },
    #[error(
        "Ramdisk fragment #{0} ({1:?}) does not contain {path:?}",
        path = OTACERTS_PATH.as_bstr()
    )]
    MissingOtacerts(usize, RamdiskTag),
    #[error("No ramdisk fragment is declared to contain {:?}", OTACERTS_PATH.as_bstr())]
    NoOtacertsFragment,
    #[error("AVB error")]
    Avb(#[from] avb::Error),
    #[error("Boot image error")]
    BootImage(#[from] bootimage::Error),
    #[error("Compression error")]
    Compression(#[from] compression::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("CPIO error")]
    Cpio(#[from] cpio::Error),
    #[error("OTA certificate error")]
    OtaCert(#[from] otacert::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_size_constraint(&self) -> bool {
        matches!(
            self,
            Self::Avb(avb::Error::TooSmallForHeader(_) | avb::Error::TooSmallForFooter(_))
        )
    }
}

type Result<T> = std::result::Result<T, Error>;

pub fn load_ramdisk(data: &[u8]) -> Result<(Vec<CpioEntryNew>, CompressedFormat)> {
    let (format, raw) = compression::decompress(data, false)?;
    let entries = cpio::load(&raw, false)?;

    trace!("Loaded {format:?} ramdisk with {} entries", entries.len());

    Ok((entries, format))
}

pub fn save_ramdisk(entries: &[CpioEntryNew], format: CompressedFormat) -> Result<Vec<u8>> {
    let raw = cpio::save(entries, false)?;
    let data = compression::compress(format, &raw)?;

    trace!("Wrote {format:?} ramdisk with {} entries", entries.len());

    Ok(data)
}

/// A boot image stored in a partition with an appended AVB footer.
#[derive(Clone)]
pub struct BootImageInfo {
    pub header: Header,
    pub footer: Footer,
    pub image_size: u64,
    pub boot_image: BootImage,
}

impl fmt::Debug for BootImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageInfo")
            .field("header", &self.header)
            .field("footer", &self.footer)
            .field("image_size", &self.image_size)
            .field("boot_image", &self.boot_image)
            .finish()
    }
}

impl BootImageInfo {
    /// Parse the AVB metadata and the boot image it covers. The boot image
    /// must have the expected layout.
    pub fn load(data: &[u8], version: BootVersion) -> Result<Self> {
        let (header, footer) = avb::load_image(data)?;
        let footer = footer.ok_or(Error::NoFooter)?;

        let AppendedDescriptorRef::Hash(_) = header.appended_descriptor()? else {
            return Err(Error::NoHashDescriptor);
        };

        let boot_data = footer
            .original_image_size
            .to_usize()
            .and_then(|s| data.get(..s))
            .ok_or(avb::Error::FieldOutOfBounds("original_image_size"))?;
        let boot_image = BootImage::decode(boot_data, version)?;

        trace!("Loaded {} byte boot image", data.len());

        Ok(Self {
            header,
            footer,
            image_size: data.len() as u64,
            boot_image,
        })
    }

    /// Re-encode the boot image and update the hash descriptor to match. The
    /// existing salt is reused.
    pub fn update_descriptor(&mut self) -> Result<()> {
        let data = self.boot_image.encode()?;

        let AppendedDescriptorMut::Hash(descriptor) = self.header.appended_descriptor_mut()?
        else {
            return Err(Error::NoHashDescriptor);
        };

        descriptor.update(&data)?;

        Ok(())
    }

    /// Check the hash descriptor against the boot image.
    pub fn verify_descriptor(&self) -> Result<()> {
        let data = self.boot_image.encode()?;

        let AppendedDescriptorRef::Hash(descriptor) = self.header.appended_descriptor()? else {
            return Err(Error::NoHashDescriptor);
        };

        descriptor.verify(&data)?;

        Ok(())
    }

    /// Write the boot image and its AVB metadata at the original partition
    /// size.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = self.boot_image.encode()?;
        let mut footer = self.footer.clone();

        let image = avb::write_footer(&data, &self.header, &mut footer, Some(self.image_size))?;

        Ok(image)
    }
}

/// Pair each ramdisk fragment with its declared tag. Fragments are matched to
/// tags by their on-disk order and the counts must agree.
fn tagged_fragments<'a>(
    boot_image: &'a mut BootImage,
    tags: &'a [RamdiskTag],
) -> Result<impl Iterator<Item = (usize, RamdiskTag, &'a mut Vec<u8>)>> {
    let fragments = boot_image.ramdisks_mut();
    if fragments.len() != tags.len() {
        return Err(Error::FragmentCountMismatch {
            fragments: fragments.len(),
            tags: tags.len(),
        });
    }

    Ok(fragments
        .into_iter()
        .zip(tags.iter().copied())
        .enumerate()
        .map(|(i, (f, t))| (i, t, f)))
}

/// Replace the OTA certificates in every ramdisk fragment that is declared to
/// carry `otacerts.zip` with the custom OTA signing certificate.
pub struct OtaCertPatcher {
    cert: Certificate,
}

impl OtaCertPatcher {
    pub fn new(cert: Certificate) -> Self {
        Self { cert }
    }

    /// Get every certificate in the fragments declared to carry
    /// `otacerts.zip`.
    pub fn get_certificates(
        boot_image: &BootImage,
        tags: &[RamdiskTag],
        cancel_signal: &AtomicBool,
    ) -> Result<Vec<Certificate>> {
        let mut boot_image = boot_image.clone();
        let mut certificates = vec![];

        for (index, tag, ramdisk) in tagged_fragments(&mut boot_image, tags)? {
            stream::check_cancel(cancel_signal)?;

            if !tag.carries_otacerts() {
                continue;
            }

            let (entries, _) = load_ramdisk(ramdisk)?;
            let entry = entries
                .iter()
                .find(|e| e.name == OTACERTS_PATH)
                .ok_or(Error::MissingOtacerts(index, tag))?;

            certificates.extend(otacert::read_zip(&entry.content)?);
        }

        Ok(certificates)
    }

    fn patch_ramdisk(ramdisk: &mut Vec<u8>, zip: &[u8]) -> Result<bool> {
        let (mut entries, ramdisk_format) = load_ramdisk(ramdisk)?;
        let Some(entry) = entries.iter_mut().find(|e| e.name == OTACERTS_PATH) else {
            return Ok(false);
        };

        // Create a new otacerts archive. The old certs are ignored since
        // flashing a stock OTA will render the device unbootable.
        entry.content = zip.to_vec();

        // Repack ramdisk.
        *ramdisk = save_ramdisk(&entries, ramdisk_format)?;

        Ok(true)
    }

    /// Patch the fragments by tag. Returns the number of patched fragments.
    pub fn patch(
        &self,
        boot_image: &mut BootImage,
        tags: &[RamdiskTag],
        cancel_signal: &AtomicBool,
    ) -> Result<usize> {
        let new_zip = otacert::create_zip(&self.cert, OtaCertBuildFlags::empty())?;
        trace!("Generated new {} byte otacerts.zip", new_zip.len());

        let mut patched = 0;

        for (index, tag, ramdisk) in tagged_fragments(boot_image, tags)? {
            stream::check_cancel(cancel_signal)?;

            if !tag.carries_otacerts() {
                continue;
            }

            // Fail hard if otacerts does not exist. We don't want to lock the
            // user out of future updates if the OTA certificate mechanism has
            // changed.
            if !Self::patch_ramdisk(ramdisk, &new_zip)? {
                return Err(Error::MissingOtacerts(index, tag));
            }

            debug!("Replaced otacerts.zip in ramdisk fragment #{index}");
            patched += 1;
        }

        Ok(patched)
    }
}

/// Sign the legacy VTS signature of a v4 boot image, if it has one. This
/// changes the boot image contents, so it must happen before the hash
/// descriptor is updated.
pub fn sign_vts(boot_image: &mut BootImage, key: &RsaPrivateKey) -> Result<bool> {
    let BootImage::V3Through4(b) = boot_image else {
        return Ok(false);
    };

    let signed = b.sign(key)?;
    if signed {
        debug!("Signed VTS signature");
    }

    Ok(signed)
}
