// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, io, mem,
    str::{self, Utf8Error},
};

use bstr::ByteSlice;
use num_traits::ToPrimitive;
use ring::digest::Context;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::{IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        avb::{self, Descriptor, Header},
        padding::{self, ZeroPadding},
    },
    stream::SliceReader,
    util::{self, NumBytes, OutOfBoundsError},
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;
pub const BOOT_EXTRA_ARGS_SIZE: usize = 1024;

pub const VENDOR_BOOT_MAGIC: [u8; 8] = *b"VNDRBOOT";
pub const VENDOR_BOOT_ARGS_SIZE: usize = 2048;
pub const VENDOR_BOOT_NAME_SIZE: usize = 16;

pub const VENDOR_RAMDISK_TYPE_NONE: u32 = 0;
pub const VENDOR_RAMDISK_TYPE_PLATFORM: u32 = 1;
pub const VENDOR_RAMDISK_TYPE_RECOVERY: u32 = 2;
pub const VENDOR_RAMDISK_TYPE_DLKM: u32 = 3;
pub const VENDOR_RAMDISK_NAME_SIZE: usize = 32;
pub const VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE: usize = 16;

pub const PAGE_SIZE: u32 = 4096;

const HDR_V4_SIGNATURE_SIZE: u64 = 4096;

/// Maximum size of any individual boot image component, like the kernel. This
/// limit is currently 64 MiB, which should be sufficient since there is no
/// known device where the entire boot image exceeds this size.
const COMPONENT_MAX_SIZE: u32 = 64 * 1024 * 1024;
/// Maximum size of the bootconfig component in vendor v4 images. This limit is
/// currently 1 KiB, which is ~25x the size of the Pixel 7 Pro stock image's
/// bootconfig.
const BOOTCONFIG_MAX_SIZE: u32 = 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown boot image format")]
    UnknownFormat,
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Unknown header version: {0}")]
    UnknownHeaderVersion(u32),
    #[error("Expected {expected} boot image, but found {actual}")]
    VersionMismatch {
        expected: BootVersion,
        actual: String,
    },
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .2.as_bstr())]
    StringNotUtf8(&'static str, #[source] Utf8Error, Vec<u8>),
    #[error("{0:?} field is too long (>{1}): {2:?}")]
    StringTooLong(&'static str, usize, String),
    #[error("{0:?} field is out of bounds")]
    IntOutOfBounds(&'static str, #[source] OutOfBoundsError),
    #[error("{0:?} overflowed integer bounds during calculations")]
    IntOverflow(&'static str),
    #[error("Page size must not be zero")]
    PageSizeZero,
    #[error("Invalid header size for boot image type: {0}")]
    InvalidHeaderSize(u32),
    #[error("Mismatched ramdisk ({ramdisks}) and metadata ({metas}) counts")]
    MismatchedRamdiskCounts { ramdisks: usize, metas: usize },
    #[error("Vendor V3 only supports a single ramdisk (count: {0})")]
    VendorV3TooManyRamdisks(usize),
    #[error("Invalid vendor v4 total ramdisk size: {field_value} != {total_size}")]
    VendorV4InvalidRamdiskSize { field_value: u32, total_size: u32 },
    #[error("Invalid vendor v4 ramdisk table size: {actual} != {expected}")]
    VendorV4InvalidRamdiskTableSize { actual: u32, expected: u32 },
    #[error("Invalid vendor v4 ramdisk entry size: {0}")]
    VendorV4InvalidRamdiskEntrySize(u32),
    #[error("Invalid vendor v4 ramdisk entry [{index}] offset: {field_value} != {reader_pos}")]
    VendorV4InvalidRamdiskEntryOffset {
        index: u32,
        field_value: u32,
        reader_pos: usize,
    },
    #[error("VTS signature block is present, but empty")]
    EmptyVtsSignature,
    #[error("VTS signature is missing hash descriptor")]
    MissingHashDescriptor,
    #[error("Failed to load VTS AVB signature")]
    VtsAvbLoad(#[source] avb::Error),
    #[error("Failed to save VTS AVB signature")]
    VtsAvbSave(#[source] avb::Error),
    #[error("Failed to generate VTS AVB signature")]
    VtsAvbSign(#[source] avb::Error),
    #[error("{0} bytes of unexpected data after the last component")]
    TrailingData(usize),
    #[error("Failed to read boot image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The boot image layouts that partitions can declare.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootVersion {
    V2,
    V3,
    V4,
    VendorV3,
    VendorV4,
}

impl BootVersion {
    pub fn is_vendor(self) -> bool {
        matches!(self, Self::VendorV3 | Self::VendorV4)
    }
}

impl fmt::Display for BootVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::V2 => "v2",
            Self::V3 => "v3",
            Self::V4 => "v4",
            Self::VendorV3 => "vendor_v3",
            Self::VendorV4 => "vendor_v4",
        };

        f.write_str(name)
    }
}

pub trait BootImageExt {
    fn header_version(&self) -> u32;

    fn header_size(&self) -> u32;
}

fn check_size(size: usize, max: u32, field: &'static str) -> Result<u32> {
    util::check_bounds(size, ..=max as usize).map_err(|e| Error::IntOutOfBounds(field, e))?;

    // Cannot fail because of the check above.
    Ok(size as u32)
}

fn parse_string<'a>(data: &'a [u8], field: &'static str) -> Result<&'a str> {
    let data = data.trim_end_padding();

    str::from_utf8(data).map_err(|e| Error::StringNotUtf8(field, e, data.to_vec()))
}

fn format_string<const N: usize>(value: &str, field: &'static str) -> Result<[u8; N]> {
    value
        .as_bytes()
        .to_padded_array::<N>()
        .ok_or_else(|| Error::StringTooLong(field, N, value.to_owned()))
}

/// Read a component and the zero padding that follows it.
fn read_component(
    reader: &mut SliceReader,
    size: u32,
    page_size: u32,
    field: &'static str,
) -> Result<Vec<u8>> {
    let data = reader
        .read_slice(size as usize)
        .map_err(|e| Error::DataRead(field, e))?
        .to_vec();
    reader
        .read_zero_padding(page_size as usize)
        .map_err(|e| Error::DataRead(field, e))?;

    Ok(data)
}

fn write_component(buf: &mut Vec<u8>, data: &[u8], page_size: u32) {
    buf.extend_from_slice(data);
    padding::pad_vec(buf, page_size as usize);
}

fn check_consumed(reader: &SliceReader) -> Result<()> {
    if !reader.is_empty() {
        return Err(Error::TrailingData(reader.remaining().len()));
    }

    Ok(())
}

/// Raw on-disk layout for the v0 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV0 {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    second_size: little_endian::U32,
    second_addr: little_endian::U32,
    tags_addr: little_endian::U32,
    page_size: little_endian::U32,
    header_version: little_endian::U32,
    os_version: little_endian::U32,
    name: [u8; BOOT_NAME_SIZE],
    cmdline: [u8; BOOT_ARGS_SIZE],
    id: [little_endian::U32; 8],
    extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
}

/// Raw on-disk layout for the extra v1 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV1Extra {
    recovery_dtbo_size: little_endian::U32,
    recovery_dtbo_offset: little_endian::U64,
    header_size: little_endian::U32,
}

/// Raw on-disk layout for the extra v2 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV2Extra {
    dtb_size: little_endian::U32,
    dtb_addr: little_endian::U64,
}

#[derive(Clone, Eq, PartialEq)]
pub struct V1Extra {
    pub recovery_dtbo_offset: u64,
    pub recovery_dtbo: Vec<u8>,
}

impl fmt::Debug for V1Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V1Extra")
            .field("recovery_dtbo_offset", &self.recovery_dtbo_offset)
            .field("recovery_dtbo", &NumBytes(self.recovery_dtbo.len()))
            .finish()
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct V2Extra {
    pub dtb_addr: u64,
    pub dtb: Vec<u8>,
}

impl fmt::Debug for V2Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V2Extra")
            .field("dtb_addr", &self.dtb_addr)
            .field("dtb", &NumBytes(self.dtb.len()))
            .finish()
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct BootImageV0Through2 {
    // v0+ fields.
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub os_version: u32,
    pub name: String,
    pub cmdline: String,
    pub id: [u32; 8],
    pub extra_cmdline: String,
    // Images.
    pub kernel: Vec<u8>,
    pub ramdisk: Vec<u8>,
    pub second: Vec<u8>,
    // Extra fields for newer versions.
    pub v1_extra: Option<V1Extra>,
    pub v2_extra: Option<V2Extra>,
}

impl fmt::Debug for BootImageV0Through2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageV0Through2")
            .field("kernel_addr", &self.kernel_addr)
            .field("ramdisk_addr", &self.ramdisk_addr)
            .field("second_addr", &self.second_addr)
            .field("tags_addr", &self.tags_addr)
            .field("page_size", &self.page_size)
            .field("header_version", &self.header_version())
            .field("os_version", &self.os_version)
            .field("name", &self.name)
            .field("cmdline", &self.cmdline)
            .field("id", &self.id)
            .field("extra_cmdline", &self.extra_cmdline)
            .field("kernel", &NumBytes(self.kernel.len()))
            .field("ramdisk", &NumBytes(self.ramdisk.len()))
            .field("second", &NumBytes(self.second.len()))
            .field("v1_extra", &self.v1_extra)
            .field("v2_extra", &self.v2_extra)
            .finish()
    }
}

impl BootImageExt for BootImageV0Through2 {
    fn header_version(&self) -> u32 {
        if self.v2_extra.is_some() {
            2
        } else if self.v1_extra.is_some() {
            1
        } else {
            0
        }
    }

    fn header_size(&self) -> u32 {
        let version = self.header_version();
        let mut size = mem::size_of::<RawV0>();

        if version >= 1 {
            size += mem::size_of::<RawV1Extra>();
        }
        if version == 2 {
            size += mem::size_of::<RawV2Extra>();
        }

        size as u32
    }
}

impl BootImageV0Through2 {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data);

        let raw_v0: RawV0 = reader
            .read_obj()
            .map_err(|e| Error::DataRead("Boot::V0::header", e))?;

        if raw_v0.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw_v0.magic));
        }

        let header_version = raw_v0.header_version.get();
        if header_version > 2 {
            return Err(Error::UnknownHeaderVersion(header_version));
        }

        let kernel_size = util::check_bounds(raw_v0.kernel_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V0::kernel_size", e))?;
        let ramdisk_size = util::check_bounds(raw_v0.ramdisk_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V0::ramdisk_size", e))?;
        let second_size = util::check_bounds(raw_v0.second_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V0::second_size", e))?;

        let page_size = raw_v0.page_size.get();
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let name = parse_string(&raw_v0.name, "Boot::V0::name")?;
        let cmdline = parse_string(&raw_v0.cmdline, "Boot::V0::cmdline")?;
        let extra_cmdline = parse_string(&raw_v0.extra_cmdline, "Boot::V0::extra_cmdline")?;

        let v1_header = if header_version >= 1 {
            let raw_v1: RawV1Extra = reader
                .read_obj()
                .map_err(|e| Error::DataRead("Boot::V1::header", e))?;

            let recovery_dtbo_size =
                util::check_bounds(raw_v1.recovery_dtbo_size.get(), ..=COMPONENT_MAX_SIZE)
                    .map_err(|e| Error::IntOutOfBounds("Boot::V1::recovery_dtbo_size", e))?;

            Some((raw_v1, recovery_dtbo_size))
        } else {
            None
        };

        let v2_header = if header_version == 2 {
            let raw_v2: RawV2Extra = reader
                .read_obj()
                .map_err(|e| Error::DataRead("Boot::V2::header", e))?;

            let dtb_size = util::check_bounds(raw_v2.dtb_size.get(), ..=COMPONENT_MAX_SIZE)
                .map_err(|e| Error::IntOutOfBounds("Boot::V2::dtb_size", e))?;

            Some((raw_v2, dtb_size))
        } else {
            None
        };

        if let Some((raw_v1, _)) = &v1_header {
            let header_size = raw_v1.header_size.get();
            if reader.offset() as u64 != u64::from(header_size) {
                return Err(Error::InvalidHeaderSize(header_size));
            }
        }

        reader
            .read_zero_padding(page_size as usize)
            .map_err(|e| Error::DataRead("Boot::V0::header_padding", e))?;

        let kernel = read_component(&mut reader, kernel_size, page_size, "Boot::V0::kernel")?;
        let ramdisk = read_component(&mut reader, ramdisk_size, page_size, "Boot::V0::ramdisk")?;
        let second = read_component(&mut reader, second_size, page_size, "Boot::V0::second")?;

        let v1_extra = match v1_header {
            Some((raw_v1, size)) => Some(V1Extra {
                recovery_dtbo_offset: raw_v1.recovery_dtbo_offset.get(),
                recovery_dtbo: read_component(
                    &mut reader,
                    size,
                    page_size,
                    "Boot::V1::recovery_dtbo",
                )?,
            }),
            None => None,
        };

        let v2_extra = match v2_header {
            Some((raw_v2, size)) => Some(V2Extra {
                dtb_addr: raw_v2.dtb_addr.get(),
                dtb: read_component(&mut reader, size, page_size, "Boot::V2::dtb")?,
            }),
            None => None,
        };

        check_consumed(&reader)?;

        Ok(Self {
            kernel_addr: raw_v0.kernel_addr.get(),
            ramdisk_addr: raw_v0.ramdisk_addr.get(),
            second_addr: raw_v0.second_addr.get(),
            tags_addr: raw_v0.tags_addr.get(),
            page_size,
            os_version: raw_v0.os_version.get(),
            name: name.to_owned(),
            cmdline: cmdline.to_owned(),
            id: raw_v0.id.map(|id| id.get()),
            extra_cmdline: extra_cmdline.to_owned(),
            kernel,
            ramdisk,
            second,
            v1_extra,
            v2_extra,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let kernel_size =
            check_size(self.kernel.len(), COMPONENT_MAX_SIZE, "Boot::V0::kernel_size")?;
        let ramdisk_size =
            check_size(self.ramdisk.len(), COMPONENT_MAX_SIZE, "Boot::V0::ramdisk_size")?;
        let second_size =
            check_size(self.second.len(), COMPONENT_MAX_SIZE, "Boot::V0::second_size")?;

        if self.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let mut buf = Vec::new();

        let raw_v0 = RawV0 {
            magic: BOOT_MAGIC,
            kernel_size: kernel_size.into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_size: ramdisk_size.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            second_size: second_size.into(),
            second_addr: self.second_addr.into(),
            tags_addr: self.tags_addr.into(),
            page_size: self.page_size.into(),
            header_version: self.header_version().into(),
            os_version: self.os_version.into(),
            name: format_string(&self.name, "Boot::V0::name")?,
            cmdline: format_string(&self.cmdline, "Boot::V0::cmdline")?,
            id: self.id.map(|id| id.into()),
            extra_cmdline: format_string(&self.extra_cmdline, "Boot::V0::extra_cmdline")?,
        };
        buf.extend_from_slice(raw_v0.as_bytes());

        if let Some(v1) = &self.v1_extra {
            let raw_v1 = RawV1Extra {
                recovery_dtbo_size: check_size(
                    v1.recovery_dtbo.len(),
                    COMPONENT_MAX_SIZE,
                    "Boot::V1::recovery_dtbo_size",
                )?
                .into(),
                recovery_dtbo_offset: v1.recovery_dtbo_offset.into(),
                header_size: self.header_size().into(),
            };
            buf.extend_from_slice(raw_v1.as_bytes());
        }

        if let Some(v2) = &self.v2_extra {
            let raw_v2 = RawV2Extra {
                dtb_size: check_size(v2.dtb.len(), COMPONENT_MAX_SIZE, "Boot::V2::dtb_size")?
                    .into(),
                dtb_addr: v2.dtb_addr.into(),
            };
            buf.extend_from_slice(raw_v2.as_bytes());
        }

        padding::pad_vec(&mut buf, self.page_size as usize);

        write_component(&mut buf, &self.kernel, self.page_size);
        write_component(&mut buf, &self.ramdisk, self.page_size);
        write_component(&mut buf, &self.second, self.page_size);

        if let Some(v1) = &self.v1_extra {
            write_component(&mut buf, &v1.recovery_dtbo, self.page_size);
        }

        if let Some(v2) = &self.v2_extra {
            write_component(&mut buf, &v2.dtb, self.page_size);
        }

        Ok(buf)
    }
}

/// Raw on-disk layout for the v3 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV3 {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    ramdisk_size: little_endian::U32,
    os_version: little_endian::U32,
    header_size: little_endian::U32,
    reserved: [little_endian::U32; 4],
    header_version: little_endian::U32,
    cmdline: [u8; BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE],
}

/// Raw on-disk layout for the extra v4 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV4Extra {
    signature_size: little_endian::U32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct V4Extra {
    /// Legacy boot signature used only by VTS tests.
    pub signature: Option<Header>,
}

#[derive(Clone, Eq, PartialEq)]
pub struct BootImageV3Through4 {
    // v3+ fields.
    pub os_version: u32,
    pub reserved: [u32; 4],
    pub cmdline: String,
    pub v4_extra: Option<V4Extra>,
    // Images.
    pub kernel: Vec<u8>,
    pub ramdisk: Vec<u8>,
}

impl fmt::Debug for BootImageV3Through4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageV3Through4")
            .field("os_version", &self.os_version)
            .field("reserved", &self.reserved)
            .field("cmdline", &self.cmdline)
            .field("v4_extra", &self.v4_extra)
            .field("kernel", &NumBytes(self.kernel.len()))
            .field("ramdisk", &NumBytes(self.ramdisk.len()))
            .finish()
    }
}

impl BootImageExt for BootImageV3Through4 {
    fn header_version(&self) -> u32 {
        if self.v4_extra.is_some() { 4 } else { 3 }
    }

    fn header_size(&self) -> u32 {
        let version = self.header_version();
        let mut size = mem::size_of::<RawV3>();

        if version >= 4 {
            size += mem::size_of::<RawV4Extra>();
        }

        size as u32
    }
}

impl BootImageV3Through4 {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data);

        let raw_v3: RawV3 = reader
            .read_obj()
            .map_err(|e| Error::DataRead("Boot::V3::header", e))?;

        if raw_v3.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw_v3.magic));
        }

        let header_version = raw_v3.header_version.get();
        if !(3..=4).contains(&header_version) {
            return Err(Error::UnknownHeaderVersion(header_version));
        }

        let kernel_size = util::check_bounds(raw_v3.kernel_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V3::kernel_size", e))?;
        let ramdisk_size = util::check_bounds(raw_v3.ramdisk_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Boot::V3::ramdisk_size", e))?;
        let header_size = raw_v3.header_size.get();

        let cmdline = parse_string(&raw_v3.cmdline, "Boot::V3::cmdline")?;

        let signature_size = if header_version == 4 {
            let raw_v4: RawV4Extra = reader
                .read_obj()
                .map_err(|e| Error::DataRead("Boot::V4::header", e))?;

            let size =
                util::check_bounds(raw_v4.signature_size.get(), ..=HDR_V4_SIGNATURE_SIZE as u32)
                    .map_err(|e| Error::IntOutOfBounds("Boot::V4::signature_size", e))?;

            Some(size)
        } else {
            None
        };

        if reader.offset() as u64 != u64::from(header_size) {
            return Err(Error::InvalidHeaderSize(header_size));
        }

        reader
            .read_zero_padding(PAGE_SIZE as usize)
            .map_err(|e| Error::DataRead("Boot::V3::header_padding", e))?;

        let kernel = read_component(&mut reader, kernel_size, PAGE_SIZE, "Boot::V3::kernel")?;
        let ramdisk = read_component(&mut reader, ramdisk_size, PAGE_SIZE, "Boot::V3::ramdisk")?;

        let v4_extra = match signature_size {
            Some(0) => Some(V4Extra { signature: None }),
            Some(s) => {
                let data = read_component(&mut reader, s, PAGE_SIZE, "Boot::V4::signature")?;

                // A block of zeros can't be reproduced when writing the image.
                if util::is_zero(&data) {
                    return Err(Error::EmptyVtsSignature);
                }

                let header = Header::decode(&data).map_err(Error::VtsAvbLoad)?;

                Some(V4Extra {
                    signature: Some(header),
                })
            }
            None => None,
        };

        check_consumed(&reader)?;

        Ok(Self {
            os_version: raw_v3.os_version.get(),
            reserved: raw_v3.reserved.map(|r| r.get()),
            cmdline: cmdline.to_owned(),
            v4_extra,
            kernel,
            ramdisk,
        })
    }

    fn encode_internal(&self, skip_v4_sig: bool) -> Result<Vec<u8>> {
        let kernel_size =
            check_size(self.kernel.len(), COMPONENT_MAX_SIZE, "Boot::V3::kernel_size")?;
        let ramdisk_size =
            check_size(self.ramdisk.len(), COMPONENT_MAX_SIZE, "Boot::V3::ramdisk_size")?;

        let mut buf = Vec::new();

        let raw_v3 = RawV3 {
            magic: BOOT_MAGIC,
            kernel_size: kernel_size.into(),
            ramdisk_size: ramdisk_size.into(),
            os_version: self.os_version.into(),
            header_size: self.header_size().into(),
            reserved: self.reserved.map(|r| r.into()),
            header_version: self.header_version().into(),
            cmdline: format_string(&self.cmdline, "Boot::V3::cmdline")?,
        };
        buf.extend_from_slice(raw_v3.as_bytes());

        let v4_signature = if let Some(v4) = &self.v4_extra {
            let mut sig = Vec::new();

            if let Some(s) = &v4.signature {
                sig = s.encode().map_err(Error::VtsAvbSave)?;

                // The VTS signature is always a fixed size.
                util::check_bounds(sig.len() as u64, ..=HDR_V4_SIGNATURE_SIZE)
                    .map_err(|e| Error::IntOutOfBounds("Boot::V4::signature_size", e))?;

                sig.resize(HDR_V4_SIGNATURE_SIZE as usize, 0);
            }

            let raw_v4 = RawV4Extra {
                signature_size: (sig.len() as u32).into(),
            };
            buf.extend_from_slice(raw_v4.as_bytes());

            Some(sig)
        } else {
            None
        };

        padding::pad_vec(&mut buf, PAGE_SIZE as usize);

        write_component(&mut buf, &self.kernel, PAGE_SIZE);
        write_component(&mut buf, &self.ramdisk, PAGE_SIZE);

        if !skip_v4_sig {
            if let Some(sig) = v4_signature {
                write_component(&mut buf, &sig, PAGE_SIZE);
            }
        }

        Ok(buf)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_internal(false)
    }

    /// Sign the boot image with a legacy VTS signature. Returns true if the
    /// image was successfully signed. Returns false if there's no vbmeta
    /// structure to sign in [`V4Extra::signature`].
    pub fn sign(&mut self, key: &RsaPrivateKey) -> Result<bool> {
        let Some(signature) = self.v4_extra.as_ref().and_then(|v4| v4.signature.as_ref()) else {
            return Ok(false);
        };

        // The hash includes everything but the signature at the end.
        let descriptor = signature
            .descriptors
            .iter()
            .find_map(|d| match d {
                Descriptor::Hash(h) => Some(h),
                _ => None,
            })
            .ok_or(Error::MissingHashDescriptor)?;

        if descriptor.hash_algorithm != "sha256" {
            return Err(Error::VtsAvbSign(avb::Error::UnsupportedHashAlgorithm(
                descriptor.hash_algorithm.clone(),
            )));
        }

        let data = self.encode_internal(true)?;
        let mut context = Context::new(&ring::digest::SHA256);
        context.update(&descriptor.salt);
        context.update(&data);
        let digest = context.finish();

        let Some(signature) = self.v4_extra.as_mut().and_then(|v4| v4.signature.as_mut()) else {
            return Ok(false);
        };
        for d in &mut signature.descriptors {
            if let Descriptor::Hash(h) = d {
                h.image_size = data.len() as u64;
                h.root_digest = digest.as_ref().to_vec();
                break;
            }
        }

        signature
            .set_algo_for_key(key)
            .and_then(|_| signature.sign(key))
            .map_err(Error::VtsAvbSign)?;

        Ok(true)
    }
}

/// Raw on-disk layout for the vendor v3 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV3 {
    /// Magic value. This should be equal to [`VENDOR_BOOT_MAGIC`].
    magic: [u8; 8],
    header_version: little_endian::U32,
    page_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    vendor_ramdisk_size: little_endian::U32,
    cmdline: [u8; VENDOR_BOOT_ARGS_SIZE],
    tags_addr: little_endian::U32,
    name: [u8; VENDOR_BOOT_NAME_SIZE],
    header_size: little_endian::U32,
    dtb_size: little_endian::U32,
    dtb_addr: little_endian::U64,
}

/// Raw on-disk layout for the extra vendor v4 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV4Extra {
    vendor_ramdisk_table_size: little_endian::U32,
    vendor_ramdisk_table_entry_num: little_endian::U32,
    vendor_ramdisk_table_entry_size: little_endian::U32,
    bootconfig_size: little_endian::U32,
}

/// Raw on-disk layout for the vendor v4 ramdisk table entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV4RamdiskTableEntry {
    ramdisk_size: little_endian::U32,
    ramdisk_offset: little_endian::U32,
    ramdisk_type: little_endian::U32,
    ramdisk_name: [u8; VENDOR_RAMDISK_NAME_SIZE],
    board_id: [little_endian::U32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RamdiskMeta {
    pub ramdisk_type: u32,
    pub ramdisk_name: String,
    pub board_id: [u32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VendorV4Extra {
    pub ramdisk_metas: Vec<RamdiskMeta>,
    pub bootconfig: String,
}

#[derive(Clone, Eq, PartialEq)]
pub struct VendorBootImageV3Through4 {
    pub page_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub cmdline: String,
    pub tags_addr: u32,
    pub name: String,
    pub dtb: Vec<u8>,
    pub dtb_addr: u64,
    pub ramdisks: Vec<Vec<u8>>,
    pub v4_extra: Option<VendorV4Extra>,
}

impl fmt::Debug for VendorBootImageV3Through4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VendorBootImageV3Through4")
            .field("page_size", &self.page_size)
            .field("kernel_addr", &self.kernel_addr)
            .field("ramdisk_addr", &self.ramdisk_addr)
            .field("cmdline", &self.cmdline)
            .field("tags_addr", &self.tags_addr)
            .field("name", &self.name)
            .field("dtb", &NumBytes(self.dtb.len()))
            .field("dtb_addr", &self.dtb_addr)
            .field(
                "ramdisks",
                &self
                    .ramdisks
                    .iter()
                    .map(|r| NumBytes(r.len()))
                    .collect::<Vec<_>>(),
            )
            .field("v4_extra", &self.v4_extra)
            .finish()
    }
}

impl BootImageExt for VendorBootImageV3Through4 {
    fn header_version(&self) -> u32 {
        if self.v4_extra.is_some() { 4 } else { 3 }
    }

    fn header_size(&self) -> u32 {
        let version = self.header_version();
        let mut size = mem::size_of::<RawVendorV3>();

        if version >= 4 {
            size += mem::size_of::<RawVendorV4Extra>();
        }

        size as u32
    }
}

impl VendorBootImageV3Through4 {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data);

        let raw_v3: RawVendorV3 = reader
            .read_obj()
            .map_err(|e| Error::DataRead("Vendor::V3::header", e))?;

        if raw_v3.magic != VENDOR_BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw_v3.magic));
        }

        let header_version = raw_v3.header_version.get();
        if !(3..=4).contains(&header_version) {
            return Err(Error::UnknownHeaderVersion(header_version));
        }

        let page_size = raw_v3.page_size.get();
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let vendor_ramdisk_size =
            util::check_bounds(raw_v3.vendor_ramdisk_size.get(), ..=COMPONENT_MAX_SIZE)
                .map_err(|e| Error::IntOutOfBounds("Vendor::V3::vendor_ramdisk_size", e))?;

        let cmdline = parse_string(&raw_v3.cmdline, "Vendor::V3::cmdline")?;
        let name = parse_string(&raw_v3.name, "Vendor::V3::name")?;
        let header_size = raw_v3.header_size.get();

        let dtb_size = util::check_bounds(raw_v3.dtb_size.get(), ..=COMPONENT_MAX_SIZE)
            .map_err(|e| Error::IntOutOfBounds("Vendor::V3::dtb_size", e))?;

        let v4_header = if header_version == 4 {
            let raw_v4: RawVendorV4Extra = reader
                .read_obj()
                .map_err(|e| Error::DataRead("Vendor::V4::header", e))?;

            let table_size = raw_v4.vendor_ramdisk_table_size.get();
            let table_entry_num = raw_v4.vendor_ramdisk_table_entry_num.get();
            let table_entry_size = raw_v4.vendor_ramdisk_table_entry_size.get();

            let bootconfig_size =
                util::check_bounds(raw_v4.bootconfig_size.get(), ..=BOOTCONFIG_MAX_SIZE)
                    .map_err(|e| Error::IntOutOfBounds("Vendor::V4::bootconfig_size", e))?;

            if table_entry_size != mem::size_of::<RawVendorV4RamdiskTableEntry>() as u32 {
                return Err(Error::VendorV4InvalidRamdiskEntrySize(table_entry_size));
            }

            let actual_table_size = table_entry_num
                .checked_mul(table_entry_size)
                .ok_or(Error::IntOverflow("Vendor::V4::actual_table_size"))?;
            if actual_table_size != table_size {
                return Err(Error::VendorV4InvalidRamdiskTableSize {
                    actual: actual_table_size,
                    expected: table_size,
                });
            }

            Some((table_entry_num, bootconfig_size))
        } else {
            None
        };

        if reader.offset() as u64 != u64::from(header_size) {
            return Err(Error::InvalidHeaderSize(header_size));
        }

        reader
            .read_zero_padding(page_size as usize)
            .map_err(|e| Error::DataRead("Vendor::V3::header_padding", e))?;

        // For v3, this is just one big ramdisk. For v4, the data is split
        // using the table of entries that shows up later in the file.
        let vendor_ramdisk_data = reader
            .read_slice(vendor_ramdisk_size as usize)
            .map_err(|e| Error::DataRead("Vendor::V3::ramdisk", e))?;
        reader
            .read_zero_padding(page_size as usize)
            .map_err(|e| Error::DataRead("Vendor::V3::ramdisk_padding", e))?;

        let dtb = read_component(&mut reader, dtb_size, page_size, "Vendor::V3::dtb")?;

        let mut ramdisks = vec![];

        let v4_extra = if let Some((table_entry_num, bootconfig_size)) = v4_header {
            let mut ramdisk_reader = SliceReader::new(vendor_ramdisk_data);
            let mut ramdisk_metas = vec![];
            let mut total_ramdisk_size = 0u32;

            for index in 0..table_entry_num {
                let raw_entry: RawVendorV4RamdiskTableEntry = reader
                    .read_obj()
                    .map_err(|e| Error::DataRead("Vendor::V4::table_entry", e))?;

                let ramdisk_size =
                    util::check_bounds(raw_entry.ramdisk_size.get(), ..=vendor_ramdisk_size)
                        .map_err(|e| Error::IntOutOfBounds("Vendor::V4::ramdisk_size", e))?;

                let ramdisk_offset = raw_entry.ramdisk_offset.get();
                let ramdisk_name =
                    parse_string(&raw_entry.ramdisk_name, "Vendor::V4::ramdisk_name")?;

                if ramdisk_offset as usize != ramdisk_reader.offset() {
                    return Err(Error::VendorV4InvalidRamdiskEntryOffset {
                        index,
                        field_value: ramdisk_offset,
                        reader_pos: ramdisk_reader.offset(),
                    });
                }

                let ramdisk = ramdisk_reader
                    .read_slice(ramdisk_size as usize)
                    .map_err(|e| Error::DataRead("Vendor::V4::ramdisk", e))?;
                ramdisks.push(ramdisk.to_vec());

                ramdisk_metas.push(RamdiskMeta {
                    ramdisk_type: raw_entry.ramdisk_type.get(),
                    ramdisk_name: ramdisk_name.to_owned(),
                    board_id: raw_entry.board_id.map(|id| id.get()),
                });

                total_ramdisk_size = total_ramdisk_size
                    .checked_add(ramdisk_size)
                    .ok_or(Error::IntOverflow("Vendor::V4::total_ramdisk_size"))?;
            }

            if total_ramdisk_size != vendor_ramdisk_size {
                return Err(Error::VendorV4InvalidRamdiskSize {
                    field_value: vendor_ramdisk_size,
                    total_size: total_ramdisk_size,
                });
            }

            reader
                .read_zero_padding(page_size as usize)
                .map_err(|e| Error::DataRead("Vendor::V4::table_padding", e))?;

            let bootconfig =
                read_component(&mut reader, bootconfig_size, page_size, "Vendor::V4::bootconfig")?;
            let bootconfig = String::from_utf8(bootconfig).map_err(|e| {
                Error::StringNotUtf8("Vendor::V4::bootconfig", e.utf8_error(), e.into_bytes())
            })?;

            Some(VendorV4Extra {
                ramdisk_metas,
                bootconfig,
            })
        } else {
            ramdisks.push(vendor_ramdisk_data.to_vec());
            None
        };

        check_consumed(&reader)?;

        Ok(Self {
            page_size,
            kernel_addr: raw_v3.kernel_addr.get(),
            ramdisk_addr: raw_v3.ramdisk_addr.get(),
            cmdline: cmdline.to_owned(),
            tags_addr: raw_v3.tags_addr.get(),
            name: name.to_owned(),
            dtb,
            dtb_addr: raw_v3.dtb_addr.get(),
            ramdisks,
            v4_extra,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        // These are programmer errors. These states can't exist if this
        // instance was just parsed from a real boot image.
        if let Some(v4) = &self.v4_extra {
            if v4.ramdisk_metas.len() != self.ramdisks.len() {
                return Err(Error::MismatchedRamdiskCounts {
                    ramdisks: self.ramdisks.len(),
                    metas: v4.ramdisk_metas.len(),
                });
            }
        } else if self.ramdisks.len() > 1 {
            return Err(Error::VendorV3TooManyRamdisks(self.ramdisks.len()));
        }

        let vendor_ramdisk_size = check_size(
            self.ramdisks.iter().map(|r| r.len()).sum::<usize>(),
            COMPONENT_MAX_SIZE,
            "Vendor::V3::vendor_ramdisk_size",
        )?;
        let dtb_size = check_size(self.dtb.len(), COMPONENT_MAX_SIZE, "Vendor::V3::dtb_size")?;

        if self.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let mut buf = Vec::new();

        let raw_v3 = RawVendorV3 {
            magic: VENDOR_BOOT_MAGIC,
            header_version: self.header_version().into(),
            page_size: self.page_size.into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            vendor_ramdisk_size: vendor_ramdisk_size.into(),
            cmdline: format_string(&self.cmdline, "Vendor::V3::cmdline")?,
            tags_addr: self.tags_addr.into(),
            name: format_string(&self.name, "Vendor::V3::name")?,
            header_size: self.header_size().into(),
            dtb_size: dtb_size.into(),
            dtb_addr: self.dtb_addr.into(),
        };
        buf.extend_from_slice(raw_v3.as_bytes());

        if let Some(v4) = &self.v4_extra {
            let bootconfig_size = check_size(
                v4.bootconfig.len(),
                BOOTCONFIG_MAX_SIZE,
                "Vendor::V4::bootconfig_size",
            )?;
            let table_entry_num = self.ramdisks.len().to_u32().ok_or(Error::IntOverflow(
                "Vendor::V4::vendor_ramdisk_table_entry_num",
            ))?;
            let table_entry_size = mem::size_of::<RawVendorV4RamdiskTableEntry>() as u32;
            let table_size = table_entry_num
                .checked_mul(table_entry_size)
                .ok_or(Error::IntOverflow("Vendor::V4::vendor_ramdisk_table_size"))?;

            let raw_v4 = RawVendorV4Extra {
                vendor_ramdisk_table_size: table_size.into(),
                vendor_ramdisk_table_entry_num: table_entry_num.into(),
                vendor_ramdisk_table_entry_size: table_entry_size.into(),
                bootconfig_size: bootconfig_size.into(),
            };
            buf.extend_from_slice(raw_v4.as_bytes());
        }

        padding::pad_vec(&mut buf, self.page_size as usize);

        for ramdisk in &self.ramdisks {
            buf.extend_from_slice(ramdisk);
        }
        padding::pad_vec(&mut buf, self.page_size as usize);

        write_component(&mut buf, &self.dtb, self.page_size);

        if let Some(v4) = &self.v4_extra {
            let mut ramdisk_offset = 0u32;

            for (ramdisk, meta) in self.ramdisks.iter().zip(&v4.ramdisk_metas) {
                // Bounded by the total size check above.
                let ramdisk_size = ramdisk.len() as u32;

                let raw_entry = RawVendorV4RamdiskTableEntry {
                    ramdisk_size: ramdisk_size.into(),
                    ramdisk_offset: ramdisk_offset.into(),
                    ramdisk_type: meta.ramdisk_type.into(),
                    ramdisk_name: format_string(&meta.ramdisk_name, "Vendor::V4::ramdisk_name")?,
                    board_id: meta.board_id.map(|id| id.into()),
                };
                buf.extend_from_slice(raw_entry.as_bytes());

                ramdisk_offset += ramdisk_size;
            }
            padding::pad_vec(&mut buf, self.page_size as usize);

            write_component(&mut buf, v4.bootconfig.as_bytes(), self.page_size);
        }

        Ok(buf)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BootImage {
    V0Through2(BootImageV0Through2),
    V3Through4(BootImageV3Through4),
    VendorV3Through4(VendorBootImageV3Through4),
}

impl BootImageExt for BootImage {
    fn header_version(&self) -> u32 {
        match self {
            Self::V0Through2(b) => b.header_version(),
            Self::V3Through4(b) => b.header_version(),
            Self::VendorV3Through4(b) => b.header_version(),
        }
    }

    fn header_size(&self) -> u32 {
        match self {
            Self::V0Through2(b) => b.header_size(),
            Self::V3Through4(b) => b.header_size(),
            Self::VendorV3Through4(b) => b.header_size(),
        }
    }
}

impl BootImage {
    /// Parse a boot image of any supported type. The layouts are tried in
    /// order: v0-v2, v3-v4, then vendor v3-v4.
    pub fn detect(data: &[u8]) -> Result<Self> {
        match BootImageV0Through2::decode(data) {
            Ok(b) => return Ok(Self::V0Through2(b)),
            Err(Error::UnknownMagic(_) | Error::UnknownHeaderVersion(_)) => {}
            Err(e) => return Err(e),
        }

        match BootImageV3Through4::decode(data) {
            Ok(b) => return Ok(Self::V3Through4(b)),
            Err(Error::UnknownMagic(_) | Error::UnknownHeaderVersion(_)) => {}
            Err(e) => return Err(e),
        }

        match VendorBootImageV3Through4::decode(data) {
            Ok(b) => return Ok(Self::VendorV3Through4(b)),
            Err(Error::UnknownMagic(_) | Error::UnknownHeaderVersion(_)) => {}
            Err(e) => return Err(e),
        }

        Err(Error::UnknownFormat)
    }

    /// Parse a boot image and ensure that it has the expected layout.
    pub fn decode(data: &[u8], expected: BootVersion) -> Result<Self> {
        let image = Self::detect(data)?;

        if image.boot_version() != Some(expected) {
            return Err(Error::VersionMismatch {
                expected,
                actual: image.version_name(),
            });
        }

        Ok(image)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::V0Through2(b) => b.encode(),
            Self::V3Through4(b) => b.encode(),
            Self::VendorV3Through4(b) => b.encode(),
        }
    }

    /// The declared layout this image corresponds to. Legacy v0 and v1 images
    /// have no corresponding layout.
    pub fn boot_version(&self) -> Option<BootVersion> {
        match (self, self.header_version()) {
            (Self::V0Through2(_), 2) => Some(BootVersion::V2),
            (Self::V3Through4(_), 3) => Some(BootVersion::V3),
            (Self::V3Through4(_), 4) => Some(BootVersion::V4),
            (Self::VendorV3Through4(_), 3) => Some(BootVersion::VendorV3),
            (Self::VendorV3Through4(_), 4) => Some(BootVersion::VendorV4),
            _ => None,
        }
    }

    fn version_name(&self) -> String {
        match self {
            Self::VendorV3Through4(b) => format!("vendor_v{}", b.header_version()),
            b => format!("v{}", b.header_version()),
        }
    }

    /// Mutable references to the ramdisk fragments in on-disk order. Images
    /// that store a single ramdisk report no fragments when it is empty.
    pub fn ramdisks_mut(&mut self) -> Vec<&mut Vec<u8>> {
        match self {
            Self::V0Through2(b) => Some(&mut b.ramdisk)
                .into_iter()
                .filter(|r| !r.is_empty())
                .collect(),
            Self::V3Through4(b) => Some(&mut b.ramdisk)
                .into_iter()
                .filter(|r| !r.is_empty())
                .collect(),
            Self::VendorV3Through4(b) => {
                // v4 fragments are addressed by table entry, even when empty.
                let v3 = b.v4_extra.is_none();

                b.ramdisks
                    .iter_mut()
                    .filter(|r| !v3 || !r.is_empty())
                    .collect()
            }
        }
    }
}
