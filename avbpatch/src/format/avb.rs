// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io, ops::Range, str, sync::atomic::AtomicBool};

use bstr::ByteSlice;
use num_bigint_dig::{ModInverse, ToBigInt};
use num_traits::{Pow, ToPrimitive};
use ring::digest::{Algorithm, Context};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey, traits::PublicKeyParts};
use thiserror::Error;
use zerocopy::{
    IntoBytes,
    big_endian::{U32, U64},
};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    crypto::{self, RsaPublicKeyExt, SignatureAlgorithm},
    format::{
        hashtree::{self, HashTree},
        padding::{self, ZeroPadding},
    },
    stream::SliceReader,
    util::{self, NumBytes},
};

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 3;
pub const VERSION_SUB: u32 = 0;

pub const FOOTER_VERSION_MAJOR: u32 = 1;
pub const FOOTER_VERSION_MINOR: u32 = 0;

pub const HEADER_MAGIC: [u8; 4] = *b"AVB0";
pub const FOOTER_MAGIC: [u8; 4] = *b"AVBf";

/// Maximum header size. This is the same limit as what avbtool enforces. This
/// value is also used as the limit for individual descriptor fields to allow
/// for early fail. No individual field can actually be this size.
pub const HEADER_MAX_SIZE: u64 = 64 * 1024;

/// avbtool hardcodes a 4096 block size for appended non-sparse images.
pub const APPENDED_BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read {0:?} field")]
    ReadField(&'static str, #[source] io::Error),
    #[error("{0:?} field does not have NULL terminator")]
    StringNotNullTerminated(&'static str),
    #[error("{0:?} field is not valid UTF-8")]
    StringNotUtf8(&'static str),
    #[error("{0:?} field is not ASCII encoded: {1:?}")]
    StringNotAscii(&'static str, String),
    #[error("Header exceeds maximum size of {HEADER_MAX_SIZE}")]
    HeaderTooLarge,
    #[error("Descriptor padding is too long or data was not consumed")]
    PaddingTooLong,
    #[error("{0:?} field padding contains non-zero bytes")]
    PaddingNotZero(&'static str),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("Invalid VBMeta header magic: {0:?}")]
    InvalidHeaderMagic([u8; 4]),
    #[error("Invalid VBMeta footer magic: {0:?}")]
    InvalidFooterMagic([u8; 4]),
    #[error("RSA public key exponent not supported: {0}")]
    UnsupportedRsaPublicExponent(BigUint),
    #[error("Signature algorithm not supported: {0:?}")]
    UnsupportedAlgorithm(AlgorithmType),
    #[error("Hashing algorithm not supported: {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("Incorrect key size ({bytes}) for algorithm {1:?}", bytes = .0 * 8)]
    IncorrectKeySize(usize, AlgorithmType),
    #[error("RSA key size ({}) is not compatible with any AVB signing algorithm", .0 * 8)]
    UnsupportedKey(usize),
    #[error("Hash tree does not immediately follow image data")]
    HashTreeGap,
    #[error("Hash tree images with FEC data are not supported")]
    FecUnsupported,
    #[error("Expected {expected} bytes of image data, but have {actual}")]
    ImageSizeMismatch { expected: u64, actual: u64 },
    #[error("Expected root digest {expected}, but have {actual}")]
    InvalidRootDigest { expected: String, actual: String },
    #[error("Must have exactly one hash or hash tree descriptor")]
    NoAppendedDescriptor,
    #[error("{0} byte image size is too small to fit header")]
    TooSmallForHeader(u64),
    #[error("{0} byte image size is too small to fit footer")]
    TooSmallForFooter(u64),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Hash tree error")]
    HashTree(#[from] hashtree::Error),
    #[error("RSA error")]
    Rsa(#[from] rsa::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub(crate) fn ring_algorithm(name: &str, for_verify: bool) -> Result<&'static Algorithm> {
    match name {
        "sha1" if for_verify => Ok(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY),
        "sha256" => Ok(&ring::digest::SHA256),
        "sha512" => Ok(&ring::digest::SHA512),
        a => Err(Error::UnsupportedHashAlgorithm(a.to_owned())),
    }
}

fn len_u32(len: usize, field: &'static str) -> Result<u32> {
    if len > HEADER_MAX_SIZE as usize {
        return Err(Error::FieldOutOfBounds(field));
    }

    len.to_u32().ok_or(Error::FieldOutOfBounds(field))
}

fn len_usize(len: u64, field: &'static str) -> Result<usize> {
    if len > HEADER_MAX_SIZE {
        return Err(Error::FieldOutOfBounds(field));
    }

    len.to_usize().ok_or(Error::FieldOutOfBounds(field))
}

fn read_obj<T>(reader: &mut SliceReader, field: &'static str) -> Result<T>
where
    T: zerocopy::FromBytes + zerocopy::KnownLayout + zerocopy::Immutable,
{
    reader.read_obj().map_err(|e| Error::ReadField(field, e))
}

fn read_bytes<'a>(
    reader: &mut SliceReader<'a>,
    size: usize,
    field: &'static str,
) -> Result<&'a [u8]> {
    reader.read_slice(size).map_err(|e| Error::ReadField(field, e))
}

/// Read a string that is not NULL terminated.
fn read_string(reader: &mut SliceReader, size: usize, field: &'static str) -> Result<String> {
    let data = read_bytes(reader, size, field)?;

    str::from_utf8(data)
        .map(|s| s.to_owned())
        .map_err(|_| Error::StringNotUtf8(field))
}

fn read_null(reader: &mut SliceReader, field: &'static str) -> Result<()> {
    let [byte] = reader
        .read_array::<1>()
        .map_err(|e| Error::ReadField(field, e))?;
    if byte != 0 {
        return Err(Error::StringNotNullTerminated(field));
    }

    Ok(())
}

/// Parse the fixed-size, zero-padded hash algorithm name.
fn parse_hash_algorithm(data: &[u8; 32]) -> Result<String> {
    let name = str::from_utf8(data.trim_end_padding())
        .map_err(|_| Error::StringNotUtf8("hash_algorithm"))?;
    if !name.is_ascii() {
        return Err(Error::StringNotAscii("hash_algorithm", name.to_owned()));
    }

    Ok(name.to_owned())
}

fn format_hash_algorithm(name: &str) -> Result<[u8; 32]> {
    if !name.is_ascii() {
        return Err(Error::StringNotAscii("hash_algorithm", name.to_owned()));
    }

    name.as_bytes()
        .to_padded_array()
        .ok_or(Error::FieldOutOfBounds("hash_algorithm"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlgorithmType {
    None,
    Sha256Rsa2048,
    Sha256Rsa4096,
    Sha256Rsa8192,
    Sha512Rsa2048,
    Sha512Rsa4096,
    Sha512Rsa8192,
    Unknown(u32),
}

impl AlgorithmType {
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Sha256Rsa2048,
            2 => Self::Sha256Rsa4096,
            3 => Self::Sha256Rsa8192,
            4 => Self::Sha512Rsa2048,
            5 => Self::Sha512Rsa4096,
            6 => Self::Sha512Rsa8192,
            v => Self::Unknown(v),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Sha256Rsa2048 => 1,
            Self::Sha256Rsa4096 => 2,
            Self::Sha256Rsa8192 => 3,
            Self::Sha512Rsa2048 => 4,
            Self::Sha512Rsa4096 => 5,
            Self::Sha512Rsa8192 => 6,
            Self::Unknown(v) => v,
        }
    }

    pub fn to_digest_algorithm(self) -> Option<SignatureAlgorithm> {
        match self {
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 | Self::Sha256Rsa8192 => {
                Some(SignatureAlgorithm::Sha256WithRsa)
            }
            Self::Sha512Rsa2048 | Self::Sha512Rsa4096 | Self::Sha512Rsa8192 => {
                Some(SignatureAlgorithm::Sha512WithRsa)
            }
            _ => None,
        }
    }

    pub fn digest_len(self) -> usize {
        self.to_digest_algorithm()
            .map(|a| a.digest_len())
            .unwrap_or_default()
    }

    pub fn signature_len(self) -> usize {
        match self {
            Self::None | Self::Unknown(_) => 0,
            Self::Sha256Rsa2048 | Self::Sha512Rsa2048 => 256,
            Self::Sha256Rsa4096 | Self::Sha512Rsa4096 => 512,
            Self::Sha256Rsa8192 | Self::Sha512Rsa8192 => 1024,
        }
    }

    pub fn public_key_len(self) -> usize {
        match self {
            Self::None | Self::Unknown(_) => 0,
            Self::Sha256Rsa2048 | Self::Sha512Rsa2048 => 8 + 2 * 2048 / 8,
            Self::Sha256Rsa4096 | Self::Sha512Rsa4096 => 8 + 2 * 4096 / 8,
            Self::Sha256Rsa8192 | Self::Sha512Rsa8192 => 8 + 2 * 8192 / 8,
        }
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        let Some(algo) = self.to_digest_algorithm() else {
            return vec![];
        };

        algo.hash(data)
    }

    pub fn sign(self, key: &RsaPrivateKey, digest: &[u8]) -> Result<Vec<u8>> {
        let Some(algo) = self.to_digest_algorithm() else {
            return if self == Self::None {
                Ok(vec![])
            } else {
                Err(Error::UnsupportedAlgorithm(self))
            };
        };

        crypto::sign(key, algo, digest).map_err(|e| e.into())
    }

    pub fn verify(self, key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
        let Some(algo) = self.to_digest_algorithm() else {
            return if self == Self::None {
                Ok(())
            } else {
                Err(Error::UnsupportedAlgorithm(self))
            };
        };

        key.verify_sig(algo, digest, signature)
            .map_err(|e| e.into())
    }
}

/// Raw on-disk layout for the fixed portion of the vbmeta header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawHeader {
    magic: [u8; 4],
    required_libavb_version_major: U32,
    required_libavb_version_minor: U32,
    authentication_data_block_size: U64,
    auxiliary_data_block_size: U64,
    algorithm_type: U32,
    hash_offset: U64,
    hash_size: U64,
    signature_offset: U64,
    signature_size: U64,
    public_key_offset: U64,
    public_key_size: U64,
    public_key_metadata_offset: U64,
    public_key_metadata_size: U64,
    descriptors_offset: U64,
    descriptors_size: U64,
    rollback_index: U64,
    flags: U32,
    rollback_index_location: U32,
    release_string: [u8; 48],
    reserved: [u8; 80],
}

/// Raw on-disk layout for the vbmeta footer.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawFooter {
    magic: [u8; 4],
    version_major: U32,
    version_minor: U32,
    original_image_size: U64,
    vbmeta_offset: U64,
    vbmeta_size: U64,
    reserved: [u8; 28],
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawDescriptorHeader {
    tag: U64,
    num_bytes_following: U64,
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawPropertyDescriptor {
    key_num_bytes: U64,
    value_num_bytes: U64,
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawHashTreeDescriptor {
    dm_verity_version: U32,
    image_size: U64,
    tree_offset: U64,
    tree_size: U64,
    data_block_size: U32,
    hash_block_size: U32,
    fec_num_roots: U32,
    fec_offset: U64,
    fec_size: U64,
    hash_algorithm: [u8; 32],
    partition_name_len: U32,
    salt_len: U32,
    root_digest_len: U32,
    flags: U32,
    reserved: [u8; 60],
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawHashDescriptor {
    image_size: U64,
    hash_algorithm: [u8; 32],
    partition_name_len: U32,
    salt_len: U32,
    root_digest_len: U32,
    flags: U32,
    reserved: [u8; 60],
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawKernelCmdlineDescriptor {
    flags: U32,
    kernel_cmdline_length: U32,
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawChainPartitionDescriptor {
    rollback_index_location: U32,
    partition_name_len: U32,
    public_key_len: U32,
    flags: U32,
    reserved: [u8; 60],
}

trait DescriptorTag {
    const TAG: u64;
}

#[derive(Clone, Eq, PartialEq)]
pub struct PropertyDescriptor {
    pub key: String,
    pub value: Vec<u8>,
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("key", &self.key)
            .field("value", &self.value.as_bstr())
            .finish()
    }
}

impl DescriptorTag for PropertyDescriptor {
    const TAG: u64 = 0;
}

impl PropertyDescriptor {
    fn decode(reader: &mut SliceReader) -> Result<Self> {
        let raw: RawPropertyDescriptor = read_obj(reader, "property_descriptor")?;
        let key_size = len_usize(raw.key_num_bytes.get(), "key_size")?;
        let value_size = len_usize(raw.value_num_bytes.get(), "value_size")?;

        let key = read_string(reader, key_size, "key")?;
        read_null(reader, "key")?;

        let value = read_bytes(reader, value_size, "value")?.to_vec();
        // The non-string value is also null terminated.
        read_null(reader, "value")?;

        Ok(Self { key, value })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = RawPropertyDescriptor {
            key_num_bytes: U64::new(len_u32(self.key.len(), "key_size")?.into()),
            value_num_bytes: U64::new(len_u32(self.value.len(), "value_size")?.into()),
        };

        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.value);
        buf.push(0);

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct HashTreeDescriptor {
    pub dm_verity_version: u32,
    pub image_size: u64,
    pub tree_offset: u64,
    pub tree_size: u64,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub fec_num_roots: u32,
    pub fec_offset: u64,
    pub fec_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    pub salt: Vec<u8>,
    pub root_digest: Vec<u8>,
    pub flags: u32,
    pub reserved: [u8; 60],
}

impl fmt::Debug for HashTreeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTreeDescriptor")
            .field("dm_verity_version", &self.dm_verity_version)
            .field("image_size", &self.image_size)
            .field("tree_offset", &self.tree_offset)
            .field("tree_size", &self.tree_size)
            .field("data_block_size", &self.data_block_size)
            .field("hash_block_size", &self.hash_block_size)
            .field("fec_num_roots", &self.fec_num_roots)
            .field("fec_offset", &self.fec_offset)
            .field("fec_size", &self.fec_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("partition_name", &self.partition_name)
            .field("salt", &hex::encode(&self.salt))
            .field("root_digest", &hex::encode(&self.root_digest))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl DescriptorTag for HashTreeDescriptor {
    const TAG: u64 = 1;
}

impl HashTreeDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;
    pub const FLAG_CHECK_AT_MOST_ONCE: u32 = 1 << 1;

    fn decode(reader: &mut SliceReader) -> Result<Self> {
        let raw: RawHashTreeDescriptor = read_obj(reader, "hash_tree_descriptor")?;
        let hash_algorithm = parse_hash_algorithm(&raw.hash_algorithm)?;
        let partition_name_len =
            len_usize(raw.partition_name_len.get().into(), "partition_name_len")?;
        let salt_len = len_usize(raw.salt_len.get().into(), "salt_len")?;
        let root_digest_len = len_usize(raw.root_digest_len.get().into(), "root_digest_len")?;

        // Not NULL-terminated.
        let partition_name = read_string(reader, partition_name_len, "partition_name")?;
        let salt = read_bytes(reader, salt_len, "salt")?.to_vec();
        let root_digest = read_bytes(reader, root_digest_len, "root_digest")?.to_vec();

        Ok(Self {
            dm_verity_version: raw.dm_verity_version.get(),
            image_size: raw.image_size.get(),
            tree_offset: raw.tree_offset.get(),
            tree_size: raw.tree_size.get(),
            data_block_size: raw.data_block_size.get(),
            hash_block_size: raw.hash_block_size.get(),
            fec_num_roots: raw.fec_num_roots.get(),
            fec_offset: raw.fec_offset.get(),
            fec_size: raw.fec_size.get(),
            hash_algorithm,
            partition_name,
            salt,
            root_digest,
            flags: raw.flags.get(),
            reserved: raw.reserved,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = RawHashTreeDescriptor {
            dm_verity_version: self.dm_verity_version.into(),
            image_size: self.image_size.into(),
            tree_offset: self.tree_offset.into(),
            tree_size: self.tree_size.into(),
            data_block_size: self.data_block_size.into(),
            hash_block_size: self.hash_block_size.into(),
            fec_num_roots: self.fec_num_roots.into(),
            fec_offset: self.fec_offset.into(),
            fec_size: self.fec_size.into(),
            hash_algorithm: format_hash_algorithm(&self.hash_algorithm)?,
            partition_name_len: len_u32(self.partition_name.len(), "partition_name_len")?.into(),
            salt_len: len_u32(self.salt.len(), "salt_len")?.into(),
            root_digest_len: len_u32(self.root_digest.len(), "root_digest_len")?.into(),
            flags: self.flags.into(),
            reserved: self.reserved,
        };

        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(self.partition_name.as_bytes());
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(&self.root_digest);

        Ok(())
    }

    /// Ensure that the image data is immediately followed by the hash tree.
    fn check_offsets(&self) -> Result<()> {
        if self.tree_offset != self.image_size {
            return Err(Error::HashTreeGap);
        } else if self.fec_num_roots != 0 || self.fec_size != 0 {
            return Err(Error::FecUnsupported);
        }

        Ok(())
    }

    fn hash_tree(&self, for_verify: bool) -> Result<HashTree> {
        let algorithm = ring_algorithm(&self.hash_algorithm, for_verify)?;

        Ok(HashTree::new(self.data_block_size, algorithm, &self.salt))
    }

    fn check_image_size(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 != self.image_size {
            return Err(Error::ImageSizeMismatch {
                expected: self.image_size,
                actual: data.len() as u64,
            });
        }

        Ok(())
    }

    /// Build a fresh hash tree for `data` and update the image size, tree
    /// location, and root digest to match. Returns the hash tree data, which
    /// must be stored immediately after the image data.
    pub fn generate(&mut self, data: &[u8], cancel_signal: &AtomicBool) -> Result<Vec<u8>> {
        if self.fec_num_roots != 0 {
            return Err(Error::FecUnsupported);
        }

        let hash_tree = self.hash_tree(false)?;
        let (root_digest, hash_tree_data) = hash_tree.generate(data, cancel_signal)?;

        self.image_size = data.len() as u64;
        self.tree_offset = self.image_size;
        self.tree_size = hash_tree_data.len() as u64;
        self.fec_offset = 0;
        self.fec_size = 0;
        self.root_digest = root_digest;

        Ok(hash_tree_data)
    }

    /// Update the hash tree and root digest after `ranges` of `data` changed.
    /// The image size cannot change. The descriptor is left untouched if an
    /// error occurs.
    pub fn update(
        &mut self,
        data: &[u8],
        hash_tree_data: &mut [u8],
        ranges: &[Range<u64>],
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        self.check_offsets()?;
        self.check_image_size(data)?;

        let hash_tree = self.hash_tree(false)?;
        let root_digest = hash_tree.update(data, ranges, hash_tree_data, cancel_signal)?;

        self.root_digest = root_digest;

        Ok(())
    }

    /// Verify the root digest and hash tree against the image data.
    pub fn verify(
        &self,
        data: &[u8],
        hash_tree_data: &[u8],
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        self.check_offsets()?;
        self.check_image_size(data)?;

        let hash_tree = self.hash_tree(true)?;
        hash_tree.verify(data, &self.root_digest, hash_tree_data, cancel_signal)?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct HashDescriptor {
    pub image_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    pub salt: Vec<u8>,
    pub root_digest: Vec<u8>,
    pub flags: u32,
    pub reserved: [u8; 60],
}

impl fmt::Debug for HashDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashDescriptor")
            .field("image_size", &self.image_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("partition_name", &self.partition_name)
            .field("salt", &hex::encode(&self.salt))
            .field("root_digest", &hex::encode(&self.root_digest))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl DescriptorTag for HashDescriptor {
    const TAG: u64 = 2;
}

impl HashDescriptor {
    fn decode(reader: &mut SliceReader) -> Result<Self> {
        let raw: RawHashDescriptor = read_obj(reader, "hash_descriptor")?;
        let hash_algorithm = parse_hash_algorithm(&raw.hash_algorithm)?;
        let partition_name_len =
            len_usize(raw.partition_name_len.get().into(), "partition_name_len")?;
        let salt_len = len_usize(raw.salt_len.get().into(), "salt_len")?;
        let root_digest_len = len_usize(raw.root_digest_len.get().into(), "root_digest_len")?;

        // Not NULL-terminated.
        let partition_name = read_string(reader, partition_name_len, "partition_name")?;
        let salt = read_bytes(reader, salt_len, "salt")?.to_vec();
        let root_digest = read_bytes(reader, root_digest_len, "root_digest")?.to_vec();

        Ok(Self {
            image_size: raw.image_size.get(),
            hash_algorithm,
            partition_name,
            salt,
            root_digest,
            flags: raw.flags.get(),
            reserved: raw.reserved,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = RawHashDescriptor {
            image_size: self.image_size.into(),
            hash_algorithm: format_hash_algorithm(&self.hash_algorithm)?,
            partition_name_len: len_u32(self.partition_name.len(), "partition_name_len")?.into(),
            salt_len: len_u32(self.salt.len(), "salt_len")?.into(),
            root_digest_len: len_u32(self.root_digest.len(), "root_digest_len")?.into(),
            flags: self.flags.into(),
            reserved: self.reserved,
        };

        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(self.partition_name.as_bytes());
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(&self.root_digest);

        Ok(())
    }

    fn calculate(&self, data: &[u8], for_verify: bool) -> Result<ring::digest::Digest> {
        let algorithm = ring_algorithm(&self.hash_algorithm, for_verify)?;
        let mut context = Context::new(algorithm);
        context.update(&self.salt);
        context.update(data);

        Ok(context.finish())
    }

    /// Update the image size and root digest from the image data.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        let digest = self.calculate(data, false)?;
        self.image_size = data.len() as u64;
        self.root_digest = digest.as_ref().to_vec();
        Ok(())
    }

    /// Verify the root digest against the image data.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 != self.image_size {
            return Err(Error::ImageSizeMismatch {
                expected: self.image_size,
                actual: data.len() as u64,
            });
        }

        let digest = self.calculate(data, true)?;

        if self.root_digest != digest.as_ref() {
            return Err(Error::InvalidRootDigest {
                expected: hex::encode(&self.root_digest),
                actual: hex::encode(digest),
            });
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelCmdlineDescriptor {
    pub flags: u32,
    pub cmdline: String,
}

impl KernelCmdlineDescriptor {
    pub const FLAG_USE_ONLY_IF_HASHTREE_NOT_DISABLED: u32 = 1 << 0;
    pub const FLAG_USE_ONLY_IF_HASHTREE_DISABLED: u32 = 1 << 1;

    fn decode(reader: &mut SliceReader) -> Result<Self> {
        let raw: RawKernelCmdlineDescriptor = read_obj(reader, "kernel_cmdline_descriptor")?;
        let cmdline_len = len_usize(raw.kernel_cmdline_length.get().into(), "cmdline_len")?;

        // Not NULL-terminated.
        let cmdline = read_string(reader, cmdline_len, "cmdline")?;

        Ok(Self {
            flags: raw.flags.get(),
            cmdline,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = RawKernelCmdlineDescriptor {
            flags: self.flags.into(),
            kernel_cmdline_length: len_u32(self.cmdline.len(), "cmdline_len")?.into(),
        };

        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(self.cmdline.as_bytes());

        Ok(())
    }
}

impl DescriptorTag for KernelCmdlineDescriptor {
    const TAG: u64 = 3;
}

#[derive(Clone, Eq, PartialEq)]
pub struct ChainPartitionDescriptor {
    pub rollback_index_location: u32,
    pub partition_name: String,
    pub public_key: Vec<u8>,
    pub flags: u32,
    pub reserved: [u8; 60],
}

impl ChainPartitionDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;

    fn decode(reader: &mut SliceReader) -> Result<Self> {
        let raw: RawChainPartitionDescriptor = read_obj(reader, "chain_partition_descriptor")?;
        let partition_name_len =
            len_usize(raw.partition_name_len.get().into(), "partition_name_len")?;
        let public_key_len = len_usize(raw.public_key_len.get().into(), "public_key_len")?;

        // Not NULL-terminated.
        let partition_name = read_string(reader, partition_name_len, "partition_name")?;
        let public_key = read_bytes(reader, public_key_len, "public_key")?.to_vec();

        Ok(Self {
            rollback_index_location: raw.rollback_index_location.get(),
            partition_name,
            public_key,
            flags: raw.flags.get(),
            reserved: raw.reserved,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = RawChainPartitionDescriptor {
            rollback_index_location: self.rollback_index_location.into(),
            partition_name_len: len_u32(self.partition_name.len(), "partition_name_len")?.into(),
            public_key_len: len_u32(self.public_key.len(), "public_key_len")?.into(),
            flags: self.flags.into(),
            reserved: self.reserved,
        };

        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(self.partition_name.as_bytes());
        buf.extend_from_slice(&self.public_key);

        Ok(())
    }
}

impl fmt::Debug for ChainPartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainPartitionDescriptor")
            .field("rollback_index_location", &self.rollback_index_location)
            .field("partition_name", &self.partition_name)
            .field("public_key", &hex::encode(&self.public_key))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl DescriptorTag for ChainPartitionDescriptor {
    const TAG: u64 = 4;
}

#[derive(Clone, Eq, PartialEq)]
pub enum Descriptor {
    Property(PropertyDescriptor),
    HashTree(HashTreeDescriptor),
    Hash(HashDescriptor),
    KernelCmdline(KernelCmdlineDescriptor),
    ChainPartition(ChainPartitionDescriptor),
    Unknown { tag: u64, data: Vec<u8> },
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Property(d) => d.fmt(f),
            Self::HashTree(d) => d.fmt(f),
            Self::Hash(d) => d.fmt(f),
            Self::KernelCmdline(d) => d.fmt(f),
            Self::ChainPartition(d) => d.fmt(f),
            Self::Unknown { tag, data } => f
                .debug_struct("Unknown")
                .field("tag", tag)
                .field("data", &NumBytes(data.len()))
                .finish(),
        }
    }
}

impl Descriptor {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Property(_) => "Property",
            Self::HashTree(_) => "HashTree",
            Self::Hash(_) => "Hash",
            Self::KernelCmdline(_) => "KernelCmdline",
            Self::ChainPartition(_) => "ChainPartition",
            Self::Unknown { .. } => "Unknown",
        }
    }

    pub fn partition_name(&self) -> Option<&str> {
        match self {
            Self::HashTree(d) => Some(&d.partition_name),
            Self::Hash(d) => Some(&d.partition_name),
            Self::ChainPartition(d) => Some(&d.partition_name),
            _ => None,
        }
    }

    fn decode(reader: &mut SliceReader) -> Result<Self> {
        let raw: RawDescriptorHeader = read_obj(reader, "descriptor_header")?;
        let tag = raw.tag.get();
        let nbf = len_usize(raw.num_bytes_following.get(), "num_bytes_following")?;

        let body = read_bytes(reader, nbf, "descriptor")?;
        let mut inner = SliceReader::new(body);

        let descriptor = match tag {
            PropertyDescriptor::TAG => Self::Property(PropertyDescriptor::decode(&mut inner)?),
            HashTreeDescriptor::TAG => Self::HashTree(HashTreeDescriptor::decode(&mut inner)?),
            HashDescriptor::TAG => Self::Hash(HashDescriptor::decode(&mut inner)?),
            KernelCmdlineDescriptor::TAG => {
                Self::KernelCmdline(KernelCmdlineDescriptor::decode(&mut inner)?)
            }
            ChainPartitionDescriptor::TAG => {
                Self::ChainPartition(ChainPartitionDescriptor::decode(&mut inner)?)
            }
            _ => {
                let data = read_bytes(&mut inner, nbf, "descriptor_data")?.to_vec();
                Self::Unknown { tag, data }
            }
        };

        // The descriptor data is always aligned to 8 bytes.
        let padding = inner
            .read_padding(8)
            .map_err(|e| Error::ReadField("descriptor_padding", e))?;
        if !util::is_zero(padding) {
            return Err(Error::PaddingNotZero("descriptor"));
        } else if !inner.is_empty() {
            return Err(Error::PaddingTooLong);
        }

        Ok(descriptor)
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut inner = Vec::new();

        let tag = match self {
            Self::Property(d) => {
                d.encode(&mut inner)?;
                PropertyDescriptor::TAG
            }
            Self::HashTree(d) => {
                d.encode(&mut inner)?;
                HashTreeDescriptor::TAG
            }
            Self::Hash(d) => {
                d.encode(&mut inner)?;
                HashDescriptor::TAG
            }
            Self::KernelCmdline(d) => {
                d.encode(&mut inner)?;
                KernelCmdlineDescriptor::TAG
            }
            Self::ChainPartition(d) => {
                d.encode(&mut inner)?;
                ChainPartitionDescriptor::TAG
            }
            Self::Unknown { tag, data } => {
                inner.extend_from_slice(data);
                *tag
            }
        };

        padding::pad_vec(&mut inner, 8);

        let raw = RawDescriptorHeader {
            tag: tag.into(),
            num_bytes_following: u64::from(len_u32(inner.len(), "num_bytes_following")?).into(),
        };

        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(&inner);

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendedDescriptorRef<'a> {
    HashTree(&'a HashTreeDescriptor),
    Hash(&'a HashDescriptor),
}

#[derive(Debug, Eq, PartialEq)]
pub enum AppendedDescriptorMut<'a> {
    HashTree(&'a mut HashTreeDescriptor),
    Hash(&'a mut HashDescriptor),
}

#[derive(Clone, Eq, PartialEq)]
pub struct Header {
    pub required_libavb_version_major: u32,
    pub required_libavb_version_minor: u32,
    pub algorithm_type: AlgorithmType,
    pub hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub public_key_metadata: Vec<u8>,
    pub descriptors: Vec<Descriptor>,
    pub rollback_index: u64,
    pub flags: u32,
    pub rollback_index_location: u32,
    pub release_string: String,
    pub reserved: [u8; 80],
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field(
                "required_libavb_version_major",
                &self.required_libavb_version_major,
            )
            .field(
                "required_libavb_version_minor",
                &self.required_libavb_version_minor,
            )
            .field("algorithm_type", &self.algorithm_type)
            .field("hash", &hex::encode(&self.hash))
            .field("signature", &hex::encode(&self.signature))
            .field("public_key", &hex::encode(&self.public_key))
            .field(
                "public_key_metadata",
                &hex::encode(&self.public_key_metadata),
            )
            .field("descriptors", &self.descriptors)
            .field("rollback_index", &self.rollback_index)
            .field("flags", &self.flags)
            .field("rollback_index_location", &self.rollback_index_location)
            .field("release_string", &self.release_string)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Header {
    pub const SIZE: usize = 256;

    /// Parse a header from the start of `data`. Trailing data after the
    /// auxiliary block is ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data);
        let raw: RawHeader = read_obj(&mut reader, "header")?;

        if raw.magic != HEADER_MAGIC {
            return Err(Error::InvalidHeaderMagic(raw.magic));
        }

        let auth_block_size = raw.authentication_data_block_size.get();
        let aux_block_size = raw.auxiliary_data_block_size.get();
        let hash_offset = raw.hash_offset.get();
        let hash_size = raw.hash_size.get();
        let signature_offset = raw.signature_offset.get();
        let signature_size = raw.signature_size.get();

        let auth_block_combined = hash_size
            .checked_add(signature_size)
            .ok_or(Error::FieldOutOfBounds("auth_block_combined"))?;
        let auth_block_padding = padding::calc(auth_block_combined, 64);

        if auth_block_combined.checked_add(auth_block_padding) != Some(auth_block_size) {
            return Err(Error::FieldOutOfBounds("auth_block_size"));
        } else if hash_offset > auth_block_combined - hash_size {
            return Err(Error::FieldOutOfBounds("hash_offset"));
        } else if signature_offset > auth_block_combined - signature_size {
            return Err(Error::FieldOutOfBounds("signature_offset"));
        }

        let public_key_offset = raw.public_key_offset.get();
        let public_key_size = raw.public_key_size.get();
        let public_key_metadata_offset = raw.public_key_metadata_offset.get();
        let public_key_metadata_size = raw.public_key_metadata_size.get();
        let descriptors_offset = raw.descriptors_offset.get();
        let descriptors_size = raw.descriptors_size.get();

        let aux_block_combined = public_key_size
            .checked_add(public_key_metadata_size)
            .and_then(|s| s.checked_add(descriptors_size))
            .ok_or(Error::FieldOutOfBounds("aux_block_combined"))?;
        let aux_block_padding = padding::calc(aux_block_combined, 64);

        if aux_block_combined.checked_add(aux_block_padding) != Some(aux_block_size) {
            return Err(Error::FieldOutOfBounds("aux_block_size"));
        } else if public_key_offset > aux_block_combined - public_key_size {
            return Err(Error::FieldOutOfBounds("public_key_offset"));
        } else if public_key_metadata_offset > aux_block_combined - public_key_metadata_size {
            return Err(Error::FieldOutOfBounds("public_key_metadata_offset"));
        } else if descriptors_offset > aux_block_combined - descriptors_size {
            return Err(Error::FieldOutOfBounds("descriptors_offset"));
        }

        let total_size = (Self::SIZE as u64)
            .checked_add(auth_block_size)
            .and_then(|v| v.checked_add(aux_block_size))
            .ok_or(Error::FieldOutOfBounds("total_size"))?;
        if total_size > HEADER_MAX_SIZE {
            return Err(Error::HeaderTooLarge);
        }

        // All of the size fields above are now guaranteed to fit in usize.
        let auth_block = read_bytes(&mut reader, auth_block_size as usize, "auth_block")?;
        let aux_block = read_bytes(&mut reader, aux_block_size as usize, "aux_block")?;

        // When we verify() the signatures, we're doing so on re-serialized
        // fields. The padding is the only thing that can escape this, so make
        // sure they don't contain any data.
        if !util::is_zero(&auth_block[auth_block_combined as usize..]) {
            return Err(Error::PaddingNotZero("auth_block"));
        } else if !util::is_zero(&aux_block[aux_block_combined as usize..]) {
            return Err(Error::PaddingNotZero("aux_block"));
        }

        let hash = &auth_block[hash_offset as usize..][..hash_size as usize];
        let signature = &auth_block[signature_offset as usize..][..signature_size as usize];
        let public_key = &aux_block[public_key_offset as usize..][..public_key_size as usize];
        let public_key_metadata =
            &aux_block[public_key_metadata_offset as usize..][..public_key_metadata_size as usize];

        let mut descriptors = vec![];
        let mut descriptor_reader = SliceReader::new(
            &aux_block[descriptors_offset as usize..][..descriptors_size as usize],
        );
        while !descriptor_reader.is_empty() {
            descriptors.push(Descriptor::decode(&mut descriptor_reader)?);
        }

        // The release string must keep at least one NULL terminator.
        if raw.release_string[raw.release_string.len() - 1] != 0 {
            return Err(Error::StringNotNullTerminated("release_string"));
        }
        let release_string = str::from_utf8(raw.release_string.trim_end_padding())
            .map_err(|_| Error::StringNotUtf8("release_string"))?
            .to_owned();

        Ok(Self {
            required_libavb_version_major: raw.required_libavb_version_major.get(),
            required_libavb_version_minor: raw.required_libavb_version_minor.get(),
            algorithm_type: AlgorithmType::from_raw(raw.algorithm_type.get()),
            hash: hash.to_vec(),
            signature: signature.to_vec(),
            public_key: public_key.to_vec(),
            public_key_metadata: public_key_metadata.to_vec(),
            descriptors,
            rollback_index: raw.rollback_index.get(),
            flags: raw.flags.get(),
            rollback_index_location: raw.rollback_index_location.get(),
            release_string,
            reserved: raw.reserved,
        })
    }

    /// Serialize the header, followed by the authentication and auxiliary
    /// blocks.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_internal(false)
    }

    fn encode_internal(&self, skip_auth_block: bool) -> Result<Vec<u8>> {
        let mut descriptors_raw = Vec::new();
        for d in &self.descriptors {
            d.encode(&mut descriptors_raw)?;
        }

        // Auth block.
        let auth_block_data_size = self
            .hash
            .len()
            .checked_add(self.signature.len())
            .ok_or(Error::FieldOutOfBounds("auth_block_data_size"))?;
        let auth_block_padding_size = padding::calc(auth_block_data_size, 64);
        let auth_block_size = auth_block_data_size + auth_block_padding_size;
        let hash_offset = 0usize;
        let signature_offset = hash_offset + self.hash.len();

        // Aux block.
        let aux_block_data_size = descriptors_raw
            .len()
            .checked_add(self.public_key.len())
            .and_then(|s| s.checked_add(self.public_key_metadata.len()))
            .ok_or(Error::FieldOutOfBounds("aux_block_data_size"))?;
        let aux_block_padding_size = padding::calc(aux_block_data_size, 64);
        let aux_block_size = aux_block_data_size + aux_block_padding_size;
        let descriptors_offset = 0usize;
        let public_key_offset = descriptors_offset + descriptors_raw.len();
        let public_key_metadata_offset = public_key_offset + self.public_key.len();

        let total_size = Self::SIZE
            .checked_add(auth_block_size)
            .and_then(|s| s.checked_add(aux_block_size))
            .ok_or(Error::FieldOutOfBounds("total_size"))?;
        if total_size > HEADER_MAX_SIZE as usize {
            return Err(Error::HeaderTooLarge);
        }

        if self.release_string.len() >= 48 {
            return Err(Error::FieldOutOfBounds("release_string"));
        }
        let release_string = self
            .release_string
            .as_bytes()
            .to_padded_array()
            .ok_or(Error::FieldOutOfBounds("release_string"))?;

        // All sizes and offsets are now guaranteed to fit in a u64.
        let raw = RawHeader {
            magic: HEADER_MAGIC,
            required_libavb_version_major: self.required_libavb_version_major.into(),
            required_libavb_version_minor: self.required_libavb_version_minor.into(),
            authentication_data_block_size: (auth_block_size as u64).into(),
            auxiliary_data_block_size: (aux_block_size as u64).into(),
            algorithm_type: self.algorithm_type.to_raw().into(),
            hash_offset: (hash_offset as u64).into(),
            hash_size: (self.hash.len() as u64).into(),
            signature_offset: (signature_offset as u64).into(),
            signature_size: (self.signature.len() as u64).into(),
            public_key_offset: (public_key_offset as u64).into(),
            public_key_size: (self.public_key.len() as u64).into(),
            public_key_metadata_offset: (public_key_metadata_offset as u64).into(),
            public_key_metadata_size: (self.public_key_metadata.len() as u64).into(),
            descriptors_offset: (descriptors_offset as u64).into(),
            descriptors_size: (descriptors_raw.len() as u64).into(),
            rollback_index: self.rollback_index.into(),
            flags: self.flags.into(),
            rollback_index_location: self.rollback_index_location.into(),
            release_string,
            reserved: self.reserved,
        };

        let mut buf = Vec::with_capacity(total_size);
        buf.extend_from_slice(raw.as_bytes());

        if !skip_auth_block {
            buf.extend_from_slice(&self.hash);
            buf.extend_from_slice(&self.signature);
            buf.resize(buf.len() + auth_block_padding_size, 0);
        }

        buf.extend_from_slice(&descriptors_raw);
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.public_key_metadata);
        buf.resize(buf.len() + aux_block_padding_size, 0);

        Ok(buf)
    }

    /// Get the first hash or hash tree descriptor if there is only one. This is
    /// the case for appended AVB images.
    pub fn appended_descriptor(&self) -> Result<AppendedDescriptorRef<'_>> {
        let mut result = None;

        for descriptor in &self.descriptors {
            let item = match descriptor {
                Descriptor::HashTree(d) => AppendedDescriptorRef::HashTree(d),
                Descriptor::Hash(d) => AppendedDescriptorRef::Hash(d),
                _ => continue,
            };

            if result.is_some() {
                return Err(Error::NoAppendedDescriptor);
            }
            result = Some(item);
        }

        result.ok_or(Error::NoAppendedDescriptor)
    }

    /// Mutable version of [`Self::appended_descriptor`].
    pub fn appended_descriptor_mut(&mut self) -> Result<AppendedDescriptorMut<'_>> {
        let mut result = None;

        for descriptor in &mut self.descriptors {
            let item = match descriptor {
                Descriptor::HashTree(d) => AppendedDescriptorMut::HashTree(d),
                Descriptor::Hash(d) => AppendedDescriptorMut::Hash(d),
                _ => continue,
            };

            if result.is_some() {
                return Err(Error::NoAppendedDescriptor);
            }
            result = Some(item);
        }

        result.ok_or(Error::NoAppendedDescriptor)
    }

    pub fn set_algo_for_key(&mut self, key: &RsaPrivateKey) -> Result<()> {
        let key_raw = encode_public_key(&key.to_public_key())?;

        for algo in [AlgorithmType::Sha256Rsa2048, AlgorithmType::Sha256Rsa4096] {
            if key_raw.len() == algo.public_key_len() {
                self.algorithm_type = algo;
                return Ok(());
            }
        }

        Err(Error::UnsupportedKey(key.size()))
    }

    /// Remove the signature and the key material. The algorithm type is reset
    /// so that the result is a valid unsigned header.
    pub fn clear_sig(&mut self) {
        self.algorithm_type = AlgorithmType::None;
        self.hash.clear();
        self.signature.clear();
        self.public_key.clear();
        self.public_key_metadata.clear();
    }

    pub fn sign(&mut self, key: &RsaPrivateKey) -> Result<()> {
        let key_raw = encode_public_key(&key.to_public_key())?;
        if key_raw.len() != self.algorithm_type.public_key_len() {
            return Err(Error::IncorrectKeySize(key.size(), self.algorithm_type));
        }

        // The public key and the sizes of the hash and signature are included
        // in the data that's about to be signed.
        self.public_key = key_raw;
        self.hash.resize(self.algorithm_type.digest_len(), 0);
        self.signature
            .resize(self.algorithm_type.signature_len(), 0);

        let without_auth = self.encode_internal(true)?;
        let hash = self.algorithm_type.hash(&without_auth);
        let signature = self.algorithm_type.sign(key, &hash)?;

        self.hash = hash;
        self.signature = signature;

        Ok(())
    }

    /// Verify the header's digest and signature against the embedded public key
    /// and return the public key. If the header is not signed, then `None` is
    /// returned.
    pub fn verify(&self) -> Result<Option<RsaPublicKey>> {
        if self.algorithm_type == AlgorithmType::None {
            return Ok(None);
        }

        let public_key = decode_public_key(&self.public_key)?;
        if self.public_key.len() != self.algorithm_type.public_key_len() {
            return Err(Error::IncorrectKeySize(
                public_key.size(),
                self.algorithm_type,
            ));
        }

        let without_auth = self.encode_internal(true)?;
        let hash = self.algorithm_type.hash(&without_auth);

        self.algorithm_type
            .verify(&public_key, &hash, &self.signature)?;

        Ok(Some(public_key))
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Footer {
    pub version_major: u32,
    pub version_minor: u32,
    pub original_image_size: u64,
    pub vbmeta_offset: u64,
    pub vbmeta_size: u64,
    pub reserved: [u8; 28],
}

impl fmt::Debug for Footer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Footer")
            .field("version_major", &self.version_major)
            .field("version_minor", &self.version_minor)
            .field("original_image_size", &self.original_image_size)
            .field("vbmeta_offset", &self.vbmeta_offset)
            .field("vbmeta_size", &self.vbmeta_size)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Default for Footer {
    fn default() -> Self {
        Self {
            version_major: FOOTER_VERSION_MAJOR,
            version_minor: FOOTER_VERSION_MINOR,
            original_image_size: 0,
            vbmeta_offset: 0,
            vbmeta_size: 0,
            reserved: [0u8; 28],
        }
    }
}

impl Footer {
    pub const SIZE: usize = 64;

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data);
        let raw: RawFooter = read_obj(&mut reader, "footer")?;

        if raw.magic != FOOTER_MAGIC {
            return Err(Error::InvalidFooterMagic(raw.magic));
        }

        Ok(Self {
            version_major: raw.version_major.get(),
            version_minor: raw.version_minor.get(),
            original_image_size: raw.original_image_size.get(),
            vbmeta_offset: raw.vbmeta_offset.get(),
            vbmeta_size: raw.vbmeta_size.get(),
            reserved: raw.reserved,
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let raw = RawFooter {
            magic: FOOTER_MAGIC,
            version_major: self.version_major.into(),
            version_minor: self.version_minor.into(),
            original_image_size: self.original_image_size.into(),
            vbmeta_offset: self.vbmeta_offset.into(),
            vbmeta_size: self.vbmeta_size.into(),
            reserved: self.reserved,
        };

        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(raw.as_bytes());
        buf
    }
}

/// Encode a public key in the AVB binary format.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>> {
    if key.e() != &BigUint::from(65537u32) {
        return Err(Error::UnsupportedRsaPublicExponent(key.e().clone()));
    }

    // libavb expects certain values to be precomputed so that the bootloader's
    // verification operations can run faster.
    //
    // Values:
    //   n0inv = -1 / n[0] (mod 2 ^ 32)
    //     - Guaranteed to fit in a u32
    //   r = 2 ^ (key size in bits)
    //   rr = r^2 (mod N)
    //     - Guaranteed to fit in key size bits
    let b = BigUint::from(2u64.pow(32));
    let n0inv = key
        .n()
        .mod_inverse(&b)
        .and_then(|inv| b.to_bigint().map(|b| b - inv))
        .and_then(|v| v.to_u32())
        .ok_or(Error::FieldOutOfBounds("n0inv"))?;
    let r = BigUint::from(2u32).pow(key.n().bits());
    let rrmodn = r.modpow(&BigUint::from(2u32), key.n());
    let key_bits = (key.size() * 8)
        .to_u32()
        .ok_or(Error::FieldOutOfBounds("key_bits"))?;

    let mut data = vec![];
    data.extend_from_slice(&key_bits.to_be_bytes());
    data.extend_from_slice(&n0inv.to_be_bytes());

    let modulus_raw = key.n().to_bytes_be();
    data.resize(data.len() + key.size() - modulus_raw.len(), 0);
    data.extend_from_slice(&modulus_raw);

    let rrmodn_raw = rrmodn.to_bytes_be();
    data.resize(data.len() + key.size() - rrmodn_raw.len(), 0);
    data.extend_from_slice(&rrmodn_raw);

    Ok(data)
}

/// Decode a public key from the AVB binary format.
pub fn decode_public_key(data: &[u8]) -> Result<RsaPublicKey> {
    let mut reader = SliceReader::new(data);
    let key_bits: U32 = read_obj(&mut reader, "key_bits")?;
    let key_bits = key_bits
        .get()
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("key_bits"))?;

    // Skip n0inv.
    read_bytes(&mut reader, 4, "n0inv")?;

    let modulus_raw = read_bytes(&mut reader, key_bits / 8, "modulus")?;
    let modulus = BigUint::from_bytes_be(modulus_raw);
    let public_key = RsaPublicKey::new(modulus, BigUint::from(65537u32))?;

    Ok(public_key)
}

/// Read the footer from the last 64 bytes of the image. Returns [`None`] if
/// the image has no footer (eg. a root vbmeta image).
pub fn read_footer(data: &[u8]) -> Result<Option<Footer>> {
    let Some(offset) = data.len().checked_sub(Footer::SIZE) else {
        return Ok(None);
    };

    match Footer::decode(&data[offset..]) {
        Ok(f) => Ok(Some(f)),
        Err(Error::InvalidFooterMagic(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read the header of a root vbmeta image.
pub fn read_vbmeta(data: &[u8]) -> Result<Header> {
    Header::decode(data)
}

/// Load the vbmeta header and footer from the image. A footer is present only
/// if the image is not a vbmeta partition image (ie. the header follows actual
/// data).
pub fn load_image(data: &[u8]) -> Result<(Header, Option<Footer>)> {
    let footer = read_footer(data)?;

    let header_data = match &footer {
        Some(f) => {
            let offset = f
                .vbmeta_offset
                .to_usize()
                .ok_or(Error::FieldOutOfBounds("vbmeta_offset"))?;
            let size = len_usize(f.vbmeta_size, "vbmeta_size")?;

            data.get(offset..)
                .and_then(|d| d.get(..size))
                .ok_or(Error::FieldOutOfBounds("vbmeta_offset"))?
        }
        None => data,
    };

    let header = Header::decode(header_data)?;

    Ok((header, footer))
}

/// Serialize a vbmeta partition image. The header is padded with zeros to a
/// multiple of `block_size`.
pub fn write_vbmeta(header: &Header, block_size: u64) -> Result<Vec<u8>> {
    let block_size = block_size
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("block_size"))?;

    let mut data = header.encode()?;
    padding::pad_vec(&mut data, block_size);

    Ok(data)
}

/// Build an appended vbmeta image. `data` must begin with the logical image
/// contents (the image data plus the hash tree for hash tree images). The
/// header is placed at the next block boundary and the footer is written to
/// the last 64 bytes. If `partition_size` is specified, the output is exactly
/// that size and an error is returned if the header and footer won't fit.
/// Otherwise, one extra block is reserved for the footer.
pub fn write_footer(
    data: &[u8],
    header: &Header,
    footer: &mut Footer,
    partition_size: Option<u64>,
) -> Result<Vec<u8>> {
    // Logical image size, excluding the AVB header and footer.
    let (original_image_size, logical_image_size) = match header.appended_descriptor()? {
        AppendedDescriptorRef::HashTree(d) => {
            let size = d
                .image_size
                .checked_add(d.tree_size)
                .and_then(|s| s.checked_add(d.fec_size))
                .ok_or(Error::FieldOutOfBounds("logical_image_size"))?;
            (d.image_size, size)
        }
        AppendedDescriptorRef::Hash(d) => (d.image_size, d.image_size),
    };

    let logical_data = logical_image_size
        .to_usize()
        .and_then(|s| data.get(..s))
        .ok_or(Error::ImageSizeMismatch {
            expected: logical_image_size,
            actual: data.len() as u64,
        })?;

    let block_size = APPENDED_BLOCK_SIZE as usize;
    let mut buf = logical_data.to_vec();

    // The header start offset must be block aligned.
    padding::pad_vec(&mut buf, block_size);
    let header_offset = buf.len() as u64;

    let header_raw = header.encode()?;
    let header_size = header_raw.len() as u64;
    buf.extend_from_slice(&header_raw);
    padding::pad_vec(&mut buf, block_size);
    let header_end_padded = buf.len() as u64;

    // The footer lives in its own separate block at the end of the empty space.
    let footer_end = match partition_size {
        Some(s) if header_end_padded > s => return Err(Error::TooSmallForHeader(s)),
        Some(s) if s - header_end_padded < APPENDED_BLOCK_SIZE => {
            return Err(Error::TooSmallForFooter(s));
        }
        Some(s) => s,
        None => header_end_padded + APPENDED_BLOCK_SIZE,
    };
    let footer_offset = (footer_end - Footer::SIZE as u64)
        .to_usize()
        .ok_or(Error::FieldOutOfBounds("footer_offset"))?;

    footer.original_image_size = original_image_size;
    footer.vbmeta_offset = header_offset;
    footer.vbmeta_size = header_size;

    buf.resize(footer_offset, 0);
    buf.extend_from_slice(&footer.encode());

    Ok(buf)
}
