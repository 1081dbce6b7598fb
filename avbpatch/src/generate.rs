// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Deterministic synthetic partition images for a profile. The output only
//! depends on the profile and the keys.

use std::{collections::HashMap, sync::atomic::AtomicBool};

use ring::digest::{Context, SHA256};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    artifact::ImageSet,
    engine::SigningKeys,
    format::{
        avb::{
            self, AlgorithmType, ChainPartitionDescriptor, Descriptor, Footer, HashDescriptor,
            HashTreeDescriptor, Header, PropertyDescriptor,
        },
        bootimage::{
            self, BootImage, BootImageV0Through2, BootImageV3Through4, BootVersion, RamdiskMeta,
            V1Extra, V2Extra, V4Extra, VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE,
            VENDOR_RAMDISK_TYPE_DLKM, VENDOR_RAMDISK_TYPE_PLATFORM, VendorBootImageV3Through4,
            VendorV4Extra,
        },
        compression::{self, CompressedFormat},
        cpio::{self, CpioEntryNew},
        padding,
    },
    graph::{self, DependencyGraph},
    patch::otacert::{self, OTACERTS_PATH, OtaCertBuildFlags},
    profile::{Partition, PartitionKind, Profile, RamdiskTag},
    util::NumBytes,
};

const RELEASE_STRING: &str = "avbpatch";
const SALT_SEED: &[u8] = b"avbpatch";
const MIN_PARTITION_SIZE: u64 = 1024 * 1024;
const PARTITION_HEADROOM: u64 = 8192;
const BLOCK_SIZE: u64 = 4096;
const VENDOR_PAGE_SIZE: u32 = 2048;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Dependency {0:?} was not generated before its parent")]
    MissingDependency(String),
    #[error("Dependency graph error")]
    Graph(#[from] graph::Error),
    #[error("AVB error")]
    Avb(#[from] avb::Error),
    #[error("Boot image error")]
    BootImage(#[from] bootimage::Error),
    #[error("Compression error")]
    Compression(#[from] compression::Error),
    #[error("CPIO error")]
    Cpio(#[from] cpio::Error),
    #[error("OTA certificate error")]
    OtaCert(#[from] otacert::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn salt() -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(SALT_SEED);
    context.finish().as_ref().to_vec()
}

fn new_header(descriptors: Vec<Descriptor>) -> Header {
    Header {
        required_libavb_version_major: avb::VERSION_MAJOR,
        required_libavb_version_minor: 0,
        algorithm_type: AlgorithmType::None,
        hash: vec![],
        signature: vec![],
        public_key: vec![],
        public_key_metadata: vec![],
        descriptors,
        rollback_index: 0,
        flags: 0,
        rollback_index_location: 0,
        release_string: RELEASE_STRING.to_owned(),
        reserved: [0u8; 80],
    }
}

fn property_descriptors(name: &str) -> Vec<Descriptor> {
    [
        ("os_version", "15".to_owned()),
        ("fingerprint", format!("avbpatch/{name}/synthetic:user/release-keys")),
        ("security_patch", "2025-01-05".to_owned()),
    ]
    .into_iter()
    .map(|(k, v)| {
        Descriptor::Property(PropertyDescriptor {
            key: format!("com.android.build.{name}.{k}"),
            value: v.into_bytes(),
        })
    })
    .collect()
}

fn new_hash_descriptor(name: &str) -> HashDescriptor {
    HashDescriptor {
        image_size: 0,
        hash_algorithm: "sha256".to_owned(),
        partition_name: name.to_owned(),
        salt: salt(),
        root_digest: vec![],
        flags: 0,
        reserved: [0u8; 60],
    }
}

fn new_hash_tree_descriptor(name: &str) -> HashTreeDescriptor {
    HashTreeDescriptor {
        dm_verity_version: 1,
        image_size: 0,
        tree_offset: 0,
        tree_size: 0,
        data_block_size: BLOCK_SIZE as u32,
        hash_block_size: BLOCK_SIZE as u32,
        fec_num_roots: 0,
        fec_offset: 0,
        fec_size: 0,
        hash_algorithm: "sha256".to_owned(),
        partition_name: name.to_owned(),
        salt: salt(),
        root_digest: vec![],
        flags: 0,
        reserved: [0u8; 60],
    }
}

fn partition_size(logical_size: u64) -> u64 {
    padding::round(logical_size + PARTITION_HEADROOM, BLOCK_SIZE)
        .unwrap_or(u64::MAX)
        .max(MIN_PARTITION_SIZE)
}

fn sign_header(header: &mut Header, partition: &Partition, keys: &SigningKeys) -> Result<()> {
    if partition.signed {
        header.set_algo_for_key(&keys.avb)?;
        header.sign(&keys.avb)?;
    }

    Ok(())
}

/// Build a newc ramdisk carrying the content that `tag` declares.
fn build_ramdisk(tag: RamdiskTag, otacerts_zip: &[u8]) -> Result<Vec<u8>> {
    let mut entries = vec![];

    if tag.carries_init() {
        entries.push(CpioEntryNew::new_file(b"init", 0o755, b"init".to_vec()));
    }

    if tag.carries_otacerts() {
        entries.push(CpioEntryNew::new_directory(b"system", 0o755));
        entries.push(CpioEntryNew::new_directory(b"system/etc", 0o755));
        entries.push(CpioEntryNew::new_directory(b"system/etc/security", 0o755));
        entries.push(CpioEntryNew::new_file(
            OTACERTS_PATH,
            0o644,
            otacerts_zip.to_vec(),
        ));
    }

    if tag == RamdiskTag::Dlkm {
        entries.push(CpioEntryNew::new_directory(b"lib", 0o755));
        entries.push(CpioEntryNew::new_directory(b"lib/modules", 0o755));
        for module in ["foo", "bar"] {
            let path = format!("lib/modules/{module}.ko");
            entries.push(CpioEntryNew::new_file(
                path.as_bytes(),
                0o644,
                module.as_bytes().to_vec(),
            ));
        }
    }

    cpio::sort(&mut entries);
    cpio::reassign_inodes(&mut entries);

    let raw = cpio::save(&entries, false)?;

    Ok(compression::compress(CompressedFormat::Lz4Legacy, &raw)?)
}

fn build_boot_image(
    partition: &Partition,
    version: BootVersion,
    kernel: bool,
    ramdisks: &[RamdiskTag],
    otacerts_zip: &[u8],
    keys: &SigningKeys,
) -> Result<BootImage> {
    let kernel = if kernel { b"kernel".to_vec() } else { vec![] };
    let mut fragments = ramdisks
        .iter()
        .map(|t| build_ramdisk(*t, otacerts_zip))
        .collect::<Result<Vec<_>>>()?;

    let boot_image = match version {
        BootVersion::V2 => BootImage::V0Through2(BootImageV0Through2 {
            kernel_addr: 0x8000,
            ramdisk_addr: 0x100_0000,
            second_addr: 0xf0_0000,
            tags_addr: 0x100,
            page_size: bootimage::PAGE_SIZE,
            os_version: 0,
            name: String::new(),
            cmdline: String::new(),
            id: [0u32; 8],
            extra_cmdline: String::new(),
            kernel,
            ramdisk: fragments.pop().unwrap_or_default(),
            second: vec![],
            v1_extra: Some(V1Extra {
                recovery_dtbo_offset: 0,
                recovery_dtbo: vec![],
            }),
            v2_extra: Some(V2Extra {
                dtb_addr: 0,
                dtb: vec![],
            }),
        }),
        BootVersion::V3 | BootVersion::V4 => {
            let v4_extra = (version == BootVersion::V4).then(|| V4Extra {
                signature: partition.signed.then(|| {
                    new_header(vec![Descriptor::Hash(new_hash_descriptor(&partition.name))])
                }),
            });

            let mut image = BootImageV3Through4 {
                os_version: 0,
                reserved: [0u32; 4],
                cmdline: String::new(),
                v4_extra,
                kernel,
                ramdisk: fragments.pop().unwrap_or_default(),
            };

            if image.sign(&keys.avb)? {
                debug!("Signed VTS signature for {}", partition.name);
            }

            BootImage::V3Through4(image)
        }
        BootVersion::VendorV3 | BootVersion::VendorV4 => {
            let v4_extra = (version == BootVersion::VendorV4).then(|| VendorV4Extra {
                ramdisk_metas: ramdisks
                    .iter()
                    .map(|t| match t {
                        RamdiskTag::Dlkm => RamdiskMeta {
                            ramdisk_type: VENDOR_RAMDISK_TYPE_DLKM,
                            ramdisk_name: "dlkm".to_owned(),
                            board_id: [0u32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
                        },
                        _ => RamdiskMeta {
                            ramdisk_type: VENDOR_RAMDISK_TYPE_PLATFORM,
                            ramdisk_name: String::new(),
                            board_id: [0u32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
                        },
                    })
                    .collect(),
                bootconfig: String::new(),
            });

            BootImage::VendorV3Through4(VendorBootImageV3Through4 {
                page_size: VENDOR_PAGE_SIZE,
                kernel_addr: 0x8000,
                ramdisk_addr: 0x100_0000,
                cmdline: String::new(),
                tags_addr: 0x100,
                name: String::new(),
                dtb: vec![],
                dtb_addr: 0,
                ramdisks: fragments,
                v4_extra,
            })
        }
    };

    Ok(boot_image)
}

fn generate_boot(
    partition: &Partition,
    version: BootVersion,
    kernel: bool,
    ramdisks: &[RamdiskTag],
    otacerts_zip: &[u8],
    keys: &SigningKeys,
) -> Result<(Header, Vec<u8>)> {
    let boot_image = build_boot_image(partition, version, kernel, ramdisks, otacerts_zip, keys)?;
    let data = boot_image.encode()?;

    let mut descriptor = new_hash_descriptor(&partition.name);
    descriptor.update(&data)?;

    let mut descriptors = vec![Descriptor::Hash(descriptor)];
    descriptors.extend(property_descriptors(&partition.name));

    let mut header = new_header(descriptors);
    sign_header(&mut header, partition, keys)?;

    let size = partition_size(data.len() as u64);
    let image = avb::write_footer(&data, &header, &mut Footer::default(), Some(size))?;

    Ok((header, image))
}

fn generate_dm_verity(
    partition: &Partition,
    otacerts_zip: &[u8],
    keys: &SigningKeys,
    cancel_signal: &AtomicBool,
) -> Result<(Header, Vec<u8>)> {
    let mut data = b"arbitrary_prefix".to_vec();
    data.extend_from_slice(otacerts_zip);
    data.extend_from_slice(b"arbitrary_suffix");
    padding::pad_vec(&mut data, BLOCK_SIZE as usize);

    let mut descriptor = new_hash_tree_descriptor(&partition.name);
    let tree = descriptor.generate(&data, cancel_signal)?;

    let mut descriptors = vec![Descriptor::HashTree(descriptor)];
    descriptors.extend(property_descriptors(&partition.name));

    let mut header = new_header(descriptors);
    sign_header(&mut header, partition, keys)?;

    data.extend_from_slice(&tree);

    let size = partition_size(data.len() as u64);
    let image = avb::write_footer(&data, &header, &mut Footer::default(), Some(size))?;

    Ok((header, image))
}

fn generate_vbmeta(
    partition: &Partition,
    generated: &HashMap<&str, Header>,
    profile: &Profile,
    keys: &SigningKeys,
) -> Result<(Header, Vec<u8>)> {
    let mut descriptors = vec![];
    let mut rollback_index_location = 0;

    for dep in partition.deps() {
        let signed = profile.partition(dep).is_some_and(|p| p.signed);

        if signed {
            rollback_index_location += 1;

            descriptors.push(Descriptor::ChainPartition(ChainPartitionDescriptor {
                rollback_index_location,
                partition_name: dep.clone(),
                public_key: avb::encode_public_key(&keys.avb.to_public_key())?,
                flags: 0,
                reserved: [0u8; 60],
            }));
        } else {
            let header = generated
                .get(dep.as_str())
                .ok_or_else(|| Error::MissingDependency(dep.clone()))?;

            descriptors.extend(
                header
                    .descriptors
                    .iter()
                    .filter(|d| matches!(d, Descriptor::Hash(_) | Descriptor::HashTree(_)))
                    .cloned(),
            );
        }
    }

    let mut header = new_header(descriptors);
    sign_header(&mut header, partition, keys)?;

    let image = avb::write_vbmeta(&header, BLOCK_SIZE)?;

    Ok((header, image))
}

/// Generate an original image for every partition in `profile`. Partitions
/// are generated in dependency order so that vbmeta images can refer to the
/// final state of their dependencies. Every bundled `otacerts.zip` contains
/// `keys.ota_cert` and every signed header is signed by `keys.avb`.
pub fn generate_images(
    profile: &Profile,
    keys: &SigningKeys,
    cancel_signal: &AtomicBool,
) -> Result<ImageSet> {
    let otacerts_zip = otacert::create_zip(&keys.ota_cert, OtaCertBuildFlags::empty())?;

    let graph = DependencyGraph::new(profile)?;
    let mut headers = HashMap::new();
    let mut images = HashMap::new();

    for name in graph.order()? {
        let Some(partition) = profile.partition(name) else {
            continue;
        };

        let (header, image) = match &partition.kind {
            PartitionKind::Boot {
                version,
                kernel,
                ramdisks,
            } => generate_boot(partition, *version, *kernel, ramdisks, &otacerts_zip, keys)?,
            PartitionKind::DmVerity { .. } => {
                generate_dm_verity(partition, &otacerts_zip, keys, cancel_signal)?
            }
            PartitionKind::Vbmeta { .. } => generate_vbmeta(partition, &headers, profile, keys)?,
        };

        info!("Generated {name} ({:?})", NumBytes(image.len()));

        headers.insert(name, header);
        images.insert(name, image);
    }

    Ok(profile
        .partitions()
        .iter()
        .filter_map(|p| {
            images
                .remove(p.name.as_str())
                .map(|data| (p.name.clone(), data))
        })
        .collect())
}
