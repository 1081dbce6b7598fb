// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use assert_matches::assert_matches;
use rsa::RsaPrivateKey;

use avbpatch::{
    crypto,
    format::{
        avb::{self, AlgorithmType, Descriptor, HashDescriptor, Header},
        bootimage::{
            self, BootImage, BootImageExt, BootImageV0Through2, BootImageV3Through4, BootVersion,
            RamdiskMeta, V1Extra, V2Extra, V4Extra, VendorBootImageV3Through4, VendorV4Extra,
        },
    },
};

fn get_test_key() -> RsaPrivateKey {
    let data = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../e2e/keys/TEST_KEY_DO_NOT_USE_avb.key",
    ));

    crypto::read_pem_key(data).unwrap()
}

fn repeat(s: &str, max_len: usize) -> String {
    assert!(!s.is_empty());

    let mut result = s.repeat(max_len / s.len());
    result.push_str(&s[..max_len % s.len()]);

    result
}

fn round_trip(image: &BootImage, version: BootVersion, expected_version: u32) -> Vec<u8> {
    assert_eq!(image.header_version(), expected_version);
    assert_eq!(image.boot_version(), Some(version));

    let data = image.encode().unwrap();
    assert_eq!(data.len() % 2048, 0);

    let new_image = BootImage::decode(&data, version).unwrap();
    assert_eq!(&new_image, image);

    // Re-encoding is byte-for-byte stable.
    assert_eq!(new_image.encode().unwrap(), data);

    data
}

fn image_v2() -> BootImage {
    BootImage::V0Through2(BootImageV0Through2 {
        kernel_addr: 0x01234567,
        ramdisk_addr: 0x89abcdef,
        second_addr: 0x02468ace,
        tags_addr: 0x13579bdf,
        page_size: 4096,
        os_version: 0x76543210,
        name: repeat("Name", 16),
        cmdline: repeat("Cmdline", 512),
        id: [
            0x00112233, 0x44556677, 0x8899aabb, 0xccddeeff, 0xffeeddcc, 0xbbaa9988, 0x77665544,
            0x33221100,
        ],
        extra_cmdline: repeat("ExtraCmdline", 1024),
        kernel: b"kernel data".to_vec(),
        ramdisk: b"ramdisk data".to_vec(),
        second: b"second data".to_vec(),
        v1_extra: Some(V1Extra {
            recovery_dtbo_offset: 0x0123456789abcdef,
            recovery_dtbo: b"recovery_dtbo data".to_vec(),
        }),
        v2_extra: Some(V2Extra {
            dtb_addr: 0xfedcba9876543210,
            dtb: b"dtb data".to_vec(),
        }),
    })
}

fn image_v4(v4_extra: Option<V4Extra>) -> BootImage {
    BootImage::V3Through4(BootImageV3Through4 {
        os_version: 0x01234567,
        reserved: [0x00112233, 0x44556677, 0x8899aabb, 0xccddeeff],
        cmdline: repeat("Cmdline", 1536),
        v4_extra,
        kernel: b"kernel data".to_vec(),
        ramdisk: b"ramdisk data".to_vec(),
    })
}

fn image_vendor_v4() -> BootImage {
    let board_id = [
        0x00112233, 0x44556677, 0x8899aabb, 0xccddeeff, 0xffeeddcc, 0xbbaa9988, 0x77665544,
        0x33221100, 0x004488cc, 0x115599dd, 0x2266aaee, 0x3377bbff, 0xffbb7733, 0xeeaa6622,
        0xdd995511, 0xcc884400,
    ];

    BootImage::VendorV3Through4(VendorBootImageV3Through4 {
        page_size: 2048,
        kernel_addr: 0x01234567,
        ramdisk_addr: 0x89abcdef,
        cmdline: repeat("Cmdline", 2048),
        tags_addr: 0xfedcba98,
        name: repeat("Name", 16),
        dtb: b"dtb data".to_vec(),
        dtb_addr: 0x76543210,
        ramdisks: vec![
            b"ramdisk 0 data".to_vec(),
            b"ramdisk 1 data".to_vec(),
            b"ramdisk 2 data".to_vec(),
            b"ramdisk 3 data".to_vec(),
        ],
        v4_extra: Some(VendorV4Extra {
            ramdisk_metas: vec![
                RamdiskMeta {
                    ramdisk_type: bootimage::VENDOR_RAMDISK_TYPE_NONE,
                    ramdisk_name: repeat("None", 32),
                    board_id,
                },
                RamdiskMeta {
                    ramdisk_type: bootimage::VENDOR_RAMDISK_TYPE_PLATFORM,
                    ramdisk_name: repeat("Platform", 32),
                    board_id,
                },
                RamdiskMeta {
                    ramdisk_type: bootimage::VENDOR_RAMDISK_TYPE_RECOVERY,
                    ramdisk_name: repeat("Recovery", 32),
                    board_id,
                },
                RamdiskMeta {
                    ramdisk_type: bootimage::VENDOR_RAMDISK_TYPE_DLKM,
                    ramdisk_name: repeat("Dlkm", 32),
                    board_id,
                },
            ],
            bootconfig: "bootconfig data".to_owned(),
        }),
    })
}

#[test]
fn round_trip_v2() {
    round_trip(&image_v2(), BootVersion::V2, 2);
}

#[test]
fn round_trip_v3() {
    let image = BootImage::V3Through4(BootImageV3Through4 {
        os_version: 0x01234567,
        reserved: [0x00112233, 0x44556677, 0x8899aabb, 0xccddeeff],
        cmdline: repeat("Cmdline", 1536),
        v4_extra: None,
        kernel: b"kernel data".to_vec(),
        ramdisk: b"ramdisk data".to_vec(),
    });

    round_trip(&image, BootVersion::V3, 3);
}

#[test]
fn round_trip_v4() {
    round_trip(
        &image_v4(Some(V4Extra { signature: None })),
        BootVersion::V4,
        4,
    );
}

#[test]
fn round_trip_v4_vts() {
    let header = Header {
        required_libavb_version_major: avb::VERSION_MAJOR,
        required_libavb_version_minor: 0,
        algorithm_type: AlgorithmType::None,
        hash: vec![],
        signature: vec![],
        public_key: vec![],
        public_key_metadata: vec![],
        descriptors: vec![Descriptor::Hash(HashDescriptor {
            image_size: 12288,
            hash_algorithm: "sha256".to_owned(),
            partition_name: "boot".to_owned(),
            salt: vec![0x64, 0x30, 0x30, 0x64, 0x66, 0x30, 0x30, 0x64],
            root_digest: vec![0u8; 32],
            flags: 0,
            reserved: [0; 60],
        })],
        rollback_index: 0,
        flags: 0,
        rollback_index_location: 0,
        release_string: "avbtool 1.2.0".to_owned(),
        reserved: [0; 80],
    };

    let key = get_test_key();
    let mut image = image_v4(Some(V4Extra {
        signature: Some(header),
    }));

    let BootImage::V3Through4(b) = &mut image else {
        panic!("Expected v4 boot image");
    };
    assert!(b.sign(&key).unwrap());

    let signature = b.v4_extra.as_ref().unwrap().signature.as_ref().unwrap();
    assert_eq!(signature.verify().unwrap(), Some(key.to_public_key()));

    let Descriptor::Hash(descriptor) = &signature.descriptors[0] else {
        panic!("Expected hash descriptor");
    };
    assert_ne!(descriptor.root_digest, vec![0u8; 32]);

    round_trip(&image, BootVersion::V4, 4);
}

#[test]
fn sign_without_vts_signature() {
    let key = get_test_key();
    let mut image = image_v4(Some(V4Extra { signature: None }));

    let BootImage::V3Through4(b) = &mut image else {
        panic!("Expected v4 boot image");
    };
    assert!(!b.sign(&key).unwrap());
}

#[test]
fn round_trip_vendor_v3() {
    let image = BootImage::VendorV3Through4(VendorBootImageV3Through4 {
        page_size: 4096,
        kernel_addr: 0x01234567,
        ramdisk_addr: 0x89abcdef,
        cmdline: repeat("Cmdline", 2048),
        tags_addr: 0xfedcba98,
        name: repeat("Name", 16),
        dtb: b"dtb data".to_vec(),
        dtb_addr: 0x76543210,
        ramdisks: vec![b"ramdisk data".to_vec()],
        v4_extra: None,
    });

    round_trip(&image, BootVersion::VendorV3, 3);
}

#[test]
fn round_trip_vendor_v4() {
    round_trip(&image_vendor_v4(), BootVersion::VendorV4, 4);
}

#[test]
fn version_mismatch() {
    let data = image_v2().encode().unwrap();

    assert_matches!(
        BootImage::decode(&data, BootVersion::V4),
        Err(bootimage::Error::VersionMismatch {
            expected: BootVersion::V4,
            ..
        })
    );

    let data = image_vendor_v4().encode().unwrap();

    assert_matches!(
        BootImage::decode(&data, BootVersion::VendorV3),
        Err(bootimage::Error::VersionMismatch {
            expected: BootVersion::VendorV3,
            ..
        })
    );
}

#[test]
fn reject_trailing_data() {
    let mut data = image_v2().encode().unwrap();
    data.extend_from_slice(&[0xffu8; 4096]);

    assert_matches!(
        BootImage::decode(&data, BootVersion::V2),
        Err(bootimage::Error::TrailingData(4096))
    );
}

#[test]
fn reject_unknown_format() {
    assert_matches!(
        BootImage::detect(&[0u8; 8192]),
        Err(bootimage::Error::UnknownFormat)
    );
}

#[test]
fn ramdisk_fragments() {
    let mut image = image_vendor_v4();
    assert_eq!(image.ramdisks_mut().len(), 4);

    let mut image = image_v4(None);
    if let BootImage::V3Through4(b) = &mut image {
        b.ramdisk.clear();
    }
    assert!(image.ramdisks_mut().is_empty());
}

#[test]
fn empty_vendor_ramdisk_fragments() {
    // v4 fragments keep their table position even when empty.
    let mut image = image_vendor_v4();
    if let BootImage::VendorV3Through4(b) = &mut image {
        b.ramdisks[1].clear();
    }
    let fragments = image.ramdisks_mut();
    assert_eq!(fragments.len(), 4);
    assert!(fragments[1].is_empty());

    // v3 has a single ramdisk, which is skipped when empty.
    let mut image = image_vendor_v4();
    if let BootImage::VendorV3Through4(b) = &mut image {
        b.v4_extra = None;
        b.ramdisks = vec![vec![]];
    }
    assert!(image.ramdisks_mut().is_empty());

    if let BootImage::VendorV3Through4(b) = &mut image {
        b.ramdisks = vec![b"ramdisk data".to_vec()];
    }
    let mut fragments = image.ramdisks_mut();
    assert_eq!(fragments.len(), 1);
    fragments[0].push(b'!');
    assert_eq!(image.ramdisks_mut()[0].as_slice(), b"ramdisk data!");
}

#[test]
fn mismatched_vendor_ramdisk_metadata() {
    let mut image = image_vendor_v4();
    if let BootImage::VendorV3Through4(b) = &mut image {
        b.ramdisks.pop();
    }

    assert_matches!(
        image.encode(),
        Err(bootimage::Error::MismatchedRamdiskCounts {
            ramdisks: 3,
            metas: 4,
        })
    );
}
