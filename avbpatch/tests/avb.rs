// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::sync::atomic::AtomicBool;

use assert_matches::assert_matches;
use rsa::RsaPrivateKey;

use avbpatch::{
    crypto,
    format::avb::{
        self, AlgorithmType, AppendedDescriptorMut, AppendedDescriptorRef, ChainPartitionDescriptor,
        Descriptor, Footer, HashDescriptor, HashTreeDescriptor, Header, PropertyDescriptor,
    },
};

fn get_test_key() -> RsaPrivateKey {
    let data = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../e2e/keys/TEST_KEY_DO_NOT_USE_avb.key",
    ));

    crypto::read_pem_key(data).unwrap()
}

fn get_orig_key() -> RsaPrivateKey {
    let data = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../e2e/keys/ORIG_KEY_DO_NOT_USE_avb.key",
    ));

    crypto::read_pem_key(data).unwrap()
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
        release_string: "avbpatch".to_owned(),
        reserved: [0u8; 80],
    }
}

fn hash_descriptor(name: &str) -> HashDescriptor {
    HashDescriptor {
        image_size: 0,
        hash_algorithm: "sha256".to_owned(),
        partition_name: name.to_owned(),
        salt: b"salt".to_vec(),
        root_digest: vec![],
        flags: 0,
        reserved: [0u8; 60],
    }
}

fn hash_tree_descriptor(name: &str) -> HashTreeDescriptor {
    HashTreeDescriptor {
        dm_verity_version: 1,
        image_size: 0,
        tree_offset: 0,
        tree_size: 0,
        data_block_size: 4096,
        hash_block_size: 4096,
        fec_num_roots: 0,
        fec_offset: 0,
        fec_size: 0,
        hash_algorithm: "sha256".to_owned(),
        partition_name: name.to_owned(),
        salt: b"salt".to_vec(),
        root_digest: vec![],
        flags: 0,
        reserved: [0u8; 60],
    }
}

#[test]
fn sign_and_verify_root_image() {
    let key = get_test_key();
    let public_key = key.to_public_key();

    let mut header = new_header(vec![
        Descriptor::ChainPartition(ChainPartitionDescriptor {
            rollback_index_location: 1,
            partition_name: "vbmeta_system".to_owned(),
            public_key: avb::encode_public_key(&public_key).unwrap(),
            flags: 0,
            reserved: [0u8; 60],
        }),
        Descriptor::Property(PropertyDescriptor {
            key: "com.android.build.vbmeta.os_version".to_owned(),
            value: b"15".to_vec(),
        }),
    ]);

    assert_matches!(header.verify(), Ok(None));

    header.set_algo_for_key(&key).unwrap();
    header.sign(&key).unwrap();
    assert_eq!(header.verify().unwrap(), Some(public_key.clone()));

    let data = avb::write_vbmeta(&header, 4096).unwrap();
    assert_eq!(data.len() % 4096, 0);

    let (new_header, footer) = avb::load_image(&data).unwrap();
    assert_matches!(footer, None);
    assert_eq!(new_header, header);
    assert_eq!(new_header.verify().unwrap(), Some(public_key));

    // Re-encoding the parsed header is lossless.
    assert_eq!(avb::write_vbmeta(&new_header, 4096).unwrap(), data);
}

#[test]
fn tampered_header_fails_verification() {
    let key = get_test_key();

    let mut header = new_header(vec![]);
    header.set_algo_for_key(&key).unwrap();
    header.sign(&key).unwrap();

    header.rollback_index = 1;
    assert!(header.verify().is_err());
}

#[test]
fn public_key_round_trip() {
    let public_key = get_test_key().to_public_key();

    let encoded = avb::encode_public_key(&public_key).unwrap();
    assert_eq!(avb::decode_public_key(&encoded).unwrap(), public_key);

    let other = get_orig_key().to_public_key();
    assert_ne!(avb::encode_public_key(&other).unwrap(), encoded);
}

#[test]
fn clear_sig_makes_header_unsigned() {
    let key = get_test_key();

    let mut header = new_header(vec![]);
    header.set_algo_for_key(&key).unwrap();
    header.sign(&key).unwrap();

    header.clear_sig();
    assert_eq!(header.algorithm_type, AlgorithmType::None);
    assert_matches!(header.verify(), Ok(None));
}

#[test]
fn appended_hash_image_footer_placement() {
    let data = b"boot image contents".repeat(100);

    let mut descriptor = hash_descriptor("boot");
    descriptor.update(&data).unwrap();

    let key = get_test_key();
    let mut header = new_header(vec![Descriptor::Hash(descriptor)]);
    header.set_algo_for_key(&key).unwrap();
    header.sign(&key).unwrap();

    let partition_size = 64 * 1024;
    let mut footer = Footer::default();
    let image = avb::write_footer(&data, &header, &mut footer, Some(partition_size)).unwrap();
    assert_eq!(image.len() as u64, partition_size);

    // Data first, then the header at the next block boundary.
    assert!(image.starts_with(&data));
    assert_eq!(footer.original_image_size, data.len() as u64);
    assert_eq!(footer.vbmeta_offset, 4096);

    let (new_header, new_footer) = avb::load_image(&image).unwrap();
    assert_eq!(new_header, header);
    assert_eq!(new_footer, Some(footer));

    match new_header.appended_descriptor().unwrap() {
        AppendedDescriptorRef::Hash(d) => d.verify(&data).unwrap(),
        AppendedDescriptorRef::HashTree(_) => panic!("Expected hash descriptor"),
    }

    // Same inputs produce the same bytes.
    let again = avb::write_footer(&data, &header, &mut Footer::default(), Some(partition_size))
        .unwrap();
    assert_eq!(again, image);
}

#[test]
fn appended_image_size_errors() {
    let data = vec![0xaau8; 8192];

    let mut descriptor = hash_descriptor("boot");
    descriptor.update(&data).unwrap();
    let header = new_header(vec![Descriptor::Hash(descriptor)]);

    // The header cannot fit.
    assert_matches!(
        avb::write_footer(&data, &header, &mut Footer::default(), Some(8192)),
        Err(avb::Error::TooSmallForHeader(8192))
    );

    // The header fits, but there is no block left for the footer.
    assert_matches!(
        avb::write_footer(&data, &header, &mut Footer::default(), Some(12288)),
        Err(avb::Error::TooSmallForFooter(12288))
    );

    avb::write_footer(&data, &header, &mut Footer::default(), Some(16384)).unwrap();
}

#[test]
fn hash_descriptor_detects_modification() {
    let mut data = b"original".to_vec();

    let mut descriptor = hash_descriptor("boot");
    descriptor.update(&data).unwrap();
    descriptor.verify(&data).unwrap();

    data[0] = b'O';
    assert_matches!(
        descriptor.verify(&data),
        Err(avb::Error::InvalidRootDigest { .. })
    );

    data.push(0);
    assert_matches!(
        descriptor.verify(&data),
        Err(avb::Error::ImageSizeMismatch { .. })
    );
}

#[test]
fn hash_tree_update_matches_regeneration() {
    let cancel_signal = AtomicBool::new(false);
    let mut data = (0..16 * 4096).map(|i| (i % 251) as u8).collect::<Vec<_>>();

    let mut descriptor = hash_tree_descriptor("system");
    let mut tree = descriptor.generate(&data, &cancel_signal).unwrap();
    descriptor.verify(&data, &tree, &cancel_signal).unwrap();

    data[5 * 4096 + 17] ^= 0xff;
    assert!(descriptor.verify(&data, &tree, &cancel_signal).is_err());

    let mut header = new_header(vec![Descriptor::HashTree(descriptor)]);
    match header.appended_descriptor_mut().unwrap() {
        AppendedDescriptorMut::HashTree(d) => {
            d.update(&data, &mut tree, &[5 * 4096..5 * 4096 + 18], &cancel_signal)
                .unwrap();
            d.verify(&data, &tree, &cancel_signal).unwrap();
        }
        AppendedDescriptorMut::Hash(_) => panic!("Expected hash tree descriptor"),
    }

    let mut fresh = hash_tree_descriptor("system");
    let fresh_tree = fresh.generate(&data, &cancel_signal).unwrap();

    match header.appended_descriptor().unwrap() {
        AppendedDescriptorRef::HashTree(d) => {
            assert_eq!(d.root_digest, fresh.root_digest);
            assert_eq!(tree, fresh_tree);
        }
        AppendedDescriptorRef::Hash(_) => panic!("Expected hash tree descriptor"),
    }
}

#[test]
fn appended_descriptor_requires_exactly_one() {
    let header = new_header(vec![]);
    assert_matches!(
        header.appended_descriptor(),
        Err(avb::Error::NoAppendedDescriptor)
    );

    let header = new_header(vec![
        Descriptor::Hash(hash_descriptor("a")),
        Descriptor::Hash(hash_descriptor("b")),
    ]);
    assert_matches!(
        header.appended_descriptor(),
        Err(avb::Error::NoAppendedDescriptor)
    );
}

#[test]
fn reject_bad_magic() {
    let mut data = avb::write_vbmeta(&new_header(vec![]), 4096).unwrap();
    data[0] = b'X';

    assert_matches!(
        avb::read_vbmeta(&data),
        Err(avb::Error::InvalidHeaderMagic(_))
    );
}
