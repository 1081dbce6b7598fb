// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::sync::atomic::AtomicBool;

use assert_matches::assert_matches;

use avbpatch::format::{
    avb::{
        self, AlgorithmType, AppendedDescriptorRef, Descriptor, Footer, HashDescriptor,
        HashTreeDescriptor, Header, PropertyDescriptor,
    },
    verity::{self, DmVerityImage},
};

const BLOCK_SIZE: usize = 4096;

fn new_header(descriptor: Descriptor) -> Header {
    Header {
        required_libavb_version_major: avb::VERSION_MAJOR,
        required_libavb_version_minor: 0,
        algorithm_type: AlgorithmType::None,
        hash: vec![],
        signature: vec![],
        public_key: vec![],
        public_key_metadata: vec![],
        descriptors: vec![descriptor],
        rollback_index: 0,
        flags: 0,
        rollback_index_location: 0,
        release_string: "avbpatch".to_owned(),
        reserved: [0u8; 80],
    }
}

fn data_region() -> Vec<u8> {
    (0..16 * BLOCK_SIZE).map(|i| (i % 253) as u8).collect()
}

/// Build a dm-verity image with `extra` bytes of slack in the partition.
fn build_image(data: &[u8], extra: u64) -> Vec<u8> {
    let cancel_signal = AtomicBool::new(false);

    let mut descriptor = HashTreeDescriptor {
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
        partition_name: "system".to_owned(),
        salt: b"salt".to_vec(),
        root_digest: vec![],
        flags: 0,
        reserved: [0u8; 60],
    };
    let tree = descriptor.generate(data, &cancel_signal).unwrap();

    let mut logical = data.to_vec();
    logical.extend_from_slice(&tree);

    let header = new_header(Descriptor::HashTree(descriptor));
    // Data and tree, one block for the header, one block for the footer.
    let size = logical.len() as u64 + 2 * BLOCK_SIZE as u64 + extra;

    avb::write_footer(&logical, &header, &mut Footer::default(), Some(size)).unwrap()
}

#[test]
fn decode_and_encode() {
    let cancel_signal = AtomicBool::new(false);
    let data = data_region();
    let image_data = build_image(&data, 8192);

    let image = DmVerityImage::decode(&image_data).unwrap();
    assert_eq!(image.data(), data);
    assert_eq!(image.partition_size(), image_data.len() as u64);
    image.verify(&cancel_signal).unwrap();

    assert_eq!(image.encode().unwrap(), image_data);
}

#[test]
fn partial_update_matches_full_rebuild() {
    let cancel_signal = AtomicBool::new(false);
    let mut data = data_region();

    let mut image = DmVerityImage::decode(&build_image(&data, 0)).unwrap();

    let new = b"patched bytes";
    let offset = 3 * BLOCK_SIZE as u64 - 4;
    image
        .replace_data(offset..offset + new.len() as u64, new)
        .unwrap();

    // Stale until the root is updated.
    assert!(image.verify(&cancel_signal).is_err());

    image.update_root(&cancel_signal).unwrap();
    image.verify(&cancel_signal).unwrap();

    let start = offset as usize;
    data[start..start + new.len()].copy_from_slice(new);
    let rebuilt = DmVerityImage::decode(&build_image(&data, 0)).unwrap();

    assert_eq!(image.data(), rebuilt.data());
    assert_eq!(image.tree(), rebuilt.tree());
    assert_eq!(image.header(), rebuilt.header());
    assert_eq!(image.encode().unwrap(), rebuilt.encode().unwrap());
}

#[test]
fn replace_data_bounds() {
    let mut image = DmVerityImage::decode(&build_image(&data_region(), 0)).unwrap();
    let size = image.data().len() as u64;

    assert_matches!(
        image.replace_data(size - 2..size + 2, b"abcd"),
        Err(verity::Error::RangeOutOfBounds { .. })
    );

    let err = image.replace_data(0..4, b"abcde").unwrap_err();
    assert_matches!(err, verity::Error::SizeChanged { new_len: 5, .. });
    assert!(err.is_size_constraint());
}

#[test]
fn header_must_fit_partition() {
    let mut image = DmVerityImage::decode(&build_image(&data_region(), 0)).unwrap();

    image
        .header_mut()
        .descriptors
        .push(Descriptor::Property(PropertyDescriptor {
            key: "padding".to_owned(),
            value: vec![0u8; 2 * BLOCK_SIZE],
        }));

    let err = image.encode().unwrap_err();
    assert_matches!(err, verity::Error::PartitionTooSmall(..));
    assert!(err.is_size_constraint());
}

#[test]
fn reject_hash_image() {
    let data = vec![0u8; BLOCK_SIZE];

    let mut descriptor = HashDescriptor {
        image_size: 0,
        hash_algorithm: "sha256".to_owned(),
        partition_name: "boot".to_owned(),
        salt: vec![],
        root_digest: vec![],
        flags: 0,
        reserved: [0u8; 60],
    };
    descriptor.update(&data).unwrap();

    let header = new_header(Descriptor::Hash(descriptor));
    let image_data = avb::write_footer(&data, &header, &mut Footer::default(), None).unwrap();

    let (header, _) = avb::load_image(&image_data).unwrap();
    assert_matches!(
        header.appended_descriptor(),
        Ok(AppendedDescriptorRef::Hash(_))
    );
    assert_matches!(
        DmVerityImage::decode(&image_data),
        Err(verity::Error::MissingHashTreeDescriptor)
    );
}

#[test]
fn reject_missing_footer() {
    let header = new_header(Descriptor::Property(PropertyDescriptor {
        key: "key".to_owned(),
        value: b"value".to_vec(),
    }));
    let data = avb::write_vbmeta(&header, BLOCK_SIZE as u64).unwrap();

    assert_matches!(
        DmVerityImage::decode(&data),
        Err(verity::Error::MissingFooter)
    );
}
