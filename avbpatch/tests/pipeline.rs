// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use assert_matches::assert_matches;
use serde::Deserialize;

use avbpatch::{
    CodecError, Error,
    artifact::ImageSet,
    crypto,
    engine::{self, SigningKeys},
    format::{
        avb::{self, Descriptor},
        bootimage::BootVersion,
    },
    generate,
    profile::{Partition, PartitionKind, Profile, ProfileConfig, ProfileHashes, RamdiskTag},
    verify,
};

const PROFILES: [&str; 4] = ["pixel_v2", "pixel_v3", "pixel_v4_gki", "pixel_v4_non_gki"];

#[derive(Deserialize)]
struct Config {
    profile: BTreeMap<String, ProfileConfig>,
}

fn load_profile(name: &str) -> Profile {
    let data = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../e2e/e2e.toml"));
    let mut config: Config = toml_edit::de::from_str(data).unwrap();

    Profile::from_config(name, config.profile.remove(name).unwrap()).unwrap()
}

fn orig_keys() -> SigningKeys {
    let avb = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../e2e/keys/ORIG_KEY_DO_NOT_USE_avb.key",
    ));
    let ota_cert = include_bytes!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../e2e/keys/ORIG_KEY_DO_NOT_USE_ota.crt",
    ));

    SigningKeys {
        avb: crypto::read_pem_key(avb).unwrap(),
        ota_cert: crypto::read_pem_cert(ota_cert).unwrap(),
    }
}

fn test_keys() -> SigningKeys {
    let avb = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../e2e/keys/TEST_KEY_DO_NOT_USE_avb.key",
    ));
    let ota_cert = include_bytes!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../e2e/keys/TEST_KEY_DO_NOT_USE_ota.crt",
    ));

    SigningKeys {
        avb: crypto::read_pem_key(avb).unwrap(),
        ota_cert: crypto::read_pem_cert(ota_cert).unwrap(),
    }
}

/// Rebuild a profile with one partition replaced.
fn replace_partition(profile: &Profile, partition: Partition) -> Profile {
    let partitions = profile
        .partitions()
        .iter()
        .map(|p| {
            if p.name == partition.name {
                partition.clone()
            } else {
                p.clone()
            }
        })
        .collect();

    Profile::new(profile.name(), partitions, ProfileHashes::default()).unwrap()
}

#[test]
fn patch_and_verify_all_profiles() {
    let cancel_signal = AtomicBool::new(false);
    let orig_keys = orig_keys();
    let test_keys = test_keys();

    for name in PROFILES {
        println!("Profile: {name}");

        let profile = load_profile(name);

        let original = generate::generate_images(&profile, &orig_keys, &cancel_signal).unwrap();
        assert_eq!(original.len(), profile.partitions().len());

        verify::verify_chain(&original, &orig_keys.avb.to_public_key(), &cancel_signal).unwrap();
        verify::verify_otacerts(&original, &profile, &orig_keys.ota_cert, &cancel_signal).unwrap();

        let patched =
            engine::patch_images(&profile, &original, &test_keys, &cancel_signal).unwrap();

        // Output is in declaration order.
        assert_eq!(
            patched.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            profile
                .partitions()
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>(),
        );

        // Partition sizes never change.
        for (partition, data) in patched.iter() {
            assert_eq!(
                data.len(),
                original.get(partition).unwrap().len(),
                "[{name}] {partition} changed size",
            );
        }

        verify::verify_chain(&patched, &test_keys.avb.to_public_key(), &cancel_signal).unwrap();
        verify::verify_otacerts(&patched, &profile, &test_keys.ota_cert, &cancel_signal).unwrap();

        assert_matches!(
            verify::verify_chain(&patched, &orig_keys.avb.to_public_key(), &cancel_signal),
            Err(verify::Error::UntrustedKey(n)) if n == "vbmeta"
        );
        assert!(
            verify::verify_otacerts(&patched, &profile, &orig_keys.ota_cert, &cancel_signal)
                .is_err()
        );

        // Patching again changes nothing.
        let repatched =
            engine::patch_images(&profile, &patched, &test_keys, &cancel_signal).unwrap();
        assert_eq!(repatched, patched, "[{name}] Patching is not idempotent");
    }
}

#[test]
fn fixture_digests_match() {
    let cancel_signal = AtomicBool::new(false);
    let orig_keys = orig_keys();
    let test_keys = test_keys();

    for name in PROFILES {
        let profile = load_profile(name);
        let hashes = profile.hashes();

        let (Some(original_hash), Some(patched_hash)) = (&hashes.original, &hashes.patched) else {
            panic!("[{name}] Missing hashes; record them with: cargo run -p e2e -- update -a");
        };

        let original = generate::generate_images(&profile, &orig_keys, &cancel_signal)
            .unwrap()
            .to_artifact()
            .unwrap();
        verify::check_digest("original", original_hash, &verify::sha256(&original))
            .unwrap_or_else(|e| panic!("[{name}] {e}"));

        let patched =
            engine::patch_artifact(&profile, &original, &test_keys, &cancel_signal).unwrap();
        verify::check_digest("patched", patched_hash, &verify::sha256(&patched))
            .unwrap_or_else(|e| panic!("[{name}] {e}"));
    }
}

#[test]
fn output_is_deterministic() {
    let cancel_signal = AtomicBool::new(false);
    let orig_keys = orig_keys();
    let test_keys = test_keys();
    let profile = load_profile("pixel_v4_gki");

    let first = generate::generate_images(&profile, &orig_keys, &cancel_signal)
        .unwrap()
        .to_artifact()
        .unwrap();
    let second = generate::generate_images(&profile, &orig_keys, &cancel_signal)
        .unwrap()
        .to_artifact()
        .unwrap();
    assert_eq!(first, second);

    let patched_first =
        engine::patch_artifact(&profile, &first, &test_keys, &cancel_signal).unwrap();
    let patched_second =
        engine::patch_artifact(&profile, &second, &test_keys, &cancel_signal).unwrap();
    assert_eq!(patched_first, patched_second);
    assert_ne!(patched_first, first);

    let digest = verify::sha256(&patched_first);
    verify::check_digest("patched", &digest, &verify::sha256(&patched_second)).unwrap();
    assert_matches!(
        verify::check_digest("patched", &digest, &verify::sha256(&first)),
        Err(Error::Verification { what, .. }) if what == "patched"
    );
}

#[test]
fn root_chains_to_signed_partitions() {
    let cancel_signal = AtomicBool::new(false);
    let test_keys = test_keys();
    let profile = load_profile("pixel_v4_gki");

    let original = generate::generate_images(&profile, &orig_keys(), &cancel_signal).unwrap();
    let patched = engine::patch_images(&profile, &original, &test_keys, &cancel_signal).unwrap();

    let header = avb::read_vbmeta(patched.get("vbmeta").unwrap()).unwrap();
    let public_key = avb::encode_public_key(&test_keys.avb.to_public_key()).unwrap();

    for dep in profile.partition("vbmeta").unwrap().deps() {
        let signed = profile.partition(dep).unwrap().signed;
        let descriptor = header
            .descriptors
            .iter()
            .find(|d| d.partition_name() == Some(dep.as_str()))
            .unwrap();

        match descriptor {
            Descriptor::ChainPartition(d) => {
                assert!(signed, "{dep} is unsigned, but chained");
                assert_eq!(d.public_key, public_key);
            }
            Descriptor::Hash(_) => assert!(!signed, "{dep} is signed, but not chained"),
            d => panic!("Unexpected descriptor for {dep}: {d:?}"),
        }
    }
}

#[test]
fn version_mismatch_is_format_error() {
    let cancel_signal = AtomicBool::new(false);
    let profile = load_profile("pixel_v3");
    let original = generate::generate_images(&profile, &orig_keys(), &cancel_signal).unwrap();

    let mut boot = profile.partition("boot").unwrap().clone();
    boot.kind = PartitionKind::Boot {
        version: BootVersion::V4,
        kernel: true,
        ramdisks: vec![RamdiskTag::Init],
    };
    let modified = replace_partition(&profile, boot);

    assert_matches!(
        engine::patch_images(&modified, &original, &test_keys(), &cancel_signal),
        Err(Error::Format { partition, .. }) if partition == "boot"
    );
}

#[test]
fn ramdisk_tag_mismatch_is_format_error() {
    let cancel_signal = AtomicBool::new(false);
    let profile = load_profile("pixel_v4_gki");
    let original = generate::generate_images(&profile, &orig_keys(), &cancel_signal).unwrap();

    let mut vendor_boot = profile.partition("vendor_boot").unwrap().clone();
    vendor_boot.kind = PartitionKind::Boot {
        version: BootVersion::VendorV4,
        kernel: false,
        ramdisks: vec![RamdiskTag::Otacerts],
    };
    let modified = replace_partition(&profile, vendor_boot);

    assert_matches!(
        engine::patch_images(&modified, &original, &test_keys(), &cancel_signal),
        Err(Error::Format { partition, .. }) if partition == "vendor_boot"
    );
}

#[test]
fn missing_image_is_format_error() {
    let cancel_signal = AtomicBool::new(false);
    let profile = load_profile("pixel_v2");
    let original = generate::generate_images(&profile, &orig_keys(), &cancel_signal).unwrap();

    let images = original
        .iter()
        .filter(|(n, _)| *n != "system")
        .map(|(n, d)| (n.to_owned(), d.to_vec()))
        .collect::<ImageSet>();

    assert_matches!(
        engine::patch_images(&profile, &images, &test_keys(), &cancel_signal),
        Err(Error::Format {
            partition,
            source: CodecError::MissingImage,
        }) if partition == "system"
    );
}

#[test]
fn cycle_aborts_before_patching() {
    let cancel_signal = AtomicBool::new(false);
    let partitions = ["a", "b"]
        .into_iter()
        .zip(["b", "a"])
        .map(|(name, dep)| Partition {
            name: name.to_owned(),
            signed: true,
            kind: PartitionKind::Vbmeta {
                deps: vec![dep.to_owned()],
            },
        })
        .collect();
    let profile = Profile::new("cycle", partitions, ProfileHashes::default()).unwrap();

    // No images are needed to detect the cycle.
    assert_matches!(
        engine::patch_images(&profile, &ImageSet::new(), &test_keys(), &cancel_signal),
        Err(Error::Cycle { partitions }) if partitions == ["a", "b", "a"]
    );
}

#[test]
fn cancellation() {
    let cancel_signal = AtomicBool::new(false);
    let profile = load_profile("pixel_v2");
    let original = generate::generate_images(&profile, &orig_keys(), &cancel_signal).unwrap();

    cancel_signal.store(true, Ordering::SeqCst);

    assert_matches!(
        engine::patch_images(&profile, &original, &test_keys(), &cancel_signal),
        Err(Error::Cancelled)
    );
}

#[test]
fn artifact_must_contain_images_only() {
    let cancel_signal = AtomicBool::new(false);
    let profile = load_profile("pixel_v2");

    assert_matches!(
        engine::patch_artifact(&profile, b"not a zip", &test_keys(), &cancel_signal),
        Err(Error::Artifact(_))
    );
}
