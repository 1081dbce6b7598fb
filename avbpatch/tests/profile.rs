// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use assert_matches::assert_matches;
use serde::Deserialize;

use avbpatch::{
    format::bootimage::BootVersion,
    profile::{self, Partition, PartitionKind, Profile, ProfileConfig, ProfileHashes, RamdiskTag},
};

#[derive(Deserialize)]
struct Config {
    profile: BTreeMap<String, ProfileConfig>,
}

fn load_fixtures() -> Config {
    let data = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../e2e/e2e.toml"));

    toml_edit::de::from_str(data).unwrap()
}

fn parse(data: &str) -> Result<Profile, profile::Error> {
    let config: ProfileConfig = toml_edit::de::from_str(data).unwrap();

    Profile::from_config("test", config)
}

fn boot(name: &str, version: BootVersion, ramdisks: Vec<RamdiskTag>) -> Partition {
    Partition {
        name: name.to_owned(),
        signed: false,
        kind: PartitionKind::Boot {
            version,
            kernel: true,
            ramdisks,
        },
    }
}

fn vbmeta(name: &str, signed: bool, deps: &[&str]) -> Partition {
    Partition {
        name: name.to_owned(),
        signed,
        kind: PartitionKind::Vbmeta {
            deps: deps.iter().map(|d| (*d).to_owned()).collect(),
        },
    }
}

#[test]
fn fixtures_are_valid() {
    let config = load_fixtures();

    assert_eq!(
        config.profile.keys().collect::<Vec<_>>(),
        ["pixel_v2", "pixel_v3", "pixel_v4_gki", "pixel_v4_non_gki"],
    );

    for (name, profile_config) in config.profile {
        let profile = Profile::from_config(&name, profile_config).unwrap();
        assert_eq!(profile.name(), name);
        assert!(profile.partition("vbmeta").is_some_and(|p| p.signed));
    }
}

#[test]
fn declaration_order_is_kept() {
    let mut config = load_fixtures();
    let profile = Profile::from_config("pixel_v2", config.profile.remove("pixel_v2").unwrap())
        .unwrap();

    assert_eq!(
        profile
            .partitions()
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>(),
        ["boot", "system", "vbmeta", "vbmeta_system"],
    );
    assert_eq!(profile.index_of("vbmeta"), Some(2));
    assert_eq!(
        profile.partition("boot").unwrap().ramdisks(),
        [RamdiskTag::InitAndOtacerts],
    );
    assert_eq!(
        profile.partition("vbmeta").unwrap().deps(),
        ["boot", "vbmeta_system"],
    );
}

#[test]
fn parse_hashes() {
    let profile = parse(
        r#"
        hashes.original = "0000000000000000000000000000000000000000000000000000000000000001"

        [partitions.vbmeta]
        avb.signed = true
        data.type = "vbmeta"
        data.deps = []
        "#,
    )
    .unwrap();

    let mut expected = [0u8; 32];
    expected[31] = 1;

    assert_eq!(profile.hashes().original.map(|h| h.0), Some(expected));
    assert_eq!(profile.hashes().patched, None);
}

#[test]
fn reject_unknown_fields() {
    let result = toml_edit::de::from_str::<ProfileConfig>(
        r#"
        [partitions.vbmeta]
        avb.signed = true
        avb.rollback_index = 1
        data.type = "vbmeta"
        data.deps = []
        "#,
    );
    assert!(result.is_err());

    let result = toml_edit::de::from_str::<ProfileConfig>(
        r#"
        [partitions.boot]
        avb.signed = false
        data.type = "boot"
        data.version = "v5"
        data.kernel = true
        "#,
    );
    assert!(result.is_err());

    let result = toml_edit::de::from_str::<ProfileConfig>(
        r#"
        [partitions.system]
        avb.signed = false
        data.type = "ext4"
        "#,
    );
    assert!(result.is_err());
}

#[test]
fn reject_empty() {
    assert_matches!(
        Profile::new("empty", vec![], ProfileHashes::default()),
        Err(profile::Error::Empty(n)) if n == "empty"
    );
}

#[test]
fn reject_duplicate_partition() {
    let partitions = vec![
        boot("boot", BootVersion::V2, vec![]),
        boot("boot", BootVersion::V3, vec![]),
    ];

    assert_matches!(
        Profile::new("test", partitions, ProfileHashes::default()),
        Err(profile::Error::DuplicatePartition(n)) if n == "boot"
    );
}

#[test]
fn reject_unknown_dependency() {
    let result = parse(
        r#"
        [partitions.vbmeta]
        avb.signed = true
        data.type = "vbmeta"
        data.deps = ["boot"]
        "#,
    );

    assert_matches!(
        result,
        Err(profile::Error::UnknownDependency { partition, dependency })
            if partition == "vbmeta" && dependency == "boot"
    );
}

#[test]
fn reject_self_dependency() {
    let partitions = vec![vbmeta("vbmeta", true, &["vbmeta"])];

    assert_matches!(
        Profile::new("test", partitions, ProfileHashes::default()),
        Err(profile::Error::SelfDependency(n)) if n == "vbmeta"
    );
}

#[test]
fn reject_duplicate_dependency() {
    let partitions = vec![
        boot("boot", BootVersion::V2, vec![RamdiskTag::Init]),
        vbmeta("vbmeta", true, &["boot", "boot"]),
    ];

    assert_matches!(
        Profile::new("test", partitions, ProfileHashes::default()),
        Err(profile::Error::DuplicateDependency { .. })
    );
}

#[test]
fn ramdisk_counts() {
    let partitions = vec![boot(
        "boot",
        BootVersion::V3,
        vec![RamdiskTag::Init, RamdiskTag::Otacerts],
    )];

    assert_matches!(
        Profile::new("test", partitions, ProfileHashes::default()),
        Err(profile::Error::TooManyRamdisks { count: 2, .. })
    );

    let partitions = vec![boot(
        "vendor_boot",
        BootVersion::VendorV4,
        vec![RamdiskTag::Otacerts, RamdiskTag::Dlkm],
    )];

    Profile::new("test", partitions, ProfileHashes::default()).unwrap();

    let partitions = vec![Partition {
        name: "init_boot".to_owned(),
        signed: true,
        kind: PartitionKind::Boot {
            version: BootVersion::V4,
            kernel: false,
            ramdisks: vec![],
        },
    }];

    assert_matches!(
        Profile::new("test", partitions, ProfileHashes::default()),
        Err(profile::Error::EmptyBootImage(_))
    );
}

#[test]
fn reject_unsigned_vbmeta_dependency() {
    let partitions = vec![
        vbmeta("vbmeta", true, &["vbmeta_system"]),
        vbmeta("vbmeta_system", false, &[]),
    ];

    assert_matches!(
        Profile::new("test", partitions, ProfileHashes::default()),
        Err(profile::Error::UnsignedVbmetaDependency { .. })
    );
}
