// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! In-memory model of a device profile: the partitions that make up a
//! device's verified boot chain and how they relate to each other.

use std::{collections::HashSet, fmt, marker::PhantomData};

use serde::{
    Deserialize, Deserializer, Serialize,
    de::{MapAccess, Visitor},
};
use thiserror::Error;

use crate::format::bootimage::BootVersion;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Profile {0:?} has no partitions")]
    Empty(String),
    #[error("Duplicate partition: {0:?}")]
    DuplicatePartition(String),
    #[error("Partition {partition:?} depends on unknown partition {dependency:?}")]
    UnknownDependency {
        partition: String,
        dependency: String,
    },
    #[error("Partition {0:?} depends on itself")]
    SelfDependency(String),
    #[error("Partition {partition:?} lists dependency {dependency:?} more than once")]
    DuplicateDependency {
        partition: String,
        dependency: String,
    },
    #[error("Partition {partition:?} ({version}) supports at most one ramdisk, but has {count}")]
    TooManyRamdisks {
        partition: String,
        version: BootVersion,
        count: usize,
    },
    #[error("Partition {0:?} has neither a kernel nor a ramdisk")]
    EmptyBootImage(String),
    #[error("Partition {partition:?} depends on unsigned vbmeta partition {dependency:?}")]
    UnsignedVbmetaDependency {
        partition: String,
        dependency: String,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Sha256Hash(
    #[serde(
        serialize_with = "hex::serialize",
        deserialize_with = "hex::deserialize"
    )]
    pub [u8; 32],
);

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Expected digests of the complete artifact before and after patching.
/// Missing digests are not checked.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileHashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Sha256Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patched: Option<Sha256Hash>,
}

/// Content carried by a ramdisk fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RamdiskTag {
    Init,
    Otacerts,
    InitAndOtacerts,
    Dlkm,
}

impl RamdiskTag {
    pub fn carries_init(self) -> bool {
        matches!(self, Self::Init | Self::InitAndOtacerts)
    }

    pub fn carries_otacerts(self) -> bool {
        matches!(self, Self::Otacerts | Self::InitAndOtacerts)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DmVerityContent {
    SystemOtacerts,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PartitionKind {
    Boot {
        version: BootVersion,
        #[serde(default)]
        kernel: bool,
        #[serde(default)]
        ramdisks: Vec<RamdiskTag>,
    },
    DmVerity {
        content: DmVerityContent,
    },
    Vbmeta {
        deps: Vec<String>,
    },
}

impl PartitionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boot { .. } => "boot",
            Self::DmVerity { .. } => "dm_verity",
            Self::Vbmeta { .. } => "vbmeta",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AvbConfig {
    pub signed: bool,
}

/// A partition as written in a profile configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub avb: AvbConfig,
    pub data: PartitionKind,
}

/// Map of partition names to partitions that keeps the order in which they
/// were declared. Duplicate names are rejected while deserializing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderedPartitions(pub Vec<(String, PartitionConfig)>);

impl<'de> Deserialize<'de> for OrderedPartitions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OrderedVisitor(PhantomData<OrderedPartitions>);

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = OrderedPartitions;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of partition names to partitions")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut result = Vec::<(String, PartitionConfig)>::new();

                while let Some((name, partition)) = map.next_entry::<String, PartitionConfig>()? {
                    if result.iter().any(|(n, _)| *n == name) {
                        return Err(serde::de::Error::custom(Error::DuplicatePartition(name)));
                    }

                    result.push((name, partition));
                }

                Ok(OrderedPartitions(result))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

/// A profile as written in a profile configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub partitions: OrderedPartitions,
    #[serde(default)]
    pub hashes: ProfileHashes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub signed: bool,
    pub kind: PartitionKind,
}

impl Partition {
    /// Partitions that this partition's AVB metadata covers. Only vbmeta
    /// partitions have dependencies.
    pub fn deps(&self) -> &[String] {
        match &self.kind {
            PartitionKind::Vbmeta { deps } => deps,
            _ => &[],
        }
    }

    pub fn ramdisks(&self) -> &[RamdiskTag] {
        match &self.kind {
            PartitionKind::Boot { ramdisks, .. } => ramdisks,
            _ => &[],
        }
    }
}

/// A validated, immutable device profile. Partitions are kept in declaration
/// order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    name: String,
    partitions: Vec<Partition>,
    hashes: ProfileHashes,
}

impl Profile {
    pub fn new(name: &str, partitions: Vec<Partition>, hashes: ProfileHashes) -> Result<Self> {
        let profile = Self {
            name: name.to_owned(),
            partitions,
            hashes,
        };

        profile.validate()?;

        Ok(profile)
    }

    pub fn from_config(name: &str, config: ProfileConfig) -> Result<Self> {
        let partitions = config
            .partitions
            .0
            .into_iter()
            .map(|(name, p)| Partition {
                name,
                signed: p.avb.signed,
                kind: p.data,
            })
            .collect();

        Self::new(name, partitions, config.hashes)
    }

    fn validate(&self) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(Error::Empty(self.name.clone()));
        }

        let mut names = HashSet::new();

        for partition in &self.partitions {
            if !names.insert(partition.name.as_str()) {
                return Err(Error::DuplicatePartition(partition.name.clone()));
            }
        }

        for partition in &self.partitions {
            match &partition.kind {
                PartitionKind::Boot {
                    version,
                    kernel,
                    ramdisks,
                } => {
                    if *version != BootVersion::VendorV4 && ramdisks.len() > 1 {
                        return Err(Error::TooManyRamdisks {
                            partition: partition.name.clone(),
                            version: *version,
                            count: ramdisks.len(),
                        });
                    } else if !kernel && ramdisks.is_empty() {
                        return Err(Error::EmptyBootImage(partition.name.clone()));
                    }
                }
                PartitionKind::DmVerity { .. } => {}
                PartitionKind::Vbmeta { deps } => {
                    let mut seen = HashSet::new();

                    for dep in deps {
                        if *dep == partition.name {
                            return Err(Error::SelfDependency(dep.clone()));
                        } else if !names.contains(dep.as_str()) {
                            return Err(Error::UnknownDependency {
                                partition: partition.name.clone(),
                                dependency: dep.clone(),
                            });
                        } else if !seen.insert(dep.as_str()) {
                            return Err(Error::DuplicateDependency {
                                partition: partition.name.clone(),
                                dependency: dep.clone(),
                            });
                        }

                        // Only signed vbmeta images can be chained to.
                        if let Some(p) = self.partition(dep)
                            && matches!(p.kind, PartitionKind::Vbmeta { .. })
                            && !p.signed
                        {
                            return Err(Error::UnsignedVbmetaDependency {
                                partition: partition.name.clone(),
                                dependency: dep.clone(),
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Index of a partition in declaration order.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.partitions.iter().position(|p| p.name == name)
    }

    pub fn hashes(&self) -> &ProfileHashes {
        &self.hashes
    }
}
