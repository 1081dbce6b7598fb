// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

use crate::{
    artifact,
    format::{avb, bootimage, verity},
    graph,
    patch::{boot, system, vbmeta},
    profile,
};

/// Failure of a codec or patcher while processing a single partition.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("No image provided")]
    MissingImage,
    #[error("AVB error")]
    Avb(#[from] avb::Error),
    #[error("Boot image error")]
    BootImage(#[from] bootimage::Error),
    #[error("dm-verity error")]
    Verity(#[from] verity::Error),
    #[error("Boot image patch error")]
    BootPatch(#[from] boot::Error),
    #[error("System image patch error")]
    SystemPatch(#[from] system::Error),
    #[error("vbmeta error")]
    Vbmeta(#[from] vbmeta::Error),
}

impl CodecError {
    /// Whether the failure happened because patched data no longer fits in a
    /// fixed-size region.
    pub fn is_size_constraint(&self) -> bool {
        match self {
            Self::Avb(avb::Error::TooSmallForHeader(_) | avb::Error::TooSmallForFooter(_)) => true,
            Self::Verity(e) => e.is_size_constraint(),
            Self::BootPatch(e) => e.is_size_constraint(),
            Self::SystemPatch(e) => e.is_size_constraint(),
            _ => false,
        }
    }
}

/// Errors reported by the patch/re-sign engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid profile configuration")]
    Config(#[from] profile::Error),
    #[error("Dependency cycle between partitions: {}", partitions.join(" -> "))]
    Cycle { partitions: Vec<String> },
    #[error("Partition {partition:?} does not match its declared format")]
    Format {
        partition: String,
        #[source]
        source: CodecError,
    },
    #[error("Partition {partition:?} does not fit within its size constraints")]
    SizeConstraint {
        partition: String,
        #[source]
        source: CodecError,
    },
    #[error("Partition {partition:?} cannot be signed before {dependency:?} is final")]
    SigningOrder {
        partition: String,
        dependency: String,
    },
    #[error("{what} digest mismatch: expected {expected}, but have {actual}")]
    Verification {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("Artifact error")]
    Artifact(#[from] artifact::Error),
    #[error("Received cancel signal")]
    Cancelled,
}

impl Error {
    /// Classify a codec failure for a partition.
    pub fn codec(partition: &str, source: impl Into<CodecError>) -> Self {
        let source = source.into();
        let partition = partition.to_owned();

        if source.is_size_constraint() {
            Self::SizeConstraint { partition, source }
        } else {
            Self::Format { partition, source }
        }
    }
}

impl From<graph::Error> for Error {
    fn from(value: graph::Error) -> Self {
        match value {
            graph::Error::Cycle { partitions } => Self::Cycle { partitions },
            graph::Error::UnknownDependency {
                partition,
                dependency,
            } => Self::Config(profile::Error::UnknownDependency {
                partition,
                dependency,
            }),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn classify_codec_errors() {
        assert_matches!(
            Error::codec("boot", avb::Error::TooSmallForFooter(4096)),
            Error::SizeConstraint { partition, .. } if partition == "boot"
        );
        assert_matches!(
            Error::codec("system", verity::Error::MissingHashTreeDescriptor),
            Error::Format { partition, .. } if partition == "system"
        );
        assert_matches!(
            Error::codec("vbmeta", CodecError::MissingImage),
            Error::Format { .. }
        );
    }

    #[test]
    fn unknown_dependency_is_config_error() {
        let error = Error::from(graph::Error::UnknownDependency {
            partition: "vbmeta".to_owned(),
            dependency: "boot".to_owned(),
        });

        assert_matches!(
            error,
            Error::Config(profile::Error::UnknownDependency { .. })
        );
    }
}
