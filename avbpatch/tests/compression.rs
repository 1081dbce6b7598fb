// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use assert_matches::assert_matches;

use avbpatch::format::compression::{self, CompressedFormat};

fn round_trip(data: &[u8], format: CompressedFormat) {
    let compressed = compression::compress(format, data).unwrap();
    assert_eq!(CompressedFormat::detect(&compressed, false).unwrap(), format);

    let (detected, new_data) = compression::decompress(&compressed, false).unwrap();
    assert_eq!(detected, format);
    assert_eq!(data, new_data);
}

#[test]
fn round_trip_gzip() {
    round_trip(b"gzip-compressed data", CompressedFormat::Gzip);
}

#[test]
fn round_trip_lz4_legacy() {
    // Make sure we exceed the 8MiB block boundary.
    let data = b"Lz4Legacy".repeat(1024 * 1024);
    round_trip(&data, CompressedFormat::Lz4Legacy);
}

#[test]
fn lz4_legacy_is_deterministic() {
    let data = b"ramdisk contents".repeat(100);

    assert_eq!(
        compression::compress(CompressedFormat::Lz4Legacy, &data).unwrap(),
        compression::compress(CompressedFormat::Lz4Legacy, &data).unwrap(),
    );
}

#[test]
fn unknown_format() {
    let data = b"070701 raw cpio data";

    assert_matches!(
        CompressedFormat::detect(data, false),
        Err(compression::Error::UnknownFormat)
    );

    let (format, new_data) = compression::decompress(data, true).unwrap();
    assert_eq!(format, CompressedFormat::None);
    assert_eq!(new_data, data);
}
