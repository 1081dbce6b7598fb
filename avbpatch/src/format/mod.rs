// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod avb;
pub mod bootimage;
pub mod compression;
pub mod cpio;
pub mod hashtree;
pub mod padding;
pub mod verity;
