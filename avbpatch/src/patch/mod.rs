// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod boot;
pub mod otacert;
pub mod system;
pub mod vbmeta;
