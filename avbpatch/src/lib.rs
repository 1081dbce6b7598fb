// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Patch Android partition images and re-sign their AVB metadata so that the
//! result is a valid chain of trust rooted in a custom key.
//!
//! The codecs under [`format`] operate on in-memory images. [`engine`] drives
//! the patchers in [`patch`] in the dependency order computed by [`graph`].

pub mod artifact;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod format;
pub mod generate;
pub mod graph;
pub mod patch;
pub mod profile;
pub mod stream;
pub mod util;
pub mod verify;

pub use error::{CodecError, Error, Result};
