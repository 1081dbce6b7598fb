// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result, bail};
use avbpatch::profile::{ProfileConfig, ProfileHashes};
use serde::{Deserialize, Serialize};
use toml_edit::{
    Array, DocumentMut, InlineTable, Item, KeyMut, Table, Value,
    ser::ValueSerializer,
    visit_mut::{self, VisitMut},
};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub profile: BTreeMap<String, ProfileConfig>,
}

struct ConfigFormatter;

impl VisitMut for ConfigFormatter {
    fn visit_table_like_kv_mut(&mut self, key: KeyMut<'_>, node: &mut Item) {
        // Convert non-array-of-tables inline tables into regular tables.
        if let Item::Value(Value::InlineTable(t)) = node {
            let inline_table = std::mem::replace(t, InlineTable::new());
            *node = Item::Table(inline_table.into_table());
        }

        // But for hashes, use dotted notation until TOML 1.1, which allows
        // newlines in inline tables, is released.
        if key == "hashes" {
            if let Some(t) = node.as_table_like_mut() {
                t.set_dotted(true);
            }
        }

        visit_mut::visit_table_like_kv_mut(self, key, node);
    }

    fn visit_table_mut(&mut self, node: &mut Table) {
        // Make tables implicit unless they are empty, which may be meaningful.
        if !node.is_empty() {
            node.set_implicit(true);
        }

        visit_mut::visit_table_mut(self, node);
    }

    fn visit_array_mut(&mut self, node: &mut Array) {
        visit_mut::visit_array_mut(self, node);

        // Put array elements on their own indented lines.
        if node.is_empty() {
            node.set_trailing("");
            node.set_trailing_comma(false);
        } else {
            for item in node.iter_mut() {
                item.decor_mut().set_prefix("\n    ");
            }
            node.set_trailing("\n");
            node.set_trailing_comma(true);
        }
    }
}

#[derive(Serialize)]
struct HashesEntry<'a> {
    hashes: &'a ProfileHashes,
}

/// Replace a profile's hashes. This leaves all comments intact, except for
/// those contained within the existing hashes entries.
pub fn set_hashes(document: &mut DocumentMut, name: &str, hashes: &ProfileHashes) -> Result<()> {
    let Some(profile_table) = document
        .get_mut("profile")
        .and_then(|p| p.get_mut(name))
        .and_then(|p| p.as_table_like_mut())
    else {
        bail!("Profile not found in document: {name}");
    };

    let value = HashesEntry { hashes }.serialize(ValueSerializer::new())?;
    let Value::InlineTable(inline_table) = value else {
        bail!("Hashes did not serialize as an inline table");
    };
    let mut table = inline_table.into_table();

    ConfigFormatter.visit_table_mut(&mut table);

    profile_table.remove("hashes");
    if let Some((key, item)) = table.remove_entry("hashes") {
        profile_table.insert(key.get(), item);
    }

    Ok(())
}

pub fn load_config(path: &Path) -> Result<(Config, DocumentMut)> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read config: {path:?}"))?;
    let config: Config = toml_edit::de::from_str(&contents)
        .with_context(|| format!("Failed to parse config: {path:?}"))?;
    let document: DocumentMut = contents
        .parse()
        .with_context(|| format!("Failed to parse config document: {path:?}"))?;

    Ok((config, document))
}

pub fn save_config(path: &Path, document: &DocumentMut) -> Result<()> {
    fs::write(path, document.to_string())
        .with_context(|| format!("Failed to write config: {path:?}"))
}

#[cfg(test)]
mod tests {
    use avbpatch::profile::Sha256Hash;

    use super::*;

    #[test]
    fn hashes_are_dotted() {
        let mut document: DocumentMut = "\
# Comment.
[profile.foo]

[profile.foo.partitions.vbmeta.avb]
signed = true

[profile.foo.partitions.vbmeta.data]
type = \"vbmeta\"
deps = []
"
        .parse()
        .unwrap();

        let hashes = ProfileHashes {
            original: Some(Sha256Hash([0x11; 32])),
            patched: Some(Sha256Hash([0x22; 32])),
        };

        set_hashes(&mut document, "foo", &hashes).unwrap();

        let output = document.to_string();
        assert!(output.starts_with("# Comment.\n"));
        assert!(output.contains("[profile.foo]\nhashes.original = "));
        assert!(output.contains(&format!("hashes.original = \"{}\"", "11".repeat(32))));
        assert!(output.contains(&format!("hashes.patched = \"{}\"", "22".repeat(32))));

        let config: Config = toml_edit::de::from_str(&output).unwrap();
        assert_eq!(config.profile["foo"].hashes, hashes);
    }
}
