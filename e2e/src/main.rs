// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

mod cli;
mod config;

use std::{
    collections::BTreeSet,
    ffi::OsStr,
    fs,
    path::Path,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use avbpatch::{
    artifact::ImageSet,
    crypto,
    engine::{self, SigningKeys},
    generate,
    profile::{Profile, ProfileHashes, Sha256Hash},
    verify,
};
use clap::Parser;
use tempfile::TempDir;
use tracing::{error, info, info_span};

use crate::{
    cli::{Cli, Command, ConfigGroup, ListCli, ProfileGroup, TestCli, UpdateCli},
    config::Config,
};

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

macro_rules! new_keys_with_prefix {
    ($name:ident, $prefix:literal) => {
        fn $name() -> Result<SigningKeys> {
            let avb_key = include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/keys/",
                $prefix,
                "avb.key",
            ));
            let ota_cert = include_bytes!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/keys/",
                $prefix,
                "ota.crt",
            ));

            let avb = crypto::read_pem_key(avb_key)
                .with_context(|| format!("Failed to load {}AVB key", $prefix))?;
            let ota_cert = crypto::read_pem_cert(ota_cert)
                .with_context(|| format!("Failed to load {}OTA cert", $prefix))?;

            Ok(SigningKeys { avb, ota_cert })
        }
    };
}

new_keys_with_prefix!(new_orig_keys, "ORIG_KEY_DO_NOT_USE_");
new_keys_with_prefix!(new_test_keys, "TEST_KEY_DO_NOT_USE_");

struct Artifacts {
    original: Vec<u8>,
    patched: Vec<u8>,
}

fn write_artifact(path: &Path, data: &[u8]) -> Result<()> {
    info!("Writing artifact: {path:?}");

    fs::write(path, data).with_context(|| format!("Failed to write artifact: {path:?}"))
}

/// Generate, patch, and verify the artifacts for a profile. The artifacts are
/// written to `profile_dir` before they are verified so that failures can be
/// inspected.
fn run_pipeline(
    profile: &Profile,
    orig_keys: &SigningKeys,
    test_keys: &SigningKeys,
    profile_dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<Artifacts> {
    fs::create_dir_all(profile_dir)
        .with_context(|| format!("Failed to create directory: {profile_dir:?}"))?;

    info!("Generating original images");

    let original_images = generate::generate_images(profile, orig_keys, cancel_signal)
        .context("Failed to generate images")?;
    let original = original_images
        .to_artifact()
        .context("Failed to serialize original artifact")?;
    write_artifact(&profile_dir.join("original.zip"), &original)?;

    verify::verify_chain(
        &original_images,
        &orig_keys.avb.to_public_key(),
        cancel_signal,
    )
    .context("Failed to verify original AVB chain")?;

    info!("Patching images");

    let patched = engine::patch_artifact(profile, &original, test_keys, cancel_signal)
        .context("Failed to patch artifact")?;
    write_artifact(&profile_dir.join("patched.zip"), &patched)?;

    let patched_images =
        ImageSet::from_artifact(&patched).context("Failed to parse patched artifact")?;

    verify::verify_chain(
        &patched_images,
        &test_keys.avb.to_public_key(),
        cancel_signal,
    )
    .context("Failed to verify patched AVB chain")?;
    verify::verify_otacerts(&patched_images, profile, &test_keys.ota_cert, cancel_signal)
        .context("Failed to verify patched otacerts")?;

    info!("Patching again to check idempotence");

    let repatched = engine::patch_artifact(profile, &patched, test_keys, cancel_signal)
        .context("Failed to patch already patched artifact")?;
    if repatched != patched {
        write_artifact(&profile_dir.join("repatched.zip"), &repatched)?;
        bail!("Patching an already patched artifact changed its contents");
    }

    Ok(Artifacts { original, patched })
}

fn check_hash(what: &str, expected: Option<&Sha256Hash>, data: &[u8]) -> Result<()> {
    let actual = verify::sha256(data);

    let Some(expected) = expected else {
        bail!("No expected {what} hash (actual: {actual}); run the update subcommand");
    };

    verify::check_digest(what, expected, &actual)?;

    Ok(())
}

fn filter_profiles<'a>(config: &'a Config, cli: &'a ProfileGroup) -> Result<BTreeSet<&'a str>> {
    let mut profiles = config
        .profile
        .keys()
        .map(|n| n.as_str())
        .collect::<BTreeSet<_>>();

    if !cli.all {
        let invalid = cli
            .profile
            .iter()
            .filter(|d| !profiles.contains(d.as_str()))
            .collect::<BTreeSet<_>>();
        if !invalid.is_empty() {
            bail!("Invalid profiles: {invalid:?}");
        }

        profiles = cli.profile.iter().map(|d| d.as_str()).collect();
    }

    if profiles.is_empty() {
        bail!("No profiles selected");
    }

    Ok(profiles)
}

/// Run the pipeline for every selected profile. `callback` is called with the
/// artifacts of each profile that passes.
fn for_each_profile(
    config: &Config,
    profiles: &BTreeSet<&str>,
    config_group: &ConfigGroup,
    cancel_signal: &AtomicBool,
    mut callback: impl FnMut(&str, &Profile, &Artifacts) -> Result<()>,
) -> Result<()> {
    let orig_keys = new_orig_keys()?;
    let test_keys = new_test_keys()?;

    let work_temp_dir = match &config_group.work_dir {
        Some(_) => None,
        None => Some(TempDir::new().context("Failed to create temp directory")?),
    };
    let work_dir = match (&config_group.work_dir, &work_temp_dir) {
        (Some(w), _) => w.as_path(),
        (None, Some(t)) => t.path(),
        (None, None) => bail!("No working directory"),
    };

    for name in profiles {
        let _span = info_span!("profile", name).entered();

        if Path::new(name).file_name() != Some(OsStr::new(name)) {
            bail!("Unsafe profile name: {name}");
        }

        let profile = Profile::from_config(name, config.profile[*name].clone())
            .with_context(|| format!("[{name}] Invalid profile"))?;

        let artifacts = run_pipeline(
            &profile,
            &orig_keys,
            &test_keys,
            &work_dir.join(name),
            cancel_signal,
        )
        .with_context(|| format!("[{name}] Pipeline failed"))?;

        callback(name, &profile, &artifacts).with_context(|| format!("[{name}] Check failed"))?;
    }

    Ok(())
}

fn test_subcommand(cli: &TestCli, cancel_signal: &AtomicBool) -> Result<()> {
    let (config, _) = config::load_config(&cli.config.config)?;
    let profiles = filter_profiles(&config, &cli.profile)?;

    for_each_profile(
        &config,
        &profiles,
        &cli.config,
        cancel_signal,
        |_, profile, artifacts| {
            let hashes = profile.hashes();

            check_hash("original", hashes.original.as_ref(), &artifacts.original)?;
            check_hash("patched", hashes.patched.as_ref(), &artifacts.patched)?;

            info!("Passed");

            Ok(())
        },
    )
}

fn list_subcommand(cli: &ListCli) -> Result<()> {
    let (config, _) = config::load_config(&cli.config.config)?;

    for profile in config.profile.keys() {
        println!("{profile}");
    }

    Ok(())
}

fn update_subcommand(cli: &UpdateCli, cancel_signal: &AtomicBool) -> Result<()> {
    let (config, mut document) = config::load_config(&cli.config.config)?;
    let profiles = filter_profiles(&config, &cli.profile)?;

    for_each_profile(
        &config,
        &profiles,
        &cli.config,
        cancel_signal,
        |name, _, artifacts| {
            let hashes = ProfileHashes {
                original: Some(verify::sha256(&artifacts.original)),
                patched: Some(verify::sha256(&artifacts.patched)),
            };

            info!("Updating hashes: {hashes:?}");

            config::set_hashes(&mut document, name, &hashes)
        },
    )?;

    config::save_config(&cli.config.config, &document)
}

fn main_wrapper(cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    cli::init_logging(cli.log_level, cli.log_format);
    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Test(c) => test_subcommand(&c, cancel_signal),
        Command::List(c) => list_subcommand(&c),
        Command::Update(c) => update_subcommand(&c, cancel_signal),
    }
}

fn main() -> ExitCode {
    // Set up a cancel signal so partially written artifacts are not mistaken
    // for complete ones.
    let cancel_signal = Arc::new(AtomicBool::new(false));
    {
        let signal = cancel_signal.clone();

        if let Err(e) = ctrlc::set_handler(move || {
            signal.store(true, Ordering::SeqCst);
        }) {
            eprintln!("Failed to set signal handler: {e}");
            return ExitCode::FAILURE;
        }
    }

    match main_wrapper(&cancel_signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
                error!("{e:?}");
            } else {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
