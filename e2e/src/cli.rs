// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, IsTerminal},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::Level;

#[derive(Debug, Args)]
pub struct ProfileGroup {
    /// Profile name.
    #[arg(short, long, value_name = "NAME")]
    pub profile: Vec<String>,

    /// All profiles.
    #[arg(short, long, conflicts_with = "profile")]
    pub all: bool,
}

#[derive(Debug, Args)]
pub struct ConfigGroup {
    /// Path to config file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        value_parser,
        default_value = "e2e.toml"
    )]
    pub config: PathBuf,

    /// Working directory for storing artifacts.
    ///
    /// If unspecified, a temporary directory is used and deleted afterwards.
    #[arg(short, long, value_name = "DIRECTORY", value_parser)]
    pub work_dir: Option<PathBuf>,
}

/// Run tests.
///
/// For each profile, this generates the original images, patches them, and
/// verifies the AVB chain, the otacerts, and the artifact hashes. The patched
/// artifact is then patched again to ensure that patching is idempotent.
#[derive(Debug, Parser)]
pub struct TestCli {
    #[command(flatten)]
    pub profile: ProfileGroup,

    #[command(flatten)]
    pub config: ConfigGroup,
}

/// List profiles in config file.
#[derive(Debug, Parser)]
pub struct ListCli {
    #[command(flatten)]
    pub config: ConfigGroup,
}

/// Update the artifact hashes in the config file.
///
/// Comments and formatting outside of the hashes tables are preserved.
#[derive(Debug, Parser)]
pub struct UpdateCli {
    #[command(flatten)]
    pub profile: ProfileGroup,

    #[command(flatten)]
    pub config: ConfigGroup,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Test(TestCli),
    List(ListCli),
    Update(UpdateCli),
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum LogFormat {
    /// Message and span names only.
    #[default]
    Short,
    /// Also include the level and timestamp.
    Medium,
    /// Also include the target, thread, and source location.
    Long,
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t, value_enum)]
    pub log_level: LogLevel,

    /// Output format for log messages.
    #[arg(long, global = true, value_name = "FORMAT", default_value_t, value_enum)]
    pub log_format: LogFormat,
}

pub fn init_logging(log_level: LogLevel, log_format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_max_level(Level::from(log_level));

    match log_format {
        LogFormat::Short => builder
            .without_time()
            .with_level(false)
            .with_target(false)
            .init(),
        LogFormat::Medium => builder.with_target(false).init(),
        LogFormat::Long => builder
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
    }
}
