// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging initialisation for hostfs binaries
//!
//! One global `tracing` subscriber per process: an `EnvFilter` (`RUST_LOG` wins,
//! otherwise `<level>,<component>=<level>`) plus a `fmt` layer in plaintext or JSON.
//! Output goes to stderr unless a log file is given, since stdout may belong to the
//! host runtime.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing::Level;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Plaintext => "plaintext",
            LogFormat::Json => "json",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Level::from(*self), f)
    }
}

/// Logging flags; flatten into a binary's clap arguments with `#[command(flatten)]`.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    #[arg(long, value_enum, help = "Log verbosity level (default: info)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    #[arg(long, value_enum, help = "Log output format (default: plaintext)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    #[arg(long, help = "Append logs to this file instead of stderr")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl CliLoggingArgs {
    pub fn level(&self) -> Level {
        self.log_level.unwrap_or_default().into()
    }

    pub fn format(&self) -> LogFormat {
        self.log_format.unwrap_or_default()
    }

    pub fn init(&self, component: &str) -> anyhow::Result<()> {
        match &self.log_file {
            Some(path) => init_to_file(component, self.level(), self.format(), path),
            None => init(component, self.level(), self.format()),
        }
    }
}

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(component: &str, level: Level) -> String {
    format!("{level},{component}={level}")
}

pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stderr)
}

/// Append to `log_path`, creating it and its parent directory if needed.
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let log_file = fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    init_with_writer(component, default_level, format, log_file)
}

pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(component, default_level)));

    let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_thread_names(true);
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(layer.json()).try_init()?
        }
        LogFormat::Plaintext => tracing_subscriber::registry().with(filter).with(layer).try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        logging: CliLoggingArgs,
    }

    #[test]
    fn cli_levels_convert_and_display() {
        assert_eq!(Level::from(CliLogLevel::Warn), Level::WARN);
        assert_eq!(CliLogLevel::Debug.to_string(), "DEBUG");
        assert_eq!(CliLogLevel::default(), CliLogLevel::Info);
    }

    #[test]
    fn args_default_to_info_plaintext_stderr() {
        let cli = TestCli::parse_from(["hostfs-host"]);
        assert_eq!(cli.logging.level(), Level::INFO);
        assert_eq!(cli.logging.format(), LogFormat::Plaintext);
        assert!(cli.logging.log_file.is_none());
    }

    #[test]
    fn args_parse_flags() {
        let cli = TestCli::parse_from([
            "hostfs-host",
            "--log-level",
            "trace",
            "--log-format",
            "json",
            "--log-file",
            "/tmp/hostfs.log",
        ]);
        assert_eq!(cli.logging.level(), Level::TRACE);
        assert_eq!(cli.logging.format(), LogFormat::Json);
        assert_eq!(cli.logging.log_file, Some(PathBuf::from("/tmp/hostfs.log")));
    }

    #[test]
    fn directive_names_component() {
        assert_eq!(default_directive("hostfs", Level::DEBUG), "DEBUG,hostfs=DEBUG");
    }

    #[test]
    fn file_logging_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("hostfs.log");
        // A subscriber may already be installed by another test; only the file matters here.
        let _ = init_to_file("hostfs", Level::INFO, LogFormat::Json, &path);
        assert!(path.exists());
    }
}
