// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Context;
use fs_err::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Directory that receives every log and evidence file of a cycling run.
#[derive(Clone, Debug)]
pub struct CycleLogSource {
    root: PathBuf,
}

impl CycleLogSource {
    /// Use `root` (created if missing) as the log directory.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs_err::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The log directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A subdirectory of the log directory, created if missing.
    pub fn subdir(&self, name: &str) -> anyhow::Result<PathBuf> {
        let path = self.root.join(name);
        fs_err::create_dir_all(&path)?;
        Ok(path)
    }

    /// Directory for health-check evidence.
    pub fn health_check_dir(&self) -> anyhow::Result<PathBuf> {
        self.subdir("health_check")
    }

    /// Create (or truncate) an attachment file in the log directory.
    pub fn create_attachment(&self, name: &str) -> anyhow::Result<File> {
        Ok(File::create(self.root.join(name))?)
    }

    /// Write an attachment file in the log directory.
    pub fn write_attachment(&self, name: &str, data: impl AsRef<[u8]>) -> anyhow::Result<()> {
        self.create_attachment(name)?.write_all(data.as_ref())?;
        Ok(())
    }
}

/// Initialize global tracing for a cycling run.
///
/// Events go to stderr, to `cycling.log` (plain text) and to
/// `cycling.jsonl` in `log_dir`. `RUST_LOG` overrides the default `info`
/// filter.
pub fn try_init_tracing(log_dir: &Path) -> anyhow::Result<CycleLogSource> {
    let source = CycleLogSource::new(log_dir)?;

    let text_log = source
        .create_attachment("cycling.log")
        .context("failed to create text log")?;
    let json_log = source
        .create_attachment("cycling.jsonl")
        .context("failed to create json log")?;

    let filter = || {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(text_log))
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(json_log))
                .with_filter(filter()),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::CycleLogSource;

    #[test_with_tracing::test]
    fn attachments_land_in_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = CycleLogSource::new(dir.path().join("run")).unwrap();
        source.write_attachment("note.txt", "hello").unwrap();
        let health = source.health_check_dir().unwrap();

        assert!(health.is_dir());
        assert_eq!(
            fs_err::read_to_string(source.root().join("note.txt")).unwrap(),
            "hello"
        );
    }
}
