//! Session logger: all `tracing` output goes to a single file in the OS data
//! directory.
//!
//! The file is **truncated at each launch**, so it only ever contains output
//! from the most recent session.
//!
//! Log location:
//!   Windows:  `%APPDATA%\PhotoBridge\photobridge.log`
//!   Linux:    `~/.local/share/PhotoBridge/photobridge.log`
//!   macOS:    `~/Library/Application Support/PhotoBridge/photobridge.log`
//!
//! Filter level comes from `RUST_LOG` when set, otherwise from the settings
//! file's `log_level`.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::data_dir;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Path of the current session log, once [`init`] has opened it.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

pub fn log_file_path() -> PathBuf {
    data_dir().join("PhotoBridge").join("photobridge.log")
}

/// Install the global subscriber. `verbose` mirrors everything to stderr.
///
/// Never fails: if the log file can't be opened, output goes to stderr only.
/// Calling it a second time is a no-op.
pub fn init(default_level: &str, verbose: bool) {
    let path = log_file_path();
    let file = open_truncated(&path);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = file.as_ref().ok().and_then(|f| f.try_clone().ok()).map(|f| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(f))
    });
    let stderr_layer = (verbose || file.is_err())
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();
    if !installed {
        return;
    }

    match &file {
        Ok(_) => {
            let _ = LOG_PATH.set(path.clone());
            tracing::info!(
                "=== PhotoBridge {} session started, log file {} ===",
                env!("CARGO_PKG_VERSION"),
                path.display()
            );
        }
        Err(e) => tracing::warn!("Failed to open log file {}: {}", path.display(), e),
    }

    // Mirror panics into the log, then run the default handler.
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC: {}", info);
        prev(info);
    }));
}

fn open_truncated(path: &PathBuf) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}
