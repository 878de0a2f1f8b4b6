use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use socket_patch_core::LockOptions;

/// Configuration for the socket-patch-local maintenance CLI.
#[derive(Parser, Debug, Clone)]
#[command(name = "socket-patch-local")]
#[command(about = "Inspect, verify and roll back socket patches on a local project")]
pub struct Config {
    /// Project directory containing `.socket/manifest.json`
    #[arg(long, default_value = ".", env = "SOCKET_PATCH_CWD")]
    pub cwd: PathBuf,

    /// Base directory for patch backups
    #[arg(long, env = "SOCKET_PATCH_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Retries when the project lock is held by another process
    #[arg(long, default_value = "10", env = "SOCKET_PATCH_LOCK_RETRIES")]
    pub lock_retries: u32,

    /// Age in milliseconds after which a project lock is considered abandoned
    #[arg(long, default_value = "10000", env = "SOCKET_PATCH_LOCK_STALE_MS")]
    pub lock_stale_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List recorded patches and their backups
    Status,
    /// Restore original files and forget the patches
    Rollback {
        /// Only roll back this package (e.g. npm/lodash@4.17.20)
        package_id: Option<String>,
    },
    /// Check every backup of a patch against its integrity hash
    Verify { uuid: String },
    /// Check that the manifest parses and passes validation
    Validate,
    /// Delete the backups of a patch
    Cleanup { uuid: String },
}

impl Config {
    /// Get the effective backup directory.
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("socket")
                .join("patch-backups")
        })
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            retries: self.lock_retries,
            stale: Duration::from_millis(self.lock_stale_ms),
            ..LockOptions::default()
        }
    }
}
