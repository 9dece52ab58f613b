use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use docstore_core::DEFAULT_VERSION_FIELD;

/// Configuration for the docstore-local client.
#[derive(Parser, Debug, Clone)]
#[command(name = "docstore-local")]
#[command(about = "Filesystem document store with change-tracked minimal updates")]
pub struct Config {
    /// Directory holding one JSON file per collection
    #[arg(long, env = "DOCSTORE_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Directory for per-document lock files (defaults to `<data dir>/locks`)
    #[arg(long, env = "DOCSTORE_LOCK_DIR", global = true)]
    pub lock_dir: Option<PathBuf>,

    /// How long `lock` waits for a document held elsewhere, in seconds
    #[arg(long, default_value = "30", env = "DOCSTORE_LOCK_TIMEOUT_SECS", global = true)]
    pub lock_timeout_secs: u64,

    /// Integer field used for optimistic locking
    #[arg(long, default_value = DEFAULT_VERSION_FIELD, env = "DOCSTORE_VERSION_FIELD", global = true)]
    pub version_field: String,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Get the effective data directory.
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docstore")
                .join("collections")
        })
    }

    /// Get the effective lock directory.
    pub fn effective_lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.effective_data_dir().join("locks"))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the update that turns one JSON document into another
    Diff { before: PathBuf, after: PathBuf },

    /// Insert a JSON document and print its id
    Insert { collection: String, document: PathBuf },

    /// Print a document
    Get { collection: String, id: String },

    /// Replace a document's values, writing only what changed
    Update {
        collection: String,
        id: String,
        document: PathBuf,
        /// Fail instead of overwriting if the stored version moved on
        #[arg(long)]
        optimistic: bool,
    },

    /// Delete a document
    Delete { collection: String, id: String },

    /// Replace a document's values while holding its pessimistic lock
    Lock {
        collection: String,
        id: String,
        document: PathBuf,
        /// Fail immediately if the document is locked
        #[arg(long)]
        no_wait: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update() {
        let config = Config::try_parse_from([
            "docstore-local",
            "--data-dir",
            "/tmp/data",
            "update",
            "users",
            "0123456789abcdef01234567",
            "user.json",
            "--optimistic",
        ])
        .unwrap();

        assert_eq!(config.effective_data_dir(), PathBuf::from("/tmp/data"));
        assert_eq!(config.effective_lock_dir(), PathBuf::from("/tmp/data/locks"));
        assert_eq!(config.version_field, "version");
        assert_eq!(
            config.command,
            Command::Update {
                collection: "users".to_string(),
                id: "0123456789abcdef01234567".to_string(),
                document: PathBuf::from("user.json"),
                optimistic: true,
            }
        );
    }

    #[test]
    fn test_lock_flags() {
        let config = Config::try_parse_from([
            "docstore-local",
            "lock",
            "users",
            "0123456789abcdef01234567",
            "user.json",
            "--no-wait",
            "--lock-timeout-secs",
            "5",
        ])
        .unwrap();

        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert!(matches!(config.command, Command::Lock { no_wait: true, .. }));
    }
}
