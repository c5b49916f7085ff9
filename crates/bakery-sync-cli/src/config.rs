use std::path::PathBuf;
use std::time::Duration;

use bakery_sync_core::AcquireOptions;
use clap::{Parser, Subcommand};

/// Configuration for the bakery-sync command line client.
#[derive(Parser, Debug, Clone)]
#[command(name = "bakery-sync")]
#[command(about = "Coordinate writers of one shared remote file with a bakery lock")]
pub struct Config {
    /// Shared file: a local path, s3://bucket/key or r2://bucket/key
    #[arg(long, env = "BAKERY_REMOTE")]
    pub remote: String,

    /// Participant id of this writer
    #[arg(long, env = "BAKERY_PARTICIPANT")]
    pub participant: Option<String>,

    /// Directory holding local copies of remote files
    #[arg(long, env = "BAKERY_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Key prefix of the lock namespace (defaults to the remote key's directory)
    #[arg(long, env = "BAKERY_NAMESPACE")]
    pub namespace: Option<String>,

    /// Give up waiting for the lock after this many seconds
    #[arg(long, env = "BAKERY_LOCK_TIMEOUT_SECS")]
    pub lock_timeout_secs: Option<u64>,

    /// First delay between lock polls, in milliseconds
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u64).range(1..))]
    pub backoff_base_ms: u64,

    /// Longest delay between lock polls, in milliseconds
    #[arg(long, default_value = "5000")]
    pub backoff_max_ms: u64,

    /// Custom S3 endpoint (R2, MinIO)
    #[arg(long, env = "BAKERY_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register this participant in the lock namespace
    Join,
    /// Download the remote file if the local copy is stale
    Pull,
    /// Upload the local copy to the remote file while holding the lock
    Push {
        /// Skip the lock (recovery only; may overwrite a writer's session)
        #[arg(long)]
        force: bool,
    },
    /// Show participants, tickets and cache state
    Status,
    /// Reset a ticket to idle
    Release {
        /// Release another participant's ticket (recovery after a crash)
        #[arg(long)]
        participant_override: Option<String>,
    },
    /// Run a command while holding the lock on a synchronized local copy
    ///
    /// The local path is passed in BAKERY_LOCAL_PATH. The copy is pushed
    /// back if the command changed it.
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

impl Config {
    /// Get the effective cache directory.
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("bakery-sync")
        })
    }

    /// Participant id, required by every command that touches the lock.
    pub fn require_participant(&self) -> anyhow::Result<&str> {
        self.participant
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--participant (or BAKERY_PARTICIPANT) is required"))
    }

    /// Lock wait settings; `cancel` is not set here.
    pub fn acquire_options(&self) -> AcquireOptions {
        let mut options = AcquireOptions::default().with_backoff(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        );
        if let Some(secs) = self.lock_timeout_secs {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec_with_trailing_args() {
        let config = Config::try_parse_from([
            "bakery-sync",
            "--remote",
            "s3://bucket/db/instance.db",
            "--participant",
            "alice",
            "exec",
            "--",
            "sqlite3",
            "-batch",
            "x.db",
        ])
        .unwrap();

        assert_eq!(config.participant.as_deref(), Some("alice"));
        assert_eq!(
            config.command,
            Command::Exec {
                command: vec!["sqlite3".into(), "-batch".into(), "x.db".into()]
            }
        );
    }

    #[test]
    fn test_release_override() {
        let config = Config::try_parse_from([
            "bakery-sync",
            "--remote",
            "/shared/instance.db",
            "release",
            "--participant-override",
            "bob",
        ])
        .unwrap();

        assert_eq!(
            config.command,
            Command::Release {
                participant_override: Some("bob".into())
            }
        );
        assert!(config.require_participant().is_err());
    }

    #[test]
    fn test_acquire_options() {
        let config = Config::try_parse_from([
            "bakery-sync",
            "--remote",
            "/shared/instance.db",
            "--lock-timeout-secs",
            "30",
            "--backoff-base-ms",
            "50",
            "--backoff-max-ms",
            "20",
            "status",
        ])
        .unwrap();

        let options = config.acquire_options();
        assert_eq!(options.timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.backoff_base, Duration::from_millis(50));
        // max is never below base
        assert_eq!(options.backoff_max, Duration::from_millis(50));
        assert!(options.cancel.is_none());
    }

    #[test]
    fn test_zero_backoff_rejected() {
        let result = Config::try_parse_from([
            "bakery-sync",
            "--remote",
            "/shared/instance.db",
            "--backoff-base-ms",
            "0",
            "status",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_push_force_flag() {
        let config =
            Config::try_parse_from(["bakery-sync", "--remote", "/shared/instance.db", "push"])
                .unwrap();
        assert_eq!(config.command, Command::Push { force: false });

        let config = Config::try_parse_from([
            "bakery-sync",
            "--remote",
            "/shared/instance.db",
            "push",
            "--force",
        ])
        .unwrap();
        assert_eq!(config.command, Command::Push { force: true });
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let config = Config::try_parse_from([
            "bakery-sync",
            "--remote",
            "/shared/instance.db",
            "--cache-dir",
            "/tmp/cache",
            "pull",
        ])
        .unwrap();
        assert_eq!(config.effective_cache_dir(), PathBuf::from("/tmp/cache"));
    }
}
