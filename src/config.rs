use std::path::PathBuf;
use std::time::Duration;

/// Smallest file the verifier will accept as a real executable (1 MiB).
pub const MIN_BINARY_SIZE: u64 = 1024 * 1024;

/// Block size for streaming downloads to disk.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Tunables for one orchestrator. Loading these from a file is the host's job.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub block_size: usize,
    pub min_binary_size: u64,
    /// Spawn the relaunch helper after a verified commit.
    pub relaunch: bool,
    /// How long the relaunch helper waits before each of its steps.
    pub relaunch_grace: Duration,
    pub user_agent: String,
    /// Root for scratch directories. `None` uses the OS temp dir.
    pub work_dir: Option<PathBuf>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(300),
            block_size: DEFAULT_BLOCK_SIZE,
            min_binary_size: MIN_BINARY_SIZE,
            relaunch: true,
            relaunch_grace: Duration::from_secs(2),
            user_agent: format!("selfpatch/{} (self-update)", env!("CARGO_PKG_VERSION")),
            work_dir: None,
        }
    }
}

impl UpdaterConfig {
    pub fn work_root(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
