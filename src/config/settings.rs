use crate::{FileshareError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub network: NetworkSettings,
    pub transfer: TransferSettings,
    pub receiver: ReceiverSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub port: u16,
    pub address: String,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Number of byte ranges (and connections) each file is split into.
    pub part_count: u32,
    pub max_parallel_parts: usize,
    pub read_buffer_size: usize,
    /// Capacity of the receiver's in-memory write buffer per part.
    pub file_buffer_size: usize,
    /// Buffered bytes above which the receiver flushes to disk early.
    pub flush_threshold: usize,
    pub flush_interval_ms: u64,
    pub throughput_interval_secs: u64,
    /// Upper bound for a single length-prefixed frame.
    pub max_frame_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverSettings {
    pub download_dir: PathBuf,
    pub stale_transfer_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: NetworkSettings {
                port: 6969,
                address: "localhost".to_string(),
                connect_timeout_secs: 10,
                io_timeout_secs: 30,
            },
            transfer: TransferSettings {
                part_count: 4,
                max_parallel_parts: 4,
                read_buffer_size: MIB,
                file_buffer_size: 8 * MIB,
                flush_threshold: 4 * MIB,
                flush_interval_ms: 1000,
                throughput_interval_secs: 3,
                max_frame_size: 64 * KIB,
            },
            receiver: ReceiverSettings {
                download_dir: default_download_dir(),
                stale_transfer_secs: 3600,
                cleanup_interval_secs: 300,
            },
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };

        let settings = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| FileshareError::Config(format!("Failed to read config: {}", e)))?;

            toml::from_str::<Settings>(&content)
                .map_err(|e| FileshareError::Config(format!("Failed to parse config: {}", e)))?
        } else {
            let settings = Self::default();
            settings.save(Some(&path))?;
            settings
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                FileshareError::Config(format!("Failed to create config dir: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| FileshareError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&path, content)
            .map_err(|e| FileshareError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let transfer = &self.transfer;
        if transfer.part_count == 0 {
            return Err(FileshareError::Config(
                "part_count must be at least 1".to_string(),
            ));
        }
        if transfer.max_parallel_parts == 0 {
            return Err(FileshareError::Config(
                "max_parallel_parts must be at least 1".to_string(),
            ));
        }
        if transfer.read_buffer_size == 0 || transfer.file_buffer_size == 0 {
            return Err(FileshareError::Config(
                "buffer sizes must be non-zero".to_string(),
            ));
        }
        if transfer.flush_threshold > transfer.file_buffer_size {
            return Err(FileshareError::Config(format!(
                "flush_threshold ({}) exceeds file_buffer_size ({})",
                transfer.flush_threshold, transfer.file_buffer_size
            )));
        }
        if transfer.max_frame_size == 0 {
            return Err(FileshareError::Config(
                "max_frame_size must be non-zero".to_string(),
            ));
        }
        if self.receiver.cleanup_interval_secs == 0 {
            return Err(FileshareError::Config(
                "cleanup_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "fileshare", "parts").ok_or_else(|| {
            FileshareError::Config("Failed to get project directories".to_string())
        })?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.network.port))
    }

    pub fn peer_address(&self) -> String {
        format!("{}:{}", self.network.address, self.network.port)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.network.io_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.transfer.flush_interval_ms)
    }

    pub fn throughput_interval(&self) -> Duration {
        Duration::from_secs(self.transfer.throughput_interval_secs)
    }

    pub fn stale_transfer_age(&self) -> Duration {
        Duration::from_secs(self.receiver.stale_transfer_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.receiver.cleanup_interval_secs)
    }
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}
