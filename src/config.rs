//! Volume and server configuration.
use std::net::SocketAddr;

use thiserror::Error;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:50051";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:50051";
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown target mode {0}")]
    UnknownMode(u32),
    #[error("block size must be a non-zero power of two, got {0}")]
    BlockSize(u32),
    #[error("volume of {num_blocks} blocks of {block_size} bytes is too large")]
    Capacity { block_size: u32, num_blocks: u64 },
    #[error("at least one worker is required")]
    NoWorkers,
    #[error("invalid address '{0}'")]
    Address(String),
}

/// Where a volume's data lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TargetMode {
    #[default]
    Local,
    Remote,
}

impl TryFrom<u32> for TargetMode {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TargetMode::Local),
            1 => Ok(TargetMode::Remote),
            other => Err(ConfigError::UnknownMode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// `host:port` of the storage server.
    pub address: String,
    /// Completion queues, each drained by one worker thread.
    pub workers: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            workers: DEFAULT_WORKERS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    pub name: Option<String>,
    pub block_size: u32,
    pub num_blocks: u64,
    pub mode: TargetMode,
    pub remote: RemoteConfig,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            name: None,
            block_size: DEFAULT_BLOCK_SIZE,
            num_blocks: 0,
            mode: TargetMode::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl VolumeConfig {
    /// Size of the volume in bytes.
    pub fn capacity(&self) -> Result<u64, ConfigError> {
        u64::from(self.block_size)
            .checked_mul(self.num_blocks)
            .filter(|capacity| usize::try_from(*capacity).is_ok())
            .ok_or(ConfigError::Capacity {
                block_size: self.block_size,
                num_blocks: self.num_blocks,
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.block_size.is_power_of_two() {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        self.capacity()?;
        if self.mode == TargetMode::Remote && self.remote.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: SocketAddr,
    /// Backing store size in bytes.
    pub store_size: usize,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 50051)),
            store_size: 64 << 20,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl ServerConfig {
    /// A config listening on `address`, as given on a command line.
    pub fn with_address(address: &str) -> Result<Self, ConfigError> {
        let address = address
            .parse()
            .map_err(|_| ConfigError::Address(address.to_string()))?;
        Ok(Self {
            address,
            ..Self::default()
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }
}
