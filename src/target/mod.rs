//! Storage targets.
//!
//! A [`Target`] executes byte-addressed [`IoRequest`]s against either an
//! in-process buffer ([`LocalTarget`]) or a storage server reached over RPC
//! ([`RemoteTarget`]). Every request submitted is reported exactly once
//! through the completion callback given at creation, successful or not.
mod local;
mod remote;

use std::io;

use log::{debug, info};
use thiserror::Error;

use crate::{
    config::{ConfigError, TargetMode, VolumeConfig},
    io::{Completion, CompletionFn, Direction, IoError, IoRequest},
    storage::{StorageError, check_range},
};

pub use local::LocalTarget;
pub use remote::RemoteTarget;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to allocate target: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to start target workers: {0}")]
    Spawn(#[from] io::Error),
}

enum Backend {
    Local(LocalTarget),
    Remote(RemoteTarget),
}

pub struct Target {
    capacity: u64,
    on_complete: CompletionFn,
    backend: Backend,
}

impl Target {
    pub fn create(config: &VolumeConfig, on_complete: CompletionFn) -> Result<Self, TargetError> {
        config.validate()?;
        let capacity = config.capacity()?;

        let backend = match config.mode {
            TargetMode::Local => {
                Backend::Local(LocalTarget::new(capacity, on_complete.clone())?)
            }
            TargetMode::Remote => {
                Backend::Remote(RemoteTarget::new(&config.remote, on_complete.clone())?)
            }
        };
        info!("created {:?} target of {capacity} bytes", config.mode);

        Ok(Self {
            capacity,
            on_complete,
            backend,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Routes `request` on its direction.
    pub fn submit(&self, request: IoRequest) {
        match request.direction {
            Direction::Read => self.read(request),
            Direction::Write => self.write(request),
        }
    }

    pub fn read(&self, request: IoRequest) {
        if let Some(request) = self.admit(request, Direction::Read) {
            match &self.backend {
                Backend::Local(local) => local.read(request),
                Backend::Remote(remote) => remote.submit(request),
            }
        }
    }

    pub fn write(&self, request: IoRequest) {
        if let Some(request) = self.admit(request, Direction::Write) {
            match &self.backend {
                Backend::Local(local) => local.write(request),
                Backend::Remote(remote) => remote.submit(request),
            }
        }
    }

    /// Completes `request` with a failure unless it is a `direction` request
    /// that fits the volume.
    fn admit(&self, request: IoRequest, direction: Direction) -> Option<IoRequest> {
        let result = if request.direction != direction {
            Err(IoError::Direction {
                expected: direction,
                found: request.direction,
            })
        } else {
            check_range(request.offset, request.len() as u64, self.capacity)
                .map(|_| ())
                .map_err(IoError::from)
        };

        match result {
            Ok(()) => Some(request),
            Err(e) => {
                debug!("rejecting request {:?}: {e}", request.token);
                (self.on_complete)(Completion::new(request, Err(e)));
                None
            }
        }
    }
}
