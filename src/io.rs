//! I/O requests and their completions.
//!
//! An [`IoRequest`] owns its scatter/gather segments. Submitting it moves
//! ownership into a target; the segments come back to the caller inside the
//! [`Completion`] handed to the completion callback, filled with data for
//! reads and untouched for writes.
use std::sync::Arc;

use thiserror::Error;

use crate::{
    protocol::{CodecError, Status},
    storage::StorageError,
};

/// Opaque caller handle returned unchanged with the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug)]
pub struct IoRequest {
    pub offset: u64,
    pub direction: Direction,
    pub segments: Vec<Vec<u8>>,
    pub token: Token,
}

impl IoRequest {
    /// A read filling freshly zeroed segments of the given lengths.
    pub fn read(offset: u64, lens: &[usize], token: Token) -> Self {
        let segments = lens.iter().map(|len| vec![0; *len]).collect();
        Self::read_into(offset, segments, token)
    }

    /// A read filling caller supplied segments.
    pub fn read_into(offset: u64, segments: Vec<Vec<u8>>, token: Token) -> Self {
        Self {
            offset,
            direction: Direction::Read,
            segments,
            token,
        }
    }

    pub fn write(offset: u64, segments: Vec<Vec<u8>>, token: Token) -> Self {
        Self {
            offset,
            direction: Direction::Write,
            segments,
            token,
        }
    }

    /// Total byte count across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("transport failure: {0}")]
    Transport(Status),
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{found:?} request submitted as a {expected:?}")]
    Direction {
        expected: Direction,
        found: Direction,
    },
    #[error("request does not match the volume geometry: {0}")]
    Geometry(String),
    #[error("unsupported I/O type {0}")]
    Unsupported(String),
}

/// Result of one request, delivered exactly once.
#[derive(Debug)]
pub struct Completion {
    pub token: Token,
    pub segments: Vec<Vec<u8>>,
    pub result: Result<(), IoError>,
}

impl Completion {
    pub fn new(request: IoRequest, result: Result<(), IoError>) -> Self {
        Self {
            token: request.token,
            segments: request.segments,
            result,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Completion callback shared by every request of one target.
pub type CompletionFn = Arc<dyn Fn(Completion) + Send + Sync>;
