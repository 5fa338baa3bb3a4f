//! Block-addressed volume over a [`Target`].
//!
//! A [`Volume`] speaks in blocks: requests name a starting block and a block
//! count, which are scaled by the block size into the byte range handed to the
//! target.
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, info};

use crate::{
    config::VolumeConfig,
    io::{Completion, CompletionFn, Direction, IoError, IoRequest, Token},
    target::{Target, TargetError},
};

static VOLUME_COUNT: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Flush,
    Unmap,
    WriteZeroes,
    Reset,
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoKind::Read => "read",
            IoKind::Write => "write",
            IoKind::Flush => "flush",
            IoKind::Unmap => "unmap",
            IoKind::WriteZeroes => "write-zeroes",
            IoKind::Reset => "reset",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct BlockIo {
    pub kind: IoKind,
    pub offset_blocks: u64,
    pub num_blocks: u64,
    /// Data for writes, destination buffers for reads. A read without
    /// segments gets one buffer sized to the request.
    pub segments: Vec<Vec<u8>>,
    pub token: Token,
}

impl BlockIo {
    pub fn new(kind: IoKind, offset_blocks: u64, num_blocks: u64, token: Token) -> Self {
        Self {
            kind,
            offset_blocks,
            num_blocks,
            segments: Vec::new(),
            token,
        }
    }

    pub fn with_segments(mut self, segments: Vec<Vec<u8>>) -> Self {
        self.segments = segments;
        self
    }
}

pub struct Volume {
    name: String,
    block_size: u32,
    num_blocks: u64,
    target: Target,
    on_complete: CompletionFn,
}

impl Volume {
    pub fn create(config: &VolumeConfig, on_complete: CompletionFn) -> Result<Self, TargetError> {
        let target = Target::create(config, on_complete.clone())?;
        let name = match &config.name {
            Some(name) => name.clone(),
            None => format!("hs-{}", VOLUME_COUNT.fetch_add(1, Ordering::Relaxed)),
        };
        info!(
            "volume {name}: {} blocks of {} bytes",
            config.num_blocks, config.block_size
        );

        Ok(Self {
            name,
            block_size: config.block_size,
            num_blocks: config.num_blocks,
            target,
            on_complete,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn io_type_supported(&self, kind: IoKind) -> bool {
        !matches!(kind, IoKind::Reset)
    }

    pub fn submit(&self, io: BlockIo) {
        let direction = match io.kind {
            IoKind::Read => Direction::Read,
            IoKind::Write => Direction::Write,
            // Nothing is cached and nothing is reclaimed, so these only
            // need acknowledging.
            IoKind::Flush | IoKind::Unmap | IoKind::WriteZeroes => {
                self.complete(io, Ok(()));
                return;
            }
            IoKind::Reset => {
                let kind = io.kind.to_string();
                self.complete(io, Err(IoError::Unsupported(kind)));
                return;
            }
        };

        let Some((offset, len)) = self.byte_range(&io) else {
            let message = format!(
                "blocks [{}, +{}) overflow the byte range",
                io.offset_blocks, io.num_blocks
            );
            self.complete(io, Err(IoError::Geometry(message)));
            return;
        };

        let mut segments = io.segments;
        if direction == Direction::Read && segments.is_empty() && len > 0 {
            segments.push(vec![0; len]);
        }

        let request = IoRequest {
            offset,
            direction,
            segments,
            token: io.token,
        };
        if request.len() != len {
            let message = format!(
                "{} bytes of segments for {} blocks of {}",
                request.len(),
                io.num_blocks,
                self.block_size
            );
            (self.on_complete)(Completion::new(request, Err(IoError::Geometry(message))));
            return;
        }

        self.target.submit(request);
    }

    fn byte_range(&self, io: &BlockIo) -> Option<(u64, usize)> {
        let block_size = u64::from(self.block_size);
        let offset = io.offset_blocks.checked_mul(block_size)?;
        let len = io.num_blocks.checked_mul(block_size)?;
        Some((offset, usize::try_from(len).ok()?))
    }

    fn complete(&self, io: BlockIo, result: Result<(), IoError>) {
        debug!("{} {} of {} blocks: {result:?}", self.name, io.kind, io.num_blocks);
        (self.on_complete)(Completion {
            token: io.token,
            segments: io.segments,
            result,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, mpsc};

    use super::*;
    use crate::storage::StorageError;

    fn volume(name: Option<&str>, num_blocks: u64) -> (Volume, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel();
        let config = VolumeConfig {
            name: name.map(str::to_string),
            num_blocks,
            ..VolumeConfig::default()
        };
        let volume = Volume::create(
            &config,
            Arc::new(move |completion: Completion| tx.send(completion).unwrap()),
        )
        .unwrap();
        (volume, rx)
    }

    #[test]
    fn default_name_is_numbered() {
        let (first, _) = volume(None, 1);
        let (second, _) = volume(None, 1);
        let (named, _) = volume(Some("data"), 1);

        assert!(first.name().starts_with("hs-"));
        assert!(second.name().starts_with("hs-"));
        assert_ne!(first.name(), second.name());
        assert_eq!(named.name(), "data");
        assert_eq!(named.block_size(), 512);
        assert_eq!(named.num_blocks(), 1);
    }

    #[test]
    fn blocks_scale_to_bytes() {
        let (volume, rx) = volume(None, 16);

        volume.submit(
            BlockIo::new(IoKind::Write, 2, 2, Token(1)).with_segments(vec![vec![0x5A; 1024]]),
        );
        assert!(rx.recv().unwrap().is_ok());

        volume.submit(BlockIo::new(IoKind::Read, 3, 1, Token(2)));
        let read = rx.recv().unwrap();
        assert_eq!(read.token, Token(2));
        assert_eq!(read.segments, vec![vec![0x5A; 512]]);

        volume.submit(BlockIo::new(IoKind::Read, 4, 1, Token(3)));
        assert_eq!(rx.recv().unwrap().segments, vec![vec![0; 512]]);
    }

    #[test]
    fn flush_unmap_and_write_zeroes_complete_immediately() {
        let (volume, rx) = volume(None, 4);

        for (token, kind) in [IoKind::Flush, IoKind::Unmap, IoKind::WriteZeroes]
            .into_iter()
            .enumerate()
        {
            assert!(volume.io_type_supported(kind));
            volume.submit(BlockIo::new(kind, 0, 4, Token(token as u64)));
            let completion = rx.recv().unwrap();
            assert_eq!(completion.token, Token(token as u64));
            assert!(completion.is_ok());
        }
    }

    #[test]
    fn reset_is_unsupported() {
        let (volume, rx) = volume(None, 4);

        assert!(!volume.io_type_supported(IoKind::Reset));
        volume.submit(BlockIo::new(IoKind::Reset, 0, 0, Token(1)));
        assert!(matches!(
            rx.recv().unwrap().result,
            Err(IoError::Unsupported(kind)) if kind == "reset"
        ));
    }

    #[test]
    fn segment_length_must_match_block_count() {
        let (volume, rx) = volume(None, 4);

        volume.submit(BlockIo::new(IoKind::Write, 0, 2, Token(1)).with_segments(vec![vec![1; 512]]));
        let completion = rx.recv().unwrap();
        assert!(matches!(completion.result, Err(IoError::Geometry(_))));
        assert_eq!(completion.segments, vec![vec![1; 512]]);
    }

    #[test]
    fn request_past_the_end_fails() {
        let (volume, rx) = volume(None, 4);

        volume.submit(BlockIo::new(IoKind::Read, 3, 2, Token(1)));
        assert!(matches!(
            rx.recv().unwrap().result,
            Err(IoError::Storage(StorageError::OutOfBounds { .. }))
        ));

        volume.submit(BlockIo::new(IoKind::Read, u64::MAX, 1, Token(2)));
        assert!(matches!(rx.recv().unwrap().result, Err(IoError::Geometry(_))));
    }
}
