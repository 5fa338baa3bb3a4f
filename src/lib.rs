pub mod config;
pub mod io;
pub mod protocol;
pub mod storage;
pub mod target;
pub mod volume;

pub use config::{RemoteConfig, ServerConfig, TargetMode, VolumeConfig};
pub use io::{Completion, CompletionFn, Direction, IoError, IoRequest, Token};
pub use target::{Target, TargetError};
pub use volume::{BlockIo, IoKind, Volume};
