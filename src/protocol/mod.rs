//! Client-server communication protocol.
//!
//! This module carries block I/O between a remote target and a storage server.
//! It has three layers:
//!
//! - [`codec`]: the scatter/gather message format. A message is a fixed 24-byte
//!   header followed by length-prefixed segments, and is encoded without copying
//!   segment bytes into a contiguous buffer.
//! - [`ProtocolTransport`]: framing of unary calls over a byte stream. A call is
//!   a `Call` frame carrying the method name and request body, answered by an
//!   optional `Message` frame with the reply body and a final `Status` frame.
//! - Call dispatch: [`Channel`] on the client and [`GenericService`] on the
//!   server. Both report progress through a [`CompletionQueue`], one event per
//!   finished operation, so callers drive calls from their own worker threads.
//!
//! # Binary Format
//!
//! Frame headers are bincode encoded (big-endian, fixed-width integers) and
//! followed by the raw body bytes. Codec messages inside the body are
//! little-endian.
//!
//! # See Also
//!
//! - [`target`](crate::target): Issues calls through a [`Channel`].
//! - [`storage`](crate::storage): Backing store the [`StorageServer`] serves from.
mod channel;
pub mod codec;
mod queue;
mod server;
mod service;
mod thread;
mod transport;

pub use channel::{Channel, ClientEvent};
pub use codec::{CodecError, MessageKind};
pub use queue::CompletionQueue;
pub use server::{ServerError, StorageServer};
pub use service::{GenericService, ServerEvent, ServerOp, ServerQueue, ServerStream};
pub use thread::WorkerPool;
pub use transport::{Frame, FrameHeader, ProtocolTransport, Status, StatusCode, TransportError};

/// Method name of volume reads.
pub const READ_METHOD: &str = "/blockwire.Volume/Read";
/// Method name of volume writes.
pub const WRITE_METHOD: &str = "/blockwire.Volume/Write";
