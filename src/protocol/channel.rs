//! Client end of the RPC transport.
//!
//! A [`Channel`] multiplexes unary calls over one TCP connection. Starting a
//! call registers it under a fresh call id and writes the `Call` frame; a
//! reader thread matches `Message`/`Status` frames back to the call and posts
//! one [`ClientEvent`] on the completion queue named at start.
//!
//! The connection is opened on the first call and reopened on the next call
//! after it drops. When a connection is lost every call still registered on it
//! completes with `Unavailable`.
use std::{
    collections::HashMap,
    io::{self, IoSlice},
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, info, trace, warn};

use super::{
    CompletionQueue,
    transport::{FrameHeader, ProtocolTransport, Status, StatusCode, TransportError},
};

/// Completion of one call started with [`Channel::start_call`].
#[derive(Debug)]
pub struct ClientEvent {
    pub tag: usize,
    pub result: Result<Vec<u8>, Status>,
}

struct CallSlot {
    queue: Arc<CompletionQueue<ClientEvent>>,
    tag: usize,
    generation: u64,
    body: Option<Vec<u8>>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    /// Generation of the connection currently accepting calls.
    live: Option<u64>,
    calls: HashMap<u64, CallSlot>,
}

struct Connection {
    transport: ProtocolTransport<TcpStream>,
    generation: u64,
}

pub struct Channel {
    address: String,
    connection: Mutex<Option<Connection>>,
    registry: Arc<Mutex<Registry>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    generations: AtomicU64,
}

impl Channel {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connection: Mutex::new(None),
            registry: Arc::new(Mutex::new(Registry::default())),
            readers: Mutex::new(Vec::new()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Starts a unary call. On `Ok` exactly one event tagged `tag` will be
    /// posted to `queue`; on `Err` the call was never started and nothing
    /// will be posted.
    pub fn start_call(
        &self,
        method: &str,
        body: &[IoSlice<'_>],
        queue: &Arc<CompletionQueue<ClientEvent>>,
        tag: usize,
    ) -> Result<(), Status> {
        let mut slot = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let live = self.registry().live;
        if slot.as_ref().is_none_or(|c| Some(c.generation) != live) {
            if let Some(stale) = slot.take() {
                let _ = stale.transport.get_ref().shutdown(Shutdown::Both);
            }
            *slot = Some(self.connect()?);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(Status::new(StatusCode::Unavailable, "no connection"));
        };

        let id = {
            let mut registry = self.registry();
            if registry.live != Some(connection.generation) {
                return Err(Status::new(StatusCode::Unavailable, "connection closed"));
            }
            let id = registry.next_id;
            registry.next_id += 1;
            registry.calls.insert(
                id,
                CallSlot {
                    queue: Arc::clone(queue),
                    tag,
                    generation: connection.generation,
                    body: None,
                },
            );
            id
        };
        trace!("call {id}: {method}");

        let status = match connection.transport.write_call(id, method, body) {
            Ok(()) => return Ok(()),
            Err(TransportError::BodyTooLarge(len)) => Status::new(
                StatusCode::InvalidArgument,
                format!("request body of {len} bytes is too large"),
            ),
            Err(e) => {
                warn!("failed to send call {id} to {}: {e}", self.address);
                let _ = connection.transport.get_ref().shutdown(Shutdown::Both);
                *slot = None;
                Status::new(StatusCode::Unavailable, e.to_string())
            }
        };

        // The reader may already have failed the call after the shutdown.
        match self.registry().calls.remove(&id) {
            Some(_) => Err(status),
            None => Ok(()),
        }
    }

    fn connect(&self) -> Result<Connection, Status> {
        let unavailable = |e: io::Error| {
            warn!("failed to connect to {}: {e}", self.address);
            Status::new(
                StatusCode::Unavailable,
                format!("failed to connect to {}: {e}", self.address),
            )
        };

        let stream = TcpStream::connect(self.address.as_str()).map_err(unavailable)?;
        stream.set_nodelay(true).map_err(unavailable)?;
        let reader = ProtocolTransport::new(stream.try_clone().map_err(unavailable)?);

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        self.registry().live = Some(generation);

        let registry = Arc::clone(&self.registry);
        let handle = thread::Builder::new()
            .name(format!("blockwire-channel-{generation}"))
            .spawn(move || read_replies(reader, registry, generation))
            .map_err(unavailable)?;

        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        readers.retain(|reader| !reader.is_finished());
        readers.push(handle);

        info!("connected to {}", self.address);
        Ok(Connection {
            transport: ProtocolTransport::new(stream),
            generation,
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let connection = self
            .connection
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            let _ = connection.transport.get_ref().shutdown(Shutdown::Both);
        }

        let readers = self.readers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for reader in readers.drain(..) {
            if reader.join().is_err() {
                error!("channel reader for {} panicked", self.address);
            }
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_replies(
    mut transport: ProtocolTransport<TcpStream>,
    registry: Arc<Mutex<Registry>>,
    generation: u64,
) {
    loop {
        let frame = match transport.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("connection {generation} closed: {e}");
                break;
            }
        };

        match frame.header {
            FrameHeader::Message { id, .. } => {
                if let Some(slot) = lock(&registry).calls.get_mut(&id) {
                    slot.body = Some(frame.body);
                }
            }
            FrameHeader::Status { id, status } => {
                let Some(slot) = lock(&registry).calls.remove(&id) else {
                    warn!("status for unknown call {id}");
                    continue;
                };
                trace!("call {id} finished: {status}");
                let result = if status.is_ok() {
                    Ok(slot.body.unwrap_or_default())
                } else {
                    Err(status)
                };
                slot.queue.post(ClientEvent {
                    tag: slot.tag,
                    result,
                });
            }
            FrameHeader::Call { id, .. } => {
                warn!("peer sent a call frame ({id}) to a client, closing connection {generation}");
                break;
            }
        }
    }

    let failed: Vec<CallSlot> = {
        let mut registry = lock(&registry);
        if registry.live == Some(generation) {
            registry.live = None;
        }
        let ids: Vec<u64> = registry
            .calls
            .iter()
            .filter(|(_, slot)| slot.generation == generation)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| registry.calls.remove(&id))
            .collect()
    };

    if !failed.is_empty() {
        warn!(
            "connection {generation} lost with {} calls in flight",
            failed.len()
        );
    }
    for slot in failed {
        slot.queue.post(ClientEvent {
            tag: slot.tag,
            result: Err(Status::new(StatusCode::Unavailable, "connection closed")),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    /// Answers every call with its own body, or closes after `limit` calls.
    fn echo_server(limit: usize) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(stream);
            for _ in 0..limit {
                let frame = transport.read_frame().unwrap();
                let FrameHeader::Call { id, .. } = frame.header else {
                    panic!("expected a call frame");
                };
                transport
                    .write_message(id, &[IoSlice::new(&frame.body)])
                    .unwrap();
                transport.write_status(id, Status::ok()).unwrap();
            }
        });
        (address, handle)
    }

    #[test]
    fn call_completes_on_queue() {
        let (address, server) = echo_server(2);
        let channel = Channel::new(address);
        let queue = Arc::new(CompletionQueue::new());

        channel
            .start_call("/test/Echo", &[IoSlice::new(b"hello")], &queue, 11)
            .unwrap();
        channel
            .start_call("/test/Echo", &[IoSlice::new(b"world")], &queue, 12)
            .unwrap();

        let first = queue.next().unwrap();
        assert_eq!(first.tag, 11);
        assert_eq!(first.result.unwrap(), b"hello");
        let second = queue.next().unwrap();
        assert_eq!(second.tag, 12);
        assert_eq!(second.result.unwrap(), b"world");

        server.join().unwrap();
    }

    #[test]
    fn unreachable_server_fails_start() {
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let channel = Channel::new(address);
        let queue = Arc::new(CompletionQueue::new());

        let status = channel
            .start_call("/test/Echo", &[], &queue, 0)
            .unwrap_err();
        assert_eq!(status.code, StatusCode::Unavailable);
    }

    #[test]
    fn lost_connection_fails_in_flight_calls() {
        let (address, server) = echo_server(0);
        let channel = Channel::new(address);
        let queue = Arc::new(CompletionQueue::new());

        // The server may already be gone when the call is written, in which
        // case the failure is reported by start_call instead of the queue.
        let started = channel.start_call("/test/Echo", &[IoSlice::new(b"lost")], &queue, 5);
        server.join().unwrap();

        match started {
            Ok(()) => {
                let event = queue.next().unwrap();
                assert_eq!(event.tag, 5);
                assert_eq!(event.result.unwrap_err().code, StatusCode::Unavailable);
            }
            Err(status) => assert_eq!(status.code, StatusCode::Unavailable),
        }
    }
}
