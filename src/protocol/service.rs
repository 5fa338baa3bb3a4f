//! Server end of the RPC transport.
//!
//! Calls are not routed by the transport: [`GenericService`] hands every
//! incoming call, whatever its method, to whoever asked for one with
//! [`GenericService::request_call`]. Each phase of a call (accept, body read,
//! reply write, finish) completes by posting one [`ServerEvent`] on the
//! completion queue supplied for that phase.
use std::{
    collections::VecDeque,
    fmt,
    io::{self, IoSlice},
    net::{SocketAddr, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc},
    thread::{self, JoinHandle},
};

use log::{debug, trace, warn};

use super::{
    CompletionQueue,
    transport::{FrameHeader, ProtocolTransport, Status, StatusCode, TransportError},
};

pub type ServerQueue = CompletionQueue<ServerEvent>;

/// Successful outcome of one call phase.
pub enum ServerOp {
    Accepted(ServerStream),
    Read(Vec<u8>),
    Written,
    Finished,
}

impl fmt::Debug for ServerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerOp::Accepted(stream) => write!(f, "Accepted({})", stream.method),
            ServerOp::Read(body) => write!(f, "Read({} bytes)", body.len()),
            ServerOp::Written => write!(f, "Written"),
            ServerOp::Finished => write!(f, "Finished"),
        }
    }
}

#[derive(Debug)]
pub struct ServerEvent {
    pub tag: usize,
    pub result: Result<ServerOp, Status>,
}

#[derive(Default)]
struct Acceptor {
    shutdown: bool,
    requested: VecDeque<(Arc<ServerQueue>, usize)>,
    incoming: VecDeque<ServerStream>,
}

#[derive(Clone, Default)]
pub struct GenericService {
    acceptor: Arc<Mutex<Acceptor>>,
}

impl GenericService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks for the next incoming call. It is delivered as
    /// `ServerOp::Accepted` on `queue` under `tag`, or as a failure once the
    /// service shuts down.
    pub fn request_call(&self, queue: &Arc<ServerQueue>, tag: usize) {
        let mut acceptor = self.acceptor();
        if acceptor.shutdown {
            queue.post(ServerEvent {
                tag,
                result: Err(shutting_down()),
            });
        } else if let Some(stream) = acceptor.incoming.pop_front() {
            queue.post(ServerEvent {
                tag,
                result: Ok(ServerOp::Accepted(stream)),
            });
        } else {
            acceptor.requested.push_back((Arc::clone(queue), tag));
        }
    }

    /// Hands a freshly read call to the oldest outstanding request, or parks
    /// it until one arrives.
    pub(crate) fn deliver(&self, stream: ServerStream) {
        let mut acceptor = self.acceptor();
        if acceptor.shutdown {
            debug!("dropping call {} received during shutdown", stream.id);
            return;
        }

        match acceptor.requested.pop_front() {
            Some((queue, tag)) => {
                queue.post(ServerEvent {
                    tag,
                    result: Ok(ServerOp::Accepted(stream)),
                });
            }
            None => acceptor.incoming.push_back(stream),
        }
    }

    /// Fails every outstanding request and refuses new calls.
    pub fn shutdown(&self) {
        let mut acceptor = self.acceptor();
        acceptor.shutdown = true;
        acceptor.incoming.clear();
        for (queue, tag) in acceptor.requested.drain(..) {
            queue.post(ServerEvent {
                tag,
                result: Err(shutting_down()),
            });
        }
    }

    fn acceptor(&self) -> MutexGuard<'_, Acceptor> {
        self.acceptor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn shutting_down() -> Status {
    Status::new(StatusCode::Cancelled, "server is shutting down")
}

/// A reply frame queued for a connection's writer thread.
enum Outgoing {
    Message(Vec<u8>),
    Status(Status),
}

struct Outbound {
    id: u64,
    frame: Outgoing,
    queue: Arc<ServerQueue>,
    tag: usize,
}

/// Writing half of one client connection, shared by all its calls.
///
/// Frames are written by a dedicated thread, so a peer that stops reading
/// only stalls its own calls.
pub(crate) struct ServerConnection {
    outgoing: mpsc::Sender<Outbound>,
    peer: SocketAddr,
}

impl ServerConnection {
    /// Starts the writer thread for `stream`. The thread exits once every
    /// handle to the connection has been dropped.
    pub(crate) fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<(Arc<Self>, JoinHandle<()>)> {
        let (outgoing, frames) = mpsc::channel();
        let writer = thread::Builder::new()
            .name(format!("blockwire-writer-{peer}"))
            .spawn(move || write_replies(ProtocolTransport::new(stream), frames, peer))?;

        Ok((Arc::new(Self { outgoing, peer }), writer))
    }

    fn send(&self, outbound: Outbound) {
        if let Err(mpsc::SendError(outbound)) = self.outgoing.send(outbound) {
            outbound.queue.post(ServerEvent {
                tag: outbound.tag,
                result: Err(Status::new(StatusCode::Unavailable, "connection closed")),
            });
        }
    }
}

fn write_replies(
    mut transport: ProtocolTransport<TcpStream>,
    frames: mpsc::Receiver<Outbound>,
    peer: SocketAddr,
) {
    for Outbound {
        id,
        frame,
        queue,
        tag,
    } in frames
    {
        let (written, op) = match frame {
            Outgoing::Message(body) => (
                transport.write_message(id, &[IoSlice::new(&body)]),
                ServerOp::Written,
            ),
            Outgoing::Status(status) => (transport.write_status(id, status), ServerOp::Finished),
        };

        let result = written.map(|()| op).map_err(|e| {
            debug!("call {id} to {peer}: write failed: {e}");
            Status::new(StatusCode::Unavailable, e.to_string())
        });
        queue.post(ServerEvent { tag, result });
    }
    debug!("writer for {peer} stopped");
}

/// One accepted call.
pub struct ServerStream {
    id: u64,
    method: String,
    body: Option<Vec<u8>>,
    connection: Arc<ServerConnection>,
}

impl ServerStream {
    pub(crate) fn new(
        id: u64,
        method: String,
        body: Vec<u8>,
        connection: Arc<ServerConnection>,
    ) -> Self {
        Self {
            id,
            method,
            body: Some(body),
            connection,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn peer(&self) -> SocketAddr {
        self.connection.peer
    }

    /// Reads the request body; completes with `ServerOp::Read`.
    pub fn read(&mut self, queue: &ServerQueue, tag: usize) {
        let result = match self.body.take() {
            Some(body) => Ok(ServerOp::Read(body)),
            None => Err(Status::new(StatusCode::Internal, "request body already read")),
        };
        queue.post(ServerEvent { tag, result });
    }

    /// Writes the reply body; completes with `ServerOp::Written` once the
    /// frame has been handed to the socket.
    pub fn write(&self, body: Vec<u8>, queue: &Arc<ServerQueue>, tag: usize) {
        trace!("call {}: writing {} bytes", self.id, body.len());
        self.connection.send(Outbound {
            id: self.id,
            frame: Outgoing::Message(body),
            queue: Arc::clone(queue),
            tag,
        });
    }

    /// Closes the call with `status`; completes with `ServerOp::Finished`.
    pub fn finish(&self, status: Status, queue: &Arc<ServerQueue>, tag: usize) {
        trace!("call {}: finishing with {status}", self.id);
        self.connection.send(Outbound {
            id: self.id,
            frame: Outgoing::Status(status),
            queue: Arc::clone(queue),
            tag,
        });
    }
}

/// Reads calls off one connection until it closes, delivering each to
/// `service`. Replies go out through `connection`.
pub(crate) fn serve_connection(
    stream: TcpStream,
    connection: Arc<ServerConnection>,
    service: &GenericService,
) -> Result<(), TransportError> {
    let peer = connection.peer;
    let mut reader = ProtocolTransport::new(stream);

    loop {
        let frame = reader.read_frame()?;
        match frame.header {
            FrameHeader::Call { id, method, .. } => {
                trace!("call {id} from {peer}: {method}");
                service.deliver(ServerStream::new(
                    id,
                    method,
                    frame.body,
                    Arc::clone(&connection),
                ));
            }
            other => {
                warn!("unexpected {other:?} from {peer}, closing connection");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn connection() -> (Arc<ServerConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let (connection, _writer) = ServerConnection::spawn(server, peer).unwrap();
        (connection, client)
    }

    fn stream(id: u64, connection: &Arc<ServerConnection>) -> ServerStream {
        ServerStream::new(id, "/test/Call".into(), vec![1, 2, 3], Arc::clone(connection))
    }

    #[test]
    fn parked_call_is_handed_to_next_request() {
        let (connection, _client) = connection();
        let service = GenericService::new();
        let queue = Arc::new(ServerQueue::new());

        service.deliver(stream(1, &connection));
        service.request_call(&queue, 9);

        let event = queue.next().unwrap();
        assert_eq!(event.tag, 9);
        assert!(matches!(event.result, Ok(ServerOp::Accepted(ref s)) if s.method() == "/test/Call"));
    }

    #[test]
    fn requests_are_served_in_order() {
        let (connection, _client) = connection();
        let service = GenericService::new();
        let first = Arc::new(ServerQueue::new());
        let second = Arc::new(ServerQueue::new());

        service.request_call(&first, 1);
        service.request_call(&second, 2);
        service.deliver(stream(10, &connection));

        assert_eq!(first.next().unwrap().tag, 1);
        second.shutdown();
        assert!(second.next().is_none());
    }

    #[test]
    fn shutdown_fails_outstanding_requests() {
        let service = GenericService::new();
        let queue = Arc::new(ServerQueue::new());

        service.request_call(&queue, 4);
        service.shutdown();
        service.request_call(&queue, 5);

        for tag in [4, 5] {
            let event = queue.next().unwrap();
            assert_eq!(event.tag, tag);
            assert_eq!(event.result.unwrap_err().code, StatusCode::Cancelled);
        }
    }

    #[test]
    fn body_can_only_be_read_once() {
        let (connection, _client) = connection();
        let queue = ServerQueue::new();
        let mut stream = stream(1, &connection);

        stream.read(&queue, 0);
        stream.read(&queue, 0);

        assert!(matches!(queue.next().unwrap().result, Ok(ServerOp::Read(ref body)) if body == &[1, 2, 3]));
        assert_eq!(queue.next().unwrap().result.unwrap_err().code, StatusCode::Internal);
    }

    #[test]
    fn reply_frames_reach_the_client() {
        let (connection, client) = connection();
        let queue = Arc::new(ServerQueue::new());
        let stream = stream(77, &connection);

        stream.write(b"reply".to_vec(), &queue, 0);
        stream.finish(Status::ok(), &queue, 0);
        assert!(matches!(queue.next().unwrap().result, Ok(ServerOp::Written)));
        assert!(matches!(queue.next().unwrap().result, Ok(ServerOp::Finished)));

        let mut client = ProtocolTransport::new(client);
        let message = client.read_frame().unwrap();
        assert_eq!(message.header, FrameHeader::Message { id: 77, len: 5 });
        assert_eq!(message.body, b"reply");
        let status = client.read_frame().unwrap();
        assert_eq!(
            status.header,
            FrameHeader::Status {
                id: 77,
                status: Status::ok()
            }
        );
    }

    #[test]
    fn stalled_peer_does_not_hold_up_other_connections() {
        let (stalled, _stalled_client) = connection();
        let (healthy, healthy_client) = connection();
        let queue = Arc::new(ServerQueue::new());

        // Far more than the socket buffers hold; the peer never reads.
        for id in 0..4 {
            stream(id, &stalled).write(vec![0xCD; 4 << 20], &queue, 0);
        }
        stream(9, &healthy).write(b"ok".to_vec(), &queue, 1);

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            while let Some(event) = queue.next() {
                if event.tag == 1 {
                    let _ = tx.send(event.result.is_ok());
                    return;
                }
            }
        });
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap());

        let mut client = ProtocolTransport::new(healthy_client);
        assert_eq!(client.read_frame().unwrap().body, b"ok");
    }

    #[test]
    fn write_fails_once_writer_is_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let (outgoing, frames) = mpsc::channel();
        drop(frames);
        drop(server);
        let connection = Arc::new(ServerConnection { outgoing, peer });
        let queue = Arc::new(ServerQueue::new());

        stream(3, &connection).finish(Status::ok(), &queue, 6);
        let event = queue.next().unwrap();
        assert_eq!(event.tag, 6);
        assert_eq!(event.result.unwrap_err().code, StatusCode::Unavailable);
    }
}
