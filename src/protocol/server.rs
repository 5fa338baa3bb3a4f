use std::{
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use slab::Slab;
use thiserror::Error;

use crate::{
    config::{ConfigError, ServerConfig},
    storage::{BackingStore, StorageError},
};

use super::{
    GenericService, MessageKind, READ_METHOD, WRITE_METHOD, codec,
    service::{ServerConnection, ServerEvent, ServerOp, ServerQueue, ServerStream, serve_connection},
    thread::WorkerPool,
    transport::{Status, StatusCode},
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to allocate backing store: {0}")]
    Storage(#[from] StorageError),
    #[error("server IO error: {0}")]
    Io(#[from] io::Error),
}

/// How often the listener checks for shutdown while no client connects.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Serves volume reads and writes from an in-memory backing store.
///
/// Calls are processed by `workers` threads, each draining its own
/// completion queue and owning the state of every call it accepted. Socket
/// I/O happens on per-connection reader and writer threads, never on a
/// worker.
pub struct StorageServer {
    address: SocketAddr,
    store: Arc<BackingStore>,
    service: GenericService,
    queues: Vec<Arc<ServerQueue>>,
    pool: Option<WorkerPool>,
    running: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<ConnectionThreads>>>,
}

struct ConnectionThreads {
    stream: TcpStream,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionThreads {
    fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }
}

impl StorageServer {
    pub fn start(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let store = Arc::new(BackingStore::new(config.store_size)?);
        let listener = TcpListener::bind(config.address)?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;
        info!("listening at {address}");

        let service = GenericService::new();
        let queues: Vec<Arc<ServerQueue>> = (0..config.workers)
            .map(|_| Arc::new(ServerQueue::new()))
            .collect();

        let pool = {
            let queues = queues.clone();
            let service = service.clone();
            let store = Arc::clone(&store);
            WorkerPool::spawn("blockwire-server", config.workers, move |id| {
                handle_calls(id, &queues[id], &service, &store)
            })?
        };

        let running = Arc::new(AtomicBool::new(true));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let running = Arc::clone(&running);
            let service = service.clone();
            let connections = Arc::clone(&connections);
            thread::Builder::new()
                .name("blockwire-listener".into())
                .spawn(move || listen(listener, &running, &service, &connections))?
        };

        Ok(Self {
            address,
            store,
            service,
            queues,
            pool: Some(pool),
            running,
            listener: Some(listener),
            connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn store(&self) -> &BackingStore {
        &self.store
    }

    /// Stops accepting, drops outstanding calls and joins every thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("shutting down server at {}", self.address);

        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                error!("listener thread panicked");
            }
        }

        self.service.shutdown();

        let connections: Vec<_> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let mut writers = Vec::with_capacity(connections.len());
        for connection in connections {
            let _ = connection.stream.shutdown(Shutdown::Both);
            if connection.reader.join().is_err() {
                error!("connection reader panicked");
            }
            writers.push(connection.writer);
        }

        for queue in &self.queues {
            queue.shutdown();
        }
        drop(self.pool.take());

        // Writers exit once the last call holding their connection is gone.
        for writer in writers {
            if writer.join().is_err() {
                error!("connection writer panicked");
            }
        }
    }
}

impl Drop for StorageServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(
    listener: TcpListener,
    running: &AtomicBool,
    service: &GenericService,
    connections: &Mutex<Vec<ConnectionThreads>>,
) {
    while running.load(Ordering::Acquire) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => {
                warn!("broken connection: {e:?}");
                continue;
            }
        };
        if let Err(e) = spawn_connection(stream, service, connections) {
            warn!("failed to start connection: {e}");
        }
    }
    debug!("listener stopped");
}

fn spawn_connection(
    stream: TcpStream,
    service: &GenericService,
    connections: &Mutex<Vec<ConnectionThreads>>,
) -> io::Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let handle_stream = stream.try_clone()?;
    let (connection, writer) = ServerConnection::spawn(stream.try_clone()?, peer)?;
    let service = service.clone();

    let reader = thread::Builder::new()
        .name(format!("blockwire-conn-{peer}"))
        .spawn(move || {
            info!("accepted connection from {peer}");
            match serve_connection(stream, connection, &service) {
                Ok(()) => debug!("connection from {peer} closed"),
                Err(e) => debug!("connection from {peer} closed: {e}"),
            }
        })?;

    let mut connections = connections.lock().unwrap_or_else(PoisonError::into_inner);
    connections.retain(|connection| !connection.is_finished());
    connections.push(ConnectionThreads {
        stream: handle_stream,
        reader,
        writer,
    });
    Ok(())
}

/// Worker loop: drains one queue, advancing one call by one phase per event.
fn handle_calls(id: usize, queue: &Arc<ServerQueue>, service: &GenericService, store: &BackingStore) {
    let ctx = CallContext {
        queue,
        service,
        store,
    };
    let mut calls: Slab<CallData> = Slab::new();
    CallData::spawn(&mut calls, &ctx);

    while let Some(ServerEvent { tag, result }) = queue.next() {
        let Some(call) = calls.get_mut(tag) else {
            warn!("worker {id}: event for unknown call {tag}");
            continue;
        };

        match call.proceed(result, &ctx) {
            Step::Continue => {}
            Step::Accepted => CallData::spawn(&mut calls, &ctx),
            Step::Destroy => {
                calls.remove(tag);
            }
        }
    }

    if !calls.is_empty() {
        debug!("worker {id}: dropping {} unfinished calls", calls.len());
    }
}

struct CallContext<'a> {
    queue: &'a Arc<ServerQueue>,
    service: &'a GenericService,
    store: &'a BackingStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Create,
    Process,
    Reply,
    Finish,
    Destroy,
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    /// A call was accepted; a new call must start listening.
    Accepted,
    Destroy,
}

struct CallData {
    tag: usize,
    phase: Phase,
    stream: Option<ServerStream>,
}

impl CallData {
    /// Adds a call in `Create` and immediately asks the service for work.
    fn spawn(calls: &mut Slab<CallData>, ctx: &CallContext<'_>) {
        let entry = calls.vacant_entry();
        let tag = entry.key();
        entry
            .insert(CallData {
                tag,
                phase: Phase::Create,
                stream: None,
            })
            .create(ctx);
    }

    fn create(&mut self, ctx: &CallContext<'_>) {
        self.phase = Phase::Process;
        ctx.service.request_call(ctx.queue, self.tag);
    }

    fn proceed(&mut self, result: Result<ServerOp, Status>, ctx: &CallContext<'_>) -> Step {
        let op = match result {
            Ok(op) => op,
            Err(status) => {
                debug!("call {} failed in {:?}: {status}", self.tag, self.phase);
                self.phase = Phase::Destroy;
                return Step::Destroy;
            }
        };
        trace!("call {} in {:?}: {op:?}", self.tag, self.phase);

        match (self.phase, op) {
            (Phase::Process, ServerOp::Accepted(mut stream)) => {
                stream.read(ctx.queue, self.tag);
                self.stream = Some(stream);
                self.phase = Phase::Reply;
                Step::Accepted
            }
            (Phase::Reply, ServerOp::Read(body)) => {
                self.reply(&body, ctx);
                Step::Continue
            }
            (Phase::Finish, ServerOp::Written) => {
                if let Some(stream) = &self.stream {
                    stream.finish(Status::ok(), ctx.queue, self.tag);
                }
                self.phase = Phase::Destroy;
                Step::Continue
            }
            (Phase::Destroy, ServerOp::Finished) => Step::Destroy,
            (phase, op) => {
                warn!("call {}: unexpected {op:?} in {phase:?}", self.tag);
                self.phase = Phase::Destroy;
                Step::Destroy
            }
        }
    }

    fn reply(&mut self, body: &[u8], ctx: &CallContext<'_>) {
        let Some(stream) = &self.stream else {
            self.phase = Phase::Destroy;
            return;
        };

        match respond(stream, body, ctx, self.tag) {
            Ok(()) => self.phase = Phase::Finish,
            Err(status) => {
                warn!("call {} from {} rejected: {status}", self.tag, stream.peer());
                stream.finish(status, ctx.queue, self.tag);
                self.phase = Phase::Destroy;
            }
        }
    }
}

/// Executes the request in `body` and hands its reply to the connection.
///
/// A read reply is encoded from a borrow of the store and flattened while the
/// borrow is held; the borrow is released before the reply reaches the socket.
fn respond(
    stream: &ServerStream,
    body: &[u8],
    ctx: &CallContext<'_>,
    tag: usize,
) -> Result<(), Status> {
    let request = codec::decode(body).map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string()))?;
    let offset = request.header.offset;

    match stream.method() {
        READ_METHOD => {
            request
                .expect_kind(MessageKind::ReadRequest)
                .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string()))?;
            let lens: Vec<usize> = request.segments.iter().map(|s| s.len()).collect();
            let response = {
                let view = ctx.store.read_view(offset, &lens).map_err(storage_status)?;
                let encoded = codec::encode(MessageKind::ReadResponse, offset, view.segments())
                    .map_err(|e| Status::new(StatusCode::Internal, e.to_string()))?;
                encoded.to_vec()
            };

            stream.write(response, ctx.queue, tag);
        }
        WRITE_METHOD => {
            request
                .expect_kind(MessageKind::WriteRequest)
                .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string()))?;
            ctx.store
                .write_segments(offset, &request.segments)
                .map_err(storage_status)?;
            let response = codec::encode(MessageKind::WriteResponse, offset, [])
                .map_err(|e| Status::new(StatusCode::Internal, e.to_string()))?
                .to_vec();

            stream.write(response, ctx.queue, tag);
        }
        other => {
            return Err(Status::new(
                StatusCode::Unimplemented,
                format!("unknown method '{other}'"),
            ));
        }
    }
    Ok(())
}

fn storage_status(e: StorageError) -> Status {
    match e {
        StorageError::OutOfBounds { .. } => Status::new(StatusCode::OutOfRange, e.to_string()),
        StorageError::Allocation { .. } => Status::new(StatusCode::Internal, e.to_string()),
    }
}
