use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use log::{debug, info, trace, warn};
use slab::Slab;

use crate::{
    config::{ConfigError, RemoteConfig},
    io::{Completion, CompletionFn, Direction, IoError, IoRequest},
    protocol::{
        Channel, ClientEvent, CompletionQueue, MessageKind, READ_METHOD, WRITE_METHOD, Status,
        WorkerPool, codec,
    },
};

use super::TargetError;

type Reply = Result<Vec<u8>, Status>;

/// A call slot. `request` is parked once the call has been started; a reply
/// that arrives before that waits in `early`.
#[derive(Default)]
struct PendingCall {
    request: Option<IoRequest>,
    early: Option<Reply>,
}

/// One completion queue, its worker, and the calls posted to it.
struct Lane {
    queue: Arc<CompletionQueue<ClientEvent>>,
    pending: Mutex<Slab<PendingCall>>,
}

impl Lane {
    fn new() -> Self {
        Self {
            queue: Arc::new(CompletionQueue::new()),
            pending: Mutex::new(Slab::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Slab<PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the slot whose key tags the next call.
    fn reserve(&self) -> usize {
        self.pending().insert(PendingCall::default())
    }

    /// Frees a slot whose call never started.
    fn release(&self, tag: usize) {
        self.pending().try_remove(tag);
    }

    /// Parks `request` in its slot after the call started. Returns it with the
    /// reply instead if the reply has already arrived.
    fn park(&self, tag: usize, request: IoRequest) -> Option<(IoRequest, Reply)> {
        let mut pending = self.pending();
        let early = match pending.get_mut(tag) {
            Some(call) => call.early.take(),
            None => {
                warn!("call {tag} vanished before it was parked");
                return None;
            }
        };

        match early {
            Some(reply) => {
                pending.remove(tag);
                Some((request, reply))
            }
            None => {
                if let Some(call) = pending.get_mut(tag) {
                    call.request = Some(request);
                }
                None
            }
        }
    }

    /// Claims the request of a finished call, or holds the reply until the
    /// submitter parks the request.
    fn take(&self, tag: usize, reply: Reply) -> Option<(IoRequest, Reply)> {
        let mut pending = self.pending();
        let parked = match pending.get_mut(tag) {
            Some(call) => match call.request.take() {
                Some(request) => request,
                None => {
                    call.early = Some(reply);
                    return None;
                }
            },
            None => {
                warn!("completion for unknown call {tag}");
                return None;
            }
        };
        pending.remove(tag);
        Some((parked, reply))
    }
}

/// Target forwarding every request to a storage server.
///
/// Calls are spread round-robin across `workers` lanes. A call's slot in its
/// lane's arena is the tag of its RPC. Whichever of the submitter and the
/// lane's worker reaches the slot second fires the completion.
pub struct RemoteTarget {
    channel: Channel,
    lanes: Vec<Arc<Lane>>,
    next: AtomicUsize,
    pool: Option<WorkerPool>,
    on_complete: CompletionFn,
}

impl RemoteTarget {
    pub fn new(config: &RemoteConfig, on_complete: CompletionFn) -> Result<Self, TargetError> {
        if config.workers == 0 {
            return Err(ConfigError::NoWorkers.into());
        }
        let lanes: Vec<Arc<Lane>> = (0..config.workers).map(|_| Arc::new(Lane::new())).collect();

        let pool = {
            let lanes = lanes.clone();
            let on_complete = on_complete.clone();
            WorkerPool::spawn("blockwire-client", config.workers, move |id| {
                drain(&lanes[id], &on_complete)
            })?
        };
        info!(
            "remote target for {} with {} workers",
            config.address, config.workers
        );

        Ok(Self {
            channel: Channel::new(config.address.as_str()),
            lanes,
            next: AtomicUsize::new(0),
            pool: Some(pool),
            on_complete,
        })
    }

    pub fn submit(&self, request: IoRequest) {
        let lane = &self.lanes[self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len()];
        let tag = lane.reserve();

        match self.start(&request, &lane.queue, tag) {
            Ok(()) => {
                if let Some((request, reply)) = lane.park(tag, request) {
                    complete(request, reply, &self.on_complete);
                }
            }
            Err(e) => {
                lane.release(tag);
                debug!("failed to start call for {:?}: {e}", request.token);
                (self.on_complete)(Completion::new(request, Err(e)));
            }
        }
    }

    fn start(
        &self,
        request: &IoRequest,
        queue: &Arc<CompletionQueue<ClientEvent>>,
        tag: usize,
    ) -> Result<(), IoError> {
        let (method, kind) = match request.direction {
            Direction::Read => (READ_METHOD, MessageKind::ReadRequest),
            Direction::Write => (WRITE_METHOD, MessageKind::WriteRequest),
        };
        trace!(
            "{method} of {} bytes at {} as call {tag}",
            request.len(),
            request.offset
        );

        let message = codec::encode(
            kind,
            request.offset,
            request.segments.iter().map(Vec::as_slice),
        )?;
        self.channel
            .start_call(method, &message.io_slices(), queue, tag)
            .map_err(IoError::Transport)
    }
}

impl Drop for RemoteTarget {
    fn drop(&mut self) {
        for lane in &self.lanes {
            lane.queue.shutdown();
        }
        drop(self.pool.take());

        let abandoned: usize = self.lanes.iter().map(|lane| lane.pending().len()).sum();
        if abandoned > 0 {
            warn!(
                "abandoning {abandoned} calls in flight to {}",
                self.channel.address()
            );
        }
    }
}

fn drain(lane: &Lane, on_complete: &CompletionFn) {
    while let Some(ClientEvent { tag, result }) = lane.queue.next() {
        if let Some((request, reply)) = lane.take(tag, result) {
            complete(request, reply, on_complete);
        }
    }
}

fn complete(mut request: IoRequest, reply: Reply, on_complete: &CompletionFn) {
    let result = match reply {
        Ok(body) => decode_reply(&body, &mut request),
        Err(status) => Err(IoError::Transport(status)),
    };
    if let Err(e) = &result {
        debug!("request {:?} failed: {e}", request.token);
    }
    on_complete(Completion::new(request, result));
}

/// Validates a reply and, for reads, copies its payload into the request.
fn decode_reply(body: &[u8], request: &mut IoRequest) -> Result<(), IoError> {
    let header = match request.direction {
        Direction::Read => codec::decode_into(
            body,
            MessageKind::ReadResponse,
            Some(&mut request.segments),
        )?,
        Direction::Write => codec::decode_into(body, MessageKind::WriteResponse, None)?,
    };
    trace!("reply for offset {} decoded", header.offset);
    Ok(())
}
