//! Completion queues.
//!
//! A [`CompletionQueue`] is the only place a worker thread blocks. Producers
//! (connection readers, stream operations) post one event per finished
//! asynchronous operation; exactly one worker drains each queue.
//!
//! Shutting a queue down refuses further posts, but events already queued are
//! still handed out by [`CompletionQueue::next`] before it reports `None`.
use std::sync::{
    Mutex, PoisonError,
    mpsc::{self, Receiver, Sender},
};

#[derive(Debug)]
pub struct CompletionQueue<E> {
    sender: Mutex<Option<Sender<E>>>,
    receiver: Mutex<Receiver<E>>,
}

impl<E> CompletionQueue<E> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
        }
    }

    /// Queues an event. Returns `false` (dropping the event) once the queue
    /// has been shut down.
    pub fn post(&self, event: E) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Blocks until the next event is available. Returns `None` after
    /// shutdown once every queued event has been handed out.
    pub fn next(&self) -> Option<E> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv()
            .ok()
    }

    pub fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<E> Default for CompletionQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}
