use log::trace;

use crate::{
    io::{Completion, CompletionFn, IoRequest},
    storage::{BackingStore, StorageError},
};

/// Target backed by an in-process buffer. Requests complete inline, on the
/// submitting thread, before `read`/`write` return.
pub struct LocalTarget {
    store: BackingStore,
    on_complete: CompletionFn,
}

impl LocalTarget {
    pub fn new(capacity: u64, on_complete: CompletionFn) -> Result<Self, StorageError> {
        let size = usize::try_from(capacity).map_err(|_| StorageError::Allocation {
            size: usize::MAX,
        })?;

        Ok(Self {
            store: BackingStore::new(size)?,
            on_complete,
        })
    }

    pub fn read(&self, mut request: IoRequest) {
        trace!("local read of {} bytes at {}", request.len(), request.offset);
        let result = self.store.read_into(request.offset, &mut request.segments);
        (self.on_complete)(Completion::new(request, result.map_err(Into::into)));
    }

    pub fn write(&self, request: IoRequest) {
        trace!("local write of {} bytes at {}", request.len(), request.offset);
        let result = self.store.write_segments(request.offset, &request.segments);
        (self.on_complete)(Completion::new(request, result.map_err(Into::into)));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::io::Token;

    fn target(capacity: u64) -> (LocalTarget, Arc<Mutex<Vec<Completion>>>) {
        let completions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completions);
        let target = LocalTarget::new(
            capacity,
            Arc::new(move |completion: Completion| sink.lock().unwrap().push(completion)),
        )
        .unwrap();
        (target, completions)
    }

    #[test]
    fn completes_inline() {
        let (target, completions) = target(1024);

        target.write(IoRequest::write(0, vec![vec![0xAA; 4]], Token(1)));
        assert_eq!(completions.lock().unwrap().len(), 1);
    }

    #[test]
    fn scatter_gather_over_unequal_segments() {
        let (target, completions) = target(4096);
        let data: Vec<u8> = (0..=255).cycle().take(1500).collect();

        target.write(IoRequest::write(
            512,
            vec![data[..100].to_vec(), data[100..1100].to_vec(), data[1100..].to_vec()],
            Token(1),
        ));
        target.read(IoRequest::read(512, &[700, 1, 799], Token(2)));

        let completions = completions.lock().unwrap();
        assert!(completions.iter().all(Completion::is_ok));
        let read = &completions[1];
        assert_eq!(read.token, Token(2));
        assert_eq!(read.segments.concat(), data);
        assert_eq!(read.segments[1], vec![data[700]]);
    }

    #[test]
    fn scenario_write_4096_read_two_halves() {
        let (target, completions) = target(8192);

        target.write(IoRequest::write(0, vec![vec![0xAA; 4096]], Token(1)));
        target.read(IoRequest::read(0, &[2048, 2048], Token(2)));

        let completions = completions.lock().unwrap();
        assert_eq!(completions[1].segments, vec![vec![0xAA; 2048]; 2]);
    }
}
