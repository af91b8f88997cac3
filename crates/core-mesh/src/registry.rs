//! Live stream ids and where their reassembled data goes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use core_framing::{Reassembled, Reassembler, StreamChunk, StreamId};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("stream {0} is already open")]
    StreamInUse(StreamId),
}

/// What a registration's owner sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One complete logical message from the remote side.
    Data(Bytes),
    /// The remote sent a close signal. No further events follow.
    Closed,
}

/// Outcome of handing one inbound chunk to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Buffered,
    Delivered,
    Closed,
    /// No live registration; the chunk was dropped.
    Unknown,
}

struct Entry {
    generation: u64,
    sink: mpsc::UnboundedSender<StreamEvent>,
}

#[derive(Default)]
struct Inner {
    next_generation: u64,
    streams: HashMap<StreamId, Entry>,
    reassembler: Reassembler,
}

/// Shared by every bridge and the inbound dispatcher; all access goes through one lock.
#[derive(Default)]
pub struct StreamRegistry {
    inner: Mutex<Inner>,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `id` until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, id: StreamId) -> Result<Registration, RegistryError> {
        let mut inner = self.lock();
        if inner.streams.contains_key(&id) {
            return Err(RegistryError::StreamInUse(id));
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let (sink, events) = mpsc::unbounded_channel();
        inner.streams.insert(id, Entry { generation, sink });
        inner.reassembler.forget(&id);
        log::debug!("registered stream {}", id);
        Ok(Registration {
            id,
            generation,
            registry: Arc::clone(self),
            events,
        })
    }

    pub fn deliver(&self, chunk: &StreamChunk) -> Delivery {
        let mut inner = self.lock();
        let id = chunk.stream_id;
        if !inner.streams.contains_key(&id) {
            return Delivery::Unknown;
        }
        match inner.reassembler.on_chunk(chunk) {
            Reassembled::Pending => Delivery::Buffered,
            Reassembled::Complete(data) => {
                let sent = inner
                    .streams
                    .get(&id)
                    .map(|e| e.sink.send(StreamEvent::Data(data)).is_ok())
                    .unwrap_or(false);
                if !sent {
                    // owner went away without deregistering yet
                    inner.streams.remove(&id);
                    return Delivery::Unknown;
                }
                Delivery::Delivered
            }
            Reassembled::Closed => {
                if let Some(entry) = inner.streams.remove(&id) {
                    let _ = entry.sink.send(StreamEvent::Closed);
                }
                log::debug!("stream {} closed by remote", id);
                Delivery::Closed
            }
        }
    }

    pub fn is_registered(&self, id: &StreamId) -> bool {
        self.lock().streams.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deregister(&self, id: &StreamId, generation: u64) {
        let mut inner = self.lock();
        if inner.streams.get(id).map(|e| e.generation) == Some(generation) {
            inner.streams.remove(id);
            log::debug!("deregistered stream {}", id);
        }
        if !inner.streams.contains_key(id) {
            inner.reassembler.forget(id);
        }
    }
}

/// Exclusive claim on a stream id. Dropping it deregisters the id.
pub struct Registration {
    id: StreamId,
    generation: u64,
    registry: Arc<StreamRegistry>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl Registration {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Next event, or `None` once the registry has let go of this stream.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(&self.id, self.generation);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: StreamId, index: u8, count: u8, data: &'static [u8]) -> StreamChunk {
        StreamChunk {
            stream_id: id,
            destination: None,
            index,
            count,
            payload: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn completed_messages_reach_the_owner() {
        let reg = StreamRegistry::new();
        let id = StreamId::derive(42, "10.0.0.5", 9000);
        let mut r = reg.register(id).unwrap();

        assert_eq!(reg.deliver(&chunk(id, 0, 2, b"HTTP/1.0 ")), Delivery::Buffered);
        assert_eq!(reg.deliver(&chunk(id, 1, 2, b"200 OK")), Delivery::Delivered);
        assert_eq!(
            r.recv().await,
            Some(StreamEvent::Data(Bytes::from_static(b"HTTP/1.0 200 OK")))
        );

        assert_eq!(reg.deliver(&StreamChunk::close(id)), Delivery::Closed);
        assert_eq!(r.recv().await, Some(StreamEvent::Closed));
        assert_eq!(r.recv().await, None);
        assert!(!reg.is_registered(&id));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let reg = StreamRegistry::new();
        let id = StreamId::new([4; 8]);
        let first = reg.register(id).unwrap();
        assert_eq!(reg.register(id).unwrap_err(), RegistryError::StreamInUse(id));
        drop(first);
        assert!(reg.is_empty());
        assert!(reg.register(id).is_ok());
    }

    #[test]
    fn chunks_for_unknown_streams_are_dropped() {
        let reg = StreamRegistry::new();
        let id = StreamId::new([5; 8]);
        assert_eq!(reg.deliver(&chunk(id, 0, 2, b"ab")), Delivery::Unknown);
        // nothing was buffered for it either
        let _r = reg.register(id).unwrap();
        assert_eq!(reg.deliver(&chunk(id, 1, 2, b"cd")), Delivery::Delivered);
    }

    #[test]
    fn stale_guard_does_not_evict_newer_registration() {
        let reg = StreamRegistry::new();
        let id = StreamId::new([6; 8]);
        let old = reg.register(id).unwrap();
        // remote close removes the entry, the id is reusable before `old` drops
        reg.deliver(&StreamChunk::close(id));
        let _new = reg.register(id).unwrap();
        drop(old);
        assert!(reg.is_registered(&id));
    }
}
