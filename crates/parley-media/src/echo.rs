//! Echo engine: replays inbound audio after a fixed delay for RTT measurement.
//!
//! At most one wake-up task is pending per engine, always aimed at the
//! earliest due chunk.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

type EmitFn = Box<dyn FnMut(Bytes) + Send>;

pub struct EchoEngine {
    inner: Arc<Mutex<EchoInner>>,
}

struct EchoInner {
    delay: Duration,
    pending: VecDeque<(Instant, Bytes)>,
    emit: EmitFn,
    timer: Option<(Instant, JoinHandle<()>)>,
    emitted: u64,
}

impl EchoEngine {
    /// Create an engine that hands each chunk to `emit` once `delay` has passed.
    ///
    /// With a non-zero delay, `push` must be called from inside a tokio runtime.
    pub fn new(delay: Duration, emit: impl FnMut(Bytes) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EchoInner {
                delay,
                pending: VecDeque::new(),
                emit: Box::new(emit),
                timer: None,
                emitted: 0,
            })),
        }
    }

    /// Queue a chunk for emission at `now + delay`.
    pub fn push(&self, chunk: Bytes) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let due = Instant::now() + inner.delay;
        inner.pending.push_back((due, chunk));
        flush_due(&Arc::downgrade(&self.inner), &mut inner);
    }

    /// Cancel any pending wake-up and emit everything still queued, in order.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, timer)) = inner.timer.take() {
            timer.abort();
        }
        let remaining = inner.pending.len();
        while let Some((_, chunk)) = inner.pending.pop_front() {
            inner.emit_chunk(chunk);
        }
        if remaining > 0 {
            debug!(remaining, "Echo engine flushed pending chunks");
        }
    }

    /// Chunks waiting for their due time.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    /// Total chunks emitted so far.
    pub fn emitted(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .emitted
    }
}

impl Drop for EchoEngine {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, timer)) = inner.timer.take() {
            timer.abort();
        }
    }
}

impl EchoInner {
    fn emit_chunk(&mut self, chunk: Bytes) {
        self.emitted += 1;
        (self.emit)(chunk);
    }
}

/// Emit every chunk whose due time has passed, then make sure a single wake-up
/// is scheduled for the new earliest due chunk.
fn flush_due(shared: &Weak<Mutex<EchoInner>>, inner: &mut EchoInner) {
    let now = Instant::now();
    while inner.pending.front().is_some_and(|(due, _)| *due <= now) {
        if let Some((_, chunk)) = inner.pending.pop_front() {
            inner.emit_chunk(chunk);
        }
    }

    let Some(&(next_due, _)) = inner.pending.front() else {
        if let Some((_, timer)) = inner.timer.take() {
            timer.abort();
        }
        return;
    };

    if inner.timer.as_ref().is_some_and(|(at, _)| *at == next_due) {
        return;
    }
    if let Some((_, timer)) = inner.timer.take() {
        timer.abort();
    }

    trace!(pending = inner.pending.len(), "Scheduling echo wake-up");
    let weak = shared.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep_until(next_due).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
        // This task is the pending timer; forget it without aborting ourselves.
        if inner.timer.as_ref().is_some_and(|(at, _)| *at == next_due) {
            inner.timer = None;
        }
        flush_due(&weak, &mut inner);
    });
    inner.timer = Some((next_due, handle));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn recording_engine(delay: Duration) -> (EchoEngine, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let engine = EchoEngine::new(delay, move |chunk: Bytes| {
            sink.lock().unwrap().push(chunk[0]);
        });
        (engine, seen)
    }

    #[test]
    fn test_zero_delay_emits_synchronously_in_order() {
        let (engine, seen) = recording_engine(Duration::ZERO);
        for tag in 1..=5u8 {
            engine.push(Bytes::from(vec![tag]));
            assert_eq!(seen.lock().unwrap().len(), tag as usize);
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(engine.pending(), 0);
        assert_eq!(engine.emitted(), 5);
    }

    #[tokio::test]
    async fn test_delayed_emission_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let engine = EchoEngine::new(Duration::from_millis(30), move |chunk| {
            let _ = tx.send(chunk);
        });

        for tag in 1..=3u8 {
            engine.push(Bytes::from(vec![tag]));
        }
        // Nothing is due yet
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.pending(), 3);

        let mut order = Vec::new();
        for _ in 0..3 {
            let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("echo should fire")
                .unwrap();
            order.push(chunk[0]);
        }
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(engine.pending(), 0);
    }

    #[tokio::test]
    async fn test_flush_before_due_emits_everything() {
        let (engine, seen) = recording_engine(Duration::from_secs(60));
        engine.push(Bytes::from_static(&[7]));
        engine.push(Bytes::from_static(&[8]));
        assert!(seen.lock().unwrap().is_empty());

        engine.flush();
        assert_eq!(*seen.lock().unwrap(), vec![7, 8]);
        assert_eq!(engine.pending(), 0);

        // Timer was cancelled: nothing more arrives later
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_single_timer_for_many_chunks() {
        let (engine, _seen) = recording_engine(Duration::from_millis(50));
        for tag in 0..100u8 {
            engine.push(Bytes::from(vec![tag]));
        }
        let inner = engine.inner.lock().unwrap();
        assert!(inner.timer.is_some());
        // The one pending timer targets the oldest chunk
        assert_eq!(inner.timer.as_ref().map(|(at, _)| *at), inner.pending.front().map(|(d, _)| *d));
    }
}
