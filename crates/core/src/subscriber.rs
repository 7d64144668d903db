//! Local subscribers and their bounded queues.
//!
//! The queue is a mutex-guarded SPSC ring: the router is the only
//! producer, the owning [Subscriber] the only consumer. A
//! [tokio::sync::Notify] wakes async waiters and a one-byte self-pipe
//! makes readiness observable from external event loops.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use telefab_api::{FabError, FabResult, Topic, Value};
use tokio::sync::Notify;

/// One received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The topic it was published under.
    pub topic: Topic,
    /// The payload.
    pub value: Value,
}

pub(crate) enum PushOutcome {
    /// Message enqueued.
    Queued,
    /// Queue full; the message was dropped for this subscriber.
    Overflow,
    /// Consumer is gone; the producer should forget this queue.
    Closed,
}

struct QueueInner {
    items: VecDeque<Message>,
    closed: bool,
    shutdown: bool,
    // one byte is in flight in the self-pipe while the queue is
    // non-empty
    pipe_armed: bool,
    pipe_tx: std::io::PipeWriter,
    pipe_rx: std::io::PipeReader,
}

pub(crate) struct SubQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl std::fmt::Debug for SubQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubQueue")
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl SubQueue {
    pub fn new(capacity: usize) -> FabResult<Arc<Self>> {
        let (pipe_rx, pipe_tx) = std::io::pipe()
            .map_err(|err| FabError::other_src("subscriber pipe", err))?;
        Ok(Arc::new(Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                shutdown: false,
                pipe_armed: false,
                pipe_tx,
                pipe_rx,
            }),
            notify: Notify::new(),
            capacity,
        }))
    }

    /// Producer side: append one message.
    pub fn push(&self, msg: Message) -> PushOutcome {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return PushOutcome::Closed;
        }
        if inner.items.len() >= self.capacity {
            return PushOutcome::Overflow;
        }
        inner.items.push_back(msg);
        if !inner.pipe_armed {
            // At most one byte is outstanding, so this cannot block.
            if inner.pipe_tx.write_all(&[1]).is_ok() {
                inner.pipe_armed = true;
            }
        }
        drop(inner);
        self.notify.notify_one();
        PushOutcome::Queued
    }

    /// Close from the endpoint side; pending and future waits fail with
    /// [FabError::ShutdownInProgress].
    pub fn close_for_shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.shutdown = true;
        }
        self.notify.notify_waiters();
    }

    fn close_for_drop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    fn pop_batch(&self, max: usize) -> FabResult<Vec<Message>> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        while out.len() < max {
            match inner.items.pop_front() {
                Some(m) => out.push(m),
                None => break,
            }
        }
        if inner.items.is_empty() && inner.pipe_armed {
            let mut byte = [0u8; 1];
            if inner.pipe_rx.read_exact(&mut byte).is_ok() {
                inner.pipe_armed = false;
            }
        }
        if out.is_empty() && inner.shutdown {
            return Err(FabError::ShutdownInProgress);
        }
        Ok(out)
    }

    fn is_closed_empty(&self) -> Option<FabError> {
        let inner = self.inner.lock().unwrap();
        if inner.items.is_empty() && inner.closed {
            if inner.shutdown {
                Some(FabError::ShutdownInProgress)
            } else {
                Some(FabError::other("subscriber closed"))
            }
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}

/// A local consumer of matching messages.
///
/// Dropping the subscriber revokes its queue; the endpoint and its
/// other subscribers are unaffected.
pub struct Subscriber {
    pub(crate) id: u64,
    pub(crate) queue: Arc<SubQueue>,
    pub(crate) on_drop: Box<dyn Fn(u64) + Send + Sync>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

impl Subscriber {
    /// Await one message.
    pub async fn recv(&self) -> FabResult<Message> {
        let mut batch = self.get(1).await?;
        batch
            .pop()
            .ok_or_else(|| FabError::other("empty batch"))
    }

    /// Await at least one message, returning up to `n`.
    pub async fn get(&self, n: usize) -> FabResult<Vec<Message>> {
        loop {
            let notified = self.queue.notify.notified();
            let batch = self.queue.pop_batch(n)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if let Some(err) = self.queue.is_closed_empty() {
                return Err(err);
            }
            notified.await;
        }
    }

    /// Drain whatever is queued right now without waiting.
    pub fn poll(&self) -> FabResult<Vec<Message>> {
        self.queue.pop_batch(usize::MAX)
    }

    /// Number of messages currently queued.
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// Await queue readiness: resolves once at least one message is
    /// available.
    pub async fn wait(&self) -> FabResult<()> {
        loop {
            let notified = self.queue.notify.notified();
            if self.queue.len() > 0 {
                return Ok(());
            }
            if let Some(err) = self.queue.is_closed_empty() {
                return Err(err);
            }
            notified.await;
        }
    }

    /// [Subscriber::wait] bounded by a relative timeout. Returns
    /// whether the wait was satisfied.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// [Subscriber::wait] bounded by an absolute deadline. Returns
    /// whether the wait was satisfied.
    pub async fn wait_deadline(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        let timeout = deadline.saturating_duration_since(now);
        self.wait_timeout(timeout).await
    }

    /// A readable descriptor that is ready whenever at least one
    /// message is queued, for integration with external event loops.
    #[cfg(unix)]
    pub fn readable_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.queue.inner.lock().unwrap().pipe_rx.as_raw_fd()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.queue.close_for_drop();
        (self.on_drop)(self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn msg(i: i64) -> Message {
        Message {
            topic: Topic::new("t").unwrap(),
            value: Value::Integer(i),
        }
    }

    fn subscriber(capacity: usize) -> (Subscriber, Arc<SubQueue>) {
        let queue = SubQueue::new(capacity).unwrap();
        (
            Subscriber {
                id: 1,
                queue: queue.clone(),
                on_drop: Box::new(|_| ()),
            },
            queue,
        )
    }

    #[tokio::test]
    async fn push_then_get() {
        let (sub, queue) = subscriber(4);
        assert!(matches!(queue.push(msg(1)), PushOutcome::Queued));
        assert!(matches!(queue.push(msg(2)), PushOutcome::Queued));
        let batch = sub.get(10).await.unwrap();
        assert_eq!(2, batch.len());
        assert_eq!(Value::Integer(1), batch[0].value);
    }

    #[tokio::test]
    async fn overflow_drops_newest_only() {
        let (sub, queue) = subscriber(2);
        assert!(matches!(queue.push(msg(1)), PushOutcome::Queued));
        assert!(matches!(queue.push(msg(2)), PushOutcome::Queued));
        assert!(matches!(queue.push(msg(3)), PushOutcome::Overflow));
        let got = sub.poll().unwrap();
        assert_eq!(
            vec![Value::Integer(1), Value::Integer(2)],
            got.into_iter().map(|m| m.value).collect::<Vec<_>>(),
        );
    }

    #[tokio::test]
    async fn get_blocks_until_push() {
        let (sub, queue) = subscriber(4);
        let task = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(msg(7));
        let got = task.await.unwrap().unwrap();
        assert_eq!(Value::Integer(7), got.value);
    }

    #[tokio::test]
    async fn wait_timeout_reports_satisfaction() {
        let (sub, queue) = subscriber(4);
        assert!(!sub.wait_timeout(Duration::from_millis(30)).await);
        queue.push(msg(1));
        assert!(sub.wait_timeout(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_waits() {
        let (sub, queue) = subscriber(4);
        let task = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close_for_shutdown();
        assert!(matches!(
            task.await.unwrap(),
            Err(FabError::ShutdownInProgress)
        ));
    }

    #[tokio::test]
    async fn dropped_subscriber_rejects_pushes() {
        let (sub, queue) = subscriber(4);
        drop(sub);
        assert!(matches!(queue.push(msg(1)), PushOutcome::Closed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_signals_readiness() {
        let (sub, queue) = subscriber(4);
        queue.push(msg(1));
        let fd = sub.readable_fd();
        assert!(fd >= 0);
        // one byte is armed while non-empty, drained once emptied
        assert!(queue.inner.lock().unwrap().pipe_armed);
        sub.poll().unwrap();
        assert!(!queue.inner.lock().unwrap().pipe_armed);
    }
}
