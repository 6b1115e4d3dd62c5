//! Bounded FIFO queues carrying payloads and typed stop signals.
//!
//! Completion is modelled exclusively with [`Signal::Stop`] values that
//! flow through the queue like any other element; the underlying channel
//! is never closed while the pipeline runs. Producers put one stop per
//! consumer (or rely on the node runtime's stop broadcast).

use std::time::Duration;

use crate::error::{Error, Result};

/// An element travelling through a [`Queue`]: either a payload or the
/// end-of-stream marker for one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<T> {
    /// A payload value.
    Item(T),
    /// Terminates exactly one consumer.
    Stop,
}

impl<T> Signal<T> {
    /// Returns whether this signal is the stop marker.
    pub fn is_stop(&self) -> bool {
        matches!(self, Signal::Stop)
    }
}

/// A bounded multi-producer multi-consumer FIFO queue.
///
/// `put` suspends while the queue is full and `get` suspends while it is
/// empty. [`Queue::len`] and [`Queue::capacity`] are racy observers meant
/// for monitoring only.
#[derive(Debug)]
pub struct Queue<T> {
    tx: async_channel::Sender<Signal<T>>,
    rx: async_channel::Receiver<Signal<T>>,
    capacity: usize,
    owner: String,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
            owner: self.owner.clone(),
        }
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Creates a queue with the given payload capacity.
    ///
    /// A zero capacity is promoted to one: a rendezvous queue cannot hold
    /// the stop signal required for termination.
    pub fn bounded(capacity: usize, owner: impl Into<String>) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            owner: owner.into(),
        }
    }

    /// Enqueues a payload, suspending until space is available.
    pub async fn put(&self, value: T) -> Result<()> {
        self.tx
            .send(Signal::Item(value))
            .await
            .map_err(|_| Error::QueueClosed(self.owner.clone()))
    }

    /// Enqueues one stop signal, terminating a single consumer.
    pub async fn put_stop(&self) -> Result<()> {
        self.tx
            .send(Signal::Stop)
            .await
            .map_err(|_| Error::QueueClosed(self.owner.clone()))
    }

    /// Dequeues the next signal, suspending until one is available.
    pub async fn get(&self) -> Result<Signal<T>> {
        self.rx
            .recv()
            .await
            .map_err(|_| Error::QueueClosed(self.owner.clone()))
    }

    /// Dequeues the next signal, giving up after `timeout`.
    ///
    /// Returns `Ok(None)` on timeout. Used by node workers so that idle
    /// consumers periodically observe upstream termination.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<Option<Signal<T>>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Ok(signal)) => Ok(Some(signal)),
            Ok(Err(_)) => Err(Error::QueueClosed(self.owner.clone())),
            Err(_) => Ok(None),
        }
    }

    /// Number of buffered signals. Races with producers and consumers.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Payload capacity the queue was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = Queue::bounded(8, "test");
        for i in 0..5 {
            queue.put(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.get().await.unwrap(), Signal::Item(i));
        }
    }

    #[tokio::test]
    async fn put_blocks_when_full() {
        let queue = Queue::bounded(2, "test");
        queue.put(1).await.unwrap();
        queue.put(2).await.unwrap();

        let pending = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.unwrap(), Signal::Item(1));
        pending.await.unwrap().unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn get_timeout_returns_none_when_idle() {
        let queue: Queue<u8> = Queue::bounded(1, "test");
        let got = queue.get_timeout(Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn stop_terminates_one_consumer() {
        let queue: Queue<u8> = Queue::bounded(4, "test");
        queue.put(7).await.unwrap();
        queue.put_stop().await.unwrap();
        assert_eq!(queue.get().await.unwrap(), Signal::Item(7));
        assert!(queue.get().await.unwrap().is_stop());
    }

    #[test]
    fn zero_capacity_is_promoted() {
        let queue: Queue<u8> = Queue::bounded(0, "test");
        assert_eq!(queue.capacity(), 1);
    }
}
