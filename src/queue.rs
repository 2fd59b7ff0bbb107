//! Bounded FIFO between capture connections and WARC writer workers
//!
//! Producers wait while the queue is full, so a slow disk throttles capture
//! instead of dropping traffic.

use crate::errors::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// An item plus the instant it was enqueued
#[derive(Debug)]
pub struct Queued<T> {
  /// The item
  pub item: T,
  /// Enqueue time
  pub enqueued_at: Instant,
}

impl<T> Queued<T> {
  /// How long the item has been waiting
  pub fn waited(&self) -> Duration {
    self.enqueued_at.elapsed()
  }
}

/// Result of [`TimestampedQueue::dequeue_timeout`]
#[derive(Debug)]
pub enum Dequeued<T> {
  /// Next item
  Item(Queued<T>),
  /// Nothing arrived in time
  Empty,
  /// Closed and drained
  Closed,
}

/// Bounded multi-producer multi-consumer queue
#[derive(Debug)]
pub struct TimestampedQueue<T> {
  sender: Mutex<Option<mpsc::Sender<Queued<T>>>>,
  receiver: tokio::sync::Mutex<mpsc::Receiver<Queued<T>>>,
  capacity: usize,
  len: AtomicUsize,
}

impl<T: Send> TimestampedQueue<T> {
  /// Queue holding at most `capacity` items
  pub fn new(capacity: usize) -> Self {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    Self {
      sender: Mutex::new(Some(sender)),
      receiver: tokio::sync::Mutex::new(receiver),
      capacity: capacity.max(1),
      len: AtomicUsize::new(0),
    }
  }

  /// Add an item, waiting while the queue is full
  pub async fn enqueue(&self, item: T) -> Result<()> {
    let sender = self.sender.lock().clone().ok_or(Error::QueueClosed)?;
    let permit = sender.reserve().await.map_err(|_| Error::QueueClosed)?;
    self.len.fetch_add(1, Ordering::SeqCst);
    permit.send(Queued {
      item,
      enqueued_at: Instant::now(),
    });
    Ok(())
  }

  /// Take the next item, waiting while the queue is empty
  ///
  /// Returns `None` once the queue is closed and drained.
  pub async fn dequeue(&self) -> Option<Queued<T>> {
    let queued = self.receiver.lock().await.recv().await;
    if queued.is_some() {
      self.len.fetch_sub(1, Ordering::SeqCst);
    }
    queued
  }

  /// Like [`TimestampedQueue::dequeue`], giving up after `timeout`
  pub async fn dequeue_timeout(&self, timeout: Duration) -> Dequeued<T> {
    match tokio::time::timeout(timeout, self.dequeue()).await {
      Ok(Some(queued)) => Dequeued::Item(queued),
      Ok(None) => Dequeued::Closed,
      Err(_) => Dequeued::Empty,
    }
  }

  /// Stop accepting items; queued items stay dequeuable
  pub fn close(&self) {
    if self.sender.lock().take().is_some() {
      tracing::debug!("capture queue closed with {} items pending", self.len());
    }
  }

  /// Whether [`TimestampedQueue::close`] was called
  pub fn is_closed(&self) -> bool {
    self.sender.lock().is_none()
  }

  /// Items currently queued
  pub fn len(&self) -> usize {
    self.len.load(Ordering::SeqCst)
  }

  /// No items queued
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Maximum number of queued items
  pub fn capacity(&self) -> usize {
    self.capacity
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[tokio::test]
  async fn test_fifo_and_close() {
    let queue = TimestampedQueue::new(4);
    queue.enqueue(1).await.unwrap();
    queue.enqueue(2).await.unwrap();
    assert_eq!(queue.len(), 2);
    queue.close();
    assert!(matches!(queue.enqueue(3).await, Err(Error::QueueClosed)));
    assert_eq!(queue.dequeue().await.unwrap().item, 1);
    assert_eq!(queue.dequeue().await.unwrap().item, 2);
    assert!(queue.dequeue().await.is_none());
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_full_queue_blocks_until_dequeue() {
    let queue = Arc::new(TimestampedQueue::new(2));
    queue.enqueue(1).await.unwrap();
    queue.enqueue(2).await.unwrap();
    let producer = {
      let queue = queue.clone();
      tokio::spawn(async move { queue.enqueue(3).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!producer.is_finished());
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.dequeue().await.unwrap().item, 1);
    producer.await.unwrap().unwrap();
    assert_eq!(queue.len(), 2);
  }

  #[tokio::test]
  async fn test_dequeue_timeout_reports_empty() {
    let queue: TimestampedQueue<u8> = TimestampedQueue::new(1);
    assert!(matches!(
      queue.dequeue_timeout(Duration::from_millis(20)).await,
      Dequeued::Empty
    ));
    queue.close();
    assert!(matches!(
      queue.dequeue_timeout(Duration::from_millis(20)).await,
      Dequeued::Closed
    ));
  }
}
