//! Unbounded single-producer/single-consumer delivery queue
//!
//! A one-slot hand-off backed by a FIFO backlog. Producers never wait: a
//! message that cannot be handed off immediately is parked in the backlog,
//! and the consumer promotes the oldest parked message into the slot after
//! each receive.

use super::Message;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Producer side of a delivery queue
#[derive(Debug)]
pub struct DeliveryQueue {
    slot: mpsc::Sender<Message>,
    backlog: Mutex<VecDeque<Message>>,
}

/// Consumer side of a delivery queue
#[derive(Debug)]
pub struct QueueReader {
    slot: mpsc::Receiver<Message>,
    queue: Arc<DeliveryQueue>,
}

/// Create a connected queue/reader pair
pub fn delivery_queue() -> (Arc<DeliveryQueue>, QueueReader) {
    let (tx, rx) = mpsc::channel(1);
    let queue = Arc::new(DeliveryQueue {
        slot: tx,
        backlog: Mutex::new(VecDeque::new()),
    });
    let reader = QueueReader {
        slot: rx,
        queue: Arc::clone(&queue),
    };
    (queue, reader)
}

impl DeliveryQueue {
    /// Enqueue without blocking.
    ///
    /// Returns the backlog length after the call (0 when handed off directly),
    /// or `Exiting` once the reader is gone.
    pub fn put(&self, msg: Message) -> Result<usize> {
        let mut backlog = self.backlog.lock();
        if self.slot.is_closed() {
            return Err(Error::Exiting);
        }
        // Anything already parked must go out first.
        if backlog.is_empty() {
            match self.slot.try_send(msg) {
                Ok(()) => return Ok(0),
                Err(TrySendError::Full(msg)) => backlog.push_back(msg),
                Err(TrySendError::Closed(_)) => return Err(Error::Exiting),
            }
        } else {
            backlog.push_back(msg);
        }
        Ok(backlog.len())
    }

    /// Promote the oldest backlog entry into the hand-off slot if it is free
    fn load(&self) {
        let mut backlog = self.backlog.lock();
        if let Some(msg) = backlog.pop_front() {
            match self.slot.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) | Err(TrySendError::Closed(msg)) => {
                    backlog.push_front(msg)
                }
            }
        }
    }

    /// Messages waiting, including the one in the slot
    pub fn depth(&self) -> usize {
        let in_slot = self.slot.max_capacity() - self.slot.capacity();
        self.backlog.lock().len() + in_slot
    }
}

impl QueueReader {
    /// Wait for the next message. `None` once the queue is closed and empty.
    pub async fn next(&mut self) -> Option<Message> {
        match self.slot.recv().await {
            Some(msg) => {
                self.queue.load();
                Some(msg)
            }
            None => self.queue.backlog.lock().pop_front(),
        }
    }

    /// Take the next message without waiting
    pub fn try_next(&mut self) -> Option<Message> {
        match self.slot.try_recv() {
            Ok(msg) => {
                self.queue.load();
                Some(msg)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.queue.backlog.lock().pop_front(),
        }
    }

    /// Stop accepting new messages. Already-queued messages stay readable.
    pub fn close(&mut self) {
        self.slot.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(i: usize) -> Message {
        Message::new(i.to_string().into_bytes())
    }

    #[tokio::test]
    async fn test_put_never_blocks_and_preserves_order() {
        let (queue, mut reader) = delivery_queue();

        // Far beyond the slot capacity, with nobody reading.
        for i in 0..1000 {
            queue.put(msg(i)).unwrap();
        }
        assert_eq!(queue.depth(), 1000);

        for i in 0..1000 {
            let got = reader.next().await.unwrap();
            assert_eq!(got, msg(i), "message {} out of order", i);
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_interleaved_put_and_read() {
        let (queue, mut reader) = delivery_queue();

        queue.put(msg(0)).unwrap();
        queue.put(msg(1)).unwrap();
        assert_eq!(reader.next().await.unwrap(), msg(0));
        queue.put(msg(2)).unwrap();
        assert_eq!(reader.next().await.unwrap(), msg(1));
        assert_eq!(reader.next().await.unwrap(), msg(2));
        assert!(reader.try_next().is_none());
    }

    #[tokio::test]
    async fn test_put_after_close_fails() {
        let (queue, mut reader) = delivery_queue();
        queue.put(msg(0)).unwrap();
        queue.put(msg(1)).unwrap();
        reader.close();

        assert_eq!(queue.put(msg(2)), Err(Error::Exiting));
        assert_eq!(reader.try_next(), Some(msg(0)));
        assert_eq!(reader.try_next(), Some(msg(1)));
        assert_eq!(reader.try_next(), None);
    }

    #[tokio::test]
    async fn test_concurrent_producer_slow_consumer() {
        let (queue, mut reader) = delivery_queue();
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for i in 0..200 {
                    queue.put(msg(i)).unwrap();
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 200 {
            let m = reader.next().await.unwrap();
            received.push(m);
            if received.len() % 10 == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        }
        producer.await.unwrap();

        let expected: Vec<Message> = (0..200).map(msg).collect();
        assert_eq!(received, expected);
    }
}
