//! # Order Queue
//!
//! Actors never call each other; they emit orders onto a queue through a
//! [`BatchingSender`], which ships them in fixed-size batches.

use crate::pipeline::Order;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use strata_core::StrataError;

/// A durable-enough FIFO of serialized orders.
pub trait OrderQueue: Send + Sync {
    fn send_batch(&self, orders: &[Order]) -> Result<(), StrataError>;

    /// Take up to `max` orders from the front.
    fn receive(&self, max: usize) -> Result<Vec<Order>, StrataError>;

    fn len(&self) -> Result<usize, StrataError>;

    fn is_empty(&self) -> Result<bool, StrataError> {
        Ok(self.len()? == 0)
    }
}

/// In-process queue. Orders are stored as their JSON encoding so every
/// order crosses the same wire form a remote queue would carry.
///
/// A message that no longer decodes is set aside as a dead letter; the
/// rest of its batch is still delivered.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<String>>,
    dead_letters: Mutex<Vec<String>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn messages(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_aside(&self) -> MutexGuard<'_, Vec<String>> {
        self.dead_letters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Raw messages that failed to decode.
    pub fn dead_letters(&self) -> Vec<String> {
        self.set_aside().clone()
    }
}

impl OrderQueue for MemoryQueue {
    fn send_batch(&self, orders: &[Order]) -> Result<(), StrataError> {
        let encoded = orders
            .iter()
            .map(|order| {
                serde_json::to_string(order)
                    .map_err(|e| StrataError::SerializationError(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.messages().extend(encoded);
        Ok(())
    }

    fn receive(&self, max: usize) -> Result<Vec<Order>, StrataError> {
        let raw: Vec<String> = {
            let mut messages = self.messages();
            let take = max.min(messages.len());
            messages.drain(..take).collect()
        };
        let mut orders = Vec::with_capacity(raw.len());
        for message in raw {
            match serde_json::from_str(&message) {
                Ok(order) => orders.push(order),
                Err(e) => {
                    tracing::error!(message = %message, error = %e, "undecodable order set aside");
                    self.set_aside().push(message);
                }
            }
        }
        Ok(orders)
    }

    fn len(&self) -> Result<usize, StrataError> {
        Ok(self.messages().len())
    }
}

/// Buffers outbound orders and sends them `batch_size` at a time.
///
/// Call [`BatchingSender::flush`] before dropping; unflushed orders are
/// logged and lost.
pub struct BatchingSender {
    queue: Arc<dyn OrderQueue>,
    batch_size: usize,
    buffer: Vec<Order>,
    sent: usize,
}

impl std::fmt::Debug for BatchingSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingSender")
            .field("batch_size", &self.batch_size)
            .field("buffered", &self.buffer.len())
            .field("sent", &self.sent)
            .finish_non_exhaustive()
    }
}

impl BatchingSender {
    pub fn new(queue: Arc<dyn OrderQueue>, batch_size: usize) -> Self {
        Self {
            queue,
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            sent: 0,
        }
    }

    pub fn send(&mut self, order: Order) -> Result<(), StrataError> {
        self.buffer.push(order);
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StrataError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.queue.send_batch(&self.buffer)?;
        self.sent += self.buffer.len();
        tracing::trace!(orders = self.buffer.len(), "batch sent");
        self.buffer.clear();
        Ok(())
    }

    /// Orders handed to the queue so far.
    #[must_use]
    pub fn sent(&self) -> usize {
        self.sent
    }
}

impl Drop for BatchingSender {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            tracing::warn!(orders = self.buffer.len(), "sender dropped with unflushed orders");
        }
    }
}
