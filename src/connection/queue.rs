// ABOUTME: Bounded per-connection outbound queue
// Messages sent while a socket is not open wait here and flush FIFO on open

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::protocol::Frame;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub frame: Frame,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct MessageQueue {
    messages: VecDeque<QueuedMessage>,
    cap: usize,
}

impl MessageQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            cap,
        }
    }

    /// Append a frame. When the bound is exceeded the oldest entry is
    /// evicted and returned so the caller can log the drop.
    pub fn push(&mut self, frame: Frame) -> Option<QueuedMessage> {
        let dropped = if self.messages.len() >= self.cap {
            self.messages.pop_front()
        } else {
            None
        };

        self.messages.push_back(QueuedMessage {
            frame,
            enqueued_at: Utc::now(),
        });

        dropped
    }

    /// Remove and return everything, strictly FIFO.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
