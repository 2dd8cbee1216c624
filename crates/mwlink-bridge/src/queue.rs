use std::collections::VecDeque;

use bytes::Bytes;

/// A request waiting for, or occupying, the serial link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Correlation id from the originating envelope.
    pub id: u8,
    /// Command code.
    pub code: u8,
    /// Request payload.
    pub payload: Bytes,
    /// Lane selector.
    pub priority: bool,
}

/// Two FIFO lanes feeding a single in-flight slot.
///
/// Dispatch always prefers the head of the priority lane; the normal
/// lane drains in FIFO order otherwise. Exactly one item occupies the
/// in-flight slot at a time.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    priority: VecDeque<QueueItem>,
    normal: VecDeque<QueueItem>,
    in_flight: Option<QueueItem>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item to the lane selected by its priority flag.
    pub fn push(&mut self, item: QueueItem) {
        if item.priority {
            self.priority.push_back(item);
        } else {
            self.normal.push_back(item);
        }
    }

    /// Move the next item into the in-flight slot and return a copy of
    /// it, or `None` if the slot is occupied or both lanes are empty.
    pub fn dispatch(&mut self) -> Option<QueueItem> {
        if self.in_flight.is_some() {
            return None;
        }
        let item = self.priority.pop_front().or_else(|| self.normal.pop_front())?;
        self.in_flight = Some(item.clone());
        Some(item)
    }

    /// Clear the in-flight slot, returning its occupant.
    pub fn complete(&mut self) -> Option<QueueItem> {
        self.in_flight.take()
    }

    /// The item currently occupying the in-flight slot.
    pub fn in_flight(&self) -> Option<&QueueItem> {
        self.in_flight.as_ref()
    }

    /// Items waiting in both lanes, excluding the in-flight slot.
    pub fn depth(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0 && self.in_flight.is_none()
    }
}
