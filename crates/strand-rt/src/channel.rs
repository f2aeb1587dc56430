use std::collections::VecDeque;

use crate::RuntimeError;

/// Buffered channel polled by generated code.
///
/// Generated code never blocks inside a channel operation: it asks
/// [`Channel::has_space`] or [`Channel::has_contents`] first and yields to the
/// scheduler while the answer is no. An unbuffered channel holds at most one
/// pending value.
#[derive(Debug, Clone)]
pub struct Channel<V> {
    buffer: VecDeque<V>,
    capacity: usize,
    closed: bool,
}

impl<V> Channel<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.max(1)),
            capacity,
            closed: false,
        }
    }

    /// Sends on a closed channel are ready so that they fail promptly.
    pub fn has_space(&self) -> bool {
        self.closed || self.buffer.len() < self.capacity.max(1)
    }

    /// Receives on a closed channel are always ready.
    pub fn has_contents(&self) -> bool {
        self.closed || !self.buffer.is_empty()
    }

    pub fn send(&mut self, value: V) -> Result<(), RuntimeError> {
        if self.closed {
            return Err(RuntimeError::SendOnClosed);
        }
        self.buffer.push_back(value);
        Ok(())
    }

    /// `None` once the channel is closed and drained.
    pub fn receive(&mut self) -> Option<V> {
        self.buffer.pop_front()
    }

    pub fn close(&mut self) -> Result<(), RuntimeError> {
        if self.closed {
            return Err(RuntimeError::CloseOfClosed);
        }
        self.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbuffered_channel_holds_one_pending_value() {
        let mut ch = Channel::new(0);
        assert!(ch.has_space());
        assert!(!ch.has_contents());
        ch.send(7).unwrap();
        assert!(!ch.has_space());
        assert!(ch.has_contents());
        assert_eq!(ch.receive(), Some(7));
        assert_eq!(ch.cap(), 0);
    }

    #[test]
    fn closed_channel_drains_then_reports_none() {
        let mut ch = Channel::new(2);
        ch.send("a").unwrap();
        ch.close().unwrap();
        assert!(ch.has_contents());
        assert_eq!(ch.receive(), Some("a"));
        assert!(ch.has_contents());
        assert_eq!(ch.receive(), None);
        assert_eq!(ch.send("b"), Err(RuntimeError::SendOnClosed));
        assert_eq!(ch.close(), Err(RuntimeError::CloseOfClosed));
    }
}
