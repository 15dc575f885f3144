use crate::device::params::OobCommand;
use crate::error::{DmxError, Result};
use log::error;
use std::collections::VecDeque;

/// A record of the raw-input command ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DvrCommand {
    /// Hand the next `n` buffered input bytes to the engine
    Feed(usize),
    Oob(OobCommand),
}

/// Fixed-capacity FIFO of input commands.
///
/// Like the byte rings it keeps one slot free, so `slots - 1` commands fit.
/// Adjacent feed commands are merged when queued.
#[derive(Debug)]
pub(crate) struct CommandRing {
    commands: VecDeque<DvrCommand>,
    slots: usize,
}

impl CommandRing {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(2);
        Self {
            commands: VecDeque::with_capacity(slots - 1),
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots - 1
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.commands.len() >= self.capacity()
    }

    /// Whether a feed can be queued, either in a free slot or merged into a
    /// trailing feed.
    pub fn can_push_feed(&self) -> bool {
        !self.is_full() || matches!(self.commands.back(), Some(DvrCommand::Feed(_)))
    }

    /// Queues `count` freshly written bytes, merging with a trailing feed.
    ///
    /// # Errors
    ///
    /// [`DmxError::CommandOverflow`] when the ring is full and the last
    /// command is not a feed.
    pub fn push_feed(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if let Some(DvrCommand::Feed(pending)) = self.commands.back_mut() {
            *pending += count;
            return Ok(());
        }
        if self.is_full() {
            error!("dvr command ring overflow, feed of {} bytes refused", count);
            return Err(DmxError::CommandOverflow);
        }
        self.commands.push_back(DvrCommand::Feed(count));
        Ok(())
    }

    pub fn push_oob(&mut self, command: OobCommand) -> Result<()> {
        if self.is_full() {
            return Err(DmxError::CommandOverflow);
        }
        self.commands.push_back(DvrCommand::Oob(command));
        Ok(())
    }

    pub fn pop(&mut self) -> Option<DvrCommand> {
        self.commands.pop_front()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_feeds_coalesce() {
        let mut ring = CommandRing::new(4);
        ring.push_feed(188).unwrap();
        ring.push_feed(376).unwrap();
        assert_eq!(ring.len(), 1);
        ring.push_oob(OobCommand::Marker(7)).unwrap();
        ring.push_feed(188).unwrap();

        assert_eq!(ring.pop(), Some(DvrCommand::Feed(564)));
        assert_eq!(ring.pop(), Some(DvrCommand::Oob(OobCommand::Marker(7))));
        assert_eq!(ring.pop(), Some(DvrCommand::Feed(188)));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut ring = CommandRing::new(3);
        ring.push_oob(OobCommand::Marker(1)).unwrap();
        ring.push_oob(OobCommand::Marker(2)).unwrap();
        assert!(ring.is_full());
        assert!(matches!(
            ring.push_oob(OobCommand::Eos),
            Err(DmxError::CommandOverflow)
        ));
        assert!(matches!(ring.push_feed(10), Err(DmxError::CommandOverflow)));

        // a trailing feed still absorbs more bytes when full
        ring.pop();
        ring.push_feed(10).unwrap();
        ring.push_feed(5).unwrap();
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_feed_room() {
        let mut ring = CommandRing::new(2);
        assert!(ring.can_push_feed());
        ring.push_oob(OobCommand::Marker(1)).unwrap();
        assert!(!ring.can_push_feed());

        ring.pop();
        ring.push_feed(188).unwrap();
        assert!(ring.is_full());
        assert!(ring.can_push_feed());
    }

    #[test]
    fn test_zero_feed_is_ignored() {
        let mut ring = CommandRing::new(4);
        ring.push_feed(0).unwrap();
        assert!(ring.is_empty());
    }

    #[quickcheck]
    fn prop_feeds_preserve_bytes(ops: Vec<Option<u16>>) -> bool {
        let mut ring = CommandRing::new(ops.len() + 2);
        let mut pushed = 0usize;
        for op in &ops {
            match op {
                Some(n) => {
                    ring.push_feed(*n as usize).unwrap();
                    pushed += *n as usize;
                }
                None => ring.push_oob(OobCommand::Eos).unwrap(),
            }
        }

        let mut fed = 0usize;
        let mut last_was_feed = false;
        while let Some(command) = ring.pop() {
            match command {
                DvrCommand::Feed(n) => {
                    if last_was_feed {
                        return false;
                    }
                    fed += n;
                    last_was_feed = true;
                }
                DvrCommand::Oob(_) => last_was_feed = false,
            }
        }
        fed == pushed
    }
}
