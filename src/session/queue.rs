//! Bounded FIFO queues between connection tasks and the tick loop
//!
//! A full queue drops its oldest element: under backpressure, fresh input and
//! fresh state are worth more than stale ones.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::game::{ActionChannel, Command};

/// Multi-producer FIFO with drop-oldest overflow and async wakeup
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    ready: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue an item. Returns the element evicted to make room, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let dropped = {
            let mut items = self.items.lock();
            let dropped = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            dropped
        };
        self.ready.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Wake a consumer waiting in [`BoundedQueue::notified`] without pushing
    pub fn wake(&self) {
        self.ready.notify_one();
    }

    /// Resolves after the next push or wake. A push that happened since the
    /// last wait resolves immediately.
    pub async fn notified(&self) {
        self.ready.notified().await;
    }
}

/// Highest command sequence consumed per action channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessedSequences {
    pub movement: Option<u32>,
    pub fire: Option<u32>,
}

impl ProcessedSequences {
    pub fn get(&self, channel: ActionChannel) -> Option<u32> {
        match channel {
            ActionChannel::Movement => self.movement,
            ActionChannel::Fire => self.fire,
        }
    }

    pub fn record(&mut self, channel: ActionChannel, sequence: u32) {
        let slot = match channel {
            ActionChannel::Movement => &mut self.movement,
            ActionChannel::Fire => &mut self.fire,
        };
        *slot = Some(slot.map_or(sequence, |seen| seen.max(sequence)));
    }

    fn is_new(&self, command: &Command) -> bool {
        self.get(command.action.channel())
            .map_or(true, |seen| command.sequence > seen)
    }
}

/// Ingress queue of client commands
pub struct CommandQueue {
    inner: BoundedQueue<Command>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: BoundedQueue::new(capacity),
        }
    }

    pub fn push(&self, command: Command) -> Option<Command> {
        self.inner.push(command)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) {
        self.inner.clear()
    }

    /// Take the oldest command of each action channel, by sequence number, and
    /// record it as processed.
    ///
    /// Commands at or below the channel's processed sequence are duplicates or
    /// arrived out of order and are discarded. Everything else stays queued
    /// for later ticks.
    pub fn take_per_channel(&self, processed: &mut ProcessedSequences) -> Vec<Command> {
        let mut items = self.inner.items.lock();
        items.retain(|c| processed.is_new(c));

        let mut taken: Vec<Command> = Vec::with_capacity(2);
        for channel in [ActionChannel::Movement, ActionChannel::Fire] {
            let oldest = items
                .iter()
                .enumerate()
                .filter(|(_, c)| c.action.channel() == channel)
                .min_by_key(|(_, c)| c.sequence)
                .map(|(idx, _)| idx);
            if let Some(command) = oldest.and_then(|idx| items.remove(idx)) {
                processed.record(channel, command.sequence);
                taken.push(command);
            }
        }
        taken.sort_by_key(|c| c.sequence);
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::combat::WeaponKind;
    use crate::game::{Action, Vec2};

    fn command(sequence: u32, fire: bool) -> Command {
        let action = if fire {
            Action::Fire {
                weapon: WeaponKind::Rifle,
                direction: Vec2::new(1.0, 0.0),
                claimed_damage: 20.0,
                target: None,
            }
        } else {
            Action::Move {
                displacement: Vec2::new(0.5, 0.0),
            }
        };
        Command {
            session: 1,
            sequence,
            client_tick: 0,
            action,
            received_at_ms: 0,
        }
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = BoundedQueue::new(3);
        for i in 0..3 {
            assert_eq!(queue.push(i), None);
        }
        assert_eq!(queue.push(3), Some(0));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(1));
    }

    #[test]
    fn one_command_per_channel_oldest_first() {
        let queue = CommandQueue::new(16);
        queue.push(command(3, false));
        queue.push(command(1, false));
        queue.push(command(2, true));
        queue.push(command(4, true));

        let mut processed = ProcessedSequences::default();
        let taken = queue.take_per_channel(&mut processed);
        let seqs: Vec<u32> = taken.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(queue.len(), 2);
        assert_eq!(processed.movement, Some(1));

        let taken = queue.take_per_channel(&mut processed);
        let seqs: Vec<u32> = taken.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn replayed_sequences_are_discarded() {
        let queue = CommandQueue::new(16);
        let mut processed = ProcessedSequences {
            movement: Some(5),
            fire: None,
        };
        queue.push(command(5, false));
        queue.push(command(9, false));
        queue.push(command(4, true));
        let taken = queue.take_per_channel(&mut processed);
        let seqs: Vec<u32> = taken.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![4, 9]);
        assert!(queue.is_empty());
    }

    #[test]
    fn later_fire_does_not_swallow_queued_movement() {
        let queue = CommandQueue::new(16);
        let mut processed = ProcessedSequences::default();
        queue.push(command(3, false));
        queue.push(command(4, false));
        queue.push(command(5, true));

        assert_eq!(queue.take_per_channel(&mut processed).len(), 2);
        let taken = queue.take_per_channel(&mut processed);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].sequence, 4);
    }

    #[tokio::test]
    async fn push_wakes_waiting_consumer() {
        let queue = std::sync::Arc::new(BoundedQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(item) = queue.pop() {
                        return item;
                    }
                    queue.notified().await;
                }
            })
        };
        tokio::task::yield_now().await;
        queue.push(42u32);
        assert_eq!(consumer.await.unwrap(), 42);
    }
}
