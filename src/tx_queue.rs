//! Transmit queue
//!
//! Fixed pool of outgoing packet slots. A slot owns its content buffer
//! (addressing block plus payload, already composed at enqueue time)
//! and the delivery bookkeeping the scheduler needs: attempt counter,
//! registration instant and the cyclic repetition period. A free slot
//! is simply `None`; occupied slots keep their terminal state until
//! removed or recycled.

use embassy_time::{Duration, Instant};

use crate::{PacketState, PACKET_MAX_LENGTH};

/// One entry of the transmit queue
pub(crate) struct QueueSlot {
    /// Scheduler state, starts at `ToBeSent` and tracks the last send outcome
    pub(crate) state: PacketState,
    /// Destination device id
    pub(crate) device_id: u8,
    /// Header byte fixed at enqueue time
    pub(crate) header: u8,
    /// Addressing block and payload
    pub(crate) content: [u8; PACKET_MAX_LENGTH],
    /// Valid bytes in `content`
    pub(crate) length: usize,
    /// Failed send attempts so far
    pub(crate) attempts: u8,
    /// Instant of enqueue, or of the last cyclic reschedule
    pub(crate) registration: Instant,
    /// Cyclic repetition period; zero marks a one-shot packet
    pub(crate) timing: Duration,
}

impl QueueSlot {
    /// Retry back-off on top of the base period: the cube of the
    /// attempt counter, in microseconds. Consecutive retries space
    /// themselves by 0, 1, 8, 27, 64... past registration.
    fn backoff(&self) -> Duration {
        Duration::from_micros((self.attempts as u64).pow(3))
    }

    /// Whether the scheduler should try this slot now
    pub(crate) fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.registration) > self.timing + self.backoff()
    }

    /// Re-arms a cyclic slot after a completed delivery cycle
    pub(crate) fn reschedule(&mut self, now: Instant) {
        self.attempts = 0;
        self.registration = now;
        self.state = PacketState::ToBeSent;
    }
}

/// Fixed-capacity transmit queue
pub(crate) struct TxQueue<const MAX_PACKETS: usize> {
    slots: [Option<QueueSlot>; MAX_PACKETS],
}

impl<const MAX_PACKETS: usize> TxQueue<MAX_PACKETS> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PACKETS],
        }
    }

    /// Places a packet into the first free slot, returning its index,
    /// or `None` when every slot is occupied.
    pub(crate) fn insert(&mut self, slot: QueueSlot) -> Option<usize> {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(slot);
                return Some(index);
            }
        }
        None
    }

    pub(crate) fn get(&self, index: usize) -> Option<&QueueSlot> {
        self.slots.get(index).and_then(|entry| entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut QueueSlot> {
        self.slots.get_mut(index).and_then(|entry| entry.as_mut())
    }

    /// Releases a slot; a no-op when the slot is already free.
    pub(crate) fn remove(&mut self, index: usize) {
        if let Some(entry) = self.slots.get_mut(index) {
            *entry = None;
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    /// Synthetic epoch so due-time checks do not depend on the test
    /// process uptime.
    fn epoch() -> Instant {
        Instant::from_ticks(0)
    }

    fn slot_with(attempts: u8, timing: Duration) -> QueueSlot {
        QueueSlot {
            state: PacketState::ToBeSent,
            device_id: 99,
            header: 0x04,
            content: [0; PACKET_MAX_LENGTH],
            length: 1,
            attempts,
            registration: epoch(),
            timing,
        }
    }

    #[test]
    fn test_insert_fills_lowest_free_slot() {
        let mut queue: TxQueue<3> = TxQueue::new();
        assert_eq!(queue.insert(slot_with(0, Duration::from_micros(0))), Some(0));
        assert_eq!(queue.insert(slot_with(0, Duration::from_micros(0))), Some(1));
        queue.remove(0);
        // The freed low slot is reused before the remaining one
        assert_eq!(queue.insert(slot_with(0, Duration::from_micros(0))), Some(0));
        assert_eq!(queue.insert(slot_with(0, Duration::from_micros(0))), Some(2));
        assert_eq!(queue.insert(slot_with(0, Duration::from_micros(0))), None);
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut queue: TxQueue<2> = TxQueue::new();
        let index = queue.insert(slot_with(0, Duration::from_micros(0))).unwrap();
        assert!(queue.get(index).is_some());
        queue.remove(index);
        assert!(queue.get(index).is_none());
        // Removing twice or out of range is harmless
        queue.remove(index);
        queue.remove(17);
    }

    #[test]
    fn test_backoff_grows_with_the_cube_of_attempts() {
        // 100 attempts put the retry a full second past registration
        let slot = slot_with(100, Duration::from_micros(0));
        assert!(!slot.is_due(epoch() + Duration::from_millis(500)));
        assert!(slot.is_due(epoch() + Duration::from_millis(1500)));

        // One more attempt pushes the window out by roughly 30 ms
        let slot = slot_with(101, Duration::from_micros(0));
        assert!(!slot.is_due(epoch() + Duration::from_millis(1015)));
        assert!(slot.is_due(epoch() + Duration::from_millis(1031)));
    }

    #[test]
    fn test_cyclic_period_delays_next_send() {
        let slot = slot_with(0, Duration::from_secs(1));
        assert!(!slot.is_due(epoch() + Duration::from_millis(999)));
        assert!(slot.is_due(epoch() + Duration::from_millis(1001)));
    }

    #[test]
    fn test_reschedule_rearms_slot() {
        let mut slot = slot_with(17, Duration::from_micros(250));
        slot.state = PacketState::Ack;
        let now = epoch() + Duration::from_secs(5);
        slot.reschedule(now);
        assert_eq!(slot.state, PacketState::ToBeSent);
        assert_eq!(slot.attempts, 0);
        assert!(!slot.is_due(now));
        assert!(slot.is_due(now + Duration::from_micros(251)));
    }
}
