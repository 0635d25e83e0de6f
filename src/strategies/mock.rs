//! Mock strategy for unit tests
//!
//! A record/playback double in the spirit of `embedded-hal-mock`:
//! every byte and response symbol the core transmits is captured for
//! later inspection, while inbound bytes, response symbols and the
//! carrier state are scripted by the test. All buffers are
//! fixed-capacity, so the mock works without allocation.

use heapless::{Deque, Vec};

use super::Strategy;

/// Capacity of the transmit capture buffer
const CAPTURE_CAPACITY: usize = 2048;

/// Capacity of the scripted inbound byte queue
const INBOUND_CAPACITY: usize = 256;

/// Capacity of the scripted response queue and the response capture
const RESPONSE_CAPACITY: usize = 32;

/// Scriptable strategy double
///
/// Unscripted reads behave like timeouts: `receive_byte` returns
/// `None` on an empty inbound queue and `receive_response` falls back
/// to the configured default symbol (itself `None` unless changed).
pub struct Mock {
    carrier_busy: bool,
    sent: Vec<u8, CAPTURE_CAPACITY>,
    sent_responses: Vec<u8, RESPONSE_CAPACITY>,
    inbound: Deque<u8, INBOUND_CAPACITY>,
    responses: Deque<u8, RESPONSE_CAPACITY>,
    default_response: Option<u8>,
    response_polls: usize,
}

impl Mock {
    pub const fn new() -> Self {
        Self {
            carrier_busy: false,
            sent: Vec::new(),
            sent_responses: Vec::new(),
            inbound: Deque::new(),
            responses: Deque::new(),
            default_response: None,
            response_polls: 0,
        }
    }

    /// Scripts the carrier state reported by `can_start`
    pub fn set_carrier_busy(&mut self, busy: bool) {
        self.carrier_busy = busy;
    }

    /// Queues frame bytes for `receive_byte` to hand out in order
    ///
    /// # Panics
    /// Panics when the scripted bytes exceed the inbound capacity.
    pub fn feed_frame(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.inbound.push_back(*byte).expect("inbound script exceeds capacity");
        }
    }

    /// Scripts one response symbol for a future `receive_response`
    ///
    /// # Panics
    /// Panics when the response script exceeds its capacity.
    pub fn script_response(&mut self, symbol: u8) {
        self.responses.push_back(symbol).expect("response script exceeds capacity");
    }

    /// Sets the symbol returned once the response script runs dry;
    /// `None` (the initial value) behaves like a timeout.
    pub fn set_default_response(&mut self, symbol: Option<u8>) {
        self.default_response = symbol;
    }

    /// Every byte transmitted through `send_byte`, in order
    pub fn sent(&self) -> &[u8] {
        &self.sent
    }

    /// Every symbol transmitted through `send_response`, in order
    pub fn sent_responses(&self) -> &[u8] {
        &self.sent_responses
    }

    /// Number of times the core waited for a response
    pub fn response_polls(&self) -> usize {
        self.response_polls
    }

    /// Drops the capture buffers, keeping the scripts
    pub fn clear_sent(&mut self) {
        self.sent.clear();
        self.sent_responses.clear();
    }
}

impl Default for Mock {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for Mock {
    async fn can_start(&mut self) -> bool {
        !self.carrier_busy
    }

    async fn send_byte(&mut self, byte: u8) {
        self.sent.push(byte).expect("transmit capture exceeds capacity");
    }

    async fn receive_byte(&mut self) -> Option<u8> {
        self.inbound.pop_front()
    }

    async fn send_response(&mut self, symbol: u8) {
        self.sent_responses.push(symbol).expect("response capture exceeds capacity");
    }

    async fn receive_response(&mut self) -> Option<u8> {
        self.response_polls += 1;
        self.responses.pop_front().or(self.default_response)
    }
}
