//! Channel strategy
//!
//! Connects two in-process devices through a pair of symbol channels,
//! so protocol behavior can be exercised end to end without hardware.
//! Each endpoint writes into the peer's inbox and reads from its own;
//! data bytes and acknowledgement symbols travel as distinct wire
//! symbols because the strategy, not the core, owns symbol framing.
//!
//! Carrier sense is approximated by the endpoint's inbox: unread
//! symbols mean the peer is mid-transmission, so `can_start` reports
//! the medium busy.

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};

use super::Strategy;

/// Symbols carried between the two endpoints
pub enum WireSymbol {
    /// One frame byte
    Byte(u8),
    /// An acknowledgement symbol (`ACK` or `NAK`)
    Response(u8),
}

/// Capacity of one endpoint's inbox; comfortably above the longest frame
pub const WIRE_QUEUE_SIZE: usize = 64;

/// Inbox channel joining the two endpoints
pub type WireQueue = Channel<CriticalSectionRawMutex, WireSymbol, WIRE_QUEUE_SIZE>;

/// How long a byte read waits before reporting a framing timeout
const BYTE_TIMEOUT: Duration = Duration::from_millis(50);

/// How long a transmitter waits for the receiver's ACK/NAK
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

/// One endpoint of an in-process wire
pub struct ChannelStrategy {
    outbound: &'static WireQueue,
    inbound: &'static WireQueue,
}

impl ChannelStrategy {
    /// Creates an endpoint writing into `outbound` and reading from
    /// `inbound`. Queues are usually statics:
    ///
    /// ```rust,ignore
    /// static LEFT_INBOX: WireQueue = Channel::new();
    /// static RIGHT_INBOX: WireQueue = Channel::new();
    ///
    /// let (left, right) = ChannelStrategy::pair(&LEFT_INBOX, &RIGHT_INBOX);
    /// ```
    pub const fn with(outbound: &'static WireQueue, inbound: &'static WireQueue) -> Self {
        Self { outbound, inbound }
    }

    /// Builds both endpoints of a wire from the two inbox queues
    pub const fn pair(left_inbox: &'static WireQueue, right_inbox: &'static WireQueue) -> (Self, Self) {
        (Self::with(right_inbox, left_inbox), Self::with(left_inbox, right_inbox))
    }
}

impl Strategy for ChannelStrategy {
    async fn can_start(&mut self) -> bool {
        self.inbound.is_empty()
    }

    async fn send_byte(&mut self, byte: u8) {
        self.outbound.send(WireSymbol::Byte(byte)).await;
    }

    async fn receive_byte(&mut self) -> Option<u8> {
        match select(self.inbound.receive(), Timer::after(BYTE_TIMEOUT)).await {
            Either::First(WireSymbol::Byte(byte)) => Some(byte),
            // A response symbol in the middle of a frame is line noise
            Either::First(WireSymbol::Response(_)) => None,
            Either::Second(()) => None,
        }
    }

    async fn send_response(&mut self, symbol: u8) {
        self.outbound.send(WireSymbol::Response(symbol)).await;
    }

    async fn receive_response(&mut self) -> Option<u8> {
        match select(self.inbound.receive(), Timer::after(RESPONSE_TIMEOUT)).await {
            Either::First(WireSymbol::Response(symbol)) => Some(symbol),
            Either::First(WireSymbol::Byte(_)) => None,
            Either::Second(()) => None,
        }
    }
}
