//! Physical strategies
//!
//! A strategy is the symbol-level transport the bus core drives: it
//! knows how to put single bytes and acknowledgement symbols on the
//! medium and how to read them back, and nothing about frames, queues
//! or addressing. The core is oblivious to the encoding; it only
//! relies on serial, ordered byte delivery per call.
//!
//! Two strategies ship with the crate, both for development and
//! testing rather than for a physical medium:
//!
//! - `mock`: a record/playback double for unit tests
//! - `channel`: two in-process endpoints joined by symbol channels

#[cfg(any(test, feature = "strategy-mock"))]
pub mod mock;

#[cfg(any(test, feature = "strategy-channel"))]
pub mod channel;

/// Symbol-level transport consumed by the bus core
///
/// Implementations are free to encode bits however they like (bit-bang
/// timing, oversampling, channels between test devices); the contract
/// is only about byte-granular, in-order delivery. Every operation may
/// block for the duration of a symbol.
pub trait Strategy {
    /// Whether the medium is currently idle, checked before a frame
    /// transmission starts. Implementations without carrier sense can
    /// return `true` unconditionally.
    async fn can_start(&mut self) -> bool;

    /// Transmits one byte synchronously.
    async fn send_byte(&mut self, byte: u8);

    /// Reads one byte; `None` signals a timeout or framing failure.
    async fn receive_byte(&mut self) -> Option<u8>;

    /// Transmits an acknowledgement symbol (`ACK` or `NAK`).
    async fn send_response(&mut self, symbol: u8);

    /// Waits briefly for an acknowledgement symbol after a transmitted
    /// frame; `None` signals a timeout.
    async fn receive_response(&mut self) -> Option<u8>;
}
