//! Multi-master, multi-drop device communications bus over a single
//! shared wire (or one wire pair), for small controllers without heap
//! or preemptive scheduling.
//!
//! A [`Bus`] owns a transmit queue of fixed capacity, a receive scratch
//! buffer and a pluggable symbol-level [`Strategy`]. User code enqueues
//! packets with [`Bus::send`] or [`Bus::send_repeatedly`] and drives
//! the device from its main loop: [`Bus::update`] drains the queue
//! (carrier sense, acknowledgement wait, collision back-off and cubic
//! retry back-off), [`Bus::receive`] decodes one inbound frame and
//! hands accepted payloads to the receive callback. Arbitration is
//! fully symmetric: there is no master, no token and no lock, only
//! carrier sense plus randomized back-off.

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)]

pub mod crc8;
pub mod frame;
pub mod strategies;
mod tx_queue;

use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use crate::tx_queue::{QueueSlot, TxQueue};

pub use crate::frame::PacketInfo;
pub use crate::strategies::Strategy;

/// Device id addressing every device on the bus
pub const BROADCAST: u8 = 0;

/// Device id of a device that has not acquired an id yet
pub const NOT_ASSIGNED: u8 = 255;

/// Acknowledgement symbol confirming a correctly received frame
pub const ACK: u8 = 6;

/// Acknowledgement symbol reporting a corrupted frame
pub const NAK: u8 = 21;

/// Payload byte of an id-probe packet
pub const ACQUIRE_ID: u8 = 63;

/// Longest frame the bus accepts, trailing CRC included
pub const PACKET_MAX_LENGTH: usize = 50;

/// Transmit queue capacity unless overridden per device
pub const DEFAULT_MAX_PACKETS: usize = 10;

/// Send attempts per packet before delivery is abandoned
pub const MAX_ATTEMPTS: u8 = 125;

/// Four-byte identifier of a logical bus on a shared medium
pub type BusId = [u8; 4];

/// Bus id of an unshared (local) bus; elided from the wire
pub const LOCALHOST: BusId = [0, 0, 0, 0];

/// Upper bound of the random startup delay
const INITIAL_MAX_DELAY_MS: u64 = 1000;

/// Upper bound of the random pause after a collision or NAK
const COLLISION_MAX_DELAY_US: u64 = 16;

/// Budget for a full id-acquisition scan
const MAX_ID_SCAN_TIME: Duration = Duration::from_secs(5);

/// Duplex capability of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommunicationMode {
    /// Send-only; carrier sense and acknowledgements are suppressed
    Simplex = 150,
    /// Send and receive with synchronous acknowledgements
    HalfDuplex = 151,
}

/// Frame-level status driving the transmit and receive state machines
///
/// Queue slots also carry one of these; a free slot is simply absent
/// from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Waiting in the queue for its next send attempt
    ToBeSent,
    /// Delivered, or received intact
    Ack,
    /// The receiver saw the frame but its CRC did not check out
    Nak,
    /// The medium was occupied, or an inbound frame was not for us
    Busy,
    /// Wire-level failure: a byte or the acknowledgement never arrived
    Fail,
}

/// Errors surfaced through the device error callback
///
/// `code` preserves the on-bus numeric error identifiers; 103 is
/// reserved (allocation failure cannot occur, content buffers live
/// inside the queue slots).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Retries exhausted for the contained destination id
    ConnectionLost(u8),
    /// No free transmit slot; carries the queue capacity
    PacketsBufferFull(u8),
    /// Composed content would not fit a frame; carries its length
    ContentTooLong(u8),
    /// The id-acquisition scan ended without a usable id
    IdAcquisitionFail,
}

impl BusError {
    /// Numeric error identifier
    pub fn code(&self) -> u8 {
        match self {
            BusError::ConnectionLost(_) => 101,
            BusError::PacketsBufferFull(_) => 102,
            BusError::ContentTooLong(_) => 104,
            BusError::IdAcquisitionFail => 105,
        }
    }

    /// Datum accompanying the error code
    pub fn data(&self) -> u8 {
        match self {
            BusError::ConnectionLost(device_id) => *device_id,
            BusError::PacketsBufferFull(capacity) => *capacity,
            BusError::ContentTooLong(length) => *length,
            BusError::IdAcquisitionFail => 0,
        }
    }
}

/// Reasons an enqueue attempt is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Payload plus addressing exceeds the frame budget
    ContentTooLong(usize),
    /// Every transmit slot is occupied
    BufferFull,
    /// A reply was requested but the last frame named no sender
    UnknownRecipient,
}

/// Callback invoked with the payload and metadata of an accepted frame
pub type ReceiveHandler = fn(payload: &[u8], info: &PacketInfo);

/// Callback invoked when the device reports an error
pub type ErrorHandler = fn(error: BusError);

fn dummy_receive_handler(_payload: &[u8], _info: &PacketInfo) {}

fn dummy_error_handler(_error: BusError) {}

/// One device on the bus
///
/// Generic over its physical [`Strategy`] and the transmit queue
/// capacity. All state is owned by the instance; nothing is shared
/// between devices and no allocation happens after construction.
pub struct Bus<S: Strategy, const MAX_PACKETS: usize = DEFAULT_MAX_PACKETS> {
    strategy: S,
    rng: WyRand,
    device_id: u8,
    bus_id: BusId,
    shared: bool,
    include_sender_info: bool,
    acknowledge: bool,
    auto_delete: bool,
    router: bool,
    mode: CommunicationMode,
    packets: TxQueue<MAX_PACKETS>,
    data: [u8; PACKET_MAX_LENGTH],
    last_packet_info: PacketInfo,
    receiver: ReceiveHandler,
    error: ErrorHandler,
}

impl<S: Strategy, const MAX_PACKETS: usize> Bus<S, MAX_PACKETS> {
    /// Creates an unnumbered local device; pair with
    /// [`acquire_id`](Self::acquire_id) to claim an id autonomously.
    ///
    /// `rng_seed` feeds the jitter generator; any entropy source will
    /// do.
    pub fn new(strategy: S, rng_seed: u64) -> Self {
        Self::with_bus(strategy, LOCALHOST, NOT_ASSIGNED, rng_seed)
    }

    /// Creates a local device with a fixed id
    pub fn with_id(strategy: S, device_id: u8, rng_seed: u64) -> Self {
        Self::with_bus(strategy, LOCALHOST, device_id, rng_seed)
    }

    /// Creates a device on the given bus; shared-network framing is
    /// enabled automatically when the bus id differs from
    /// [`LOCALHOST`].
    pub fn with_bus(strategy: S, bus_id: BusId, device_id: u8, rng_seed: u64) -> Self {
        Self {
            strategy,
            rng: WyRand::seed_from_u64(rng_seed),
            device_id,
            bus_id,
            shared: bus_id != LOCALHOST,
            include_sender_info: false,
            acknowledge: true,
            auto_delete: true,
            router: false,
            mode: CommunicationMode::HalfDuplex,
            packets: TxQueue::new(),
            data: [0; PACKET_MAX_LENGTH],
            last_packet_info: PacketInfo::default(),
            receiver: dummy_receive_handler,
            error: dummy_error_handler,
        }
    }

    /// Sleeps a random fraction of a second before the first
    /// transmission, so cold-booted devices do not all start talking
    /// at the same instant.
    pub async fn begin(&mut self) {
        let delay = self.rng.next_u64() % INITIAL_MAX_DELAY_MS;
        log!(Level::Info, "[{}] joining the bus after {} ms startup delay", self.device_id, delay);
        Timer::after(Duration::from_millis(delay)).await;
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn bus_id(&self) -> BusId {
        self.bus_id
    }

    pub fn set_id(&mut self, device_id: u8) {
        self.device_id = device_id;
    }

    pub fn set_bus_id(&mut self, bus_id: BusId) {
        self.bus_id = bus_id;
    }

    /// Enables or disables bus-id framing on a shared medium
    pub fn set_shared_network(&mut self, shared: bool) {
        self.shared = shared;
    }

    /// Includes the sender id (and bus id when shared) in outgoing
    /// packets so they can be answered with [`reply`](Self::reply)
    pub fn set_sender_info(&mut self, include: bool) {
        self.include_sender_info = include;
    }

    /// Requests a synchronous acknowledgement for every non-broadcast
    /// packet enqueued from now on
    pub fn set_acknowledge(&mut self, acknowledge: bool) {
        self.acknowledge = acknowledge;
    }

    /// Chooses whether delivered and undeliverable one-shot packets
    /// free their slot automatically or stay for inspection
    pub fn set_packet_auto_deletion(&mut self, auto_delete: bool) {
        self.auto_delete = auto_delete;
    }

    /// A router accepts every well-formed frame regardless of
    /// addressing, for bridging or sniffing
    pub fn set_router(&mut self, router: bool) {
        self.router = router;
    }

    pub fn set_communication_mode(&mut self, mode: CommunicationMode) {
        self.mode = mode;
    }

    pub fn set_receiver(&mut self, receiver: ReceiveHandler) {
        self.receiver = receiver;
    }

    pub fn set_error(&mut self, error: ErrorHandler) {
        self.error = error;
    }

    /// The strategy, for inspection or reconfiguration
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.strategy
    }

    /// State of a transmit slot; `None` when the slot is free
    pub fn packet_state(&self, index: usize) -> Option<PacketState> {
        self.packets.get(index).map(|slot| slot.state)
    }

    /// Metadata of the most recent correctly received frame
    pub fn last_packet_info(&self) -> &PacketInfo {
        &self.last_packet_info
    }

    /// Enqueues a one-shot packet for `id` on this device's bus,
    /// returning the occupied slot index
    pub fn send(&mut self, id: u8, payload: &[u8]) -> Result<usize, DispatchError> {
        let bus_id = self.bus_id;
        self.dispatch(id, bus_id, payload, Duration::from_micros(0), 0)
    }

    /// Enqueues a one-shot packet for `id` on another bus
    pub fn send_on_bus(&mut self, id: u8, bus_id: BusId, payload: &[u8]) -> Result<usize, DispatchError> {
        self.dispatch(id, bus_id, payload, Duration::from_micros(0), 0)
    }

    /// Enqueues a packet retransmitted every `period` until removed
    /// with [`remove`](Self::remove)
    pub fn send_repeatedly(&mut self, id: u8, payload: &[u8], period: Duration) -> Result<usize, DispatchError> {
        let bus_id = self.bus_id;
        self.dispatch(id, bus_id, payload, period, 0)
    }

    /// Cyclic variant of [`send_on_bus`](Self::send_on_bus)
    pub fn send_repeatedly_on_bus(&mut self, id: u8, bus_id: BusId, payload: &[u8], period: Duration) -> Result<usize, DispatchError> {
        self.dispatch(id, bus_id, payload, period, 0)
    }

    /// Answers the sender of the last received packet
    ///
    /// Only works when that packet carried sender info; refused
    /// otherwise, because there is nobody to address.
    pub fn reply(&mut self, payload: &[u8]) -> Result<usize, DispatchError> {
        if self.last_packet_info.sender_id == BROADCAST {
            return Err(DispatchError::UnknownRecipient);
        }
        let (sender_id, sender_bus_id) = (self.last_packet_info.sender_id, self.last_packet_info.sender_bus_id);
        self.dispatch(sender_id, sender_bus_id, payload, Duration::from_micros(0), 0)
    }

    /// Composes a packet and places it into the first free transmit
    /// slot
    ///
    /// The addressing block dictated by the device flags is prepended
    /// to `payload`; a zero `custom_header` means the header is
    /// synthesized from the flags as well. `timing` of zero marks a
    /// one-shot packet, anything else the cyclic repetition period.
    /// Refusals are also reported through the error callback.
    pub fn dispatch(
        &mut self,
        id: u8,
        bus_id: BusId,
        payload: &[u8],
        timing: Duration,
        custom_header: u8,
    ) -> Result<usize, DispatchError> {
        let flags_header = frame::compose_header(self.shared, self.include_sender_info, self.acknowledge);
        let header = if custom_header != 0 { custom_header } else { flags_header };

        // The addressing block follows the device flags even under a
        // custom header.
        let prefix = frame::addressing_size(flags_header);
        let length = payload.len() + prefix;
        if length + frame::FRAME_OVERHEAD > PACKET_MAX_LENGTH {
            (self.error)(BusError::ContentTooLong(length as u8));
            return Err(DispatchError::ContentTooLong(length));
        }

        let mut content = [0u8; PACKET_MAX_LENGTH];
        frame::write_addressing(
            &mut content,
            self.shared,
            self.include_sender_info,
            &bus_id,
            &self.bus_id,
            self.device_id,
        );
        content[prefix..prefix + payload.len()].copy_from_slice(payload);

        let slot = QueueSlot {
            state: PacketState::ToBeSent,
            device_id: id,
            header,
            content,
            length,
            attempts: 0,
            registration: Instant::now(),
            timing,
        };

        match self.packets.insert(slot) {
            Some(index) => {
                log!(Level::Trace, "[{}] queued {} byte packet for {} in slot {}", self.device_id, length, id, index);
                Ok(index)
            }
            None => {
                (self.error)(BusError::PacketsBufferFull(MAX_PACKETS as u8));
                Err(DispatchError::BufferFull)
            }
        }
    }

    /// Releases a transmit slot, cancelling a cyclic packet or
    /// dropping a terminal one-shot kept for inspection
    pub fn remove(&mut self, index: usize) {
        self.packets.remove(index);
    }

    /// Walks the transmit queue once and advances every due slot
    ///
    /// Must be called frequently from the application main loop. Slots
    /// are tried in index order; each attempt ends in the slot
    /// recording the frame status, with delivered one-shots removed
    /// (or kept in `Ack` without auto-deletion), cyclic packets
    /// re-armed, and exhausted packets reported as lost - except id
    /// probes, whose exhaustion against a silent id means the id is
    /// free and becomes this device's own.
    pub async fn update(&mut self) {
        for index in 0..MAX_PACKETS {
            let now = Instant::now();
            let Some(slot) = self.packets.get(index) else { continue };

            // Terminal slots wait for the user; everything else retries.
            let terminal = slot.state == PacketState::Ack
                || (slot.state == PacketState::Fail && slot.attempts > MAX_ATTEMPTS);
            if terminal || !slot.is_due(now) {
                continue;
            }

            let status = Self::send_frame(
                &mut self.strategy,
                &mut self.rng,
                self.mode,
                slot.device_id,
                &slot.content[..slot.length],
                slot.header,
            )
            .await;

            match status {
                PacketState::Ack => {
                    let Some(slot) = self.packets.get_mut(index) else { continue };
                    if slot.timing.as_ticks() > 0 {
                        slot.reschedule(Instant::now());
                    } else if self.auto_delete {
                        log!(Level::Trace, "[{}] slot {} delivered and freed", self.device_id, index);
                        self.packets.remove(index);
                    } else {
                        slot.state = PacketState::Ack;
                    }
                }
                PacketState::Fail => {
                    let Some(slot) = self.packets.get_mut(index) else { continue };
                    slot.attempts += 1;
                    slot.state = PacketState::Fail;
                    let attempts = slot.attempts;
                    let prefix = frame::addressing_size(slot.header);
                    let first_payload_byte = if slot.length > prefix { Some(slot.content[prefix]) } else { None };
                    let destination = slot.device_id;
                    let cyclic = slot.timing.as_ticks() > 0;
                    if attempts <= MAX_ATTEMPTS {
                        continue;
                    }

                    if first_payload_byte == Some(ACQUIRE_ID) {
                        // Nobody answered the probe in MAX_ATTEMPTS tries:
                        // the id is unclaimed and now ours.
                        self.device_id = destination;
                        self.packets.remove(index);
                        log!(Level::Info, "[{}] acquired device id after silent probe", self.device_id);
                        continue;
                    }

                    log!(Level::Warn, "[{}] connection to {} lost after {} attempts", self.device_id, destination, MAX_ATTEMPTS);
                    (self.error)(BusError::ConnectionLost(destination));
                    if cyclic {
                        if let Some(slot) = self.packets.get_mut(index) {
                            slot.reschedule(Instant::now());
                        }
                    } else if self.auto_delete {
                        self.packets.remove(index);
                    }
                    // Without auto-deletion the slot stays in Fail with its
                    // attempt budget spent, so it is never retried.
                }
                other => {
                    // Nak and Busy wait for the next pass.
                    if let Some(slot) = self.packets.get_mut(index) {
                        slot.state = other;
                    }
                }
            }
        }
    }

    /// Puts one frame on the wire and interprets the response
    async fn send_frame(
        strategy: &mut S,
        rng: &mut WyRand,
        mode: CommunicationMode,
        id: u8,
        content: &[u8],
        header: u8,
    ) -> PacketState {
        if mode != CommunicationMode::Simplex && !strategy.can_start().await {
            return PacketState::Busy;
        }

        let length = (content.len() + frame::FRAME_OVERHEAD) as u8;
        let mut crc = 0;

        strategy.send_byte(id).await;
        crc = crc8::roll(id, crc);

        strategy.send_byte(length).await;
        crc = crc8::roll(length, crc);

        strategy.send_byte(header).await;
        crc = crc8::roll(header, crc);

        for &byte in content {
            strategy.send_byte(byte).await;
            crc = crc8::roll(byte, crc);
        }

        strategy.send_byte(crc).await;

        // Broadcasts are fire-and-forget: there is no single responder.
        if !frame::requests_ack(header) || id == BROADCAST || mode == CommunicationMode::Simplex {
            return PacketState::Ack;
        }

        match strategy.receive_response().await {
            Some(symbol) if symbol == ACK => PacketState::Ack,
            response => {
                // Random pause to de-synchronize colliding senders
                Timer::after(Duration::from_micros(rng.next_u64() % COLLISION_MAX_DELAY_US)).await;
                if response == Some(NAK) {
                    PacketState::Nak
                } else {
                    PacketState::Fail
                }
            }
        }
    }

    /// Tries to decode one inbound frame
    ///
    /// Returns `Busy` for well-formed traffic that is not addressed to
    /// this device, `Fail` on wire or length errors, `Nak` after a
    /// failed integrity check and `Ack` once a frame has been accepted
    /// and handed to the receive callback.
    pub async fn receive(&mut self) -> PacketState {
        let mut packet_length = PACKET_MAX_LENGTH;
        let mut frame_shared = false;
        let mut ack_requested = false;
        let mut crc = 0;

        let mut index = 0;
        while index < packet_length {
            let Some(byte) = self.strategy.receive_byte().await else {
                return PacketState::Fail;
            };
            self.data[index] = byte;

            if index == 0 && byte != self.device_id && byte != BROADCAST && !self.router {
                return PacketState::Busy;
            }

            if index == 1 {
                if byte > 4 && (byte as usize) < PACKET_MAX_LENGTH {
                    packet_length = byte as usize;
                } else {
                    return PacketState::Fail;
                }
            }

            if index == 2 {
                frame_shared = frame::is_shared(byte);
                ack_requested = frame::requests_ack(byte);
                // Keep private and shared buses apart
                if frame_shared != self.shared && !self.router {
                    return PacketState::Busy;
                }
            }

            // A device id is only unique within one bus: id 1 on bus 1
            // must not take delivery for id 1 on bus 2.
            if self.shared && frame_shared && !self.router && index > 2 && index < 7 && self.bus_id[index - 3] != byte {
                return PacketState::Busy;
            }

            crc = crc8::roll(byte, crc);
            index += 1;
        }

        let info = PacketInfo::parse(&self.data);
        let respond = ack_requested
            && self.data[0] != BROADCAST
            && self.mode != CommunicationMode::Simplex
            && (!self.shared || (frame_shared && info.receiver_bus_id == self.bus_id));

        if crc == 0 {
            self.last_packet_info = info;
            if respond {
                self.strategy.send_response(ACK).await;
            }
            let payload_offset = frame::payload_offset(info.header);
            let payload_length = packet_length.saturating_sub(payload_offset + 1);
            (self.receiver)(&self.data[payload_offset..payload_offset + payload_length], &self.last_packet_info);
            PacketState::Ack
        } else {
            log!(Level::Debug, "[{}] inbound frame failed its integrity check", self.device_id);
            if respond {
                self.strategy.send_response(NAK).await;
            }
            PacketState::Nak
        }
    }

    /// Polls [`receive`](Self::receive) until a frame is accepted or
    /// the duration elapses, returning the final status
    pub async fn receive_for(&mut self, duration: Duration) -> PacketState {
        let deadline = Instant::now() + duration;
        loop {
            let status = self.receive().await;
            if status == PacketState::Ack || Instant::now() >= deadline {
                return status;
            }
        }
    }

    /// Scans for a free device id by probing every candidate
    ///
    /// Each id in 1..=254 is sent a single-byte probe. An acknowledged
    /// probe means the id is taken; a probe that exhausts its attempt
    /// budget unanswered marks a free id, which the device adopts (see
    /// [`update`](Self::update)). The whole scan is bounded in time;
    /// running out of budget or candidates reports
    /// [`BusError::IdAcquisitionFail`].
    pub async fn acquire_id(&mut self) {
        let started = Instant::now();
        let probe = [ACQUIRE_ID];

        for id in 1..NOT_ASSIGNED {
            if started.elapsed() >= MAX_ID_SCAN_TIME {
                break;
            }

            let Ok(slot) = self.send(id, &probe) else {
                break;
            };

            while self.packets.get(slot).is_some() && started.elapsed() < MAX_ID_SCAN_TIME {
                self.update().await;
            }

            if self.device_id != NOT_ASSIGNED {
                return;
            }
        }

        log!(Level::Error, "[{}] id acquisition failed", self.device_id);
        (self.error)(BusError::IdAcquisitionFail);
    }
}
