//! Wire frame layout
//!
//! A frame is transmitted as:
//!
//! ```text
//! [recipient_id:1][length:1][header:1][addressing...][payload...][crc8:1]
//! ```
//!
//! `length` counts every byte of the frame including the trailing CRC.
//! The addressing block depends on the two low header bits:
//!
//! | shared | sender info | addressing bytes |
//! |--------|-------------|------------------|
//! | 0      | 0           | none             |
//! | 0      | 1           | sender id        |
//! | 1      | 0           | recipient bus id |
//! | 1      | 1           | recipient bus id, sender bus id, sender id |
//!
//! This module owns the header bit definitions, the addressing offset
//! arithmetic and the [`PacketInfo`] metadata extracted from a received
//! frame. Byte buffers themselves live in the queue slots and the
//! device receive scratch; nothing here allocates.

use crate::{BusId, LOCALHOST};

/// Header bit: 1 = shared bus (frame carries bus ids), 0 = local
pub const MODE_BIT: u8 = 0x01;

/// Header bit: 1 = frame carries the sender's device id (and bus id when shared)
pub const SENDER_INFO_BIT: u8 = 0x02;

/// Header bit: 1 = sender requests a synchronous acknowledgement
pub const ACK_REQUEST_BIT: u8 = 0x04;

/// Wire bytes that are not content: recipient id, length, header, CRC
pub const FRAME_OVERHEAD: usize = 4;

/// Offset of the recipient bus id within a shared frame
const RECEIVER_BUS_ID_OFFSET: usize = 3;

/// Offset of the sender bus id within a shared frame carrying sender info
const SENDER_BUS_ID_OFFSET: usize = 7;

/// Whether the frame belongs to a shared bus
pub fn is_shared(header: u8) -> bool {
    header & MODE_BIT != 0
}

/// Whether the frame carries sender identification
pub fn includes_sender_info(header: u8) -> bool {
    header & SENDER_INFO_BIT != 0
}

/// Whether the sender asked for a synchronous acknowledgement
pub fn requests_ack(header: u8) -> bool {
    header & ACK_REQUEST_BIT != 0
}

/// Builds a header byte from the device configuration flags
///
/// The high nibble is reserved and always transmitted as zero.
pub fn compose_header(shared: bool, sender_info: bool, acknowledge: bool) -> u8 {
    let mut header = 0;
    if shared {
        header |= MODE_BIT;
    }
    if sender_info {
        header |= SENDER_INFO_BIT;
    }
    if acknowledge {
        header |= ACK_REQUEST_BIT;
    }
    header
}

/// Size in bytes of the addressing block selected by `header`
pub fn addressing_size(header: u8) -> usize {
    match (is_shared(header), includes_sender_info(header)) {
        (false, false) => 0,
        (false, true) => 1,
        (true, false) => 4,
        (true, true) => 9,
    }
}

/// Offset of the first payload byte within a frame
pub fn payload_offset(header: u8) -> usize {
    3 + addressing_size(header)
}

/// Metadata parsed out of a received frame
///
/// Bus ids and the sender id are only meaningful when the corresponding
/// header flags are set; they stay zeroed otherwise. Retained by the
/// device as `last_packet_info` so a reply can be addressed to the
/// sender of the most recent frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// Header byte of the frame
    pub header: u8,
    /// Recipient device id (byte 0 of the frame)
    pub receiver_id: u8,
    /// Recipient bus id, valid when the frame is shared
    pub receiver_bus_id: BusId,
    /// Sender device id, valid when the frame carries sender info
    pub sender_id: u8,
    /// Sender bus id, valid when the frame is shared and carries sender info
    pub sender_bus_id: BusId,
}

impl PacketInfo {
    /// Parses frame metadata from the receive scratch buffer
    ///
    /// The buffer must span at least the longest addressing block
    /// (12 bytes); the device always hands over its full scratch.
    pub fn parse(frame: &[u8]) -> Self {
        let header = frame[2];
        let mut info = PacketInfo {
            header,
            receiver_id: frame[0],
            receiver_bus_id: LOCALHOST,
            sender_id: 0,
            sender_bus_id: LOCALHOST,
        };

        if is_shared(header) {
            info.receiver_bus_id
                .copy_from_slice(&frame[RECEIVER_BUS_ID_OFFSET..RECEIVER_BUS_ID_OFFSET + 4]);
            if includes_sender_info(header) {
                info.sender_bus_id
                    .copy_from_slice(&frame[SENDER_BUS_ID_OFFSET..SENDER_BUS_ID_OFFSET + 4]);
                info.sender_id = frame[11];
            }
        } else if includes_sender_info(header) {
            info.sender_id = frame[3];
        }

        info
    }
}

/// Writes the addressing block for an outgoing packet
///
/// `content` is the slot buffer; the recipient bus id lands at offset 0
/// when the frame is shared, followed by the sender bus id and sender
/// id when sender info is included. On a local bus only the sender id
/// is written. Returns the number of bytes written, which equals
/// [`addressing_size`] of the matching header.
pub fn write_addressing(
    content: &mut [u8],
    shared: bool,
    sender_info: bool,
    recipient_bus_id: &BusId,
    own_bus_id: &BusId,
    own_device_id: u8,
) -> usize {
    if shared {
        content[0..4].copy_from_slice(recipient_bus_id);
        if sender_info {
            content[4..8].copy_from_slice(own_bus_id);
            content[8] = own_device_id;
            9
        } else {
            4
        }
    } else if sender_info {
        content[0] = own_device_id;
        1
    } else {
        0
    }
}
