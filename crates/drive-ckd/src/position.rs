//! Rotational position states and the synthetic gap patterns.
//!
//! The stored track image holds only home address, count, key and data
//! bytes. Everything else a real read head would see, the gaps and address
//! marks and the running-checksum pair behind each field, is synthesized
//! here as the platter turns.

/// Where the head currently sits within the track's rotational frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// At the index mark, emitting the inter-index gap.
    Index,
    /// In the home address field.
    Ha,
    /// Gap between home address and the R0 count field.
    Gap1,
    /// In a count field (R0's or a later record's).
    Count,
    /// In the address-mark gap before a record's count field.
    Am,
    /// Gap between a count field and its key field.
    Gap2,
    /// In a key field.
    Key,
    /// Gap before a data field.
    Gap3,
    /// In a data field.
    Data,
    /// Past the last record, waiting for index.
    End,
}

/// Byte that closes every gap and resynchronises the read channel.
pub const GAP_SENTINEL: u8 = 0x0E;

/// Gap byte that, when seen with the address-mark search armed, marks a
/// record boundary.
pub const AM_SENTINEL: u8 = 0xAA;

/// Inter-index gap: what the head reads between index and home address.
pub static GAP0: [u8; 37] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, GAP_SENTINEL,
];

/// Inter-field gap (after HA, around key and data fields).
pub static GAP1: [u8; 19] = [
    0xCC, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, GAP_SENTINEL,
];

/// Address-mark gap before each record's count field. The two `0xAA`
/// entries are the address-mark bytes themselves.
pub static AM_GAP: [u8; 31] = [
    0xCC, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, //
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, //
    0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, AM_SENTINEL, AM_SENTINEL, GAP_SENTINEL,
];
