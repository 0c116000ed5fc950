//! The 2844 register bank.
//!
//! Thirty-odd single-byte registers addressable from microcode by the CA
//! (source) and CD (destination) fields, plus the 12-bit ROS address
//! register WX. Bits follow IBM numbering: bit 0 is the most significant.

/// IBM bit positions within a byte.
pub const BIT0: u8 = 0x80;
pub const BIT1: u8 = 0x40;
pub const BIT2: u8 = 0x20;
pub const BIT3: u8 = 0x10;
pub const BIT4: u8 = 0x08;
pub const BIT5: u8 = 0x04;
pub const BIT6: u8 = 0x02;
pub const BIT7: u8 = 0x01;

/// ST: end of track reached.
pub const ST_END_TRACK: u8 = BIT0;
/// ST: index latch enable; with it up the index pulse is observable.
pub const ST_INDEX: u8 = BIT1;
/// ST: data movement in progress.
pub const ST_DATA_MOVE: u8 = BIT2;
/// ST: ALU carry latch.
pub const ST_CARRY: u8 = BIT3;
/// ST: serdes ready; a byte sits in DR (read) or DR was consumed (write).
pub const ST_SERDES: u8 = BIT4;
/// ST: operation in progress.
pub const ST_OP: u8 = BIT5;
/// ST: ending state reached.
pub const ST_ENDING: u8 = BIT6;
/// ST: spare.
pub const ST_MISC: u8 = BIT7;

/// IG: write latch; the channel side keeps asking the host for bytes.
pub const IG_WRITE: u8 = BIT0;
/// IG: drop operational-in at the next channel cycle.
pub const IG_DROP_OPR_IN: u8 = BIT1;
/// IG: read latch; bytes placed in DW flow to the host.
pub const IG_READ: u8 = BIT2;
/// IG: queued; request the channel when free.
pub const IG_QUEUED: u8 = BIT3;
/// IG: poll enable; drive attention may request the channel.
pub const IG_POLL: u8 = BIT4;
/// IG: status-in latch; DW holds a status byte to present.
pub const IG_STATUS: u8 = BIT5;
/// IG: present device end.
pub const IG_DEV_END: u8 = BIT6;
/// IG: address-in latch; DW holds the device address.
pub const IG_ADR_IN: u8 = BIT7;

/// ER: error during read/write; cleared when operational-in rises.
pub const ER_RW: u8 = BIT0;
/// ER: follows the address-out line.
pub const ER_ADR_OUT: u8 = BIT1;
/// ER: bus-out parity error.
pub const ER_PARITY: u8 = BIT2;
/// ER: short-busy presented.
pub const ER_SHORT_BUSY: u8 = BIT3;
/// ER: parity error on the ALU bus.
pub const ER_ALU_PARITY: u8 = BIT4;
/// ER: halt I/O received.
pub const ER_HALT: u8 = BIT7;

/// The register bank shared by the ROS engine and the command sequencer.
#[derive(Debug, Clone, Default)]
pub struct Registers {
    /// Command code under execution.
    pub op: u8,
    /// Data write register: the byte driven onto bus-in.
    pub dw: u8,
    /// Unit address register.
    pub ur: u8,
    /// Burst-check register (even bytes).
    pub bx: u8,
    /// B-side scratch register.
    pub by: u8,
    /// Data length high.
    pub dh: u8,
    /// Data length low.
    pub dl: u8,
    /// Flag register; holds the file mask.
    pub fr: u8,
    /// Gap length scratch.
    pub gl: u8,
    /// Key length register.
    pub kl: u8,
    /// Burst-check register (odd bytes).
    pub cx: u8,
    /// Scratch.
    pub sp: u8,
    /// Scratch (high).
    pub wh: u8,
    /// Scratch (low).
    pub wl: u8,
    /// Byte counter scratch.
    pub bc: u8,
    /// Error latches.
    pub er: u8,
    /// General purpose register.
    pub gp: u8,
    /// Gated attention flags, one bit per drive (`0x80 >> unit`).
    pub sc: u8,
    /// Channel-control latches.
    pub ig: u8,
    /// Data read register: the serdes byte.
    pub dr: u8,
    /// Status bits.
    pub st: u8,
    /// IE gate.
    pub ie: u8,
    /// File tag register on the drive cable.
    pub ft: u8,
    /// File control register on the drive cable.
    pub fc: u8,
    /// ROS address register.
    pub wx: u16,
}

impl Registers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
