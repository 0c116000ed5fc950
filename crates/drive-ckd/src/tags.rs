//! FT/FC attachment-cable bit assignments.
//!
//! IBM bit numbering: bit 0 is the most significant bit. FT selects how FC
//! is interpreted; FT bit 7 must be up for the drive to listen at all.
//!
//! | FT bit | Mode           | FC carries                                  |
//! |--------|----------------|---------------------------------------------|
//! | 0      | Control        | gates: write, read, seek start, head reset, |
//! |        |                | erase, select head, return home, advance    |
//! | 1      | Set cylinder   | target track number                         |
//! | 2      | Set head+sign  | bit 0 direction, bits 4-7 head number       |
//! | 3      | Set difference | seek delta                                  |
//! | 7      | Select         | (mandatory)                                 |

pub const FT_CONTROL: u8 = 0x80;
pub const FT_SET_CYL: u8 = 0x40;
pub const FT_SET_HEAD: u8 = 0x20;
pub const FT_SET_DIFF: u8 = 0x10;
/// Head advance; doubles as the burst-check gate inside the control unit.
pub const FT_HEAD_ADVANCE: u8 = 0x08;
pub const FT_SELECT: u8 = 0x01;

pub const FC_WRITE_GATE: u8 = 0x80;
pub const FC_READ_GATE: u8 = 0x40;
pub const FC_SEEK_START: u8 = 0x20;
pub const FC_HEAD_RESET: u8 = 0x10;
pub const FC_ERASE_GATE: u8 = 0x08;
pub const FC_SELECT_HEAD: u8 = 0x04;
pub const FC_RETURN_HOME: u8 = 0x02;
pub const FC_HEAD_ADVANCE: u8 = 0x01;

/// File-status byte: selected drive is up to speed and not seeking.
pub const FS_READY: u8 = 0x80;
/// File-status byte: a pack is mounted.
pub const FS_ONLINE: u8 = 0x40;
