//! Basic channel programs: Test I/O, No-op, Sense, Set File Mask.

mod common;

use common::{Rig, DEV};
use machine_2314::host_channel::ccw;
use machine_2314::ibm_2844::status;

#[test]
fn test_io_returns_zero_status() {
    let mut rig = Rig::new("tio");
    assert_eq!(rig.sys.chan.test_io(DEV), 0);
}

#[test]
fn nop_ends_channel_and_device_together() {
    let mut rig = Rig::new("nop");
    rig.scrub_csw();
    rig.sys.chan.mem.set_word(0x48, 0x500);
    rig.ccw(0x500, 0x03, 0x600, 0, 1);
    rig.fill(0x600, 4, 0xFF);

    let st = rig.sys.chan.start_io_from_caw(DEV, true, false);
    assert_eq!(st, u16::from(status::CE | status::DE));
    rig.assert_csw(0x508, 0x0C, 0x00, 1);
    // No data moved.
    assert_eq!(rig.word(0x600), 0xFFFF_FFFF);
}

#[test]
fn sense_presents_six_clear_bytes() {
    let mut rig = Rig::new("sense");
    rig.scrub_csw();
    rig.ccw(0x500, 0x04, 0x600, 0, 6);
    rig.fill(0x600, 8, 0xFF);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    rig.assert_csw(0x508, 0x0C, 0x00, 0);
    // Clear but for drive-online and the selected unit number.
    assert_eq!(rig.word(0x600), 0x0000_0040);
    assert_eq!(rig.word(0x604), 0x0100_FFFF);
}

#[test]
fn set_file_mask_accepts_a_good_mask() {
    let mut rig = Rig::new("sfm-ok");
    rig.scrub_csw();
    rig.ccw(0x500, 0x1F, 0x600, 0, 1);
    rig.sys.chan.mem.set_byte(0x600, 0xC0);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    rig.assert_csw(0x508, 0x0C, 0x00, 0);
}

#[test]
fn set_file_mask_rejects_reserved_bits() {
    let mut rig = Rig::new("sfm-bad");
    rig.ccw(0x500, 0x1F, 0x600, 0, 1);
    rig.sys.chan.mem.set_byte(0x600, 0xF0);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE | status::UC));
    rig.assert_csw(0x508, 0x0E, 0x00, 0);

    // Sense shows command reject.
    rig.scrub_csw();
    rig.ccw(0x500, 0x04, 0x600, 0, 6);
    rig.fill(0x600, 8, 0xFF);
    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    assert_eq!(rig.word(0x600), 0x8000_0040);
    assert_eq!(rig.word(0x604), 0x0100_FFFF);
}

#[test]
fn sense_chained_behind_nop() {
    let mut rig = Rig::new("chain");
    rig.scrub_csw();
    rig.ccw(0x500, 0x03, 0x600, ccw::CC, 1);
    rig.ccw(0x508, 0x04, 0x600, 0, 6);
    rig.fill(0x600, 8, 0xFF);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    rig.assert_csw(0x510, 0x0C, 0x00, 0);
    assert_eq!(rig.word(0x600), 0x0000_0040);
}
