//! Read family: home address, R0, IPL bootstrap records, count, CKD/KD.

mod common;

use common::{seek_bytes, Rig};
use machine_2314::format_ckd::ipl;
use machine_2314::host_channel::ccw;
use machine_2314::ibm_2844::status;

#[test]
fn read_ha_after_seek() {
    let mut rig = Rig::new("read-ha");
    rig.scrub_csw();
    rig.ccw(0x500, 0x07, 0x600, ccw::CC, 6);
    rig.ccw(0x508, 0x1A, 0x610, 0, 5);
    rig.put(0x600, &seek_bytes(0x10, 5));
    rig.fill(0x610, 8, 0xFF);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    rig.assert_csw(0x510, 0x0C, 0x00, 0);
    assert_eq!(rig.bytes(0x610, 5), [0x00, 0x00, 0x10, 0x00, 0x05]);
    assert_eq!(rig.sys.chan.mem.byte(0x615), 0xFF);
}

#[test]
fn read_r0_returns_count_and_data() {
    let mut rig = Rig::new("read-r0");
    rig.scrub_csw();
    rig.ccw(0x500, 0x07, 0x600, ccw::CC, 6);
    rig.ccw(0x508, 0x16, 0x610, 0, 16);
    rig.put(0x600, &seek_bytes(0x10, 5));
    rig.fill(0x610, 20, 0xFF);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    rig.assert_csw(0x510, 0x0C, 0x00, 0);
    assert_eq!(
        rig.bytes(0x610, 16),
        [0x00, 0x10, 0x00, 0x05, 0x00, 0x00, 0x00, 0x08, 0, 0, 0, 0, 0, 0, 0, 0]
    );
}

#[test]
fn read_ipl_returns_the_bootstrap_data() {
    let mut rig = Rig::new("read-ipl");
    rig.scrub_csw();
    rig.ccw(0x500, 0x02, 0x600, 0, 24);
    rig.fill(0x600, 28, 0xFF);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    rig.assert_csw(0x508, 0x0C, 0x00, 0);
    // IPL1's data area, byte for byte.
    assert_eq!(rig.bytes(0x600, 24), ipl::IPL1_RECORD[4..28]);
}

#[test]
fn read_count_finds_the_first_marked_record() {
    let mut rig = Rig::new("read-count");
    rig.scrub_csw();
    // Drive sits at cylinder 0 head 0 where the IPL records live; the
    // address-mark search passes R0 and lands on IPL1's count.
    rig.ccw(0x500, 0x12, 0x600, 0, 8);
    rig.fill(0x600, 8, 0xFF);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    assert_eq!(rig.bytes(0x600, 8), [0, 0, 0, 0, 1, 4, 0, 24]);
}

#[test]
fn read_count_on_empty_track_is_no_record_found() {
    let mut rig = Rig::new("read-count-empty");
    rig.ccw(0x500, 0x07, 0x600, ccw::CC, 6);
    rig.ccw(0x508, 0x12, 0x610, 0, 8);
    rig.put(0x600, &seek_bytes(0x10, 5));

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE | status::UC));

    rig.ccw(0x500, 0x04, 0x600, 0, 6);
    rig.fill(0x600, 8, 0xFF);
    assert_eq!(rig.start_io(0x500), u16::from(status::CE | status::DE));
    // No-record-found in sense byte 1.
    assert_eq!(rig.word(0x600), 0x0008_0040);
}

#[test]
fn chained_read_kd_walks_the_ipl_records() {
    let mut rig = Rig::new("read-kd-chain");
    rig.scrub_csw();
    rig.ccw(0x500, 0x0E, 0x600, ccw::CC, 28);
    rig.ccw(0x508, 0x0E, 0x640, ccw::CC, 148);
    rig.ccw(0x510, 0x0E, 0x700, 0, 84);
    rig.fill(0x600, 0x200, 0xEE);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    rig.assert_csw(0x518, 0x0C, 0x00, 0);
    // R1 = IPL1 key+data, R2 = IPL2 key + zero data, R3 = the VOL1 label.
    assert_eq!(rig.bytes(0x600, 28), ipl::IPL1_RECORD);
    assert_eq!(rig.bytes(0x640, 4), ipl::IPL2_KEY);
    assert!(rig.bytes(0x644, 144).iter().all(|&b| b == 0));
    assert_eq!(rig.bytes(0x700, 84), ipl::VOL1_RECORD);
}

#[test]
fn read_ckd_includes_the_count_field() {
    let mut rig = Rig::new("read-ckd");
    rig.scrub_csw();
    rig.ccw(0x500, 0x1E, 0x600, 0, 36);
    rig.fill(0x600, 40, 0xFF);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    assert_eq!(rig.bytes(0x600, 8), [0, 0, 0, 0, 1, 4, 0, 24]);
    assert_eq!(rig.bytes(0x608, 28), ipl::IPL1_RECORD);
}

#[test]
fn short_read_sets_incorrect_length() {
    let mut rig = Rig::new("read-short");
    rig.scrub_csw();
    // Ask for more than IPL1's data holds.
    rig.ccw(0x500, 0x02, 0x600, 0, 32);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    // Residual 8 with the incorrect-length flag in the channel status.
    rig.assert_csw(0x508, 0x0C, 0x02, 8);
}

#[test]
fn short_read_with_sli_stays_clean() {
    let mut rig = Rig::new("read-sli");
    rig.scrub_csw();
    rig.ccw(0x500, 0x02, 0x600, ccw::SLI, 32);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    rig.assert_csw(0x508, 0x0C, 0x00, 8);
}

#[test]
fn skip_flag_reads_without_storing() {
    let mut rig = Rig::new("read-skip");
    rig.scrub_csw();
    rig.ccw(0x500, 0x02, 0x600, ccw::SKIP, 24);
    rig.fill(0x600, 28, 0xFF);

    let st = rig.start_io(0x500);
    assert_eq!(st, u16::from(status::CE | status::DE));
    assert_eq!(rig.word(0x600), 0xFFFF_FFFF);
}
