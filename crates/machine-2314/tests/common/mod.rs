//! Shared rig for the channel-program tests: a 2844 at address 0x90 with
//! a freshly formatted 2314 (IPL records laid) as drive 1.

// Each test binary uses its own slice of the rig.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use machine_2314::format_ckd::Geometry;
use machine_2314::System;

/// Device address used throughout: control unit 0x90, drive 1.
pub const DEV: u8 = 0x91;

pub struct Rig {
    pub sys: System,
    path: PathBuf,
}

impl Rig {
    pub fn new(name: &str) -> Self {
        static SERIAL: AtomicU32 = AtomicU32::new(0);
        let serial = SERIAL.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "machine-2314-{name}-{}-{serial}.ckd",
            std::process::id()
        ));
        let mut sys = System::new(0x90).expect("bring-up");
        sys.attach_image(1, Geometry::by_name("2314").expect("model"), &path, true)
            .expect("attach");
        Self { sys, path }
    }

    /// Store one CCW (two words) at `addr`.
    pub fn ccw(&mut self, addr: u32, cmd: u8, data: u32, flags: u8, count: u16) {
        let mem = &mut self.sys.chan.mem;
        mem.set_word(addr, u32::from(cmd) << 24 | (data & 0x00FF_FFFF));
        mem.set_word(addr + 4, u32::from(flags) << 24 | u32::from(count));
    }

    /// Fill the CSW with ones so the assertions see every store.
    pub fn scrub_csw(&mut self) {
        self.sys.chan.mem.set_word(0x40, 0xFFFF_FFFF);
        self.sys.chan.mem.set_word(0x44, 0xFFFF_FFFF);
    }

    pub fn fill(&mut self, addr: u32, len: u32, value: u8) {
        for i in 0..len {
            self.sys.chan.mem.set_byte(addr + i, value);
        }
    }

    pub fn put(&mut self, addr: u32, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.sys.chan.mem.set_byte(addr + i as u32, b);
        }
    }

    pub fn bytes(&self, addr: u32, len: u32) -> Vec<u8> {
        (0..len).map(|i| self.sys.chan.mem.byte(addr + i)).collect()
    }

    pub fn word(&self, addr: u32) -> u32 {
        self.sys.chan.mem.word(addr)
    }

    pub fn start_io(&mut self, caw: u32) -> u16 {
        self.sys.chan.start_io(DEV, caw, true, false)
    }

    pub fn assert_csw(&self, next_ccw: u32, status: u8, chan_status: u8, residual: u16) {
        assert_eq!(self.word(0x40), next_ccw, "CSW command address");
        assert_eq!(
            self.word(0x44),
            u32::from(status) << 24 | u32::from(chan_status) << 16 | u32::from(residual),
            "CSW status/residual"
        );
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

/// A seek CCW chain: seek address at `data`, command-chained.
pub fn seek_bytes(cyl: u16, head: u16) -> [u8; 6] {
    [0, 0, (cyl >> 8) as u8, cyl as u8, (head >> 8) as u8, head as u8]
}
