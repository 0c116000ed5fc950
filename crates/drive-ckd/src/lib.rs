//! 2311/2314-class CKD disk drive mechanism.
//!
//! Emulates one spindle behind the storage-control attachment cable: the
//! backing image file, a cylinder-sized buffer, head positioning, and the
//! rotational byte stream the control unit serializes from. Control
//! signals arrive as the FT/FC register pair; data moves one byte at a
//! time through [`CkdDrive::read_byte`] / [`CkdDrive::write_byte`].
//!
//! The platter turns continuously: every call advances the rotational
//! state machine, but only every `rate`-th call lands on a byte boundary,
//! and only home-address/count/key/data bytes (plus the checksum pair and
//! the gap sentinel that closes each gap) are presented as valid.

pub mod position;
pub mod tags;

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use format_ckd::{build_cylinder, Geometry, Header, END_OF_TRACK, HEADER_SIZE};
use position::{Position, AM_GAP, AM_SENTINEL, GAP0, GAP1, GAP_SENTINEL};

/// Ticks from seek start to seek complete.
pub const SEEK_TICKS: u64 = 50;

#[derive(Debug)]
pub enum DriveError {
    /// Backing file could not be opened, read or written.
    Io(std::io::Error),
    /// The file exists but is not a usable image.
    Format(format_ckd::FormatError),
    /// The file length disagrees with the header's geometry.
    SizeMismatch { expected: u64, actual: u64 },
    /// Operation needs an attached image.
    NotAttached,
}

impl fmt::Display for DriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "image i/o failed: {e}"),
            Self::Format(e) => write!(f, "bad image: {e}"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "image is {actual} bytes, geometry needs {expected}")
            }
            Self::NotAttached => write!(f, "no image attached"),
        }
    }
}

impl std::error::Error for DriveError {}

impl From<std::io::Error> for DriveError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<format_ckd::FormatError> for DriveError {
    fn from(e: format_ckd::FormatError) -> Self {
        Self::Format(e)
    }
}

/// What [`CkdDrive::attach`] did with the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Existing image loaded.
    Attached,
    /// Fresh image written (missing file, bad magic, or init requested).
    Formatted,
}

/// One byte time of the rotational stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteEvent {
    /// Reading: a byte was presented. Writing: the host byte was consumed.
    pub valid: bool,
    /// The byte read (or echoed back while writing).
    pub data: u8,
    /// This byte time carried the address-mark sentinel.
    pub am: bool,
    /// The index point passed during this call.
    pub index: bool,
}

enum Mode {
    /// Keep the platter turning; no transfer.
    Free,
    Read,
    Write(u8),
}

/// One CKD drive.
pub struct CkdDrive {
    geometry: &'static Geometry,
    file: Option<File>,
    path: Option<PathBuf>,

    /// Cylinder buffer mirroring the file.
    cbuf: Vec<u8>,
    loaded_cyl: Option<u16>,
    dirty: bool,
    /// A media transfer failed; drive drops ready until re-attach.
    io_failed: bool,

    cyl: u16,
    ncyl: u16,
    head: u32,
    /// Seek direction from the set-head-and-sign tag (false = forward).
    dir: bool,
    diff: u8,
    attn: bool,
    seeking: bool,
    seek_request: bool,
    am_search: bool,
    /// Erase gate latched from the control tag: format writes truncate the
    /// track behind themselves.
    erase_gate: bool,
    /// The field currently passing under the head took written bytes.
    wrote_field: bool,

    /// Offset of the current track inside the cylinder buffer.
    tstart: usize,
    /// Offset of the current record's count field within the track.
    rpos: usize,
    /// Offset of the current data byte within the track.
    tpos: usize,
    /// Angular position, 0..=bpt; -1 transiently at index.
    cpos: i32,
    state: Position,
    /// Byte index within the current position state.
    count: usize,
    klen: u8,
    dlen: u16,
    /// Running XOR of even/odd field bytes.
    ck_sum: [u8; 2],
    /// Sub-byte tick divider.
    step: u8,
}

impl CkdDrive {
    #[must_use]
    pub fn new(geometry: &'static Geometry) -> Self {
        Self {
            geometry,
            file: None,
            path: None,
            cbuf: Vec::new(),
            loaded_cyl: None,
            dirty: false,
            io_failed: false,
            cyl: 0,
            ncyl: 0,
            head: 0,
            dir: false,
            diff: 0,
            attn: false,
            seeking: false,
            seek_request: false,
            am_search: false,
            erase_gate: false,
            wrote_field: false,
            tstart: 0,
            rpos: 0,
            tpos: 0,
            cpos: 0,
            state: Position::Index,
            count: 0,
            klen: 0,
            dlen: 0,
            ck_sum: [0xFF, 0xFF],
            step: 0,
        }
    }

    /// Open (or create) a backing image.
    ///
    /// An existing file with a valid header is adopted, taking its geometry
    /// from the header. A missing file, a file without the CKD magic, or
    /// `init = true` produces a freshly formatted image; `init` also lays
    /// down the IPL bootstrap records.
    pub fn attach<P: AsRef<Path>>(
        &mut self,
        path: P,
        init: bool,
    ) -> Result<AttachOutcome, DriveError> {
        let path = path.as_ref();
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if init => {
                drop(e);
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?
            }
            Err(e) => return Err(e.into()),
        };
        self.file = Some(file);
        self.path = Some(path.to_path_buf());

        let mut block = [0u8; HEADER_SIZE];
        let header_ok = {
            let file = self.file.as_mut().ok_or(DriveError::NotAttached)?;
            file.seek(SeekFrom::Start(0))?;
            matches!(file.read_exact(&mut block), Ok(()))
        };

        let outcome = if init || !header_ok || &block[0..8] != format_ckd::MAGIC {
            self.format(init)?;
            AttachOutcome::Formatted
        } else {
            let geometry = match Header::parse(&block) {
                Ok((_, geometry)) => geometry,
                Err(e) => {
                    self.file = None;
                    return Err(e.into());
                }
            };
            self.geometry = geometry;
            let file = self.file.as_mut().ok_or(DriveError::NotAttached)?;
            let actual = file.seek(SeekFrom::End(0))?;
            if actual != geometry.image_size() {
                let expected = geometry.image_size();
                self.file = None;
                return Err(DriveError::SizeMismatch { expected, actual });
            }
            AttachOutcome::Attached
        };

        self.cbuf = vec![0; self.geometry.cylinder_size() as usize];
        self.loaded_cyl = None;
        self.dirty = false;
        self.io_failed = false;
        self.cyl = 0;
        self.head = 0;
        self.tstart = 0;
        self.reset_rotation();
        self.load_cylinder()?;
        Ok(outcome)
    }

    /// Flush any dirty cylinder and release the backing file.
    pub fn detach(&mut self) -> Result<(), DriveError> {
        if self.dirty {
            self.flush_cylinder()?;
        }
        self.file = None;
        self.path = None;
        self.cbuf.clear();
        self.loaded_cyl = None;
        Ok(())
    }

    /// Write a fresh image: header plus every track formatted with HA, a
    /// standard R0 and the end-of-track marker; `ipl` adds the bootstrap
    /// records on cylinder 0 head 0.
    pub fn format(&mut self, ipl: bool) -> Result<(), DriveError> {
        let geometry = self.geometry;
        let file = self.file.as_mut().ok_or(DriveError::NotAttached)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&Header::new(geometry).to_bytes())?;
        for cyl in 0..=geometry.cyls {
            file.write_all(&build_cylinder(geometry, cyl, ipl && cyl == 0))?;
        }
        file.flush()?;
        self.loaded_cyl = None;
        self.dirty = false;
        self.cyl = 0;
        Ok(())
    }

    /// Latch the FT/FC pair from the attachment cable.
    ///
    /// Ignored unless the select bit is up. The four sub-commands follow
    /// the 2311 cable: control gates, set cylinder, set head and sign, set
    /// difference.
    pub fn set_tags(&mut self, ft: u8, fc: u8) {
        if ft & tags::FT_SELECT == 0 {
            return;
        }
        if ft & tags::FT_CONTROL != 0 {
            if fc & tags::FC_READ_GATE != 0 {
                self.attn = false;
                self.am_search =
                    fc & (tags::FC_SELECT_HEAD | tags::FC_HEAD_ADVANCE)
                        == (tags::FC_SELECT_HEAD | tags::FC_HEAD_ADVANCE);
            }
            self.erase_gate = fc & tags::FC_ERASE_GATE != 0;
            if fc & tags::FC_SEEK_START != 0 {
                self.seek_request = true;
                self.seeking = true;
            }
            if fc & tags::FC_RETURN_HOME != 0 {
                self.ncyl = 0;
                self.cyl = 0;
                self.head = 0;
                self.seeking = false;
                self.attn = false;
            }
        }
        if ft & tags::FT_SET_CYL != 0 {
            self.ncyl = u16::from(fc);
        }
        if ft & tags::FT_SET_HEAD != 0 {
            // Five head bits: the 2314 carries twenty heads per cylinder.
            self.dir = fc & 0x80 != 0;
            self.head = u32::from(fc & 0x1F);
        }
        if ft & tags::FT_SET_DIFF != 0 {
            self.diff = fc;
        }
    }

    /// Take the pending start-seek request, if any. The owner schedules
    /// the completion and calls [`CkdDrive::finish_seek`] when it fires.
    pub fn take_seek_request(&mut self) -> bool {
        std::mem::take(&mut self.seek_request)
    }

    /// Seek mechanism arrived: adopt the target cylinder, raise attention.
    pub fn finish_seek(&mut self) {
        self.cyl = self.ncyl;
        self.seeking = false;
        self.attn = true;
    }

    /// Drive attention (seek complete, not yet acknowledged).
    #[must_use]
    pub fn check_attn(&self) -> bool {
        self.attn
    }

    /// Cylinder the heads currently sit on, as the old-address tap.
    #[must_use]
    pub fn cur_cyl(&self) -> u8 {
        self.cyl as u8
    }

    /// File-status byte: online / ready, as sampled by the control unit.
    #[must_use]
    pub fn status(&self) -> u8 {
        let mut fs = 0;
        if self.file.is_some() {
            fs |= tags::FS_ONLINE;
            if !self.seeking && !self.io_failed {
                fs |= tags::FS_READY;
            }
        }
        fs
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.file.is_some()
    }

    #[must_use]
    pub fn cyl(&self) -> u16 {
        self.cyl
    }

    #[must_use]
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Seek direction latched from the set-head-and-sign tag.
    #[must_use]
    pub fn seek_direction(&self) -> bool {
        self.dir
    }

    /// Difference register latched from the set-difference tag.
    #[must_use]
    pub fn seek_difference(&self) -> u8 {
        self.diff
    }

    /// Backing file, when attached.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn geometry(&self) -> &'static Geometry {
        self.geometry
    }

    /// Keep a deselected drive turning. Returns true when the index point
    /// passes.
    pub fn step(&mut self) -> bool {
        self.rotate(&Mode::Free).index
    }

    /// Read one byte time off the platter.
    pub fn read_byte(&mut self) -> ByteEvent {
        self.sync_cylinder();
        self.rotate(&Mode::Read)
    }

    /// Write one byte time; `valid` on the result reports whether the host
    /// byte was consumed into the current field.
    pub fn write_byte(&mut self, data: u8) -> ByteEvent {
        self.sync_cylinder();
        self.rotate(&Mode::Write(data))
    }

    fn reset_rotation(&mut self) {
        self.state = Position::Index;
        self.cpos = 0;
        self.tpos = 0;
        self.rpos = 0;
        self.count = 0;
        self.step = 0;
        self.ck_sum = [0xFF, 0xFF];
        self.am_search = false;
    }

    /// Bring the buffer in line with the current cylinder before a
    /// transfer. Media failures drop ready rather than surfacing an error
    /// mid-rotation.
    fn sync_cylinder(&mut self) {
        if self.loaded_cyl != Some(self.cyl) && self.file.is_some() {
            if self.dirty && self.flush_cylinder().is_err() {
                self.io_failed = true;
            }
            if self.load_cylinder().is_err() {
                self.io_failed = true;
            }
            self.tstart = self.track_size() * self.head as usize;
        }
    }

    fn track_size(&self) -> usize {
        self.geometry.track_size() as usize
    }

    fn cylinder_offset(&self, cyl: u16) -> u64 {
        HEADER_SIZE as u64 + u64::from(self.geometry.cylinder_size()) * u64::from(cyl)
    }

    fn load_cylinder(&mut self) -> Result<(), DriveError> {
        let offset = self.cylinder_offset(self.cyl);
        let file = self.file.as_mut().ok_or(DriveError::NotAttached)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut self.cbuf)?;
        self.loaded_cyl = Some(self.cyl);
        self.dirty = false;
        Ok(())
    }

    fn flush_cylinder(&mut self) -> Result<(), DriveError> {
        if let Some(cyl) = self.loaded_cyl {
            let offset = self.cylinder_offset(cyl);
            let file = self.file.as_mut().ok_or(DriveError::NotAttached)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&self.cbuf)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Advance one sub-tick of rotation; every `rate`-th call is a byte
    /// time and runs the position state machine.
    fn rotate(&mut self, mode: &Mode) -> ByteEvent {
        let mut ev = ByteEvent::default();
        if u32::from(self.step) < u32::from(self.geometry.rate) {
            self.step += 1;
            return ev;
        }
        self.step = 0;

        // Rotation wrap: one index pulse per revolution.
        if self.cpos >= self.geometry.bpt as i32 + 1 {
            self.tstart = self.track_size() * self.head as usize;
            self.state = Position::Index;
            self.cpos = -1;
            self.tpos = 0;
            self.rpos = 0;
            self.count = 0;
            ev.index = true;
        }
        // Defensive wrap if a mangled count field walked off the track.
        if self.cbuf.is_empty() || self.tstart + self.tpos.max(self.rpos) + 8 > self.cbuf.len() {
            self.state = Position::End;
        }
        self.cpos += 1;
        let idx = self.count;
        self.count += 1;

        match self.state {
            Position::Index => {
                let byte = GAP0.get(idx).copied().unwrap_or(GAP_SENTINEL);
                ev.data = byte;
                if byte == GAP_SENTINEL {
                    self.tstart = self.track_size() * self.head as usize;
                    self.tpos = 0;
                    self.rpos = 0;
                    self.count = 0;
                    self.state = Position::Ha;
                    self.ck_sum = [0xFF, 0xFF];
                    self.am_search = false;
                    ev.valid = matches!(mode, Mode::Read);
                }
            }

            Position::Ha => match idx {
                0..=4 => self.field_byte(mode, &mut ev, idx),
                5 => {
                    ev.data = self.ck_sum[0];
                    ev.valid = matches!(mode, Mode::Read);
                }
                _ => {
                    ev.data = self.ck_sum[1];
                    ev.valid = matches!(mode, Mode::Read);
                    self.tpos = format_ckd::HA_LEN;
                    self.rpos = format_ckd::HA_LEN;
                    self.count = 0;
                    self.state = Position::Gap1;
                    if self.wrote_field && self.erase_gate {
                        self.lay_terminator();
                    }
                    self.wrote_field = false;
                }
            },

            Position::Gap1 => self.gap_byte(mode, &mut ev, idx, Position::Count),

            Position::Count => {
                if idx == 0 {
                    self.rpos = self.tpos;
                    if matches!(mode, Mode::Write(_)) {
                        // A write lays down a new count; lengths are
                        // captured from the incoming bytes below.
                        self.klen = 0;
                        self.dlen = 0;
                    } else {
                        let rec = &self.cbuf[self.tstart + self.rpos..];
                        if rec[0] & rec[1] & rec[2] & rec[3] == 0xFF {
                            self.state = Position::End;
                            self.count = 0;
                            return ev;
                        }
                        self.klen = rec[5];
                        self.dlen = u16::from_be_bytes([rec[6], rec[7]]);
                    }
                }
                match idx {
                    0..=7 => {
                        self.field_byte(mode, &mut ev, idx);
                        if let Mode::Write(byte) = mode {
                            match idx {
                                5 => self.klen = *byte,
                                6 => self.dlen = u16::from(*byte) << 8,
                                7 => self.dlen |= u16::from(*byte),
                                _ => {}
                            }
                        }
                    }
                    8 => {
                        ev.data = self.ck_sum[0];
                        ev.valid = matches!(mode, Mode::Read);
                    }
                    _ => {
                        ev.data = self.ck_sum[1];
                        ev.valid = matches!(mode, Mode::Read);
                        self.count = 0;
                        self.state = if self.klen == 0 {
                            Position::Gap3
                        } else {
                            Position::Gap2
                        };
                    }
                }
            }

            Position::Am => {
                let byte = AM_GAP.get(idx).copied().unwrap_or(GAP_SENTINEL);
                ev.data = byte;
                if byte == AM_SENTINEL {
                    ev.data = 0xFF;
                    ev.am = true;
                    self.am_search = false;
                } else if byte == GAP_SENTINEL {
                    self.ck_sum = [0xFF, 0xFF];
                    self.count = 0;
                    self.state = Position::Count;
                    ev.valid = matches!(mode, Mode::Read);
                }
            }

            Position::Gap2 => self.gap_byte(mode, &mut ev, idx, Position::Key),

            Position::Key => {
                let klen = usize::from(self.klen);
                if idx < klen {
                    self.field_byte(mode, &mut ev, idx);
                } else if idx == klen {
                    ev.data = self.ck_sum[0];
                    ev.valid = matches!(mode, Mode::Read);
                } else {
                    ev.data = self.ck_sum[1];
                    ev.valid = matches!(mode, Mode::Read);
                    self.count = 0;
                    self.state = Position::Gap3;
                }
            }

            Position::Gap3 => self.gap_byte(mode, &mut ev, idx, Position::Data),

            Position::Data => {
                let dlen = usize::from(self.dlen);
                if idx < dlen {
                    self.field_byte(mode, &mut ev, idx);
                } else if idx == dlen {
                    ev.data = self.ck_sum[0];
                    ev.valid = matches!(mode, Mode::Read);
                } else {
                    ev.data = self.ck_sum[1];
                    ev.valid = matches!(mode, Mode::Read);
                    self.count = 0;
                    self.state = Position::Am;
                    if self.wrote_field && self.erase_gate {
                        self.lay_terminator();
                    }
                    self.wrote_field = false;
                }
            }

            Position::End => {
                self.count = 0;
                self.klen = 0;
                self.dlen = 0;
            }
        }

        if self.am_search {
            ev.valid = false;
        }
        ev
    }

    /// Move one content byte between the buffer and the stream, folding it
    /// into the running checksum.
    fn field_byte(&mut self, mode: &Mode, ev: &mut ByteEvent, idx: usize) {
        let off = self.tstart + self.tpos;
        match mode {
            Mode::Write(byte) => {
                self.cbuf[off] = *byte;
                self.dirty = true;
                self.wrote_field = true;
                ev.data = *byte;
                ev.valid = true;
            }
            Mode::Read => {
                ev.data = self.cbuf[off];
                ev.valid = true;
            }
            Mode::Free => {
                ev.data = self.cbuf[off];
            }
        }
        self.ck_sum[idx & 1] ^= ev.data;
        self.tpos += 1;
    }

    /// Emit one inter-field gap byte; the closing sentinel resets the
    /// checksum and moves to `next`.
    fn gap_byte(&mut self, mode: &Mode, ev: &mut ByteEvent, idx: usize, next: Position) {
        let byte = GAP1.get(idx).copied().unwrap_or(GAP_SENTINEL);
        ev.data = byte;
        if byte == GAP_SENTINEL {
            self.ck_sum = [0xFF, 0xFF];
            self.count = 0;
            self.state = next;
            ev.valid = matches!(mode, Mode::Read);
        }
    }

    /// Lay the end-of-track count at the upcoming record position.
    fn lay_terminator(&mut self) {
        let off = self.tstart + self.tpos;
        if off + END_OF_TRACK.len() <= self.cbuf.len() {
            self.cbuf[off..off + END_OF_TRACK.len()].copy_from_slice(&END_OF_TRACK);
            self.dirty = true;
        }
    }
}

/// A drive off the attachment cable is still a spinning platter: one tick
/// keeps it turning with no data transfer.
impl sim_core::Tickable for CkdDrive {
    fn tick(&mut self) {
        self.step();
    }
}

impl fmt::Debug for CkdDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CkdDrive")
            .field("model", &self.geometry.name)
            .field("cyl", &self.cyl)
            .field("head", &self.head)
            .field("cpos", &self.cpos)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_image(name: &str) -> PathBuf {
        static SERIAL: AtomicU32 = AtomicU32::new(0);
        let serial = SERIAL.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "drive-ckd-{name}-{}-{serial}.ckd",
            std::process::id()
        ))
    }

    fn fresh_2311(name: &str, ipl: bool) -> (CkdDrive, PathBuf) {
        let path = temp_image(name);
        let mut drive = CkdDrive::new(Geometry::by_name("2311").expect("known model"));
        drive.attach(&path, true).expect("attach");
        if ipl {
            drive.format(true).expect("format");
        }
        (drive, path)
    }

    /// Read forward to the next valid byte, bounded by two revolutions.
    fn next_valid(drive: &mut CkdDrive) -> ByteEvent {
        for _ in 0..2 * 4000 * 14 {
            let ev = drive.read_byte();
            if ev.valid {
                return ev;
            }
        }
        panic!("no valid byte in two revolutions");
    }

    fn read_n(drive: &mut CkdDrive, n: usize) -> Vec<u8> {
        (0..n).map(|_| next_valid(drive).data).collect()
    }

    /// Spin until the index pulse.
    fn to_index(drive: &mut CkdDrive) {
        for _ in 0..2 * 4000 * 14 {
            if drive.read_byte().index {
                return;
            }
        }
        panic!("no index in two revolutions");
    }

    #[test]
    fn attach_formats_missing_file() {
        let path = temp_image("attach-new");
        let mut drive = CkdDrive::new(Geometry::by_name("2311").expect("known model"));
        assert_eq!(drive.attach(&path, true).expect("attach"), AttachOutcome::Formatted);
        let expected = drive.geometry().image_size();
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), expected);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn attach_missing_without_init_fails() {
        let path = temp_image("attach-missing");
        let mut drive = CkdDrive::new(Geometry::by_name("2311").expect("known model"));
        assert!(matches!(drive.attach(&path, false), Err(DriveError::Io(_))));
    }

    #[test]
    fn reattach_adopts_existing_image() {
        let (mut drive, path) = fresh_2311("reattach", false);
        drive.detach().expect("detach");

        let mut second = CkdDrive::new(Geometry::by_name("2314").expect("known model"));
        assert_eq!(
            second.attach(&path, false).expect("attach"),
            AttachOutcome::Attached
        );
        // Geometry adopted from the header, not the requested model.
        assert_eq!(second.geometry().name, "2311");
        second.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn attach_rejects_truncated_image() {
        let (mut drive, path) = fresh_2311("truncated", false);
        drive.detach().expect("detach");
        let file = OpenOptions::new().write(true).open(&path).expect("open");
        file.set_len(10_000).expect("truncate");
        drop(file);

        let mut second = CkdDrive::new(Geometry::by_name("2311").expect("known model"));
        assert!(matches!(
            second.attach(&path, false),
            Err(DriveError::SizeMismatch { .. })
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn one_index_pulse_per_revolution() {
        let (mut drive, path) = fresh_2311("index", false);
        // One revolution covers angular positions 0..=bpt+1, one byte time
        // each.
        let revolution = sim_core::Ticks::byte_times(
            u64::from(drive.geometry().bpt) + 2,
            drive.geometry().rate,
        )
        .get() as usize;
        // Cross the first wrap, then count pulses over three revolutions.
        let mut pulses = 0;
        let mut spins = 0;
        while pulses == 0 {
            if drive.step() {
                pulses = 1;
            }
            spins += 1;
            assert!(spins < 2 * revolution, "no first index");
        }
        pulses = 0;
        for _ in 0..3 * revolution + 100 {
            if drive.step() {
                pulses += 1;
            }
        }
        assert_eq!(pulses, 3);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn track_stream_frames_ha_and_r0() {
        let (mut drive, path) = fresh_2311("stream", false);
        to_index(&mut drive);

        // Gap sentinel, then the five HA bytes, then the checksum pair.
        assert_eq!(next_valid(&mut drive).data, GAP_SENTINEL);
        let ha = read_n(&mut drive, 5);
        assert_eq!(ha, [0x00, 0x00, 0x00, 0x00, 0x00]);
        let ck = read_n(&mut drive, 2);
        assert_eq!(ck, [0xFF, 0xFF]); // XOR of zeros against 0xFF seeds

        // Gap, then R0's count field and checksums.
        assert_eq!(next_valid(&mut drive).data, GAP_SENTINEL);
        let count = read_n(&mut drive, 8);
        assert_eq!(count, [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08]);
        let ck = read_n(&mut drive, 2);
        assert_eq!(ck[0], 0xFF ^ count[0] ^ count[2] ^ count[4] ^ count[6]);
        assert_eq!(ck[1], 0xFF ^ count[1] ^ count[3] ^ count[5] ^ count[7]);

        // klen 0: straight to the data gap, then eight zeros.
        assert_eq!(next_valid(&mut drive).data, GAP_SENTINEL);
        assert_eq!(read_n(&mut drive, 8), vec![0u8; 8]);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn checksum_is_even_odd_xor_of_content() {
        let (mut drive, path) = fresh_2311("cksum", true);
        to_index(&mut drive);
        // Skip HA + ck + gap + R0 count + ck + gap + R0 data, to R1's AM.
        let _ = next_valid(&mut drive); // sentinel
        let _ = read_n(&mut drive, 7); // HA + ck
        let _ = next_valid(&mut drive); // sentinel
        let _ = read_n(&mut drive, 10); // count + ck
        let _ = next_valid(&mut drive); // sentinel
        let _ = read_n(&mut drive, 10); // data + ck
        // R1 count (IPL1: klen 4, dlen 24)
        let _ = next_valid(&mut drive); // AM gap sentinel
        let count = read_n(&mut drive, 8);
        assert_eq!(count[4..8], [1, 4, 0, 24]);
        let ck = read_n(&mut drive, 2);
        let even = count.iter().step_by(2).fold(0xFFu8, |a, &b| a ^ b);
        let odd = count.iter().skip(1).step_by(2).fold(0xFFu8, |a, &b| a ^ b);
        assert_eq!(ck, [even, odd]);
        // Key field = "IPL1" in EBCDIC.
        let _ = next_valid(&mut drive); // gap sentinel
        assert_eq!(read_n(&mut drive, 4), format_ckd::ipl::IPL1_RECORD[0..4]);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn am_flag_raised_on_address_marks() {
        let (mut drive, path) = fresh_2311("am", true);
        to_index(&mut drive);
        let mut marks = 0;
        let revolution = (drive.geometry().bpt as usize + 1)
            * (usize::from(drive.geometry().rate) + 1);
        for _ in 0..revolution {
            let ev = drive.read_byte();
            if ev.am {
                assert!(!ev.valid);
                marks += 1;
            }
            if ev.index {
                break;
            }
        }
        // An AM gap precedes R1, R2, R3 and the terminator count, with two
        // marks in each.
        assert_eq!(marks, 8);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn am_search_suppresses_until_mark() {
        let (mut drive, path) = fresh_2311("am-search", true);
        to_index(&mut drive);
        // Read the HA field first; a search armed across index would be
        // disarmed at the index point (missing-mark protection).
        let _ = next_valid(&mut drive); // gap sentinel
        let _ = read_n(&mut drive, 7); // HA + checksums
        // Arm the address-mark search: read gate + select head + head advance.
        drive.set_tags(
            tags::FT_SELECT | tags::FT_CONTROL,
            tags::FC_READ_GATE | tags::FC_SELECT_HEAD | tags::FC_HEAD_ADVANCE,
        );
        assert!(drive.am_search);
        // R0 passes silently; the first valid byte is the AM gap's closing
        // sentinel in front of R1.
        let ev = next_valid(&mut drive);
        assert_eq!(ev.data, GAP_SENTINEL);
        assert!(!drive.am_search);
        // Count field of R1 follows.
        let count = read_n(&mut drive, 8);
        assert_eq!(count[4], 1);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn write_ha_then_read_back() {
        let (mut drive, path) = fresh_2311("write-ha", false);
        to_index(&mut drive);
        let wha = [0x00, 0x00, 0x07, 0x00, 0x02];
        let mut fed = 0;
        // Feed the HA bytes as the field passes under the head.
        while fed < wha.len() {
            if drive.write_byte(wha[fed]).valid {
                fed += 1;
            }
        }
        to_index(&mut drive);
        assert_eq!(next_valid(&mut drive).data, GAP_SENTINEL);
        assert_eq!(read_n(&mut drive, 5), wha);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn format_write_truncates_track() {
        let (mut drive, path) = fresh_2311("truncate", true);
        to_index(&mut drive);
        // Rewrite the HA with the erase gate up; the IPL records behind it
        // disappear under the laid terminator.
        drive.set_tags(
            tags::FT_SELECT | tags::FT_CONTROL,
            tags::FC_WRITE_GATE | tags::FC_SELECT_HEAD | tags::FC_ERASE_GATE,
        );
        let wha = [0x00, 0x00, 0x00, 0x00, 0x00];
        let mut fed = 0;
        while fed < wha.len() {
            if drive.write_byte(wha[fed]).valid {
                fed += 1;
            }
        }
        to_index(&mut drive);
        let _ = next_valid(&mut drive); // sentinel
        let _ = read_n(&mut drive, 7); // HA + ck
        // Next count field is now the terminator: the stream parks at End
        // and nothing more is valid until index.
        let mut saw_valid = false;
        loop {
            let ev = drive.read_byte();
            saw_valid |= ev.valid && ev.data != GAP_SENTINEL;
            if ev.index {
                break;
            }
        }
        assert!(!saw_valid);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dirty_cylinder_flushes_on_detach() {
        let (mut drive, path) = fresh_2311("flush", false);
        to_index(&mut drive);
        let wha = [0x00, 0x00, 0x09, 0x00, 0x01];
        let mut fed = 0;
        while fed < wha.len() {
            if drive.write_byte(wha[fed]).valid {
                fed += 1;
            }
        }
        drive.detach().expect("detach");

        let mut second = CkdDrive::new(Geometry::by_name("2311").expect("known model"));
        second.attach(&path, false).expect("attach");
        to_index(&mut second);
        assert_eq!(next_valid(&mut second).data, GAP_SENTINEL);
        assert_eq!(read_n(&mut second, 5), wha);
        second.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn seek_tags_and_completion() {
        let (mut drive, path) = fresh_2311("seek", false);
        drive.set_tags(tags::FT_SELECT | tags::FT_SET_CYL, 0x10);
        drive.set_tags(tags::FT_SELECT | tags::FT_SET_HEAD, 0x05);
        drive.set_tags(tags::FT_SELECT | tags::FT_SET_DIFF, 0x10);
        drive.set_tags(tags::FT_SELECT | tags::FT_CONTROL, tags::FC_SEEK_START);
        assert!(drive.take_seek_request());
        assert!(!drive.take_seek_request());
        assert!(!drive.check_attn());
        assert_eq!(drive.cyl(), 0);
        drive.finish_seek();
        assert!(drive.check_attn());
        assert_eq!(drive.cyl(), 0x10);
        assert_eq!(drive.head(), 5);
        // Read gate acknowledges the attention.
        drive.set_tags(tags::FT_SELECT | tags::FT_CONTROL, tags::FC_READ_GATE);
        assert!(!drive.check_attn());
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn tags_ignored_without_select() {
        let (mut drive, path) = fresh_2311("unselected", false);
        drive.set_tags(tags::FT_SET_CYL, 0x22);
        drive.set_tags(tags::FT_CONTROL, tags::FC_SEEK_START);
        assert!(!drive.take_seek_request());
        drive.finish_seek();
        assert_eq!(drive.cyl(), 0);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn seek_to_other_cylinder_reads_its_ha() {
        let (mut drive, path) = fresh_2311("cyl-switch", false);
        drive.set_tags(tags::FT_SELECT | tags::FT_SET_CYL, 0x21);
        drive.set_tags(tags::FT_SELECT | tags::FT_SET_HEAD, 0x03);
        drive.set_tags(tags::FT_SELECT | tags::FT_CONTROL, tags::FC_SEEK_START);
        drive.finish_seek();
        to_index(&mut drive);
        assert_eq!(next_valid(&mut drive).data, GAP_SENTINEL);
        assert_eq!(read_n(&mut drive, 5), [0x00, 0x00, 0x21, 0x00, 0x03]);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn drive_status_tracks_attachment() {
        let mut drive = CkdDrive::new(Geometry::by_name("2311").expect("known model"));
        assert_eq!(drive.status(), 0);
        let path = temp_image("status");
        drive.attach(&path, true).expect("attach");
        assert_eq!(drive.status(), tags::FS_ONLINE | tags::FS_READY);
        drive.set_tags(tags::FT_SELECT | tags::FT_CONTROL, tags::FC_SEEK_START);
        assert_eq!(drive.status(), tags::FS_ONLINE);
        drive.finish_seek();
        assert_eq!(drive.status(), tags::FS_ONLINE | tags::FS_READY);
        drive.detach().expect("detach");
        std::fs::remove_file(&path).ok();
    }
}
