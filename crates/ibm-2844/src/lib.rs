//! IBM 2844 storage control unit.
//!
//! Couples up to eight CKD drives to a System/360 bus-and-tag channel.
//! Three layers share one register bank:
//!
//! - the hardwired channel side (`channel`): address decode, tag line
//!   drivers, the service-request latch chain;
//! - the command sequencer (`seq`): selection, command decode, the byte
//!   coupling between serdes and channel, ending status, polling;
//! - the ROS engine (`ros`/`cros`): the microinstruction interpreter that
//!   runs the shipped bring-up diagnostic out of reset and refuses to
//!   start on a listing with bad parity.
//!
//! Per bus tick the channel side runs once and the microcycle (drive scan
//! plus sequencer) runs twice; drives therefore turn at twice the tick
//! rate, divided down by their own byte clock.

mod channel;
pub mod cros;
pub mod registers;
pub mod ros;
mod seq;

use std::fmt;
use std::path::Path;

use drive_ckd::{AttachOutcome, CkdDrive, DriveError, SEEK_TICKS};
use drive_ckd::tags as ft;
use ibm_channel::{ChannelBus, ChannelDevice};
use sim_core::Scheduler;

use cros::{CrosError, Microword};
use registers::{Registers, ST_SERDES};
use ros::AluState;
use seq::SeqState;

/// The bring-up microdiagnostic, shipped with the crate.
pub const BRINGUP_LISTING: &str = include_str!("microcode/bringup.ros");

/// ROS address of the idle loop the bring-up parks on.
pub const ROS_IDLE: u16 = 0x012;

/// Steps the bring-up may take before the machine is declared broken.
const BRINGUP_LIMIT: usize = 64;

/// Channel command codes the 2844 understands.
pub mod cmd {
    pub const NOP: u8 = 0x03;
    pub const SENSE: u8 = 0x04;
    pub const SEEK: u8 = 0x07;
    pub const SEEK_HEAD: u8 = 0x1B;
    pub const RECALIBRATE: u8 = 0x0B;
    pub const RESTORE: u8 = 0x13;
    pub const SET_FILE_MASK: u8 = 0x1F;
    pub const READ_IPL: u8 = 0x02;
    pub const READ_DATA: u8 = 0x06;
    pub const READ_KD: u8 = 0x0E;
    pub const READ_CKD: u8 = 0x1E;
    pub const READ_R0: u8 = 0x16;
    pub const READ_HA: u8 = 0x1A;
    pub const READ_COUNT: u8 = 0x12;
    pub const WRITE_DATA: u8 = 0x05;
    pub const WRITE_KD: u8 = 0x0D;
    pub const WRITE_CKD: u8 = 0x1D;
    pub const WRITE_R0: u8 = 0x15;
    pub const WRITE_HA: u8 = 0x19;
    pub const SEARCH_ID_EQ: u8 = 0x31;
    pub const SEARCH_HA_EQ: u8 = 0x39;
    /// Multi-track modifier on the search commands.
    pub const MT: u8 = 0x80;
}

/// Unit-status byte bits.
pub mod status {
    pub const ATTN: u8 = 0x80;
    /// Status modifier: tells the channel to skip the next CCW.
    pub const SMS: u8 = 0x40;
    pub const CUE: u8 = 0x20;
    pub const BUSY: u8 = 0x10;
    pub const CE: u8 = 0x08;
    pub const DE: u8 = 0x04;
    pub const UC: u8 = 0x02;
    pub const UE: u8 = 0x01;
}

/// Sense byte bit assignments (bytes 0 and 1).
pub mod sense {
    pub const CMD_REJECT: u8 = 0x80;
    pub const INTERVENTION: u8 = 0x40;
    pub const BUS_PARITY: u8 = 0x20;
    pub const EQUIP_CHECK: u8 = 0x10;
    pub const DATA_CHECK: u8 = 0x08;
    pub const OVERRUN: u8 = 0x04;
    pub const TRACK_COND: u8 = 0x02;
    pub const SEEK_CHECK: u8 = 0x01;

    pub const DATA_CHECK_COUNT: u8 = 0x80;
    pub const TRACK_OVERRUN: u8 = 0x40;
    pub const END_CYL: u8 = 0x20;
    pub const INVALID_SEQ: u8 = 0x10;
    pub const NO_RECORD: u8 = 0x08;
    pub const FILE_PROT: u8 = 0x04;
    pub const MISSING_AM: u8 = 0x02;
    pub const OVERFLOW_INC: u8 = 0x01;
}

#[derive(Debug)]
pub enum ControlError {
    /// The microcode listing failed to parse or verify.
    Ros(CrosError),
    /// The bring-up diagnostic never reached its idle loop.
    Bringup,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ros(e) => write!(f, "microcode load failed: {e}"),
            Self::Bringup => write!(f, "bring-up diagnostic did not reach idle"),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<CrosError> for ControlError {
    fn from(e: CrosError) -> Self {
        Self::Ros(e)
    }
}

/// Deferred mechanical completions.
#[derive(Debug, PartialEq, Eq)]
enum Event {
    SeekDone(usize),
}

/// One 2844 storage control unit with its string of drives.
pub struct ControlUnit {
    /// Device address high nibble on the channel (e.g. 0x90 answers
    /// 0x90..=0x97).
    addr: u8,
    drives: [Option<CkdDrive>; 8],
    /// Drive currently steered onto the serdes.
    unit: usize,

    regs: Registers,
    alu: AluState,
    store: Vec<Microword>,
    sched: Scheduler<Event>,
    seq: SeqState,
    sense: [u8; 6],

    // Channel-side latches.
    selected: bool,
    addressed: bool,
    request: bool,
    opr_in: bool,
    sta_in: bool,
    srv_in: bool,
    svc_req: bool,
    tr_1: bool,
    tr_2: bool,
    short_busy: bool,
    halt_hold: bool,
    byte_taken: bool,
    burst_odd: bool,
    index_pulse: bool,
    /// An address mark passed under the head since the last arm.
    am_seen: bool,
    xfer_parity_bad: bool,
    bus_out: u8,
    bus_out_good: bool,
    tags: u16,

    /// Status held for re-presentation through the polling path.
    pending_status: Option<u8>,
    pending_unit: u8,
}

impl ControlUnit {
    /// Build a control unit at the given channel address (low nibble
    /// zero), load the microcode and run the bring-up diagnostic.
    pub fn new(addr: u8) -> Result<Self, ControlError> {
        let store = cros::parse(BRINGUP_LISTING)?;
        let mut cu = Self {
            addr: addr & 0xF0,
            drives: Default::default(),
            unit: 0,
            regs: Registers::new(),
            alu: AluState::default(),
            store,
            sched: Scheduler::new(),
            seq: SeqState::new(),
            sense: [0; 6],
            selected: false,
            addressed: false,
            request: false,
            opr_in: false,
            sta_in: false,
            srv_in: false,
            svc_req: false,
            tr_1: false,
            tr_2: false,
            short_busy: false,
            halt_hold: false,
            byte_taken: false,
            burst_odd: false,
            index_pulse: false,
            am_seen: false,
            xfer_parity_bad: false,
            bus_out: 0,
            bus_out_good: true,
            tags: 0,
            pending_status: None,
            pending_unit: 0,
        };
        if !cu.run_bringup() {
            return Err(ControlError::Bringup);
        }
        Ok(cu)
    }

    /// Channel address nibble.
    #[must_use]
    pub fn addr(&self) -> u8 {
        self.addr
    }

    /// Put a drive on the string.
    pub fn set_drive(&mut self, unit: usize, drive: CkdDrive) {
        self.drives[unit & 7] = Some(drive);
    }

    /// Attach an image file as drive `unit`.
    pub fn attach_image<P: AsRef<Path>>(
        &mut self,
        unit: usize,
        geometry: &'static format_ckd::Geometry,
        path: P,
        init: bool,
    ) -> Result<AttachOutcome, DriveError> {
        let mut drive = CkdDrive::new(geometry);
        let outcome = drive.attach(path, init)?;
        self.drives[unit & 7] = Some(drive);
        Ok(outcome)
    }

    /// Borrow a drive (front panel, tests).
    pub fn drive_mut(&mut self, unit: usize) -> Option<&mut CkdDrive> {
        self.drives[unit & 7].as_mut()
    }

    #[must_use]
    pub fn drive(&self, unit: usize) -> Option<&CkdDrive> {
        self.drives[unit & 7].as_ref()
    }

    /// Observe the register bank (front panel).
    #[must_use]
    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    /// Current sense bytes.
    #[must_use]
    pub fn sense_bytes(&self) -> [u8; 6] {
        self.sense
    }

    /// Run the ROS from address zero to the idle loop.
    fn run_bringup(&mut self) -> bool {
        let store = std::mem::take(&mut self.store);
        let mut port = ResetPort {
            drives: &mut self.drives,
            unit: &mut self.unit,
        };
        let ok = ros::run_bringup(
            &store,
            &mut self.alu,
            &mut self.regs,
            &mut port,
            ROS_IDLE,
            BRINGUP_LIMIT,
        );
        self.store = store;
        ok
    }

    /// Operational-Out dropped: system reset.
    pub(crate) fn channel_reset(&mut self) {
        self.selected = false;
        self.addressed = false;
        self.request = false;
        self.opr_in = false;
        self.sta_in = false;
        self.srv_in = false;
        self.svc_req = false;
        self.tr_1 = false;
        self.tr_2 = false;
        self.short_busy = false;
        self.halt_hold = false;
        self.byte_taken = false;
        self.index_pulse = false;
        self.pending_status = None;
        self.seq = SeqState::new();
        self.regs.wx = 0;
        // Reset re-runs the same microdiagnostic the power-on path used.
        self.run_bringup();
    }

    /// One microcycle: advance every spindle, then the sequencer.
    fn micro_step(&mut self) {
        self.drive_scan();
        self.seq_step();
    }

    /// Walk the drive string: the steered drive moves bytes through the
    /// serdes, the rest just keep turning. Gathers attention into SC.
    fn drive_scan(&mut self) {
        self.regs.sc = 0;
        for i in 0..8 {
            let gated = self.unit == i
                && self.regs.ft & (ft::FT_CONTROL | ft::FT_SELECT)
                    == (ft::FT_CONTROL | ft::FT_SELECT)
                && self.regs.fc & ft::FC_SELECT_HEAD != 0;
            let reading = gated && self.regs.fc & ft::FC_READ_GATE != 0;
            let writing = gated && self.regs.fc & ft::FC_WRITE_GATE != 0;
            let dr = self.regs.dr;

            let Some(drive) = self.drives[i].as_mut() else {
                continue;
            };
            let serdes = if reading {
                let ev = drive.read_byte();
                self.index_pulse |= ev.index;
                self.am_seen |= ev.am;
                ev.valid.then_some((ev.data, ev.am))
            } else if writing {
                let ev = drive.write_byte(dr);
                self.index_pulse |= ev.index;
                self.am_seen |= ev.am;
                ev.valid.then_some((dr, ev.am))
            } else {
                drive.step();
                None
            };
            let seek_started = drive.take_seek_request();
            let attn = drive.check_attn();

            if let Some((byte, am)) = serdes {
                self.regs.st |= ST_SERDES;
                if reading {
                    self.regs.dr = byte;
                }
                if !am && self.regs.ft & ft::FT_HEAD_ADVANCE != 0 {
                    self.burst_fold(byte);
                }
            }
            if seek_started {
                self.sched.schedule(SEEK_TICKS, Event::SeekDone(i));
            }
            if attn {
                self.regs.sc |= 0x80 >> i;
                if !self.selected {
                    self.request = true;
                }
            }
        }
    }

    /// Fold a transferred byte into the code-check burst registers.
    fn burst_fold(&mut self, byte: u8) {
        if self.burst_odd {
            self.regs.bx ^= byte;
        } else {
            self.regs.cx ^= byte;
        }
        self.burst_odd = !self.burst_odd;
    }
}

impl ChannelDevice for ControlUnit {
    fn step(&mut self, bus: &mut ChannelBus) {
        self.channel_step(bus);
        self.micro_step();
        self.micro_step();
        self.sched.advance();
        while let Some(event) = self.sched.due() {
            match event {
                Event::SeekDone(unit) => {
                    if let Some(drive) = self.drives[unit].as_mut() {
                        drive.finish_seek();
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ControlUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlUnit")
            .field("addr", &self.addr)
            .field("unit", &self.unit)
            .field("selected", &self.selected)
            .field("wx", &self.regs.wx)
            .finish_non_exhaustive()
    }
}

/// Minimal ROS port for reset: the channel is quiet and only the drive
/// cable side effects matter.
struct ResetPort<'a> {
    drives: &'a mut [Option<CkdDrive>; 8],
    unit: &'a mut usize,
}

impl ros::RosPort for ResetPort<'_> {
    fn chan_tags(&self) -> u16 {
        0
    }
    fn bus_out(&self) -> u8 {
        0
    }
    fn selected(&self) -> bool {
        false
    }
    fn srv_in(&self) -> bool {
        false
    }
    fn tr1(&self) -> bool {
        false
    }
    fn index(&self) -> bool {
        false
    }
    fn note_data_taken(&mut self) {}
    fn note_er_read(&mut self) {}
    fn raise_svc_req(&mut self) {}
    fn clear_index(&mut self) {}
    fn drive_tags(&mut self, ft_bits: u8, fc_bits: u8) {
        if let Some(drive) = self.drives[*self.unit].as_mut() {
            drive.set_tags(ft_bits, fc_bits);
        }
    }
    fn select_unit(&mut self, unit: u8) {
        *self.unit = usize::from(unit & 7);
    }
    fn unit_num(&self) -> u8 {
        *self.unit as u8
    }
    fn drive_present(&self) -> bool {
        self.drives[*self.unit].is_some()
    }
    fn cur_cyl(&self) -> u8 {
        self.drives[*self.unit].as_ref().map_or(0, CkdDrive::cur_cyl)
    }
    fn drive_status(&self) -> u8 {
        self.drives[*self.unit].as_ref().map_or(0, CkdDrive::status)
    }
    fn addr_nibble(&self) -> u8 {
        0
    }
    fn attention(&self) -> bool {
        false
    }
}
