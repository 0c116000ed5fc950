//! Command sequencer.
//!
//! The control flow a 2844 keeps in its microprogram, expressed directly
//! as a state machine over the same register bank: initial selection,
//! command decode, the byte-level coupling between the serdes (ST4/DR) and
//! the channel latches, ending status, attention polling and halt.
//!
//! Selection, per-line tag driving and the service-request chain live in
//! `channel.rs`; the sequencer only reads the latches and the IG register
//! the way the microprogram did.

use drive_ckd::tags as ft;
use ibm_channel::tag;

use crate::registers::{ER_HALT, IG_ADR_IN, IG_DROP_OPR_IN, IG_POLL, IG_QUEUED, IG_READ,
    IG_STATUS, IG_WRITE, ST_SERDES};
use crate::{cmd, sense, status, ControlUnit};

/// Where the sequencer is in the life of one channel program step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    /// Initial selection: address-in raised, waiting for Command-Out.
    AddrIn,
    /// Command latched; waiting for Command-Out to fall.
    CmdWait,
    /// Initial status on the bus.
    InitStatus,
    /// Command body running.
    Exec,
    /// Ending status on the bus.
    FinalStatus,
    /// Reselected by a poll: address-in raised.
    PollAddrIn,
    /// Poll command (proceed byte) latched; waiting for Command-Out drop.
    PollCmdWait,
    /// Stacked or attention status on the bus.
    PollStatus,
}

/// Active command body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exec {
    None,
    /// Collect host bytes into the transfer buffer (seek address, file
    /// mask, search argument).
    Recv,
    /// Send the six sense bytes.
    SenseSend,
    /// Record-oriented disk transfer driven by the plan.
    Track,
}

/// How a track plan orients itself before the first field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sync {
    /// Wait for the index point, fields start at the home address.
    Index,
    /// Arm the address-mark search; fields start at the next count.
    Am,
    /// Carry straight on from the previous command's orientation.
    InPlace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    Ha,
    Count,
    Key,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Skip,
    ToHost,
    FromHost,
    Compare,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Step {
    pub kind: FieldKind,
    pub action: Action,
}

const fn step(kind: FieldKind, action: Action) -> Step {
    Step { kind, action }
}

/// Track executor stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoStage {
    /// Waiting for index or address mark.
    SyncWait,
    /// Waiting for the gap sentinel in front of the current field.
    Sentinel,
    /// Inside a read-side field.
    FieldRead,
    /// Feeding a write-side field.
    FieldWrite,
    /// Consuming the two checksum bytes behind a read-side field.
    Ck,
}

/// What the last completed command leaves behind for sequence checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PrevOp {
    #[default]
    None,
    WriteHa,
    WriteR0,
    WriteCkd,
    SearchIdHit,
    SearchHaHit,
}

/// Sequencer state carried between microcycles.
#[derive(Debug)]
pub(crate) struct SeqState {
    pub phase: Phase,
    pub exec: Exec,
    /// Status byte being (or about to be) presented.
    pub presenting: u8,
    /// Host bytes collected by `Recv`.
    pub buf: [u8; 8],
    pub buf_len: u8,
    pub buf_need: u8,
    /// One-byte well between the channel latches and DR.
    pub host_buf: Option<u8>,
    /// Host signalled stop (Command-Out against Service-In).
    pub host_stopped: bool,
    /// Sense byte index during a sense transfer.
    pub sense_idx: u8,
    /// Track plan.
    pub sync: Sync,
    pub steps: Vec<Step>,
    pub step_idx: usize,
    pub erase: bool,
    pub stage: IoStage,
    pub field_pos: u16,
    pub field_len: u16,
    pub fed: u16,
    pub ck_left: u8,
    pub index_pulses: u8,
    /// Accumulated Unit Check for the ending status.
    pub unit_check: bool,
    /// Search bookkeeping.
    pub compare_equal: bool,
    pub search_arg: [u8; 5],
    pub search_len: u8,
    pub mt: bool,
    pub prev: PrevOp,
    pub file_mask: u8,
    /// Host bytes a write plan still wants; the write latch drops with the
    /// last request so the channel sees no spurious service-in.
    pub host_bytes_left: u16,
    /// The remaining count grows as the count field's length bytes arrive.
    pub length_from_count: bool,
    pub pump_pos: u16,
}

impl SeqState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            exec: Exec::None,
            presenting: 0,
            buf: [0; 8],
            buf_len: 0,
            buf_need: 0,
            host_buf: None,
            host_stopped: false,
            sense_idx: 0,
            sync: Sync::Index,
            steps: Vec::new(),
            step_idx: 0,
            erase: false,
            stage: IoStage::SyncWait,
            field_pos: 0,
            field_len: 0,
            fed: 0,
            ck_left: 0,
            index_pulses: 0,
            unit_check: false,
            compare_equal: true,
            search_arg: [0; 5],
            search_len: 0,
            mt: false,
            prev: PrevOp::None,
            file_mask: 0,
            host_bytes_left: 0,
            length_from_count: false,
            pump_pos: 0,
        }
    }

    pub fn reset(&mut self) {
        let prev = self.prev;
        let mask = self.file_mask;
        *self = Self::new();
        self.prev = prev;
        self.file_mask = mask;
    }
}

impl ControlUnit {
    /// One sequencer microcycle. Runs after the drive scan, twice per bus
    /// tick.
    pub(crate) fn seq_step(&mut self) {
        // Keep the one-byte host well topped up during write transfers.
        if self.regs.ig & IG_WRITE != 0 && self.seq.host_buf.is_none() && self.host_byte_ready() {
            let byte = self.take_host_byte();
            self.seq.host_buf = Some(byte);
            if self.seq.exec == Exec::Track {
                let pos = self.seq.pump_pos;
                self.seq.pump_pos += 1;
                if self.seq.length_from_count {
                    match pos {
                        5 => self.seq.host_bytes_left += u16::from(byte),
                        6 => self.seq.host_bytes_left += u16::from(byte) << 8,
                        7 => self.seq.host_bytes_left += u16::from(byte),
                        _ => {}
                    }
                }
                self.seq.host_bytes_left = self.seq.host_bytes_left.saturating_sub(1);
                if self.seq.host_bytes_left == 0 {
                    self.regs.ig &= !IG_WRITE;
                }
            }
        }
        // Host stop: Command-Out answered a Service-In.
        if self.srv_in
            && self.tags & tag::CMD_OUT != 0
            && matches!(self.seq.phase, Phase::Exec)
            && !self.seq.host_stopped
        {
            self.seq.host_stopped = true;
            self.regs.ig &= !(IG_READ | IG_WRITE);
        }
        // Halt: Address-Out raised into a running transfer.
        if self.selected
            && self.tags & tag::ADR_OUT != 0
            && matches!(self.seq.phase, Phase::Exec)
        {
            self.halt_io();
            return;
        }

        match self.seq.phase {
            Phase::Idle => self.seq_idle(),
            Phase::AddrIn => {
                if self.tags & tag::CMD_OUT != 0 {
                    self.regs.op = self.bus_out;
                    self.regs.ig &= !IG_ADR_IN;
                    self.seq.phase = Phase::CmdWait;
                }
            }
            Phase::CmdWait => {
                if self.tags & tag::CMD_OUT == 0 {
                    self.decide_initial();
                }
            }
            Phase::InitStatus => {
                if self.sta_in && self.tags & tag::SRV_OUT != 0 {
                    self.regs.ig &= !IG_STATUS;
                    if self.seq.presenting == 0 {
                        self.begin_exec();
                    } else {
                        // Immediate completion (or rejection).
                        self.release();
                    }
                }
            }
            Phase::Exec => match self.seq.exec {
                Exec::Recv => self.exec_recv(),
                Exec::SenseSend => self.exec_sense(),
                Exec::Track => self.exec_track(),
                Exec::None => self.present_final(status::CE | status::DE),
            },
            Phase::FinalStatus => {
                if self.regs.ig & IG_STATUS == 0 && !self.sta_in {
                    // Hold the status until the data handshake drains, or
                    // a stale Service-Out would eat it unseen.
                    if !self.srv_in
                        && !self.svc_req
                        && !self.tr_2
                        && self.tags & tag::SRV_OUT == 0
                    {
                        self.present(self.seq.presenting);
                    }
                } else if self.sta_in
                    && self.tags & tag::SUP_OUT != 0
                    && self.tags & tag::SRV_OUT == 0
                {
                    // Status retention: stack it for the polling path.
                    self.pending_status = Some(self.seq.presenting);
                    self.pending_unit = self.unit as u8;
                    self.regs.ig &= !IG_STATUS;
                    self.regs.ig |= IG_QUEUED;
                    self.release();
                } else if self.sta_in && self.tags & tag::SRV_OUT != 0 {
                    self.regs.ig &= !IG_STATUS;
                    self.release();
                }
            }
            Phase::PollAddrIn => {
                if self.tags & tag::CMD_OUT != 0 {
                    self.regs.ig &= !IG_ADR_IN;
                    self.seq.phase = Phase::PollCmdWait;
                }
            }
            Phase::PollCmdWait => {
                if self.tags & tag::CMD_OUT == 0 {
                    let st = self.pending_status.take().unwrap_or(status::DE);
                    self.present(st);
                    self.seq.phase = Phase::PollStatus;
                }
            }
            Phase::PollStatus => {
                if self.sta_in && self.tags & tag::SRV_OUT != 0 {
                    self.regs.ig &= !(IG_STATUS | IG_QUEUED);
                    // Acknowledge the attention that got us reselected.
                    if let Some(drive) = self.drives[self.unit].as_mut()
                        && drive.check_attn()
                    {
                        drive.set_tags(ft::FT_SELECT | ft::FT_CONTROL, ft::FC_READ_GATE);
                    }
                    self.release();
                }
            }
        }
    }

    fn seq_idle(&mut self) {
        if self.halt_hold || !self.selected || self.opr_in {
            return;
        }
        if self.tags & tag::ADR_OUT != 0 && self.addressed {
            // Initial selection: answer with our address.
            self.regs.ur = self.bus_out;
            self.unit = usize::from(self.bus_out & 0x07);
            self.regs.dw = self.bus_out;
            self.regs.ig |= IG_ADR_IN;
            self.seq.phase = Phase::AddrIn;
        } else if self.pending_status.is_some() {
            self.unit = usize::from(self.pending_unit & 0x07);
            self.regs.dw = self.addr | self.pending_unit;
            self.regs.ig |= IG_ADR_IN;
            self.seq.phase = Phase::PollAddrIn;
        } else if self.regs.sc != 0 {
            // Drive attention: re-present device end for that unit.
            let unit = self.regs.sc.leading_zeros() as u8;
            self.unit = usize::from(unit & 0x07);
            self.pending_unit = unit;
            self.regs.dw = self.addr | unit;
            self.regs.ig |= IG_ADR_IN;
            self.seq.phase = Phase::PollAddrIn;
        }
    }

    /// Decode OP and put the initial status on the bus.
    fn decide_initial(&mut self) {
        let op = self.regs.op;
        self.seq.reset();
        self.xfer_parity_bad = false;

        if op != cmd::SENSE {
            self.sense[0] = 0;
            self.sense[1] = 0;
        }

        let base = op & !cmd::MT;
        let searching = base == cmd::SEARCH_ID_EQ || base == cmd::SEARCH_HA_EQ;
        let known = matches!(
            op,
            cmd::NOP
                | cmd::SENSE
                | cmd::SEEK
                | cmd::SEEK_HEAD
                | cmd::RECALIBRATE
                | cmd::RESTORE
                | cmd::SET_FILE_MASK
                | cmd::READ_IPL
                | cmd::READ_DATA
                | cmd::READ_KD
                | cmd::READ_CKD
                | cmd::READ_R0
                | cmd::READ_HA
                | cmd::READ_COUNT
                | cmd::WRITE_DATA
                | cmd::WRITE_KD
                | cmd::WRITE_CKD
                | cmd::WRITE_R0
                | cmd::WRITE_HA
        ) || searching;
        if !known {
            self.sense[0] |= sense::CMD_REJECT;
            self.present_initial_end(status::UC);
            return;
        }
        // The controller executes No-op and Sense itself; everything else
        // needs a drive at the addressed unit.
        if !matches!(op, cmd::NOP | cmd::SENSE) && self.drives[self.unit].is_none() {
            self.sense[0] |= sense::INTERVENTION;
            self.present_initial_end(status::UC);
            return;
        }

        // Format-write permission and sequencing are checked before any
        // data moves; a violation rejects the command outright.
        match op {
            cmd::WRITE_HA | cmd::WRITE_R0 | cmd::WRITE_CKD => {
                if self.seq.file_mask & 0x40 == 0 {
                    self.sense[0] |= sense::CMD_REJECT;
                    self.sense[1] |= sense::FILE_PROT;
                    self.present_initial_end(status::UC);
                    return;
                }
            }
            _ => {}
        }
        let seq_ok = match op {
            cmd::WRITE_R0 => matches!(self.seq.prev, PrevOp::WriteHa | PrevOp::SearchHaHit),
            cmd::WRITE_CKD => matches!(
                self.seq.prev,
                PrevOp::WriteR0 | PrevOp::WriteCkd | PrevOp::SearchIdHit
            ),
            cmd::WRITE_DATA | cmd::WRITE_KD => matches!(self.seq.prev, PrevOp::SearchIdHit),
            _ => true,
        };
        if !seq_ok {
            self.sense[0] |= sense::CMD_REJECT;
            self.sense[1] |= sense::INVALID_SEQ;
            self.present_initial_end(status::UC);
            return;
        }

        match op {
            cmd::NOP => self.present_initial_end(status::CE | status::DE),
            cmd::RECALIBRATE | cmd::RESTORE => {
                self.drive_tags(ft::FT_SELECT | ft::FT_CONTROL, ft::FC_RETURN_HOME);
                self.present_initial_end(status::CE | status::DE);
            }
            cmd::SENSE => {
                self.sense[2] = 0;
                self.sense[3] = if self.drives[self.unit].is_some() { 0x40 } else { 0 };
                self.sense[4] = self.unit as u8;
                self.sense[5] = 0;
                self.seq.exec = Exec::SenseSend;
                self.present_initial_go();
            }
            cmd::SEEK | cmd::SEEK_HEAD => {
                self.seq.buf_need = 6;
                self.seq.exec = Exec::Recv;
                self.present_initial_go();
            }
            cmd::SET_FILE_MASK => {
                self.seq.buf_need = 1;
                self.seq.exec = Exec::Recv;
                self.present_initial_go();
            }
            _ if searching => {
                self.seq.mt = op & cmd::MT != 0;
                // CCHH for a home-address search, CCHHR for an ID search.
                self.seq.buf_need = if base == cmd::SEARCH_HA_EQ { 4 } else { 5 };
                self.seq.exec = Exec::Recv;
                self.present_initial_go();
            }
            _ => {
                self.build_track_plan(op);
                self.seq.exec = Exec::Track;
                self.present_initial_go();
            }
        }
    }

    fn present_initial_end(&mut self, st: u8) {
        self.seq.prev = PrevOp::None;
        self.present(st);
        self.seq.phase = Phase::InitStatus;
    }

    fn present_initial_go(&mut self) {
        self.present(0);
        self.seq.phase = Phase::InitStatus;
    }

    fn present(&mut self, st: u8) {
        self.seq.presenting = st;
        self.regs.dw = st;
        self.regs.ig |= IG_STATUS;
    }

    /// Queue the ending status; the `FinalStatus` phase puts it on the bus
    /// once the data handshake has drained.
    fn present_final(&mut self, st: u8) {
        let st = if self.seq.unit_check || self.xfer_parity_bad {
            if self.xfer_parity_bad {
                self.sense[0] |= sense::BUS_PARITY;
            }
            st | status::UC
        } else {
            st
        };
        self.seq.presenting = st;
        self.seq.phase = Phase::FinalStatus;
    }

    /// Start the command body once the zero initial status was accepted.
    fn begin_exec(&mut self) {
        self.seq.phase = Phase::Exec;
        match self.seq.exec {
            Exec::Recv => self.regs.ig |= IG_WRITE,
            Exec::SenseSend => self.regs.ig |= IG_READ,
            Exec::Track => self.begin_track(),
            Exec::None => {}
        }
    }

    fn exec_recv(&mut self) {
        if let Some(byte) = self.seq.host_buf.take() {
            let idx = usize::from(self.seq.buf_len);
            if idx < self.seq.buf.len() {
                self.seq.buf[idx] = byte;
            }
            self.seq.buf_len += 1;
        }
        if self.seq.buf_len >= self.seq.buf_need || self.seq.host_stopped {
            self.regs.ig &= !IG_WRITE;
            self.finish_recv();
        }
    }

    fn finish_recv(&mut self) {
        match self.regs.op {
            cmd::SEEK | cmd::SEEK_HEAD => self.do_seek(),
            cmd::SET_FILE_MASK => {
                let mask = self.seq.buf[0];
                if self.seq.buf_len < 1 || mask & 0x30 != 0 {
                    self.sense[0] |= sense::CMD_REJECT;
                    self.seq.unit_check = true;
                } else {
                    self.seq.file_mask = mask;
                }
                self.present_final(status::CE | status::DE);
            }
            _ => {
                // Search: remember the argument, then orient and compare.
                self.seq.search_len = self.seq.buf_len.min(5);
                self.seq.search_arg.copy_from_slice(&self.seq.buf[0..5]);
                self.build_track_plan(self.regs.op);
                self.seq.exec = Exec::Track;
                self.begin_track();
                self.seq.phase = Phase::Exec;
            }
        }
    }

    fn do_seek(&mut self) {
        let b = self.seq.buf;
        let cyl = u16::from(b[2]) << 8 | u16::from(b[3]);
        let head = u16::from(b[4]) << 8 | u16::from(b[5]);
        let Some(geometry) = self.drives[self.unit].as_ref().map(|d| d.geometry()) else {
            self.sense[0] |= sense::SEEK_CHECK;
            self.seq.unit_check = true;
            self.present_final(status::CE | status::DE);
            return;
        };
        let ok = self.seq.buf_len == 6
            && b[0] == 0
            && b[1] == 0
            && cyl <= geometry.cyls
            && head < geometry.heads as u16;
        if !ok {
            self.sense[0] |= sense::SEEK_CHECK;
            self.seq.unit_check = true;
            self.present_final(status::CE | status::DE);
            return;
        }
        let cur = self.drives[self.unit].as_ref().map_or(0, drive_ckd::CkdDrive::cur_cyl);
        let target = if self.regs.op == cmd::SEEK_HEAD {
            u16::from(cur)
        } else {
            cyl
        };
        let diff = u16::from(cur).abs_diff(target).min(255) as u8;
        let dir = if target < u16::from(cur) { 0x80 } else { 0 };
        self.drive_tags(ft::FT_SELECT | ft::FT_SET_CYL, target as u8);
        self.drive_tags(ft::FT_SELECT | ft::FT_SET_HEAD, head as u8 | dir);
        self.drive_tags(ft::FT_SELECT | ft::FT_SET_DIFF, diff);
        self.drive_tags(ft::FT_SELECT | ft::FT_CONTROL, ft::FC_SEEK_START);
        self.regs.ig |= IG_POLL;
        // Channel end now; device end arrives with the attention.
        self.present_final(status::CE);
    }

    fn exec_sense(&mut self) {
        let idx = usize::from(self.seq.sense_idx);
        if self.seq.host_stopped || idx >= self.sense.len() {
            if self.read_chain_idle() {
                self.regs.ig &= !IG_READ;
                self.present_final(status::CE | status::DE);
            }
            return;
        }
        if self.read_chain_idle() {
            let byte = self.sense[idx];
            self.give_host_byte(byte);
            self.seq.sense_idx += 1;
        }
    }

    /// Put the drive interface into the orientation the plan needs.
    fn begin_track(&mut self) {
        self.regs.st &= !ST_SERDES;
        self.index_pulse = false;
        self.am_seen = false;
        self.seq.stage = IoStage::SyncWait;
        self.seq.step_idx = 0;
        self.seq.index_pulses = 0;
        self.seq.compare_equal = true;

        if self.regs.op == cmd::READ_IPL {
            self.drive_tags(ft::FT_SELECT | ft::FT_CONTROL, ft::FC_RETURN_HOME);
        }
        let fc = match self.seq.sync {
            Sync::Am => ft::FC_READ_GATE | ft::FC_SELECT_HEAD | ft::FC_HEAD_ADVANCE,
            _ => ft::FC_READ_GATE | ft::FC_SELECT_HEAD,
        };
        self.regs.ft = ft::FT_SELECT | ft::FT_CONTROL | ft::FT_HEAD_ADVANCE;
        self.regs.fc = fc;
        self.drive_tags(self.regs.ft, self.regs.fc);
        if self.seq.sync == Sync::InPlace {
            self.seq.stage = IoStage::Sentinel;
        }
        if self.plan_writes() {
            self.seq.pump_pos = 0;
            self.seq.length_from_count = false;
            self.seq.host_bytes_left = match self.regs.op {
                cmd::WRITE_HA => 5,
                cmd::WRITE_KD => u16::from(self.regs.kl)
                    + (u16::from(self.regs.dh) << 8 | u16::from(self.regs.dl)),
                cmd::WRITE_DATA => u16::from(self.regs.dh) << 8 | u16::from(self.regs.dl),
                _ => {
                    // Write R0 / Write CKD: the count field announces the
                    // key and data lengths as it arrives.
                    self.seq.length_from_count = true;
                    8
                }
            };
            if self.seq.host_bytes_left > 0 {
                self.regs.ig |= IG_WRITE;
            }
        }
        if self.regs.ig & IG_READ == 0 && self.plan_reads() {
            self.regs.ig |= IG_READ;
        }
    }

    fn plan_writes(&self) -> bool {
        self.seq.steps.iter().any(|s| matches!(s.action, Action::FromHost))
    }

    fn plan_reads(&self) -> bool {
        self.seq.steps.iter().any(|s| matches!(s.action, Action::ToHost))
    }

    fn build_track_plan(&mut self, op: u8) {
        use Action::{Compare, FromHost, Skip, ToHost};
        use FieldKind::{Count, Data, Ha, Key};
        let base = op & !cmd::MT;
        let in_place_read = self.seq.prev == PrevOp::SearchIdHit;
        let (sync, erase, steps): (Sync, bool, Vec<Step>) = match base {
            cmd::READ_HA => (Sync::Index, false, vec![step(Ha, ToHost)]),
            cmd::SEARCH_HA_EQ => (Sync::Index, false, vec![step(Ha, Compare)]),
            cmd::READ_R0 => (
                Sync::Index,
                false,
                vec![step(Ha, Skip), step(Count, ToHost), step(Key, ToHost), step(Data, ToHost)],
            ),
            cmd::READ_IPL => (
                Sync::Index,
                false,
                vec![
                    step(Ha, Skip),
                    step(Count, Skip),
                    step(Key, Skip),
                    step(Data, Skip),
                    step(Count, Skip),
                    step(Key, Skip),
                    step(Data, ToHost),
                ],
            ),
            cmd::READ_COUNT => (Sync::Am, false, vec![step(Count, ToHost)]),
            cmd::SEARCH_ID_EQ => (Sync::Am, false, vec![step(Count, Compare)]),
            cmd::READ_CKD => (
                Sync::Am,
                false,
                vec![step(Count, ToHost), step(Key, ToHost), step(Data, ToHost)],
            ),
            cmd::READ_KD => (
                Sync::Am,
                false,
                vec![step(Count, Skip), step(Key, ToHost), step(Data, ToHost)],
            ),
            cmd::READ_DATA if in_place_read => {
                (Sync::InPlace, false, vec![step(Key, Skip), step(Data, ToHost)])
            }
            cmd::READ_DATA => (
                Sync::Am,
                false,
                vec![step(Count, Skip), step(Key, Skip), step(Data, ToHost)],
            ),
            cmd::WRITE_HA => (Sync::Index, true, vec![step(Ha, FromHost)]),
            cmd::WRITE_R0 => (
                Sync::InPlace,
                true,
                vec![step(Count, FromHost), step(Key, FromHost), step(Data, FromHost)],
            ),
            cmd::WRITE_CKD => (
                Sync::Am,
                true,
                vec![step(Count, FromHost), step(Key, FromHost), step(Data, FromHost)],
            ),
            cmd::WRITE_KD => {
                (Sync::InPlace, false, vec![step(Key, FromHost), step(Data, FromHost)])
            }
            _ => (Sync::InPlace, false, vec![step(Key, Skip), step(Data, FromHost)]),
        };
        self.seq.sync = sync;
        self.seq.erase = erase;
        self.seq.steps = steps;
    }

    fn exec_track(&mut self) {
        match self.seq.stage {
            IoStage::SyncWait => self.track_sync(),
            IoStage::Sentinel => {
                if self.take_serdes() {
                    self.enter_step();
                }
            }
            IoStage::FieldRead => self.track_field_read(),
            IoStage::FieldWrite => self.track_field_write(),
            IoStage::Ck => {
                if self.take_serdes() {
                    self.seq.ck_left -= 1;
                    if self.seq.ck_left == 0 {
                        self.seq.step_idx += 1;
                        if self.seq.step_idx >= self.seq.steps.len() {
                            self.finish_track();
                        } else {
                            self.seq.stage = IoStage::Sentinel;
                        }
                    }
                }
            }
        }
    }

    fn track_sync(&mut self) {
        if self.index_pulse {
            self.index_pulse = false;
            self.seq.index_pulses += 1;
            // Bytes read before the index no longer matter.
            self.regs.st &= !ST_SERDES;
            match self.seq.sync {
                Sync::Index => {
                    self.seq.stage = IoStage::Sentinel;
                    return;
                }
                Sync::Am => {
                    if self.seq.mt {
                        // Multi-track search: next head, fresh revolution.
                        if !self.mt_advance_head() {
                            return;
                        }
                    } else if self.seq.index_pulses >= 2 {
                        self.sense[1] |= sense::NO_RECORD;
                        self.seq.unit_check = true;
                        self.end_track_io();
                        return;
                    }
                }
                Sync::InPlace => {}
            }
        }
        if self.seq.sync == Sync::Am && self.take_serdes() {
            if self.am_seen {
                // A mark passed, so this valid byte is the address-mark
                // gap sentinel: the count field follows.
                self.am_seen = false;
                self.enter_step();
            } else {
                // Stray valid byte: the index gap stripped the armed
                // search. Arm it again.
                self.arm_am_search();
            }
        }
    }

    fn arm_am_search(&mut self) {
        self.am_seen = false;
        self.drive_tags(
            ft::FT_SELECT | ft::FT_CONTROL,
            ft::FC_READ_GATE | ft::FC_SELECT_HEAD | ft::FC_HEAD_ADVANCE,
        );
    }

    /// Step a multi-track search to the next head. False when the
    /// cylinder is exhausted (the search ends under Unit Check).
    fn mt_advance_head(&mut self) -> bool {
        let (head, heads) = self.drives[self.unit]
            .as_ref()
            .map_or((0, 0), |d| (d.head(), d.geometry().heads));
        if head + 1 >= heads {
            self.sense[1] |= sense::END_CYL;
            self.seq.unit_check = true;
            self.seq.prev = PrevOp::None;
            self.end_track_io();
            return false;
        }
        self.drive_tags(ft::FT_SELECT | ft::FT_SET_HEAD, (head + 1) as u8);
        true
    }

    /// Consume a serdes byte if one is ready.
    fn take_serdes(&mut self) -> bool {
        if self.regs.st & ST_SERDES != 0 {
            self.regs.st &= !ST_SERDES;
            true
        } else {
            false
        }
    }

    /// Begin the step at `step_idx`, skipping key fields that do not exist.
    fn enter_step(&mut self) {
        loop {
            let Some(&Step { kind, action }) = self.seq.steps.get(self.seq.step_idx) else {
                self.finish_track();
                return;
            };
            let len = match kind {
                FieldKind::Ha => 5,
                FieldKind::Count => 8,
                FieldKind::Key => u16::from(self.regs.kl),
                FieldKind::Data => u16::from(self.regs.dh) << 8 | u16::from(self.regs.dl),
            };
            if kind == FieldKind::Key && len == 0 {
                self.seq.step_idx += 1;
                continue;
            }
            self.seq.field_pos = 0;
            self.seq.field_len = len;
            if action == Action::FromHost {
                self.write_gate();
                self.seq.fed = 0;
                self.feed_dr();
                self.seq.stage = IoStage::FieldWrite;
            } else {
                self.seq.stage = IoStage::FieldRead;
            }
            return;
        }
    }

    fn write_gate(&mut self) {
        let mut fc = ft::FC_WRITE_GATE | ft::FC_SELECT_HEAD;
        if self.seq.erase {
            fc |= ft::FC_ERASE_GATE;
        }
        self.regs.fc = fc;
        self.drive_tags(self.regs.ft, fc);
    }

    /// Move the next host byte into DR; a starved transfer pads zeros and
    /// a slow host is an overrun.
    fn feed_dr(&mut self) {
        let pos = self.seq.fed;
        let byte = if let Some(b) = self.seq.host_buf.take() {
            b
        } else {
            if !self.seq.host_stopped {
                self.sense[0] |= sense::OVERRUN;
                self.seq.unit_check = true;
            }
            0
        };
        if self.current_kind() == FieldKind::Count {
            match pos {
                5 => self.regs.kl = byte,
                6 => self.regs.dh = byte,
                7 => self.regs.dl = byte,
                _ => {}
            }
        }
        self.regs.dr = byte;
        self.seq.fed += 1;
    }

    fn current_kind(&self) -> FieldKind {
        self.seq.steps.get(self.seq.step_idx).map_or(FieldKind::Data, |s| s.kind)
    }

    fn track_field_read(&mut self) {
        if self.index_pulse {
            // An armed search that found only the end-of-track count sits
            // here without a byte; give it the rest of its two revolutions
            // from this index.
            if self.seq.sync == Sync::Am && self.seq.step_idx == 0 && self.seq.field_pos == 0 {
                self.index_pulse = false;
                self.regs.st &= !ST_SERDES;
                self.seq.index_pulses += 1;
                if self.seq.mt {
                    if !self.mt_advance_head() {
                        return;
                    }
                } else if self.seq.index_pulses >= 2 {
                    self.sense[1] |= sense::NO_RECORD;
                    self.seq.unit_check = true;
                    self.end_track_io();
                    return;
                }
                self.seq.stage = IoStage::SyncWait;
                self.arm_am_search();
                return;
            }
            self.track_lost();
            return;
        }
        if !self.take_serdes() {
            return;
        }
        let byte = self.regs.dr;
        let pos = self.seq.field_pos;
        let Some(&Step { kind, action }) = self.seq.steps.get(self.seq.step_idx) else {
            return;
        };
        if kind == FieldKind::Count {
            match pos {
                5 => self.regs.kl = byte,
                6 => self.regs.dh = byte,
                7 => self.regs.dl = byte,
                _ => {}
            }
        }
        match action {
            Action::ToHost => {
                if !self.read_chain_idle() {
                    self.sense[0] |= sense::OVERRUN;
                    self.seq.unit_check = true;
                }
                if !self.seq.host_stopped {
                    self.give_host_byte(byte);
                }
            }
            Action::Compare => {
                // Home-address compares skip the flag byte.
                let arg_idx = if kind == FieldKind::Ha {
                    pos.checked_sub(1)
                } else {
                    Some(pos)
                };
                if let Some(i) = arg_idx
                    && i < u16::from(self.seq.search_len)
                    && self.seq.search_arg[usize::from(i)] != byte
                {
                    self.seq.compare_equal = false;
                }
            }
            _ => {}
        }
        self.seq.field_pos += 1;
        if self.seq.field_pos >= self.seq.field_len {
            self.seq.ck_left = 2;
            self.seq.stage = IoStage::Ck;
        }
    }

    fn track_field_write(&mut self) {
        if self.index_pulse {
            self.track_lost();
            return;
        }
        if !self.take_serdes() {
            return;
        }
        // A serdes tick in write mode means DR was consumed.
        self.seq.field_pos += 1;
        if self.seq.fed < self.seq.field_len {
            self.feed_dr();
            return;
        }
        if self.seq.field_pos >= self.seq.field_len {
            self.seq.step_idx += 1;
            match self.seq.steps.get(self.seq.step_idx).map(|s| s.action) {
                Some(Action::FromHost) => self.enter_step(),
                Some(_) => {
                    // Back to the read side for the next field's sentinel.
                    self.regs.fc = ft::FC_READ_GATE | ft::FC_SELECT_HEAD;
                    self.drive_tags(self.regs.ft, self.regs.fc);
                    self.seq.stage = IoStage::Sentinel;
                }
                None => self.finish_track(),
            }
        }
    }

    /// The index point interrupted a field: orientation is gone.
    fn track_lost(&mut self) {
        self.index_pulse = false;
        self.sense[1] |= sense::NO_RECORD;
        self.seq.unit_check = true;
        self.end_track_io();
    }

    fn finish_track(&mut self) {
        let op = self.regs.op;
        let base = op & !cmd::MT;
        if base == cmd::SEARCH_HA_EQ || base == cmd::SEARCH_ID_EQ {
            if self.seq.compare_equal {
                self.seq.prev = if base == cmd::SEARCH_ID_EQ {
                    PrevOp::SearchIdHit
                } else {
                    PrevOp::SearchHaHit
                };
                self.end_track_io_with(status::SMS | status::CE | status::DE);
                return;
            }
            if self.seq.mt {
                // Home-address search sees one HA per revolution: move the
                // head now. An ID search keeps scanning records and only
                // switches heads when the index comes around.
                if base == cmd::SEARCH_HA_EQ && !self.mt_advance_head() {
                    return;
                }
                self.seq.compare_equal = true;
                self.seq.step_idx = 0;
                self.seq.index_pulses = 0;
                self.seq.stage = IoStage::SyncWait;
                if self.seq.sync == Sync::Am {
                    self.arm_am_search();
                }
                return;
            }
            self.seq.prev = PrevOp::None;
            self.end_track_io();
            return;
        }

        self.seq.prev = match op {
            cmd::WRITE_HA => PrevOp::WriteHa,
            cmd::WRITE_R0 => PrevOp::WriteR0,
            cmd::WRITE_CKD => PrevOp::WriteCkd,
            _ => PrevOp::None,
        };
        self.end_track_io();
    }

    fn end_track_io(&mut self) {
        self.end_track_io_with(status::CE | status::DE);
    }

    fn end_track_io_with(&mut self, st: u8) {
        self.regs.ig &= !(IG_READ | IG_WRITE);
        self.regs.fc = 0;
        self.present_final(st);
    }

    /// Address-Out into a running transfer: disconnect and stack the end.
    fn halt_io(&mut self) {
        self.regs.er |= ER_HALT;
        self.regs.ig &= !(IG_READ | IG_WRITE | IG_STATUS);
        self.regs.ig |= IG_DROP_OPR_IN | IG_QUEUED;
        self.regs.fc = 0;
        self.pending_status = Some(status::CE | status::DE);
        self.pending_unit = self.unit as u8;
        self.seq.phase = Phase::Idle;
        self.seq.exec = Exec::None;
        self.addressed = false;
        // Stay off the interface until the halting Address-Out falls.
        self.halt_hold = true;
    }

    /// Ending housekeeping after the last status byte was taken.
    fn release(&mut self) {
        self.regs.ig &= !(IG_READ | IG_WRITE | IG_ADR_IN | IG_STATUS);
        self.regs.ig |= IG_DROP_OPR_IN | IG_POLL;
        self.regs.fc = 0;
        self.regs.ft = 0;
        self.addressed = false;
        self.seq.phase = Phase::Idle;
        self.seq.exec = Exec::None;
        self.seq.host_buf = None;
        self.seq.host_stopped = false;
    }

    /// Forward the FT/FC pair to the selected drive.
    pub(crate) fn drive_tags(&mut self, ft_bits: u8, fc_bits: u8) {
        if let Some(drive) = self.drives[self.unit].as_mut() {
            drive.set_tags(ft_bits, fc_bits);
        }
    }
}
