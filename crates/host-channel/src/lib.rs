//! Reference System/360 channel.
//!
//! A timer-free state machine that walks a CCW chain against the devices
//! on its bus-and-tag cable: initial selection, command and status
//! handshakes, data transfer, command/data chaining, TIC (with the
//! status-modifier skip), polling for deferred device end, and the
//! halt-I/O sub-machine. One call to [`HostChannel::start_io`] runs a
//! whole channel program and leaves a CSW in low core, exactly as a CPU
//! would observe it.
//!
//! Every bus tick the channel re-asserts its held out-tags, steps each
//! control unit, then plays the cable terminator: Select-Out that no unit
//! absorbed comes back as Select-In.

pub mod ccw;
pub mod mem;

use ibm_channel::{tag, with_parity, ChannelBus, ChannelDevice};
use mem::Memory;

/// `start_io` result: no device answered the selection.
pub const NO_DEVICE: u16 = 0x100;
/// Result: device answered short busy; low byte carries the status.
pub const BUSY: u16 = 0x200;
/// Result: a device answered with the wrong address.
pub const WRONG_DEVICE: u16 = 0x300;
/// Result: the bus handshake wedged (a modelling failure, not a 360 code).
pub const HUNG: u16 = 0x800;

/// Ticks before a wedged handshake gives up.
const HANG_LIMIT: u32 = 2_000_000;

/// Selection delay before presenting the address, as a real channel's
/// priority logic would impose.
const SELECT_DELAY: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Select,
    Start,
    Cmd,
    Accept,
    Status,
    Data,
    DWait,
    FinalStatus,
    Polling,
    Reselect,
    Addr,
    Ccw,
    Oper,
    HWait,
    HSelect,
    Hs2,
    Halt,
    HWait2,
    WaitOpr,
}

/// The channel with its attached control unit and core storage.
pub struct HostChannel<D: ChannelDevice> {
    pub mem: Memory,
    /// The control unit on the cable.
    pub device: D,
    bus: ChannelBus,
    ticks: u64,
    cmd_addr: u32,
}

impl<D: ChannelDevice> HostChannel<D> {
    #[must_use]
    pub fn new(device: D) -> Self {
        Self {
            mem: Memory::new(),
            device,
            bus: ChannelBus::new(),
            ticks: 0,
            cmd_addr: 0,
        }
    }

    /// Total bus ticks run so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// One bus tick: re-assert held out-tags, run the unit, terminate the
    /// select chain.
    fn cycle(&mut self, out_tags: u16, bus_out: u16) {
        self.bus.tags = (self.bus.tags & tag::IN_TAGS & !tag::SEL_IN) | out_tags;
        self.bus.bus_out = bus_out;
        self.device.step(&mut self.bus);
        if self.bus.up(tag::SEL_OUT) {
            self.bus.raise(tag::SEL_IN);
        } else {
            self.bus.drop(tag::SEL_IN);
        }
        self.ticks += 1;
    }

    fn store_csw(&mut self, status: u8, length_error: bool, residual: u16) {
        self.mem.set_word(mem::CSW, self.cmd_addr & 0x00FF_FFFF);
        self.mem.set_byte(mem::CSW + 4, status);
        self.mem.set_byte(mem::CSW + 5, if length_error { 0x02 } else { 0 });
        self.mem.set_halfword(mem::CSW + 6, residual);
    }

    /// Run a channel program for `device` starting at the address the CAW
    /// in low core points at.
    pub fn start_io_from_caw(&mut self, device: u8, hold_select: bool, halt: bool) -> u16 {
        let caw = self.mem.word(mem::CAW) & 0x00FF_FFFF;
        self.start_io(device, caw, hold_select, halt)
    }

    /// Run a channel program for `device` starting at the CCW `caw` points
    /// at. `hold_select` keeps Select-Out up across the program (selector
    /// channel); `halt` issues Halt I/O once the transfer is under way.
    ///
    /// Returns the ending unit status, or one of [`NO_DEVICE`], [`BUSY`],
    /// [`WRONG_DEVICE`], [`HUNG`].
    pub fn start_io(&mut self, device: u8, caw: u32, hold_select: bool, mut halt: bool) -> u16 {
        self.cmd_addr = caw;
        let first = ccw::Ccw::from_words(
            self.mem.word(self.cmd_addr),
            self.mem.word(self.cmd_addr + 4),
        );
        let mut cmd = first.cmd;
        let mut data_addr = first.addr;
        let mut flags = first.flags;
        let mut data_cnt = first.count;
        self.cmd_addr += 8;

        let mut state = State::Init;
        let mut tags = tag::OPR_OUT;
        let mut bus_out: u16 = 0x100;
        let mut status: u16 = 0;
        let mut length_error = false;
        let mut chan_end = false;
        let mut dly = SELECT_DELAY;
        let mut write_op = first.is_write();

        for _ in 0..HANG_LIMIT {
            self.cycle(tags, bus_out);
            let seen = self.bus.tags;
            let bus_in = self.bus.bus_in;

            match state {
                State::Init => {
                    if dly > 0 {
                        dly -= 1;
                        continue;
                    }
                    tags |= tag::ADR_OUT;
                    bus_out = with_parity(device);
                    state = State::Select;
                }

                State::Select => {
                    tags |= tag::SEL_OUT | tag::HLD_OUT;
                    state = State::Start;
                }

                State::Start => {
                    if seen & tag::SEL_IN != 0 {
                        self.mem.set_word(mem::CSW, self.cmd_addr);
                        return NO_DEVICE;
                    }
                    // Short busy: status-in without operational-in.
                    if seen & (tag::OPR_IN | tag::STA_IN) == tag::STA_IN {
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT | tag::ADR_OUT);
                        self.mem.set_word(mem::CSW, self.cmd_addr);
                        self.mem.set_byte(mem::CSW + 4, bus_in as u8);
                        self.mem.set_byte(mem::CSW + 5, 0);
                        status = BUSY | (bus_in & 0xFF);
                        state = State::WaitOpr;
                        continue;
                    }
                    if seen & tag::OPR_IN != 0 {
                        tags &= !tag::ADR_OUT;
                    }
                    if seen & (tag::ADR_IN | tag::OPR_IN) == (tag::ADR_IN | tag::OPR_IN) {
                        tags &= !tag::SUP_OUT;
                        if bus_in != with_parity(device) {
                            self.mem.set_word(mem::CSW, self.cmd_addr);
                            self.mem.set_byte(mem::CSW + 4, bus_in as u8);
                            self.mem.set_byte(mem::CSW + 5, 0);
                            status = WRONG_DEVICE;
                            state = State::WaitOpr;
                            continue;
                        }
                        if !hold_select {
                            tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        }
                        state = State::Cmd;
                    }
                }

                State::Cmd => {
                    bus_out = with_parity(cmd);
                    if seen & tag::ADR_IN != 0 {
                        tags |= tag::CMD_OUT;
                    }
                    if seen & tag::ADR_IN == 0 {
                        tags &= !tag::CMD_OUT;
                    }
                    if seen & tag::STA_IN != 0 {
                        status = bus_in;
                        state = State::Accept;
                    }
                }

                State::Accept => {
                    tags |= tag::SRV_OUT;
                    state = State::Status;
                }

                State::Status => {
                    if seen & tag::STA_IN != 0 {
                        continue;
                    }
                    tags &= !(tag::SRV_OUT | tag::SUP_OUT);
                    if status & 0xB3 != 0 {
                        self.store_csw(status as u8, false, data_cnt);
                        status &= 0xFF;
                        state = State::WaitOpr;
                        continue;
                    }
                    if status & u16::from(DEV_END) != 0 {
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        if flags & ccw::CC == 0 {
                            self.store_csw(status as u8, length_error, data_cnt);
                            status &= 0xFF;
                            state = State::WaitOpr;
                            continue;
                        }
                        state = State::Ccw;
                        continue;
                    }
                    if status & u16::from(CHAN_END) != 0 {
                        chan_end = true;
                        if flags & ccw::CC == 0 {
                            tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                            self.store_csw(status as u8, length_error, data_cnt);
                            status &= 0xFF;
                            state = State::WaitOpr;
                            continue;
                        }
                        if !hold_select {
                            tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        }
                    }
                    state = State::Data;
                }

                State::Data => {
                    // Device gave up the channel: poll for reselection.
                    if seen & tag::OPR_IN == 0 {
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT | tag::ADR_OUT);
                        if !hold_select {
                            tags &= !tag::SUP_OUT;
                        }
                        state = State::Polling;
                        continue;
                    }
                    if seen & tag::SRV_IN != 0 {
                        if data_cnt == 0 {
                            if flags & ccw::CD != 0 {
                                state = State::Ccw;
                                continue;
                            }
                            // Out of count: stop the device.
                            tags |= tag::CMD_OUT;
                            if flags & ccw::SLI == 0 {
                                length_error = true;
                            }
                            state = State::DWait;
                            continue;
                        }
                        tags |= tag::SRV_OUT;
                        if write_op {
                            bus_out = with_parity(self.mem.byte(data_addr));
                            data_addr += 1;
                        } else {
                            if flags & ccw::SKIP == 0 {
                                self.mem.set_byte(data_addr, bus_in as u8);
                            }
                            bus_out = 0x100;
                            data_addr += 1;
                        }
                        data_cnt -= 1;
                        state = State::DWait;
                    }
                    if seen & tag::STA_IN != 0 {
                        status = bus_in;
                        tags |= tag::SRV_OUT;
                        if flags & ccw::CC != 0 {
                            tags |= tag::SUP_OUT;
                        }
                        state = State::FinalStatus;
                    }
                }

                State::DWait => {
                    if seen & tag::SRV_IN != 0 {
                        continue;
                    }
                    tags &= !(tag::SRV_OUT | tag::CMD_OUT);
                    if data_cnt == 0 && halt && flags & ccw::CD != 0 {
                        dly = 20;
                        halt = false;
                        state = State::HWait;
                    } else {
                        state = State::Data;
                    }
                }

                State::FinalStatus => {
                    if seen & (tag::STA_IN | tag::SRV_IN) != 0 {
                        continue;
                    }
                    tags &= !(tag::SRV_OUT | tag::CMD_OUT);
                    if !chan_end && data_cnt != 0 && flags & ccw::SLI == 0 {
                        length_error = true;
                    }
                    if status & 0xB3 != 0 {
                        self.store_csw(status as u8, length_error, data_cnt);
                        status &= 0xFF;
                        state = State::WaitOpr;
                        continue;
                    }
                    if length_error {
                        self.store_csw(status as u8, true, data_cnt);
                        status &= 0xFF;
                        state = State::WaitOpr;
                        continue;
                    }
                    if status & u16::from(DEV_END) != 0 {
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        if flags & ccw::CC == 0 {
                            self.store_csw(status as u8, length_error, data_cnt);
                            status &= 0xFF;
                            state = State::WaitOpr;
                            continue;
                        }
                        state = State::Ccw;
                        continue;
                    }
                    if status & u16::from(CHAN_END) != 0 {
                        if flags & ccw::CC == 0 {
                            tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                            self.store_csw(status as u8, length_error, data_cnt);
                            status &= 0xFF;
                            state = State::WaitOpr;
                            continue;
                        }
                        if halt {
                            dly = 20;
                            halt = false;
                            state = State::HWait;
                            continue;
                        }
                        if !hold_select {
                            tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        }
                        state = State::Data;
                    }
                }

                State::Polling => {
                    if seen & tag::REQ_IN != 0 {
                        tags |= tag::SEL_OUT | tag::HLD_OUT;
                        bus_out = 0x100;
                        state = State::Reselect;
                    }
                }

                State::Reselect => {
                    if seen & (tag::ADR_IN | tag::OPR_IN) == (tag::ADR_IN | tag::OPR_IN) {
                        if bus_in != with_parity(device) {
                            self.store_csw((bus_in & 0xFF) as u8, false, data_cnt);
                            status = WRONG_DEVICE;
                            state = State::WaitOpr;
                            continue;
                        }
                        if !hold_select {
                            tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        }
                        bus_out = 0x100;
                        tags |= tag::CMD_OUT;
                        state = State::Addr;
                    }
                }

                State::Addr => {
                    if seen & tag::ADR_IN == 0 {
                        tags &= !tag::CMD_OUT;
                        state = State::Data;
                    }
                }

                State::Ccw => {
                    if status & u16::from(SMS) != 0 {
                        self.cmd_addr += 8;
                        status &= !u16::from(SMS);
                    }
                    let next = ccw::Ccw::from_words(
                        self.mem.word(self.cmd_addr),
                        self.mem.word(self.cmd_addr + 4),
                    );
                    self.cmd_addr += 8;
                    if next.cmd == ccw::TIC {
                        self.cmd_addr = next.addr;
                        continue;
                    }
                    if flags & ccw::CD != 0 {
                        // Data chain: same command, fresh buffer.
                        data_addr = next.addr;
                        flags = next.flags;
                        data_cnt = next.count;
                        state = State::Data;
                        continue;
                    }
                    cmd = next.cmd;
                    write_op = next.is_write();
                    data_addr = next.addr;
                    flags = next.flags;
                    data_cnt = next.count;
                    length_error = false;
                    chan_end = false;
                    state = State::Oper;
                }

                State::Oper => {
                    if seen & tag::OPR_IN == 0 {
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        dly = SELECT_DELAY;
                        state = State::Init;
                    }
                }

                State::HWait => {
                    if dly > 0 {
                        dly -= 1;
                        continue;
                    }
                    self.store_csw(status as u8, length_error, data_cnt);
                    if seen & tag::OPR_IN == 0 {
                        state = State::HSelect;
                    } else {
                        state = State::Halt;
                    }
                }

                State::HSelect => {
                    tags |= tag::ADR_OUT;
                    bus_out = with_parity(device);
                    state = State::Hs2;
                }

                State::Hs2 => {
                    tags |= tag::SEL_OUT | tag::HLD_OUT;
                    state = State::Halt;
                }

                State::Halt => {
                    if seen & tag::SEL_IN != 0 {
                        self.mem.set_word(mem::CSW, self.cmd_addr);
                        return NO_DEVICE;
                    }
                    if seen & (tag::STA_IN | tag::OPR_IN) != 0 {
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        tags |= tag::ADR_OUT;
                        bus_out = with_parity(device);
                        state = State::HWait2;
                    }
                }

                State::HWait2 => {
                    if seen & (tag::OPR_IN | tag::STA_IN) == 0 {
                        tags &= !(tag::ADR_OUT | tag::SUP_OUT);
                        if flags & ccw::CC != 0 {
                            return status;
                        }
                        state = State::Polling;
                    }
                }

                State::WaitOpr => {
                    tags &= !(tag::SEL_OUT
                        | tag::HLD_OUT
                        | tag::SRV_OUT
                        | tag::ADR_OUT
                        | tag::SUP_OUT);
                    if seen & (tag::OPR_IN | tag::STA_IN | tag::SRV_IN) == 0 {
                        return status;
                    }
                }
            }
        }
        HUNG
    }

    /// Issue Test I/O: select, command zero, take the status.
    pub fn test_io(&mut self, device: u8) -> u16 {
        let mut state = State::Init;
        let mut tags = tag::OPR_OUT;
        let mut bus_out: u16 = 0x100;
        let mut status: u16 = 0;

        for _ in 0..HANG_LIMIT {
            self.cycle(tags, bus_out);
            let seen = self.bus.tags;
            let bus_in = self.bus.bus_in;

            match state {
                State::Init => {
                    tags |= tag::ADR_OUT;
                    bus_out = with_parity(device);
                    state = State::Select;
                }
                State::Select => {
                    tags |= tag::SEL_OUT | tag::HLD_OUT;
                    state = State::Start;
                }
                State::Start => {
                    if seen & tag::SEL_IN != 0 {
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        return NO_DEVICE;
                    }
                    if seen & (tag::OPR_IN | tag::STA_IN) == tag::STA_IN {
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT | tag::ADR_OUT);
                        status = BUSY | (bus_in & 0xFF);
                        state = State::WaitOpr;
                        continue;
                    }
                    if seen & tag::OPR_IN != 0 {
                        tags &= !tag::ADR_OUT;
                    }
                    if seen & (tag::ADR_IN | tag::OPR_IN) == (tag::ADR_IN | tag::OPR_IN) {
                        if bus_in != with_parity(device) {
                            status = WRONG_DEVICE;
                            state = State::WaitOpr;
                            continue;
                        }
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT);
                        state = State::Cmd;
                    }
                }
                State::Cmd => {
                    bus_out = 0x100;
                    if seen & tag::ADR_IN != 0 {
                        tags |= tag::CMD_OUT;
                    }
                    if seen & tag::ADR_IN == 0 {
                        tags &= !tag::CMD_OUT;
                    }
                    if seen & tag::STA_IN != 0 {
                        status = bus_in;
                        state = State::Accept;
                    }
                }
                State::Accept => {
                    tags |= tag::SRV_OUT;
                    state = State::Status;
                }
                State::Status => {
                    if seen & (tag::STA_IN | tag::SRV_IN) != 0 {
                        continue;
                    }
                    tags &= !(tag::SRV_OUT | tag::SUP_OUT);
                    status &= 0xFF;
                    state = State::WaitOpr;
                }
                State::WaitOpr => {
                    tags &= !(tag::SEL_OUT
                        | tag::HLD_OUT
                        | tag::SRV_OUT
                        | tag::ADR_OUT
                        | tag::SUP_OUT);
                    if seen & (tag::OPR_IN | tag::STA_IN | tag::SRV_IN) == 0 {
                        return status;
                    }
                }
                // Test I/O never leaves the selection states.
                _ => {}
            }
        }
        HUNG
    }

    /// Wait for a device holding deferred status to request the channel
    /// and take its ending status. Stores the status byte at 0x44.
    pub fn wait_dev(&mut self, device: u8) -> u16 {
        let mut state = State::Data;
        let mut tags = tag::OPR_OUT;
        let mut bus_out: u16 = 0x100;
        let mut status: u16 = 0;

        for _ in 0..HANG_LIMIT {
            self.cycle(tags, bus_out);
            let seen = self.bus.tags;
            let bus_in = self.bus.bus_in;

            match state {
                State::Data => {
                    if seen & tag::OPR_IN == 0 {
                        tags &= !(tag::SEL_OUT | tag::HLD_OUT | tag::ADR_OUT);
                        state = State::Polling;
                        continue;
                    }
                    if seen & tag::SRV_IN != 0 {
                        tags |= tag::SRV_OUT;
                        state = State::DWait;
                    }
                    if seen & tag::STA_IN != 0 {
                        status = bus_in & 0xFF;
                        tags |= tag::SRV_OUT;
                        state = State::FinalStatus;
                    }
                }
                State::DWait => {
                    if seen & tag::SRV_IN != 0 {
                        continue;
                    }
                    tags &= !(tag::SRV_OUT | tag::CMD_OUT);
                    state = State::Data;
                }
                State::FinalStatus => {
                    if seen & (tag::STA_IN | tag::SRV_IN) != 0 {
                        continue;
                    }
                    tags &= !(tag::SRV_OUT | tag::CMD_OUT);
                    self.mem.set_byte(mem::CSW + 4, status as u8);
                    self.mem.set_byte(mem::CSW + 5, 0);
                    state = State::WaitOpr;
                }
                State::Polling => {
                    if seen & tag::REQ_IN != 0 {
                        tags |= tag::SEL_OUT | tag::HLD_OUT;
                        bus_out = 0x100;
                        state = State::Reselect;
                    }
                }
                State::Reselect => {
                    if seen & (tag::ADR_IN | tag::OPR_IN) == (tag::ADR_IN | tag::OPR_IN) {
                        if bus_in != with_parity(device) {
                            status = WRONG_DEVICE;
                            state = State::WaitOpr;
                            continue;
                        }
                        bus_out = 0x100;
                        tags |= tag::CMD_OUT;
                        state = State::Addr;
                    }
                }
                State::Addr => {
                    if seen & tag::ADR_IN == 0 {
                        tags &= !tag::CMD_OUT;
                        state = State::Data;
                    }
                }
                State::WaitOpr => {
                    tags &= !(tag::SEL_OUT
                        | tag::HLD_OUT
                        | tag::SRV_OUT
                        | tag::ADR_OUT
                        | tag::SUP_OUT);
                    if seen & (tag::OPR_IN | tag::STA_IN | tag::SRV_IN) == 0 {
                        return status;
                    }
                }
                // Wait-device never starts a selection of its own.
                _ => {}
            }
        }
        HUNG
    }
}

/// Unit-status bits as the channel interprets them.
const SMS: u8 = 0x40;
const CHAN_END: u8 = 0x08;
const DEV_END: u8 = 0x04;
