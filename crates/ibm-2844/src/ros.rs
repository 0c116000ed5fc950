//! ROS microinstruction interpreter.
//!
//! One [`step`] reads the word at WX, computes the next address from the
//! X6/X7 branch-bit sources, gates a register onto the A bus and one of
//! `{0, BY, CK, DR}` onto the B bus, runs the 8-bit ALU, writes the
//! destination, and finally applies the CS status-bit mutator. Everything
//! outside the register bank (channel tags, the serdes, the drive cable)
//! is reached through [`RosPort`].

use ibm_channel::tag;

use crate::cros::Microword;
use crate::registers::{Registers, BIT0, BIT2, BIT4, BIT6, ST_CARRY, ST_DATA_MOVE, ST_INDEX};

/// The control unit's hardware outside the register bank, as the
/// microword decode sees it.
pub trait RosPort {
    /// Current channel tag lines.
    fn chan_tags(&self) -> u16;
    /// Latched bus-out byte.
    fn bus_out(&self) -> u8;
    /// Device is selected on the channel.
    fn selected(&self) -> bool;
    /// Service-in latch state.
    fn srv_in(&self) -> bool;
    /// Transfer-1 latch state.
    fn tr1(&self) -> bool;
    /// An index pulse has been sensed.
    fn index(&self) -> bool;
    /// Reading IH or DR announces "data taken" (sets transfer-1).
    fn note_data_taken(&mut self);
    /// Reading ER clears service-in.
    fn note_er_read(&mut self);
    /// Writing IG with the write latch may raise an internal service
    /// request at once.
    fn raise_svc_req(&mut self);
    /// Acknowledge the index latch (CS `1 -> ST1`).
    fn clear_index(&mut self);
    /// FT/FC pair updated; forward down the drive cable.
    fn drive_tags(&mut self, ft: u8, fc: u8);
    /// UR written; reselect the drive.
    fn select_unit(&mut self, unit: u8);
    /// Currently selected unit number.
    fn unit_num(&self) -> u8;
    /// A drive is fitted at the selected unit.
    fn drive_present(&self) -> bool;
    /// Old-address tap: cylinder the selected drive sits on.
    fn cur_cyl(&self) -> u8;
    /// File-status byte of the selected drive.
    fn drive_status(&self) -> u8;
    /// High nibble of the control unit's device address.
    fn addr_nibble(&self) -> u8;
    /// Any gated attention pending.
    fn attention(&self) -> bool;
}

/// Transient ALU results sampled by the branch logic of the next step.
#[derive(Debug, Clone, Copy, Default)]
pub struct AluState {
    pub a_bus: u8,
    pub b_bus: u8,
    pub out: u8,
    pub carry: bool,
    pub d_nzero: bool,
}

/// Execute the microword at `regs.wx` and advance WX.
pub fn step(
    store: &[Microword],
    alu: &mut AluState,
    regs: &mut Registers,
    port: &mut impl RosPort,
) {
    let sal = store[usize::from(regs.wx) % store.len()];

    // Base next address: page bits kept, CN and BP supply the rest.
    let mut next = (regs.wx & 0xE00) | u16::from(sal.cn) | (u16::from(sal.bp) << 8);

    // X6 branch bit.
    match sal.ch {
        0 => {}
        1 => next |= 0x2,
        2 => {
            if regs.st & BIT0 != 0 {
                next |= 0x2;
            }
        }
        3 => {
            if regs.op & BIT6 != 0 {
                next |= 0x2;
            }
        }
        4 => {
            if regs.st & BIT2 != 0 {
                next |= 0x2;
            }
        }
        5 => {
            if regs.st & BIT4 != 0 {
                next |= 0x2;
            }
        }
        6 => {
            if regs.st & BIT6 != 0 {
                next |= 0x2;
            }
        }
        // BUF: buffer installed, always taken.
        7 => next |= 0x2,
        // CK>W: jump table built from the literal's low nibble.
        8 => next = (next & 0x0FD) | (u16::from(sal.ck & 0xF) << 8),
        9 => {
            if alu.carry {
                next |= 0x2;
            }
        }
        10 => {
            if port.chan_tags() & tag::CMD_OUT != 0 {
                next |= 0x2;
            }
        }
        11 => {
            if port.chan_tags() & tag::SUP_OUT != 0 {
                next |= 0x2;
            }
        }
        // ADCPR: address compare, wired true on this model.
        12 => next |= 0x2,
        13 => {
            if regs.op & BIT0 != 0 {
                next |= 0x2;
            }
        }
        14 => {
            if regs.op & BIT2 != 0 {
                next |= 0x2;
            }
        }
        _ => {
            if regs.op & BIT4 != 0 {
                next |= 0x2;
            }
        }
    }

    // X7 branch bit.
    match sal.cl {
        0 => {}
        1 => next |= 0x1,
        2 => {
            if regs.st & ST_CARRY != 0 {
                next |= 0x1;
            }
        }
        3 => {
            if regs.st & crate::registers::ST_OP != 0 {
                next |= 0x1;
            }
        }
        4 => {
            if regs.st & crate::registers::ST_MISC != 0 {
                next |= 0x1;
            }
        }
        5 => {
            if !alu.d_nzero {
                next |= 0x1;
            }
        }
        // A>X handled after the A bus is gated; INLIN unused.
        6 | 7 => {}
        8 => {
            if port.chan_tags() & tag::SRV_OUT != 0 {
                next |= 0x1;
            }
        }
        9 => {
            let read = regs.ig & crate::registers::IG_READ != 0;
            if (port.srv_in() && read)
                || (port.tr1() && read)
                || (port.srv_in() && port.chan_tags() & tag::SRV_OUT != 0)
            {
                next |= 0x1;
            }
        }
        10 => {
            if port.selected() || port.attention() {
                next |= 0x1;
            }
        }
        11 => {
            if regs.op & crate::registers::BIT1 != 0 {
                next |= 0x1;
            }
        }
        12 => {
            if regs.op & crate::registers::BIT3 != 0 {
                next |= 0x1;
            }
        }
        13 => {
            if regs.op & crate::registers::BIT5 != 0 {
                next |= 0x1;
            }
        }
        14 => {
            if regs.st & ST_INDEX != 0 && port.index() {
                next |= 0x1;
            }
        }
        _ => {
            if regs.op & crate::registers::BIT7 != 0 {
                next |= 0x1;
            }
        }
    }

    regs.wx = next;

    // B bus.
    alu.b_bus = match sal.cb {
        0 => 0,
        1 => regs.by,
        2 => sal.ck,
        _ => regs.dr,
    };

    // A bus.
    alu.a_bus = match sal.ca {
        0x00 => 0,
        0x01 => regs.gl,
        0x02 => regs.by,
        0x03 => {
            // IH: raw channel bus-out; reading it reports data taken.
            port.note_data_taken();
            port.bus_out()
        }
        0x04 => regs.fr,
        0x05 => regs.kl,
        0x06 => regs.dl,
        0x07 => regs.dh,
        0x08 => regs.op,
        0x09 => regs.gp,
        0x0A => regs.sp,
        0x0B => regs.dw,
        0x0C => regs.wh,
        0x0D => regs.wl,
        // SW: controller switches, absent here.
        0x0E => 0,
        0x0F => regs.bc,
        // STP: stop switches, absent.
        0x10 => 0,
        0x11 => regs.sc,
        0x12 => {
            // FS: drive file status, gated by the control tag.
            if regs.ft & drive_ckd::tags::FT_CONTROL != 0 && port.drive_present() {
                port.drive_status()
            } else {
                0
            }
        }
        0x13 => regs.bx,
        0x14 => {
            if regs.ig & crate::registers::IG_READ != 0 {
                port.note_data_taken();
            }
            regs.dr
        }
        0x15 => {
            port.note_er_read();
            regs.er
        }
        0x16 => regs.ie & 0x1E,
        0x17 => port.cur_cyl(),
        0x18 => regs.cx,
        0x19 => {
            // IS: unit-address nibble plus fitted/attention summary bits.
            let mut v = port.addr_nibble() & 0xF0;
            if port.attention() {
                v |= 0x01;
            }
            if port.drive_present() {
                v |= 0x04;
            }
            if port.unit_num() == 0 {
                v |= 0x08;
            }
            v
        }
        0x1A => regs.ur,
        0x1B => (0x100u16 >> port.unit_num()) as u8,
        _ => 0,
    };

    // A>X: the A bus replaces the low byte of the next address.
    if sal.cl == 6 {
        regs.wx = (regs.wx & 0xF00) | u16::from(alu.a_bus);
    }

    // ALU.
    let b_bus = if sal.cv != 0 { !alu.b_bus } else { alu.b_bus };
    let carry_in = match sal.cc {
        6 => u8::from(regs.st & ST_CARRY != 0),
        1 | 5 => 1,
        _ => 0,
    };
    let mut carries: u8 = 0;
    alu.out = match sal.cc {
        0 | 1 | 4 | 5 | 6 => {
            let sum = alu.a_bus.wrapping_add(b_bus).wrapping_add(carry_in);
            carries = (alu.a_bus & b_bus) | ((alu.a_bus ^ b_bus) & !sum);
            sum
        }
        2 => alu.a_bus & b_bus,
        3 => alu.a_bus | b_bus,
        _ => alu.a_bus ^ b_bus,
    };
    alu.b_bus = b_bus;
    alu.d_nzero = alu.out != 0;
    alu.carry = carries & 0x80 != 0;

    // Destination.
    match sal.cd {
        0x01 => regs.gl = alu.out,
        0x02 => regs.by = alu.out,
        0x04 => regs.fr = alu.out,
        0x05 => regs.kl = alu.out,
        0x06 => regs.dl = alu.out,
        0x07 => regs.dh = alu.out,
        0x08 => regs.op = alu.out,
        0x09 => regs.gp = alu.out,
        0x0A => {
            regs.ur = alu.out;
            port.select_unit(alu.out & 0x07);
        }
        0x0B => regs.dw = alu.out,
        0x0C => regs.dr = alu.out,
        0x0D => {
            // FT: the microprogram's set/clear convention rides on CN bit 2.
            regs.ft &= !alu.out;
            if sal.cn & 4 != 0 {
                regs.ft |= alu.out;
            }
            port.drive_tags(regs.ft, regs.fc);
        }
        0x0E => {
            regs.fc &= !alu.out;
            if sal.cn & 4 != 0 {
                regs.fc |= alu.out;
            }
            port.drive_tags(regs.ft, regs.fc);
        }
        0x0F => {
            regs.ig = alu.out;
            if regs.ig & crate::registers::IG_WRITE != 0 && (!port.srv_in() || port.tr1()) {
                port.raise_svc_req();
            }
        }
        0x12 => regs.wh = alu.out,
        0x13 => regs.wl = alu.out,
        0x18 => regs.cx = alu.out,
        0x19 => regs.bx = alu.out,
        0x1A => regs.sp = alu.out,
        0x1C => regs.ie = alu.out,
        _ => {}
    }

    // Carry latch.
    if matches!(sal.cc, 4 | 5 | 6) {
        if alu.carry {
            regs.st |= ST_CARRY;
        } else {
            regs.st &= !ST_CARRY;
        }
    }

    // CS status mutator.
    match sal.cs {
        0x01 => regs.st &= !crate::registers::ST_SERDES,
        0x02 => regs.st &= !ST_INDEX,
        0x03 => {
            regs.st |= ST_INDEX;
            port.clear_index();
        }
        0x04 => regs.st &= !BIT0,
        0x05 => regs.st |= BIT0,
        0x06 => regs.st &= !crate::registers::ST_OP,
        0x07 => regs.st |= crate::registers::ST_OP,
        0x08 => regs.st &= !ST_DATA_MOVE,
        0x09 => {
            if alu.d_nzero {
                regs.st |= ST_DATA_MOVE;
            }
        }
        0x0A => regs.st &= !ST_CARRY,
        0x0B => regs.st |= ST_CARRY,
        0x0C => regs.st &= !BIT6,
        0x0D => regs.st |= BIT6,
        0x0E => regs.st &= !crate::registers::ST_MISC,
        0x0F => regs.st |= crate::registers::ST_MISC,
        _ => {}
    }
}

/// Step the engine from reset until it parks on `idle`, or give up.
pub fn run_bringup(
    store: &[Microword],
    alu: &mut AluState,
    regs: &mut Registers,
    port: &mut impl RosPort,
    idle: u16,
    limit: usize,
) -> bool {
    regs.wx = 0;
    for _ in 0..limit {
        step(store, alu, regs, port);
        if regs.wx == idle {
            return true;
        }
    }
    false
}
