//! Channel-side hardwired logic.
//!
//! The part of the 2844 that is combinational hardware rather than
//! microprogram: address decode, the operational-in / address-in /
//! status-in / service-in line drivers, the service-request latch chain
//! (TR1 -> SVC -> TR2 -> Service-In), request-in generation and the
//! short-busy responder. Runs once per bus tick, before the microcycles.

use ibm_channel::{parity_ok, tag, ChannelBus};

use crate::registers::{
    ER_ADR_OUT, ER_PARITY, ER_SHORT_BUSY, IG_ADR_IN, IG_DEV_END, IG_DROP_OPR_IN, IG_POLL,
    IG_QUEUED, IG_READ, IG_STATUS, IG_WRITE,
};
use crate::status;
use crate::ControlUnit;

impl ControlUnit {
    pub(crate) fn channel_step(&mut self, bus: &mut ChannelBus) {
        // Loss of Operational-Out is a system reset.
        if !bus.any(tag::OPR_OUT | tag::SUP_OUT) {
            if self.selected {
                bus.drop(tag::OPR_IN | tag::ADR_IN | tag::SRV_IN | tag::STA_IN);
            }
            self.channel_reset();
            return;
        }

        // Snapshot the wires for the microcycles.
        self.bus_out = bus.bus_out as u8;
        self.bus_out_good = parity_ok(bus.bus_out);
        self.tags = bus.tags;

        // Address decode while Address-Out is up.
        if bus.up(tag::ADR_OUT) {
            if bus.bus_out & 0xF0 == u16::from(self.addr) && self.bus_out_good {
                if self.status_stacked() && !self.selected && !self.halt_hold {
                    // Stacked status: answer short busy without engaging.
                    bus.set_in(status::BUSY | status::SMS);
                    bus.raise(tag::STA_IN);
                    self.sta_in = true;
                    self.short_busy = true;
                    self.addressed = false;
                    self.regs.er |= ER_SHORT_BUSY;
                    bus.drop(tag::SEL_OUT);
                } else {
                    self.addressed = true;
                    self.regs.er |= ER_ADR_OUT;
                }
            } else {
                self.addressed = false;
            }
        } else {
            if self.short_busy {
                bus.drop(tag::STA_IN);
                self.sta_in = false;
                self.short_busy = false;
            }
            self.halt_hold = false;
            self.regs.er &= !ER_ADR_OUT;
        }

        // Microprogram asked to drop operational-in.
        if self.regs.ig & IG_DROP_OPR_IN != 0 {
            self.opr_in = false;
            self.regs.ig &= !IG_DROP_OPR_IN;
            bus.drop(tag::OPR_IN);
        }

        // Halt disconnect: the service chain dies with the transfer.
        if self.halt_hold {
            self.svc_req = false;
            self.tr_2 = false;
            self.srv_in = false;
            self.byte_taken = false;
            bus.drop(tag::SRV_IN);
        }

        // Status-in follows the IG latch.
        if self.regs.ig & IG_STATUS == 0 && self.sta_in && !self.short_busy {
            bus.drop(tag::STA_IN);
            self.sta_in = false;
        }

        // Selection = select-out while addressed.
        self.selected = bus.up(tag::SEL_OUT) && self.addressed;

        if self.addressed {
            if self.regs.ig & IG_ADR_IN != 0 {
                bus.raise(tag::ADR_IN);
                bus.set_in(self.regs.dw);
                self.opr_in = true;
                self.tr_1 = false;
            } else {
                bus.drop(tag::ADR_IN);
            }
        }

        if self.opr_in {
            if self.regs.ig & IG_ADR_IN == 0 && bus.any(tag::ADR_IN) {
                bus.drop(tag::ADR_IN);
            }
            if self.regs.ig & IG_STATUS != 0 {
                bus.raise(tag::STA_IN);
                self.sta_in = true;
                bus.set_in(self.regs.dw);
            } else if !self.short_busy {
                bus.drop(tag::STA_IN);
                self.sta_in = false;
            }
            bus.raise(tag::OPR_IN);
            self.regs.er &= !ER_SHORT_BUSY;
        }

        // Request-in and the poll response.
        if !self.selected && self.request {
            bus.raise(tag::REQ_IN);
        }
        if self.request && bus.up(tag::REQ_IN | tag::SEL_OUT) && !bus.any(tag::ADR_OUT) {
            bus.drop(tag::REQ_IN);
            bus.raise(tag::OPR_IN);
            self.request = false;
            self.addressed = true;
            self.selected = true;
        }
        if !self.selected {
            if self.regs.ig & (IG_QUEUED | IG_DEV_END) != 0 {
                self.request = true;
            }
            if self.regs.ig & IG_POLL != 0 && self.regs.sc != 0 {
                self.request = true;
            }
            if self.request {
                bus.raise(tag::REQ_IN);
            }
        }

        // Data transfer latch chain while selected.
        if self.selected {
            bus.drop(tag::SEL_OUT);

            if self.bus_out_good {
                self.regs.er &= !ER_PARITY;
            } else {
                self.regs.er |= ER_PARITY;
            }

            self.tr_2 = self.svc_req;
            if self.srv_in {
                self.svc_req = false;
            }
            let read = self.regs.ig & IG_READ != 0;
            let write = self.regs.ig & IG_WRITE != 0;
            if (read && self.tr_1) || (write && (!self.srv_in || self.tr_1)) {
                self.svc_req = true;
            }
            if self.tr_2 && !self.srv_in {
                self.srv_in = true;
                bus.raise(tag::SRV_IN);
                bus.set_in(self.regs.dw);
            }
            if (self.tr_1 && !read)
                || (read && bus.any(tag::SRV_OUT) && !self.tr_2)
                || (!read && bus.any(tag::CMD_OUT) && self.srv_in)
            {
                self.srv_in = false;
                self.byte_taken = false;
                bus.drop(tag::SRV_IN);
            }
            self.tr_1 = false;
        }
    }

    /// A status byte is waiting to be presented, now or via the poll path.
    pub(crate) fn status_stacked(&self) -> bool {
        self.regs.ig & IG_STATUS != 0 || self.pending_status.is_some()
    }

    /// The host offered a data byte we have not yet latched.
    pub(crate) fn host_byte_ready(&self) -> bool {
        self.srv_in && self.tags & tag::SRV_OUT != 0 && !self.byte_taken
    }

    /// Latch the offered byte; the drop of service-in re-arms the chain.
    pub(crate) fn take_host_byte(&mut self) -> u8 {
        self.byte_taken = true;
        self.tr_1 = true;
        if !self.bus_out_good {
            self.xfer_parity_bad = true;
        }
        self.bus_out
    }

    /// Hand a byte to the host: DW onto bus-in at the next service-in.
    pub(crate) fn give_host_byte(&mut self, byte: u8) {
        self.regs.dw = byte;
        self.tr_1 = true;
    }

    /// The read-side latch chain has drained; safe to queue another byte.
    pub(crate) fn read_chain_idle(&self) -> bool {
        !self.srv_in && !self.svc_req && !self.tr_2 && !self.tr_1
    }
}
