//! A complete storage subsystem: one 2844 control unit with its string of
//! CKD drives behind the reference channel.
//!
//! This crate only assembles the parts; the interesting machinery lives in
//! `ibm-2844` (the control unit), `drive-ckd` (the spindle and byte
//! stream) and `host-channel` (the CCW interpreter). The end-to-end
//! channel-program tests live in this crate's `tests` directory.

pub use drive_ckd;
pub use format_ckd;
pub use host_channel;
pub use ibm_2844;
pub use ibm_channel;
pub use sim_core;

use std::path::Path;

use drive_ckd::{AttachOutcome, DriveError};
use format_ckd::Geometry;
use host_channel::HostChannel;
use ibm_2844::{ControlError, ControlUnit};

/// Channel, control unit and drives, ready to run channel programs.
pub struct System {
    pub chan: HostChannel<ControlUnit>,
}

impl System {
    /// Bring up a control unit at the given channel address.
    pub fn new(addr: u8) -> Result<Self, ControlError> {
        Ok(Self {
            chan: HostChannel::new(ControlUnit::new(addr)?),
        })
    }

    /// The control unit on the cable.
    pub fn cu(&mut self) -> &mut ControlUnit {
        &mut self.chan.device
    }

    /// Attach (or format) an image file as one of the string's drives.
    pub fn attach_image<P: AsRef<Path>>(
        &mut self,
        unit: usize,
        geometry: &'static Geometry,
        path: P,
        init: bool,
    ) -> Result<AttachOutcome, DriveError> {
        self.chan.device.attach_image(unit, geometry, path, init)
    }
}
