//! Count-Key-Data disk image format (Hercules `CKD_P370` layout).
//!
//! An image is a 512-byte header followed by `heads * (cyls + 1)` tracks of
//! `track_size` bytes each. Header integers are little-endian; values inside
//! a track (cylinder, head, data length) are big-endian.
//!
//! Each track holds, in order:
//! - Home Address: flag byte + cylinder (2) + head (2)
//! - Record 0, then records 1..n, each led by an 8-byte count field
//!   `cyl(2) head(2) rec(1) klen(1) dlen(2)` followed by `klen` key bytes
//!   and `dlen` data bytes
//! - an end-of-track count field whose first four bytes are `FF FF FF FF`
//! - zero padding out to `track_size`
//!
//! Rotational framing (gaps, address marks, checksums) is synthesized by the
//! drive at read time and never stored in the image.

use std::fmt;

/// Image header length.
pub const HEADER_SIZE: usize = 512;

/// Identifies a CKD image file.
pub const MAGIC: &[u8; 8] = b"CKD_P370";

/// First four bytes of the count field that terminates a track.
pub const END_OF_TRACK: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// Length of a count field.
pub const COUNT_LEN: usize = 8;

/// Length of a home address.
pub const HA_LEN: usize = 5;

/// Fixed characteristics of one drive model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Model name ("2311", ...).
    pub name: &'static str,
    /// Highest cylinder number reachable by a seek.
    pub cyls: u16,
    /// Heads per cylinder.
    pub heads: u32,
    /// Maximum data bytes per track.
    pub bpt: u32,
    /// Sense bytes presented by the attachment.
    pub sense_bytes: u8,
    /// Device-type suffix stored in the header (0x11 for a 2311).
    pub dev_type: u8,
    /// Bytes in the index and post-HA gaps.
    pub gap1: u8,
    /// Bytes in the inter-field gaps.
    pub gap2: u8,
    /// Bus ticks per disk byte.
    pub rate: u8,
}

/// The drive models this attachment understands.
pub const GEOMETRIES: [Geometry; 3] = [
    Geometry {
        name: "2303",
        cyls: 80,
        heads: 10,
        bpt: 4984,
        sense_bytes: 6,
        dev_type: 0x03,
        gap1: 72,
        gap2: 36,
        rate: 13,
    },
    Geometry {
        name: "2311",
        cyls: 203,
        heads: 10,
        bpt: 3717,
        sense_bytes: 6,
        dev_type: 0x11,
        gap1: 36,
        gap2: 18,
        rate: 13,
    },
    Geometry {
        name: "2314",
        cyls: 202,
        heads: 20,
        bpt: 7294,
        sense_bytes: 6,
        dev_type: 0x14,
        gap1: 36,
        gap2: 18,
        rate: 13,
    },
];

impl Geometry {
    /// Look up a model by name.
    #[must_use]
    pub fn by_name(name: &str) -> Option<&'static Geometry> {
        GEOMETRIES.iter().find(|g| g.name == name)
    }

    /// Look up a model by the device-type suffix stored in a header.
    #[must_use]
    pub fn by_dev_type(dev_type: u8) -> Option<&'static Geometry> {
        GEOMETRIES.iter().find(|g| g.dev_type == dev_type)
    }

    /// Stored track length: `bpt` rounded up to a 512-byte multiple.
    #[must_use]
    pub const fn track_size(&self) -> u32 {
        (self.bpt | 0x1FF) + 1
    }

    /// Bytes occupied by one cylinder in the image.
    #[must_use]
    pub const fn cylinder_size(&self) -> u32 {
        self.track_size() * self.heads
    }

    /// Total file length of a full image.
    #[must_use]
    pub const fn image_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.cylinder_size() as u64 * (self.cyls as u64 + 1)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FormatError {
    /// File too short to hold a header.
    TruncatedHeader(usize),
    /// Header does not start with `CKD_P370`.
    BadMagic([u8; 8]),
    /// No known model matches the header's device type.
    UnknownDeviceType(u8),
    /// Header geometry disagrees with the named model.
    GeometryMismatch {
        dev_type: u8,
        heads: u32,
        track_size: u32,
    },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedHeader(len) => {
                write!(f, "image header truncated: {len} bytes (need {HEADER_SIZE})")
            }
            Self::BadMagic(magic) => write!(f, "not a CKD image (magic {magic:02x?})"),
            Self::UnknownDeviceType(t) => write!(f, "unknown device type {t:#04x}"),
            Self::GeometryMismatch {
                dev_type,
                heads,
                track_size,
            } => write!(
                f,
                "header geometry ({heads} heads, {track_size}-byte tracks) \
                 does not match device type {dev_type:#04x}",
            ),
        }
    }
}

impl std::error::Error for FormatError {}

/// The 512-byte image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub heads: u32,
    pub track_size: u32,
    pub dev_type: u8,
    pub file_seq: u8,
    pub high_cyl: u16,
}

impl Header {
    /// Header describing a freshly formatted image of the given model.
    #[must_use]
    pub fn new(geometry: &Geometry) -> Self {
        Self {
            heads: geometry.heads,
            track_size: geometry.track_size(),
            dev_type: geometry.dev_type,
            file_seq: 0,
            high_cyl: geometry.cyls,
        }
    }

    /// Parse and validate a header block.
    ///
    /// The device type must name a known model whose heads and track size
    /// match the stored values. The highest-cylinder field is informational
    /// and not checked.
    pub fn parse(block: &[u8]) -> Result<(Self, &'static Geometry), FormatError> {
        if block.len() < HEADER_SIZE {
            return Err(FormatError::TruncatedHeader(block.len()));
        }
        if &block[0..8] != MAGIC {
            let mut magic = [0u8; 8];
            magic.copy_from_slice(&block[0..8]);
            return Err(FormatError::BadMagic(magic));
        }
        let header = Self {
            heads: u32::from_le_bytes([block[8], block[9], block[10], block[11]]),
            track_size: u32::from_le_bytes([block[12], block[13], block[14], block[15]]),
            dev_type: block[16],
            file_seq: block[17],
            high_cyl: u16::from_le_bytes([block[18], block[19]]),
        };
        let geometry = Geometry::by_dev_type(header.dev_type)
            .ok_or(FormatError::UnknownDeviceType(header.dev_type))?;
        if header.heads != geometry.heads || header.track_size != geometry.track_size() {
            return Err(FormatError::GeometryMismatch {
                dev_type: header.dev_type,
                heads: header.heads,
                track_size: header.track_size,
            });
        }
        Ok((header, geometry))
    }

    /// Serialize to the on-disk block.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut block = [0u8; HEADER_SIZE];
        block[0..8].copy_from_slice(MAGIC);
        block[8..12].copy_from_slice(&self.heads.to_le_bytes());
        block[12..16].copy_from_slice(&self.track_size.to_le_bytes());
        block[16] = self.dev_type;
        block[17] = self.file_seq;
        block[18..20].copy_from_slice(&self.high_cyl.to_le_bytes());
        block
    }
}

/// Bootstrap records laid down on cylinder 0 head 0 of an IPL volume.
pub mod ipl {
    /// IPL1: 4-byte EBCDIC key "IPL1" + 24-byte bootstrap PSW/CCW data.
    pub const IPL1_RECORD: [u8; 28] = [
        0xC9, 0xD7, 0xD3, 0xF1, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0F, 0x03, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    /// Key of the IPL2 record ("IPL2" in EBCDIC); its 144 data bytes are zero.
    pub const IPL2_KEY: [u8; 4] = [0xC9, 0xD7, 0xD3, 0xF2];

    /// Length of the IPL2 data area.
    pub const IPL2_DLEN: u16 = 144;

    /// VOL1: 4-byte key + 80-byte volume label (volid "111111", owner SIMH).
    pub const VOL1_RECORD: [u8; 84] = [
        0xE5, 0xD6, 0xD3, 0xF1, // key "VOL1"
        0xE5, 0xD6, 0xD3, 0xF1, // label id "VOL1"
        0xF1, 0xF1, 0xF1, 0xF1, 0xF1, 0xF1, // volid
        0x40, 0x00, 0x00, 0x00, 0x01, 0x01, // VTOC pointer CCHHR
        0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40,
        0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0xE2, 0xC9, 0xD4, 0xC8, 0x40,
        0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40,
        0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40,
        0x40, 0x40, 0x40, 0x40,
    ];
}

fn push_count(track: &mut Vec<u8>, cyl: u16, head: u16, rec: u8, klen: u8, dlen: u16) {
    track.extend_from_slice(&cyl.to_be_bytes());
    track.extend_from_slice(&head.to_be_bytes());
    track.push(rec);
    track.push(klen);
    track.extend_from_slice(&dlen.to_be_bytes());
}

/// Build the stored form of one freshly formatted track.
///
/// Every track gets a home address and a standard R0 (klen 0, dlen 8, data
/// zero). With `ipl` set (only meaningful on cylinder 0 head 0) the three
/// bootstrap records IPL1/IPL2/VOL1 follow R0.
#[must_use]
pub fn build_track(geometry: &Geometry, cyl: u16, head: u16, ipl: bool) -> Vec<u8> {
    let tsize = geometry.track_size() as usize;
    let mut track = Vec::with_capacity(tsize);

    // Home address
    track.push(0);
    track.extend_from_slice(&cyl.to_be_bytes());
    track.extend_from_slice(&head.to_be_bytes());

    // R0
    push_count(&mut track, cyl, head, 0, 0, 8);
    track.extend_from_slice(&[0u8; 8]);

    if ipl {
        push_count(&mut track, cyl, head, 1, 4, 24);
        track.extend_from_slice(&ipl::IPL1_RECORD);

        push_count(&mut track, cyl, head, 2, 4, ipl::IPL2_DLEN);
        track.extend_from_slice(&ipl::IPL2_KEY);
        track.resize(track.len() + ipl::IPL2_DLEN as usize, 0);

        push_count(&mut track, cyl, head, 3, 4, 80);
        track.extend_from_slice(&ipl::VOL1_RECORD);
    }

    track.extend_from_slice(&END_OF_TRACK);
    track.resize(tsize, 0);
    track
}

/// Build one freshly formatted cylinder (all heads, concatenated).
#[must_use]
pub fn build_cylinder(geometry: &Geometry, cyl: u16, ipl: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(geometry.cylinder_size() as usize);
    for head in 0..geometry.heads {
        buf.extend_from_slice(&build_track(geometry, cyl, head as u16, ipl && head == 0));
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_size_rounds_to_512() {
        let g2311 = Geometry::by_name("2311").expect("known model");
        assert_eq!(g2311.track_size(), 3840);
        let g2314 = Geometry::by_name("2314").expect("known model");
        assert_eq!(g2314.track_size(), 7680);
    }

    #[test]
    fn header_round_trip() {
        let geometry = Geometry::by_name("2314").expect("known model");
        let header = Header::new(geometry);
        let block = header.to_bytes();
        let (parsed, parsed_geometry) = Header::parse(&block).expect("valid header");
        assert_eq!(parsed, header);
        assert_eq!(parsed_geometry.name, "2314");
    }

    #[test]
    fn header_rejects_bad_magic() {
        let geometry = Geometry::by_name("2311").expect("known model");
        let mut block = Header::new(geometry).to_bytes();
        block[0] = b'X';
        assert!(matches!(Header::parse(&block), Err(FormatError::BadMagic(_))));
    }

    #[test]
    fn header_rejects_geometry_mismatch() {
        let geometry = Geometry::by_name("2311").expect("known model");
        let mut header = Header::new(geometry);
        header.heads = 99;
        assert!(matches!(
            Header::parse(&header.to_bytes()),
            Err(FormatError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn header_rejects_truncation() {
        assert!(matches!(
            Header::parse(&[0u8; 100]),
            Err(FormatError::TruncatedHeader(100))
        ));
    }

    #[test]
    fn plain_track_layout() {
        let geometry = Geometry::by_name("2311").expect("known model");
        let track = build_track(geometry, 0x0010, 0x0005, false);
        assert_eq!(track.len(), geometry.track_size() as usize);
        // HA
        assert_eq!(&track[0..5], &[0x00, 0x00, 0x10, 0x00, 0x05]);
        // R0 count
        assert_eq!(&track[5..13], &[0x00, 0x10, 0x00, 0x05, 0x00, 0x00, 0x00, 0x08]);
        // R0 data
        assert_eq!(&track[13..21], &[0u8; 8]);
        // end of track
        assert_eq!(&track[21..25], &END_OF_TRACK);
        assert!(track[25..].iter().all(|&b| b == 0));
    }

    #[test]
    fn ipl_track_layout() {
        let geometry = Geometry::by_name("2314").expect("known model");
        let track = build_track(geometry, 0, 0, true);
        // R1 count after HA + R0
        let r1 = 5 + 8 + 8;
        assert_eq!(&track[r1..r1 + 8], &[0, 0, 0, 0, 1, 4, 0, 24]);
        assert_eq!(&track[r1 + 8..r1 + 8 + 28], &ipl::IPL1_RECORD);
        // R2
        let r2 = r1 + 8 + 28;
        assert_eq!(&track[r2..r2 + 8], &[0, 0, 0, 0, 2, 4, 0, 144]);
        assert_eq!(&track[r2 + 8..r2 + 12], &ipl::IPL2_KEY);
        assert!(track[r2 + 12..r2 + 12 + 144].iter().all(|&b| b == 0));
        // R3
        let r3 = r2 + 8 + 4 + 144;
        assert_eq!(&track[r3..r3 + 8], &[0, 0, 0, 0, 3, 4, 0, 80]);
        assert_eq!(&track[r3 + 8..r3 + 8 + 84], &ipl::VOL1_RECORD);
        assert_eq!(&track[r3 + 8 + 84..r3 + 8 + 88], &END_OF_TRACK);
    }

    #[test]
    fn cylinder_concatenates_heads() {
        let geometry = Geometry::by_name("2311").expect("known model");
        let cylinder = build_cylinder(geometry, 3, false);
        assert_eq!(cylinder.len(), geometry.cylinder_size() as usize);
        let tsize = geometry.track_size() as usize;
        // Head number climbs per track slot
        for head in 0..geometry.heads as usize {
            let track = &cylinder[head * tsize..];
            assert_eq!(&track[0..5], &[0, 0, 3, 0, head as u8]);
        }
    }

    #[test]
    fn ipl_only_on_head_zero() {
        let geometry = Geometry::by_name("2311").expect("known model");
        let cylinder = build_cylinder(geometry, 0, true);
        let tsize = geometry.track_size() as usize;
        let head1 = &cylinder[tsize..];
        // Head 1 has a bare R0 then end-of-track
        assert_eq!(&head1[21..25], &END_OF_TRACK);
    }
}
