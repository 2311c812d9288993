//! Common Isochronous Packet headers.
//!
//! Two quadlets prefix every AMDTP payload:
//!
//! ```text
//! word 0: 0ss sssssd dddddddd dddddddd xxcccccc
//!         bits 24..29 source node id, 16..23 data block size in
//!         quadlets, 0..7 data block counter
//! word 1: 1EFFFFFF ffffffff ssssssss ssssssss
//!         bit 31 EOH, 24..29 FMT (0x10 for AM824), 16..23 FDF
//!         (the SFC code, or 0xff for a NO-DATA packet), 0..15 SYT
//! ```

use bitflags::bitflags;

use crate::sfc::Sfc;

/// Bus clock ticks per isochronous cycle.
pub const TICKS_PER_CYCLE: u32 = 3072;
/// Isochronous cycles per second.
pub const CYCLES_PER_SECOND: u32 = 8000;
/// Bus clock ticks per second.
pub const TICKS_PER_SECOND: u32 = TICKS_PER_CYCLE * CYCLES_PER_SECOND;

/// Device-side buffering baked into every SYT, in ticks.
pub const TRANSFER_DELAY_TICKS: u32 = 0x2e00;

/// SYT value carrying no timing information.
pub const SYT_NO_INFO: u16 = 0xffff;

/// Isochronous packet tag for CIP-framed packets.
pub const TAG_CIP: u8 = 1;

const CIP_EOH: u32 = 1 << 31;
const CIP_FMT_AM: u32 = 0x10 << 24;
const CIP_FMT_MASK: u32 = 0x3f00_0000;
const CIP_SYT_MASK: u32 = 0x0000_ffff;

const DBS_SHIFT: u32 = 16;
const DBC_MASK: u32 = 0x0000_00ff;

const FDF_MASK: u32 = 0x00ff_0000;
const FDF_SHIFT: u32 = 16;
/// FDF value marking a packet without data blocks.
pub const FDF_NO_DATA: u32 = 0xff;

bitflags! {
    /// Details of the packet transmission method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CipFlags: u32 {
        /// Each packet carries either zero or `syt_interval` data
        /// blocks; without this flag each packet carries about
        /// rate/8000 blocks (non-blocking mode).
        const BLOCKING = 0x01;
        /// Above 96 kHz, run the wire at half the rate with doubled
        /// data blocks, two consecutive samples per logical channel.
        /// Requires blocking mode.
        const HI_DUALWIRE = 0x02;
        /// Timestamps for transmitted packets are taken from received
        /// packets instead of generated locally.
        const SYNC_TO_DEVICE = 0x04;
    }
}

/// Header fields for one transmitted packet.
#[derive(Debug, Clone, Copy)]
pub struct TxHeader {
    /// Local node id pre-shifted to bits 24..29 of word 0.
    pub source_node_id_field: u32,
    pub data_block_quadlets: u32,
    pub data_block_counter: u8,
    /// SFC code, or [`FDF_NO_DATA`].
    pub fdf: u32,
    pub syt: u16,
}

impl TxHeader {
    /// Write the two header quadlets into the head of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        let word0 = self.source_node_id_field
            | (self.data_block_quadlets << DBS_SHIFT)
            | u32::from(self.data_block_counter);
        let word1 = CIP_EOH | CIP_FMT_AM | (self.fdf << FDF_SHIFT) | u32::from(self.syt);
        fwa_core::quadlet::put(buf, 0, word0);
        fwa_core::quadlet::put(buf, 1, word1);
    }
}

/// Header fields recovered from one received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxHeader {
    pub data_block_counter: u8,
    /// Data block size as reported by the device. Known-misreporting
    /// hardware makes this advisory only; block counts are derived
    /// from the payload length instead.
    pub reported_quadlets: u32,
    pub fdf: u32,
    pub syt: u16,
}

impl RxHeader {
    /// Whether the packet announces no data blocks.
    #[inline]
    pub fn is_no_data(&self) -> bool {
        self.fdf == FDF_NO_DATA
    }

    /// The SFC code, unless this is a NO-DATA packet.
    pub fn sfc(&self) -> Option<Sfc> {
        Sfc::from_code(self.fdf & 0x7)
    }
}

/// Push a SYT value later by `delay_ticks`, folding the tick overflow
/// into the cycle bits. NO-INFO passes through untouched.
pub fn add_transfer_delay(syt: u16, delay_ticks: u32) -> u16 {
    if syt == SYT_NO_INFO {
        return syt;
    }
    let mut value = u32::from(syt);
    value += (delay_ticks / TICKS_PER_CYCLE) << 12;
    value += delay_ticks % TICKS_PER_CYCLE;
    (value & 0xffff) as u16
}

/// A header that failed validation, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidCip {
    pub word0: u32,
    pub word1: u32,
}

/// Parse and validate the two CIP header quadlets.
///
/// A valid header has the EOH bit clear in word 0, set in word 1, and
/// FMT announcing AM824.
pub fn parse_header(word0: u32, word1: u32) -> Result<RxHeader, InvalidCip> {
    if word0 & CIP_EOH != 0 || word1 & CIP_EOH == 0 || word1 & CIP_FMT_MASK != CIP_FMT_AM {
        return Err(InvalidCip { word0, word1 });
    }

    Ok(RxHeader {
        data_block_counter: (word0 & DBC_MASK) as u8,
        reported_quadlets: (word0 >> DBS_SHIFT) & 0xff,
        fdf: (word1 & FDF_MASK) >> FDF_SHIFT,
        syt: (word1 & CIP_SYT_MASK) as u16,
    })
}

#[cfg(test)]
mod tests {
    use fwa_core::quadlet;

    use super::*;

    #[test]
    fn test_tx_header_layout() {
        let mut buf = [0u8; 8];
        TxHeader {
            source_node_id_field: 0x3f << 24,
            data_block_quadlets: 9,
            data_block_counter: 0xab,
            fdf: Sfc::S96000.code(),
            syt: 0x1234,
        }
        .write(&mut buf);

        assert_eq!(quadlet::get(&buf, 0), (0x3f << 24) | (9 << 16) | 0xab);
        assert_eq!(quadlet::get(&buf, 1), CIP_EOH | CIP_FMT_AM | (4 << 16) | 0x1234);
    }

    #[test]
    fn test_header_round_trip() {
        let mut buf = [0u8; 8];
        TxHeader {
            source_node_id_field: 0x05 << 24,
            data_block_quadlets: 2,
            data_block_counter: 250,
            fdf: Sfc::S44100.code(),
            syt: 0x0777,
        }
        .write(&mut buf);

        let header = parse_header(quadlet::get(&buf, 0), quadlet::get(&buf, 1)).unwrap();
        assert_eq!(header.data_block_counter, 250);
        assert_eq!(header.reported_quadlets, 2);
        assert_eq!(header.sfc(), Some(Sfc::S44100));
        assert_eq!(header.syt, 0x0777);
        assert!(!header.is_no_data());
    }

    #[test]
    fn test_no_data_header() {
        let mut buf = [0u8; 8];
        TxHeader {
            source_node_id_field: 0,
            data_block_quadlets: 2,
            data_block_counter: 0,
            fdf: FDF_NO_DATA,
            syt: SYT_NO_INFO,
        }
        .write(&mut buf);

        let header = parse_header(quadlet::get(&buf, 0), quadlet::get(&buf, 1)).unwrap();
        assert!(header.is_no_data());
    }

    #[test]
    fn test_add_transfer_delay() {
        // One whole cycle plus 100 ticks of delay.
        let syt = add_transfer_delay(0x1000, TICKS_PER_CYCLE + 100);
        assert_eq!(syt, 0x2000 + 100);

        // NO-INFO carries no time to delay.
        assert_eq!(add_transfer_delay(SYT_NO_INFO, 5000), SYT_NO_INFO);
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        let good0 = (9 << 16) | 1;
        let good1 = CIP_EOH | CIP_FMT_AM | 0x0042;

        // EOH set in word 0.
        assert!(parse_header(good0 | CIP_EOH, good1).is_err());
        // EOH clear in word 1.
        assert!(parse_header(good0, good1 & !CIP_EOH).is_err());
        // FMT not AM824.
        assert!(parse_header(good0, (good1 & !CIP_FMT_MASK) | (0x20 << 24)).is_err());
    }
}
