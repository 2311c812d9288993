//! Command frame layout.
//!
//! Every request and response is a six-quadlet header followed by zero
//! or more 32-bit parameters:
//!
//! ```text
//! quadlet 0: length of the frame, in quadlets, header included
//! quadlet 1: protocol version (1)
//! quadlet 2: sequence number
//! quadlet 3: command category
//! quadlet 4: command
//! quadlet 5: return value (0 in requests, status in responses)
//! quadlet 6..: parameters
//! ```
//!
//! Quadlets are big-endian on the wire; this module is the only place
//! the byte order is touched.

use fwa_core::quadlet;

use crate::error::{EfcError, Result};

/// Base of the command region the host writes requests to.
pub const COMMAND_ADDR: u64 = 0xecc0_0000_0000;
/// Base of the response region the device writes responses to.
pub const RESPONSE_ADDR: u64 = 0xecc0_8000_0000;
/// Size of the response region in bytes.
pub const RESPONSE_REGION_SIZE: usize = 0x200;

/// Quadlets in the frame header.
pub const HEADER_QUADLETS: usize = 6;
/// Protocol version carried in every frame.
pub const VERSION: u32 = 1;

/// Status code for a successful response.
pub const RETVAL_OK: u32 = 0;

/// Command categories.
pub mod category {
    pub const HWINFO: u32 = 0;
    pub const FLASH: u32 = 1;
    pub const TRANSPORT: u32 = 2;
    pub const HWCTL: u32 = 3;
    pub const IOCONF: u32 = 9;
}

/// Commands within the categories this crate uses.
pub mod command {
    pub const HWINFO_GET_CAPS: u32 = 0;

    pub const TRANSPORT_SET_TX_MODE: u32 = 0;

    pub const HWCTL_SET_CLOCK: u32 = 0;
    pub const HWCTL_GET_CLOCK: u32 = 1;

    pub const IOCONF_GET_ISOC_MAP: u32 = 7;
}

/// One command frame, host-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seqnum: u32,
    pub category: u32,
    pub command: u32,
    pub retval: u32,
    pub params: Vec<u32>,
}

impl Frame {
    /// Build a request frame.
    pub fn request(seqnum: u32, category: u32, command: u32, params: Vec<u32>) -> Self {
        Self {
            seqnum,
            category,
            command,
            retval: 0,
            params,
        }
    }

    /// Total frame length in quadlets.
    pub fn quadlet_count(&self) -> usize {
        HEADER_QUADLETS + self.params.len()
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.quadlet_count() * 4];
        quadlet::put(&mut buf, 0, self.quadlet_count() as u32);
        quadlet::put(&mut buf, 1, VERSION);
        quadlet::put(&mut buf, 2, self.seqnum);
        quadlet::put(&mut buf, 3, self.category);
        quadlet::put(&mut buf, 4, self.command);
        quadlet::put(&mut buf, 5, self.retval);
        for (i, &param) in self.params.iter().enumerate() {
            quadlet::put(&mut buf, HEADER_QUADLETS + i, param);
        }
        buf
    }

    /// Decode wire bytes.
    ///
    /// The buffer may be longer than the frame (the device writes into
    /// a fixed-size region); trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if quadlet::count(buf) < HEADER_QUADLETS {
            return Err(EfcError::Malformed(format!("frame of {} bytes is too short", buf.len())));
        }

        let length = quadlet::get(buf, 0) as usize;
        if length < HEADER_QUADLETS || length > quadlet::count(buf) {
            return Err(EfcError::Malformed(format!("bad length field {length}")));
        }

        let version = quadlet::get(buf, 1);
        if version != VERSION {
            return Err(EfcError::Malformed(format!("unknown protocol version {version}")));
        }

        let params = (HEADER_QUADLETS..length).map(|i| quadlet::get(buf, i)).collect();
        Ok(Self {
            seqnum: quadlet::get(buf, 2),
            category: quadlet::get(buf, 3),
            command: quadlet::get(buf, 4),
            retval: quadlet::get(buf, 5),
            params,
        })
    }
}
