//! # FWA AMDTP
//!
//! Audio and Music Data Transmission Protocol (IEC 61883-6) streams
//! with Common Isochronous Packet (IEC 61883-1) headers.
//!
//! The crate is the packet pipeline of the streaming engine: per-cycle
//! generation and consumption of CIP packets carrying AM824 audio and
//! MPX-MIDI, SYT timestamping against the bus clock, PCM ring
//! bookkeeping under the isochronous callback, and the duplex
//! coordination that pairs a transmit and a receive stream around a
//! device-owned sample clock.
//!
//! The isochronous controller is reached through the [`transport`]
//! seam; the Connection Management Procedure comes from `fwa_cmp` and
//! MIDI plumbing from `fwa_midi`.

pub mod cip;
pub mod codec;
pub mod duplex;
pub mod error;
pub mod packet;
pub mod pcm;
pub mod rate;
pub mod reorder;
pub mod sfc;
pub mod stream;
pub mod transport;

pub use cip::CipFlags;
pub use duplex::{ClockError, DuplexFormats, DuplexStreams, MediaClock};
pub use error::{Result, StreamError};
pub use packet::{INTERRUPT_INTERVAL, QUEUE_LENGTH};
pub use pcm::{PcmState, PcmSubstream, SampleFormat};
pub use sfc::Sfc;
pub use stream::{AmdtpStream, CALLBACK_TIMEOUT, Direction, StreamState, SyncMode};
pub use transport::{Completion, ContextKind, IsoContext, IsoDevice, IsoError, IsoHandler, IsoPacket};
