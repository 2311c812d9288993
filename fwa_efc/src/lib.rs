//! # FWA EFC
//!
//! Vendor command transaction layer.
//!
//! The device exposes a pair of memory-mapped regions: requests are
//! written to the command region and the device answers by writing a
//! response frame into the response region. Frames share one layout, a
//! six-quadlet header followed by 32-bit parameters, all big-endian on
//! the wire and host-endian at this API.
//!
//! This crate provides:
//! - [`frame`] - frame encode/decode and the command/response region
//!   addresses
//! - [`Transceiver`] - pending-transaction registry with match-mask
//!   response dispatch, bounded retries, and bus-reset nudging
//! - [`commands`] - typed clients for hardware info, clock and
//!   sampling-rate control, transport mode, and stream-format discovery

pub mod commands;
pub mod error;
pub mod frame;
pub mod transaction;

pub use commands::{ClockSource, ClockState, FormatDirection, HardwareInfo, StreamFormat, TxMode, rate_mode};
pub use error::{EfcError, Result};
pub use frame::Frame;
pub use transaction::{CommandBus, Transceiver};
