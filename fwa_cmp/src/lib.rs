//! # FWA CMP
//!
//! Connection Management Procedure (IEC 61883-1) client.
//!
//! Before an isochronous stream can run, bandwidth and a channel must
//! be reserved at the isochronous resource manager and the device's
//! plug control register must be pointed at that channel. This crate
//! provides:
//! - [`Connection`] - reserve/establish/break one plug's connection and
//!   re-validate it after a bus reset
//! - [`PlugBus`] - the quadlet read / compare-swap seam to the bus
//! - [`pcr`] - plug control register and resource register arithmetic

pub mod connection;
pub mod error;
pub mod pcr;

pub use connection::{CmpDirection, Connection, PlugBus};
pub use error::{CmpError, Result};
pub use pcr::Speed;
