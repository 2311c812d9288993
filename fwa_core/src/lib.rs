//! # FWA Core
//!
//! This crate contains the core mechanisms and utilities
//! used throughout this workspace: big-endian quadlet views over
//! byte buffers, a lock-free SPSC byte ring for realtime-safe
//! transfer, one-shot latch events for bounded waits, and shared
//! reference slots readable from the isochronous callback domain.

pub mod event;
pub mod quadlet;
pub mod ratelimit;
pub mod shared;
pub mod spsc;

pub use event::LatchEvent;
pub use ratelimit::LogGate;
pub use shared::SharedSlot;
pub use spsc::{ByteReader, ByteRing, ByteWriter};
