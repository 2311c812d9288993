//! # FWA MIDI
//!
//! MPX-MIDI encoding and MIDI port plumbing for AMDTP streams.
//!
//! This crate provides:
//! - [`mpx`] - Label codec for the MPX-MIDI quadlet carried in AM824
//!   data blocks
//! - [`MidiPort`] - Rawmidi-style transmit/receive seam between the
//!   packet pipeline and MIDI device plumbing
//! - [`MidiOutputQueue`] / [`MidiInputQueue`] - Lock-free queue-backed
//!   port implementations safe to touch from the isochronous callback

pub mod mpx;
pub mod port;

pub use port::{MidiInputHandle, MidiInputQueue, MidiOutputHandle, MidiOutputQueue, MidiPort, midi_input, midi_output};
