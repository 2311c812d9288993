//! MIDI ports attachable to a running stream.
//!
//! The packet pipeline sees MIDI through the [`MidiPort`] trait: a
//! transmit port is polled for bytes while packets are built, a receive
//! port is handed bytes as packets are decoded. Both calls happen in
//! the isochronous callback, so implementations must not block; the
//! queue-backed ports here move bytes over the `fwa_core` SPSC ring.

use std::sync::Arc;

use fwa_core::spsc::{ByteReader, ByteRing, ByteWriter};
use spin::Mutex;

/// One MPX-MIDI data stream endpoint.
///
/// A port implements the direction it serves and leaves the other at
/// the default no-op: an unpolled transmit port yields nothing, an
/// unfed receive port drops its input.
pub trait MidiPort: Send + Sync {
    /// Pull up to `buffer.len()` bytes for transmission.
    ///
    /// Returns the number of bytes produced. Must not block.
    fn transmit(&self, buffer: &mut [u8]) -> usize {
        let _ = buffer;
        0
    }

    /// Deliver bytes received from the device. Must not block.
    fn receive(&self, bytes: &[u8]) {
        let _ = bytes;
    }
}

/// Engine-side transmit port fed by a [`MidiOutputHandle`].
pub struct MidiOutputQueue {
    reader: Mutex<ByteReader>,
}

impl MidiPort for MidiOutputQueue {
    #[inline]
    fn transmit(&self, buffer: &mut [u8]) -> usize {
        self.reader.lock().read(buffer)
    }
}

/// User-side handle for queueing bytes onto a transmit port.
pub struct MidiOutputHandle {
    writer: ByteWriter,
}

impl MidiOutputHandle {
    /// Queue as many of `bytes` as fit, returning the count queued.
    pub fn send(&mut self, bytes: &[u8]) -> usize {
        self.writer.write(bytes)
    }

    /// Number of queued bytes not yet transmitted.
    pub fn pending(&self) -> usize {
        self.writer.len()
    }
}

/// Engine-side receive port drained by a [`MidiInputHandle`].
pub struct MidiInputQueue {
    writer: Mutex<ByteWriter>,
}

impl MidiPort for MidiInputQueue {
    #[inline]
    fn receive(&self, bytes: &[u8]) {
        // A full ring drops the overflow; MIDI has no flow control here.
        let _ = self.writer.lock().write(bytes);
    }
}

/// User-side handle for draining a receive port.
pub struct MidiInputHandle {
    reader: ByteReader,
}

impl MidiInputHandle {
    /// Read up to `buffer.len()` received bytes, returning the count.
    pub fn recv(&mut self, buffer: &mut [u8]) -> usize {
        self.reader.read(buffer)
    }

    /// Whether any received bytes are waiting.
    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }
}

/// Create a transmit port pair with room for `capacity` queued bytes.
///
/// # Examples
///
/// ```
/// use fwa_midi::{MidiPort, midi_output};
///
/// let (mut handle, port) = midi_output(64);
/// handle.send(&[0x90, 60, 100]);
///
/// let mut byte = [0u8; 1];
/// assert_eq!(port.transmit(&mut byte), 1);
/// assert_eq!(byte[0], 0x90);
/// ```
pub fn midi_output(capacity: usize) -> (MidiOutputHandle, Arc<MidiOutputQueue>) {
    let (writer, reader) = ByteRing::new(capacity);
    (
        MidiOutputHandle { writer },
        Arc::new(MidiOutputQueue {
            reader: Mutex::new(reader),
        }),
    )
}

/// Create a receive port pair with room for `capacity` buffered bytes.
pub fn midi_input(capacity: usize) -> (MidiInputHandle, Arc<MidiInputQueue>) {
    let (writer, reader) = ByteRing::new(capacity);
    (
        MidiInputHandle { reader },
        Arc::new(MidiInputQueue {
            writer: Mutex::new(writer),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_byte_at_a_time() {
        let (mut handle, port) = midi_output(16);
        handle.send(&[0x90, 60, 100]);

        let mut byte = [0u8; 1];
        assert_eq!(port.transmit(&mut byte), 1);
        assert_eq!(byte[0], 0x90);
        assert_eq!(port.transmit(&mut byte), 1);
        assert_eq!(byte[0], 60);
        assert_eq!(handle.pending(), 1);
    }

    #[test]
    fn test_output_empty() {
        let (_handle, port) = midi_output(16);
        let mut byte = [0u8; 1];
        assert_eq!(port.transmit(&mut byte), 0);
    }

    #[test]
    fn test_input_round_trip() {
        let (mut handle, port) = midi_input(16);
        assert!(handle.is_empty());

        port.receive(&[0xf8]);
        port.receive(&[0x90, 60]);

        let mut buf = [0u8; 8];
        assert_eq!(handle.recv(&mut buf), 3);
        assert_eq!(&buf[..3], &[0xf8, 0x90, 60]);
    }

    #[test]
    fn test_input_overflow_drops() {
        let (mut handle, port) = midi_input(2);
        port.receive(&[1, 2, 3, 4]);

        let mut buf = [0u8; 8];
        assert_eq!(handle.recv(&mut buf), 2);
        assert_eq!(&buf[..2], &[1, 2]);
    }

    #[test]
    fn test_default_directions_are_noops() {
        struct Dummy;
        impl MidiPort for Dummy {}

        let dummy = Dummy;
        let mut buf = [0u8; 4];
        assert_eq!(dummy.transmit(&mut buf), 0);
        dummy.receive(&[1, 2, 3]);
    }
}
