//! Duplex stream coordination.
//!
//! Devices with their own sample clock pace the host: the receive
//! stream is the timing master and the transmit stream is slaved to
//! the timestamps it carries. The coordinator owns both streams and
//! their CMP connections, orders start/stop around the master, and
//! gates sampling-rate changes on what is actually in use.

use std::sync::Arc;

use fwa_cmp::{CmpDirection, Connection, PlugBus};
use log::warn;

use crate::{
    cip::CipFlags,
    error::{Result, StreamError},
    stream::{AmdtpStream, Direction, SyncMode},
    transport::IsoDevice,
};

/// A failure reported by the device's clock plumbing.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ClockError(pub String);

impl From<ClockError> for StreamError {
    fn from(err: ClockError) -> Self {
        StreamError::Clock(err.0)
    }
}

/// Sampling-rate and clock-source access the coordinator needs.
///
/// Implemented over the vendor command layer by device glue.
pub trait MediaClock: Send + Sync {
    /// The device's current sampling rate.
    fn sampling_rate(&self) -> std::result::Result<u32, ClockError>;

    /// Change the device's sampling rate.
    fn set_sampling_rate(&self, rate: u32) -> std::result::Result<(), ClockError>;

    /// Whether the device slaves its clock to the host's timestamps
    /// instead of mastering its own.
    fn follows_host_timestamps(&self) -> std::result::Result<bool, ClockError>;
}

/// Channel counts per direction, by rate-multiplier mode.
#[derive(Debug, Clone)]
pub struct DuplexFormats {
    /// PCM channels the host transmits, per 1x/2x/4x mode.
    pub transmit_pcm_channels: [usize; 3],
    /// PCM channels the host receives, per 1x/2x/4x mode.
    pub receive_pcm_channels: [usize; 3],
    pub transmit_midi_ports: usize,
    pub receive_midi_ports: usize,
}

/// Which of the 1x/2x/4x channel-count columns applies at `rate`.
fn rate_mode(rate: u32) -> Option<usize> {
    match rate {
        32000 | 44100 | 48000 => Some(0),
        88200 | 96000 => Some(1),
        176400 | 192000 => Some(2),
        _ => None,
    }
}

impl DuplexFormats {
    fn channels(&self, direction: Direction, rate: u32) -> Result<(usize, usize)> {
        let mode = rate_mode(rate).ok_or(StreamError::UnsupportedRate(rate))?;
        Ok(match direction {
            Direction::Transmit => (self.transmit_pcm_channels[mode], self.transmit_midi_ports),
            Direction::Receive => (self.receive_pcm_channels[mode], self.receive_midi_ports),
        })
    }
}

struct Half {
    stream: AmdtpStream,
    connection: Connection,
}

/// A transmit/receive pair sharing one device clock.
pub struct DuplexStreams {
    transmit: Half,
    receive: Half,
    clock: Arc<dyn MediaClock>,
    formats: DuplexFormats,
}

impl DuplexStreams {
    /// Build both streams and their CMP connections on plug 0.
    pub fn new(
        device: Arc<dyn IsoDevice>,
        plug_bus: Arc<dyn PlugBus>,
        clock: Arc<dyn MediaClock>,
        flags: CipFlags,
        formats: DuplexFormats,
    ) -> Self {
        Self {
            transmit: Half {
                stream: AmdtpStream::new(Arc::clone(&device), Direction::Transmit, flags),
                connection: Connection::new(Arc::clone(&plug_bus), CmpDirection::Input, 0),
            },
            receive: Half {
                stream: AmdtpStream::new(device, Direction::Receive, flags),
                connection: Connection::new(plug_bus, CmpDirection::Output, 0),
            },
            clock,
            formats,
        }
    }

    pub fn transmit_stream(&self) -> &AmdtpStream {
        &self.transmit.stream
    }

    pub fn receive_stream(&self) -> &AmdtpStream {
        &self.receive.stream
    }

    fn half(&self, direction: Direction) -> &Half {
        match direction {
            Direction::Transmit => &self.transmit,
            Direction::Receive => &self.receive,
        }
    }

    fn start_half(&self, direction: Direction, rate: u32) -> Result<()> {
        let half = self.half(direction);
        if half.stream.running() {
            return Ok(());
        }

        let (pcm_channels, midi_ports) = self.formats.channels(direction, rate)?;
        half.stream.set_parameters(rate, pcm_channels, midi_ports)?;

        let (channel, speed) = half.connection.establish(half.stream.max_payload()?)?;
        if let Err(err) = half.stream.start(channel, speed) {
            self.stop_half(direction);
            return Err(err);
        }
        if !half.stream.wait_first_callback() {
            self.stop_half(direction);
            return Err(StreamError::CallbackTimeout);
        }
        Ok(())
    }

    fn stop_half(&self, direction: Direction) {
        let half = self.half(direction);
        half.stream.stop();
        half.connection.break_connection();
    }

    /// Start streaming in `request`'s direction at `rate` (0 keeps the
    /// device's current rate). The timing master starts first and keeps
    /// running whenever anything streams.
    pub fn start(&self, request: Direction, rate: u32) -> Result<()> {
        if self.clock.follows_host_timestamps()? {
            return Err(StreamError::SyncModeUnsupported);
        }
        let slave_wanted = request == Direction::Transmit || self.transmit.stream.running();

        if self.receive.connection.check_used()? {
            return Err(StreamError::Busy);
        }

        let current = self.clock.sampling_rate()?;
        let rate = if rate == 0 { current } else { rate };
        if rate != current {
            // A rate change must not be held hostage by idle MIDI-only
            // streams; stop whatever carries no PCM right now.
            for direction in [Direction::Receive, Direction::Transmit] {
                let half = self.half(direction);
                if half.stream.running() && !half.stream.pcm_running() {
                    self.stop_half(direction);
                }
            }
            self.clock.set_sampling_rate(rate)?;
        }

        if !self.receive.stream.running() {
            if !self.transmit.stream.running() {
                AmdtpStream::set_sync(SyncMode::SyncToDevice, &self.receive.stream, &self.transmit.stream)?;
            }
            if let Err(err) = self.start_half(Direction::Receive, rate) {
                warn!("failed to start the master stream: {err}");
                return Err(err);
            }
        }

        if slave_wanted && !self.transmit.stream.running() {
            if let Err(err) = self.start_half(Direction::Transmit, rate) {
                warn!("failed to start the slaved stream: {err}");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stop whatever no longer carries PCM or MIDI. The master stays up
    /// while the slaved stream still has users.
    pub fn stop(&self) {
        let slave = &self.transmit.stream;
        if slave.pcm_running() || slave.midi_running() {
            return;
        }
        self.stop_half(Direction::Transmit);

        let master = &self.receive.stream;
        if !master.pcm_running() && !master.midi_running() {
            self.stop_half(Direction::Receive);
        }
    }

    /// Re-validate both connections after a bus reset.
    ///
    /// A lost reservation aborts that side's PCM device and stops the
    /// stream; restarting is the caller's decision.
    pub fn update(&self) {
        for direction in [Direction::Receive, Direction::Transmit] {
            let half = self.half(direction);
            if half.connection.update().is_err() {
                half.stream.pcm_abort();
                self.stop_half(direction);
            } else {
                half.stream.update();
            }
        }
    }

    /// Abort anything attached and tear both sides down.
    pub fn destroy(&self) {
        for direction in [Direction::Receive, Direction::Transmit] {
            let half = self.half(direction);
            half.stream.pcm_abort();
            self.stop_half(direction);
        }
    }
}
