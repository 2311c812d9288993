//! Typed command clients.
//!
//! Thin wrappers over [`Transceiver::transaction`] for the commands the
//! streaming engine needs: hardware capabilities, clock source and
//! sampling rate, transport mode, and the per-direction stream format
//! table that yields the data-block channel positions.

use crate::{
    error::{EfcError, Result},
    frame::{category, command},
    transaction::Transceiver,
};

/// Cluster type code marking the MIDI conformant data channel.
const CLUSTER_TYPE_MIDI: u32 = 0x0a;

/// Sampling clock source reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Internal,
    /// The device follows the SYT timestamps the host transmits.
    SytMatch,
    WordClock,
    Spdif,
    Adat1,
    Adat2,
}

impl ClockSource {
    fn code(self) -> u32 {
        match self {
            ClockSource::Internal => 0,
            ClockSource::SytMatch => 1,
            ClockSource::WordClock => 2,
            ClockSource::Spdif => 3,
            ClockSource::Adat1 => 4,
            ClockSource::Adat2 => 5,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(ClockSource::Internal),
            1 => Ok(ClockSource::SytMatch),
            2 => Ok(ClockSource::WordClock),
            3 => Ok(ClockSource::Spdif),
            4 => Ok(ClockSource::Adat1),
            5 => Ok(ClockSource::Adat2),
            other => Err(EfcError::UnknownClockSource(other)),
        }
    }
}

/// Clock source and sampling rate as one device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockState {
    pub source: ClockSource,
    pub rate: u32,
}

/// Isochronous transport framing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Windows = 0,
    Iec61883 = 1,
}

/// Capabilities reported by the hardware-info command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    pub flags: u32,
    pub guid: u64,
    /// PCM channels the device receives, per rate mode (1x/2x/4x).
    pub rx_pcm_channels: [u32; 3],
    /// PCM channels the device transmits, per rate mode (1x/2x/4x).
    pub tx_pcm_channels: [u32; 3],
    pub midi_out_ports: u32,
    pub midi_in_ports: u32,
    pub min_rate: u32,
    pub max_rate: u32,
    pub vendor_name: String,
    pub model_name: String,
}

impl HardwareInfo {
    /// The fixed rate table filtered to what the hardware supports.
    pub fn supported_rates(&self) -> Vec<u32> {
        [32000, 44100, 48000, 88200, 96000, 176400, 192000]
            .into_iter()
            .filter(|&rate| self.min_rate <= rate && rate <= self.max_rate)
            .collect()
    }
}

/// Which of the 1x/2x/4x channel-count columns applies at `rate`.
pub fn rate_mode(rate: u32) -> Option<usize> {
    match rate {
        32000 | 44100 | 48000 => Some(0),
        88200 | 96000 => Some(1),
        176400 | 192000 => Some(2),
        _ => None,
    }
}

/// Direction selector for the stream-format command, named from the
/// device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatDirection {
    /// The host transmits; the device receives.
    Receive = 0,
    /// The device transmits; the host receives.
    Transmit = 1,
}

/// Shape of one direction's data block at one sampling rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    /// Quadlet offset of each PCM channel within a data block.
    pub pcm_positions: Vec<u8>,
    /// Quadlet offset of the MPX-MIDI channel, if the block carries one.
    pub midi_position: Option<u8>,
}

impl StreamFormat {
    pub fn pcm_channels(&self) -> usize {
        self.pcm_positions.len()
    }
}

impl Transceiver {
    /// Query hardware capabilities.
    pub fn hardware_info(&self) -> Result<HardwareInfo> {
        let params = self.transaction(category::HWINFO, command::HWINFO_GET_CAPS, &[])?;
        parse_hardware_info(&params)
    }

    /// Read the clock source and sampling rate.
    pub fn clock_state(&self) -> Result<ClockState> {
        let params = self.transaction(category::HWCTL, command::HWCTL_GET_CLOCK, &[])?;
        if params.len() < 2 {
            return Err(EfcError::Malformed(format!("clock response with {} params", params.len())));
        }
        Ok(ClockState {
            source: ClockSource::from_code(params[0])?,
            rate: params[1],
        })
    }

    /// Change clock source and/or sampling rate, preserving whichever
    /// is not given. A no-op when the device already matches.
    pub fn set_clock(&self, source: Option<ClockSource>, rate: Option<u32>) -> Result<()> {
        let current = self.clock_state()?;
        let desired = ClockState {
            source: source.unwrap_or(current.source),
            rate: rate.unwrap_or(current.rate),
        };
        if desired == current {
            return Ok(());
        }

        self.transaction(
            category::HWCTL,
            command::HWCTL_SET_CLOCK,
            &[desired.source.code(), desired.rate, 0],
        )?;
        Ok(())
    }

    pub fn clock_source(&self) -> Result<ClockSource> {
        Ok(self.clock_state()?.source)
    }

    pub fn set_clock_source(&self, source: ClockSource) -> Result<()> {
        self.set_clock(Some(source), None)
    }

    pub fn sampling_rate(&self) -> Result<u32> {
        Ok(self.clock_state()?.rate)
    }

    pub fn set_sampling_rate(&self, rate: u32) -> Result<()> {
        self.set_clock(None, Some(rate))
    }

    /// Select the isochronous framing the device transmits with.
    pub fn set_transport_mode(&self, mode: TxMode) -> Result<()> {
        self.transaction(category::TRANSPORT, command::TRANSPORT_SET_TX_MODE, &[mode as u32])?;
        Ok(())
    }

    /// Discover the data-block layout for one direction at `rate`.
    pub fn stream_format(&self, direction: FormatDirection, rate: u32) -> Result<StreamFormat> {
        let params = self.transaction(
            category::IOCONF,
            command::IOCONF_GET_ISOC_MAP,
            &[direction as u32, rate],
        )?;
        parse_stream_format(&params)
    }
}

fn parse_hardware_info(params: &[u32]) -> Result<HardwareInfo> {
    if params.len() < 29 {
        return Err(EfcError::Malformed(format!("hwinfo response with {} params", params.len())));
    }

    Ok(HardwareInfo {
        flags: params[0],
        guid: (u64::from(params[1]) << 32) | u64::from(params[2]),
        rx_pcm_channels: [params[3], params[4], params[5]],
        tx_pcm_channels: [params[6], params[7], params[8]],
        midi_out_ports: params[9],
        midi_in_ports: params[10],
        min_rate: params[11],
        max_rate: params[12],
        vendor_name: unpack_name(&params[13..21]),
        model_name: unpack_name(&params[21..29]),
    })
}

/// Names arrive as ASCII packed four bytes per quadlet, NUL padded.
fn unpack_name(quadlets: &[u32]) -> String {
    let bytes: Vec<u8> = quadlets.iter().flat_map(|q| q.to_be_bytes()).collect();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Walk the cluster table: `[count, {type, channels, position...}...]`.
///
/// Positions from clusters of any type but MIDI feed `pcm_positions`;
/// the first channel of a MIDI cluster is the MPX-MIDI position.
fn parse_stream_format(params: &[u32]) -> Result<StreamFormat> {
    let mut cursor = params.iter().copied();
    let clusters = cursor
        .next()
        .ok_or_else(|| EfcError::Malformed("empty format response".into()))?;

    let mut pcm_positions = Vec::new();
    let mut midi_position = None;

    for _ in 0..clusters {
        let (cluster_type, channels) = match (cursor.next(), cursor.next()) {
            (Some(t), Some(c)) => (t, c),
            _ => return Err(EfcError::Malformed("truncated cluster header".into())),
        };
        for _ in 0..channels {
            let position = cursor
                .next()
                .ok_or_else(|| EfcError::Malformed("truncated cluster positions".into()))?;
            if position > u32::from(u8::MAX) {
                return Err(EfcError::Malformed(format!("channel position {position} out of range")));
            }
            if cluster_type == CLUSTER_TYPE_MIDI {
                midi_position.get_or_insert(position as u8);
            } else {
                pcm_positions.push(position as u8);
            }
        }
    }

    Ok(StreamFormat {
        pcm_positions,
        midi_position,
    })
}
