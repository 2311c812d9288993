//! AM824 sample packing and MIDI multiplexing.
//!
//! A data block is `data_block_quadlets` big-endian quadlets: one per
//! PCM channel at its discovered position, plus at most one MPX-MIDI
//! quadlet. PCM quadlets carry 24-bit audio under label `0x40`; the
//! MIDI quadlet uses the MPX labels from `fwa_midi`.

use fwa_core::{SharedSlot, quadlet};
use fwa_midi::{MidiPort, mpx};

use crate::{
    pcm::{PcmSubstream, SampleFormat},
    stream::StreamConfig,
};

/// AM824 label marking a PCM quadlet.
pub const AM824_LABEL: u32 = 0x4000_0000;
/// A PCM quadlet carrying digital silence.
pub const AM824_SILENCE: u32 = AM824_LABEL;

/// Pack a 32-bit sample (24 significant bits in the upper bytes).
#[inline]
pub fn pack_s32(sample: i32) -> u32 {
    ((sample as u32) >> 8) | AM824_LABEL
}

/// Pack a 16-bit sample.
#[inline]
pub fn pack_s16(sample: i16) -> u32 {
    (u32::from(sample as u16) << 8) | AM824_LABEL
}

/// Unpack to a 32-bit sample, stripping the label and sign-extending
/// the 24-bit payload into the upper bytes.
#[inline]
pub fn unpack_s32(quadlet: u32) -> i32 {
    (quadlet << 8) as i32
}

#[inline]
fn pack(format: SampleFormat, sample: i32) -> u32 {
    match format {
        SampleFormat::S16 => pack_s16(sample as i16),
        SampleFormat::S32 => pack_s32(sample),
    }
}

/// Fill `frames` data blocks from the PCM ring starting at `start_frame`.
pub(crate) fn write_pcm(
    config: &StreamConfig,
    pcm: &PcmSubstream,
    data: &mut [u8],
    frames: usize,
    start_frame: usize,
) {
    if config.dual_wire {
        write_pcm_dual_wire(config, pcm, data, frames, start_frame);
        return;
    }

    let mut frame = start_frame;
    for block in 0..frames {
        let base = block * config.data_block_quadlets;
        for (channel, &position) in config.pcm_positions.iter().enumerate() {
            let sample = pcm.sample(frame, channel);
            quadlet::put(data, base + usize::from(position), pack(config.format, sample));
        }
        frame += 1;
    }
}

/// Dual-wire packing: each data block carries two consecutive PCM
/// frames, channel `c` landing on quadlets `position*2` and
/// `position*2 + 1`.
fn write_pcm_dual_wire(
    config: &StreamConfig,
    pcm: &PcmSubstream,
    data: &mut [u8],
    frames: usize,
    start_frame: usize,
) {
    let channels = config.pcm_channels / 2;
    let mut frame = start_frame;
    for block in 0..frames {
        let base = block * config.data_block_quadlets;
        for pair in 0..2 {
            for (channel, &position) in config.pcm_positions.iter().take(channels).enumerate() {
                let sample = pcm.sample(frame, channel);
                quadlet::put(data, base + usize::from(position) * 2 + pair, pack(config.format, sample));
            }
            frame += 1;
        }
    }
}

/// Drain `frames` data blocks into the PCM ring starting at `start_frame`.
pub(crate) fn read_pcm(
    config: &StreamConfig,
    pcm: &PcmSubstream,
    data: &[u8],
    frames: usize,
    start_frame: usize,
) {
    if config.dual_wire {
        read_pcm_dual_wire(config, pcm, data, frames, start_frame);
        return;
    }

    let mut frame = start_frame;
    for block in 0..frames {
        let base = block * config.data_block_quadlets;
        for (channel, &position) in config.pcm_positions.iter().enumerate() {
            let sample = unpack_s32(quadlet::get(data, base + usize::from(position)));
            pcm.store_sample(frame, channel, sample);
        }
        frame += 1;
    }
}

fn read_pcm_dual_wire(
    config: &StreamConfig,
    pcm: &PcmSubstream,
    data: &[u8],
    frames: usize,
    start_frame: usize,
) {
    let channels = config.pcm_channels / 2;
    let mut frame = start_frame;
    for block in 0..frames {
        let base = block * config.data_block_quadlets;
        for pair in 0..2 {
            for (channel, &position) in config.pcm_positions.iter().take(channels).enumerate() {
                let sample = unpack_s32(quadlet::get(data, base + usize::from(position) * 2 + pair));
                pcm.store_sample(frame, channel, sample);
            }
            frame += 1;
        }
    }
}

/// Fill `frames` data blocks with PCM silence.
pub(crate) fn fill_silence(config: &StreamConfig, data: &mut [u8], frames: usize) {
    for block in 0..frames {
        let base = block * config.data_block_quadlets;
        if config.dual_wire {
            for &position in config.pcm_positions.iter().take(config.pcm_channels / 2) {
                quadlet::put(data, base + usize::from(position) * 2, AM824_SILENCE);
                quadlet::put(data, base + usize::from(position) * 2 + 1, AM824_SILENCE);
            }
        } else {
            for &position in &config.pcm_positions {
                quadlet::put(data, base + usize::from(position), AM824_SILENCE);
            }
        }
    }
}

/// Fill the MPX-MIDI quadlet of each data block.
///
/// Block `f` serves port `(data_block_counter + f) mod 8`, one byte per
/// block. Blocks past `blocks_for_midi` stay empty: some devices ignore
/// MIDI beyond the first eight blocks of a packet.
pub(crate) fn fill_midi(
    config: &StreamConfig,
    ports: &[SharedSlot<dyn MidiPort>],
    data_block_counter: u8,
    data: &mut [u8],
    frames: usize,
) {
    for block in 0..frames {
        let index = block * config.data_block_quadlets + config.midi_position;
        let port = (usize::from(data_block_counter) + block) % 8;

        let mut byte = [0u8; 1];
        let carried = block < config.blocks_for_midi
            && ports[port]
                .get()
                .is_some_and(|port| port.transmit(&mut byte) == 1);
        let encoded = mpx::encode(carried.then_some(byte[0]));
        data[index * 4..index * 4 + 4].copy_from_slice(&encoded);
    }
}

/// Demultiplex the MPX-MIDI quadlet of each data block.
pub(crate) fn pull_midi(
    config: &StreamConfig,
    ports: &[SharedSlot<dyn MidiPort>],
    data_block_counter: u8,
    data: &[u8],
    frames: usize,
) {
    for block in 0..frames {
        let index = block * config.data_block_quadlets + config.midi_position;
        let quadlet: [u8; 4] = data[index * 4..index * 4 + 4].try_into().unwrap_or([0; 4]);

        let Some(payload) = mpx::decode(&quadlet) else {
            continue;
        };
        let port = (usize::from(data_block_counter) + block) % 8;
        if let Some(port) = ports[port].get() {
            port.receive(payload);
        }
    }
}
