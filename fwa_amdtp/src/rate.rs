//! Sample-clock to bus-clock rate sequencing.
//!
//! Two phase machines keep a transmitted stream exactly on rate:
//! one picks how many data blocks each packet carries, the other walks
//! the SYT offset so that timestamps land on the true sample boundaries
//! of the nominal rate. Both are pure integer sequences; the 44.1 kHz
//! family needs correction terms because neither blocks-per-cycle nor
//! ticks-per-sample divide evenly there.

use crate::{
    cip::{SYT_NO_INFO, TICKS_PER_CYCLE},
    sfc::Sfc,
};

/// Per-SFC initial phase state.
///
/// `(data_block_state, syt_offset_state)`; the 44.1 kHz family starts
/// mid-pattern so that the generated sequence lines up with the nominal
/// sample boundaries from the very first packet.
fn initial_state(sfc: Sfc) -> (u32, u32) {
    match sfc {
        Sfc::S32000 => (4, 3072),
        Sfc::S48000 => (6, 1024),
        Sfc::S96000 => (12, 1024),
        Sfc::S192000 => (24, 1024),
        Sfc::S44100 | Sfc::S88200 | Sfc::S176400 => (0, 67),
    }
}

/// Block-count and SYT sequencing for one running stream.
#[derive(Debug)]
pub struct RateEngine {
    sfc: Sfc,
    blocking: bool,
    syt_interval: u32,
    transfer_delay: u32,
    data_block_state: u32,
    syt_offset_state: u32,
    last_syt_offset: u32,
}

impl RateEngine {
    /// State at stream start for `sfc`.
    pub fn new(sfc: Sfc, blocking: bool, transfer_delay: u32) -> Self {
        let (data_block_state, syt_offset_state) = initial_state(sfc);
        Self {
            sfc,
            blocking,
            syt_interval: sfc.syt_interval(),
            transfer_delay,
            data_block_state,
            syt_offset_state,
            last_syt_offset: TICKS_PER_CYCLE,
        }
    }

    /// Number of data blocks the next data packet carries.
    ///
    /// Blocking streams always produce `syt_interval` blocks when they
    /// produce any. Non-blocking streams at 48 kHz bases produce the
    /// constant rate/8000; at 44.1 kHz bases they walk a phase pattern
    /// that sums to the exact rate over each second and front-loads the
    /// rounded-up packets.
    pub fn data_blocks(&mut self) -> u32 {
        if self.blocking {
            return self.syt_interval;
        }
        if !self.sfc.is_base_44100() {
            // rate / 8000 is an integer, precomputed as the phase seed.
            return self.data_block_state;
        }

        let phase = self.data_block_state;
        let data_blocks = if self.sfc == Sfc::S44100 {
            // 6 6 5 6 5 6 5 ...
            5 + ((phase & 1) ^ u32::from(phase == 0 || phase >= 40))
        } else {
            // 12 11 11 11 ... at 88.2 kHz, 23 22 22 22 ... at 176.4 kHz
            11 * (self.sfc.code() >> 1) + u32::from(phase == 0)
        };

        self.data_block_state = (phase + 1) % (80 >> (self.sfc.code() >> 1));
        data_blocks
    }

    /// SYT for the packet sent on `cycle`.
    ///
    /// Returns [`SYT_NO_INFO`] on cycles where no `syt_interval`-aligned
    /// sample boundary falls; blocking streams send empty packets then.
    pub fn syt(&mut self, cycle: u32) -> u16 {
        let syt_offset = if self.last_syt_offset < TICKS_PER_CYCLE {
            if !self.sfc.is_base_44100() {
                self.last_syt_offset + self.syt_offset_state
            } else {
                // The time, in ticks, of the n'th SYT_INTERVAL sample is
                //   n * SYT_INTERVAL * 24576000 / 44100 (or 88200, 176400)
                // which modulo TICKS_PER_CYCLE advances by about 1386.23
                // per cycle. The +1 corrections on every fourth slot of a
                // 13-slot sub-cycle, plus one at the end of the 147-cycle
                // super-cycle, reproduce the rounded sequence exactly.
                let phase = self.syt_offset_state;
                let index = phase % 13;
                let correction = u32::from((index > 0 && index % 4 == 0) || phase == 146);
                self.syt_offset_state = (phase + 1) % 147;
                self.last_syt_offset + 1386 + correction
            }
        } else {
            self.last_syt_offset - TICKS_PER_CYCLE
        };
        self.last_syt_offset = syt_offset;

        if syt_offset < TICKS_PER_CYCLE {
            let stamped = syt_offset + self.transfer_delay;
            let syt = (cycle.wrapping_add(stamped / TICKS_PER_CYCLE) << 12)
                .wrapping_add(stamped % TICKS_PER_CYCLE);
            (syt & 0xffff) as u16
        } else {
            SYT_NO_INFO
        }
    }

    /// The running offset, exposed for sequence verification.
    #[cfg(test)]
    pub(crate) fn last_syt_offset(&self) -> u32 {
        self.last_syt_offset
    }
}
