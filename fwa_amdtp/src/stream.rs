//! The AMDTP stream core.
//!
//! An [`AmdtpStream`] owns one direction of isochronous traffic. The
//! control domain configures and starts it; from then on the transport
//! callback domain builds or decodes packets until the stream is
//! stopped or a queueing fault latches it into the errored state.
//!
//! Shared state between the two domains is confined to [`Shared`]:
//! single-word atomics for the pointers and the sticky fault flag,
//! swap slots for the PCM and MIDI attachments, and a latch for the
//! first-callback handshake. The callback domain never takes the
//! control mutex.

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use fwa_cmp::Speed;
use fwa_core::{LatchEvent, LogGate, SharedSlot, quadlet};
use fwa_midi::MidiPort;
use log::{debug, warn};

use crate::{
    cip::{self, CipFlags, FDF_NO_DATA, SYT_NO_INFO, TAG_CIP, TICKS_PER_CYCLE, TICKS_PER_SECOND,
        TRANSFER_DELAY_TICKS, TxHeader},
    codec,
    error::{Result, StreamError},
    packet::{INTERRUPT_INTERVAL, PacketRing, QUEUE_LENGTH},
    pcm::{PcmSubstream, PeriodDispatcher, SampleFormat},
    rate::RateEngine,
    reorder::{self, Origin, SortEntry},
    sfc::Sfc,
    transport::{Completion, ContextKind, IsoContext, IsoDevice, IsoHandler, IsoPacket, MATCH_TAG0, MATCH_TAG1},
};

/// Largest PCM channel count one stream carries.
pub const MAX_PCM_CHANNELS: usize = 64;
/// Largest MIDI port count one stream carries.
pub const MAX_MIDI_PORTS: usize = 8;
/// Bound on the wait for the first isochronous callback.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_millis(100);

static BAD_CIP_HEADER: LogGate = LogGate::new(Duration::from_secs(1));
static RUNT_PACKET: LogGate = LogGate::new(Duration::from_secs(1));

/// Direction of a stream, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Transmit,
    /// Device to host.
    Receive,
}

/// Stream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, parameters not set.
    Idle,
    /// Parameters set, transport not running.
    Configured,
    /// Transport running.
    Running,
    /// A queueing or sequencing failure stopped the packet queue; only
    /// `stop` leaves this state.
    Errored,
}

/// Timing relationship between a duplex pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Each stream stamps its own timestamps.
    Local,
    /// The receive stream's timestamps pace the transmit stream.
    SyncToDevice,
}

/// Immutable stream parameters, snapshotted at start.
#[derive(Debug, Clone)]
pub(crate) struct StreamConfig {
    pub(crate) direction: Direction,
    pub(crate) flags: CipFlags,
    /// Wire-level code; halved from the nominal rate in dual-wire mode.
    pub(crate) sfc: Sfc,
    pub(crate) dual_wire: bool,
    /// Wire channel count; doubled from the nominal in dual-wire mode.
    pub(crate) pcm_channels: usize,
    pub(crate) midi_ports: usize,
    pub(crate) data_block_quadlets: usize,
    /// Quadlet offsets per nominal channel.
    pub(crate) pcm_positions: Vec<u8>,
    pub(crate) midi_position: usize,
    pub(crate) syt_interval: u32,
    pub(crate) transfer_delay: u32,
    /// Data blocks per packet eligible to carry MIDI.
    pub(crate) blocks_for_midi: usize,
    pub(crate) format: SampleFormat,
}

impl StreamConfig {
    /// Size of the largest packet this configuration emits or accepts.
    pub(crate) fn max_payload(&self) -> usize {
        8 + self.syt_interval as usize * self.data_block_quadlets * 4
    }

    /// Nominal channel count, before dual-wire doubling.
    fn nominal_channels(&self) -> usize {
        if self.dual_wire { self.pcm_channels / 2 } else { self.pcm_channels }
    }

    fn blocking(&self) -> bool {
        self.flags.contains(CipFlags::BLOCKING)
    }
}

/// State reachable from both execution domains.
pub(crate) struct Shared {
    pub(crate) pcm: Arc<SharedSlot<PcmSubstream>>,
    pub(crate) midi: [SharedSlot<dyn MidiPort>; MAX_MIDI_PORTS],
    pub(crate) pcm_buffer_pointer: AtomicUsize,
    pub(crate) pcm_period_pointer: AtomicUsize,
    pub(crate) pointer_flush: AtomicBool,
    pub(crate) fault: AtomicBool,
    pub(crate) callbacked: LatchEvent,
    pub(crate) source_node_id_field: AtomicU32,
    pub(crate) period: PeriodDispatcher,
}

impl Shared {
    fn new() -> Arc<Self> {
        let pcm = Arc::new(SharedSlot::new());
        let period = PeriodDispatcher::new(Arc::clone(&pcm));
        Arc::new(Self {
            pcm,
            midi: std::array::from_fn(|_| SharedSlot::new()),
            pcm_buffer_pointer: AtomicUsize::new(0),
            pcm_period_pointer: AtomicUsize::new(0),
            pointer_flush: AtomicBool::new(true),
            fault: AtomicBool::new(false),
            callbacked: LatchEvent::new(),
            source_node_id_field: AtomicU32::new(0),
            period,
        })
    }

    /// The attached PCM substream, unless it has been aborted.
    fn active_pcm(&self) -> Option<Arc<PcmSubstream>> {
        self.pcm.get().filter(|pcm| pcm.is_running())
    }

    /// Latch the sticky fault and abort the PCM device.
    fn streaming_fault(&self) {
        if !self.fault.swap(true, Ordering::SeqCst) {
            warn!("packet queueing failed, stream is dead until restarted");
        }
        self.abort_pcm();
    }

    fn abort_pcm(&self) {
        if let Some(pcm) = self.pcm.get() {
            pcm.abort();
        }
    }

    /// Advance the hardware pointer by `frames` and flag elapsed periods.
    fn update_pcm_pointers(&self, pcm: &PcmSubstream, frames: usize) {
        let pointer = (self.pcm_buffer_pointer.load(Ordering::Relaxed) + frames) % pcm.buffer_size();
        self.pcm_buffer_pointer.store(pointer, Ordering::Release);

        let period = self.pcm_period_pointer.load(Ordering::Relaxed) + frames;
        if period >= pcm.period_size() {
            self.pcm_period_pointer.store(period - pcm.period_size(), Ordering::Relaxed);
            self.pointer_flush.store(false, Ordering::Relaxed);
            self.period.schedule();
        } else {
            self.pcm_period_pointer.store(period, Ordering::Relaxed);
        }
    }
}

type SharedContext = Arc<Mutex<Box<dyn IsoContext>>>;

fn lock_context(context: &SharedContext) -> MutexGuard<'_, Box<dyn IsoContext>> {
    context.lock().unwrap_or_else(|e| e.into_inner())
}

/// Transmit-side packet generator.
///
/// Owned by the transmit context's handler, or parked inside the sync
/// coupling when a master receive stream paces the packets.
pub(crate) struct TxEngine {
    config: StreamConfig,
    shared: Arc<Shared>,
    ring: PacketRing,
    rate: RateEngine,
    packet_index: usize,
    data_block_counter: u8,
}

impl TxEngine {
    fn new(config: StreamConfig, shared: Arc<Shared>) -> Self {
        let ring = PacketRing::new(config.max_payload());
        let rate = RateEngine::new(config.sfc, config.blocking(), config.transfer_delay);
        Self {
            config,
            shared,
            ring,
            rate,
            packet_index: 0,
            data_block_counter: 0,
        }
    }

    /// Build and queue one packet stamped with `syt`.
    fn emit(&mut self, ctx: &mut dyn IsoContext, syt: u16) {
        if self.shared.fault.load(Ordering::Acquire) {
            return;
        }

        let data_blocks = if !self.config.blocking() || syt != SYT_NO_INFO {
            self.rate.data_blocks() as usize
        } else {
            0
        };
        let fdf = if data_blocks == 0 { FDF_NO_DATA } else { self.config.sfc.code() };
        let payload_length = 8 + data_blocks * 4 * self.config.data_block_quadlets;

        let pcm = self.shared.active_pcm();
        let pointer = self.shared.pcm_buffer_pointer.load(Ordering::Relaxed);
        {
            let slot = self.ring.slot_mut(self.packet_index);
            TxHeader {
                source_node_id_field: self.shared.source_node_id_field.load(Ordering::Acquire),
                data_block_quadlets: self.config.data_block_quadlets as u32,
                data_block_counter: self.data_block_counter,
                fdf,
                syt,
            }
            .write(slot);

            let data = &mut slot[8..payload_length];
            match &pcm {
                Some(pcm) => codec::write_pcm(&self.config, pcm, data, data_blocks, pointer),
                None => codec::fill_silence(&self.config, data, data_blocks),
            }
            if self.config.midi_ports > 0 {
                codec::fill_midi(&self.config, &self.shared.midi, self.data_block_counter, data, data_blocks);
            }
        }
        self.data_block_counter = self.data_block_counter.wrapping_add(data_blocks as u8);

        let packet = IsoPacket {
            interrupt: (self.packet_index + 1) % INTERRUPT_INTERVAL == 0,
            tag: TAG_CIP,
            skip: false,
            payload: &self.ring.slot(self.packet_index)[..payload_length],
        };
        if ctx.queue_transmit(&packet).is_err() {
            self.shared.streaming_fault();
            return;
        }
        self.packet_index = (self.packet_index + 1) % QUEUE_LENGTH;

        if let Some(pcm) = pcm {
            let frames = if self.config.dual_wire { data_blocks * 2 } else { data_blocks };
            self.shared.update_pcm_pointers(&pcm, frames);
        }
    }

    /// Self-timed completion: one packet per elapsed cycle.
    fn run_cycles(&mut self, ctx: &mut dyn IsoContext, cycle: u32, packets: usize) {
        // The controller reports the cycle of the newest completion;
        // walk back to the cycle each replacement packet will occupy.
        // Only the low four bits reach the SYT, so the 3072-cycle wrap
        // of the bus cycle counter is irrelevant here.
        let mut cycle = cycle.wrapping_add((QUEUE_LENGTH as u32).wrapping_sub(packets as u32));
        for _ in 0..packets {
            cycle = cycle.wrapping_add(1);
            let syt = self.rate.syt(cycle);
            self.emit(ctx, syt);
        }
        ctx.flush();
    }
}

/// Slave endpoint parked for the master stream to pace.
pub(crate) struct SlaveEndpoint {
    engine: TxEngine,
    context: SharedContext,
}

/// Handoff point between a master receive stream and the transmit
/// stream slaved to its timestamps.
pub(crate) struct SyncCoupling {
    endpoint: Mutex<Option<SlaveEndpoint>>,
}

impl SyncCoupling {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoint: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<SlaveEndpoint>> {
        self.endpoint.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn install(&self, endpoint: SlaveEndpoint) {
        *self.lock() = Some(endpoint);
    }

    fn clear(&self) {
        *self.lock() = None;
    }

    /// Emit one slave packet stamped with `syt`.
    fn drive(&self, syt: u16) {
        if let Some(endpoint) = &mut *self.lock() {
            let mut context = lock_context(&endpoint.context);
            endpoint.engine.emit(&mut **context, syt);
        }
    }

    fn flush(&self) {
        if let Some(endpoint) = &*self.lock() {
            lock_context(&endpoint.context).flush();
        }
    }
}

/// Receive-side packet consumer.
pub(crate) struct RxEngine {
    config: StreamConfig,
    shared: Arc<Shared>,
    /// Ping-pong scratch for packets deferred across callbacks, each
    /// holding `QUEUE_LENGTH / 4` max-size payloads.
    scratch: [PacketRing; 2],
    active_scratch: usize,
    carried: Vec<(u8, usize)>,
    table: Vec<SortEntry>,
    data_block_counter: u8,
    /// Present when this stream paces a slaved transmit stream.
    coupling: Option<Arc<SyncCoupling>>,
}

impl RxEngine {
    fn new(config: StreamConfig, shared: Arc<Shared>, coupling: Option<Arc<SyncCoupling>>) -> Self {
        // The deferred tail lags at most a quarter of a completion
        // batch behind the newest packet; its counter distance must
        // stay within the wrap threshold for the sort to hold.
        debug_assert!(
            config.syt_interval * (INTERRUPT_INTERVAL as u32 / 4) <= u32::from(reorder::DBC_THRESHOLD)
        );
        let max_payload = config.max_payload();
        Self {
            config,
            shared,
            scratch: [PacketRing::new(max_payload), PacketRing::new(max_payload)],
            active_scratch: 0,
            carried: Vec::with_capacity(QUEUE_LENGTH / 4),
            table: Vec::with_capacity(QUEUE_LENGTH + QUEUE_LENGTH / 4),
            data_block_counter: 0,
            coupling,
        }
    }

    fn run(&mut self, ctx: &mut dyn IsoContext, payloads: &[&[u8]]) {
        if self.shared.fault.load(Ordering::Acquire) {
            return;
        }

        let packets = payloads.len();

        // Previous leftovers first, then this batch, sorted together.
        self.table.clear();
        for (index, &(dbc, payload_len)) in self.carried.iter().enumerate() {
            self.table.push(SortEntry {
                origin: Origin::Carried(index),
                dbc,
                payload_len,
            });
        }
        for (index, payload) in payloads.iter().enumerate() {
            let dbc = if payload.len() >= 4 {
                (quadlet::get(payload, 0) & 0xff) as u8
            } else {
                0
            };
            self.table.push(SortEntry {
                origin: Origin::Current(index),
                dbc,
                payload_len: payload.len(),
            });
        }
        reorder::sort_entries(&mut self.table);

        // Hold a quarter of the batch back; stragglers for those slots
        // may still be in flight and must sort ahead of them next time.
        let new_remain = packets / 4;
        let process = self.carried.len() + packets - new_remain;

        let table = std::mem::take(&mut self.table);
        for entry in &table[..process] {
            let payload = match entry.origin {
                Origin::Current(index) => &payloads[index][..entry.payload_len],
                Origin::Carried(slot) => &self.scratch[self.active_scratch].slot(slot)[..entry.payload_len],
            };
            if let Some(coupling) = &self.coupling {
                let syt = cip::add_transfer_delay(payload_syt(payload), self.config.transfer_delay);
                coupling.drive(syt);
            }
            handle_in_packet(&self.config, &self.shared, &mut self.data_block_counter, payload);
        }

        // Copy the deferred tail into the idle scratch ring.
        self.carried.clear();
        let (head, tail) = self.scratch.split_at_mut(1);
        let (active_ring, idle_ring) = if self.active_scratch == 0 {
            (&head[0], &mut tail[0])
        } else {
            (&tail[0], &mut head[0])
        };
        for (slot, entry) in table[process..].iter().enumerate() {
            let payload_len = entry.payload_len.min(idle_ring.slot_size());
            let bytes: &[u8] = match entry.origin {
                Origin::Current(index) => &payloads[index][..payload_len],
                Origin::Carried(from) => &active_ring.slot(from)[..payload_len],
            };
            idle_ring.slot_mut(slot)[..payload_len].copy_from_slice(bytes);
            self.carried.push((entry.dbc, payload_len));
        }
        self.active_scratch = 1 - self.active_scratch;
        self.table = table;

        // Keep the ring full: one replacement per received packet.
        for _ in 0..packets {
            if ctx.queue_receive().is_err() {
                self.shared.streaming_fault();
                return;
            }
        }

        if let Some(coupling) = &self.coupling {
            coupling.flush();
        }
        ctx.flush();
    }

}

/// The raw SYT field of `payload`, if it is long enough to have one.
fn payload_syt(payload: &[u8]) -> u16 {
    if payload.len() < 8 {
        return SYT_NO_INFO;
    }
    (quadlet::get(payload, 1) & 0xffff) as u16
}

fn handle_in_packet(config: &StreamConfig, shared: &Shared, data_block_counter: &mut u8, payload: &[u8]) {
    if payload.len() < 8 {
        if RUNT_PACKET.allow() {
            warn!("dropping {}-byte runt packet", payload.len());
        }
        return;
    }

    let word0 = quadlet::get(payload, 0);
    let word1 = quadlet::get(payload, 1);
    let header = match cip::parse_header(word0, word1) {
        Ok(header) => header,
        Err(invalid) => {
            if BAD_CIP_HEADER.allow() {
                warn!("invalid CIP header for AMDTP: {:08X}:{:08X}", invalid.word0, invalid.word1);
            }
            return;
        }
    };

    let payload_quadlets = payload.len() / 4;
    if payload_quadlets < 3 || header.is_no_data() {
        return;
    }

    // Block count comes from the payload length alone; some devices
    // report a fixed data block size whatever the rate actually is.
    let data_blocks = (payload_quadlets - 2) / config.data_block_quadlets;
    let data = &payload[8..8 + data_blocks * config.data_block_quadlets * 4];

    let pcm = shared.active_pcm();
    let pointer = shared.pcm_buffer_pointer.load(Ordering::Relaxed);
    if let Some(pcm) = &pcm {
        codec::read_pcm(config, pcm, data, data_blocks, pointer);
    }
    if config.midi_ports > 0 {
        codec::pull_midi(config, &shared.midi, *data_block_counter, data, data_blocks);
    }
    *data_block_counter = data_block_counter.wrapping_add(data_blocks as u8);

    if let Some(pcm) = pcm {
        let frames = if config.dual_wire { data_blocks * 2 } else { data_blocks };
        shared.update_pcm_pointers(&pcm, frames);
    }
}

enum RunnerBody {
    Transmit(TxEngine),
    Receive(RxEngine),
    /// Pacing is owned by the master stream; this handler only latches
    /// the first callback.
    SlaveStub,
}

struct Runner {
    shared: Arc<Shared>,
    callbacked: bool,
    body: RunnerBody,
}

impl IsoHandler for Runner {
    fn completed(&mut self, ctx: &mut dyn IsoContext, completion: Completion<'_>) {
        if !self.callbacked {
            self.callbacked = true;
            self.shared.callbacked.signal();
        }

        match (&mut self.body, completion) {
            (RunnerBody::Transmit(tx), Completion::Transmit { cycle, packets }) => {
                tx.run_cycles(ctx, cycle, packets);
            }
            (RunnerBody::Receive(rx), Completion::Receive { payloads, .. }) => {
                rx.run(ctx, payloads);
            }
            (RunnerBody::SlaveStub, _) => {}
            (_, completion) => {
                debug!("ignoring mismatched completion {completion:?}");
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SyncRole {
    Master,
    Slave,
}

struct Control {
    flags: CipFlags,
    config: Option<StreamConfig>,
    running: Option<SharedContext>,
    coupling: Option<(SyncRole, Arc<SyncCoupling>)>,
}

/// One direction of AMDTP traffic.
pub struct AmdtpStream {
    device: Arc<dyn IsoDevice>,
    direction: Direction,
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl AmdtpStream {
    /// Create an idle stream on `device`.
    pub fn new(device: Arc<dyn IsoDevice>, direction: Direction, flags: CipFlags) -> Self {
        Self {
            device,
            direction,
            shared: Shared::new(),
            control: Mutex::new(Control {
                flags,
                config: None,
                running: None,
                coupling: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        let control = self.lock();
        if control.running.is_some() {
            if self.shared.fault.load(Ordering::Acquire) {
                StreamState::Errored
            } else {
                StreamState::Running
            }
        } else if control.config.is_some() {
            StreamState::Configured
        } else {
            StreamState::Idle
        }
    }

    pub fn running(&self) -> bool {
        self.lock().running.is_some()
    }

    /// Whether the packet queue died on an asynchronous fault.
    pub fn streaming_error(&self) -> bool {
        self.shared.fault.load(Ordering::Acquire)
    }

    /// Set rate and channel counts. Must precede `start`; rejected on a
    /// running stream.
    pub fn set_parameters(&self, rate: u32, pcm_channels: usize, midi_ports: usize) -> Result<()> {
        let mut control = self.lock();
        if control.running.is_some() {
            return Err(StreamError::InvalidState(StreamState::Running));
        }
        if pcm_channels > MAX_PCM_CHANNELS {
            return Err(StreamError::TooManyPcmChannels(pcm_channels));
        }
        if midi_ports > MAX_MIDI_PORTS {
            return Err(StreamError::TooManyMidiPorts(midi_ports));
        }
        let nominal_sfc = Sfc::from_rate(rate).ok_or(StreamError::UnsupportedRate(rate))?;
        let midi_channels = midi_ports.div_ceil(8);
        if pcm_channels + midi_channels == 0 {
            return Err(StreamError::PcmGeometry);
        }

        let dual_wire = control.flags.contains(CipFlags::HI_DUALWIRE) && nominal_sfc > Sfc::S96000;
        if dual_wire && !control.flags.contains(CipFlags::BLOCKING) {
            return Err(StreamError::DualWireNeedsBlocking);
        }

        let (sfc, wire_rate, wire_channels) = if dual_wire {
            (nominal_sfc.dual_wire_base(), rate / 2, pcm_channels * 2)
        } else {
            (nominal_sfc, rate, pcm_channels)
        };

        let syt_interval = sfc.syt_interval();
        // Base buffering in the device, plus room for the blocking
        // mode's empty packets.
        let mut transfer_delay = TRANSFER_DELAY_TICKS - TICKS_PER_CYCLE;
        if control.flags.contains(CipFlags::BLOCKING) {
            transfer_delay += TICKS_PER_SECOND * syt_interval / wire_rate;
        }

        control.config = Some(StreamConfig {
            direction: self.direction,
            flags: control.flags,
            sfc,
            dual_wire,
            pcm_channels: wire_channels,
            midi_ports,
            data_block_quadlets: wire_channels + midi_channels,
            pcm_positions: (0..pcm_channels as u8).collect(),
            midi_position: wire_channels,
            syt_interval,
            transfer_delay,
            blocks_for_midi: usize::MAX,
            format: SampleFormat::S32,
        });
        Ok(())
    }

    /// Select the PCM sample format. Receive streams only support S32.
    pub fn set_pcm_format(&self, format: SampleFormat) -> Result<()> {
        let mut control = self.lock();
        if control.running.is_some() {
            return Err(StreamError::InvalidState(StreamState::Running));
        }
        let config = control.config.as_mut().ok_or(StreamError::InvalidState(StreamState::Idle))?;
        if format == SampleFormat::S16 && self.direction == Direction::Receive {
            return Err(StreamError::UnsupportedFormat(format, self.direction));
        }
        config.format = format;
        Ok(())
    }

    /// Install a discovered channel map in place of the identity map.
    pub fn set_channel_map(&self, pcm_positions: &[u8], midi_position: Option<usize>) -> Result<()> {
        let mut control = self.lock();
        if control.running.is_some() {
            return Err(StreamError::InvalidState(StreamState::Running));
        }
        let config = control.config.as_mut().ok_or(StreamError::InvalidState(StreamState::Idle))?;
        if pcm_positions.len() != config.pcm_positions.len()
            || pcm_positions.iter().any(|&p| usize::from(p) >= config.data_block_quadlets)
            || midi_position.is_some_and(|p| p >= config.data_block_quadlets)
        {
            return Err(StreamError::PcmGeometry);
        }
        config.pcm_positions = pcm_positions.to_vec();
        if let Some(position) = midi_position {
            config.midi_position = position;
        }
        Ok(())
    }

    /// Limit how many leading blocks of a packet may carry MIDI, for
    /// devices that ignore MIDI past the first few blocks.
    pub fn set_blocks_for_midi(&self, blocks: usize) -> Result<()> {
        let mut control = self.lock();
        if control.running.is_some() {
            return Err(StreamError::InvalidState(StreamState::Running));
        }
        let config = control.config.as_mut().ok_or(StreamError::InvalidState(StreamState::Idle))?;
        config.blocks_for_midi = blocks;
        Ok(())
    }

    /// Size of the largest packet the configured stream moves.
    pub fn max_payload(&self) -> Result<usize> {
        let control = self.lock();
        let config = control.config.as_ref().ok_or(StreamError::InvalidState(StreamState::Idle))?;
        Ok(config.max_payload())
    }

    /// Wire the timing relationship of a duplex pair. Neither stream
    /// may be running.
    pub fn set_sync(mode: SyncMode, master: &AmdtpStream, slave: &AmdtpStream) -> Result<()> {
        let mut master_control = master.lock();
        let mut slave_control = slave.lock();
        if master_control.running.is_some() || slave_control.running.is_some() {
            return Err(StreamError::InvalidState(StreamState::Running));
        }

        master_control.flags.remove(CipFlags::SYNC_TO_DEVICE);
        slave_control.flags.remove(CipFlags::SYNC_TO_DEVICE);

        match mode {
            SyncMode::SyncToDevice => {
                master_control.flags.insert(CipFlags::SYNC_TO_DEVICE);
                slave_control.flags.insert(CipFlags::SYNC_TO_DEVICE);
                let coupling = SyncCoupling::new();
                master_control.coupling = Some((SyncRole::Master, Arc::clone(&coupling)));
                slave_control.coupling = Some((SyncRole::Slave, coupling));
            }
            SyncMode::Local => {
                master_control.coupling = None;
                slave_control.coupling = None;
            }
        }
        Ok(())
    }

    /// Allocate the packet ring, create the transport context, queue the
    /// initial packets, and start the transport.
    pub fn start(&self, channel: u32, speed: Speed) -> Result<()> {
        let mut control = self.lock();
        if control.running.is_some() {
            return Err(StreamError::InvalidState(StreamState::Running));
        }
        let mut config = control.config.clone().ok_or(StreamError::InvalidState(StreamState::Idle))?;
        // Sync wiring may have changed the flags after configuration.
        config.flags = control.flags;

        self.shared.fault.store(false, Ordering::SeqCst);
        self.shared.callbacked.reset();
        self.shared
            .source_node_id_field
            .store(u32::from(self.device.node_id() & 0x3f) << 24, Ordering::Release);

        let slaved = config.direction == Direction::Transmit
            && config.flags.contains(CipFlags::BLOCKING | CipFlags::SYNC_TO_DEVICE)
            && matches!(control.coupling, Some((SyncRole::Slave, _)));

        let body = match config.direction {
            Direction::Transmit if slaved => RunnerBody::SlaveStub,
            Direction::Transmit => RunnerBody::Transmit(TxEngine::new(config.clone(), Arc::clone(&self.shared))),
            Direction::Receive => {
                let coupling = match &control.coupling {
                    Some((SyncRole::Master, coupling))
                        if config.flags.contains(CipFlags::BLOCKING | CipFlags::SYNC_TO_DEVICE) =>
                    {
                        Some(Arc::clone(coupling))
                    }
                    _ => None,
                };
                RunnerBody::Receive(RxEngine::new(config.clone(), Arc::clone(&self.shared), coupling))
            }
        };
        let runner = Box::new(Runner {
            shared: Arc::clone(&self.shared),
            callbacked: false,
            body,
        });

        let kind = match config.direction {
            Direction::Transmit => ContextKind::Transmit,
            Direction::Receive => ContextKind::Receive,
        };
        let context = self
            .device
            .create_context(kind, channel, speed, config.max_payload(), runner)?;
        let context: SharedContext = Arc::new(Mutex::new(context));

        {
            let mut guard = lock_context(&context);
            for index in 0..QUEUE_LENGTH {
                let queued = match config.direction {
                    Direction::Transmit => guard.queue_transmit(&IsoPacket {
                        interrupt: (index + 1) % INTERRUPT_INTERVAL == 0,
                        tag: TAG_CIP,
                        skip: true,
                        payload: &[],
                    }),
                    Direction::Receive => guard.queue_receive(),
                };
                if let Err(err) = queued {
                    guard.stop();
                    return Err(err.into());
                }
            }

            if slaved {
                if let Some((_, coupling)) = &control.coupling {
                    coupling.install(SlaveEndpoint {
                        engine: TxEngine::new(config.clone(), Arc::clone(&self.shared)),
                        context: Arc::clone(&context),
                    });
                }
            }

            // NO-DATA packets arrive with tag 0 on some devices, so a
            // receive context matches both tags.
            if let Err(err) = guard.start(MATCH_TAG0 | MATCH_TAG1) {
                if let Some((_, coupling)) = &control.coupling {
                    if slaved {
                        coupling.clear();
                    }
                }
                guard.stop();
                return Err(err.into());
            }
        }

        debug!("{:?} stream started on channel {channel}", self.direction);
        control.running = Some(context);
        Ok(())
    }

    /// Stop the transport and free the packet ring. Idempotent.
    pub fn stop(&self) {
        let mut control = self.lock();
        let Some(context) = control.running.take() else {
            return;
        };

        if let Some((SyncRole::Slave, coupling)) = &control.coupling {
            coupling.clear();
        }
        self.shared.period.kill();
        lock_context(&context).stop();
        drop(context);

        self.shared.fault.store(false, Ordering::SeqCst);
        self.shared.callbacked.reset();
        debug!("{:?} stream stopped", self.direction);
    }

    /// Refresh bus-dependent state after a bus reset.
    pub fn update(&self) {
        self.shared
            .source_node_id_field
            .store(u32::from(self.device.node_id() & 0x3f) << 24, Ordering::Release);
    }

    /// Attach or detach the PCM substream.
    ///
    /// Attachment is what makes the running stream carry real samples;
    /// detached streams transport silence.
    pub fn pcm_trigger(&self, pcm: Option<Arc<PcmSubstream>>) -> Result<()> {
        if let Some(pcm) = &pcm {
            let control = self.lock();
            let config = control.config.as_ref().ok_or(StreamError::InvalidState(StreamState::Idle))?;
            if pcm.channels() != config.nominal_channels() || pcm.format() != config.format {
                return Err(StreamError::PcmGeometry);
            }
            if config.dual_wire && pcm.period_size() % config.syt_interval as usize != 0 {
                return Err(StreamError::PcmGeometry);
            }
        }
        self.shared.pcm.set(pcm);
        Ok(())
    }

    /// Reset PCM bookkeeping; call from the PCM device's prepare path.
    pub fn pcm_prepare(&self) {
        self.shared.period.kill();
        self.shared.pcm_buffer_pointer.store(0, Ordering::SeqCst);
        self.shared.pcm_period_pointer.store(0, Ordering::SeqCst);
        self.shared.pointer_flush.store(true, Ordering::SeqCst);
    }

    /// Current hardware pointer in frames.
    pub fn pcm_pointer(&self) -> usize {
        // Flushing completions on every poll would be wasteful; flush
        // only when no period boundary has passed since the last poll.
        if self.shared.pointer_flush.load(Ordering::Relaxed) {
            if let Some(context) = &self.lock().running {
                lock_context(context).flush_completions();
            }
        } else {
            self.shared.pointer_flush.store(true, Ordering::Relaxed);
        }
        self.shared.pcm_buffer_pointer.load(Ordering::Acquire)
    }

    /// Abort the attached PCM device without touching the transport.
    pub fn pcm_abort(&self) {
        self.shared.abort_pcm();
    }

    pub fn pcm_running(&self) -> bool {
        self.shared.active_pcm().is_some()
    }

    /// Attach or detach a MIDI port. Out-of-range ports are ignored.
    pub fn midi_trigger(&self, port: usize, midi: Option<Arc<dyn MidiPort>>) {
        let in_range = {
            let control = self.lock();
            control.config.as_ref().is_some_and(|config| port < config.midi_ports)
        };
        if in_range {
            self.shared.midi[port].set(midi);
        }
    }

    pub fn midi_running(&self) -> bool {
        self.shared.midi.iter().any(|slot| slot.is_attached())
    }

    /// Block until the transport delivers its first callback.
    ///
    /// Returns `false` on timeout; the caller must stop the stream then.
    pub fn wait_first_callback(&self) -> bool {
        self.shared.callbacked.wait_timeout(CALLBACK_TIMEOUT)
    }
}

impl Drop for AmdtpStream {
    fn drop(&mut self) {
        self.stop();
    }
}
