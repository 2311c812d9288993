//! Scripted fakes for driving the stream core without hardware.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use fwa_amdtp::{
    Completion, ContextKind, IsoContext, IsoDevice, IsoError, IsoHandler, IsoPacket,
    duplex::{ClockError, MediaClock},
};
use fwa_cmp::{PlugBus, Speed, pcr};
use fwa_core::quadlet;

/// One packet the fake controller has emitted onto the wire.
#[derive(Debug, Clone)]
pub struct EmittedPacket {
    pub payload: Vec<u8>,
    pub skip: bool,
    pub interrupt: bool,
}

#[derive(Default)]
struct CoreState {
    handler: Option<Box<dyn IsoHandler>>,
    started: bool,
    stopped: bool,
    queued_tx: Vec<EmittedPacket>,
    queued_rx: usize,
    emitted: Vec<EmittedPacket>,
    tag_mask: u8,
}

/// One fake isochronous context, reachable from tests and from the
/// handle the stream core owns.
pub struct FakeContextCore {
    pub kind: ContextKind,
    pub channel: u32,
    pub max_payload: usize,
    auto_first_callback: bool,
    fail_queue: AtomicBool,
    state: Mutex<CoreState>,
}

impl FakeContextCore {
    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent queue operation fail.
    pub fn set_fail_queue(&self, fail: bool) {
        self.fail_queue.store(fail, Ordering::SeqCst);
    }

    pub fn queued_transmit(&self) -> usize {
        self.lock().queued_tx.len()
    }

    pub fn queued_receive(&self) -> usize {
        self.lock().queued_rx
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn tag_mask(&self) -> u8 {
        self.lock().tag_mask
    }

    /// Packets emitted so far, draining the record.
    pub fn take_emitted(&self) -> Vec<EmittedPacket> {
        std::mem::take(&mut self.lock().emitted)
    }

    fn with_handler(self: &Arc<Self>, f: impl FnOnce(&mut dyn IsoHandler, &mut dyn IsoContext)) {
        let handler = self.lock().handler.take();
        let Some(mut handler) = handler else {
            return;
        };
        let mut handle = FakeContextHandle(Arc::clone(self));
        f(handler.as_mut(), &mut handle);
        self.lock().handler = Some(handler);
    }

    /// Complete `packets` transmit slots ending on `cycle`: emit that
    /// many queued packets and hand the completion to the stream core.
    pub fn pump_transmit(self: &Arc<Self>, cycle: u32, packets: usize) {
        {
            let mut state = self.lock();
            let take = packets.min(state.queued_tx.len());
            let drained: Vec<_> = state.queued_tx.drain(..take).collect();
            state.emitted.extend(drained);
        }
        self.with_handler(|handler, ctx| {
            handler.completed(ctx, Completion::Transmit { cycle, packets });
        });
    }

    /// Deposit received packets and hand the completion to the core.
    pub fn pump_receive(self: &Arc<Self>, cycle: u32, payloads: &[Vec<u8>]) {
        {
            let mut state = self.lock();
            assert!(state.queued_rx >= payloads.len(), "ring underrun in test");
            state.queued_rx -= payloads.len();
        }
        let views: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
        self.with_handler(|handler, ctx| {
            handler.completed(ctx, Completion::Receive { cycle, payloads: &views });
        });
    }

    /// An empty completion, as the controller sends right after start.
    pub fn pump_empty(self: &Arc<Self>) {
        match self.kind {
            ContextKind::Transmit => self.pump_transmit(0, 0),
            ContextKind::Receive => self.pump_receive(0, &[]),
        }
    }
}

struct FakeContextHandle(Arc<FakeContextCore>);

impl IsoContext for FakeContextHandle {
    fn queue_transmit(&mut self, packet: &IsoPacket<'_>) -> Result<(), IsoError> {
        if self.0.fail_queue.load(Ordering::SeqCst) {
            return Err(IsoError::QueueOverrun);
        }
        self.0.lock().queued_tx.push(EmittedPacket {
            payload: packet.payload.to_vec(),
            skip: packet.skip,
            interrupt: packet.interrupt,
        });
        Ok(())
    }

    fn queue_receive(&mut self) -> Result<(), IsoError> {
        if self.0.fail_queue.load(Ordering::SeqCst) {
            return Err(IsoError::QueueOverrun);
        }
        self.0.lock().queued_rx += 1;
        Ok(())
    }

    fn flush(&mut self) {}

    fn start(&mut self, tag_mask: u8) -> Result<(), IsoError> {
        {
            let mut state = self.0.lock();
            state.started = true;
            state.tag_mask = tag_mask;
        }
        if self.0.auto_first_callback {
            let core = Arc::clone(&self.0);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(2));
                core.pump_empty();
            });
        }
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.0.lock();
        state.started = false;
        state.stopped = true;
    }
}

/// Fake controller handing out [`FakeContextCore`]s.
pub struct FakeIso {
    node_id: AtomicU16,
    auto_first_callback: bool,
    contexts: Mutex<Vec<Arc<FakeContextCore>>>,
}

impl FakeIso {
    pub fn new() -> Arc<Self> {
        Self::with_auto_callback(false)
    }

    /// A controller that delivers an empty completion right after each
    /// context starts, so `wait_first_callback` succeeds on its own.
    pub fn with_auto_callback(auto_first_callback: bool) -> Arc<Self> {
        Arc::new(Self {
            node_id: AtomicU16::new(0xffc0),
            auto_first_callback,
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn set_node_id(&self, node_id: u16) {
        self.node_id.store(node_id, Ordering::SeqCst);
    }

    /// The `index`'th context created on this controller.
    pub fn context(&self, index: usize) -> Arc<FakeContextCore> {
        Arc::clone(&self.contexts.lock().unwrap()[index])
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }
}

impl IsoDevice for FakeIso {
    fn create_context(
        &self,
        kind: ContextKind,
        channel: u32,
        _speed: Speed,
        max_payload: usize,
        handler: Box<dyn IsoHandler>,
    ) -> Result<Box<dyn IsoContext>, IsoError> {
        let core = Arc::new(FakeContextCore {
            kind,
            channel,
            max_payload,
            auto_first_callback: self.auto_first_callback,
            fail_queue: AtomicBool::new(false),
            state: Mutex::new(CoreState {
                handler: Some(handler),
                ..CoreState::default()
            }),
        });
        self.contexts.lock().unwrap().push(Arc::clone(&core));
        Ok(Box::new(FakeContextHandle(core)))
    }

    fn node_id(&self) -> u16 {
        self.node_id.load(Ordering::SeqCst)
    }
}

/// In-memory CSR register file backing the CMP client.
pub struct FakePlugBus {
    registers: Mutex<HashMap<u64, u32>>,
    generation: AtomicU32,
}

impl FakePlugBus {
    pub fn new() -> Arc<Self> {
        let mut registers = HashMap::new();
        registers.insert(pcr::CSR_BANDWIDTH_AVAILABLE, 4915);
        registers.insert(pcr::CSR_CHANNELS_AVAILABLE_HI, 0xffff_ffff);
        registers.insert(pcr::CSR_CHANNELS_AVAILABLE_LO, 0xffff_ffff);
        registers.insert(pcr::CSR_IPCR_0, 0x8000_0000);
        registers.insert(pcr::CSR_OPCR_0, 0x8000_0000);
        Arc::new(Self {
            registers: Mutex::new(registers),
            generation: AtomicU32::new(1),
        })
    }

    pub fn write(&self, addr: u64, value: u32) {
        self.registers.lock().unwrap().insert(addr, value);
    }

    pub fn value(&self, addr: u64) -> u32 {
        *self.registers.lock().unwrap().get(&addr).unwrap()
    }

    /// Bump the generation and wipe the resource and plug registers,
    /// as a bus reset does.
    pub fn bus_reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.write(pcr::CSR_BANDWIDTH_AVAILABLE, 4915);
        self.write(pcr::CSR_CHANNELS_AVAILABLE_HI, 0xffff_ffff);
        self.write(pcr::CSR_CHANNELS_AVAILABLE_LO, 0xffff_ffff);
        self.write(pcr::CSR_IPCR_0, 0x8000_0000);
        self.write(pcr::CSR_OPCR_0, 0x8000_0000);
    }

    /// Claim `channel` on behalf of some other node.
    pub fn steal_channel(&self, channel: u32) {
        let (register, bit) = pcr::channel_bit(channel);
        let bitmap = self.value(register);
        self.write(register, bitmap & !bit);
    }
}

impl PlugBus for FakePlugBus {
    fn read_quadlet(&self, addr: u64) -> fwa_cmp::Result<u32> {
        self.registers
            .lock()
            .unwrap()
            .get(&addr)
            .copied()
            .ok_or_else(|| fwa_cmp::CmpError::Transaction(format!("no register at {addr:#x}")))
    }

    fn compare_swap(&self, addr: u64, expected: u32, new: u32) -> fwa_cmp::Result<u32> {
        let mut registers = self.registers.lock().unwrap();
        let slot = registers
            .get_mut(&addr)
            .ok_or_else(|| fwa_cmp::CmpError::Transaction(format!("no register at {addr:#x}")))?;
        let observed = *slot;
        if observed == expected {
            *slot = new;
        }
        Ok(observed)
    }

    fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    fn max_speed(&self) -> Speed {
        Speed::S400
    }
}

/// A device clock that just remembers what it is told.
pub struct FakeClock {
    rate: Mutex<u32>,
    pub set_calls: AtomicU32,
}

impl FakeClock {
    pub fn new(rate: u32) -> Arc<Self> {
        Arc::new(Self {
            rate: Mutex::new(rate),
            set_calls: AtomicU32::new(0),
        })
    }
}

impl MediaClock for FakeClock {
    fn sampling_rate(&self) -> Result<u32, ClockError> {
        Ok(*self.rate.lock().unwrap())
    }

    fn set_sampling_rate(&self, rate: u32) -> Result<(), ClockError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        *self.rate.lock().unwrap() = rate;
        Ok(())
    }

    fn follows_host_timestamps(&self) -> Result<bool, ClockError> {
        Ok(false)
    }
}

/// Build a received packet: CIP header plus `blocks` data blocks of
/// `quadlets_per_block` quadlets, PCM quadlets taken from `samples`.
pub fn build_in_packet(
    dbc: u8,
    reported_quadlets: u32,
    sfc_code: u32,
    syt: u16,
    blocks: usize,
    quadlets_per_block: usize,
    samples: &mut impl Iterator<Item = i32>,
) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + blocks * quadlets_per_block * 4];
    quadlet::put(&mut packet, 0, (reported_quadlets << 16) | u32::from(dbc));
    quadlet::put(&mut packet, 1, (1 << 31) | (0x10 << 24) | (sfc_code << 16) | u32::from(syt));
    for block in 0..blocks {
        for q in 0..quadlets_per_block {
            let sample = samples.next().unwrap_or(0);
            let quad = ((sample as u32) >> 8) | 0x4000_0000;
            quadlet::put(&mut packet, 2 + block * quadlets_per_block + q, quad);
        }
    }
    packet
}

/// Parse `(data_blocks, fdf, dbc, syt, word0)` out of an emitted packet.
pub fn dissect(packet: &EmittedPacket, quadlets_per_block: usize) -> (usize, u32, u8, u16, u32) {
    let word0 = quadlet::get(&packet.payload, 0);
    let word1 = quadlet::get(&packet.payload, 1);
    let blocks = (packet.payload.len() - 8) / (4 * quadlets_per_block);
    (
        blocks,
        (word1 >> 16) & 0xff,
        (word0 & 0xff) as u8,
        (word1 & 0xffff) as u16,
        word0,
    )
}
