//! One plug's isochronous connection.
//!
//! `Connection` drives the Connection Management Procedure for a single
//! input or output plug: reserve bandwidth and a channel at the
//! isochronous resource manager, point the plug control register at the
//! channel, and tear all of it down again. After a bus reset the
//! reservation is gone; `update` either reclaims it or reports the
//! connection as lost so the stream above can abort.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::{
    error::{CmpError, Result},
    pcr::{self, Speed},
};

/// Quadlet read and lock transactions against the bus.
///
/// Implementations sit on the actual FireWire transaction layer; tests
/// use an in-memory register file.
pub trait PlugBus: Send + Sync {
    /// Read the quadlet at `addr`.
    fn read_quadlet(&self, addr: u64) -> Result<u32>;

    /// Compare-swap the quadlet at `addr`.
    ///
    /// Returns the value observed before the swap; the swap took effect
    /// only if that equals `expected`.
    fn compare_swap(&self, addr: u64, expected: u32, new: u32) -> Result<u32>;

    /// Current bus generation.
    fn generation(&self) -> u32;

    /// Fastest speed both the device and the local node support.
    fn max_speed(&self) -> Speed;
}

/// Direction of the device plug the connection manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpDirection {
    /// Device input plug (iPCR); the host transmits.
    Input,
    /// Device output plug (oPCR); the host receives.
    Output,
}

#[derive(Debug, Clone, Copy)]
struct Established {
    channel: u32,
    speed: Speed,
    bandwidth: u32,
    max_payload: usize,
    generation: u32,
}

/// CMP state for one plug.
pub struct Connection {
    bus: Arc<dyn PlugBus>,
    direction: CmpDirection,
    plug: u32,
    state: Mutex<Option<Established>>,
}

impl Connection {
    /// Record the intent to connect `plug` in `direction`.
    pub fn new(bus: Arc<dyn PlugBus>, direction: CmpDirection, plug: u32) -> Self {
        Self {
            bus,
            direction,
            plug,
            state: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Established>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn plug_address(&self) -> u64 {
        let base = match self.direction {
            CmpDirection::Input => pcr::CSR_IPCR_0,
            CmpDirection::Output => pcr::CSR_OPCR_0,
        };
        pcr::plug_address(base, self.plug)
    }

    /// Channel number, once established.
    pub fn channel(&self) -> Option<u32> {
        self.lock().map(|s| s.channel)
    }

    /// Negotiated speed, once established.
    pub fn speed(&self) -> Option<Speed> {
        self.lock().map(|s| s.speed)
    }

    /// Whether another node already holds a connection on this plug.
    pub fn check_used(&self) -> Result<bool> {
        let established = self.lock().is_some();
        let register = self.bus.read_quadlet(self.plug_address())?;
        Ok(pcr::is_connected(register) && !established)
    }

    /// Reserve resources and point the plug at them.
    ///
    /// `max_payload` is the largest packet payload, in bytes, the stream
    /// will carry; it sizes the bandwidth reservation and, for output
    /// plugs, the advertised payload field. Establishing twice is a
    /// no-op returning the existing channel and speed.
    pub fn establish(&self, max_payload: usize) -> Result<(u32, Speed)> {
        let mut state = self.lock();
        if let Some(established) = *state {
            return Ok((established.channel, established.speed));
        }

        let generation = self.bus.generation();
        let speed = self.bus.max_speed();
        let bandwidth = pcr::packet_bandwidth(max_payload, speed);

        self.allocate_bandwidth(bandwidth)?;
        let channel = match self.allocate_channel() {
            Ok(channel) => channel,
            Err(err) => {
                self.release_bandwidth(bandwidth);
                return Err(err);
            }
        };

        if let Err(err) = self.claim_plug(channel, speed, max_payload) {
            self.release_channel(channel);
            self.release_bandwidth(bandwidth);
            return Err(err);
        }

        debug!(
            "established {:?} plug {}: channel {}, speed {:?}, {} bandwidth units",
            self.direction, self.plug, channel, speed, bandwidth
        );
        *state = Some(Established {
            channel,
            speed,
            bandwidth,
            max_payload,
            generation,
        });
        Ok((channel, speed))
    }

    /// Release the plug and its resources.
    ///
    /// Idempotent; failures to give resources back (typical right after
    /// a bus reset, when the resource registers have been wiped anyway)
    /// are logged and swallowed.
    pub fn break_connection(&self) {
        let mut state = self.lock();
        let Some(established) = state.take() else {
            return;
        };

        if let Err(err) = self.release_plug() {
            warn!("failed to release plug register: {err}");
        }
        self.release_channel(established.channel);
        self.release_bandwidth(established.bandwidth);
        debug!("broke {:?} plug {} connection", self.direction, self.plug);
    }

    /// Re-validate the connection after a bus reset.
    ///
    /// Resource registers are cleared by a reset, so the reservation
    /// must be claimed again. If the channel or bandwidth has been taken
    /// by another node in the meantime the connection is lost; the state
    /// is dropped and [`CmpError::Invalidated`] is returned.
    pub fn update(&self) -> Result<()> {
        let mut state = self.lock();
        let Some(mut established) = *state else {
            return Ok(());
        };

        let generation = self.bus.generation();
        if generation == established.generation {
            return Ok(());
        }

        let reclaimed = self
            .allocate_bandwidth(established.bandwidth)
            .and_then(|()| match self.claim_channel(established.channel) {
                Ok(()) => Ok(()),
                Err(err) => {
                    self.release_bandwidth(established.bandwidth);
                    Err(err)
                }
            })
            .and_then(|()| {
                match self.claim_plug(established.channel, established.speed, established.max_payload) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        self.release_channel(established.channel);
                        self.release_bandwidth(established.bandwidth);
                        Err(err)
                    }
                }
            });

        match reclaimed {
            Ok(()) => {
                established.generation = generation;
                *state = Some(established);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "lost {:?} plug {} connection across bus reset: {err}",
                    self.direction, self.plug
                );
                *state = None;
                Err(CmpError::Invalidated)
            }
        }
    }

    fn allocate_bandwidth(&self, units: u32) -> Result<()> {
        let mut available = self.bus.read_quadlet(pcr::CSR_BANDWIDTH_AVAILABLE)?;
        for _ in 0..4 {
            if available < units {
                return Err(CmpError::Resources);
            }
            let observed =
                self.bus
                    .compare_swap(pcr::CSR_BANDWIDTH_AVAILABLE, available, available - units)?;
            if observed == available {
                return Ok(());
            }
            available = observed;
        }
        Err(CmpError::Resources)
    }

    fn release_bandwidth(&self, units: u32) {
        let Ok(mut available) = self.bus.read_quadlet(pcr::CSR_BANDWIDTH_AVAILABLE) else {
            return;
        };
        for _ in 0..4 {
            match self
                .bus
                .compare_swap(pcr::CSR_BANDWIDTH_AVAILABLE, available, available + units)
            {
                Ok(observed) if observed == available => return,
                Ok(observed) => available = observed,
                Err(_) => return,
            }
        }
        warn!("failed to return {units} bandwidth units");
    }

    fn claim_channel(&self, channel: u32) -> Result<()> {
        let (register, bit) = pcr::channel_bit(channel);
        let bitmap = self.bus.read_quadlet(register)?;
        if bitmap & bit == 0 {
            return Err(CmpError::Resources);
        }
        let observed = self.bus.compare_swap(register, bitmap, bitmap & !bit)?;
        if observed == bitmap {
            Ok(())
        } else {
            Err(CmpError::Resources)
        }
    }

    fn allocate_channel(&self) -> Result<u32> {
        for channel in 0..64 {
            match self.claim_channel(channel) {
                Ok(()) => return Ok(channel),
                Err(CmpError::Resources) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(CmpError::Resources)
    }

    fn release_channel(&self, channel: u32) {
        let (register, bit) = pcr::channel_bit(channel);
        let Ok(mut bitmap) = self.bus.read_quadlet(register) else {
            return;
        };
        for _ in 0..4 {
            match self.bus.compare_swap(register, bitmap, bitmap | bit) {
                Ok(observed) if observed == bitmap => return,
                Ok(observed) => bitmap = observed,
                Err(_) => return,
            }
        }
        warn!("failed to return channel {channel}");
    }

    fn claim_plug(&self, channel: u32, speed: Speed, max_payload: usize) -> Result<()> {
        let address = self.plug_address();
        let current = self.bus.read_quadlet(address)?;
        if !pcr::is_online(current) {
            return Err(CmpError::PlugContention(current));
        }

        let mut desired = pcr::with_connection(current, channel);
        if self.direction == CmpDirection::Output {
            desired = pcr::with_output_params(desired, speed, max_payload);
        }

        let observed = self.bus.compare_swap(address, current, desired)?;
        if observed == current {
            Ok(())
        } else {
            Err(CmpError::PlugContention(observed))
        }
    }

    fn release_plug(&self) -> Result<()> {
        let address = self.plug_address();
        let current = self.bus.read_quadlet(address)?;
        let desired = pcr::without_connection(current);
        let observed = self.bus.compare_swap(address, current, desired)?;
        if observed == current {
            Ok(())
        } else {
            Err(CmpError::PlugContention(observed))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicU32, Ordering},
    };

    use super::*;

    struct FakeBus {
        registers: Mutex<HashMap<u64, u32>>,
        generation: AtomicU32,
    }

    impl FakeBus {
        fn new() -> Self {
            let mut registers = HashMap::new();
            registers.insert(pcr::CSR_BANDWIDTH_AVAILABLE, 4915);
            registers.insert(pcr::CSR_CHANNELS_AVAILABLE_HI, 0xffff_ffff);
            registers.insert(pcr::CSR_CHANNELS_AVAILABLE_LO, 0xffff_ffff);
            registers.insert(pcr::CSR_IPCR_0, 0x8000_0000);
            registers.insert(pcr::CSR_OPCR_0, 0x8000_0000);
            Self {
                registers: Mutex::new(registers),
                generation: AtomicU32::new(1),
            }
        }

        fn write(&self, addr: u64, value: u32) {
            self.registers.lock().unwrap().insert(addr, value);
        }

        fn value(&self, addr: u64) -> u32 {
            *self.registers.lock().unwrap().get(&addr).unwrap()
        }

        fn bus_reset(&self) {
            self.generation.fetch_add(1, Ordering::SeqCst);
            // A reset wipes the IRM reservations and the plug state.
            self.write(pcr::CSR_BANDWIDTH_AVAILABLE, 4915);
            self.write(pcr::CSR_CHANNELS_AVAILABLE_HI, 0xffff_ffff);
            self.write(pcr::CSR_CHANNELS_AVAILABLE_LO, 0xffff_ffff);
            self.write(pcr::CSR_IPCR_0, 0x8000_0000);
            self.write(pcr::CSR_OPCR_0, 0x8000_0000);
        }
    }

    impl PlugBus for FakeBus {
        fn read_quadlet(&self, addr: u64) -> Result<u32> {
            self.registers
                .lock()
                .unwrap()
                .get(&addr)
                .copied()
                .ok_or_else(|| CmpError::Transaction(format!("no register at {addr:#x}")))
        }

        fn compare_swap(&self, addr: u64, expected: u32, new: u32) -> Result<u32> {
            let mut registers = self.registers.lock().unwrap();
            let slot = registers
                .get_mut(&addr)
                .ok_or_else(|| CmpError::Transaction(format!("no register at {addr:#x}")))?;
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

    #[test]
    fn test_establish_reserves_and_claims() {
        let bus = Arc::new(FakeBus::new());
        let conn = Connection::new(Arc::clone(&bus) as Arc<dyn PlugBus>, CmpDirection::Input, 0);

        let (channel, speed) = conn.establish(584).unwrap();
        assert_eq!(channel, 0);
        assert_eq!(speed, Speed::S400);

        // Channel 0 taken, bandwidth reduced, plug points at the channel.
        assert_eq!(bus.value(pcr::CSR_CHANNELS_AVAILABLE_HI), 0x7fff_ffff);
        assert!(bus.value(pcr::CSR_BANDWIDTH_AVAILABLE) < 4915);
        let ipcr = bus.value(pcr::CSR_IPCR_0);
        assert_eq!(pcr::p2p_count(ipcr), 1);
        assert_eq!(pcr::channel(ipcr), 0);
    }

    #[test]
    fn test_establish_is_idempotent() {
        let bus = Arc::new(FakeBus::new());
        let conn = Connection::new(Arc::clone(&bus) as Arc<dyn PlugBus>, CmpDirection::Output, 0);

        let first = conn.establish(128).unwrap();
        let second = conn.establish(128).unwrap();
        assert_eq!(first, second);
        assert_eq!(pcr::p2p_count(bus.value(pcr::CSR_OPCR_0)), 1);
    }

    #[test]
    fn test_break_releases_everything() {
        let bus = Arc::new(FakeBus::new());
        let conn = Connection::new(Arc::clone(&bus) as Arc<dyn PlugBus>, CmpDirection::Input, 0);

        conn.establish(584).unwrap();
        conn.break_connection();
        conn.break_connection(); // idempotent

        assert_eq!(bus.value(pcr::CSR_BANDWIDTH_AVAILABLE), 4915);
        assert_eq!(bus.value(pcr::CSR_CHANNELS_AVAILABLE_HI), 0xffff_ffff);
        assert_eq!(pcr::p2p_count(bus.value(pcr::CSR_IPCR_0)), 0);
        assert!(conn.channel().is_none());
    }

    #[test]
    fn test_bandwidth_exhaustion() {
        let bus = Arc::new(FakeBus::new());
        bus.write(pcr::CSR_BANDWIDTH_AVAILABLE, 10);
        let conn = Connection::new(Arc::clone(&bus) as Arc<dyn PlugBus>, CmpDirection::Input, 0);

        assert_eq!(conn.establish(1024), Err(CmpError::Resources));
        // Nothing leaked.
        assert_eq!(bus.value(pcr::CSR_BANDWIDTH_AVAILABLE), 10);
    }

    #[test]
    fn test_offline_plug_refused() {
        let bus = Arc::new(FakeBus::new());
        bus.write(pcr::CSR_IPCR_0, 0);
        let conn = Connection::new(Arc::clone(&bus) as Arc<dyn PlugBus>, CmpDirection::Input, 0);

        assert!(matches!(conn.establish(584), Err(CmpError::PlugContention(_))));
        assert_eq!(bus.value(pcr::CSR_BANDWIDTH_AVAILABLE), 4915);
        assert_eq!(bus.value(pcr::CSR_CHANNELS_AVAILABLE_HI), 0xffff_ffff);
    }

    #[test]
    fn test_update_without_reset_is_noop() {
        let bus = Arc::new(FakeBus::new());
        let conn = Connection::new(Arc::clone(&bus) as Arc<dyn PlugBus>, CmpDirection::Input, 0);
        conn.establish(584).unwrap();
        assert_eq!(conn.update(), Ok(()));
    }

    #[test]
    fn test_update_reclaims_after_reset() {
        let bus = Arc::new(FakeBus::new());
        let conn = Connection::new(Arc::clone(&bus) as Arc<dyn PlugBus>, CmpDirection::Input, 0);
        let (channel, _) = conn.establish(584).unwrap();

        bus.bus_reset();
        assert_eq!(conn.update(), Ok(()));
        assert_eq!(conn.channel(), Some(channel));

        let (register, bit) = pcr::channel_bit(channel);
        assert_eq!(bus.value(register) & bit, 0);
    }

    #[test]
    fn test_update_reports_lost_reservation() {
        let bus = Arc::new(FakeBus::new());
        let conn = Connection::new(Arc::clone(&bus) as Arc<dyn PlugBus>, CmpDirection::Input, 0);
        let (channel, _) = conn.establish(584).unwrap();

        bus.bus_reset();
        // Another node grabbed our channel before we revalidated.
        let (register, bit) = pcr::channel_bit(channel);
        let bitmap = bus.value(register);
        bus.write(register, bitmap & !bit);

        assert_eq!(conn.update(), Err(CmpError::Invalidated));
        assert!(conn.channel().is_none());
    }

    #[test]
    fn test_check_used() {
        let bus = Arc::new(FakeBus::new());
        let conn = Connection::new(Arc::clone(&bus) as Arc<dyn PlugBus>, CmpDirection::Output, 0);

        assert!(!conn.check_used().unwrap());

        // Some other node holds a connection on the plug.
        bus.write(pcr::CSR_OPCR_0, pcr::with_connection(0x8000_0000, 7));
        assert!(conn.check_used().unwrap());

        // Our own established connection does not count as "used by others".
        bus.write(pcr::CSR_OPCR_0, 0x8000_0000);
        conn.establish(584).unwrap();
        assert!(!conn.check_used().unwrap());
    }
}
