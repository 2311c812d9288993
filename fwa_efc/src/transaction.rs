//! Sequenced request/response transactions.
//!
//! A request is written to the command region; the device answers with
//! a write into the response region, which the platform glue feeds to
//! [`Transceiver::dispatch_response`]. Responses are paired with their
//! request by a per-transaction match mask over the frame bytes, then
//! cross-checked against the header fields on completion. Each waiter
//! owns a one-shot latch, so the dispatcher never searches under a held
//! lock longer than a list walk.

use std::{
    sync::{Arc, Mutex, MutexGuard, atomic::{AtomicU32, Ordering}},
    thread,
    time::Duration,
};

use fwa_core::{LatchEvent, LogGate};
use log::{debug, warn};

use crate::{
    error::{EfcError, Result},
    frame::{Frame, HEADER_QUADLETS, RETVAL_OK},
};

/// Per-try response timeout.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(125);
/// Tries per transaction.
pub const COMMAND_TRIES: usize = 3;
/// Spacing between tries.
pub const COMMAND_RETRY_DELAY: Duration = Duration::from_millis(5);

static UNMATCHED_RESPONSE: LogGate = LogGate::new(Duration::from_secs(1));

/// The write seam to the device's command region.
pub trait CommandBus: Send + Sync {
    /// Post an encoded request frame to the command address.
    fn write_command(&self, frame: &[u8]) -> Result<()>;
}

/// Byte-indexed match mask: bit `i` set means response byte `i` must
/// equal request byte `i`.
#[derive(Debug, Clone)]
pub struct MatchMask {
    bits: Vec<u8>,
}

impl MatchMask {
    /// An empty mask covering a frame of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
        }
    }

    /// Require response byte `index` to echo the request.
    pub fn require_byte(&mut self, index: usize) {
        self.bits[index / 8] |= 1 << (index % 8);
    }

    /// Require all four bytes of quadlet `index` to echo the request.
    pub fn require_quadlet(&mut self, index: usize) {
        for byte in index * 4..index * 4 + 4 {
            self.require_byte(byte);
        }
    }

    /// Whether `response` agrees with `request` on every masked byte.
    pub fn matches(&self, request: &[u8], response: &[u8]) -> bool {
        for index in 0..request.len() {
            if self.bits[index / 8] & (1 << (index % 8)) == 0 {
                continue;
            }
            if response.get(index) != Some(&request[index]) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
enum PendingState {
    Waiting,
    Responded(Vec<u8>),
    BusReset,
}

struct Pending {
    request: Vec<u8>,
    mask: MatchMask,
    state: Mutex<PendingState>,
    event: LatchEvent,
}

impl Pending {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rearm(&self) {
        *self.lock() = PendingState::Waiting;
        self.event.reset();
    }
}

/// Request/response transceiver over one device's command region.
pub struct Transceiver {
    bus: Arc<dyn CommandBus>,
    seqnum: AtomicU32,
    pending: Mutex<Vec<Arc<Pending>>>,
}

impl Transceiver {
    pub fn new(bus: Arc<dyn CommandBus>) -> Self {
        Self {
            bus,
            seqnum: AtomicU32::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn pending_list(&self) -> MutexGuard<'_, Vec<Arc<Pending>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one transaction and return the response parameters.
    ///
    /// Retries up to [`COMMAND_TRIES`] times with [`COMMAND_RETRY_DELAY`]
    /// spacing; each try waits [`COMMAND_TIMEOUT`] for a matching
    /// response. A bus reset re-arms the pending transaction and retries
    /// immediately once the reset settles.
    pub fn transaction(&self, category: u32, command: u32, params: &[u32]) -> Result<Vec<u32>> {
        let seqnum = self.seqnum.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::request(seqnum, category, command, params.to_vec());
        let request = frame.encode();

        // The response must echo sequence number, category, and command.
        let mut mask = MatchMask::new(request.len());
        mask.require_quadlet(2);
        mask.require_quadlet(3);
        mask.require_quadlet(4);

        let pending = Arc::new(Pending {
            request,
            mask,
            state: Mutex::new(PendingState::Waiting),
            event: LatchEvent::new(),
        });
        self.pending_list().push(Arc::clone(&pending));

        let result = self.run(&pending, category, command, seqnum);

        self.pending_list().retain(|entry| !Arc::ptr_eq(entry, &pending));
        result
    }

    fn run(&self, pending: &Arc<Pending>, category: u32, command: u32, seqnum: u32) -> Result<Vec<u32>> {
        let mut tries = 0;
        let mut resets = 0;

        while tries < COMMAND_TRIES {
            self.bus.write_command(&pending.request)?;

            if !pending.event.wait_timeout(COMMAND_TIMEOUT) {
                tries += 1;
                if tries < COMMAND_TRIES {
                    thread::sleep(COMMAND_RETRY_DELAY);
                }
                continue;
            }

            let state = std::mem::replace(&mut *pending.lock(), PendingState::Waiting);
            match state {
                PendingState::Responded(bytes) => {
                    return complete(&bytes, category, command, seqnum);
                }
                PendingState::BusReset => {
                    debug!("transaction {seqnum} nudged by bus reset, retrying");
                    pending.rearm();
                    resets += 1;
                    if resets > COMMAND_TRIES {
                        return Err(EfcError::Timeout);
                    }
                    thread::sleep(COMMAND_RETRY_DELAY);
                }
                PendingState::Waiting => {
                    // Spurious wake; wait again on the same try.
                    pending.event.reset();
                }
            }
        }

        Err(EfcError::Timeout)
    }

    /// Feed bytes the device wrote into the response region.
    ///
    /// The first pending transaction whose match mask agrees is
    /// completed; anything else is dropped with a rate-limited warning.
    pub fn dispatch_response(&self, bytes: &[u8]) {
        let pending = self.pending_list();
        for entry in pending.iter() {
            let mut state = entry.lock();
            if !matches!(*state, PendingState::Waiting) {
                continue;
            }
            if entry.mask.matches(&entry.request, bytes) {
                *state = PendingState::Responded(bytes.to_vec());
                drop(state);
                entry.event.signal();
                return;
            }
        }
        drop(pending);

        if UNMATCHED_RESPONSE.allow() {
            warn!("dropping response frame matching no pending transaction ({} bytes)", bytes.len());
        }
    }

    /// Nudge every pending transaction after a bus reset.
    pub fn bus_reset(&self) {
        let pending = self.pending_list();
        for entry in pending.iter() {
            let mut state = entry.lock();
            if matches!(*state, PendingState::Waiting) {
                *state = PendingState::BusReset;
                drop(state);
                entry.event.signal();
            }
        }
    }
}

fn complete(bytes: &[u8], category: u32, command: u32, seqnum: u32) -> Result<Vec<u32>> {
    let frame = Frame::decode(bytes)?;

    if frame.seqnum != seqnum || frame.category != category || frame.command != command {
        return Err(EfcError::Malformed(format!(
            "response header {}/{}/{} does not answer request {}/{}/{}",
            frame.seqnum, frame.category, frame.command, seqnum, category, command
        )));
    }
    if frame.retval != RETVAL_OK {
        return Err(EfcError::Device {
            category,
            command,
            retval: frame.retval,
        });
    }

    debug_assert_eq!(frame.quadlet_count(), HEADER_QUADLETS + frame.params.len());
    Ok(frame.params)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use fwa_core::quadlet;

    use super::*;
    use crate::frame::category;

    /// Bus that hands each request to a responder closure on a thread.
    struct ScriptedBus {
        responder: Mutex<Option<Box<dyn Fn(Vec<u8>) + Send>>>,
    }

    impl ScriptedBus {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responder: Mutex::new(None),
            })
        }

        fn set_responder(&self, responder: impl Fn(Vec<u8>) + Send + 'static) {
            *self.responder.lock().unwrap() = Some(Box::new(responder));
        }
    }

    impl CommandBus for ScriptedBus {
        fn write_command(&self, frame: &[u8]) -> Result<()> {
            if let Some(responder) = self.responder.lock().unwrap().as_ref() {
                responder(frame.to_vec());
            }
            Ok(())
        }
    }

    fn respond_later(transceiver: &Arc<Transceiver>, bytes: Vec<u8>) {
        let transceiver = Arc::clone(transceiver);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            transceiver.dispatch_response(&bytes);
        });
    }

    /// Build a success response echoing the request header.
    fn response_for(request: &[u8], params: &[u32]) -> Vec<u8> {
        let mut frame = Frame::decode(request).unwrap();
        frame.retval = RETVAL_OK;
        frame.params = params.to_vec();
        frame.encode()
    }

    #[test]
    fn test_transaction_completes() {
        let bus = ScriptedBus::new();
        let transceiver = Arc::new(Transceiver::new(Arc::clone(&bus) as Arc<dyn CommandBus>));

        let tx = Arc::clone(&transceiver);
        bus.set_responder(move |request| {
            let response = response_for(&request, &[10, 20]);
            respond_later(&tx, response);
        });

        let params = transceiver.transaction(category::HWCTL, 1, &[5]).unwrap();
        assert_eq!(params, vec![10, 20]);
    }

    #[test]
    fn test_stale_sequence_is_ignored_until_timeout() {
        let bus = ScriptedBus::new();
        let transceiver = Arc::new(Transceiver::new(Arc::clone(&bus) as Arc<dyn CommandBus>));

        let tx = Arc::clone(&transceiver);
        bus.set_responder(move |request| {
            let mut stale = response_for(&request, &[]);
            let seqnum = quadlet::get(&stale, 2);
            quadlet::put(&mut stale, 2, seqnum.wrapping_add(99));
            respond_later(&tx, stale);
        });

        let start = Instant::now();
        let result = transceiver.transaction(category::HWCTL, 1, &[]);
        assert_eq!(result, Err(EfcError::Timeout));
        // Three tries of 125 ms each, plus retry spacing.
        assert!(start.elapsed() >= Duration::from_millis(375));
    }

    #[test]
    fn test_device_error_is_reported() {
        let bus = ScriptedBus::new();
        let transceiver = Arc::new(Transceiver::new(Arc::clone(&bus) as Arc<dyn CommandBus>));

        let tx = Arc::clone(&transceiver);
        bus.set_responder(move |request| {
            let mut response = response_for(&request, &[]);
            quadlet::put(&mut response, 5, 8); // bad-rate status
            respond_later(&tx, response);
        });

        let result = transceiver.transaction(category::HWCTL, 0, &[]);
        assert_eq!(
            result,
            Err(EfcError::Device {
                category: category::HWCTL,
                command: 0,
                retval: 8
            })
        );
    }

    #[test]
    fn test_bus_reset_nudges_then_retry_succeeds() {
        let bus = ScriptedBus::new();
        let transceiver = Arc::new(Transceiver::new(Arc::clone(&bus) as Arc<dyn CommandBus>));

        let seen = Arc::new(AtomicU32::new(0));
        let tx = Arc::clone(&transceiver);
        let counter = Arc::clone(&seen);
        bus.set_responder(move |request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                // First write: a bus reset intervenes instead of a response.
                let tx = Arc::clone(&tx);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(2));
                    tx.bus_reset();
                });
            } else {
                respond_later(&tx, response_for(&request, &[1]));
            }
        });

        let start = Instant::now();
        let params = transceiver.transaction(category::HWINFO, 0, &[]).unwrap();
        assert_eq!(params, vec![1]);
        // The nudge retries immediately; no 125 ms try is burned.
        assert!(start.elapsed() < Duration::from_millis(125));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_transactions_pair_by_sequence() {
        let bus = ScriptedBus::new();
        let transceiver = Arc::new(Transceiver::new(Arc::clone(&bus) as Arc<dyn CommandBus>));

        let tx = Arc::clone(&transceiver);
        bus.set_responder(move |request| {
            // Echo the request's own sequence number back as its payload.
            let seqnum = quadlet::get(&request, 2);
            respond_later(&tx, response_for(&request, &[seqnum]));
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let transceiver = Arc::clone(&transceiver);
            handles.push(thread::spawn(move || {
                transceiver.transaction(category::HWINFO, 0, &[]).unwrap()
            }));
        }

        let mut answers: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()[0]).collect();
        answers.sort_unstable();
        assert_eq!(answers, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_match_mask_bytes() {
        let mut mask = MatchMask::new(12);
        mask.require_quadlet(2);

        let request = [0u8; 12];
        let mut response = [0u8; 12];
        assert!(mask.matches(&request, &response));

        response[8] = 1;
        assert!(!mask.matches(&request, &response));

        // Unmasked bytes may differ freely.
        response[8] = 0;
        response[0] = 0xff;
        assert!(mask.matches(&request, &response));
    }

    #[test]
    fn test_short_response_never_matches() {
        let mut mask = MatchMask::new(8);
        mask.require_byte(7);
        assert!(!mask.matches(&[0u8; 8], &[0u8; 4]));
    }
}
