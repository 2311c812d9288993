//! The isochronous controller seam.
//!
//! The stream core drives packets through these traits; platform glue
//! implements them over the actual bus controller and tests implement
//! them over scripted fakes. A context delivers completions in batches,
//! one callback per group of elapsed cycles, and the handler queues
//! replacement packets from inside the callback.

use fwa_cmp::Speed;

/// Matching bit for isochronous tag 0.
pub const MATCH_TAG0: u8 = 1 << 0;
/// Matching bit for isochronous tag 1.
pub const MATCH_TAG1: u8 = 1 << 1;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum IsoError {
    #[error("no free isochronous context on this controller")]
    Busy,

    #[error("the context packet queue rejected the packet")]
    QueueOverrun,

    #[error("isochronous transport failure: {0}")]
    Failed(String),
}

/// Direction of an isochronous context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Transmit,
    Receive,
}

/// One packet handed to a transmit context.
#[derive(Debug)]
pub struct IsoPacket<'a> {
    /// Request a completion interrupt after this packet.
    pub interrupt: bool,
    /// Isochronous tag field.
    pub tag: u8,
    /// Occupy the cycle without transmitting anything.
    pub skip: bool,
    /// Encoded packet bytes, header included. Empty for skip packets.
    pub payload: &'a [u8],
}

/// A batch of completed cycles delivered to the stream core.
#[derive(Debug)]
pub enum Completion<'a> {
    /// `packets` transmit slots completed, the last on `cycle`.
    Transmit { cycle: u32, packets: usize },
    /// Packets deposited by the receive context, in completion order,
    /// each with the length the controller reported.
    Receive { cycle: u32, payloads: &'a [&'a [u8]] },
}

/// Callback body attached to one context.
pub trait IsoHandler: Send {
    /// Process one completion batch and re-queue packets on `ctx`.
    ///
    /// Runs in the transport callback domain: must not block.
    fn completed(&mut self, ctx: &mut dyn IsoContext, completion: Completion<'_>);
}

/// One running isochronous context.
pub trait IsoContext: Send {
    /// Queue a packet for transmission.
    fn queue_transmit(&mut self, packet: &IsoPacket<'_>) -> Result<(), IsoError>;

    /// Hand an empty slot back to a receive context.
    fn queue_receive(&mut self) -> Result<(), IsoError>;

    /// Submit whatever has been queued since the last flush.
    fn flush(&mut self);

    /// Ask the controller to deliver any pending completions now.
    fn flush_completions(&mut self) {}

    /// Start the context. `tag_mask` selects which isochronous tags a
    /// receive context matches.
    fn start(&mut self, tag_mask: u8) -> Result<(), IsoError>;

    /// Stop the context. Queued packets are discarded.
    fn stop(&mut self);
}

/// Access to one device's isochronous facilities.
pub trait IsoDevice: Send + Sync {
    /// Create a context bound to `channel` at `speed`.
    ///
    /// `max_payload` sizes receive slots; `handler` is invoked from the
    /// controller's callback domain for every completion batch.
    fn create_context(
        &self,
        kind: ContextKind,
        channel: u32,
        speed: Speed,
        max_payload: usize,
        handler: Box<dyn IsoHandler>,
    ) -> Result<Box<dyn IsoContext>, IsoError>;

    /// The local node id on the bus, re-read after every bus reset.
    fn node_id(&self) -> u16;
}
