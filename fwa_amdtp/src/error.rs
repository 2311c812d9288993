use crate::{pcm::SampleFormat, stream::{Direction, StreamState}, transport::IsoError};

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("sampling rate {0} is not supported")]
    UnsupportedRate(u32),

    #[error("{0} PCM channels exceed the supported maximum of 64")]
    TooManyPcmChannels(usize),

    #[error("{0} MIDI ports exceed the supported maximum of 8")]
    TooManyMidiPorts(usize),

    #[error("sample format {0:?} is not supported for {1:?} streams")]
    UnsupportedFormat(SampleFormat, Direction),

    #[error("dual-wire rates require blocking mode")]
    DualWireNeedsBlocking,

    #[error("the attached PCM geometry does not fit the stream configuration")]
    PcmGeometry,

    #[error("operation invalid while the stream is {0:?}")]
    InvalidState(StreamState),

    #[error("isochronous transport: {0}")]
    Transport(#[from] IsoError),

    #[error("connection management: {0}")]
    Connection(#[from] fwa_cmp::CmpError),

    #[error("first isochronous callback did not arrive in time")]
    CallbackTimeout,

    #[error("streaming fault stopped the packet queue")]
    Streaming,

    #[error("media clock: {0}")]
    Clock(String),

    #[error("the device clock is in a sync mode this engine cannot drive")]
    SyncModeUnsupported,

    #[error("the connection is in use by another node")]
    Busy,
}
