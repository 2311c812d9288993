pub type Result<T> = std::result::Result<T, EfcError>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EfcError {
    #[error("command transport failed: {0}")]
    Bus(String),

    #[error("no matching response arrived within the retry budget")]
    Timeout,

    #[error("device returned status {retval} for command {category}/{command}")]
    Device { category: u32, command: u32, retval: u32 },

    #[error("malformed response frame: {0}")]
    Malformed(String),

    #[error("unsupported sampling rate {0}")]
    UnsupportedRate(u32),

    #[error("unknown clock source code {0}")]
    UnknownClockSource(u32),
}
