pub type Result<T> = std::result::Result<T, CmpError>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CmpError {
    #[error("bus transaction failed: {0}")]
    Transaction(String),

    #[error("isochronous bandwidth or channel exhausted")]
    Resources,

    #[error("plug is already connected by another node")]
    Used,

    #[error("connection not established")]
    NotEstablished,

    #[error("connection lost after bus reset")]
    Invalidated,

    #[error("plug register rejected the update: {0:#010x}")]
    PlugContention(u32),
}
