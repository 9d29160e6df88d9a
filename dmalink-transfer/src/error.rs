use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("endpoint is not connected")]
    NotConnected,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid device address: {0}")]
    InvalidDeviceAddress(String),
    #[error("peer reported failure")]
    PeerFailure,
    #[error("value {value:#x} exceeds the native addressable range")]
    AddressOutOfRange { value: u64 },
    #[error("range {addr:#x}+{len} is outside the imported mapping")]
    RangeOutOfBounds { addr: u64, len: u64 },
    #[error("message of {len} bytes exceeds the limit of {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("decode failed: {0}")]
    Decode(&'static str),
    #[error("memory mapping failed: {0}")]
    Map(String),
    #[error("copy engine error: {0}")]
    Engine(String),
    #[error("work queue is full")]
    QueueFull,
    #[error("buffer inventory exhausted")]
    InventoryExhausted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
