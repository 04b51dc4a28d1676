use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Memory not mapped at address: {0:#x}")]
    UnmappedMemory(u64),

    #[error("Invalid access width: {0} bits")]
    InvalidWidth(u32),

    #[error("Address width mismatch: expected {expected} bits, got {actual}")]
    AddressWidth { expected: u32, actual: u32 },

    #[error("No mapped page is consistent with symbolic address: {address}")]
    NoFeasiblePage { address: String },

    #[error("Init data does not fit the page: offset {offset:#x}, {len} bytes")]
    InitOverflow { offset: u64, len: usize },

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
