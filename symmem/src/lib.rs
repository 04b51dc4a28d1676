pub mod byte_store;
pub mod config;
pub mod context;
pub mod error;
pub mod expr;
pub mod memory;
pub mod page;
pub mod solver;
pub mod state;

pub use byte_store::{ArrayStore, ByteStore};
pub use config::{AddressPolicy, MemoryConfig};
pub use context::{ErrorReason, ExecutionContext};
pub use error::{MemoryError, Result};
pub use expr::{Expr, MAX_WIDTH, MIN_BASE, Model};
pub use memory::{Endian, Memory};
pub use page::{InitData, Page};
pub use solver::{PathSolver, Solver};
pub use state::{ErroredState, PathContext, SymbolicState};

pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;

/// Default page size - must be a power of 2.
pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

/// Default address width in bits.
pub const DEFAULT_ADDRESS_BITS: u32 = 64;

/// Default window, in pages, of the `limit_pages` address policy.
pub const DEFAULT_PAGE_LIMIT: u64 = 16;
