use crate::byte_store::ByteStore;
use crate::expr::Expr;
use crate::memory::Memory;
use crate::solver::Solver;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    ReadUnmapped,
    WriteUnmapped,
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::ReadUnmapped => write!(f, "read unmapped"),
            ErrorReason::WriteUnmapped => write!(f, "write unmapped"),
        }
    }
}

/// The execution state that owns a [`Memory`].
///
/// Memory operations borrow the context next to the memory itself: they query
/// and extend the path through [`solver`](Self::solver) and hand back states
/// they fork.
pub trait ExecutionContext<S: ByteStore> {
    type Solver: Solver;

    fn solver(&mut self) -> &mut Self::Solver;

    /// Record a forked state whose memory is `memory` and whose path is the
    /// current path extended with `constraint`.
    fn report_errored(&mut self, memory: Memory<S>, constraint: Expr, reason: ErrorReason);
}
