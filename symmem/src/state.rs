use crate::byte_store::{ArrayStore, ByteStore};
use crate::config::MemoryConfig;
use crate::context::{ErrorReason, ExecutionContext};
use crate::error::Result;
use crate::expr::Expr;
use crate::memory::{Endian, Memory};
use crate::page::InitData;
use crate::solver::{PathSolver, Solver};
use tracing::debug;

/// A state reported by memory as invalid, with the reason it was split off.
#[derive(Debug)]
pub struct ErroredState<S: ByteStore = ArrayStore> {
    pub state: SymbolicState<S>,
    pub reason: ErrorReason,
}

/// Path condition of a [`SymbolicState`] and the errored states split off it.
#[derive(Debug)]
pub struct PathContext<S: ByteStore = ArrayStore> {
    solver: PathSolver,
    errored: Vec<ErroredState<S>>,
}

impl<S: ByteStore> PathContext<S> {
    pub fn new(solver: PathSolver) -> Self {
        Self {
            solver,
            errored: Vec::new(),
        }
    }
}

impl<S: ByteStore> ExecutionContext<S> for PathContext<S> {
    type Solver = PathSolver;

    fn solver(&mut self) -> &mut PathSolver {
        &mut self.solver
    }

    fn report_errored(&mut self, memory: Memory<S>, constraint: Expr, reason: ErrorReason) {
        let mut solver = self.solver.clone();
        solver.add_constraints(constraint);
        debug!(
            "errored state ({}) with {} path constraints",
            reason,
            solver.constraints().len()
        );
        self.errored.push(ErroredState {
            state: SymbolicState {
                memory,
                path: PathContext::new(solver),
            },
            reason,
        });
    }
}

/// Minimal execution state: an address space plus the path it was reached on.
#[derive(Debug)]
pub struct SymbolicState<S: ByteStore = ArrayStore> {
    pub memory: Memory<S>,
    pub path: PathContext<S>,
}

impl<S: ByteStore> SymbolicState<S> {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        Ok(Self {
            memory: Memory::new(config)?,
            path: PathContext::new(PathSolver::new()),
        })
    }

    pub fn solver(&self) -> &PathSolver {
        &self.path.solver
    }

    pub fn add_constraints(&mut self, constraint: Expr) {
        self.path.solver.add_constraints(constraint);
    }

    pub fn errored(&self) -> &[ErroredState<S>] {
        &self.path.errored
    }

    pub fn take_errored(&mut self) -> Vec<ErroredState<S>> {
        std::mem::take(&mut self.path.errored)
    }

    /// Split off a sibling state sharing every page copy-on-write.
    pub fn fork(&mut self) -> Self {
        Self {
            memory: self.memory.copy(),
            path: PathContext::new(self.path.solver.clone()),
        }
    }

    pub fn mmap(&mut self, address: u64, size: u64, init: Option<InitData>) -> Result<()> {
        self.memory.mmap(address, size, init)
    }

    pub fn allocate(&mut self, size: u64, init: Option<InitData>) -> Result<u64> {
        self.memory.allocate(size, init)
    }

    pub fn load(&mut self, address: &Expr, bits: u32, endian: Endian) -> Result<Expr> {
        self.memory.load(&mut self.path, address, bits, endian)
    }

    pub fn store(&mut self, address: &Expr, value: &Expr, endian: Endian) -> Result<()> {
        self.memory.store(&mut self.path, address, value, endian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_keeps_path_and_memory() {
        let mut state = SymbolicState::<ArrayStore>::new(MemoryConfig::default()).unwrap();
        state.mmap(0x1000, 0x1000, None).unwrap();
        let x = Expr::symbol("x", 64);
        state.add_constraints(Expr::eq(x.clone(), Expr::constant(7, 64)));

        let mut child = state.fork();
        assert_eq!(child.solver().constraints(), state.solver().constraints());
        assert!(child.memory.is_mapped(0x1000));

        // Constraints added to the child stay on the child.
        child.add_constraints(Expr::ult(x, Expr::constant(8, 64)));
        assert_eq!(state.solver().constraints().len(), 1);
        assert_eq!(child.solver().constraints().len(), 2);
    }

    #[test]
    fn test_report_errored_extends_cloned_path() {
        let mut state = SymbolicState::<ArrayStore>::new(MemoryConfig::default()).unwrap();
        let x = Expr::symbol("x", 8);
        let memory = state.memory.copy();
        state
            .path
            .report_errored(memory, Expr::eq(x.clone(), Expr::constant(1, 8)), ErrorReason::ReadUnmapped);

        assert!(state.solver().constraints().is_empty());
        let errored = state.take_errored();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].reason, ErrorReason::ReadUnmapped);
        assert_eq!(errored[0].state.solver().evaluate_unique(&x), Some(1));
        assert!(state.errored().is_empty());
    }
}
