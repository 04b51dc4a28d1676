use crate::expr::Expr;
use std::collections::{BTreeMap, BTreeSet};

/// Offset-indexed storage of 8-bit expressions backing a single page.
///
/// Copying a store is `Clone`; pages share stores behind an `Arc` and only
/// clone them when a shared page is written.
pub trait ByteStore: Clone {
    /// Create an empty store addressed by `index_bits`-wide offsets.
    fn new(index_bits: u32) -> Self;

    /// Width of the offsets this store expects.
    fn index_bits(&self) -> u32;

    /// Write `value` at `index`. With a `condition`, the write only takes effect
    /// on paths where the condition holds and the previous byte survives elsewhere.
    fn store(&mut self, index: &Expr, value: Expr, condition: Option<&Expr>);

    fn load(&self, index: &Expr) -> Expr;

    /// Normalize stored expressions to bound their growth.
    fn simplify(&mut self);

    /// Join with `other`: every byte reads as `other`'s where `condition`
    /// holds and keeps its current value elsewhere.
    fn merge(&mut self, other: &Self, condition: &Expr);
}

/// Default [`ByteStore`]: concrete cells plus an ordered log of writes whose
/// offsets are still symbolic. Bytes never written read as zero.
#[derive(Debug, Clone)]
pub struct ArrayStore {
    index_bits: u32,
    cells: BTreeMap<u64, Expr>,
    overlay: Vec<(Expr, Expr)>,
}

impl ArrayStore {
    fn default_byte() -> Expr {
        Expr::constant(0, 8)
    }

    /// Number of bytes held at concrete offsets.
    pub fn concrete_len(&self) -> usize {
        self.cells.len()
    }

    /// Number of pending writes at symbolic offsets.
    pub fn symbolic_len(&self) -> usize {
        self.overlay.len()
    }
}

impl ByteStore for ArrayStore {
    fn new(index_bits: u32) -> Self {
        Self {
            index_bits,
            cells: BTreeMap::new(),
            overlay: Vec::new(),
        }
    }

    fn index_bits(&self) -> u32 {
        self.index_bits
    }

    fn store(&mut self, index: &Expr, value: Expr, condition: Option<&Expr>) {
        assert_eq!(index.width(), self.index_bits, "store index width");
        assert_eq!(value.width(), 8, "byte stores hold 8-bit values");

        let value = match condition {
            Some(condition) => Expr::ite(condition.clone(), value, self.load(index)),
            None => value,
        };

        // Concrete writes may only bypass the log while it is empty, otherwise
        // an older symbolic write would shadow them.
        match index.as_const() {
            Some(offset) if self.overlay.is_empty() => {
                self.cells.insert(offset as u64, value);
            }
            _ => self.overlay.push((index.clone(), value)),
        }
    }

    fn load(&self, index: &Expr) -> Expr {
        assert_eq!(index.width(), self.index_bits, "load index width");

        let base = match index.as_const() {
            Some(offset) => self
                .cells
                .get(&(offset as u64))
                .cloned()
                .unwrap_or_else(Self::default_byte),
            None => self
                .cells
                .iter()
                .fold(Self::default_byte(), |acc, (&offset, value)| {
                    let hit = Expr::eq(
                        index.clone(),
                        Expr::constant(offset as u128, self.index_bits),
                    );
                    Expr::ite(hit, value.clone(), acc)
                }),
        };

        self.overlay.iter().fold(base, |acc, (offset, value)| {
            Expr::ite(Expr::eq(offset.clone(), index.clone()), value.clone(), acc)
        })
    }

    fn simplify(&mut self) {
        for value in self.cells.values_mut() {
            *value = value.simplify();
        }

        let mut overlay = std::mem::take(&mut self.overlay).into_iter().peekable();
        // Leading log entries that became concrete can be folded into the cells.
        while let Some((offset, value)) = overlay.next_if(|(offset, _)| offset.simplify().is_const())
        {
            if let Some(offset) = offset.simplify().as_const() {
                self.cells.insert(offset as u64, value.simplify());
            }
        }
        self.overlay = overlay
            .map(|(offset, value)| (offset.simplify(), value.simplify()))
            .collect();
    }

    fn merge(&mut self, other: &Self, condition: &Expr) {
        assert_eq!(self.index_bits, other.index_bits, "merge index width");

        // With a symbolic log on either side any offset may differ, so every
        // offset of the page gets an explicit cell.
        let offsets: BTreeSet<u64> = if self.overlay.is_empty() && other.overlay.is_empty() {
            self.cells.keys().chain(other.cells.keys()).copied().collect()
        } else {
            (0..1u64 << self.index_bits).collect()
        };

        let cells = offsets
            .into_iter()
            .map(|offset| {
                let index = Expr::constant(offset as u128, self.index_bits);
                let merged = Expr::ite(condition.clone(), other.load(&index), self.load(&index));
                (offset, merged)
            })
            .collect();
        self.cells = cells;
        self.overlay.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Model;

    fn idx(offset: u128) -> Expr {
        Expr::constant(offset, 12)
    }

    #[test]
    fn test_unwritten_bytes_are_zero() {
        let store = ArrayStore::new(12);
        assert_eq!(store.load(&idx(0x123)).as_const(), Some(0));
        assert_eq!(store.load(&Expr::symbol("i", 12)).as_const(), Some(0));
    }

    #[test]
    fn test_concrete_store_load() {
        let mut store = ArrayStore::new(12);
        store.store(&idx(4), Expr::constant(0x41, 8), None);
        store.store(&idx(4), Expr::constant(0x42, 8), None);
        assert_eq!(store.load(&idx(4)).as_const(), Some(0x42));
        assert_eq!(store.concrete_len(), 1);
    }

    #[test]
    fn test_symbolic_offset_write_shadows_older_cells() {
        let mut store = ArrayStore::new(12);
        store.store(&idx(8), Expr::constant(0x11, 8), None);

        let i = Expr::symbol("i", 12);
        store.store(&i, Expr::constant(0x22, 8), None);
        // A later concrete write must land after the symbolic one.
        store.store(&idx(9), Expr::constant(0x33, 8), None);
        assert_eq!(store.symbolic_len(), 2);

        let loaded = store.load(&idx(8));
        let mut model = Model::new();
        model.insert("i".into(), 8);
        assert_eq!(loaded.eval(&model), 0x22);
        model.insert("i".into(), 9);
        assert_eq!(loaded.eval(&model), 0x11);
        assert_eq!(store.load(&idx(9)).eval(&model), 0x33);
    }

    #[test]
    fn test_conditional_store_keeps_previous_byte() {
        let mut store = ArrayStore::new(12);
        store.store(&idx(0), Expr::constant(0xaa, 8), None);
        let c = Expr::symbol("c", 1);
        store.store(&idx(0), Expr::constant(0xbb, 8), Some(&c));

        let loaded = store.load(&idx(0));
        let mut model = Model::new();
        assert_eq!(loaded.eval(&model), 0xaa);
        model.insert("c".into(), 1);
        assert_eq!(loaded.eval(&model), 0xbb);
    }

    #[test]
    fn test_simplify_folds_leading_concrete_log_entries() {
        let mut store = ArrayStore::new(12);
        let i = Expr::symbol("i", 12);
        store.store(&i, Expr::constant(0x01, 8), None);
        store.store(&idx(3), Expr::constant(0x02, 8), None);
        store.simplify();
        // The symbolic head keeps the concrete entry behind it in the log.
        assert_eq!(store.symbolic_len(), 2);
        assert_eq!(store.concrete_len(), 0);

        let mut concrete_only = ArrayStore::new(12);
        concrete_only.overlay.push((
            Expr::add(idx(1), idx(2)),
            Expr::constant(0x7f, 8),
        ));
        concrete_only.simplify();
        assert_eq!(concrete_only.symbolic_len(), 0);
        assert_eq!(concrete_only.load(&idx(3)).as_const(), Some(0x7f));
    }

    #[test]
    fn test_merge_selects_by_condition() {
        let mut ours = ArrayStore::new(12);
        ours.store(&idx(0), Expr::constant(0x10, 8), None);
        ours.store(&idx(1), Expr::constant(0x11, 8), None);
        let mut theirs = ArrayStore::new(12);
        theirs.store(&idx(1), Expr::constant(0x21, 8), None);
        theirs.store(&idx(2), Expr::constant(0x22, 8), None);

        let c = Expr::symbol("c", 1);
        ours.merge(&theirs, &c);
        assert_eq!(ours.concrete_len(), 3);

        let mut model = Model::new();
        assert_eq!(ours.load(&idx(0)).eval(&model), 0x10);
        assert_eq!(ours.load(&idx(1)).eval(&model), 0x11);
        assert_eq!(ours.load(&idx(2)).eval(&model), 0);
        model.insert("c".into(), 1);
        assert_eq!(ours.load(&idx(0)).eval(&model), 0);
        assert_eq!(ours.load(&idx(1)).eval(&model), 0x21);
        assert_eq!(ours.load(&idx(2)).eval(&model), 0x22);
    }

    #[test]
    fn test_merge_materializes_symbolic_log() {
        // Two-bit offsets keep the materialized page small.
        let mut ours = ArrayStore::new(2);
        let i = Expr::symbol("i", 2);
        ours.store(&i, Expr::constant(0x99, 8), None);
        let theirs = ArrayStore::new(2);

        let c = Expr::symbol("c", 1);
        ours.merge(&theirs, &c);
        assert_eq!(ours.symbolic_len(), 0);
        assert_eq!(ours.concrete_len(), 4);

        let mut model = Model::new();
        model.insert("i".into(), 3);
        assert_eq!(ours.load(&Expr::constant(3, 2)).eval(&model), 0x99);
        assert_eq!(ours.load(&Expr::constant(2, 2)).eval(&model), 0);
        model.insert("c".into(), 1);
        assert_eq!(ours.load(&Expr::constant(3, 2)).eval(&model), 0);
    }
}
