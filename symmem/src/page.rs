use crate::byte_store::ByteStore;
use crate::expr::Expr;
use std::sync::Arc;
use tracing::trace;

/// Preloaded bytes for a page, written starting at `offset` on first touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitData {
    pub bytes: Vec<u8>,
    pub offset: u64,
}

impl InitData {
    pub fn new(bytes: impl Into<Vec<u8>>, offset: u64) -> Self {
        Self {
            bytes: bytes.into(),
            offset,
        }
    }
}

/// One page-aligned unit of the address space.
///
/// The byte store sits behind an `Arc` so forked memories can share it. A page
/// flagged `cow_pending` never writes to a store another page still holds: its
/// next store moves the write into a freshly copied page, which the caller must
/// put back into its page table.
#[derive(Debug, Clone)]
pub struct Page<S: ByteStore> {
    base_address: u64,
    size: u64,
    offset_bits: u32,
    pending_init: Option<InitData>,
    cow_pending: bool,
    store: Arc<S>,
}

impl<S: ByteStore> Page<S> {
    pub fn new(base_address: u64, size: u64, offset_bits: u32, init: Option<InitData>) -> Self {
        assert_eq!(1u64 << offset_bits, size, "page size must be 2^offset_bits");
        assert_eq!(
            base_address & (size - 1),
            0,
            "page base must be aligned: {:#x}",
            base_address
        );
        Self {
            base_address,
            size,
            offset_bits,
            pending_init: init,
            cow_pending: false,
            store: Arc::new(S::new(offset_bits)),
        }
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset_bits(&self) -> u32 {
        self.offset_bits
    }

    pub fn is_cow_pending(&self) -> bool {
        self.cow_pending
    }

    pub fn has_pending_init(&self) -> bool {
        self.pending_init.is_some()
    }

    /// Whether both pages still read from the same byte store.
    pub fn shares_store_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }

    pub fn byte_store(&self) -> &S {
        &self.store
    }

    /// Materialize the pending init bytes, once.
    pub fn lazy_init(&mut self) {
        let Some(init) = self.pending_init.take() else {
            return;
        };
        assert!(
            init.offset + init.bytes.len() as u64 <= self.size,
            "init data overflows page {:#x}: offset {:#x}, {} bytes",
            self.base_address,
            init.offset,
            init.bytes.len()
        );
        trace!(
            "materializing {} init bytes into page {:#x}",
            init.bytes.len(),
            self.base_address
        );

        // Pages are only shared after their init data is materialized.
        let store = Arc::make_mut(&mut self.store);
        for (i, &byte) in init.bytes.iter().enumerate() {
            let index = Expr::constant((init.offset + i as u64) as u128, self.offset_bits);
            store.store(&index, Expr::constant(byte as u128, 8), None);
        }
    }

    /// Give this page a byte store of its own if it still shares one. A page
    /// whose other owners are already gone takes the store over as is.
    fn into_owned(mut self) -> Self {
        if !self.cow_pending {
            return self;
        }
        self.cow_pending = false;
        if Arc::get_mut(&mut self.store).is_none() {
            trace!("splitting shared page {:#x}", self.base_address);
            self.store = Arc::new(S::clone(&self.store));
        }
        self
    }

    /// Write one byte. Returns the page that now owns the write, which differs
    /// from `self` when a shared page had to be split.
    #[must_use = "the returned page replaces this one in the page table"]
    pub fn store(mut self, index: &Expr, value: Expr, condition: Option<&Expr>) -> Self {
        self.lazy_init();
        let mut page = self.into_owned();
        let index = index.simplify();
        Arc::make_mut(&mut page.store).store(&index, value, condition);
        page
    }

    /// Join `other`'s content in under `condition`. Like [`store`](Self::store),
    /// returns the page that owns the result.
    #[must_use = "the returned page replaces this one in the page table"]
    pub fn merge(mut self, other: &mut Self, condition: &Expr) -> Self {
        assert_eq!(self.base_address, other.base_address, "merging different pages");
        self.lazy_init();
        other.lazy_init();
        let mut page = self.into_owned();
        Arc::make_mut(&mut page.store).merge(&other.store, condition);
        page
    }

    pub fn load(&mut self, index: &Expr) -> Expr {
        self.lazy_init();
        self.store.load(index)
    }

    /// Share this page with a new owner. Both sides keep reading the same
    /// store until one of them writes.
    pub fn copy(&mut self) -> Self {
        self.lazy_init();
        self.cow_pending = true;
        self.clone()
    }

    pub fn simplify(&mut self) {
        // A shared store is left alone; the owner that splits it simplifies its own copy.
        if !self.cow_pending {
            Arc::make_mut(&mut self.store).simplify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_store::ArrayStore;

    fn index(offset: u128) -> Expr {
        Expr::constant(offset, 12)
    }

    fn byte(value: u128) -> Expr {
        Expr::constant(value, 8)
    }

    #[test]
    fn test_lazy_init_materializes_on_first_load() {
        let init = InitData::new(vec![0xde, 0xad, 0xbe, 0xef], 0x10);
        let mut page = Page::<ArrayStore>::new(0x1000, 0x1000, 12, Some(init));
        assert!(page.has_pending_init());
        assert_eq!(page.byte_store().concrete_len(), 0);

        assert_eq!(page.load(&index(0x11)).as_const(), Some(0xad));
        assert!(!page.has_pending_init());
        assert_eq!(page.load(&index(0x0f)).as_const(), Some(0));
    }

    #[test]
    fn test_lazy_init_is_idempotent() {
        let init = InitData::new(vec![1, 2, 3], 0);
        let mut page = Page::<ArrayStore>::new(0x2000, 0x1000, 12, Some(init));
        page.lazy_init();
        let mut page = page.store(&index(1), byte(0x99), None);
        // A second init must not overwrite the later store.
        page.lazy_init();
        assert_eq!(page.load(&index(0)).as_const(), Some(1));
        assert_eq!(page.load(&index(1)).as_const(), Some(0x99));
        assert_eq!(page.load(&index(2)).as_const(), Some(3));
    }

    #[test]
    #[should_panic(expected = "init data overflows page")]
    fn test_lazy_init_overflow_panics() {
        let init = InitData::new(vec![0u8; 8], 0xffc);
        let mut page = Page::<ArrayStore>::new(0x3000, 0x1000, 12, Some(init));
        page.lazy_init();
    }

    #[test]
    fn test_copy_shares_until_write() {
        let mut original = Page::<ArrayStore>::new(0x1000, 0x1000, 12, None);
        original = original.store(&index(0), byte(0x11), None);

        let mut copy = original.copy();
        assert!(original.is_cow_pending());
        assert!(copy.is_cow_pending());
        assert!(original.shares_store_with(&copy));

        copy = copy.store(&index(0), byte(0x22), None);
        assert!(!copy.is_cow_pending());
        assert!(!original.shares_store_with(&copy));
        assert_eq!(original.load(&index(0)).as_const(), Some(0x11));
        assert_eq!(copy.load(&index(0)).as_const(), Some(0x22));
    }

    #[test]
    fn test_sole_owner_reclaims_store_without_copy() {
        let mut original = Page::<ArrayStore>::new(0x1000, 0x1000, 12, None);
        original = original.store(&index(0), byte(0x11), None);
        let copy = original.copy();
        let shared: *const ArrayStore = original.byte_store();
        drop(copy);

        // Still flagged, but nobody else holds the store any more.
        assert!(original.is_cow_pending());
        original = original.store(&index(1), byte(0x22), None);
        assert!(!original.is_cow_pending());
        assert!(std::ptr::eq(original.byte_store(), shared));
        assert_eq!(original.load(&index(0)).as_const(), Some(0x11));
        assert_eq!(original.load(&index(1)).as_const(), Some(0x22));
    }

    #[test]
    fn test_survivor_of_split_keeps_store() {
        let mut original = Page::<ArrayStore>::new(0x1000, 0x1000, 12, None);
        original = original.store(&index(0), byte(0x11), None);
        let copy = original.copy();
        let shared: *const ArrayStore = original.byte_store();

        // The copy splits off; the original is left as the only owner.
        let mut copy = copy.store(&index(0), byte(0x33), None);
        assert!(!std::ptr::eq(copy.byte_store(), shared));
        original = original.store(&index(0), byte(0x44), None);
        assert!(std::ptr::eq(original.byte_store(), shared));
        assert_eq!(copy.load(&index(0)).as_const(), Some(0x33));
        assert_eq!(original.load(&index(0)).as_const(), Some(0x44));
    }

    #[test]
    fn test_copy_materializes_init_before_sharing() {
        let init = InitData::new(vec![0x55], 0);
        let mut original = Page::<ArrayStore>::new(0x1000, 0x1000, 12, Some(init));
        let mut copy = original.copy();
        assert!(!original.has_pending_init());
        assert!(!copy.has_pending_init());
        assert_eq!(copy.load(&index(0)).as_const(), Some(0x55));
        assert_eq!(original.load(&index(0)).as_const(), Some(0x55));
    }

    #[test]
    fn test_simplify_skips_shared_store() {
        let mut page = Page::<ArrayStore>::new(0x1000, 0x1000, 12, None);
        page = page.store(&Expr::symbol("i", 12), byte(1), None);
        let copy = page.copy();
        page.simplify();
        assert!(page.shares_store_with(&copy));
    }

    #[test]
    fn test_merge_splits_shared_page() {
        let mut ours = Page::<ArrayStore>::new(0x1000, 0x1000, 12, None);
        ours = ours.store(&index(0), byte(0x01), None);
        let mut theirs = ours.copy();
        theirs = theirs.store(&index(0), byte(0x02), None);

        let mut sibling = ours.copy();
        let c = Expr::symbol("c", 1);
        ours = ours.merge(&mut theirs, &c);
        assert!(!ours.shares_store_with(&sibling));
        assert_eq!(sibling.load(&index(0)).as_const(), Some(0x01));

        let merged = ours.load(&index(0));
        assert_eq!(merged, Expr::ite(c, byte(0x02), byte(0x01)));
    }
}
