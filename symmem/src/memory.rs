use crate::byte_store::{ArrayStore, ByteStore};
use crate::config::{AddressPolicy, MemoryConfig};
use crate::context::{ErrorReason, ExecutionContext};
use crate::error::{MemoryError, Result};
use crate::expr::{Expr, MAX_WIDTH, mask};
use crate::page::{InitData, Page};
use crate::solver::Solver;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Slots this close to the top of the address space are never handed out.
const RESERVED_TOP_PAGES: u64 = 4;

/// Lowest slot the unmapped search considers, keeping the null page free.
const FIRST_SEARCH_PAGE: u64 = 2;

fn assert_valid_region(addr: u64, size: u64, page_size: u64, operation: &str) {
    assert_eq!(
        addr & (page_size - 1),
        0,
        "{}() addr must be page-aligned: {:#x}",
        operation,
        addr
    );
    assert!(size > 0, "{}() size must > 0: {:#x}", operation, addr);
    assert_eq!(
        size & (page_size - 1),
        0,
        "{}() size must be page-aligned: {:#x}",
        operation,
        size
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// Sparse, paged address space of one execution state.
///
/// Pages live in a table keyed by their page-aligned base address. Iteration
/// is in ascending address order, which fixes the nesting of the conditional
/// values a symbolic load builds.
#[derive(Debug)]
pub struct Memory<S: ByteStore = ArrayStore> {
    config: MemoryConfig,
    offset_bits: u32,
    pages: BTreeMap<u64, Page<S>>,
}

impl<S: ByteStore> Memory<S> {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            offset_bits: config.offset_bits(),
            config,
            pages: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn page_size(&self) -> u64 {
        self.config.page_size
    }

    pub fn address_bits(&self) -> u32 {
        self.config.address_bits
    }

    pub fn offset_bits(&self) -> u32 {
        self.offset_bits
    }

    /// Constant of the address width.
    pub fn address(&self, value: u64) -> Expr {
        Expr::constant(value as u128, self.address_bits())
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page<S>> {
        self.pages.values()
    }

    pub fn page_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.keys().copied()
    }

    pub fn page(&self, address: u64) -> Option<&Page<S>> {
        self.pages.get(&(address & !(self.page_size() - 1)))
    }

    pub fn is_mapped(&self, address: u64) -> bool {
        self.page(address).is_some()
    }

    fn slot_mapped(&self, slot: u64) -> bool {
        self.pages.contains_key(&(slot << self.offset_bits))
    }

    fn page_number_width(&self) -> u32 {
        self.address_bits() - self.offset_bits
    }

    fn page_number(&self, key: u64) -> Expr {
        Expr::constant((key >> self.offset_bits) as u128, self.page_number_width())
    }

    /// Split an address into its page number and in-page offset.
    fn split(&self, address: &Expr) -> (Expr, Expr) {
        let bits = self.address_bits();
        (
            Expr::extract(bits - 1, self.offset_bits, address.clone()).simplify(),
            Expr::extract(self.offset_bits - 1, 0, address.clone()).simplify(),
        )
    }

    fn check_address(&self, address: &Expr) -> Result<()> {
        if address.width() != self.address_bits() {
            return Err(MemoryError::AddressWidth {
                expected: self.address_bits(),
                actual: address.width(),
            });
        }
        Ok(())
    }

    fn check_width(bits: u32) -> Result<u64> {
        if bits == 0 || bits % 8 != 0 || bits > MAX_WIDTH {
            return Err(MemoryError::InvalidWidth(bits));
        }
        Ok((bits / 8) as u64)
    }

    /// Map `[address, address + size)`. Slots that are already mapped keep
    /// their content. `init` bytes start at `init.offset` within the first
    /// page and continue across the following pages.
    ///
    /// **IMPORTANT: `address` and `size` must be aligned to page boundaries.**
    pub fn mmap(&mut self, address: u64, size: u64, init: Option<InitData>) -> Result<()> {
        let page_size = self.page_size();
        assert_valid_region(address, size, page_size, "mmap");

        if let Some(init) = &init {
            if init.offset >= page_size {
                return Err(MemoryError::InitOverflow {
                    offset: init.offset,
                    len: init.bytes.len(),
                });
            }
        }

        let first = address >> self.offset_bits;
        let count = size >> self.offset_bits;
        let mut consumed = 0usize;

        for (i, slot) in (first..first + count).enumerate() {
            let key = slot << self.offset_bits;
            let page_init = init.as_ref().and_then(|init| {
                let start = if i == 0 { init.offset } else { 0 };
                let take = (page_size - start) as usize;
                let begin = consumed.min(init.bytes.len());
                let end = (consumed + take).min(init.bytes.len());
                consumed += take;
                (begin < end).then(|| InitData::new(&init.bytes[begin..end], start))
            });

            if self.pages.contains_key(&key) {
                warn!("remapping the same page {:#x}", key);
                continue;
            }
            self.pages.insert(
                key,
                Page::new(key, page_size, self.offset_bits, page_init),
            );
        }

        if let Some(init) = &init {
            if consumed < init.bytes.len() {
                warn!(
                    "mmap({:#x}, {:#x}) dropped {} init bytes past the region",
                    address,
                    size,
                    init.bytes.len() - consumed
                );
            }
        }
        Ok(())
    }

    /// Find unmapped page slots and return a slot number. Multiply by the page
    /// size for a byte address.
    ///
    /// With `from_end` the scan walks down from the top of the address space
    /// and returns the lowest slot of the first run of `size` free slots.
    /// Otherwise it walks up from the bottom and stops at the first free slot,
    /// whatever `size` asks for; callers mapping a run from there keep the
    /// pages already present. `start_from` is a byte address overriding the
    /// scan's starting slot.
    pub fn get_unmapped(&self, size: u64, start_from: Option<u64>, from_end: bool) -> Option<u64> {
        assert!(size > 0, "get_unmapped() size must > 0");
        let start = start_from.map(|address| address >> self.offset_bits);
        let slots = 1u128 << self.page_number_width();
        let last_page = slots.saturating_sub(RESERVED_TOP_PAGES as u128) as u64;
        let first_page = FIRST_SEARCH_PAGE;

        if from_end {
            let mut slot = start.unwrap_or(last_page);
            let mut count = 0;
            while slot >= first_page {
                if !self.slot_mapped(slot) {
                    count += 1;
                    if count == size {
                        return Some(slot);
                    }
                } else {
                    count = 0;
                }
                slot -= 1;
            }
            None
        } else {
            let first = start.unwrap_or(first_page);
            (first..=last_page).find(|&slot| !self.slot_mapped(slot))
        }
    }

    /// Map enough fresh pages near the top of the address space for `size`
    /// bytes and return their base address.
    pub fn allocate(&mut self, size: u64, init: Option<InitData>) -> Result<u64> {
        assert!(size > 0, "allocate() size must > 0");
        let num_pages = size.div_ceil(self.page_size());
        let slot = self
            .get_unmapped(num_pages, None, true)
            .ok_or(MemoryError::OutOfMemory)?;
        let address = slot << self.offset_bits;
        self.mmap(address, num_pages * self.page_size(), init)?;
        debug!("allocated {:#x} bytes at {:#x}", size, address);
        Ok(address)
    }

    /// Fork the address space. Every page is shared copy-on-write; no byte
    /// store is duplicated until one side writes to it.
    pub fn copy(&mut self) -> Self {
        Self {
            config: self.config.clone(),
            offset_bits: self.offset_bits,
            pages: self
                .pages
                .iter_mut()
                .map(|(&key, page)| (key, page.copy()))
                .collect(),
        }
    }

    /// Join `other` in under `condition`: where it holds, every byte reads as
    /// in `other`. Pages only `other` maps are mapped here first. Pages both
    /// sides still share are already equal and stay untouched.
    pub fn merge(&mut self, other: &mut Self, condition: &Expr) {
        assert_eq!(
            self.page_size(),
            other.page_size(),
            "merge() page size mismatch"
        );
        assert_eq!(condition.width(), 1, "merge() condition must be boolean");

        let mut merged = 0;
        for (&key, theirs) in other.pages.iter_mut() {
            let ours = match self.pages.remove(&key) {
                Some(ours) if ours.shares_store_with(theirs) => {
                    self.pages.insert(key, ours);
                    continue;
                }
                Some(ours) => ours,
                None => Page::new(key, self.page_size(), self.offset_bits, None),
            };
            self.pages.insert(key, ours.merge(theirs, condition));
            merged += 1;
        }
        debug!("merged {} pages under {}", merged, condition);
    }

    /// Deal with symbolic addresses before per-byte resolution: unique values
    /// become constants, fully unconstrained addresses get a fresh region when
    /// the heuristic is on, the concretize policy pins everything else and the
    /// limit-pages policy narrows wide ranges.
    fn resolve_address<C: ExecutionContext<S>>(
        &mut self,
        ctx: &mut C,
        address: &Expr,
        size: u64,
        operation: &str,
    ) -> Result<Expr> {
        if address.is_const() {
            return Ok(address.clone());
        }
        let bits = self.address_bits();
        if let Some(value) = ctx.solver().evaluate_unique(address) {
            return Ok(Expr::constant(value, bits));
        }

        warn!("memory {}, symbolic memory access: {}", operation, address);

        if self.config.heuristic_unconstrained_access
            && address.heuristic_base().is_none()
            && ctx.solver().is_unconstrained(address)
        {
            let num_pages = size.div_ceil(self.page_size()).max(1);
            let slot = self
                .get_unmapped(num_pages, None, false)
                .ok_or(MemoryError::OutOfMemory)?;
            let base = slot << self.offset_bits;
            warn!(
                "memory {}, concretizing unconstrained access to newly mapped {:#x}",
                operation, base
            );
            self.mmap(base, num_pages * self.page_size(), None)?;
            let pinned = Expr::constant(base as u128, bits);
            ctx.solver()
                .add_constraints(Expr::eq(address.clone(), pinned.clone()));
            return Ok(pinned);
        }

        if self.config.address_policy == AddressPolicy::Concretize {
            let solver = ctx.solver();
            let heuristic = if self.config.use_heuristic_base {
                address.heuristic_base().filter(|&base| {
                    base <= mask(bits)
                        && solver.satisfiable(&[Expr::eq(
                            address.clone(),
                            Expr::constant(base, bits),
                        )])
                })
            } else {
                None
            };
            let value = match heuristic {
                Some(base) => {
                    warn!("memory {}, heuristic address {:#x}", operation, base);
                    base
                }
                None => solver
                    .evaluate(address)
                    .ok_or_else(|| MemoryError::NoFeasiblePage {
                        address: address.to_string(),
                    })?,
            };
            warn!("memory {}, concretizing access to {:#x}", operation, value);
            let pinned = Expr::constant(value, bits);
            solver.add_constraints(Expr::eq(address.clone(), pinned.clone()));
            return Ok(pinned);
        }

        if self.config.address_policy == AddressPolicy::LimitPages {
            self.limit_pages(ctx, address, operation)?;
        }
        Ok(address.clone())
    }

    /// Confine an address whose range spans more than `page_limit` pages to
    /// the `page_limit` pages starting at a pivot: the heuristic base when it
    /// is feasible and leaves a full window in range, else the lowest mapped
    /// page in range, else a freshly mapped region. Nothing checks that the
    /// window itself is feasible.
    fn limit_pages<C: ExecutionContext<S>>(
        &mut self,
        ctx: &mut C,
        address: &Expr,
        operation: &str,
    ) -> Result<()> {
        let limit = self.config.page_limit;
        let infeasible = || MemoryError::NoFeasiblePage {
            address: address.to_string(),
        };
        let solver = ctx.solver();
        let min = solver.min(address).ok_or_else(infeasible)?;
        let max = solver.max(address).ok_or_else(infeasible)?;
        if max - min <= limit as u128 * self.page_size() as u128 {
            return Ok(());
        }
        warn!(
            "memory {}, limiting access to {} pages (range {:#x}..={:#x})",
            operation, limit, min, max
        );

        let min_page = (min >> self.offset_bits) as u64;
        let max_page = (max >> self.offset_bits) as u64;
        let bits = self.address_bits();
        let heuristic = if self.config.use_heuristic_base {
            address.heuristic_base().filter(|&base| {
                let page = (base >> self.offset_bits) as u64;
                base <= mask(bits)
                    && page >= min_page
                    && page.saturating_add(limit) <= max_page
                    && solver.satisfiable(&[Expr::eq(address.clone(), Expr::constant(base, bits))])
            })
        } else {
            None
        };

        let pivot = match heuristic {
            Some(base) => {
                warn!("memory {}, heuristic address {:#x}", operation, base);
                (base >> self.offset_bits) as u64
            }
            None => {
                let in_range = self
                    .pages
                    .range(min_page << self.offset_bits..=max_page << self.offset_bits)
                    .next()
                    .map(|(&key, _)| key >> self.offset_bits);
                match in_range {
                    Some(slot) => slot,
                    None => {
                        let slot = self
                            .get_unmapped(limit, None, false)
                            .ok_or(MemoryError::OutOfMemory)?;
                        warn!(
                            "memory {}, mapping {} pages at {:#x} for the window",
                            operation,
                            limit,
                            slot << self.offset_bits
                        );
                        self.mmap(slot << self.offset_bits, limit * self.page_size(), None)?;
                        slot
                    }
                }
            }
        };

        let (page_number, _) = self.split(address);
        let last_slot = mask(self.page_number_width());
        let window: Vec<Expr> = (pivot..pivot.saturating_add(limit))
            .take_while(|&slot| slot as u128 <= last_slot)
            .map(|slot| {
                Expr::eq(
                    page_number.clone(),
                    Expr::constant(slot as u128, self.page_number_width()),
                )
            })
            .collect();
        debug!("memory {}, window of {} pages from slot {:#x}", operation, window.len(), pivot);
        ctx.solver().add_constraints(Expr::or_all(window));
        Ok(())
    }

    /// The single page a page number can denote on this path, if any.
    fn concrete_page<C: ExecutionContext<S>>(&self, ctx: &mut C, page_number: &Expr) -> Option<u64> {
        let slot = match page_number.as_const() {
            Some(slot) => slot,
            None => ctx.solver().evaluate_unique(page_number)?,
        };
        Some((slot as u64) << self.offset_bits)
    }

    fn store_byte(&mut self, key: u64, index: &Expr, value: Expr, condition: Option<&Expr>) -> Result<()> {
        let page = self
            .pages
            .remove(&key)
            .ok_or(MemoryError::UnmappedMemory(key))?;
        self.pages.insert(key, page.store(index, value, condition));
        Ok(())
    }

    fn load_byte(&mut self, key: u64, index: &Expr) -> Result<Expr> {
        let page = self
            .pages
            .get_mut(&key)
            .ok_or(MemoryError::UnmappedMemory(key))?;
        Ok(page.load(index))
    }

    /// Store `value` at `address`, one byte at a time in `endian` order.
    ///
    /// A byte whose page is ambiguous is written conditionally into every mapped
    /// page the path allows, and the path is narrowed to those pages. Unlike
    /// [`load`](Self::load), no errored state is forked for the remainder.
    pub fn store<C: ExecutionContext<S>>(
        &mut self,
        ctx: &mut C,
        address: &Expr,
        value: &Expr,
        endian: Endian,
    ) -> Result<()> {
        self.check_address(address)?;
        let size = Self::check_width(value.width())?;
        let address = self.resolve_address(ctx, address, size, "store")?;
        let bits = self.address_bits();

        let mut touched = BTreeSet::new();
        for i in (0..size).rev() {
            let lo = 8 * i as u32;
            let byte = Expr::extract(lo + 7, lo, value.clone());
            let offset = match endian {
                Endian::Little => i,
                Endian::Big => size - i - 1,
            };
            let target = Expr::add(address.clone(), Expr::constant(offset as u128, bits));
            let (page_number, page_index) = self.split(&target);

            if let Some(key) = self.concrete_page(ctx, &page_number) {
                if !self.pages.contains_key(&key) {
                    return Err(self.report_unmapped(ctx, key, ErrorReason::WriteUnmapped));
                }
                self.store_byte(key, &page_index, byte.simplify(), None)?;
                touched.insert(key);
                continue;
            }

            let keys: Vec<u64> = self.pages.keys().copied().collect();
            let mut conditions = Vec::new();
            for key in keys {
                let condition = Expr::eq(page_number.clone(), self.page_number(key));
                if ctx.solver().satisfiable(std::slice::from_ref(&condition)) {
                    self.store_byte(key, &page_index, byte.simplify(), Some(&condition))?;
                    touched.insert(key);
                    conditions.push(condition);
                }
            }
            if conditions.is_empty() {
                warn!("memory store, no mapped page is consistent with {}", target);
            }
            ctx.solver().add_constraints(Expr::or_all(conditions));
        }

        for key in touched {
            if let Some(page) = self.pages.get_mut(&key) {
                page.simplify();
            }
        }
        Ok(())
    }

    /// Load `bits` bits from `address`, assembling bytes in `endian` order.
    ///
    /// A byte whose page is ambiguous reads as a chain of conditional values
    /// over every mapped page the path allows. The path is then narrowed to
    /// those pages and a sibling state covering the rest is reported to the
    /// context as [`ErrorReason::ReadUnmapped`].
    pub fn load<C: ExecutionContext<S>>(
        &mut self,
        ctx: &mut C,
        address: &Expr,
        bits: u32,
        endian: Endian,
    ) -> Result<Expr> {
        self.check_address(address)?;
        let size = Self::check_width(bits)?;
        let address = self.resolve_address(ctx, address, size, "load")?;
        let address_bits = self.address_bits();

        let order: Vec<u64> = match endian {
            Endian::Little => (0..size).rev().collect(),
            Endian::Big => (0..size).collect(),
        };

        let mut result: Option<Expr> = None;
        let mut mapped_conditions = Vec::new();
        for i in order {
            let target = Expr::add(address.clone(), Expr::constant(i as u128, address_bits));
            let (page_number, page_index) = self.split(&target);

            let byte = match self.concrete_page(ctx, &page_number) {
                Some(key) => {
                    if !self.pages.contains_key(&key) {
                        return Err(self.report_unmapped(ctx, key, ErrorReason::ReadUnmapped));
                    }
                    self.load_byte(key, &page_index)?
                }
                None => {
                    let keys: Vec<u64> = self.pages.keys().copied().collect();
                    let mut conditions = Vec::new();
                    let mut selected: Option<Expr> = None;
                    for key in keys {
                        let condition = Expr::eq(page_number.clone(), self.page_number(key));
                        if ctx.solver().satisfiable(std::slice::from_ref(&condition)) {
                            let loaded = self.load_byte(key, &page_index)?;
                            selected = Some(match selected {
                                Some(previous) => Expr::ite(condition.clone(), loaded, previous),
                                None => loaded,
                            });
                            conditions.push(condition);
                        }
                    }
                    mapped_conditions.push(Expr::or_all(conditions));

                    match selected {
                        Some(byte) => byte,
                        None => {
                            self.fork_unmapped_read(ctx, Expr::and_all(mapped_conditions));
                            return Err(MemoryError::NoFeasiblePage {
                                address: target.to_string(),
                            });
                        }
                    }
                }
            };

            result = Some(match result {
                Some(acc) => Expr::concat(acc, byte),
                None => byte,
            });
        }

        if !mapped_conditions.is_empty() {
            self.fork_unmapped_read(ctx, Expr::and_all(mapped_conditions));
        }

        let result = result.ok_or(MemoryError::InvalidWidth(bits))?.simplify();
        assert_eq!(
            result.width(),
            bits,
            "load() result width mismatch at {}",
            address
        );
        Ok(result)
    }

    /// Hand a copy of the whole state to the context as errored and build the
    /// error for the caller. The current path is left as it is.
    fn report_unmapped<C: ExecutionContext<S>>(
        &mut self,
        ctx: &mut C,
        key: u64,
        reason: ErrorReason,
    ) -> MemoryError {
        debug!("forking errored state ({}) at page {:#x}", reason, key);
        let forked = self.copy();
        ctx.report_errored(forked, Expr::bool(true), reason);
        MemoryError::UnmappedMemory(key)
    }

    /// Report the state where `mapped` fails, then assume `mapped` here.
    fn fork_unmapped_read<C: ExecutionContext<S>>(&mut self, ctx: &mut C, mapped: Expr) {
        let unmapped = Expr::not(mapped.clone());
        let feasible = !self.config.prune_infeasible_errored
            || ctx.solver().satisfiable(std::slice::from_ref(&unmapped));
        if feasible {
            debug!("forking errored state ({}) on {}", ErrorReason::ReadUnmapped, unmapped);
            let forked = self.copy();
            ctx.report_errored(forked, unmapped, ErrorReason::ReadUnmapped);
        }
        ctx.solver().add_constraints(mapped);
    }
}
