use symmem::{Endian, Expr, InitData, MemoryConfig, SymbolicState};

fn create_state() -> SymbolicState {
    let mut state = SymbolicState::new(MemoryConfig::default()).unwrap();
    state.mmap(0x1000, 0x4000, None).unwrap();
    state
}

fn write_u32(state: &mut SymbolicState, address: u64, value: u128) {
    let address = state.memory.address(address);
    state
        .store(&address, &Expr::constant(value, 32), Endian::Little)
        .unwrap();
}

fn read_u32(state: &mut SymbolicState, address: u64) -> Option<u128> {
    let address = state.memory.address(address);
    state.load(&address, 32, Endian::Little).unwrap().as_const()
}

#[test]
fn test_fork_isolates_writes() {
    let mut parent = create_state();
    write_u32(&mut parent, 0x1000, 0x11111111);

    let mut child = parent.fork();
    write_u32(&mut child, 0x1000, 0x22222222);
    write_u32(&mut parent, 0x2000, 0x33333333);

    assert_eq!(read_u32(&mut parent, 0x1000), Some(0x11111111));
    assert_eq!(read_u32(&mut child, 0x1000), Some(0x22222222));
    assert_eq!(read_u32(&mut parent, 0x2000), Some(0x33333333));
    assert_eq!(read_u32(&mut child, 0x2000), Some(0));
}

#[test]
fn test_untouched_pages_stay_shared() {
    let mut parent = create_state();
    let mut child = parent.fork();
    write_u32(&mut child, 0x3000, 1);

    for base in [0x1000, 0x2000, 0x4000] {
        let ours = parent.memory.page(base).unwrap();
        let theirs = child.memory.page(base).unwrap();
        assert!(ours.shares_store_with(theirs), "page {:#x}", base);
    }
    assert!(
        !parent
            .memory
            .page(0x3000)
            .unwrap()
            .shares_store_with(child.memory.page(0x3000).unwrap())
    );
}

#[test]
fn test_write_through_shared_page_splits_once() {
    let mut parent = create_state();
    let mut child = parent.fork();

    // The first write splits the page, later ones write in place.
    write_u32(&mut child, 0x1000, 0xaaaa);
    assert!(!child.memory.page(0x1000).unwrap().is_cow_pending());
    write_u32(&mut child, 0x1004, 0xbbbb);

    assert_eq!(read_u32(&mut child, 0x1000), Some(0xaaaa));
    assert_eq!(read_u32(&mut child, 0x1004), Some(0xbbbb));
    assert_eq!(read_u32(&mut parent, 0x1004), Some(0));
}

#[test]
fn test_fork_of_fork() {
    let mut first = create_state();
    write_u32(&mut first, 0x1000, 1);
    let mut second = first.fork();
    let mut third = second.fork();

    write_u32(&mut second, 0x1000, 2);
    write_u32(&mut third, 0x1000, 3);

    assert_eq!(read_u32(&mut first, 0x1000), Some(1));
    assert_eq!(read_u32(&mut second, 0x1000), Some(2));
    assert_eq!(read_u32(&mut third, 0x1000), Some(3));
}

#[test]
fn test_fork_before_lazy_init() {
    let mut parent: SymbolicState = SymbolicState::new(MemoryConfig::default()).unwrap();
    parent
        .mmap(0x1000, 0x1000, Some(InitData::new(vec![0x78, 0x56, 0x34, 0x12], 0)))
        .unwrap();
    assert!(parent.memory.page(0x1000).unwrap().has_pending_init());

    // Init data is materialized once and shared by both sides.
    let mut child = parent.fork();
    assert!(!parent.memory.page(0x1000).unwrap().has_pending_init());
    assert!(!child.memory.page(0x1000).unwrap().has_pending_init());

    write_u32(&mut child, 0x1002, 0xffff);
    assert_eq!(read_u32(&mut parent, 0x1000), Some(0x12345678));
    assert_eq!(read_u32(&mut child, 0x1000), Some(0xffff5678));
}

#[test]
fn test_lazy_init_runs_once() {
    let mut state: SymbolicState = SymbolicState::new(MemoryConfig::default()).unwrap();
    state
        .mmap(0x1000, 0x1000, Some(InitData::new(vec![0xaa; 4], 0x10)))
        .unwrap();

    assert_eq!(read_u32(&mut state, 0x1010), Some(0xaaaaaaaa));
    write_u32(&mut state, 0x1010, 0x01020304);
    // Later accesses must not replay the init bytes over the write.
    assert_eq!(read_u32(&mut state, 0x1010), Some(0x01020304));
    let _ = state.fork();
    assert_eq!(read_u32(&mut state, 0x1010), Some(0x01020304));
}

#[test]
fn test_errored_sibling_memory_is_independent() {
    let mut state = create_state();
    let x = Expr::symbol("x", 64);
    state.add_constraints(Expr::or(
        Expr::eq(x.clone(), Expr::constant(0x1000, 64)),
        Expr::eq(x.clone(), Expr::constant(0x9000, 64)),
    ));
    state.load(&x, 8, Endian::Little).unwrap();

    let mut errored = state.take_errored();
    assert_eq!(errored.len(), 1);
    let sibling = &mut errored[0].state;

    write_u32(sibling, 0x2000, 0xcafe);
    assert_eq!(read_u32(sibling, 0x2000), Some(0xcafe));
    assert_eq!(read_u32(&mut state, 0x2000), Some(0));
}
