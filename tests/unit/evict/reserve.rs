use super::*;

#[test]
fn reserve_is_charged_then_returned() {
    let arena = MemoryArena::new(Some(10_000));
    let r = BackdropReserve::force(&arena, 2500, 1000, true);
    assert!(r.is_satisfied());
    assert_eq!(r.reserved(), 2500);
    assert_eq!(arena.used(), 2500);
    r.free();
    assert_eq!(arena.used(), 0);
    assert_eq!(arena.peak(), 2500);
}

#[test]
fn shortfall_is_not_an_error() {
    let arena = MemoryArena::new(Some(2500));
    let r = BackdropReserve::force(&arena, 10_000, 1000, false);
    assert!(!r.is_satisfied());
    assert_eq!(r.reserved(), 2000);
}

#[test]
fn empty_request_reserves_nothing() {
    let arena = MemoryArena::unbounded();
    let r = BackdropReserve::force(&arena, 0, 1000, true);
    assert!(r.is_satisfied());
    assert_eq!(r.reserved(), 0);
}
