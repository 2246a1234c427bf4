use super::*;

#[test]
fn empty_snapshot_has_unit_ratio() {
    let s = CacheCounters::default().snapshot();
    assert_eq!(s.compression_ratio, 1.0);
    assert_eq!(s.blocks_created, 0);
}

#[test]
fn ratio_is_stored_over_raw() {
    let c = CacheCounters::default();
    c.kept(1000, 250);
    CacheCounters::bump(&c.uniform_blocks, 1);
    let s = c.snapshot();
    assert_eq!((s.raw_bytes, s.stored_bytes, s.uniform_blocks), (1000, 250, 1));
    assert!((s.compression_ratio - 0.25).abs() < 1e-9);

    let json = serde_json::to_value(&s).unwrap();
    assert_eq!(json["uniform_blocks"], 1);
}
