use super::*;

#[test]
fn display_prefixes_are_stable() {
    assert!(
        BackdropError::validation("x")
            .to_string()
            .contains("validation error:")
    );
    assert!(
        BackdropError::allocation("x")
            .to_string()
            .contains("allocation error:")
    );
    let io = BackdropError::from(std::io::Error::other("disk full"));
    assert!(io.to_string().contains("disk spill error:"));
}

#[test]
fn spill_failures_count_as_allocation_class() {
    assert!(BackdropError::allocation("x").is_allocation_class());
    assert!(BackdropError::from(std::io::Error::other("eio")).is_allocation_class());
    assert!(!BackdropError::validation("x").is_allocation_class());
}

#[test]
fn other_preserves_source() {
    let base = std::io::Error::other("boom");
    let err = BackdropError::Other(anyhow::Error::new(base));
    assert!(err.to_string().contains("boom"));
    assert!(!err.is_allocation_class());
}
