use super::*;
use crate::backdrop::layer::{GroupAttrs, LayerSpec};
use crate::foundation::core::DeviceBox;
use crate::foundation::memory::MemoryArena;
use crate::foundation::opts::BackdropOpts;
use crate::page::system::BackdropSystem;

const CMYK: [i32; 4] = [0, 1, 2, 3];

fn page(resource_limit: usize) -> (BackdropSystem, SharedPageState) {
    let opts = BackdropOpts {
        resource_limit,
        ..BackdropOpts::default()
    };
    let system = BackdropSystem::boot(opts, MemoryArena::unbounded()).unwrap();
    // 8 x 8 blocks of 64 x 64, one block row per region, 4 regions per band
    let page = system.create_shared(512, 512, 64, 4, true).unwrap();
    (system, page)
}

#[test]
fn not_ready_until_provisioned() {
    let (_sys, mut page) = page(256);
    assert!(!page.provisioning().is_ready());
    assert!(page.provision_resources(4, false, 0).is_err());
    assert!(!page.provisioning().is_ready());

    page.provision_resources(4, false, 1).unwrap();
    let p = page.provisioning();
    assert!(p.is_ready() && !p.finalized);
    assert_eq!((p.n_min, p.n_max), (1, 32));
    assert_eq!(p.table_size, 64 * 64 * 2 * 6);
}

#[test]
fn estimates_only_grow() {
    let (_sys, mut page) = page(256);
    page.provision_resources(4, true, 2).unwrap();
    let first = *page.provisioning();
    let resizes = page.resources().resize_count(ResourceClass::BlockStorage);

    page.provision_resources(1, false, 1).unwrap();
    assert_eq!(*page.provisioning(), first);
    assert_eq!(page.resources().resize_count(ResourceClass::BlockStorage), resizes);
    assert!(page.provisioning().nonisolated);

    page.provision_resources(6, false, 3).unwrap();
    let p = page.provisioning();
    assert_eq!(p.in_comps_max, 6);
    assert_eq!((p.n_min, p.n_max), (3, 96));
    assert_eq!(page.resources().resize_count(ResourceClass::BlockStorage), resizes + 1);
    assert_eq!(page.resources().entry_size(ResourceClass::BlockStorage), p.table_size);
}

#[test]
fn repeated_identical_calls_do_not_resize() {
    let (_sys, mut page) = page(256);
    page.provision_resources(4, false, 2).unwrap();
    let blocks = page.resources().resize_count(ResourceClass::BlockStorage);
    let contexts = page.resources().resize_count(ResourceClass::CompositeContext);
    for _ in 0..3 {
        page.provision_resources(4, false, 2).unwrap();
    }
    assert_eq!(page.resources().resize_count(ResourceClass::BlockStorage), blocks);
    assert_eq!(page.resources().resize_count(ResourceClass::CompositeContext), contexts);
}

#[test]
fn limit_caps_max_but_never_below_min() {
    let (_sys, mut page) = page(10);
    page.provision_resources(4, false, 2).unwrap();
    let p = page.provisioning();
    assert_eq!((p.n_min, p.n_max), (2, 10));
    assert_eq!(page.resources().bounds(ResourceClass::BlockStorage), (2, 10));

    let (_sys, mut page) = self::page(1);
    page.provision_resources(4, false, 2).unwrap();
    let p = page.provisioning();
    assert_eq!((p.n_min, p.n_max), (2, 64));
    assert!(p.n_min <= p.n_max);
}

#[test]
fn finalizing_uses_real_layers() {
    let (_sys, mut page) = page(256);
    page.provision_resources(8, true, 3).unwrap();
    let estimate = *page.provisioning();

    let group = GroupAttrs {
        composite_to_page: true,
        ..GroupAttrs::new(DeviceBox::from_size(512, 512))
    };
    page.new_backdrop_layer(LayerSpec::new(0, group, &CMYK, &CMYK))
        .unwrap();
    page.provision_resources(0, false, 1).unwrap();

    let p = page.provisioning();
    assert!(p.finalized);
    assert_eq!(p.in_comps_max, 4);
    assert!(!p.nonisolated);
    assert_eq!(p.table_size, 64 * 64 * 4);
    assert!(p.table_size <= estimate.table_size);
    assert_eq!((p.n_min, p.n_max), (1, 32));
    assert_eq!(page.resources().bounds(ResourceClass::BlockStorage), (1, 32));
    assert_eq!(page.resources().entry_size(ResourceClass::BlockStorage), p.table_size);
    assert_eq!(
        page.resources().bounds(ResourceClass::CompositeContext),
        (0, page.opts().max_workers)
    );
}
