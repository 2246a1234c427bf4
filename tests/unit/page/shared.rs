use super::*;
use crate::backdrop::layer::{GroupAttrs, LayerSpec};
use crate::foundation::core::DeviceBox;
use crate::page::system::BackdropSystem;
use crate::resource::pool::ResourceClass;

const CMYK: [i32; 4] = [0, 1, 2, 3];

fn page() -> (BackdropSystem, SharedPageState, LayerId) {
    let system = BackdropSystem::boot(BackdropOpts::default(), MemoryArena::unbounded()).unwrap();
    let mut page = system.create_shared(256, 128, 64, 2, true).unwrap();
    page.provision_resources(4, false, 1).unwrap();
    let base = page
        .new_backdrop_layer(LayerSpec::new(
            0,
            GroupAttrs {
                composite_to_page: true,
                ..GroupAttrs::new(DeviceBox::from_size(256, 128))
            },
            &CMYK,
            &CMYK,
        ))
        .unwrap();
    page.provision_resources(0, false, 1).unwrap();
    (system, page, base)
}

/// Composite row 0 with a gradient so every block is stored rather than made uniform.
fn store_row(page: &SharedPageState, base: LayerId) {
    let row = DeviceBox::from_size(256, 64);
    let mut ctx = page.new_context(base).unwrap();
    page.request_regions(&mut ctx, 1, row).unwrap();
    page.region_init(&mut ctx, base, row).unwrap();
    for y in 0..64 {
        page.write_span(&mut ctx, base, y, 0, 255, &[y as u16 * 257; 4]).unwrap();
    }
    page.region_complete(&mut ctx, base, row).unwrap();
    assert!(page.region_release_all(&mut ctx, row, true).unwrap());
}

#[test]
fn block_status_checks_the_page() {
    let (_sys, page, base) = page();
    assert_eq!(page.block_status(base, 0, 0).unwrap(), BlockStatus::Absent);
    assert_eq!(page.block_status(base, 3, 1).unwrap(), BlockStatus::Absent);
    assert!(page.block_status(base, 4, 0).is_err());
    assert!(page.block_status(base, 0, 2).is_err());
}

#[test]
fn stats_count_layers() {
    let (_sys, mut page, base) = page();
    page.new_backdrop_layer(LayerSpec::new(
        1,
        GroupAttrs::new(DeviceBox::from_size(64, 64)),
        &CMYK,
        &CMYK,
    ))
    .unwrap();
    let stats = page.stats();
    assert_eq!((stats.layers, stats.page_backdrops), (2, 1));
    assert_eq!(stats.blocks_created, 0);
    assert_eq!(stats.compression_ratio, 1.0);
    assert!(stats.peak_state_bytes > 0);
    assert!(format!("{page:?}").contains("layers: 2"));
    assert_eq!(page.layer(base).unwrap().id(), base);
}

#[test]
fn stored_blocks_are_listed_as_purgeable() {
    let (_sys, mut page, base) = page();
    page.prepare(Retention::Band, false).unwrap();
    store_row(&page, base);
    assert_eq!(page.purgeable_blocks(), 4);
    assert_eq!(page.dangling_purgeable(), 0);

    let layer = page.layer(base).unwrap();
    let gone = layer.blocks.slot(layer.slot_index(2, 0)).unwrap().lock().take();
    assert!(gone.is_some());
    assert_eq!(page.dangling_purgeable(), 1);
}

#[test]
fn destroy_reports_and_releases() {
    let (_sys, mut page, base) = page();
    page.prepare(Retention::Page, false).unwrap();
    store_row(&page, base);
    let resources = Arc::clone(page.resources());
    let arena = Arc::clone(page.arena());
    assert_eq!(resources.fixed_count(ResourceClass::BlockStorage), 0);

    let stats = page.destroy().unwrap();
    assert_eq!(stats.layers, 1);
    assert_eq!((stats.blocks_created, stats.stored_blocks), (4, 4));
    assert_eq!(stats.raw_bytes, stats.stored_bytes);
    assert_eq!(resources.fixed_count(ResourceClass::BlockStorage), 0);
    assert_eq!(resources.retained_count(ResourceClass::BlockStorage), 0);
    // only the shared pool's free entries are still charged
    let pooled = resources.live_count(ResourceClass::BlockStorage)
        * resources.entry_size(ResourceClass::BlockStorage)
        + resources.live_count(ResourceClass::CompositeContext)
            * resources.entry_size(ResourceClass::CompositeContext);
    assert_eq!(arena.used(), pooled);
}
