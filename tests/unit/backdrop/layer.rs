use super::*;
use crate::backdrop::block::TableType;
use crate::foundation::memory::MemoryArena;
use crate::foundation::opts::BackdropOpts;
use crate::page::system::BackdropSystem;

const CMYK: [ColorantIndex; 4] = [0, 1, 2, 3];

fn page(multi_threaded: bool) -> (BackdropSystem, SharedPageState) {
    let system = BackdropSystem::boot(BackdropOpts::default(), MemoryArena::unbounded()).unwrap();
    let page = system.create_shared(256, 256, 64, 2, multi_threaded).unwrap();
    (system, page)
}

fn dbox(x1: i32, y1: i32, x2: i32, y2: i32) -> DeviceBox {
    DeviceBox::new(x1, y1, x2, y2).unwrap()
}

fn page_group() -> GroupAttrs {
    GroupAttrs {
        composite_to_page: true,
        ..GroupAttrs::new(DeviceBox::from_size(256, 256))
    }
}

struct Gray;

impl ColorConverter for Gray {
    fn convert(&self, input: &[f32], output: &mut [f32]) -> BackdropResult<()> {
        output[0] = 1.0 - input.iter().sum::<f32>().min(1.0);
        Ok(())
    }
}

#[test]
fn page_layer_is_linked_first() {
    let (_sys, mut page) = page(true);
    let base = page
        .new_backdrop_layer(LayerSpec::new(0, page_group(), &CMYK, &CMYK))
        .unwrap();
    let group = page
        .new_backdrop_layer(
            LayerSpec::new(1, GroupAttrs::new(dbox(10, 10, 99, 99)), &CMYK[..3], &CMYK[..3])
                .with_parent(base),
        )
        .unwrap();

    assert_eq!(page.backdrops(), &[group, base]);
    assert_eq!(page.page_backdrops(), &[base]);
    assert_eq!(page.in_comps_max(), 4);

    let l = page.layer(base).unwrap();
    assert!(l.composite_to_page() && l.is_isolated());
    assert_eq!(l.layout().table_type, TableType::Output8);
    assert_eq!(l.table_size(), 64 * 64 * 4);
    assert_eq!(l.initial_color(), Some(&[0u16; 4][..]));

    let g = page.layer(group).unwrap();
    assert_eq!(g.bounds(), dbox(10, 10, 99, 99));
    assert_eq!(g.parent_backdrop(), Some(base));
    assert_eq!(g.parent_remap(), Some(&[0, 1, 2, COLORANT_NONE][..]));
    assert_eq!(page.layer_table_size(), 64 * 64 * 2 * 4);
}

#[test]
fn bounds_are_clipped_to_the_page() {
    let (_sys, mut page) = page(true);
    let id = page
        .new_backdrop_layer(LayerSpec::new(
            0,
            GroupAttrs::new(dbox(-20, 200, 400, 300)),
            &CMYK,
            &CMYK,
        ))
        .unwrap();
    assert_eq!(page.layer(id).unwrap().bounds(), dbox(0, 200, 255, 255));

    let off_page = LayerSpec::new(0, GroupAttrs::new(dbox(300, 0, 400, 10)), &CMYK, &CMYK);
    assert!(page.new_backdrop_layer(off_page).is_err());
}

#[test]
fn non_isolated_layers_need_a_shallower_prefix_backdrop() {
    let (_sys, mut page) = page(true);
    let base = page
        .new_backdrop_layer(LayerSpec::new(0, page_group(), &CMYK, &CMYK))
        .unwrap();
    let group = GroupAttrs::new(DeviceBox::from_size(64, 64));

    let ok = page
        .new_backdrop_layer(LayerSpec::new(1, group.clone(), &CMYK[..2], &CMYK[..2]).with_initial_backdrop(base))
        .unwrap();
    let l = page.layer(ok).unwrap();
    assert!(!l.is_isolated());
    assert_eq!(l.initial_backdrop(), Some(base));
    assert!(l.layout().group_alpha);

    let not_prefix = [1, 2];
    let err = page
        .new_backdrop_layer(LayerSpec::new(1, group.clone(), &not_prefix, &not_prefix).with_initial_backdrop(base))
        .unwrap_err();
    assert!(err.to_string().contains("prefix"));

    let err = page
        .new_backdrop_layer(LayerSpec::new(0, group, &CMYK, &CMYK).with_initial_backdrop(base))
        .unwrap_err();
    assert!(err.to_string().contains("depth"));
}

#[test]
fn freed_layer_ids_go_stale() {
    let (_sys, mut page) = page(true);
    let a = page
        .new_backdrop_layer(LayerSpec::new(0, page_group(), &CMYK, &CMYK))
        .unwrap();
    page.free_backdrop_layer(a).unwrap();
    assert!(page.layer(a).is_err());
    assert!(page.backdrops().is_empty() && page.page_backdrops().is_empty());
    assert!(page.free_backdrop_layer(a).is_err());

    let b = page
        .new_backdrop_layer(LayerSpec::new(0, page_group(), &CMYK, &CMYK))
        .unwrap();
    assert_ne!(a, b);
    assert!(page.layer(b).is_ok());
}

#[test]
fn single_threaded_groups_reuse_a_band_of_rows() {
    let (_sys, mut st) = page(false);
    let group = st
        .new_backdrop_layer(LayerSpec::new(1, GroupAttrs::new(DeviceBox::from_size(256, 256)), &CMYK, &CMYK))
        .unwrap();
    let l = st.layer(group).unwrap();
    assert!(l.reuses_block_rows());
    // 2 regions of one block row per band, 4 columns
    assert_eq!(l.block_slots(), 8);
    assert_eq!(l.slot_index(1, 0), l.slot_index(1, 2));

    let base = st
        .new_backdrop_layer(LayerSpec::new(0, page_group(), &CMYK, &CMYK))
        .unwrap();
    assert!(!st.layer(base).unwrap().reuses_block_rows());
    assert_eq!(st.layer(base).unwrap().block_slots(), 16);

    let (_sys, mut mt) = page(true);
    let group = mt
        .new_backdrop_layer(LayerSpec::new(1, GroupAttrs::new(DeviceBox::from_size(256, 256)), &CMYK, &CMYK))
        .unwrap();
    assert_eq!(mt.layer(group).unwrap().block_slots(), 16);
}

#[test]
fn initial_pixels() {
    let (_sys, mut page) = page(true);
    let base = page
        .new_backdrop_layer(LayerSpec::new(0, page_group(), &CMYK, &CMYK))
        .unwrap();
    page.set_page_color(base, &[1, 2, 3, 4]).unwrap();
    assert_eq!(page.layer(base).unwrap().initial_pixel().unwrap().as_slice(), &[1, 2, 3, 4]);
    assert!(page.set_page_color(base, &[1, 2]).is_err());

    let group = page
        .new_backdrop_layer(
            LayerSpec::new(1, GroupAttrs::new(DeviceBox::from_size(64, 64)), &CMYK[..2], &CMYK[..2])
                .with_initial_backdrop(base),
        )
        .unwrap();
    let g = page.layer(group).unwrap();
    assert_eq!(g.initial_pixel(), None);
    assert_eq!(g.inherited_pixel(&[7, 8, 9, 10], 500).as_slice(), &[7, 8, 500, 0]);
    assert!(page.set_page_color(group, &[0, 0]).is_err());
}

#[test]
fn soft_mask_setup() {
    let (_sys, mut page) = page(true);
    let luminosity = GroupAttrs {
        soft_mask: Some(SoftMaskKind::Luminosity),
        ..GroupAttrs::new(DeviceBox::from_size(64, 64))
    };
    let lum = page
        .new_backdrop_layer(LayerSpec::new(1, luminosity.clone(), &CMYK[..1], &CMYK[..1]).with_converter(Arc::new(Gray)))
        .unwrap();
    let half: &dyn Fn(f32) -> f32 = &|v| v * 0.5;
    page.set_soft_mask(lum, Some(&[0.25][..]), Some(half)).unwrap();
    let l = page.layer(lum).unwrap();
    assert_eq!(l.initial_alpha(), Some(COLOR_ONE));
    assert_eq!(l.initial_color(), Some(&[channel_from_f32(0.25)][..]));
    assert_eq!(l.default_mask_alpha(), channel_from_f32(0.375));

    let no_converter = page
        .new_backdrop_layer(LayerSpec::new(1, luminosity, &CMYK[..1], &CMYK[..1]))
        .unwrap();
    assert!(page.set_soft_mask(no_converter, Some(&[0.5][..]), None).is_err());

    let alpha = GroupAttrs {
        soft_mask: Some(SoftMaskKind::Alpha),
        ..GroupAttrs::new(DeviceBox::from_size(64, 64))
    };
    let a = page
        .new_backdrop_layer(LayerSpec::new(1, alpha, &CMYK, &CMYK))
        .unwrap();
    let full: &dyn Fn(f32) -> f32 = &|_| 1.0;
    page.set_soft_mask(a, None, Some(full)).unwrap();
    assert_eq!(page.layer(a).unwrap().default_mask_alpha(), COLOR_ONE);
    assert_eq!(page.layer(a).unwrap().initial_alpha(), Some(0));

    let plain = page
        .new_backdrop_layer(LayerSpec::new(1, GroupAttrs::new(DeviceBox::from_size(8, 8)), &CMYK, &CMYK))
        .unwrap();
    assert!(page.set_soft_mask(plain, None, None).is_err());
}

#[test]
fn colorant_mapping_is_validated() {
    let (_sys, mut page) = page(true);
    let base = page
        .new_backdrop_layer(LayerSpec::new(0, page_group(), &CMYK, &CMYK))
        .unwrap();
    page.set_device_colorant_mapping(base, &[0, 1, COLORANT_NONE, 3]).unwrap();
    assert_eq!(
        page.layer(base).unwrap().device_colorant_mapping(),
        Some(&[0, 1, COLORANT_NONE, 3][..])
    );
    assert!(page.set_device_colorant_mapping(base, &[0, 1]).is_err());
    assert!(page.set_device_colorant_mapping(base, &[0, 1, -5, 3]).is_err());
}
