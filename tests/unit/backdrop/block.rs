use super::*;
use crate::foundation::core::DeviceBox;

fn group() -> GroupAttrs {
    GroupAttrs::new(DeviceBox::from_size(64, 64))
}

#[test]
fn layout_follows_group_kind() {
    let page = GroupAttrs {
        composite_to_page: true,
        ..group()
    };
    let l = PixelLayout::for_group(&page, 4, 4, false, false);
    assert_eq!(l.table_type, TableType::Output8);
    assert_eq!((l.channels(), l.pixel_bytes()), (4, 4));
    assert_eq!(
        PixelLayout::for_group(&page, 4, 4, false, true).table_type,
        TableType::Output16
    );

    let l = PixelLayout::for_group(&group(), 3, 3, true, false);
    assert_eq!(l.table_type, TableType::Isolated);
    assert_eq!(l.channels(), 5);
    assert_eq!((l.alpha_index(), l.group_alpha_index(), l.shape_index()), (Some(3), Some(4), None));

    let mask = GroupAttrs {
        soft_mask: Some(SoftMaskKind::Alpha),
        ..group()
    };
    let l = PixelLayout::for_group(&mask, 4, 4, false, false);
    assert_eq!((l.table_type, l.channels(), l.pixel_bytes()), (TableType::Alpha, 1, 2));
}

#[test]
fn exact_table_never_exceeds_estimate() {
    let pixels = 64 * 32;
    let shaped = GroupAttrs {
        track_shape: true,
        ..group()
    };
    for comps in 1..8 {
        for nonisolated in [false, true] {
            let l = PixelLayout::for_group(&shaped, comps, comps, nonisolated, false);
            assert!(l.table_bytes(pixels) <= estimate_table_size(pixels, comps, nonisolated));
        }
    }
}

#[test]
fn eight_bit_encoding_keeps_the_high_byte() {
    let page = GroupAttrs {
        composite_to_page: true,
        ..group()
    };
    let l = PixelLayout::for_group(&page, 2, 2, false, false);
    let mut out = [0u8; 2];
    l.encode(&[0xABCD, 0xFFFF], &mut out);
    assert_eq!(out, [0xAB, 0xFF]);
    assert_eq!(l.decode(&out).as_slice(), &[0xABAB, 0xFFFF]);
}

#[test]
fn color_and_alpha_defaults_to_opaque() {
    let page = GroupAttrs {
        composite_to_page: true,
        ..group()
    };
    let l = PixelLayout::for_group(&page, 2, 2, false, false);
    let (c, a) = l.color_and_alpha(&[1, 2]);
    assert_eq!((c.as_slice(), a), (&[1u16, 2][..], COLOR_ONE));

    let l = PixelLayout::for_group(&group(), 2, 2, false, false);
    let (c, a) = l.color_and_alpha(&[1, 2, 3]);
    assert_eq!((c.as_slice(), a), (&[1u16, 2][..], 3));
}

#[test]
fn uniform_detection() {
    let mut buf = vec![0u8; 24];
    fill_pixels(&mut buf, &[1, 2, 3]);
    assert_eq!(uniform_pixel(&buf, 3), Some(&[1u8, 2, 3][..]));
    buf[23] = 9;
    assert_eq!(uniform_pixel(&buf, 3), None);
}

#[test]
fn table_slots_start_empty() {
    let t = BlockTable::new(LayerId::new(0, 1), 6);
    assert_eq!(t.len(), 6);
    assert!(t.slots().all(|s| s.lock().is_none()));
    assert!(t.slot(6).is_err());
}
