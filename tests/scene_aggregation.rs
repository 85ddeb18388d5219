//! CPU-side aggregation: prefabs flattened into one address space and expanded
//! into per-instance draw records. No GPU required.

use ash_deferred::renderer::SceneAggregator;
use ash_deferred::scene::{Material, PrimitiveGeometry, SceneData, NO_TEXTURE};
use ash_deferred::AshError;
use glam::{Mat4, Vec3};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quad_prefab(textured: bool) -> SceneData {
    let mut data = SceneData::default();
    let positions = [Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::new(1.0, 1.0, 0.0)];
    let tri = [Vec3::ZERO, Vec3::X, Vec3::Z];

    data.local_transforms
        .push(Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)));
    let mut material = Material::default();
    if textured {
        material.albedo_texture = 0;
    }
    data.materials.push(material);

    let quad = data.push_primitive(
        &PrimitiveGeometry {
            positions: &positions,
            indices: &[0, 1, 2, 2, 1, 3],
            ..Default::default()
        },
        0,
        0,
    );
    let triangle = data.push_primitive(
        &PrimitiveGeometry {
            positions: &tri,
            indices: &[0, 1, 2],
            ..Default::default()
        },
        0,
        0,
    );
    data.mesh_draws.extend([quad, triangle]);
    data
}

#[test]
fn instances_expand_to_one_draw_per_primitive() {
    init_logging();
    let mut scene = SceneAggregator::new();
    let data = quad_prefab(false);
    let prefab = scene.add_prefab("quad", &data, &[]).unwrap();

    let placements = [
        Mat4::IDENTITY,
        Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)),
        Mat4::from_scale(Vec3::splat(2.0)),
    ];
    for placement in placements {
        scene.add_instance(prefab, placement).unwrap();
    }

    assert_eq!(scene.build_frame(), 6);
    let draws = scene.draws();
    let transforms = scene.transforms();
    assert_eq!(transforms.len(), 6);
    assert_eq!(scene.bounds().len(), 6);

    let local = data.local_transforms[0];
    for (i, draw) in draws.iter().enumerate() {
        let placement = placements[i / 2];
        assert_eq!(draw.instance_count, 1);
        assert_eq!(draw.transform_index, i as u32);
        assert_eq!(transforms[i], placement * local);
    }
    assert_eq!((draws[0].index_count, draws[0].first_index), (6, 0));
    assert_eq!((draws[1].index_count, draws[1].first_index), (3, 6));
    assert_eq!(draws[1].vertex_offset, 4);
}

#[test]
fn second_prefab_is_rebased_past_the_first() {
    init_logging();
    let mut scene = SceneAggregator::new();
    let first = quad_prefab(false);
    let second = quad_prefab(true);
    scene.add_prefab("a", &first, &[]).unwrap();
    let b = scene.add_prefab("b", &second, &[17]).unwrap();

    let prefab = scene.prefab(b).unwrap();
    assert_eq!(prefab.index_offset, 9);
    assert_eq!(prefab.vertex_offset, 7);
    assert_eq!(prefab.material_offset, 1);
    assert_eq!(prefab.transform_offset, 1);
    assert_eq!(scene.materials[0].albedo_texture, NO_TEXTURE);
    assert_eq!(scene.materials[1].albedo_texture, 0);
    assert_eq!(scene.texture_indices, vec![17]);

    scene.add_instance(b, Mat4::IDENTITY).unwrap();
    scene.build_frame();
    let draw = scene.draws()[1];
    assert_eq!(draw.first_index, 9 + 6);
    assert_eq!(draw.vertex_offset, 7 + 4);
    assert_eq!(draw.material_index, 1);
}

#[test]
fn adding_the_same_key_twice_returns_the_existing_prefab() {
    init_logging();
    let mut scene = SceneAggregator::new();
    let data = quad_prefab(false);
    let first = scene.add_prefab("quad", &data, &[]).unwrap();
    let again = scene.add_prefab("quad", &data, &[]).unwrap();
    assert_eq!(first, again);
    assert_eq!(scene.positions.len(), data.positions.len());
}

#[test]
fn removed_instances_stop_drawing() {
    init_logging();
    let mut scene = SceneAggregator::new();
    let prefab = scene.add_prefab("quad", &quad_prefab(false), &[]).unwrap();
    let kept = scene.add_instance(prefab, Mat4::IDENTITY).unwrap();
    let removed = scene.add_instance(prefab, Mat4::IDENTITY).unwrap();
    assert_eq!(scene.build_frame(), 4);

    scene.remove_instance(removed).unwrap();
    assert_eq!(scene.build_frame(), 2);
    assert!(scene.remove_instance(removed).is_err());

    assert!(matches!(
        scene.destroy_prefab(prefab),
        Err(AshError::ResourceInUse(_))
    ));
    scene.remove_instance(kept).unwrap();
    scene.destroy_prefab(prefab).unwrap();
    assert!(scene.find_prefab("quad").is_none());
    assert_eq!(scene.build_frame(), 0);
}
