//! Frame-building benchmarks.
//!
//! The aggregation and culling groups are CPU only. The headless group needs a
//! Vulkan driver (hardware or software e.g. Lavapipe) and is skipped without one.

use ash_deferred::prelude::*;
use ash_deferred::renderer::passes::frustum_cull::{extract_frustum_planes, sphere_in_frustum};
use ash_deferred::renderer::SceneAggregator;
use ash_deferred::scene::PrimitiveGeometry;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn cube_data() -> SceneData {
    let positions: Vec<Vec3> = (0..8)
        .map(|i| Vec3::new((i & 1) as f32, ((i >> 1) & 1) as f32, ((i >> 2) & 1) as f32))
        .collect();
    let indices = [
        0, 1, 3, 0, 3, 2, 4, 6, 7, 4, 7, 5, 0, 4, 5, 0, 5, 1, 2, 3, 7, 2, 7, 6, 0, 2, 6, 0, 6, 4,
        1, 5, 7, 1, 7, 3,
    ];
    let mut data = SceneData::default();
    data.local_transforms.push(Mat4::IDENTITY);
    data.materials.push(Material::default());
    let draw = data.push_primitive(
        &PrimitiveGeometry {
            positions: &positions,
            indices: &indices,
            ..Default::default()
        },
        0,
        0,
    );
    data.mesh_draws.push(draw);
    data
}

fn grid(n: usize) -> impl Iterator<Item = Mat4> {
    let side = (n as f32).sqrt().ceil() as usize;
    (0..n).map(move |i| {
        Mat4::from_translation(Vec3::new((i % side) as f32 * 2.0, 0.0, (i / side) as f32 * 2.0))
    })
}

/// Flattening instances into indirect draw records each frame
fn scene_build_frame(c: &mut Criterion) {
    init_logging();
    let mut group = c.benchmark_group("scene_aggregation");
    let data = cube_data();

    for count in [100, 1_000, 10_000] {
        let mut scene = SceneAggregator::new();
        let prefab = match scene.add_prefab("cube", &data, &[]) {
            Ok(prefab) => prefab,
            Err(e) => {
                eprintln!("Failed to add prefab: {e}");
                return;
            }
        };
        for transform in grid(count) {
            if scene.add_instance(prefab, transform).is_err() {
                break;
            }
        }
        group.bench_with_input(BenchmarkId::new("build_frame", count), &count, |b, _| {
            b.iter(|| scene.build_frame())
        });
    }

    group.finish();
}

/// CPU reference of the GPU cull test
fn frustum_culling(c: &mut Criterion) {
    init_logging();
    let mut group = c.benchmark_group("frustum_culling");
    let view = Mat4::look_at_rh(Vec3::new(0.0, 10.0, -10.0), Vec3::ZERO, Vec3::Y);
    let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 200.0);
    let planes = extract_frustum_planes(proj * view);

    group.bench_function("extract_planes", |b| b.iter(|| extract_frustum_planes(proj * view)));

    for count in [1_000, 10_000] {
        let spheres: Vec<Vec4> = grid(count)
            .map(|m| m.w_axis.truncate().extend(0.9))
            .collect();
        group.bench_with_input(BenchmarkId::new("spheres", count), &spheres, |b, spheres| {
            b.iter(|| {
                spheres
                    .iter()
                    .filter(|s| sphere_in_frustum(&planes, **s))
                    .count()
            })
        });
    }

    group.finish();
}

/// Headless frame loop (requires Vulkan driver)
fn headless_render_loop(c: &mut Criterion) {
    init_logging();
    let mut group = c.benchmark_group("renderer_headless");
    let surface_provider = HeadlessSurfaceProvider::new(800, 600);

    match Renderer::new(&surface_provider, EngineConfig::default()) {
        Ok(mut renderer) => {
            let setup = renderer
                .add_prefab_data("cube", &cube_data())
                .and_then(|prefab| {
                    grid(256).try_for_each(|t| renderer.add_instance(prefab, t).map(|_| ()))
                });
            if let Err(e) = setup {
                eprintln!("Failed to build benchmark scene: {e}");
                return;
            }

            let position = Vec3::new(0.0, 12.0, -12.0);
            let camera = FrameCamera {
                view: Mat4::look_at_rh(position, Vec3::new(16.0, 0.0, 16.0), Vec3::Y),
                projection: Mat4::perspective_rh(60f32.to_radians(), 800.0 / 600.0, 0.1, 200.0),
                position,
            };
            let mut toggles = RenderToggles::default();

            group.bench_function("render_frame", |b| {
                b.iter(|| {
                    if let Err(e) = renderer.render_frame(&camera, &mut toggles) {
                        eprintln!("Render frame failed during benchmark: {e}");
                    }
                })
            });
        }
        Err(e) => {
            eprintln!("Failed to initialize headless renderer for benchmark: {e}");
            eprintln!("Skipping headless benchmarks.");
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    scene_build_frame,
    frustum_culling,
    headless_render_loop
);
criterion_main!(benches);
