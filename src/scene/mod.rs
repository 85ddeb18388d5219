//! CPU-side scene representation produced by the importers and consumed by the
//! aggregator in [`crate::renderer::scene_data`].

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

#[cfg(feature = "gltf_loading")]
pub mod gltf_loader;

#[cfg(feature = "gltf_loading")]
pub use gltf_loader::load_gltf;

/// Texture slot value meaning "no texture bound"; never rebased.
pub const NO_TEXTURE: u32 = u32::MAX;

/// Surface parameters for one material, laid out for a GPU storage buffer.
///
/// Texture fields index the owning prefab's texture list until the aggregator
/// rebases them into the global list.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Material {
    pub base_color: [f32; 4],
    pub emissive: [f32; 3],
    pub metallic: f32,
    pub roughness: f32,
    pub occlusion_strength: f32,
    /// Fragments with lower albedo alpha are discarded; 0 for opaque materials.
    pub alpha_cutoff: f32,
    pub _pad: f32,
    pub albedo_texture: u32,
    pub normal_texture: u32,
    pub orm_texture: u32,
    pub emissive_texture: u32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            base_color: [1.0; 4],
            emissive: [0.0; 3],
            metallic: 0.0,
            roughness: 1.0,
            occlusion_strength: 1.0,
            alpha_cutoff: 0.0,
            _pad: 0.0,
            albedo_texture: NO_TEXTURE,
            normal_texture: NO_TEXTURE,
            orm_texture: NO_TEXTURE,
            emissive_texture: NO_TEXTURE,
        }
    }
}

impl Material {
    pub fn texture_slots_mut(&mut self) -> [&mut u32; 4] {
        [
            &mut self.albedo_texture,
            &mut self.normal_texture,
            &mut self.orm_texture,
            &mut self.emissive_texture,
        ]
    }
}

/// One drawable primitive instance inside a scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshDraw {
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    /// Index into [`SceneData::materials`].
    pub material: u32,
    /// Index into [`SceneData::local_transforms`].
    pub transform: u32,
    /// Bounding sphere in mesh space: xyz center, w radius.
    pub bounds: Vec4,
}

/// Decoded RGBA8 pixels of one scene image.
#[derive(Clone, Debug)]
pub struct TexturePayload {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    /// Color data (albedo, emissive) is sampled as sRGB.
    pub srgb: bool,
}

/// Borrowed vertex streams of one primitive; indices are primitive-local.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrimitiveGeometry<'a> {
    pub positions: &'a [Vec3],
    pub uvs: Option<&'a [Vec2]>,
    pub normals: Option<&'a [Vec3]>,
    pub tangents: Option<&'a [Vec4]>,
    pub indices: &'a [u32],
}

/// Flattened geometry, materials and node transforms of one imported scene.
///
/// Vertex attributes are stored as parallel streams so each one can live in its
/// own GPU buffer.
#[derive(Clone, Debug, Default)]
pub struct SceneData {
    pub positions: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec4>,
    pub indices: Vec<u32>,
    pub local_transforms: Vec<Mat4>,
    pub mesh_draws: Vec<MeshDraw>,
    pub materials: Vec<Material>,
    pub textures: Vec<TexturePayload>,
}

impl SceneData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mesh_draws.is_empty()
    }

    /// Appends one primitive's geometry and returns the draw describing it.
    /// Missing attribute streams are filled with defaults so every stream keeps
    /// the same length.
    pub fn push_primitive(
        &mut self,
        geometry: &PrimitiveGeometry<'_>,
        material: u32,
        transform: u32,
    ) -> MeshDraw {
        let vertex_offset = self.positions.len() as i32;
        let first_index = self.indices.len() as u32;
        let count = geometry.positions.len();

        self.positions.extend_from_slice(geometry.positions);
        extend_or_fill(&mut self.uvs, geometry.uvs, count, Vec2::ZERO);
        extend_or_fill(&mut self.normals, geometry.normals, count, Vec3::Y);
        extend_or_fill(
            &mut self.tangents,
            geometry.tangents,
            count,
            Vec4::new(1.0, 0.0, 0.0, 1.0),
        );
        self.indices.extend_from_slice(geometry.indices);

        MeshDraw {
            index_count: geometry.indices.len() as u32,
            first_index,
            vertex_offset,
            material,
            transform,
            bounds: bounding_sphere(geometry.positions),
        }
    }
}

fn extend_or_fill<T: Copy>(stream: &mut Vec<T>, values: Option<&[T]>, count: usize, fill: T) {
    match values {
        Some(values) if values.len() == count => stream.extend_from_slice(values),
        _ => stream.extend(std::iter::repeat(fill).take(count)),
    }
}

/// Sphere around the axis-aligned bounds of `positions`.
pub fn bounding_sphere(positions: &[Vec3]) -> Vec4 {
    let Some(first) = positions.first() else {
        return Vec4::ZERO;
    };
    let (min, max) = positions
        .iter()
        .fold((*first, *first), |(min, max), p| (min.min(*p), max.max(*p)));
    let center = (min + max) * 0.5;
    center.extend((max - center).length())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_matches_gpu_layout() {
        assert_eq!(std::mem::size_of::<Material>(), 64);
        assert_eq!(Material::default().albedo_texture, NO_TEXTURE);
    }

    #[test]
    fn primitives_keep_streams_aligned() {
        let mut scene = SceneData::default();
        let tri = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let first = scene.push_primitive(
            &PrimitiveGeometry {
                positions: &tri,
                indices: &[0, 1, 2],
                ..Default::default()
            },
            0,
            0,
        );
        let uvs = [Vec2::ZERO; 3];
        let second = scene.push_primitive(
            &PrimitiveGeometry {
                positions: &tri,
                uvs: Some(&uvs),
                indices: &[0, 2, 1],
                ..Default::default()
            },
            0,
            1,
        );

        assert_eq!(first.vertex_offset, 0);
        assert_eq!(second.vertex_offset, 3);
        assert_eq!(second.first_index, 3);
        assert_eq!(scene.uvs.len(), 6);
        assert_eq!(scene.normals.len(), 6);
        assert_eq!(scene.tangents.len(), 6);
    }

    #[test]
    fn sphere_encloses_bounds() {
        let sphere = bounding_sphere(&[Vec3::new(-1.0, 0.0, 0.0), Vec3::new(3.0, 0.0, 0.0)]);
        assert_eq!(sphere, Vec4::new(1.0, 0.0, 0.0, 2.0));
        assert_eq!(bounding_sphere(&[]), Vec4::ZERO);
    }
}
