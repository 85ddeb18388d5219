//! Global geometry/material address space shared by every loaded model, and the
//! per-frame indirect draw list built from it.
//!
//! [`SceneAggregator`] is the CPU half: prefabs append their data to global
//! arrays with rebased offsets, instances reference prefabs, and
//! [`SceneAggregator::build_frame`] flattens everything into draw records.
//! [`Scene`] owns the GPU buffers those arrays and records live in.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};
use log::{debug, info, warn};
use std::collections::HashMap;
#[cfg(feature = "gltf_loading")]
use std::path::Path;

use super::async_loader::{AsyncLoader, UploadRequest};
use super::device::Device;
use super::resource_pool::{Handle, ResourcePool};
use super::resources::{Buffer, BufferCI, Texture, TextureCI};
use super::ring::RingBuffer;
use crate::scene::{Material, MeshDraw, SceneData, NO_TEXTURE};
use crate::{AshError, Result};

const MAX_PREFABS: u32 = 256;
const MAX_INSTANCES: u32 = 16 * 1024;
pub(crate) const INITIAL_DRAW_CAPACITY: u64 = 1024;

/// One indexed indirect draw plus the lookups its shaders need.
///
/// The first five fields are `VkDrawIndexedIndirectCommand`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectDrawData {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
    pub material_index: u32,
    pub transform_index: u32,
    pub _pad: u32,
}

/// A loaded model: where its data starts in each global array.
#[derive(Clone, Debug)]
pub struct ModelPrefab {
    pub key: String,
    pub index_offset: u32,
    pub vertex_offset: u32,
    pub material_offset: u32,
    pub transform_offset: u32,
    pub texture_offset: u32,
    /// Draws with prefab-local offsets.
    pub draws: Vec<MeshDraw>,
    /// GPU textures created for this prefab, destroyed with it.
    pub textures: Vec<Handle<Texture>>,
}

#[derive(Clone, Copy, Debug)]
pub struct ModelInstance {
    pub prefab: Handle<ModelPrefab>,
    pub transform: Mat4,
}

/// Single-writer accumulator of scene data. Global arrays only grow.
pub struct SceneAggregator {
    pub positions: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec4>,
    pub indices: Vec<u32>,
    pub materials: Vec<Material>,
    pub local_transforms: Vec<Mat4>,
    /// Bindless index of every texture referenced by a material.
    pub texture_indices: Vec<u32>,

    prefabs: ResourcePool<ModelPrefab>,
    prefab_keys: HashMap<String, Handle<ModelPrefab>>,
    instances: ResourcePool<ModelInstance>,

    draws: Vec<IndirectDrawData>,
    transforms: Vec<Mat4>,
    bounds: Vec<Vec4>,
}

impl Default for SceneAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneAggregator {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PREFABS, MAX_INSTANCES)
    }

    pub fn with_capacity(prefabs: u32, instances: u32) -> Self {
        Self {
            positions: Vec::new(),
            uvs: Vec::new(),
            normals: Vec::new(),
            tangents: Vec::new(),
            indices: Vec::new(),
            materials: Vec::new(),
            local_transforms: Vec::new(),
            texture_indices: Vec::new(),
            prefabs: ResourcePool::new("prefab", prefabs),
            prefab_keys: HashMap::new(),
            instances: ResourcePool::new("instance", instances),
            draws: Vec::new(),
            transforms: Vec::new(),
            bounds: Vec::new(),
        }
    }

    pub fn find_prefab(&self, key: &str) -> Option<Handle<ModelPrefab>> {
        self.prefab_keys.get(key).copied()
    }

    pub fn prefab(&self, handle: Handle<ModelPrefab>) -> Result<&ModelPrefab> {
        self.prefabs.get(handle)
    }

    /// Appends `data` to the global arrays. Returns the existing prefab when `key`
    /// was already added.
    ///
    /// `texture_indices[i]` is the bindless index of `data.textures[i]`; material
    /// texture references are rebased by the number of texture indices already
    /// present.
    pub fn add_prefab(
        &mut self,
        key: &str,
        data: &SceneData,
        texture_indices: &[u32],
    ) -> Result<Handle<ModelPrefab>> {
        if let Some(existing) = self.find_prefab(key) {
            debug!("Prefab '{key}' already loaded");
            return Ok(existing);
        }

        let prefab = ModelPrefab {
            key: key.to_owned(),
            index_offset: self.indices.len() as u32,
            vertex_offset: self.positions.len() as u32,
            material_offset: self.materials.len() as u32,
            transform_offset: self.local_transforms.len() as u32,
            texture_offset: self.texture_indices.len() as u32,
            draws: data.mesh_draws.clone(),
            textures: Vec::new(),
        };
        let handle = self.prefabs.obtain(prefab)?;
        let texture_offset = self.texture_indices.len() as u32;

        self.positions.extend_from_slice(&data.positions);
        self.uvs.extend_from_slice(&data.uvs);
        self.normals.extend_from_slice(&data.normals);
        self.tangents.extend_from_slice(&data.tangents);
        self.indices.extend_from_slice(&data.indices);
        self.local_transforms.extend_from_slice(&data.local_transforms);
        self.texture_indices.extend_from_slice(texture_indices);
        for material in &data.materials {
            let mut material = *material;
            for slot in material.texture_slots_mut() {
                if *slot == NO_TEXTURE {
                    continue;
                }
                if *slot as usize >= texture_indices.len() {
                    warn!("Prefab '{key}' references missing texture {}", *slot);
                    *slot = NO_TEXTURE;
                } else {
                    *slot += texture_offset;
                }
            }
            self.materials.push(material);
        }

        self.prefab_keys.insert(key.to_owned(), handle);
        info!(
            "Added prefab '{key}': {} draws, {} vertices",
            data.mesh_draws.len(),
            data.positions.len()
        );
        Ok(handle)
    }

    pub fn add_instance(
        &mut self,
        prefab: Handle<ModelPrefab>,
        transform: Mat4,
    ) -> Result<Handle<ModelInstance>> {
        self.prefabs.get(prefab)?;
        self.instances.obtain(ModelInstance { prefab, transform })
    }

    pub fn remove_instance(&mut self, instance: Handle<ModelInstance>) -> Result<()> {
        self.instances.release(instance).map(|_| ())
    }

    pub fn set_instance_transform(
        &mut self,
        instance: Handle<ModelInstance>,
        transform: Mat4,
    ) -> Result<()> {
        self.instances.get_mut(instance)?.transform = transform;
        Ok(())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Forgets a prefab. Its geometry stays in the global arrays; only its handle
    /// and key are released. Refused while any instance references it.
    pub fn destroy_prefab(&mut self, prefab: Handle<ModelPrefab>) -> Result<ModelPrefab> {
        let users = self
            .instances
            .iter()
            .filter(|(_, instance)| instance.prefab == prefab)
            .count();
        if users > 0 {
            let key = &self.prefabs.get(prefab)?.key;
            return Err(AshError::ResourceInUse(format!(
                "prefab '{key}' still has {users} instances"
            )));
        }
        let removed = self.prefabs.release(prefab)?;
        self.prefab_keys.remove(&removed.key);
        Ok(removed)
    }

    pub(crate) fn prefab_mut(&mut self, handle: Handle<ModelPrefab>) -> Result<&mut ModelPrefab> {
        self.prefabs.get_mut(handle)
    }

    /// Rebuilds this frame's draw records from every live instance, in instance
    /// order then mesh-draw order. Returns the draw count.
    pub fn build_frame(&mut self) -> usize {
        self.draws.clear();
        self.transforms.clear();
        self.bounds.clear();

        for (_, instance) in self.instances.iter() {
            let Ok(prefab) = self.prefabs.get(instance.prefab) else {
                continue;
            };
            for draw in &prefab.draws {
                let local = self
                    .local_transforms
                    .get((prefab.transform_offset + draw.transform) as usize)
                    .copied()
                    .unwrap_or(Mat4::IDENTITY);
                let world = instance.transform * local;

                self.draws.push(IndirectDrawData {
                    index_count: draw.index_count,
                    instance_count: 1,
                    first_index: prefab.index_offset + draw.first_index,
                    vertex_offset: prefab.vertex_offset as i32 + draw.vertex_offset,
                    first_instance: 0,
                    material_index: prefab.material_offset + draw.material,
                    transform_index: self.transforms.len() as u32,
                    _pad: 0,
                });
                self.transforms.push(world);
                self.bounds.push(world_sphere(&world, draw.bounds));
            }
        }
        self.draws.len()
    }

    pub fn draw_count(&self) -> usize {
        self.draws.len()
    }

    pub fn draws(&self) -> &[IndirectDrawData] {
        &self.draws
    }

    pub fn transforms(&self) -> &[Mat4] {
        &self.transforms
    }

    pub fn bounds(&self) -> &[Vec4] {
        &self.bounds
    }
}

fn world_sphere(world: &Mat4, sphere: Vec4) -> Vec4 {
    let center = world.transform_point3(sphere.truncate());
    let scale = world
        .x_axis
        .truncate()
        .length()
        .max(world.y_axis.truncate().length())
        .max(world.z_axis.truncate().length());
    center.extend(sphere.w * scale)
}

/// Global arrays uploaded to the GPU; rebuilt whenever a prefab is added.
struct GeometryBuffers {
    positions: Handle<Buffer>,
    uvs: Handle<Buffer>,
    normals: Handle<Buffer>,
    tangents: Handle<Buffer>,
    indices: Handle<Buffer>,
    materials: Handle<Buffer>,
    texture_indices: Handle<Buffer>,
}

impl GeometryBuffers {
    fn handles(&self) -> [Handle<Buffer>; 7] {
        [
            self.positions,
            self.uvs,
            self.normals,
            self.tangents,
            self.indices,
            self.materials,
            self.texture_indices,
        ]
    }
}

/// Buffer handles the passes read for the current frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct SceneBuffers {
    pub positions: Handle<Buffer>,
    pub uvs: Handle<Buffer>,
    pub normals: Handle<Buffer>,
    pub tangents: Handle<Buffer>,
    pub indices: Handle<Buffer>,
    pub materials: Handle<Buffer>,
    pub texture_indices: Handle<Buffer>,
    /// Current ring slots.
    pub draws: Handle<Buffer>,
    pub transforms: Handle<Buffer>,
    pub bounds: Handle<Buffer>,
    pub count: Handle<Buffer>,
    pub draw_count: u32,
}

/// GPU side of the aggregator.
pub struct Scene {
    aggregator: SceneAggregator,
    geometry: Option<GeometryBuffers>,
    draws: RingBuffer,
    transforms: RingBuffer,
    bounds: RingBuffer,
    count: RingBuffer,
    draw_count: u32,
}

fn frame_ring(
    device: &mut Device,
    size: u64,
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<RingBuffer> {
    RingBuffer::per_frame(
        device,
        &BufferCI::new(size, usage | vk::BufferUsageFlags::STORAGE_BUFFER)
            .mapped()
            .bindless()
            .name(name),
    )
}

impl Scene {
    pub fn new(device: &mut Device) -> Result<Self> {
        let draw_size = std::mem::size_of::<IndirectDrawData>() as u64;
        Ok(Self {
            aggregator: SceneAggregator::new(),
            geometry: None,
            draws: frame_ring(
                device,
                INITIAL_DRAW_CAPACITY * draw_size,
                vk::BufferUsageFlags::INDIRECT_BUFFER,
                "scene_draws",
            )?,
            transforms: frame_ring(
                device,
                INITIAL_DRAW_CAPACITY * 64,
                vk::BufferUsageFlags::empty(),
                "scene_transforms",
            )?,
            bounds: frame_ring(
                device,
                INITIAL_DRAW_CAPACITY * 16,
                vk::BufferUsageFlags::empty(),
                "scene_bounds",
            )?,
            count: frame_ring(
                device,
                16,
                vk::BufferUsageFlags::INDIRECT_BUFFER,
                "scene_draw_count",
            )?,
            draw_count: 0,
        })
    }

    pub fn aggregator(&self) -> &SceneAggregator {
        &self.aggregator
    }

    pub fn aggregator_mut(&mut self) -> &mut SceneAggregator {
        &mut self.aggregator
    }

    /// Imports a glTF file once per path and uploads its data.
    #[cfg(feature = "gltf_loading")]
    pub fn load_prefab(
        &mut self,
        device: &mut Device,
        loader: &mut AsyncLoader,
        path: impl AsRef<Path>,
    ) -> Result<Handle<ModelPrefab>> {
        let path = path.as_ref();
        let key = path.to_string_lossy();
        if let Some(existing) = self.aggregator.find_prefab(&key) {
            return Ok(existing);
        }
        let data = crate::scene::load_gltf(path)?;
        self.add_prefab_data(device, loader, &key, &data)
    }

    /// Adds already-imported scene data: creates and queues its textures, appends
    /// it to the aggregator and rebuilds the geometry buffers.
    pub fn add_prefab_data(
        &mut self,
        device: &mut Device,
        loader: &mut AsyncLoader,
        key: &str,
        data: &SceneData,
    ) -> Result<Handle<ModelPrefab>> {
        if let Some(existing) = self.aggregator.find_prefab(key) {
            return Ok(existing);
        }

        let mut textures = Vec::with_capacity(data.textures.len());
        let mut bindless = Vec::with_capacity(data.textures.len());
        for payload in &data.textures {
            let format = if payload.srgb {
                vk::Format::R8G8B8A8_SRGB
            } else {
                vk::Format::R8G8B8A8_UNORM
            };
            let created = device.create_texture(
                &TextureCI::new(payload.width, payload.height, format)
                    .full_mip_chain()
                    .name(format!("{key}:{}", payload.name)),
            );
            match created {
                Ok(handle) => {
                    bindless.push(device.texture(handle)?.shader_index());
                    loader.enqueue(UploadRequest::Texture {
                        dst: handle,
                        data: payload.rgba.clone(),
                    });
                    textures.push(handle);
                }
                Err(e) => {
                    warn!("Texture '{}' of '{key}' unavailable: {e}", payload.name);
                    // Slot 0 is the default texture.
                    bindless.push(0);
                }
            }
        }

        let handle = match self.aggregator.add_prefab(key, data, &bindless) {
            Ok(handle) => handle,
            Err(e) => {
                for texture in textures {
                    let _ = device.destroy_texture(texture);
                }
                return Err(e);
            }
        };
        self.aggregator.prefab_mut(handle)?.textures = textures;
        self.build_buffers(device)?;
        Ok(handle)
    }

    pub fn add_instance(
        &mut self,
        prefab: Handle<ModelPrefab>,
        transform: Mat4,
    ) -> Result<Handle<ModelInstance>> {
        self.aggregator.add_instance(prefab, transform)
    }

    pub fn remove_instance(&mut self, instance: Handle<ModelInstance>) -> Result<()> {
        self.aggregator.remove_instance(instance)
    }

    pub fn set_instance_transform(
        &mut self,
        instance: Handle<ModelInstance>,
        transform: Mat4,
    ) -> Result<()> {
        self.aggregator.set_instance_transform(instance, transform)
    }

    /// Destroys a prefab with no remaining instances, along with its textures.
    pub fn destroy_prefab(
        &mut self,
        device: &mut Device,
        prefab: Handle<ModelPrefab>,
    ) -> Result<()> {
        let removed = self.aggregator.destroy_prefab(prefab)?;
        for texture in removed.textures {
            device.destroy_texture(texture)?;
        }
        Ok(())
    }

    /// Replaces the geometry buffers with ones holding the full global arrays. The
    /// new data reaches the GPU through the transfer loader; old buffers retire
    /// through the device's deferred destruction.
    fn build_buffers(&mut self, device: &mut Device) -> Result<()> {
        let agg = &self.aggregator;
        if agg.positions.is_empty() {
            return Ok(());
        }
        let vertex = vk::BufferUsageFlags::VERTEX_BUFFER;
        let geometry = GeometryBuffers {
            positions: upload_buffer(device, &agg.positions, vertex, "scene_positions")?,
            uvs: upload_buffer(device, &agg.uvs, vertex, "scene_uvs")?,
            normals: upload_buffer(device, &agg.normals, vertex, "scene_normals")?,
            tangents: upload_buffer(device, &agg.tangents, vertex, "scene_tangents")?,
            indices: upload_buffer(
                device,
                &agg.indices,
                vk::BufferUsageFlags::INDEX_BUFFER,
                "scene_indices",
            )?,
            materials: upload_buffer(
                device,
                &agg.materials,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                "scene_materials",
            )?,
            texture_indices: upload_buffer(
                device,
                &agg.texture_indices,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                "scene_texture_indices",
            )?,
        };
        if let Some(old) = self.geometry.replace(geometry) {
            for buffer in old.handles() {
                device.destroy_buffer(buffer)?;
            }
        }
        debug!(
            "Rebuilt scene buffers: {} vertices, {} indices, {} materials",
            agg.positions.len(),
            agg.indices.len(),
            agg.materials.len()
        );
        Ok(())
    }

    /// Whether every geometry buffer has been uploaded and acquired.
    pub fn is_resident(&self, device: &Device) -> bool {
        geometry_resident(self.geometry.as_ref(), |buffer| {
            device.is_buffer_resident(buffer)
        })
    }

    /// Rotates the per-frame rings, then writes this frame's draws, transforms,
    /// bounds and draw count into the new current slots. Nothing is drawn while
    /// the geometry is still uploading.
    pub fn new_frame(&mut self, device: &mut Device) -> Result<u32> {
        self.aggregator.build_frame();
        let draw_count = visible_draw_count(&self.aggregator, self.is_resident(device));

        for ring in [
            &mut self.draws,
            &mut self.transforms,
            &mut self.bounds,
            &mut self.count,
        ] {
            ring.move_to_next_buffer();
        }

        let draws: &[u8] = bytemuck::cast_slice(self.aggregator.draws());
        let transforms: &[u8] = bytemuck::cast_slice(self.aggregator.transforms());
        let bounds: &[u8] = bytemuck::cast_slice(self.aggregator.bounds());
        self.draws.ensure_capacity(device, draws.len() as u64)?;
        self.transforms.ensure_capacity(device, transforms.len() as u64)?;
        self.bounds.ensure_capacity(device, bounds.len() as u64)?;

        self.draws.write(device, draws)?;
        self.transforms.write(device, transforms)?;
        self.bounds.write(device, bounds)?;
        self.count.write(device, bytemuck::bytes_of(&draw_count))?;
        self.draw_count = draw_count;
        Ok(draw_count)
    }

    /// Handles for the current frame. Geometry handles are invalid until the
    /// first prefab is added.
    pub fn frame_buffers(&self) -> SceneBuffers {
        let mut buffers = SceneBuffers {
            draws: self.draws.buffer(),
            transforms: self.transforms.buffer(),
            bounds: self.bounds.buffer(),
            count: self.count.buffer(),
            draw_count: self.draw_count,
            ..Default::default()
        };
        if let Some(geometry) = &self.geometry {
            buffers.positions = geometry.positions;
            buffers.uvs = geometry.uvs;
            buffers.normals = geometry.normals;
            buffers.tangents = geometry.tangents;
            buffers.indices = geometry.indices;
            buffers.materials = geometry.materials;
            buffers.texture_indices = geometry.texture_indices;
        }
        buffers
    }

    /// Largest draw count the rings can currently hold.
    pub fn draw_capacity(&self) -> u64 {
        self.draws.capacity() / std::mem::size_of::<IndirectDrawData>() as u64
    }

    pub fn destroy(mut self, device: &mut Device) {
        self.release(device);
    }

    /// Destroys every GPU object the scene owns. Safe to call twice.
    pub fn release(&mut self, device: &mut Device) {
        if let Some(geometry) = self.geometry.take() {
            for buffer in geometry.handles() {
                let _ = device.destroy_buffer(buffer);
            }
        }
        let prefabs: Vec<_> = self
            .aggregator
            .prefabs
            .iter()
            .map(|(handle, _)| handle)
            .collect();
        for prefab in prefabs {
            if let Ok(prefab) = self.aggregator.prefabs.release(prefab) {
                for texture in prefab.textures {
                    let _ = device.destroy_texture(texture);
                }
            }
        }
        self.draws.release(device);
        self.transforms.release(device);
        self.bounds.release(device);
        self.count.release(device);
        self.draw_count = 0;
    }
}

fn upload_buffer<T: Pod>(
    device: &mut Device,
    data: &[T],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<Handle<Buffer>> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let mut ci = BufferCI::new(bytes.len().max(4) as u64, usage).name(name);
    if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
        ci = ci.bindless();
    }
    device.create_buffer(&ci.initial_data(bytes.to_vec()))
}

fn geometry_resident(
    geometry: Option<&GeometryBuffers>,
    is_resident: impl Fn(Handle<Buffer>) -> bool,
) -> bool {
    geometry.is_some_and(|geometry| geometry.handles().into_iter().all(is_resident))
}

/// Draw count written for the culling pass; zero while geometry is uploading.
fn visible_draw_count(aggregator: &SceneAggregator, resident: bool) -> u32 {
    if resident {
        aggregator.draw_count() as u32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::PrimitiveGeometry;
    use std::collections::HashSet;

    /// Two triangles with distinct local transforms sharing one textured material.
    fn two_primitive_scene() -> SceneData {
        let mut scene = SceneData::default();
        let tri = [Vec3::ZERO, Vec3::X, Vec3::Y];
        for transform in 0..2 {
            let draw = scene.push_primitive(
                &PrimitiveGeometry {
                    positions: &tri,
                    indices: &[0, 1, 2],
                    ..Default::default()
                },
                0,
                transform,
            );
            scene.mesh_draws.push(draw);
        }
        scene.local_transforms = vec![
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0)),
        ];
        scene.materials.push(Material {
            albedo_texture: 0,
            ..Default::default()
        });
        scene
    }

    #[test]
    fn second_prefab_is_rebased_past_the_first() {
        let mut agg = SceneAggregator::new();
        let a = agg.add_prefab("a", &two_primitive_scene(), &[7]).unwrap();
        let b = agg.add_prefab("b", &two_primitive_scene(), &[9]).unwrap();

        let a = agg.prefab(a).unwrap().clone();
        let b = agg.prefab(b).unwrap();
        assert_eq!(a.index_offset, 0);
        assert_eq!(b.index_offset, 6);
        assert_eq!(b.vertex_offset, 6);
        assert_eq!(b.material_offset, 1);
        assert_eq!(b.transform_offset, 2);
        assert_eq!(b.texture_offset, 1);

        assert_eq!(agg.materials[0].albedo_texture, 0);
        assert_eq!(agg.materials[1].albedo_texture, 1);
        assert_eq!(agg.materials[1].normal_texture, NO_TEXTURE);
        assert_eq!(agg.texture_indices, vec![7, 9]);
    }

    #[test]
    fn prefabs_are_deduplicated_by_key() {
        let mut agg = SceneAggregator::new();
        let first = agg.add_prefab("model.gltf", &two_primitive_scene(), &[1]).unwrap();
        let again = agg.add_prefab("model.gltf", &two_primitive_scene(), &[1]).unwrap();
        assert_eq!(first, again);
        assert_eq!(agg.positions.len(), 6);
    }

    #[test]
    fn frame_emits_one_draw_per_instance_mesh_pair() {
        let mut agg = SceneAggregator::new();
        let a = agg.add_prefab("a", &two_primitive_scene(), &[0]).unwrap();
        let b = agg.add_prefab("b", &two_primitive_scene(), &[0]).unwrap();
        let offset = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        agg.add_instance(a, Mat4::IDENTITY).unwrap();
        agg.add_instance(b, offset).unwrap();

        assert_eq!(agg.build_frame(), 4);
        let draws = agg.draws();
        assert_eq!(draws[2].first_index, 6);
        assert_eq!(draws[2].vertex_offset, 6);
        assert_eq!(draws[2].material_index, 1);
        assert!(draws.iter().enumerate().all(|(i, d)| d.transform_index == i as u32));

        let lifted = Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0));
        assert_eq!(agg.transforms()[3], offset * lifted);
        let center = (offset * lifted).transform_point3(Vec3::new(0.5, 0.5, 0.0));
        assert_eq!(agg.bounds()[3].truncate(), center);
    }

    #[test]
    fn instance_edits_show_up_next_frame() {
        let mut agg = SceneAggregator::new();
        let prefab = agg.add_prefab("a", &two_primitive_scene(), &[0]).unwrap();
        let first = agg.add_instance(prefab, Mat4::IDENTITY).unwrap();
        let second = agg.add_instance(prefab, Mat4::IDENTITY).unwrap();
        assert_eq!(agg.build_frame(), 4);

        let moved = Mat4::from_scale(Vec3::splat(2.0));
        agg.set_instance_transform(second, moved).unwrap();
        agg.remove_instance(first).unwrap();
        assert_eq!(agg.build_frame(), 2);
        assert_eq!(agg.transforms()[0], moved);
        // Radius of the unit right triangle's box sphere, doubled by the scale.
        assert!((agg.bounds()[0].w - 2.0 * 0.5f32.sqrt()).abs() < 1e-6);
        assert!(agg.remove_instance(first).is_err());
    }

    #[test]
    fn prefab_with_instances_cannot_be_destroyed() {
        let mut agg = SceneAggregator::new();
        let prefab = agg.add_prefab("a", &two_primitive_scene(), &[0]).unwrap();
        let instance = agg.add_instance(prefab, Mat4::IDENTITY).unwrap();

        assert!(matches!(
            agg.destroy_prefab(prefab),
            Err(AshError::ResourceInUse(_))
        ));
        agg.remove_instance(instance).unwrap();
        agg.destroy_prefab(prefab).unwrap();
        assert!(agg.find_prefab("a").is_none());
        assert!(agg.add_instance(prefab, Mat4::IDENTITY).is_err());
    }

    #[test]
    fn missing_texture_references_are_cleared() {
        let mut agg = SceneAggregator::new();
        agg.add_prefab("a", &two_primitive_scene(), &[]).unwrap();
        assert_eq!(agg.materials[0].albedo_texture, NO_TEXTURE);
    }

    #[test]
    fn indirect_record_matches_vulkan_layout() {
        assert_eq!(std::mem::size_of::<IndirectDrawData>(), 32);
        assert_eq!(
            std::mem::size_of::<vk::DrawIndexedIndirectCommand>(),
            std::mem::offset_of!(IndirectDrawData, material_index)
        );
    }

    #[test]
    fn nothing_is_drawn_until_every_geometry_buffer_is_resident() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut agg = SceneAggregator::new();
        let prefab = agg.add_prefab("pair", &two_primitive_scene(), &[0]).unwrap();
        for _ in 0..3 {
            agg.add_instance(prefab, Mat4::IDENTITY).unwrap();
        }
        agg.build_frame();
        assert_eq!(agg.draw_count(), 6);

        let handles: [Handle<Buffer>; 7] = std::array::from_fn(|i| Handle::new(i as u32, 0));
        let [positions, uvs, normals, tangents, indices, materials, texture_indices] = handles;
        let geometry = GeometryBuffers {
            positions,
            uvs,
            normals,
            tangents,
            indices,
            materials,
            texture_indices,
        };
        let mut resident = HashSet::new();
        let count = |resident: &HashSet<Handle<Buffer>>| {
            visible_draw_count(
                &agg,
                geometry_resident(Some(&geometry), |buffer| resident.contains(&buffer)),
            )
        };

        assert_eq!(visible_draw_count(&agg, geometry_resident(None, |_| true)), 0);
        assert_eq!(count(&resident), 0);
        for handle in &handles[..6] {
            resident.insert(*handle);
            assert_eq!(count(&resident), 0);
        }
        resident.insert(handles[6]);
        assert_eq!(count(&resident), 6);
    }
}
