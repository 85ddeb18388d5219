//! glTF 2.0 import into [`SceneData`].
//!
//! Import is best-effort: primitives or images that cannot be used are logged and
//! skipped, and the rest of the document still loads.

use glam::{Mat4, Vec2, Vec3, Vec4};
use gltf::image::Format;
use gltf::mesh::Mode;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::{Material, MeshDraw, PrimitiveGeometry, SceneData, TexturePayload, NO_TEXTURE};
use crate::{AshError, Result};

/// Loads every node of the default scene (or the first scene) of a glTF file.
pub fn load_gltf(path: impl AsRef<Path>) -> Result<SceneData> {
    let path = path.as_ref();
    let (document, buffers, images) = gltf::import(path).map_err(|e| {
        AshError::AssetError(format!("Failed to load glTF {}: {e}", path.display()))
    })?;

    let mut scene = SceneData {
        materials: document.materials().map(convert_material).collect(),
        ..Default::default()
    };
    let srgb_images = color_images(&document);
    scene.textures = convert_images(&images, &srgb_images);

    let Some(root) = document.default_scene().or_else(|| document.scenes().next()) else {
        warn!("{} contains no scenes", path.display());
        return Ok(scene);
    };

    // Primitives shared by several nodes are appended once and drawn many times.
    let mut primitives: HashMap<(usize, usize), Option<MeshDraw>> = HashMap::new();
    let mut default_material = None;
    let mut stack: Vec<(gltf::Node, Mat4)> =
        root.nodes().map(|node| (node, Mat4::IDENTITY)).collect();

    while let Some((node, parent)) = stack.pop() {
        let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());
        stack.extend(node.children().map(|child| (child, world)));

        let Some(mesh) = node.mesh() else {
            continue;
        };
        let transform = scene.local_transforms.len() as u32;
        let mut used_transform = false;

        for primitive in mesh.primitives() {
            let key = (mesh.index(), primitive.index());
            let geometry = match primitives.get(&key) {
                Some(cached) => *cached,
                None => {
                    let appended = append_primitive(&mut scene, &primitive, &buffers);
                    primitives.insert(key, appended);
                    appended
                }
            };
            let Some(mut draw) = geometry else {
                continue;
            };

            draw.material = match primitive.material().index() {
                Some(index) => index as u32,
                None => *default_material.get_or_insert_with(|| {
                    scene.materials.push(Material::default());
                    scene.materials.len() as u32 - 1
                }),
            };
            draw.transform = transform;
            scene.mesh_draws.push(draw);
            used_transform = true;
        }

        if used_transform {
            scene.local_transforms.push(world);
        }
    }

    info!(
        "Loaded {}: {} draws, {} vertices, {} materials, {} textures",
        path.display(),
        scene.mesh_draws.len(),
        scene.vertex_count(),
        scene.materials.len(),
        scene.textures.len()
    );
    Ok(scene)
}

fn append_primitive(
    scene: &mut SceneData,
    primitive: &gltf::Primitive,
    buffers: &[gltf::buffer::Data],
) -> Option<MeshDraw> {
    if primitive.mode() != Mode::Triangles {
        warn!(
            "Skipping primitive {} with unsupported mode {:?}",
            primitive.index(),
            primitive.mode()
        );
        return None;
    }

    let reader = primitive.reader(|buffer| Some(buffers[buffer.index()].0.as_slice()));
    let Some(positions) = reader.read_positions() else {
        warn!("Skipping primitive {} without positions", primitive.index());
        return None;
    };
    let positions: Vec<Vec3> = positions.map(Vec3::from).collect();
    let uvs: Option<Vec<Vec2>> = reader
        .read_tex_coords(0)
        .map(|coords| coords.into_f32().map(Vec2::from).collect());
    let normals: Option<Vec<Vec3>> = reader
        .read_normals()
        .map(|normals| normals.map(Vec3::from).collect());
    let tangents: Option<Vec<Vec4>> = reader
        .read_tangents()
        .map(|tangents| tangents.map(Vec4::from).collect());
    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..positions.len() as u32).collect(),
    };

    if let Some(bad) = indices.iter().find(|&&i| i as usize >= positions.len()) {
        warn!(
            "Skipping primitive {}: index {bad} out of range for {} vertices",
            primitive.index(),
            positions.len()
        );
        return None;
    }

    let draw = scene.push_primitive(
        &PrimitiveGeometry {
            positions: &positions,
            uvs: uvs.as_deref(),
            normals: normals.as_deref(),
            tangents: tangents.as_deref(),
            indices: &indices,
        },
        0,
        0,
    );
    debug!(
        "Primitive {}: {} vertices, {} indices",
        primitive.index(),
        positions.len(),
        indices.len()
    );
    Some(draw)
}

fn texture_source(texture: gltf::Texture) -> u32 {
    texture.source().index() as u32
}

fn convert_material(material: gltf::Material) -> Material {
    let pbr = material.pbr_metallic_roughness();
    Material {
        base_color: pbr.base_color_factor(),
        emissive: material.emissive_factor(),
        metallic: pbr.metallic_factor(),
        roughness: pbr.roughness_factor(),
        occlusion_strength: material
            .occlusion_texture()
            .map_or(1.0, |occlusion| occlusion.strength()),
        alpha_cutoff: match material.alpha_mode() {
            gltf::material::AlphaMode::Mask => material.alpha_cutoff().unwrap_or(0.5),
            _ => 0.0,
        },
        _pad: 0.0,
        albedo_texture: pbr
            .base_color_texture()
            .map_or(NO_TEXTURE, |info| texture_source(info.texture())),
        normal_texture: material
            .normal_texture()
            .map_or(NO_TEXTURE, |normal| texture_source(normal.texture())),
        orm_texture: pbr
            .metallic_roughness_texture()
            .map_or(NO_TEXTURE, |info| texture_source(info.texture())),
        emissive_texture: material
            .emissive_texture()
            .map_or(NO_TEXTURE, |info| texture_source(info.texture())),
    }
}

/// Images referenced as albedo or emissive, which hold sRGB-encoded color.
fn color_images(document: &gltf::Document) -> HashSet<usize> {
    let mut images = HashSet::new();
    for material in document.materials() {
        if let Some(info) = material.pbr_metallic_roughness().base_color_texture() {
            images.insert(info.texture().source().index());
        }
        if let Some(info) = material.emissive_texture() {
            images.insert(info.texture().source().index());
        }
    }
    images
}

fn convert_images(images: &[gltf::image::Data], srgb: &HashSet<usize>) -> Vec<TexturePayload> {
    images
        .par_iter()
        .enumerate()
        .map(|(index, image)| {
            let rgba = to_rgba8(image).unwrap_or_else(|| {
                warn!(
                    "Image {index} has unsupported format {:?}; substituting white",
                    image.format
                );
                vec![255; image.width as usize * image.height as usize * 4]
            });
            TexturePayload {
                name: format!("gltf_image_{index}"),
                width: image.width,
                height: image.height,
                rgba,
                srgb: srgb.contains(&index),
            }
        })
        .collect()
}

fn to_rgba8(image: &gltf::image::Data) -> Option<Vec<u8>> {
    let pixels = &image.pixels;
    let rgba = match image.format {
        Format::R8G8B8A8 => pixels.clone(),
        Format::R8G8B8 => pixels
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
        Format::R8G8 => pixels
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[1], 0, 255])
            .collect(),
        Format::R8 => pixels.iter().flat_map(|&r| [r, r, r, 255]).collect(),
        // 16-bit channels keep their high byte.
        Format::R16G16B16A16 => pixels
            .chunks_exact(8)
            .flat_map(|p| [p[1], p[3], p[5], p[7]])
            .collect(),
        Format::R16G16B16 => pixels
            .chunks_exact(6)
            .flat_map(|p| [p[1], p[3], p[5], 255])
            .collect(),
        _ => return None,
    };
    Some(rgba)
}
