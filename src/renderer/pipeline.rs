//! Graphics and compute pipeline construction for dynamic rendering.

use ash::vk;
use std::sync::Arc;

use super::resources::{Pipeline, PipelineCI};
use crate::vulkan::{DescriptorSetLayout, DescriptorSetLayoutBuilder, ShaderModule};
use crate::{AshError, Result};

/// Builds the pipeline layout: set 0 is the bindless heap, higher sets come from
/// the reflection table, and one push-constant range spans every stage.
fn build_layout(
    device: &Arc<ash::Device>,
    bindless_layout: vk::DescriptorSetLayout,
    ci: &PipelineCI,
) -> Result<(vk::PipelineLayout, Vec<DescriptorSetLayout>)> {
    let mut owned = Vec::new();
    let mut handles = vec![bindless_layout];
    let highest = ci.reflection.highest_set().unwrap_or(0);
    for set in 1..=highest {
        let mut builder = DescriptorSetLayoutBuilder::new();
        if let Some((_, bindings)) = ci.reflection.sets().find(|(index, _)| *index == set) {
            for binding in bindings {
                builder = builder.add_binding(
                    binding.binding,
                    binding.descriptor_type,
                    binding.stages,
                    binding.count.max(1),
                );
            }
        }
        // Gaps still need a (possibly empty) layout to keep set numbering.
        let layout = builder.build(Arc::clone(device))?;
        handles.push(layout.handle());
        owned.push(layout);
    }

    let stage_flags = if ci.is_compute() {
        vk::ShaderStageFlags::COMPUTE
    } else {
        vk::ShaderStageFlags::ALL_GRAPHICS
    };
    let ranges = [vk::PushConstantRange {
        stage_flags,
        offset: 0,
        size: ci.push_constant_size,
    }];
    let info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&handles)
        .push_constant_ranges(if ci.push_constant_size > 0 {
            &ranges[..]
        } else {
            &[]
        });
    let layout = unsafe { device.create_pipeline_layout(&info, None) }
        .map_err(|e| AshError::VulkanError(format!("Failed to create pipeline layout: {e:?}")))?;
    Ok((layout, owned))
}

pub(crate) fn create_pipeline(
    device: &Arc<ash::Device>,
    cache: vk::PipelineCache,
    bindless_layout: vk::DescriptorSetLayout,
    ci: &PipelineCI,
) -> Result<Pipeline> {
    if ci.stages.is_empty() {
        return Err(AshError::ShaderError(format!(
            "Pipeline '{}' has no shader stages",
            ci.debug_name
        )));
    }

    let (layout, set_layouts) = build_layout(device, bindless_layout, ci)?;
    let modules = ci
        .stages
        .iter()
        .map(|blob| ShaderModule::new(Arc::clone(device), blob))
        .collect::<Result<Vec<_>>>();
    let modules = match modules {
        Ok(modules) => modules,
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            return Err(e);
        }
    };
    let stages: Vec<_> = ci
        .stages
        .iter()
        .zip(&modules)
        .map(|(blob, module)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(blob.stage)
                .module(module.handle())
                .name(&blob.entry_point)
        })
        .collect();

    let (created, bind_point) = if ci.is_compute() {
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stages[0])
            .layout(layout);
        let result = unsafe { device.create_compute_pipelines(cache, &[info], None) };
        (result, vk::PipelineBindPoint::COMPUTE)
    } else {
        (
            create_graphics(device, cache, layout, &stages, ci),
            vk::PipelineBindPoint::GRAPHICS,
        )
    };

    match created {
        Ok(pipelines) => {
            log::debug!("Created pipeline '{}'", ci.debug_name);
            Ok(Pipeline {
                raw: pipelines[0],
                layout,
                bind_point,
                set_layouts,
                name: ci.debug_name.clone(),
            })
        }
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(AshError::VulkanError(format!(
                "Failed to create pipeline '{}': {e:?}",
                ci.debug_name
            )))
        }
    }
}

fn create_graphics(
    device: &ash::Device,
    cache: vk::PipelineCache,
    layout: vk::PipelineLayout,
    stages: &[vk::PipelineShaderStageCreateInfo],
    ci: &PipelineCI,
) -> std::result::Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)> {
    let bindings: Vec<_> = ci
        .vertex_streams
        .iter()
        .map(|stream| vk::VertexInputBindingDescription {
            binding: stream.binding,
            stride: stream.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        })
        .collect();
    let attributes: Vec<_> = ci
        .vertex_streams
        .iter()
        .map(|stream| vk::VertexInputAttributeDescription {
            location: stream.location,
            binding: stream.binding,
            format: stream.format,
            offset: 0,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(ci.topology);
    let viewport = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let mut raster = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(ci.raster.cull_mode)
        .front_face(ci.raster.front_face)
        .depth_clamp_enable(ci.raster.depth_clamp)
        .line_width(1.0);
    if let Some(bias) = ci.raster.depth_bias {
        raster = raster
            .depth_bias_enable(true)
            .depth_bias_constant_factor(bias.constant)
            .depth_bias_slope_factor(bias.slope)
            .depth_bias_clamp(bias.clamp);
    }

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(ci.depth.test)
        .depth_write_enable(ci.depth.write)
        .depth_compare_op(ci.depth.compare_op);

    let blend_attachments: Vec<_> = ci
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
        })
        .collect();
    let blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let mut rendering = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&ci.color_formats)
        .depth_attachment_format(ci.depth_format.unwrap_or(vk::Format::UNDEFINED));

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&raster)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth)
        .color_blend_state(&blend)
        .dynamic_state(&dynamic)
        .layout(layout)
        .push_next(&mut rendering);

    unsafe { device.create_graphics_pipelines(cache, &[info], None) }
}

/// Destroys a pipeline together with its layout; set layouts drop with the value.
pub(crate) fn destroy_pipeline(device: &ash::Device, pipeline: Pipeline) {
    unsafe {
        device.destroy_pipeline(pipeline.raw, None);
        device.destroy_pipeline_layout(pipeline.layout, None);
    }
}
