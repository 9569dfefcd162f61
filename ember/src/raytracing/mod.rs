//! Ray tracing: acceleration structures, pipelines and shader binding
//! tables.

mod accel;
mod pipeline;

pub use accel::{
    AccelerationStructure, Geometry, GeometryInstance, GeometryStore, IDENTITY_TRANSFORM,
};
pub use pipeline::{
    RayCount, RayTracingPipeline, RayTracingShader, SbtEntry, ShaderBindingTable,
    ShaderBindingTableRegion, ShaderBindings, TraceRaysCommand, TraceRaysIndirectCommand,
    EMPTY_SBT_GROUP,
};

use std::any::Any;
use std::ffi::{c_void, CStr};

use ash::vk;

use crate::context::{ContextHandle, Device, Extension};
use crate::error::{invalid_argument, Result};

pub(crate) const EXTENSION_NAME: &str = "RayTracing";
const LEGACY_EXTENSION_NAME: &str = "Raytracing";

/// Optional ray tracing features of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingFeatures {
    /// Ray queries from compute shaders.
    pub query: bool,
    /// Dedicated ray tracing pipelines.
    pub pipeline: bool,
    /// Indirect trace-rays dispatch.
    pub indirect_dispatch: bool,
    /// Intersection position fetch in hit shaders.
    pub position_fetch: bool,
    /// Hit objects and invocation reordering.
    pub hit_objects: bool,
}

/// Device limits specific to ray tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayTracingProperties {
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    pub max_acceleration_structures: u32,
    pub max_ray_recursion_depth: u32,
    pub max_ray_dispatch_count: u32,
    pub max_shader_record_size: u32,
    pub can_reorder: bool,
}

/// Shader-binding-table layout requirements of the device.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SbtAlignments {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
}

/// Queries the ray tracing features supported by the device.
pub fn get_ray_tracing_features(device: &Device) -> RayTracingFeatures {
    let mut reorder = vk::PhysicalDeviceRayTracingInvocationReorderFeaturesNV::default();
    let mut position_fetch = vk::PhysicalDeviceRayTracingPositionFetchFeaturesKHR::default();
    let mut rt_pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
    let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut reorder)
        .push_next(&mut position_fetch)
        .push_next(&mut rt_pipeline)
        .push_next(&mut ray_query)
        .push_next(&mut accel);
    unsafe {
        device
            .instance
            .raw
            .get_physical_device_features2(device.physical, &mut features)
    };

    if accel.acceleration_structure != vk::TRUE {
        return RayTracingFeatures::default();
    }
    RayTracingFeatures {
        query: ray_query.ray_query == vk::TRUE,
        pipeline: rt_pipeline.ray_tracing_pipeline == vk::TRUE,
        indirect_dispatch: rt_pipeline.ray_tracing_pipeline_trace_rays_indirect == vk::TRUE,
        position_fetch: position_fetch.ray_tracing_position_fetch == vk::TRUE,
        hit_objects: reorder.ray_tracing_invocation_reorder == vk::TRUE,
    }
}

/// Whether the device supports all of the given features.
pub fn is_ray_tracing_supported(device: &Device, features: RayTracingFeatures) -> bool {
    let supported = get_ray_tracing_features(device);
    if !supported.query && !supported.pipeline {
        return false;
    }
    (!features.query || supported.query)
        && (!features.pipeline || supported.pipeline)
        && (!features.indirect_dispatch || supported.indirect_dispatch)
        && (!features.position_fetch || supported.position_fetch)
        && (!features.hit_objects || supported.hit_objects)
}

/// Queries the ray tracing properties of the device.
pub fn get_ray_tracing_properties(device: &Device) -> RayTracingProperties {
    let supported = get_ray_tracing_features(device);

    let mut reorder = vk::PhysicalDeviceRayTracingInvocationReorderPropertiesNV::default();
    let mut rt_pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut accel = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut props = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut reorder)
        .push_next(&mut rt_pipeline)
        .push_next(&mut accel);
    unsafe {
        device
            .instance
            .raw
            .get_physical_device_properties2(device.physical, &mut props)
    };

    // Values are undefined for unsupported extensions.
    let mut result = RayTracingProperties::default();
    if supported.query || supported.pipeline {
        result.max_geometry_count = accel.max_geometry_count;
        result.max_instance_count = accel.max_instance_count;
        result.max_primitive_count = accel.max_primitive_count;
        result.max_acceleration_structures = accel
            .max_descriptor_set_acceleration_structures
            .min(accel.max_per_stage_descriptor_acceleration_structures);
    }
    if supported.pipeline {
        result.max_ray_recursion_depth = rt_pipeline.max_ray_recursion_depth;
        result.max_ray_dispatch_count = rt_pipeline.max_ray_dispatch_invocation_count;
        result.max_shader_record_size =
            rt_pipeline.max_shader_group_stride - rt_pipeline.shader_group_handle_size;
    }
    if supported.hit_objects {
        result.can_reorder = reorder.ray_tracing_invocation_reorder_reordering_hint
            == vk::RayTracingInvocationReorderModeNV::REORDER;
    }
    result
}

fn query_sbt_alignments(instance: &ash::Instance, device: vk::PhysicalDevice) -> SbtAlignments {
    let mut rt_pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_pipeline);
    unsafe { instance.get_physical_device_properties2(device, &mut props) };
    SbtAlignments {
        handle_size: rt_pipeline.shader_group_handle_size,
        handle_alignment: rt_pipeline.shader_group_handle_alignment,
        base_alignment: rt_pipeline.shader_group_base_alignment,
    }
}

pub(crate) struct RayTracingExtension {
    name: &'static str,
    features: RayTracingFeatures,
    pub props: RayTracingProperties,
    pub sbt: SbtAlignments,
}

impl Extension for RayTracingExtension {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_device_supported(&self, device: &Device) -> bool {
        is_ray_tracing_supported(device, self.features)
    }

    fn device_extensions(&self) -> Vec<&'static CStr> {
        let mut extensions = vec![
            ash::khr::acceleration_structure::NAME,
            ash::khr::deferred_host_operations::NAME,
        ];
        if self.features.query {
            extensions.push(ash::khr::ray_query::NAME);
        }
        if self.features.pipeline {
            extensions.push(ash::khr::ray_tracing_pipeline::NAME);
        }
        if self.features.position_fetch {
            extensions.push(ash::khr::ray_tracing_position_fetch::NAME);
        }
        if self.features.hit_objects {
            extensions.push(ash::nv::ray_tracing_invocation_reorder::NAME);
        }
        extensions
    }

    unsafe fn chain_features(
        &self,
        mut head: *mut c_void,
        keep: &mut Vec<Box<dyn Any>>,
    ) -> *mut c_void {
        let mut accel = Box::new(
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                .acceleration_structure(true),
        );
        accel.p_next = head;
        head = accel.as_mut() as *mut _ as *mut c_void;
        keep.push(accel);

        if self.features.query {
            let mut query =
                Box::new(vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true));
            query.p_next = head;
            head = query.as_mut() as *mut _ as *mut c_void;
            keep.push(query);
        }
        if self.features.pipeline {
            let mut pipeline = Box::new(
                vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
                    .ray_tracing_pipeline(true)
                    .ray_tracing_pipeline_trace_rays_indirect(self.features.indirect_dispatch),
            );
            pipeline.p_next = head;
            head = pipeline.as_mut() as *mut _ as *mut c_void;
            keep.push(pipeline);
        }
        if self.features.position_fetch {
            let mut fetch = Box::new(
                vk::PhysicalDeviceRayTracingPositionFetchFeaturesKHR::default()
                    .ray_tracing_position_fetch(true),
            );
            fetch.p_next = head;
            head = fetch.as_mut() as *mut _ as *mut c_void;
            keep.push(fetch);
        }
        if self.features.hit_objects {
            let mut reorder = Box::new(
                vk::PhysicalDeviceRayTracingInvocationReorderFeaturesNV::default()
                    .ray_tracing_invocation_reorder(true),
            );
            reorder.p_next = head;
            head = reorder.as_mut() as *mut _ as *mut c_void;
            keep.push(reorder);
        }
        head
    }

    fn finalize(&mut self, instance: &ash::Instance, device: vk::PhysicalDevice) {
        // Device limits are queried once and cached for pipeline and SBT
        // creation.
        self.sbt = query_sbt_alignments(instance, device);
        self.props = raw_properties(instance, device, self.features);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn raw_properties(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    features: RayTracingFeatures,
) -> RayTracingProperties {
    let mut reorder = vk::PhysicalDeviceRayTracingInvocationReorderPropertiesNV::default();
    let mut rt_pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut accel = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut props = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut reorder)
        .push_next(&mut rt_pipeline)
        .push_next(&mut accel);
    unsafe { instance.get_physical_device_properties2(device, &mut props) };

    let mut result = RayTracingProperties {
        max_geometry_count: accel.max_geometry_count,
        max_instance_count: accel.max_instance_count,
        max_primitive_count: accel.max_primitive_count,
        max_acceleration_structures: accel
            .max_descriptor_set_acceleration_structures
            .min(accel.max_per_stage_descriptor_acceleration_structures),
        ..Default::default()
    };
    if features.pipeline {
        result.max_ray_recursion_depth = rt_pipeline.max_ray_recursion_depth;
        result.max_ray_dispatch_count = rt_pipeline.max_ray_dispatch_invocation_count;
        result.max_shader_record_size =
            rt_pipeline.max_shader_group_stride - rt_pipeline.shader_group_handle_size;
    }
    if features.hit_objects {
        result.can_reorder = reorder.ray_tracing_invocation_reorder_reordering_hint
            == vk::RayTracingInvocationReorderModeNV::REORDER;
    }
    result
}

/// Creates an extension enabling the given ray tracing features.
pub fn ray_tracing_extension(features: RayTracingFeatures) -> Box<dyn Extension> {
    Box::new(RayTracingExtension {
        name: EXTENSION_NAME,
        features,
        props: RayTracingProperties::default(),
        sbt: SbtAlignments::default(),
    })
}

/// Creates the query-only ray tracing extension (acceleration structures
/// and ray queries, no dedicated pipelines).
pub fn raytracing_extension() -> Box<dyn Extension> {
    Box::new(RayTracingExtension {
        name: LEGACY_EXTENSION_NAME,
        features: RayTracingFeatures {
            query: true,
            ..Default::default()
        },
        props: RayTracingProperties::default(),
        sbt: SbtAlignments::default(),
    })
}

/// Whether any ray tracing flavor is enabled on the context.
pub fn is_ray_tracing_enabled(context: &ContextHandle) -> bool {
    context.is_extension_enabled(EXTENSION_NAME)
        || context.is_extension_enabled(LEGACY_EXTENSION_NAME)
}

/// Features enabled on the context, all false when ray tracing is off.
pub fn get_enabled_ray_tracing(context: &ContextHandle) -> RayTracingFeatures {
    rt_extension(context)
        .map(|ext| ext.features)
        .unwrap_or_default()
}

/// Cached properties of the context's device; zeroed when ray tracing is
/// not enabled.
pub fn get_current_ray_tracing_properties(context: &ContextHandle) -> RayTracingProperties {
    rt_extension(context)
        .map(|ext| ext.props)
        .unwrap_or_default()
}

pub(crate) fn rt_extension(context: &ContextHandle) -> Option<&RayTracingExtension> {
    context
        .extension::<RayTracingExtension>(EXTENSION_NAME)
        .or_else(|| context.extension::<RayTracingExtension>(LEGACY_EXTENSION_NAME))
}

pub(crate) fn require_accel(
    context: &ContextHandle,
) -> Result<&ash::khr::acceleration_structure::Device> {
    context.accel_loader.as_ref().ok_or_else(|| {
        invalid_argument("the context was created without a ray tracing extension")
    })
}
