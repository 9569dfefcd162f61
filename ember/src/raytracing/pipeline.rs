//! Ray-tracing pipelines and shader binding tables.

use std::ffi::CString;

use ash::vk;

use crate::alloc::{AllocFlags, BufferAlloc};
use crate::bindings::{collect_writes, BindingMap, BindingTarget};
use crate::buffer::Tensor;
use crate::command::{Command, CommandRecorder};
use crate::context::ContextHandle;
use crate::error::{invalid_argument, Error, Result};
use crate::reflect::{self, LayoutBuilder, ShaderStage};

use super::{rt_extension, RayTracingExtension, EXTENSION_NAME};

/// Marks an SBT entry whose handle should stay zeroed.
pub const EMPTY_SBT_GROUP: u32 = u32::MAX;

fn all_ray_tracing_stages() -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::RAYGEN_KHR
        | vk::ShaderStageFlags::ANY_HIT_KHR
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        | vk::ShaderStageFlags::MISS_KHR
        | vk::ShaderStageFlags::INTERSECTION_KHR
        | vk::ShaderStageFlags::CALLABLE_KHR
}

/// Shader variants a ray tracing pipeline is assembled from. Every
/// variant becomes one shader group in declaration order.
#[derive(Debug, Clone, Copy)]
pub enum RayTracingShader<'a> {
    RayGen { code: &'a [u32] },
    Miss { code: &'a [u32] },
    Hit { closest: &'a [u32], any: Option<&'a [u32]> },
    Callable { code: &'a [u32] },
}

/// References a region inside a shader binding table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderBindingTableRegion {
    pub address: u64,
    pub stride: u32,
    pub count: u32,
}

impl ShaderBindingTableRegion {
    fn as_vk(self) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: self.address,
            stride: self.stride as u64,
            size: self.stride as u64 * self.count as u64,
        }
    }
}

/// One entry of the entry-form SBT: a group handle plus an optional
/// shader record the shader can read.
#[derive(Debug, Clone, Copy)]
pub struct SbtEntry<'a> {
    /// Index of the shader group, or [`EMPTY_SBT_GROUP`] for a zeroed
    /// handle.
    pub group_index: u32,
    pub shader_record: &'a [u8],
}

/// Device buffer holding `(group handle, record)` entries.
pub struct ShaderBindingTable {
    context: ContextHandle,
    buffer: BufferAlloc,
    region: ShaderBindingTableRegion,
}

impl ShaderBindingTable {
    pub fn region(&self) -> ShaderBindingTableRegion {
        self.region
    }
}

impl From<&ShaderBindingTable> for ShaderBindingTableRegion {
    fn from(table: &ShaderBindingTable) -> Self {
        table.region
    }
}

impl Drop for ShaderBindingTable {
    fn drop(&mut self) {
        self.context
            .allocator
            .destroy_buffer(&self.context.device, &mut self.buffer);
    }
}

impl std::fmt::Debug for ShaderBindingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderBindingTable")
            .field("stride", &self.region.stride)
            .field("count", &self.region.count)
            .finish()
    }
}

/// The SBT regions consulted while tracing rays.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderBindings {
    pub ray_gen: ShaderBindingTableRegion,
    pub miss: ShaderBindingTableRegion,
    pub hit: ShaderBindingTableRegion,
    pub callable: ShaderBindingTableRegion,
}

/// Rays to dispatch in each dimension.
#[derive(Debug, Clone, Copy)]
pub struct RayCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Default for RayCount {
    fn default() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }
}

const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Copies `count` handles starting at `first` into entries of
/// `entry_size` bytes, zeroing the padding.
fn fill_sbt_range(
    dst: &mut [u8],
    handles: &[u8],
    handle_size: usize,
    entry_size: usize,
    first: usize,
    count: usize,
) {
    for entry in 0..count {
        let handle = &handles[(first + entry) * handle_size..(first + entry + 1) * handle_size];
        let slot = &mut dst[entry * entry_size..(entry + 1) * entry_size];
        slot[..handle_size].copy_from_slice(handle);
        slot[handle_size..].fill(0);
    }
}

/// Writes handle + record per entry, zero-padding the rest of each slot.
fn fill_sbt_entries(
    dst: &mut [u8],
    handles: &[u8],
    handle_size: usize,
    entry_size: usize,
    handle_count: usize,
    entries: &[SbtEntry<'_>],
) -> Result<()> {
    for (index, entry) in entries.iter().enumerate() {
        let slot = &mut dst[index * entry_size..(index + 1) * entry_size];
        if entry.group_index == EMPTY_SBT_GROUP {
            slot[..handle_size].fill(0);
        } else {
            let group = entry.group_index as usize;
            if group >= handle_count {
                return Err(invalid_argument(format!(
                    "shader group {group} is out of range, the pipeline has {handle_count} groups"
                )));
            }
            slot[..handle_size]
                .copy_from_slice(&handles[group * handle_size..(group + 1) * handle_size]);
        }
        let record_end = handle_size + entry.shader_record.len();
        slot[handle_size..record_end].copy_from_slice(entry.shader_record);
        slot[record_end..].fill(0);
    }
    Ok(())
}

/// A pipeline assembled from ray tracing shader groups.
pub struct RayTracingPipeline {
    context: ContextHandle,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: Option<vk::DescriptorSetLayout>,
    set: u32,
    push_stages: vk::ShaderStageFlags,
    bindings: BindingMap,
    handle_storage: Vec<u8>,
    handle_count: u32,
    max_ray_dispatch: u32,
}

impl RayTracingPipeline {
    pub fn new(
        context: &ContextHandle,
        shaders: &[RayTracingShader<'_>],
        max_recursion_depth: u32,
    ) -> Result<Self> {
        Self::with_specialization(context, shaders, &[], max_recursion_depth)
    }

    pub fn with_specialization(
        context: &ContextHandle,
        shaders: &[RayTracingShader<'_>],
        specialization: &[u8],
        max_recursion_depth: u32,
    ) -> Result<Self> {
        let ext: &RayTracingExtension = context
            .extension(EXTENSION_NAME)
            .ok_or_else(|| invalid_argument("the RayTracing extension is not enabled"))?;
        let loader = context.rt_pipeline_loader.as_ref().ok_or_else(|| {
            invalid_argument("ray tracing pipelines are not enabled on this context")
        })?;
        if max_recursion_depth > ext.props.max_ray_recursion_depth {
            return Err(invalid_argument(format!(
                "max recursion depth {max_recursion_depth} exceeds the device limit {}",
                ext.props.max_ray_recursion_depth
            )));
        }

        struct StageRecord {
            module: vk::ShaderModule,
            entry: CString,
            stage: vk::ShaderStageFlags,
        }

        let device = &context.device;
        let mut builder = LayoutBuilder::new();
        let mut records: Vec<StageRecord> = Vec::new();
        let mut groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR<'_>> = Vec::new();

        let destroy_modules = |device: &ash::Device, records: &[StageRecord]| unsafe {
            for record in records {
                device.destroy_shader_module(record.module, None);
            }
        };

        let mut add_stage = |builder: &mut LayoutBuilder,
                             records: &mut Vec<StageRecord>,
                             code: &[u32],
                             stage: vk::ShaderStageFlags,
                             expected: ShaderStage|
         -> Result<u32> {
            let module_info = reflect::reflect(code)?;
            if module_info.stage != expected {
                return Err(invalid_argument(format!(
                    "shader declares a {:?} entry point where {expected:?} was expected",
                    module_info.stage
                )));
            }
            builder.add(&module_info, stage)?;
            let info = vk::ShaderModuleCreateInfo::default().code(code);
            let module = unsafe { device.create_shader_module(&info, None) }
                .map_err(Error::from)?;
            let entry = CString::new(module_info.entry_point.as_str())
                .map_err(|_| invalid_argument("entry point name contains a nul byte"))?;
            records.push(StageRecord { module, entry, stage });
            Ok(records.len() as u32 - 1)
        };

        let general_group = |shader: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(shader)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
        };

        let assembled = (|| -> Result<()> {
            for shader in shaders {
                match shader {
                    RayTracingShader::RayGen { code } => {
                        let index = add_stage(
                            &mut builder,
                            &mut records,
                            code,
                            vk::ShaderStageFlags::RAYGEN_KHR,
                            ShaderStage::RayGeneration,
                        )?;
                        groups.push(general_group(index));
                    }
                    RayTracingShader::Miss { code } => {
                        let index = add_stage(
                            &mut builder,
                            &mut records,
                            code,
                            vk::ShaderStageFlags::MISS_KHR,
                            ShaderStage::Miss,
                        )?;
                        groups.push(general_group(index));
                    }
                    RayTracingShader::Callable { code } => {
                        let index = add_stage(
                            &mut builder,
                            &mut records,
                            code,
                            vk::ShaderStageFlags::CALLABLE_KHR,
                            ShaderStage::Callable,
                        )?;
                        groups.push(general_group(index));
                    }
                    RayTracingShader::Hit { closest, any } => {
                        let closest_index = add_stage(
                            &mut builder,
                            &mut records,
                            closest,
                            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                            ShaderStage::ClosestHit,
                        )?;
                        let mut group = vk::RayTracingShaderGroupCreateInfoKHR::default()
                            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                            .general_shader(vk::SHADER_UNUSED_KHR)
                            .closest_hit_shader(closest_index)
                            .any_hit_shader(vk::SHADER_UNUSED_KHR)
                            .intersection_shader(vk::SHADER_UNUSED_KHR);
                        if let Some(any) = any {
                            let any_index = add_stage(
                                &mut builder,
                                &mut records,
                                any,
                                vk::ShaderStageFlags::ANY_HIT_KHR,
                                ShaderStage::AnyHit,
                            )?;
                            group = group.any_hit_shader(any_index);
                        }
                        groups.push(group);
                    }
                }
            }
            Ok(())
        })();
        if let Err(err) = assembled {
            destroy_modules(device, &records);
            return Err(err);
        }

        let set_layout = match builder.create_set_layout(device) {
            Ok(layout) => layout,
            Err(err) => {
                destroy_modules(device, &records);
                return Err(err);
            }
        };
        let layout = match builder.create_pipeline_layout(device, set_layout) {
            Ok(layout) => layout,
            Err(err) => {
                if let Some(set_layout) = set_layout {
                    unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                }
                destroy_modules(device, &records);
                return Err(err);
            }
        };

        let entries = builder.specialization_entries(specialization.len());
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&entries)
            .data(specialization);
        let stages: Vec<vk::PipelineShaderStageCreateInfo<'_>> = records
            .iter()
            .map(|record| {
                let mut stage = vk::PipelineShaderStageCreateInfo::default()
                    .stage(record.stage)
                    .module(record.module)
                    .name(&record.entry);
                if !entries.is_empty() {
                    stage = stage.specialization_info(&spec_info);
                }
                stage
            })
            .collect();

        let created = {
            let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
                .stages(&stages)
                .groups(&groups)
                .max_pipeline_ray_recursion_depth(max_recursion_depth)
                .layout(layout);
            unsafe {
                loader.create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    context.pipeline_cache,
                    &[pipeline_info],
                    None,
                )
            }
        };
        destroy_modules(device, &records);
        let pipeline = match created {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                    if let Some(set_layout) = set_layout {
                        device.destroy_descriptor_set_layout(set_layout, None);
                    }
                }
                return Err(err.into());
            }
        };

        // The group handle blob is fetched once; SBTs copy out of it.
        let handle_count = groups.len() as u32;
        let handle_size = ext.sbt.handle_size as usize;
        let fetched = unsafe {
            loader.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                handle_count,
                handle_size * handle_count as usize,
            )
        };
        let handle_storage = match fetched {
            Ok(storage) => storage,
            Err(err) => {
                unsafe {
                    device.destroy_pipeline(pipeline, None);
                    device.destroy_pipeline_layout(layout, None);
                    if let Some(set_layout) = set_layout {
                        device.destroy_descriptor_set_layout(set_layout, None);
                    }
                }
                return Err(err.into());
            }
        };

        Ok(Self {
            context: context.clone(),
            pipeline,
            layout,
            set_layout,
            set: builder.set,
            push_stages: builder.push_stages,
            bindings: BindingMap::new(builder.sorted_traits()),
            handle_storage,
            handle_count,
            max_ray_dispatch: ext.props.max_ray_dispatch_count,
        })
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn group_count(&self) -> u32 {
        self.handle_count
    }

    fn sbt_alignments(&self) -> Result<(u32, u32, u32)> {
        let ext = rt_extension(&self.context)
            .ok_or_else(|| invalid_argument("the RayTracing extension is not enabled"))?;
        Ok((
            ext.sbt.handle_size,
            ext.sbt.handle_alignment,
            ext.sbt.base_alignment,
        ))
    }

    fn create_sbt_buffer(&self, size: u64, base_alignment: u32) -> Result<BufferAlloc> {
        let buffer = self.context.allocator.create_buffer_aligned(
            &self.context.device,
            size,
            base_alignment as u64,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            AllocFlags::HOST_ACCESS_SEQUENTIAL_WRITE | AllocFlags::MAPPED,
        )?;
        if !buffer.allocation.is_mapped() {
            let mut buffer = buffer;
            self.context
                .allocator
                .destroy_buffer(&self.context.device, &mut buffer);
            return Err(Error::OutOfDeviceMemory);
        }
        Ok(buffer)
    }

    fn finish_sbt(
        &self,
        mut buffer: BufferAlloc,
        stride: u32,
        count: u32,
    ) -> Result<ShaderBindingTable> {
        if let Err(err) =
            self.context
                .allocator
                .flush(&self.context.device, &buffer.allocation, 0, vk::WHOLE_SIZE)
        {
            self.context
                .allocator
                .destroy_buffer(&self.context.device, &mut buffer);
            return Err(err);
        }
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer.buffer);
        let address = unsafe { self.context.device.get_buffer_device_address(&info) };
        Ok(ShaderBindingTable {
            context: self.context.clone(),
            buffer,
            region: ShaderBindingTableRegion {
                address,
                stride,
                count,
            },
        })
    }

    /// SBT over a contiguous range of shader groups, handles only.
    pub fn create_shader_binding_table(
        &self,
        first_group: u32,
        count: u32,
    ) -> Result<ShaderBindingTable> {
        if first_group + count > self.handle_count {
            return Err(invalid_argument(format!(
                "groups {first_group}..{} exceed the {} groups of this pipeline",
                first_group + count,
                self.handle_count
            )));
        }
        let (handle_size, handle_alignment, base_alignment) = self.sbt_alignments()?;
        let entry_size = align_up(handle_size, handle_alignment);

        let buffer = self.create_sbt_buffer(entry_size as u64 * count as u64, base_alignment)?;
        let data = unsafe {
            std::slice::from_raw_parts_mut(
                buffer.allocation.mapped,
                entry_size as usize * count as usize,
            )
        };
        fill_sbt_range(
            data,
            &self.handle_storage,
            handle_size as usize,
            entry_size as usize,
            first_group as usize,
            count as usize,
        );
        self.finish_sbt(buffer, entry_size, count)
    }

    /// SBT from explicit entries carrying shader records. The stride is
    /// sized for the largest record, padded to the handle alignment.
    pub fn create_shader_binding_table_entries(
        &self,
        entries: &[SbtEntry<'_>],
    ) -> Result<ShaderBindingTable> {
        let (handle_size, handle_alignment, base_alignment) = self.sbt_alignments()?;
        let max_record = entries
            .iter()
            .map(|entry| entry.shader_record.len())
            .max()
            .unwrap_or(0);
        let entry_size = align_up(handle_size + max_record as u32, handle_alignment);
        let count = entries.len() as u32;

        let buffer = self.create_sbt_buffer(
            (entry_size as u64 * count as u64).max(entry_size as u64),
            base_alignment,
        )?;
        let data = unsafe {
            std::slice::from_raw_parts_mut(
                buffer.allocation.mapped,
                entry_size as usize * count as usize,
            )
        };
        if let Err(err) = fill_sbt_entries(
            data,
            &self.handle_storage,
            handle_size as usize,
            entry_size as usize,
            self.handle_count as usize,
            entries,
        ) {
            let mut buffer = buffer;
            self.context
                .allocator
                .destroy_buffer(&self.context.device, &mut buffer);
            return Err(err);
        }
        self.finish_sbt(buffer, entry_size, count)
    }

    /// Prepares a trace; fails when bindings are unbound or the total ray
    /// count exceeds the device limit.
    pub fn trace_rays<'a>(
        &'a self,
        shader_bindings: ShaderBindings,
        ray_count: RayCount,
        push: &'a [u8],
    ) -> Result<TraceRaysCommand<'a>> {
        self.bindings.check_all_bound()?;
        let total = ray_count.x as u64 * ray_count.y as u64 * ray_count.z as u64;
        if total > self.max_ray_dispatch as u64 {
            return Err(invalid_argument(format!(
                "total ray count {total} exceeds the device limit {}",
                self.max_ray_dispatch
            )));
        }
        Ok(TraceRaysCommand {
            pipeline: self,
            shader_bindings,
            ray_count,
            push,
        })
    }

    /// Prepares an indirect trace reading `x, y, z` from the tensor.
    pub fn trace_rays_indirect<'a>(
        &'a self,
        shader_bindings: ShaderBindings,
        tensor: &'a Tensor,
        offset: u64,
        push: &'a [u8],
    ) -> Result<TraceRaysIndirectCommand<'a>> {
        self.bindings.check_all_bound()?;
        if offset + 12 > tensor.size_bytes() {
            return Err(invalid_argument(
                "indirect trace parameters exceed the tensor",
            ));
        }
        Ok(TraceRaysIndirectCommand {
            pipeline: self,
            shader_bindings,
            tensor,
            offset,
            push,
        })
    }

    fn record_bind(&self, cmd: &mut CommandRecorder<'_>, push: &[u8]) -> Result<()> {
        let device = &cmd.context.device;
        unsafe {
            device.cmd_bind_pipeline(
                cmd.buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline,
            );
        }
        if !self.bindings.traits().is_empty() {
            let writes = collect_writes(&self.bindings)?;
            unsafe {
                cmd.context.push_descriptor.cmd_push_descriptor_set(
                    cmd.buffer,
                    vk::PipelineBindPoint::RAY_TRACING_KHR,
                    self.layout,
                    self.set,
                    &writes.writes,
                );
            }
        }
        if !push.is_empty() {
            let stages = if self.push_stages.is_empty() {
                all_ray_tracing_stages()
            } else {
                self.push_stages
            };
            unsafe {
                device.cmd_push_constants(cmd.buffer, self.layout, stages, 0, push);
            }
        }
        Ok(())
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_pipeline(self.pipeline, None);
            self.context.device.destroy_pipeline_layout(self.layout, None);
            if let Some(set_layout) = self.set_layout {
                self.context
                    .device
                    .destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}

impl std::fmt::Debug for RayTracingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayTracingPipeline")
            .field("groups", &self.handle_count)
            .finish()
    }
}

impl BindingTarget for RayTracingPipeline {
    fn binding_map(&self) -> &BindingMap {
        &self.bindings
    }

    fn binding_map_mut(&mut self) -> &mut BindingMap {
        &mut self.bindings
    }
}

/// Issues rays against the bound pipeline.
pub struct TraceRaysCommand<'a> {
    pipeline: &'a RayTracingPipeline,
    pub shader_bindings: ShaderBindings,
    pub ray_count: RayCount,
    push: &'a [u8],
}

impl Command for TraceRaysCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.pipeline.context())?;
        let loader = cmd.context.rt_pipeline_loader.as_ref().ok_or_else(|| {
            invalid_argument("ray tracing pipelines are not enabled on this context")
        })?;
        cmd.stage_mask |= vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;
        self.pipeline.record_bind(cmd, self.push)?;

        unsafe {
            loader.cmd_trace_rays(
                cmd.buffer,
                &self.shader_bindings.ray_gen.as_vk(),
                &self.shader_bindings.miss.as_vk(),
                &self.shader_bindings.hit.as_vk(),
                &self.shader_bindings.callable.as_vk(),
                self.ray_count.x,
                self.ray_count.y,
                self.ray_count.z,
            );
        }
        Ok(())
    }
}

/// Issues rays with the dispatch size read from a tensor.
pub struct TraceRaysIndirectCommand<'a> {
    pipeline: &'a RayTracingPipeline,
    pub shader_bindings: ShaderBindings,
    tensor: &'a Tensor,
    offset: u64,
    push: &'a [u8],
}

impl Command for TraceRaysIndirectCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.pipeline.context())?;
        let loader = cmd.context.rt_pipeline_loader.as_ref().ok_or_else(|| {
            invalid_argument("ray tracing pipelines are not enabled on this context")
        })?;
        cmd.stage_mask |= vk::PipelineStageFlags::DRAW_INDIRECT
            | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;
        self.pipeline.record_bind(cmd, self.push)?;

        // The 12-byte count record must be complete before the indirect
        // read.
        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::INDIRECT_COMMAND_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.tensor.vk_buffer())
            .offset(self.offset)
            .size(12);
        unsafe {
            cmd.context.device.cmd_pipeline_barrier(
                cmd.buffer,
                vk::PipelineStageFlags::TRANSFER
                    | vk::PipelineStageFlags::COMPUTE_SHADER
                    | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::PipelineStageFlags::DRAW_INDIRECT,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
            loader.cmd_trace_rays_indirect(
                cmd.buffer,
                &self.shader_bindings.ray_gen.as_vk(),
                &self.shader_bindings.miss.as_vk(),
                &self.shader_bindings.hit.as_vk(),
                &self.shader_bindings.callable.as_vk(),
                self.tensor.address() + self.offset,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_form_aligns_every_entry() {
        // Synthetic handles: four groups of 8 bytes each.
        let handles: Vec<u8> = (0..32).collect();
        let handle_size = 8usize;
        let entry_size = align_up(8, 16) as usize;
        assert_eq!(entry_size, 16);

        let mut data = vec![0xAAu8; entry_size * 2];
        fill_sbt_range(&mut data, &handles, handle_size, entry_size, 1, 2);

        // Entry 0 carries group 1, entry 1 group 2; padding is zero.
        assert_eq!(&data[0..8], &handles[8..16]);
        assert!(data[8..16].iter().all(|&b| b == 0));
        assert_eq!(&data[16..24], &handles[16..24]);
        assert!(data[24..32].iter().all(|&b| b == 0));
    }

    #[test]
    fn entry_form_places_records_after_the_handle() {
        let handles: Vec<u8> = (0..32).collect();
        let handle_size = 8usize;
        let record = [0xDEu8, 0xAD, 0xBE, 0xEF];
        let entry_size = align_up(8 + record.len() as u32, 16) as usize;
        assert_eq!(entry_size, 16);

        let entries = [
            SbtEntry {
                group_index: 3,
                shader_record: &record,
            },
            SbtEntry {
                group_index: EMPTY_SBT_GROUP,
                shader_record: &[],
            },
        ];
        let mut data = vec![0xAAu8; entry_size * entries.len()];
        fill_sbt_entries(&mut data, &handles, handle_size, entry_size, 4, &entries).unwrap();

        assert_eq!(&data[0..8], &handles[24..32]);
        assert_eq!(&data[8..12], &record);
        assert!(data[12..16].iter().all(|&b| b == 0));
        // The empty entry is fully zeroed.
        assert!(data[16..32].iter().all(|&b| b == 0));
    }

    #[test]
    fn entry_form_rejects_out_of_range_groups() {
        let handles = vec![0u8; 16];
        let mut data = vec![0u8; 32];
        let entries = [SbtEntry {
            group_index: 2,
            shader_record: &[],
        }];
        assert!(fill_sbt_entries(&mut data, &handles, 8, 16, 2, &entries).is_err());
        let entries = [SbtEntry {
            group_index: 7,
            shader_record: &[],
        }];
        assert!(fill_sbt_entries(&mut data, &handles, 8, 16, 2, &entries).is_err());
    }

    #[test]
    fn regions_convert_to_strided_addresses() {
        let region = ShaderBindingTableRegion {
            address: 0x1000,
            stride: 32,
            count: 3,
        };
        let vk_region = region.as_vk();
        assert_eq!(vk_region.device_address, 0x1000);
        assert_eq!(vk_region.stride, 32);
        assert_eq!(vk_region.size, 96);
    }
}
