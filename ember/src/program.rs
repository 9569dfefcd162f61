//! Compute programs reflected from SPIR-V.

use std::ffi::CString;

use ash::vk;

use crate::bindings::{collect_writes, BindingMap, BindingTarget};
use crate::buffer::Tensor;
use crate::command::{Command, CommandRecorder};
use crate::context::{ContextHandle, Device};
use crate::error::{invalid_argument, Result};
use crate::reflect::{self, LayoutBuilder, ShaderStage};

/// Subgroup capabilities of a device.
#[derive(Debug, Clone, Copy)]
pub struct SubgroupProperties {
    pub subgroup_size: u32,
    pub basic_support: bool,
    pub vote_support: bool,
    pub arithmetic_support: bool,
    pub ballot_support: bool,
    pub shuffle_support: bool,
    pub shuffle_relative_support: bool,
    pub shuffle_clustered_support: bool,
    pub quad_support: bool,
}

pub fn get_subgroup_properties(device: &Device) -> SubgroupProperties {
    let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
    let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut subgroup);
    unsafe {
        device
            .instance
            .raw
            .get_physical_device_properties2(device.physical, &mut props)
    };
    let supports = |bit| subgroup.supported_operations.contains(bit);
    SubgroupProperties {
        subgroup_size: subgroup.subgroup_size,
        basic_support: supports(vk::SubgroupFeatureFlags::BASIC),
        vote_support: supports(vk::SubgroupFeatureFlags::VOTE),
        arithmetic_support: supports(vk::SubgroupFeatureFlags::ARITHMETIC),
        ballot_support: supports(vk::SubgroupFeatureFlags::BALLOT),
        shuffle_support: supports(vk::SubgroupFeatureFlags::SHUFFLE),
        shuffle_relative_support: supports(vk::SubgroupFeatureFlags::SHUFFLE_RELATIVE),
        shuffle_clustered_support: supports(vk::SubgroupFeatureFlags::CLUSTERED),
        quad_support: supports(vk::SubgroupFeatureFlags::QUAD),
    }
}

pub fn get_subgroup_properties_on(context: &ContextHandle) -> SubgroupProperties {
    get_subgroup_properties(&context.device_handle())
}

/// A compute pipeline with its reflected binding table.
pub struct Program {
    context: ContextHandle,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: Option<vk::DescriptorSetLayout>,
    set: u32,
    local_size: [u32; 3],
    push_stages: vk::ShaderStageFlags,
    bindings: BindingMap,
}

impl Program {
    pub fn new(context: &ContextHandle, code: &[u32]) -> Result<Self> {
        Self::with_specialization(context, code, &[])
    }

    /// Creates the pipeline with a specialization blob; each constant is a
    /// tightly packed 4-byte slot ordered by ascending constant id.
    pub fn with_specialization(
        context: &ContextHandle,
        code: &[u32],
        specialization: &[u8],
    ) -> Result<Self> {
        let module = reflect::reflect(code)?;
        if module.stage != ShaderStage::Compute {
            return Err(invalid_argument(
                "program shaders must declare a compute entry point",
            ));
        }
        let mut builder = LayoutBuilder::new();
        builder.add(&module, vk::ShaderStageFlags::COMPUTE)?;

        let device = &context.device;
        let set_layout = builder.create_set_layout(device)?;
        let layout = match builder.create_pipeline_layout(device, set_layout) {
            Ok(layout) => layout,
            Err(err) => {
                if let Some(set_layout) = set_layout {
                    unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                }
                return Err(err);
            }
        };

        let destroy_layouts = |device: &ash::Device| unsafe {
            device.destroy_pipeline_layout(layout, None);
            if let Some(set_layout) = set_layout {
                device.destroy_descriptor_set_layout(set_layout, None);
            }
        };

        let shader_info = vk::ShaderModuleCreateInfo::default().code(code);
        let shader = match unsafe { device.create_shader_module(&shader_info, None) } {
            Ok(shader) => shader,
            Err(err) => {
                destroy_layouts(device);
                return Err(err.into());
            }
        };

        let entries = builder.specialization_entries(specialization.len());
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&entries)
            .data(specialization);
        let entry_name = CString::new(module.entry_point.as_str())
            .map_err(|_| invalid_argument("entry point name contains a nul byte"))?;
        let mut stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader)
            .name(&entry_name);
        if !entries.is_empty() {
            stage = stage.specialization_info(&spec_info);
        }

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        let pipelines = unsafe {
            device.create_compute_pipelines(context.pipeline_cache, &[pipeline_info], None)
        };
        unsafe { device.destroy_shader_module(shader, None) };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                destroy_layouts(device);
                return Err(err.into());
            }
        };

        Ok(Self {
            context: context.clone(),
            pipeline,
            layout,
            set_layout,
            set: builder.set,
            local_size: builder.local_size,
            push_stages: builder.push_stages,
            bindings: BindingMap::new(builder.sorted_traits()),
        })
    }

    /// Workgroup size declared by the shader.
    pub fn local_size(&self) -> [u32; 3] {
        self.local_size
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    /// Prepares a dispatch; fails when any binding is still unbound.
    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<DispatchCommand<'_>> {
        self.dispatch_raw(&[], x, y, z)
    }

    /// Dispatch with raw push-constant bytes.
    pub fn dispatch_raw<'a>(
        &'a self,
        push: &'a [u8],
        x: u32,
        y: u32,
        z: u32,
    ) -> Result<DispatchCommand<'a>> {
        self.bindings.check_all_bound()?;
        Ok(DispatchCommand {
            group_count: [x, y, z],
            push,
            program: self,
        })
    }

    /// Dispatch with a typed push-constant struct.
    pub fn dispatch_push<'a, T: bytemuck::NoUninit>(
        &'a self,
        push: &'a T,
        x: u32,
        y: u32,
        z: u32,
    ) -> Result<DispatchCommand<'a>> {
        self.dispatch_raw(bytemuck::bytes_of(push), x, y, z)
    }

    /// Dispatch with counts read from a tensor at `offset` (three u32).
    pub fn dispatch_indirect<'a>(
        &'a self,
        tensor: &'a Tensor,
        offset: u64,
    ) -> Result<DispatchIndirectCommand<'a>> {
        self.dispatch_indirect_raw(&[], tensor, offset)
    }

    pub fn dispatch_indirect_raw<'a>(
        &'a self,
        push: &'a [u8],
        tensor: &'a Tensor,
        offset: u64,
    ) -> Result<DispatchIndirectCommand<'a>> {
        self.bindings.check_all_bound()?;
        if offset + 12 > tensor.size_bytes() {
            return Err(invalid_argument(
                "indirect dispatch parameters exceed the tensor",
            ));
        }
        Ok(DispatchIndirectCommand {
            push,
            tensor,
            offset,
            program: self,
        })
    }

    fn record_bind(&self, cmd: &mut CommandRecorder<'_>, push: &[u8]) -> Result<()> {
        let device = &cmd.context.device;
        unsafe {
            device.cmd_bind_pipeline(cmd.buffer, vk::PipelineBindPoint::COMPUTE, self.pipeline);
        }
        if !self.bindings.traits().is_empty() {
            let writes = collect_writes(&self.bindings)?;
            unsafe {
                cmd.context.push_descriptor.cmd_push_descriptor_set(
                    cmd.buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    self.layout,
                    self.set,
                    &writes.writes,
                );
            }
        }
        if !push.is_empty() {
            unsafe {
                device.cmd_push_constants(cmd.buffer, self.layout, self.push_stages, 0, push);
            }
        }
        Ok(())
    }
}

impl Drop for Program {
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

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("local_size", &self.local_size)
            .field("bindings", &self.bindings.traits().len())
            .finish()
    }
}

impl BindingTarget for Program {
    fn binding_map(&self) -> &BindingMap {
        &self.bindings
    }

    fn binding_map_mut(&mut self) -> &mut BindingMap {
        &mut self.bindings
    }
}

/// Dispatches the program over a grid of workgroups.
pub struct DispatchCommand<'a> {
    pub group_count: [u32; 3],
    push: &'a [u8],
    program: &'a Program,
}

impl std::fmt::Debug for DispatchCommand<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchCommand")
            .field("group_count", &self.group_count)
            .finish()
    }
}

impl Command for DispatchCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.program.context())?;
        cmd.stage_mask |= vk::PipelineStageFlags::COMPUTE_SHADER;
        self.program.record_bind(cmd, self.push)?;
        unsafe {
            cmd.context.device.cmd_dispatch(
                cmd.buffer,
                self.group_count[0],
                self.group_count[1],
                self.group_count[2],
            );
        }
        Ok(())
    }
}

/// Dispatches with workgroup counts sourced from a tensor.
pub struct DispatchIndirectCommand<'a> {
    push: &'a [u8],
    tensor: &'a Tensor,
    offset: u64,
    program: &'a Program,
}

impl Command for DispatchIndirectCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.program.context())?;
        cmd.stage_mask |=
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::DRAW_INDIRECT;
        self.program.record_bind(cmd, self.push)?;

        // The 12-byte group-count record must be complete before the
        // indirect read.
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
                vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::DRAW_INDIRECT,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
            cmd.context
                .device
                .cmd_dispatch_indirect(cmd.buffer, self.tensor.vk_buffer(), self.offset);
        }
        Ok(())
    }
}

/// Orders shader writes before shader and host reads without a timeline
/// boundary between two steps.
pub struct FlushMemoryCommand {
    context: ContextHandle,
}

pub fn flush_memory(context: &ContextHandle) -> FlushMemoryCommand {
    FlushMemoryCommand {
        context: context.clone(),
    }
}

impl Command for FlushMemoryCommand {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(&self.context)?;
        cmd.stage_mask |= vk::PipelineStageFlags::COMPUTE_SHADER;
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::HOST_READ);
        unsafe {
            cmd.context.device.cmd_pipeline_barrier(
                cmd.buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::BindingTarget;
    use crate::buffer::{
        clear_tensor, retrieve_tensor, ClearParams, CopyRegion, Tensor, TypedBuffer,
    };
    use crate::error::Error;
    use crate::sequence::begin_sequence;
    use crate::testing::test_context;

    // Hand-assembled compute shaders, the counterpart of the precompiled
    // kernels the demo binaries embed. All variants implement
    //
    //     layout(local_size_x = 1) in;
    //     layout(std430, binding = 0) buffer OutBuf { uint data[]; };
    //     void main() { data[gl_GlobalInvocationID.x] = gl_GlobalInvocationID.x + ...; }
    //
    // optionally adding a push-constant base and a specialization constant.
    mod shader {
        const U32: u32 = 1;
        const V3U32: u32 = 2;
        const PTR_IN_V3: u32 = 3;
        const GID: u32 = 4;
        const RT_ARR: u32 = 5;
        const BLOCK: u32 = 6;
        const PTR_SB_BLOCK: u32 = 7;
        const OUT_VAR: u32 = 8;
        const PUSH_STRUCT: u32 = 9;
        const PTR_PC_PUSH: u32 = 10;
        const PUSH_VAR: u32 = 11;
        const VOID: u32 = 12;
        const FNTY: u32 = 13;
        const C0: u32 = 14;
        const PTR_SB_U32: u32 = 15;
        const PTR_PC_U32: u32 = 16;
        const PTR_IN_U32: u32 = 17;
        const SPEC: u32 = 18;
        const MAIN: u32 = 20;
        const LABEL: u32 = 21;
        const GID_PTR: u32 = 22;
        const X: u32 = 23;
        const PC_PTR: u32 = 24;
        const BASE: u32 = 25;
        const SUM_PUSH: u32 = 26;
        const DST_PTR: u32 = 27;
        const SUM_SPEC: u32 = 28;

        fn inst(words: &mut Vec<u32>, opcode: u16, operands: &[u32]) {
            words.push(opcode as u32 | (((operands.len() + 1) as u32) << 16));
            words.extend_from_slice(operands);
        }

        fn string_words(text: &str) -> Vec<u32> {
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(0);
            while bytes.len() % 4 != 0 {
                bytes.push(0);
            }
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }

        /// Writes `gid.x (+ push base) (+ spec constant)` to `data[gid.x]`.
        pub fn index_kernel(with_push: bool, spec_default: Option<u32>) -> Vec<u32> {
            let mut w = vec![0x0723_0203, 0x0001_0300, 0, 32, 0];
            inst(&mut w, 17, &[1]); // OpCapability Shader
            inst(&mut w, 14, &[0, 1]); // OpMemoryModel Logical GLSL450
            let mut entry = vec![5, MAIN];
            entry.extend(string_words("main"));
            entry.push(GID);
            inst(&mut w, 15, &entry); // OpEntryPoint GLCompute
            inst(&mut w, 16, &[MAIN, 17, 1, 1, 1]); // LocalSize 1 1 1

            let mut name = vec![BLOCK];
            name.extend(string_words("OutBuf"));
            inst(&mut w, 5, &name);
            let mut name = vec![OUT_VAR];
            name.extend(string_words("out_buf"));
            inst(&mut w, 5, &name);

            inst(&mut w, 71, &[GID, 11, 28]); // BuiltIn GlobalInvocationId
            inst(&mut w, 71, &[RT_ARR, 6, 4]); // ArrayStride 4
            inst(&mut w, 72, &[BLOCK, 0, 35, 0]); // member 0 Offset 0
            inst(&mut w, 71, &[BLOCK, 2]); // Block
            inst(&mut w, 71, &[OUT_VAR, 34, 0]); // DescriptorSet 0
            inst(&mut w, 71, &[OUT_VAR, 33, 0]); // Binding 0
            if with_push {
                inst(&mut w, 72, &[PUSH_STRUCT, 0, 35, 0]);
                inst(&mut w, 71, &[PUSH_STRUCT, 2]);
            }
            if spec_default.is_some() {
                inst(&mut w, 71, &[SPEC, 1, 0]); // SpecId 0
            }

            inst(&mut w, 21, &[U32, 32, 0]);
            inst(&mut w, 23, &[V3U32, U32, 3]);
            inst(&mut w, 32, &[PTR_IN_V3, 1, V3U32]);
            inst(&mut w, 59, &[PTR_IN_V3, GID, 1]);
            inst(&mut w, 29, &[RT_ARR, U32]);
            inst(&mut w, 30, &[BLOCK, RT_ARR]);
            inst(&mut w, 32, &[PTR_SB_BLOCK, 12, BLOCK]);
            inst(&mut w, 59, &[PTR_SB_BLOCK, OUT_VAR, 12]);
            if with_push {
                inst(&mut w, 30, &[PUSH_STRUCT, U32]);
                inst(&mut w, 32, &[PTR_PC_PUSH, 9, PUSH_STRUCT]);
                inst(&mut w, 59, &[PTR_PC_PUSH, PUSH_VAR, 9]);
            }
            inst(&mut w, 19, &[VOID]);
            inst(&mut w, 33, &[FNTY, VOID]);
            inst(&mut w, 43, &[U32, C0, 0]);
            inst(&mut w, 32, &[PTR_SB_U32, 12, U32]);
            if with_push {
                inst(&mut w, 32, &[PTR_PC_U32, 9, U32]);
            }
            inst(&mut w, 32, &[PTR_IN_U32, 1, U32]);
            if let Some(default) = spec_default {
                inst(&mut w, 50, &[U32, SPEC, default]); // OpSpecConstant
            }

            inst(&mut w, 54, &[VOID, MAIN, 0, FNTY]); // OpFunction
            inst(&mut w, 248, &[LABEL]);
            inst(&mut w, 65, &[PTR_IN_U32, GID_PTR, GID, C0]);
            inst(&mut w, 61, &[U32, X, GID_PTR]);
            let mut value = X;
            if with_push {
                inst(&mut w, 65, &[PTR_PC_U32, PC_PTR, PUSH_VAR, C0]);
                inst(&mut w, 61, &[U32, BASE, PC_PTR]);
                inst(&mut w, 128, &[U32, SUM_PUSH, value, BASE]); // OpIAdd
                value = SUM_PUSH;
            }
            if spec_default.is_some() {
                inst(&mut w, 128, &[U32, SUM_SPEC, value, SPEC]);
                value = SUM_SPEC;
            }
            inst(&mut w, 65, &[PTR_SB_U32, DST_PTR, OUT_VAR, C0, X]);
            inst(&mut w, 62, &[DST_PTR, value]); // OpStore
            inst(&mut w, 253, &[]); // OpReturn
            inst(&mut w, 56, &[]); // OpFunctionEnd
            w
        }
    }

    fn read_back(tensor: &Tensor, count: usize) -> Vec<u32> {
        let context = tensor.context().clone();
        let output = TypedBuffer::<u32>::new(&context, count).unwrap();
        crate::command::execute(
            &context,
            &retrieve_tensor(tensor, &output, CopyRegion::default()),
        )
        .unwrap();
        output.as_slice().to_vec()
    }

    #[test]
    fn reflects_bindings_and_local_size() {
        let Some(context) = test_context() else {
            return;
        };
        let program = Program::new(&context, &shader::index_kernel(false, None)).unwrap();
        assert_eq!(program.local_size(), [1, 1, 1]);
        assert_eq!(program.list_bindings().len(), 1);
        assert!(program.has_binding("OutBuf"));
        assert!(program.has_binding(0u32));
        assert!(!program.has_binding("missing"));

        let traits = program.get_binding_traits(0u32).unwrap();
        assert_eq!(traits.ty, crate::bindings::ParameterType::StorageBuffer);
        assert_eq!(traits.name, "OutBuf");
        assert!(!program.all_bindings_bound());
    }

    #[test]
    fn dispatch_requires_bound_parameters() {
        let Some(context) = test_context() else {
            return;
        };
        let program = Program::new(&context, &shader::index_kernel(false, None)).unwrap();
        let err = program.dispatch(1, 1, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("binding 0"));
    }

    #[test]
    fn dispatch_writes_global_ids() {
        let Some(context) = test_context() else {
            return;
        };
        let mut program = Program::new(&context, &shader::index_kernel(false, None)).unwrap();
        let tensor = Tensor::new(&context, 16).unwrap();
        program.bind_parameter(&tensor, "OutBuf").unwrap();
        assert!(program.all_bindings_bound());

        let mut builder = begin_sequence(&context).unwrap();
        builder
            .and(&program.dispatch(4, 1, 1).unwrap())
            .unwrap()
            .and(&flush_memory(&context))
            .unwrap();
        builder.submit().unwrap().wait().unwrap();

        assert_eq!(read_back(&tensor, 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn push_constants_reach_the_shader() {
        let Some(context) = test_context() else {
            return;
        };
        let mut program = Program::new(&context, &shader::index_kernel(true, None)).unwrap();
        let tensor = Tensor::new(&context, 16).unwrap();
        program.bind_parameter(&tensor, 0u32).unwrap();

        let base = 10u32;
        let mut builder = begin_sequence(&context).unwrap();
        builder
            .and(&program.dispatch_push(&base, 4, 1, 1).unwrap())
            .unwrap();
        builder.submit().unwrap().wait().unwrap();

        assert_eq!(read_back(&tensor, 4), vec![10, 11, 12, 13]);
    }

    #[test]
    fn specialization_constants_bake_in() {
        let Some(context) = test_context() else {
            return;
        };
        let code = shader::index_kernel(false, Some(7));
        let tensor = Tensor::new(&context, 12).unwrap();

        let mut program =
            Program::with_specialization(&context, &code, &42u32.to_le_bytes()).unwrap();
        program.bind_parameter(&tensor, "OutBuf").unwrap();
        let mut builder = begin_sequence(&context).unwrap();
        builder.and(&program.dispatch(3, 1, 1).unwrap()).unwrap();
        builder.submit().unwrap().wait().unwrap();
        assert_eq!(read_back(&tensor, 3), vec![42, 43, 44]);

        // Without a blob the shader default applies.
        let mut program = Program::new(&context, &code).unwrap();
        program.bind_parameter(&tensor, "OutBuf").unwrap();
        let mut builder = begin_sequence(&context).unwrap();
        builder.and(&program.dispatch(3, 1, 1).unwrap()).unwrap();
        builder.submit().unwrap().wait().unwrap();
        assert_eq!(read_back(&tensor, 3), vec![7, 8, 9]);
    }

    #[test]
    fn indirect_dispatch_reads_counts_from_tensor() {
        let Some(context) = test_context() else {
            return;
        };
        let mut program = Program::new(&context, &shader::index_kernel(false, None)).unwrap();
        let tensor = Tensor::new(&context, 16).unwrap();
        program.bind_parameter(&tensor, "OutBuf").unwrap();

        let counts: [u32; 3] = [3, 1, 1];
        let indirect = Tensor::from_bytes(&context, bytemuck::cast_slice(&counts)).unwrap();

        let mut builder = begin_sequence(&context).unwrap();
        builder
            .and(&clear_tensor(
                &tensor,
                ClearParams {
                    data: u32::MAX,
                    ..ClearParams::default()
                },
            ))
            .unwrap()
            .then(&program.dispatch_indirect(&indirect, 0).unwrap())
            .unwrap();
        builder.submit().unwrap().wait().unwrap();

        // Only the first three invocations ran.
        assert_eq!(read_back(&tensor, 4), vec![0, 1, 2, u32::MAX]);

        assert!(program.dispatch_indirect(&indirect, 8).is_err());
    }

    #[test]
    fn non_compute_modules_are_rejected() {
        let Some(context) = test_context() else {
            return;
        };
        // Patch the entry point execution model to ray generation.
        let mut code = shader::index_kernel(false, None);
        let position = code
            .iter()
            .position(|&word| word & 0xFFFF == 15 && word >> 16 == 6)
            .unwrap();
        code[position + 1] = 5313;
        let err = Program::new(&context, &code).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
