//! Bottom- and top-level acceleration structure builders.

use ash::vk;

use crate::alloc::{AllocFlags, BufferAlloc};
use crate::bindings::{BindingSlot, BoundValue, Parameter};
use crate::context::ContextHandle;
use crate::error::{invalid_argument, Error, Result};

use super::require_accel;

/// One triangle mesh: positions as three packed f32 per vertex at
/// `vertex_stride`, optionally indexed with 32-bit indices.
#[derive(Debug, Clone, Copy)]
pub struct Geometry<'a> {
    pub vertices: &'a [u8],
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub indices: Option<&'a [u32]>,
}

struct Blas {
    handle: vk::AccelerationStructureKHR,
    address: u64,
    buffer: BufferAlloc,
}

fn buffer_address(context: &ContextHandle, buffer: vk::Buffer) -> u64 {
    let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
    unsafe { context.device.get_buffer_device_address(&info) }
}

fn create_accel_buffer(context: &ContextHandle, size: u64) -> Result<BufferAlloc> {
    context.allocator.create_buffer(
        &context.device,
        size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        AllocFlags::empty(),
    )
}

fn create_scratch_buffer(context: &ContextHandle, size: u64) -> Result<BufferAlloc> {
    context.allocator.create_buffer(
        &context.device,
        size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        AllocFlags::empty(),
    )
}

/// Mapped upload buffer for acceleration structure build inputs.
fn create_input_buffer(context: &ContextHandle, size: u64) -> Result<BufferAlloc> {
    context.allocator.create_buffer(
        &context.device,
        size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        AllocFlags::HOST_ACCESS_SEQUENTIAL_WRITE | AllocFlags::MAPPED,
    )
}

fn build_blas(context: &ContextHandle, geometry: &Geometry<'_>) -> Result<Blas> {
    let accel_loader = require_accel(context)?;
    let index_bytes = geometry.indices.map_or(0, |indices| indices.len() * 4) as u64;
    let input_size = geometry.vertices.len() as u64 + index_bytes;
    if input_size == 0 || geometry.vertex_count == 0 {
        return Err(invalid_argument("geometry has no vertices"));
    }

    // Stage vertices and indices back to back in one device buffer.
    let mut input = create_input_buffer(context, input_size)?;
    if !input.allocation.is_mapped() {
        context.allocator.destroy_buffer(&context.device, &mut input);
        return Err(Error::OutOfDeviceMemory);
    }
    unsafe {
        std::ptr::copy_nonoverlapping(
            geometry.vertices.as_ptr(),
            input.allocation.mapped,
            geometry.vertices.len(),
        );
        if let Some(indices) = geometry.indices {
            std::ptr::copy_nonoverlapping(
                indices.as_ptr() as *const u8,
                input.allocation.mapped.add(geometry.vertices.len()),
                indices.len() * 4,
            );
        }
    }
    context
        .allocator
        .flush(&context.device, &input.allocation, 0, vk::WHOLE_SIZE)?;
    let input_address = buffer_address(context, input.buffer);

    let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: input_address,
        })
        .vertex_stride(geometry.vertex_stride)
        .max_vertex(geometry.vertex_count);
    if geometry.indices.is_some() {
        triangles = triangles
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: input_address + geometry.vertices.len() as u64,
            });
    }
    let geometries = [vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })];

    let triangle_count = geometry
        .indices
        .map_or(geometry.vertex_count, |indices| indices.len() as u32)
        / 3;

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        accel_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[triangle_count],
            &mut sizes,
        );
    }

    let cleanup_input = |context: &ContextHandle, input: &mut BufferAlloc| {
        context.allocator.destroy_buffer(&context.device, input);
    };

    let mut storage = match create_accel_buffer(context, sizes.acceleration_structure_size) {
        Ok(storage) => storage,
        Err(err) => {
            cleanup_input(context, &mut input);
            return Err(err);
        }
    };
    let accel_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(storage.buffer)
        .size(sizes.acceleration_structure_size)
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
    let handle = match unsafe { accel_loader.create_acceleration_structure(&accel_info, None) } {
        Ok(handle) => handle,
        Err(err) => {
            cleanup_input(context, &mut input);
            context.allocator.destroy_buffer(&context.device, &mut storage);
            return Err(err.into());
        }
    };
    build_info = build_info.dst_acceleration_structure(handle);

    let build = (|| -> Result<()> {
        let mut scratch = create_scratch_buffer(context, sizes.build_scratch_size)?;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: buffer_address(context, scratch.buffer),
        };

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(triangle_count);
        let result = context.one_time_submit(|cmd| {
            unsafe {
                accel_loader.cmd_build_acceleration_structures(
                    cmd.buffer,
                    std::slice::from_ref(&build_info),
                    &[std::slice::from_ref(&range)],
                );
            }
            Ok(())
        });
        context.allocator.destroy_buffer(&context.device, &mut scratch);
        result
    })();
    cleanup_input(context, &mut input);
    if let Err(err) = build {
        unsafe { accel_loader.destroy_acceleration_structure(handle, None) };
        context.allocator.destroy_buffer(&context.device, &mut storage);
        return Err(err);
    }

    let address_info =
        vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
    let address =
        unsafe { accel_loader.get_acceleration_structure_device_address(&address_info) };

    Ok(Blas {
        handle,
        address,
        buffer: storage,
    })
}

/// Owns one bottom-level acceleration structure per geometry.
///
/// Instances reference geometries through their BLAS address; the store
/// must outlive every acceleration structure built from it.
pub struct GeometryStore {
    context: ContextHandle,
    blas: Vec<Blas>,
}

impl GeometryStore {
    pub fn new(context: &ContextHandle, geometries: &[Geometry<'_>]) -> Result<Self> {
        let mut store = Self {
            context: context.clone(),
            blas: Vec::with_capacity(geometries.len()),
        };
        for geometry in geometries {
            store.blas.push(build_blas(context, geometry)?);
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.blas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blas.is_empty()
    }

    /// Device address of the BLAS built for geometry `index`.
    pub fn blas_address(&self, index: usize) -> Result<u64> {
        self.blas
            .get(index)
            .map(|blas| blas.address)
            .ok_or_else(|| {
                invalid_argument(format!(
                    "geometry {index} is out of range, the store holds {}",
                    self.blas.len()
                ))
            })
    }

    /// Untransformed instance of geometry `index` with mask `0xFF`.
    pub fn instantiate(&self, index: usize) -> Result<GeometryInstance> {
        Ok(GeometryInstance {
            blas_address: self.blas_address(index)?,
            transform: IDENTITY_TRANSFORM,
            custom_index: 0,
            mask: 0xFF,
        })
    }
}

impl Drop for GeometryStore {
    fn drop(&mut self) {
        let Ok(accel_loader) = require_accel(&self.context) else {
            return;
        };
        for blas in &mut self.blas {
            unsafe { accel_loader.destroy_acceleration_structure(blas.handle, None) };
            self.context
                .allocator
                .destroy_buffer(&self.context.device, &mut blas.buffer);
        }
    }
}

impl std::fmt::Debug for GeometryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryStore")
            .field("geometries", &self.blas.len())
            .finish()
    }
}

pub const IDENTITY_TRANSFORM: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// Placement of one BLAS inside a top-level structure.
#[derive(Debug, Clone, Copy)]
pub struct GeometryInstance {
    pub blas_address: u64,
    /// Row-major 3x4 affine transform.
    pub transform: [[f32; 4]; 3],
    /// Custom index visible to shaders, 24 bits.
    pub custom_index: u32,
    pub mask: u8,
}

impl GeometryInstance {
    /// Bit-exact `VkAccelerationStructureInstanceKHR` record.
    fn to_vk(self) -> vk::AccelerationStructureInstanceKHR {
        let mut matrix = [0.0f32; 12];
        for (row, values) in self.transform.iter().enumerate() {
            matrix[row * 4..row * 4 + 4].copy_from_slice(values);
        }
        vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR { matrix },
            instance_custom_index_and_mask: vk::Packed24_8::new(
                self.custom_index & 0x00FF_FFFF,
                self.mask,
            ),
            // Zero SBT record offset, opaque pipeline without culling.
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        }
    }
}

/// A top-level acceleration structure over a set of instances.
pub struct AccelerationStructure {
    context: ContextHandle,
    handle: vk::AccelerationStructureKHR,
    buffer: BufferAlloc,
}

impl AccelerationStructure {
    pub fn new(context: &ContextHandle, instances: &[GeometryInstance]) -> Result<Self> {
        let accel_loader = require_accel(context)?;

        // Upload the instance records.
        let record_size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();
        let records: Vec<vk::AccelerationStructureInstanceKHR> =
            instances.iter().map(|instance| instance.to_vk()).collect();
        let mut instance_buffer =
            create_input_buffer(context, (records.len() * record_size).max(record_size) as u64)?;
        if !instance_buffer.allocation.is_mapped() {
            context
                .allocator
                .destroy_buffer(&context.device, &mut instance_buffer);
            return Err(Error::OutOfDeviceMemory);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                records.as_ptr() as *const u8,
                instance_buffer.allocation.mapped,
                records.len() * record_size,
            );
        }
        context
            .allocator
            .flush(&context.device, &instance_buffer.allocation, 0, vk::WHOLE_SIZE)?;

        let cleanup_input = |context: &ContextHandle, buffer: &mut BufferAlloc| {
            context.allocator.destroy_buffer(&context.device, buffer);
        };

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: buffer_address(context, instance_buffer.buffer),
            });
        let geometries = [vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })];

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let instance_count = instances.len() as u32;
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            accel_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count],
                &mut sizes,
            );
        }

        let mut storage = match create_accel_buffer(context, sizes.acceleration_structure_size) {
            Ok(storage) => storage,
            Err(err) => {
                cleanup_input(context, &mut instance_buffer);
                return Err(err);
            }
        };
        let accel_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.buffer)
            .size(sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        let handle = match unsafe { accel_loader.create_acceleration_structure(&accel_info, None) }
        {
            Ok(handle) => handle,
            Err(err) => {
                cleanup_input(context, &mut instance_buffer);
                context.allocator.destroy_buffer(&context.device, &mut storage);
                return Err(err.into());
            }
        };
        build_info = build_info.dst_acceleration_structure(handle);

        let build = (|| -> Result<()> {
            let mut scratch = create_scratch_buffer(context, sizes.build_scratch_size)?;
            build_info.scratch_data = vk::DeviceOrHostAddressKHR {
                device_address: buffer_address(context, scratch.buffer),
            };
            let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(instance_count);
            let result = context.one_time_submit(|cmd| {
                unsafe {
                    accel_loader.cmd_build_acceleration_structures(
                        cmd.buffer,
                        std::slice::from_ref(&build_info),
                        &[std::slice::from_ref(&range)],
                    );
                }
                Ok(())
            });
            context.allocator.destroy_buffer(&context.device, &mut scratch);
            result
        })();
        cleanup_input(context, &mut instance_buffer);
        if let Err(err) = build {
            unsafe { accel_loader.destroy_acceleration_structure(handle, None) };
            context.allocator.destroy_buffer(&context.device, &mut storage);
            return Err(err);
        }

        Ok(Self {
            context: context.clone(),
            handle,
            buffer: storage,
        })
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        if let Ok(accel_loader) = require_accel(&self.context) {
            unsafe { accel_loader.destroy_acceleration_structure(self.handle, None) };
        }
        self.context
            .allocator
            .destroy_buffer(&self.context.device, &mut self.buffer);
    }
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure").finish()
    }
}

impl Parameter for AccelerationStructure {
    fn bind(&self, slot: &mut BindingSlot) -> Result<()> {
        slot.value = BoundValue::AccelerationStructure(self.handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracing::{ray_tracing_extension, RayTracingFeatures};

    #[test]
    fn builds_blas_and_tlas_when_supported() {
        if !crate::instance::is_api_available() {
            return;
        }
        let features = RayTracingFeatures {
            query: true,
            ..Default::default()
        };
        // Skipped on machines without ray tracing hardware.
        let Ok(context) = crate::context::create_context(vec![ray_tracing_extension(features)])
        else {
            return;
        };

        let vertices: [[f32; 3]; 4] = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
        ];
        let indices: [u32; 6] = [0, 1, 2, 2, 1, 3];
        let geometry = Geometry {
            vertices: bytemuck::cast_slice(&vertices),
            vertex_stride: 12,
            vertex_count: 4,
            indices: Some(&indices),
        };
        let store = GeometryStore::new(&context, &[geometry]).unwrap();
        assert_eq!(store.len(), 1);
        assert_ne!(store.blas_address(0).unwrap(), 0);
        assert!(store.blas_address(1).is_err());

        let mut instance = store.instantiate(0).unwrap();
        instance.custom_index = 17;
        let _tlas = AccelerationStructure::new(&context, &[instance]).unwrap();
    }

    #[test]
    fn instance_records_are_bit_exact() {
        let instance = GeometryInstance {
            blas_address: 0x1234_5678_9ABC_DEF0,
            transform: [
                [1.0, 0.0, 0.0, 0.5],
                [0.0, 1.0, 0.0, -0.5],
                [0.0, 0.0, 1.0, 2.0],
            ],
            custom_index: 0x00AB_CDEF,
            mask: 0x7F,
        };
        let record = instance.to_vk();

        assert_eq!(record.transform.matrix[3], 0.5);
        assert_eq!(record.transform.matrix[7], -0.5);
        assert_eq!(record.transform.matrix[11], 2.0);

        assert_eq!(record.instance_custom_index_and_mask.low_24(), 0x00AB_CDEF);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0x7F);
        assert_eq!(
            record
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            0
        );
        assert_eq!(
            u32::from(
                record
                    .instance_shader_binding_table_record_offset_and_flags
                    .high_8()
            ),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(
            unsafe { record.acceleration_structure_reference.device_handle },
            0x1234_5678_9ABC_DEF0
        );

        // The record layout is mandated by the API: 12 floats, two packed
        // u32, one 64-bit reference.
        assert_eq!(
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            64
        );
    }

    #[test]
    fn custom_index_is_clamped_to_24_bits() {
        let instance = GeometryInstance {
            blas_address: 1,
            transform: IDENTITY_TRANSFORM,
            custom_index: 0xFF00_0017,
            mask: 0xFF,
        };
        assert_eq!(instance.to_vk().instance_custom_index_and_mask.low_24(), 0x17);
    }
}
