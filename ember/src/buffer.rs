//! Host staging buffers, device tensors and the copies between them.

use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;

use crate::alloc::{AllocFlags, BufferAlloc};
use crate::bindings::{BindingSlot, BoundValue, Parameter};
use crate::command::{Command, CommandRecorder};
use crate::context::ContextHandle;
use crate::error::{invalid_argument, Result};

/// Sentinel for "the rest of the resource" in copy regions.
pub const WHOLE_SIZE: u64 = vk::WHOLE_SIZE;

const DIFFERENT_CONTEXT: &str =
    "source and destination of a copy command must originate from the same context";
const SIZE_MISMATCH: &str = "source and destination copy region must have the same size";
const OUT_OF_SOURCE: &str = "copy region is not contained within the source";
const OUT_OF_DESTINATION: &str = "copy region is not contained within the destination";

/// Resolves the effective copy size and checks both ranges.
fn resolve_copy_size(
    src_size: u64,
    src_offset: u64,
    dst_size: u64,
    dst_offset: u64,
    size: u64,
) -> Result<u64> {
    let src_span = if size == WHOLE_SIZE {
        src_size
            .checked_sub(src_offset)
            .ok_or_else(|| invalid_argument(OUT_OF_SOURCE))?
    } else {
        size
    };
    let dst_span = if size == WHOLE_SIZE {
        dst_size
            .checked_sub(dst_offset)
            .ok_or_else(|| invalid_argument(OUT_OF_DESTINATION))?
    } else {
        size
    };
    if src_span != dst_span {
        return Err(invalid_argument(SIZE_MISMATCH));
    }
    if src_offset + src_span > src_size {
        return Err(invalid_argument(OUT_OF_SOURCE));
    }
    if dst_offset + dst_span > dst_size {
        return Err(invalid_argument(OUT_OF_DESTINATION));
    }
    Ok(src_span)
}

/// A persistently mapped, host-coherent staging buffer.
pub struct Buffer {
    context: ContextHandle,
    raw: BufferAlloc,
    size: u64,
}

impl Buffer {
    pub fn new(context: &ContextHandle, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(invalid_argument("buffers cannot be empty"));
        }
        let raw = context.allocator.create_buffer(
            &context.device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            AllocFlags::HOST_ACCESS_RANDOM | AllocFlags::MAPPED,
        )?;
        Ok(Self {
            context: context.clone(),
            raw,
            size,
        })
    }

    pub fn from_bytes(context: &ContextHandle, data: &[u8]) -> Result<Self> {
        let mut buffer = Self::new(context, data.len() as u64)?;
        buffer.memory_mut().copy_from_slice(data);
        Ok(buffer)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn memory(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.raw.allocation.mapped, self.size as usize) }
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.raw.allocation.mapped, self.size as usize) }
    }

    pub(crate) fn vk_buffer(&self) -> vk::Buffer {
        self.raw.buffer
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.context
            .allocator
            .destroy_buffer(&self.context.device, &mut self.raw);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("size", &self.size).finish()
    }
}

/// Typed view over a [`Buffer`]; elements never cross the byte-level API
/// boundary, this only adds element-size-aware accessors.
pub struct TypedBuffer<T> {
    inner: Buffer,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod> TypedBuffer<T> {
    pub fn new(context: &ContextHandle, count: usize) -> Result<Self> {
        Ok(Self {
            inner: Buffer::new(context, (count * std::mem::size_of::<T>()) as u64)?,
            _marker: PhantomData,
        })
    }

    pub fn from_data(context: &ContextHandle, data: &[T]) -> Result<Self> {
        Ok(Self {
            inner: Buffer::from_bytes(context, bytemuck::cast_slice(data))?,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.size as usize / std::mem::size_of::<T>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[T] {
        bytemuck::cast_slice(self.inner.memory())
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.inner.memory_mut())
    }
}

impl<T> std::ops::Deref for TypedBuffer<T> {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.inner
    }
}

impl<T> std::ops::DerefMut for TypedBuffer<T> {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.inner
    }
}

const TENSOR_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDIRECT_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// A device-local buffer usable as storage, uniform, indirect source and
/// shader device address. Optionally host mapped.
pub struct Tensor {
    context: ContextHandle,
    raw: BufferAlloc,
    size: u64,
    address: u64,
}

impl Tensor {
    pub fn new(context: &ContextHandle, size: u64) -> Result<Self> {
        Self::create(context, size, false)
    }

    /// Requests a host mapping; [`Tensor::is_mapped`] discloses whether
    /// the device actually exposes host-visible device-local memory.
    pub fn new_mapped(context: &ContextHandle, size: u64) -> Result<Self> {
        Self::create(context, size, true)
    }

    fn create(context: &ContextHandle, size: u64, mapped: bool) -> Result<Self> {
        if size == 0 {
            return Err(invalid_argument("tensors cannot be empty"));
        }
        let flags = if mapped {
            AllocFlags::HOST_ACCESS_SEQUENTIAL_WRITE
                | AllocFlags::HOST_ACCESS_ALLOW_TRANSFER_INSTEAD
                | AllocFlags::MAPPED
        } else {
            AllocFlags::empty()
        };
        let raw = context
            .allocator
            .create_buffer(&context.device, size, TENSOR_USAGE, flags)?;
        let address_info = vk::BufferDeviceAddressInfo::default().buffer(raw.buffer);
        let address = unsafe { context.device.get_buffer_device_address(&address_info) };
        Ok(Self {
            context: context.clone(),
            raw,
            size,
            address,
        })
    }

    /// Uploads `data` through a temporary staging buffer.
    pub fn from_bytes(context: &ContextHandle, data: &[u8]) -> Result<Self> {
        let staging = Buffer::from_bytes(context, data)?;
        Self::from_buffer(&staging)
    }

    /// Copies the buffer contents into a fresh tensor of the same size.
    pub fn from_buffer(source: &Buffer) -> Result<Self> {
        let tensor = Self::new(source.context(), source.size_bytes())?;
        let copy = update_tensor(source, &tensor, CopyRegion::default());
        source
            .context()
            .one_time_submit(|recorder| copy.record(recorder))?;
        Ok(tensor)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    /// Device address captured at creation; non-zero and stable.
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn is_mapped(&self) -> bool {
        self.raw.allocation.is_mapped()
    }

    pub fn is_non_coherent(&self) -> bool {
        !self.raw.allocation.coherent
    }

    pub fn memory(&self) -> Option<&[u8]> {
        self.is_mapped().then(|| unsafe {
            std::slice::from_raw_parts(self.raw.allocation.mapped, self.size as usize)
        })
    }

    fn check_mapped_range(&self, offset: u64, len: u64) -> Result<()> {
        if !self.is_mapped() {
            return Err(invalid_argument("tensor is not mapped"));
        }
        if offset + len > self.size {
            return Err(invalid_argument("range exceeds the tensor size"));
        }
        Ok(())
    }

    /// Copies host data into the mapped tensor, flushing when necessary.
    pub fn update(&mut self, src: &[u8], offset: u64) -> Result<()> {
        self.check_mapped_range(offset, src.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.raw.allocation.mapped.add(offset as usize),
                src.len(),
            );
        }
        self.flush(offset, src.len() as u64)
    }

    /// Copies out of the mapped tensor, invalidating first when necessary.
    pub fn retrieve(&self, dst: &mut [u8], offset: u64) -> Result<()> {
        self.check_mapped_range(offset, dst.len() as u64)?;
        self.invalidate(offset, dst.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.raw.allocation.mapped.add(offset as usize),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// No-op on coherent memory, else a cache flush rounded to the
    /// non-coherent atom size.
    pub fn flush(&self, offset: u64, size: u64) -> Result<()> {
        self.check_mapped_range(offset, if size == WHOLE_SIZE { 0 } else { size })?;
        self.context
            .allocator
            .flush(&self.context.device, &self.raw.allocation, offset, size)
    }

    pub fn invalidate(&self, offset: u64, size: u64) -> Result<()> {
        self.check_mapped_range(offset, if size == WHOLE_SIZE { 0 } else { size })?;
        self.context.allocator.invalidate(
            &self.context.device,
            &self.raw.allocation,
            offset,
            size,
        )
    }

    pub(crate) fn vk_buffer(&self) -> vk::Buffer {
        self.raw.buffer
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.context
            .allocator
            .destroy_buffer(&self.context.device, &mut self.raw);
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("size", &self.size)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

impl Parameter for Tensor {
    fn bind(&self, slot: &mut BindingSlot) -> Result<()> {
        slot.value = BoundValue::Buffer(
            vk::DescriptorBufferInfo::default()
                .buffer(self.raw.buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE),
        );
        Ok(())
    }
}

/// Region selector for buffer↔tensor copies.
#[derive(Debug, Clone, Copy)]
pub struct CopyRegion {
    pub buffer_offset: u64,
    pub tensor_offset: u64,
    /// [`WHOLE_SIZE`] means "everything past the offsets".
    pub size: u64,
    /// Skips the pre/post barriers; the caller asserts external
    /// synchronization.
    pub unchecked: bool,
}

impl Default for CopyRegion {
    fn default() -> Self {
        Self {
            buffer_offset: 0,
            tensor_offset: 0,
            size: WHOLE_SIZE,
            unchecked: false,
        }
    }
}

fn buffer_barrier<'a>(
    buffer: vk::Buffer,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    offset: u64,
    size: u64,
) -> vk::BufferMemoryBarrier<'a> {
    vk::BufferMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(offset)
        .size(size)
}

fn record_buffer_barriers(
    cmd: &CommandRecorder<'_>,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    barriers: &[vk::BufferMemoryBarrier<'_>],
) {
    unsafe {
        cmd.context.device.cmd_pipeline_barrier(
            cmd.buffer,
            src_stage,
            dst_stage,
            vk::DependencyFlags::BY_REGION,
            &[],
            barriers,
            &[],
        );
    }
}

/// Copies a tensor range into a host buffer.
pub struct RetrieveTensorCommand<'a> {
    source: &'a Tensor,
    destination: &'a Buffer,
    region: CopyRegion,
}

pub fn retrieve_tensor<'a>(
    source: &'a Tensor,
    destination: &'a Buffer,
    region: CopyRegion,
) -> RetrieveTensorCommand<'a> {
    RetrieveTensorCommand {
        source,
        destination,
        region,
    }
}

impl Command for RetrieveTensorCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.source.context())?;
        if !Arc::ptr_eq(self.source.context(), self.destination.context()) {
            return Err(invalid_argument(DIFFERENT_CONTEXT));
        }
        let src_offset = self.region.tensor_offset;
        let dst_offset = self.region.buffer_offset;
        let size = resolve_copy_size(
            self.source.size_bytes(),
            src_offset,
            self.destination.size_bytes(),
            dst_offset,
            self.region.size,
        )?;

        cmd.stage_mask |= vk::PipelineStageFlags::TRANSFER;

        if !self.region.unchecked {
            // Writes to the tensor must land before the transfer reads it.
            let barriers = [
                buffer_barrier(
                    self.source.vk_buffer(),
                    vk::AccessFlags::MEMORY_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                    src_offset,
                    size,
                ),
                buffer_barrier(
                    self.destination.vk_buffer(),
                    vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::TRANSFER_WRITE,
                    dst_offset,
                    size,
                ),
            ];
            record_buffer_barriers(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                &barriers,
            );
        }

        let copy = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            cmd.context.device.cmd_copy_buffer(
                cmd.buffer,
                self.source.vk_buffer(),
                self.destination.vk_buffer(),
                &[copy],
            );
        }

        if !self.region.unchecked {
            let barrier = buffer_barrier(
                self.destination.vk_buffer(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::HOST_READ,
                dst_offset,
                size,
            );
            record_buffer_barriers(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                &[barrier],
            );
        }
        Ok(())
    }
}

/// Copies a host buffer range into a tensor.
pub struct UpdateTensorCommand<'a> {
    source: &'a Buffer,
    destination: &'a Tensor,
    region: CopyRegion,
}

pub fn update_tensor<'a>(
    source: &'a Buffer,
    destination: &'a Tensor,
    region: CopyRegion,
) -> UpdateTensorCommand<'a> {
    UpdateTensorCommand {
        source,
        destination,
        region,
    }
}

impl Command for UpdateTensorCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.source.context())?;
        if !Arc::ptr_eq(self.source.context(), self.destination.context()) {
            return Err(invalid_argument(DIFFERENT_CONTEXT));
        }
        let src_offset = self.region.buffer_offset;
        let dst_offset = self.region.tensor_offset;
        let size = resolve_copy_size(
            self.source.size_bytes(),
            src_offset,
            self.destination.size_bytes(),
            dst_offset,
            self.region.size,
        )?;

        cmd.stage_mask |= vk::PipelineStageFlags::TRANSFER;

        if !self.region.unchecked {
            // The tensor range must be idle and the host writes visible.
            let barrier = buffer_barrier(
                self.destination.vk_buffer(),
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::AccessFlags::TRANSFER_WRITE,
                dst_offset,
                size,
            );
            record_buffer_barriers(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                &[barrier],
            );
            let barrier = buffer_barrier(
                self.source.vk_buffer(),
                vk::AccessFlags::HOST_WRITE,
                vk::AccessFlags::TRANSFER_READ,
                src_offset,
                size,
            );
            record_buffer_barriers(
                cmd,
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::TRANSFER,
                &[barrier],
            );
        }

        let copy = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            cmd.context.device.cmd_copy_buffer(
                cmd.buffer,
                self.source.vk_buffer(),
                self.destination.vk_buffer(),
                &[copy],
            );
        }

        if !self.region.unchecked {
            let barrier = buffer_barrier(
                self.destination.vk_buffer(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                dst_offset,
                size,
            );
            record_buffer_barriers(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                &[barrier],
            );
        }
        Ok(())
    }
}

/// Parameters for [`clear_tensor`].
#[derive(Debug, Clone, Copy)]
pub struct ClearParams {
    pub offset: u64,
    /// [`WHOLE_SIZE`] clears to the end of the tensor.
    pub size: u64,
    /// 32-bit word replicated over the range.
    pub data: u32,
    pub unchecked: bool,
}

impl Default for ClearParams {
    fn default() -> Self {
        Self {
            offset: 0,
            size: WHOLE_SIZE,
            data: 0,
            unchecked: false,
        }
    }
}

/// Fills a tensor range with a replicated 32-bit word.
pub struct ClearTensorCommand<'a> {
    tensor: &'a Tensor,
    params: ClearParams,
}

pub fn clear_tensor(tensor: &Tensor, params: ClearParams) -> ClearTensorCommand<'_> {
    ClearTensorCommand { tensor, params }
}

impl Command for ClearTensorCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.tensor.context())?;
        let size = if self.params.size == WHOLE_SIZE {
            self.tensor
                .size_bytes()
                .checked_sub(self.params.offset)
                .ok_or_else(|| invalid_argument(OUT_OF_DESTINATION))?
        } else {
            self.params.size
        };
        if self.params.offset + size > self.tensor.size_bytes() {
            return Err(invalid_argument(OUT_OF_DESTINATION));
        }
        if self.params.offset % 4 != 0 || size % 4 != 0 {
            return Err(invalid_argument(
                "fill offset and size must be multiples of four bytes",
            ));
        }

        cmd.stage_mask |= vk::PipelineStageFlags::TRANSFER;

        if !self.params.unchecked {
            let barrier = buffer_barrier(
                self.tensor.vk_buffer(),
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::AccessFlags::TRANSFER_WRITE,
                0,
                vk::WHOLE_SIZE,
            );
            record_buffer_barriers(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                &[barrier],
            );
        }

        unsafe {
            cmd.context.device.cmd_fill_buffer(
                cmd.buffer,
                self.tensor.vk_buffer(),
                self.params.offset,
                size,
                self.params.data,
            );
        }

        if !self.params.unchecked {
            let barrier = buffer_barrier(
                self.tensor.vk_buffer(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                0,
                vk::WHOLE_SIZE,
            );
            record_buffer_barriers(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                &[barrier],
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::execute;
    use crate::error::Error;
    use crate::testing::test_context;

    #[test]
    fn typed_buffers_view_the_mapped_bytes() {
        let Some(context) = test_context() else {
            return;
        };
        let data: [i32; 10] = [10, -5, 6, 45, 12, 122, i32::MAX, 789, 1500, -45123];
        let mut buffer = TypedBuffer::<i32>::new(&context, 10).unwrap();
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.size_bytes(), 40);

        buffer.as_mut_slice().copy_from_slice(&data);
        assert_eq!(buffer.as_slice(), &data);
        assert_eq!(&buffer.memory()[..4], &10i32.to_le_bytes());
    }

    #[test]
    fn buffers_can_be_initialized_with_data() {
        let Some(context) = test_context() else {
            return;
        };
        let data: [i32; 4] = [1, -2, 3, -4];
        let buffer = TypedBuffer::from_data(&context, &data).unwrap();
        assert_eq!(buffer.len(), data.len());
        assert_eq!(buffer.as_slice(), &data);

        assert!(Buffer::new(&context, 0).is_err());
    }

    #[test]
    fn mapped_tensors_support_host_access() {
        let Some(context) = test_context() else {
            return;
        };
        let data: [i32; 10] = [10, -5, 6, 45, 12, 122, i32::MAX, 789, 1500, -45123];
        let mut tensor = Tensor::new_mapped(&context, 40).unwrap();
        assert_eq!(tensor.size_bytes(), 40);
        if !tensor.is_mapped() {
            // No host-visible device-local memory on this device.
            return;
        }
        // Exercised for coverage; the answer depends on the allocator.
        let _ = tensor.is_non_coherent();

        tensor.update(bytemuck::cast_slice(&data), 0).unwrap();
        let mut readback = [0i32; 10];
        tensor
            .retrieve(bytemuck::cast_slice_mut(&mut readback), 0)
            .unwrap();
        assert_eq!(readback, data);

        assert!(tensor.update(&[0u8; 48], 0).is_err());
        assert!(tensor.retrieve(&mut [0u8; 8], 36).is_err());
    }

    #[test]
    fn unmapped_tensors_reject_host_access() {
        let Some(context) = test_context() else {
            return;
        };
        let mut tensor = Tensor::new(&context, 16).unwrap();
        if tensor.is_mapped() {
            return;
        }
        assert!(tensor.memory().is_none());
        assert!(tensor.update(&[0u8; 4], 0).is_err());
    }

    #[test]
    fn tensors_initialized_from_data_round_trip() {
        let Some(context) = test_context() else {
            return;
        };
        let data: [i32; 10] = [10, -5, 6, 45, 12, 122, i32::MAX, 789, 1500, -45123];
        let tensor = Tensor::from_bytes(&context, bytemuck::cast_slice(&data)).unwrap();
        assert_eq!(tensor.size_bytes(), 40);
        assert_ne!(tensor.address(), 0);

        let output = TypedBuffer::<i32>::new(&context, 10).unwrap();
        execute(
            &context,
            &retrieve_tensor(&tensor, &output, CopyRegion::default()),
        )
        .unwrap();
        assert_eq!(output.as_slice(), &data);
    }

    #[test]
    fn cross_context_copies_are_rejected() {
        let Some(context) = test_context() else {
            return;
        };
        let Ok(other) = crate::context::create_context(Vec::new()) else {
            return;
        };
        let buffer = Buffer::new(&context, 16).unwrap();
        let tensor = Tensor::new(&other, 16).unwrap();
        let err = execute(&context, &update_tensor(&buffer, &tensor, CopyRegion::default()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn whole_size_resolves_from_both_sides() {
        assert_eq!(resolve_copy_size(40, 0, 40, 0, WHOLE_SIZE).unwrap(), 40);
        assert_eq!(resolve_copy_size(40, 8, 40, 8, WHOLE_SIZE).unwrap(), 32);
        assert_eq!(resolve_copy_size(40, 16, 24, 0, WHOLE_SIZE).unwrap(), 24);
    }

    #[test]
    fn mismatched_spans_are_rejected() {
        let err = resolve_copy_size(40, 8, 40, 0, WHOLE_SIZE).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn out_of_bounds_regions_are_rejected() {
        assert!(resolve_copy_size(40, 32, 40, 0, 16).is_err());
        assert!(resolve_copy_size(40, 0, 40, 32, 16).is_err());
        assert!(resolve_copy_size(40, 48, 40, 48, WHOLE_SIZE).is_err());
    }

    #[test]
    fn explicit_sizes_pass_validation() {
        assert_eq!(resolve_copy_size(40, 20, 40, 0, 20).unwrap(), 20);
        assert_eq!(resolve_copy_size(40, 12, 40, 8, 24).unwrap(), 24);
    }
}
