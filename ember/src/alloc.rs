//! Device memory allocation.
//!
//! Every resource gets a dedicated allocation; the allocator's job is
//! picking the right memory type from the requested access pattern,
//! keeping host-visible allocations persistently mapped and rounding
//! flush/invalidate ranges to the non-coherent atom size.

use ash::vk;

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Host access requested for an allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// Host reads and writes in no particular order.
        const HOST_ACCESS_RANDOM = 1 << 0;
        /// Host writes sequentially, never reads.
        const HOST_ACCESS_SEQUENTIAL_WRITE = 1 << 1;
        /// Fall back to unmapped device-local memory when no host-visible
        /// device-local type exists; the caller transfers instead.
        const HOST_ACCESS_ALLOW_TRANSFER_INSTEAD = 1 << 2;
        /// Keep the allocation persistently mapped.
        const MAPPED = 1 << 3;
    }
}

/// A single device memory block, possibly mapped.
pub(crate) struct Allocation {
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub mapped: *mut u8,
    pub coherent: bool,
}

impl Allocation {
    pub fn is_mapped(&self) -> bool {
        !self.mapped.is_null()
    }
}

/// Picks memory types and creates buffers and images.
pub(crate) struct Allocator {
    memory_props: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: u64,
}

/// A buffer with its backing allocation. Destroyed via [`Allocator::destroy_buffer`].
pub(crate) struct BufferAlloc {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
}

/// An image with view and backing allocation. Destroyed via [`Allocator::destroy_image`].
pub(crate) struct ImageAlloc {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Allocation,
}

impl Allocator {
    pub fn new(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let memory_props =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let limits = unsafe { instance.get_physical_device_properties(physical_device) }.limits;
        Self {
            memory_props,
            non_coherent_atom_size: limits.non_coherent_atom_size.max(1),
        }
    }

    fn memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let candidates = (0..self.memory_props.memory_type_count).filter(|i| {
            let suitable = type_bits & (1 << i) != 0;
            let flags = self.memory_props.memory_types[*i as usize].property_flags;
            suitable && flags.contains(required)
        });
        // First pass honors the preference, second takes anything that fits.
        candidates
            .clone()
            .find(|i| {
                self.memory_props.memory_types[*i as usize]
                    .property_flags
                    .contains(preferred)
            })
            .or_else(|| candidates.clone().next())
    }

    /// Selects a memory type for the requested access pattern. Returns the
    /// type index and whether the allocation should be mapped.
    fn select(&self, type_bits: u32, flags: AllocFlags) -> Result<(u32, bool)> {
        let host_access = flags
            .intersects(AllocFlags::HOST_ACCESS_RANDOM | AllocFlags::HOST_ACCESS_SEQUENTIAL_WRITE);
        if !host_access {
            let index = self
                .memory_type(type_bits, vk::MemoryPropertyFlags::empty(), vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .ok_or(Error::OutOfDeviceMemory)?;
            return Ok((index, false));
        }

        let required = if flags.contains(AllocFlags::HOST_ACCESS_RANDOM) {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::HOST_VISIBLE
        };
        let preferred = if flags.contains(AllocFlags::HOST_ACCESS_RANDOM) {
            vk::MemoryPropertyFlags::HOST_CACHED
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_COHERENT
        };

        if flags.contains(AllocFlags::HOST_ACCESS_ALLOW_TRANSFER_INSTEAD) {
            // Mapped device-local memory or nothing; the caller copies
            // through the transfer queue when we return an unmapped type.
            let device_host = vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::DEVICE_LOCAL;
            if let Some(index) = self.memory_type(type_bits, device_host, preferred) {
                return Ok((index, flags.contains(AllocFlags::MAPPED)));
            }
            let index = self
                .memory_type(type_bits, vk::MemoryPropertyFlags::empty(), vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .ok_or(Error::OutOfDeviceMemory)?;
            return Ok((index, false));
        }

        let index = self
            .memory_type(type_bits, required, preferred)
            .ok_or(Error::OutOfDeviceMemory)?;
        Ok((index, flags.contains(AllocFlags::MAPPED)))
    }

    fn allocate(
        &self,
        device: &ash::Device,
        requirements: vk::MemoryRequirements,
        flags: AllocFlags,
        device_address: bool,
    ) -> Result<Allocation> {
        let (memory_type, map) = self.select(requirements.memory_type_bits, flags)?;
        let type_flags = self.memory_props.memory_types[memory_type as usize].property_flags;

        let mut allocate_flags = vk::MemoryAllocateFlagsInfo::default();
        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        if device_address {
            allocate_flags = allocate_flags.flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
            info = info.push_next(&mut allocate_flags);
        }
        let memory = unsafe { device.allocate_memory(&info, None) }.map_err(Error::from)?;

        let mapped = if map {
            let pointer = unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };
            match pointer {
                Ok(pointer) => pointer as *mut u8,
                Err(err) => {
                    unsafe { device.free_memory(memory, None) };
                    return Err(err.into());
                }
            }
        } else {
            std::ptr::null_mut()
        };

        Ok(Allocation {
            memory,
            size: requirements.size,
            mapped,
            coherent: type_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
        })
    }

    pub fn create_buffer(
        &self,
        device: &ash::Device,
        size: u64,
        usage: vk::BufferUsageFlags,
        flags: AllocFlags,
    ) -> Result<BufferAlloc> {
        self.create_buffer_aligned(device, size, 0, usage, flags)
    }

    /// Alignment only raises the allocation's own; each allocation is
    /// dedicated so the buffer starts at the block base.
    pub fn create_buffer_aligned(
        &self,
        device: &ash::Device,
        size: u64,
        _alignment: u64,
        usage: vk::BufferUsageFlags,
        flags: AllocFlags,
    ) -> Result<BufferAlloc> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&info, None) }.map_err(Error::from)?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let device_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let allocation = match self.allocate(device, requirements, flags, device_address) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };
        if let Err(err) = unsafe { device.bind_buffer_memory(buffer, allocation.memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(allocation.memory, None);
            }
            return Err(err.into());
        }
        Ok(BufferAlloc { buffer, allocation })
    }

    pub fn destroy_buffer(&self, device: &ash::Device, alloc: &mut BufferAlloc) {
        unsafe {
            device.destroy_buffer(alloc.buffer, None);
            device.free_memory(alloc.allocation.memory, None);
        }
        alloc.buffer = vk::Buffer::null();
        alloc.allocation.memory = vk::DeviceMemory::null();
        alloc.allocation.mapped = std::ptr::null_mut();
    }

    pub fn create_image(
        &self,
        device: &ash::Device,
        format: vk::Format,
        width: u32,
        height: u32,
        depth: u32,
        usage: vk::ImageUsageFlags,
    ) -> Result<ImageAlloc> {
        let image_type = if depth > 1 {
            vk::ImageType::TYPE_3D
        } else if height > 1 {
            vk::ImageType::TYPE_2D
        } else {
            vk::ImageType::TYPE_1D
        };
        let info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(format)
            .extent(vk::Extent3D { width, height, depth })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&info, None) }.map_err(Error::from)?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = match self.allocate(device, requirements, AllocFlags::empty(), false) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };
        let bind = unsafe { device.bind_image_memory(image, allocation.memory, 0) };
        if let Err(err) = bind {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(allocation.memory, None);
            }
            return Err(err.into());
        }

        let view_type = match image_type {
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            vk::ImageType::TYPE_2D => vk::ImageViewType::TYPE_2D,
            _ => vk::ImageViewType::TYPE_1D,
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(allocation.memory, None);
                }
                return Err(err.into());
            }
        };

        Ok(ImageAlloc { image, view, allocation })
    }

    pub fn destroy_image(&self, device: &ash::Device, alloc: &mut ImageAlloc) {
        unsafe {
            device.destroy_image_view(alloc.view, None);
            device.destroy_image(alloc.image, None);
            device.free_memory(alloc.allocation.memory, None);
        }
        alloc.image = vk::Image::null();
        alloc.view = vk::ImageView::null();
        alloc.allocation.memory = vk::DeviceMemory::null();
    }

    /// Rounds a mapped range to the non-coherent atom size.
    fn atom_range(&self, allocation: &Allocation, offset: u64, size: u64) -> (u64, u64) {
        let atom = self.non_coherent_atom_size;
        let start = offset / atom * atom;
        let end = if size == vk::WHOLE_SIZE || offset + size >= allocation.size {
            allocation.size
        } else {
            ((offset + size) + atom - 1) / atom * atom
        };
        (start, (end - start).min(allocation.size - start))
    }

    pub fn flush(
        &self,
        device: &ash::Device,
        allocation: &Allocation,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        if allocation.coherent {
            return Ok(());
        }
        let (offset, size) = self.atom_range(allocation, offset, size);
        let range = vk::MappedMemoryRange::default()
            .memory(allocation.memory)
            .offset(offset)
            .size(size);
        unsafe { device.flush_mapped_memory_ranges(&[range]) }.map_err(Error::from)
    }

    pub fn invalidate(
        &self,
        device: &ash::Device,
        allocation: &Allocation,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        if allocation.coherent {
            return Ok(());
        }
        let (offset, size) = self.atom_range(allocation, offset, size);
        let range = vk::MappedMemoryRange::default()
            .memory(allocation.memory)
            .offset(offset)
            .size(size);
        unsafe { device.invalidate_mapped_memory_ranges(&[range]) }.map_err(Error::from)
    }

}

// Mapped pointers refer to device memory that lives as long as the
// allocation; handles themselves are plain identifiers.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}
