//! Images, textures and the staging buffer that feeds them.

use std::sync::Arc;

use ash::vk;

use crate::alloc::ImageAlloc;
use crate::bindings::{BindingSlot, BoundValue, Parameter};
use crate::buffer::Buffer;
use crate::command::{Command, CommandRecorder};
use crate::context::{ContextHandle, Device};
use crate::error::{invalid_argument, Result};

/// Pixel formats supported for images and textures.
///
/// Discriminants match the Vulkan format values; [`ImageFormat::Unknown`]
/// is the "unsupported / unreflectable" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ImageFormat {
    R8G8B8A8Unorm = 37,
    R8G8B8A8Snorm = 38,
    R8G8B8A8Uint = 41,
    R8G8B8A8Sint = 42,
    R16G16B16A16Uint = 95,
    R16G16B16A16Sint = 96,
    R32Uint = 98,
    R32Sint = 99,
    R32Sfloat = 100,
    R32G32Uint = 101,
    R32G32Sint = 102,
    R32G32Sfloat = 103,
    R32G32B32A32Uint = 107,
    R32G32B32A32Sint = 108,
    R32G32B32A32Sfloat = 109,
    Unknown = 0x7FFF_FFFF,
}

impl ImageFormat {
    /// Bytes per pixel.
    pub fn element_size(self) -> Result<u64> {
        use ImageFormat::*;
        Ok(match self {
            R8G8B8A8Unorm | R8G8B8A8Snorm | R8G8B8A8Uint | R8G8B8A8Sint => 4,
            R16G16B16A16Uint | R16G16B16A16Sint => 8,
            R32Uint | R32Sint | R32Sfloat => 4,
            R32G32Uint | R32G32Sint | R32G32Sfloat => 8,
            R32G32B32A32Uint | R32G32B32A32Sint | R32G32B32A32Sfloat => 16,
            Unknown => return Err(invalid_argument("unknown image format")),
        })
    }

    pub(crate) fn as_vk(self) -> vk::Format {
        vk::Format::from_raw(self as i32)
    }
}

/// Texture coordinate wrapping per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    MirrorClampToEdge,
}

impl AddressMode {
    fn as_vk(self) -> vk::SamplerAddressMode {
        match self {
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::MirrorClampToEdge => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

impl Filter {
    fn as_vk(self) -> vk::Filter {
        match self {
            Filter::Nearest => vk::Filter::NEAREST,
            Filter::Linear => vk::Filter::LINEAR,
        }
    }
}

/// Sampler description attached to a [`Texture`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Sampler {
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub filter: Filter,
    pub unnormalized_coordinates: bool,
}

/// Whether sampling `format` with `filter` is supported on the device.
pub fn is_filter_supported(device: &Device, format: ImageFormat, filter: Filter) -> bool {
    let props = unsafe {
        device
            .instance
            .raw
            .get_physical_device_format_properties(device.physical, format.as_vk())
    };
    let needed = match filter {
        Filter::Nearest => vk::FormatFeatureFlags::SAMPLED_IMAGE,
        Filter::Linear => {
            vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
        }
    };
    props.optimal_tiling_features.contains(needed)
}

pub fn is_filter_supported_on(
    context: &ContextHandle,
    format: ImageFormat,
    filter: Filter,
) -> bool {
    is_filter_supported(&context.device_handle(), format, filter)
}

fn image_barrier<'a>(
    image: vk::Image,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier<'a> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        )
}

fn record_image_barrier(
    cmd: &CommandRecorder<'_>,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    barrier: vk::ImageMemoryBarrier<'_>,
) {
    unsafe {
        cmd.context.device.cmd_pipeline_barrier(
            cmd.buffer,
            src_stage,
            dst_stage,
            vk::DependencyFlags::BY_REGION,
            &[],
            &[],
            &[barrier],
        );
    }
}

fn check_positive_extent(width: u32, height: u32, depth: u32) -> Result<()> {
    if width == 0 || height == 0 || depth == 0 {
        return Err(invalid_argument("image dimensions must be positive"));
    }
    Ok(())
}

/// A storage-writable device image kept in `GENERAL` layout.
pub struct Image {
    context: ContextHandle,
    raw: ImageAlloc,
    format: ImageFormat,
    width: u32,
    height: u32,
    depth: u32,
}

impl Image {
    pub fn new(
        context: &ContextHandle,
        format: ImageFormat,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<Self> {
        check_positive_extent(width, height, depth)?;
        format.element_size()?;
        let raw = context.allocator.create_image(
            &context.device,
            format.as_vk(),
            width,
            height,
            depth,
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let image = Self {
            context: context.clone(),
            raw,
            format,
            width,
            height,
            depth,
        };

        // Move the fresh image into its working layout.
        context.one_time_submit(|cmd| {
            let barrier = image_barrier(
                image.raw.image,
                vk::AccessFlags::empty(),
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            );
            record_image_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                barrier,
            );
            Ok(())
        })?;
        Ok(image)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn size_bytes(&self) -> u64 {
        self.format.element_size().unwrap_or(0)
            * self.width as u64
            * self.height as u64
            * self.depth as u64
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.context
            .allocator
            .destroy_image(&self.context.device, &mut self.raw);
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("format", &self.format)
            .field("extent", &(self.width, self.height, self.depth))
            .finish()
    }
}

impl Parameter for Image {
    fn bind(&self, slot: &mut BindingSlot) -> Result<()> {
        slot.value = BoundValue::Image(
            vk::DescriptorImageInfo::default()
                .image_view(self.raw.view)
                .image_layout(vk::ImageLayout::GENERAL),
        );
        Ok(())
    }
}

/// A sampled read-only device image with an attached sampler.
pub struct Texture {
    context: ContextHandle,
    raw: ImageAlloc,
    sampler: vk::Sampler,
    format: ImageFormat,
    width: u32,
    height: u32,
    depth: u32,
}

impl Texture {
    pub fn new(
        context: &ContextHandle,
        format: ImageFormat,
        width: u32,
        height: u32,
        depth: u32,
        sampler: Sampler,
    ) -> Result<Self> {
        check_positive_extent(width, height, depth)?;
        format.element_size()?;
        let mut raw = context.allocator.create_image(
            &context.device,
            format.as_vk(),
            width,
            height,
            depth,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(sampler.filter.as_vk())
            .min_filter(sampler.filter.as_vk())
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(sampler.address_mode_u.as_vk())
            .address_mode_v(sampler.address_mode_v.as_vk())
            .address_mode_w(sampler.address_mode_w.as_vk())
            .unnormalized_coordinates(sampler.unnormalized_coordinates);
        let vk_sampler = match unsafe { context.device.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(err) => {
                context
                    .allocator
                    .destroy_image(&context.device, &mut raw);
                return Err(err.into());
            }
        };

        let texture = Self {
            context: context.clone(),
            raw,
            sampler: vk_sampler,
            format,
            width,
            height,
            depth,
        };

        // Sampling before the first upload reads an opaque but valid layout.
        context.one_time_submit(|cmd| {
            let barrier = image_barrier(
                texture.raw.image,
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_READ,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
            record_image_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                barrier,
            );
            Ok(())
        })?;
        Ok(texture)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn size_bytes(&self) -> u64 {
        self.format.element_size().unwrap_or(0)
            * self.width as u64
            * self.height as u64
            * self.depth as u64
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_sampler(self.sampler, None);
        }
        self.context
            .allocator
            .destroy_image(&self.context.device, &mut self.raw);
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("format", &self.format)
            .field("extent", &(self.width, self.height, self.depth))
            .finish()
    }
}

impl Parameter for Texture {
    fn bind(&self, slot: &mut BindingSlot) -> Result<()> {
        slot.value = BoundValue::Image(
            vk::DescriptorImageInfo::default()
                .sampler(self.sampler)
                .image_view(self.raw.view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );
        Ok(())
    }
}

/// Host staging buffer specialized to RGBA8 pixels with PNG round-trip.
pub struct ImageBuffer {
    inner: Buffer,
    width: u32,
    height: u32,
}

impl ImageBuffer {
    pub const FORMAT: ImageFormat = ImageFormat::R8G8B8A8Unorm;

    pub fn new(context: &ContextHandle, width: u32, height: u32) -> Result<Self> {
        check_positive_extent(width, height, 1)?;
        Ok(Self {
            inner: Buffer::new(context, width as u64 * height as u64 * 4)?,
            width,
            height,
        })
    }

    /// Decodes a PNG file into a fresh image buffer.
    pub fn load(context: &ContextHandle, path: impl AsRef<std::path::Path>) -> Result<Self> {
        let decoded = image::open(path)
            .map_err(|err| invalid_argument(format!("failed to decode image: {err}")))?
            .into_rgba8();
        Self::from_decoded(context, decoded)
    }

    /// Decodes an in-memory PNG into a fresh image buffer.
    pub fn load_memory(context: &ContextHandle, bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|err| invalid_argument(format!("failed to decode image: {err}")))?
            .into_rgba8();
        Self::from_decoded(context, decoded)
    }

    fn from_decoded(context: &ContextHandle, decoded: image::RgbaImage) -> Result<Self> {
        let (width, height) = decoded.dimensions();
        let mut buffer = Self::new(context, width, height)?;
        buffer.inner.memory_mut().copy_from_slice(decoded.as_raw());
        Ok(buffer)
    }

    /// Encodes the pixels as PNG with stride `width * 4`.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let view = image::RgbaImage::from_raw(self.width, self.height, self.inner.memory().to_vec())
            .ok_or_else(|| invalid_argument("pixel buffer does not match its dimensions"))?;
        view.save_with_format(path, image::ImageFormat::Png)
            .map_err(|err| invalid_argument(format!("failed to encode image: {err}")))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Allocates a matching storage image, optionally uploading the pixels.
    pub fn create_image(&self, copy: bool) -> Result<Image> {
        let image = Image::new(self.inner.context(), Self::FORMAT, self.width, self.height, 1)?;
        if copy {
            let command = update_image(&self.inner, &image);
            self.inner
                .context()
                .one_time_submit(|cmd| command.record(cmd))?;
        }
        Ok(image)
    }

    /// Allocates a matching texture, optionally uploading the pixels.
    pub fn create_texture(&self, sampler: Sampler, copy: bool) -> Result<Texture> {
        let texture = Texture::new(
            self.inner.context(),
            Self::FORMAT,
            self.width,
            self.height,
            1,
            sampler,
        )?;
        if copy {
            let command = update_texture(&self.inner, &texture);
            self.inner
                .context()
                .one_time_submit(|cmd| command.record(cmd))?;
        }
        Ok(texture)
    }
}

impl std::ops::Deref for ImageBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.inner
    }
}

impl std::ops::DerefMut for ImageBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.inner
    }
}

const SIZE_MISMATCH: &str = "source and destination must have the same size";
const DIFFERENT_CONTEXT: &str =
    "source and destination of a copy command must originate from the same context";

fn full_copy_region(width: u32, height: u32, depth: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1),
        )
        .image_extent(vk::Extent3D {
            width,
            height,
            depth,
        })
}

/// Copies an image into a host buffer, restoring `GENERAL` afterwards.
pub struct RetrieveImageCommand<'a> {
    source: &'a Image,
    destination: &'a Buffer,
}

pub fn retrieve_image<'a>(source: &'a Image, destination: &'a Buffer) -> RetrieveImageCommand<'a> {
    RetrieveImageCommand {
        source,
        destination,
    }
}

impl Command for RetrieveImageCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.source.context())?;
        if !Arc::ptr_eq(self.source.context(), self.destination.context()) {
            return Err(invalid_argument(DIFFERENT_CONTEXT));
        }
        if self.source.size_bytes() != self.destination.size_bytes() {
            return Err(invalid_argument(SIZE_MISMATCH));
        }

        cmd.stage_mask |= vk::PipelineStageFlags::TRANSFER;

        let barrier = image_barrier(
            self.source.raw.image,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        record_image_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            barrier,
        );

        let copy = full_copy_region(
            self.source.width(),
            self.source.height(),
            self.source.depth(),
        );
        unsafe {
            cmd.context.device.cmd_copy_image_to_buffer(
                cmd.buffer,
                self.source.raw.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.destination.vk_buffer(),
                &[copy],
            );
        }

        // Return the image layout and make the buffer host readable.
        let image_back = image_barrier(
            self.source.raw.image,
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::MEMORY_WRITE,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::GENERAL,
        );
        let buffer_ready = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.destination.vk_buffer())
            .size(vk::WHOLE_SIZE);
        unsafe {
            cmd.context.device.cmd_pipeline_barrier(
                cmd.buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::BY_REGION,
                &[],
                &[buffer_ready],
                &[image_back],
            );
        }
        Ok(())
    }
}

/// Copies a host buffer into an image, restoring `GENERAL` afterwards.
pub struct UpdateImageCommand<'a> {
    source: &'a Buffer,
    destination: &'a Image,
}

pub fn update_image<'a>(source: &'a Buffer, destination: &'a Image) -> UpdateImageCommand<'a> {
    UpdateImageCommand {
        source,
        destination,
    }
}

impl Command for UpdateImageCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.source.context())?;
        if !Arc::ptr_eq(self.source.context(), self.destination.context()) {
            return Err(invalid_argument(DIFFERENT_CONTEXT));
        }
        if self.source.size_bytes() != self.destination.size_bytes() {
            return Err(invalid_argument(SIZE_MISMATCH));
        }

        cmd.stage_mask |= vk::PipelineStageFlags::TRANSFER;

        let barrier = image_barrier(
            self.destination.raw.image,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        record_image_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            barrier,
        );

        let copy = full_copy_region(
            self.destination.width(),
            self.destination.height(),
            self.destination.depth(),
        );
        unsafe {
            cmd.context.device.cmd_copy_buffer_to_image(
                cmd.buffer,
                self.source.vk_buffer(),
                self.destination.raw.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
        }

        let barrier = image_barrier(
            self.destination.raw.image,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::GENERAL,
        );
        record_image_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
            barrier,
        );
        Ok(())
    }
}

/// Uploads a host buffer into a texture, leaving it shader readable.
pub struct UpdateTextureCommand<'a> {
    source: &'a Buffer,
    destination: &'a Texture,
}

pub fn update_texture<'a>(
    source: &'a Buffer,
    destination: &'a Texture,
) -> UpdateTextureCommand<'a> {
    UpdateTextureCommand {
        source,
        destination,
    }
}

impl Command for UpdateTextureCommand<'_> {
    fn record(&self, cmd: &mut CommandRecorder<'_>) -> Result<()> {
        cmd.check_context(self.source.context())?;
        if !Arc::ptr_eq(self.source.context(), self.destination.context()) {
            return Err(invalid_argument(DIFFERENT_CONTEXT));
        }
        if self.source.size_bytes() != self.destination.size_bytes() {
            return Err(invalid_argument(SIZE_MISMATCH));
        }

        cmd.stage_mask |= vk::PipelineStageFlags::TRANSFER;

        // The old content is discarded, so the transition may come from
        // UNDEFINED no matter the current layout.
        let barrier = image_barrier(
            self.destination.raw.image,
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        record_image_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::TRANSFER,
            barrier,
        );

        let copy = full_copy_region(
            self.destination.width(),
            self.destination.height(),
            self.destination.depth(),
        );
        unsafe {
            cmd.context.device.cmd_copy_buffer_to_image(
                cmd.buffer,
                self.source.vk_buffer(),
                self.destination.raw.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
        }

        let barrier = image_barrier(
            self.destination.raw.image,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        record_image_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            barrier,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::execute;
    use crate::testing::test_context;

    #[test]
    fn image_buffers_round_trip_through_images() {
        let Some(context) = test_context() else {
            return;
        };
        let mut upload = ImageBuffer::new(&context, 4, 4).unwrap();
        for (index, byte) in upload.memory_mut().iter_mut().enumerate() {
            *byte = index as u8;
        }

        let image = upload.create_image(true).unwrap();
        assert_eq!(image.width(), 4);
        assert_eq!(image.height(), 4);
        assert_eq!(image.size_bytes(), 64);

        let download = Buffer::new(&context, 64).unwrap();
        execute(&context, &retrieve_image(&image, &download)).unwrap();
        assert_eq!(download.memory(), upload.memory());
    }

    #[test]
    fn textures_accept_uploads() {
        let Some(context) = test_context() else {
            return;
        };
        if !is_filter_supported_on(&context, ImageFormat::R8G8B8A8Unorm, Filter::Linear) {
            return;
        }
        let upload = ImageBuffer::new(&context, 2, 2).unwrap();
        let texture = upload.create_texture(Sampler::default(), true).unwrap();
        assert_eq!(texture.size_bytes(), 16);
    }

    #[test]
    fn size_mismatch_is_rejected_at_record_time() {
        let Some(context) = test_context() else {
            return;
        };
        let image = Image::new(&context, ImageFormat::R32Sint, 4, 1, 1).unwrap();
        let small = Buffer::new(&context, 8).unwrap();
        assert!(execute(&context, &retrieve_image(&image, &small)).is_err());
        assert!(execute(&context, &update_image(&small, &image)).is_err());
    }

    #[test]
    fn copy_commands_survive_moves() {
        let Some(context) = test_context() else {
            return;
        };
        let mut upload = ImageBuffer::new(&context, 2, 2).unwrap();
        upload.memory_mut().fill(0x5A);
        let image = upload.create_image(true).unwrap();
        let download = Buffer::new(&context, 16).unwrap();

        // Move the command before recording it.
        let command = retrieve_image(&image, &download);
        let moved = command;
        execute(&context, &moved).unwrap();
        assert!(download.memory().iter().all(|&byte| byte == 0x5A));
    }

    #[test]
    fn element_sizes_follow_channel_layout() {
        assert_eq!(ImageFormat::R8G8B8A8Unorm.element_size().unwrap(), 4);
        assert_eq!(ImageFormat::R16G16B16A16Sint.element_size().unwrap(), 8);
        assert_eq!(ImageFormat::R32Sfloat.element_size().unwrap(), 4);
        assert_eq!(ImageFormat::R32G32Uint.element_size().unwrap(), 8);
        assert_eq!(ImageFormat::R32G32B32A32Sfloat.element_size().unwrap(), 16);
        assert!(ImageFormat::Unknown.element_size().is_err());
    }

    #[test]
    fn formats_round_trip_through_vulkan_values() {
        assert_eq!(ImageFormat::R8G8B8A8Unorm.as_vk(), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(ImageFormat::R32Sint.as_vk(), vk::Format::R32_SINT);
        assert_eq!(
            ImageFormat::R32G32B32A32Sfloat.as_vk(),
            vk::Format::R32G32B32A32_SFLOAT
        );
    }
}
