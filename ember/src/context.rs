//! Device discovery, context creation and the capability extension trait.

use std::any::Any;
use std::ffi::{c_void, CStr};
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::alloc::Allocator;
use crate::command::CommandRecorder;
use crate::error::{Error, Result};
use crate::instance::{self, VulkanInstance};

/// Shared handle to a [`Context`]. Every resource holds one, so the
/// context outlives everything created from it.
pub type ContextHandle = Arc<Context>;

/// Basic facts about a physical device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_discrete: bool,
}

/// A physical device candidate for context creation.
#[derive(Clone)]
pub struct Device {
    pub(crate) instance: Arc<VulkanInstance>,
    pub(crate) physical: vk::PhysicalDevice,
    pub(crate) supported_extensions: Vec<String>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &device_info_raw(&self.instance.raw, self.physical).name)
            .finish()
    }
}

/// A capability module a context can be created with.
///
/// Implementations declare the device-level extensions they need, check
/// device support, contribute feature structs to the device-creation
/// chain and may cache device properties after creation.
pub trait Extension: Send + Sync {
    /// Stable name, also used to look the extension up on a context.
    fn name(&self) -> &'static str;
    /// Whether the given device can satisfy this extension.
    fn is_device_supported(&self, device: &Device) -> bool;
    /// Device-level extension names to enable.
    fn device_extensions(&self) -> Vec<&'static CStr> {
        Vec::new()
    }
    /// Feature bits living in the core feature structs.
    fn base_features(
        &self,
        _base: &mut vk::PhysicalDeviceFeatures,
        _vulkan12: &mut vk::PhysicalDeviceVulkan12Features<'_>,
    ) {
    }
    /// Links extension feature structs in front of `head` and returns the
    /// new chain head.
    ///
    /// # Safety
    /// Boxes pushed to `keep` must not be dropped or moved until device
    /// creation returned; the chain stores raw pointers into them.
    unsafe fn chain_features(
        &self,
        head: *mut c_void,
        _keep: &mut Vec<Box<dyn Any>>,
    ) -> *mut c_void {
        head
    }
    /// Called once after device creation to cache device properties.
    fn finalize(&mut self, _instance: &ash::Instance, _device: vk::PhysicalDevice) {}
    fn as_any(&self) -> &dyn Any;
}

const QUEUE_FLAGS: vk::QueueFlags =
    vk::QueueFlags::from_raw(vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw());

fn find_queue_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    families
        .iter()
        .position(|family| family.queue_flags.contains(QUEUE_FLAGS))
        .map(|index| index as u32)
}

fn supported_device_extensions(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> Vec<String> {
    let props = unsafe { instance.enumerate_device_extension_properties(device) }
        .unwrap_or_default();
    props
        .iter()
        .map(|ext| {
            unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

/// Core requirements every context needs: a compute + transfer queue,
/// timeline semaphores, buffer device addresses, host query reset and
/// push descriptors.
fn supports_core(device: &Device) -> bool {
    if find_queue_family(&device.instance.raw, device.physical).is_none() {
        return false;
    }
    let push_descriptor = ash::khr::push_descriptor::NAME.to_string_lossy();
    if !device.supported_extensions.iter().any(|ext| *ext == push_descriptor) {
        return false;
    }
    let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan12);
    unsafe {
        device
            .instance
            .raw
            .get_physical_device_features2(device.physical, &mut features)
    };
    vulkan12.timeline_semaphore == vk::TRUE
        && vulkan12.buffer_device_address == vk::TRUE
        && vulkan12.host_query_reset == vk::TRUE
}

fn device_info_raw(instance: &ash::Instance, device: vk::PhysicalDevice) -> DeviceInfo {
    let props = unsafe { instance.get_physical_device_properties(device) };
    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    DeviceInfo {
        name,
        is_discrete: props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
    }
}

/// Lists all devices that satisfy the core requirements.
pub fn enumerate_devices() -> Result<Vec<Device>> {
    let instance = instance::acquire()?;
    let physical = unsafe { instance.raw.enumerate_physical_devices() }.map_err(Error::from)?;
    let devices = physical
        .into_iter()
        .map(|physical| Device {
            supported_extensions: supported_device_extensions(&instance.raw, physical),
            instance: instance.clone(),
            physical,
        })
        .filter(supports_core)
        .collect();
    Ok(devices)
}

/// Whether the device satisfies the core requirements and all extensions.
pub fn is_device_suitable(device: &Device, extensions: &[Box<dyn Extension>]) -> bool {
    supports_core(device) && extensions.iter().all(|ext| ext.is_device_supported(device))
}

pub fn get_device_info(device: &Device) -> DeviceInfo {
    device_info_raw(&device.instance.raw, device.physical)
}

struct OneTimeSubmit {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

/// Shared root of the runtime: logical device, queue, pools, pipeline
/// cache, allocator and the set of enabled extensions.
pub struct Context {
    pub(crate) instance: Arc<VulkanInstance>,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) queue: vk::Queue,
    pub(crate) queue_family: u32,
    pub(crate) pipeline_cache: vk::PipelineCache,
    pub(crate) push_descriptor: ash::khr::push_descriptor::Device,
    pub(crate) accel_loader: Option<ash::khr::acceleration_structure::Device>,
    pub(crate) rt_pipeline_loader: Option<ash::khr::ray_tracing_pipeline::Device>,
    pub(crate) device_fault_loader: Option<ash::ext::device_fault::Device>,
    pub(crate) allocator: Allocator,
    pub(crate) subroutine_pool: Mutex<vk::CommandPool>,
    one_time: Mutex<OneTimeSubmit>,
    sequence_pools: Mutex<Vec<vk::CommandPool>>,
    supported_extensions: Vec<String>,
    extensions: Vec<Box<dyn Extension>>,
}

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device_info().name)
            .finish_non_exhaustive()
    }
}

/// Creates a context on an explicit device.
pub fn create_context_for(
    device: &Device,
    mut extensions: Vec<Box<dyn Extension>>,
) -> Result<ContextHandle> {
    if !supports_core(device) {
        return Err(Error::NotAvailable(
            "device does not meet the core requirements".into(),
        ));
    }
    for ext in &extensions {
        if !ext.is_device_supported(device) {
            return Err(Error::ExtensionUnavailable(ext.name().into()));
        }
    }
    let mut context = Context::new(device.clone(), &mut extensions)?;
    context.extensions = extensions;
    Ok(Arc::new(context))
}

/// Creates a context, choosing the first discrete device that satisfies
/// all extensions, else the first suitable one.
pub fn create_context(mut extensions: Vec<Box<dyn Extension>>) -> Result<ContextHandle> {
    let devices = enumerate_devices()?;
    if devices.is_empty() {
        return Err(Error::NotAvailable("no suitable device found".into()));
    }

    // Distinguish a missing extension from a missing device.
    for ext in &extensions {
        if !devices.iter().any(|device| ext.is_device_supported(device)) {
            return Err(Error::ExtensionUnavailable(ext.name().into()));
        }
    }

    let mut fallback = None;
    for device in &devices {
        if !extensions.iter().all(|ext| ext.is_device_supported(device)) {
            continue;
        }
        if get_device_info(device).is_discrete {
            let mut context = Context::new(device.clone(), &mut extensions)?;
            context.extensions = extensions;
            return Ok(Arc::new(context));
        }
        if fallback.is_none() {
            fallback = Some(device.clone());
        }
    }

    match fallback {
        Some(device) => {
            let mut context = Context::new(device, &mut extensions)?;
            context.extensions = extensions;
            Ok(Arc::new(context))
        }
        None => Err(Error::ExtensionUnavailable(
            extensions
                .iter()
                .map(|ext| ext.name())
                .collect::<Vec<_>>()
                .join(", "),
        )),
    }
}

impl Context {
    fn new(handle: Device, extensions: &mut [Box<dyn Extension>]) -> Result<Context> {
        let Device {
            instance,
            physical: physical_device,
            supported_extensions,
        } = handle;

        let queue_family = find_queue_family(&instance.raw, physical_device).ok_or_else(|| {
            Error::NotAvailable("device has no compute and transfer queue".into())
        })?;

        // Collect device extensions: push descriptors plus whatever the
        // capability extensions ask for.
        let mut extension_names = vec![ash::khr::push_descriptor::NAME];
        for ext in extensions.iter() {
            for name in ext.device_extensions() {
                if !extension_names.contains(&name) {
                    extension_names.push(name);
                }
            }
        }
        let extension_ptrs: Vec<*const std::ffi::c_char> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        // Feature chain: core 1.2 features first, extension structs after.
        let mut keep: Vec<Box<dyn Any>> = Vec::new();
        let mut head: *mut c_void = std::ptr::null_mut();
        for ext in extensions.iter() {
            head = unsafe { ext.chain_features(head, &mut keep) };
        }
        let mut base = vk::PhysicalDeviceFeatures::default();
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .host_query_reset(true);
        for ext in extensions.iter() {
            ext.base_features(&mut base, &mut vulkan12);
        }
        vulkan12.p_next = head;
        let mut features = vk::PhysicalDeviceFeatures2::default().features(base);
        features.p_next = &mut vulkan12 as *mut _ as *mut c_void;

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities);
        let queue_infos = [queue_info];
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features);

        let device = unsafe {
            instance
                .raw
                .create_device(physical_device, &device_info, None)
        }
        .map_err(Error::from)?;
        drop(keep);

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let has = |name: &&CStr| extension_names.contains(name);
        let push_descriptor = ash::khr::push_descriptor::Device::new(&instance.raw, &device);
        let accel_loader = has(&ash::khr::acceleration_structure::NAME)
            .then(|| ash::khr::acceleration_structure::Device::new(&instance.raw, &device));
        let rt_pipeline_loader = has(&ash::khr::ray_tracing_pipeline::NAME)
            .then(|| ash::khr::ray_tracing_pipeline::Device::new(&instance.raw, &device));
        let device_fault_loader = has(&ash::ext::device_fault::NAME)
            .then(|| ash::ext::device_fault::Device::new(&instance.raw, &device));

        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family);
        let subroutine_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(Error::from)?;
        let one_time_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(Error::from)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(one_time_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let one_time_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(Error::from)?[0];
        let one_time_fence = unsafe {
            device.create_fence(&vk::FenceCreateInfo::default(), None)
        }
        .map_err(Error::from)?;

        let cache_info = vk::PipelineCacheCreateInfo::default();
        let pipeline_cache = unsafe { device.create_pipeline_cache(&cache_info, None) }
            .map_err(Error::from)?;

        let allocator = Allocator::new(&instance.raw, physical_device);

        for ext in extensions.iter_mut() {
            ext.finalize(&instance.raw, physical_device);
        }

        Ok(Context {
            instance,
            physical_device,
            device,
            queue,
            queue_family,
            pipeline_cache,
            push_descriptor,
            accel_loader,
            rt_pipeline_loader,
            device_fault_loader,
            allocator,
            subroutine_pool: Mutex::new(subroutine_pool),
            one_time: Mutex::new(OneTimeSubmit {
                pool: one_time_pool,
                buffer: one_time_buffer,
                fence: one_time_fence,
            }),
            sequence_pools: Mutex::new(Vec::new()),
            supported_extensions,
            extensions: Vec::new(),
        })
    }

    pub fn device_info(&self) -> DeviceInfo {
        device_info_raw(&self.instance.raw, self.physical_device)
    }

    /// Returns a device handle for the context's physical device, usable
    /// with the support queries.
    pub fn device_handle(&self) -> Device {
        Device {
            instance: self.instance.clone(),
            physical: self.physical_device,
            supported_extensions: self.supported_extensions.clone(),
        }
    }

    pub fn is_extension_enabled(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| ext.name() == name)
    }

    pub fn enabled_extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(|ext| ext.name())
    }

    pub(crate) fn extension<T: Any>(&self, name: &str) -> Option<&T> {
        self.extensions
            .iter()
            .find(|ext| ext.name() == name)
            .and_then(|ext| ext.as_any().downcast_ref())
    }

    /// Records and synchronously runs commands on the shared one-time
    /// command buffer, waiting on the reusable fence.
    pub(crate) fn one_time_submit(
        &self,
        record: impl FnOnce(&mut CommandRecorder<'_>) -> Result<()>,
    ) -> Result<()> {
        let guard = self.one_time.lock().unwrap();
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(guard.buffer, &begin)
                .map_err(Error::from)?;
        }

        let mut recorder = CommandRecorder {
            context: self,
            buffer: guard.buffer,
            stage_mask: vk::PipelineStageFlags::empty(),
        };
        let recorded = record(&mut recorder);

        unsafe {
            self.device
                .end_command_buffer(guard.buffer)
                .map_err(Error::from)?;
        }
        // Reset even when recording failed so the buffer stays reusable.
        if let Err(err) = recorded {
            unsafe {
                let _ = self
                    .device
                    .reset_command_pool(guard.pool, vk::CommandPoolResetFlags::empty());
            }
            return Err(err);
        }

        let buffers = [guard.buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&buffers);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit], guard.fence)
                .map_err(Error::from)?;
            self.device
                .wait_for_fences(&[guard.fence], true, u64::MAX)
                .map_err(Error::from)?;
            self.device.reset_fences(&[guard.fence]).map_err(Error::from)?;
            self.device
                .reset_command_pool(guard.pool, vk::CommandPoolResetFlags::empty())
                .map_err(Error::from)?;
        }
        Ok(())
    }

    /// Submits an externally recorded command buffer on the reusable
    /// fence and waits for it.
    pub(crate) fn submit_subroutine(&self, buffer: vk::CommandBuffer) -> Result<()> {
        let guard = self.one_time.lock().unwrap();
        let buffers = [buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&buffers);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit], guard.fence)
                .map_err(Error::from)?;
            self.device
                .wait_for_fences(&[guard.fence], true, u64::MAX)
                .map_err(Error::from)?;
            self.device.reset_fences(&[guard.fence]).map_err(Error::from)?;
        }
        Ok(())
    }

    /// Pops a command pool from the LIFO cache or creates a fresh one.
    pub(crate) fn fetch_sequence_pool(&self) -> Result<vk::CommandPool> {
        if let Some(pool) = self.sequence_pools.lock().unwrap().pop() {
            return Ok(pool);
        }
        let info = vk::CommandPoolCreateInfo::default().queue_family_index(self.queue_family);
        unsafe { self.device.create_command_pool(&info, None) }.map_err(Error::from)
    }

    /// Returns a pool to the cache once its submission completed.
    pub(crate) fn recycle_sequence_pool(&self, pool: vk::CommandPool) {
        self.sequence_pools.lock().unwrap().push(pool);
    }

    #[cfg(test)]
    pub(crate) fn sequence_pool_count(&self) -> usize {
        self.sequence_pools.lock().unwrap().len()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for pool in self.sequence_pools.lock().unwrap().drain(..) {
                self.device.destroy_command_pool(pool, None);
            }
            let one_time = self.one_time.lock().unwrap();
            self.device.destroy_fence(one_time.fence, None);
            self.device.destroy_command_pool(one_time.pool, None);
            drop(one_time);
            self.device
                .destroy_command_pool(*self.subroutine_pool.lock().unwrap(), None);
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            self.device.destroy_device(None);
        }
    }
}
