//! Process-wide Vulkan instance.
//!
//! The instance behaves like a refcounted singleton: every [`Context`]
//! holds a strong reference and the instance is torn down once the last
//! one drops. Debugging must be configured before the first context is
//! created since validation layers are an instance-level construct.
//!
//! [`Context`]: crate::Context

use std::ffi::{c_void, CStr};
use std::sync::{Arc, Mutex, Weak};

use ash::vk;

use crate::error::{invalid_argument, Error, Result};

const ENGINE_NAME: &CStr = c"ember";
const ENGINE_VERSION: u32 = vk::make_api_version(0, 0, 1, 0);
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

bitflags::bitflags! {
    /// Severity of a validation message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugSeverity: u32 {
        const VERBOSE = 1 << 0;
        const INFO = 1 << 4;
        const WARNING = 1 << 8;
        const ERROR = 1 << 12;
    }
}

/// A single message reported by the validation layer.
#[derive(Debug, Clone)]
pub struct DebugMessage {
    pub severity: DebugSeverity,
    pub id_name: String,
    pub id_number: i32,
    pub message: String,
}

/// Validation features to enable on the instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugOptions {
    pub enable_print: bool,
    pub enable_gpu_validation: bool,
    pub enable_synchronization_validation: bool,
    pub enable_thread_safety_validation: bool,
    pub enable_api_validation: bool,
}

pub type DebugCallback = Box<dyn Fn(&DebugMessage) + Send + Sync>;

struct DebugConfig {
    options: DebugOptions,
    callback: Option<DebugCallback>,
}

static DEBUG_CONFIG: Mutex<Option<DebugConfig>> = Mutex::new(None);
static INSTANCE: Mutex<Option<Weak<VulkanInstance>>> = Mutex::new(None);

/// Returns true when a Vulkan loader is present on this system.
pub fn is_api_available() -> bool {
    unsafe { ash::Entry::load().is_ok() }
}

/// Returns true when the Khronos validation layer is installed.
pub fn is_debug_available() -> bool {
    let Ok(entry) = (unsafe { ash::Entry::load() }) else {
        return false;
    };
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers.iter().any(|layer| {
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER
    })
}

/// Configures validation for all contexts created afterwards.
///
/// Must be called before the first context is created; the validation
/// layer can only be attached while the instance is constructed. Messages
/// go to `callback` when given, otherwise to the `log` crate.
pub fn configure_debug(options: DebugOptions, callback: Option<DebugCallback>) -> Result<()> {
    let alive = INSTANCE
        .lock()
        .unwrap()
        .as_ref()
        .is_some_and(|weak| weak.strong_count() > 0);
    if alive {
        return Err(invalid_argument(
            "debug must be configured before the first context is created",
        ));
    }
    *DEBUG_CONFIG.lock().unwrap() = Some(DebugConfig { options, callback });
    Ok(())
}

unsafe extern "system" fn messenger_trampoline(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    let data = &*data;
    let id_name = if data.p_message_id_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(data.p_message_id_name)
            .to_string_lossy()
            .into_owned()
    };
    let text = if data.p_message.is_null() {
        String::new()
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy().into_owned()
    };
    let message = DebugMessage {
        severity: DebugSeverity::from_bits_truncate(severity.as_raw() as u32),
        id_name,
        id_number: data.message_id_number,
        message: text,
    };

    let config = DEBUG_CONFIG.lock().unwrap();
    match config.as_ref().and_then(|c| c.callback.as_ref()) {
        Some(callback) => callback(&message),
        None => {
            let line = format!("({}: {}) {}", message.id_number, message.id_name, message.message);
            if message.severity.contains(DebugSeverity::ERROR) {
                log::error!("{line}");
            } else if message.severity.contains(DebugSeverity::WARNING) {
                log::warn!("{line}");
            } else {
                log::debug!("{line}");
            }
        }
    }

    // Never interrupt the call that triggered the message.
    vk::FALSE
}

/// Owns the raw instance and the optional messenger.
pub(crate) struct VulkanInstance {
    /// Keeps the dynamically loaded Vulkan library alive.
    #[allow(dead_code)]
    entry: ash::Entry,
    pub raw: ash::Instance,
    messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

// Raw handles are plain identifiers; the loader is thread safe.
unsafe impl Send for VulkanInstance {}
unsafe impl Sync for VulkanInstance {}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

fn message_severity() -> vk::DebugUtilsMessageSeverityFlagsEXT {
    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
}

fn message_type() -> vk::DebugUtilsMessageTypeFlagsEXT {
    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
}

fn validation_features(
    options: &DebugOptions,
) -> (Vec<vk::ValidationFeatureEnableEXT>, Vec<vk::ValidationFeatureDisableEXT>) {
    let mut enable = Vec::new();
    let mut disable = Vec::new();
    if options.enable_print {
        enable.push(vk::ValidationFeatureEnableEXT::DEBUG_PRINTF);
    }
    if options.enable_gpu_validation {
        enable.push(vk::ValidationFeatureEnableEXT::GPU_ASSISTED);
    }
    if options.enable_synchronization_validation {
        enable.push(vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION);
    }
    if !options.enable_thread_safety_validation {
        disable.push(vk::ValidationFeatureDisableEXT::THREAD_SAFETY);
    }
    if options.enable_api_validation {
        enable.push(vk::ValidationFeatureEnableEXT::BEST_PRACTICES);
    } else {
        disable.push(vk::ValidationFeatureDisableEXT::API_PARAMETERS);
        disable.push(vk::ValidationFeatureDisableEXT::OBJECT_LIFETIMES);
        if !options.enable_gpu_validation {
            disable.push(vk::ValidationFeatureDisableEXT::CORE_CHECKS);
        }
        disable.push(vk::ValidationFeatureDisableEXT::UNIQUE_HANDLES);
    }
    (enable, disable)
}

fn create_instance() -> Result<Arc<VulkanInstance>> {
    let entry = unsafe { ash::Entry::load() }
        .map_err(|err| Error::NotAvailable(err.to_string()))?;

    let config = DEBUG_CONFIG.lock().unwrap();
    let debug = config.as_ref().map(|c| c.options);
    let validation_present = debug.is_some() && {
        let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
        let present = layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        });
        if !present {
            log::warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
        }
        present
    };
    drop(config);

    let app_info = vk::ApplicationInfo::default()
        .application_name(ENGINE_NAME)
        .application_version(ENGINE_VERSION)
        .engine_name(ENGINE_NAME)
        .engine_version(ENGINE_VERSION)
        .api_version(vk::API_VERSION_1_2);

    let mut layer_ptrs = Vec::new();
    let mut extension_ptrs = Vec::new();
    if validation_present {
        layer_ptrs.push(VALIDATION_LAYER.as_ptr());
        extension_ptrs.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let mut info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layer_ptrs)
        .enabled_extension_names(&extension_ptrs);

    let (enables, disables) = validation_features(&debug.unwrap_or_default());
    let mut features = vk::ValidationFeaturesEXT::default()
        .enabled_validation_features(&enables)
        .disabled_validation_features(&disables);
    if validation_present {
        info = info.push_next(&mut features);
    }

    let raw = unsafe { entry.create_instance(&info, None) }.map_err(Error::from)?;

    let messenger = if validation_present {
        let loader = ash::ext::debug_utils::Instance::new(&entry, &raw);
        let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(message_severity())
            .message_type(message_type())
            .pfn_user_callback(Some(messenger_trampoline));
        match unsafe { loader.create_debug_utils_messenger(&messenger_info, None) } {
            Ok(messenger) => Some((loader, messenger)),
            Err(err) => {
                log::warn!("failed to create debug messenger: {err:?}");
                None
            }
        }
    } else {
        None
    };

    Ok(Arc::new(VulkanInstance { entry, raw, messenger }))
}

/// Fetches the shared instance, creating it on first use.
pub(crate) fn acquire() -> Result<Arc<VulkanInstance>> {
    let mut slot = INSTANCE.lock().unwrap();
    if let Some(instance) = slot.as_ref().and_then(Weak::upgrade) {
        return Ok(instance);
    }
    let instance = create_instance()?;
    *slot = Some(Arc::downgrade(&instance));
    Ok(instance)
}
