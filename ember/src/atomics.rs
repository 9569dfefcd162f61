//! `Atomics` capability extension: extended shader atomics on buffers,
//! shared memory and images.

use std::any::Any;
use std::ffi::{c_void, CStr};

use ash::vk;

use crate::context::{ContextHandle, Device, Extension};

/// Atomic operations a device supports or a caller requires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtomicsProperties {
    pub buffer_int64_atomics: bool,
    pub buffer_float16_atomics: bool,
    pub buffer_float16_atomic_add: bool,
    pub buffer_float16_atomic_min_max: bool,
    pub buffer_float32_atomics: bool,
    pub buffer_float32_atomic_add: bool,
    pub buffer_float32_atomic_min_max: bool,
    pub buffer_float64_atomics: bool,
    pub buffer_float64_atomic_add: bool,
    pub buffer_float64_atomic_min_max: bool,
    pub shared_int64_atomics: bool,
    pub shared_float16_atomics: bool,
    pub shared_float16_atomic_add: bool,
    pub shared_float16_atomic_min_max: bool,
    pub shared_float32_atomics: bool,
    pub shared_float32_atomic_add: bool,
    pub shared_float32_atomic_min_max: bool,
    pub shared_float64_atomics: bool,
    pub shared_float64_atomic_add: bool,
    pub shared_float64_atomic_min_max: bool,
    pub image_int64_atomics: bool,
    pub image_float32_atomics: bool,
    pub image_float32_atomic_add: bool,
    pub image_float32_atomic_min_max: bool,
}

/// Packs the properties for subset checks.
const fn to_bit_flags(props: &AtomicsProperties) -> u32 {
    (props.buffer_int64_atomics as u32)
        | (props.buffer_float16_atomics as u32) << 1
        | (props.buffer_float16_atomic_add as u32) << 2
        | (props.buffer_float16_atomic_min_max as u32) << 3
        | (props.buffer_float32_atomics as u32) << 4
        | (props.buffer_float32_atomic_add as u32) << 5
        | (props.buffer_float32_atomic_min_max as u32) << 6
        | (props.buffer_float64_atomics as u32) << 7
        | (props.buffer_float64_atomic_add as u32) << 8
        | (props.buffer_float64_atomic_min_max as u32) << 9
        | (props.shared_int64_atomics as u32) << 10
        | (props.shared_float16_atomics as u32) << 11
        | (props.shared_float16_atomic_add as u32) << 12
        | (props.shared_float16_atomic_min_max as u32) << 13
        | (props.shared_float32_atomics as u32) << 14
        | (props.shared_float32_atomic_add as u32) << 15
        | (props.shared_float32_atomic_min_max as u32) << 16
        | (props.shared_float64_atomics as u32) << 17
        | (props.shared_float64_atomic_add as u32) << 18
        | (props.shared_float64_atomic_min_max as u32) << 19
        | (props.image_int64_atomics as u32) << 20
        | (props.image_float32_atomics as u32) << 21
        | (props.image_float32_atomic_add as u32) << 22
        | (props.image_float32_atomic_min_max as u32) << 23
}

// Which packed bits each device extension covers. Float add/load/store
// live in VK_EXT_shader_atomic_float, the min/max and f16 variants in
// VK_EXT_shader_atomic_float2; int64 buffer/shared atomics are core 1.2.
const IMAGE_EXT_FLAGS: u32 = 1 << 20;
const FLOAT_EXT_FLAGS: u32 = (1 << 4)
    | (1 << 5)
    | (1 << 7)
    | (1 << 8)
    | (1 << 14)
    | (1 << 15)
    | (1 << 17)
    | (1 << 18)
    | (1 << 21)
    | (1 << 22);
const FLOAT2_EXT_FLAGS: u32 = (1 << 1)
    | (1 << 2)
    | (1 << 3)
    | (1 << 6)
    | (1 << 9)
    | (1 << 11)
    | (1 << 12)
    | (1 << 13)
    | (1 << 16)
    | (1 << 19)
    | (1 << 23);

const EXTENSION_NAME: &str = "Atomics";

fn query_properties(device: &Device) -> AtomicsProperties {
    let mut image_int64 = vk::PhysicalDeviceShaderImageAtomicInt64FeaturesEXT::default();
    let mut int64 = vk::PhysicalDeviceShaderAtomicInt64Features::default();
    let mut float2 = vk::PhysicalDeviceShaderAtomicFloat2FeaturesEXT::default();
    let mut float = vk::PhysicalDeviceShaderAtomicFloatFeaturesEXT::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut image_int64)
        .push_next(&mut int64)
        .push_next(&mut float2)
        .push_next(&mut float);
    unsafe {
        device
            .instance
            .raw
            .get_physical_device_features2(device.physical, &mut features)
    };

    AtomicsProperties {
        buffer_int64_atomics: int64.shader_buffer_int64_atomics == vk::TRUE,
        buffer_float16_atomics: float2.shader_buffer_float16_atomics == vk::TRUE,
        buffer_float16_atomic_add: float2.shader_buffer_float16_atomic_add == vk::TRUE,
        buffer_float16_atomic_min_max: float2.shader_buffer_float16_atomic_min_max == vk::TRUE,
        buffer_float32_atomics: float.shader_buffer_float32_atomics == vk::TRUE,
        buffer_float32_atomic_add: float.shader_buffer_float32_atomic_add == vk::TRUE,
        buffer_float32_atomic_min_max: float2.shader_buffer_float32_atomic_min_max == vk::TRUE,
        buffer_float64_atomics: float.shader_buffer_float64_atomics == vk::TRUE,
        buffer_float64_atomic_add: float.shader_buffer_float64_atomic_add == vk::TRUE,
        buffer_float64_atomic_min_max: float2.shader_buffer_float64_atomic_min_max == vk::TRUE,
        shared_int64_atomics: int64.shader_shared_int64_atomics == vk::TRUE,
        shared_float16_atomics: float2.shader_shared_float16_atomics == vk::TRUE,
        shared_float16_atomic_add: float2.shader_shared_float16_atomic_add == vk::TRUE,
        shared_float16_atomic_min_max: float2.shader_shared_float16_atomic_min_max == vk::TRUE,
        shared_float32_atomics: float.shader_shared_float32_atomics == vk::TRUE,
        shared_float32_atomic_add: float.shader_shared_float32_atomic_add == vk::TRUE,
        shared_float32_atomic_min_max: float2.shader_shared_float32_atomic_min_max == vk::TRUE,
        shared_float64_atomics: float.shader_shared_float64_atomics == vk::TRUE,
        shared_float64_atomic_add: float.shader_shared_float64_atomic_add == vk::TRUE,
        shared_float64_atomic_min_max: float2.shader_shared_float64_atomic_min_max == vk::TRUE,
        image_int64_atomics: image_int64.shader_image_int64_atomics == vk::TRUE,
        image_float32_atomics: float.shader_image_float32_atomics == vk::TRUE,
        image_float32_atomic_add: float.shader_image_float32_atomic_add == vk::TRUE,
        image_float32_atomic_min_max: float2.shader_image_float32_atomic_min_max == vk::TRUE,
    }
}

/// Atomic capabilities of the given device.
pub fn get_atomics_properties(device: &Device) -> AtomicsProperties {
    query_properties(device)
}

/// Atomics enabled on the context, all false without the extension.
pub fn get_enabled_atomics(context: &ContextHandle) -> AtomicsProperties {
    context
        .extension::<AtomicsExtension>(EXTENSION_NAME)
        .map(|ext| ext.required)
        .unwrap_or_default()
}

pub(crate) struct AtomicsExtension {
    required: AtomicsProperties,
    flags: u32,
}

impl Extension for AtomicsExtension {
    fn name(&self) -> &'static str {
        EXTENSION_NAME
    }

    fn is_device_supported(&self, device: &Device) -> bool {
        let supported = to_bit_flags(&query_properties(device));
        supported & self.flags == self.flags
    }

    fn device_extensions(&self) -> Vec<&'static CStr> {
        let mut extensions = Vec::new();
        if self.flags & IMAGE_EXT_FLAGS != 0 {
            extensions.push(ash::ext::shader_image_atomic_int64::NAME);
        }
        if self.flags & FLOAT_EXT_FLAGS != 0 {
            extensions.push(ash::ext::shader_atomic_float::NAME);
        }
        if self.flags & FLOAT2_EXT_FLAGS != 0 {
            extensions.push(ash::ext::shader_atomic_float2::NAME);
        }
        // int64 buffer/shared atomics are part of Vulkan 1.2.
        extensions
    }

    fn base_features(
        &self,
        _base: &mut vk::PhysicalDeviceFeatures,
        vulkan12: &mut vk::PhysicalDeviceVulkan12Features<'_>,
    ) {
        if self.required.buffer_int64_atomics {
            vulkan12.shader_buffer_int64_atomics = vk::TRUE;
        }
        if self.required.shared_int64_atomics {
            vulkan12.shader_shared_int64_atomics = vk::TRUE;
        }
    }

    unsafe fn chain_features(
        &self,
        mut head: *mut c_void,
        keep: &mut Vec<Box<dyn Any>>,
    ) -> *mut c_void {
        let req = &self.required;
        if self.flags & IMAGE_EXT_FLAGS != 0 {
            let mut features = Box::new(
                vk::PhysicalDeviceShaderImageAtomicInt64FeaturesEXT::default()
                    .shader_image_int64_atomics(req.image_int64_atomics),
            );
            features.p_next = head;
            head = features.as_mut() as *mut _ as *mut c_void;
            keep.push(features);
        }
        if self.flags & FLOAT_EXT_FLAGS != 0 {
            let mut features = Box::new(
                vk::PhysicalDeviceShaderAtomicFloatFeaturesEXT::default()
                    .shader_buffer_float32_atomics(req.buffer_float32_atomics)
                    .shader_buffer_float32_atomic_add(req.buffer_float32_atomic_add)
                    .shader_buffer_float64_atomics(req.buffer_float64_atomics)
                    .shader_buffer_float64_atomic_add(req.buffer_float64_atomic_add)
                    .shader_shared_float32_atomics(req.shared_float32_atomics)
                    .shader_shared_float32_atomic_add(req.shared_float32_atomic_add)
                    .shader_shared_float64_atomics(req.shared_float64_atomics)
                    .shader_shared_float64_atomic_add(req.shared_float64_atomic_add)
                    .shader_image_float32_atomics(req.image_float32_atomics)
                    .shader_image_float32_atomic_add(req.image_float32_atomic_add),
            );
            features.p_next = head;
            head = features.as_mut() as *mut _ as *mut c_void;
            keep.push(features);
        }
        if self.flags & FLOAT2_EXT_FLAGS != 0 {
            let mut features = Box::new(
                vk::PhysicalDeviceShaderAtomicFloat2FeaturesEXT::default()
                    .shader_buffer_float16_atomics(req.buffer_float16_atomics)
                    .shader_buffer_float16_atomic_add(req.buffer_float16_atomic_add)
                    .shader_buffer_float16_atomic_min_max(req.buffer_float16_atomic_min_max)
                    .shader_buffer_float32_atomic_min_max(req.buffer_float32_atomic_min_max)
                    .shader_buffer_float64_atomic_min_max(req.buffer_float64_atomic_min_max)
                    .shader_shared_float16_atomics(req.shared_float16_atomics)
                    .shader_shared_float16_atomic_add(req.shared_float16_atomic_add)
                    .shader_shared_float16_atomic_min_max(req.shared_float16_atomic_min_max)
                    .shader_shared_float32_atomic_min_max(req.shared_float32_atomic_min_max)
                    .shader_shared_float64_atomic_min_max(req.shared_float64_atomic_min_max)
                    .shader_image_float32_atomic_min_max(req.image_float32_atomic_min_max),
            );
            features.p_next = head;
            head = features.as_mut() as *mut _ as *mut c_void;
            keep.push(features);
        }
        head
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates an extension requiring the given atomic capabilities.
pub fn atomics_extension(properties: AtomicsProperties) -> Box<dyn Extension> {
    Box::new(AtomicsExtension {
        flags: to_bit_flags(&properties),
        required: properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_packing_is_a_subset_test() {
        let supported = AtomicsProperties {
            buffer_float32_atomics: true,
            buffer_float32_atomic_add: true,
            shared_float32_atomics: true,
            ..Default::default()
        };

        let required = AtomicsProperties {
            buffer_float32_atomics: true,
            ..Default::default()
        };
        assert_eq!(
            to_bit_flags(&supported) & to_bit_flags(&required),
            to_bit_flags(&required)
        );

        let required = AtomicsProperties {
            buffer_float32_atomics: true,
            image_int64_atomics: true,
            ..Default::default()
        };
        assert_ne!(
            to_bit_flags(&supported) & to_bit_flags(&required),
            to_bit_flags(&required)
        );
    }

    #[test]
    fn extension_selection_follows_requested_features() {
        let props = AtomicsProperties {
            buffer_float32_atomic_add: true,
            ..Default::default()
        };
        let ext = AtomicsExtension {
            flags: to_bit_flags(&props),
            required: props,
        };
        let names = ext.device_extensions();
        assert!(names.contains(&ash::ext::shader_atomic_float::NAME));
        assert!(!names.contains(&ash::ext::shader_atomic_float2::NAME));
        assert!(!names.contains(&ash::ext::shader_image_atomic_int64::NAME));

        let props = AtomicsProperties {
            buffer_float32_atomic_min_max: true,
            image_int64_atomics: true,
            ..Default::default()
        };
        let ext = AtomicsExtension {
            flags: to_bit_flags(&props),
            required: props,
        };
        let names = ext.device_extensions();
        assert!(names.contains(&ash::ext::shader_atomic_float2::NAME));
        assert!(names.contains(&ash::ext::shader_image_atomic_int64::NAME));
    }
}
