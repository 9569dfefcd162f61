//! `Types` capability extension: extended arithmetic types in shaders.

use std::any::Any;

use ash::vk;

use crate::context::{ContextHandle, Device, Extension};

/// Shader arithmetic types beyond 32 bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeSupport {
    pub float64: bool,
    pub float16: bool,
    pub int64: bool,
    pub int16: bool,
    pub int8: bool,
}

const fn to_bit_flags(types: &TypeSupport) -> u32 {
    (types.float64 as u32)
        | (types.float16 as u32) << 1
        | (types.int64 as u32) << 2
        | (types.int16 as u32) << 3
        | (types.int8 as u32) << 4
}

const EXTENSION_NAME: &str = "Types";

/// Types the given device supports in shader code.
pub fn get_supported_types(device: &Device) -> TypeSupport {
    let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan12);
    unsafe {
        device
            .instance
            .raw
            .get_physical_device_features2(device.physical, &mut features)
    };
    let float64 = features.features.shader_float64 == vk::TRUE;
    let int64 = features.features.shader_int64 == vk::TRUE;
    let int16 = features.features.shader_int16 == vk::TRUE;
    let float16 = vulkan12.shader_float16 == vk::TRUE;
    let int8 = vulkan12.shader_int8 == vk::TRUE;
    TypeSupport {
        float64,
        float16,
        int64,
        int16,
        int8,
    }
}

pub fn get_supported_types_on(context: &ContextHandle) -> TypeSupport {
    get_supported_types(&context.device_handle())
}

/// Types enabled on the context, all false without the extension.
pub fn get_enabled_types(context: &ContextHandle) -> TypeSupport {
    context
        .extension::<TypesExtension>(EXTENSION_NAME)
        .map(|ext| ext.required)
        .unwrap_or_default()
}

pub(crate) struct TypesExtension {
    required: TypeSupport,
}

impl Extension for TypesExtension {
    fn name(&self) -> &'static str {
        EXTENSION_NAME
    }

    fn is_device_supported(&self, device: &Device) -> bool {
        let supported = to_bit_flags(&get_supported_types(device));
        let required = to_bit_flags(&self.required);
        supported & required == required
    }

    fn base_features(
        &self,
        base: &mut vk::PhysicalDeviceFeatures,
        vulkan12: &mut vk::PhysicalDeviceVulkan12Features<'_>,
    ) {
        if self.required.float64 {
            base.shader_float64 = vk::TRUE;
        }
        if self.required.int64 {
            base.shader_int64 = vk::TRUE;
        }
        if self.required.int16 {
            base.shader_int16 = vk::TRUE;
        }
        if self.required.float16 {
            vulkan12.shader_float16 = vk::TRUE;
        }
        if self.required.int8 {
            vulkan12.shader_int8 = vk::TRUE;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates an extension requiring the given type support.
pub fn types_extension(types: TypeSupport) -> Box<dyn Extension> {
    Box::new(TypesExtension { required: types })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirement_check_is_a_subset_test() {
        let supported = TypeSupport {
            float64: true,
            int64: true,
            ..Default::default()
        };
        let ok = TypeSupport {
            int64: true,
            ..Default::default()
        };
        let missing = TypeSupport {
            int8: true,
            ..Default::default()
        };
        assert_eq!(
            to_bit_flags(&supported) & to_bit_flags(&ok),
            to_bit_flags(&ok)
        );
        assert_ne!(
            to_bit_flags(&supported) & to_bit_flags(&missing),
            to_bit_flags(&missing)
        );
    }
}
