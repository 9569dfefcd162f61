//! `DeviceFault` capability extension: structured fault reports after a
//! device loss.

use std::any::Any;
use std::ffi::{c_void, CStr};

use ash::vk;

use crate::context::{ContextHandle, Device, Extension};
use crate::error::{invalid_argument, Error, Result};

const EXTENSION_NAME: &str = "DeviceFault";

/// Kind of memory access that triggered an address fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFaultAddressType {
    None,
    ReadInvalid,
    WriteInvalid,
    ExecuteInvalid,
    InstructionPointerUnknown,
    InstructionPointerInvalid,
    InstructionPointerFault,
}

impl DeviceFaultAddressType {
    fn from_vk(value: vk::DeviceFaultAddressTypeEXT) -> Self {
        match value {
            vk::DeviceFaultAddressTypeEXT::READ_INVALID => Self::ReadInvalid,
            vk::DeviceFaultAddressTypeEXT::WRITE_INVALID => Self::WriteInvalid,
            vk::DeviceFaultAddressTypeEXT::EXECUTE_INVALID => Self::ExecuteInvalid,
            vk::DeviceFaultAddressTypeEXT::INSTRUCTION_POINTER_UNKNOWN => {
                Self::InstructionPointerUnknown
            }
            vk::DeviceFaultAddressTypeEXT::INSTRUCTION_POINTER_INVALID => {
                Self::InstructionPointerInvalid
            }
            vk::DeviceFaultAddressTypeEXT::INSTRUCTION_POINTER_FAULT => {
                Self::InstructionPointerFault
            }
            _ => Self::None,
        }
    }
}

/// Memory address at which a fault occurred.
#[derive(Debug, Clone)]
pub struct DeviceFaultAddressInfo {
    pub address_type: DeviceFaultAddressType,
    pub address: u64,
    /// Power-of-two precision of the reported address.
    pub precision: u64,
}

/// Vendor-specific fault record.
#[derive(Debug, Clone)]
pub struct DeviceFaultVendorInfo {
    pub description: String,
    pub fault_code: u64,
    pub fault_data: u64,
}

/// Structured description of a device loss.
#[derive(Debug, Clone)]
pub struct DeviceFaultInfo {
    pub description: String,
    pub address_faults: Vec<DeviceFaultAddressInfo>,
    pub vendor_infos: Vec<DeviceFaultVendorInfo>,
}

pub(crate) struct DeviceFaultExtension;

impl Extension for DeviceFaultExtension {
    fn name(&self) -> &'static str {
        EXTENSION_NAME
    }

    fn is_device_supported(&self, device: &Device) -> bool {
        let name = ash::ext::device_fault::NAME.to_string_lossy();
        if !device.supported_extensions.iter().any(|ext| *ext == name) {
            return false;
        }
        let mut fault = vk::PhysicalDeviceFaultFeaturesEXT::default();
        let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut fault);
        unsafe {
            device
                .instance
                .raw
                .get_physical_device_features2(device.physical, &mut features)
        };
        fault.device_fault == vk::TRUE
    }

    fn device_extensions(&self) -> Vec<&'static CStr> {
        vec![ash::ext::device_fault::NAME]
    }

    unsafe fn chain_features(
        &self,
        head: *mut c_void,
        keep: &mut Vec<Box<dyn Any>>,
    ) -> *mut c_void {
        let mut features =
            Box::new(vk::PhysicalDeviceFaultFeaturesEXT::default().device_fault(true));
        features.p_next = head;
        let head = features.as_mut() as *mut _ as *mut c_void;
        keep.push(features);
        head
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates the device-fault extension.
pub fn device_fault_extension() -> Box<dyn Extension> {
    Box::new(DeviceFaultExtension)
}

/// Whether the given device can report fault information.
pub fn is_device_fault_supported(device: &Device) -> bool {
    DeviceFaultExtension.is_device_supported(device)
}

/// Retrieves the fault report after the device was lost.
///
/// Only valid once the device reported [`Error::DeviceLost`] and the
/// context was created with the DeviceFault extension.
pub fn device_fault_info(context: &ContextHandle) -> Result<DeviceFaultInfo> {
    let loader = context.device_fault_loader.as_ref().ok_or_else(|| {
        invalid_argument("the context was created without the DeviceFault extension")
    })?;
    let get_fault_info = loader.fp().get_device_fault_info_ext;

    // Two-call pattern: sizes first, then the actual report.
    let mut counts = vk::DeviceFaultCountsEXT::default();
    let result = unsafe { get_fault_info(loader.device(), &mut counts, std::ptr::null_mut()) };
    if result != vk::Result::SUCCESS && result != vk::Result::INCOMPLETE {
        return Err(Error::from(result));
    }

    let mut address_infos =
        vec![vk::DeviceFaultAddressInfoEXT::default(); counts.address_info_count as usize];
    let mut vendor_infos =
        vec![vk::DeviceFaultVendorInfoEXT::default(); counts.vendor_info_count as usize];
    // Skipping the opaque vendor binary keeps the second call cheap.
    counts.vendor_binary_size = 0;

    let mut info = vk::DeviceFaultInfoEXT::default();
    info.p_address_infos = address_infos.as_mut_ptr();
    info.p_vendor_infos = vendor_infos.as_mut_ptr();
    let result = unsafe { get_fault_info(loader.device(), &mut counts, &mut info) };
    if result != vk::Result::SUCCESS && result != vk::Result::INCOMPLETE {
        return Err(Error::from(result));
    }

    let description = unsafe { CStr::from_ptr(info.description.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    let address_faults = address_infos
        .iter()
        .take(counts.address_info_count as usize)
        .map(|info| DeviceFaultAddressInfo {
            address_type: DeviceFaultAddressType::from_vk(info.address_type),
            address: info.reported_address,
            precision: info.address_precision,
        })
        .collect();
    let vendor_infos = vendor_infos
        .iter()
        .take(counts.vendor_info_count as usize)
        .map(|info| DeviceFaultVendorInfo {
            description: unsafe { CStr::from_ptr(info.description.as_ptr()) }
                .to_string_lossy()
                .into_owned(),
            fault_code: info.vendor_fault_code,
            fault_data: info.vendor_fault_data,
        })
        .collect();

    Ok(DeviceFaultInfo {
        description,
        address_faults,
        vendor_infos,
    })
}
