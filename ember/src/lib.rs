//! Ember: a thin, explicit GPU compute runtime over Vulkan.
//!
//! A host program allocates device memory, uploads and retrieves data,
//! compiles and dispatches compute programs, composes dispatches into
//! ordered step sequences synchronized by timeline counters, and
//! optionally traces rays against an acceleration structure.
//!
//! ```no_run
//! use ember::{begin_sequence, create_context, retrieve_tensor, update_tensor};
//! use ember::{CopyRegion, Tensor, TypedBuffer};
//!
//! # fn main() -> ember::Result<()> {
//! let context = create_context(Vec::new())?;
//! let input = TypedBuffer::from_data(&context, &[1u32, 2, 3, 4])?;
//! let output = TypedBuffer::<u32>::new(&context, 4)?;
//! let tensor = Tensor::new(&context, 16)?;
//!
//! let mut sequence = begin_sequence(&context)?;
//! sequence
//!     .and(&update_tensor(&input, &tensor, CopyRegion::default()))?
//!     .then(&retrieve_tensor(&tensor, &output, CopyRegion::default()))?;
//! sequence.submit()?.wait()?;
//! assert_eq!(output.as_slice(), &[1, 2, 3, 4]);
//! # Ok(())
//! # }
//! ```

mod alloc;
mod atomics;
mod bindings;
mod buffer;
mod command;
mod context;
mod device_fault;
mod error;
mod image;
mod instance;
mod program;
pub mod raytracing;
mod reflect;
mod sequence;
mod stopwatch;
mod types;

pub use atomics::{atomics_extension, get_atomics_properties, get_enabled_atomics, AtomicsProperties};
pub use bindings::{
    BindingId, BindingMap, BindingSlot, BindingTarget, BindingTraits, ImageBindingTraits,
    Parameter, ParameterType,
};
pub use buffer::{
    clear_tensor, retrieve_tensor, update_tensor, Buffer, ClearParams, ClearTensorCommand,
    CopyRegion, RetrieveTensorCommand, Tensor, TypedBuffer, UpdateTensorCommand, WHOLE_SIZE,
};
pub use command::{
    create_subroutine, execute, execute_list, execute_subroutine, execute_with, Command,
    CommandRecorder, Subroutine, SubroutineBuilder,
};
pub use context::{
    create_context, create_context_for, enumerate_devices, get_device_info, is_device_suitable,
    Context, ContextHandle, Device, DeviceInfo, Extension,
};
pub use device_fault::{
    device_fault_extension, device_fault_info, is_device_fault_supported, DeviceFaultAddressInfo,
    DeviceFaultAddressType, DeviceFaultInfo, DeviceFaultVendorInfo,
};
pub use error::{Error, Result};
pub use self::image::{
    is_filter_supported, is_filter_supported_on, retrieve_image, update_image, update_texture,
    AddressMode, Filter, Image, ImageBuffer, ImageFormat, RetrieveImageCommand, Sampler, Texture,
    UpdateImageCommand, UpdateTextureCommand,
};
pub use instance::{
    configure_debug, is_api_available, is_debug_available, DebugCallback, DebugMessage,
    DebugOptions, DebugSeverity,
};
pub use program::{
    flush_memory, get_subgroup_properties, get_subgroup_properties_on, DispatchCommand,
    DispatchIndirectCommand, FlushMemoryCommand, Program, SubgroupProperties,
};
pub use reflect::{reflect, ModuleInfo, ShaderStage};
pub use sequence::{
    begin_sequence, begin_sequence_on, SequenceBuilder, Submission, Timeline, TimelineHandle,
};
pub use stopwatch::{StopWatch, TimestampCommand};
pub use types::{
    get_enabled_types, get_supported_types, get_supported_types_on, types_extension, TypeSupport,
};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::OnceLock;

    use crate::context::{create_context, ContextHandle};
    use crate::instance::is_api_available;

    /// Shared context for device tests; `None` skips them on machines
    /// without a usable Vulkan device.
    pub fn test_context() -> Option<ContextHandle> {
        static CONTEXT: OnceLock<Option<ContextHandle>> = OnceLock::new();
        CONTEXT
            .get_or_init(|| {
                if !is_api_available() {
                    return None;
                }
                create_context(Vec::new()).ok()
            })
            .clone()
    }
}
