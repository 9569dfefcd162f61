//! Shader parameter bindings shared by compute programs and ray-tracing
//! pipelines.

use ash::vk;

use crate::error::{invalid_argument, Result};
use crate::image::ImageFormat;

/// Kind of resource a binding expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    CombinedImageSampler,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    AccelerationStructure,
}

impl ParameterType {
    pub(crate) fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            ParameterType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            ParameterType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            ParameterType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            ParameterType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            ParameterType::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

/// Image properties a binding declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBindingTraits {
    pub format: ImageFormat,
    /// Number of dimensions, zero when unknown.
    pub dims: u8,
}

/// Properties of one binding inside a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTraits {
    /// Name as written in the shader; may be empty when stripped.
    pub name: String,
    /// Binding number declared in the shader.
    pub binding: u32,
    pub ty: ParameterType,
    /// Array multiplicity; one for plain bindings.
    pub count: u32,
    /// Present only for image and texture bindings.
    pub image: Option<ImageBindingTraits>,
}

/// Identifies a binding either by its shader-declared number or name.
#[derive(Debug, Clone, Copy)]
pub enum BindingId<'a> {
    Index(u32),
    Name(&'a str),
}

impl From<u32> for BindingId<'static> {
    fn from(index: u32) -> Self {
        BindingId::Index(index)
    }
}

impl<'a> From<&'a str> for BindingId<'a> {
    fn from(name: &'a str) -> Self {
        BindingId::Name(name)
    }
}

impl std::fmt::Display for BindingId<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingId::Index(index) => write!(f, "binding {index}"),
            BindingId::Name(name) => write!(f, "binding \"{name}\""),
        }
    }
}

/// Value currently attached to a binding slot.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum BoundValue {
    #[default]
    Empty,
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

/// One descriptor slot a parameter can be written into.
pub struct BindingSlot {
    pub(crate) binding: u32,
    pub(crate) descriptor_type: vk::DescriptorType,
    pub(crate) value: BoundValue,
}

/// Anything that can be attached to a binding slot.
pub trait Parameter {
    fn bind(&self, slot: &mut BindingSlot) -> Result<()>;
}

/// Deduplicated binding table plus the current slot values.
pub struct BindingMap {
    traits: Vec<BindingTraits>,
    slots: Vec<BindingSlot>,
}

impl BindingMap {
    /// Builds the map from reflected traits, ordered by binding number.
    pub(crate) fn new(traits: Vec<BindingTraits>) -> Self {
        let slots = traits
            .iter()
            .map(|t| BindingSlot {
                binding: t.binding,
                descriptor_type: t.ty.descriptor_type(),
                value: BoundValue::Empty,
            })
            .collect();
        Self { traits, slots }
    }

    pub fn traits(&self) -> &[BindingTraits] {
        &self.traits
    }

    fn position(&self, id: BindingId<'_>) -> Result<usize> {
        let found = match id {
            BindingId::Index(index) => self.traits.iter().position(|t| t.binding == index),
            BindingId::Name(name) => self.traits.iter().position(|t| t.name == name),
        };
        found.ok_or_else(|| invalid_argument(format!("there is no {id} in this program")))
    }

    pub(crate) fn slot_mut(&mut self, id: BindingId<'_>) -> Result<&mut BindingSlot> {
        let index = self.position(id)?;
        Ok(&mut self.slots[index])
    }

    pub(crate) fn slot_by_position(&mut self, position: usize) -> Result<&mut BindingSlot> {
        let count = self.slots.len();
        self.slots.get_mut(position).ok_or_else(|| {
            invalid_argument(format!(
                "parameter list has more entries than the {count} bindings of this program"
            ))
        })
    }

    pub(crate) fn is_bound(&self, id: BindingId<'_>) -> Result<bool> {
        let index = self.position(id)?;
        Ok(!matches!(self.slots[index].value, BoundValue::Empty))
    }

    pub(crate) fn all_bound(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| !matches!(slot.value, BoundValue::Empty))
    }

    /// Fails naming the first unbound binding.
    pub(crate) fn check_all_bound(&self) -> Result<()> {
        for (slot, traits) in self.slots.iter().zip(&self.traits) {
            if matches!(slot.value, BoundValue::Empty) {
                let name = if traits.name.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", traits.name)
                };
                return Err(invalid_argument(format!(
                    "binding {}{name} has no parameter bound",
                    traits.binding
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn slots(&self) -> &[BindingSlot] {
        &self.slots
    }
}

/// Shared binding surface of programs and ray-tracing pipelines.
pub trait BindingTarget {
    fn binding_map(&self) -> &BindingMap;
    fn binding_map_mut(&mut self) -> &mut BindingMap;

    /// Deduplicated traits ordered by shader-declared binding number.
    fn list_bindings(&self) -> &[BindingTraits] {
        self.binding_map().traits()
    }

    fn binding_count(&self) -> usize {
        self.binding_map().traits().len()
    }

    fn has_binding<'a>(&self, id: impl Into<BindingId<'a>>) -> bool {
        self.binding_map().position(id.into()).is_ok()
    }

    fn get_binding_traits<'a>(&self, id: impl Into<BindingId<'a>>) -> Result<&BindingTraits> {
        let index = self.binding_map().position(id.into())?;
        Ok(&self.binding_map().traits()[index])
    }

    /// Writes the parameter into the slot identified by number or name.
    fn bind_parameter<'a, P: Parameter + ?Sized>(
        &mut self,
        param: &P,
        id: impl Into<BindingId<'a>>,
    ) -> Result<()> {
        param.bind(self.binding_map_mut().slot_mut(id.into())?)
    }

    /// Binds parameters positionally in shader declaration order.
    fn bind_parameter_list(&mut self, params: &[&dyn Parameter]) -> Result<()> {
        for (position, param) in params.iter().enumerate() {
            param.bind(self.binding_map_mut().slot_by_position(position)?)?;
        }
        Ok(())
    }

    fn is_binding_bound<'a>(&self, id: impl Into<BindingId<'a>>) -> Result<bool> {
        self.binding_map().is_bound(id.into())
    }

    fn all_bindings_bound(&self) -> bool {
        self.binding_map().all_bound()
    }
}

/// Write-descriptor list assembled at record time.
///
/// The writes hold raw pointers into `accel_infos` and into the slots of
/// the originating [`BindingMap`]; both must stay untouched while the
/// writes are in use. Intended for immediate consumption by a push.
pub(crate) struct DescriptorWrites {
    _accel_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR<'static>>,
    pub writes: Vec<vk::WriteDescriptorSet<'static>>,
}

pub(crate) fn collect_writes(map: &BindingMap) -> Result<DescriptorWrites> {
    map.check_all_bound()?;
    let slots = map.slots();
    let accel_count = slots
        .iter()
        .filter(|slot| matches!(slot.value, BoundValue::AccelerationStructure(_)))
        .count();
    let mut accel_infos = Vec::with_capacity(accel_count);
    let mut writes = Vec::with_capacity(slots.len());

    for slot in slots {
        let mut write = vk::WriteDescriptorSet::default()
            .dst_binding(slot.binding)
            .dst_array_element(0)
            .descriptor_type(slot.descriptor_type);
        write.descriptor_count = 1;
        match &slot.value {
            BoundValue::Empty => {
                return Err(invalid_argument(format!(
                    "binding {} has no parameter bound",
                    slot.binding
                )))
            }
            BoundValue::Buffer(info) => {
                write.p_buffer_info = info as *const vk::DescriptorBufferInfo;
            }
            BoundValue::Image(info) => {
                write.p_image_info = info as *const vk::DescriptorImageInfo;
            }
            BoundValue::AccelerationStructure(handle) => {
                let mut info = vk::WriteDescriptorSetAccelerationStructureKHR::default();
                info.acceleration_structure_count = 1;
                info.p_acceleration_structures = handle as *const vk::AccelerationStructureKHR;
                let index = accel_infos.len();
                accel_infos.push(info);
                write.p_next = &accel_infos[index]
                    as *const vk::WriteDescriptorSetAccelerationStructureKHR
                    as *const std::ffi::c_void;
            }
        }
        writes.push(write);
    }

    Ok(DescriptorWrites {
        _accel_infos: accel_infos,
        writes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> BindingMap {
        BindingMap::new(vec![
            BindingTraits {
                name: "inputs".into(),
                binding: 0,
                ty: ParameterType::StorageBuffer,
                count: 1,
                image: None,
            },
            BindingTraits {
                name: String::new(),
                binding: 2,
                ty: ParameterType::StorageImage,
                count: 1,
                image: Some(ImageBindingTraits {
                    format: ImageFormat::R32Sint,
                    dims: 1,
                }),
            },
        ])
    }

    struct Target(BindingMap);

    impl BindingTarget for Target {
        fn binding_map(&self) -> &BindingMap {
            &self.0
        }
        fn binding_map_mut(&mut self) -> &mut BindingMap {
            &mut self.0
        }
    }

    struct FakeBuffer;

    impl Parameter for FakeBuffer {
        fn bind(&self, slot: &mut BindingSlot) -> Result<()> {
            slot.value = BoundValue::Buffer(vk::DescriptorBufferInfo::default());
            Ok(())
        }
    }

    #[test]
    fn bindings_resolve_by_index_and_name() {
        let target = Target(sample_map());
        assert!(target.has_binding("inputs"));
        assert!(target.has_binding(2u32));
        assert!(!target.has_binding("missing"));
        assert_eq!(target.get_binding_traits(0u32).unwrap().name, "inputs");
    }

    #[test]
    fn unknown_bindings_name_the_identifier() {
        let target = Target(sample_map());
        let err = target.get_binding_traits("missing").unwrap_err();
        assert!(err.to_string().contains("\"missing\""));
        let err = target.get_binding_traits(7u32).unwrap_err();
        assert!(err.to_string().contains("binding 7"));
    }

    #[test]
    fn bound_state_is_tracked_per_slot() {
        let mut target = Target(sample_map());
        assert!(!target.all_bindings_bound());
        target.bind_parameter(&FakeBuffer, "inputs").unwrap();
        assert!(target.is_binding_bound(0u32).unwrap());
        assert!(!target.is_binding_bound(2u32).unwrap());
        assert!(!target.all_bindings_bound());

        let err = target.binding_map().check_all_bound().unwrap_err();
        assert!(err.to_string().contains("binding 2"));
    }

    #[test]
    fn positional_binding_follows_declaration_order() {
        let mut target = Target(sample_map());
        target
            .bind_parameter_list(&[&FakeBuffer, &FakeBuffer])
            .unwrap();
        assert!(target.all_bindings_bound());

        let err = target
            .bind_parameter_list(&[&FakeBuffer, &FakeBuffer, &FakeBuffer])
            .unwrap_err();
        assert!(err.to_string().contains("more entries"));
    }

    #[test]
    fn collect_writes_requires_everything_bound() {
        let mut target = Target(sample_map());
        target.bind_parameter(&FakeBuffer, 0u32).unwrap();
        assert!(collect_writes(target.binding_map()).is_err());
    }
}
