//! SPIR-V reflection.
//!
//! Walks shader bytecode to recover what the pipeline layout needs: the
//! entry point and workgroup size, the descriptor bindings the shader
//! actually accesses, the push-constant block size and the referenced
//! specialization-constant ids. A merge builder combines modules of a
//! ray-tracing pipeline into one layout.

use std::collections::{BTreeSet, HashMap};

use ash::vk;

use crate::bindings::{BindingTraits, ImageBindingTraits, ParameterType};
use crate::error::{invalid_argument, Error, Result};
use crate::image::ImageFormat;

const MAGIC: u32 = 0x0723_0203;

// Opcodes.
const OP_NAME: u16 = 5;
const OP_ENTRY_POINT: u16 = 15;
const OP_EXECUTION_MODE: u16 = 16;
const OP_TYPE_INT: u16 = 21;
const OP_TYPE_FLOAT: u16 = 22;
const OP_TYPE_VECTOR: u16 = 23;
const OP_TYPE_MATRIX: u16 = 24;
const OP_TYPE_IMAGE: u16 = 25;
const OP_TYPE_SAMPLER: u16 = 26;
const OP_TYPE_SAMPLED_IMAGE: u16 = 27;
const OP_TYPE_ARRAY: u16 = 28;
const OP_TYPE_RUNTIME_ARRAY: u16 = 29;
const OP_TYPE_STRUCT: u16 = 30;
const OP_TYPE_POINTER: u16 = 32;
const OP_TYPE_BOOL: u16 = 20;
const OP_CONSTANT: u16 = 43;
const OP_SPEC_CONSTANT_TRUE: u16 = 48;
const OP_SPEC_CONSTANT_FALSE: u16 = 49;
const OP_SPEC_CONSTANT: u16 = 50;
const OP_VARIABLE: u16 = 59;
const OP_IMAGE_TEXEL_POINTER: u16 = 60;
const OP_LOAD: u16 = 61;
const OP_STORE: u16 = 62;
const OP_COPY_MEMORY: u16 = 63;
const OP_ACCESS_CHAIN: u16 = 65;
const OP_IN_BOUNDS_ACCESS_CHAIN: u16 = 66;
const OP_PTR_ACCESS_CHAIN: u16 = 67;
const OP_FUNCTION: u16 = 54;
const OP_FUNCTION_CALL: u16 = 57;
const OP_DECORATE: u16 = 71;
const OP_MEMBER_DECORATE: u16 = 72;
const OP_TYPE_ACCELERATION_STRUCTURE: u16 = 5341;

// Decorations.
const DEC_SPEC_ID: u32 = 1;
const DEC_BLOCK: u32 = 2;
const DEC_BUFFER_BLOCK: u32 = 3;
const DEC_ARRAY_STRIDE: u32 = 6;
const DEC_MATRIX_STRIDE: u32 = 7;
const DEC_BINDING: u32 = 33;
const DEC_DESCRIPTOR_SET: u32 = 34;
const DEC_OFFSET: u32 = 35;

// Storage classes.
const SC_UNIFORM_CONSTANT: u32 = 0;
const SC_UNIFORM: u32 = 2;
const SC_PUSH_CONSTANT: u32 = 9;
const SC_STORAGE_BUFFER: u32 = 12;

const MODE_LOCAL_SIZE: u32 = 17;

/// Shader stage recovered from the entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Compute,
    RayGeneration,
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
    Callable,
    Other,
}

impl ShaderStage {
    fn from_execution_model(model: u32) -> Self {
        match model {
            5 => ShaderStage::Compute,
            5313 => ShaderStage::RayGeneration,
            5314 => ShaderStage::Intersection,
            5315 => ShaderStage::AnyHit,
            5316 => ShaderStage::ClosestHit,
            5317 => ShaderStage::Miss,
            5318 => ShaderStage::Callable,
            _ => ShaderStage::Other,
        }
    }
}

/// Everything the layout machinery needs from one shader module.
#[derive(Debug)]
pub struct ModuleInfo {
    pub entry_point: String,
    pub stage: ShaderStage,
    pub local_size: [u32; 3],
    /// Descriptor set all bindings live in.
    pub set: u32,
    /// Only bindings the shader actually accesses.
    pub bindings: Vec<BindingTraits>,
    /// Size of the single push-constant block, zero when absent.
    pub push_size: u32,
    pub spec_ids: BTreeSet<u32>,
}

enum TypeDef {
    Bool,
    Int { width: u32 },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, count: u32 },
    Image { dim: u32, sampled: u32, format: u32 },
    Sampler,
    SampledImage,
    Array { element: u32, length_id: u32 },
    RuntimeArray { element: u32 },
    Struct { members: Vec<u32> },
    Pointer { storage_class: u32, pointee: u32 },
    AccelerationStructure,
}

struct Variable {
    id: u32,
    type_id: u32,
    storage_class: u32,
}

#[derive(Default)]
struct Decorations {
    set: Option<u32>,
    binding: Option<u32>,
    spec_id: Option<u32>,
    block: bool,
    buffer_block: bool,
    array_stride: Option<u32>,
}

fn decode_string(words: &[u32]) -> (String, usize) {
    let mut bytes = Vec::new();
    let mut consumed = 0;
    'outer: for word in words {
        consumed += 1;
        for byte in word.to_le_bytes() {
            if byte == 0 {
                break 'outer;
            }
            bytes.push(byte);
        }
    }
    (String::from_utf8_lossy(&bytes).into_owned(), consumed)
}

fn image_format_from_spirv(format: u32) -> ImageFormat {
    match format {
        1 => ImageFormat::R32G32B32A32Sfloat,
        3 => ImageFormat::R32Sfloat,
        4 => ImageFormat::R8G8B8A8Unorm,
        5 => ImageFormat::R8G8B8A8Snorm,
        6 => ImageFormat::R32G32Sfloat,
        21 => ImageFormat::R32G32B32A32Sint,
        22 => ImageFormat::R16G16B16A16Sint,
        23 => ImageFormat::R8G8B8A8Sint,
        24 => ImageFormat::R32Sint,
        25 => ImageFormat::R32G32Sint,
        30 => ImageFormat::R32G32B32A32Uint,
        31 => ImageFormat::R16G16B16A16Uint,
        32 => ImageFormat::R8G8B8A8Uint,
        33 => ImageFormat::R32Uint,
        35 => ImageFormat::R32G32Uint,
        _ => ImageFormat::Unknown,
    }
}

fn image_dims_from_spirv(dim: u32) -> u8 {
    match dim {
        0 => 1,
        1 => 2,
        2 => 3,
        _ => 0,
    }
}

struct Parser {
    types: HashMap<u32, TypeDef>,
    constants: HashMap<u32, u32>,
    names: HashMap<u32, String>,
    decorations: HashMap<u32, Decorations>,
    member_offsets: HashMap<(u32, u32), u32>,
    member_matrix_strides: HashMap<(u32, u32), u32>,
    variables: Vec<Variable>,
    spec_decorated: BTreeSet<u32>,
    accessed: BTreeSet<u32>,
    entry: Option<(u32, String, ShaderStage)>,
    local_size: [u32; 3],
}

impl Parser {
    fn new() -> Self {
        Self {
            types: HashMap::new(),
            constants: HashMap::new(),
            names: HashMap::new(),
            decorations: HashMap::new(),
            member_offsets: HashMap::new(),
            member_matrix_strides: HashMap::new(),
            variables: Vec::new(),
            spec_decorated: BTreeSet::new(),
            accessed: BTreeSet::new(),
            entry: None,
            local_size: [1, 1, 1],
        }
    }

    fn decoration(&mut self, id: u32) -> &mut Decorations {
        self.decorations.entry(id).or_default()
    }

    fn parse(&mut self, code: &[u32]) -> Result<()> {
        if code.len() < 5 || code[0] != MAGIC {
            return Err(invalid_argument("not a SPIR-V module"));
        }

        let mut offset = 5;
        let mut in_function = false;
        while offset < code.len() {
            let word = code[offset];
            let opcode = (word & 0xFFFF) as u16;
            let count = (word >> 16) as usize;
            if count == 0 || offset + count > code.len() {
                return Err(invalid_argument("malformed SPIR-V instruction stream"));
            }
            let operands = &code[offset + 1..offset + count];
            offset += count;

            if opcode == OP_FUNCTION {
                in_function = true;
            }
            if in_function {
                self.scan_access(opcode, operands);
                continue;
            }

            match opcode {
                OP_NAME => {
                    if let Some((&target, rest)) = operands.split_first() {
                        let (name, _) = decode_string(rest);
                        self.names.insert(target, name);
                    }
                }
                OP_ENTRY_POINT => {
                    if operands.len() >= 2 {
                        let stage = ShaderStage::from_execution_model(operands[0]);
                        let (name, _) = decode_string(&operands[2..]);
                        if self.entry.is_some() {
                            return Err(invalid_argument(
                                "shader modules with multiple entry points are not supported",
                            ));
                        }
                        self.entry = Some((operands[1], name, stage));
                    }
                }
                OP_EXECUTION_MODE => {
                    if operands.len() >= 5 && operands[1] == MODE_LOCAL_SIZE {
                        self.local_size = [operands[2], operands[3], operands[4]];
                    }
                }
                OP_DECORATE => {
                    if operands.len() >= 2 {
                        let target = operands[0];
                        let value = operands.get(2).copied();
                        match operands[1] {
                            DEC_DESCRIPTOR_SET => self.decoration(target).set = value,
                            DEC_BINDING => self.decoration(target).binding = value,
                            DEC_SPEC_ID => {
                                self.decoration(target).spec_id = value;
                            }
                            DEC_BLOCK => self.decoration(target).block = true,
                            DEC_BUFFER_BLOCK => self.decoration(target).buffer_block = true,
                            DEC_ARRAY_STRIDE => self.decoration(target).array_stride = value,
                            _ => {}
                        }
                    }
                }
                OP_MEMBER_DECORATE => {
                    if operands.len() >= 4 {
                        let key = (operands[0], operands[1]);
                        match operands[2] {
                            DEC_OFFSET => {
                                self.member_offsets.insert(key, operands[3]);
                            }
                            DEC_MATRIX_STRIDE => {
                                self.member_matrix_strides.insert(key, operands[3]);
                            }
                            _ => {}
                        }
                    }
                }
                OP_TYPE_BOOL if !operands.is_empty() => {
                    self.types.insert(operands[0], TypeDef::Bool);
                }
                OP_TYPE_INT if operands.len() >= 2 => {
                    self.types.insert(operands[0], TypeDef::Int { width: operands[1] });
                }
                OP_TYPE_FLOAT if operands.len() >= 2 => {
                    self.types
                        .insert(operands[0], TypeDef::Float { width: operands[1] });
                }
                OP_TYPE_VECTOR if operands.len() >= 3 => {
                    self.types.insert(
                        operands[0],
                        TypeDef::Vector {
                            component: operands[1],
                            count: operands[2],
                        },
                    );
                }
                OP_TYPE_MATRIX if operands.len() >= 3 => {
                    self.types.insert(
                        operands[0],
                        TypeDef::Matrix {
                            column: operands[1],
                            count: operands[2],
                        },
                    );
                }
                OP_TYPE_IMAGE if operands.len() >= 8 => {
                    self.types.insert(
                        operands[0],
                        TypeDef::Image {
                            dim: operands[2],
                            sampled: operands[6],
                            format: operands[7],
                        },
                    );
                }
                OP_TYPE_SAMPLER if !operands.is_empty() => {
                    self.types.insert(operands[0], TypeDef::Sampler);
                }
                OP_TYPE_SAMPLED_IMAGE if !operands.is_empty() => {
                    self.types.insert(operands[0], TypeDef::SampledImage);
                }
                OP_TYPE_ARRAY if operands.len() >= 3 => {
                    self.types.insert(
                        operands[0],
                        TypeDef::Array {
                            element: operands[1],
                            length_id: operands[2],
                        },
                    );
                }
                OP_TYPE_RUNTIME_ARRAY if operands.len() >= 2 => {
                    self.types
                        .insert(operands[0], TypeDef::RuntimeArray { element: operands[1] });
                }
                OP_TYPE_STRUCT if !operands.is_empty() => {
                    self.types.insert(
                        operands[0],
                        TypeDef::Struct {
                            members: operands[1..].to_vec(),
                        },
                    );
                }
                OP_TYPE_POINTER if operands.len() >= 3 => {
                    self.types.insert(
                        operands[0],
                        TypeDef::Pointer {
                            storage_class: operands[1],
                            pointee: operands[2],
                        },
                    );
                }
                OP_TYPE_ACCELERATION_STRUCTURE if !operands.is_empty() => {
                    self.types.insert(operands[0], TypeDef::AccelerationStructure);
                }
                // 32-bit scalar constants are all we need (array lengths).
                OP_CONSTANT if operands.len() >= 3 => {
                    self.constants.insert(operands[1], operands[2]);
                }
                OP_SPEC_CONSTANT_TRUE | OP_SPEC_CONSTANT_FALSE | OP_SPEC_CONSTANT
                    if operands.len() >= 2 =>
                {
                    self.spec_decorated.insert(operands[1]);
                }
                OP_VARIABLE if operands.len() >= 3 => {
                    self.variables.push(Variable {
                        id: operands[1],
                        type_id: operands[0],
                        storage_class: operands[2],
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Marks variables used by instructions inside function bodies. Every
    /// use of a memory object goes through one of these shapes.
    fn scan_access(&mut self, opcode: u16, operands: &[u32]) {
        match opcode {
            OP_LOAD | OP_ACCESS_CHAIN | OP_IN_BOUNDS_ACCESS_CHAIN | OP_PTR_ACCESS_CHAIN
            | OP_IMAGE_TEXEL_POINTER => {
                if operands.len() >= 3 {
                    self.accessed.insert(operands[2]);
                }
            }
            OP_STORE | OP_COPY_MEMORY => {
                if operands.len() >= 2 {
                    self.accessed.insert(operands[0]);
                    self.accessed.insert(operands[1]);
                }
            }
            OP_FUNCTION_CALL => {
                for &arg in operands.iter().skip(3) {
                    self.accessed.insert(arg);
                }
            }
            _ => {}
        }
    }

    fn type_size(&self, type_id: u32, matrix_stride: Option<u32>) -> u32 {
        match self.types.get(&type_id) {
            Some(TypeDef::Bool) => 4,
            Some(TypeDef::Int { width }) | Some(TypeDef::Float { width }) => width / 8,
            Some(TypeDef::Vector { component, count }) => {
                self.type_size(*component, None) * count
            }
            Some(TypeDef::Matrix { column, count }) => {
                let column_size =
                    matrix_stride.unwrap_or_else(|| self.type_size(*column, None));
                column_size * count
            }
            Some(TypeDef::Array { element, length_id }) => {
                let stride = self
                    .decorations
                    .get(&type_id)
                    .and_then(|dec| dec.array_stride)
                    .unwrap_or_else(|| self.type_size(*element, None));
                stride * self.constants.get(length_id).copied().unwrap_or(0)
            }
            Some(TypeDef::Struct { .. }) => self.struct_size(type_id),
            _ => 0,
        }
    }

    /// Size of a laid-out struct: the largest member end offset.
    fn struct_size(&self, struct_id: u32) -> u32 {
        let Some(TypeDef::Struct { members }) = self.types.get(&struct_id) else {
            return 0;
        };
        members
            .iter()
            .enumerate()
            .map(|(index, &member)| {
                let key = (struct_id, index as u32);
                let offset = self.member_offsets.get(&key).copied().unwrap_or(0);
                let stride = self.member_matrix_strides.get(&key).copied();
                offset + self.type_size(member, stride)
            })
            .max()
            .unwrap_or(0)
    }

    fn binding_traits(&self, variable: &Variable) -> Result<Option<BindingTraits>> {
        let Some(TypeDef::Pointer { pointee, .. }) = self.types.get(&variable.type_id) else {
            return Ok(None);
        };

        // Unwrap a variable-level array to find the descriptor type and
        // multiplicity.
        let (inner, count) = match self.types.get(pointee) {
            Some(TypeDef::Array { element, length_id }) => (
                *element,
                self.constants.get(length_id).copied().unwrap_or(0),
            ),
            Some(TypeDef::RuntimeArray { element }) => (*element, 0),
            _ => (*pointee, 1),
        };

        let decorations = self.decorations.get(&variable.id);
        let Some(binding) = decorations.and_then(|dec| dec.binding) else {
            return Ok(None);
        };

        let variable_name = self.names.get(&variable.id).cloned().unwrap_or_default();
        let describe = |name: &str| {
            if name.is_empty() {
                format!("binding {binding}")
            } else {
                format!("binding {binding} ({name})")
            }
        };

        let (ty, name, image) = match self.types.get(&inner) {
            Some(TypeDef::SampledImage) => {
                (ParameterType::CombinedImageSampler, variable_name, None)
            }
            Some(TypeDef::Image { dim, sampled, format }) => {
                if *sampled != 2 {
                    return Err(invalid_argument(format!(
                        "{} is a sampled image without sampler, which is not supported",
                        describe(&variable_name)
                    )));
                }
                let traits = ImageBindingTraits {
                    format: image_format_from_spirv(*format),
                    dims: image_dims_from_spirv(*dim),
                };
                (ParameterType::StorageImage, variable_name, Some(traits))
            }
            Some(TypeDef::AccelerationStructure) => {
                (ParameterType::AccelerationStructure, variable_name, None)
            }
            Some(TypeDef::Struct { .. }) => {
                let type_dec = self.decorations.get(&inner);
                let block = type_dec.is_some_and(|dec| dec.block);
                let buffer_block = type_dec.is_some_and(|dec| dec.buffer_block);
                // The interface name sits on the struct type, the variable
                // name is the (often empty) instance name.
                let name = self.names.get(&inner).cloned().unwrap_or(variable_name);
                let ty = if buffer_block
                    || (block && variable.storage_class == SC_STORAGE_BUFFER)
                {
                    ParameterType::StorageBuffer
                } else if block {
                    ParameterType::UniformBuffer
                } else {
                    return Err(invalid_argument(format!(
                        "{} has an undecorated interface block",
                        describe(&name)
                    )));
                };
                (ty, name, None)
            }
            _ => {
                return Err(invalid_argument(format!(
                    "{} has an unsupported descriptor type",
                    describe(&variable_name)
                )))
            }
        };

        Ok(Some(BindingTraits {
            name,
            binding,
            ty,
            count,
            image,
        }))
    }

    fn variable_set(&self, variable: &Variable) -> u32 {
        self.decorations
            .get(&variable.id)
            .and_then(|dec| dec.set)
            .unwrap_or(0)
    }
}

/// Reflects a single SPIR-V module.
pub fn reflect(code: &[u32]) -> Result<ModuleInfo> {
    let mut parser = Parser::new();
    parser.parse(code)?;

    let (_, entry_point, stage) = parser
        .entry
        .clone()
        .ok_or_else(|| invalid_argument("shader module has no entry point"))?;

    let mut bindings = Vec::new();
    let mut sets = BTreeSet::new();
    for variable in &parser.variables {
        let descriptor_class = matches!(
            variable.storage_class,
            SC_UNIFORM_CONSTANT | SC_UNIFORM | SC_STORAGE_BUFFER
        );
        if !descriptor_class {
            continue;
        }
        // When compiled with automatic binding mapping, unused bindings
        // all collapse onto slot zero; they have to be skipped or they
        // would overwrite each other.
        if !parser.accessed.contains(&variable.id) {
            continue;
        }
        if let Some(traits) = parser.binding_traits(variable)? {
            sets.insert(parser.variable_set(variable));
            bindings.push(traits);
        }
    }
    if sets.len() > 1 {
        return Err(invalid_argument(
            "programs are only allowed to use a single descriptor set",
        ));
    }

    // A single push-constant block, sized from its member layout.
    let mut push_size = 0u32;
    let mut push_seen = false;
    for variable in &parser.variables {
        if variable.storage_class != SC_PUSH_CONSTANT {
            continue;
        }
        if push_seen {
            return Err(invalid_argument(
                "multiple push constant blocks found, but only up to one is supported",
            ));
        }
        push_seen = true;
        if let Some(TypeDef::Pointer { pointee, .. }) = parser.types.get(&variable.type_id) {
            push_size = parser.struct_size(*pointee);
        }
    }

    let spec_ids = parser
        .spec_decorated
        .iter()
        .filter_map(|id| parser.decorations.get(id).and_then(|dec| dec.spec_id))
        .collect();

    Ok(ModuleInfo {
        entry_point,
        stage,
        local_size: parser.local_size,
        set: sets.first().copied().unwrap_or(0),
        bindings,
        push_size,
        spec_ids,
    })
}

/// Accumulates reflection over the modules of one pipeline.
pub(crate) struct LayoutBuilder {
    pub local_size: [u32; 3],
    pub set: u32,
    entries: Vec<BindingTraits>,
    pub push_size: u32,
    pub push_stages: vk::ShaderStageFlags,
    spec_ids: BTreeSet<u32>,
}

impl LayoutBuilder {
    pub fn new() -> Self {
        Self {
            local_size: [1, 1, 1],
            set: 0,
            entries: Vec::new(),
            push_size: 0,
            push_stages: vk::ShaderStageFlags::empty(),
            spec_ids: BTreeSet::new(),
        }
    }

    /// Merges one module. Bindings sharing an index must agree on their
    /// traits; push ranges merge by stage union and size maximum.
    pub fn add(&mut self, module: &ModuleInfo, stage: vk::ShaderStageFlags) -> Result<()> {
        self.local_size = module.local_size;
        if !module.bindings.is_empty() {
            if self.entries.is_empty() {
                self.set = module.set;
            } else if self.set != module.set {
                return Err(invalid_argument(
                    "shaders of one pipeline must share a descriptor set",
                ));
            }
        }
        for traits in &module.bindings {
            if traits.count == 0 {
                return Err(invalid_argument(format!(
                    "binding {} ({}): runtime-sized arrays are not supported",
                    traits.binding, traits.name
                )));
            }
            match self.entries.iter().find(|entry| entry.binding == traits.binding) {
                None => self.entries.push(traits.clone()),
                Some(existing) if existing == traits => {}
                Some(_) => {
                    let name = if traits.name.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", traits.name)
                    };
                    return Err(invalid_argument(format!(
                        "duplicate binding {}{name} does not match previous definition",
                        traits.binding
                    )));
                }
            }
        }
        if module.push_size > 0 {
            self.push_stages |= stage;
            self.push_size = self.push_size.max(module.push_size);
        }
        self.spec_ids.extend(module.spec_ids.iter().copied());
        Ok(())
    }

    /// Final trait table, ordered by shader-declared index.
    pub fn sorted_traits(&self) -> Vec<BindingTraits> {
        let mut traits = self.entries.clone();
        traits.sort_by_key(|t| t.binding);
        traits
    }

    /// Push-descriptor set layout; `None` when the pipeline has no bindings.
    pub fn create_set_layout(
        &self,
        device: &ash::Device,
    ) -> Result<Option<vk::DescriptorSetLayout>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = self
            .sorted_traits()
            .iter()
            .map(|traits| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(traits.binding)
                    .descriptor_type(traits.ty.descriptor_type())
                    .descriptor_count(traits.count)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&info, None) }
            .map_err(Error::from)?;
        Ok(Some(layout))
    }

    pub fn create_pipeline_layout(
        &self,
        device: &ash::Device,
        set_layout: Option<vk::DescriptorSetLayout>,
    ) -> Result<vk::PipelineLayout> {
        let set_layouts: Vec<vk::DescriptorSetLayout> = set_layout.into_iter().collect();
        let push_range = vk::PushConstantRange::default()
            .stage_flags(self.push_stages)
            .offset(0)
            .size(self.push_size);
        let push_ranges: Vec<vk::PushConstantRange> = if self.push_size > 0 {
            vec![push_range]
        } else {
            Vec::new()
        };
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        unsafe { device.create_pipeline_layout(&info, None) }.map_err(Error::from)
    }

    /// Specialization map: ids ascending, one tightly packed 4-byte slot
    /// each. A shorter blob overrides fewer constants.
    pub fn specialization_entries(&self, data_len: usize) -> Vec<vk::SpecializationMapEntry> {
        let slots = (data_len / 4).min(self.spec_ids.len());
        self.spec_ids
            .iter()
            .take(slots)
            .enumerate()
            .map(|(index, &id)| vk::SpecializationMapEntry {
                constant_id: id,
                offset: 4 * index as u32,
                size: 4,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(opcode: u16, operands: &[u32]) -> Vec<u32> {
        let mut words = vec![(opcode as u32) | (((operands.len() + 1) as u32) << 16)];
        words.extend_from_slice(operands);
        words
    }

    fn string_words(text: &str) -> Vec<u32> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    struct ModuleAssembler {
        words: Vec<u32>,
    }

    impl ModuleAssembler {
        fn new() -> Self {
            Self {
                words: vec![MAGIC, 0x0001_0400, 0, 200, 0],
            }
        }

        fn op(&mut self, opcode: u16, operands: &[u32]) -> &mut Self {
            self.words.extend(inst(opcode, operands));
            self
        }

        fn op_str(&mut self, opcode: u16, prefix: &[u32], text: &str, suffix: &[u32]) -> &mut Self {
            let mut operands = prefix.to_vec();
            operands.extend(string_words(text));
            operands.extend_from_slice(suffix);
            self.op(opcode, &operands)
        }

        fn finish(&self) -> Vec<u32> {
            self.words.clone()
        }
    }

    // ids used by the synthetic modules
    const ENTRY: u32 = 1;
    const T_UINT: u32 = 10;
    const T_RT_ARRAY: u32 = 11;
    const T_BLOCK_A: u32 = 12;
    const T_PTR_A: u32 = 13;
    const T_PUSH: u32 = 14;
    const T_PTR_PUSH: u32 = 15;
    const T_IMAGE: u32 = 16;
    const T_PTR_IMAGE: u32 = 17;
    const T_VOID: u32 = 18;
    const T_FN: u32 = 19;
    const T_VEC4: u32 = 20;
    const V_TENSOR_A: u32 = 30;
    const V_TENSOR_B: u32 = 31;
    const V_PUSH: u32 = 32;
    const V_IMAGE: u32 = 33;
    const C_SPEC_A: u32 = 40;
    const C_SPEC_B: u32 = 41;
    const FN_MAIN: u32 = 50;
    const LABEL: u32 = 51;
    const CHAIN: u32 = 52;
    const LOADED: u32 = 53;

    /// A compute module with one accessed storage buffer, one unused one,
    /// one accessed storage image, a push block and two spec constants.
    fn compute_module() -> Vec<u32> {
        let mut asm = ModuleAssembler::new();
        asm.op(17, &[1]) // OpCapability Shader
            .op(14, &[0, 1]) // OpMemoryModel Logical GLSL450
            .op_str(
                OP_ENTRY_POINT,
                &[5, ENTRY],
                "main",
                &[V_TENSOR_A, V_TENSOR_B, V_IMAGE, V_PUSH],
            )
            .op(OP_EXECUTION_MODE, &[ENTRY, MODE_LOCAL_SIZE, 4, 2, 1])
            .op_str(OP_NAME, &[T_BLOCK_A], "TensorA", &[])
            .op_str(OP_NAME, &[V_TENSOR_A], "tensorA", &[])
            .op_str(OP_NAME, &[V_TENSOR_B], "tensorB", &[])
            .op_str(OP_NAME, &[V_IMAGE], "outImage", &[])
            // decorations
            .op(OP_DECORATE, &[T_BLOCK_A, DEC_BLOCK])
            .op(OP_DECORATE, &[T_RT_ARRAY, DEC_ARRAY_STRIDE, 4])
            .op(OP_DECORATE, &[V_TENSOR_A, DEC_DESCRIPTOR_SET, 0])
            .op(OP_DECORATE, &[V_TENSOR_A, DEC_BINDING, 0])
            .op(OP_DECORATE, &[V_TENSOR_B, DEC_DESCRIPTOR_SET, 0])
            .op(OP_DECORATE, &[V_TENSOR_B, DEC_BINDING, 1])
            .op(OP_DECORATE, &[V_IMAGE, DEC_DESCRIPTOR_SET, 0])
            .op(OP_DECORATE, &[V_IMAGE, DEC_BINDING, 2])
            .op(OP_DECORATE, &[C_SPEC_A, DEC_SPEC_ID, 3])
            .op(OP_DECORATE, &[C_SPEC_B, DEC_SPEC_ID, 1])
            .op(OP_MEMBER_DECORATE, &[T_BLOCK_A, 0, DEC_OFFSET, 0])
            .op(OP_MEMBER_DECORATE, &[T_PUSH, 0, DEC_OFFSET, 0])
            .op(OP_MEMBER_DECORATE, &[T_PUSH, 1, DEC_OFFSET, 16])
            // types
            .op(OP_TYPE_INT, &[T_UINT, 32, 0])
            .op(OP_TYPE_VECTOR, &[T_VEC4, T_UINT, 4])
            .op(OP_TYPE_RUNTIME_ARRAY, &[T_RT_ARRAY, T_UINT])
            .op(OP_TYPE_STRUCT, &[T_BLOCK_A, T_RT_ARRAY])
            .op(OP_TYPE_POINTER, &[T_PTR_A, SC_STORAGE_BUFFER, T_BLOCK_A])
            .op(OP_TYPE_STRUCT, &[T_PUSH, T_VEC4, T_UINT])
            .op(OP_TYPE_POINTER, &[T_PTR_PUSH, SC_PUSH_CONSTANT, T_PUSH])
            // storage image: dim 1D, not arrayed, sampled = 2, format R32i
            .op(OP_TYPE_IMAGE, &[T_IMAGE, T_UINT, 0, 0, 0, 0, 2, 24])
            .op(OP_TYPE_POINTER, &[T_PTR_IMAGE, SC_UNIFORM_CONSTANT, T_IMAGE])
            .op(19, &[T_VOID]) // OpTypeVoid
            .op(33, &[T_FN, T_VOID]) // OpTypeFunction
            // spec constants
            .op(OP_SPEC_CONSTANT, &[T_UINT, C_SPEC_A, 7])
            .op(OP_SPEC_CONSTANT, &[T_UINT, C_SPEC_B, 9])
            // variables
            .op(OP_VARIABLE, &[T_PTR_A, V_TENSOR_A, SC_STORAGE_BUFFER])
            .op(OP_VARIABLE, &[T_PTR_A, V_TENSOR_B, SC_STORAGE_BUFFER])
            .op(OP_VARIABLE, &[T_PTR_PUSH, V_PUSH, SC_PUSH_CONSTANT])
            .op(OP_VARIABLE, &[T_PTR_IMAGE, V_IMAGE, SC_UNIFORM_CONSTANT])
            // fn main() { chain = &tensorA[...]; load(outImage); }
            .op(OP_FUNCTION, &[T_VOID, FN_MAIN, 0, T_FN])
            .op(248, &[LABEL]) // OpLabel
            .op(OP_ACCESS_CHAIN, &[T_PTR_A, CHAIN, V_TENSOR_A])
            .op(OP_LOAD, &[T_IMAGE, LOADED, V_IMAGE])
            .op(OP_ACCESS_CHAIN, &[T_PTR_PUSH, CHAIN + 10, V_PUSH])
            .op(253, &[]) // OpReturn
            .op(56, &[]); // OpFunctionEnd
        asm.finish()
    }

    #[test]
    fn reflects_entry_point_and_local_size() {
        let module = reflect(&compute_module()).unwrap();
        assert_eq!(module.entry_point, "main");
        assert_eq!(module.stage, ShaderStage::Compute);
        assert_eq!(module.local_size, [4, 2, 1]);
    }

    #[test]
    fn only_accessed_bindings_survive() {
        let module = reflect(&compute_module()).unwrap();
        let bindings: Vec<u32> = module.bindings.iter().map(|b| b.binding).collect();
        assert_eq!(bindings, vec![0, 2]);

        let tensor = &module.bindings[0];
        assert_eq!(tensor.ty, ParameterType::StorageBuffer);
        // Interface blocks are named after their struct type.
        assert_eq!(tensor.name, "TensorA");
        assert_eq!(tensor.count, 1);

        let image = &module.bindings[1];
        assert_eq!(image.ty, ParameterType::StorageImage);
        assert_eq!(image.name, "outImage");
        let traits = image.image.unwrap();
        assert_eq!(traits.format, ImageFormat::R32Sint);
        assert_eq!(traits.dims, 1);
    }

    #[test]
    fn push_block_size_comes_from_member_offsets() {
        let module = reflect(&compute_module()).unwrap();
        // vec4 of u32 at offset 0, u32 at offset 16.
        assert_eq!(module.push_size, 20);
    }

    #[test]
    fn spec_ids_are_collected() {
        let module = reflect(&compute_module()).unwrap();
        let ids: Vec<u32> = module.spec_ids.iter().copied().collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(reflect(&[]).is_err());
        assert!(reflect(&[0xDEAD_BEEF, 0, 0, 0, 0]).is_err());
        // Truncated instruction stream.
        let mut module = compute_module();
        module.push((OP_NAME as u32) | (60 << 16));
        assert!(reflect(&module).is_err());
    }

    #[test]
    fn multiple_descriptor_sets_are_rejected() {
        let mut asm = ModuleAssembler::new();
        asm.op(17, &[1])
            .op(14, &[0, 1])
            .op_str(OP_ENTRY_POINT, &[5, ENTRY], "main", &[V_TENSOR_A, V_TENSOR_B])
            .op(OP_DECORATE, &[T_BLOCK_A, DEC_BLOCK])
            .op(OP_DECORATE, &[V_TENSOR_A, DEC_DESCRIPTOR_SET, 0])
            .op(OP_DECORATE, &[V_TENSOR_A, DEC_BINDING, 0])
            .op(OP_DECORATE, &[V_TENSOR_B, DEC_DESCRIPTOR_SET, 1])
            .op(OP_DECORATE, &[V_TENSOR_B, DEC_BINDING, 0])
            .op(OP_TYPE_INT, &[T_UINT, 32, 0])
            .op(OP_TYPE_STRUCT, &[T_BLOCK_A, T_UINT])
            .op(OP_TYPE_POINTER, &[T_PTR_A, SC_STORAGE_BUFFER, T_BLOCK_A])
            .op(OP_VARIABLE, &[T_PTR_A, V_TENSOR_A, SC_STORAGE_BUFFER])
            .op(OP_VARIABLE, &[T_PTR_A, V_TENSOR_B, SC_STORAGE_BUFFER])
            .op(OP_FUNCTION, &[T_VOID, FN_MAIN, 0, T_FN])
            .op(OP_ACCESS_CHAIN, &[T_PTR_A, CHAIN, V_TENSOR_A])
            .op(OP_ACCESS_CHAIN, &[T_PTR_A, CHAIN + 1, V_TENSOR_B])
            .op(56, &[]);
        let err = reflect(&asm.finish()).unwrap_err();
        assert!(err.to_string().contains("single descriptor set"));
    }

    #[test]
    fn merge_unions_push_and_spec_data() {
        let module = reflect(&compute_module()).unwrap();
        let mut builder = LayoutBuilder::new();
        builder
            .add(&module, vk::ShaderStageFlags::COMPUTE)
            .unwrap();
        builder
            .add(&module, vk::ShaderStageFlags::RAYGEN_KHR)
            .unwrap();

        let traits = builder.sorted_traits();
        assert_eq!(traits.len(), 2);
        assert_eq!(
            builder.push_stages,
            vk::ShaderStageFlags::COMPUTE | vk::ShaderStageFlags::RAYGEN_KHR
        );
        assert_eq!(builder.push_size, 20);
    }

    #[test]
    fn merge_rejects_conflicting_traits() {
        let module = reflect(&compute_module()).unwrap();
        let mut conflicting = reflect(&compute_module()).unwrap();
        conflicting.bindings[0].ty = ParameterType::UniformBuffer;

        let mut builder = LayoutBuilder::new();
        builder.add(&module, vk::ShaderStageFlags::COMPUTE).unwrap();
        let err = builder
            .add(&conflicting, vk::ShaderStageFlags::COMPUTE)
            .unwrap_err();
        assert!(err.to_string().contains("does not match previous definition"));
    }

    #[test]
    fn merge_rejects_runtime_arrays() {
        let mut module = reflect(&compute_module()).unwrap();
        module.bindings[0].count = 0;
        let mut builder = LayoutBuilder::new();
        let err = builder
            .add(&module, vk::ShaderStageFlags::COMPUTE)
            .unwrap_err();
        assert!(err.to_string().contains("runtime-sized arrays"));
    }

    #[test]
    fn specialization_map_is_sorted_and_truncated() {
        let module = reflect(&compute_module()).unwrap();
        let mut builder = LayoutBuilder::new();
        builder.add(&module, vk::ShaderStageFlags::COMPUTE).unwrap();

        let entries = builder.specialization_entries(8);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].constant_id, 1);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[1].constant_id, 3);
        assert_eq!(entries[1].offset, 4);

        // A shorter blob overrides fewer constants.
        let entries = builder.specialization_entries(4);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].constant_id, 1);
    }
}
