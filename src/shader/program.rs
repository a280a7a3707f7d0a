//! GLSL compilation and stage linking.
//!
//! naga stands in for the driver's GLSL compiler: each stage is parsed and
//! validated up front so syntax errors in a user snippet surface as a
//! [`TransitionError::Compile`] with the compiler diagnostic, instead of a
//! device validation panic at pipeline creation. Linking checks the
//! vertex/fragment interface and reflects the binding slots the resources
//! are wired to.

use super::source::ProgramSource;
use crate::error::{Result, ShaderStage, TransitionError};
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, Binding, Module, ResourceBinding, TypeInner};
use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::debug;

/// Bind group used by the fragment template.
pub const RESOURCE_GROUP: u32 = 0;
const PARAMS_BINDING: u32 = 0;
const FROM_BINDING: u32 = 1;
const TO_BINDING: u32 = 2;
const SAMPLER_BINDING: u32 = 3;

/// Entry point name naga gives GLSL `main`.
pub const ENTRY_POINT: &str = "main";

/// One validated shader stage, translated for the GPU driver.
pub struct CompiledStage {
    stage: ShaderStage,
    module: Module,
    wgsl: String,
}

impl CompiledStage {
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

/// Attribute and resource slots of a linked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramInterface {
    pub position_location: u32,
    pub params_binding: u32,
    pub from_binding: u32,
    pub to_binding: u32,
    pub sampler_binding: u32,
}

/// A vertex and fragment stage that agree on their interface.
pub struct LinkedProgram {
    interface: ProgramInterface,
    vertex_wgsl: String,
    fragment_wgsl: String,
}

impl LinkedProgram {
    pub fn interface(&self) -> ProgramInterface {
        self.interface
    }

    /// Creates the driver shader modules for both stages.
    pub fn create_modules(&self, device: &wgpu::Device) -> (wgpu::ShaderModule, wgpu::ShaderModule) {
        let vertex = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Transition Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&self.vertex_wgsl)),
        });
        let fragment = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Transition Fragment Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&self.fragment_wgsl)),
        });
        (vertex, fragment)
    }
}

/// Compiles and links both stages of `source`.
pub fn build_program(source: &ProgramSource) -> Result<LinkedProgram> {
    debug!("Building transition program...");
    let vertex = compile_stage(ShaderStage::Vertex, source.vertex())?;
    let fragment = compile_stage(ShaderStage::Fragment, source.fragment())?;
    let program = link(vertex, fragment)?;
    debug!("Transition program built successfully");
    Ok(program)
}

/// Parses and validates one GLSL stage.
pub fn compile_stage(stage: ShaderStage, glsl: &str) -> Result<CompiledStage> {
    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    };
    let mut frontend = Frontend::default();
    let options = Options::from(naga_stage);
    let module = frontend
        .parse(&options, glsl)
        .map_err(|e| TransitionError::Compile {
            stage,
            log: e.emit_to_string(glsl),
        })?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator
        .validate(&module)
        .map_err(|e| TransitionError::Compile {
            stage,
            log: e.emit_to_string(glsl),
        })?;
    let wgsl = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| TransitionError::Compile {
            stage,
            log: format!("translation failed: {}", e),
        })?;

    debug!("Shader compilation successful ({} stage)", stage);
    Ok(CompiledStage { stage, module, wgsl })
}

/// Checks the stage interface and reflects binding slots.
///
/// Both stage objects are consumed; on failure they are dropped with the error.
pub fn link(vertex: CompiledStage, fragment: CompiledStage) -> Result<LinkedProgram> {
    if vertex.stage != ShaderStage::Vertex || fragment.stage != ShaderStage::Fragment {
        return Err(link_error(format!(
            "expected vertex and fragment stages, got {} and {}",
            vertex.stage, fragment.stage
        )));
    }

    let vertex_entry = entry_point(&vertex.module, naga::ShaderStage::Vertex)?;
    let fragment_entry = entry_point(&fragment.module, naga::ShaderStage::Fragment)?;

    let position_location = position_location(&vertex.module, vertex_entry)?;

    let outputs = vertex_outputs(&vertex.module, vertex_entry);
    for (location, input_ty) in fragment_inputs(&fragment.module, fragment_entry) {
        match outputs.get(&location) {
            Some(output_ty) if *output_ty == input_ty => {}
            Some(output_ty) => {
                return Err(link_error(format!(
                    "location {} is {:?} in the vertex stage but {:?} in the fragment stage",
                    location, output_ty, input_ty
                )))
            }
            None => {
                return Err(link_error(format!(
                    "fragment input at location {} is not written by the vertex stage",
                    location
                )))
            }
        }
    }

    let module = &fragment.module;
    let params_binding = require_resource(module, PARAMS_BINDING, "uniform block", |var, inner| {
        var.space == AddressSpace::Uniform && matches!(inner, TypeInner::Struct { .. })
    })?;
    let from_binding = require_resource(module, FROM_BINDING, "`from` texture", |_, inner| {
        matches!(inner, TypeInner::Image { .. })
    })?;
    let to_binding = require_resource(module, TO_BINDING, "`to` texture", |_, inner| {
        matches!(inner, TypeInner::Image { .. })
    })?;
    let sampler_binding = require_resource(module, SAMPLER_BINDING, "sampler", |_, inner| {
        matches!(inner, TypeInner::Sampler { .. })
    })?;

    Ok(LinkedProgram {
        interface: ProgramInterface {
            position_location,
            params_binding,
            from_binding,
            to_binding,
            sampler_binding,
        },
        vertex_wgsl: vertex.wgsl,
        fragment_wgsl: fragment.wgsl,
    })
}

fn link_error(log: String) -> TransitionError {
    TransitionError::Link { log }
}

fn entry_point(module: &Module, stage: naga::ShaderStage) -> Result<&naga::EntryPoint> {
    module
        .entry_points
        .iter()
        .find(|ep| ep.stage == stage && ep.name == ENTRY_POINT)
        .ok_or_else(|| link_error(format!("no {:?} entry point named `{}`", stage, ENTRY_POINT)))
}

fn location_of(binding: &Option<Binding>) -> Option<u32> {
    match binding {
        Some(Binding::Location { location, .. }) => Some(*location),
        _ => None,
    }
}

fn position_location(module: &Module, entry: &naga::EntryPoint) -> Result<u32> {
    let located: Vec<_> = entry
        .function
        .arguments
        .iter()
        .filter_map(|arg| location_of(&arg.binding).map(|loc| (arg, loc)))
        .collect();
    let named = located
        .iter()
        .find(|(arg, _)| arg.name.as_deref() == Some("position"));
    let (arg, location) = match (named, located.as_slice()) {
        (Some(found), _) => *found,
        (None, [only]) => *only,
        _ => return Err(link_error("vertex stage has no `position` attribute".into())),
    };
    match module.types[arg.ty].inner {
        TypeInner::Vector {
            size: naga::VectorSize::Bi,
            ..
        } => Ok(location),
        ref other => Err(link_error(format!(
            "`position` attribute must be a vec2, found {:?}",
            other
        ))),
    }
}

fn vertex_outputs(module: &Module, entry: &naga::EntryPoint) -> BTreeMap<u32, TypeInner> {
    let mut outputs = BTreeMap::new();
    let Some(result) = &entry.function.result else {
        return outputs;
    };
    if let Some(location) = location_of(&result.binding) {
        outputs.insert(location, module.types[result.ty].inner.clone());
    }
    if let TypeInner::Struct { members, .. } = &module.types[result.ty].inner {
        for member in members {
            if let Some(location) = location_of(&member.binding) {
                outputs.insert(location, module.types[member.ty].inner.clone());
            }
        }
    }
    outputs
}

fn fragment_inputs(module: &Module, entry: &naga::EntryPoint) -> Vec<(u32, TypeInner)> {
    let mut inputs = Vec::new();
    for arg in &entry.function.arguments {
        if let Some(location) = location_of(&arg.binding) {
            inputs.push((location, module.types[arg.ty].inner.clone()));
        } else if let TypeInner::Struct { members, .. } = &module.types[arg.ty].inner {
            for member in members {
                if let Some(location) = location_of(&member.binding) {
                    inputs.push((location, module.types[member.ty].inner.clone()));
                }
            }
        }
    }
    inputs
}

fn require_resource(
    module: &Module,
    binding: u32,
    what: &str,
    is_expected: impl Fn(&naga::GlobalVariable, &TypeInner) -> bool,
) -> Result<u32> {
    let wanted = ResourceBinding {
        group: RESOURCE_GROUP,
        binding,
    };
    let var = module
        .global_variables
        .iter()
        .map(|(_, var)| var)
        .find(|var| var.binding.as_ref() == Some(&wanted))
        .ok_or_else(|| {
            link_error(format!(
                "{} missing at group {} binding {}",
                what, RESOURCE_GROUP, binding
            ))
        })?;
    if !is_expected(var, &module.types[var.ty].inner) {
        return Err(link_error(format!(
            "binding {} does not hold the {}",
            binding, what
        )));
    }
    Ok(binding)
}
