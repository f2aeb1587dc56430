//! Function-to-state-machine lowering for typed SSA programs.
//!
//! Every function becomes a frame whose `run` body is a dispatch over a
//! program counter: forward block numbers for basic blocks and negative
//! pseudo-block addresses for resume points after suspension. The engine is
//! target-neutral; a [`Target`] renders each decision. Generation state is
//! carried in a [`GenContext`] and per-function emitters, never globally.

pub mod calls;
pub mod channels;
pub mod continuation;
pub mod defer;
pub mod emit;
pub mod layout;
pub mod storage;
pub mod target;
pub mod values;


use std::collections::BTreeSet;

use strand_diag::{Category, Diagnostic, error_count};
use strand_ir::{ConstValue, Function, Program, SuspensionMap, infer_suspension, verify_program};
use tracing::{debug, warn};

pub use continuation::{ArmKind, PseudoArm, PseudoBlocks};
pub use emit::{EmissionTrace, FunctionOutput, emit_function};
pub use layout::{Addressing, LayoutEngine, LayoutError, Sizes, StructLayout};
pub use storage::{SiteKind, StorageMode, StoragePlan, plan_function};
pub use target::*;

/// Last path segment of the constant whose string value is prepended to
/// the output file.
pub const HEADER_CONST: &str = "__header";
/// Last path segment of the constant naming the output package.
pub const PACKAGE_CONST: &str = "__package";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenConfig {
    /// Any hard error suppresses all output.
    pub stop_on_error: bool,
    /// Block comments and source position markers.
    pub debug: bool,
    /// Trace statements at every block and resume arm.
    pub trace: bool,
    pub package_name: Option<String>,
    pub header: Option<String>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum CodegenError {
    #[error("unknown instruction `{op}` in `{function}` block {block}")]
    UnknownInstruction {
        function: String,
        block: u32,
        op: String,
    },
    #[error("cannot lay out a type used by `{function}`: {source}")]
    Layout {
        function: String,
        #[source]
        source: LayoutError,
    },
    #[error("select state {state} in `{function}` has a bidirectional channel")]
    InvalidChannelDirection { function: String, state: usize },
    #[error("{what} cannot be used with `{mode}` in `{function}`")]
    UnsupportedDispatch {
        function: String,
        what: String,
        mode: &'static str,
    },
    #[error("malformed function `{function}`: {reason}")]
    MalformedFunction { function: String, reason: String },
    #[error("special constant `{name}` {reason}")]
    SpecialConstant { name: String, reason: String },
    #[error("invalid target limits: {0}")]
    InvalidLimits(String),
    #[error("generation failed with {} error(s)", error_count(.diagnostics))]
    GenerationFailed { diagnostics: Vec<Diagnostic> },
}

impl CodegenError {
    pub fn category(&self) -> Category {
        match self {
            CodegenError::UnknownInstruction { .. } => Category::UnknownInstruction,
            CodegenError::Layout { .. } => Category::UnresolvedLayout,
            CodegenError::InvalidChannelDirection { .. } => Category::InvalidChannelDirection,
            CodegenError::UnsupportedDispatch { .. } => Category::UnsupportedDispatch,
            CodegenError::MalformedFunction { .. } => Category::MalformedFunction,
            CodegenError::SpecialConstant { .. } | CodegenError::GenerationFailed { .. } => {
                Category::MalformedInput
            }
            CodegenError::InvalidLimits(_) => Category::InvalidLimits,
        }
    }

    pub fn function(&self) -> Option<&str> {
        match self {
            CodegenError::UnknownInstruction { function, .. }
            | CodegenError::Layout { function, .. }
            | CodegenError::InvalidChannelDirection { function, .. }
            | CodegenError::UnsupportedDispatch { function, .. }
            | CodegenError::MalformedFunction { function, .. } => Some(function),
            _ => None,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::error(self.category(), self.to_string());
        match self.function() {
            Some(function) => diag.in_unit(function),
            None => diag,
        }
    }
}

/// Read-only facts shared by every function of one generation run.
#[derive(Debug)]
pub struct GenContext<'a> {
    pub program: &'a Program,
    pub config: &'a GenConfig,
    pub suspension: SuspensionMap,
}

impl<'a> GenContext<'a> {
    pub fn new(program: &'a Program, config: &'a GenConfig) -> Self {
        Self {
            program,
            config,
            suspension: infer_suspension(program),
        }
    }

    pub fn suspends(&self, function: &str) -> bool {
        self.suspension.get(function).copied().unwrap_or(false)
    }

    /// A function of the program that has a body.
    pub fn body(&self, name: &str) -> Option<&'a Function> {
        self.program.function(name).filter(|f| f.has_body())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionStats {
    pub function: String,
    pub blocks: usize,
    pub units: usize,
    pub fields: usize,
    pub temps: usize,
    pub locals: usize,
    pub array_slots: usize,
    pub dead: usize,
    pub skipped: usize,
    pub pseudo_blocks: usize,
    pub stubs: usize,
    pub sync_calls: usize,
    pub async_calls: usize,
    pub suspends: bool,
    pub split: bool,
    pub array_mode: bool,
}

impl FunctionStats {
    pub fn new(function: &str) -> Self {
        Self {
            function: function.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenStats {
    pub per_function: Vec<FunctionStats>,
}

impl GenStats {
    pub fn suspending_functions(&self) -> usize {
        self.per_function.iter().filter(|s| s.suspends).count()
    }

    pub fn total_pseudo_blocks(&self) -> usize {
        self.per_function.iter().map(|s| s.pseudo_blocks).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Function,
    /// Package-level globals.
    Package,
    /// Function without a body; fails when called.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedUnit {
    pub name: String,
    pub kind: UnitKind,
    pub text: String,
    pub trace: EmissionTrace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedProgram {
    pub package: String,
    pub target: &'static str,
    pub file_suffix: &'static str,
    pub prelude: String,
    pub units: Vec<EmittedUnit>,
    pub epilogue: String,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: GenStats,
}

impl GeneratedProgram {
    pub fn unit(&self, name: &str) -> Option<&EmittedUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| !d.is_error())
    }

    /// The whole output file.
    pub fn render(&self) -> String {
        let mut text = self.prelude.clone();
        for unit in &self.units {
            text.push_str(&unit.text);
        }
        text.push_str(&self.epilogue);
        text
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
struct SpecialConsts {
    header: Vec<String>,
    package: Option<String>,
}

fn special_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn special_consts(program: &Program) -> Result<SpecialConsts, CodegenError> {
    let mut found = SpecialConsts::default();
    for constant in &program.consts {
        match (special_name(&constant.name), &constant.value.value) {
            (HEADER_CONST, ConstValue::String(text)) => found.header.push(text.clone()),
            (PACKAGE_CONST, ConstValue::String(text)) => found.package = Some(text.clone()),
            (PACKAGE_CONST, _) => {
                return Err(CodegenError::SpecialConstant {
                    name: constant.name.clone(),
                    reason: "must be a string".to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(found)
}

/// Packages named by the program's functions, sorted.
fn package_list(program: &Program) -> Vec<String> {
    let mut packages = BTreeSet::new();
    packages.insert(program.package.clone());
    for f in &program.functions {
        let trimmed = f.name.trim_start_matches(['*', '(']);
        if let Some((package, _)) = trimmed.split_once('.') {
            packages.insert(package.to_string());
        }
    }
    packages.into_iter().collect()
}

fn package_unit<T: Target + ?Sized>(
    program: &Program,
    package: &str,
    target: &T,
    layout: &mut LayoutEngine,
) -> Result<EmittedUnit, CodegenError> {
    let mut globals = Vec::with_capacity(program.globals.len());
    for global in &program.globals {
        let size = layout
            .size_of(&global.ty)
            .map_err(|source| CodegenError::Layout {
                function: global.name.clone(),
                source,
            })?;
        globals.push(GlobalDecl {
            name: global.name.clone(),
            size,
            ty: global.ty.to_string(),
        });
    }
    Ok(EmittedUnit {
        name: package.to_string(),
        kind: UnitKind::Package,
        text: target.package_unit(package, &globals),
        trace: EmissionTrace::default(),
    })
}

/// Generate every function of `program` plus the package unit.
///
/// Hard errors drop the affected unit and are recorded; with
/// `stop_on_error` any hard error fails the whole run instead.
pub fn generate_program<T: Target + ?Sized>(
    program: &Program,
    target: &T,
    config: &GenConfig,
) -> Result<GeneratedProgram, CodegenError> {
    target.limits().validate().map_err(CodegenError::InvalidLimits)?;
    let mut layout =
        LayoutEngine::new(target.sizes()).map_err(|e| CodegenError::InvalidLimits(e.to_string()))?;
    let specials = special_consts(program)?;
    let package = config
        .package_name
        .clone()
        .or(specials.package.clone())
        .unwrap_or_else(|| program.package.clone());
    let mut header = specials.header.join("\n");
    if let Some(extra) = &config.header {
        if !header.is_empty() {
            header.push('\n');
        }
        header.push_str(extra);
    }

    let ctx = GenContext::new(program, config);
    let mut diagnostics = Vec::new();
    let mut malformed = BTreeSet::new();
    for err in verify_program(program) {
        if let strand_ir::IrError::Malformed { function, .. } = &err {
            malformed.insert(function.clone());
            diagnostics.push(
                Diagnostic::error(Category::MalformedFunction, err.to_string())
                    .in_unit(function.clone()),
            );
        }
    }

    let mut units = Vec::with_capacity(program.functions.len() + 1);
    let mut stats = GenStats::default();
    for function in &program.functions {
        if malformed.contains(&function.name) {
            continue;
        }
        if !function.has_body() {
            let reason = format!("function `{}` has no body", function.name);
            warn!(function = %function.name, "no body; emitting placeholder");
            diagnostics.push(
                Diagnostic::warning(Category::MissingBody, reason.clone())
                    .in_unit(function.name.clone())
                    .at_opt(function.pos),
            );
            units.push(EmittedUnit {
                name: function.name.clone(),
                kind: UnitKind::Placeholder,
                text: target.placeholder_function(&function.name, &reason),
                trace: EmissionTrace::default(),
            });
            continue;
        }
        match emit_function(&ctx, target, &mut layout, function) {
            Ok(output) => {
                diagnostics.extend(output.warnings);
                stats.per_function.push(output.stats);
                units.push(EmittedUnit {
                    name: function.name.clone(),
                    kind: UnitKind::Function,
                    text: output.text,
                    trace: output.trace,
                });
            }
            Err(err) => {
                warn!(function = %function.name, error = %err, "dropping function");
                diagnostics.push(err.to_diagnostic().at_opt(function.pos));
            }
        }
    }
    match package_unit(program, &package, target, &mut layout) {
        Ok(unit) => units.push(unit),
        Err(err) => diagnostics.push(err.to_diagnostic()),
    }

    if config.stop_on_error && error_count(&diagnostics) > 0 {
        return Err(CodegenError::GenerationFailed { diagnostics });
    }

    let warnings: Vec<String> = diagnostics
        .iter()
        .filter(|d| !d.is_error())
        .map(|d| match &d.unit {
            Some(unit) => format!("{unit}: {}", d.message),
            None => d.message.clone(),
        })
        .collect();
    debug!(
        target = target.name(),
        units = units.len(),
        diagnostics = diagnostics.len(),
        "generated program"
    );
    Ok(GeneratedProgram {
        prelude: target.file_start(&package, &header),
        epilogue: target.file_end(&warnings, &package_list(program)),
        package,
        target: target.name(),
        file_suffix: target.file_suffix(),
        units,
        diagnostics,
        stats,
    })
}
