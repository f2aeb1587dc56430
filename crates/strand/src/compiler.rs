use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use strand_codegen::{CodegenError, GenConfig, GenStats, GeneratedProgram};
use strand_diag::Diagnostic;
use strand_ir::Program;
use strand_script::{Vm, VmConfig, compile};
use tracing::info;

/// Exit status of a program that panicked, deadlocked or faulted.
const PANIC_EXIT: i32 = 2;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Defaults to `<package>.main`.
    pub entry: Option<String>,
    pub max_rounds: usize,
    pub seed: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        let vm = VmConfig::default();
        Self {
            entry: None,
            max_rounds: vm.max_rounds,
            seed: vm.seed,
        }
    }
}

#[derive(Debug)]
pub struct RunResult {
    pub exit_code: i32,
    /// Everything the program printed, also when it failed part way.
    pub stdout: String,
    /// Run-time failure, rendered for the user.
    pub error: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn load_program(input: &Path) -> Result<Program, String> {
    let text = fs::read_to_string(input)
        .map_err(|err| format!("failed to read `{}`: {err}", input.display()))?;
    let program = Program::from_json(&text)
        .map_err(|err| format!("failed to decode `{}`: {err}", input.display()))?;
    info!(
        target: "pipeline",
        stage = "load",
        package = %program.package,
        functions = program.functions.len(),
        globals = program.globals.len()
    );
    Ok(program)
}

pub fn build_program(program: &Program, config: &GenConfig) -> Result<GeneratedProgram, String> {
    let generated = compile(program, config).map_err(|err| match err {
        CodegenError::GenerationFailed { diagnostics } => {
            format_diagnostics("code generation failed", &diagnostics)
        }
        other => format!("code generation failed: {other}"),
    })?;
    info!(
        target: "pipeline",
        stage = "generate",
        units = generated.units.len(),
        diagnostics = generated.diagnostics.len(),
        suspending = generated.stats.suspending_functions()
    );
    Ok(generated)
}

pub fn build_file(input: &Path, config: &GenConfig) -> Result<GeneratedProgram, String> {
    build_program(&load_program(input)?, config)
}

/// Generate `program` and run it on the script VM. A package `init`
/// function runs before the entry point.
pub fn run_program(program: &Program, options: &RunOptions) -> Result<RunResult, String> {
    let generated = build_program(program, &GenConfig::default())?;
    let config = VmConfig {
        seed: options.seed,
        max_rounds: options.max_rounds,
    };
    let mut vm = Vm::with_config(&generated.render(), config)
        .map_err(|err| format!("failed to load generated code: {err}"))?;
    let package = vm.package().unwrap_or(generated.package.as_str()).to_string();
    let entry = options
        .entry
        .clone()
        .unwrap_or_else(|| format!("{package}.main"));
    if !vm.has_function(&entry) {
        return Err(format!("entry point `{entry}` is not defined"));
    }

    let init = format!("{package}.init");
    let mut outcome = Ok(());
    if vm.has_function(&init) {
        outcome = vm.call(&init, Vec::new()).map(drop);
    }
    if outcome.is_ok() {
        info!(target: "pipeline", stage = "run", entry = %entry);
        outcome = vm.call(&entry, Vec::new()).map(drop);
    }

    let stdout = vm.take_output();
    let (exit_code, error) = match outcome {
        Ok(()) => (0, None),
        Err(err) => (PANIC_EXIT, Some(err.to_string())),
    };
    Ok(RunResult {
        exit_code,
        stdout,
        error,
        diagnostics: generated.diagnostics,
    })
}

pub fn run_file(input: &Path, options: &RunOptions) -> Result<RunResult, String> {
    run_program(&load_program(input)?, options)
}

pub fn emit_diagnostics(diags: &[Diagnostic]) {
    for diag in diags {
        eprintln!("{diag}");
    }
}

fn format_diagnostics(context: &str, diagnostics: &[Diagnostic]) -> String {
    let mut text = context.to_string();
    for diag in diagnostics {
        let _ = write!(text, "\n{diag}");
    }
    text
}

/// Output file next to the input, with the target's suffix.
pub fn default_build_output_path(input: &Path, suffix: &str) -> PathBuf {
    input.with_extension(suffix)
}

/// One line per generated function, then program totals.
pub fn format_stats(stats: &GenStats) -> String {
    let mut text = String::new();
    for f in &stats.per_function {
        let mode = match (f.array_mode, f.split) {
            (true, true) => "array+split",
            (true, false) => "array",
            (false, true) => "named+split",
            (false, false) => "named",
        };
        let _ = writeln!(
            text,
            "{}: blocks={} units={} fields={} temps={} locals={} pseudo={} stubs={} sync={} async={} storage={mode}{}",
            f.function,
            f.blocks,
            f.units,
            f.fields,
            f.temps,
            f.locals,
            f.pseudo_blocks,
            f.stubs,
            f.sync_calls,
            f.async_calls,
            if f.suspends { " suspends" } else { "" },
        );
    }
    let _ = writeln!(
        text,
        "{} functions, {} suspending, {} pseudo-blocks",
        stats.per_function.len(),
        stats.suspending_functions(),
        stats.total_pseudo_blocks()
    );
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_codegen::FunctionStats;
    use strand_ir::{CallCommon, CallMode, Callee, FunctionBuilder, InstKind, Operand};

    fn hello(package: &str) -> Program {
        let mut fb = FunctionBuilder::new(format!("{package}.main"));
        fb.effect(InstKind::Call {
            call: CallCommon {
                callee: Callee::Builtin("println".to_string()),
                args: vec![Operand::string("hi")],
            },
            mode: CallMode::Normal,
        });
        fb.ret(Vec::new());
        Program {
            package: package.to_string(),
            functions: vec![fb.finish()],
            ..Default::default()
        }
    }

    #[test]
    fn run_program_captures_stdout() {
        let result = run_program(&hello("main"), &RunOptions::default()).unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hi\n");
        assert!(result.error.is_none());
    }

    #[test]
    fn init_runs_before_main() {
        let mut program = hello("main");
        let mut init = FunctionBuilder::new("main.init");
        init.effect(InstKind::Call {
            call: CallCommon {
                callee: Callee::Builtin("print".to_string()),
                args: vec![Operand::string("init;")],
            },
            mode: CallMode::Normal,
        });
        init.ret(Vec::new());
        program.functions.push(init.finish());
        let result = run_program(&program, &RunOptions::default()).unwrap();
        assert_eq!(result.stdout, "init;hi\n");
    }

    #[test]
    fn missing_entry_point_is_reported() {
        let options = RunOptions {
            entry: Some("main.start".to_string()),
            ..RunOptions::default()
        };
        let err = run_program(&hello("main"), &options).unwrap_err();
        assert_eq!(err, "entry point `main.start` is not defined");
    }

    #[test]
    fn panics_exit_with_status_two() {
        let mut fb = FunctionBuilder::new("main.main");
        fb.panic(Operand::string("bad"));
        let program = Program {
            package: "main".to_string(),
            functions: vec![fb.finish()],
            ..Default::default()
        };
        let result = run_program(&program, &RunOptions::default()).unwrap();
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.error.as_deref(), Some("panic: \"bad\""));
    }

    #[test]
    fn stats_list_every_function_and_totals() {
        let stats = GenStats {
            per_function: vec![FunctionStats {
                blocks: 2,
                units: 3,
                pseudo_blocks: 1,
                suspends: true,
                ..FunctionStats::new("main.main")
            }],
        };
        let text = format_stats(&stats);
        assert!(text.starts_with("main.main: blocks=2 units=3 "), "{text}");
        assert!(text.contains("storage=named suspends\n"), "{text}");
        assert!(text.ends_with("1 functions, 1 suspending, 1 pseudo-blocks\n"), "{text}");
    }

    #[test]
    fn build_output_uses_the_target_suffix() {
        assert_eq!(
            default_build_output_path(Path::new("out/prog.json"), "sfs"),
            PathBuf::from("out/prog.sfs")
        );
    }
}
