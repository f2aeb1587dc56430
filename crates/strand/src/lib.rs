mod compiler;
pub mod logging;

pub use compiler::{
    RunOptions, RunResult, build_file, build_program, default_build_output_path,
    emit_diagnostics, format_stats, load_program, run_file, run_program,
};
