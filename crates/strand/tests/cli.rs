use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEMP_NONCE: AtomicU64 = AtomicU64::new(0);

fn strand_bin() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_strand") {
        return PathBuf::from(path);
    }

    let mut exe = std::env::current_exe().expect("test executable path should be known");
    exe.pop();
    if exe.file_name().and_then(|name| name.to_str()) == Some("deps") {
        exe.pop();
    }
    exe.join("strand")
}

fn temp_path(prefix: &str, extension: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should move forward")
        .as_nanos();
    let counter = TEMP_NONCE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}-{timestamp}-{counter}.{extension}"))
}

fn write_program(prefix: &str, json: &str) -> PathBuf {
    let path = temp_path(prefix, "json");
    std::fs::write(&path, json).expect("temp program write should succeed");
    path
}

fn strand(args: &[&str], program: &PathBuf) -> Output {
    let mut command = Command::new(strand_bin());
    command.arg(args[0]).arg(program);
    command.args(&args[1..]);
    command.env_remove("RUST_LOG");
    command.output().expect("strand should execute")
}

/// A goroutine sends 42 over an unbuffered channel; main prints it.
const HANDOFF: &str = r#"{
    "package": "main",
    "functions": [
        {
            "name": "main.producer",
            "params": [{"name": "ch", "ty": {"chan": {"elem": "int"}}}],
            "blocks": [{
                "index": 0,
                "instrs": [
                    {"kind": {"op": "send", "chan": {"param": 0},
                              "value": {"const": {"ty": "int", "value": {"int": 42}}}}}
                ],
                "terminator": {"op": "return"}
            }]
        },
        {
            "name": "main.main",
            "blocks": [{
                "index": 0,
                "instrs": [
                    {"dest": 0, "ty": {"chan": {"elem": "int"}},
                     "kind": {"op": "make_chan", "size": {"const": {"ty": "int", "value": {"int": 0}}}}},
                    {"kind": {"op": "call", "mode": "go",
                              "call": {"callee": {"value": {"function": "main.producer"}},
                                       "args": [{"value": 0}]}}},
                    {"dest": 1, "ty": "int", "kind": {"op": "recv", "chan": {"value": 0}}},
                    {"kind": {"op": "call",
                              "call": {"callee": {"builtin": "println"},
                                       "args": [{"const": {"ty": "string", "value": {"string": "got"}}},
                                                {"value": 1}]}}}
                ],
                "terminator": {"op": "return"}
            }]
        }
    ]
}"#;

const PANICS: &str = r#"{
    "package": "main",
    "functions": [{
        "name": "main.main",
        "blocks": [{
            "index": 0,
            "instrs": [
                {"kind": {"op": "call",
                          "call": {"callee": {"builtin": "print"},
                                   "args": [{"const": {"ty": "string", "value": {"string": "before\n"}}}]}}}
            ],
            "terminator": {"op": "panic", "value": {"const": {"ty": "string", "value": {"string": "boom"}}}}
        }]
    }]
}"#;

const ADDS: &str = r#"{
    "package": "main",
    "functions": [{
        "name": "main.main",
        "blocks": [{
            "index": 0,
            "instrs": [
                {"dest": 0, "ty": "int",
                 "kind": {"op": "bin_op", "operator": "add",
                          "x": {"const": {"ty": "int", "value": {"int": 40}}},
                          "y": {"const": {"ty": "int", "value": {"int": 2}}}}},
                {"kind": {"op": "call",
                          "call": {"callee": {"builtin": "println"}, "args": [{"value": 0}]}}}
            ],
            "terminator": {"op": "return"}
        }]
    }]
}"#;

#[test]
fn strand_run_evaluates_arithmetic_from_json() {
    let path = write_program("strand-cli-adds", ADDS);
    let output = strand(&["run"], &path);
    let _ = std::fs::remove_file(path);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "42\n");
}

#[test]
fn strand_run_prints_program_output() {
    let path = write_program("strand-cli-run", HANDOFF);
    let output = strand(&["run", "--seed", "1"], &path);
    let _ = std::fs::remove_file(path);

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout, "got 42\n");
}

#[test]
fn strand_build_writes_the_generated_file() {
    let path = write_program("strand-cli-build", HANDOFF);
    let out = temp_path("strand-cli-build-out", "sfs");
    let out_arg = out.to_string_lossy().to_string();
    let output = strand(&["build", "-o", &out_arg, "--stats"], &path);
    let _ = std::fs::remove_file(path);

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("built `"), "expected build summary, got: {stdout}");
    assert!(
        stdout.contains("2 functions, 2 suspending"),
        "expected stats totals, got: {stdout}"
    );

    let generated = std::fs::read_to_string(&out).expect("build output should exist");
    let _ = std::fs::remove_file(out);
    assert!(generated.contains("\"main.producer\""), "{generated}");
    assert!(generated.contains("\"main.main\""), "{generated}");
}

#[test]
fn strand_run_reports_panics_with_exit_status_two() {
    let path = write_program("strand-cli-panic", PANICS);
    let output = strand(&["run"], &path);
    let _ = std::fs::remove_file(path);

    assert_eq!(output.status.code(), Some(2));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "before\n");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("panic: \"boom\""), "got stderr: {stderr}");
}

#[test]
fn strand_run_rejects_undecodable_input() {
    let path = write_program("strand-cli-bad", "{\"package\": 3}");
    let output = strand(&["run"], &path);
    let _ = std::fs::remove_file(path);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to decode"), "got stderr: {stderr}");
}
