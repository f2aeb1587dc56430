//! Shape of the text generated for small functions.

use strand_codegen::{CodegenError, GenConfig, UnitKind};
use strand_ir::{BinaryOp, Function, FunctionBuilder, InstKind, Operand, Program, Type};
use strand_script::compile;

fn program(functions: Vec<Function>) -> Program {
    Program {
        package: "main".to_string(),
        functions,
        ..Default::default()
    }
}

/// Assert that `expected` appear in `text` in order, each as a whole line.
fn assert_lines_in_order(text: &str, expected: &[&str]) {
    let mut wanted = expected.iter().peekable();
    for line in text.lines() {
        if wanted.peek().is_some_and(|w| line.trim() == **w) {
            wanted.next();
        }
    }
    if let Some(missing) = wanted.next() {
        panic!("line `{missing}` not found in order in:\n{text}");
    }
}

/// `take(ch)`: receive in block 1, return the value from block 2.
fn take() -> Function {
    let mut fb = FunctionBuilder::new("main.take")
        .param("ch", Type::chan(Type::Int))
        .result(Type::Int);
    let recv = fb.block("recv");
    let done = fb.block("done");
    fb.jump(recv);
    fb.switch_to(recv);
    let got = fb.recv(Type::Int, Operand::Param(0), false);
    fb.jump(done);
    fb.switch_to(done);
    fb.ret(vec![got.into()]);
    fb.finish()
}

fn double() -> Function {
    let mut fb = FunctionBuilder::new("main.double")
        .param("x", Type::Int)
        .result(Type::Int);
    let y = fb.binop(Type::Int, BinaryOp::Add, Operand::Param(0), Operand::Param(0));
    fb.ret(vec![y.into()]);
    fb.finish()
}

#[test]
fn receive_parks_the_frame_before_waiting() {
    let generated = compile(&program(vec![take()]), &GenConfig::default()).unwrap();
    let unit = generated.unit("main.take").unwrap();
    assert_eq!(unit.kind, UnitKind::Function);
    assert_lines_in_order(
        &unit.text,
        &[
            "case 0",
            "jump 1",
            "case 1",
            "next -1",
            "yield",
            "resume -1",
            "wait-recv $0",
            "recv %v0 $0 plain i:0",
            "jump 2",
            "case 2",
            "ret %v0",
            "end",
        ],
    );
    assert!(unit.text.contains("field %v0"), "{}", unit.text);
    assert_eq!(unit.trace.blocks, vec![0, 1, 2]);
}

#[test]
fn skipped_sync_call_addresses_become_stubs() {
    let mut fb = FunctionBuilder::new("main.mixed")
        .param("ch", Type::chan(Type::Int))
        .result(Type::Int);
    let doubled = fb.call_static(Type::Int, "main.double", vec![Operand::int(4)]);
    let got = fb.recv(Type::Int, Operand::Param(0), false);
    let sum = fb.binop(Type::Int, BinaryOp::Add, doubled.into(), got.into());
    fb.ret(vec![sum.into()]);

    let generated = compile(&program(vec![double(), fb.finish()]), &GenConfig::default()).unwrap();
    let unit = generated.unit("main.mixed").unwrap();
    assert_lines_in_order(
        &unit.text,
        &[
            "run-frame sf1",
            "next -2",
            "yield",
            "stub -1",
            "resume -2",
            "wait-recv $0",
        ],
    );
    let stats = generated
        .stats
        .per_function
        .iter()
        .find(|s| s.function == "main.mixed")
        .unwrap();
    assert_eq!((stats.sync_calls, stats.async_calls), (1, 0));
    assert!(stats.suspends);
}

#[test]
fn dead_values_never_become_frame_fields() {
    let mut fb = FunctionBuilder::new("main.keep")
        .param("ch", Type::chan(Type::Int))
        .result(Type::Int);
    let unused = fb.binop(Type::Int, BinaryOp::Mul, Operand::int(5), Operand::int(6));
    let ignored = fb.call_static(Type::Int, "main.double", vec![Operand::int(1)]);
    let base = fb.binop(Type::Int, BinaryOp::Add, Operand::int(1), Operand::int(2));
    let got = fb.recv(Type::Int, Operand::Param(0), false);
    let sum = fb.binop(Type::Int, BinaryOp::Add, got.into(), base.into());
    fb.ret(vec![sum.into()]);
    assert_eq!((unused.0, ignored.0, base.0), (0, 1, 2));

    let generated = compile(&program(vec![double(), fb.finish()]), &GenConfig::default()).unwrap();
    let unit = generated.unit("main.keep").unwrap();
    assert!(unit.text.contains("field %v2"), "{}", unit.text);
    assert!(!unit.text.contains("field %v0"), "{}", unit.text);
    assert!(!unit.text.contains("field %v1"), "{}", unit.text);
    assert!(!unit.trace.classes.contains_key(&unused));
    assert!(!unit.trace.classes.contains_key(&ignored));
    let stats = generated
        .stats
        .per_function
        .iter()
        .find(|s| s.function == "main.keep")
        .unwrap();
    assert_eq!(stats.dead, 2);
}

#[test]
fn functions_that_never_suspend_have_no_resume_points() {
    let generated = compile(&program(vec![double()]), &GenConfig::default()).unwrap();
    let text = &generated.unit("main.double").unwrap().text;
    assert!(text.starts_with("func \"main.double\" params=1 free=0 results=1 suspends=false"), "{text}");
    assert!(!text.contains("yield"), "{text}");
    assert!(!text.contains("resume"), "{text}");
}

#[test]
fn trace_mode_marks_blocks_and_resume_arms() {
    let config = GenConfig {
        trace: true,
        ..GenConfig::default()
    };
    let generated = compile(&program(vec![take()]), &config).unwrap();
    let text = &generated.unit("main.take").unwrap().text;
    assert_lines_in_order(
        text,
        &[
            "case 1",
            "trace \"main.take\" 1",
            "resume -1",
            "trace \"main.take\" -1",
        ],
    );
}

fn broken() -> Function {
    let mut fb = FunctionBuilder::new("main.broken");
    fb.effect(InstKind::Unknown);
    fb.ret(Vec::new());
    fb.finish()
}

#[test]
fn hard_errors_drop_only_the_failing_unit() {
    let generated = compile(&program(vec![broken(), double()]), &GenConfig::default()).unwrap();
    assert!(generated.has_errors());
    assert!(generated.unit("main.broken").is_none());
    assert!(generated.unit("main.double").is_some());
    assert!(generated.unit("main").is_some_and(|u| u.kind == UnitKind::Package));
}

#[test]
fn stop_on_error_fails_the_whole_program() {
    let config = GenConfig {
        stop_on_error: true,
        ..GenConfig::default()
    };
    let err = compile(&program(vec![broken(), double()]), &config).unwrap_err();
    match err {
        CodegenError::GenerationFailed { diagnostics } => {
            assert_eq!(diagnostics.len(), 1);
            assert!(diagnostics[0].message.contains("main.broken"));
        }
        other => panic!("expected GenerationFailed, got {other}"),
    }
}

#[test]
fn missing_bodies_become_placeholders_with_a_warning() {
    let external = Function {
        name: "main.ext".to_string(),
        ..Default::default()
    };
    let generated = compile(&program(vec![external]), &GenConfig::default()).unwrap();
    assert!(!generated.has_errors());
    assert_eq!(generated.warnings().count(), 1);
    let unit = generated.unit("main.ext").unwrap();
    assert_eq!(unit.kind, UnitKind::Placeholder);
    assert!(generated.render().contains("# warning: main.ext: function `main.ext` has no body"));
}
