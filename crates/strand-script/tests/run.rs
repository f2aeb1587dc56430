//! Programs built in SSA form, compiled for the script target and run to
//! completion on the scheduler.

use proptest::prelude::*;
use strand_codegen::GenConfig;
use strand_ir::{
    BinaryOp, CallCommon, CallMode, Callee, ChanDir, ConstValue, Constant, Function,
    FunctionBuilder, InstKind, Operand, Program, SelectState, Type, ValueId,
};
use strand_rt::{Frame, RuntimeError, Step, TaskId};
use strand_script::builtins::make_chan as new_chan;
use strand_script::{ScriptError, Value, Vm, VmConfig, compile};

fn program(functions: Vec<Function>) -> Program {
    Program {
        package: "main".to_string(),
        functions,
        ..Default::default()
    }
}

fn load(functions: Vec<Function>) -> Vm {
    let generated = compile(&program(functions), &GenConfig::default()).unwrap();
    assert!(!generated.has_errors(), "{:#?}", generated.diagnostics);
    let config = VmConfig {
        seed: Some(7),
        ..VmConfig::default()
    };
    Vm::with_config(&generated.render(), config).unwrap()
}

fn run_main(functions: Vec<Function>) -> Result<String, ScriptError> {
    let mut vm = load(functions);
    vm.call("main.main", Vec::new())?;
    Ok(vm.take_output())
}

fn builtin(fb: &mut FunctionBuilder, name: &str, args: Vec<Operand>) {
    fb.effect(InstKind::Call {
        call: CallCommon {
            callee: Callee::Builtin(name.to_string()),
            args,
        },
        mode: CallMode::Normal,
    });
}

fn println(fb: &mut FunctionBuilder, args: Vec<Operand>) {
    builtin(fb, "println", args);
}

/// Call with no result: plain, `go` or `defer`.
fn call_effect(fb: &mut FunctionBuilder, mode: CallMode, name: &str, args: Vec<Operand>) {
    fb.effect(InstKind::Call {
        call: CallCommon {
            callee: Callee::Value(Operand::Function(name.to_string())),
            args,
        },
        mode,
    });
}

fn make_chan(fb: &mut FunctionBuilder, size: i64) -> ValueId {
    fb.push(
        Type::chan(Type::Int),
        InstKind::MakeChan {
            size: Operand::int(size),
        },
    )
}

fn v(index: u32) -> Operand {
    Operand::Value(ValueId(index))
}

/// `sum(n)`: 0 + 1 + ... + (n - 1) with a two-phi loop.
fn sum_function() -> Function {
    let mut fb = FunctionBuilder::new("main.sum")
        .param("n", Type::Int)
        .result(Type::Int);
    let head = fb.block("loop.head");
    let body = fb.block("loop.body");
    let done = fb.block("loop.done");
    fb.jump(head);

    fb.switch_to(head);
    let i = fb.phi(Type::Int, vec![Operand::int(0), v(4)]);
    let s = fb.phi(Type::Int, vec![Operand::int(0), v(3)]);
    let more = fb.binop(Type::Bool, BinaryOp::Lt, i.into(), Operand::Param(0));
    fb.branch(more.into(), body, done);

    fb.switch_to(body);
    let s2 = fb.binop(Type::Int, BinaryOp::Add, s.into(), i.into());
    let i2 = fb.binop(Type::Int, BinaryOp::Add, i.into(), Operand::int(1));
    assert_eq!((s2, i2), (ValueId(3), ValueId(4)));
    fb.jump(head);

    fb.switch_to(done);
    fb.ret(vec![s.into()]);
    fb.finish()
}

/// `fib(n)` with phis that read each other in the loop header.
fn fib_function() -> Function {
    let mut fb = FunctionBuilder::new("main.fib")
        .param("n", Type::Int)
        .result(Type::Int);
    let head = fb.block("loop.head");
    let body = fb.block("loop.body");
    let done = fb.block("loop.done");
    fb.jump(head);

    fb.switch_to(head);
    let i = fb.phi(Type::Int, vec![Operand::int(0), v(5)]);
    let a = fb.phi(Type::Int, vec![Operand::int(0), v(2)]);
    let b = fb.phi(Type::Int, vec![Operand::int(1), v(4)]);
    assert_eq!(b, ValueId(2));
    let more = fb.binop(Type::Bool, BinaryOp::Lt, i.into(), Operand::Param(0));
    fb.branch(more.into(), body, done);

    fb.switch_to(body);
    let next = fb.binop(Type::Int, BinaryOp::Add, a.into(), b.into());
    let i2 = fb.binop(Type::Int, BinaryOp::Add, i.into(), Operand::int(1));
    assert_eq!((next, i2), (ValueId(4), ValueId(5)));
    fb.jump(head);

    fb.switch_to(done);
    fb.ret(vec![a.into()]);
    fb.finish()
}

#[test]
fn loops_carry_values_through_phis() {
    let mut vm = load(vec![sum_function(), fib_function()]);
    assert_eq!(vm.call("main.sum", vec![Value::Int(5)]).unwrap(), vec![Value::Int(10)]);
    assert_eq!(vm.call("main.sum", vec![Value::Int(0)]).unwrap(), vec![Value::Int(0)]);
    assert_eq!(vm.call("main.fib", vec![Value::Int(10)]).unwrap(), vec![Value::Int(55)]);
}

#[test]
fn println_writes_to_the_captured_output() {
    let mut fb = FunctionBuilder::new("main.main");
    println(&mut fb, vec![Operand::string("hello"), Operand::int(42), Operand::bool(true)]);
    fb.ret(Vec::new());
    let out = run_main(vec![fb.finish()]).unwrap();
    insta::assert_snapshot!(out.trim_end(), @"hello 42 true");
}

/// `take(ch)`: entry block, a receive in block 1, the result returned from
/// block 2.
fn take_function() -> Function {
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

fn producer_function() -> Function {
    let mut fb = FunctionBuilder::new("main.producer").param("ch", Type::chan(Type::Int));
    fb.send(Operand::Param(0), Operand::int(42));
    fb.ret(Vec::new());
    fb.finish()
}

#[test]
fn blocked_receive_resumes_once_a_sender_arrives() {
    let mut vm = load(vec![take_function(), producer_function()]);
    let ch = new_chan(&Value::Int(0)).unwrap();
    let id = vm.start("main.take", vec![ch.clone()]).unwrap();

    assert_eq!(vm.step(TaskId::MAIN).unwrap(), Step::Ran(id));
    let frame = vm.frame(id).unwrap();
    assert_eq!(frame.next(), -1);
    assert!(!frame.is_complete());

    // Nothing to receive yet: the frame stays parked.
    assert_eq!(vm.step(TaskId::MAIN).unwrap(), Step::Ran(id));
    assert_eq!(vm.frame(id).unwrap().next(), -1);
    assert!(!vm.frame(id).unwrap().is_complete());

    let sender = vm.spawn("main.producer", vec![ch]).unwrap();
    vm.step(sender).unwrap();
    vm.step(sender).unwrap();
    assert_eq!(vm.step(sender).unwrap(), Step::Idle);

    assert_eq!(vm.step(TaskId::MAIN).unwrap(), Step::Ran(id));
    let frame = vm.frame(id).unwrap();
    assert!(frame.is_complete());
    assert_eq!(frame.results(), &[Value::Int(42)]);
    assert_eq!(vm.step(TaskId::MAIN).unwrap(), Step::Idle);
}

#[test]
fn send_suspends_before_touching_the_channel() {
    let mut fb = FunctionBuilder::new("main.main");
    let ch = make_chan(&mut fb, 1);
    fb.send(ch.into(), Operand::int(9));
    let got = fb.recv(Type::Int, ch.into(), false);
    println(&mut fb, vec![got.into()]);
    fb.ret(Vec::new());

    let mut vm = load(vec![fb.finish()]);
    let id = vm.start("main.main", Vec::new()).unwrap();
    vm.step(TaskId::MAIN).unwrap();
    assert_eq!(vm.frame(id).unwrap().next(), -1);
    assert_eq!(vm.output(), "");
    vm.run().unwrap();
    assert_eq!(vm.output(), "9\n");
}

#[test]
fn goroutine_hands_a_value_over_an_unbuffered_channel() {
    let mut producer = FunctionBuilder::new("main.producer").param("ch", Type::chan(Type::Int));
    producer.send(Operand::Param(0), Operand::int(42));
    producer.ret(Vec::new());

    let mut fb = FunctionBuilder::new("main.main");
    let ch = make_chan(&mut fb, 0);
    call_effect(&mut fb, CallMode::Go, "main.producer", vec![ch.into()]);
    let got = fb.recv(Type::Int, ch.into(), false);
    println(&mut fb, vec![Operand::string("got"), got.into()]);
    fb.ret(Vec::new());

    let mut vm = load(vec![producer.finish(), fb.finish()]);
    vm.call("main.main", Vec::new()).unwrap();
    assert_eq!(vm.output(), "got 42\n");
    assert_eq!(vm.scheduler().live_frames(), 0);
}

#[test]
fn receive_from_a_closed_channel_reports_not_ok() {
    let mut fb = FunctionBuilder::new("main.main");
    let ch = make_chan(&mut fb, 1);
    builtin(&mut fb, "close", vec![ch.into()]);
    let pair = fb.recv(Type::Tuple(vec![Type::Int, Type::Bool]), ch.into(), true);
    let value = fb.push(
        Type::Int,
        InstKind::Extract {
            tuple: pair.into(),
            index: 0,
        },
    );
    let ok = fb.push(
        Type::Bool,
        InstKind::Extract {
            tuple: pair.into(),
            index: 1,
        },
    );
    println(&mut fb, vec![value.into(), ok.into()]);
    fb.ret(Vec::new());
    assert_eq!(run_main(vec![fb.finish()]).unwrap(), "0 false\n");
}

fn select_main(blocking: bool, preload: bool) -> Function {
    let mut fb = FunctionBuilder::new("main.main");
    let ready = make_chan(&mut fb, 1);
    if preload {
        fb.send(ready.into(), Operand::int(5));
    }
    let idle = make_chan(&mut fb, 1);
    let states = [ready, idle]
        .into_iter()
        .map(|chan| SelectState {
            dir: ChanDir::Recv,
            chan: Operand::Value(chan),
            send: None,
        })
        .collect();
    let sel = fb.push(
        Type::Tuple(vec![Type::Int, Type::Bool, Type::Int, Type::Int]),
        InstKind::Select { states, blocking },
    );
    let index = fb.push(Type::Int, InstKind::Extract { tuple: sel.into(), index: 0 });
    let value = fb.push(Type::Int, InstKind::Extract { tuple: sel.into(), index: 2 });
    println(&mut fb, vec![index.into(), value.into()]);
    fb.ret(Vec::new());
    fb.finish()
}

#[test]
fn select_takes_the_only_ready_arm() {
    assert_eq!(run_main(vec![select_main(true, true)]).unwrap(), "0 5\n");
}

#[test]
fn non_blocking_select_falls_through_with_minus_one() {
    assert_eq!(run_main(vec![select_main(false, false)]).unwrap(), "-1 0\n");
}

#[test]
fn blocking_select_with_nothing_ready_deadlocks() {
    let err = run_main(vec![select_main(true, false)]).unwrap_err();
    assert!(matches!(err.root(), ScriptError::Runtime(RuntimeError::Deadlock)), "{err}");
}

#[test]
fn receive_with_no_sender_deadlocks() {
    let mut fb = FunctionBuilder::new("main.main");
    let ch = make_chan(&mut fb, 0);
    let got = fb.recv(Type::Int, ch.into(), false);
    println(&mut fb, vec![got.into()]);
    fb.ret(Vec::new());
    let err = run_main(vec![fb.finish()]).unwrap_err();
    assert_eq!(err.to_string(), "all tasks are asleep - deadlock!");
}

#[test]
fn deferred_recover_resumes_at_the_recover_block() {
    let mut handler = FunctionBuilder::new("main.handler");
    let caught = handler.builtin(Type::empty_interface(), "recover", Vec::new());
    println(&mut handler, vec![Operand::string("recovered"), caught.into()]);
    handler.ret(Vec::new());

    let mut safe = FunctionBuilder::new("main.safe").result(Type::Int);
    let resume = safe.block("recover");
    call_effect(&mut safe, CallMode::Defer, "main.handler", Vec::new());
    safe.panic(Operand::string("boom"));
    safe.switch_to(resume);
    safe.ret(vec![Operand::int(7)]);
    safe.set_recover(resume);

    let mut fb = FunctionBuilder::new("main.main");
    let x = fb.call_static(Type::Int, "main.safe", Vec::new());
    println(&mut fb, vec![x.into()]);
    fb.ret(Vec::new());

    let out = run_main(vec![handler.finish(), safe.finish(), fb.finish()]).unwrap();
    assert_eq!(out, "recovered boom\n7\n");
}

#[test]
fn defers_left_after_a_recover_still_run() {
    let mut say = FunctionBuilder::new("main.say").param("s", Type::String);
    println(&mut say, vec![Operand::Param(0)]);
    say.ret(Vec::new());

    let mut handler = FunctionBuilder::new("main.handler");
    let caught = handler.builtin(Type::empty_interface(), "recover", Vec::new());
    println(&mut handler, vec![Operand::string("recovered"), caught.into()]);
    handler.ret(Vec::new());

    let mut safe = FunctionBuilder::new("main.safe").result(Type::Int);
    let resume = safe.block("recover");
    call_effect(&mut safe, CallMode::Defer, "main.say", vec![Operand::string("first-deferred")]);
    call_effect(&mut safe, CallMode::Defer, "main.handler", Vec::new());
    safe.panic(Operand::string("boom"));
    safe.switch_to(resume);
    safe.ret(vec![Operand::int(7)]);
    safe.set_recover(resume);

    let mut fb = FunctionBuilder::new("main.main");
    let x = fb.call_static(Type::Int, "main.safe", Vec::new());
    println(&mut fb, vec![x.into()]);
    fb.ret(Vec::new());

    let out = run_main(vec![say.finish(), handler.finish(), safe.finish(), fb.finish()]).unwrap();
    assert_eq!(out, "recovered boom\nfirst-deferred\n7\n");
}

#[test]
fn recover_outside_a_deferred_call_returns_nil() {
    let mut helper = FunctionBuilder::new("main.helper");
    let caught = helper.builtin(Type::empty_interface(), "recover", Vec::new());
    println(&mut helper, vec![Operand::string("helper"), caught.into()]);
    helper.ret(Vec::new());

    let mut handler = FunctionBuilder::new("main.handler");
    call_effect(&mut handler, CallMode::Normal, "main.helper", Vec::new());
    handler.ret(Vec::new());

    let mut fb = FunctionBuilder::new("main.main");
    call_effect(&mut fb, CallMode::Defer, "main.handler", Vec::new());
    fb.panic(Operand::string("boom"));

    let mut vm = load(vec![helper.finish(), handler.finish(), fb.finish()]);
    let err = vm.call("main.main", Vec::new()).unwrap_err();
    assert_eq!(err.to_string(), "panic: \"boom\"");
    assert_eq!(vm.take_output(), "helper nil\n");
}

#[test]
fn defers_run_last_in_first_out() {
    let mut say = FunctionBuilder::new("main.say").param("s", Type::String);
    println(&mut say, vec![Operand::Param(0)]);
    say.ret(Vec::new());

    let mut fb = FunctionBuilder::new("main.main");
    call_effect(&mut fb, CallMode::Defer, "main.say", vec![Operand::string("first")]);
    call_effect(&mut fb, CallMode::Defer, "main.say", vec![Operand::string("second")]);
    println(&mut fb, vec![Operand::string("body")]);
    fb.effect(InstKind::RunDefers);
    fb.ret(Vec::new());

    let out = run_main(vec![say.finish(), fb.finish()]).unwrap();
    assert_eq!(out, "body\nsecond\nfirst\n");
}

#[test]
fn unrecovered_panic_ends_the_run() {
    let mut fb = FunctionBuilder::new("main.main");
    fb.panic(Operand::string("boom"));
    let err = run_main(vec![fb.finish()]).unwrap_err();
    assert_eq!(err.to_string(), "panic: \"boom\"");
}

#[test]
fn division_by_zero_becomes_a_panic() {
    let mut fb = FunctionBuilder::new("main.div")
        .param("a", Type::Int)
        .param("b", Type::Int)
        .result(Type::Int);
    let q = fb.binop(Type::Int, BinaryOp::Div, Operand::Param(0), Operand::Param(1));
    fb.ret(vec![q.into()]);
    let mut vm = load(vec![fb.finish()]);
    assert_eq!(
        vm.call("main.div", vec![Value::Int(9), Value::Int(3)]).unwrap(),
        vec![Value::Int(3)]
    );
    let err = vm.call("main.div", vec![Value::Int(1), Value::Int(0)]).unwrap_err();
    assert!(err.to_string().contains("integer divide by zero"), "{err}");
}

#[test]
fn negative_shift_counts_become_a_panic() {
    let mut fb = FunctionBuilder::new("main.shl")
        .param("a", Type::Int)
        .param("n", Type::Int)
        .result(Type::Int);
    let r = fb.binop(Type::Int, BinaryOp::Shl, Operand::Param(0), Operand::Param(1));
    fb.ret(vec![r.into()]);
    let mut vm = load(vec![fb.finish()]);
    assert_eq!(
        vm.call("main.shl", vec![Value::Int(1), Value::Int(4)]).unwrap(),
        vec![Value::Int(16)]
    );
    let err = vm.call("main.shl", vec![Value::Int(1), Value::Int(-2)]).unwrap_err();
    assert!(err.to_string().contains("negative shift amount"), "{err}");
}

#[test]
fn closures_see_their_bindings() {
    let mut add = FunctionBuilder::new("main.main$1")
        .param("y", Type::Int)
        .free_var("x", Type::Int)
        .result(Type::Int);
    let sum = add.binop(Type::Int, BinaryOp::Add, Operand::FreeVar(0), Operand::Param(0));
    add.ret(vec![sum.into()]);

    let mut fb = FunctionBuilder::new("main.main");
    let closure = fb.push(
        Type::func(vec![Type::Int], vec![Type::Int]),
        InstKind::MakeClosure {
            func: "main.main$1".to_string(),
            bindings: vec![Operand::int(10)],
        },
    );
    let r = fb.call(Type::Int, Callee::Value(closure.into()), vec![Operand::int(5)], CallMode::Normal);
    println(&mut fb, vec![r.into()]);
    fb.ret(Vec::new());

    assert_eq!(run_main(vec![add.finish(), fb.finish()]).unwrap(), "15\n");
}

#[test]
fn interface_calls_dispatch_on_the_dynamic_type() {
    let named = Type::named("main.T", Type::Int);
    let mut get = FunctionBuilder::new("main.T.Get")
        .param("t", named.clone())
        .result(Type::Int);
    let doubled = get.binop(Type::Int, BinaryOp::Mul, Operand::Param(0), Operand::int(2));
    get.ret(vec![doubled.into()]);

    let mut fb = FunctionBuilder::new("main.main");
    let boxed = fb.push(
        Type::empty_interface(),
        InstKind::MakeInterface {
            x: Operand::Const(Constant {
                ty: named,
                value: ConstValue::Int(21),
            }),
        },
    );
    let r = fb.call(
        Type::Int,
        Callee::Invoke {
            recv: boxed.into(),
            method: "Get".to_string(),
        },
        Vec::new(),
        CallMode::Normal,
    );
    println(&mut fb, vec![r.into()]);
    fb.ret(Vec::new());

    assert_eq!(run_main(vec![get.finish(), fb.finish()]).unwrap(), "42\n");
}

#[test]
fn calling_a_function_without_a_body_fails() {
    let missing = Function {
        name: "main.ext".to_string(),
        ..Default::default()
    };
    let mut fb = FunctionBuilder::new("main.main");
    call_effect(&mut fb, CallMode::Normal, "main.ext", Vec::new());
    fb.ret(Vec::new());
    let err = run_main(vec![missing, fb.finish()]).unwrap_err();
    assert!(matches!(err.root(), ScriptError::Placeholder(_)), "{err}");
}

/// A straight chain `b0 -> b1 -> ... -> b(n-1)` adding one per block.
fn chain(n: u32) -> Function {
    let mut fb = FunctionBuilder::new("main.chain").result(Type::Int);
    let mut acc: Operand = Operand::int(0);
    for i in 0..n {
        let next = fb.binop(Type::Int, BinaryOp::Add, acc, Operand::int(1));
        acc = next.into();
        if i + 1 < n {
            let block = fb.block("step");
            fb.jump(block);
            fb.switch_to(block);
        }
    }
    fb.ret(vec![acc]);
    fb.finish()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn sum_matches_closed_form(n in 0i64..60) {
        let mut vm = load(vec![sum_function()]);
        let got = vm.call("main.sum", vec![Value::Int(n)]).unwrap();
        prop_assert_eq!(got, vec![Value::Int(n * (n - 1) / 2)]);
    }

    #[test]
    fn chains_emit_every_block_in_order(n in 1u32..24) {
        let generated = compile(&program(vec![chain(n)]), &GenConfig::default()).unwrap();
        let unit = generated.unit("main.chain").unwrap();
        prop_assert_eq!(&unit.trace.blocks, &(0..n).collect::<Vec<_>>());
        let mut vm = Vm::load(&generated.render()).unwrap();
        prop_assert_eq!(vm.call("main.chain", Vec::new()).unwrap(), vec![Value::Int(i64::from(n))]);
    }
}
