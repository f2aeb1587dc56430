//! Whole-function and whole-program facts the emitter needs up front.

use std::collections::{BTreeMap, BTreeSet};

use crate::{BlockId, CallMode, Callee, Function, InstKind, Operand, Program, Terminator, ValueId};

/// Number of consumers ("referrers") of each value defined in `function`.
/// Values nobody reads map to zero and must not receive storage.
pub fn consumer_counts(function: &Function) -> BTreeMap<ValueId, usize> {
    let mut counts: BTreeMap<ValueId, usize> = BTreeMap::new();
    for (_, _, inst) in function.instructions() {
        if let Some(dest) = inst.dest {
            counts.entry(dest).or_insert(0);
        }
    }
    let mut bump = |op: &Operand| {
        if let Operand::Value(id) = op {
            *counts.entry(*id).or_insert(0) += 1;
        }
    };
    for block in &function.blocks {
        for inst in &block.instrs {
            inst.kind.operands().into_iter().for_each(&mut bump);
        }
        block.terminator.operands().into_iter().for_each(&mut bump);
    }
    counts
}

/// Defining block and position for every value.
pub fn definitions(function: &Function) -> BTreeMap<ValueId, (BlockId, usize)> {
    function
        .instructions()
        .filter_map(|(block, pos, inst)| inst.dest.map(|dest| (dest, (block, pos))))
        .collect()
}

/// Whether each function of a program may suspend.
pub type SuspensionMap = BTreeMap<String, bool>;

/// Instructions that suspend regardless of what they call.
pub fn suspends_inherently(kind: &InstKind) -> bool {
    match kind {
        InstKind::Send { .. }
        | InstKind::Recv { .. }
        | InstKind::Select { .. }
        | InstKind::RunDefers => true,
        InstKind::Call { call, mode } => match (&call.callee, mode) {
            (Callee::Builtin(_), CallMode::Normal) => false,
            (_, CallMode::Go | CallMode::Defer) => true,
            (Callee::Invoke { .. }, CallMode::Normal) => true,
            (Callee::Value(Operand::Function(_)), CallMode::Normal) => false,
            (Callee::Value(_), CallMode::Normal) => true,
        },
        _ => false,
    }
}

/// Static callees whose suspension propagates to the caller. Calls through
/// closures built in the same function count as static.
fn static_callees(function: &Function) -> BTreeSet<&str> {
    let closures: BTreeMap<ValueId, &str> = function
        .instructions()
        .filter_map(|(_, _, inst)| match (&inst.kind, inst.dest) {
            (InstKind::MakeClosure { func, .. }, Some(dest)) => Some((dest, func.as_str())),
            _ => None,
        })
        .collect();
    function
        .instructions()
        .filter_map(|(_, _, inst)| match &inst.kind {
            InstKind::Call {
                call,
                mode: CallMode::Normal,
            } => match &call.callee {
                Callee::Value(Operand::Function(name)) => Some(name.as_str()),
                Callee::Value(Operand::Value(id)) => closures.get(id).copied(),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// Fixpoint over the static call graph. A function suspends if it contains
/// an inherently suspending instruction, panics, or statically calls a
/// function that suspends. Explicit front-end flags seed the analysis and are
/// never cleared; bodiless functions do not suspend.
pub fn infer_suspension(program: &Program) -> SuspensionMap {
    let mut map: SuspensionMap = program
        .functions
        .iter()
        .map(|f| {
            let local = f.may_suspend.unwrap_or(false)
                || f.blocks.iter().any(|b| {
                    matches!(b.terminator, Terminator::Panic { .. })
                        || b.instrs.iter().any(|inst| suspends_inherently(&inst.kind))
                });
            (f.name.clone(), local)
        })
        .collect();

    let edges: Vec<(&str, BTreeSet<&str>)> = program
        .functions
        .iter()
        .map(|f| (f.name.as_str(), static_callees(f)))
        .collect();

    loop {
        let mut changed = false;
        for (caller, callees) in &edges {
            if map.get(*caller).copied().unwrap_or(false) {
                continue;
            }
            if callees
                .iter()
                .any(|callee| map.get(*callee).copied().unwrap_or(false))
            {
                map.insert((*caller).to_string(), true);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    map
}
