//! Per-function storage planning.
//!
//! A function's code is cut into units: straight-line runs that never span a
//! suspension point, a block boundary or a terminator. A register read only
//! inside the unit that defines it is a temp; anything else must live on the
//! frame. Functions that never suspend keep every register in run locals
//! unless they are split into sub-units, which then behave like suspension
//! boundaries. The decision is made once per function.

use std::collections::{BTreeMap, BTreeSet};

use strand_ir::{
    BlockId, CallMode, ChanDir, Function, InstKind, Operand, Terminator, Type, ValueId,
    consumer_counts,
};

use crate::calls::{CallPlan, classify_call};
use crate::layout::{LayoutEngine, LayoutError};
use crate::target::{SlotDecl, StackAllocDecl, StorageClass, TargetLimits, ZeroValue};
use crate::{CodegenError, GenContext};

/// How an instruction interacts with the pseudo-block sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    Plain,
    /// Takes an address for its callee slot but never suspends.
    Addressed,
    Suspends,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Init {
    /// Always written before the first read.
    Deferred,
    Zero(ZeroValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterInfo {
    pub class: StorageClass,
    pub ty: Type,
    pub init: Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Named,
    Array,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoragePlan {
    pub mode: StorageMode,
    pub suspends: bool,
    pub split: bool,
    pub registers: BTreeMap<ValueId, RegisterInfo>,
    pub dead: BTreeSet<ValueId>,
    /// Site kind of every instruction, indexed by block then position.
    pub sites: Vec<Vec<SiteKind>>,
    pub slots: Vec<SlotDecl>,
    pub selects: Vec<i64>,
    pub stack_allocs: Vec<StackAllocDecl>,
    /// Blocks whose phis read other phis of the same block.
    pub staged: BTreeSet<BlockId>,
    pub uses_phi: bool,
    pub array_slots: usize,
}

impl StoragePlan {
    pub fn class_of(&self, id: ValueId) -> Option<StorageClass> {
        self.registers.get(&id).map(|info| info.class)
    }

    pub fn count(&self, wanted: fn(StorageClass) -> bool) -> usize {
        self.registers.values().filter(|r| wanted(r.class)).count()
    }

    pub fn site(&self, block: BlockId, index: usize) -> SiteKind {
        self.sites
            .get(block.index())
            .and_then(|b| b.get(index))
            .copied()
            .unwrap_or(SiteKind::Plain)
    }
}

/// Zero value of `ty` as the target must materialise it.
pub fn zero_of(ty: &Type, layout: &mut LayoutEngine) -> Result<ZeroValue, LayoutError> {
    Ok(match ty.underlying() {
        Type::Bool => ZeroValue::Bool,
        Type::Float32 | Type::Float64 => ZeroValue::Float,
        Type::Complex64 | Type::Complex128 => ZeroValue::Complex,
        Type::String => ZeroValue::String,
        Type::Struct(_) | Type::Array { .. } => ZeroValue::Aggregate {
            size: layout.size_of(ty)?,
        },
        Type::Named { name, .. } => return Err(LayoutError::Opaque(name.clone())),
        Type::Int
        | Type::Int8
        | Type::Int16
        | Type::Int32
        | Type::Int64
        | Type::Uint
        | Type::Uint8
        | Type::Uint16
        | Type::Uint32
        | Type::Uint64
        | Type::Uintptr => ZeroValue::Int,
        _ => ZeroValue::Nil,
    })
}

/// Classify one instruction. Errors here are hard generation errors.
pub fn site_kind(
    ctx: &GenContext<'_>,
    function: &Function,
    block: BlockId,
    kind: &InstKind,
) -> Result<SiteKind, CodegenError> {
    Ok(match kind {
        InstKind::Unknown => {
            return Err(CodegenError::UnknownInstruction {
                function: function.name.clone(),
                block: block.0,
                op: kind.name().to_string(),
            });
        }
        InstKind::Send { .. } | InstKind::Recv { .. } | InstKind::RunDefers => SiteKind::Suspends,
        InstKind::Select { states, .. } => {
            if let Some(state) = states
                .iter()
                .position(|s| s.dir == ChanDir::Both)
            {
                return Err(CodegenError::InvalidChannelDirection {
                    function: function.name.clone(),
                    state,
                });
            }
            SiteKind::Suspends
        }
        InstKind::Call { call, mode } => match (classify_call(ctx, function, call, *mode)?, mode) {
            (CallPlan::Builtin(_) | CallPlan::Missing { .. }, _) => SiteKind::Plain,
            (CallPlan::Frame { .. }, CallMode::Defer) => SiteKind::Plain,
            (CallPlan::Frame { .. }, CallMode::Go) => SiteKind::Suspends,
            (CallPlan::Frame { sync: true, .. }, CallMode::Normal) => SiteKind::Addressed,
            (CallPlan::Frame { sync: false, .. }, CallMode::Normal) => SiteKind::Suspends,
        },
        _ => SiteKind::Plain,
    })
}

/// Unit bookkeeping for one pass over the function.
#[derive(Default)]
struct Zones {
    current: usize,
    defs: BTreeMap<ValueId, usize>,
    uses: BTreeMap<ValueId, BTreeSet<usize>>,
}

impl Zones {
    fn open(&mut self) -> usize {
        self.current += 1;
        self.current
    }

    fn read(&mut self, operand: &Operand, unit: usize) {
        if let Operand::Value(id) = operand {
            self.uses.entry(*id).or_default().insert(unit);
        }
    }

    fn define(&mut self, dest: Option<ValueId>) {
        if let Some(dest) = dest {
            self.defs.insert(dest, self.current);
        }
    }

    fn crosses(&self, id: ValueId) -> bool {
        let def = self.defs.get(&id).copied().unwrap_or(0);
        self.uses
            .get(&id)
            .is_some_and(|units| units.iter().any(|&u| u != def))
    }
}

pub fn plan_function(
    ctx: &GenContext<'_>,
    function: &Function,
    layout: &mut LayoutEngine,
    limits: TargetLimits,
) -> Result<StoragePlan, CodegenError> {
    let layout_err = |source: LayoutError| CodegenError::Layout {
        function: function.name.clone(),
        source,
    };
    let suspends = ctx.suspends(&function.name);
    let split = function.instruction_count() > limits.sub_fn_instruction_limit;
    let unit_scoped = suspends || split;

    let mut zones = Zones::default();
    let mut first_units = Vec::with_capacity(function.blocks.len());
    let mut sites = Vec::with_capacity(function.blocks.len());
    let mut slots = Vec::new();
    let mut selects = Vec::new();
    let mut next_addr = -1i64;
    let mut take_addr = || {
        let addr = next_addr;
        next_addr -= 1;
        addr
    };

    for block in &function.blocks {
        first_units.push(zones.open());
        let mut block_sites = Vec::with_capacity(block.instrs.len());
        for inst in &block.instrs {
            let site = site_kind(ctx, function, block.index, &inst.kind)?;
            block_sites.push(site);
            match (site, &inst.kind) {
                (_, InstKind::Phi { .. }) => {}
                (SiteKind::Suspends, InstKind::Call { mode, .. }) => {
                    let addr = take_addr();
                    if *mode == CallMode::Normal {
                        slots.push(SlotDecl {
                            addr,
                            persisted: true,
                        });
                    }
                    let unit = zones.current;
                    inst.kind.operands().into_iter().for_each(|op| zones.read(op, unit));
                    zones.open();
                }
                (SiteKind::Suspends, kind) => {
                    let addr = take_addr();
                    if matches!(kind, InstKind::Select { .. }) {
                        selects.push(addr);
                    }
                    let unit = zones.open();
                    kind.operands().into_iter().for_each(|op| zones.read(op, unit));
                }
                (SiteKind::Addressed, kind) => {
                    slots.push(SlotDecl {
                        addr: take_addr(),
                        persisted: false,
                    });
                    let unit = zones.current;
                    kind.operands().into_iter().for_each(|op| zones.read(op, unit));
                }
                (SiteKind::Plain, kind) => {
                    let unit = zones.current;
                    kind.operands().into_iter().for_each(|op| zones.read(op, unit));
                }
            }
            zones.define(inst.dest);
        }
        sites.push(block_sites);
        match &block.terminator {
            Terminator::Panic { value } => {
                let unit = zones.current;
                zones.read(value, unit);
                take_addr();
            }
            Terminator::Jump { .. } => {}
            other => {
                let unit = zones.open();
                other.operands().into_iter().for_each(|op| zones.read(op, unit));
            }
        }
    }

    // Phi edges are read where the phi runs: the successor's first unit.
    let mut staged = BTreeSet::new();
    for block in &function.blocks {
        let unit = first_units[block.index.index()];
        let phi_dests: BTreeSet<ValueId> = block
            .instrs
            .iter()
            .filter(|inst| matches!(inst.kind, InstKind::Phi { .. }))
            .filter_map(|inst| inst.dest)
            .collect();
        for inst in &block.instrs {
            if let InstKind::Phi { edges } = &inst.kind {
                for edge in edges {
                    zones.read(edge, unit);
                    if edge.value_id().is_some_and(|id| phi_dests.contains(&id)) {
                        staged.insert(block.index);
                    }
                }
            }
        }
    }

    let consumers = consumer_counts(function);
    let mut registers = BTreeMap::new();
    let mut dead = BTreeSet::new();
    let mut stack_allocs = Vec::new();
    for (_, _, inst) in function.instructions() {
        let Some(dest) = inst.dest else { continue };
        if consumers.get(&dest).copied().unwrap_or(0) == 0 {
            dead.insert(dest);
            continue;
        }
        let class = if !unit_scoped {
            StorageClass::Local
        } else if zones.crosses(dest) {
            StorageClass::Field
        } else {
            StorageClass::Temp
        };
        let init = if inst.ty.zero_is_allocation() {
            Init::Deferred
        } else {
            Init::Zero(zero_of(&inst.ty, layout).map_err(layout_err)?)
        };
        if let InstKind::Alloc { heap: false } = inst.kind {
            let pointee = inst.ty.pointee().cloned().unwrap_or_default();
            stack_allocs.push(StackAllocDecl {
                value: dest,
                size: layout.size_of(&pointee).map_err(layout_err)?,
            });
        }
        registers.insert(
            dest,
            RegisterInfo {
                class,
                ty: inst.ty.clone(),
                init,
            },
        );
    }

    let named = registers
        .values()
        .filter(|r| matches!(r.class, StorageClass::Field | StorageClass::Local))
        .count();
    let mode = if named > limits.instruction_limit {
        StorageMode::Array
    } else {
        StorageMode::Named
    };
    let mut array_slots = 0;
    if mode == StorageMode::Array {
        for (_, _, inst) in function.instructions() {
            if let Some(info) = inst.dest.and_then(|d| registers.get_mut(&d)) {
                info.class = StorageClass::Array(array_slots);
                array_slots += 1;
            }
        }
    }

    Ok(StoragePlan {
        mode,
        suspends,
        split,
        registers,
        dead,
        sites,
        slots,
        selects,
        stack_allocs,
        staged,
        uses_phi: function.blocks.iter().any(|b| b.has_phi()),
        array_slots,
    })
}
