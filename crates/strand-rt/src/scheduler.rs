//! Cooperative scheduler: frame arena, task stacks, panic unwinding.
//!
//! Only one frame runs at a time. A task's top frame is the one that runs;
//! a frame that finishes pops itself, which lets the frame below resume at
//! its pending pseudo-block. Deferred calls are frames that were built, then
//! popped and parked on their creator until unwinding pushes them back.

use std::fmt;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::trace;

use crate::{FrameId, RuntimeError, TaskId};

/// What the scheduler needs to know about a generated frame.
pub trait Frame {
    type Value: Clone + fmt::Debug;

    fn is_complete(&self) -> bool;
    /// Mark the frame finished without results (recovered, no recovery block).
    fn finish(&mut self);
    /// Most recently deferred call that has not run yet.
    fn take_deferred(&mut self) -> Option<FrameId>;
    /// Block to resume at after a recovered panic.
    fn recover_target(&self) -> Option<i64>;
    fn resume_at(&mut self, next: i64);
}

#[derive(Debug)]
enum Slot<F> {
    Vacant,
    Occupied(F),
    Running,
}

#[derive(Debug, Clone)]
struct PanicState<V> {
    value: V,
    recovered: bool,
    /// Frame being unwound.
    frame: FrameId,
    region: Option<u32>,
}

#[derive(Debug)]
struct Task<V> {
    stack: Vec<FrameId>,
    panic: Option<PanicState<V>>,
}

impl<V> Default for Task<V> {
    fn default() -> Self {
        Self {
            stack: Vec::new(),
            panic: None,
        }
    }
}

/// Outcome of a single scheduling step on one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The task has no frames.
    Idle,
    /// The top frame ran once.
    Ran(FrameId),
    /// The top frame was being unwound; one unwinding action was taken.
    Unwound(FrameId),
}

#[derive(Debug)]
pub struct Scheduler<F: Frame> {
    frames: Vec<Slot<F>>,
    free: Vec<FrameId>,
    tasks: Vec<Task<F::Value>>,
    rng: StdRng,
}

impl<F: Frame> Default for Scheduler<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Frame> Scheduler<F> {
    /// A scheduler with the main task and an entropy-seeded select source.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic select choices, for replayable runs.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            frames: Vec::new(),
            free: Vec::new(),
            tasks: vec![Task::default()],
            rng,
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    // -- arena --------------------------------------------------------------

    pub fn alloc(&mut self, frame: F) -> FrameId {
        if let Some(id) = self.free.pop() {
            self.frames[id.0 as usize] = Slot::Occupied(frame);
            return id;
        }
        self.frames.push(Slot::Occupied(frame));
        FrameId((self.frames.len() - 1) as u32)
    }

    /// Return a frame's arena slot for reuse.
    pub fn release(&mut self, id: FrameId) {
        if let Some(slot) = self.frames.get_mut(id.0 as usize)
            && matches!(slot, Slot::Occupied(_))
        {
            *slot = Slot::Vacant;
            self.free.push(id);
        }
    }

    pub fn frame(&self, id: FrameId) -> Result<&F, RuntimeError> {
        match self.frames.get(id.0 as usize) {
            Some(Slot::Occupied(frame)) => Ok(frame),
            Some(Slot::Running) => Err(RuntimeError::FrameBusy(id.0)),
            _ => Err(RuntimeError::UnknownFrame(id.0)),
        }
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Result<&mut F, RuntimeError> {
        match self.frames.get_mut(id.0 as usize) {
            Some(Slot::Occupied(frame)) => Ok(frame),
            Some(Slot::Running) => Err(RuntimeError::FrameBusy(id.0)),
            _ => Err(RuntimeError::UnknownFrame(id.0)),
        }
    }

    /// Move a frame out of the arena while it runs.
    pub fn take(&mut self, id: FrameId) -> Result<F, RuntimeError> {
        let slot = self
            .frames
            .get_mut(id.0 as usize)
            .ok_or(RuntimeError::UnknownFrame(id.0))?;
        match std::mem::replace(slot, Slot::Running) {
            Slot::Occupied(frame) => Ok(frame),
            Slot::Running => Err(RuntimeError::FrameBusy(id.0)),
            Slot::Vacant => {
                *slot = Slot::Vacant;
                Err(RuntimeError::UnknownFrame(id.0))
            }
        }
    }

    pub fn restore(&mut self, id: FrameId, frame: F) {
        if let Some(slot) = self.frames.get_mut(id.0 as usize) {
            *slot = Slot::Occupied(frame);
        }
    }

    pub fn live_frames(&self) -> usize {
        self.frames
            .iter()
            .filter(|slot| !matches!(slot, Slot::Vacant))
            .count()
    }

    // -- tasks --------------------------------------------------------------

    fn task(&self, task: TaskId) -> Result<&Task<F::Value>, RuntimeError> {
        self.tasks
            .get(task.0 as usize)
            .ok_or(RuntimeError::UnknownTask(task.0))
    }

    fn task_mut(&mut self, task: TaskId) -> Result<&mut Task<F::Value>, RuntimeError> {
        self.tasks
            .get_mut(task.0 as usize)
            .ok_or(RuntimeError::UnknownTask(task.0))
    }

    pub fn new_task(&mut self) -> TaskId {
        self.tasks.push(Task::default());
        let id = TaskId((self.tasks.len() - 1) as u32);
        trace!(target: "strand_rt", task = id.0, "new task");
        id
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn push(&mut self, task: TaskId, frame: FrameId) -> Result<(), RuntimeError> {
        self.task_mut(task)?.stack.push(frame);
        trace!(target: "strand_rt", task = task.0, frame = frame.0, "push");
        Ok(())
    }

    pub fn pop(&mut self, task: TaskId) -> Result<FrameId, RuntimeError> {
        let frame = self
            .task_mut(task)?
            .stack
            .pop()
            .ok_or(RuntimeError::EmptyStack(task.0))?;
        trace!(target: "strand_rt", task = task.0, frame = frame.0, "pop");
        Ok(frame)
    }

    pub fn top(&self, task: TaskId) -> Result<Option<FrameId>, RuntimeError> {
        Ok(self.task(task)?.stack.last().copied())
    }

    pub fn depth(&self, task: TaskId) -> Result<usize, RuntimeError> {
        Ok(self.task(task)?.stack.len())
    }

    // -- running ------------------------------------------------------------

    /// Run the top frame of `task` once, or take one unwinding action if that
    /// frame is being unwound by a panic.
    pub fn run_one<E>(
        &mut self,
        task: TaskId,
        run: impl FnOnce(&mut Self, TaskId, FrameId) -> Result<(), E>,
    ) -> Result<Step, E>
    where
        E: From<RuntimeError>,
    {
        let Some(top) = self.top(task)? else {
            return Ok(Step::Idle);
        };
        let unwinding = self
            .task(task)?
            .panic
            .as_ref()
            .is_some_and(|p| p.frame == top);
        if unwinding {
            self.unwind_step(task, top)?;
            return Ok(Step::Unwound(top));
        }
        run(self, task, top)?;
        Ok(Step::Ran(top))
    }

    /// One round over every task that has frames.
    pub fn run_all<E>(
        &mut self,
        mut run: impl FnMut(&mut Self, TaskId, FrameId) -> Result<(), E>,
    ) -> Result<Vec<Step>, E>
    where
        E: From<RuntimeError>,
    {
        let mut steps = Vec::new();
        for index in 0..self.tasks.len() {
            let step = self.run_one(TaskId(index as u32), &mut run)?;
            if step != Step::Idle {
                steps.push(step);
            }
        }
        Ok(steps)
    }

    fn unwind_step(&mut self, task: TaskId, top: FrameId) -> Result<(), RuntimeError> {
        // Every pending defer runs, also after one of them has recovered.
        if let Some(deferred) = self.frame_mut(top)?.take_deferred() {
            return self.push(task, deferred);
        }

        let recovered = self
            .task(task)?
            .panic
            .as_ref()
            .is_some_and(|p| p.recovered);
        if recovered {
            self.task_mut(task)?.panic = None;
            let frame = self.frame_mut(top)?;
            match frame.recover_target() {
                Some(block) => {
                    trace!(target: "strand_rt", task = task.0, frame = top.0, block, "recovered");
                    frame.resume_at(block);
                }
                None => {
                    frame.finish();
                    self.pop(task)?;
                }
            }
            return Ok(());
        }

        self.pop(task)?;
        let next = self.top(task)?;
        let state = self
            .task_mut(task)?
            .panic
            .as_mut()
            .ok_or(RuntimeError::EmptyStack(task.0))?;
        match next {
            Some(frame) => {
                state.frame = frame;
                Ok(())
            }
            None => Err(RuntimeError::Unrecovered(format!("{:?}", state.value))),
        }
    }

    // -- panic / recover ----------------------------------------------------

    /// Start unwinding `task` from its top frame. A panic raised while
    /// another is in flight replaces it.
    pub fn panic(&mut self, task: TaskId, value: F::Value) -> Result<(), RuntimeError> {
        let frame = self.top(task)?.ok_or(RuntimeError::EmptyStack(task.0))?;
        trace!(target: "strand_rt", task = task.0, frame = frame.0, ?value, "panic");
        self.task_mut(task)?.panic = Some(PanicState {
            value,
            recovered: false,
            frame,
            region: None,
        });
        Ok(())
    }

    /// Fault raised inside guarded region `region`: becomes a panic.
    pub fn handle(
        &mut self,
        task: TaskId,
        value: F::Value,
        region: u32,
    ) -> Result<(), RuntimeError> {
        self.panic(task, value)?;
        if let Some(state) = self.task_mut(task)?.panic.as_mut() {
            state.region = Some(region);
        }
        Ok(())
    }

    /// Stop the current panic, returning its value. `None` when not
    /// panicking, when already recovered, or when the running frame is not
    /// a deferred call of the frame being unwound.
    pub fn recover(&mut self, task: TaskId) -> Result<Option<F::Value>, RuntimeError> {
        let entry = self.task_mut(task)?;
        let Some(state) = entry.panic.as_mut() else {
            return Ok(None);
        };
        let depth = entry.stack.len();
        let direct = depth >= 2 && entry.stack[depth - 2] == state.frame;
        if state.recovered || !direct {
            return Ok(None);
        }
        state.recovered = true;
        Ok(Some(state.value.clone()))
    }

    pub fn is_panicking(&self, task: TaskId) -> Result<bool, RuntimeError> {
        Ok(self.task(task)?.panic.is_some())
    }

    /// Guarded region that raised the current panic, if it came from a fault.
    pub fn panic_region(&self, task: TaskId) -> Result<Option<u32>, RuntimeError> {
        Ok(self.task(task)?.panic.as_ref().and_then(|p| p.region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A frame that completes after a fixed number of runs.
    #[derive(Debug, Default)]
    struct Countdown {
        left: u32,
        next: i64,
        done: bool,
        deferred: Vec<FrameId>,
        recover_block: Option<i64>,
    }

    impl Frame for Countdown {
        type Value = String;

        fn is_complete(&self) -> bool {
            self.done
        }

        fn finish(&mut self) {
            self.done = true;
        }

        fn take_deferred(&mut self) -> Option<FrameId> {
            self.deferred.pop()
        }

        fn recover_target(&self) -> Option<i64> {
            self.recover_block
        }

        fn resume_at(&mut self, next: i64) {
            self.next = next;
        }
    }

    fn tick(
        sched: &mut Scheduler<Countdown>,
        task: TaskId,
        id: FrameId,
    ) -> Result<(), RuntimeError> {
        let mut frame = sched.take(id)?;
        frame.left = frame.left.saturating_sub(1);
        if frame.left == 0 {
            frame.done = true;
            sched.pop(task)?;
        }
        sched.restore(id, frame);
        Ok(())
    }

    fn countdown(left: u32) -> Countdown {
        Countdown {
            left,
            ..Countdown::default()
        }
    }

    #[test]
    fn callee_on_top_runs_before_caller() {
        let mut sched = Scheduler::seeded(1);
        let caller = sched.alloc(countdown(1));
        let callee = sched.alloc(countdown(2));
        sched.push(TaskId::MAIN, caller).unwrap();
        sched.push(TaskId::MAIN, callee).unwrap();

        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Ran(callee));
        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Ran(callee));
        assert!(sched.frame(callee).unwrap().is_complete());
        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Ran(caller));
        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Idle);
    }

    #[test]
    fn run_all_visits_every_busy_task() {
        let mut sched = Scheduler::seeded(1);
        let other = sched.new_task();
        let a = sched.alloc(countdown(1));
        let b = sched.alloc(countdown(1));
        sched.push(TaskId::MAIN, a).unwrap();
        sched.push(other, b).unwrap();
        let steps = sched.run_all(tick).unwrap();
        assert_eq!(steps, vec![Step::Ran(a), Step::Ran(b)]);
        assert!(sched.run_all(tick).unwrap().is_empty());
    }

    #[test]
    fn unrecovered_panic_runs_defers_then_fails() {
        let mut sched = Scheduler::seeded(1);
        let outer = sched.alloc(countdown(5));
        let deferred = sched.alloc(countdown(1));
        sched.frame_mut(outer).unwrap().deferred.push(deferred);
        sched.push(TaskId::MAIN, outer).unwrap();
        sched.panic(TaskId::MAIN, "boom".to_string()).unwrap();

        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Unwound(outer));
        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Ran(deferred));
        let err = sched.run_one(TaskId::MAIN, tick).unwrap_err();
        assert_eq!(err, RuntimeError::Unrecovered("\"boom\"".to_string()));
    }

    #[test]
    fn recovered_panic_runs_remaining_defers_then_resumes() {
        let mut sched = Scheduler::seeded(1);
        let mut frame = countdown(5);
        frame.recover_block = Some(3);
        let outer = sched.alloc(frame);
        let first = sched.alloc(countdown(1));
        let handler = sched.alloc(countdown(1));
        sched.frame_mut(outer).unwrap().deferred = vec![first, handler];
        sched.push(TaskId::MAIN, outer).unwrap();
        sched.handle(TaskId::MAIN, "fault".to_string(), 2).unwrap();
        assert_eq!(sched.panic_region(TaskId::MAIN).unwrap(), Some(2));

        // Only a deferred call of the unwinding frame may recover.
        assert_eq!(sched.recover(TaskId::MAIN).unwrap(), None);
        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Unwound(outer));
        assert_eq!(sched.recover(TaskId::MAIN).unwrap().as_deref(), Some("fault"));
        assert_eq!(sched.recover(TaskId::MAIN).unwrap(), None);
        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Ran(handler));

        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Unwound(outer));
        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Ran(first));
        assert!(sched.is_panicking(TaskId::MAIN).unwrap());

        assert_eq!(sched.run_one(TaskId::MAIN, tick).unwrap(), Step::Unwound(outer));
        assert!(!sched.is_panicking(TaskId::MAIN).unwrap());
        assert_eq!(sched.frame(outer).unwrap().next, 3);
    }

    #[test]
    fn recover_from_a_nested_call_returns_nothing() {
        let mut sched = Scheduler::seeded(1);
        let outer = sched.alloc(countdown(5));
        let deferred = sched.alloc(countdown(2));
        let helper = sched.alloc(countdown(1));
        sched.frame_mut(outer).unwrap().deferred.push(deferred);
        sched.push(TaskId::MAIN, outer).unwrap();
        sched.panic(TaskId::MAIN, "boom".to_string()).unwrap();
        sched.run_one(TaskId::MAIN, tick).unwrap();
        sched.push(TaskId::MAIN, helper).unwrap();

        assert_eq!(sched.recover(TaskId::MAIN).unwrap(), None);
        assert!(sched.is_panicking(TaskId::MAIN).unwrap());
    }

    #[test]
    fn released_slots_are_reused() {
        let mut sched = Scheduler::<Countdown>::seeded(1);
        let a = sched.alloc(countdown(1));
        sched.release(a);
        assert_eq!(sched.live_frames(), 0);
        let b = sched.alloc(countdown(1));
        assert_eq!(a, b);
        assert!(matches!(sched.take(b), Ok(_)));
        assert_eq!(sched.take(b).unwrap_err(), RuntimeError::FrameBusy(b.0));
    }
}
