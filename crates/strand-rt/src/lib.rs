//! Reference scheduler collaborator for code produced by the strand backend.
//!
//! Generated frames never hold pointers to each other or to the scheduler.
//! The scheduler owns every frame in an arena and tasks are stacks of
//! [`FrameId`]s. Whoever executes frame code borrows the scheduler only for
//! the duration of one `run` call.

pub mod channel;
pub mod scheduler;
pub mod select;

pub use channel::Channel;
pub use scheduler::{Frame, Scheduler, Step};
pub use select::{choose, rotation_scan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Task used by host entry points.
    pub const MAIN: TaskId = TaskId(0);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("index out of range [{index}] with length {len}")]
    IndexOutOfRange { index: i64, len: i64 },
    #[error("invalid memory address or nil pointer dereference")]
    NilDereference,
    #[error("interface conversion: {0}")]
    TypeAssertion(String),
    #[error("integer divide by zero")]
    DivideByZero,
    #[error("negative shift amount")]
    NegativeShift,
    #[error("send on closed channel")]
    SendOnClosed,
    #[error("close of closed channel")]
    CloseOfClosed,
    #[error("unknown frame #{0}")]
    UnknownFrame(u32),
    #[error("frame #{0} is already running")]
    FrameBusy(u32),
    #[error("unknown task #{0}")]
    UnknownTask(u32),
    #[error("pop from empty stack of task #{0}")]
    EmptyStack(u32),
    #[error("panic: {0}")]
    Unrecovered(String),
    #[error("all tasks are asleep - deadlock!")]
    Deadlock,
}

/// Values that can be nil at run time.
pub trait Nullable {
    fn is_nil(&self) -> bool;
}

impl<T> Nullable for Option<T> {
    fn is_nil(&self) -> bool {
        self.is_none()
    }
}

/// Pass `value` through, failing with a nil dereference when it is nil.
pub fn nil_check<V: Nullable>(value: V) -> Result<V, RuntimeError> {
    if value.is_nil() {
        Err(RuntimeError::NilDereference)
    } else {
        Ok(value)
    }
}

/// Fail when `index` is negative or not below `len`.
pub fn range_check(index: i64, len: i64) -> Result<(), RuntimeError> {
    if index < 0 || index >= len {
        Err(RuntimeError::IndexOutOfRange { index, len })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_rejects_negative_and_past_end() {
        assert!(range_check(0, 1).is_ok());
        assert_eq!(
            range_check(3, 3),
            Err(RuntimeError::IndexOutOfRange { index: 3, len: 3 })
        );
        assert!(range_check(-1, 10).is_err());
    }

    #[test]
    fn nil_check_passes_live_values() {
        assert_eq!(nil_check(Some(4)), Ok(Some(4)));
        assert_eq!(nil_check(None::<u8>), Err(RuntimeError::NilDereference));
    }
}
