//! Iterators
//!
//! State carrier for generator instances: holds the suspended
//! reentrant stack, and tracks where the generator is in its
//! lifecycle. The yield register index lives on the stack object.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::value::{Value, ValueCell};

/// Generator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    /// Instantiated, body not entered yet.
    Ready,
    /// Suspended at a yield.
    Active,
    /// Currently executing on some thread.
    Running,
    /// Finished; resuming raises the generator-end exception.
    Done,
}

impl GenState {
    fn from_u32(raw: u32) -> GenState {
        match raw {
            0 => GenState::Ready,
            1 => GenState::Active,
            2 => GenState::Running,
            _ => GenState::Done,
        }
    }
}

#[derive(Debug)]
pub struct IterObj {
    /// Reentrant stack holding the suspended frame.
    pub stack: ValueCell,
    state: AtomicU32,
}

impl IterObj {
    pub fn new(stack: Value) -> IterObj {
        IterObj {
            stack: ValueCell::new(stack),
            state: AtomicU32::new(GenState::Ready as u32),
        }
    }

    pub fn state(&self) -> GenState {
        GenState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: GenState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Claim the iterator for execution. Fails if it is already
    /// running on another thread or done.
    pub fn try_start(&self) -> Result<GenState, GenState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = GenState::from_u32(current);
            if state != GenState::Ready && state != GenState::Active {
                return Err(state);
            }
            match self.state.compare_exchange_weak(
                current,
                GenState::Running as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(state),
                Err(v) => current = v,
            }
        }
    }

    pub fn trace(&self, visit: &mut dyn FnMut(Value)) {
        visit(self.stack.get());
    }

    pub fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        self.stack.set(remap(self.stack.get()));
    }
}
