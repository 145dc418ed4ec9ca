//! The deferred work queue.
//!
//! Native operations never run inside the VM's instruction loop: the VM
//! enqueues a work item carrying its path condition and placeholder
//! return futures, and the queue executes items strictly front-first.
//! Because items are enqueued in program order, every argument of the
//! front item has been produced by earlier items and is concrete by the
//! time it runs. An item whose condition resolved false is removed
//! without effect; that is how the losing side of a speculative branch
//! is cancelled.

use std::collections::VecDeque;

use crate::{
    native::{self, NativeCtx, NativeFailure},
    value::Truth,
    vm::WorkPayload,
};

/// A queued native call bound to its owning VM.
#[derive(Debug)]
pub struct WorkItem {
    pub vm: usize,
    pub payload: WorkPayload,
}

/// What happened to the front item.
#[derive(Debug)]
pub struct WorkOutcome {
    pub vm: usize,
    /// Offset of the issuing instruction.
    pub position: usize,
    /// Set when the native refused; the owner VM must halt.
    pub failure: Option<NativeFailure>,
    /// The item's condition resolved false; it was dropped unexecuted.
    pub skipped: bool,
}

/// FIFO of pending native operations.
#[derive(Debug, Default)]
pub struct WorkQueue {
    queue: VecDeque<WorkItem>,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: WorkItem) {
        self.queue.push_back(item);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Removes all pending work owned by a halted VM.
    pub fn discard(&mut self, vm: usize) {
        self.queue.retain(|item| item.vm != vm);
    }

    /// Executes exactly the front item, if any.
    pub fn execute_front(&mut self, ctx: &mut NativeCtx<'_>) -> Option<WorkOutcome> {
        let front = self.queue.front()?;
        let condition = ctx.heap.try_wait(ctx.interns, front.payload.condition);
        debug_assert!(
            !ctx.heap.is_future(condition),
            "front work item's condition is still unknown"
        );
        if ctx.heap.truth(ctx.interns, condition) != Truth::True {
            let item = self.queue.pop_front().expect("front checked above");
            return Some(WorkOutcome {
                vm: item.vm,
                position: item.payload.position,
                failure: None,
                skipped: true,
            });
        }

        let mut item = self.queue.pop_front().expect("front checked above");
        for arg in &mut item.payload.args {
            *arg = ctx.heap.try_wait(ctx.interns, *arg);
            debug_assert!(!ctx.heap.is_future(*arg), "ready work with an unknown argument");
        }

        match native::invoke(item.payload.native, ctx, &item.payload.args) {
            Ok(values) => {
                debug_assert_eq!(values.len(), item.payload.rets.len());
                for (&placeholder, &value) in item.payload.rets.iter().zip(values.iter()) {
                    if placeholder != value {
                        ctx.heap.set_future(placeholder, value);
                    }
                }
                Some(WorkOutcome {
                    vm: item.vm,
                    position: item.payload.position,
                    failure: None,
                    skipped: false,
                })
            }
            Err(failure) => Some(WorkOutcome {
                vm: item.vm,
                position: item.payload.position,
                failure: Some(failure),
                skipped: false,
            }),
        }
    }

    /// Drains the queue from the front until empty or a failure occurs.
    pub fn drain(&mut self, ctx: &mut NativeCtx<'_>) -> Vec<WorkOutcome> {
        let mut outcomes = Vec::new();
        while !self.queue.is_empty() {
            let Some(outcome) = self.execute_front(ctx) else {
                break;
            };
            let failed = outcome.failure.is_some();
            let vm = outcome.vm;
            outcomes.push(outcome);
            if failed {
                self.discard(vm);
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    use super::*;
    use crate::{
        env::Environment,
        heap::Heap,
        intern::Interner,
        log::CollectOutput,
        native::{NativeFn, NativeRegistry},
        value::VRef,
        vm::WorkPayload,
    };

    struct Fixture {
        heap: Heap,
        interns: Interner,
        env: Environment,
        out: CollectOutput,
    }

    impl Fixture {
        fn new() -> Self {
            let mut interns = Interner::new();
            let _ = NativeRegistry::new(&mut interns);
            Self {
                heap: Heap::new(),
                interns,
                env: Environment::from_vars([]),
                out: CollectOutput::new(),
            }
        }

        fn ctx(&mut self) -> NativeCtx<'_> {
            NativeCtx {
                heap: &mut self.heap,
                interns: &self.interns,
                env: &mut self.env,
                cache: None,
                out: &mut self.out,
            }
        }
    }

    fn echo_item(fx: &mut Fixture, vm: usize, condition: VRef, text: &str) -> WorkItem {
        let message = fx.heap.create_string(text.as_bytes());
        WorkItem {
            vm,
            payload: WorkPayload {
                native: NativeFn::Echo,
                position: 0,
                condition,
                args: smallvec![message],
                rets: smallvec![],
                accessed: fx.heap.singles().empty_list,
                modified: fx.heap.singles().empty_list,
            },
        }
    }

    #[test]
    fn executes_in_fifo_order() {
        let mut fx = Fixture::new();
        let mut queue = WorkQueue::new();
        let true_ = fx.heap.singles().true_;
        let first = echo_item(&mut fx, 0, true_, "first");
        let second = echo_item(&mut fx, 0, true_, "second");
        queue.add(first);
        queue.add(second);
        queue.drain(&mut fx.ctx());
        assert_eq!(fx.out.stdout(), "first\nsecond\n");
        assert!(queue.is_empty());
    }

    #[test]
    fn false_condition_is_dropped_without_effect() {
        let mut fx = Fixture::new();
        let mut queue = WorkQueue::new();
        let false_ = fx.heap.singles().false_;
        let item = echo_item(&mut fx, 0, false_, "never");
        queue.add(item);
        let outcomes = queue.drain(&mut fx.ctx());
        assert!(outcomes[0].skipped);
        assert_eq!(fx.out.stdout(), "");
    }

    #[test]
    fn condition_resolved_by_earlier_item() {
        // The condition is an expression future over a value an earlier
        // native call produces; FIFO order resolves it before use.
        let mut fx = Fixture::new();
        let mut queue = WorkQueue::new();
        let status = fx.heap.create_future();
        let condition = fx
            .heap
            .apply_binary(&fx.interns, crate::heap::BinaryOp::Equals, status, VRef::from_int(1))
            .unwrap();
        let list = fx.heap.create_array(&[VRef::from_int(7)]);
        let size_item = WorkItem {
            vm: 0,
            payload: WorkPayload {
                native: NativeFn::Size,
                position: 0,
                condition: fx.heap.singles().true_,
                args: smallvec![list],
                rets: smallvec![status],
                accessed: fx.heap.singles().empty_list,
                modified: fx.heap.singles().empty_list,
            },
        };
        let guarded = echo_item(&mut fx, 0, condition, "guarded");
        queue.add(size_item);
        queue.add(guarded);
        queue.drain(&mut fx.ctx());
        // size([7]) == 1, so the guarded echo ran.
        assert_eq!(fx.out.stdout(), "guarded\n");
    }

    #[test]
    fn discard_removes_only_the_halted_vm() {
        let mut fx = Fixture::new();
        let mut queue = WorkQueue::new();
        let true_ = fx.heap.singles().true_;
        let mine = echo_item(&mut fx, 1, true_, "mine");
        let other = echo_item(&mut fx, 2, true_, "other");
        queue.add(mine);
        queue.add(other);
        queue.discard(1);
        queue.drain(&mut fx.ctx());
        assert_eq!(fx.out.stdout(), "other\n");
    }
}
