//! The virtual machine.
//!
//! Each VM owns a value stack of local-slot frames, a call stack, and a
//! private copy of the global field table. Reads go through the heap's
//! `try_wait`, arithmetic lifts to expression futures when operands are
//! unknown, and a conditional branch on an unknown condition *clones*
//! the VM: the clone takes the branch under `condition AND predicate`,
//! the original falls through under `condition AND NOT predicate`. Both
//! then run their full continuations; whichever side's path condition
//! later resolves false has its queued work dropped unexecuted.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    bytecode::{LinkedProgram, Op, decode},
    heap::{BinaryOp, Heap, UnaryOp},
    intern::Interner,
    native::{NativeFn, NativeRegistry},
    value::{Truth, VRef},
};

/// One node in the speculative branch tree.
///
/// A clone and its original share one node; nested speculation chains
/// nodes through `parent`. Nodes are freed as the VMs holding them are
/// dropped, releasing the chain bottom-up.
#[derive(Debug)]
pub struct VmBranch {
    pub parent: Option<Rc<VmBranch>>,
    /// The path condition at the moment the branch was taken.
    pub condition: VRef,
}

/// A pending native call handed to the work queue.
#[derive(Debug)]
pub struct WorkPayload {
    pub native: NativeFn,
    /// Offset of the issuing instruction, for failure reporting.
    pub position: usize,
    pub condition: VRef,
    pub args: SmallVec<[VRef; 4]>,
    /// Placeholder futures already stored in the destination slots.
    pub rets: SmallVec<[VRef; 2]>,
    /// Files the operation reads; recorded as cache dependencies.
    pub accessed: VRef,
    /// Files the operation writes.
    pub modified: VRef,
}

/// Why `Vm::run` stopped.
#[derive(Debug)]
pub enum VmEvent {
    /// The target function returned.
    Done,
    /// The VM failed; see [`Vm::fail_message`].
    Halted,
    /// A native call was issued; drive the queue, then resume.
    Work(WorkPayload),
    /// A conditional branch split on an unknown condition. Run both.
    Clone(Box<Vm>),
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    /// Offset of the call site's return-count word.
    return_position: usize,
    bp: usize,
}

/// Execution state for one (possibly speculative) strand.
#[derive(Debug)]
pub struct Vm {
    ip: usize,
    bp: usize,
    stack: Vec<VRef>,
    call_stack: Vec<Frame>,
    /// Private copy of the global field table.
    fields: Vec<VRef>,
    /// Path condition under which this VM's effects are observable.
    condition: VRef,
    branch: Option<Rc<VmBranch>>,
    active: bool,
    fail_message: Option<String>,
    fail_position: usize,
}

impl Vm {
    /// Builds a VM poised at a function's first instruction, with the
    /// given argument values in its leading local slots.
    #[must_use]
    pub fn new(program: &LinkedProgram, heap: &Heap, entry: usize, args: &[VRef], fields: Vec<VRef>) -> Self {
        let (op, locals) = decode(program.code[entry]);
        debug_assert_eq!(op, Op::Function);
        let mut stack = vec![VRef::NULL; locals as usize];
        stack[..args.len()].copy_from_slice(args);
        Self {
            ip: entry + 1,
            bp: 0,
            stack,
            call_stack: Vec::new(),
            fields,
            condition: heap.singles().true_,
            branch: None,
            active: true,
            fail_message: None,
            fail_position: 0,
        }
    }

    #[must_use]
    pub fn condition(&self) -> VRef {
        self.condition
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Depth of the speculative branch chain this VM hangs off.
    #[must_use]
    pub fn branch_depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.branch.as_ref();
        while let Some(branch) = node {
            depth += 1;
            node = branch.parent.as_ref();
        }
        depth
    }

    /// The failure message, with source position resolved.
    #[must_use]
    pub fn fail_message(&self, program: &LinkedProgram) -> Option<String> {
        self.fail_message
            .as_ref()
            .map(|message| format!("{}:{}: {message}", program.source_name, program.line_of(self.fail_position)))
    }

    /// Field table of a finished VM, for carrying init results forward.
    #[must_use]
    pub fn into_fields(self) -> Vec<VRef> {
        self.fields
    }

    /// Marks the VM failed from outside (a native handler refused).
    pub fn halt(&mut self, position_hint: Option<usize>, message: String) {
        self.active = false;
        self.fail_message = Some(message);
        if let Some(position) = position_hint {
            self.fail_position = position;
        }
    }

    fn fail(&mut self, heap: &mut Heap, interns: &Interner, position: usize, message: String) -> VmEvent {
        // A failure on a speculative path that is already known dead is
        // not a build failure; the strand just stops.
        let condition = heap.try_wait(interns, self.condition);
        if heap.truth(interns, condition) == Truth::False {
            self.active = false;
            return VmEvent::Done;
        }
        self.active = false;
        self.fail_message = Some(message);
        self.fail_position = position;
        VmEvent::Halted
    }

    fn load(&mut self, program: &LinkedProgram, heap: &mut Heap, interns: &Interner, slot: i32) -> VRef {
        let value = if slot >= 0 {
            self.stack[self.bp + slot as usize]
        } else if slot >= program.smallest_constant() {
            program.constants[(-slot - 1) as usize]
        } else {
            self.fields[(program.smallest_constant() - slot - 1) as usize]
        };
        heap.try_wait(interns, value)
    }

    fn store(&mut self, program: &LinkedProgram, slot: i32, value: VRef) {
        if slot >= 0 {
            self.stack[self.bp + slot as usize] = value;
        } else {
            debug_assert!(slot < program.smallest_constant(), "store into a constant slot");
            self.fields[(program.smallest_constant() - slot - 1) as usize] = value;
        }
    }

    fn read_word(&mut self, program: &LinkedProgram) -> i32 {
        let value = program.code[self.ip];
        self.ip += 1;
        value
    }

    fn jump(&mut self, position: usize, offset: i32) {
        let target = i64::try_from(position).expect("ip fits i64") + 2 + i64::from(offset);
        self.ip = usize::try_from(target).expect("jump out of program");
    }

    /// Interprets instructions until the strand completes, fails,
    /// issues work, or splits.
    pub fn run(&mut self, program: &LinkedProgram, heap: &mut Heap, interns: &Interner) -> VmEvent {
        debug_assert!(self.active);
        loop {
            let position = self.ip;
            let (op, arg) = decode(program.code[position]);
            self.ip += 1;
            match op {
                Op::Null => self.store(program, arg, VRef::NULL),
                Op::True => self.store(program, arg, heap.singles().true_),
                Op::False => self.store(program, arg, heap.singles().false_),
                Op::EmptyList => self.store(program, arg, heap.singles().empty_list),
                Op::List => {
                    let count = (arg + 1) as usize;
                    let mut values = Vec::with_capacity(count);
                    for _ in 0..count {
                        let slot = self.read_word(program);
                        values.push(self.load(program, heap, interns, slot));
                    }
                    let dst = self.read_word(program);
                    let list = heap.create_array(&values);
                    self.store(program, dst, list);
                }
                Op::FileList => {
                    let pattern = heap.render(interns, program.constants[arg as usize]);
                    let dst = self.read_word(program);
                    let files = heap.create_fileset(&pattern);
                    self.store(program, dst, files);
                }
                Op::StoreConstant => {
                    let source = self.read_word(program);
                    let value = self.load(program, heap, interns, source);
                    self.store(program, arg, value);
                }
                Op::Copy => {
                    let source = self.read_word(program);
                    let value = self.load(program, heap, interns, source);
                    self.store(program, arg, value);
                }
                Op::Not | Op::Neg | Op::Inv => {
                    let source = self.read_word(program);
                    let value = self.load(program, heap, interns, source);
                    let unary = match op {
                        Op::Not => UnaryOp::Not,
                        Op::Neg => UnaryOp::Neg,
                        _ => UnaryOp::Inv,
                    };
                    match heap.apply_unary(interns, unary, value) {
                        Ok(result) => self.store(program, arg, result),
                        Err(e) => return self.fail(heap, interns, position, e.0),
                    }
                }
                Op::Equals
                | Op::NotEquals
                | Op::LessEquals
                | Op::GreaterEquals
                | Op::Less
                | Op::Greater
                | Op::And
                | Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Rem
                | Op::ConcatList
                | Op::ConcatString
                | Op::IndexedAccess
                | Op::Range => {
                    let left_slot = self.read_word(program);
                    let right_slot = self.read_word(program);
                    let left = self.load(program, heap, interns, left_slot);
                    let right = self.load(program, heap, interns, right_slot);
                    let binary = binary_op(op);
                    match heap.apply_binary(interns, binary, left, right) {
                        Ok(result) => self.store(program, arg, result),
                        Err(e) => return self.fail(heap, interns, position, e.0),
                    }
                }
                Op::IterGet => {
                    let index_slot = self.read_word(program);
                    let collection_slot = self.read_word(program);
                    let done_slot = self.read_word(program);
                    let index_value = self.load(program, heap, interns, index_slot);
                    let collection = self.load(program, heap, interns, collection_slot);
                    if heap.is_future(collection) {
                        return self.fail(
                            heap,
                            interns,
                            position,
                            "Cannot iterate a value that is not yet known".to_owned(),
                        );
                    }
                    if !heap.is_collection(collection) {
                        return self.fail(heap, interns, position, "Cannot iterate a non-list value".to_owned());
                    }
                    let index = Heap::unbox_integer(index_value);
                    match heap.collection_get(collection, index as usize) {
                        Some(value) => {
                            self.store(program, arg, value);
                            self.store(program, index_slot, VRef::from_int(index + 1));
                            let false_ = heap.singles().false_;
                            self.store(program, done_slot, false_);
                        }
                        None => {
                            self.store(program, arg, VRef::NULL);
                            let true_ = heap.singles().true_;
                            self.store(program, done_slot, true_);
                        }
                    }
                }
                Op::Jump => self.jump(position, arg),
                Op::BranchTrue | Op::BranchFalse => {
                    let condition_slot = self.read_word(program);
                    let value = self.load(program, heap, interns, condition_slot);
                    let take_on = op == Op::BranchTrue;
                    match heap.truth(interns, value) {
                        Truth::True => {
                            if take_on {
                                self.jump(position, arg);
                            }
                        }
                        Truth::False => {
                            if !take_on {
                                self.jump(position, arg);
                            }
                        }
                        Truth::Future => {
                            // A strand whose own path condition has
                            // resolved false must not keep splitting.
                            let own = heap.try_wait(interns, self.condition);
                            if heap.truth(interns, own) == Truth::False {
                                self.active = false;
                                return VmEvent::Done;
                            }
                            return VmEvent::Clone(Box::new(self.split(heap, interns, position, arg, value, take_on)));
                        }
                    }
                }
                Op::Return => {
                    let count = arg as usize;
                    let mut values: SmallVec<[VRef; 2]> = SmallVec::with_capacity(count);
                    for _ in 0..count {
                        let slot = self.read_word(program);
                        values.push(self.load(program, heap, interns, slot));
                    }
                    if let Some(event) = self.do_return(program, heap, interns, position, &values) {
                        return event;
                    }
                }
                Op::ReturnVoid => {
                    if let Some(event) = self.do_return(program, heap, interns, position, &[]) {
                        return event;
                    }
                }
                Op::Invoke => {
                    let parameter_count = arg as usize;
                    let entry = self.read_word(program) as usize;
                    let mut args: SmallVec<[VRef; 8]> = SmallVec::with_capacity(parameter_count);
                    for _ in 0..parameter_count {
                        let slot = self.read_word(program);
                        args.push(self.load(program, heap, interns, slot));
                    }
                    let return_position = self.ip;
                    let (header, locals) = decode(program.code[entry]);
                    debug_assert_eq!(header, Op::Function);
                    self.call_stack.push(Frame {
                        return_position,
                        bp: self.bp,
                    });
                    self.bp = self.stack.len();
                    self.stack.resize(self.bp + locals as usize, VRef::NULL);
                    self.stack[self.bp..self.bp + args.len()].copy_from_slice(&args);
                    self.ip = entry + 1;
                }
                Op::InvokeNative => {
                    let native = NativeFn::from_repr(arg as u8).expect("corrupt native id");
                    let info = NativeRegistry::info(native);
                    let mut args: SmallVec<[VRef; 4]> = SmallVec::with_capacity(info.params.len());
                    for _ in 0..info.params.len() {
                        let slot = self.read_word(program);
                        args.push(self.load(program, heap, interns, slot));
                    }
                    let mut rets: SmallVec<[VRef; 2]> = SmallVec::with_capacity(info.returns);
                    for _ in 0..info.returns {
                        let slot = self.read_word(program);
                        let placeholder = heap.create_future();
                        self.store(program, slot, placeholder);
                        rets.push(placeholder);
                    }
                    let empty = heap.singles().empty_list;
                    return VmEvent::Work(WorkPayload {
                        native,
                        position,
                        condition: self.condition,
                        args,
                        rets,
                        accessed: empty,
                        modified: empty,
                    });
                }
                Op::Function
                | Op::FunctionUnlinked
                | Op::File
                | Op::Line
                | Op::Error
                | Op::JumpIndexed
                | Op::JumpTarget
                | Op::BranchTrueIndexed
                | Op::BranchFalseIndexed
                | Op::InvokeUnlinked => unreachable!("pre-link opcode {op:?} reached the VM"),
            }
        }
    }

    /// Pops a frame and writes return values into the caller's
    /// destination slots. Returns an event when the strand is finished.
    fn do_return(
        &mut self,
        program: &LinkedProgram,
        heap: &mut Heap,
        interns: &Interner,
        position: usize,
        values: &[VRef],
    ) -> Option<VmEvent> {
        let Some(frame) = self.call_stack.pop() else {
            self.active = false;
            return Some(VmEvent::Done);
        };
        let mut cursor = frame.return_position;
        let expected = program.code[cursor] as usize;
        cursor += 1;
        if expected > values.len() {
            self.call_stack.push(frame);
            return Some(self.fail(
                heap,
                interns,
                position,
                format!("Function returned {} value(s), caller expects {expected}", values.len()),
            ));
        }
        let destinations: SmallVec<[i32; 2]> = (0..expected).map(|i| program.code[cursor + i]).collect();
        self.stack.truncate(self.bp);
        self.bp = frame.bp;
        self.ip = cursor + expected;
        for (destination, &value) in destinations.iter().zip(values) {
            self.store(program, *destination, value);
        }
        None
    }

    /// Splits this VM on an unknown branch condition.
    ///
    /// The returned clone takes the branch; `self` falls through. Each
    /// side's path condition is tightened with the (negated) predicate.
    fn split(
        &mut self,
        heap: &mut Heap,
        interns: &Interner,
        position: usize,
        offset: i32,
        predicate: VRef,
        take_on_true: bool,
    ) -> Vm {
        let node = Rc::new(VmBranch {
            parent: self.branch.take(),
            condition: self.condition,
        });
        let taken_pred = if take_on_true {
            predicate
        } else {
            heap.apply_unary(interns, UnaryOp::Not, predicate)
                .expect("negation of a future cannot fail")
        };
        let fall_pred = heap
            .apply_unary(interns, UnaryOp::Not, taken_pred)
            .expect("negation of a future cannot fail");
        let taken_condition = heap
            .apply_binary(interns, BinaryOp::And, self.condition, taken_pred)
            .expect("conjunction of conditions cannot fail");
        let fall_condition = heap
            .apply_binary(interns, BinaryOp::And, self.condition, fall_pred)
            .expect("conjunction of conditions cannot fail");

        let mut clone = Vm {
            ip: self.ip,
            bp: self.bp,
            stack: self.stack.clone(),
            call_stack: self.call_stack.clone(),
            fields: self.fields.clone(),
            condition: taken_condition,
            branch: Some(Rc::clone(&node)),
            active: true,
            fail_message: None,
            fail_position: 0,
        };
        clone.jump(position, offset);
        self.branch = Some(node);
        self.condition = fall_condition;
        clone
    }
}

fn binary_op(op: Op) -> BinaryOp {
    match op {
        Op::Equals => BinaryOp::Equals,
        Op::NotEquals => BinaryOp::NotEquals,
        Op::LessEquals => BinaryOp::LessEquals,
        Op::GreaterEquals => BinaryOp::GreaterEquals,
        Op::Less => BinaryOp::Less,
        Op::Greater => BinaryOp::Greater,
        Op::And => BinaryOp::And,
        Op::Add => BinaryOp::Add,
        Op::Sub => BinaryOp::Sub,
        Op::Mul => BinaryOp::Mul,
        Op::Div => BinaryOp::Div,
        Op::Rem => BinaryOp::Rem,
        Op::ConcatList => BinaryOp::ConcatList,
        Op::ConcatString => BinaryOp::ConcatString,
        Op::IndexedAccess => BinaryOp::IndexedAccess,
        Op::Range => BinaryOp::Range,
        _ => unreachable!("not a binary opcode: {op:?}"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{bytecode::word, value::VRef};

    /// Hand-assembles `if cond { field0 = true } else { field1 = true }`
    /// over one local slot holding the condition.
    fn branch_program() -> LinkedProgram {
        let mut program = LinkedProgram::new("test.don".to_owned());
        program.fields = vec![VRef::NULL, VRef::NULL];
        program.functions = vec![0];
        program.code = vec![
            word(Op::Function, 1),
            word(Op::BranchFalse, 2), // else arm at offset 5
            0,                        // condition slot
            word(Op::True, -1),       // field 0
            word(Op::Jump, 0),        // past the else arm
            word(Op::True, -2),       // field 1
            word(Op::ReturnVoid, 0),
        ];
        program
    }

    #[test]
    fn concrete_branch_takes_one_arm() {
        let program = branch_program();
        let mut heap = Heap::new();
        let interns = Interner::new();
        let true_ = heap.singles().true_;
        let false_ = heap.singles().false_;

        let mut vm = Vm::new(&program, &heap, 0, &[true_], vec![false_, false_]);
        assert!(matches!(vm.run(&program, &mut heap, &interns), VmEvent::Done));
        assert_eq!(vm.into_fields(), vec![true_, false_]);

        let mut vm = Vm::new(&program, &heap, 0, &[false_], vec![false_, false_]);
        assert!(matches!(vm.run(&program, &mut heap, &interns), VmEvent::Done));
        assert_eq!(vm.into_fields(), vec![false_, true_]);
    }

    #[test]
    fn unknown_branch_condition_splits_the_vm() {
        let program = branch_program();
        let mut heap = Heap::new();
        let interns = Interner::new();
        let true_ = heap.singles().true_;
        let false_ = heap.singles().false_;
        let pending = heap.create_future();

        let mut original = Vm::new(&program, &heap, 0, &[pending], vec![false_, false_]);
        let VmEvent::Clone(mut clone) = original.run(&program, &mut heap, &interns) else {
            panic!("expected a clone on an unknown condition");
        };
        assert_eq!(original.branch_depth(), 1);
        assert_eq!(clone.branch_depth(), 1);
        // The shared branch node records the pre-split path condition.
        let node = original.branch.as_ref().expect("split recorded a branch node");
        assert_eq!(node.condition, heap.singles().true_);
        assert_eq!(Rc::strong_count(node), 2);

        // Both strands run their full continuations independently.
        assert!(matches!(original.run(&program, &mut heap, &interns), VmEvent::Done));
        assert!(matches!(clone.run(&program, &mut heap, &interns), VmEvent::Done));

        // The fall-through side (the original) took the true arm of a
        // BranchFalse; the clone jumped to the else arm.
        let original_condition = original.condition();
        let clone_condition = clone.condition();
        assert_eq!(original.into_fields(), vec![true_, false_]);
        assert_eq!(clone.into_fields(), vec![false_, true_]);

        // Fulfilling the predicate resolves exactly one side's path
        // condition to true.
        heap.set_future(pending, true_);
        assert_eq!(heap.try_wait(&interns, original_condition), true_);
        assert_eq!(heap.try_wait(&interns, clone_condition), false_);
    }

    #[test]
    fn dead_strand_stops_instead_of_splitting_again() {
        let program = branch_program();
        let mut heap = Heap::new();
        let interns = Interner::new();
        let false_ = heap.singles().false_;
        let pending = heap.create_future();

        let mut original = Vm::new(&program, &heap, 0, &[pending], vec![false_, false_]);
        let VmEvent::Clone(mut clone) = original.run(&program, &mut heap, &interns) else {
            panic!("expected a clone");
        };
        // Kill the clone's side: the predicate turns out true, so the
        // else strand is dead before it branches again.
        heap.set_future(pending, heap.singles().true_);
        let resolved = heap.try_wait(&interns, clone.condition());
        assert_eq!(resolved, false_);
        assert!(matches!(clone.run(&program, &mut heap, &interns), VmEvent::Done));
    }

    #[test]
    fn failure_on_a_dead_strand_is_silent() {
        // Division by zero under a false path condition deactivates the
        // strand without reporting a build failure.
        let mut program = LinkedProgram::new("test.don".to_owned());
        program.functions = vec![0];
        program.constants = vec![VRef::from_int(1), VRef::from_int(0)];
        program.code = vec![
            word(Op::Function, 1),
            word(Op::Div, 0),
            -1, // constant 1
            -2, // constant 0
            word(Op::ReturnVoid, 0),
        ];
        let mut heap = Heap::new();
        let interns = Interner::new();

        let mut vm = Vm::new(&program, &heap, 0, &[], vec![]);
        assert!(matches!(vm.run(&program, &mut heap, &interns), VmEvent::Halted));
        assert!(vm.fail_message(&program).is_some());

        let mut dead = Vm::new(&program, &heap, 0, &[], vec![]);
        dead.condition = heap.singles().false_;
        assert!(matches!(dead.run(&program, &mut heap, &interns), VmEvent::Done));
        assert!(dead.fail_message(&program).is_none());
    }
}
