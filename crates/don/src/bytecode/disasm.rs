//! Linked-program disassembler, behind the `-d` flag in debug builds.

use std::fmt::Write as _;

use super::{LinkedProgram, Op, decode};
use crate::{
    heap::Heap,
    intern::Interner,
    native::{NativeFn, NativeRegistry},
};

/// Renders one function's instructions, `offset: mnemonic operands` per
/// line. The function ends where the next one begins.
#[must_use]
pub fn disassemble_function(program: &LinkedProgram, heap: &Heap, interns: &Interner, id: usize) -> String {
    let start = program.functions[id];
    let end = program
        .functions
        .iter()
        .copied()
        .filter(|&offset| offset > start)
        .min()
        .unwrap_or(program.code.len());

    let mut listing = String::new();
    let mut offset = start;
    while offset < end {
        offset = disassemble_instruction(program, heap, interns, offset, &mut listing);
    }
    listing
}

fn slot_name(program: &LinkedProgram, heap: &Heap, interns: &Interner, slot: i32) -> String {
    if slot >= 0 {
        return format!("v{slot}");
    }
    if slot >= program.smallest_constant() {
        let value = program.constants[(-slot - 1) as usize];
        return format!("const {}", heap.render(interns, value));
    }
    format!("field {}", program.smallest_constant() - slot - 1)
}

fn disassemble_instruction(
    program: &LinkedProgram,
    heap: &Heap,
    interns: &Interner,
    offset: usize,
    listing: &mut String,
) -> usize {
    let (op, arg) = decode(program.code[offset]);
    let mnemonic: &'static str = op.into();
    let _ = write!(listing, " {offset}: {mnemonic}");
    let mut cursor = offset + 1;
    let slots = |listing: &mut String, count: usize, cursor: &mut usize| {
        for _ in 0..count {
            let slot = program.code[*cursor];
            *cursor += 1;
            let _ = write!(listing, " {}", slot_name(program, heap, interns, slot));
        }
    };
    match op {
        Op::Function => {
            let _ = write!(listing, " locals={arg}");
        }
        Op::Null | Op::True | Op::False | Op::EmptyList => {
            let _ = write!(listing, " -> {}", slot_name(program, heap, interns, arg));
        }
        Op::List => {
            slots(listing, (arg + 1) as usize, &mut cursor);
            let dst = program.code[cursor];
            cursor += 1;
            let _ = write!(listing, " -> {}", slot_name(program, heap, interns, dst));
        }
        Op::FileList => {
            let pattern = heap.render(interns, program.constants[arg as usize]);
            let _ = write!(listing, " \"{pattern}\"");
            slots(listing, 1, &mut cursor);
        }
        Op::StoreConstant | Op::Copy | Op::Not | Op::Neg | Op::Inv => {
            slots(listing, 1, &mut cursor);
            let _ = write!(listing, " -> {}", slot_name(program, heap, interns, arg));
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
            slots(listing, 2, &mut cursor);
            let _ = write!(listing, " -> {}", slot_name(program, heap, interns, arg));
        }
        Op::IterGet => {
            slots(listing, 3, &mut cursor);
            let _ = write!(listing, " -> {}", slot_name(program, heap, interns, arg));
        }
        Op::Jump => {
            let _ = write!(listing, " {}", offset as i64 + 2 + i64::from(arg));
        }
        Op::BranchTrue | Op::BranchFalse => {
            slots(listing, 1, &mut cursor);
            let _ = write!(listing, " {}", offset as i64 + 2 + i64::from(arg));
        }
        Op::Return => slots(listing, arg as usize, &mut cursor),
        Op::ReturnVoid => {}
        Op::Invoke => {
            let entry = program.code[cursor];
            cursor += 1;
            let _ = write!(listing, " @{entry}");
            slots(listing, arg as usize, &mut cursor);
            let return_count = program.code[cursor] as usize;
            cursor += 1;
            let _ = write!(listing, " ->");
            slots(listing, return_count, &mut cursor);
        }
        Op::InvokeNative => {
            let native = NativeFn::from_repr(arg as u8).expect("corrupt native id");
            let info = NativeRegistry::info(native);
            let _ = write!(listing, " {}", info.name);
            slots(listing, info.params.len(), &mut cursor);
            let _ = write!(listing, " ->");
            slots(listing, info.returns, &mut cursor);
        }
        Op::FunctionUnlinked
        | Op::File
        | Op::Line
        | Op::Error
        | Op::JumpIndexed
        | Op::JumpTarget
        | Op::BranchTrueIndexed
        | Op::BranchFalseIndexed
        | Op::InvokeUnlinked => {
            let _ = write!(listing, " <pre-link>");
        }
    }
    listing.push('\n');
    cursor
}
