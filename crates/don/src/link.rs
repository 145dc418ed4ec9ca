//! The linker: one streaming pass over the pre-link instruction words.
//!
//! It resolves raw variable ids to dense local slots (or negative
//! constant/field references), rewrites indexed jumps to relative
//! offsets, binds call-site arguments to parameter order with vararg
//! packing and default filling, and defers function-id to entry-offset
//! resolution to a second fixup pass once every function has an offset.
//!
//! Slot encoding: local slots are non-negative; a slot in
//! `[smallest_constant, 0)` names the constant `-(slot) - 1`; anything
//! below `smallest_constant` names the field
//! `smallest_constant - slot - 1`.

use ahash::AHashMap;

use crate::{
    bytecode::{Diagnostic, LinkedProgram, Op, ParsedProgram, decode, word},
    intern::{Interner, StringId},
    namespace::Namespace,
    native::{NativeFn, NativeRegistry},
    value::VRef,
};

/// Unbound-argument sentinel shared with the parser.
const UNBOUND: i32 = i32::MAX;

/// Jump offsets live in the 24-bit instruction argument; a program
/// approaching that size cannot be linked.
const MAX_PROGRAM_WORDS: usize = 1 << 23;

struct LinkState<'a> {
    out: Vec<i32>,
    function_start: usize,
    smallest_constant: i32,
    variable_count: i32,
    variables: AHashMap<i32, i32>,
    jumps: Vec<usize>,
    jump_targets: Vec<i32>,
    line: u32,
    interns: &'a Interner,
    ns: &'a Namespace,
    diagnostics: Vec<Diagnostic>,
    has_errors: bool,
    source_name: String,
}

impl LinkState<'_> {
    fn error(&mut self, message: impl Into<String>) {
        self.has_errors = true;
        self.diagnostics.push(Diagnostic {
            file: self.source_name.clone(),
            line: self.line,
            message: message.into(),
        });
    }

    fn name(&self, raw: i32) -> &str {
        self.interns.get(StringId::from_index(raw as u32))
    }

    /// Resolves one raw variable id to its linked slot.
    fn link_variable(&mut self, variable: i32) -> i32 {
        if variable < 0 {
            if variable < self.smallest_constant {
                // Anonymous temporary.
                if let Some(&slot) = self.variables.get(&variable) {
                    return slot;
                }
                let slot = self.variable_count;
                self.variable_count += 1;
                self.variables.insert(variable, slot);
                return slot;
            }
            // Constant reference, already in linked form.
            return variable;
        }
        if let Some(&slot) = self.variables.get(&variable) {
            return slot;
        }
        if let Some(field) = self.ns.get_field(StringId::from_index(variable as u32)) {
            return self.smallest_constant - i32::try_from(field.index()).expect("field table overflow") - 1;
        }
        let slot = self.variable_count;
        self.variable_count += 1;
        self.variables.insert(variable, slot);
        slot
    }

    /// Rewrites pending jumps to relative offsets and patches the
    /// function header with its local count.
    fn finish_function(&mut self) {
        if self.out.is_empty() {
            return;
        }
        for &position in &self.jumps {
            let (op, label) = decode(self.out[position]);
            let target = self.jump_targets[label as usize];
            let offset = target - i32::try_from(position).expect("program size checked") - 2;
            self.out[position] = word(op, offset);
        }
        self.out[self.function_start] = word(Op::Function, self.variable_count);
    }
}

/// Links a parsed program. All accumulated parse and link diagnostics
/// come back in the error case; a successful link implies a clean parse.
pub fn link(
    parsed: ParsedProgram,
    interns: &Interner,
    ns: &Namespace,
    source_name: &str,
) -> Result<LinkedProgram, Vec<Diagnostic>> {
    let mut linked = LinkedProgram::new(source_name.to_owned());
    let mut state = LinkState {
        out: Vec::with_capacity(parsed.code.len()),
        function_start: 0,
        smallest_constant: -i32::try_from(parsed.constants.len()).expect("constant table overflow"),
        variable_count: 0,
        variables: AHashMap::new(),
        jumps: Vec::new(),
        jump_targets: vec![0; parsed.max_jump_targets],
        line: 1,
        interns,
        ns,
        diagnostics: parsed.diagnostics.clone(),
        has_errors: parsed.has_errors,
        source_name: source_name.to_owned(),
    };
    let code = &parsed.code;
    let mut functions_linked: Vec<usize> = Vec::with_capacity(parsed.functions.len());
    let mut unlinked_invocations: Vec<usize> = Vec::with_capacity(parsed.invocation_count);

    let mut read = 0usize;
    while read < code.len() {
        let (op, arg) = decode(code[read]);
        read += 1;
        match op {
            Op::File => {
                state.line = 1;
                linked.mark_line(state.out.len(), 1);
            }
            Op::Line => {
                state.line = arg as u32;
                linked.mark_line(state.out.len(), state.line);
            }
            Op::Error => {
                let message = state.name(arg).to_owned();
                state.error(message);
            }
            Op::FunctionUnlinked => {
                state.finish_function();
                functions_linked.push(state.out.len());
                state.variables.clear();
                state.jumps.clear();
                state.function_start = state.out.len();
                state.out.push(word(Op::Function, 0));
                state.variable_count = code[read];
                read += 2; // parameter count, vararg index
                for param in 0..state.variable_count {
                    let name = code[read];
                    read += 2; // name, default value
                    if state.ns.get_field(StringId::from_index(name as u32)).is_some() {
                        let text = state.name(name).to_owned();
                        state.error(format!("'{text}' is a global variable"));
                    } else if state.variables.insert(name, param).is_some() {
                        let text = state.name(name).to_owned();
                        state.error(format!("Multiple uses of parameter name '{text}'"));
                    }
                }
            }
            Op::Null | Op::True | Op::False | Op::EmptyList => {
                let dst = state.link_variable(arg);
                state.out.push(word(op, dst));
            }
            Op::List => {
                state.out.push(word(op, arg));
                // arg + 1 sources, then the destination.
                for _ in 0..arg + 2 {
                    let slot = state.link_variable(code[read]);
                    read += 1;
                    state.out.push(slot);
                }
            }
            Op::FileList => {
                state.out.push(word(op, arg));
                let slot = state.link_variable(code[read]);
                read += 1;
                state.out.push(slot);
            }
            Op::StoreConstant => {
                let dst = state.link_variable(arg);
                state.out.push(word(op, dst));
                state.out.push(code[read]);
                read += 1;
            }
            Op::Copy | Op::Not | Op::Neg | Op::Inv => {
                let dst = state.link_variable(arg);
                state.out.push(word(op, dst));
                let src = state.link_variable(code[read]);
                read += 1;
                state.out.push(src);
            }
            Op::IterGet => {
                let dst = state.link_variable(arg);
                state.out.push(word(op, dst));
                for _ in 0..3 {
                    let slot = state.link_variable(code[read]);
                    read += 1;
                    state.out.push(slot);
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
                let dst = state.link_variable(arg);
                state.out.push(word(op, dst));
                for _ in 0..2 {
                    let slot = state.link_variable(code[read]);
                    read += 1;
                    state.out.push(slot);
                }
            }
            Op::JumpTarget => {
                state.jump_targets[arg as usize] =
                    i32::try_from(state.out.len()).expect("program size checked");
            }
            Op::JumpIndexed => {
                state.jumps.push(state.out.len());
                state.out.push(word(Op::Jump, arg));
            }
            Op::BranchTrueIndexed | Op::BranchFalseIndexed => {
                state.jumps.push(state.out.len());
                let linked_op = if op == Op::BranchTrueIndexed {
                    Op::BranchTrue
                } else {
                    Op::BranchFalse
                };
                state.out.push(word(linked_op, arg));
                let condition = state.link_variable(code[read]);
                read += 1;
                state.out.push(condition);
            }
            Op::Return => {
                state.out.push(word(Op::Return, arg));
                for _ in 0..arg {
                    let slot = state.link_variable(code[read]);
                    read += 1;
                    state.out.push(slot);
                }
            }
            Op::ReturnVoid => state.out.push(word(Op::ReturnVoid, 0)),
            Op::InvokeUnlinked => {
                read = link_invocation(
                    &mut state,
                    &parsed,
                    code,
                    read,
                    arg,
                    &mut unlinked_invocations,
                );
            }
            Op::InvokeNative => {
                let native = NativeFn::from_repr(arg as u8).expect("corrupt native id");
                let info = NativeRegistry::info(native);
                state.out.push(word(op, arg));
                for _ in 0..info.params.len() + info.returns {
                    let slot = state.link_variable(code[read]);
                    read += 1;
                    state.out.push(slot);
                }
            }
            Op::Function | Op::Jump | Op::BranchTrue | Op::BranchFalse | Op::Invoke => {
                unreachable!("linked opcode {op:?} in pre-link stream")
            }
        }
    }

    state.finish_function();

    if state.has_errors {
        return Err(state.diagnostics);
    }
    if state.out.len() >= MAX_PROGRAM_WORDS {
        state.error("Build script too big");
        return Err(state.diagnostics);
    }

    // Second pass: function ids become entry offsets.
    for position in unlinked_invocations {
        let id = state.out[position] as usize;
        state.out[position] = i32::try_from(functions_linked[id]).expect("program size checked");
    }

    linked.code = state.out;
    linked.constants = parsed.constants;
    linked.fields = vec![VRef::NULL; parsed.field_count];
    linked.functions = functions_linked;
    Ok(linked)
}

/// Links one `InvokeUnlinked` site. Returns the updated read cursor.
#[expect(clippy::too_many_lines, reason = "mirrors the single-pass call binding")]
fn link_invocation(
    state: &mut LinkState<'_>,
    parsed: &ParsedProgram,
    code: &[i32],
    mut read: usize,
    name_raw: i32,
    unlinked_invocations: &mut Vec<usize>,
) -> usize {
    let argument_count = code[read] as usize;
    read += 1;
    let pairs_start = read;
    read += argument_count * 2;
    let return_count = code[read] as usize;
    read += 1;
    let returns_start = read;
    read += return_count;

    let name = StringId::from_index(name_raw as u32);
    let Some(function) = state.ns.get_function(name) else {
        let text = state.name(name_raw).to_owned();
        state.error(format!("Unknown function '{text}'"));
        return read;
    };

    let function_offset = parsed.functions[function.index()];
    let parameter_count = code[function_offset + 1] as usize;
    let vararg_word = code[function_offset + 2];
    let params_start = function_offset + 3;
    let pair = |i: usize| (code[pairs_start + i * 2], code[pairs_start + i * 2 + 1]);

    // Pack surplus positional arguments into an anonymous list slot.
    let mut vararg_index = if vararg_word == UNBOUND {
        None
    } else {
        Some(vararg_word as usize)
    };
    let mut vararg_slot = 0;
    if let Some(v) = vararg_index {
        if argument_count <= v || pair(v).0 != 0 {
            vararg_index = None;
        } else {
            let mut length = 1;
            while v + length < argument_count && pair(v + length).0 == 0 {
                length += 1;
            }
            state.out.push(word(Op::List, i32::try_from(length).expect("argument count fits") - 1));
            for k in 0..length {
                let slot = state.link_variable(pair(v + k).1);
                state.out.push(slot);
            }
            vararg_slot = state.variable_count;
            state.variable_count += 1;
            state.out.push(vararg_slot);
        }
    }

    state.out.push(word(
        Op::Invoke,
        i32::try_from(parameter_count).expect("parameter count fits"),
    ));
    unlinked_invocations.push(state.out.len());
    state.out.push(i32::try_from(function.index()).expect("function table overflow"));

    let arg_write_start = state.out.len();
    let stop = argument_count
        .min(parameter_count)
        .min(vararg_index.unwrap_or(usize::MAX));
    let mut index = 0;
    while index < stop && pair(index).0 == 0 {
        let slot = state.link_variable(pair(index).1);
        state.out.push(slot);
        index += 1;
    }
    let too_many = argument_count > index && vararg_index.is_none() && pair(index).0 == 0 && index >= parameter_count;
    if too_many {
        state.error("Too many arguments");
    }
    for _ in index..parameter_count {
        state.out.push(UNBOUND);
    }
    if let Some(v) = vararg_index {
        state.out[arg_write_start + v] = vararg_slot;
    }

    // Named arguments fill by parameter name; stray positionals after
    // the consumed run are an error.
    let consumed_positional = index;
    let packed = vararg_index.map(|v| {
        let mut length = 1;
        while v + length < argument_count && pair(v + length).0 == 0 {
            length += 1;
        }
        (v, length)
    });
    for i in 0..argument_count {
        let (arg_name, value) = pair(i);
        if arg_name == 0 {
            let in_positional_run = i < consumed_positional;
            let in_packed = packed.is_some_and(|(v, len)| i >= v && i < v + len);
            if !in_positional_run && !in_packed && !too_many {
                state.error("Positional argument after named argument");
            }
            continue;
        }
        let mut found = false;
        for p in 0..parameter_count {
            if code[params_start + p * 2] == arg_name {
                if state.out[arg_write_start + p] == UNBOUND {
                    let slot = state.link_variable(value);
                    state.out[arg_write_start + p] = slot;
                } else {
                    let text = state.name(arg_name).to_owned();
                    state.error(format!("Parameter '{text}' already has a value"));
                }
                found = true;
                break;
            }
        }
        if !found {
            let text = state.name(arg_name).to_owned();
            state.error(format!("No parameter with name '{text}'"));
        }
    }

    // Remaining unbound slots take their declared defaults.
    for p in 0..parameter_count {
        if state.out[arg_write_start + p] == UNBOUND {
            let default = code[params_start + p * 2 + 1];
            if default == UNBOUND {
                let text = state.name(code[params_start + p * 2]).to_owned();
                state.error(format!("No value for parameter '{text}'"));
            } else {
                state.out[arg_write_start + p] = default;
            }
        }
    }

    state
        .out
        .push(i32::try_from(return_count).expect("return count fits"));
    for i in 0..return_count {
        let slot = state.link_variable(code[returns_start + i]);
        state.out.push(slot);
    }
    read
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{bytecode::LinkedProgram, heap::Heap, parse::parse_script};

    fn try_link(source: &str) -> Result<LinkedProgram, Vec<Diagnostic>> {
        let mut interns = Interner::new();
        let natives = NativeRegistry::new(&mut interns);
        let mut heap = Heap::new();
        let mut ns = Namespace::new();
        let mut parsed = ParsedProgram::default();
        parse_script(
            source.as_bytes(),
            "test.don",
            &mut interns,
            &mut heap,
            &mut ns,
            &natives,
            &mut parsed,
        );
        link(parsed, &interns, &ns, "test.don")
    }

    /// Walks the linked stream instruction by instruction, skipping
    /// operand words.
    fn walk(program: &LinkedProgram) -> Vec<(usize, Op)> {
        let mut instructions = Vec::new();
        let mut offset = 0;
        while offset < program.code.len() {
            let (op, arg) = decode(program.code[offset]);
            instructions.push((offset, op));
            offset += 1 + match op {
                Op::Function | Op::Null | Op::True | Op::False | Op::EmptyList | Op::Jump | Op::ReturnVoid => 0,
                Op::FileList | Op::StoreConstant | Op::Copy | Op::Not | Op::Neg | Op::Inv | Op::BranchTrue
                | Op::BranchFalse => 1,
                Op::List => (arg + 2) as usize,
                Op::IterGet => 3,
                Op::Return => arg as usize,
                Op::Invoke => {
                    let rc = program.code[offset + 2 + arg as usize] as usize;
                    2 + arg as usize + rc
                }
                Op::InvokeNative => {
                    let native = NativeFn::from_repr(arg as u8).expect("native id");
                    let info = NativeRegistry::info(native);
                    info.params.len() + info.returns
                }
                _ => 2,
            };
        }
        instructions
    }

    fn ops_of(program: &LinkedProgram) -> Vec<Op> {
        walk(program).into_iter().map(|(_, op)| op).collect()
    }

    #[test]
    fn locals_get_dense_slots() {
        let program = try_link("default:\n  x = 1\n  y = x + 1\n").unwrap();
        // Functions: init (id 0) and default (id 1).
        assert_eq!(program.functions.len(), 2);
        let (op, locals) = decode(program.code[program.functions[1]]);
        assert_eq!(op, Op::Function);
        // x, y, and the temporary holding x + 1.
        assert_eq!(locals, 3);
        let (op, locals) = decode(program.code[program.functions[0]]);
        assert_eq!(op, Op::Function);
        assert_eq!(locals, 0);
    }

    #[test]
    fn vararg_call_packs_a_list() {
        let program = try_link("all(...xs)\n  echo(xs)\n\ndefault:\n  all(1, 2)\n").unwrap();
        let ops = ops_of(&program);
        assert!(ops.contains(&Op::List), "vararg packing emits a list: {ops:?}");
        assert!(ops.contains(&Op::Invoke));
    }

    #[test]
    fn call_without_vararg_has_no_list() {
        let program = try_link("one(a)\n  echo(a)\n\ndefault:\n  one(1)\n").unwrap();
        assert!(!ops_of(&program).contains(&Op::List));
    }

    #[test]
    fn invoke_sites_carry_entry_offsets() {
        let program = try_link("work:\n  echo(1)\n\ndefault:\n  work()\n").unwrap();
        let invoke_at = walk(&program)
            .into_iter()
            .find(|&(_, op)| op == Op::Invoke)
            .map(|(offset, _)| offset)
            .expect("one invoke site");
        let entry = program.code[invoke_at + 1] as usize;
        assert_eq!(entry, program.functions[1], "call resolves to the work function");
        assert_eq!(decode(program.code[entry]).0, Op::Function);
    }

    #[test]
    fn jumps_are_relative_and_land_on_instructions() {
        let program = try_link("default:\n  if 1 == 1\n    echo(1)\n  else\n    echo(2)\n").unwrap();
        let instructions = walk(&program);
        let starts: Vec<usize> = instructions.iter().map(|&(offset, _)| offset).collect();
        for &(offset, op) in &instructions {
            if matches!(op, Op::Jump | Op::BranchTrue | Op::BranchFalse) {
                let (_, arg) = decode(program.code[offset]);
                let target = usize::try_from(offset as i64 + 2 + i64::from(arg)).expect("in range");
                assert!(
                    target == program.code.len() || starts.contains(&target),
                    "jump from {offset} lands on an instruction, got {target}"
                );
            }
        }
    }

    #[test]
    fn unknown_named_argument_is_rejected() {
        let err = try_link("f(a)\n  echo(a)\n\ndefault:\n  f(b=1)\n").unwrap_err();
        assert!(err.iter().any(|d| d.message.contains("No parameter with name 'b'")));
    }

    #[test]
    fn duplicate_argument_is_rejected() {
        let err = try_link("f(a)\n  echo(a)\n\ndefault:\n  f(1, a=2)\n").unwrap_err();
        assert!(err.iter().any(|d| d.message.contains("Parameter 'a' already has a value")));
    }

    #[test]
    fn too_many_arguments_is_rejected() {
        let err = try_link("f(a)\n  echo(a)\n\ndefault:\n  f(1, 2)\n").unwrap_err();
        assert!(err.iter().any(|d| d.message.contains("Too many arguments")));
    }

    #[test]
    fn parameter_shadowing_a_field_is_rejected() {
        let err = try_link("cc = \"gcc\"\n\nf(cc)\n  echo(cc)\n\ndefault:\n  f(1)\n").unwrap_err();
        assert!(err.iter().any(|d| d.message.contains("'cc' is a global variable")));
    }

    #[test]
    fn declaration_errors_surface_through_link() {
        let err = try_link("default:\n  echo(1)\n$\n").unwrap_err();
        assert!(err.iter().any(|d| d.message.contains("Unsupported character")));
    }

    #[test]
    fn fields_resolve_below_the_constant_range() {
        let program = try_link("cc = \"gcc\"\n\ndefault:\n  echo(cc)\n").unwrap();
        assert_eq!(program.fields.len(), 1);
        // The echo argument slot names the field, below every constant.
        let invoke_at = walk(&program)
            .into_iter()
            .find(|&(_, op)| op == Op::InvokeNative)
            .map(|(offset, _)| offset)
            .expect("echo site");
        let slot = program.code[invoke_at + 1];
        assert!(slot < program.smallest_constant());
        assert_eq!(program.smallest_constant() - slot - 1, 0);
    }
}
