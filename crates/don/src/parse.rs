//! The script parser.
//!
//! Indentation defines block structure. Parsing runs in two passes over
//! the source: a declaration scan that registers functions, parameters,
//! and fields in the namespace, then a body pass that emits pre-link
//! instruction words: the synthetic init function (field initialisers)
//! first, then every function in declaration order.
//!
//! Statement-level errors are emitted into the instruction stream as
//! `Error` words so the linker reports them with their source position;
//! parsing continues on the next line to surface as many problems per
//! run as possible.

use crate::{
    bytecode::{Op, ParsedProgram, word},
    heap::Heap,
    intern::{Interner, StringId},
    namespace::{FieldInfo, FunctionInfo, Namespace, Param},
    native::{DefaultArg, NativeFn, NativeRegistry},
    value::{INT_MAX as LITERAL_MAX, VRef},
};

/// Anonymous temporaries live below this id; the linker treats any raw
/// variable id under it as a fresh dense slot. Constant references
/// occupy `[-constant_count, 0)` and can never reach this far down.
const ANON_BASE: i32 = -(1 << 24);

/// Unbound-slot sentinel shared with the linker.
const UNBOUND: i32 = i32::MAX;

/// Why an expression or statement could not be parsed. The message has
/// already been recorded by the time this is returned.
struct ParseAbort;

type ExprResult = Result<i32, ParseAbort>;

/// Calling convention context for an invocation site.
enum CallSite {
    /// `f(...)` as a statement: no return values are kept.
    Statement,
    /// `x = f(...)` inside an expression: exactly one return value.
    Expression,
    /// `a, b = f(...)`: one return value per listed name.
    MultiAssign(Vec<i32>),
}

pub struct Parser<'a> {
    source: &'a [u8],
    filename: &'a str,
    pos: usize,
    line: u32,
    statement_line: u32,
    interns: &'a mut Interner,
    heap: &'a mut Heap,
    ns: &'a mut Namespace,
    natives: &'a NativeRegistry,
    program: &'a mut ParsedProgram,
    temp_counter: i32,
    label_counter: i32,
    last_emitted_line: u32,
}

/// Parses one script file into `program`, registering declarations in
/// `ns`. Errors are accumulated; the caller checks `program.has_errors`.
pub fn parse_script(
    source: &[u8],
    filename: &str,
    interns: &mut Interner,
    heap: &mut Heap,
    ns: &mut Namespace,
    natives: &NativeRegistry,
    program: &mut ParsedProgram,
) {
    let mut parser = Parser {
        source,
        filename,
        pos: 0,
        line: 1,
        statement_line: 1,
        interns,
        heap,
        ns,
        natives,
        program,
        temp_counter: 0,
        label_counter: 0,
        last_emitted_line: 0,
    };
    parser.scan_declarations();
    parser.emit_program();
}

fn is_initial_identifier(c: u8) -> bool {
    c.is_ascii_alphabetic()
}

fn is_identifier(c: u8) -> bool {
    c.is_ascii_alphanumeric()
}

impl<'a> Parser<'a> {
    // ------------------------------------------------------------------
    // Lexing
    // ------------------------------------------------------------------

    fn eof(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn peek(&self) -> u8 {
        if self.eof() { b'\n' } else { self.source[self.pos] }
    }

    fn peek_at(&self, offset: usize) -> u8 {
        *self.source.get(self.pos + offset).unwrap_or(&b'\n')
    }

    fn skip_whitespace(&mut self) {
        while self.peek() == b' ' {
            self.pos += 1;
        }
    }

    fn skip_line(&mut self) {
        while !self.eof() && self.source[self.pos] != b'\n' {
            self.pos += 1;
        }
        if !self.eof() {
            self.pos += 1;
        }
        self.line += 1;
    }

    fn read_newline(&mut self) -> bool {
        if self.eof() {
            return true;
        }
        if self.peek() == b'\n' {
            self.pos += 1;
            self.line += 1;
            return true;
        }
        false
    }

    /// True at a newline, comment, or end of input.
    fn at_line_end(&self) -> bool {
        self.eof() || self.peek() == b'\n' || self.peek() == b';'
    }

    fn read_operator(&mut self, op: u8) -> bool {
        if self.peek() == op {
            self.pos += 1;
            return true;
        }
        false
    }

    fn read_operator2(&mut self, a: u8, b: u8) -> bool {
        if self.peek() == a && self.peek_at(1) == b {
            self.pos += 2;
            return true;
        }
        false
    }

    fn peek_identifier(&self) -> bool {
        is_initial_identifier(self.peek())
    }

    fn read_identifier_text(&mut self) -> &'a str {
        debug_assert!(self.peek_identifier());
        let source = self.source;
        let start = self.pos;
        while is_identifier(self.peek()) {
            self.pos += 1;
        }
        std::str::from_utf8(&source[start..self.pos]).expect("identifier bytes are ASCII")
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn emit(&mut self, op: Op, arg: i32) {
        self.program.code.push(word(op, arg));
    }

    fn emit_word(&mut self, value: i32) {
        self.program.code.push(value);
    }

    fn emit_line_marker(&mut self) {
        if self.line != self.last_emitted_line {
            self.last_emitted_line = self.line;
            self.emit(Op::Line, i32::try_from(self.line).expect("line number overflow"));
        }
    }

    fn new_temp(&mut self) -> i32 {
        self.temp_counter += 1;
        ANON_BASE - self.temp_counter
    }

    fn new_label(&mut self) -> i32 {
        let label = self.label_counter;
        self.label_counter += 1;
        label
    }

    fn add_constant(&mut self, value: VRef) -> usize {
        self.program.constants.push(value);
        self.program.constants.len() - 1
    }

    /// Raw-variable encoding of a constant table index.
    fn const_ref(&mut self, value: VRef) -> i32 {
        let index = self.add_constant(value);
        -i32::try_from(index).expect("constant table overflow") - 1
    }

    fn string_constant(&mut self, text: &str) -> i32 {
        let id = self.interns.add(text);
        let pooled = self.heap.create_pooled_string(id);
        self.const_ref(pooled)
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Records a declaration-phase error directly.
    fn decl_error(&mut self, message: impl Into<String>) {
        let line = self.line;
        self.program.error(self.filename, line, message);
    }

    /// Emits a statement-phase error into the instruction stream; the
    /// linker reports it positioned at the current statement.
    fn stmt_error(&mut self, message: impl Into<String>) -> ParseAbort {
        self.program.has_errors = true;
        let id = self.interns.add(&message.into());
        let line = self.statement_line;
        if line != self.last_emitted_line {
            self.last_emitted_line = line;
            self.emit(Op::Line, i32::try_from(line).expect("line number overflow"));
        }
        self.emit(Op::Error, i32::try_from(id.index()).expect("name id overflow"));
        ParseAbort
    }

    // ------------------------------------------------------------------
    // Declaration scan
    // ------------------------------------------------------------------

    fn scan_declarations(&mut self) {
        let mut in_function = false;
        while !self.eof() {
            let c = self.peek();
            if is_initial_identifier(c) {
                in_function = self.scan_declaration();
            } else if c == b' ' {
                if in_function {
                    self.skip_line();
                } else {
                    self.decl_error("Unexpected indentation.");
                    self.skip_line();
                }
            } else if c == b';' || c == b'\n' {
                self.skip_line();
            } else {
                self.decl_error(format!("Unsupported character: {}", c as char));
                self.skip_line();
            }
        }
    }

    /// Scans one top-level declaration. Returns true when it opened a
    /// function body.
    fn scan_declaration(&mut self) -> bool {
        let line = self.line;
        let name_text = self.read_identifier_text().to_owned();
        let name = self.interns.add(&name_text);
        if self.ns.get_function(name).is_some() || self.ns.get_field(name).is_some() || self.natives.find(name).is_some()
        {
            self.decl_error(format!("'{name_text}' is already defined"));
            self.skip_line();
            return true;
        }
        if self.read_operator(b':') {
            if !self.end_of_declaration_line() {
                self.decl_error("Garbage after function declaration.");
                self.skip_line();
            }
            self.ns.add_function(FunctionInfo {
                name,
                line,
                body_offset: self.pos,
                params: vec![],
                vararg: None,
            });
            true
        } else if self.read_operator(b'(') {
            let (params, vararg) = self.scan_parameters();
            if !self.end_of_declaration_line() {
                self.decl_error("Garbage after function declaration.");
                self.skip_line();
            }
            self.ns.add_function(FunctionInfo {
                name,
                line,
                body_offset: self.pos,
                params,
                vararg,
            });
            true
        } else {
            self.skip_whitespace();
            if self.read_operator(b'=') {
                self.skip_whitespace();
                self.ns.add_field(FieldInfo {
                    name,
                    line,
                    expr_offset: self.pos,
                });
                self.skip_line();
                false
            } else {
                self.decl_error("Invalid declaration.");
                self.skip_line();
                false
            }
        }
    }

    /// Consumes trailing whitespace, an optional comment, and the
    /// newline ending a declaration.
    fn end_of_declaration_line(&mut self) -> bool {
        self.skip_whitespace();
        if self.peek() == b';' {
            while !self.eof() && self.peek() != b'\n' {
                self.pos += 1;
            }
        }
        self.read_newline()
    }

    fn scan_parameters(&mut self) -> (Vec<Param>, Option<usize>) {
        let mut params = Vec::new();
        let mut vararg = None;
        self.skip_whitespace();
        if self.read_operator(b')') {
            return (params, vararg);
        }
        loop {
            self.skip_whitespace();
            let mut is_vararg = false;
            if self.peek() == b'.' && self.peek_at(1) == b'.' && self.peek_at(2) == b'.' {
                self.pos += 3;
                if vararg.is_some() {
                    self.decl_error("Multiple vararg parameters.");
                }
                is_vararg = true;
            }
            if !self.peek_identifier() {
                self.decl_error("Expected parameter name or ')'.");
                self.skip_line();
                return (params, vararg);
            }
            let name_text = self.read_identifier_text().to_owned();
            let name = self.interns.add(&name_text);
            if params.iter().any(|p: &Param| p.name == name) {
                self.decl_error(format!("Multiple uses of parameter name '{name_text}'"));
            }
            self.skip_whitespace();
            let default = if self.peek() == b'=' && self.peek_at(1) != b'=' {
                self.pos += 1;
                self.skip_whitespace();
                self.scan_literal_default()
            } else if is_vararg {
                // An absent surplus packs to the empty list.
                let empty = self.heap.singles().empty_list;
                Some(self.const_ref(empty))
            } else {
                None
            };
            if is_vararg {
                vararg = Some(params.len());
            }
            params.push(Param { name, default });
            self.skip_whitespace();
            if self.read_operator(b')') {
                break;
            }
            if !self.read_operator(b',') {
                self.decl_error("Expected ',' or ')'.");
                self.skip_line();
                return (params, vararg);
            }
        }
        (params, vararg)
    }

    /// Parses a parameter default: a literal only.
    fn scan_literal_default(&mut self) -> Option<i32> {
        let negative = self.peek() == b'-' && self.peek_at(1).is_ascii_digit();
        if negative {
            self.pos += 1;
        }
        if self.peek().is_ascii_digit() {
            let Some(value) = self.scan_integer() else {
                self.decl_error("Integer literal too large.");
                return None;
            };
            let value = if negative { -value } else { value };
            return Some(self.const_ref(VRef::from_int(value)));
        }
        if self.peek() == b'"' {
            let Some(text) = self.scan_string_literal() else {
                self.decl_error("Unterminated string literal.");
                return None;
            };
            return Some(self.string_constant(&text));
        }
        if self.peek() == b'[' && self.peek_at(1) == b']' {
            self.pos += 2;
            let empty = self.heap.singles().empty_list;
            return Some(self.const_ref(empty));
        }
        if self.peek_identifier() {
            let start = self.pos;
            let text = self.read_identifier_text().to_owned();
            match text.as_str() {
                "true" => {
                    let v = self.heap.singles().true_;
                    return Some(self.const_ref(v));
                }
                "false" => {
                    let v = self.heap.singles().false_;
                    return Some(self.const_ref(v));
                }
                "null" => return Some(self.const_ref(VRef::NULL)),
                _ => self.pos = start,
            }
        }
        self.decl_error("Parameter default must be a literal.");
        None
    }

    /// Reads a decimal literal; `None` when it exceeds the inline
    /// integer range. The caller reports the error for its phase.
    fn scan_integer(&mut self) -> Option<i32> {
        let mut value: i32 = 0;
        while self.peek().is_ascii_digit() {
            let digit = i32::from(self.peek() - b'0');
            value = match value.checked_mul(10).and_then(|v| v.checked_add(digit)) {
                Some(v) if v <= LITERAL_MAX => v,
                _ => return None,
            };
            self.pos += 1;
        }
        Some(value)
    }

    /// Reads a double-quoted literal; no escapes, no embedded newlines.
    /// `None` when unterminated; the caller reports the error.
    fn scan_string_literal(&mut self) -> Option<String> {
        debug_assert_eq!(self.peek(), b'"');
        self.pos += 1;
        let start = self.pos;
        while self.peek() != b'"' {
            if self.eof() || self.peek() == b'\n' {
                return None;
            }
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
        self.pos += 1;
        Some(text)
    }

    // ------------------------------------------------------------------
    // Body pass
    // ------------------------------------------------------------------

    fn emit_program(&mut self) {
        let file_const = {
            let id = self.interns.add(self.filename);
            let pooled = self.heap.create_pooled_string(id);
            self.add_constant(pooled)
        };

        // Init function: field initialisers in declaration order.
        self.program.functions.push(self.program.code.len());
        self.emit(Op::FunctionUnlinked, 0);
        self.emit_word(0);
        self.emit_word(UNBOUND);
        self.emit(Op::File, i32::try_from(file_const).expect("constant table overflow"));
        let fields: Vec<(StringId, u32, usize)> = self
            .ns
            .fields()
            .map(|(_, info)| (info.name, info.line, info.expr_offset))
            .collect();
        self.program.field_count = fields.len();
        for (name, line, expr_offset) in fields {
            self.pos = expr_offset;
            self.line = line;
            self.statement_line = line;
            self.emit_line_marker();
            match self.parse_expression() {
                Ok(value) => {
                    self.emit(Op::Copy, i32::try_from(name.index()).expect("name id overflow"));
                    self.emit_word(value);
                    self.skip_whitespace();
                    if !self.at_line_end() {
                        let _ = self.stmt_error("Garbage after field initialiser.");
                    }
                }
                Err(ParseAbort) => {}
            }
        }
        self.emit(Op::ReturnVoid, 0);
        self.program.max_jump_targets = self.program.max_jump_targets.max(self.label_counter as usize);

        // Function bodies in declaration order.
        let functions: Vec<(u32, usize, Vec<Param>, Option<usize>)> = self
            .ns
            .functions()
            .map(|(_, info)| (info.line, info.body_offset, info.params.clone(), info.vararg))
            .collect();
        for (line, body_offset, params, vararg) in functions {
            self.temp_counter = 0;
            self.label_counter = 0;
            self.last_emitted_line = 0;
            self.pos = body_offset;
            self.line = line + 1;

            self.program.functions.push(self.program.code.len());
            self.emit(Op::FunctionUnlinked, 0);
            self.emit_word(i32::try_from(params.len()).expect("parameter count overflow"));
            self.emit_word(vararg.map_or(UNBOUND, |v| i32::try_from(v).expect("vararg index overflow")));
            for param in &params {
                self.emit_word(i32::try_from(param.name.index()).expect("name id overflow"));
                self.emit_word(param.default.unwrap_or(UNBOUND));
            }

            if let Some((indent, _, _)) = self.peek_content()
                && indent > 0
            {
                self.parse_block(indent);
            }
            self.emit(Op::ReturnVoid, 0);
            self.program.max_jump_targets = self.program.max_jump_targets.max(self.label_counter as usize);
        }
    }

    /// Finds the next content line (skipping blanks and comments)
    /// without consuming anything. Returns (indent, position of first
    /// content byte, line number).
    fn peek_content(&self) -> Option<(usize, usize, u32)> {
        let mut pos = self.pos;
        let mut line = self.line;
        loop {
            if pos >= self.source.len() {
                return None;
            }
            let start = pos;
            while pos < self.source.len() && self.source[pos] == b' ' {
                pos += 1;
            }
            let indent = pos - start;
            match self.source.get(pos) {
                None => return None,
                Some(b'\n') => {
                    pos += 1;
                    line += 1;
                }
                Some(b';') => {
                    while pos < self.source.len() && self.source[pos] != b'\n' {
                        pos += 1;
                    }
                }
                Some(_) => return Some((indent, pos, line)),
            }
        }
    }

    /// Moves the cursor to a position previously returned by
    /// [`Parser::peek_content`].
    fn advance_to(&mut self, pos: usize, line: u32) {
        debug_assert!(pos >= self.pos);
        self.pos = pos;
        self.line = line;
    }

    /// Parses statements at exactly `block_indent` until the block ends.
    fn parse_block(&mut self, block_indent: usize) {
        loop {
            let Some((indent, pos, line)) = self.peek_content() else {
                return;
            };
            if indent < block_indent || indent == 0 {
                return;
            }
            self.advance_to(pos, line);
            if indent > block_indent {
                self.statement_line = line;
                let _ = self.stmt_error("Mismatched indentation level.");
                self.skip_line();
                continue;
            }
            self.parse_statement(block_indent);
        }
    }

    fn parse_statement(&mut self, block_indent: usize) {
        self.statement_line = self.line;
        self.emit_line_marker();
        if !self.peek_identifier() {
            let _ = self.stmt_error("Not a statement.");
            self.skip_line();
            return;
        }
        let start = self.pos;
        let text = self.read_identifier_text().to_owned();
        let result = match text.as_str() {
            "if" => self.stmt_if(block_indent),
            "while" => self.stmt_while(block_indent),
            "for" => self.stmt_for(block_indent),
            "return" => self.stmt_return(),
            "else" => Err(self.stmt_error("else without matching if.")),
            "true" | "false" | "null" | "in" => Err(self.stmt_error("Not a statement.")),
            _ => self.stmt_simple(&text, start),
        };
        if result.is_err() {
            self.skip_line();
        }
    }

    /// Assignment, multi-assignment, or invocation statement.
    fn stmt_simple(&mut self, name_text: &str, start: usize) -> Result<(), ParseAbort> {
        if self.peek() == b'(' {
            self.pos += 1;
            let name = self.interns.add(name_text);
            self.parse_invocation(name_text, name, CallSite::Statement)?;
            return self.end_of_statement();
        }
        let first = self.interns.add(name_text);
        let mut names = vec![i32::try_from(first.index()).expect("name id overflow")];
        self.skip_whitespace();
        while self.read_operator(b',') {
            self.skip_whitespace();
            if !self.peek_identifier() {
                return Err(self.stmt_error("Expected a variable name."));
            }
            let text = self.read_identifier_text().to_owned();
            let id = self.interns.add(&text);
            names.push(i32::try_from(id.index()).expect("name id overflow"));
            self.skip_whitespace();
        }
        if !self.read_operator(b'=') || self.peek() == b'=' {
            self.pos = start;
            return Err(self.stmt_error("Not a statement."));
        }
        self.skip_whitespace();
        if names.len() == 1 {
            let value = self.parse_expression()?;
            self.emit(Op::Copy, names[0]);
            self.emit_word(value);
        } else {
            if !self.peek_identifier() {
                return Err(self.stmt_error("Expected a function call."));
            }
            let callee = self.read_identifier_text().to_owned();
            if !self.read_operator(b'(') {
                return Err(self.stmt_error("Expected a function call."));
            }
            let callee_id = self.interns.add(&callee);
            self.parse_invocation(&callee, callee_id, CallSite::MultiAssign(names))?;
        }
        self.end_of_statement()
    }

    fn end_of_statement(&mut self) -> Result<(), ParseAbort> {
        self.skip_whitespace();
        if self.peek() == b';' {
            while !self.eof() && self.peek() != b'\n' {
                self.pos += 1;
            }
        }
        if self.read_newline() {
            Ok(())
        } else {
            Err(self.stmt_error("Garbage after statement."))
        }
    }

    fn expect_statement_newline(&mut self, what: &str) -> Result<(), ParseAbort> {
        self.skip_whitespace();
        if self.peek() == b';' {
            while !self.eof() && self.peek() != b'\n' {
                self.pos += 1;
            }
        }
        if self.read_newline() {
            Ok(())
        } else {
            Err(self.stmt_error(format!("Garbage after {what} statement.")))
        }
    }

    /// Parses a nested block if one follows at deeper indentation.
    fn parse_nested_block(&mut self, block_indent: usize) {
        if let Some((indent, _, _)) = self.peek_content()
            && indent > block_indent
        {
            self.parse_block(indent);
        }
    }

    fn stmt_if(&mut self, block_indent: usize) -> Result<(), ParseAbort> {
        self.skip_whitespace();
        let condition = self.parse_expression()?;
        self.expect_statement_newline("if")?;
        let label_else = self.new_label();
        self.emit(Op::BranchFalseIndexed, label_else);
        self.emit_word(condition);
        self.parse_nested_block(block_indent);

        // An `else` at the same indentation belongs to this `if`.
        if let Some((indent, pos, line)) = self.peek_content()
            && indent == block_indent
            && self.word_at(pos) == Some("else")
        {
            self.advance_to(pos, line);
            self.statement_line = line;
            let _ = self.read_identifier_text();
            self.expect_statement_newline("else")?;
            let label_end = self.new_label();
            self.emit(Op::JumpIndexed, label_end);
            self.emit(Op::JumpTarget, label_else);
            self.parse_nested_block(block_indent);
            self.emit(Op::JumpTarget, label_end);
        } else {
            self.emit(Op::JumpTarget, label_else);
        }
        Ok(())
    }

    fn stmt_while(&mut self, block_indent: usize) -> Result<(), ParseAbort> {
        let label_top = self.new_label();
        let label_end = self.new_label();
        self.emit(Op::JumpTarget, label_top);
        self.skip_whitespace();
        let condition = self.parse_expression()?;
        self.expect_statement_newline("while")?;
        self.emit(Op::BranchFalseIndexed, label_end);
        self.emit_word(condition);
        self.parse_nested_block(block_indent);
        self.emit(Op::JumpIndexed, label_top);
        self.emit(Op::JumpTarget, label_end);
        Ok(())
    }

    fn stmt_for(&mut self, block_indent: usize) -> Result<(), ParseAbort> {
        self.skip_whitespace();
        if !self.peek_identifier() {
            return Err(self.stmt_error("Expected a loop variable."));
        }
        let variable_text = self.read_identifier_text().to_owned();
        let variable = self.interns.add(&variable_text);
        self.skip_whitespace();
        if !self.peek_identifier() || self.read_identifier_text() != "in" {
            return Err(self.stmt_error("Expected 'in'."));
        }
        self.skip_whitespace();
        let collection_value = self.parse_expression()?;
        self.expect_statement_newline("for")?;

        let collection = self.new_temp();
        self.emit(Op::Copy, collection);
        self.emit_word(collection_value);
        let index = self.new_temp();
        let zero = self.const_ref(VRef::from_int(0));
        self.emit(Op::StoreConstant, index);
        self.emit_word(zero);
        let done = self.new_temp();

        let label_top = self.new_label();
        let label_end = self.new_label();
        self.emit(Op::JumpTarget, label_top);
        self.emit(Op::IterGet, i32::try_from(variable.index()).expect("name id overflow"));
        self.emit_word(index);
        self.emit_word(collection);
        self.emit_word(done);
        self.emit(Op::BranchTrueIndexed, label_end);
        self.emit_word(done);
        self.parse_nested_block(block_indent);
        self.emit(Op::JumpIndexed, label_top);
        self.emit(Op::JumpTarget, label_end);
        Ok(())
    }

    fn stmt_return(&mut self) -> Result<(), ParseAbort> {
        self.skip_whitespace();
        if self.at_line_end() {
            self.emit(Op::ReturnVoid, 0);
            return self.end_of_statement();
        }
        let mut values = vec![self.parse_expression()?];
        self.skip_whitespace();
        while self.read_operator(b',') {
            self.skip_whitespace();
            values.push(self.parse_expression()?);
            self.skip_whitespace();
        }
        self.emit(Op::Return, i32::try_from(values.len()).expect("return count overflow"));
        for value in values {
            self.emit_word(value);
        }
        self.end_of_statement()
    }

    /// Reads the identifier at an arbitrary position, if any.
    fn word_at(&self, pos: usize) -> Option<&str> {
        let mut end = pos;
        if !self.source.get(pos).copied().is_some_and(is_initial_identifier) {
            return None;
        }
        while self.source.get(end).copied().is_some_and(is_identifier) {
            end += 1;
        }
        std::str::from_utf8(&self.source[pos..end]).ok()
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expression(&mut self) -> ExprResult {
        let condition = self.parse_compare()?;
        self.skip_whitespace();
        if !self.read_operator(b'?') {
            return Ok(condition);
        }
        // Ternary: branch into a shared destination slot.
        let result = self.new_temp();
        let label_else = self.new_label();
        let label_end = self.new_label();
        self.emit(Op::BranchFalseIndexed, label_else);
        self.emit_word(condition);
        self.skip_whitespace();
        let then_value = self.parse_expression()?;
        self.emit(Op::Copy, result);
        self.emit_word(then_value);
        self.emit(Op::JumpIndexed, label_end);
        self.skip_whitespace();
        if !self.read_operator(b':') {
            return Err(self.stmt_error("Expected operator ':'."));
        }
        self.emit(Op::JumpTarget, label_else);
        self.skip_whitespace();
        let else_value = self.parse_expression()?;
        self.emit(Op::Copy, result);
        self.emit_word(else_value);
        self.emit(Op::JumpTarget, label_end);
        Ok(result)
    }

    fn parse_compare(&mut self) -> ExprResult {
        let left = self.parse_range()?;
        self.skip_whitespace();
        let op = if self.read_operator2(b'=', b'=') {
            Op::Equals
        } else if self.read_operator2(b'!', b'=') {
            Op::NotEquals
        } else if self.read_operator2(b'<', b'=') {
            Op::LessEquals
        } else if self.read_operator2(b'>', b'=') {
            Op::GreaterEquals
        } else if self.peek() == b'<' {
            self.pos += 1;
            Op::Less
        } else if self.peek() == b'>' {
            self.pos += 1;
            Op::Greater
        } else if self.peek() == b'=' {
            return Err(self.stmt_error("Assignment not allowed here."));
        } else {
            return Ok(left);
        };
        self.skip_whitespace();
        let right = self.parse_range()?;
        Ok(self.emit_binary(op, left, right))
    }

    fn parse_range(&mut self) -> ExprResult {
        let left = self.parse_concat()?;
        self.skip_whitespace();
        if self.read_operator2(b'.', b'.') {
            self.skip_whitespace();
            let right = self.parse_concat()?;
            return Ok(self.emit_binary(Op::Range, left, right));
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> ExprResult {
        let mut value = self.parse_additive()?;
        loop {
            self.skip_whitespace();
            if self.read_operator2(b':', b':') {
                self.skip_whitespace();
                let right = self.parse_additive()?;
                value = self.emit_binary(Op::ConcatList, value, right);
            } else if self.peek() == b'~' {
                self.pos += 1;
                self.skip_whitespace();
                let right = self.parse_additive()?;
                value = self.emit_binary(Op::ConcatString, value, right);
            } else {
                return Ok(value);
            }
        }
    }

    fn parse_additive(&mut self) -> ExprResult {
        let mut value = self.parse_multiplicative()?;
        loop {
            self.skip_whitespace();
            if self.peek() == b'+' {
                self.pos += 1;
                self.skip_whitespace();
                let right = self.parse_multiplicative()?;
                value = self.emit_binary(Op::Add, value, right);
            } else if self.peek() == b'-' {
                self.pos += 1;
                self.skip_whitespace();
                let right = self.parse_multiplicative()?;
                value = self.emit_binary(Op::Sub, value, right);
            } else {
                return Ok(value);
            }
        }
    }

    fn parse_multiplicative(&mut self) -> ExprResult {
        let mut value = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek() {
                b'*' => Op::Mul,
                b'/' => Op::Div,
                b'%' => Op::Rem,
                _ => return Ok(value),
            };
            self.pos += 1;
            self.skip_whitespace();
            let right = self.parse_unary()?;
            value = self.emit_binary(op, value, right);
        }
    }

    fn parse_unary(&mut self) -> ExprResult {
        if self.peek() == b'!' && self.peek_at(1) != b'=' {
            self.pos += 1;
            let value = self.parse_unary()?;
            return Ok(self.emit_unary(Op::Not, value));
        }
        if self.peek() == b'-' {
            self.pos += 1;
            let value = self.parse_unary()?;
            return Ok(self.emit_unary(Op::Neg, value));
        }
        if self.peek() == b'~' {
            self.pos += 1;
            let value = self.parse_unary()?;
            return Ok(self.emit_unary(Op::Inv, value));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ExprResult {
        let mut value = self.parse_primary()?;
        while self.peek() == b'[' {
            self.pos += 1;
            self.skip_whitespace();
            let index = self.parse_expression()?;
            self.skip_whitespace();
            if !self.read_operator(b']') {
                return Err(self.stmt_error("Expected operator ']'."));
            }
            value = self.emit_binary(Op::IndexedAccess, value, index);
        }
        Ok(value)
    }

    fn parse_primary(&mut self) -> ExprResult {
        if self.peek_identifier() {
            let text = self.read_identifier_text().to_owned();
            return match text.as_str() {
                "true" => Ok(self.emit_singleton(Op::True)),
                "false" => Ok(self.emit_singleton(Op::False)),
                "null" => Ok(self.emit_singleton(Op::Null)),
                "if" | "else" | "while" | "for" | "in" | "return" => {
                    Err(self.stmt_error(format!("Unexpected keyword '{text}'.")))
                }
                _ => {
                    if self.read_operator(b'(') {
                        let name = self.interns.add(&text);
                        self.parse_invocation(&text, name, CallSite::Expression)
                    } else {
                        let id = self.interns.add(&text);
                        Ok(i32::try_from(id.index()).expect("name id overflow"))
                    }
                }
            };
        }
        if self.peek().is_ascii_digit() {
            let Some(value) = self.scan_integer() else {
                return Err(self.stmt_error("Integer literal too large."));
            };
            return Ok(self.const_ref(VRef::from_int(value)));
        }
        if self.peek() == b'"' {
            let Some(text) = self.scan_string_literal() else {
                return Err(self.stmt_error("Unterminated string literal."));
            };
            return Ok(self.string_constant(&text));
        }
        if self.peek() == b'@' {
            self.pos += 1;
            if self.peek() != b'"' {
                return Err(self.stmt_error("Expected a pattern string after '@'."));
            }
            let Some(pattern) = self.scan_string_literal() else {
                return Err(self.stmt_error("Unterminated string literal."));
            };
            let index = {
                let id = self.interns.add(&pattern);
                let pooled = self.heap.create_pooled_string(id);
                self.add_constant(pooled)
            };
            let dst = self.new_temp();
            self.emit(Op::FileList, i32::try_from(index).expect("constant table overflow"));
            self.emit_word(dst);
            return Ok(dst);
        }
        if self.peek() == b'[' {
            self.pos += 1;
            return self.parse_list_literal();
        }
        Err(self.stmt_error("Invalid expression."))
    }

    fn parse_list_literal(&mut self) -> ExprResult {
        let mut values = Vec::new();
        self.skip_whitespace();
        while !self.read_operator(b']') {
            if self.at_line_end() {
                return Err(self.stmt_error("Expected operator ']'."));
            }
            values.push(self.parse_expression()?);
            self.skip_whitespace();
            if self.read_operator(b',') {
                self.skip_whitespace();
            }
        }
        if values.is_empty() {
            return Ok(self.emit_singleton(Op::EmptyList));
        }
        let dst = self.new_temp();
        self.emit(
            Op::List,
            i32::try_from(values.len() - 1).expect("list literal too long"),
        );
        for value in values {
            self.emit_word(value);
        }
        self.emit_word(dst);
        Ok(dst)
    }

    fn emit_singleton(&mut self, op: Op) -> i32 {
        let dst = self.new_temp();
        self.emit(op, dst);
        dst
    }

    fn emit_binary(&mut self, op: Op, left: i32, right: i32) -> i32 {
        let dst = self.new_temp();
        self.emit(op, dst);
        self.emit_word(left);
        self.emit_word(right);
        dst
    }

    fn emit_unary(&mut self, op: Op, value: i32) -> i32 {
        let dst = self.new_temp();
        self.emit(op, dst);
        self.emit_word(value);
        dst
    }

    // ------------------------------------------------------------------
    // Invocations
    // ------------------------------------------------------------------

    /// Parses `(args...)` after a call head and emits the invocation.
    /// Returns the raw variable carrying the first return value (0 when
    /// none are kept).
    fn parse_invocation(&mut self, name_text: &str, name: StringId, site: CallSite) -> ExprResult {
        if let Some(native) = self.natives.find(name) {
            return self.parse_native_invocation(name_text, native, site);
        }

        // Script function: argument binding happens at link time; the
        // pre-link form records (name, value) pairs verbatim.
        let mut pairs: Vec<(i32, i32)> = Vec::new();
        self.skip_whitespace();
        if !self.read_operator(b')') {
            loop {
                self.skip_whitespace();
                let pair = self.parse_argument()?;
                pairs.push(pair);
                self.skip_whitespace();
                if self.read_operator(b')') {
                    break;
                }
                if !self.read_operator(b',') {
                    return Err(self.stmt_error("Expected ',' or ')'."));
                }
            }
        }

        let dests: Vec<i32> = match site {
            CallSite::Statement => vec![],
            CallSite::Expression => vec![self.new_temp()],
            CallSite::MultiAssign(names) => names,
        };
        self.emit(Op::InvokeUnlinked, i32::try_from(name.index()).expect("name id overflow"));
        self.emit_word(i32::try_from(pairs.len()).expect("argument count overflow"));
        for (arg_name, value) in pairs {
            self.emit_word(arg_name);
            self.emit_word(value);
        }
        self.emit_word(i32::try_from(dests.len()).expect("return count overflow"));
        let first = dests.first().copied().unwrap_or(0);
        for dest in dests {
            self.emit_word(dest);
        }
        self.program.invocation_count += 1;
        Ok(first)
    }

    /// One call argument: `name=value` or a plain positional expression.
    fn parse_argument(&mut self) -> Result<(i32, i32), ParseAbort> {
        if self.peek_identifier() {
            let save_pos = self.pos;
            let save_line = self.line;
            let text = self.read_identifier_text().to_owned();
            self.skip_whitespace();
            if self.peek() == b'=' && self.peek_at(1) != b'=' {
                self.pos += 1;
                self.skip_whitespace();
                let id = self.interns.add(&text);
                let value = self.parse_expression()?;
                return Ok((i32::try_from(id.index()).expect("name id overflow"), value));
            }
            self.pos = save_pos;
            self.line = save_line;
        }
        Ok((0, self.parse_expression()?))
    }

    /// Natives bind arguments at parse time: the registry declares the
    /// parameter list, so positional filling, named filling, and default
    /// completion all happen here and the emitted `InvokeNative` carries
    /// exactly one slot per parameter and return value.
    fn parse_native_invocation(&mut self, name_text: &str, native: NativeFn, site: CallSite) -> ExprResult {
        let info = NativeRegistry::info(native);
        let mut bound: Vec<Option<i32>> = vec![None; info.params.len()];
        let mut positional = 0usize;
        let mut named_seen = false;
        self.skip_whitespace();
        if !self.read_operator(b')') {
            loop {
                self.skip_whitespace();
                let (arg_name, value) = self.parse_argument()?;
                if arg_name == 0 {
                    if named_seen {
                        return Err(self.stmt_error("Positional argument after named argument."));
                    }
                    if positional >= info.params.len() {
                        return Err(self.stmt_error(format!(
                            "Too many arguments for function '{name_text}'. At most {} were expected.",
                            info.params.len()
                        )));
                    }
                    bound[positional] = Some(value);
                    positional += 1;
                } else {
                    named_seen = true;
                    let wanted = self.interns.get(StringId::from_index(arg_name as u32)).to_owned();
                    match info.params.iter().position(|(p, _)| *p == wanted) {
                        Some(index) => {
                            if bound[index].is_some() {
                                return Err(
                                    self.stmt_error(format!("Parameter '{wanted}' already has a value"))
                                );
                            }
                            bound[index] = Some(value);
                        }
                        None => return Err(self.stmt_error(format!("No parameter with name '{wanted}'"))),
                    }
                }
                self.skip_whitespace();
                if self.read_operator(b')') {
                    break;
                }
                if !self.read_operator(b',') {
                    return Err(self.stmt_error("Expected ',' or ')'."));
                }
            }
        }
        for (index, slot) in bound.iter_mut().enumerate() {
            if slot.is_none() {
                let (param_name, default) = info.params[index];
                let value = match default {
                    DefaultArg::Required => {
                        return Err(self.stmt_error(format!(
                            "Too few arguments for function '{name_text}'. No value for parameter '{param_name}'."
                        )));
                    }
                    DefaultArg::Null => self.const_ref(VRef::NULL),
                    DefaultArg::True => {
                        let v = self.heap.singles().true_;
                        self.const_ref(v)
                    }
                    DefaultArg::False => {
                        let v = self.heap.singles().false_;
                        self.const_ref(v)
                    }
                    DefaultArg::EmptyList => {
                        let v = self.heap.singles().empty_list;
                        self.const_ref(v)
                    }
                };
                *slot = Some(value);
            }
        }

        let dests: Vec<i32> = match site {
            CallSite::Statement => (0..info.returns).map(|_| self.new_temp()).collect(),
            CallSite::Expression => {
                if info.returns == 0 {
                    return Err(self.stmt_error(format!("'{name_text}' does not return a value.")));
                }
                (0..info.returns).map(|_| self.new_temp()).collect()
            }
            CallSite::MultiAssign(names) => {
                if names.len() != info.returns {
                    return Err(self.stmt_error(format!(
                        "'{name_text}' returns {} value(s), not {}.",
                        info.returns,
                        names.len()
                    )));
                }
                names
            }
        };
        self.emit(Op::InvokeNative, i32::from(native as u8));
        for slot in bound {
            self.emit_word(slot.expect("all parameters bound above"));
        }
        let first = dests.first().copied().unwrap_or(0);
        for dest in dests {
            self.emit_word(dest);
        }
        Ok(first)
    }
}
