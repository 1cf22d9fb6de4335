//! Bytecode generation.
//!
//! One function is under construction at a time; `function` forms (named
//! or anonymous) push a fresh function and restore the enclosing one on
//! exit. Everything else about the backend hangs off [`CodeGen`]:
//!
//! - symbols, functions and labels live in arenas and refer to each other
//!   by index, so a function can hold symbols while a symbol points back
//!   at a function without ownership cycles
//! - each function keeps its own stack of lexical scopes; resolution walks
//!   the scopes, then the chain of enclosing functions (capturing free
//!   variables through shadow locals as it goes), then the globals
//! - emitted instructions carry fixups `(index, target)` that are patched
//!   once layout assigns every function a base address
//! - functions never referenced from the main function are dropped before
//!   layout, so dead runtime-library code costs nothing
//!
//! Calling convention: arguments are pushed right to left, the callee
//! address last; `CALL` pushes the return state and the caller drops the
//! arguments with `CLEANUP`. Parameters sit at frame slots 1..N, locals at
//! -2 downward (slots 0 and -1 belong to the saved base pointer and return
//! address). `SETLOCAL`, like `STORE`, leaves the stored value on the
//! stack.

use crate::ast::SExpr;
use crate::bytecode::*;
use crate::error::CompileError;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

pub type SymId = usize;
pub type FuncId = usize;
pub type LabelId = usize;

/// Call forms whose head maps directly onto an opcode, with their arity.
/// `<` and `<=` are synthesized by swapping operand order and using the
/// opposite comparison.
static BUILTIN_FUNCTIONS: LazyLock<HashMap<&'static str, (u32, usize)>> = LazyLock::new(|| {
    HashMap::from([
        ("+", (OP_ADD, 2)),
        ("-", (OP_SUB, 2)),
        (">", (OP_GTR, 2)),
        (">=", (OP_GTE, 2)),
        ("<", (OP_GTR, 2)),
        ("<=", (OP_GTE, 2)),
        ("=", (OP_EQ, 2)),
        ("<>", (OP_NEQ, 2)),
        ("load", (OP_LOAD, 1)),
        ("store", (OP_STORE, 2)),
        ("first", (OP_LOAD, 1)),
        ("rest", (OP_REST, 1)),
        ("settag", (OP_SETTAG, 2)),
        ("gettag", (OP_GETTAG, 1)),
        ("bitwise-and", (OP_AND, 2)),
        ("bitwise-or", (OP_OR, 2)),
        ("bitwise-xor", (OP_XOR, 2)),
        ("lshift", (OP_LSHIFT, 2)),
        ("rshift", (OP_RSHIFT, 2)),
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Stack-frame slot: positive for parameters, negative for locals.
    Local,
    /// Global memory slot, allocated densely on first sighting.
    Global,
    /// A statically known function; resolves to a code address.
    Function,
}

#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Frame slot for locals, memory slot for globals.
    pub index: i32,
    /// Globals only: set by `assign` or a function definition. Anything
    /// still false after compilation is a hard error.
    pub initialized: bool,
    /// Function-kind only: the target, filled in when the body compiles.
    pub function: Option<FuncId>,
    /// For captured shadows: the binding in the enclosing function this
    /// local is copied from at closure-construction time.
    pub closure_source: Option<SymId>,
}

/// Branch target inside one function.
#[derive(Debug)]
pub struct Label {
    defined: bool,
    offset: usize,
}

#[derive(Debug, Clone, Copy)]
enum FixupTarget {
    Label(LabelId),
    Function(FuncId),
    Symbol(SymId),
}

/// Edge recorded for reachability: either a lifted function used directly
/// or a function-kind symbol (which may still be a forward reference when
/// the edge is recorded).
#[derive(Debug, Clone, Copy)]
enum RefTarget {
    Function(FuncId),
    Symbol(SymId),
}

#[derive(Debug)]
pub struct Function {
    pub name: Option<String>,
    pub num_params: usize,
    pub num_locals: usize,
    /// User instructions; the prologue is prepended at link time.
    pub instructions: Vec<u32>,
    pub prologue: Vec<u32>,
    scopes: Vec<HashMap<String, SymId>>,
    /// Shadow locals filled from the closure environment list, in capture
    /// order (which is also environment-list order).
    pub free_variables: Vec<SymId>,
    pub enclosing: Option<FuncId>,
    fixups: Vec<(usize, FixupTarget)>,
    pub base_address: usize,
    referenced: bool,
    referenced_funcs: Vec<RefTarget>,
    /// Points at the first user instruction; self tail calls branch here,
    /// past the prologue.
    entry_label: LabelId,
}

#[derive(Debug)]
pub struct CodeGen {
    pub(crate) symbols: Vec<Symbol>,
    labels: Vec<Label>,
    pub(crate) functions: Vec<Function>,
    /// Emission order; slot 0 is the implicit main function.
    pub(crate) function_list: Vec<FuncId>,
    pub(crate) globals: HashMap<String, SymId>,
    next_global_slot: i32,
    /// Live functions in image order, valid after [`CodeGen::link`].
    pub(crate) live: Vec<FuncId>,
    current: FuncId,
    break_stack: Vec<LabelId>,
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGen {
    pub fn new() -> Self {
        let mut codegen = CodeGen {
            symbols: Vec::new(),
            labels: Vec::new(),
            functions: Vec::new(),
            function_list: Vec::new(),
            globals: HashMap::new(),
            next_global_slot: 0,
            live: Vec::new(),
            current: 0,
            break_stack: Vec::new(),
        };

        let main = codegen.new_function(None, None);
        codegen.functions[main].referenced = true;
        codegen.function_list.push(main);
        codegen.current = main;

        // Slots 0 and 1 are fixed by the closure-call convention: the heap
        // base pointer and the closure environment scratch slot. Both are
        // written by generated code, never by user assignment.
        let heapstart = codegen.define_global("$heapstart");
        codegen.symbols[heapstart].initialized = true;
        let closure = codegen.define_global("$closure");
        codegen.symbols[closure].initialized = true;

        codegen
    }

    /// Total number of allocated global slots.
    pub fn global_slot_count(&self) -> i32 {
        self.next_global_slot
    }

    // ------------------------------------------------------------------
    // Arenas and symbol management
    // ------------------------------------------------------------------

    fn new_function(&mut self, name: Option<&str>, enclosing: Option<FuncId>) -> FuncId {
        // The entry label is defined up front: offset 0 of the (still
        // empty) user instruction list.
        let entry_label = self.labels.len();
        self.labels.push(Label {
            defined: true,
            offset: 0,
        });

        let id = self.functions.len();
        self.functions.push(Function {
            name: name.map(str::to_string),
            num_params: 0,
            num_locals: 0,
            instructions: Vec::new(),
            prologue: Vec::new(),
            scopes: vec![HashMap::new()],
            free_variables: Vec::new(),
            enclosing,
            fixups: Vec::new(),
            base_address: 0,
            referenced: false,
            referenced_funcs: Vec::new(),
            entry_label,
        });
        id
    }

    fn define_global(&mut self, name: &str) -> SymId {
        let id = self.symbols.len();
        self.symbols.push(Symbol {
            name: name.to_string(),
            kind: SymbolKind::Global,
            index: self.next_global_slot,
            initialized: false,
            function: None,
            closure_source: None,
        });
        self.next_global_slot += 1;
        self.globals.insert(name.to_string(), id);
        id
    }

    /// Allocate a frame slot below the two reserved by the call convention.
    fn allocate_local(&mut self, fid: FuncId) -> i32 {
        let index = -((self.functions[fid].num_locals as i32) + 2);
        self.functions[fid].num_locals += 1;
        index
    }

    /// Create a local binding in the innermost scope of `fid`.
    fn create_local(&mut self, fid: FuncId, name: &str, index: i32) -> SymId {
        let id = self.symbols.len();
        self.symbols.push(Symbol {
            name: name.to_string(),
            kind: SymbolKind::Local,
            index,
            initialized: false,
            function: None,
            closure_source: None,
        });
        if let Some(scope) = self.functions[fid].scopes.last_mut() {
            scope.insert(name.to_string(), id);
        }
        id
    }

    fn find_in_scopes(&self, fid: FuncId, name: &str) -> Option<SymId> {
        self.functions[fid]
            .scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    /// Resolve a name at the current site.
    ///
    /// Order: the current function's scopes, then enclosing functions
    /// (capturing a free variable through shadow locals in every function
    /// between the binding and the use), then globals. An unknown name
    /// implicitly allocates a global slot; if nothing ever initializes it,
    /// linking fails.
    fn resolve(&mut self, name: &str) -> SymId {
        if let Some(id) = self.find_in_scopes(self.current, name) {
            return id;
        }

        // Walk outward. `hops` collects the functions that need a shadow
        // local if the name turns out to live in an enclosing frame.
        let mut hops = vec![self.current];
        let mut walk = self.functions[self.current].enclosing;
        while let Some(fid) = walk {
            if let Some(found) = self.find_in_scopes(fid, name) {
                let mut source = found;
                for &inner in hops.iter().rev() {
                    let index = self.allocate_local(inner);
                    let shadow = self.symbols.len();
                    self.symbols.push(Symbol {
                        name: name.to_string(),
                        kind: SymbolKind::Local,
                        index,
                        initialized: false,
                        function: None,
                        closure_source: Some(source),
                    });
                    // Register in the function-entry scope so later
                    // references reuse the same shadow.
                    self.functions[inner].scopes[0].insert(name.to_string(), shadow);
                    self.functions[inner].free_variables.push(shadow);
                    source = shadow;
                }
                return source;
            }
            hops.push(fid);
            walk = self.functions[fid].enclosing;
        }

        if let Some(&id) = self.globals.get(name) {
            return id;
        }
        self.define_global(name)
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn emit(&mut self, op: u32, param: i32) -> Result<(), CompileError> {
        let word = encode(op, param)?;
        self.functions[self.current].instructions.push(word);
        Ok(())
    }

    fn new_label(&mut self) -> LabelId {
        self.labels.push(Label {
            defined: false,
            offset: 0,
        });
        self.labels.len() - 1
    }

    fn emit_label(&mut self, label: LabelId) -> Result<(), CompileError> {
        if self.labels[label].defined {
            return Err(CompileError::codegen("internal error: label defined twice"));
        }
        self.labels[label].defined = true;
        self.labels[label].offset = self.functions[self.current].instructions.len();
        Ok(())
    }

    fn emit_branch(&mut self, op: u32, label: LabelId) -> Result<(), CompileError> {
        self.emit(op, 0)?;
        let function = &mut self.functions[self.current];
        let at = function.instructions.len() - 1;
        function.fixups.push((at, FixupTarget::Label(label)));
        Ok(())
    }

    /// `PUSH 0` whose immediate is patched to the target's address or slot.
    fn emit_push_fixup(&mut self, target: FixupTarget) -> Result<(), CompileError> {
        self.emit(OP_PUSH, 0)?;
        let function = &mut self.functions[self.current];
        let at = function.instructions.len() - 1;
        function.fixups.push((at, target));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    /// Compile a whole post-expansion program into the function arena.
    /// Top-level expressions accumulate in the implicit main function;
    /// `function` forms define globals.
    pub fn compile_program(&mut self, program: &[SExpr]) -> Result<(), CompileError> {
        // $heapstart is patched to the global count once it is known; the
        // first PUSH is the value, the second the (fixed-up) slot address.
        let heapstart = self.globals["$heapstart"];
        self.emit(OP_PUSH, 0)?;
        self.emit_push_fixup(FixupTarget::Symbol(heapstart))?;
        self.emit(OP_STORE, 0)?;
        self.emit(OP_POP, 0)?;

        // Register every named function up front so forward references
        // compile as direct calls instead of loads through a global.
        for expr in program {
            if let Some(name) = function_def_name(expr) {
                if self.globals.contains_key(name) {
                    return Err(CompileError::codegen(format!("redefinition of '{}'", name)));
                }
                let id = self.symbols.len();
                self.symbols.push(Symbol {
                    name: name.to_string(),
                    kind: SymbolKind::Function,
                    index: -1,
                    initialized: true,
                    function: None,
                    closure_source: None,
                });
                self.globals.insert(name.to_string(), id);
            }
        }

        for expr in program {
            if function_def_name(expr).is_some() {
                self.compile_function(expr)?;
            } else {
                self.compile_expression(expr, false)?;
                self.emit(OP_POP, 0)?;
            }
        }

        // Spin if execution falls off the end of the program.
        let forever = self.new_label();
        self.emit_label(forever)?;
        self.emit_branch(OP_GOTO, forever)?;

        debug!(
            functions = self.function_list.len(),
            globals = self.next_global_slot,
            "program compiled"
        );
        Ok(())
    }

    /// Compile a top-level `(function name (params…) body…)` definition.
    fn compile_function(&mut self, expr: &SExpr) -> Result<(), CompileError> {
        let items = expr.as_list().unwrap_or_default();
        let name = items[1].as_symbol().unwrap_or_default();
        let params = items
            .get(2)
            .and_then(|p| p.as_list())
            .ok_or_else(|| CompileError::codegen(format!("malformed definition of '{}'", name)))?;
        if items.len() < 4 {
            return Err(CompileError::codegen(format!("function '{}' has no body", name)));
        }

        let sym = self.globals[name];
        if self.symbols[sym].kind != SymbolKind::Function {
            return Err(CompileError::codegen(format!(
                "global variable '{}' redefined as function",
                name
            )));
        }

        let fid = self.compile_function_body(Some(name), params, &items[3..])?;
        self.symbols[sym].function = Some(fid);
        Ok(())
    }

    /// Compile a parameter list and body into a fresh function, leaving
    /// the enclosing function current again on exit.
    fn compile_function_body(
        &mut self,
        name: Option<&str>,
        params: &[SExpr],
        body: &[SExpr],
    ) -> Result<FuncId, CompileError> {
        let outer = self.current;
        let fid = self.new_function(name, Some(outer));
        self.current = fid;

        for (i, param) in params.iter().enumerate() {
            let pname = param.as_symbol().ok_or_else(|| {
                CompileError::codegen("function parameters must be symbols".to_string())
            })?;
            self.create_local(fid, pname, (i + 1) as i32);
        }
        self.functions[fid].num_params = params.len();

        self.compile_sequence(body, true)?;
        self.emit(OP_RETURN, 0)?;

        self.current = outer;
        self.function_list.push(fid);
        Ok(fid)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Compile one expression. Every expression leaves exactly one value
    /// on the stack. `tail` marks a position where nothing in this
    /// function runs afterwards, enabling self-tail-call elimination.
    pub fn compile_expression(&mut self, expr: &SExpr, tail: bool) -> Result<(), CompileError> {
        match expr {
            SExpr::Integer(value) => self.emit(OP_PUSH, *value),
            SExpr::Str(s) => self.compile_string(s),
            SExpr::Symbol(name) => self.compile_identifier(name),
            SExpr::List(items) if items.is_empty() => self.emit(OP_PUSH, 0),
            SExpr::List(_) => self.compile_combination(expr, tail),
        }
    }

    fn compile_combination(&mut self, expr: &SExpr, tail: bool) -> Result<(), CompileError> {
        let items = expr.as_list().unwrap_or_default();
        let head = match items[0].as_symbol() {
            Some(name) => name,
            None => return self.compile_function_call(expr, tail),
        };

        if BUILTIN_FUNCTIONS.contains_key(head) {
            return self.compile_builtin(items);
        }

        match head {
            "function" => self.compile_anonymous_function(items),
            "begin" => self.compile_sequence(&items[1..], tail),
            "while" => self.compile_while(items),
            "break" => self.compile_break(items),
            "if" => self.compile_if(items, tail),
            "assign" => self.compile_assign(items),
            "quote" => {
                if items.len() != 2 {
                    return Err(CompileError::codegen("wrong number of arguments for 'quote'"));
                }
                self.compile_quote(&items[1])
            }
            "let" => self.compile_let(items, tail),
            "getbp" => self.emit(OP_GETBP, 0),
            "and" | "or" | "not" => self.compile_boolean_expression(expr),
            _ => self.compile_function_call(expr, tail),
        }
    }

    fn compile_identifier(&mut self, name: &str) -> Result<(), CompileError> {
        let sym = self.resolve(name);
        self.compile_resolved_identifier(sym)
    }

    fn compile_resolved_identifier(&mut self, sym: SymId) -> Result<(), CompileError> {
        match self.symbols[sym].kind {
            SymbolKind::Local => {
                let index = self.symbols[sym].index;
                self.emit(OP_GETLOCAL, index)
            }
            SymbolKind::Global => {
                self.emit_push_fixup(FixupTarget::Symbol(sym))?;
                self.emit(OP_LOAD, 0)
            }
            SymbolKind::Function => {
                self.functions[self.current]
                    .referenced_funcs
                    .push(RefTarget::Symbol(sym));
                self.emit_push_fixup(FixupTarget::Symbol(sym))
            }
        }
    }

    /// Strings have no native representation; they compile to a chain of
    /// `cons` calls over character codes, terminated by nil.
    fn compile_string(&mut self, s: &str) -> Result<(), CompileError> {
        self.emit(OP_PUSH, 0)?;
        let chars: Vec<char> = s.chars().collect();
        for &c in chars.iter().rev() {
            self.emit(OP_PUSH, c as i32)?;
            self.emit_cons_call()?;
        }
        Ok(())
    }

    /// `cons` is not an instruction; call the runtime library.
    fn emit_cons_call(&mut self) -> Result<(), CompileError> {
        self.compile_identifier("cons")?;
        self.emit(OP_CALL, 0)?;
        self.emit(OP_CLEANUP, 2)
    }

    fn compile_quote(&mut self, expr: &SExpr) -> Result<(), CompileError> {
        match expr {
            SExpr::Integer(value) => self.emit(OP_PUSH, *value),
            SExpr::Symbol(name) => self.compile_string(name),
            SExpr::Str(s) => self.compile_string(s),
            SExpr::List(items) if items.is_empty() => self.emit(OP_PUSH, 0),
            SExpr::List(items) if items.len() == 3 && items[1].as_symbol() == Some(".") => {
                // Dotted pair: one cons cell.
                self.compile_quote(&items[2])?;
                self.compile_quote(&items[0])?;
                self.emit_cons_call()
            }
            SExpr::List(items) => self.compile_quoted_list(items),
        }
    }

    fn compile_quoted_list(&mut self, items: &[SExpr]) -> Result<(), CompileError> {
        // Build the tail first so only one temporary list exists at a time.
        if items.len() == 1 {
            self.emit(OP_PUSH, 0)?;
        } else {
            self.compile_quoted_list(&items[1..])?;
        }
        self.compile_quote(&items[0])?;
        self.emit_cons_call()
    }

    /// `(assign name value)` stores and leaves the value on the stack.
    fn compile_assign(&mut self, items: &[SExpr]) -> Result<(), CompileError> {
        if items.len() != 3 {
            return Err(CompileError::codegen("wrong number of arguments for 'assign'"));
        }
        let name = items[1]
            .as_symbol()
            .ok_or_else(|| CompileError::codegen("assign target must be a symbol"))?
            .to_string();
        let sym = self.resolve(&name);
        match self.symbols[sym].kind {
            SymbolKind::Local => {
                self.compile_expression(&items[2], false)?;
                let index = self.symbols[sym].index;
                self.emit(OP_SETLOCAL, index)
            }
            SymbolKind::Global => {
                self.compile_expression(&items[2], false)?;
                self.emit_push_fixup(FixupTarget::Symbol(sym))?;
                self.emit(OP_STORE, 0)?;
                self.symbols[sym].initialized = true;
                Ok(())
            }
            SymbolKind::Function => Err(CompileError::codegen(format!(
                "cannot assign function '{}'",
                name
            ))),
        }
    }

    fn compile_builtin(&mut self, items: &[SExpr]) -> Result<(), CompileError> {
        let name = items[0].as_symbol().unwrap_or_default();
        let (op, nargs) = BUILTIN_FUNCTIONS[name];
        if items.len() - 1 != nargs {
            return Err(CompileError::codegen(format!(
                "wrong number of arguments for '{}'",
                name
            )));
        }

        // lt/lte evaluate in source order and use the opposite comparison.
        if name == "<" || name == "<=" {
            self.compile_expression(&items[1], false)?;
            self.compile_expression(&items[2], false)?;
            return self.emit(op, 0);
        }

        if nargs == 2 {
            self.compile_expression(&items[2], false)?;
        }
        self.compile_expression(&items[1], false)?;
        self.emit(op, 0)
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    /// `and`/`or`/`not` used for value: run the predicate network, then
    /// push 1 or 0.
    fn compile_boolean_expression(&mut self, expr: &SExpr) -> Result<(), CompileError> {
        let false_label = self.new_label();
        let done_label = self.new_label();
        self.compile_predicate(expr, false_label)?;
        self.emit(OP_PUSH, 1)?;
        self.emit_branch(OP_GOTO, done_label)?;
        self.emit_label(false_label)?;
        self.emit(OP_PUSH, 0)?;
        self.emit_label(done_label)
    }

    /// Compile a condition as branches, short-circuiting where possible.
    /// Leaves nothing on the stack; falls through on true, jumps to
    /// `false_target` on false.
    fn compile_predicate(&mut self, expr: &SExpr, false_target: LabelId) -> Result<(), CompileError> {
        if let Some(items) = expr.as_list() {
            match expr.head_symbol() {
                Some("and") => {
                    if items.len() < 3 {
                        return Err(CompileError::codegen("wrong number of arguments for 'and'"));
                    }
                    for term in &items[1..] {
                        self.compile_predicate(term, false_target)?;
                    }
                    return Ok(());
                }
                Some("or") => {
                    if items.len() < 3 {
                        return Err(CompileError::codegen("wrong number of arguments for 'or'"));
                    }
                    let true_target = self.new_label();
                    for term in &items[1..items.len() - 1] {
                        let test_next = self.new_label();
                        self.compile_predicate(term, test_next)?;
                        self.emit_branch(OP_GOTO, true_target)?;
                        self.emit_label(test_next)?;
                    }
                    self.compile_predicate(&items[items.len() - 1], false_target)?;
                    return self.emit_label(true_target);
                }
                Some("not") => {
                    if items.len() != 2 {
                        return Err(CompileError::codegen("wrong number of arguments for 'not'"));
                    }
                    let skip = self.new_label();
                    self.compile_predicate(&items[1], skip)?;
                    self.emit_branch(OP_GOTO, false_target)?;
                    return self.emit_label(skip);
                }
                _ => {}
            }
        }

        self.compile_expression(expr, false)?;
        self.emit_branch(OP_BFALSE, false_target)
    }

    /// `(if cond then [else])`; a missing else arm yields 0.
    fn compile_if(&mut self, items: &[SExpr], tail: bool) -> Result<(), CompileError> {
        if items.len() != 3 && items.len() != 4 {
            return Err(CompileError::codegen("wrong number of arguments for 'if'"));
        }
        let false_label = self.new_label();
        let done_label = self.new_label();

        self.compile_predicate(&items[1], false_label)?;
        self.compile_expression(&items[2], tail)?;
        self.emit_branch(OP_GOTO, done_label)?;
        self.emit_label(false_label)?;
        if items.len() > 3 {
            self.compile_expression(&items[3], tail)?;
        } else {
            self.emit(OP_PUSH, 0)?;
        }
        self.emit_label(done_label)
    }

    /// `(while cond body…)`. Normal exit yields 0; `break` supplies the
    /// loop's value instead. Tail position does not propagate into the
    /// body.
    fn compile_while(&mut self, items: &[SExpr]) -> Result<(), CompileError> {
        if items.len() < 2 {
            return Err(CompileError::codegen("'while' needs a condition"));
        }
        let top = self.new_label();
        let bottom = self.new_label();
        let break_label = self.new_label();

        self.break_stack.push(break_label);
        self.emit_label(top)?;
        self.compile_predicate(&items[1], bottom)?;
        self.compile_sequence(&items[2..], false)?;
        self.emit(OP_POP, 0)?;
        self.emit_branch(OP_GOTO, top)?;
        self.emit_label(bottom)?;
        self.break_stack.pop();
        self.emit(OP_PUSH, 0)?;
        self.emit_label(break_label)
    }

    /// `(break [value])` jumps to the innermost loop's break label.
    fn compile_break(&mut self, items: &[SExpr]) -> Result<(), CompileError> {
        let label = *self
            .break_stack
            .last()
            .ok_or_else(|| CompileError::codegen("break outside of a loop"))?;
        if items.len() > 1 {
            self.compile_expression(&items[1], false)?;
        } else {
            self.emit(OP_PUSH, 0)?;
        }
        self.emit_branch(OP_GOTO, label)
    }

    /// A sequence of expressions; intermediate values are popped, the last
    /// value is the sequence's value.
    fn compile_sequence(&mut self, exprs: &[SExpr], tail: bool) -> Result<(), CompileError> {
        if exprs.is_empty() {
            return self.emit(OP_PUSH, 0);
        }
        for (i, expr) in exprs.iter().enumerate() {
            if i > 0 {
                self.emit(OP_POP, 0)?;
            }
            self.compile_expression(expr, tail && i == exprs.len() - 1)?;
        }
        Ok(())
    }

    /// `(let ((var value)…) body…)`.
    fn compile_let(&mut self, items: &[SExpr], tail: bool) -> Result<(), CompileError> {
        let bindings = items
            .get(1)
            .and_then(|b| b.as_list())
            .ok_or_else(|| CompileError::codegen("malformed 'let' binding list"))?;

        self.functions[self.current].scopes.push(HashMap::new());

        for binding in bindings {
            let pair = binding.as_list().unwrap_or_default();
            let name = match pair {
                [SExpr::Symbol(name), _] => name.clone(),
                _ => return Err(CompileError::codegen("malformed 'let' binding")),
            };
            let index = self.allocate_local(self.current);
            self.create_local(self.current, &name, index);
            self.compile_expression(&pair[1], false)?;
            self.emit(OP_SETLOCAL, index)?;
            self.emit(OP_POP, 0)?;
        }

        self.compile_sequence(&items[2..], tail)?;
        self.functions[self.current].scopes.pop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions, closures, calls
    // ------------------------------------------------------------------

    /// `(function (params…) body…)` or `(function name (params…) body…)`
    /// in expression position: lift the body to a top-level function and
    /// push a tagged function or closure value.
    fn compile_anonymous_function(&mut self, items: &[SExpr]) -> Result<(), CompileError> {
        let (name, params, body) = match items {
            [_, SExpr::List(params), body @ ..] if !body.is_empty() => (None, params, body),
            [_, SExpr::Symbol(name), SExpr::List(params), body @ ..] if !body.is_empty() => {
                (Some(name.as_str()), params, body)
            }
            _ => return Err(CompileError::codegen("malformed 'function' form")),
        };

        let fid = self.compile_function_body(name, params, body)?;
        self.functions[self.current]
            .referenced_funcs
            .push(RefTarget::Function(fid));

        let free_vars = self.functions[fid].free_variables.clone();
        if free_vars.is_empty() {
            // A bare function value: tagged code address.
            self.emit(OP_PUSH, TAG_FUNCTION)?;
            self.emit_push_fixup(FixupTarget::Function(fid))?;
            self.emit(OP_SETTAG, 0)
        } else {
            // A closure: cons the code address onto the captured-value
            // list and tag the pair.
            self.emit(OP_PUSH, TAG_CLOSURE)?;
            self.emit(OP_PUSH, 0)?;
            for &var in free_vars.iter().rev() {
                let source = self.symbols[var].closure_source.ok_or_else(|| {
                    CompileError::codegen("internal error: free variable without a source")
                })?;
                let index = self.symbols[source].index;
                self.emit(OP_GETLOCAL, index)?;
                self.emit_cons_call()?;
            }
            self.emit_push_fixup(FixupTarget::Function(fid))?;
            self.emit_cons_call()?;
            self.emit(OP_SETTAG, 0)
        }
    }

    fn compile_function_call(&mut self, expr: &SExpr, tail: bool) -> Result<(), CompileError> {
        let items = expr.as_list().unwrap_or_default();
        if matches!(items[0], SExpr::Integer(_)) {
            return Err(CompileError::codegen("cannot use an integer as a function"));
        }
        let argc = items.len() - 1;

        // A self call in tail position writes the arguments back into the
        // parameter slots and branches to the entry point instead of
        // growing the stack.
        if tail {
            if let Some(name) = items[0].as_symbol() {
                let current = &self.functions[self.current];
                if current.name.as_deref() == Some(name) && current.num_params == argc {
                    for arg in items[1..].iter().rev() {
                        self.compile_expression(arg, false)?;
                    }
                    for slot in 1..=argc {
                        self.emit(OP_SETLOCAL, slot as i32)?;
                        self.emit(OP_POP, 0)?;
                    }
                    let entry = self.functions[self.current].entry_label;
                    return self.emit_branch(OP_GOTO, entry);
                }
            }
        }

        for arg in items[1..].iter().rev() {
            self.compile_expression(arg, false)?;
        }

        // Statically known functions are called directly; anything else is
        // a computed callee that may be a closure.
        let static_target = match items[0].as_symbol() {
            Some(name) => {
                let sym = self.resolve(name);
                if self.symbols[sym].kind == SymbolKind::Function {
                    self.functions[self.current]
                        .referenced_funcs
                        .push(RefTarget::Symbol(sym));
                    self.emit_push_fixup(FixupTarget::Symbol(sym))?;
                    true
                } else {
                    self.compile_resolved_identifier(sym)?;
                    false
                }
            }
            None => {
                self.compile_expression(&items[0], false)?;
                false
            }
        };

        if !static_target {
            // If the callee is a closure, stash its environment list in
            // the $closure slot and call through the code address in the
            // first cell.
            let not_closure = self.new_label();
            self.emit(OP_DUP, 0)?;
            self.emit(OP_GETTAG, 0)?;
            self.emit(OP_PUSH, TAG_CLOSURE)?;
            self.emit(OP_EQ, 0)?;
            self.emit_branch(OP_BFALSE, not_closure)?;
            self.emit(OP_DUP, 0)?;
            self.emit(OP_REST, 0)?;
            let closure = self.globals["$closure"];
            self.emit_push_fixup(FixupTarget::Symbol(closure))?;
            self.emit(OP_STORE, 0)?;
            self.emit(OP_POP, 0)?;
            self.emit(OP_LOAD, 0)?;
            self.emit_label(not_closure)?;
        }

        self.emit(OP_CALL, 0)?;
        if argc > 0 {
            self.emit(OP_CLEANUP, argc as i32)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Layout, fixups, image
    // ------------------------------------------------------------------

    /// Finish compilation: strip dead functions, verify globals, lay out
    /// the live functions, patch every fixup, and return the flat
    /// instruction stream.
    pub fn link(&mut self) -> Result<Vec<u32>, CompileError> {
        self.mark_referenced();
        self.live = self
            .function_list
            .iter()
            .copied()
            .filter(|&fid| self.functions[fid].referenced)
            .collect();
        debug!(
            live = self.live.len(),
            dropped = self.function_list.len() - self.live.len(),
            "reachability computed"
        );

        self.check_globals_initialized()?;

        // Prologues first; base addresses depend on their sizes.
        for i in 0..self.live.len() {
            let fid = self.live[i];
            let prologue = self.build_prologue(fid)?;
            self.functions[fid].prologue = prologue;
        }

        let mut address = 0;
        for &fid in &self.live {
            self.functions[fid].base_address = address;
            address += self.functions[fid].prologue.len() + self.functions[fid].instructions.len();
        }

        for i in 0..self.live.len() {
            self.apply_fixups(self.live[i])?;
        }

        // The first PUSH in main is the heap base: one past the globals.
        let main = self.function_list[0];
        let first = self.functions[main].instructions[0];
        self.functions[main].instructions[0] = patch(first, self.next_global_slot);

        let mut image = Vec::with_capacity(address);
        for &fid in &self.live {
            image.extend_from_slice(&self.functions[fid].prologue);
            image.extend_from_slice(&self.functions[fid].instructions);
        }
        Ok(image)
    }

    /// Propagate reachability from main through recorded references.
    fn mark_referenced(&mut self) {
        let mut worklist = vec![self.function_list[0]];
        while let Some(fid) = worklist.pop() {
            let targets = self.functions[fid].referenced_funcs.clone();
            for target in targets {
                let callee = match target {
                    RefTarget::Function(id) => Some(id),
                    RefTarget::Symbol(sym) => self.symbols[sym].function,
                };
                if let Some(id) = callee {
                    if !self.functions[id].referenced {
                        self.functions[id].referenced = true;
                        worklist.push(id);
                    }
                }
            }
        }
    }

    /// Every implicitly created global must have been the target of an
    /// `assign` or a function definition.
    fn check_globals_initialized(&self) -> Result<(), CompileError> {
        let mut missing: Vec<&str> = self
            .globals
            .values()
            .map(|&sym| &self.symbols[sym])
            .filter(|sym| sym.kind == SymbolKind::Global && !sym.initialized)
            .map(|sym| sym.name.as_str())
            .collect();
        missing.sort_unstable();
        match missing.first() {
            Some(name) => Err(CompileError::codegen(format!(
                "global variable '{}' is never initialized",
                name
            ))),
            None => Ok(()),
        }
    }

    /// Reserve the frame and, for functions with captured variables,
    /// unpack the environment list out of the $closure slot.
    fn build_prologue(&self, fid: FuncId) -> Result<Vec<u32>, CompileError> {
        let function = &self.functions[fid];
        let mut prologue = vec![encode(OP_RESERVE, (function.num_locals as i32) + 1)?];
        if !function.free_variables.is_empty() {
            prologue.push(encode(OP_PUSH, 1)?); // $closure slot
            prologue.push(encode(OP_LOAD, 0)?);
            for &var in &function.free_variables {
                prologue.push(encode(OP_DUP, 0)?);
                prologue.push(encode(OP_LOAD, 0)?);
                prologue.push(encode(OP_SETLOCAL, self.symbols[var].index)?);
                prologue.push(encode(OP_POP, 0)?);
                prologue.push(encode(OP_REST, 0)?);
            }
            prologue.push(encode(OP_POP, 0)?);
        }
        Ok(prologue)
    }

    fn apply_fixups(&mut self, fid: FuncId) -> Result<(), CompileError> {
        let fixups = self.functions[fid].fixups.clone();
        for (at, target) in fixups {
            let value = match target {
                FixupTarget::Label(label) => {
                    let label = &self.labels[label];
                    if !label.defined {
                        return Err(CompileError::codegen("internal error: undefined label"));
                    }
                    let function = &self.functions[fid];
                    (function.base_address + function.prologue.len() + label.offset) as i32
                }
                FixupTarget::Function(id) => self.functions[id].base_address as i32,
                FixupTarget::Symbol(sym) => match self.symbols[sym].kind {
                    SymbolKind::Global => self.symbols[sym].index,
                    SymbolKind::Function => {
                        let id = self.symbols[sym].function.ok_or_else(|| {
                            CompileError::codegen(format!(
                                "internal error: function '{}' was never defined",
                                self.symbols[sym].name
                            ))
                        })?;
                        self.functions[id].base_address as i32
                    }
                    SymbolKind::Local => {
                        return Err(CompileError::codegen("internal error: fixup to a local"));
                    }
                },
            };
            let word = self.functions[fid].instructions[at];
            self.functions[fid].instructions[at] = patch(word, value);
        }
        Ok(())
    }
}

/// The name of a top-level `(function name …)` definition, if this form is
/// one. Anonymous `(function (params) …)` forms do not count.
fn function_def_name(expr: &SExpr) -> Option<&str> {
    let items = expr.as_list()?;
    if items.len() >= 2 && items[0].as_symbol() == Some("function") {
        items[1].as_symbol()
    } else {
        None
    }
}
