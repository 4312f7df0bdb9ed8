use clap::Parser;
use std::io::{BufRead, Write};
use tracing::{debug, trace, warn};

/// Growable LIFO stack; the top is the most recently pushed element.
#[derive(Debug, Clone)]
pub struct Stack<T> {
    elements: Vec<T>,
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stack<T> {
    pub fn new() -> Self {
        Stack {
            elements: Vec::new(),
        }
    }
    pub fn len(&self) -> usize {
        self.elements.len()
    }
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
    pub fn clear(&mut self) {
        self.elements.clear()
    }
    pub fn push(&mut self, val: T) {
        self.elements.push(val)
    }
    #[must_use]
    pub fn pop(&mut self) -> Option<T> {
        self.elements.pop()
    }
    pub fn last(&self) -> Option<&T> {
        self.elements.last()
    }
    /// Iterate from the bottom of the stack to the top.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.elements.iter()
    }
    pub fn as_slice(&self) -> &[T] {
        &self.elements
    }
}

impl<T: Clone> Stack<T> {
    /// Push all of `vals`, so that the last element of `vals` ends up on top.
    pub fn extend_from_slice(&mut self, vals: &[T]) {
        self.elements.extend_from_slice(vals)
    }
}

impl<'a, T> IntoIterator for &'a Stack<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[test]
fn test_stack_lifo() {
    let mut stack = Stack::new();
    assert!(stack.is_empty());
    stack.push(1.0);
    stack.push(2.0);
    stack.extend_from_slice(&[3.0, 4.0]);
    assert_eq!(stack.len(), 4);
    assert_eq!(stack.last(), Some(&4.0));
    assert_eq!(stack.pop(), Some(4.0));
    assert_eq!(stack.pop(), Some(3.0));
    assert_eq!(stack.pop(), Some(2.0));
    assert_eq!(stack.iter().copied().collect::<Vec<f64>>(), vec![1.0]);
    assert_eq!(stack.pop(), Some(1.0));
    assert_eq!(stack.pop(), None);
    assert!(stack.last().is_none());
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ForthError {
    #[error("Data stack underflow")]
    DataStackUnderflow,
    #[error("Call stack underflow")]
    CallStackUnderflow,
    #[error("Unknown word `{0}`")]
    UnknownWord(String),
    /// `;` outside of a colon definition.
    #[error("`;` used while not compiling")]
    NotCompiling,
    /// `;` reached before the definition was given a name.
    #[error("definition has no name")]
    UnnamedDefinition,
    #[error("dictionary is empty")]
    NoLatestEntry,
}

pub type BuiltinFn = fn(&mut ForthMachine) -> Result<(), ForthError>;

/// Position of an entry in its `Dictionary`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

/// What a `CallCell` does when the evaluation loop pops it.
#[derive(Copy, Clone, Debug)]
pub enum Call {
    /// Push the value on the data stack.
    Literal(f64),
    /// Run a builtin.
    Primitive(BuiltinFn),
    /// Splice the body of a compound entry onto the call stack.
    Word(EntryId),
}

/// Resolved, directly executable unit of work.
#[derive(Copy, Clone, Debug)]
pub struct CallCell {
    pub call: Call,
    /// Copied from the entry at resolution time, literals are never immediate.
    pub immediate: bool,
}

impl CallCell {
    pub fn literal(val: f64) -> Self {
        CallCell {
            call: Call::Literal(val),
            immediate: false,
        }
    }
}

#[derive(Debug)]
enum Definition {
    Builtin(BuiltinFn),
    /// Cells in call stack order, i.e. the first cell to run is the last one.
    Compound(Vec<CallCell>),
}

/// Entry in a Forth dictionary
#[derive(Debug)]
pub struct DictEntry {
    name: String,
    definition: Definition,
    immediate: bool,
    prev: Option<EntryId>,
}

impl DictEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prev(&self) -> Option<EntryId> {
        self.prev
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    // Return true if now immediate.
    pub fn toggle_immediate(&mut self) -> bool {
        self.immediate = !self.immediate;
        self.immediate
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self.definition, Definition::Builtin(_))
    }

    /// Compiled body in call stack order; empty for builtins.
    pub fn body(&self) -> &[CallCell] {
        match &self.definition {
            Definition::Builtin(_) => &[],
            Definition::Compound(body) => body,
        }
    }

    fn call_cell(&self, id: EntryId) -> CallCell {
        let call = match self.definition {
            Definition::Builtin(fun) => Call::Primitive(fun),
            Definition::Compound(_) => Call::Word(id),
        };
        CallCell {
            call,
            immediate: self.immediate,
        }
    }
}

/// Append-only arena of dictionary entries.
///
/// Entries are chained newest-first through `prev`, so an older entry with the
/// same name stays reachable by the cells that were compiled against it.
#[derive(Debug, Default)]
pub struct Dictionary {
    entries: Vec<DictEntry>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest_id(&self) -> Option<EntryId> {
        self.entries.len().checked_sub(1).map(EntryId)
    }

    pub fn latest_entry(&self) -> Option<&DictEntry> {
        self.entries.last()
    }

    pub fn latest_entry_mut(&mut self) -> Option<&mut DictEntry> {
        self.entries.last_mut()
    }

    /// Ids are only handed out by this dictionary and entries are never
    /// removed, so every id refers to a live entry.
    pub fn entry(&self, id: EntryId) -> &DictEntry {
        &self.entries[id.0]
    }

    fn push_entry(&mut self, name: String, definition: Definition, immediate: bool) -> EntryId {
        let prev = self.latest_id();
        self.entries.push(DictEntry {
            name,
            definition,
            immediate,
            prev,
        });
        EntryId(self.entries.len() - 1)
    }

    pub fn push_builtin_word(&mut self, name: &str, immediate: bool, fun: BuiltinFn) -> EntryId {
        self.push_entry(name.to_string(), Definition::Builtin(fun), immediate)
    }

    /// `body` must already be in call stack order.
    pub fn push_compound_word(&mut self, name: String, body: Vec<CallCell>) -> EntryId {
        self.push_entry(name, Definition::Compound(body), false)
    }

    /// Walk from the latest entry back through `prev` links.
    pub fn entries(&self) -> impl Iterator<Item = (EntryId, &DictEntry)> + '_ {
        let mut next = self.latest_id();
        std::iter::from_fn(move || {
            let id = next?;
            let entry = self.entry(id);
            next = entry.prev();
            Some((id, entry))
        })
    }

    pub fn find_entry(&self, name: &str) -> Option<EntryId> {
        self.entries()
            .find(|(_, entry)| entry.name() == name)
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
fn noop_builtin(_forth: &mut ForthMachine) -> Result<(), ForthError> {
    Ok(())
}

#[test]
fn test_dictionary_find_entry() {
    let mut dict = Dictionary::new();
    assert!(dict.find_entry("DUP").is_none());
    assert!(dict.latest_id().is_none());
    let dup = dict.push_builtin_word("DUP", false, noop_builtin);
    assert_eq!(dict.find_entry("DUP"), Some(dup));
    assert_eq!(dict.latest_id(), Some(dup));
    let swap = dict.push_builtin_word("SWAP", false, noop_builtin);
    assert_eq!(dict.find_entry("DUP"), Some(dup));
    assert_eq!(dict.entry(swap).prev(), Some(dup));
    let new_dup = dict.push_compound_word("DUP".to_string(), vec![CallCell::literal(1.0)]);
    assert_eq!(dict.find_entry("DUP"), Some(new_dup));
    assert_ne!(new_dup, dup);
    assert_eq!(dict.entry(dup).name(), dict.entry(new_dup).name());
    assert!(dict.entry(dup).is_builtin());
    assert!(!dict.entry(new_dup).is_builtin());
    assert!(dict.entry(dup).body().is_empty());
    assert_eq!(dict.entry(new_dup).body().len(), 1);
    let names: Vec<&str> = dict.entries().map(|(_, e)| e.name()).collect();
    assert_eq!(names, ["DUP", "SWAP", "DUP"]);
    assert!(dict.find_entry("dup").is_none());
}

#[test]
fn test_dictionary_toggle_immediate() {
    let mut dict = Dictionary::new();
    assert!(dict.latest_entry_mut().is_none());
    dict.push_builtin_word("X", false, noop_builtin);
    let latest = dict.latest_entry_mut().unwrap();
    assert!(latest.toggle_immediate());
    assert!(latest.is_immediate());
    assert!(!latest.toggle_immediate());
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ForthState {
    Interpret,
    Compile,
}

/// Colon definition under construction.
#[derive(Debug, Default)]
struct CompileBuffer {
    name: Option<String>,
    /// Cells in authoring order; flipped once on commit.
    body: Vec<CallCell>,
}

/// Result of a single evaluation step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Done,
    NotDone,
}

#[derive(Debug)]
pub struct ForthMachine {
    dict: Dictionary,
    data_stack: Stack<f64>,
    call_stack: Stack<CallCell>,
    state: ForthState,
    compile_buffer: CompileBuffer,
    // Word waiting to be resolved, empty when there is none.
    word: String,
    // Dictionary search cursor, `None` when not searching.
    search: Option<EntryId>,
    output: String,
}

impl Default for ForthMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ForthMachine {
    /// Machine with the core words followed by the extended builtins.
    pub fn new() -> Self {
        let mut forth = Self::with_builtins(&CORE_WORDS);
        for (name, immediate, fun) in EXTENDED_WORDS {
            forth.push_builtin_word(name, immediate, fun);
        }
        forth
    }

    /// Machine with only `br`, `:`, `;`, `print` and `+`.
    pub fn core_only() -> Self {
        Self::with_builtins(&CORE_WORDS)
    }

    pub fn with_builtins(words: &[(&str, bool, BuiltinFn)]) -> Self {
        let mut dict = Dictionary::new();
        for (name, immediate, fun) in words {
            dict.push_builtin_word(name, *immediate, *fun);
        }
        Self {
            dict,
            data_stack: Stack::new(),
            call_stack: Stack::new(),
            state: ForthState::Interpret,
            compile_buffer: CompileBuffer::default(),
            word: String::new(),
            search: None,
            output: String::new(),
        }
    }

    pub fn push_builtin_word(&mut self, name: &str, immediate: bool, fun: BuiltinFn) -> EntryId {
        self.dict.push_builtin_word(name, immediate, fun)
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn data_stack(&self) -> &Stack<f64> {
        &self.data_stack
    }

    pub fn data_stack_mut(&mut self) -> &mut Stack<f64> {
        &mut self.data_stack
    }

    pub fn call_stack(&self) -> &Stack<CallCell> {
        &self.call_stack
    }

    pub fn is_compiling(&self) -> bool {
        self.state == ForthState::Compile
    }

    pub fn is_searching(&self) -> bool {
        self.search.is_some()
    }

    /// Name given to the definition being compiled, if any.
    pub fn pending_definition(&self) -> Option<&str> {
        self.compile_buffer.name.as_deref()
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Flip the immediacy of the most recently defined word.
    pub fn toggle_immediate(&mut self) -> Result<bool, ForthError> {
        let entry = self
            .dict
            .latest_entry_mut()
            .ok_or(ForthError::NoLatestEntry)?;
        let immediate = entry.toggle_immediate();
        debug!(name = entry.name(), immediate, "toggled immediacy");
        Ok(immediate)
    }

    /// Drop the definition under construction and leave compile mode.
    ///
    /// Return true if there was a definition to drop.
    pub fn abandon_definition(&mut self) -> bool {
        if self.state != ForthState::Compile {
            return false;
        }
        self.state = ForthState::Interpret;
        let buffer = std::mem::take(&mut self.compile_buffer);
        debug!(
            name = buffer.name.as_deref().unwrap_or(""),
            cells = buffer.body.len(),
            "abandoned definition"
        );
        true
    }

    /// Queue `word` for resolution; it is picked up by the next `step`.
    pub fn feed_word(&mut self, word: &str) {
        self.word.clear();
        self.word.push_str(word);
    }

    /// Feed a single word and step until there is no pending work left.
    ///
    /// Every error is reported on the output as it happens and does not stop
    /// the loop; the first one is returned.
    pub fn interpret_word(&mut self, word: &str) -> Result<(), ForthError> {
        if word.is_empty() {
            return Ok(());
        }
        self.feed_word(word);
        let mut first_err = None;
        loop {
            match self.step() {
                Ok(Step::Done) => break,
                Ok(Step::NotDone) => {}
                Err(e) => {
                    self.report(&e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Interpret each whitespace delimited word of `line`.
    pub fn interpret_line(&mut self, line: &str) -> Result<(), ForthError> {
        let mut first_err = None;
        for word in line.split_whitespace() {
            if let Err(e) = self.interpret_word(word) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Single step execution.
    ///
    /// A search in progress advances by exactly one dictionary entry, so the
    /// native stack depth does not depend on the dictionary size.
    pub fn step(&mut self) -> Result<Step, ForthError> {
        if let Some(cursor) = self.search {
            self.search_step(cursor)?;
            return Ok(Step::NotDone);
        }
        if !self.word.is_empty() {
            self.word_step()?;
            return Ok(Step::NotDone);
        }
        match self.call_stack.pop() {
            None => Ok(Step::Done),
            Some(cell) => {
                self.execute(cell)?;
                Ok(Step::NotDone)
            }
        }
    }

    fn word_step(&mut self) -> Result<(), ForthError> {
        if self.state == ForthState::Compile && self.compile_buffer.name.is_none() {
            let name = std::mem::take(&mut self.word);
            debug!(%name, "naming definition");
            self.compile_buffer.name = Some(name);
            return Ok(());
        }
        match self.dict.latest_id() {
            Some(latest) => self.search_step(latest),
            None => self.resolve_literal(),
        }
    }

    fn search_step(&mut self, cursor: EntryId) -> Result<(), ForthError> {
        let entry = self.dict.entry(cursor);
        if entry.name() == self.word.as_str() {
            let cell = entry.call_cell(cursor);
            trace!(word = %self.word, ?cursor, "resolved");
            self.search = None;
            self.word.clear();
            self.dispatch(cell);
            Ok(())
        } else if let Some(prev) = entry.prev() {
            trace!(word = %self.word, skipped = entry.name(), "searching");
            self.search = Some(prev);
            Ok(())
        } else {
            self.search = None;
            self.resolve_literal()
        }
    }

    fn resolve_literal(&mut self) -> Result<(), ForthError> {
        let word = std::mem::take(&mut self.word);
        match parse_num(&word) {
            Some(val) => {
                self.dispatch(CallCell::literal(val));
                Ok(())
            }
            None => Err(ForthError::UnknownWord(word)),
        }
    }

    // Compile a freshly resolved cell, or queue it for execution.
    fn dispatch(&mut self, cell: CallCell) {
        if self.state == ForthState::Compile && !cell.immediate {
            self.compile_buffer.body.push(cell);
        } else {
            self.call_stack.push(cell);
        }
    }

    fn execute(&mut self, cell: CallCell) -> Result<(), ForthError> {
        trace!(?cell, "execute");
        match cell.call {
            Call::Literal(val) => {
                ds_push(self, val);
                Ok(())
            }
            Call::Primitive(fun) => fun(self),
            Call::Word(id) => {
                self.call_stack
                    .extend_from_slice(self.dict.entry(id).body());
                Ok(())
            }
        }
    }

    fn report(&mut self, err: &ForthError) {
        warn!(error = %err, "word failed");
        self.output.push_str(&format!("error: {}\n", err));
    }
}

fn ds_pop(forth: &mut ForthMachine) -> Result<f64, ForthError> {
    forth.data_stack.pop().ok_or(ForthError::DataStackUnderflow)
}
fn ds_push(forth: &mut ForthMachine, val: f64) {
    forth.data_stack.push(val)
}
fn ds_last(forth: &ForthMachine) -> Result<f64, ForthError> {
    forth
        .data_stack
        .last()
        .copied()
        .ok_or(ForthError::DataStackUnderflow)
}
fn ds_require(forth: &ForthMachine, depth: usize) -> Result<(), ForthError> {
    if forth.data_stack.len() < depth {
        return Err(ForthError::DataStackUnderflow);
    }
    Ok(())
}

fn cs_pop(forth: &mut ForthMachine) -> Result<CallCell, ForthError> {
    forth.call_stack.pop().ok_or(ForthError::CallStackUnderflow)
}

fn parse_num(src: &str) -> Option<f64> {
    src.parse::<f64>().ok()
}

// ( flag -- )
// Drop the next pending cell unless `flag` is greater than zero.
fn branch_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    let flag = ds_pop(forth)?;
    if !(flag > 0.0) {
        let skipped = cs_pop(forth)?;
        trace!(?skipped, "branch skipped cell");
    }
    Ok(())
}

fn colon_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    forth.state = ForthState::Compile;
    debug!("started definition");
    Ok(())
}

fn semicolon_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    if forth.state != ForthState::Compile {
        return Err(ForthError::NotCompiling);
    }
    forth.state = ForthState::Interpret;
    let CompileBuffer { name, mut body } = std::mem::take(&mut forth.compile_buffer);
    let name = name.ok_or(ForthError::UnnamedDefinition)?;
    // Bodies are spliced onto the call stack and popped from the end.
    body.reverse();
    debug!(%name, cells = body.len(), "committed definition");
    forth.dict.push_compound_word(name, body);
    Ok(())
}

// ( n -- n )
fn print_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    let val = ds_last(forth)?;
    let depth = forth.data_stack.len();
    forth.output.push_str(&format!("{}: {:.6}\n", depth, val));
    Ok(())
}

fn binary_op(forth: &mut ForthMachine, op: impl FnOnce(f64, f64) -> f64) -> Result<(), ForthError> {
    ds_require(forth, 2)?;
    let b = ds_pop(forth)?;
    let a = ds_pop(forth)?;
    ds_push(forth, op(a, b));
    Ok(())
}

fn add_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    binary_op(forth, |a, b| a + b)
}

fn sub_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    binary_op(forth, |a, b| a - b)
}

fn mul_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    binary_op(forth, |a, b| a * b)
}

fn div_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    binary_op(forth, |a, b| a / b)
}

fn dup_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    let val = ds_last(forth)?;
    ds_push(forth, val);
    Ok(())
}

fn drop_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    ds_pop(forth)?;
    Ok(())
}

fn swap_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    ds_require(forth, 2)?;
    let a = ds_pop(forth)?;
    let b = ds_pop(forth)?;
    ds_push(forth, a);
    ds_push(forth, b);
    Ok(())
}

fn print_data_stack_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    let mut line = format!("<{}>", forth.data_stack.len());
    for val in &forth.data_stack {
        line.push_str(&format!(" {}", val));
    }
    line.push('\n');
    forth.output.push_str(&line);
    Ok(())
}

fn immediate_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    forth.toggle_immediate()?;
    Ok(())
}

fn words_builtin(forth: &mut ForthMachine) -> Result<(), ForthError> {
    let names: Vec<&str> = forth.dict.entries().map(|(_, e)| e.name()).collect();
    let line = format!("{}\n", names.join(" "));
    forth.output.push_str(&line);
    Ok(())
}

const CORE_WORDS: [(&str, bool, BuiltinFn); 5] = [
    ("br", false, branch_builtin),
    (":", false, colon_builtin),
    (";", true, semicolon_builtin),
    ("print", false, print_builtin),
    ("+", false, add_builtin),
];

const EXTENDED_WORDS: [(&str, bool, BuiltinFn); 9] = [
    // Stack manipulation
    (".S", false, print_data_stack_builtin),
    ("DROP", false, drop_builtin),
    ("DUP", false, dup_builtin),
    ("SWAP", false, swap_builtin),
    // Arithmetic
    ("-", false, sub_builtin),
    ("*", false, mul_builtin),
    ("/", false, div_builtin),
    // Dictionary
    ("IMMEDIATE", false, immediate_builtin),
    ("WORDS", false, words_builtin),
];

#[cfg(test)]
fn stack_of(forth: &ForthMachine) -> Vec<f64> {
    forth.data_stack().iter().copied().collect()
}

#[test]
fn test_add_and_print() {
    let mut forth = ForthMachine::core_only();
    assert!(forth.interpret_line(" 3 4 + print ").is_ok());
    assert_eq!(stack_of(&forth), vec![7.0]);
    assert_eq!(forth.output(), "1: 7.000000\n");
    assert!(forth.call_stack().is_empty());
}

#[test]
fn test_data_stack_underflow_is_recoverable() {
    let mut forth = ForthMachine::core_only();
    assert_eq!(
        forth.interpret_word("print"),
        Err(ForthError::DataStackUnderflow)
    );
    assert_eq!(
        forth.interpret_line("1 +"),
        Err(ForthError::DataStackUnderflow)
    );
    // A failed `+` leaves its operand in place.
    assert_eq!(stack_of(&forth), vec![1.0]);
    assert!(forth.interpret_line("2 + print").is_ok());
    assert_eq!(
        forth.take_output(),
        "error: Data stack underflow\nerror: Data stack underflow\n1: 3.000000\n"
    );
}

#[test]
fn test_unknown_word() {
    let mut forth = ForthMachine::new();
    forth.interpret_line("1 2").unwrap();
    assert_eq!(
        forth.interpret_word("foo"),
        Err(ForthError::UnknownWord("foo".to_string()))
    );
    assert_eq!(stack_of(&forth), vec![1.0, 2.0]);
    assert_eq!(forth.output(), "error: Unknown word `foo`\n");
    assert!(!forth.is_searching());
    // Lookup is case sensitive.
    assert!(forth.interpret_word("PRINT").is_err());
    assert!(forth.interpret_word("print").is_ok());
}

#[test]
fn test_float_literals() {
    let mut forth = ForthMachine::core_only();
    forth.interpret_line("1.5 -2 1e2 +").unwrap();
    assert_eq!(stack_of(&forth), vec![1.5, 98.0]);
    assert!(forth.interpret_word("3abc").is_err());
}

#[test]
fn test_colon_definition() {
    let mut forth = ForthMachine::new();
    forth.interpret_line(": SQUARE DUP * ;").unwrap();
    assert!(!forth.is_compiling());
    assert!(forth.dictionary().find_entry("SQUARE").is_some());
    assert!(forth.data_stack().is_empty());
    forth.interpret_line("5 SQUARE print").unwrap();
    assert_eq!(forth.output(), "1: 25.000000\n");
}

#[test]
fn test_definition_body_order() {
    let mut forth = ForthMachine::new();
    forth.interpret_line(": DOUBLE DUP + ;").unwrap();
    forth.interpret_line(": DEC 1 - ;").unwrap();
    forth.interpret_line(": HALF 2 / ;").unwrap();
    forth.interpret_line("5 DOUBLE 7 DEC 9 HALF").unwrap();
    assert_eq!(stack_of(&forth), vec![10.0, 6.0, 4.5]);
}

#[test]
fn test_nested_definitions() {
    let mut forth = ForthMachine::new();
    forth.interpret_line(": FIVE 5 ;").unwrap();
    forth.interpret_line(": TEN FIVE FIVE + ;").unwrap();
    forth.interpret_line(": TWENTY TEN DUP + ;").unwrap();
    forth.interpret_line("TWENTY TEN -").unwrap();
    assert_eq!(stack_of(&forth), vec![10.0]);
}

#[test]
fn test_redefinition_shadows() {
    let mut forth = ForthMachine::new();
    forth.interpret_line(": A 1 ;").unwrap();
    forth.interpret_line(": B A ;").unwrap();
    forth.interpret_line(": A 2 ;").unwrap();
    forth.interpret_line("A B").unwrap();
    assert_eq!(stack_of(&forth), vec![2.0, 1.0]);
    let names: Vec<&str> = forth
        .dictionary()
        .entries()
        .take(3)
        .map(|(_, e)| e.name())
        .collect();
    assert_eq!(names, ["A", "B", "A"]);
}

#[test]
fn test_redefine_builtin() {
    let mut forth = ForthMachine::new();
    forth.interpret_line(": + * ;").unwrap();
    forth.interpret_line("3 4 +").unwrap();
    assert_eq!(stack_of(&forth), vec![12.0]);
}

#[test]
fn test_branch() {
    let mut forth = ForthMachine::new();
    forth.interpret_line(": MAYBE br DUP ;").unwrap();
    forth.interpret_line("7 1 MAYBE").unwrap();
    assert_eq!(stack_of(&forth), vec![7.0, 7.0]);
    forth.interpret_line("DROP 0 MAYBE").unwrap();
    assert_eq!(stack_of(&forth), vec![7.0]);
    forth.interpret_line("-1 MAYBE").unwrap();
    assert_eq!(stack_of(&forth), vec![7.0]);
    // Only the single next cell is skipped.
    forth.interpret_line(": SKIP1 br 100 200 ;").unwrap();
    forth.interpret_line("0 SKIP1").unwrap();
    assert_eq!(stack_of(&forth), vec![7.0, 200.0]);
}

#[test]
fn test_branch_without_pending_cell() {
    let mut forth = ForthMachine::core_only();
    assert!(forth.interpret_line("1 br").is_ok());
    assert_eq!(
        forth.interpret_line("0 br"),
        Err(ForthError::CallStackUnderflow)
    );
    assert!(forth.data_stack().is_empty());
    assert_eq!(forth.output(), "error: Call stack underflow\n");
}

#[test]
fn test_immediate_word_runs_while_compiling() {
    let mut forth = ForthMachine::new();
    forth.interpret_line(": SEVEN 7 ; IMMEDIATE").unwrap();
    assert!(forth.dictionary().latest_entry().unwrap().is_immediate());
    forth.interpret_line(": USE SEVEN 1 ;").unwrap();
    assert_eq!(stack_of(&forth), vec![7.0]);
    let used = forth.dictionary().find_entry("USE").unwrap();
    assert_eq!(forth.dictionary().entry(used).body().len(), 1);
    forth.interpret_line("USE").unwrap();
    assert_eq!(stack_of(&forth), vec![7.0, 1.0]);
}

#[test]
fn test_toggle_immediate() {
    let mut forth = ForthMachine::core_only();
    assert!(!forth.dictionary().latest_entry().unwrap().is_immediate());
    assert_eq!(forth.toggle_immediate(), Ok(true));
    assert_eq!(forth.toggle_immediate(), Ok(false));
    let mut empty = ForthMachine::with_builtins(&[]);
    assert_eq!(empty.toggle_immediate(), Err(ForthError::NoLatestEntry));
}

#[test]
fn test_semicolon_rejections() {
    let mut forth = ForthMachine::core_only();
    assert_eq!(forth.interpret_word(";"), Err(ForthError::NotCompiling));
    let entries = forth.dictionary().len();
    forth.state = ForthState::Compile;
    forth.compile_buffer.body.push(CallCell::literal(1.0));
    assert_eq!(
        semicolon_builtin(&mut forth),
        Err(ForthError::UnnamedDefinition)
    );
    assert!(!forth.is_compiling());
    assert!(forth.compile_buffer.body.is_empty());
    assert_eq!(forth.dictionary().len(), entries);
}

#[test]
fn test_name_is_not_resolved() {
    let mut forth = ForthMachine::core_only();
    forth.interpret_line(": print 1 ;").unwrap();
    forth.interpret_line(": 42 3 ;").unwrap();
    forth.interpret_line("42 print").unwrap();
    assert_eq!(stack_of(&forth), vec![3.0, 1.0]);
}

#[test]
fn test_unknown_word_while_compiling() {
    let mut forth = ForthMachine::new();
    forth.interpret_word(":").unwrap();
    assert!(forth.is_compiling());
    forth.interpret_word("X").unwrap();
    assert_eq!(forth.pending_definition(), Some("X"));
    assert!(forth.interpret_word("nope").is_err());
    forth.interpret_line("2 ;").unwrap();
    forth.interpret_word("X").unwrap();
    assert_eq!(stack_of(&forth), vec![2.0]);
}

#[test]
fn test_abandon_definition() {
    let mut forth = ForthMachine::new();
    assert!(!forth.abandon_definition());
    forth.interpret_line(": HALF 1 2").unwrap();
    assert!(forth.abandon_definition());
    assert!(!forth.is_compiling());
    assert!(forth.dictionary().find_entry("HALF").is_none());
    forth.interpret_line("3 4").unwrap();
    assert_eq!(stack_of(&forth), vec![3.0, 4.0]);
}

#[test]
fn test_search_is_stepwise() {
    let mut forth = ForthMachine::core_only();
    forth.feed_word(":");
    // Walks "+", "print", ";" before matching ":".
    for _ in 0..3 {
        assert_eq!(forth.step(), Ok(Step::NotDone));
        assert!(forth.is_searching());
        assert!(forth.call_stack().is_empty());
    }
    assert_eq!(forth.step(), Ok(Step::NotDone));
    assert!(!forth.is_searching());
    assert_eq!(forth.call_stack().len(), 1);
    assert_eq!(forth.step(), Ok(Step::NotDone));
    assert!(forth.is_compiling());
    assert_eq!(forth.step(), Ok(Step::Done));
}

#[test]
fn test_empty_dictionary_resolves_numbers() {
    let mut forth = ForthMachine::with_builtins(&[]);
    forth.interpret_word("4").unwrap();
    assert_eq!(stack_of(&forth), vec![4.0]);
    assert!(forth.interpret_word("print").is_err());
    assert!(forth.interpret_line("   ").is_ok());
    assert!(forth.interpret_word("").is_ok());
}

#[test]
fn test_extended_words() {
    let mut forth = ForthMachine::new();
    forth.interpret_line("1 2 3 SWAP .S DROP .S").unwrap();
    assert_eq!(forth.take_output(), "<3> 1 3 2\n<2> 1 3\n");
    let mut core = ForthMachine::core_only();
    core.interpret_word("WORDS").unwrap_err();
    core.push_builtin_word("WORDS", false, words_builtin);
    core.interpret_word("WORDS").unwrap();
    assert_eq!(core.output(), "error: Unknown word `WORDS`\nWORDS + print ; : br\n");
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    fn body_word() -> impl Strategy<Value = String> {
        prop_oneof![
            (0u8..10).prop_map(|n| n.to_string()),
            prop::sample::select(vec!["+", "-", "*", "DUP", "DROP", "SWAP"])
                .prop_map(str::to_string),
        ]
    }

    proptest! {
        #[test]
        fn data_stack_is_lifo(ops in prop::collection::vec(prop::option::of(-1e6f64..1e6), 0..64)) {
            let mut forth = ForthMachine::core_only();
            let mut model = Vec::new();
            for op in ops {
                match op {
                    Some(val) => {
                        ds_push(&mut forth, val);
                        model.push(val);
                    }
                    None => match model.pop() {
                        Some(expected) => {
                            prop_assert_eq!(ds_pop(&mut forth), Ok(expected));
                        }
                        None => {
                            prop_assert_eq!(ds_pop(&mut forth), Err(ForthError::DataStackUnderflow));
                        }
                    },
                }
            }
            prop_assert_eq!(stack_of(&forth), model);
        }

        #[test]
        fn definition_matches_inlined_body(
            seed in prop::collection::vec(0u8..10, 0..4),
            body in prop::collection::vec(body_word(), 0..12),
        ) {
            let seed: Vec<String> = seed.iter().map(|n| n.to_string()).collect();
            let mut inlined = ForthMachine::new();
            inlined.interpret_line(&seed.join(" ")).unwrap();
            let _ = inlined.interpret_line(&body.join(" "));

            let mut defined = ForthMachine::new();
            defined.interpret_line(&seed.join(" ")).unwrap();
            defined.interpret_line(&format!(": BODY {} ;", body.join(" "))).unwrap();
            let _ = defined.interpret_word("BODY");

            prop_assert_eq!(stack_of(&defined), stack_of(&inlined));
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tForth")]
/// Threaded-code Forth interpreter
///
/// Reads words from standard input until it is exhausted, e.g.
/// `echo ': SQUARE DUP * ; 5 SQUARE print' | tforth`.
///
/// Numbers are double precision floats.
struct CliArgs {
    /// Only define `br`, `:`, `;`, `print` and `+`.
    #[arg(long)]
    core_only: bool,
    /// Stop reading input after this many characters.
    ///
    /// A word cut off by the limit is not interpreted.
    #[arg(long)]
    max_chars: Option<usize>,
    /// Don't print the welcome banner and the closing `Bye!`.
    #[arg(long, short)]
    quiet: bool,
    /// Filter for diagnostics written to stderr.
    #[arg(long = "trace", alias = "log", env = "RUST_LOG", default_value = "warn")]
    trace_filter: tracing_subscriber::filter::Targets,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub max_chars: Option<usize>,
    pub quiet: bool,
}

/// Parse CLI arguments, set up tracing and build the machine.
pub fn with_cli_args() -> (ForthMachine, RunOptions) {
    use tracing_subscriber::prelude::*;

    let cli_args = CliArgs::parse();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(cli_args.trace_filter)
        .init();
    let forth = if cli_args.core_only {
        ForthMachine::core_only()
    } else {
        ForthMachine::new()
    };
    let options = RunOptions {
        max_chars: cli_args.max_chars,
        quiet: cli_args.quiet,
    };
    (forth, options)
}

pub fn run(forth: &mut ForthMachine, options: &RunOptions) -> std::io::Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_with(forth, options, stdin.lock(), stdout.lock())
}

// Cut `line` down to at most `limit` chars, dropping a word split by the cut.
fn truncate_line(line: &str, limit: usize) -> &str {
    match line.char_indices().nth(limit) {
        None => line,
        Some((end, _)) => {
            let head = &line[..end];
            match head.rfind(char::is_whitespace) {
                None => "",
                Some(ix) => &head[..ix],
            }
        }
    }
}

pub fn run_with<R: BufRead, W: Write>(
    forth: &mut ForthMachine,
    options: &RunOptions,
    mut input: R,
    mut output: W,
) -> std::io::Result<()> {
    if !options.quiet {
        writeln!(output, "Welcome to tForth")?;
        writeln!(output, "{} words defined", forth.dictionary().len())?;
    }
    let mut remaining = options.max_chars;
    let mut line = String::new();
    while remaining != Some(0) {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let text = match remaining.as_mut() {
            None => line.as_str(),
            Some(left) => {
                let read = line.chars().count();
                let text = truncate_line(&line, *left);
                *left = left.saturating_sub(read);
                text
            }
        };
        // Errors are already reported in the output buffer.
        let _ = forth.interpret_line(text);
        output.write_all(forth.take_output().as_bytes())?;
        output.flush()?;
    }
    if let Some(name) = forth.pending_definition().map(str::to_string) {
        warn!(%name, "input ended inside a definition");
        writeln!(output, "warning: unterminated definition `{}` discarded", name)?;
    }
    forth.abandon_definition();
    if !options.quiet {
        writeln!(output, "Bye!")?;
    }
    Ok(())
}

#[cfg(test)]
fn run_str(forth: &mut ForthMachine, options: &RunOptions, input: &str) -> String {
    let mut out = Vec::new();
    run_with(forth, options, input.as_bytes(), &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_run_with() {
    let mut forth = ForthMachine::new();
    let options = RunOptions::default();
    let out = run_str(&mut forth, &options, ": SQUARE DUP * ;\n5 SQUARE print\nfoo\n");
    assert_eq!(
        out,
        "Welcome to tForth\n14 words defined\n1: 25.000000\nerror: Unknown word `foo`\nBye!\n"
    );
}

#[test]
fn test_run_with_max_chars() {
    let mut forth = ForthMachine::core_only();
    let options = RunOptions {
        max_chars: Some(5),
        quiet: true,
    };
    let out = run_str(&mut forth, &options, "1 2 + print\n3 print\n");
    assert_eq!(out, "");
    assert_eq!(stack_of(&forth), vec![1.0, 2.0]);

    let mut forth = ForthMachine::core_only();
    let options = RunOptions {
        max_chars: Some(8),
        quiet: true,
    };
    let out = run_str(&mut forth, &options, "1 2\n3 + 4\n");
    assert_eq!(out, "");
    assert_eq!(stack_of(&forth), vec![1.0, 5.0]);
}

#[test]
fn test_run_with_unterminated_definition() {
    let mut forth = ForthMachine::new();
    let options = RunOptions {
        max_chars: None,
        quiet: true,
    };
    let out = run_str(&mut forth, &options, ": FOO 1\n2");
    assert_eq!(out, "warning: unterminated definition `FOO` discarded\n");
    assert!(!forth.is_compiling());
    assert!(forth.dictionary().find_entry("FOO").is_none());
}
