//! The virtual machine executing compiled [`Script`]s.
//!
//! A [`Process`] is one script invocation in progress: it owns a fixed pool of value
//! registers, a loop stack, a procedure call stack, and per-call argument frames. The engine
//! steps processes cooperatively; a `run()` call executes until the script finishes, yields at
//! a non-atomic loop boundary, or is stopped by a primitive. Side effects that must reach the
//! scheduler (redraws, broadcasts, new threads, clones) are queued as [`EngineRequest`]s and
//! drained by the engine after every `run()`.

use std::mem;
use std::rc::Rc;

use log::warn;

use crate::bytecode::{arg_count, decode, Opcode, Script};
use crate::entity::BlockId;
use crate::runtime::{SharedRandom, Special, Value};
use crate::target::TargetRef;

/// Capacity of the register pool. Overflow is a fatal implementation error.
pub const MAX_REG_COUNT: usize = 1024;

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;
const RAD_TO_DEG: f64 = 180.0 / std::f64::consts::PI;

/// A side effect requested by a running script, applied by the engine between thread steps.
#[derive(Debug)]
pub enum EngineRequest {
    Redraw,
    Broadcast(String),
    StartScript { top_block: BlockId, target: TargetRef },
    InitClone(TargetRef),
    DeleteClone(TargetRef),
    /// Stop every other thread of the given target.
    StopTarget(TargetRef),
    StopAll,
}

struct Loop {
    is_repeat: bool,
    /// Resume position of the loop body (for until loops, of the condition sub-program).
    start: usize,
    /// Completed iterations, or −1 for a forever loop.
    index: i64,
    max: i64,
}

struct Frame {
    code: Rc<[u32]>,
    ret: usize,
}

enum Exit {
    /// Top-level halt: the invocation is finished.
    Done,
    /// The invocation pauses; resume at the given position.
    Yield(usize),
    /// An until-loop condition sub-program finished; the value is the body start position.
    CondEnd(usize),
}

/// A script invocation in progress, bound to a (script, target) pair.
pub struct Process {
    script: Rc<Script>,
    target: TargetRef,
    rng: SharedRandom,

    /// The bytecode chunk currently executing (the script's own, or a procedure's).
    code: Rc<[u32]>,
    pos: usize,
    started: bool,

    regs: Vec<Value>,
    reg_count: usize,
    loops: Vec<Loop>,
    call_stack: Vec<Frame>,
    arg_frames: Vec<Vec<Value>>,
    /// Frame read by `ReadArg` (the enclosing call during argument building).
    current_args: Option<usize>,
    /// Frame being filled by `AddArg` for the upcoming `CallProcedure`.
    next_args: Option<usize>,

    at_end: bool,
    atomic: bool,
    stop: bool,
    killed: bool,
    frame_break: bool,
    requests: Vec<EngineRequest>,
}

impl Process {
    pub fn new(script: Rc<Script>, target: TargetRef, rng: SharedRandom) -> Self {
        Self {
            code: script.bytecode().clone(),
            script,
            target,
            rng,
            pos: 0,
            started: false,
            regs: vec![Value::default(); MAX_REG_COUNT],
            reg_count: 0,
            loops: Vec::with_capacity(256),
            call_stack: Vec::with_capacity(1024),
            arg_frames: Vec::new(),
            current_args: None,
            next_args: None,
            at_end: false,
            atomic: true,
            stop: false,
            killed: false,
            frame_break: false,
            requests: Vec::new(),
        }
    }

    pub fn script(&self) -> &Rc<Script> {
        &self.script
    }
    pub fn target(&self) -> &TargetRef {
        &self.target
    }

    /// True once the invocation has finished (cleanly or by [`Process::kill`]).
    pub fn at_end(&self) -> bool {
        self.at_end
    }
    /// True while the thread has yielded for the rest of the current engine step.
    pub fn frame_break(&self) -> bool {
        self.frame_break
    }
    /// Called by the engine at the start of each step so yielded threads resume.
    pub fn clear_frame_break(&mut self) {
        self.frame_break = false;
    }
    /// Drains the side effects queued since the last call.
    pub fn take_requests(&mut self) -> Vec<EngineRequest> {
        mem::take(&mut self.requests)
    }

    /// Marks the thread for termination: the next `run()` acts as an immediate `Halt` with an
    /// empty call stack.
    pub fn kill(&mut self) {
        self.killed = true;
    }

    // --- primitive API ---------------------------------------------------------------------

    /// Reads input `index` of a primitive taking `total` inputs.
    pub fn input(&self, index: usize, total: usize) -> &Value {
        &self.regs[self.reg_count - total + index]
    }
    /// Pushes a result register.
    pub fn push(&mut self, value: Value) {
        assert!(self.reg_count < MAX_REG_COUNT, "register overflow");
        self.regs[self.reg_count] = value;
        self.reg_count += 1;
    }
    /// Overwrites the register `offset` slots below the stack top with a result. A primitive
    /// with two inputs and one output writes its result at offset 2 and returns 1.
    pub fn replace_result(&mut self, value: Value, offset: usize) {
        self.regs[self.reg_count - offset] = value;
    }
    /// Aborts the script after the current primitive returns.
    pub fn set_stop(&mut self) {
        self.stop = true;
    }
    pub fn request_redraw(&mut self) {
        self.requests.push(EngineRequest::Redraw);
    }
    pub fn request(&mut self, request: EngineRequest) {
        self.requests.push(request);
    }

    // --- test/engine inspection ------------------------------------------------------------

    pub fn reg_count(&self) -> usize {
        self.reg_count
    }
    pub fn reg(&self, index: usize) -> &Value {
        &self.regs[index]
    }

    // --- execution -------------------------------------------------------------------------

    /// Runs the script until it finishes, yields, or is stopped.
    ///
    /// A fresh invocation starts atomic; a resumed one keeps the mode it yielded in.
    pub fn run(&mut self) {
        if self.killed {
            self.terminate();
            return;
        }
        if self.at_end {
            return;
        }
        if !self.started {
            self.started = true;
            self.atomic = true;
            self.pos = 0;
        }
        match self.exec_from(self.pos) {
            Exit::Done => {}
            Exit::Yield(pos) => self.pos = pos,
            Exit::CondEnd(_) => panic!("malformed bytecode: BeginUntilLoop outside an until condition"),
        }
    }

    fn terminate(&mut self) {
        self.at_end = true;
        self.reg_count = 0;
        self.loops.clear();
        self.call_stack.clear();
        self.arg_frames.clear();
        self.current_args = None;
        self.next_args = None;
    }

    fn exec_from(&mut self, start: usize) -> Exit {
        let mut pc = start;
        loop {
            let op = decode(self.code[pc]);
            pc += 1;
            match op {
                Opcode::Halt => {
                    if self.reg_count > 0 {
                        warn!(
                            "VM: {} registers were leaked by the script; this is most likely a bug in the VM or in the compiler",
                            self.reg_count
                        );
                    }
                    match self.call_stack.pop() {
                        Some(frame) => {
                            self.code = frame.code;
                            pc = frame.ret;
                            self.arg_frames.pop();
                            self.current_args =
                                if self.arg_frames.is_empty() { None } else { Some(self.arg_frames.len() - 1) };
                        }
                        None => {
                            self.at_end = true;
                            return Exit::Done;
                        }
                    }
                }

                Opcode::Const => {
                    let k = self.fetch(&mut pc);
                    let v = self.script.constants()[k].clone();
                    self.push(v);
                }
                Opcode::Null => self.push(Value::default()),

                Opcode::If => {
                    if !self.pop().to_bool() {
                        pc = self.skip_to_branch_end(pc);
                    }
                }
                Opcode::Else => pc = self.skip_to_endif(pc),
                Opcode::EndIf => {}

                Opcode::ForeverLoop => {
                    self.loops.push(Loop { is_repeat: true, start: pc, index: -1, max: 0 });
                }
                Opcode::RepeatLoop => {
                    let count = self.pop().to_long();
                    if count <= 0 {
                        pc = self.skip_past_loop_end(pc);
                    } else {
                        self.loops.push(Loop { is_repeat: true, start: pc, index: 0, max: count });
                    }
                }
                Opcode::UntilLoop => {
                    let cond_start = pc;
                    let body_start = self.eval_until_condition(cond_start);
                    if !self.pop().to_bool() {
                        self.loops.push(Loop { is_repeat: false, start: cond_start, index: 0, max: 0 });
                        pc = body_start;
                    } else {
                        pc = self.skip_past_loop_end(body_start);
                    }
                }
                Opcode::BeginUntilLoop => return Exit::CondEnd(pc),
                Opcode::LoopEnd => {
                    let is_repeat = match self.loops.last() {
                        Some(l) => l.is_repeat,
                        None => panic!("malformed bytecode: LoopEnd without a loop"),
                    };
                    if is_repeat {
                        let l = self.loops.last_mut().unwrap();
                        let again = if l.index == -1 {
                            true
                        } else {
                            l.index += 1;
                            l.index < l.max
                        };
                        if again {
                            pc = l.start;
                        } else {
                            self.loops.pop();
                        }
                        if !self.atomic {
                            self.frame_break = true;
                            return Exit::Yield(pc);
                        }
                    } else {
                        let cond_start = self.loops.last().unwrap().start;
                        let body_start = self.eval_until_condition(cond_start);
                        if !self.pop().to_bool() {
                            pc = body_start;
                        } else {
                            self.loops.pop();
                        }
                        if !self.atomic {
                            self.frame_break = true;
                            return Exit::Yield(pc);
                        }
                    }
                }

                Opcode::Print => {
                    let v = self.pop();
                    println!("{}", v);
                }

                Opcode::Add => self.binary_op(Value::add),
                Opcode::Subtract => self.binary_op(Value::subtract),
                Opcode::Multiply => self.binary_op(Value::multiply),
                Opcode::Divide => self.binary_op(Value::divide),
                Opcode::Mod => self.binary_op(Value::modulo),

                Opcode::Random => {
                    let a = self.input(0, 2).to_long();
                    let b = self.input(1, 2).to_long();
                    let r = self.rng.borrow_mut().rand_int(a, b);
                    self.replace2(Value::Integer(r));
                }

                Opcode::Round => {
                    let v = self.top().clone();
                    if !v.is_infinity() && !v.is_negative_infinity() {
                        self.replace1(Value::Integer(libm::round(v.to_double()) as i64));
                    }
                }
                Opcode::Abs => {
                    let v = self.top().clone();
                    if v.is_negative_infinity() {
                        self.replace1(Value::Special(Special::Infinity));
                    } else if !v.is_infinity() {
                        self.replace1(Value::from(libm::fabs(v.to_double())));
                    }
                }
                Opcode::Floor => {
                    let v = self.top().clone();
                    if !v.is_infinity() && !v.is_negative_infinity() {
                        self.replace1(Value::from(libm::floor(v.to_double())));
                    }
                }
                Opcode::Ceil => {
                    let v = self.top().clone();
                    if !v.is_infinity() && !v.is_negative_infinity() {
                        self.replace1(Value::from(libm::ceil(v.to_double())));
                    }
                }
                Opcode::Sqrt => {
                    let v = self.top().clone();
                    if v.to_double() < 0.0 {
                        self.replace1(Value::Special(Special::NaN));
                    } else if !v.is_infinity() {
                        self.replace1(Value::from(libm::sqrt(v.to_double())));
                    }
                }
                Opcode::Sin => {
                    let v = self.top().clone();
                    if v.is_infinity() || v.is_negative_infinity() {
                        self.replace1(Value::Special(Special::NaN));
                    } else {
                        self.replace1(Value::from(libm::sin(v.to_double() * DEG_TO_RAD)));
                    }
                }
                Opcode::Cos => {
                    let v = self.top().clone();
                    if v.is_infinity() || v.is_negative_infinity() {
                        self.replace1(Value::Special(Special::NaN));
                    } else {
                        self.replace1(Value::from(libm::cos(v.to_double() * DEG_TO_RAD)));
                    }
                }
                Opcode::Tan => {
                    let v = self.top().clone();
                    if v.is_infinity() || v.is_negative_infinity() {
                        self.replace1(Value::Special(Special::NaN));
                    } else {
                        match v.to_long() % 360 {
                            90 => self.replace1(Value::Special(Special::Infinity)),
                            270 => self.replace1(Value::Special(Special::NegativeInfinity)),
                            _ => self.replace1(Value::from(libm::tan(v.to_double() * DEG_TO_RAD))),
                        }
                    }
                }
                Opcode::Asin => self.inverse_trig(libm::asin),
                Opcode::Acos => self.inverse_trig(libm::acos),
                Opcode::Atan => self.inverse_trig(libm::atan),

                Opcode::GreaterThan => self.binary_op(|a, b| a.greater_than(b).into()),
                Opcode::LessThan => self.binary_op(|a, b| a.less_than(b).into()),
                Opcode::Equals => self.binary_op(|a, b| a.equals(b).into()),
                Opcode::And => self.binary_op(|a, b| (a.to_bool() && b.to_bool()).into()),
                Opcode::Or => self.binary_op(|a, b| (a.to_bool() || b.to_bool()).into()),
                Opcode::Not => {
                    let r = !self.top().to_bool();
                    self.replace1(r.into());
                }

                Opcode::SetVar => {
                    let i = self.fetch(&mut pc);
                    let v = self.pop();
                    *self.script.variables()[i].borrow_mut() = v;
                }
                Opcode::ChangeVar => {
                    let i = self.fetch(&mut pc);
                    let v = self.pop();
                    let cell = self.script.variables()[i].clone();
                    let sum = cell.borrow().add(&v);
                    *cell.borrow_mut() = sum;
                }
                Opcode::ReadVar => {
                    let i = self.fetch(&mut pc);
                    let v = self.script.variables()[i].borrow().clone();
                    self.push(v);
                }

                Opcode::ReadList => {
                    let i = self.fetch(&mut pc);
                    let s = self.script.lists()[i].borrow().to_string();
                    self.push(s.into());
                }
                Opcode::ListAppend => {
                    let i = self.fetch(&mut pc);
                    let v = self.pop();
                    self.script.lists()[i].borrow_mut().push(v);
                }
                Opcode::ListDel => {
                    let i = self.fetch(&mut pc);
                    let list = self.script.lists()[i].clone();
                    let index_value = self.pop();
                    let index = if index_value.is_string() {
                        match index_value.to_string().as_str() {
                            "last" => list.borrow().len(),
                            "all" => {
                                list.borrow_mut().clear();
                                0
                            }
                            "random" => self.random_index(list.borrow().len()),
                            _ => 0,
                        }
                    } else {
                        fix_list_index(index_value.to_long(), list.borrow().len())
                    };
                    if index != 0 {
                        list.borrow_mut().remove_at(index - 1);
                    }
                }
                Opcode::ListDelAll => {
                    let i = self.fetch(&mut pc);
                    self.script.lists()[i].borrow_mut().clear();
                }
                Opcode::ListInsert => {
                    let i = self.fetch(&mut pc);
                    let list = self.script.lists()[i].clone();
                    let item = self.input(0, 2).clone();
                    let index_value = self.input(1, 2).clone();
                    let index = if index_value.is_string() {
                        match index_value.to_string().as_str() {
                            "last" => {
                                list.borrow_mut().push(item.clone());
                                0
                            }
                            "random" => {
                                let size = list.borrow().len();
                                if size == 0 {
                                    1
                                } else {
                                    self.random_index(size)
                                }
                            }
                            _ => 0,
                        }
                    } else {
                        fix_list_index(index_value.to_long(), list.borrow().len())
                    };
                    if index != 0 || list.borrow().is_empty() {
                        let mut list = list.borrow_mut();
                        if list.is_empty() {
                            list.push(item);
                        } else {
                            list.insert(index - 1, item);
                        }
                    }
                    self.reg_count -= 2;
                }
                Opcode::ListReplace => {
                    let i = self.fetch(&mut pc);
                    let list = self.script.lists()[i].clone();
                    let index_value = self.input(0, 2).clone();
                    let item = self.input(1, 2).clone();
                    let index = if index_value.is_string() {
                        match index_value.to_string().as_str() {
                            "last" => list.borrow().len(),
                            "random" => self.random_index(list.borrow().len()),
                            _ => 0,
                        }
                    } else {
                        fix_list_index(index_value.to_long(), list.borrow().len())
                    };
                    if index != 0 {
                        list.borrow_mut().replace(index - 1, item);
                    }
                    self.reg_count -= 2;
                }
                Opcode::ListGetItem => {
                    let i = self.fetch(&mut pc);
                    let list = self.script.lists()[i].clone();
                    let index_value = self.top().clone();
                    let index = if index_value.is_string() {
                        match index_value.to_string().as_str() {
                            "last" => list.borrow().len(),
                            "random" => self.random_index(list.borrow().len()),
                            _ => 0,
                        }
                    } else {
                        fix_list_index(index_value.to_long(), list.borrow().len())
                    };
                    if index == 0 {
                        self.replace1("".into());
                    } else {
                        let item = list.borrow().get(index - 1).cloned().unwrap_or_default();
                        self.replace1(item);
                    }
                }
                Opcode::ListIndexOf => {
                    let i = self.fetch(&mut pc);
                    let item = self.top().clone();
                    let index = self.script.lists()[i].borrow().index_of(&item).map(|x| x + 1).unwrap_or(0);
                    self.replace1(Value::Integer(index as i64));
                }
                Opcode::ListLength => {
                    let i = self.fetch(&mut pc);
                    let len = self.script.lists()[i].borrow().len();
                    self.push(Value::Integer(len as i64));
                }
                Opcode::ListContains => {
                    let i = self.fetch(&mut pc);
                    let item = self.top().clone();
                    let contained = self.script.lists()[i].borrow().contains(&item);
                    self.replace1(contained.into());
                }

                Opcode::StrConcat => {
                    let r = format!("{}{}", self.input(0, 2), self.input(1, 2));
                    self.replace2(r.into());
                }
                Opcode::StrAt => {
                    let units = self.input(0, 2).to_utf16();
                    let i = self.input(1, 2).to_long();
                    let r = match usize::try_from(i).ok().and_then(|i| units.get(i..i + 1)) {
                        Some(unit) => String::from_utf16_lossy(unit),
                        None => String::new(),
                    };
                    self.replace2(r.into());
                }
                Opcode::StrLength => {
                    let len = self.top().to_utf16().len();
                    self.replace1(Value::Integer(len as i64));
                }
                Opcode::StrContains => {
                    let hay = self.input(0, 2).to_utf16();
                    let needle = self.input(1, 2).to_utf16();
                    let r = needle.is_empty() || hay.windows(needle.len()).any(|w| w == needle);
                    self.replace2(r.into());
                }

                Opcode::Exec => {
                    let i = self.fetch(&mut pc);
                    let f = self.script.functions()[i];
                    let freed = f(self);
                    debug_assert!(freed <= self.reg_count);
                    self.reg_count -= freed;
                    if self.stop {
                        self.stop = false;
                        if self.reg_count > 0 {
                            warn!(
                                "VM: {} registers were leaked by the script; this is most likely a bug in the VM or in the compiler",
                                self.reg_count
                            );
                            self.reg_count = 0;
                        }
                        self.loops.clear();
                        self.call_stack.clear();
                        self.arg_frames.clear();
                        self.current_args = None;
                        self.next_args = None;
                        if !self.atomic {
                            self.frame_break = true;
                        }
                        return Exit::Yield(pc);
                    }
                }

                Opcode::InitProcedure => {
                    self.arg_frames.push(Vec::new());
                    if self.arg_frames.len() >= 2 {
                        self.current_args = Some(self.arg_frames.len() - 2);
                    }
                    self.next_args = Some(self.arg_frames.len() - 1);
                }
                Opcode::AddArg => {
                    let v = self.pop();
                    let frame = match self.next_args {
                        Some(i) => i,
                        None => panic!("malformed bytecode: AddArg without InitProcedure"),
                    };
                    self.arg_frames[frame].push(v);
                }
                Opcode::CallProcedure => {
                    let p = self.fetch(&mut pc);
                    self.call_stack.push(Frame { code: self.code.clone(), ret: pc });
                    self.current_args = self.next_args.take();
                    self.code = self.script.procedures()[p].clone();
                    pc = 0;
                }
                Opcode::ReadArg => {
                    let i = self.fetch(&mut pc);
                    let frame = match self.current_args {
                        Some(f) => f,
                        None => panic!("malformed bytecode: ReadArg outside a procedure call"),
                    };
                    let v = self.arg_frames[frame][i].clone();
                    self.push(v);
                }

                Opcode::BreakAtomic => self.atomic = false,
            }
        }
    }

    /// Runs the condition sub-program of an until loop and returns the body start position.
    /// The condition result is left on the register stack.
    fn eval_until_condition(&mut self, cond_start: usize) -> usize {
        match self.exec_from(cond_start) {
            Exit::CondEnd(body_start) => body_start,
            _ => panic!("malformed bytecode: until condition not bounded by BeginUntilLoop"),
        }
    }

    fn fetch(&self, pc: &mut usize) -> usize {
        let word = self.code[*pc] as usize;
        *pc += 1;
        word
    }

    fn top(&self) -> &Value {
        &self.regs[self.reg_count - 1]
    }
    fn pop(&mut self) -> Value {
        self.reg_count -= 1;
        mem::take(&mut self.regs[self.reg_count])
    }
    /// Writes the result of a unary operator over the top register.
    fn replace1(&mut self, value: Value) {
        self.regs[self.reg_count - 1] = value;
    }
    /// Writes the result of a binary operator: consumes two registers, pushes one.
    fn replace2(&mut self, value: Value) {
        self.reg_count -= 1;
        self.regs[self.reg_count - 1] = value;
    }
    fn binary_op(&mut self, f: impl Fn(&Value, &Value) -> Value) {
        let r = f(self.input(0, 2), self.input(1, 2));
        self.replace2(r);
    }
    fn inverse_trig(&mut self, f: fn(f64) -> f64) {
        let d = self.top().to_double();
        if !(-1.0..=1.0).contains(&d) {
            self.replace1(Value::Special(Special::NaN));
        } else {
            self.replace1(Value::from(f(d) * RAD_TO_DEG));
        }
    }

    /// A random 1-based index into a list of `size` items, or 0 when the list is empty.
    fn random_index(&self, size: usize) -> usize {
        if size == 0 {
            0
        } else {
            self.rng.borrow_mut().rand_int(1, size as i64) as usize
        }
    }

    // --- skip scans ------------------------------------------------------------------------
    // These step over instructions without executing them, advancing by each instruction's
    // inline argument count and tracking nesting so inner branches and loops are skipped
    // whole.

    /// From inside a false `If` branch: position just past the matching `Else` or `EndIf`.
    fn skip_to_branch_end(&self, mut pc: usize) -> usize {
        let mut depth = 0usize;
        loop {
            let op = decode(self.code[pc]);
            pc += 1 + arg_count(op);
            match op {
                Opcode::If => depth += 1,
                Opcode::Else if depth == 0 => return pc,
                Opcode::EndIf => {
                    if depth == 0 {
                        return pc;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    /// From an `Else` reached out of the true branch: position just past the matching `EndIf`.
    fn skip_to_endif(&self, mut pc: usize) -> usize {
        let mut depth = 0usize;
        loop {
            let op = decode(self.code[pc]);
            pc += 1 + arg_count(op);
            match op {
                Opcode::If => depth += 1,
                Opcode::EndIf => {
                    if depth == 0 {
                        return pc;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    /// Position just past the `LoopEnd` matching the loop opened right before `pc`.
    fn skip_past_loop_end(&self, mut pc: usize) -> usize {
        let mut depth = 0usize;
        loop {
            let op = decode(self.code[pc]);
            pc += 1 + arg_count(op);
            match op {
                Opcode::ForeverLoop | Opcode::RepeatLoop | Opcode::UntilLoop => depth += 1,
                Opcode::LoopEnd => {
                    if depth == 0 {
                        return pc;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }
}

/// Clamps a 1-based list index: 0 (meaning "ignore") when the list is empty or the index is
/// out of range.
fn fix_list_index(index: i64, len: usize) -> usize {
    if len == 0 || index < 1 || index > len as i64 {
        0
    } else {
        index as usize
    }
}
