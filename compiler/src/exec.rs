// exec.rs — LIR machine: an in-process native caller
//
// Executes a `LirProgram` against a layout-exact `Heap`, modeling the parts
// of the machine the calling convention talks about: a register file, an
// outgoing argument area on a stack, and caller-saved registers that are
// garbage after every call. Arguments reach a callee only through the
// registers and stack slots its call layout names, so a wrong layout shows up
// as a clobbered-register trap or a wrong answer rather than passing silently.
//
// Preconditions: `LirProgram` verified (R1-R3).
// Postconditions: a successful call leaves results in the heap and the
//                 returned registers.
// Failure modes: heap faults, division by zero, step and depth limits and
//                convention violations return a `Trap`.
// Side effects: mutates the machine's heap.

use std::collections::HashMap;

use tracing::trace;

pub use crate::runtime::Trap;

use crate::abi::{AbiConfig, ArgLoc, Reg, RetLoc};
use crate::id::FuncId;
use crate::layout::align_up;
use crate::lir::*;
use crate::runtime::Heap;

pub const DEFAULT_STEP_LIMIT: u64 = 10_000_000;
pub const MAX_CALL_DEPTH: usize = 512;

// ── Register file ───────────────────────────────────────────────────────────

/// Sixteen general and sixteen vector registers. `None` marks a register
/// whose contents are undefined at this point.
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    gpr: [Option<u64>; 16],
    xmm: [Option<u64>; 16],
}

impl RegisterFile {
    fn cell(&mut self, reg: Reg) -> &mut Option<u64> {
        match reg {
            Reg::Gpr(g) => &mut self.gpr[g.index()],
            Reg::Xmm(i) => &mut self.xmm[i as usize & 15],
        }
    }

    pub fn get(&self, reg: Reg) -> Result<u64, Trap> {
        let v = match reg {
            Reg::Gpr(g) => self.gpr[g.index()],
            Reg::Xmm(i) => self.xmm[i as usize & 15],
        };
        v.ok_or_else(|| Trap::ClobberedRegister(reg.to_string()))
    }

    pub fn set(&mut self, reg: Reg, value: u64) {
        *self.cell(reg) = Some(value);
    }

    pub fn clobber(&mut self, regs: &[Reg]) {
        for &r in regs {
            *self.cell(r) = None;
        }
    }
}

// ── Machine ─────────────────────────────────────────────────────────────────

pub struct Machine<'p> {
    program: &'p LirProgram,
    functions: HashMap<FuncId, &'p LirFunction>,
    caller_saved: Vec<Reg>,
    pub heap: Heap,
    pub regs: RegisterFile,
    /// Argument areas, one word per 8 bytes; grows upward.
    stack: Vec<u64>,
    steps: u64,
    step_limit: u64,
    depth: usize,
}

impl<'p> Machine<'p> {
    pub fn new(program: &'p LirProgram) -> Self {
        Machine {
            program,
            functions: program.functions.iter().map(|f| (f.id, f)).collect(),
            caller_saved: program.config.caller_saved(),
            heap: Heap::new(),
            regs: RegisterFile::default(),
            stack: Vec::new(),
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
            depth: 0,
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn config(&self) -> &AbiConfig {
        &self.program.config
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Reserve an outgoing argument area of `bytes`; returns its base word.
    fn push_args(&mut self, bytes: u32) -> usize {
        let base = self.stack.len();
        self.stack.resize(base + align_up(bytes, 8) as usize / 8, 0);
        base
    }

    fn pop_args(&mut self, base: usize) {
        self.stack.truncate(base);
    }

    fn stack_slot(&mut self, base: usize, off: u32) -> Result<&mut u64, Trap> {
        self.stack
            .get_mut(base + off as usize / 8)
            .ok_or_else(|| Trap::Abi(format!("stack argument at +{} outside the argument area", off)))
    }

    fn tick(&mut self) -> Result<(), Trap> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(Trap::StepLimit(self.step_limit));
        }
        Ok(())
    }

    /// Run `func` whose stack arguments start at word `args_base`. Register
    /// arguments must already be in place; results are left in registers.
    pub fn invoke(&mut self, func: FuncId, args_base: usize) -> Result<(), Trap> {
        let f = *self
            .functions
            .get(&func)
            .ok_or_else(|| Trap::UnknownFunction(func.to_string()))?;
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Trap::CallDepth(MAX_CALL_DEPTH));
        }
        self.depth += 1;
        trace!("exec: enter {} (depth {})", f.name, self.depth);
        let result = self.run(f, args_base);
        self.depth -= 1;
        result
    }

    fn run(&mut self, f: &'p LirFunction, args_base: usize) -> Result<(), Trap> {
        let mut vals: Vec<Option<u64>> = vec![None; f.vregs as usize];
        let mut block = f.blocks.first().map(|b| b.id).ok_or_else(|| {
            Trap::Abi(format!("`{}` has no blocks", f.name))
        })?;
        loop {
            let b = f
                .blocks
                .get(block.index())
                .ok_or_else(|| Trap::Abi(format!("`{}` has no block {}", f.name, block)))?;
            for inst in &b.insts {
                self.tick()?;
                self.step(inst, &mut vals, args_base)?;
            }
            self.tick()?;
            match &b.term {
                Term::Jump(to) => block = *to,
                Term::Branch { cond, then, els } => {
                    block = if read(&vals, *cond)? != 0 { *then } else { *els };
                }
                Term::Return(rets) => {
                    let values = rets
                        .iter()
                        .map(|(r, v)| Ok((*r, read(&vals, *v)?)))
                        .collect::<Result<Vec<_>, Trap>>()?;
                    self.regs.clobber(&self.caller_saved);
                    for (r, v) in values {
                        self.regs.set(r, v);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn step(&mut self, inst: &Inst, vals: &mut [Option<u64>], args_base: usize) -> Result<(), Trap> {
        match inst {
            Inst::Param { dst, loc } => {
                let v = match loc {
                    ArgLoc::Reg(r) => self.regs.get(*r)?,
                    ArgLoc::Stack(off) => *self.stack_slot(args_base, *off)?,
                };
                write(vals, *dst, v);
            }
            Inst::Const { dst, value } => write(vals, *dst, *value as u64),
            Inst::ConstF { dst, bits } => write(vals, *dst, *bits),
            Inst::Bin { op, dst, a, b } => {
                let v = bin(*op, read(vals, *a)?, read(vals, *b)?)?;
                write(vals, *dst, v);
            }
            Inst::Un { op, dst, a } => {
                let x = read(vals, *a)?;
                let v = match op {
                    UnOp::Neg => (x as i64).wrapping_neg() as u64,
                    UnOp::Not => (x == 0) as u64,
                    UnOp::ToFloat => ((x as i64) as f64).to_bits(),
                    UnOp::ToInt => f64::from_bits(x) as i64 as u64,
                };
                write(vals, *dst, v);
            }
            Inst::Copy { dst, src } => write(vals, *dst, read(vals, *src)?),
            Inst::Alloc { dst, size } => {
                let addr = self.heap.alloc(*size)?;
                self.regs.clobber(&self.caller_saved);
                write(vals, *dst, addr);
            }
            Inst::AllocArray {
                dst,
                len,
                base,
                scale,
            } => {
                let n = read(vals, *len)? as i64;
                let count = u32::try_from(n).map_err(|_| Trap::ArrayLength(n))?;
                let size = count
                    .checked_mul(*scale)
                    .and_then(|bytes| bytes.checked_add(*base))
                    .ok_or(Trap::ArrayLength(n))?;
                let addr = self.heap.alloc(size)?;
                self.heap
                    .write(addr, crate::layout::MemKind::U32, count as u64)?;
                self.regs.clobber(&self.caller_saved);
                write(vals, *dst, addr);
            }
            Inst::Load {
                dst,
                kind,
                base,
                offset,
            } => {
                let addr = read(vals, *base)?.wrapping_add(read(vals, *offset)?);
                let v = self.heap.read(addr, *kind)?;
                write(vals, *dst, v);
            }
            Inst::Store {
                kind,
                base,
                offset,
                src,
            } => {
                let addr = read(vals, *base)?.wrapping_add(read(vals, *offset)?);
                self.heap.write(addr, *kind, read(vals, *src)?)?;
            }
            Inst::Call {
                func,
                args,
                rets,
                stack_bytes,
            } => {
                let base = self.push_args(*stack_bytes);
                self.regs.clobber(&self.caller_saved);
                for (loc, v) in args {
                    let x = read(vals, *v)?;
                    match loc {
                        ArgLoc::Reg(r) => self.regs.set(*r, x),
                        ArgLoc::Stack(off) => *self.stack_slot(base, *off)? = x,
                    }
                }
                self.invoke(*func, base)?;
                self.pop_args(base);
                for (r, v) in rets {
                    write(vals, *v, self.regs.get(*r)?);
                }
                self.regs.clobber(&self.caller_saved);
            }
        }
        Ok(())
    }
}

fn read(vals: &[Option<u64>], v: VReg) -> Result<u64, Trap> {
    vals.get(v.0 as usize)
        .copied()
        .flatten()
        .ok_or(Trap::UndefinedValue(v.0))
}

fn write(vals: &mut [Option<u64>], v: VReg, x: u64) {
    if let Some(slot) = vals.get_mut(v.0 as usize) {
        *slot = Some(x);
    }
}

fn bin(op: BinOp, a: u64, b: u64) -> Result<u64, Trap> {
    let (x, y) = (a as i64, b as i64);
    let (fx, fy) = (f64::from_bits(a), f64::from_bits(b));
    let sh = (b & 63) as u32;
    Ok(match op {
        BinOp::Add => x.wrapping_add(y) as u64,
        BinOp::Sub => x.wrapping_sub(y) as u64,
        BinOp::Mul => x.wrapping_mul(y) as u64,
        BinOp::Div => {
            if y == 0 {
                return Err(Trap::DivideByZero);
            }
            x.wrapping_div(y) as u64
        }
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a << sh,
        BinOp::Shr => a >> sh,
        BinOp::Sar => (x >> sh) as u64,
        BinOp::Eq => (a == b) as u64,
        BinOp::Lt => (x < y) as u64,
        BinOp::Le => (x <= y) as u64,
        BinOp::AddF => (fx + fy).to_bits(),
        BinOp::SubF => (fx - fy).to_bits(),
        BinOp::MulF => (fx * fy).to_bits(),
        BinOp::DivF => (fx / fy).to_bits(),
        BinOp::EqF => (fx == fy) as u64,
        BinOp::LtF => (fx < fy) as u64,
        BinOp::LeF => (fx <= fy) as u64,
    })
}

// ── Harness ─────────────────────────────────────────────────────────────────

/// An argument as a native caller would hold it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    /// Integers and pointers.
    Int(i64),
    Float(f64),
}

/// A decoded return value.
#[derive(Debug, Clone, PartialEq)]
pub enum Returned {
    Void,
    Int(i64),
    Float(f64),
    /// Aggregate eightbytes in return-register order.
    Registers(Vec<(Reg, u64)>),
    /// Aggregate written to the caller's buffer.
    Buffer { addr: u64, size: u32 },
}

impl Returned {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Returned::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Raw bytes of an aggregate return, as the struct sits in memory.
    pub fn aggregate_bytes(&self, heap: &Heap) -> Result<Vec<u8>, Trap> {
        match self {
            Returned::Registers(pieces) => {
                Ok(pieces.iter().flat_map(|(_, v)| v.to_le_bytes()).collect())
            }
            Returned::Buffer { addr, size } => Ok(heap.bytes(*addr, *size)?.to_vec()),
            _ => Err(Trap::Abi("not an aggregate return".to_string())),
        }
    }
}

/// Calls compiled functions the way hand-written native code would: by
/// name, with arguments placed per the program's convention.
pub struct Harness<'p> {
    pub machine: Machine<'p>,
}

impl<'p> Harness<'p> {
    pub fn new(program: &'p LirProgram) -> Self {
        Harness {
            machine: Machine::new(program),
        }
    }

    pub fn heap(&mut self) -> &mut Heap {
        &mut self.machine.heap
    }

    pub fn call(&mut self, name: &str, args: &[Arg]) -> Result<Returned, Trap> {
        let program = self.machine.program;
        let f = program
            .function(name)
            .ok_or_else(|| Trap::UnknownFunction(name.to_string()))?;
        let layout = &f.layout;
        if args.len() != layout.args.len() {
            return Err(Trap::Arity {
                name: name.to_string(),
                expected: layout.args.len(),
                got: args.len(),
            });
        }
        let m = &mut self.machine;
        m.regs = RegisterFile::default();
        m.stack.clear();
        let base = m.push_args(layout.stack_bytes);
        let mut buffer = None;
        if let (RetLoc::Hidden { size }, Some(reg)) = (&layout.ret, layout.hidden) {
            let addr = m.heap.alloc(*size)?;
            m.regs.set(reg, addr);
            buffer = Some((addr, *size));
        }
        for (loc, arg) in layout.args.iter().zip(args) {
            let bits = match arg {
                Arg::Int(v) => *v as u64,
                Arg::Float(x) => x.to_bits(),
            };
            match loc {
                ArgLoc::Reg(r) => m.regs.set(*r, bits),
                ArgLoc::Stack(off) => *m.stack_slot(base, *off)? = bits,
            }
        }
        let result = m.invoke(f.id, base);
        m.pop_args(base);
        result?;

        Ok(match &layout.ret {
            RetLoc::Void => Returned::Void,
            RetLoc::Reg(r) if r.is_float() => Returned::Float(f64::from_bits(m.regs.get(*r)?)),
            RetLoc::Reg(r) => Returned::Int(m.regs.get(*r)? as i64),
            RetLoc::Pieces(pieces) => Returned::Registers(
                pieces
                    .iter()
                    .map(|p| Ok((p.reg, m.regs.get(p.reg)?)))
                    .collect::<Result<_, Trap>>()?,
            ),
            RetLoc::Hidden { .. } => {
                let (addr, size) = buffer
                    .ok_or_else(|| Trap::Abi("hidden return without a buffer register".into()))?;
                let rax = m.regs.get(Reg::RAX)?;
                if rax != addr {
                    return Err(Trap::Abi(format!(
                        "hidden buffer at {:#x} but RAX holds {:#x}",
                        addr, rax
                    )));
                }
                Returned::Buffer { addr, size }
            }
        })
    }
}
