//! LIR – Low-level IR between global code motion and emission.
//!
//! `LirProgram` is a self-contained, ABI-resolved representation of a
//! scheduled module: every value lives in a virtual register, every
//! argument and return value is bound to a concrete register or stack slot,
//! and aggregate returns are already split into pieces or copied through a
//! hidden buffer. The assembly printer and the LIR machine read it without
//! consulting the graph.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::abi::{classify, AbiConfig, ArgLoc, CallLayout, Reg, RetLoc};
use crate::cfg::Exit;
use crate::diag::{codes, Diagnostic};
use crate::graph::{Function, Graph, Module, RetType};
use crate::id::{BlockId, FuncId, NodeId};
use crate::layout::{align_up, alloc_size, array_layout, mem_kind, struct_layout, MemKind, ALLOC_ALIGN};
use crate::node::Op;
use crate::schedule::Schedule;
use crate::types::Type;

// ── Top-level ──────────────────────────────────────────────────────────────

pub struct LirProgram {
    pub config: AbiConfig,
    pub functions: Vec<LirFunction>,
}

impl LirProgram {
    pub fn function(&self, name: &str) -> Option<&LirFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn by_id(&self, id: FuncId) -> Option<&LirFunction> {
        self.functions.iter().find(|f| f.id == id)
    }

    pub fn inst_count(&self) -> usize {
        self.functions
            .iter()
            .flat_map(|f| &f.blocks)
            .map(|b| b.insts.len() + 1)
            .sum()
    }
}

pub struct LirFunction {
    pub id: FuncId,
    pub name: String,
    pub layout: CallLayout,
    pub blocks: Vec<LirBlock>,
    /// Number of virtual registers used.
    pub vregs: u32,
}

pub struct LirBlock {
    pub id: BlockId,
    pub insts: Vec<Inst>,
    pub term: Term,
}

// ── Instructions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Eq,
    Lt,
    Le,
    AddF,
    SubF,
    MulF,
    DivF,
    EqF,
    LtF,
    LeF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    ToFloat,
    ToInt,
}

fn bin_op(op: Op) -> Option<BinOp> {
    Some(match op {
        Op::Add => BinOp::Add,
        Op::Sub => BinOp::Sub,
        Op::Mul => BinOp::Mul,
        Op::Div => BinOp::Div,
        Op::And => BinOp::And,
        Op::Or => BinOp::Or,
        Op::Xor => BinOp::Xor,
        Op::Shl => BinOp::Shl,
        Op::Shr => BinOp::Shr,
        Op::Sar => BinOp::Sar,
        Op::Eq => BinOp::Eq,
        Op::Lt => BinOp::Lt,
        Op::Le => BinOp::Le,
        Op::AddF => BinOp::AddF,
        Op::SubF => BinOp::SubF,
        Op::MulF => BinOp::MulF,
        Op::DivF => BinOp::DivF,
        Op::EqF => BinOp::EqF,
        Op::LtF => BinOp::LtF,
        Op::LeF => BinOp::LeF,
        _ => return None,
    })
}

fn un_op(op: Op) -> Option<UnOp> {
    Some(match op {
        Op::Neg => UnOp::Neg,
        Op::Not => UnOp::Not,
        Op::ToFloat => UnOp::ToFloat,
        Op::ToInt => UnOp::ToInt,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    /// Read an incoming argument.
    Param { dst: VReg, loc: ArgLoc },
    Const { dst: VReg, value: i64 },
    /// Float constant by bit pattern.
    ConstF { dst: VReg, bits: u64 },
    Bin { op: BinOp, dst: VReg, a: VReg, b: VReg },
    Un { op: UnOp, dst: VReg, a: VReg },
    Copy { dst: VReg, src: VReg },
    /// Zeroed fixed-size allocation.
    Alloc { dst: VReg, size: u32 },
    /// Zeroed array allocation with the length header written.
    AllocArray { dst: VReg, len: VReg, base: u32, scale: u32 },
    Load { dst: VReg, kind: MemKind, base: VReg, offset: VReg },
    Store { kind: MemKind, base: VReg, offset: VReg, src: VReg },
    Call {
        func: FuncId,
        args: Vec<(ArgLoc, VReg)>,
        rets: Vec<(Reg, VReg)>,
        stack_bytes: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Jump(BlockId),
    Branch { cond: VReg, then: BlockId, els: BlockId },
    Return(Vec<(Reg, VReg)>),
}

// ── Verification ───────────────────────────────────────────────────────────

/// Machine-checkable evidence for LIR postconditions (R1-R3).
#[derive(Debug, Clone)]
pub struct LirCert {
    /// R1: Every defined function of the module has a LIR body.
    pub r1_all_functions_lowered: bool,
    /// R2: Every virtual register read is written somewhere in its function.
    pub r2_vregs_defined: bool,
    /// R3: Every jump and branch target names a block of the same function.
    pub r3_targets_exist: bool,
}

impl crate::pass::StageCert for LirCert {
    fn all_pass(&self) -> bool {
        self.r1_all_functions_lowered && self.r2_vregs_defined && self.r3_targets_exist
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("R1_all_functions_lowered", self.r1_all_functions_lowered),
            ("R2_vregs_defined", self.r2_vregs_defined),
            ("R3_targets_exist", self.r3_targets_exist),
        ]
    }
}

pub fn verify_lir(lir: &LirProgram, module: &Module) -> LirCert {
    LirCert {
        r1_all_functions_lowered: module.functions().all(|f| lir.by_id(f.id).is_some()),
        r2_vregs_defined: lir.functions.iter().all(verify_r2_vregs_defined),
        r3_targets_exist: lir.functions.iter().all(verify_r3_targets_exist),
    }
}

fn verify_r2_vregs_defined(func: &LirFunction) -> bool {
    let mut defs = vec![false; func.vregs as usize];
    for block in &func.blocks {
        for inst in &block.insts {
            for d in inst.defs() {
                if let Some(slot) = defs.get_mut(d.0 as usize) {
                    *slot = true;
                }
            }
        }
    }
    let defined = |v: VReg| defs.get(v.0 as usize).copied().unwrap_or(false);
    func.blocks.iter().all(|b| {
        b.insts.iter().all(|i| i.uses().into_iter().all(defined))
            && b.term.uses().into_iter().all(defined)
    })
}

fn verify_r3_targets_exist(func: &LirFunction) -> bool {
    let n = func.blocks.len();
    func.blocks.iter().all(|b| match b.term {
        Term::Jump(t) => t.index() < n,
        Term::Branch { then, els, .. } => then.index() < n && els.index() < n,
        Term::Return(_) => true,
    })
}

impl Inst {
    pub fn defs(&self) -> Vec<VReg> {
        match self {
            Inst::Param { dst, .. }
            | Inst::Const { dst, .. }
            | Inst::ConstF { dst, .. }
            | Inst::Bin { dst, .. }
            | Inst::Un { dst, .. }
            | Inst::Copy { dst, .. }
            | Inst::Alloc { dst, .. }
            | Inst::AllocArray { dst, .. }
            | Inst::Load { dst, .. } => vec![*dst],
            Inst::Store { .. } => Vec::new(),
            Inst::Call { rets, .. } => rets.iter().map(|(_, v)| *v).collect(),
        }
    }

    pub fn uses(&self) -> Vec<VReg> {
        match self {
            Inst::Param { .. } | Inst::Const { .. } | Inst::ConstF { .. } | Inst::Alloc { .. } => {
                Vec::new()
            }
            Inst::Bin { a, b, .. } => vec![*a, *b],
            Inst::Un { a, .. } => vec![*a],
            Inst::Copy { src, .. } => vec![*src],
            Inst::AllocArray { len, .. } => vec![*len],
            Inst::Load { base, offset, .. } => vec![*base, *offset],
            Inst::Store {
                base, offset, src, ..
            } => vec![*base, *offset, *src],
            Inst::Call { args, .. } => args.iter().map(|(_, v)| *v).collect(),
        }
    }
}

impl Term {
    pub fn uses(&self) -> Vec<VReg> {
        match self {
            Term::Jump(_) => Vec::new(),
            Term::Branch { cond, .. } => vec![*cond],
            Term::Return(rets) => rets.iter().map(|(_, v)| *v).collect(),
        }
    }
}

// ── Display ────────────────────────────────────────────────────────────────

impl fmt::Display for LirProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "; conv={} aggregate_return={:?}",
            self.config.conv, self.config.aggregate_return
        )?;
        for func in &self.functions {
            writeln!(f)?;
            fmt_function(f, func)?;
        }
        Ok(())
    }
}

fn fmt_function(f: &mut fmt::Formatter<'_>, func: &LirFunction) -> fmt::Result {
    let args: Vec<String> = func.layout.args.iter().map(ToString::to_string).collect();
    writeln!(
        f,
        "fn {}({}) -> {} {{",
        func.name,
        args.join(", "),
        crate::abi::AbiReport::new(&func.name, &func.layout).ret
    )?;
    for block in &func.blocks {
        writeln!(f, "{}:", block.id)?;
        for inst in &block.insts {
            writeln!(f, "  {}", inst)?;
        }
        writeln!(f, "  {}", block.term)?;
    }
    writeln!(f, "}}")
}

fn fmt_pairs<A: fmt::Display, B: fmt::Display>(pairs: &[(A, B)]) -> String {
    pairs
        .iter()
        .map(|(a, b)| format!("{}={}", a, b))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Param { dst, loc } => write!(f, "{} = param {}", dst, loc),
            Inst::Const { dst, value } => write!(f, "{} = const {}", dst, value),
            Inst::ConstF { dst, bits } => write!(f, "{} = constf {}", dst, f64::from_bits(*bits)),
            Inst::Bin { op, dst, a, b } => {
                write!(f, "{} = {} {}, {}", dst, format!("{:?}", op).to_lowercase(), a, b)
            }
            Inst::Un { op, dst, a } => {
                write!(f, "{} = {} {}", dst, format!("{:?}", op).to_lowercase(), a)
            }
            Inst::Copy { dst, src } => write!(f, "{} = {}", dst, src),
            Inst::Alloc { dst, size } => write!(f, "{} = alloc {}", dst, size),
            Inst::AllocArray {
                dst,
                len,
                base,
                scale,
            } => write!(f, "{} = alloc_array {} x {} + {}", dst, len, scale, base),
            Inst::Load {
                dst,
                kind,
                base,
                offset,
            } => write!(f, "{} = load.{} [{} + {}]", dst, kind.name(), base, offset),
            Inst::Store {
                kind,
                base,
                offset,
                src,
            } => write!(f, "store.{} [{} + {}], {}", kind.name(), base, offset, src),
            Inst::Call {
                func,
                args,
                rets,
                stack_bytes,
            } => write!(
                f,
                "call {}({}) -> ({}) stack={}",
                func,
                fmt_pairs(args),
                fmt_pairs(rets),
                stack_bytes
            ),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Jump(b) => write!(f, "jmp {}", b),
            Term::Branch { cond, then, els } => write!(f, "br {}, {}, {}", cond, then, els),
            Term::Return(rets) => write!(f, "ret ({})", fmt_pairs(rets)),
        }
    }
}

// ── Lowering ───────────────────────────────────────────────────────────────

/// Lower every defined function of `module`. `schedules` must hold a
/// schedule for each of them.
pub fn build_lir(
    module: &Module,
    schedules: &HashMap<FuncId, Schedule>,
    config: &AbiConfig,
) -> Result<LirProgram, Diagnostic> {
    let mut layouts = HashMap::new();
    for func in module.functions() {
        let layout = classify(config, &func.graph.types, &func.sig)
            .map_err(|d| d.with_cause(format!("signature of `{}`", func.name), None))?;
        layouts.insert(func.id, layout);
    }
    let mut functions = Vec::new();
    for func in module.functions() {
        let sched = schedules.get(&func.id).ok_or_else(|| {
            Diagnostic::error(
                codes::E0501,
                format!("`{}` has not been scheduled", func.name),
            )
        })?;
        functions.push(
            lower_function(func, sched, &layouts)
                .map_err(|d| d.with_cause(format!("while lowering `{}`", func.name), None))?,
        );
    }
    let program = LirProgram {
        config: *config,
        functions,
    };
    debug!(
        "lir: {} functions, {} instructions",
        program.functions.len(),
        program.inst_count()
    );
    Ok(program)
}

pub fn lower_function(
    func: &Function,
    sched: &Schedule,
    layouts: &HashMap<FuncId, CallLayout>,
) -> Result<LirFunction, Diagnostic> {
    let layout = layouts.get(&func.id).cloned().ok_or_else(|| {
        Diagnostic::error(codes::E0501, format!("`{}` has no call layout", func.name))
    })?;
    let mut lower = FnLower {
        g: &func.graph,
        ret: func.sig.ret,
        layout,
        layouts,
        values: HashMap::new(),
        next: 0,
        hidden: None,
    };

    // Phi registers exist before any predecessor is lowered.
    for block in sched.blocks() {
        for &n in &block.nodes {
            if matches!(lower.g.op(n), Op::Phi(_)) && lower.has_value(n) {
                let v = lower.fresh();
                lower.values.insert(n, v);
            }
        }
    }

    let mut blocks = Vec::with_capacity(sched.blocks().len());
    for block in sched.blocks() {
        let mut insts = Vec::new();
        if block.id == sched.cfg.entry() {
            if let Some(reg) = lower.layout.hidden {
                let v = lower.fresh();
                lower.hidden = Some(v);
                insts.push(Inst::Param {
                    dst: v,
                    loc: ArgLoc::Reg(reg),
                });
            }
        }
        let term_node = block.terminator();
        for &n in &block.nodes {
            if Some(n) != term_node {
                lower.node(n, &mut insts)?;
            }
        }
        if block.id == sched.cfg.entry() {
            // Arguments are read before anything can clobber their registers.
            insts.sort_by_key(|i| !matches!(i, Inst::Param { .. }));
        }
        let term = match block.exit {
            Exit::Branch { iff, then, els } => Term::Branch {
                cond: lower.input_value(iff, 1)?,
                then,
                els,
            },
            Exit::Jump { to, slot } => {
                let head = sched.cfg.block(to).head;
                lower.phi_moves(head, slot, &mut insts)?;
                Term::Jump(to)
            }
            Exit::Return(r) => lower.ret(r, &mut insts)?,
        };
        blocks.push(LirBlock {
            id: block.id,
            insts,
            term,
        });
    }

    Ok(LirFunction {
        id: func.id,
        name: func.name.clone(),
        layout: lower.layout,
        blocks,
        vregs: lower.next,
    })
}

struct FnLower<'a> {
    g: &'a Graph,
    ret: RetType,
    layout: CallLayout,
    layouts: &'a HashMap<FuncId, CallLayout>,
    values: HashMap<NodeId, VReg>,
    next: u32,
    hidden: Option<VReg>,
}

impl FnLower<'_> {
    fn fresh(&mut self) -> VReg {
        let v = VReg(self.next);
        self.next += 1;
        v
    }

    /// Whether a node's type denotes a runtime value (not control or memory).
    fn has_value(&self, n: NodeId) -> bool {
        let t = self.g.ty(n);
        let types = &self.g.types;
        !(types.is_ctrl(t) || types.is_mem(t) || types.is_tuple(t))
    }

    fn value(&self, n: NodeId) -> Result<VReg, Diagnostic> {
        self.values.get(&n).copied().ok_or_else(|| {
            Diagnostic::error(
                codes::E0501,
                format!("{} has no value at its use", self.g.label(n)),
            )
            .at(n)
        })
    }

    fn input_value(&self, n: NodeId, slot: usize) -> Result<VReg, Diagnostic> {
        let x = self.g.input(n, slot).ok_or_else(|| {
            Diagnostic::error(
                codes::E0501,
                format!("{} has no input in slot {}", self.g.label(n), slot),
            )
            .at(n)
        })?;
        self.value(x)
    }

    fn kind(&self, n: NodeId, decl: crate::id::TypeId) -> Result<MemKind, Diagnostic> {
        mem_kind(&self.g.types, decl).map_err(|d| d.at(n))
    }

    fn con(&mut self, value: i64, insts: &mut Vec<Inst>) -> VReg {
        let dst = self.fresh();
        insts.push(Inst::Const { dst, value });
        dst
    }

    fn node(&mut self, n: NodeId, insts: &mut Vec<Inst>) -> Result<(), Diagnostic> {
        let g = self.g;
        let op = g.op(n);
        if let Some(op) = bin_op(op) {
            let (a, b) = (self.input_value(n, 1)?, self.input_value(n, 2)?);
            let dst = self.fresh();
            insts.push(Inst::Bin { op, dst, a, b });
            self.values.insert(n, dst);
            return Ok(());
        }
        if let Some(op) = un_op(op) {
            let a = self.input_value(n, 1)?;
            let dst = self.fresh();
            insts.push(Inst::Un { op, dst, a });
            self.values.insert(n, dst);
            return Ok(());
        }
        match op {
            Op::Constant(t) => {
                let dst = self.fresh();
                match g.types.get(t) {
                    Type::Int { min, max } if min == max => {
                        insts.push(Inst::Const { dst, value: *min })
                    }
                    Type::Nil => insts.push(Inst::Const { dst, value: 0 }),
                    Type::Float(_) => match g.types.float_value(t) {
                        Some(x) => insts.push(Inst::ConstF {
                            dst,
                            bits: x.to_bits(),
                        }),
                        None => return Ok(()),
                    },
                    _ => return Ok(()),
                }
                self.values.insert(n, dst);
            }
            Op::Proj(i) => {
                let Some(parent) = g.input(n, 0) else {
                    return Ok(());
                };
                match g.op(parent) {
                    Op::Start(_) if i >= 2 => {
                        let loc = self.layout.args.get(i as usize - 2).copied().ok_or_else(|| {
                            Diagnostic::error(
                                codes::E0501,
                                format!("parameter {} has no call location", i - 2),
                            )
                            .at(n)
                        })?;
                        let dst = self.fresh();
                        insts.push(Inst::Param { dst, loc });
                        self.values.insert(n, dst);
                    }
                    Op::New(_) if i == 0 => {
                        let v = self.value(parent)?;
                        self.values.insert(n, v);
                    }
                    Op::Call(..) if i == 1 => {
                        if let Some(&v) = self.values.get(&parent) {
                            self.values.insert(n, v);
                        }
                    }
                    _ => {}
                }
            }
            Op::New(obj) => {
                let dst = self.fresh();
                if g.types.is_array(obj) {
                    let al = array_layout(&g.types, obj).map_err(|d| d.at(n))?;
                    let len = self.input_value(n, 2)?;
                    insts.push(Inst::AllocArray {
                        dst,
                        len,
                        base: al.base,
                        scale: al.scale,
                    });
                } else {
                    let size = alloc_size(&g.types, obj).map_err(|d| d.at(n))?;
                    insts.push(Inst::Alloc { dst, size });
                }
                self.values.insert(n, dst);
            }
            Op::Load(decl) => {
                let kind = self.kind(n, decl)?;
                let (base, offset) = (self.input_value(n, 2)?, self.input_value(n, 3)?);
                let dst = self.fresh();
                insts.push(Inst::Load {
                    dst,
                    kind,
                    base,
                    offset,
                });
                self.values.insert(n, dst);
            }
            Op::Store(decl) => {
                let kind = self.kind(n, decl)?;
                let (base, offset, src) = (
                    self.input_value(n, 2)?,
                    self.input_value(n, 3)?,
                    self.input_value(n, 4)?,
                );
                insts.push(Inst::Store {
                    kind,
                    base,
                    offset,
                    src,
                });
            }
            Op::Call(func, _) => self.call(n, func, insts)?,
            Op::Phi(_) | Op::Start(_) | Op::Region | Op::Loop | Op::CProj(_) => {}
            Op::If | Op::Return | Op::Stop | Op::Scope => {
                return Err(Diagnostic::error(
                    codes::E0501,
                    format!("{} cannot be lowered inside a block body", g.label(n)),
                )
                .at(n));
            }
            _ => {}
        }
        Ok(())
    }

    fn call(&mut self, n: NodeId, func: FuncId, insts: &mut Vec<Inst>) -> Result<(), Diagnostic> {
        let g = self.g;
        let layout = self.layouts.get(&func).ok_or_else(|| {
            Diagnostic::error(codes::E0501, format!("call to undefined function {}", func)).at(n)
        })?;
        let actuals = &g.inputs(n)[2..];
        if actuals.len() != layout.args.len() {
            return Err(Diagnostic::error(
                codes::E0501,
                format!(
                    "{} passes {} arguments; callee takes {}",
                    g.label(n),
                    actuals.len(),
                    layout.args.len()
                ),
            )
            .at(n));
        }
        let mut args = Vec::with_capacity(actuals.len() + 1);
        for (slot, loc) in layout.args.iter().enumerate() {
            args.push((*loc, self.input_value(n, slot + 2)?));
        }
        let stack_bytes = layout.stack_bytes;
        match layout.ret.clone() {
            RetLoc::Void => insts.push(Inst::Call {
                func,
                args,
                rets: Vec::new(),
                stack_bytes,
            }),
            RetLoc::Reg(reg) => {
                let dst = self.fresh();
                insts.push(Inst::Call {
                    func,
                    args,
                    rets: vec![(reg, dst)],
                    stack_bytes,
                });
                self.values.insert(n, dst);
            }
            RetLoc::Pieces(pieces) => {
                // Reassemble the register pieces in a fresh object.
                let buf = self.fresh();
                insts.push(Inst::Alloc {
                    dst: buf,
                    size: pieces.len() as u32 * 8,
                });
                let temps: Vec<VReg> = pieces.iter().map(|_| self.fresh()).collect();
                insts.push(Inst::Call {
                    func,
                    args,
                    rets: pieces.iter().zip(&temps).map(|(p, t)| (p.reg, *t)).collect(),
                    stack_bytes,
                });
                for (p, t) in pieces.iter().zip(temps) {
                    let off = self.con(p.offset as i64, insts);
                    let kind = if p.reg.is_float() { MemKind::F64 } else { MemKind::I64 };
                    insts.push(Inst::Store {
                        kind,
                        base: buf,
                        offset: off,
                        src: t,
                    });
                }
                self.values.insert(n, buf);
            }
            RetLoc::Hidden { size } => {
                let buf = self.fresh();
                insts.push(Inst::Alloc {
                    dst: buf,
                    size: align_up(size.max(1), ALLOC_ALIGN),
                });
                if let Some(reg) = layout.hidden {
                    args.insert(0, (ArgLoc::Reg(reg), buf));
                }
                let dst = self.fresh();
                insts.push(Inst::Call {
                    func,
                    args,
                    rets: vec![(Reg::RAX, dst)],
                    stack_bytes,
                });
                self.values.insert(n, dst);
            }
        }
        Ok(())
    }

    /// Parallel copies into the phis of `region` for predecessor `slot`.
    fn phi_moves(&mut self, region: NodeId, slot: usize, insts: &mut Vec<Inst>) -> Result<(), Diagnostic> {
        let mut moves = Vec::new();
        for phi in self.g.phis_of(region) {
            let Some(&dst) = self.values.get(&phi) else {
                continue;
            };
            let src = self.input_value(phi, slot)?;
            if src != dst {
                moves.push((dst, src));
            }
        }
        if moves.len() == 1 {
            let (dst, src) = moves[0];
            insts.push(Inst::Copy { dst, src });
            return Ok(());
        }
        let temps: Vec<VReg> = moves.iter().map(|_| self.fresh()).collect();
        for (&(_, src), &t) in moves.iter().zip(&temps) {
            insts.push(Inst::Copy { dst: t, src });
        }
        for (&(dst, _), &t) in moves.iter().zip(&temps) {
            insts.push(Inst::Copy { dst, src: t });
        }
        Ok(())
    }

    fn ret(&mut self, r: NodeId, insts: &mut Vec<Inst>) -> Result<Term, Diagnostic> {
        match self.layout.ret.clone() {
            RetLoc::Void => Ok(Term::Return(Vec::new())),
            RetLoc::Reg(reg) => Ok(Term::Return(vec![(reg, self.input_value(r, 2)?)])),
            RetLoc::Pieces(pieces) => {
                let obj = self.input_value(r, 2)?;
                let mut rets = Vec::with_capacity(pieces.len());
                for p in pieces {
                    let off = self.con(p.offset as i64, insts);
                    let dst = self.fresh();
                    let kind = if p.reg.is_float() { MemKind::F64 } else { MemKind::I64 };
                    insts.push(Inst::Load {
                        dst,
                        kind,
                        base: obj,
                        offset: off,
                    });
                    rets.push((p.reg, dst));
                }
                Ok(Term::Return(rets))
            }
            RetLoc::Hidden { .. } => {
                let RetType::Aggregate(ty) = self.ret else {
                    return Err(Diagnostic::error(
                        codes::E0501,
                        "hidden return buffer for a non-aggregate signature",
                    )
                    .at(r));
                };
                let hidden = self.hidden.ok_or_else(|| {
                    Diagnostic::error(codes::E0501, "hidden return buffer was never received").at(r)
                })?;
                let obj = self.input_value(r, 2)?;
                let sl = struct_layout(&self.g.types, ty).map_err(|d| d.at(r))?;
                for field in &sl.fields {
                    let off = self.con(field.offset as i64, insts);
                    let tmp = self.fresh();
                    insts.push(Inst::Load {
                        dst: tmp,
                        kind: field.kind,
                        base: obj,
                        offset: off,
                    });
                    insts.push(Inst::Store {
                        kind: field.kind,
                        base: hidden,
                        offset: off,
                        src: tmp,
                    });
                }
                Ok(Term::Return(vec![(Reg::RAX, hidden)]))
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;
    use crate::id::TypeId;
    use crate::optimize::optimize;
    use crate::pass::StageCert;
    use crate::schedule::schedule;

    fn compile(module: &mut Module, config: &AbiConfig) -> LirProgram {
        let mut schedules = HashMap::new();
        for func in module.functions_mut() {
            optimize(&mut func.graph).unwrap();
            schedules.insert(func.id, schedule(&mut func.graph).unwrap());
        }
        build_lir(module, &schedules, config).unwrap()
    }

    fn pair_module() -> Module {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new(&mut m, "make_pair");
        let pair = b
            .types()
            .struct_type("Pair", &[("a", TypeId::INT_BOT), ("b", TypeId::INT_BOT)]);
        b.start(
            &[("a", TypeId::INT_BOT), ("b", TypeId::INT_BOT)],
            RetType::Aggregate(pair),
        )
        .unwrap();
        let p = b.new_struct(pair).unwrap();
        let a = b.get("a").unwrap();
        b.store_field(p, "a", a).unwrap();
        let bv = b.get("b").unwrap();
        b.store_field(p, "b", bv).unwrap();
        b.ret(Some(p)).unwrap();
        let f = b.finish().unwrap();
        m.define(f).unwrap();
        m
    }

    #[test]
    fn scalar_function_binds_params_and_return() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new(&mut m, "add");
        b.start(
            &[("a", TypeId::INT_BOT), ("b", TypeId::INT_BOT)],
            RetType::Scalar(TypeId::INT_BOT),
        )
        .unwrap();
        let (x, y) = (b.get("a").unwrap(), b.get("b").unwrap());
        let s = b.add(x, y).unwrap();
        b.ret(Some(s)).unwrap();
        m.define(b.finish().unwrap()).unwrap();
        let lir = compile(&mut m, &AbiConfig::system_v());
        let text = lir.to_string();
        assert!(text.contains("= param rdi"));
        assert!(text.contains("= param rsi"));
        assert!(text.contains("ret (rax="));
        assert!(verify_lir(&lir, &m).all_pass());
    }

    #[test]
    fn register_pair_return_loads_eightbytes() {
        let mut m = pair_module();
        let lir = compile(&mut m, &AbiConfig::system_v());
        let f = lir.function("make_pair").unwrap();
        let last = f.blocks.last().unwrap();
        let Term::Return(rets) = &last.term else {
            panic!("expected return");
        };
        let regs: Vec<Reg> = rets.iter().map(|(r, _)| *r).collect();
        assert_eq!(regs, vec![Reg::RAX, Reg::RDX]);
    }

    #[test]
    fn hidden_pointer_return_copies_into_buffer() {
        let mut m = pair_module();
        let lir = compile(&mut m, &AbiConfig::win64());
        let f = lir.function("make_pair").unwrap();
        let entry = &f.blocks[0];
        assert!(matches!(
            entry.insts[0],
            Inst::Param {
                loc: ArgLoc::Reg(Reg::Gpr(crate::abi::Gpr::Rcx)),
                ..
            }
        ));
        let stores = f
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i, Inst::Store { .. }))
            .count();
        assert_eq!(stores, 4, "two field stores plus two copy-out stores");
        assert!(verify_lir(&lir, &m).all_pass());
    }
}
