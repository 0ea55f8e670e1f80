// codegen.rs — x86-64 assembly emission from LIR
//
// Prints each LIR function as Intel-syntax GNU assembly. Every virtual
// register owns an 8-byte frame slot below RBP; instructions load their
// operands into scratch registers (RAX, RCX, RDX, XMM0, XMM1), compute, and
// store the result back. Call sites marshal arguments into the registers and
// stack slots the call layout names, so the output links against any caller
// that honors the configured convention.
//
// Preconditions: `LirProgram` verified (R1-R3).
// Postconditions: returns `CodegenResult` with deterministic assembly text.
// Failure modes: a call to a function id with no LIR body produces a diagnostic.
// Side effects: none.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::debug;

use crate::abi::{ArgLoc, CallingConv, Reg};
use crate::diag::{codes, Diagnostic};
use crate::id::{BlockId, FuncId};
use crate::layout::{MemKind, ALLOC_ALIGN};
use crate::lir::*;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CodegenResult {
    pub generated: GeneratedCode,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug)]
pub struct GeneratedCode {
    pub asm: String,
}

#[derive(Debug, Clone)]
pub struct CodegenOptions {
    /// Annotate each instruction group with the LIR it came from.
    pub comments: bool,
    /// Zeroing allocator with the `calloc(count, size)` contract.
    pub alloc_symbol: String,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        CodegenOptions {
            comments: true,
            alloc_symbol: "calloc".to_string(),
        }
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

pub fn codegen(lir: &LirProgram, options: &CodegenOptions) -> CodegenResult {
    let mut ctx = CodegenCtx::new(lir, options);
    ctx.emit_all();
    let result = ctx.build_result();
    debug!("codegen: {} bytes of assembly", result.generated.asm.len());
    result
}

/// Assembly label of a block.
pub fn block_label(func: &str, block: BlockId) -> String {
    format!(".L{}_b{}", func, block.0)
}

// ── Internal context ────────────────────────────────────────────────────────

struct CodegenCtx<'a> {
    lir: &'a LirProgram,
    options: &'a CodegenOptions,
    symbols: HashMap<FuncId, &'a str>,
    out: String,
    diagnostics: Vec<Diagnostic>,
}

/// Frame of one function: vreg slots below RBP, outgoing area at RSP.
struct Frame {
    size: u32,
}

impl Frame {
    fn of(func: &LirFunction, shadow: u32) -> Frame {
        let outgoing = func
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter_map(|i| match i {
                Inst::Call { stack_bytes, .. } => Some(*stack_bytes),
                Inst::Alloc { .. } | Inst::AllocArray { .. } => Some(shadow),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        Frame {
            size: crate::layout::align_up(func.vregs * 8 + outgoing, 16),
        }
    }
}

fn slot(v: VReg) -> String {
    format!("qword ptr [rbp - {}]", (v.0 + 1) * 8)
}

impl<'a> CodegenCtx<'a> {
    fn new(lir: &'a LirProgram, options: &'a CodegenOptions) -> Self {
        let symbols = lir
            .functions
            .iter()
            .map(|f| (f.id, f.name.as_str()))
            .collect();
        CodegenCtx {
            lir,
            options,
            symbols,
            out: String::with_capacity(8192),
            diagnostics: Vec::new(),
        }
    }

    fn build_result(self) -> CodegenResult {
        CodegenResult {
            generated: GeneratedCode { asm: self.out },
            diagnostics: self.diagnostics,
        }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        self.out.push_str("    ");
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn comment(&mut self, what: &dyn std::fmt::Display) {
        if self.options.comments {
            let _ = writeln!(self.out, "    # {}", what);
        }
    }

    fn alloc_args(&self) -> (&'static str, &'static str) {
        match self.lir.config.conv {
            CallingConv::Win64 => ("rcx", "rdx"),
            _ => ("rdi", "rsi"),
        }
    }

    // ── Top-level emit ──────────────────────────────────────────────────

    fn emit_all(&mut self) {
        self.emit_preamble();
        let lir = self.lir;
        for func in &lir.functions {
            self.emit_function(func);
        }
    }

    fn emit_preamble(&mut self) {
        self.out.push_str("# Generated by snc (Sea-of-Nodes Compiler)\n");
        let _ = writeln!(
            self.out,
            "# conv={} aggregate_return={:?}",
            self.lir.config.conv, self.lir.config.aggregate_return
        );
        self.out.push_str(".intel_syntax noprefix\n");
        self.out.push_str(".text\n");
    }

    fn emit_function(&mut self, func: &LirFunction) {
        let frame = Frame::of(func, self.lir.config.shadow_space());
        let _ = writeln!(self.out, "\n.globl {}\n{}:", func.name, func.name);
        self.line("push rbp");
        self.line("mov rbp, rsp");
        if frame.size > 0 {
            self.line(format!("sub rsp, {}", frame.size));
        }
        for (i, block) in func.blocks.iter().enumerate() {
            let _ = writeln!(self.out, "{}:", block_label(&func.name, block.id));
            for inst in &block.insts {
                self.comment(inst);
                self.emit_inst(inst);
            }
            let next = func.blocks.get(i + 1).map(|b| b.id);
            self.comment(&block.term);
            self.emit_term(&func.name, &block.term, next);
        }
    }

    // ── Instructions ────────────────────────────────────────────────────

    fn emit_inst(&mut self, inst: &Inst) {
        match inst {
            Inst::Param { dst, loc } => match loc {
                ArgLoc::Reg(Reg::Gpr(g)) => self.line(format!("mov {}, {}", slot(*dst), g.name())),
                ArgLoc::Reg(Reg::Xmm(x)) => self.line(format!("movsd {}, xmm{}", slot(*dst), x)),
                ArgLoc::Stack(off) => {
                    self.line(format!("mov rax, qword ptr [rbp + {}]", 16 + off));
                    self.line(format!("mov {}, rax", slot(*dst)));
                }
            },
            Inst::Const { dst, value } => {
                self.line(format!("mov rax, {}", value));
                self.line(format!("mov {}, rax", slot(*dst)));
            }
            Inst::ConstF { dst, bits } => {
                self.line(format!("mov rax, {}", *bits as i64));
                self.line(format!("mov {}, rax", slot(*dst)));
            }
            Inst::Bin { op, dst, a, b } => self.emit_bin(*op, *dst, *a, *b),
            Inst::Un { op, dst, a } => {
                match op {
                    UnOp::Neg => {
                        self.line(format!("mov rax, {}", slot(*a)));
                        self.line("neg rax");
                    }
                    UnOp::Not => {
                        self.line(format!("mov rax, {}", slot(*a)));
                        self.line("test rax, rax");
                        self.line("sete al");
                        self.line("movzx eax, al");
                    }
                    UnOp::ToFloat => {
                        self.line(format!("cvtsi2sd xmm0, {}", slot(*a)));
                        self.line("movq rax, xmm0");
                    }
                    UnOp::ToInt => {
                        self.line(format!("cvttsd2si rax, {}", slot(*a)));
                    }
                }
                self.line(format!("mov {}, rax", slot(*dst)));
            }
            Inst::Copy { dst, src } => {
                self.line(format!("mov rax, {}", slot(*src)));
                self.line(format!("mov {}, rax", slot(*dst)));
            }
            Inst::Alloc { dst, size } => {
                let (count, bytes) = self.alloc_args();
                self.line(format!("mov {}, 1", count));
                self.line(format!("mov {}, {}", bytes, size));
                self.line(format!("call {}", self.options.alloc_symbol));
                self.line(format!("mov {}, rax", slot(*dst)));
            }
            Inst::AllocArray {
                dst,
                len,
                base,
                scale,
            } => {
                let (count, bytes) = self.alloc_args();
                self.line(format!("mov rax, {}", slot(*len)));
                self.line(format!("imul rax, rax, {}", scale));
                self.line(format!("add rax, {}", base + ALLOC_ALIGN - 1));
                self.line(format!("and rax, -{}", ALLOC_ALIGN));
                self.line(format!("mov {}, rax", bytes));
                self.line(format!("mov {}, 1", count));
                self.line(format!("call {}", self.options.alloc_symbol));
                self.line(format!("mov {}, rax", slot(*dst)));
                self.line(format!("mov rcx, {}", slot(*len)));
                self.line("mov dword ptr [rax], ecx");
            }
            Inst::Load {
                dst,
                kind,
                base,
                offset,
            } => {
                self.line(format!("mov rax, {}", slot(*base)));
                self.line(format!("add rax, {}", slot(*offset)));
                self.line(match kind {
                    MemKind::I8 => "movsx rax, byte ptr [rax]",
                    MemKind::U8 => "movzx eax, byte ptr [rax]",
                    MemKind::I16 => "movsx rax, word ptr [rax]",
                    MemKind::U16 => "movzx eax, word ptr [rax]",
                    MemKind::I32 => "movsxd rax, dword ptr [rax]",
                    MemKind::U32 => "mov eax, dword ptr [rax]",
                    MemKind::I64 | MemKind::F64 | MemKind::Ptr => "mov rax, qword ptr [rax]",
                });
                self.line(format!("mov {}, rax", slot(*dst)));
            }
            Inst::Store {
                kind,
                base,
                offset,
                src,
            } => {
                self.line(format!("mov rax, {}", slot(*base)));
                self.line(format!("add rax, {}", slot(*offset)));
                self.line(format!("mov rcx, {}", slot(*src)));
                self.line(match kind.size() {
                    1 => "mov byte ptr [rax], cl",
                    2 => "mov word ptr [rax], cx",
                    4 => "mov dword ptr [rax], ecx",
                    _ => "mov qword ptr [rax], rcx",
                });
            }
            Inst::Call {
                func, args, rets, ..
            } => self.emit_call(*func, args, rets),
        }
    }

    fn emit_bin(&mut self, op: BinOp, dst: VReg, a: VReg, b: VReg) {
        let float = matches!(
            op,
            BinOp::AddF | BinOp::SubF | BinOp::MulF | BinOp::DivF | BinOp::EqF | BinOp::LtF | BinOp::LeF
        );
        if float {
            self.line(format!("movsd xmm0, {}", slot(a)));
            self.line(format!("movsd xmm1, {}", slot(b)));
            match op {
                BinOp::AddF => self.line("addsd xmm0, xmm1"),
                BinOp::SubF => self.line("subsd xmm0, xmm1"),
                BinOp::MulF => self.line("mulsd xmm0, xmm1"),
                BinOp::DivF => self.line("divsd xmm0, xmm1"),
                BinOp::EqF => {
                    self.line("ucomisd xmm0, xmm1");
                    self.line("sete al");
                    self.line("setnp cl");
                    self.line("and al, cl");
                    self.line("movzx eax, al");
                    self.line(format!("mov {}, rax", slot(dst)));
                    return;
                }
                BinOp::LtF | BinOp::LeF => {
                    // a < b  <=>  b > a, which is false on unordered operands.
                    self.line("ucomisd xmm1, xmm0");
                    self.line(if op == BinOp::LtF { "seta al" } else { "setae al" });
                    self.line("movzx eax, al");
                    self.line(format!("mov {}, rax", slot(dst)));
                    return;
                }
                _ => {}
            }
            self.line(format!("movsd {}, xmm0", slot(dst)));
            return;
        }
        self.line(format!("mov rax, {}", slot(a)));
        self.line(format!("mov rcx, {}", slot(b)));
        match op {
            BinOp::Add => self.line("add rax, rcx"),
            BinOp::Sub => self.line("sub rax, rcx"),
            BinOp::Mul => self.line("imul rax, rcx"),
            BinOp::Div => {
                self.line("cqo");
                self.line("idiv rcx");
            }
            BinOp::And => self.line("and rax, rcx"),
            BinOp::Or => self.line("or rax, rcx"),
            BinOp::Xor => self.line("xor rax, rcx"),
            BinOp::Shl => self.line("shl rax, cl"),
            BinOp::Shr => self.line("shr rax, cl"),
            BinOp::Sar => self.line("sar rax, cl"),
            BinOp::Eq | BinOp::Lt | BinOp::Le => {
                self.line("cmp rax, rcx");
                self.line(match op {
                    BinOp::Eq => "sete al",
                    BinOp::Lt => "setl al",
                    _ => "setle al",
                });
                self.line("movzx eax, al");
            }
            _ => {}
        }
        self.line(format!("mov {}, rax", slot(dst)));
    }

    fn emit_call(&mut self, func: FuncId, args: &[(ArgLoc, VReg)], rets: &[(Reg, VReg)]) {
        let Some(name) = self.symbols.get(&func).copied() else {
            self.diagnostics.push(Diagnostic::error(
                codes::E0501,
                format!("call to {} which has no body", func),
            ));
            return;
        };
        // Stack arguments go through RAX, which never carries an argument.
        for (loc, v) in args {
            if let ArgLoc::Stack(off) = loc {
                self.line(format!("mov rax, {}", slot(*v)));
                self.line(format!("mov qword ptr [rsp + {}], rax", off));
            }
        }
        for (loc, v) in args {
            match loc {
                ArgLoc::Reg(Reg::Gpr(g)) => self.line(format!("mov {}, {}", g.name(), slot(*v))),
                ArgLoc::Reg(Reg::Xmm(x)) => self.line(format!("movsd xmm{}, {}", x, slot(*v))),
                ArgLoc::Stack(_) => {}
            }
        }
        self.line(format!("call {}", name));
        for (reg, v) in rets {
            match reg {
                Reg::Gpr(g) => self.line(format!("mov {}, {}", slot(*v), g.name())),
                Reg::Xmm(x) => self.line(format!("movsd {}, xmm{}", slot(*v), x)),
            }
        }
    }

    // ── Terminators ─────────────────────────────────────────────────────

    fn emit_term(&mut self, func: &str, term: &Term, next: Option<BlockId>) {
        match term {
            Term::Jump(to) => {
                if next != Some(*to) {
                    self.line(format!("jmp {}", block_label(func, *to)));
                }
            }
            Term::Branch { cond, then, els } => {
                self.line(format!("mov rax, {}", slot(*cond)));
                self.line("test rax, rax");
                self.line(format!("jne {}", block_label(func, *then)));
                if next != Some(*els) {
                    self.line(format!("jmp {}", block_label(func, *els)));
                }
            }
            Term::Return(rets) => {
                for (reg, v) in rets {
                    match reg {
                        Reg::Gpr(g) => self.line(format!("mov {}, {}", g.name(), slot(*v))),
                        Reg::Xmm(x) => self.line(format!("movsd xmm{}, {}", x, slot(*v))),
                    }
                }
                self.line("mov rsp, rbp");
                self.line("pop rbp");
                self.line("ret");
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiConfig;
    use crate::builder::FunctionBuilder;
    use crate::graph::{Module, RetType};
    use crate::id::TypeId;
    use crate::lir::build_lir;
    use crate::optimize::optimize;
    use crate::schedule::schedule;

    fn compile(module: &mut Module, config: &AbiConfig, options: &CodegenOptions) -> String {
        let mut schedules = HashMap::new();
        for func in module.functions_mut() {
            optimize(&mut func.graph).unwrap();
            schedules.insert(func.id, schedule(&mut func.graph).unwrap());
        }
        let lir = build_lir(module, &schedules, config).unwrap();
        let result = codegen(&lir, options);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        result.generated.asm
    }

    fn one() -> Module {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new(&mut m, "one");
        b.start(&[], RetType::Scalar(TypeId::INT_BOT)).unwrap();
        let c = b.con(1);
        b.ret(Some(c)).unwrap();
        m.define(b.finish().unwrap()).unwrap();
        m
    }

    #[test]
    fn constant_function_snapshot() {
        let options = CodegenOptions {
            comments: false,
            ..CodegenOptions::default()
        };
        let asm = compile(&mut one(), &AbiConfig::system_v(), &options);
        insta::assert_snapshot!(asm, @r"
        # Generated by snc (Sea-of-Nodes Compiler)
        # conv=system-v aggregate_return=Registers
        .intel_syntax noprefix
        .text

        .globl one
        one:
            push rbp
            mov rbp, rsp
            sub rsp, 16
        .Lone_b0:
            mov rax, 1
            mov qword ptr [rbp - 8], rax
            mov rax, qword ptr [rbp - 8]
            mov rsp, rbp
            pop rbp
            ret
        ");
    }

    fn caller_module() -> Module {
        let mut m = Module::new();
        let callee = m.declare("sum2");
        let mut b = FunctionBuilder::new(&mut m, "sum2");
        b.start(
            &[("a", TypeId::INT_BOT), ("b", TypeId::INT_BOT)],
            RetType::Scalar(TypeId::INT_BOT),
        )
        .unwrap();
        let (x, y) = (b.get("a").unwrap(), b.get("b").unwrap());
        let s = b.add(x, y).unwrap();
        b.ret(Some(s)).unwrap();
        m.define(b.finish().unwrap()).unwrap();

        let mut b = FunctionBuilder::new(&mut m, "caller");
        b.start(&[("x", TypeId::INT_BOT)], RetType::Scalar(TypeId::INT_BOT))
            .unwrap();
        let x = b.get("x").unwrap();
        let seven = b.con(7);
        let r = b.call(callee, TypeId::INT_BOT, &[x, seven]).unwrap();
        b.ret(Some(r)).unwrap();
        m.define(b.finish().unwrap()).unwrap();
        m
    }

    #[test]
    fn call_marshals_arguments_per_convention() {
        let sysv = compile(&mut caller_module(), &AbiConfig::system_v(), &CodegenOptions::default());
        assert!(sysv.contains("mov rdi, "));
        assert!(sysv.contains("mov rsi, "));
        assert!(sysv.contains("call sum2"));

        let win = compile(&mut caller_module(), &AbiConfig::win64(), &CodegenOptions::default());
        assert!(win.contains("mov rcx, qword ptr"));
        assert!(win.contains("mov rdx, qword ptr"));
    }

    #[test]
    fn output_is_deterministic() {
        let options = CodegenOptions::default();
        let a = compile(&mut one(), &AbiConfig::system_v(), &options);
        let b = compile(&mut one(), &AbiConfig::system_v(), &options);
        assert_eq!(a, b);
    }
}
