// abi.rs — Calling conventions and return strategies for x86-64
//
// Classifies a function signature into argument and return locations under
// an explicit `AbiConfig`. Lowering, code generation and the LIR machine all
// consume the same `CallLayout`, so caller and callee always agree.
//
// Preconditions: signature types come from the function's own `TypeTable`.
// Postconditions: every argument has exactly one location; aggregate
//                 returns fit the convention's register budget or travel
//                 through a hidden caller buffer.
// Failure modes: unsupported convention → `E0400`; aggregate over budget →
//                `E0401`; unknown name → `E0402`; unclassifiable param →
//                `E0403`.
// Side effects: none.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::diag::{codes, Diagnostic};
use crate::graph::{RetType, Signature};
use crate::id::TypeId;
use crate::layout::{align_up, struct_layout};
use crate::types::TypeTable;

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Target {
    X86_64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallingConv {
    SystemV,
    Win64,
    /// Known by name only; x86-64 cannot honor it.
    Aapcs64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AggregateReturn {
    /// Return struct bytes in registers, within the convention's budget.
    Registers,
    /// Caller passes a buffer as a hidden first integer argument; the callee
    /// fills it and returns its address in RAX.
    HiddenPointer,
}

impl FromStr for CallingConv {
    type Err = Diagnostic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system-v" | "systemv" | "sysv" => Ok(CallingConv::SystemV),
            "win64" | "windows" => Ok(CallingConv::Win64),
            "aapcs64" => Ok(CallingConv::Aapcs64),
            _ => Err(Diagnostic::error(
                codes::E0402,
                format!("unknown calling convention `{}`", s),
            )
            .with_hint("expected one of: system-v, win64, aapcs64")),
        }
    }
}

impl FromStr for AggregateReturn {
    type Err = Diagnostic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "registers" | "regs" => Ok(AggregateReturn::Registers),
            "hidden-pointer" | "hidden" | "sret" => Ok(AggregateReturn::HiddenPointer),
            _ => Err(Diagnostic::error(
                codes::E0402,
                format!("unknown aggregate return strategy `{}`", s),
            )
            .with_hint("expected one of: registers, hidden-pointer")),
        }
    }
}

impl fmt::Display for CallingConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallingConv::SystemV => "system-v",
            CallingConv::Win64 => "win64",
            CallingConv::Aapcs64 => "aapcs64",
        })
    }
}

/// A validated ABI configuration. Several may coexist in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AbiConfig {
    pub target: Target,
    pub conv: CallingConv,
    pub aggregate_return: AggregateReturn,
}

impl AbiConfig {
    pub fn new(
        target: Target,
        conv: CallingConv,
        aggregate_return: AggregateReturn,
    ) -> Result<Self, Diagnostic> {
        match (target, conv) {
            (Target::X86_64, CallingConv::SystemV | CallingConv::Win64) => Ok(AbiConfig {
                target,
                conv,
                aggregate_return,
            }),
            (Target::X86_64, CallingConv::Aapcs64) => Err(Diagnostic::error(
                codes::E0400,
                format!("calling convention `{}` is not supported on x86-64", conv),
            )
            .with_hint("use system-v or win64")),
        }
    }

    pub fn system_v() -> Self {
        AbiConfig {
            target: Target::X86_64,
            conv: CallingConv::SystemV,
            aggregate_return: AggregateReturn::Registers,
        }
    }

    pub fn win64() -> Self {
        AbiConfig {
            target: Target::X86_64,
            conv: CallingConv::Win64,
            aggregate_return: AggregateReturn::HiddenPointer,
        }
    }

    pub fn with_return(self, aggregate_return: AggregateReturn) -> Self {
        AbiConfig {
            aggregate_return,
            ..self
        }
    }

    pub fn int_arg_regs(&self) -> &'static [Reg] {
        use Gpr::*;
        const SYSV: [Reg; 6] = [
            Reg::Gpr(Rdi),
            Reg::Gpr(Rsi),
            Reg::Gpr(Rdx),
            Reg::Gpr(Rcx),
            Reg::Gpr(R8),
            Reg::Gpr(R9),
        ];
        const WIN: [Reg; 4] = [Reg::Gpr(Rcx), Reg::Gpr(Rdx), Reg::Gpr(R8), Reg::Gpr(R9)];
        match self.conv {
            CallingConv::Win64 => &WIN,
            _ => &SYSV,
        }
    }

    pub fn float_arg_regs(&self) -> &'static [Reg] {
        const SYSV: [Reg; 8] = [
            Reg::Xmm(0),
            Reg::Xmm(1),
            Reg::Xmm(2),
            Reg::Xmm(3),
            Reg::Xmm(4),
            Reg::Xmm(5),
            Reg::Xmm(6),
            Reg::Xmm(7),
        ];
        const WIN: [Reg; 4] = [Reg::Xmm(0), Reg::Xmm(1), Reg::Xmm(2), Reg::Xmm(3)];
        match self.conv {
            CallingConv::Win64 => &WIN,
            _ => &SYSV,
        }
    }

    /// Bytes the caller reserves above the return address for the callee.
    pub fn shadow_space(&self) -> u32 {
        match self.conv {
            CallingConv::Win64 => 32,
            _ => 0,
        }
    }

    /// Largest aggregate that may come back in registers.
    pub fn aggregate_budget(&self) -> u32 {
        match self.conv {
            CallingConv::Win64 => 8,
            _ => 16,
        }
    }

    /// Registers a call may clobber.
    pub fn caller_saved(&self) -> Vec<Reg> {
        use Gpr::*;
        let (gprs, xmms): (&[Gpr], u8) = match self.conv {
            CallingConv::Win64 => (&[Rax, Rcx, Rdx, R8, R9, R10, R11], 6),
            _ => (&[Rax, Rcx, Rdx, Rsi, Rdi, R8, R9, R10, R11], 16),
        };
        gprs.iter()
            .map(|&g| Reg::Gpr(g))
            .chain((0..xmms).map(Reg::Xmm))
            .collect()
    }
}

impl Default for AbiConfig {
    fn default() -> Self {
        Self::system_v()
    }
}

// ── Registers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ][self.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Gpr(Gpr),
    Xmm(u8),
}

impl Reg {
    pub const RAX: Reg = Reg::Gpr(Gpr::Rax);
    pub const RDX: Reg = Reg::Gpr(Gpr::Rdx);

    pub fn is_float(self) -> bool {
        matches!(self, Reg::Xmm(_))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Gpr(g) => f.write_str(g.name()),
            Reg::Xmm(i) => write!(f, "xmm{}", i),
        }
    }
}

// ── Classification ──────────────────────────────────────────────────────────

/// Where one argument lives at the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLoc {
    Reg(Reg),
    /// Byte offset from the first slot above the return address. Win64
    /// offsets include the shadow space.
    Stack(u32),
}

impl fmt::Display for ArgLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgLoc::Reg(r) => write!(f, "{}", r),
            ArgLoc::Stack(off) => write!(f, "stack+{}", off),
        }
    }
}

/// One eightbyte of an aggregate returned in registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetPiece {
    pub offset: u32,
    pub reg: Reg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetLoc {
    Void,
    Reg(Reg),
    /// Aggregate bytes split across registers.
    Pieces(Vec<RetPiece>),
    /// Aggregate written to the caller's buffer; its address comes back in RAX.
    Hidden { size: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLayout {
    pub args: Vec<ArgLoc>,
    pub ret: RetLoc,
    /// Register carrying the hidden return buffer, if any.
    pub hidden: Option<Reg>,
    /// Outgoing argument area the caller reserves, shadow space included,
    /// rounded to 16 bytes.
    pub stack_bytes: u32,
}

fn arg_is_float(types: &TypeTable, ty: TypeId, index: usize) -> Result<bool, Diagnostic> {
    if types.is_float(ty) {
        Ok(true)
    } else if types.as_int(ty).is_some() || types.is_pointer_like(ty) {
        Ok(false)
    } else {
        Err(Diagnostic::error(
            codes::E0403,
            format!(
                "parameter {} of type `{}` has no argument class",
                index,
                types.display(ty)
            ),
        )
        .with_hint("pass aggregates by pointer"))
    }
}

/// Classify a signature under `config`.
pub fn classify(
    config: &AbiConfig,
    types: &TypeTable,
    sig: &Signature,
) -> Result<CallLayout, Diagnostic> {
    let int_regs = config.int_arg_regs();
    let float_regs = config.float_arg_regs();

    let (ret, wants_hidden) = classify_return(config, types, sig.ret)?;

    let mut args = Vec::with_capacity(sig.params.len());
    let mut next_int = 0;
    let mut next_float = 0;
    let mut stack = config.shadow_space();
    let mut hidden = None;

    match config.conv {
        CallingConv::Win64 => {
            // Slots are positional across both register files.
            let mut slot = 0;
            if wants_hidden {
                hidden = Some(int_regs[0]);
                slot = 1;
            }
            for (i, (_, ty)) in sig.params.iter().enumerate() {
                let is_float = arg_is_float(types, *ty, i)?;
                let loc = if slot < int_regs.len() {
                    if is_float {
                        ArgLoc::Reg(float_regs[slot])
                    } else {
                        ArgLoc::Reg(int_regs[slot])
                    }
                } else {
                    let off = stack;
                    stack += 8;
                    ArgLoc::Stack(off)
                };
                slot += 1;
                args.push(loc);
            }
        }
        _ => {
            if wants_hidden {
                hidden = Some(int_regs[0]);
                next_int = 1;
            }
            for (i, (_, ty)) in sig.params.iter().enumerate() {
                let loc = if arg_is_float(types, *ty, i)? {
                    next_float += 1;
                    float_regs.get(next_float - 1).copied().map(ArgLoc::Reg)
                } else {
                    next_int += 1;
                    int_regs.get(next_int - 1).copied().map(ArgLoc::Reg)
                };
                let loc = loc.unwrap_or_else(|| {
                    let off = stack;
                    stack += 8;
                    ArgLoc::Stack(off)
                });
                args.push(loc);
            }
        }
    }

    Ok(CallLayout {
        args,
        ret,
        hidden,
        stack_bytes: align_up(stack, 16),
    })
}

fn classify_return(
    config: &AbiConfig,
    types: &TypeTable,
    ret: RetType,
) -> Result<(RetLoc, bool), Diagnostic> {
    match ret {
        RetType::Void => Ok((RetLoc::Void, false)),
        RetType::Scalar(ty) => {
            if types.is_float(ty) {
                Ok((RetLoc::Reg(Reg::Xmm(0)), false))
            } else {
                Ok((RetLoc::Reg(Reg::RAX), false))
            }
        }
        RetType::Aggregate(obj) => {
            let layout = struct_layout(types, obj)?;
            match config.aggregate_return {
                AggregateReturn::HiddenPointer => Ok((RetLoc::Hidden { size: layout.size }, true)),
                AggregateReturn::Registers => {
                    let budget = config.aggregate_budget();
                    let fits = match config.conv {
                        CallingConv::Win64 => matches!(layout.size, 1 | 2 | 4 | 8),
                        _ => layout.size <= budget,
                    };
                    if !fits {
                        return Err(Diagnostic::error(
                            codes::E0401,
                            format!(
                                "`{}` is {} bytes; {} returns at most {} bytes in registers",
                                layout.name, layout.size, config.conv, budget
                            ),
                        )
                        .with_hint("select the hidden-pointer return strategy"));
                    }
                    Ok((RetLoc::Pieces(eightbytes(config, &layout)), false))
                }
            }
        }
    }
}

/// Assign each eightbyte of a struct to the next free return register of
/// its class. An eightbyte is floating-point only if every field in it is.
fn eightbytes(config: &AbiConfig, layout: &crate::layout::StructLayout) -> Vec<RetPiece> {
    let ints = [Reg::RAX, Reg::RDX];
    let floats = [Reg::Xmm(0), Reg::Xmm(1)];
    let (mut ni, mut nf) = (0, 0);
    let count = layout.size.div_ceil(8);
    let mut pieces = Vec::with_capacity(count as usize);
    for k in 0..count {
        let lo = k * 8;
        let in_chunk: Vec<_> = layout
            .fields
            .iter()
            .filter(|f| f.offset >= lo && f.offset < lo + 8)
            .collect();
        let all_float = !in_chunk.is_empty()
            && in_chunk.iter().all(|f| f.kind.is_float())
            && config.conv == CallingConv::SystemV;
        let reg = if all_float {
            nf += 1;
            floats[nf - 1]
        } else {
            ni += 1;
            ints[ni - 1]
        };
        pieces.push(RetPiece { offset: lo, reg });
    }
    pieces
}

// ── Reports ─────────────────────────────────────────────────────────────────

/// Per-function calling summary serialized by `--emit layout`.
#[derive(Debug, Clone, Serialize)]
pub struct AbiReport {
    pub name: String,
    pub args: Vec<String>,
    pub ret: String,
    pub stack_bytes: u32,
}

impl AbiReport {
    pub fn new(name: &str, layout: &CallLayout) -> Self {
        let ret = match &layout.ret {
            RetLoc::Void => "void".to_string(),
            RetLoc::Reg(r) => r.to_string(),
            RetLoc::Pieces(ps) => ps
                .iter()
                .map(|p| format!("{}@{}", p.reg, p.offset))
                .collect::<Vec<_>>()
                .join(":"),
            RetLoc::Hidden { size } => match layout.hidden {
                Some(r) => format!("hidden({}, {} bytes) -> rax", r, size),
                None => format!("hidden({} bytes)", size),
            },
        };
        AbiReport {
            name: name.to_string(),
            args: layout.args.iter().map(ToString::to_string).collect(),
            ret,
            stack_bytes: layout.stack_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(params: &[TypeId], ret: RetType) -> Signature {
        Signature {
            params: params
                .iter()
                .enumerate()
                .map(|(i, t)| (format!("p{i}"), *t))
                .collect(),
            ret,
        }
    }

    fn pair(t: &mut TypeTable) -> TypeId {
        t.struct_type("Pair", &[("a", TypeId::INT_BOT), ("b", TypeId::INT_BOT)])
    }

    #[test]
    fn aapcs64_is_rejected_on_x86_64() {
        let err = AbiConfig::new(
            Target::X86_64,
            CallingConv::Aapcs64,
            AggregateReturn::Registers,
        )
        .unwrap_err();
        assert_eq!(err.code, Some(codes::E0400));
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert_eq!("win64".parse::<CallingConv>().unwrap(), CallingConv::Win64);
        assert_eq!(
            "hidden-pointer".parse::<AggregateReturn>().unwrap(),
            AggregateReturn::HiddenPointer
        );
        let err = "fastcall".parse::<CallingConv>().unwrap_err();
        assert_eq!(err.code, Some(codes::E0402));
    }

    #[test]
    fn system_v_counts_int_and_float_separately() {
        let t = TypeTable::new();
        let f = TypeId::FLOAT_BOT;
        let i = TypeId::INT_BOT;
        let s = sig(&[i, f, i, f, i, i, i, i, i], RetType::Scalar(i));
        let l = classify(&AbiConfig::system_v(), &t, &s).unwrap();
        let got: Vec<String> = l.args.iter().map(ToString::to_string).collect();
        assert_eq!(
            got,
            vec!["rdi", "xmm0", "rsi", "xmm1", "rdx", "rcx", "r8", "r9", "stack+0"]
        );
        assert_eq!(l.ret, RetLoc::Reg(Reg::RAX));
        assert_eq!(l.stack_bytes, 16);
    }

    #[test]
    fn win64_slots_are_positional_with_shadow_space() {
        let t = TypeTable::new();
        let f = TypeId::FLOAT_BOT;
        let i = TypeId::INT_BOT;
        let s = sig(&[i, f, i, f, i], RetType::Scalar(f));
        let l = classify(&AbiConfig::win64(), &t, &s).unwrap();
        let got: Vec<String> = l.args.iter().map(ToString::to_string).collect();
        assert_eq!(got, vec!["rcx", "xmm1", "r8", "xmm3", "stack+32"]);
        assert_eq!(l.ret, RetLoc::Reg(Reg::Xmm(0)));
        assert_eq!(l.stack_bytes, 48);
    }

    #[test]
    fn pair_returns_in_rax_rdx_under_system_v() {
        let mut t = TypeTable::new();
        let p = pair(&mut t);
        let s = sig(&[TypeId::INT_BOT, TypeId::INT_BOT], RetType::Aggregate(p));
        let l = classify(&AbiConfig::system_v(), &t, &s).unwrap();
        assert_eq!(
            l.ret,
            RetLoc::Pieces(vec![
                RetPiece { offset: 0, reg: Reg::RAX },
                RetPiece { offset: 8, reg: Reg::RDX },
            ])
        );
        assert_eq!(l.hidden, None);
    }

    #[test]
    fn hidden_pointer_takes_first_int_slot() {
        let mut t = TypeTable::new();
        let p = pair(&mut t);
        let s = sig(&[TypeId::INT_BOT, TypeId::INT_BOT], RetType::Aggregate(p));
        let cfg = AbiConfig::system_v().with_return(AggregateReturn::HiddenPointer);
        let l = classify(&cfg, &t, &s).unwrap();
        assert_eq!(l.hidden, Some(Reg::Gpr(Gpr::Rdi)));
        assert_eq!(l.args, vec![ArgLoc::Reg(Reg::Gpr(Gpr::Rsi)), ArgLoc::Reg(Reg::Gpr(Gpr::Rdx))]);
        assert_eq!(l.ret, RetLoc::Hidden { size: 16 });

        let l = classify(&AbiConfig::win64(), &t, &s).unwrap();
        assert_eq!(l.hidden, Some(Reg::Gpr(Gpr::Rcx)));
        assert_eq!(l.args, vec![ArgLoc::Reg(Reg::Gpr(Gpr::Rdx)), ArgLoc::Reg(Reg::Gpr(Gpr::R8))]);
    }

    #[test]
    fn win64_registers_reject_sixteen_byte_aggregate() {
        let mut t = TypeTable::new();
        let p = pair(&mut t);
        let s = sig(&[], RetType::Aggregate(p));
        let cfg = AbiConfig::win64().with_return(AggregateReturn::Registers);
        let err = classify(&cfg, &t, &s).unwrap_err();
        assert_eq!(err.code, Some(codes::E0401));
        assert!(err.to_string().contains("16 bytes"));
    }

    #[test]
    fn float_eightbytes_use_xmm_under_system_v() {
        let mut t = TypeTable::new();
        let v = t.struct_type("V", &[("x", TypeId::FLOAT_BOT), ("n", TypeId::INT_BOT)]);
        let s = sig(&[], RetType::Aggregate(v));
        let l = classify(&AbiConfig::system_v(), &t, &s).unwrap();
        assert_eq!(
            l.ret,
            RetLoc::Pieces(vec![
                RetPiece { offset: 0, reg: Reg::Xmm(0) },
                RetPiece { offset: 8, reg: Reg::RAX },
            ])
        );
    }

    #[test]
    fn aggregate_parameters_have_no_class() {
        let mut t = TypeTable::new();
        let p = pair(&mut t);
        let err = classify(&AbiConfig::system_v(), &t, &sig(&[p], RetType::Void)).unwrap_err();
        assert_eq!(err.code, Some(codes::E0403));
    }

    #[test]
    fn caller_saved_sets() {
        let sysv = AbiConfig::system_v().caller_saved();
        assert!(sysv.contains(&Reg::Gpr(Gpr::Rdi)));
        assert!(sysv.contains(&Reg::Xmm(15)));
        let win = AbiConfig::win64().caller_saved();
        assert!(!win.contains(&Reg::Gpr(Gpr::Rdi)));
        assert!(!win.contains(&Reg::Xmm(6)));
        assert_eq!(win.len(), 13);
    }
}
