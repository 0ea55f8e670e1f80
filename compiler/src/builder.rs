// builder.rs — Structured construction facade over the node graph
//
// Plays the front end's role: tracks variables in a `Scope` node (slot 0
// control, slot 1 memory, slots 2.. variables), creates phis at merges and
// loop heads, seals regions, and wires returns into `Stop`. Every node goes
// through `Graph::create`, so construction-time peepholes and value
// numbering apply.
//
// Preconditions: `start` is called before any other operation.
// Postconditions: `finish` returns a function whose regions are all sealed
//                 and whose graph holds no scope or pinned nodes.
// Failure modes: unknown variable → `E0200`; access through a non-pointer
//                → `E0201`; unknown field → `E0202`; missing return →
//                `E0203`; int/float operand mix → `E0204`; graph contract
//                violations propagate.
// Side effects: none.

use crate::diag::{codes, Diagnostic};
use crate::graph::{Function, Graph, Module, RetType, Signature};
use crate::id::{FuncId, NodeId, TypeId};
use crate::layout::{array_layout, struct_layout, ARRAY_LEN_OFFSET};
use crate::node::Op;
use crate::types::{Nil, Type, TypeTable};

const CTRL: usize = 0;
const MEM: usize = 1;
const VARS: usize = 2;

pub struct FunctionBuilder {
    graph: Graph,
    id: FuncId,
    name: String,
    sig: Signature,
    scope: NodeId,
    vars: Vec<(String, TypeId)>,
    /// Values handed to the caller stay alive until `finish`.
    pinned: Vec<NodeId>,
}

impl FunctionBuilder {
    /// Declare `name` in `module` and open an empty body.
    pub fn new(module: &mut Module, name: &str) -> Self {
        let id = module.declare(name);
        let mut graph = Graph::new();
        let scope = graph.alloc(Op::Scope, vec![None, None]);
        graph.keep(scope);
        FunctionBuilder {
            graph,
            id,
            name: name.to_string(),
            sig: Signature {
                params: Vec::new(),
                ret: RetType::Void,
            },
            scope,
            vars: Vec::new(),
            pinned: Vec::new(),
        }
    }

    pub fn id(&self) -> FuncId {
        self.id
    }

    pub fn types(&mut self) -> &mut TypeTable {
        &mut self.graph.types
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Create `Start` and bind each parameter to a variable of its name.
    pub fn start(&mut self, params: &[(&str, TypeId)], ret: RetType) -> Result<(), Diagnostic> {
        let mut elems = vec![TypeId::CTRL, TypeId::MEM];
        elems.extend(params.iter().map(|(_, t)| *t));
        let tuple = self.graph.types.tuple(elems);
        let start = self.graph.create(Op::Start(tuple), &[])?;
        let ctrl = self.graph.create(Op::CProj(0), &[Some(start)])?;
        let mem = self.graph.create(Op::Proj(1), &[Some(start)])?;
        self.graph.set_input(self.scope, CTRL, Some(ctrl));
        self.graph.set_input(self.scope, MEM, Some(mem));
        for (i, (name, ty)) in params.iter().enumerate() {
            let p = self.graph.create(Op::Proj(2 + i as u32), &[Some(start)])?;
            self.define_typed(name, *ty, p)?;
        }
        self.sig = Signature {
            params: params.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            ret,
        };
        Ok(())
    }

    // ── Scope plumbing ──

    fn ctrl(&self) -> Option<NodeId> {
        self.graph.input(self.scope, CTRL)
    }

    fn mem(&self) -> Option<NodeId> {
        self.graph.input(self.scope, MEM)
    }

    fn set_mem(&mut self, mem: NodeId) {
        self.graph.set_input(self.scope, MEM, Some(mem));
    }

    fn out(&mut self, n: NodeId) -> NodeId {
        self.graph.keep(n);
        self.pinned.push(n);
        n
    }

    fn dup_scope(&mut self) -> NodeId {
        let inputs = self.graph.inputs(self.scope).to_vec();
        let s = self.graph.alloc(Op::Scope, inputs);
        self.graph.keep(s);
        s
    }

    fn slot_decl(&self, slot: usize) -> TypeId {
        if slot == MEM {
            TypeId::MEM
        } else {
            self.vars[slot - VARS].1
        }
    }

    /// Drop variables declared after `depth`.
    fn pop_vars(&mut self, depth: usize) {
        while self.vars.len() > depth {
            self.vars.pop();
            let last = self.graph.inputs(self.scope).len() - 1;
            self.graph.remove_input(self.scope, last);
        }
    }

    /// The declared type a variable gets from its initial value.
    fn widen(&mut self, ty: TypeId) -> TypeId {
        match self.graph.types.get(ty).clone() {
            Type::Int { .. } => TypeId::INT_BOT,
            Type::Float(_) => TypeId::FLOAT_BOT,
            Type::Ptr { obj, nil } if nil.is_high() => self.graph.types.ptr(obj, Nil::MaybeNil),
            _ => ty,
        }
    }

    // ── Variables ──

    fn var_index(&self, name: &str) -> Result<usize, Diagnostic> {
        self.vars
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                Diagnostic::error(codes::E0200, format!("unknown variable `{}`", name))
            })
    }

    pub fn define(&mut self, name: &str, value: NodeId) -> Result<(), Diagnostic> {
        let ty = self.graph.ty(value);
        let decl = self.widen(ty);
        self.define_typed(name, decl, value)
    }

    /// Define a variable with an explicit declared type (e.g. a nullable
    /// pointer initialized to `null`).
    pub fn define_typed(&mut self, name: &str, ty: TypeId, value: NodeId) -> Result<(), Diagnostic> {
        if self.vars.iter().any(|(n, _)| n == name) {
            return Err(Diagnostic::error(
                codes::E0200,
                format!("variable `{}` is already defined", name),
            ));
        }
        self.graph.add_input(self.scope, Some(value));
        self.vars.push((name.to_string(), ty));
        Ok(())
    }

    pub fn get(&mut self, name: &str) -> Result<NodeId, Diagnostic> {
        let i = self.var_index(name)?;
        let v = self.graph.input(self.scope, VARS + i).ok_or_else(|| {
            Diagnostic::error(codes::E0200, format!("variable `{}` has no value", name))
        })?;
        Ok(self.out(v))
    }

    pub fn set(&mut self, name: &str, value: NodeId) -> Result<(), Diagnostic> {
        let i = self.var_index(name)?;
        self.graph.set_input(self.scope, VARS + i, Some(value));
        Ok(())
    }

    // ── Values ──

    pub fn con(&mut self, value: i64) -> NodeId {
        let c = self.graph.con_int(value);
        self.out(c)
    }

    pub fn con_f(&mut self, value: f64) -> NodeId {
        let t = self.graph.types.float_con(value);
        let c = self.graph.constant(t);
        self.out(c)
    }

    pub fn null(&mut self) -> NodeId {
        let c = self.graph.constant(TypeId::NIL);
        self.out(c)
    }

    pub fn bin(&mut self, op: Op, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        let n = self.graph.create(op, &[None, Some(a), Some(b)])?;
        Ok(self.out(n))
    }

    pub fn unary(&mut self, op: Op, x: NodeId) -> Result<NodeId, Diagnostic> {
        let n = self.graph.create(op, &[None, Some(x)])?;
        Ok(self.out(n))
    }

    fn is_float(&self, n: NodeId) -> bool {
        self.graph.types.is_float(self.graph.ty(n))
    }

    fn operand_mismatch(&self, what: &str, a: NodeId, b: Option<NodeId>) -> Diagnostic {
        let show = |n: NodeId| self.graph.types.display(self.graph.ty(n)).to_string();
        let found = match b {
            Some(b) => format!("{} and {}", show(a), show(b)),
            None => show(a),
        };
        let mut d = Diagnostic::error(codes::E0204, format!("{} of {}", what, found))
            .with_related(a, "operand")
            .with_hint("convert with to_float or to_int first");
        if let Some(b) = b {
            d = d.with_related(b, "operand");
        }
        d
    }

    /// Integer op when both operands are integers, float op when both are
    /// floats; a mix is rejected.
    fn numeric(&mut self, int: Op, float: Op, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        match (self.is_float(a), self.is_float(b)) {
            (false, false) => self.bin(int, a, b),
            (true, true) => self.bin(float, a, b),
            _ => Err(self.operand_mismatch(&format!("`{}` mixes int and float", int), a, Some(b))),
        }
    }

    fn int_only(&mut self, op: Op, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        if self.is_float(a) || self.is_float(b) {
            return Err(self.operand_mismatch(&format!("`{}` needs integers", op), a, Some(b)));
        }
        self.bin(op, a, b)
    }

    fn float_only(&mut self, op: Op, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        if !self.is_float(a) || !self.is_float(b) {
            return Err(self.operand_mismatch(&format!("`{}` needs floats", op), a, Some(b)));
        }
        self.bin(op, a, b)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.numeric(Op::Add, Op::AddF, a, b)
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.numeric(Op::Sub, Op::SubF, a, b)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.numeric(Op::Mul, Op::MulF, a, b)
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.numeric(Op::Div, Op::DivF, a, b)
    }

    pub fn shr(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.int_only(Op::Shr, a, b)
    }

    pub fn eq(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.numeric(Op::Eq, Op::EqF, a, b)
    }

    pub fn ne(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        let e = self.eq(a, b)?;
        self.not(e)
    }

    pub fn lt(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.numeric(Op::Lt, Op::LtF, a, b)
    }

    pub fn le(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.numeric(Op::Le, Op::LeF, a, b)
    }

    pub fn gt(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.lt(b, a)
    }

    pub fn ge(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.le(b, a)
    }

    // Explicitly float forms; integer operands are rejected.

    pub fn add_f(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.float_only(Op::AddF, a, b)
    }

    pub fn sub_f(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.float_only(Op::SubF, a, b)
    }

    pub fn mul_f(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.float_only(Op::MulF, a, b)
    }

    pub fn div_f(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.float_only(Op::DivF, a, b)
    }

    pub fn lt_f(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, Diagnostic> {
        self.float_only(Op::LtF, a, b)
    }

    pub fn not(&mut self, x: NodeId) -> Result<NodeId, Diagnostic> {
        self.unary(Op::Not, x)
    }

    /// Integer negation; floats negate as `-1.0 * x`, which keeps the sign
    /// of zero right.
    pub fn neg(&mut self, x: NodeId) -> Result<NodeId, Diagnostic> {
        if self.is_float(x) {
            let m = self.con_f(-1.0);
            return self.bin(Op::MulF, m, x);
        }
        self.unary(Op::Neg, x)
    }

    pub fn to_float(&mut self, x: NodeId) -> Result<NodeId, Diagnostic> {
        if self.is_float(x) {
            return Err(self.operand_mismatch("to_float", x, None));
        }
        self.unary(Op::ToFloat, x)
    }

    /// Truncating float-to-integer conversion.
    pub fn to_int(&mut self, x: NodeId) -> Result<NodeId, Diagnostic> {
        if !self.is_float(x) {
            return Err(self.operand_mismatch("to_int", x, None));
        }
        self.unary(Op::ToInt, x)
    }

    // ── Control flow ──

    /// Split on `cond`, returning the (true, false) control projections.
    fn branch(&mut self, cond: NodeId) -> Result<(NodeId, NodeId), Diagnostic> {
        let ctrl = self.ctrl();
        let iff = self.graph.create(Op::If, &[ctrl, Some(cond)])?;
        self.graph.keep(iff);
        let t = self.graph.create(Op::CProj(0), &[Some(iff)])?;
        self.graph.keep(t);
        let f = self.graph.create(Op::CProj(1), &[Some(iff)])?;
        self.graph.keep(f);
        self.graph.release(iff);
        Ok((t, f))
    }

    pub fn if_else(
        &mut self,
        cond: NodeId,
        then_branch: impl FnOnce(&mut Self) -> Result<(), Diagnostic>,
        else_branch: impl FnOnce(&mut Self) -> Result<(), Diagnostic>,
    ) -> Result<(), Diagnostic> {
        let (t, f) = self.branch(cond)?;
        let depth = self.vars.len();
        let else_scope = self.dup_scope();
        self.graph.set_input(else_scope, CTRL, Some(f));
        self.graph.set_input(self.scope, CTRL, Some(t));
        self.graph.release(t);
        self.graph.release(f);

        then_branch(self)?;
        self.pop_vars(depth);
        let then_scope = std::mem::replace(&mut self.scope, else_scope);
        else_branch(self)?;
        self.pop_vars(depth);
        self.merge(then_scope)
    }

    pub fn if_then(
        &mut self,
        cond: NodeId,
        then_branch: impl FnOnce(&mut Self) -> Result<(), Diagnostic>,
    ) -> Result<(), Diagnostic> {
        self.if_else(cond, then_branch, |_| Ok(()))
    }

    /// Merge `other` into the current scope through a fresh region.
    fn merge(&mut self, other: NodeId) -> Result<(), Diagnostic> {
        let a = self.graph.input(other, CTRL);
        let b = self.ctrl();
        let region = self.graph.create(Op::Region, &[None, a, b])?;
        self.graph.keep(region);
        let slots = self.graph.inputs(self.scope).len();
        for slot in MEM..slots {
            let (x, y) = (self.graph.input(other, slot), self.graph.input(self.scope, slot));
            if x != y {
                let decl = self.slot_decl(slot);
                let phi = self.graph.create(Op::Phi(decl), &[Some(region), x, y])?;
                self.graph.set_input(self.scope, slot, Some(phi));
            }
        }
        self.graph.set_input(self.scope, CTRL, Some(region));
        self.graph.release(other);
        self.graph.release(region);
        self.graph.seal(region)
    }

    /// `while (cond) body`. Every live variable and memory get a loop phi;
    /// phis that stay unchanged fold away when the loop is sealed.
    pub fn while_loop(
        &mut self,
        cond: impl FnOnce(&mut Self) -> Result<NodeId, Diagnostic>,
        body: impl FnOnce(&mut Self) -> Result<(), Diagnostic>,
    ) -> Result<(), Diagnostic> {
        let entry = self.ctrl();
        let head = self.graph.create(Op::Loop, &[None, entry, None])?;
        self.graph.keep(head);
        let mut phis = Vec::new();
        for slot in MEM..self.graph.inputs(self.scope).len() {
            let v = self.graph.input(self.scope, slot);
            let decl = self.slot_decl(slot);
            let phi = self.graph.create(Op::Phi(decl), &[Some(head), v, None])?;
            self.graph.set_input(self.scope, slot, Some(phi));
            phis.push((slot, phi));
        }
        self.graph.set_input(self.scope, CTRL, Some(head));

        let depth = self.vars.len();
        let c = cond(self)?;
        let (t, f) = self.branch(c)?;
        let exit = self.dup_scope();
        self.graph.set_input(exit, CTRL, Some(f));
        self.graph.set_input(self.scope, CTRL, Some(t));
        self.graph.release(t);
        self.graph.release(f);

        body(self)?;
        self.pop_vars(depth);

        let back = self.ctrl();
        self.graph.set_input(head, 2, back);
        for (slot, phi) in phis {
            if !self.graph.is_dead(phi) {
                let v = self.graph.input(self.scope, slot);
                self.graph.set_input(phi, 2, v);
            }
        }
        let body_scope = std::mem::replace(&mut self.scope, exit);
        self.graph.release(body_scope);
        self.graph.seal(head)?;
        self.graph.release(head);
        Ok(())
    }

    /// `for (var = from; var < to; var++) body`, with `to` evaluated once.
    pub fn for_range(
        &mut self,
        var: &str,
        from: NodeId,
        to: NodeId,
        body: impl FnOnce(&mut Self) -> Result<(), Diagnostic>,
    ) -> Result<(), Diagnostic> {
        let depth = self.vars.len();
        self.define(var, from)?;
        self.while_loop(
            |b| {
                let i = b.get(var)?;
                b.lt(i, to)
            },
            |b| {
                body(b)?;
                let i = b.get(var)?;
                let one = b.con(1);
                let next = b.add(i, one)?;
                b.set(var, next)
            },
        )?;
        self.pop_vars(depth);
        Ok(())
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> Result<(), Diagnostic> {
        match (self.sig.ret, value) {
            (RetType::Void, Some(_)) => {
                return Err(Diagnostic::error(
                    codes::E0203,
                    format!("`{}` returns no value", self.name),
                ))
            }
            (RetType::Scalar(_) | RetType::Aggregate(_), None) => {
                return Err(Diagnostic::error(
                    codes::E0203,
                    format!("`{}` must return a value", self.name),
                ))
            }
            _ => {}
        }
        let (ctrl, mem) = (self.ctrl(), self.mem());
        let r = self.graph.create(Op::Return, &[ctrl, mem, value])?;
        let stop = self.graph.stop();
        self.graph.add_input(stop, Some(r));
        let dead = self.graph.constant(TypeId::XCTRL);
        self.graph.set_input(self.scope, CTRL, Some(dead));
        Ok(())
    }

    // ── Memory ──

    fn obj_of(&self, ptr: NodeId) -> Result<TypeId, Diagnostic> {
        let types = &self.graph.types;
        let t = self.graph.ty(ptr);
        match types.ptr_obj(t) {
            Some((obj, _)) if types.struct_fields(obj).is_some() => Ok(obj),
            _ => Err(Diagnostic::error(
                codes::E0201,
                format!(
                    "{} of type `{}` is not a pointer to a known shape",
                    self.graph.label(ptr),
                    types.display(t)
                ),
            )
            .at(ptr)),
        }
    }

    fn load(&mut self, decl: TypeId, ptr: NodeId, off: NodeId) -> Result<NodeId, Diagnostic> {
        let (ctrl, mem) = (self.ctrl(), self.mem());
        let ld = self
            .graph
            .create(Op::Load(decl), &[ctrl, mem, Some(ptr), Some(off)])?;
        Ok(self.out(ld))
    }

    fn store(
        &mut self,
        decl: TypeId,
        ptr: NodeId,
        off: NodeId,
        value: NodeId,
    ) -> Result<(), Diagnostic> {
        let (ctrl, mem) = (self.ctrl(), self.mem());
        let st = self.graph.create(
            Op::Store(decl),
            &[ctrl, mem, Some(ptr), Some(off), Some(value)],
        )?;
        self.set_mem(st);
        Ok(())
    }

    fn field_slot(&mut self, ptr: NodeId, field: &str) -> Result<(TypeId, NodeId), Diagnostic> {
        let obj = self.obj_of(ptr)?;
        let layout = struct_layout(&self.graph.types, obj)?;
        let (ty, offset) = match (self.graph.types.field(obj, field), layout.field(field)) {
            (Some((_, f)), Some(fl)) => (f.ty, fl.offset),
            _ => {
                return Err(Diagnostic::error(
                    codes::E0202,
                    format!("`{}` has no field `{}`", layout.name, field),
                )
                .at(ptr))
            }
        };
        let off = self.graph.con_int(offset as i64);
        Ok((ty, off))
    }

    fn elem_slot(&mut self, arr: NodeId, idx: NodeId) -> Result<(TypeId, NodeId), Diagnostic> {
        let obj = self.obj_of(arr)?;
        let elem = self.graph.types.array_elem(obj).ok_or_else(|| {
            Diagnostic::error(
                codes::E0201,
                format!("{} is not an array", self.graph.label(arr)),
            )
            .at(arr)
        })?;
        let layout = array_layout(&self.graph.types, obj)?;
        let shift = layout.scale.trailing_zeros() as i64;
        let scaled = if shift == 0 {
            idx
        } else {
            let k = self.con(shift);
            self.bin(Op::Shl, idx, k)?
        };
        let base = self.con(layout.base as i64);
        let off = self.add(scaled, base)?;
        Ok((elem, off))
    }

    pub fn load_field(&mut self, ptr: NodeId, field: &str) -> Result<NodeId, Diagnostic> {
        let (ty, off) = self.field_slot(ptr, field)?;
        self.load(ty, ptr, off)
    }

    pub fn store_field(&mut self, ptr: NodeId, field: &str, value: NodeId) -> Result<(), Diagnostic> {
        let (ty, off) = self.field_slot(ptr, field)?;
        self.store(ty, ptr, off, value)
    }

    pub fn load_elem(&mut self, arr: NodeId, idx: NodeId) -> Result<NodeId, Diagnostic> {
        let (ty, off) = self.elem_slot(arr, idx)?;
        self.load(ty, arr, off)
    }

    pub fn store_elem(&mut self, arr: NodeId, idx: NodeId, value: NodeId) -> Result<(), Diagnostic> {
        let (ty, off) = self.elem_slot(arr, idx)?;
        self.store(ty, arr, off, value)
    }

    pub fn array_len(&mut self, arr: NodeId) -> Result<NodeId, Diagnostic> {
        let obj = self.obj_of(arr)?;
        if !self.graph.types.is_array(obj) {
            return Err(Diagnostic::error(
                codes::E0201,
                format!("{} is not an array", self.graph.label(arr)),
            )
            .at(arr));
        }
        let off = self.graph.con_int(ARRAY_LEN_OFFSET as i64);
        self.load(TypeId::U32, arr, off)
    }

    fn allocate(&mut self, obj: TypeId, len: Option<NodeId>) -> Result<NodeId, Diagnostic> {
        let (ctrl, mem) = (self.ctrl(), self.mem());
        let n = self.graph.create(Op::New(obj), &[ctrl, mem, len])?;
        self.graph.keep(n);
        let ptr = self.graph.create(Op::Proj(0), &[Some(n)])?;
        let mem = self.graph.create(Op::Proj(1), &[Some(n)])?;
        self.set_mem(mem);
        self.graph.release(n);
        Ok(self.out(ptr))
    }

    /// Allocate a zeroed struct.
    pub fn new_struct(&mut self, obj: TypeId) -> Result<NodeId, Diagnostic> {
        struct_layout(&self.graph.types, obj)?;
        self.allocate(obj, None)
    }

    /// Allocate a zeroed array of `len` elements with its length header set.
    pub fn new_array(&mut self, elem: TypeId, len: NodeId) -> Result<NodeId, Diagnostic> {
        let obj = self.graph.types.array_of(elem);
        array_layout(&self.graph.types, obj)?;
        self.allocate(obj, Some(len))
    }

    /// Call `func`; `ret` is the result type as seen in this function's
    /// type table (a struct pointer for aggregate returns).
    pub fn call(&mut self, func: FuncId, ret: TypeId, args: &[NodeId]) -> Result<NodeId, Diagnostic> {
        let mut inputs = vec![self.ctrl(), self.mem()];
        inputs.extend(args.iter().map(|a| Some(*a)));
        let call = self.graph.create(Op::Call(func, ret), &inputs)?;
        self.graph.keep(call);
        let mem = self.graph.create(Op::Proj(0), &[Some(call)])?;
        let result = self.graph.create(Op::Proj(1), &[Some(call)])?;
        self.set_mem(mem);
        self.graph.release(call);
        Ok(self.out(result))
    }

    // ── Completion ──

    pub fn finish(mut self) -> Result<Function, Diagnostic> {
        let live = self
            .ctrl()
            .is_some_and(|c| self.graph.ty(c) == TypeId::CTRL);
        if live {
            match self.sig.ret {
                RetType::Void => self.ret(None)?,
                _ => {
                    return Err(Diagnostic::error(
                        codes::E0203,
                        format!("`{}` can reach its end without returning a value", self.name),
                    ))
                }
            }
        }
        let stop = self.graph.stop();
        if self.graph.inputs(stop).is_empty() {
            return Err(Diagnostic::error(
                codes::E0203,
                format!("`{}` never returns", self.name),
            ));
        }
        self.graph.release(self.scope);
        for n in std::mem::take(&mut self.pinned) {
            if !self.graph.is_dead(n) {
                self.graph.release(n);
            }
        }
        Ok(Function {
            id: self.id,
            name: self.name,
            sig: self.sig,
            graph: self.graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::RegionState;
    use crate::optimize::optimize;

    fn int_fn(m: &mut Module, name: &str, params: &[&str]) -> FunctionBuilder {
        let mut b = FunctionBuilder::new(m, name);
        let ps: Vec<(&str, TypeId)> = params.iter().map(|p| (*p, TypeId::INT_BOT)).collect();
        b.start(&ps, RetType::Scalar(TypeId::INT_BOT)).unwrap();
        b
    }

    #[test]
    fn straight_line_constant_folds_to_return_constant() {
        let mut m = Module::new();
        let mut b = int_fn(&mut m, "f", &[]);
        let (x, y) = (b.con(3), b.con(4));
        let s = b.add(x, y).unwrap();
        b.ret(Some(s)).unwrap();
        let mut f = b.finish().unwrap();
        optimize(&mut f.graph).unwrap();
        let stop = f.graph.stop();
        let ret = f.graph.input(stop, 0).unwrap();
        let v = f.graph.input(ret, 2).unwrap();
        assert_eq!(f.graph.types.int_value(f.graph.ty(v)), Some(7));
    }

    #[test]
    fn unknown_variable_is_reported() {
        let mut m = Module::new();
        let mut b = int_fn(&mut m, "f", &["a"]);
        let err = b.get("nope").unwrap_err();
        assert_eq!(err.code, Some(codes::E0200));
    }

    fn mixed_fn(m: &mut Module) -> FunctionBuilder {
        let mut b = FunctionBuilder::new(m, "f");
        b.start(
            &[("i", TypeId::INT_BOT), ("x", TypeId::FLOAT_BOT), ("y", TypeId::FLOAT_BOT)],
            RetType::Scalar(TypeId::FLOAT_BOT),
        )
        .unwrap();
        b
    }

    #[test]
    fn float_operands_select_float_ops() {
        let mut m = Module::new();
        let mut b = mixed_fn(&mut m);
        let (x, y) = (b.get("x").unwrap(), b.get("y").unwrap());
        let s = b.add(x, y).unwrap();
        assert_eq!(b.graph().op(s), Op::AddF);
        let p = b.mul(x, y).unwrap();
        assert_eq!(b.graph().op(p), Op::MulF);
        let c = b.lt(x, y).unwrap();
        assert_eq!(b.graph().op(c), Op::LtF);
        let i = b.get("i").unwrap();
        let j = b.add(i, i).unwrap();
        assert_eq!(b.graph().op(j), Op::Add);
    }

    #[test]
    fn int_float_mix_is_rejected() {
        let mut m = Module::new();
        let mut b = mixed_fn(&mut m);
        let (i, x) = (b.get("i").unwrap(), b.get("x").unwrap());
        for err in [
            b.add(i, x).unwrap_err(),
            b.sub(x, i).unwrap_err(),
            b.eq(i, x).unwrap_err(),
            b.shr(x, i).unwrap_err(),
            b.add_f(i, x).unwrap_err(),
            b.to_float(x).unwrap_err(),
            b.to_int(i).unwrap_err(),
        ] {
            assert_eq!(err.code, Some(codes::E0204), "{}", err.message);
        }
    }

    #[test]
    fn explicit_conversions_build_conversion_nodes() {
        let mut m = Module::new();
        let mut b = mixed_fn(&mut m);
        let (i, x) = (b.get("i").unwrap(), b.get("x").unwrap());
        let f = b.to_float(i).unwrap();
        assert_eq!(b.graph().op(f), Op::ToFloat);
        let s = b.add_f(f, x).unwrap();
        assert_eq!(b.graph().op(s), Op::AddF);
        let t = b.to_int(s).unwrap();
        assert_eq!(b.graph().op(t), Op::ToInt);
        assert!(!b.graph().types.is_float(b.graph().ty(t)));
        let n = b.neg(x).unwrap();
        assert_eq!(b.graph().op(n), Op::MulF);
    }

    #[test]
    fn if_else_merges_with_phi() {
        let mut m = Module::new();
        let mut b = int_fn(&mut m, "f", &["a"]);
        let a = b.get("a").unwrap();
        let zero = b.con(0);
        let c = b.lt(a, zero).unwrap();
        let one = b.con(1);
        b.define("r", one).unwrap();
        b.if_else(
            c,
            |b| {
                let a = b.get("a")?;
                let n = b.neg(a)?;
                b.set("r", n)
            },
            |b| {
                let a = b.get("a")?;
                b.set("r", a)
            },
        )
        .unwrap();
        let r = b.get("r").unwrap();
        assert!(matches!(b.graph().op(r), Op::Phi(_)));
        b.ret(Some(r)).unwrap();
        let f = b.finish().unwrap();
        let phi_region = f.graph.input(r, 0).unwrap();
        assert_eq!(f.graph.region_state(phi_region), Some(RegionState::Sealed));
    }

    #[test]
    fn constant_condition_needs_no_phi() {
        let mut m = Module::new();
        let mut b = int_fn(&mut m, "f", &["a"]);
        let one = b.con(1);
        b.define("r", one).unwrap();
        let t = b.con(1);
        b.if_then(t, |b| {
            let two = b.con(2);
            b.set("r", two)
        })
        .unwrap();
        let r = b.get("r").unwrap();
        assert_eq!(b.graph().types.int_value(b.graph().ty(r)), Some(2));
    }

    #[test]
    fn loop_counter_gets_a_phi_and_invariants_fold() {
        let mut m = Module::new();
        let mut b = int_fn(&mut m, "sum", &["n"]);
        let zero = b.con(0);
        b.define("s", zero).unwrap();
        b.define("k", zero).unwrap();
        let n = b.get("n").unwrap();
        b.for_range("i", zero, n, |b| {
            let s = b.get("s")?;
            let i = b.get("i")?;
            let s = b.add(s, i)?;
            b.set("s", s)
        })
        .unwrap();
        let s = b.get("s").unwrap();
        let k = b.get("k").unwrap();
        assert!(matches!(b.graph().op(s), Op::Phi(_)));
        assert_eq!(b.graph().types.int_value(b.graph().ty(k)), Some(0), "untouched var folds");
        b.ret(Some(s)).unwrap();
        let mut f = b.finish().unwrap();
        optimize(&mut f.graph).unwrap();
        assert!(f.graph.live_nodes().all(|n| f.graph.op(n) != Op::Scope));
    }

    #[test]
    fn missing_return_is_reported() {
        let mut m = Module::new();
        let b = int_fn(&mut m, "f", &[]);
        let err = b.finish().unwrap_err();
        assert_eq!(err.code, Some(codes::E0203));
    }

    #[test]
    fn field_access_checks_shapes() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new(&mut m, "f");
        let person = b.types().struct_type("Person", &[("age", TypeId::INT_BOT)]);
        let pp = b.types().ptr(person, Nil::NotNil);
        b.start(&[("p", pp), ("x", TypeId::INT_BOT)], RetType::Void).unwrap();
        let p = b.get("p").unwrap();
        let x = b.get("x").unwrap();
        let err = b.load_field(p, "height").unwrap_err();
        assert_eq!(err.code, Some(codes::E0202));
        let err = b.load_field(x, "age").unwrap_err();
        assert_eq!(err.code, Some(codes::E0201));
        let age = b.load_field(p, "age").unwrap();
        let one = b.con(1);
        let older = b.add(age, one).unwrap();
        b.store_field(p, "age", older).unwrap();
        let again = b.load_field(p, "age").unwrap();
        assert_eq!(again, older, "load after store forwards the stored value");
        b.finish().unwrap();
    }
}
