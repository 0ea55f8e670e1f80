// types.rs — Hash-consed type lattice
//
// Types are immutable values interned in a `TypeTable`; structurally equal
// types share one `TypeId`, so id comparison is value comparison. The
// lattice is ordered "more precise ⊑ less precise": `Top` is the most
// precise element (no value / unreachable) and `Bottom` the least (any
// value). `meet` is the greatest lower bound, `dual` mirrors a type across
// the centerline of the lattice, and `join` is derived from the two.
//
// Preconditions: ids passed to table methods were produced by the same table.
// Postconditions: every returned id is interned; `meet` is commutative,
//                 associative and idempotent; `dual` is an involution.
// Failure modes: none.
// Side effects: interning grows the table.

use std::collections::HashMap;
use std::fmt;

pub use crate::id::TypeId;

// ── Type values ─────────────────────────────────────────────────────────────

/// Nil-ness of a pointer. Meet takes the maximum, dual mirrors `3 - flag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Nil {
    /// High: null or an object, whichever suits.
    HighMaybe = 0,
    /// High: an object.
    HighNot = 1,
    /// Never null.
    NotNil = 2,
    /// Possibly null.
    MaybeNil = 3,
}

impl Nil {
    fn from_bits(bits: u8) -> Nil {
        match bits {
            0 => Nil::HighMaybe,
            1 => Nil::HighNot,
            2 => Nil::NotNil,
            _ => Nil::MaybeNil,
        }
    }

    pub fn meet(self, other: Nil) -> Nil {
        self.max(other)
    }

    pub fn dual(self) -> Nil {
        Nil::from_bits(3 - self as u8)
    }

    pub fn is_high(self) -> bool {
        (self as u8) < 2
    }
}

/// Float lattice element. Constants are compared by bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatVal {
    High,
    Con(u64),
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub ty: TypeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Top,
    Bottom,
    Ctrl,
    XCtrl,
    /// Integer range; `min > max` denotes a high (dual) range.
    Int { min: i64, max: i64 },
    Float(FloatVal),
    /// The null pointer constant.
    Nil,
    Ptr { obj: TypeId, nil: Nil },
    Struct { name: String, fields: Vec<Field> },
    StructTop,
    StructBot,
    Mem,
    XMem,
    Tuple(Vec<TypeId>),
}

// ── Well-known ids ──────────────────────────────────────────────────────────

impl TypeId {
    pub const TOP: TypeId = TypeId(0);
    pub const BOTTOM: TypeId = TypeId(1);
    pub const CTRL: TypeId = TypeId(2);
    pub const XCTRL: TypeId = TypeId(3);
    pub const INT_TOP: TypeId = TypeId(4);
    pub const INT_BOT: TypeId = TypeId(5);
    pub const ZERO: TypeId = TypeId(6);
    pub const ONE: TypeId = TypeId(7);
    pub const BOOL: TypeId = TypeId(8);
    pub const U8: TypeId = TypeId(9);
    pub const U32: TypeId = TypeId(10);
    pub const FLOAT_TOP: TypeId = TypeId(11);
    pub const FLOAT_BOT: TypeId = TypeId(12);
    pub const NIL: TypeId = TypeId(13);
    pub const MEM: TypeId = TypeId(14);
    pub const XMEM: TypeId = TypeId(15);
    pub const STRUCT_TOP: TypeId = TypeId(16);
    pub const STRUCT_BOT: TypeId = TypeId(17);
    /// `If` result: both projections reachable.
    pub const IF_BOTH: TypeId = TypeId(18);
    /// `If` result: only the true projection reachable.
    pub const IF_TRUE: TypeId = TypeId(19);
    /// `If` result: only the false projection reachable.
    pub const IF_FALSE: TypeId = TypeId(20);
    pub const IF_NEITHER: TypeId = TypeId(21);
}

// ── Type table ──────────────────────────────────────────────────────────────

/// Interning table for types. One table per function graph.
#[derive(Debug, Clone)]
pub struct TypeTable {
    types: Vec<Type>,
    index: HashMap<Type, TypeId>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    pub fn new() -> Self {
        let mut table = TypeTable {
            types: Vec::new(),
            index: HashMap::new(),
        };
        let (c, x) = (TypeId::CTRL, TypeId::XCTRL);
        let seeds = [
            Type::Top,
            Type::Bottom,
            Type::Ctrl,
            Type::XCtrl,
            Type::Int {
                min: i64::MAX,
                max: i64::MIN,
            },
            Type::Int {
                min: i64::MIN,
                max: i64::MAX,
            },
            Type::Int { min: 0, max: 0 },
            Type::Int { min: 1, max: 1 },
            Type::Int { min: 0, max: 1 },
            Type::Int { min: 0, max: 255 },
            Type::Int {
                min: 0,
                max: u32::MAX as i64,
            },
            Type::Float(FloatVal::High),
            Type::Float(FloatVal::Low),
            Type::Nil,
            Type::Mem,
            Type::XMem,
            Type::StructTop,
            Type::StructBot,
            Type::Tuple(vec![c, c]),
            Type::Tuple(vec![c, x]),
            Type::Tuple(vec![x, c]),
            Type::Tuple(vec![x, x]),
        ];
        for ty in seeds {
            table.intern(ty);
        }
        table
    }

    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(&id) = self.index.get(&ty) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty.clone());
        self.index.insert(ty, id);
        id
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.index()]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    // ── Constructors ──

    pub fn int(&mut self, min: i64, max: i64) -> TypeId {
        self.intern(Type::Int { min, max })
    }

    pub fn int_con(&mut self, value: i64) -> TypeId {
        self.int(value, value)
    }

    pub fn float_con(&mut self, value: f64) -> TypeId {
        self.intern(Type::Float(FloatVal::Con(value.to_bits())))
    }

    pub fn ptr(&mut self, obj: TypeId, nil: Nil) -> TypeId {
        self.intern(Type::Ptr { obj, nil })
    }

    pub fn tuple(&mut self, elems: Vec<TypeId>) -> TypeId {
        self.intern(Type::Tuple(elems))
    }

    pub fn struct_type(&mut self, name: &str, fields: &[(&str, TypeId)]) -> TypeId {
        let fields = fields
            .iter()
            .map(|(n, ty)| Field {
                name: (*n).to_string(),
                ty: *ty,
            })
            .collect();
        self.intern(Type::Struct {
            name: name.to_string(),
            fields,
        })
    }

    /// Array shape: a struct named `[]<elem>` with a `#` length field and a
    /// `[]` element field.
    pub fn array_of(&mut self, elem: TypeId) -> TypeId {
        let name = format!("[]{}", self.display(elem));
        self.struct_type(&name, &[("#", TypeId::U32), ("[]", elem)])
    }

    /// Pointer to a non-null array of `elem`.
    pub fn array_ptr(&mut self, elem: TypeId) -> TypeId {
        let obj = self.array_of(elem);
        self.ptr(obj, Nil::NotNil)
    }

    /// The string record: a byte-array reference plus a memoized hash.
    pub fn string_type(&mut self) -> TypeId {
        let bytes = self.array_ptr(TypeId::U8);
        self.struct_type("String", &[("cs", bytes), ("hash", TypeId::INT_BOT)])
    }

    // ── Queries ──

    pub fn as_int(&self, id: TypeId) -> Option<(i64, i64)> {
        match self.get(id) {
            Type::Int { min, max } => Some((*min, *max)),
            _ => None,
        }
    }

    /// The value of an integer constant type.
    pub fn int_value(&self, id: TypeId) -> Option<i64> {
        match self.get(id) {
            Type::Int { min, max } if min == max => Some(*min),
            _ => None,
        }
    }

    pub fn float_value(&self, id: TypeId) -> Option<f64> {
        match self.get(id) {
            Type::Float(FloatVal::Con(bits)) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn is_constant(&self, id: TypeId) -> bool {
        matches!(
            self.get(id),
            Type::Nil | Type::Float(FloatVal::Con(_))
        ) || self.int_value(id).is_some()
    }

    pub fn is_high(&self, id: TypeId) -> bool {
        match self.get(id) {
            Type::Top | Type::XCtrl | Type::XMem | Type::StructTop => true,
            Type::Float(FloatVal::High) => true,
            Type::Int { min, max } => min > max,
            Type::Ptr { nil, .. } => nil.is_high(),
            _ => false,
        }
    }

    pub fn is_float(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Float(_))
    }

    pub fn is_mem(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Mem | Type::XMem)
    }

    pub fn is_ctrl(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Ctrl | Type::XCtrl)
    }

    pub fn is_tuple(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Tuple(_))
    }

    pub fn ptr_obj(&self, id: TypeId) -> Option<(TypeId, Nil)> {
        match self.get(id) {
            Type::Ptr { obj, nil } => Some((*obj, *nil)),
            _ => None,
        }
    }

    pub fn is_pointer_like(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Ptr { .. } | Type::Nil)
    }

    pub fn struct_fields(&self, obj: TypeId) -> Option<(&str, &[Field])> {
        match self.get(obj) {
            Type::Struct { name, fields } => Some((name.as_str(), fields.as_slice())),
            _ => None,
        }
    }

    pub fn field(&self, obj: TypeId, name: &str) -> Option<(usize, &Field)> {
        let (_, fields) = self.struct_fields(obj)?;
        fields.iter().enumerate().find(|(_, f)| f.name == name)
    }

    pub fn is_array(&self, obj: TypeId) -> bool {
        match self.struct_fields(obj) {
            Some((name, fields)) => {
                name.starts_with("[]")
                    && fields.len() == 2
                    && fields[0].name == "#"
                    && fields[1].name == "[]"
            }
            None => false,
        }
    }

    pub fn array_elem(&self, obj: TypeId) -> Option<TypeId> {
        if !self.is_array(obj) {
            return None;
        }
        self.struct_fields(obj).map(|(_, fields)| fields[1].ty)
    }

    /// Element `i` of a tuple type; `Top` projects to `Top`.
    pub fn tuple_elem(&self, id: TypeId, i: usize) -> TypeId {
        match self.get(id) {
            Type::Top => TypeId::TOP,
            Type::Tuple(elems) => elems.get(i).copied().unwrap_or(TypeId::BOTTOM),
            _ => TypeId::BOTTOM,
        }
    }

    /// Whether a predicate of this type is statically known to be true or
    /// false.
    pub fn truthiness(&self, id: TypeId) -> Option<bool> {
        match self.get(id) {
            Type::Int { min, max } if min <= max => {
                if *min == 0 && *max == 0 {
                    Some(false)
                } else if *min > 0 || *max < 0 {
                    Some(true)
                } else {
                    None
                }
            }
            Type::Nil => Some(false),
            Type::Ptr {
                nil: Nil::NotNil, ..
            } => Some(true),
            _ => None,
        }
    }

    // ── Lattice operations ──

    /// Greatest lower bound.
    pub fn meet(&mut self, a: TypeId, b: TypeId) -> TypeId {
        if a == b {
            return a;
        }
        let (ta, tb) = (self.get(a).clone(), self.get(b).clone());
        match (ta, tb) {
            (Type::Top, _) => b,
            (_, Type::Top) => a,
            (Type::Bottom, _) | (_, Type::Bottom) => TypeId::BOTTOM,
            (Type::Ctrl | Type::XCtrl, Type::Ctrl | Type::XCtrl) => TypeId::CTRL,
            (Type::Int { min: a0, max: a1 }, Type::Int { min: b0, max: b1 }) => {
                self.int(a0.min(b0), a1.max(b1))
            }
            (Type::Float(x), Type::Float(y)) => {
                let v = match (x, y) {
                    (FloatVal::High, v) | (v, FloatVal::High) => v,
                    (FloatVal::Low, _) | (_, FloatVal::Low) => FloatVal::Low,
                    (FloatVal::Con(p), FloatVal::Con(q)) if p == q => FloatVal::Con(p),
                    _ => FloatVal::Low,
                };
                self.intern(Type::Float(v))
            }
            (Type::Nil, Type::Ptr { obj, .. }) | (Type::Ptr { obj, .. }, Type::Nil) => {
                self.ptr(obj, Nil::MaybeNil)
            }
            (Type::Ptr { obj: o1, nil: n1 }, Type::Ptr { obj: o2, nil: n2 }) => {
                let obj = self.meet(o1, o2);
                self.ptr(obj, n1.meet(n2))
            }
            (Type::StructTop, Type::StructTop | Type::StructBot | Type::Struct { .. }) => b,
            (Type::StructBot | Type::Struct { .. }, Type::StructTop) => a,
            (Type::StructBot, Type::StructBot | Type::Struct { .. })
            | (Type::Struct { .. }, Type::StructBot) => TypeId::STRUCT_BOT,
            (
                Type::Struct {
                    name: n1,
                    fields: f1,
                },
                Type::Struct {
                    name: n2,
                    fields: f2,
                },
            ) => {
                let same_shape = n1 == n2
                    && f1.len() == f2.len()
                    && f1.iter().zip(&f2).all(|(x, y)| x.name == y.name);
                if !same_shape {
                    return TypeId::STRUCT_BOT;
                }
                let mut fields = Vec::with_capacity(f1.len());
                for (x, y) in f1.iter().zip(&f2) {
                    fields.push(Field {
                        name: x.name.clone(),
                        ty: self.meet(x.ty, y.ty),
                    });
                }
                self.intern(Type::Struct { name: n1, fields })
            }
            (Type::Mem | Type::XMem, Type::Mem | Type::XMem) => TypeId::MEM,
            (Type::Tuple(x), Type::Tuple(y)) if x.len() == y.len() => {
                let mut elems = Vec::with_capacity(x.len());
                for (p, q) in x.iter().zip(&y) {
                    elems.push(self.meet(*p, *q));
                }
                self.tuple(elems)
            }
            _ => TypeId::BOTTOM,
        }
    }

    /// Mirror image across the lattice centerline. Constants are self-dual.
    pub fn dual(&mut self, a: TypeId) -> TypeId {
        match self.get(a).clone() {
            Type::Top => TypeId::BOTTOM,
            Type::Bottom => TypeId::TOP,
            Type::Ctrl => TypeId::XCTRL,
            Type::XCtrl => TypeId::CTRL,
            Type::Int { min, max } => self.int(max, min),
            Type::Float(v) => {
                let v = match v {
                    FloatVal::High => FloatVal::Low,
                    FloatVal::Low => FloatVal::High,
                    con => con,
                };
                self.intern(Type::Float(v))
            }
            Type::Nil => a,
            Type::Ptr { obj, nil } => {
                let obj = self.dual(obj);
                self.ptr(obj, nil.dual())
            }
            Type::Struct { name, fields } => {
                let mut out = Vec::with_capacity(fields.len());
                for f in fields {
                    out.push(Field {
                        ty: self.dual(f.ty),
                        name: f.name,
                    });
                }
                self.intern(Type::Struct { name, fields: out })
            }
            Type::StructTop => TypeId::STRUCT_BOT,
            Type::StructBot => TypeId::STRUCT_TOP,
            Type::Mem => TypeId::XMEM,
            Type::XMem => TypeId::MEM,
            Type::Tuple(elems) => {
                let mut out = Vec::with_capacity(elems.len());
                for e in elems {
                    out.push(self.dual(e));
                }
                self.tuple(out)
            }
        }
    }

    /// Least upper bound, derived from `meet` and `dual`.
    pub fn join(&mut self, a: TypeId, b: TypeId) -> TypeId {
        if a == b {
            return a;
        }
        let (da, db) = (self.dual(a), self.dual(b));
        let m = self.meet(da, db);
        self.dual(m)
    }

    /// `a` is at least as precise as `b`.
    pub fn isa(&mut self, a: TypeId, b: TypeId) -> bool {
        self.meet(a, b) == b
    }

    pub fn display(&self, id: TypeId) -> TypeDisplay<'_> {
        TypeDisplay { table: self, id }
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

pub struct TypeDisplay<'a> {
    table: &'a TypeTable,
    id: TypeId,
}

impl TypeDisplay<'_> {
    fn obj_name(&self, obj: TypeId) -> String {
        match self.table.get(obj) {
            Type::Struct { name, .. } => name.clone(),
            Type::StructTop => "~Struct".to_string(),
            Type::StructBot => "Struct".to_string(),
            _ => self.table.display(obj).to_string(),
        }
    }
}

impl fmt::Display for TypeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.table.get(self.id) {
            Type::Top => write!(f, "Top"),
            Type::Bottom => write!(f, "Bot"),
            Type::Ctrl => write!(f, "Ctrl"),
            Type::XCtrl => write!(f, "~Ctrl"),
            Type::Int { min, max } => match (*min, *max) {
                (i64::MIN, i64::MAX) => write!(f, "int"),
                (i64::MAX, i64::MIN) => write!(f, "~int"),
                (lo, hi) if lo == hi => write!(f, "{lo}"),
                (0, 1) => write!(f, "bool"),
                (0, 255) => write!(f, "u8"),
                (-128, 127) => write!(f, "i8"),
                (0, 65535) => write!(f, "u16"),
                (-32768, 32767) => write!(f, "i16"),
                (lo, hi) if lo == 0 && hi == u32::MAX as i64 => write!(f, "u32"),
                (lo, hi) if lo == i32::MIN as i64 && hi == i32::MAX as i64 => write!(f, "i32"),
                (lo, hi) if lo > hi => write!(f, "~[{hi}..{lo}]"),
                (lo, hi) => write!(f, "[{lo}..{hi}]"),
            },
            Type::Float(FloatVal::High) => write!(f, "~flt"),
            Type::Float(FloatVal::Low) => write!(f, "flt"),
            Type::Float(FloatVal::Con(bits)) => write!(f, "{:?}", f64::from_bits(*bits)),
            Type::Nil => write!(f, "null"),
            Type::Ptr { obj, nil } => {
                let prefix = if nil.is_high() { "~*" } else { "*" };
                let suffix = if matches!(nil, Nil::MaybeNil | Nil::HighMaybe) {
                    "?"
                } else {
                    ""
                };
                write!(f, "{prefix}{}{suffix}", self.obj_name(*obj))
            }
            Type::Struct { name, fields } => {
                if self.table.is_array(self.id) {
                    return write!(f, "{name}");
                }
                write!(f, "{name}{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", field.name, self.table.display(field.ty))?;
                }
                write!(f, "}}")
            }
            Type::StructTop => write!(f, "~Struct"),
            Type::StructBot => write!(f, "Struct"),
            Type::Mem => write!(f, "mem"),
            Type::XMem => write!(f, "~mem"),
            Type::Tuple(elems) => {
                write!(f, "[")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", self.table.display(*e))?;
                }
                write!(f, "]")
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
