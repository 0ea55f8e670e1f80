// layout.rs — In-memory layout of structs, arrays and strings
//
// Maps lattice types onto byte offsets and access widths. The layout is a
// contract with native code: arrays carry a u32 length at offset 0 with
// elements at `align_up(4, elem_align)`; structs place fields in
// declaration order at natural alignment.
//
// Preconditions: types come from the same `TypeTable` as the object.
// Postconditions: every offset is aligned to its field's access width;
//                 struct sizes are multiples of the struct alignment.
// Failure modes: type with no memory representation → `E0500`;
//                object that is not a struct → `E0201`.
// Side effects: none.

use serde::Serialize;

use crate::diag::{codes, Diagnostic};
use crate::id::TypeId;
use crate::types::{Type, TypeTable};

/// Byte offset of the u32 element count in every array.
pub const ARRAY_LEN_OFFSET: u32 = 0;
/// Alignment of every heap allocation.
pub const ALLOC_ALIGN: u32 = 8;

pub fn align_up(x: u32, align: u32) -> u32 {
    x.div_ceil(align) * align
}

// ── Access widths ───────────────────────────────────────────────────────────

/// Width and signedness of one memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    F64,
    Ptr,
}

impl MemKind {
    pub fn size(self) -> u32 {
        match self {
            MemKind::I8 | MemKind::U8 => 1,
            MemKind::I16 | MemKind::U16 => 2,
            MemKind::I32 | MemKind::U32 => 4,
            MemKind::I64 | MemKind::F64 | MemKind::Ptr => 8,
        }
    }

    /// Natural alignment equals size for every scalar kind.
    pub fn align(self) -> u32 {
        self.size()
    }

    pub fn is_signed(self) -> bool {
        matches!(self, MemKind::I8 | MemKind::I16 | MemKind::I32 | MemKind::I64)
    }

    pub fn is_float(self) -> bool {
        self == MemKind::F64
    }

    pub fn name(self) -> &'static str {
        match self {
            MemKind::I8 => "i8",
            MemKind::U8 => "u8",
            MemKind::I16 => "i16",
            MemKind::U16 => "u16",
            MemKind::I32 => "i32",
            MemKind::U32 => "u32",
            MemKind::I64 => "i64",
            MemKind::F64 => "f64",
            MemKind::Ptr => "ptr",
        }
    }
}

/// Narrowest access kind able to hold every value of `ty`.
pub fn mem_kind(types: &TypeTable, ty: TypeId) -> Result<MemKind, Diagnostic> {
    match types.get(ty) {
        Type::Int { min, max } if min <= max => {
            let (lo, hi) = (*min, *max);
            let fits = |kmin: i64, kmax: i64| lo >= kmin && hi <= kmax;
            Ok(if fits(0, u8::MAX as i64) {
                MemKind::U8
            } else if fits(i8::MIN as i64, i8::MAX as i64) {
                MemKind::I8
            } else if fits(0, u16::MAX as i64) {
                MemKind::U16
            } else if fits(i16::MIN as i64, i16::MAX as i64) {
                MemKind::I16
            } else if fits(0, u32::MAX as i64) {
                MemKind::U32
            } else if fits(i32::MIN as i64, i32::MAX as i64) {
                MemKind::I32
            } else {
                MemKind::I64
            })
        }
        Type::Float(_) => Ok(MemKind::F64),
        Type::Ptr { .. } | Type::Nil => Ok(MemKind::Ptr),
        _ => Err(Diagnostic::error(
            codes::E0500,
            format!("type `{}` has no memory representation", types.display(ty)),
        )),
    }
}

// ── Structs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldLayout {
    pub name: String,
    pub offset: u32,
    pub kind: MemKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructLayout {
    pub name: String,
    pub fields: Vec<FieldLayout>,
    pub size: u32,
    pub align: u32,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

pub fn struct_layout(types: &TypeTable, obj: TypeId) -> Result<StructLayout, Diagnostic> {
    let Some((name, fields)) = types.struct_fields(obj) else {
        return Err(Diagnostic::error(
            codes::E0201,
            format!("`{}` is not a struct", types.display(obj)),
        ));
    };
    let mut out = Vec::with_capacity(fields.len());
    let mut offset = 0;
    let mut align = 1;
    for field in fields {
        let kind = mem_kind(types, field.ty)
            .map_err(|d| d.with_cause(format!("field `{}.{}`", name, field.name), None))?;
        offset = align_up(offset, kind.align());
        out.push(FieldLayout {
            name: field.name.clone(),
            offset,
            kind,
        });
        offset += kind.size();
        align = align.max(kind.align());
    }
    Ok(StructLayout {
        name: name.to_string(),
        fields: out,
        size: align_up(offset, align),
        align,
    })
}

// ── Arrays ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArrayLayout {
    pub elem: MemKind,
    /// Offset of element 0.
    pub base: u32,
    /// Distance between consecutive elements.
    pub scale: u32,
}

impl ArrayLayout {
    /// Byte offset of element `index`; `None` if it does not fit in u32.
    pub fn elem_offset(&self, index: u32) -> Option<u32> {
        index.checked_mul(self.scale)?.checked_add(self.base)
    }

    /// Allocation size for `len` elements, rounded to the allocation grain.
    pub fn alloc_size(&self, len: u32) -> Option<u32> {
        self.elem_offset(len)?.checked_next_multiple_of(ALLOC_ALIGN)
    }
}

/// Layout of an array object type (`[]<elem>`).
pub fn array_layout(types: &TypeTable, obj: TypeId) -> Result<ArrayLayout, Diagnostic> {
    let Some(elem) = types.array_elem(obj) else {
        return Err(Diagnostic::error(
            codes::E0201,
            format!("`{}` is not an array", types.display(obj)),
        ));
    };
    let kind = mem_kind(types, elem)?;
    Ok(ArrayLayout {
        elem: kind,
        base: align_up(ARRAY_LEN_OFFSET + 4, kind.align()),
        scale: kind.size(),
    })
}

/// Allocation size of a fixed-shape object.
pub fn alloc_size(types: &TypeTable, obj: TypeId) -> Result<u32, Diagnostic> {
    let layout = struct_layout(types, obj)?;
    Ok(align_up(layout.size.max(1), ALLOC_ALIGN))
}

// ── Reports ─────────────────────────────────────────────────────────────────

/// Layout summary serialized by `--emit layout`.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutReport {
    pub structs: Vec<StructLayout>,
    pub arrays: Vec<ArrayReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArrayReport {
    pub name: String,
    #[serde(flatten)]
    pub layout: ArrayLayout,
}

/// Collect the layout of every struct and array shape interned in `types`.
pub fn layout_report(types: &TypeTable) -> LayoutReport {
    let mut structs = Vec::new();
    let mut arrays = Vec::new();
    for i in 0..types.len() {
        let id = TypeId(i as u32);
        let Some((name, _)) = types.struct_fields(id) else {
            continue;
        };
        if types.is_array(id) {
            if let Ok(layout) = array_layout(types, id) {
                arrays.push(ArrayReport {
                    name: name.to_string(),
                    layout,
                });
            }
        } else if let Ok(layout) = struct_layout(types, id) {
            if !structs.iter().any(|s: &StructLayout| s.name == layout.name) {
                structs.push(layout);
            }
        }
    }
    LayoutReport { structs, arrays }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Nil;

    #[test]
    fn narrowest_kind_for_ranges() {
        let mut t = TypeTable::new();
        assert_eq!(mem_kind(&t, TypeId::BOOL).unwrap(), MemKind::U8);
        assert_eq!(mem_kind(&t, TypeId::U8).unwrap(), MemKind::U8);
        assert_eq!(mem_kind(&t, TypeId::U32).unwrap(), MemKind::U32);
        assert_eq!(mem_kind(&t, TypeId::INT_BOT).unwrap(), MemKind::I64);
        let i32_range = t.int(i32::MIN as i64, i32::MAX as i64);
        assert_eq!(mem_kind(&t, i32_range).unwrap(), MemKind::I32);
        let i8_range = t.int(-128, 127);
        assert_eq!(mem_kind(&t, i8_range).unwrap(), MemKind::I8);
        assert_eq!(mem_kind(&t, TypeId::FLOAT_BOT).unwrap(), MemKind::F64);
        assert_eq!(mem_kind(&t, TypeId::NIL).unwrap(), MemKind::Ptr);
        let err = mem_kind(&t, TypeId::MEM).unwrap_err();
        assert_eq!(err.code, Some(codes::E0500));
    }

    #[test]
    fn array_bases_follow_element_alignment() {
        let mut t = TypeTable::new();
        let ints = t.array_of(TypeId::INT_BOT);
        let bytes = t.array_of(TypeId::U8);
        let words = t.array_of(TypeId::U32);
        let obj = t.struct_type("P", &[("age", TypeId::INT_BOT)]);
        let p = t.ptr(obj, Nil::MaybeNil);
        let ptrs = t.array_of(p);
        let flts = t.array_of(TypeId::FLOAT_BOT);
        assert_eq!(array_layout(&t, ints).unwrap().base, 8);
        assert_eq!(array_layout(&t, flts).unwrap().base, 8);
        assert_eq!(array_layout(&t, ptrs).unwrap().base, 8);
        assert_eq!(array_layout(&t, bytes).unwrap().base, 4);
        let w = array_layout(&t, words).unwrap();
        assert_eq!((w.base, w.scale), (4, 4));
        assert_eq!(w.elem_offset(3), Some(16));
        assert_eq!(array_layout(&t, ints).unwrap().alloc_size(5), Some(48));
        assert_eq!(array_layout(&t, bytes).unwrap().alloc_size(5), Some(16));
    }

    #[test]
    fn oversized_arrays_have_no_size() {
        let mut t = TypeTable::new();
        let ints = t.array_of(TypeId::INT_BOT);
        let bytes = t.array_of(TypeId::U8);
        let l = array_layout(&t, ints).unwrap();
        assert_eq!(l.elem_offset(u32::MAX), None);
        assert_eq!(l.alloc_size(u32::MAX / 8), None);
        // Fits before rounding, overflows after.
        assert_eq!(array_layout(&t, bytes).unwrap().alloc_size(u32::MAX - 4), None);
    }

    #[test]
    fn struct_fields_at_natural_alignment() {
        let mut t = TypeTable::new();
        let s = t.struct_type(
            "Mixed",
            &[("flag", TypeId::BOOL), ("n", TypeId::INT_BOT), ("w", TypeId::U32)],
        );
        let l = struct_layout(&t, s).unwrap();
        let offsets: Vec<u32> = l.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!((l.size, l.align), (24, 8));
    }

    #[test]
    fn string_record_is_sixteen_bytes() {
        let mut t = TypeTable::new();
        let s = t.string_type();
        let l = struct_layout(&t, s).unwrap();
        assert_eq!(l.field("cs").unwrap().offset, 0);
        assert_eq!(l.field("cs").unwrap().kind, MemKind::Ptr);
        assert_eq!(l.field("hash").unwrap().offset, 8);
        assert_eq!(l.size, 16);
    }

    #[test]
    fn report_lists_shapes() {
        let mut t = TypeTable::new();
        t.string_type();
        let report = layout_report(&t);
        assert!(report.structs.iter().any(|s| s.name == "String"));
        assert!(report.arrays.iter().any(|a| a.name == "[]u8"));
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"base\":4"));
    }
}
