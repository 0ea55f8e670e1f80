// runtime.rs — Host-side heap and string records
//
// A flat, byte-addressed heap that stores objects exactly as compiled code
// lays them out: arrays as a u32 length followed by aligned elements, structs
// by their field offsets, strings as `{ cs: *[]u8, hash: i64 }`. Harnesses use
// it to build inputs and to read back results byte-for-byte.
//
// Preconditions: addresses come from `alloc` on the same heap.
// Postconditions: every allocation is zeroed and 8-byte aligned.
// Failure modes: null or out-of-range access, an array length outside u32,
//                or growth past `MAX_HEAP_BYTES` returns a `Trap`.
// Side effects: none.

use thiserror::Error;

use crate::layout::{ArrayLayout, MemKind, StructLayout, ALLOC_ALIGN, ARRAY_LEN_OFFSET};

/// Address of the first heap byte. Everything below is unmapped, so null and
/// small garbage pointers trap.
pub const HEAP_BASE: u64 = 0x1_0000;

/// Most bytes one heap hands out before allocation traps.
pub const MAX_HEAP_BYTES: usize = 1 << 30;

/// Offset of `String.cs`.
pub const STRING_CS_OFFSET: u32 = 0;
/// Offset of `String.hash`; zero means "not computed yet".
pub const STRING_HASH_OFFSET: u32 = 8;
pub const STRING_SIZE: u32 = 16;

/// Layout of `[]u8`, the byte array behind every string.
pub const BYTES_LAYOUT: ArrayLayout = ArrayLayout {
    elem: MemKind::U8,
    base: 4,
    scale: 1,
};

/// Hash substituted when the polynomial hash comes out as zero, so a stored
/// zero can keep meaning "unset".
pub const NONZERO_HASH: i64 = 123_456_789;

// ── Traps ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Trap {
    #[error("null pointer access at offset {offset}")]
    NullPointer { offset: u64 },
    #[error("access of {size} bytes at {addr:#x} is outside the heap")]
    OutOfBounds { addr: u64, size: u32 },
    #[error("integer division by zero")]
    DivideByZero,
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),
    #[error("call depth limit of {0} exceeded")]
    CallDepth(usize),
    #[error("register {0} read after being clobbered")]
    ClobberedRegister(String),
    #[error("virtual register v{0} read before it was written")]
    UndefinedValue(u32),
    #[error("no function `{0}`")]
    UnknownFunction(String),
    #[error("`{name}` takes {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("calling convention violated: {0}")]
    Abi(String),
    #[error("array length {0} is negative or does not fit in u32")]
    ArrayLength(i64),
    #[error("allocation of {requested} bytes exhausts the heap")]
    HeapExhausted { requested: u64 },
}

// ── Heap ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Heap {
    bytes: Vec<u8>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes handed out so far, padding included.
    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    /// Zeroed allocation of at least `size` bytes.
    pub fn alloc(&mut self, size: u32) -> Result<u64, Trap> {
        let exhausted = Trap::HeapExhausted {
            requested: size as u64,
        };
        let Some(rounded) = size.max(1).checked_next_multiple_of(ALLOC_ALIGN) else {
            return Err(exhausted);
        };
        let end = self.bytes.len() + rounded as usize;
        if end > MAX_HEAP_BYTES {
            return Err(exhausted);
        }
        let addr = HEAP_BASE + self.bytes.len() as u64;
        self.bytes.resize(end, 0);
        Ok(addr)
    }

    fn range(&self, addr: u64, size: u32) -> Result<std::ops::Range<usize>, Trap> {
        if addr < HEAP_BASE {
            return Err(if addr < 4096 {
                Trap::NullPointer { offset: addr }
            } else {
                Trap::OutOfBounds { addr, size }
            });
        }
        let start = (addr - HEAP_BASE) as usize;
        match start.checked_add(size as usize) {
            Some(end) if end <= self.bytes.len() => Ok(start..end),
            _ => Err(Trap::OutOfBounds { addr, size }),
        }
    }

    pub fn bytes(&self, addr: u64, len: u32) -> Result<&[u8], Trap> {
        let r = self.range(addr, len)?;
        Ok(&self.bytes[r])
    }

    /// Read one scalar, sign- or zero-extended to 64 bits.
    pub fn read(&self, addr: u64, kind: MemKind) -> Result<u64, Trap> {
        let r = self.range(addr, kind.size())?;
        let mut raw = [0u8; 8];
        raw[..r.len()].copy_from_slice(&self.bytes[r]);
        let v = u64::from_le_bytes(raw);
        Ok(match kind {
            MemKind::I8 => v as u8 as i8 as i64 as u64,
            MemKind::I16 => v as u16 as i16 as i64 as u64,
            MemKind::I32 => v as u32 as i32 as i64 as u64,
            _ => v,
        })
    }

    /// Write the low `kind.size()` bytes of `value`.
    pub fn write(&mut self, addr: u64, kind: MemKind, value: u64) -> Result<(), Trap> {
        let r = self.range(addr, kind.size())?;
        let n = r.len();
        self.bytes[r].copy_from_slice(&value.to_le_bytes()[..n]);
        Ok(())
    }

    // ── Arrays ──────────────────────────────────────────────────────────

    /// Zeroed array of `len` elements with its length header written.
    pub fn alloc_array(&mut self, layout: &ArrayLayout, len: i64) -> Result<u64, Trap> {
        let count = u32::try_from(len).map_err(|_| Trap::ArrayLength(len))?;
        let size = layout.alloc_size(count).ok_or(Trap::ArrayLength(len))?;
        let addr = self.alloc(size)?;
        self.write(addr + ARRAY_LEN_OFFSET as u64, MemKind::U32, count as u64)?;
        Ok(addr)
    }

    pub fn new_array(&mut self, layout: &ArrayLayout, values: &[i64]) -> Result<u64, Trap> {
        let addr = self.alloc_array(layout, values.len() as i64)?;
        for (i, v) in values.iter().enumerate() {
            let at = layout
                .elem_offset(i as u32)
                .ok_or(Trap::ArrayLength(values.len() as i64))?;
            self.write(addr + at as u64, layout.elem, *v as u64)?;
        }
        Ok(addr)
    }

    pub fn array_len(&self, addr: u64) -> Result<u32, Trap> {
        Ok(self.read(addr + ARRAY_LEN_OFFSET as u64, MemKind::U32)? as u32)
    }

    pub fn read_array(&self, addr: u64, layout: &ArrayLayout) -> Result<Vec<i64>, Trap> {
        let len = self.array_len(addr)?;
        (0..len)
            .map(|i| {
                let at = layout.elem_offset(i).ok_or(Trap::OutOfBounds {
                    addr,
                    size: u32::MAX,
                })?;
                self.read(addr + at as u64, layout.elem).map(|v| v as i64)
            })
            .collect()
    }

    // ── Structs ─────────────────────────────────────────────────────────

    pub fn alloc_struct(&mut self, layout: &StructLayout) -> Result<u64, Trap> {
        self.alloc(layout.size)
    }

    fn field_of<'l>(layout: &'l StructLayout, name: &str) -> Result<&'l crate::layout::FieldLayout, Trap> {
        layout
            .field(name)
            .ok_or_else(|| Trap::Abi(format!("`{}` has no field `{}`", layout.name, name)))
    }

    pub fn read_field(&self, addr: u64, layout: &StructLayout, name: &str) -> Result<i64, Trap> {
        let f = Self::field_of(layout, name)?;
        Ok(self.read(addr + f.offset as u64, f.kind)? as i64)
    }

    pub fn write_field(
        &mut self,
        addr: u64,
        layout: &StructLayout,
        name: &str,
        value: i64,
    ) -> Result<(), Trap> {
        let f = Self::field_of(layout, name)?;
        self.write(addr + f.offset as u64, f.kind, value as u64)
    }
}

// ── Strings ─────────────────────────────────────────────────────────────────

/// Lazily computed string hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashCell {
    #[default]
    Unset,
    Computed(i64),
}

impl HashCell {
    /// Decode the in-memory field, where zero means unset.
    pub fn from_raw(raw: i64) -> Self {
        if raw == 0 {
            HashCell::Unset
        } else {
            HashCell::Computed(raw)
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            HashCell::Unset => 0,
            HashCell::Computed(h) => h,
        }
    }
}

/// `h = h*31 + b` over the bytes, never zero.
pub fn string_hash(bytes: &[u8]) -> i64 {
    let h = bytes
        .iter()
        .fold(0i64, |h, &b| h.wrapping_mul(31).wrapping_add(b as i64));
    if h == 0 {
        NONZERO_HASH
    } else {
        h
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostString {
    pub bytes: Vec<u8>,
    pub hash: HashCell,
}

impl HostString {
    pub fn new(s: &str) -> Self {
        HostString {
            bytes: s.as_bytes().to_vec(),
            hash: HashCell::Unset,
        }
    }

    /// Hash, computing and caching it on first use.
    pub fn hash_code(&mut self) -> i64 {
        match self.hash {
            HashCell::Computed(h) => h,
            HashCell::Unset => {
                let h = string_hash(&self.bytes);
                self.hash = HashCell::Computed(h);
                h
            }
        }
    }

    /// Store the record and its byte array; returns the record address.
    pub fn store(&self, heap: &mut Heap) -> Result<u64, Trap> {
        let values: Vec<i64> = self.bytes.iter().map(|&b| b as i64).collect();
        let cs = heap.new_array(&BYTES_LAYOUT, &values)?;
        let rec = heap.alloc(STRING_SIZE)?;
        heap.write(rec + STRING_CS_OFFSET as u64, MemKind::Ptr, cs)?;
        heap.write(rec + STRING_HASH_OFFSET as u64, MemKind::I64, self.hash.to_raw() as u64)?;
        Ok(rec)
    }

    pub fn load(heap: &Heap, rec: u64) -> Result<Self, Trap> {
        let cs = heap.read(rec + STRING_CS_OFFSET as u64, MemKind::Ptr)?;
        let hash = heap.read(rec + STRING_HASH_OFFSET as u64, MemKind::I64)? as i64;
        let bytes = heap
            .read_array(cs, &BYTES_LAYOUT)?
            .into_iter()
            .map(|b| b as u8)
            .collect();
        Ok(HostString {
            bytes,
            hash: HashCell::from_raw(hash),
        })
    }
}

/// Identity, then length, then bytes. A cached hash only short-circuits to
/// `false` when both sides have one.
pub fn string_eq(a: &HostString, b: &HostString) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    if a.bytes.len() != b.bytes.len() {
        return false;
    }
    if let (HashCell::Computed(x), HashCell::Computed(y)) = (a.hash, b.hash) {
        if x != y {
            return false;
        }
    }
    a.bytes == b.bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TypeId;
    use crate::layout::{array_layout, struct_layout};
    use crate::types::TypeTable;

    #[test]
    fn string_constants_match_layout() {
        let mut t = TypeTable::new();
        let s = t.string_type();
        let sl = struct_layout(&t, s).unwrap();
        assert_eq!(sl.field("cs").unwrap().offset, STRING_CS_OFFSET);
        assert_eq!(sl.field("hash").unwrap().offset, STRING_HASH_OFFSET);
        assert_eq!(sl.size, STRING_SIZE);
        let bytes = t.array_of(TypeId::U8);
        assert_eq!(array_layout(&t, bytes).unwrap(), BYTES_LAYOUT);
    }

    #[test]
    fn array_round_trip_keeps_header_and_elements() {
        let mut t = TypeTable::new();
        let ints = t.array_of(TypeId::INT_BOT);
        let layout = array_layout(&t, ints).unwrap();
        let mut heap = Heap::new();
        let addr = heap.new_array(&layout, &[10, -20, 30, 40, 50]).unwrap();
        assert_eq!(heap.array_len(addr).unwrap(), 5);
        assert_eq!(heap.bytes(addr, 4).unwrap(), &[5, 0, 0, 0]);
        assert_eq!(heap.read_array(addr, &layout).unwrap(), vec![10, -20, 30, 40, 50]);
        assert_eq!(heap.read(addr + 8, MemKind::I64).unwrap() as i64, 10);
    }

    #[test]
    fn array_length_outside_u32_traps() {
        let mut heap = Heap::new();
        let layout = ArrayLayout {
            elem: MemKind::I64,
            base: 8,
            scale: 8,
        };
        assert_eq!(heap.alloc_array(&layout, -1), Err(Trap::ArrayLength(-1)));
        assert_eq!(
            heap.alloc_array(&layout, u32::MAX as i64),
            Err(Trap::ArrayLength(u32::MAX as i64))
        );
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn allocation_past_the_limit_traps() {
        let mut heap = Heap::new();
        assert!(matches!(heap.alloc(u32::MAX), Err(Trap::HeapExhausted { .. })));
        let a = heap.alloc(16).unwrap();
        let over = (MAX_HEAP_BYTES - 8) as u32;
        assert_eq!(
            heap.alloc(over),
            Err(Trap::HeapExhausted {
                requested: over as u64
            })
        );
        assert_eq!(heap.used(), 16);
        assert_eq!(heap.alloc(8).unwrap(), a + 16);
    }

    #[test]
    fn null_and_out_of_range_trap() {
        let mut heap = Heap::new();
        let a = heap.alloc(8).unwrap();
        assert_eq!(heap.read(0, MemKind::I64), Err(Trap::NullPointer { offset: 0 }));
        assert!(matches!(heap.read(a + 8, MemKind::I64), Err(Trap::OutOfBounds { .. })));
    }

    #[test]
    fn signed_reads_extend() {
        let mut heap = Heap::new();
        let a = heap.alloc(8).unwrap();
        heap.write(a, MemKind::I32, -5i64 as u64).unwrap();
        assert_eq!(heap.read(a, MemKind::I32).unwrap() as i64, -5);
        assert_eq!(heap.read(a, MemKind::U32).unwrap(), 0xffff_fffb);
    }

    #[test]
    fn string_equality_rules() {
        let mut a = HostString::new("test");
        let b = HostString::new("test1");
        assert!(string_eq(&a, &a));
        assert!(!string_eq(&a, &b));
        let mut c = HostString::new("test");
        assert!(string_eq(&a, &c));
        a.hash_code();
        c.hash_code();
        assert!(string_eq(&a, &c));
        assert_eq!(a.hash, HashCell::Computed(string_hash(b"test")));
    }

    #[test]
    fn empty_string_hash_is_nonzero() {
        assert_eq!(string_hash(b""), NONZERO_HASH);
        assert_eq!(HashCell::from_raw(0), HashCell::Unset);
    }

    #[test]
    fn stored_string_round_trips() {
        let mut heap = Heap::new();
        let s = HostString::new("hello");
        let rec = s.store(&mut heap).unwrap();
        assert_eq!(HostString::load(&heap, rec).unwrap(), s);
    }
}
