//! VDBE memory cells
//!
//! A `Mem` is one polymorphic slot of the value stack or the named
//! memory-cell array. Type flags track which representations are
//! currently valid; a numeric cell may also carry its cached textual
//! form, and a string cell carries exactly one storage-subtype flag
//! recording where its bytes came from.

use std::cmp::Ordering;
use std::fmt;

use crate::types::Value;
use crate::util::strings;

/// Size of the inline buffer the original engine embeds in each cell;
/// strings at or under this length are flagged `SHORT`.
pub const NBFS: usize = 32;

// ============================================================================
// Flags
// ============================================================================

bitflags::bitflags! {
    /// Cell state flags. At most one of STATIC/DYN/EPHEM/SHORT is set,
    /// and only when STR is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u16 {
        /// Value is NULL
        const NULL   = 0x0001;
        /// Integer representation is valid
        const INT    = 0x0002;
        /// Real representation is valid
        const REAL   = 0x0004;
        /// String representation is valid
        const STR    = 0x0008;
        /// String is a program literal; never freed
        const STATIC = 0x0010;
        /// String is heap memory owned by this cell
        const DYN    = 0x0020;
        /// String aliases memory owned elsewhere (a cursor or another
        /// cell); invalidated by any mutation of the owner
        const EPHEM  = 0x0040;
        /// String lives in the cell's inline buffer
        const SHORT  = 0x0080;
    }
}

impl MemFlags {
    /// The string storage-subtype bits.
    pub fn subtype_bits(self) -> MemFlags {
        self & (MemFlags::STATIC | MemFlags::DYN | MemFlags::EPHEM | MemFlags::SHORT)
    }
}

// ============================================================================
// Memory Cell
// ============================================================================

/// One stack slot / memory cell.
#[derive(Clone)]
pub struct Mem {
    pub flags: MemFlags,
    /// Integer payload, valid when INT is set
    pub i: i64,
    /// Real payload, valid when REAL is set
    pub r: f64,
    /// String payload, valid when STR is set
    pub z: Vec<u8>,
}

impl Mem {
    pub fn null() -> Self {
        Self {
            flags: MemFlags::NULL,
            i: 0,
            r: 0.0,
            z: Vec::new(),
        }
    }

    pub fn int(v: i64) -> Self {
        let mut m = Self::null();
        m.set_int(v);
        m
    }

    pub fn real(v: f64) -> Self {
        let mut m = Self::null();
        m.set_real(v);
        m
    }

    pub fn text(s: &str) -> Self {
        let mut m = Self::null();
        m.set_str(s.as_bytes().to_vec());
        m
    }

    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::Null => Self::null(),
            Value::Int(i) => Self::int(*i),
            Value::Real(r) => Self::real(*r),
            Value::Text(s) => Self::text(s),
        }
    }

    // ========================================================================
    // Setters
    // ========================================================================

    /// Release the cell back to NULL. Heap storage is freed only when
    /// the cell owned it (`DYN`/`SHORT`); other subtypes only forget
    /// their alias.
    pub fn release(&mut self) {
        if self
            .flags
            .intersects(MemFlags::DYN | MemFlags::SHORT)
        {
            self.z = Vec::new();
        } else {
            self.z.clear();
        }
        self.flags = MemFlags::NULL;
        self.i = 0;
        self.r = 0.0;
    }

    pub fn set_null(&mut self) {
        self.release();
    }

    pub fn set_int(&mut self, v: i64) {
        self.release();
        self.flags = MemFlags::INT;
        self.i = v;
    }

    pub fn set_real(&mut self, v: f64) {
        self.release();
        self.flags = MemFlags::REAL;
        self.r = v;
    }

    fn str_subtype(len: usize, preferred: MemFlags) -> MemFlags {
        if len <= NBFS {
            MemFlags::SHORT
        } else {
            preferred
        }
    }

    /// Own the given bytes as a dynamic (or inline-short) string.
    pub fn set_str(&mut self, bytes: Vec<u8>) {
        self.release();
        let sub = Self::str_subtype(bytes.len(), MemFlags::DYN);
        self.flags = MemFlags::STR | sub;
        self.z = bytes;
    }

    /// A string from a program literal.
    pub fn set_str_static(&mut self, s: &str) {
        self.release();
        self.flags = MemFlags::STR | MemFlags::STATIC;
        self.z = s.as_bytes().to_vec();
    }

    /// A string borrowed from a cursor or neighbouring cell; the flag
    /// records that any mutation of the owner invalidates it.
    pub fn set_str_ephem(&mut self, bytes: Vec<u8>) {
        self.release();
        self.flags = MemFlags::STR | MemFlags::EPHEM;
        self.z = bytes;
    }

    /// Promote an ephemeral/static string to cell-owned storage so it
    /// survives its previous owner.
    pub fn make_owned(&mut self) {
        if self
            .flags
            .intersects(MemFlags::EPHEM | MemFlags::STATIC)
        {
            let sub = Self::str_subtype(self.z.len(), MemFlags::DYN);
            self.flags = (self.flags - MemFlags::EPHEM - MemFlags::STATIC) | sub;
        }
    }

    pub fn set_value(&mut self, v: &Value) {
        *self = Mem::from_value(v);
    }

    // ========================================================================
    // Queries and Coercions
    // ========================================================================

    pub fn is_null(&self) -> bool {
        self.flags.contains(MemFlags::NULL)
    }

    pub fn is_int(&self) -> bool {
        self.flags.contains(MemFlags::INT)
    }

    pub fn is_real(&self) -> bool {
        self.flags.contains(MemFlags::REAL)
    }

    pub fn is_str(&self) -> bool {
        self.flags.contains(MemFlags::STR)
    }

    /// Integer projection without mutating the cell.
    pub fn to_int(&self) -> i64 {
        if self.flags.contains(MemFlags::INT) {
            self.i
        } else if self.flags.contains(MemFlags::REAL) {
            self.r as i64
        } else if self.flags.contains(MemFlags::STR) {
            strings::str_to_int(&String::from_utf8_lossy(&self.z))
        } else {
            0
        }
    }

    /// Real projection without mutating the cell.
    pub fn to_real(&self) -> f64 {
        if self.flags.contains(MemFlags::REAL) {
            self.r
        } else if self.flags.contains(MemFlags::INT) {
            self.i as f64
        } else if self.flags.contains(MemFlags::STR) {
            strings::str_to_real(&String::from_utf8_lossy(&self.z))
        } else {
            0.0
        }
    }

    /// Convert in place to an integer.
    pub fn integerify(&mut self) {
        let v = self.to_int();
        self.set_int(v);
    }

    /// Convert in place to a real.
    pub fn realify(&mut self) {
        let v = self.to_real();
        self.set_real(v);
    }

    /// Ensure the string representation is present (keeping any numeric
    /// flags, which then coexist with their cached textual form).
    pub fn stringify(&mut self) {
        if self.flags.contains(MemFlags::STR) || self.flags.contains(MemFlags::NULL) {
            return;
        }
        let text = if self.flags.contains(MemFlags::INT) {
            self.i.to_string()
        } else {
            strings::real_to_text(self.r)
        };
        let bytes = text.into_bytes();
        let sub = Self::str_subtype(bytes.len(), MemFlags::DYN);
        self.flags |= MemFlags::STR | sub;
        self.z = bytes;
    }

    /// The string bytes; the cell must be stringified first unless it
    /// is NULL (which reads as empty).
    pub fn str_bytes(&self) -> &[u8] {
        if self.flags.contains(MemFlags::STR) {
            &self.z
        } else {
            &[]
        }
    }

    /// Owned textual form without mutating the cell.
    pub fn to_text(&self) -> String {
        if self.flags.contains(MemFlags::NULL) {
            String::new()
        } else if self.flags.contains(MemFlags::STR) {
            String::from_utf8_lossy(&self.z).into_owned()
        } else if self.flags.contains(MemFlags::INT) {
            self.i.to_string()
        } else {
            strings::real_to_text(self.r)
        }
    }

    /// Project into the public Value type.
    pub fn as_value(&self) -> Value {
        if self.flags.contains(MemFlags::NULL) {
            Value::Null
        } else if self.flags.contains(MemFlags::INT) {
            Value::Int(self.i)
        } else if self.flags.contains(MemFlags::REAL) {
            Value::Real(self.r)
        } else {
            Value::Text(String::from_utf8_lossy(&self.z).into_owned())
        }
    }

    /// The invariant every cell must satisfy after every operation.
    pub fn invariant_holds(&self) -> bool {
        let subs = self.flags.subtype_bits().bits().count_ones();
        if self.flags.contains(MemFlags::STR) {
            subs == 1
        } else {
            subs == 0
        }
    }
}

impl Default for Mem {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else if self.is_int() {
            write!(f, "i:{}", self.i)
        } else if self.is_real() {
            write!(f, "r:{}", self.r)
        } else if let Ok(s) = std::str::from_utf8(&self.z) {
            write!(f, "s:{:?}", s)
        } else {
            write!(f, "s:x'{}'", hex::encode(&self.z))
        }
    }
}

// ============================================================================
// Comparisons
// ============================================================================

/// Comparison used by the numeric opcodes: integer fast path when both
/// sides are integers, otherwise both coerce to reals.
pub fn numeric_cmp(a: &Mem, b: &Mem) -> Ordering {
    if a.is_int() && b.is_int() {
        a.i.cmp(&b.i)
    } else {
        a.to_real()
            .partial_cmp(&b.to_real())
            .unwrap_or(Ordering::Equal)
    }
}

/// Comparison used by the text opcodes: byte order of the textual
/// forms.
pub fn text_cmp(a: &Mem, b: &Mem) -> Ordering {
    a.to_text().as_bytes().cmp(b.to_text().as_bytes())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_subtype_flag() {
        let mut m = Mem::null();
        assert!(m.invariant_holds());
        m.set_str(b"hello".to_vec());
        assert!(m.invariant_holds());
        assert_eq!(m.flags.subtype_bits(), MemFlags::SHORT);
        m.set_str(vec![b'x'; 100]);
        assert_eq!(m.flags.subtype_bits(), MemFlags::DYN);
        m.set_str_static("lit");
        assert_eq!(m.flags.subtype_bits(), MemFlags::STATIC);
        m.set_int(3);
        assert!(m.invariant_holds());
    }

    #[test]
    fn test_stringify_keeps_numeric_flags() {
        let mut m = Mem::int(42);
        m.stringify();
        assert!(m.is_int());
        assert!(m.is_str());
        assert_eq!(m.str_bytes(), b"42");
        assert!(m.invariant_holds());
    }

    #[test]
    fn test_release_only_frees_owned() {
        let mut m = Mem::text("abcdefghijklmnopqrstuvwxyz0123456789");
        assert_eq!(m.flags.subtype_bits(), MemFlags::DYN);
        m.release();
        assert!(m.is_null());
        assert!(m.invariant_holds());
    }

    #[test]
    fn test_make_owned_promotes_ephemeral() {
        let mut m = Mem::null();
        m.set_str_ephem(b"borrowed".to_vec());
        m.make_owned();
        assert!(m.flags.contains(MemFlags::SHORT));
        assert!(!m.flags.contains(MemFlags::EPHEM));
        assert!(m.invariant_holds());
    }

    #[test]
    fn test_numeric_cmp() {
        assert_eq!(numeric_cmp(&Mem::int(2), &Mem::int(10)), Ordering::Less);
        assert_eq!(
            numeric_cmp(&Mem::text("2"), &Mem::text("10")),
            Ordering::Less
        );
        assert_eq!(
            numeric_cmp(&Mem::real(2.5), &Mem::int(2)),
            Ordering::Greater
        );
        // Garbage strings coerce to zero.
        assert_eq!(numeric_cmp(&Mem::text("x"), &Mem::int(0)), Ordering::Equal);
    }

    #[test]
    fn test_text_cmp() {
        assert_eq!(
            text_cmp(&Mem::text("2"), &Mem::text("10")),
            Ordering::Greater
        );
        assert_eq!(text_cmp(&Mem::int(2), &Mem::text("2")), Ordering::Equal);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(Mem::text("12abc").to_int(), 12);
        assert_eq!(Mem::text("2.5").to_real(), 2.5);
        assert_eq!(Mem::real(3.0).to_text(), "3.0");
        assert_eq!(Mem::null().to_text(), "");
    }
}
