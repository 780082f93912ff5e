//! Row record and index key encodings
//!
//! The engine owns two byte formats:
//!
//! * **Row records**: `[idx0 .. idxN | data0 .. data(N-1)]` where each
//!   `idxK` is a little-endian offset of uniform width 1, 2, or 3 bytes
//!   chosen by the total size bucket (255 / 65535), and `idxN` holds the
//!   total record length. Non-NULL fields are stored as text with a
//!   trailing NUL; a NULL field has zero payload, detected by
//!   `idx[k+1] == idx[k]`.
//!
//! * **Index keys**: a concatenation of tagged fields, `'a' 00` for
//!   NULL, `'b' <sortable-real> 00` for numbers, `'c' <text> 00` for
//!   text, followed by a 4-byte big-endian row id. Tag ordering makes
//!   NULL < number < text under plain byte comparison, and the sortable
//!   real form makes numeric order equal byte order.

use crate::error::{Error, ErrorCode, Result};
use crate::types::RowId;
use crate::util::strings;
use crate::vdbe::mem::Mem;

// ============================================================================
// Row-id <-> Key Bijection
// ============================================================================

/// Encode a row id as the fixed 4-byte big-endian key form.
pub fn int_to_key(rowid: RowId) -> [u8; 4] {
    (rowid as u32).to_be_bytes()
}

/// Decode a 4-byte key prefix back into a row id.
pub fn key_to_int(key: &[u8]) -> RowId {
    let mut b = [0u8; 4];
    let n = key.len().min(4);
    b[..n].copy_from_slice(&key[..n]);
    u32::from_be_bytes(b) as RowId
}

// ============================================================================
// Row Records
// ============================================================================

fn index_width(n_data: usize, n_field: usize) -> usize {
    if n_data + n_field + 1 < 256 {
        1
    } else if n_data + 2 * n_field + 2 < 65536 {
        2
    } else {
        3
    }
}

fn put_offset(out: &mut Vec<u8>, width: usize, v: usize) {
    out.push((v & 0xff) as u8);
    if width > 1 {
        out.push(((v >> 8) & 0xff) as u8);
        if width > 2 {
            out.push(((v >> 16) & 0xff) as u8);
        }
    }
}

/// Build a row record from a slice of cells. Fields are stringified in
/// place (caching the textual form on numeric cells). When `unique` is
/// given and any field is NULL, its bytes are folded in after the
/// header so records with NULL fields stay distinct.
pub fn make_record(fields: &mut [Mem], unique: Option<u32>) -> Vec<u8> {
    let n_field = fields.len();
    let mut n_data = 0usize;
    let mut has_null = false;
    for f in fields.iter_mut() {
        if f.is_null() {
            has_null = true;
        } else {
            f.stringify();
            n_data += f.str_bytes().len() + 1;
        }
    }
    let uniq = if has_null { unique } else { None };
    if uniq.is_some() {
        n_data += 4;
    }
    let width = index_width(n_data, n_field);
    let header = width * (n_field + 1);
    let mut out = Vec::with_capacity(header + n_data);

    let mut addr = header + if uniq.is_some() { 4 } else { 0 };
    for f in fields.iter() {
        put_offset(&mut out, width, addr);
        if !f.is_null() {
            addr += f.str_bytes().len() + 1;
        }
    }
    put_offset(&mut out, width, addr);
    if let Some(u) = uniq {
        out.extend_from_slice(&u.to_le_bytes());
    }
    for f in fields.iter() {
        if !f.is_null() {
            out.extend_from_slice(f.str_bytes());
            out.push(0);
        }
    }
    out
}

fn get_offset(rec: &[u8], width: usize, k: usize) -> Option<usize> {
    let base = width * k;
    if base + width > rec.len() {
        return None;
    }
    let mut v = rec[base] as usize;
    if width > 1 {
        v |= (rec[base + 1] as usize) << 8;
        if width > 2 {
            v |= (rec[base + 2] as usize) << 16;
        }
    }
    Some(v)
}

/// Extract field `k` from a record. `Ok(None)` is a NULL field; a
/// non-NULL field comes back without its terminator.
pub fn record_field(rec: &[u8], k: usize) -> Result<Option<Vec<u8>>> {
    if rec.is_empty() {
        return Ok(None);
    }
    let width = if rec.len() < 256 {
        1
    } else if rec.len() < 65536 {
        2
    } else {
        3
    };
    if rec.len() < width * (k + 2) {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let start = get_offset(rec, width, k).ok_or_else(|| Error::new(ErrorCode::Corrupt))?;
    let end = get_offset(rec, width, k + 1).ok_or_else(|| Error::new(ErrorCode::Corrupt))?;
    if end < start || end > rec.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    if end == start {
        return Ok(None);
    }
    // Strip the trailing NUL the encoder appended.
    Ok(Some(rec[start..end - 1].to_vec()))
}

// ============================================================================
// Index Keys
// ============================================================================

/// Append one tagged key field for a cell. `force_text` comes from the
/// key's type mask.
fn put_key_field(out: &mut Vec<u8>, f: &mut Mem, force_text: bool) -> bool {
    if f.is_null() {
        out.push(b'a');
        out.push(0);
        return true;
    }
    let numeric = !force_text
        && (f.is_int()
            || f.is_real()
            || strings::is_numeric(&String::from_utf8_lossy(f.str_bytes())));
    if numeric {
        let r = f.to_real();
        out.push(b'b');
        out.extend_from_slice(&strings::real_to_sortable(r));
        out.push(0);
    } else {
        f.stringify();
        out.push(b'c');
        out.extend_from_slice(f.str_bytes());
        out.push(0);
    }
    false
}

/// Build a sortable key from cells. `typemask` holds one `'t'` or `'n'`
/// per field (shorter masks leave the remainder inferred from the cell).
/// Returns the key and whether any field was NULL.
pub fn make_key(fields: &mut [Mem], typemask: &str) -> (Vec<u8>, bool) {
    let mask = typemask.as_bytes();
    let mut out = Vec::new();
    let mut has_null = false;
    for (j, f) in fields.iter_mut().enumerate() {
        let force_text = mask.get(j).copied() == Some(b't');
        if put_key_field(&mut out, f, force_text) {
            has_null = true;
        }
    }
    (out, has_null)
}

/// Build an index key: the tagged fields followed by the row-id suffix.
pub fn make_idx_key(fields: &mut [Mem], typemask: &str, rowid: RowId) -> (Vec<u8>, bool) {
    let (mut key, has_null) = make_key(fields, typemask);
    key.extend_from_slice(&int_to_key(rowid));
    (key, has_null)
}

/// The row id packed into the tail of an index key.
pub fn idx_key_rowid(key: &[u8]) -> Result<RowId> {
    if key.len() < 4 {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    Ok(key_to_int(&key[key.len() - 4..]))
}

/// Increment a key's final byte in place, producing the smallest key
/// strictly greater than every key sharing the original prefix.
pub fn incr_key(key: &mut [u8]) {
    if let Some(last) = key.last_mut() {
        *last = last.wrapping_add(1);
    }
}

// ============================================================================
// Sort Keys
// ============================================================================

/// Build an ORDER BY sort key. `mask` holds one code per field:
/// `'A'`/`'D'` for text ascending/descending, `'+'`/`'-'` for numeric.
/// NULL fields store `'N'`. Fields are NUL-separated and the whole key
/// ends in an extra NUL.
pub fn make_sort_key(fields: &mut [Mem], mask: &str) -> Vec<u8> {
    let codes = mask.as_bytes();
    let mut out = Vec::new();
    for (i, f) in fields.iter_mut().enumerate() {
        if f.is_null() {
            out.push(b'N');
            out.push(0);
        } else {
            out.push(codes.get(i).copied().unwrap_or(b'A'));
            f.stringify();
            out.extend_from_slice(f.str_bytes());
            out.push(0);
        }
    }
    out.push(0);
    out
}

/// Compare two sort keys produced by [`make_sort_key`], interpreting
/// each field's direction and type code.
pub fn sort_key_compare(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn next_field<'k>(key: &'k [u8], pos: &mut usize) -> Option<(u8, &'k [u8])> {
        if *pos >= key.len() || key[*pos] == 0 {
            return None;
        }
        let tag = key[*pos];
        *pos += 1;
        let start = *pos;
        while *pos < key.len() && key[*pos] != 0 {
            *pos += 1;
        }
        let field = &key[start..*pos];
        if *pos < key.len() {
            *pos += 1;
        }
        Some((tag, field))
    }

    let (mut ia, mut ib) = (0usize, 0usize);
    loop {
        let fa = next_field(a, &mut ia);
        let fb = next_field(b, &mut ib);
        let ((ta, va), (tb, vb)) = match (fa, fb) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => (x, y),
        };
        let desc = ta == b'D' || ta == b'-' || tb == b'D' || tb == b'-';
        let cmp = match (ta, tb) {
            (b'N', b'N') => Ordering::Equal,
            (b'N', _) => Ordering::Less,
            (_, b'N') => Ordering::Greater,
            _ if ta == b'+' || ta == b'-' => {
                let x = strings::str_to_real(&String::from_utf8_lossy(va));
                let y = strings::str_to_real(&String::from_utf8_lossy(vb));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            _ => va.cmp(vb),
        };
        let cmp = if desc { cmp.reverse() } else { cmp };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(vals: &[Option<&str>]) -> Vec<Mem> {
        vals.iter()
            .map(|v| match v {
                None => Mem::null(),
                Some(s) => Mem::text(s),
            })
            .collect()
    }

    #[test]
    fn test_record_roundtrip() {
        let mut fields = cells(&[Some("1"), Some("hello"), None, Some("")]);
        let rec = make_record(&mut fields, None);
        assert_eq!(record_field(&rec, 0).unwrap(), Some(b"1".to_vec()));
        assert_eq!(record_field(&rec, 1).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(record_field(&rec, 2).unwrap(), None);
        assert_eq!(record_field(&rec, 3).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_record_wide_offsets() {
        let big = "x".repeat(300);
        let mut fields = vec![Mem::text(&big), Mem::text("tail")];
        let rec = make_record(&mut fields, None);
        assert!(rec.len() >= 300);
        assert_eq!(
            record_field(&rec, 0).unwrap(),
            Some(big.as_bytes().to_vec())
        );
        assert_eq!(record_field(&rec, 1).unwrap(), Some(b"tail".to_vec()));
    }

    #[test]
    fn test_record_unique_tag_distinguishes_null_rows() {
        let mut a = cells(&[None, Some("x")]);
        let mut b = cells(&[None, Some("x")]);
        let ra = make_record(&mut a, Some(1));
        let rb = make_record(&mut b, Some(2));
        assert_ne!(ra, rb);
        // Field extraction is unaffected by the uniquifier.
        assert_eq!(record_field(&ra, 1).unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_key_null_number_text_ordering() {
        let (null_key, has_null) = make_key(&mut [Mem::null()], "");
        assert!(has_null);
        let (num_key, _) = make_key(&mut [Mem::int(5)], "");
        let (txt_key, _) = make_key(&mut [Mem::text("5x")], "");
        assert!(null_key < num_key);
        assert!(num_key < txt_key);
    }

    #[test]
    fn test_key_numeric_order_is_byte_order() {
        let vals = [-10.0, -1.5, 0.0, 2.0, 2.5, 100.0];
        let keys: Vec<Vec<u8>> = vals
            .iter()
            .map(|v| make_key(&mut [Mem::real(*v)], "").0)
            .collect();
        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_key_typemask_forces_text() {
        let (a, _) = make_key(&mut [Mem::text("12")], "t");
        let (b, _) = make_key(&mut [Mem::text("12")], "n");
        assert_ne!(a, b);
        assert_eq!(a[0], b'c');
        assert_eq!(b[0], b'b');
    }

    #[test]
    fn test_idx_key_rowid_roundtrip() {
        let (key, _) = make_idx_key(&mut [Mem::text("k")], "", 1234);
        assert_eq!(idx_key_rowid(&key).unwrap(), 1234);
    }

    #[test]
    fn test_incr_key_is_smallest_strictly_greater() {
        let (mut key, _) = make_key(&mut [Mem::text("abc")], "t");
        let orig = key.clone();
        incr_key(&mut key);
        assert!(key > orig);
        // Any index key with this prefix (prefix + rowid suffix) sorts
        // below the incremented key.
        let (with_rowid, _) = make_idx_key(&mut [Mem::text("abc")], "t", RowId::MAX & 0x7fffffff);
        assert!(with_rowid < key);
    }

    #[test]
    fn test_sort_key_directions() {
        let ka = make_sort_key(&mut [Mem::int(1)], "+");
        let kb = make_sort_key(&mut [Mem::int(2)], "+");
        assert_eq!(sort_key_compare(&ka, &kb), std::cmp::Ordering::Less);
        let ka = make_sort_key(&mut [Mem::int(1)], "-");
        let kb = make_sort_key(&mut [Mem::int(2)], "-");
        assert_eq!(sort_key_compare(&ka, &kb), std::cmp::Ordering::Greater);
        // Numeric, not lexicographic: 2 < 10.
        let ka = make_sort_key(&mut [Mem::text("2")], "+");
        let kb = make_sort_key(&mut [Mem::text("10")], "+");
        assert_eq!(sort_key_compare(&ka, &kb), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_sort_key_null_first() {
        let kn = make_sort_key(&mut [Mem::null()], "A");
        let ka = make_sort_key(&mut [Mem::text("a")], "A");
        assert_eq!(sort_key_compare(&kn, &ka), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_int_key_bijection() {
        for v in [0i64, 1, 255, 65536, MAX_ROWID_TEST] {
            assert_eq!(key_to_int(&int_to_key(v)), v);
        }
    }

    const MAX_ROWID_TEST: i64 = 0x7fff_ffff;
}
