//! Natural ("human") ordering of entry names,
//! so that `img2.png` sorts before `img10.png`.
//!
//! This follows Martin Pool's `strnatcmp` rules:
//! whitespace and leading zeros are skipped, digit runs are compared
//! right-aligned, and everything else compares byte by byte.

use std::cmp::Ordering;

/// Returns the byte at `i`, or NUL past the end (like a C string).
fn at(s: &[u8], i: usize) -> u8 {
    s.get(i).copied().unwrap_or(0)
}

fn is_digit(s: &[u8], i: usize) -> bool {
    at(s, i).is_ascii_digit()
}

/// Whitespace, or a zero that leads into more digits.
fn is_skippable(s: &[u8], i: usize) -> bool {
    // C's isspace(), which (unlike u8::is_ascii_whitespace) includes \v.
    let c = at(s, i);
    matches!(c, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r') || (c == b'0' && is_digit(s, i + 1))
}

/// Compares two digit runs starting at `a[ai]` and `b[bi]`.
///
/// The longest run of digits wins.
/// That aside, the greatest value wins, but we can't know that until
/// we've scanned both runs and know they have the same magnitude,
/// so the first difference is kept in `bias`.
fn compare_runs(a: &[u8], mut ai: usize, b: &[u8], mut bi: usize) -> Ordering {
    let mut bias = Ordering::Equal;
    loop {
        match (is_digit(a, ai), is_digit(b, bi)) {
            (false, false) => return bias,
            (false, true) => return Ordering::Less,
            (true, false) => return Ordering::Greater,
            (true, true) => {
                if bias == Ordering::Equal {
                    bias = a[ai].cmp(&b[bi]);
                }
            }
        }
        ai += 1;
        bi += 1;
    }
}

/// Compares `a` and `b` in natural order.
pub fn compare(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut ai, mut bi) = (0, 0);

    loop {
        while is_skippable(a, ai) {
            ai += 1;
        }
        while is_skippable(b, bi) {
            bi += 1;
        }

        if is_digit(a, ai) && is_digit(b, bi) {
            let result = compare_runs(a, ai, b, bi);
            if result != Ordering::Equal {
                return result;
            }
        }

        if ai >= a.len() && bi >= b.len() {
            return Ordering::Equal;
        }

        match at(a, ai).cmp(&at(b, bi)) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        ai += 1;
        bi += 1;
    }
}

/// [`compare`], with ties broken by plain byte order
/// so that sorting names like `a01` and `a1` is deterministic.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    compare(a, b).then_with(|| a.cmp(b))
}
