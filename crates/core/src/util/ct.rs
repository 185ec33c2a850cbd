//! Constant-time comparisons for digest material.

use subtle::{Choice, ConstantTimeEq};

/// Compare two byte slices without early exit.
///
/// Slices of different lengths compare unequal; the length check itself is
/// not hidden.
pub fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// True if every byte is zero, without early exit.
pub fn is_zero(bytes: &[u8]) -> bool {
    let mut acc = Choice::from(1u8);
    for b in bytes {
        acc &= b.ct_eq(&0u8);
    }
    acc.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_eq() {
        assert!(bytes_eq(b"abcd", b"abcd"));
        assert!(!bytes_eq(b"abcd", b"abce"));
        assert!(!bytes_eq(b"abc", b"abcd"));
        assert!(bytes_eq(b"", b""));
    }

    #[test]
    fn test_is_zero() {
        assert!(is_zero(&[0, 0, 0]));
        assert!(!is_zero(&[0, 1, 0]));
        assert!(is_zero(&[]));
    }
}
