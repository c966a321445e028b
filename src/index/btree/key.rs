use std::fmt;

/// Fixed-width index key of `N` bytes, compared lexicographically.
///
/// Integer keys are stored through an order-preserving encoding (big-endian
/// with the sign bit flipped) so that byte comparison matches numeric
/// comparison.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenericKey<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> GenericKey<N> {
    pub fn zero() -> Self {
        Self { bytes: [0; N] }
    }

    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Encode a signed integer into the first 8 bytes. Requires `N >= 8`.
    pub fn from_i64(value: i64) -> Self {
        debug_assert!(N >= 8, "key width too small for an i64");
        let mut bytes = [0u8; N];
        let encoded = (value as u64) ^ (1 << 63);
        bytes[..8].copy_from_slice(&encoded.to_be_bytes());
        Self { bytes }
    }

    /// Inverse of `from_i64`
    pub fn to_i64(&self) -> i64 {
        debug_assert!(N >= 8, "key width too small for an i64");
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[..8]);
        (u64::from_be_bytes(raw) ^ (1 << 63)) as i64
    }
}

impl<const N: usize> fmt::Debug for GenericKey<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if N >= 8 {
            write!(f, "GenericKey({})", self.to_i64())
        } else {
            write!(f, "GenericKey({:?})", self.bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_order_is_preserved() {
        let values = [i64::MIN, -500, -1, 0, 1, 37, i64::MAX];
        let keys: Vec<GenericKey<8>> = values.iter().map(|&v| GenericKey::from_i64(v)).collect();
        for window in keys.windows(2) {
            assert!(window[0] < window[1]);
        }
        for (&v, k) in values.iter().zip(&keys) {
            assert_eq!(k.to_i64(), v);
        }
    }

    #[test]
    fn test_wide_keys_compare_on_prefix() {
        let a = GenericKey::<16>::from_i64(10);
        let b = GenericKey::<16>::from_i64(11);
        assert!(a < b);
        assert_eq!(a, GenericKey::<16>::from_i64(10));
    }
}
