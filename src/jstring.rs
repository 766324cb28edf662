use anyhow::{Context, Result};

/// Java string value kept as UTF-16 code units.
///
/// Decryption works on code units, so a value may hold lone surrogates until
/// it is written back to the constant pool.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub(crate) struct JavaString(Vec<u16>);

impl JavaString {
    /// XOR every code unit with the low 16 bits of `key`.
    pub(crate) fn xor_units(&self, key: i32) -> Self {
        Self(
            self.0
                .iter()
                .map(|&unit| ((unit as i32) ^ key) as u16)
                .collect(),
        )
    }

    /// Text for a `Utf8` pool entry. Lone surrogates have no such form.
    pub(crate) fn to_utf8(&self) -> Result<String> {
        String::from_utf16(&self.0).context("string constant holds a lone surrogate")
    }
}

impl From<&str> for JavaString {
    fn from(value: &str) -> Self {
        Self(value.encode_utf16().collect())
    }
}

/// `java.lang.String#hashCode`: `s[0]*31^(n-1) + ... + s[n-1]` with 32-bit wrap.
pub(crate) fn hash_code(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_code_matches_jvm_values() {
        assert_eq!(hash_code(""), 0);
        assert_eq!(hash_code("a"), 97);
        assert_eq!(hash_code("hello"), 99_162_322);
        assert_eq!(hash_code("<clinit>"), -1_944_711_511);
        // Overflowing input wraps like Java int arithmetic.
        assert_eq!(hash_code("java.lang.String"), 1_195_259_493);
    }

    #[test]
    fn xor_units_is_an_involution() {
        let plain = JavaString::from("secret value");
        let cipher = plain.xor_units(0x5a3c_1f77);
        assert_ne!(cipher, plain);
        assert_eq!(cipher.xor_units(0x5a3c_1f77), plain);
        assert_eq!(cipher.0[0], ('s' as u16) ^ 0x1f77);
    }

    #[test]
    fn utf8_form_keeps_pairs_and_rejects_lone_surrogates() {
        let pair = JavaString::from("snow \u{1f328}");
        assert_eq!(pair.to_utf8().expect("valid pair"), "snow \u{1f328}");

        let lone = JavaString(vec![0x0041, 0xd800]);
        assert!(lone.to_utf8().is_err());
        // 0x41 ^ 0xd800 is a lone high surrogate.
        assert!(JavaString::from("A").xor_units(0xd800).to_utf8().is_err());
    }
}
