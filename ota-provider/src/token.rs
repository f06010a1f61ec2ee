//! Update tokens correlating a QueryImage offer with ApplyUpdateRequest and
//! NotifyUpdateApplied

use rand::RngCore;

pub const UPDATE_TOKEN_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("secure random source unavailable: {0}")]
    Rng(#[from] rand::Error),
}

/// Opaque random correlator. Not a credential on its own: it is always
/// matched together with the offered software version.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateToken([u8; UPDATE_TOKEN_LEN]);

impl UpdateToken {
    /// Fresh token from `rng`, normally the operating system's secure RNG
    pub fn generate_with<R: RngCore + ?Sized>(rng: &mut R) -> Result<Self, TokenError> {
        let mut bytes = [0u8; UPDATE_TOKEN_LEN];
        rng.try_fill_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; UPDATE_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; UPDATE_TOKEN_LEN] {
        &self.0
    }

    /// Byte-for-byte comparison with a token received on the wire
    pub fn matches(&self, other: &[u8]) -> bool {
        self.0.as_slice() == other
    }

    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }
}

impl std::fmt::Display for UpdateToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for UpdateToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UpdateToken({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_differ() {
        let a = UpdateToken::generate_with(&mut rand::rngs::OsRng).unwrap();
        let b = UpdateToken::generate_with(&mut rand::rngs::OsRng).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), UPDATE_TOKEN_LEN);
    }

    #[test]
    fn hex() {
        let token = UpdateToken::from_bytes([0xAB; UPDATE_TOKEN_LEN]);
        assert_eq!(token.to_hex(), "ab".repeat(UPDATE_TOKEN_LEN));
        assert_eq!(token.to_string(), token.to_hex());
    }

    #[test]
    fn single_bit_difference_does_not_match() {
        let token = UpdateToken::from_bytes([0x11; UPDATE_TOKEN_LEN]);
        let mut wire = token.as_bytes().to_vec();
        assert!(token.matches(&wire));

        wire[15] ^= 0x01;
        assert!(!token.matches(&wire));

        // shorter or longer tokens never match
        assert!(!token.matches(&wire[..8]));
        let mut longer = token.as_bytes().to_vec();
        longer.push(0);
        assert!(!token.matches(&longer));
    }
}
