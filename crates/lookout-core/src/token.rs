use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Longest token accepted from a path segment. Minted tokens are 36-char
/// UUID strings; the ceiling just bounds what we key the registry on.
const MAX_TOKEN_LEN: usize = 128;

/// Single-use random identifier linking one host session to the visitor
/// events meant for it.
///
/// Minted tokens carry 128 bits of OS randomness and are formatted as UUID
/// strings so existing share links keep working. Tokens arriving on a path
/// are treated as opaque: any non-empty segment of sane length is a valid
/// lookup key, matching links minted by older hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairingToken(String);

#[derive(Debug, Error)]
pub enum TokenError {
    /// The OS entropy source refused to produce random bytes. There is no
    /// safe fallback; the calling session must abort.
    #[error("entropy source failure: {0}")]
    Entropy(rand::Error),
    #[error("malformed pairing token")]
    Malformed,
}

impl PairingToken {
    /// Mints a fresh token. Fails only when the OS RNG does.
    pub fn generate() -> Result<Self, TokenError> {
        let mut bytes = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(TokenError::Entropy)?;
        let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PairingToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_TOKEN_LEN {
            return Err(TokenError::Malformed);
        }
        Ok(Self(s.to_string()))
    }
}
