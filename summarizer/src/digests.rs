use bytes::Bytes;
use data_encoding::BASE64;
use thiserror::Error;

/// The BLAKE3 digest of a snapshot blob, used as its content id.
#[derive(PartialEq, Eq, Hash)]
pub struct B3Digest(Bytes);

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),

    #[error("invalid content id: {0}")]
    InvalidContentId(String),
}

pub const B3_LEN: usize = 32;

impl B3Digest {
    /// Hashes the passed blob contents.
    pub fn of(contents: &[u8]) -> Self {
        blake3::hash(contents).into()
    }
}

impl From<blake3::Hash> for B3Digest {
    fn from(value: blake3::Hash) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl TryFrom<Vec<u8>> for B3Digest {
    type Error = Error;

    // constructs a [B3Digest] from a [Vec<u8>].
    // Returns an error if the digest has the wrong length.
    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != B3_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl std::str::FromStr for B3Digest {
    type Err = Error;

    /// Parses the `b3:<base64>` form produced by [std::fmt::Display].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix("b3:")
            .ok_or_else(|| Error::InvalidContentId(s.to_string()))?;
        let decoded = BASE64
            .decode(encoded.as_bytes())
            .map_err(|_| Error::InvalidContentId(s.to_string()))?;
        decoded.try_into()
    }
}

impl Clone for B3Digest {
    fn clone(&self) -> Self {
        Self(self.0.to_owned())
    }
}

impl std::fmt::Display for B3Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", BASE64.encode(&self.0))
    }
}

impl std::fmt::Debug for B3Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", BASE64.encode(&self.0))
    }
}
