use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum UTF-8 byte length for a peer id embedded in an origin tag.
pub const MAX_PEER_ID_LEN: usize = u8::MAX as usize;

const LOCAL_TAG: &str = "local";
const REMOTE_PREFIX: &str = "remote:";

/// Where a CRDT transaction came from.
///
/// Remote updates are applied under a `Remote` origin so the update observer
/// can recognise them and never stream them back out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateOrigin {
    Local,
    Remote { peer_id: String },
}

impl UpdateOrigin {
    pub fn remote(peer_id: impl Into<String>) -> Self {
        Self::Remote { peer_id: peer_id.into() }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Textual tag used as the CRDT transaction origin.
    ///
    /// Layout: `local` or `remote:<peer_id>`.
    pub fn to_tag(&self) -> Result<String, OriginCodecError> {
        match self {
            Self::Local => Ok(LOCAL_TAG.to_string()),
            Self::Remote { peer_id } => {
                if peer_id.len() > MAX_PEER_ID_LEN {
                    return Err(OriginCodecError::PeerIdTooLong {
                        len: peer_id.len(),
                        max: MAX_PEER_ID_LEN,
                    });
                }
                Ok(format!("{REMOTE_PREFIX}{peer_id}"))
            }
        }
    }

    /// Decodes raw origin bytes read back from a transaction.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OriginCodecError> {
        let tag = std::str::from_utf8(bytes).map_err(|_| OriginCodecError::InvalidUtf8)?;
        tag.parse()
    }
}

impl FromStr for UpdateOrigin {
    type Err = OriginCodecError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        if tag == LOCAL_TAG {
            return Ok(Self::Local);
        }
        match tag.strip_prefix(REMOTE_PREFIX) {
            Some(peer_id) if peer_id.len() > MAX_PEER_ID_LEN => {
                Err(OriginCodecError::PeerIdTooLong { len: peer_id.len(), max: MAX_PEER_ID_LEN })
            }
            Some(peer_id) => Ok(Self::remote(peer_id)),
            None => Err(OriginCodecError::UnknownTag(tag.to_string())),
        }
    }
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str(LOCAL_TAG),
            Self::Remote { peer_id } => write!(f, "{REMOTE_PREFIX}{peer_id}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginCodecError {
    #[error("peer id exceeds maximum length ({max} bytes), got {len}")]
    PeerIdTooLong { len: usize, max: usize },
    #[error("origin tag is not valid UTF-8")]
    InvalidUtf8,
    #[error("unrecognised origin tag: {0}")]
    UnknownTag(String),
}
