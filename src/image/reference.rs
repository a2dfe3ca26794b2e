//! Image references within a registry endpoint: `repo:tag` or `repo@digest`

use crate::digest::Digest;
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => f.write_str(digest.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub repository: String,
    pub reference: Reference,
}

impl ImageReference {
    pub fn tagged(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reference: Reference::Tag(tag.into()),
        }
    }

    pub fn by_digest(repository: impl Into<String>, digest: Digest) -> Self {
        Self {
            repository: repository.into(),
            reference: Reference::Digest(digest),
        }
    }

    /// Same repository, pinned to `digest`
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self::by_digest(self.repository.clone(), digest)
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.reference {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }
}

impl FromStr for ImageReference {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((repository, digest)) = s.split_once('@') {
            if repository.is_empty() {
                return Err(ReplicationError::InvalidReference(format!("empty repository: {}", s)));
            }
            return Ok(Self::by_digest(repository, digest.parse()?));
        }

        // A colon before the last slash belongs to a registry port, not a tag
        let name_start = s.rfind('/').map(|pos| pos + 1).unwrap_or(0);
        let (repository, tag) = match s[name_start..].rfind(':') {
            Some(pos) => (&s[..name_start + pos], &s[name_start + pos + 1..]),
            None => (s, "latest"),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(ReplicationError::InvalidReference(s.to_string()));
        }

        Ok(Self::tagged(repository, tag))
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            Reference::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}
