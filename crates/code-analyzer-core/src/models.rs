//! Core data models shared by the orchestrator and its adapters.
//!
//! These types describe what flows through an analysis run: the repository
//! being analyzed, the storage collection scoped to it, the embedding
//! records written to the vector store, and the conversation handed to the
//! completion model.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest slug kept in a collection name before the hash suffix.
const MAX_SLUG_LEN: usize = 40;

/// Opaque identifier of the repository being analyzed (usually a clone URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryId(String);

impl RepositoryId {
    /// Wrap a repository identifier. Surrounding whitespace is trimmed;
    /// returns `None` for an empty identifier.
    pub fn parse(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bucket-safe storage namespace derived from a [`RepositoryId`].
///
/// Names match `[a-z0-9-]{3,63}` so they are valid as S3 bucket names and
/// as directory names. The layout is `<slug>-<hash8>` for the repository
/// and `<slug>-<hash8>-<run8>` for a single run, where `hash8` is taken from
/// the SHA-256 of the raw identifier so that identifiers which slugify the
/// same way (`a/b-c` vs `a-b/c`) still get distinct collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionName(String);

impl CollectionName {
    /// The stable collection name for a repository.
    pub fn for_repository(repository: &RepositoryId) -> Self {
        Self(format!(
            "{}-{}",
            slugify(repository.as_str()),
            short_hash(repository.as_str())
        ))
    }

    /// A collection name unique to one run of one repository.
    ///
    /// Only the first 8 alphanumeric characters of `discriminator` are used.
    pub fn for_run(repository: &RepositoryId, discriminator: &str) -> Self {
        let run: String = discriminator
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .take(8)
            .collect();
        let base = Self::for_repository(repository);
        if run.is_empty() {
            base
        } else {
            Self(format!("{}-{}", base.0, run))
        }
    }

    /// Rebuild a name previously produced by this type (e.g. read back from
    /// the run ledger).
    pub fn from_stored(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn slugify(raw: &str) -> String {
    let mut rest = raw.trim();
    for prefix in ["https://", "http://", "ssh://", "git://", "file://", "git@"] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);

    let mut slug = String::with_capacity(rest.len());
    let mut pending_dash = false;
    for c in rest.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "repo".to_string()
    } else {
        slug
    }
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// A row in the vector store. Unique per (`repository`, `key`).
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub repository: RepositoryId,
    pub key: String,
    pub content: String,
    pub vector: Vec<f32>,
}

/// A record returned by a nearest-neighbour query.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedDocument {
    pub key: String,
    pub content: String,
    /// Cosine distance to the query vector; smaller is closer.
    pub distance: f32,
}

/// Speaker of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// One turn of a conversation sent to the completion model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}
