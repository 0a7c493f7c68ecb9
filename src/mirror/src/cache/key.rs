use sha2::{Digest, Sha256};
use std::fmt;

/// Which subtree of the cache an artifact lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactClass {
    Manifest,
    Blob,
}

impl ArtifactClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactClass::Manifest => "manifest",
            ArtifactClass::Blob => "blob",
        }
    }

    /// Directory name under the cache root
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactClass::Manifest => "manifests",
            ArtifactClass::Blob => "blobs",
        }
    }
}

impl fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a cached artifact.
///
/// The on-disk name is the hex SHA-256 of `class:repository:reference`, so tags,
/// digests and nested repository names never reach the filesystem as path components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    class: ArtifactClass,
    repository: String,
    reference: String,
    hash: String,
}

impl CacheKey {
    pub fn new(class: ArtifactClass, repository: &str, reference: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(class.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(repository.as_bytes());
        hasher.update(b":");
        hasher.update(reference.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        Self {
            class,
            repository: repository.to_string(),
            reference: reference.to_string(),
            hash,
        }
    }

    pub fn manifest(repository: &str, reference: &str) -> Self {
        Self::new(ArtifactClass::Manifest, repository, reference)
    }

    pub fn blob(repository: &str, digest: &str) -> Self {
        Self::new(ArtifactClass::Blob, repository, digest)
    }

    pub fn class(&self) -> ArtifactClass {
        self.class
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Hex file stem
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class.dir_name(), self.hash)
    }
}

/// True for a bare content file name (64 lowercase hex characters, no extension)
pub fn is_content_file_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
