use crate::errors::AppError;
use crate::models::ResearchMaterial;
use sha2::{Digest, Sha256};

/// Raw research sealed with a SHA-256 checksum for audit.
///
/// The blob is opaque once extraction has run: it is stored, verified on
/// internal reads, and never parsed back into research material by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedResearch {
    /// Serialized research material.
    pub data: String,
    /// Hex-encoded SHA-256 of `data`.
    pub checksum: String,
}

impl SealedResearch {
    pub fn seal(material: &ResearchMaterial) -> Result<Self, AppError> {
        Ok(Self::from_blob(material.to_blob()?))
    }

    pub fn from_blob(data: String) -> Self {
        let checksum = checksum(&data);
        Self { data, checksum }
    }

    /// Returns true if the checksum matches, false if tampered
    pub fn is_intact(&self) -> bool {
        checksum(&self.data) == self.checksum
    }
}

/// Computes SHA-256 checksum of the data
pub fn checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verifies a stored blob against its recorded checksum.
pub fn verify(identity_key: &str, data: &str, expected: &str) -> Result<(), AppError> {
    if checksum(data) == expected {
        return Ok(());
    }
    tracing::warn!(
        identity_key = %identity_key,
        blob_len = data.len(),
        "Research blob failed checksum verification"
    );
    Err(AppError::InternalError(format!(
        "research blob for {} failed integrity check",
        identity_key
    )))
}
