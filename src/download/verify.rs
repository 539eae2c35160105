//! Artifact integrity verification

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, RuntimeError};

const READ_BUFFER: usize = 8 * 1024 * 1024;

/// Digests of one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDigest {
    pub sha256: String,
    pub md5: Option<String>,
}

/// Hashes a file in 8 MB reads. MD5 is only computed when asked for
pub fn digest_file(path: &Path, with_md5: bool) -> Result<ArtifactDigest> {
    let mut file = File::open(path).map_err(|e| {
        RuntimeError::model(format!("Failed to open artifact for verification: {}", e))
            .with_context("path", path.display())
    })?;

    let mut sha = Sha256::new();
    let mut md5 = with_md5.then(md5::Context::new);
    let mut buffer = vec![0u8; READ_BUFFER];

    loop {
        let n = file.read(&mut buffer).map_err(|e| {
            RuntimeError::model(format!("Failed to read artifact: {}", e))
                .with_context("path", path.display())
        })?;
        if n == 0 {
            break;
        }
        sha.update(&buffer[..n]);
        if let Some(ctx) = md5.as_mut() {
            ctx.consume(&buffer[..n]);
        }
    }

    Ok(ArtifactDigest {
        sha256: hex::encode(sha.finalize()),
        md5: md5.map(|ctx| format!("{:x}", ctx.compute())),
    })
}

/// Checks an artifact against its strong checksum and, if given, the legacy MD5.
///
/// A mismatch is a terminal `ModelError`.
pub fn verify_artifact(path: &Path, sha256: &str, legacy_md5: Option<&str>) -> Result<()> {
    let digest = digest_file(path, legacy_md5.is_some())?;

    if !digest.sha256.eq_ignore_ascii_case(sha256) {
        return Err(RuntimeError::model("Checksum mismatch")
            .with_context("algorithm", "sha256")
            .with_context("expected", sha256)
            .with_context("actual", &digest.sha256));
    }

    if let (Some(expected), Some(actual)) = (legacy_md5, digest.md5.as_deref()) {
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(RuntimeError::model("Legacy checksum mismatch")
                .with_context("algorithm", "md5")
                .with_context("expected", expected)
                .with_context("actual", actual));
        }
    }

    debug!("Verified {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[test]
    fn test_known_digests() {
        let file = file_with(b"hello world");
        let digest = digest_file(file.path(), true).unwrap();
        assert_eq!(
            digest.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(digest.md5.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
    }

    #[test]
    fn test_verify_accepts_uppercase_expected() {
        let file = file_with(b"hello world");
        verify_artifact(
            file.path(),
            "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9",
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3"),
        )
        .unwrap();
    }

    #[test]
    fn test_single_byte_corruption_detected() {
        let file = file_with(b"hello worle");
        let err = verify_artifact(
            file.path(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Model);
        assert!(!err.is_transient());
        assert_eq!(err.context.get("algorithm").map(String::as_str), Some("sha256"));
    }

    #[test]
    fn test_legacy_md5_mismatch() {
        let file = file_with(b"hello world");
        let err = verify_artifact(
            file.path(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            Some("00000000000000000000000000000000"),
        )
        .unwrap_err();
        assert_eq!(err.context.get("algorithm").map(String::as_str), Some("md5"));
    }
}
