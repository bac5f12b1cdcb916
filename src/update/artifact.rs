//! Verified replacement binaries handed to the orchestrator.

use std::fs;
use std::io;
use std::path::PathBuf;

use super::error::ArtifactError;

/// A downloaded, already-verified replacement executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedArtifact {
    pub path: PathBuf,
    pub version: String,
}

/// Produces a verified artifact. Transport and signature checks live behind
/// this seam.
pub trait ArtifactSource: Send + Sync {
    fn fetch(&self) -> Result<VerifiedArtifact, ArtifactError>;
}

/// An artifact already staged on local disk.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    path: PathBuf,
    version: String,
}

impl StagedArtifact {
    pub fn new(path: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
        }
    }
}

impl ArtifactSource for StagedArtifact {
    fn fetch(&self) -> Result<VerifiedArtifact, ArtifactError> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArtifactError::Missing(self.path.clone()));
            }
            Err(source) => {
                return Err(ArtifactError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        if !meta.is_file() {
            return Err(ArtifactError::NotAFile(self.path.clone()));
        }
        if meta.len() == 0 {
            return Err(ArtifactError::Empty(self.path.clone()));
        }

        Ok(VerifiedArtifact {
            path: self.path.clone(),
            version: self.version.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.new");
        fs::write(&path, b"\x7fELF").unwrap();

        let artifact = StagedArtifact::new(&path, "2.1.0").fetch().unwrap();
        assert_eq!(artifact.path, path);
        assert_eq!(artifact.version, "2.1.0");
    }

    #[test]
    fn missing_empty_and_directory_artifacts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let missing = StagedArtifact::new(dir.path().join("absent"), "1.0.0").fetch();
        assert!(matches!(missing, Err(ArtifactError::Missing(_))));

        let empty = dir.path().join("empty");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(
            StagedArtifact::new(&empty, "1.0.0").fetch(),
            Err(ArtifactError::Empty(_))
        ));

        assert!(matches!(
            StagedArtifact::new(dir.path(), "1.0.0").fetch(),
            Err(ArtifactError::NotAFile(_))
        ));
    }
}
