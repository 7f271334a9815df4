use crate::{utils, CaptureError, ImageFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Destination of capture artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSink {
    /// Artifacts stay in memory and move to the caller
    #[default]
    InMemory,
    /// Artifacts are written below `directory`
    OnDisk { directory: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image(ImageFormat),
    Html,
    Pdf,
    Har,
}

impl ArtifactKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Image(format) => format.extension(),
            ArtifactKind::Html => "html",
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Har => "har",
        }
    }
}

/// A stored artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    InMemory(Vec<u8>),
    OnDisk(PathBuf),
}

impl Artifact {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Artifact::InMemory(bytes) => Some(bytes),
            Artifact::OnDisk(_) => None,
        }
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Artifact::InMemory(_) => None,
            Artifact::OnDisk(path) => Some(path),
        }
    }
}

impl OutputSink {
    /// Hand `bytes` over to the sink.
    ///
    /// On disk the file is named after the page URL and gets the extension
    /// sniffed from its content, falling back to the one implied by `kind`.
    pub async fn store(
        &self,
        kind: ArtifactKind,
        url: &str,
        bytes: Vec<u8>,
    ) -> Result<Artifact, CaptureError> {
        match self {
            OutputSink::InMemory => Ok(Artifact::InMemory(bytes)),
            OutputSink::OnDisk { directory } => {
                tokio::fs::create_dir_all(directory).await?;

                let extension = utils::sniff_extension(&bytes).unwrap_or(kind.extension());
                let path = directory.join(format!(
                    "{}.{}",
                    utils::artifact_basename(url),
                    extension
                ));

                tokio::fs::write(&path, &bytes).await?;
                tracing::debug!(
                    "Wrote {} ({}) to {}",
                    extension,
                    utils::format_bytes(bytes.len() as u64),
                    path.display()
                );
                Ok(Artifact::OnDisk(path))
            }
        }
    }
}
