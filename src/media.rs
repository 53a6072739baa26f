//! Turns image and audio references into the bytes a session consumes.

use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Unsupported media URI scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("Invalid file URI: {uri}")]
    InvalidUri { uri: String },

    #[error("Failed to read media file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Media file is empty: {path}")]
    Empty { path: PathBuf },
}

pub trait MediaResolver: Send + Sync {
    fn resolve(&self, uri: &str) -> Result<Vec<u8>, MediaError>;
}

/// Reads `file://` URIs and plain filesystem paths. Relative paths are
/// taken against `base_dir` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FileMediaResolver {
    base_dir: Option<PathBuf>,
}

impl FileMediaResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn locate(&self, uri: &str) -> Result<PathBuf, MediaError> {
        match Url::parse(uri) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|_| MediaError::InvalidUri {
                    uri: uri.to_string(),
                }),
            // Single letters are drive prefixes such as `C:\`.
            Ok(url) if url.scheme().len() > 1 => Err(MediaError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
            }),
            _ => Ok(self.relative_to_base(Path::new(uri))),
        }
    }

    fn relative_to_base(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl MediaResolver for FileMediaResolver {
    fn resolve(&self, uri: &str) -> Result<Vec<u8>, MediaError> {
        let path = self.locate(uri)?;
        let bytes = std::fs::read(&path).map_err(|source| MediaError::Read {
            path: path.clone(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(MediaError::Empty { path });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::{FileMediaResolver, MediaError, MediaResolver};
    use std::fs;

    #[test]
    fn reads_plain_paths_and_file_uris() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("cat image.png");
        fs::write(&image, [0x89, b'P', b'N', b'G']).expect("write");

        let resolver = FileMediaResolver::new();
        let by_path = resolver
            .resolve(&image.to_string_lossy())
            .expect("plain path");
        assert_eq!(by_path.len(), 4);

        let uri = url::Url::from_file_path(&image).expect("file uri");
        assert!(uri.as_str().contains("%20"));
        assert_eq!(resolver.resolve(uri.as_str()).expect("file uri"), by_path);
    }

    #[test]
    fn relative_paths_use_the_base_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("clip.wav"), b"RIFF").expect("write");

        let resolver = FileMediaResolver::with_base_dir(dir.path());
        assert_eq!(resolver.resolve("clip.wav").expect("relative"), b"RIFF");
    }

    #[test]
    fn rejects_remote_schemes_empty_and_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = dir.path().join("empty.jpg");
        fs::write(&empty, b"").expect("write");
        let resolver = FileMediaResolver::new();

        assert!(matches!(
            resolver.resolve("https://example.com/cat.png"),
            Err(MediaError::UnsupportedScheme { scheme }) if scheme == "https"
        ));
        assert!(matches!(
            resolver.resolve(&empty.to_string_lossy()),
            Err(MediaError::Empty { .. })
        ));
        assert!(matches!(
            resolver.resolve(&dir.path().join("nope.jpg").to_string_lossy()),
            Err(MediaError::Read { .. })
        ));
    }
}
