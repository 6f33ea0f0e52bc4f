//! Where the token store lives and where its first-run template comes from.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// File name of the token store inside the writable data directory and of the
/// template inside the read-only resource directory.
pub const TOKEN_FILE_NAME: &str = "token.txt";

/// Template compiled into the binary, used when no template exists on disk.
pub const EMBEDDED_TOKEN_TEMPLATE: &[u8] = include_bytes!("../resources/token.txt");

/// Supplies the directories the token store works with.
pub trait PathProvider: Send + Sync {
    /// Directory the application may write to. Holds the live token store.
    fn writable_data_dir(&self) -> PathBuf;
    /// Directory shipped with the application. Holds the token template.
    fn readonly_resource_dir(&self) -> PathBuf;
}

/// Supplies the bytes used to seed the token store on first run.
pub trait TemplateSource: Send + Sync {
    fn read_bundled_token_template(&self) -> std::io::Result<Vec<u8>>;
}

/// Fixed pair of directories, usually resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub resource_dir: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: impl Into<PathBuf>, resource_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            resource_dir: resource_dir.into(),
        }
    }

    pub fn token_file(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE_NAME)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}

impl PathProvider for AppPaths {
    fn writable_data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    fn readonly_resource_dir(&self) -> PathBuf {
        self.resource_dir.clone()
    }
}

/// Reads the template from a file on disk, optionally falling back to fixed
/// bytes when that file does not exist.
#[derive(Debug, Clone)]
pub struct BundledTemplate {
    path: PathBuf,
    fallback: Option<&'static [u8]>,
}

impl BundledTemplate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback: None,
        }
    }

    /// Use `bytes` when the template file is missing.
    pub fn with_fallback(mut self, bytes: &'static [u8]) -> Self {
        self.fallback = Some(bytes);
        self
    }

    /// Template named [`TOKEN_FILE_NAME`] inside the provider's resource directory.
    pub fn in_resources(paths: &dyn PathProvider) -> Self {
        Self::new(paths.readonly_resource_dir().join(TOKEN_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TemplateSource for BundledTemplate {
    fn read_bundled_token_template(&self) -> std::io::Result<Vec<u8>> {
        match (std::fs::read(&self.path), self.fallback) {
            (Err(e), Some(bytes)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No template at {:?}, using the built-in one", self.path);
                Ok(bytes.to_vec())
            }
            (result, _) => result,
        }
    }
}

/// In-memory template contents.
impl TemplateSource for Vec<u8> {
    fn read_bundled_token_template(&self) -> std::io::Result<Vec<u8>> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_paths_layout() {
        let paths = AppPaths::new("/var/lib/stcapture", "/usr/share/stcapture");
        assert_eq!(
            paths.token_file(),
            PathBuf::from("/var/lib/stcapture/token.txt")
        );
        assert_eq!(
            paths.backup_dir(),
            PathBuf::from("/var/lib/stcapture/backups")
        );
        assert_eq!(
            BundledTemplate::in_resources(&paths).path(),
            Path::new("/usr/share/stcapture/token.txt")
        );
    }

    #[test]
    fn test_bundled_template_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let template = BundledTemplate::new(dir.path().join("absent.txt"));
        let err = template.read_bundled_token_template().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_template_on_disk_wins_over_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TOKEN_FILE_NAME);

        let template = BundledTemplate::new(&path).with_fallback(b"client_id=builtin\n");
        assert_eq!(
            template.read_bundled_token_template().unwrap(),
            b"client_id=builtin\n"
        );

        std::fs::write(&path, "client_id=on-disk\n").unwrap();
        assert_eq!(
            template.read_bundled_token_template().unwrap(),
            b"client_id=on-disk\n"
        );
    }

    #[test]
    fn test_embedded_template_lists_store_keys() {
        let text = String::from_utf8_lossy(EMBEDDED_TOKEN_TEMPLATE);
        for key in ["client_id=", "client_secret=", "auth_code=", "refresh_token="] {
            assert!(text.contains(key), "missing {}", key);
        }
    }
}
