//! Token store: the line-oriented `key=value` credential file and the
//! persistence trait around it.
//!
//! ```text
//! client_id=...
//! client_secret=...
//! access_token=...
//! refresh_token=...
//! expires_in=86399
//! obtained_at=2026-01-02T03:04:05Z
//! device_id=...
//! ```
//!
//! Keys this crate does not know about are kept and written back unchanged.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::StoreError;
use crate::paths::{AppPaths, BundledTemplate, TemplateSource, EMBEDDED_TOKEN_TEMPLATE};

const KEY_CLIENT_ID: &str = "client_id";
const KEY_CLIENT_SECRET: &str = "client_secret";
const KEY_AUTH_CODE: &str = "auth_code";
const KEY_ACCESS_TOKEN: &str = "access_token";
const KEY_REFRESH_TOKEN: &str = "refresh_token";
const KEY_EXPIRES_IN: &str = "expires_in";
const KEY_OBTAINED_AT: &str = "obtained_at";
const KEY_DEVICE_ID: &str = "device_id";

/// OAuth client registration. Loaded once and never modified by this crate.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .finish()
    }
}

/// Access/refresh token pair plus what is known about its lifetime.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub obtained_at: Option<DateTime<Utc>>,
    /// Lifetime in seconds as reported by the token endpoint
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("obtained_at", &self.obtained_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl TokenSet {
    /// Seconds before the reported expiry at which a token is already treated as expired.
    pub const EXPIRY_SKEW_SECS: i64 = 60;

    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// `obtained_at + expires_in`, when both are known.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let obtained = self.obtained_at?;
        let lifetime = i64::try_from(self.expires_in?).ok()?;
        obtained.checked_add_signed(chrono::Duration::seconds(lifetime))
    }

    /// Known to be expired at `now`. Unknown lifetime is never "known expired".
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => now + chrono::Duration::seconds(Self::EXPIRY_SKEW_SECS) >= expires_at,
            None => false,
        }
    }
}

/// Full contents of the token store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRecord {
    pub credentials: Credentials,
    pub tokens: TokenSet,
    /// One-time authorization code; empty once it has been exchanged
    pub auth_code: String,
    pub device_id: String,
    /// Unrecognised keys, in file order
    pub extra: Vec<(String, String)>,
}

impl TokenRecord {
    /// No access token, no refresh token, but an authorization code to exchange.
    pub fn needs_code_exchange(&self) -> bool {
        !self.tokens.has_access_token()
            && !self.tokens.has_refresh_token()
            && !self.auth_code.is_empty()
    }

    pub fn device_id(&self) -> Option<&str> {
        Some(self.device_id.as_str()).filter(|id| !id.is_empty())
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

/// Parse `key=value` lines. Blank lines, comments and lines without `=` are
/// skipped; trailing CR/LF and surrounding whitespace are stripped. A later
/// duplicate key wins.
pub fn parse_token_file(text: &str) -> TokenRecord {
    let mut record = TokenRecord::default();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches(['\r', '\n']).trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            tracing::debug!("Ignoring malformed token store line {}", index + 1);
            continue;
        };
        let key = key.trim();
        let value = value.trim().to_string();
        if key.is_empty() {
            tracing::debug!("Ignoring token store line {} with empty key", index + 1);
            continue;
        }

        match key {
            KEY_CLIENT_ID => record.credentials.client_id = value,
            KEY_CLIENT_SECRET => record.credentials.client_secret = value,
            KEY_AUTH_CODE => record.auth_code = value,
            KEY_ACCESS_TOKEN => record.tokens.access_token = value,
            KEY_REFRESH_TOKEN => record.tokens.refresh_token = value,
            KEY_DEVICE_ID => record.device_id = value,
            KEY_EXPIRES_IN => match value.parse::<u64>() {
                Ok(secs) => record.tokens.expires_in = Some(secs),
                Err(_) if value.is_empty() => record.tokens.expires_in = None,
                Err(e) => tracing::debug!("Ignoring invalid expires_in: {}", e),
            },
            KEY_OBTAINED_AT => match DateTime::parse_from_rfc3339(&value) {
                Ok(ts) => record.tokens.obtained_at = Some(ts.with_timezone(&Utc)),
                Err(_) if value.is_empty() => record.tokens.obtained_at = None,
                Err(e) => tracing::debug!("Ignoring invalid obtained_at: {}", e),
            },
            other => match record.extra.iter_mut().find(|(k, _)| k.as_str() == other) {
                Some(entry) => entry.1 = value,
                None => record.extra.push((other.to_string(), value)),
            },
        }
    }

    record
}

/// Render a record in the store format. Optional fields are omitted when unset.
pub fn render_token_file(record: &TokenRecord) -> String {
    let mut lines = vec![
        format!("{}={}", KEY_CLIENT_ID, record.credentials.client_id),
        format!("{}={}", KEY_CLIENT_SECRET, record.credentials.client_secret),
    ];
    if !record.auth_code.is_empty() {
        lines.push(format!("{}={}", KEY_AUTH_CODE, record.auth_code));
    }
    lines.push(format!("{}={}", KEY_ACCESS_TOKEN, record.tokens.access_token));
    lines.push(format!("{}={}", KEY_REFRESH_TOKEN, record.tokens.refresh_token));
    if let Some(expires_in) = record.tokens.expires_in {
        lines.push(format!("{}={}", KEY_EXPIRES_IN, expires_in));
    }
    if let Some(obtained_at) = record.tokens.obtained_at {
        lines.push(format!(
            "{}={}",
            KEY_OBTAINED_AT,
            obtained_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        ));
    }
    if !record.device_id.is_empty() {
        lines.push(format!("{}={}", KEY_DEVICE_ID, record.device_id));
    }
    for (key, value) in &record.extra {
        lines.push(format!("{}={}", key, value));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Persistence for the token record.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<TokenRecord, StoreError>;
    fn save(&self, record: &TokenRecord) -> Result<(), StoreError>;
}

/// Token store kept in a file in the writable data directory.
///
/// On first use the file is seeded from a bundled template without any
/// network activity. Saves replace the file atomically and, when a backup
/// directory is set, keep a timestamped copy of the previous contents.
pub struct FileTokenStore {
    path: PathBuf,
    backup_dir: Option<PathBuf>,
    template: Option<Box<dyn TemplateSource>>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: None,
            template: None,
        }
    }

    /// Store at `<data_dir>/token.txt`, seeded from `<resource_dir>/token.txt`
    /// or the built-in template, backing up to `<data_dir>/backups`.
    pub fn from_paths(paths: &AppPaths) -> Self {
        Self::new(paths.token_file())
            .with_template(
                BundledTemplate::in_resources(paths).with_fallback(EMBEDDED_TOKEN_TEMPLATE),
            )
            .with_backups(paths.backup_dir())
    }

    pub fn with_template(mut self, template: impl TemplateSource + 'static) -> Self {
        self.template = Some(Box::new(template));
        self
    }

    pub fn with_backups(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the bundled template into place. No network activity happens here.
    fn seed_from_template(&self) -> Result<(), StoreError> {
        let Some(template) = &self.template else {
            return Err(StoreError::NotFound(self.path.clone()));
        };
        let bytes = match template.read_bundled_token_template() {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        write_atomically(&self.path, &bytes)?;
        tracing::info!("Seeded token store {:?} from bundled template", self.path);
        Ok(())
    }

    fn backup_existing(&self) {
        let Some(dir) = &self.backup_dir else {
            return;
        };
        if !self.path.exists() {
            return;
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let target = dir.join(format!("token_{}.bak", stamp));
        let result = fs::create_dir_all(dir).and_then(|_| fs::copy(&self.path, &target));
        match result {
            Ok(_) => tracing::debug!("Backed up token store to {:?}", target),
            Err(e) => tracing::warn!("Failed to back up token store to {:?}: {}", target, e),
        }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<TokenRecord, StoreError> {
        if !self.path.exists() {
            self.seed_from_template()?;
        }
        let bytes = fs::read(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        let record = parse_token_file(&String::from_utf8_lossy(&bytes));
        tracing::debug!(
            "Loaded token store {:?} (access token: {}, refresh token: {})",
            self.path,
            record.tokens.has_access_token(),
            record.tokens.has_refresh_token()
        );
        Ok(record)
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        self.backup_existing();
        write_atomically(&self.path, render_token_file(record).as_bytes())?;
        tracing::debug!("Saved token store {:?}", self.path);
        Ok(())
    }
}

/// Write to a sibling temp file, then rename over `path`.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = (|| -> std::io::Result<()> {
        let mut file = open_private(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}

/// Token store held in memory.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    record: Mutex<Option<TokenRecord>>,
    saves: Mutex<usize>,
}

impl MemoryTokenStore {
    pub fn new(record: TokenRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
            saves: Mutex::new(0),
        }
    }

    /// Store with nothing in it; `load` fails with `NotFound`.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<TokenRecord> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the stored record without counting it as a save.
    pub fn replace(&self, record: TokenRecord) {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<TokenRecord, StoreError> {
        self.snapshot()
            .ok_or_else(|| StoreError::NotFound(PathBuf::from("<memory>")))
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        self.replace(record.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}
