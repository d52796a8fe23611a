//! Persistent token storage backends
//!
//! A store keeps exactly one `TokenRecord`. "Nothing stored" is a normal
//! outcome of both `load` and `clear`, never an error.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::tokens::TokenRecord;

const KEYRING_SERVICE: &str = "webex-cli";

/// Persistence capability for a single token record.
pub trait CredentialStore: Send + Sync {
    fn store(&self, record: &TokenRecord) -> Result<()>;
    fn load(&self) -> Result<Option<TokenRecord>>;
    fn clear(&self) -> Result<()>;
}

/// Which backend persists tokens between runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// OS credential store (Keychain, Credential Manager, kernel keyring).
    #[default]
    Keyring,
    /// TOML file in the config directory, readable only by the owner.
    File,
}

impl std::str::FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "keyring" | "keychain" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            other => anyhow::bail!("Unknown token store: {}. Use: keyring, file", other),
        }
    }
}

/// Whether the keyring backend is available on this platform.
pub fn keyring_supported() -> bool {
    cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "windows",
        target_os = "linux"
    ))
}

/// Token record stored as JSON in the OS keyring.
pub struct KeyringStore {
    account: String,
}

impl KeyringStore {
    /// `account` separates the records of different auth modes.
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(KEYRING_SERVICE, &self.account)
            .context("Failed to open keyring entry")
    }
}

impl CredentialStore for KeyringStore {
    fn store(&self, record: &TokenRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize token")?;
        self.entry()?
            .set_password(&json)
            .context("Failed to store token in keyring")?;
        tracing::debug!("Stored token in keyring ({})", self.account);
        Ok(())
    }

    fn load(&self) -> Result<Option<TokenRecord>> {
        match self.entry()?.get_password() {
            Ok(json) => {
                let record =
                    serde_json::from_str(&json).context("Failed to parse stored token")?;
                Ok(Some(record))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read token from keyring"),
        }
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keyring"),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: std::collections::BTreeMap<String, TokenRecord>,
}

/// Token records kept in a TOML file, one table entry per account.
pub struct FileStore {
    path: PathBuf,
    account: String,
}

impl FileStore {
    pub fn new(path: PathBuf, account: impl Into<String>) -> Self {
        Self {
            path,
            account: account.into(),
        }
    }

    fn read(&self) -> Result<TokenFile> {
        if !self.path.exists() {
            return Ok(TokenFile::default());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read token file")?;
        toml::from_str(&content).context("Failed to parse token file")
    }

    fn write(&self, file: &TokenFile) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).context("Failed to create token directory")?;
        }
        let content = toml::to_string_pretty(file).context("Failed to serialize token file")?;

        // Tokens are secrets: owner read/write only, from the moment the file exists
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut out = options
            .open(&self.path)
            .context("Failed to open token file")?;

        // `mode` only applies on creation; tighten a file left behind by older runs
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            out.set_permissions(fs::Permissions::from_mode(0o600))
                .context("Failed to set token file permissions")?;
        }

        out.write_all(content.as_bytes())
            .context("Failed to write token file")?;
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn store(&self, record: &TokenRecord) -> Result<()> {
        let mut file = self.read()?;
        file.tokens.insert(self.account.clone(), record.clone());
        self.write(&file)
    }

    fn load(&self) -> Result<Option<TokenRecord>> {
        Ok(self.read()?.tokens.remove(&self.account))
    }

    fn clear(&self) -> Result<()> {
        let mut file = self.read()?;
        if file.tokens.remove(&self.account).is_some() {
            self.write(&file)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tokens::tests::t0;
    use std::sync::Mutex;

    /// In-memory store that records how often it was written.
    #[derive(Default)]
    pub struct MemoryStore {
        pub record: Mutex<Option<TokenRecord>>,
        pub writes: Mutex<usize>,
    }

    impl MemoryStore {
        pub fn with(record: TokenRecord) -> Self {
            Self {
                record: Mutex::new(Some(record)),
                writes: Mutex::new(0),
            }
        }

        pub fn current(&self) -> Option<TokenRecord> {
            self.record.lock().unwrap().clone()
        }
    }

    impl CredentialStore for MemoryStore {
        fn store(&self, record: &TokenRecord) -> Result<()> {
            *self.record.lock().unwrap() = Some(record.clone());
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        fn load(&self) -> Result<Option<TokenRecord>> {
            Ok(self.current())
        }

        fn clear(&self) -> Result<()> {
            *self.record.lock().unwrap() = None;
            Ok(())
        }
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("tokens.toml"), "auto-refresh");
        assert!(store.load().unwrap().is_none());
        // Clearing nothing is fine too.
        store.clear().unwrap();
    }

    #[test]
    fn test_file_store_accounts_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.toml");
        let personal = FileStore::new(path.clone(), "auto-refresh");
        let oauth = FileStore::new(path, "oauth");

        personal.store(&TokenRecord::new("pat", t0())).unwrap();
        oauth.store(&TokenRecord::new("access", t0())).unwrap();

        assert_eq!(personal.load().unwrap().unwrap().token, "pat");
        assert_eq!(oauth.load().unwrap().unwrap().token, "access");

        personal.clear().unwrap();
        assert!(personal.load().unwrap().is_none());
        assert_eq!(oauth.load().unwrap().unwrap().token, "access");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.toml");
        let store = FileStore::new(path.clone(), "oauth");
        store.store(&TokenRecord::new("secret", t0())).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.toml");
        fs::write(&path, "").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let store = FileStore::new(path.clone(), "oauth");
        store.store(&TokenRecord::new("secret", t0())).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(store.load().unwrap().unwrap().token, "secret");
    }

    #[test]
    fn test_store_kind_parse() {
        assert_eq!("keyring".parse::<StoreKind>().unwrap(), StoreKind::Keyring);
        assert_eq!(" File ".parse::<StoreKind>().unwrap(), StoreKind::File);
        assert!("vault".parse::<StoreKind>().is_err());
    }
}
