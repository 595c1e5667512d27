//! GitHub token management
//!
//! Tokens are looked up in order: the `GITHUB_TOKEN` environment variable,
//! then the configured token store (the OS keyring by default, or a token
//! file). The interactive prompt is only used by the CLI when `--auth` is
//! passed and nothing else turned up. Tokens are checked against GitHub
//! before they are stored.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dialoguer::{Confirm, Password};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AuthConfig, TokenStorage};
use crate::error::AuthError;

/// Environment variable checked first
pub const TOKEN_ENV_VAR: &str = "GITHUB_TOKEN";
/// Keyring service name
pub const KEYRING_SERVICE: &str = "star-watcher";
/// Keyring account name
pub const KEYRING_USER: &str = "github-token";

/// Where a credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Environment,
    Keyring,
    Stored,
    Prompt,
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::Environment => write!(f, "{} environment variable", TOKEN_ENV_VAR),
            TokenSource::Keyring => write!(f, "system keyring"),
            TokenSource::Stored => write!(f, "token file"),
            TokenSource::Prompt => write!(f, "interactive prompt"),
        }
    }
}

/// An access token plus where it came from
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub source: TokenSource,
}

impl Credential {
    pub fn new(token: impl Into<String>, source: TokenSource) -> Self {
        Self {
            token: token.into(),
            source,
        }
    }

    pub fn masked(&self) -> String {
        mask_token(&self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.masked())
            .field("source", &self.source)
            .finish()
    }
}

/// `ghp_...wxyz` style display form; short tokens are hidden entirely.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Supplies an optional credential to the monitor.
pub trait CredentialProvider: Send + Sync {
    /// `AuthError::TokenNotFound` means "run unauthenticated".
    fn get_credential(&self) -> Result<Credential, AuthError>;
}

/// A credential resolved ahead of time, e.g. from the prompt.
#[derive(Debug, Clone)]
pub struct StaticCredential(pub Credential);

impl CredentialProvider for StaticCredential {
    fn get_credential(&self) -> Result<Credential, AuthError> {
        Ok(self.0.clone())
    }
}

/// Checks a token with the API before it is kept.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Login of the account the token belongs to.
    async fn validate_token(&self, token: &str) -> Result<String, AuthError>;
}

/// Persistent home of the stored token
pub trait TokenStore: fmt::Debug + Send + Sync {
    /// `Ok(None)` when nothing is stored.
    fn load(&self) -> Result<Option<String>, AuthError>;
    fn save(&self, token: &str) -> Result<(), AuthError>;
    /// Returns whether there was a token to delete.
    fn delete(&self) -> Result<bool, AuthError>;
    fn source(&self) -> TokenSource;
    /// Human readable location for messages
    fn location(&self) -> String;
}

/// Token kept by the platform credential store
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
    user: String,
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE, KEYRING_USER)
    }
}

impl KeyringStore {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, AuthError> {
        Ok(keyring::Entry::new(&self.service, &self.user)?)
    }
}

impl TokenStore for KeyringStore {
    fn load(&self) -> Result<Option<String>, AuthError> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, token: &str) -> Result<(), AuthError> {
        self.entry()?.set_password(token)?;
        debug!("Stored token in keyring service {}", self.service);
        Ok(())
    }

    fn delete(&self) -> Result<bool, AuthError> {
        match self.entry()?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn source(&self) -> TokenSource {
        TokenSource::Keyring
    }

    fn location(&self) -> String {
        format!("system keyring ({})", self.service)
    }
}

/// On-disk token format
#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    stored_at: DateTime<Utc>,
}

/// Token kept in a JSON file readable only by the owner
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileStore {
    fn load(&self) -> Result<Option<String>, AuthError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)?;
        let stored: StoredToken = serde_json::from_str(&content)?;
        Ok(Some(stored.token))
    }

    fn save(&self, token: &str) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let stored = StoredToken {
            token: token.to_string(),
            stored_at: Utc::now(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&stored)?)?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        debug!("Stored token at {}", self.path.display());
        Ok(())
    }

    fn delete(&self) -> Result<bool, AuthError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn source(&self) -> TokenSource {
        TokenSource::Stored
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Looks up and stores GitHub tokens
#[derive(Debug, Clone)]
pub struct TokenManager {
    env_var: Option<String>,
    store: Arc<dyn TokenStore>,
}

impl TokenManager {
    pub fn new(config: &AuthConfig) -> Self {
        let store: Arc<dyn TokenStore> = match config.storage {
            TokenStorage::Keyring => Arc::new(KeyringStore::default()),
            TokenStorage::File => Arc::new(FileStore::new(config.token_path.clone())),
        };
        Self {
            env_var: config.allow_env_token.then(|| TOKEN_ENV_VAR.to_string()),
            store,
        }
    }

    /// Read the token from `name` instead of `GITHUB_TOKEN`.
    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = Some(name.into());
        self
    }

    pub fn with_store(mut self, store: impl TokenStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// Where stored tokens go, for messages
    pub fn location(&self) -> String {
        self.store.location()
    }

    fn load_stored_token(&self) -> Result<Credential, AuthError> {
        let token = self.store.load()?.ok_or(AuthError::TokenNotFound)?;
        if token.trim().is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(Credential::new(token.trim(), self.store.source()))
    }

    /// Store token for later use without checking it
    pub fn store_token(&self, token: &str) -> Result<(), AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        self.store.save(token)
    }

    /// Check `token` with `validator`, then store it. Returns the login the
    /// token belongs to. Nothing is stored when the check fails.
    pub async fn store_validated(
        &self,
        token: &str,
        validator: &dyn TokenValidator,
    ) -> Result<String, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }

        let login = validator.validate_token(token).await?;
        self.store_token(token)?;
        debug!("Stored token for {} in {}", login, self.location());
        Ok(login)
    }

    /// Delete the stored token. Returns whether there was one.
    pub fn remove_token(&self) -> Result<bool, AuthError> {
        self.store.delete()
    }
}

impl CredentialProvider for TokenManager {
    fn get_credential(&self) -> Result<Credential, AuthError> {
        if let Some(ref name) = self.env_var {
            if let Ok(token) = std::env::var(name) {
                if !token.trim().is_empty() {
                    debug!("Using token from {} environment variable", name);
                    return Ok(Credential::new(token.trim(), TokenSource::Environment));
                }
            }
        }

        match self.load_stored_token() {
            Ok(credential) => {
                debug!("Using token from {}", credential.source);
                Ok(credential)
            }
            Err(AuthError::TokenNotFound) => Err(AuthError::TokenNotFound),
            Err(e) => {
                warn!("Ignoring unreadable token in {}: {}", self.location(), e);
                Err(AuthError::TokenNotFound)
            }
        }
    }
}

/// Ask for a token on the terminal and offer to store it.
pub async fn prompt_for_token(
    manager: &TokenManager,
    validator: &dyn TokenValidator,
) -> Result<Credential, AuthError> {
    let token: String = Password::new()
        .with_prompt("GitHub personal access token")
        .interact()
        .map_err(|e| AuthError::Prompt(e.to_string()))?;

    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(AuthError::EmptyToken);
    }

    let store = Confirm::new()
        .with_prompt(format!("Store token in {} for future runs?", manager.location()))
        .default(true)
        .interact()
        .map_err(|e| AuthError::Prompt(e.to_string()))?;

    if store {
        manager.store_validated(&token, validator).await?;
    }

    Ok(Credential::new(token, TokenSource::Prompt))
}
