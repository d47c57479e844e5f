//! Secure credential storage using the system keyring.
//!
//! `OAuth2` tokens are stored per provider, API keys per enrichment source,
//! in the platform's native credential storage:
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use keyring::Entry;
use tracing::{debug, warn};

use crate::provider::AccessToken;

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "contactledger";

/// Credential type identifier for provider `OAuth2` tokens.
const OAUTH_TOKEN_CREDENTIAL: &str = "oauth_token";

/// Credential type identifier for enrichment source API keys.
const API_KEY_CREDENTIAL: &str = "api_key";

/// Error type for credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Failed to access keyring.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// Stored token is not valid JSON.
    #[error("Stored token is unreadable: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for credential operations.
pub type CredentialResult<T> = std::result::Result<T, CredentialError>;

/// Generates the keyring entry key for a credential.
fn credential_key(credential_type: &str, name: &str) -> String {
    format!("{SERVICE_NAME}_{credential_type}_{name}")
}

fn read(credential_type: &str, name: &str) -> CredentialResult<Option<String>> {
    let entry = Entry::new(SERVICE_NAME, &credential_key(credential_type, name))?;
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => {
            debug!("No {credential_type} found for {name}");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn write(credential_type: &str, name: &str, secret: &str) -> CredentialResult<()> {
    let entry = Entry::new(SERVICE_NAME, &credential_key(credential_type, name))?;
    entry.set_password(secret)?;
    debug!("Stored {credential_type} for {name}");
    Ok(())
}

fn delete(credential_type: &str, name: &str) -> CredentialResult<()> {
    let entry = Entry::new(SERVICE_NAME, &credential_key(credential_type, name))?;
    match entry.delete_credential() {
        Ok(()) => {
            debug!("Deleted {credential_type} for {name}");
            Ok(())
        }
        Err(keyring::Error::NoEntry) => {
            debug!("No {credential_type} to delete for {name}");
            Ok(())
        }
        Err(e) => {
            warn!("Failed to delete {credential_type} for {name}: {e}");
            Err(e.into())
        }
    }
}

/// Stores a provider's `OAuth2` token, serialized as JSON.
///
/// # Errors
///
/// Returns an error if serialization or the keyring operation fails.
pub fn store_oauth_token(provider: &str, token: &AccessToken) -> CredentialResult<()> {
    let json = serde_json::to_string(token)?;
    write(OAUTH_TOKEN_CREDENTIAL, provider, &json)
}

/// Retrieves a provider's `OAuth2` token.
///
/// # Errors
///
/// Returns an error if the keyring operation or deserialization fails.
pub fn get_oauth_token(provider: &str) -> CredentialResult<Option<AccessToken>> {
    read(OAUTH_TOKEN_CREDENTIAL, provider)?
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(Into::into)
}

/// Deletes a provider's `OAuth2` token. A missing entry is not an error.
///
/// # Errors
///
/// Returns an error if the keyring operation fails.
pub fn delete_oauth_token(provider: &str) -> CredentialResult<()> {
    delete(OAUTH_TOKEN_CREDENTIAL, provider)
}

/// Stores an enrichment source's API key.
///
/// # Errors
///
/// Returns an error if the keyring operation fails.
pub fn store_api_key(source: &str, key: &str) -> CredentialResult<()> {
    write(API_KEY_CREDENTIAL, source, key)
}

/// Retrieves an enrichment source's API key.
///
/// # Errors
///
/// Returns an error if the keyring operation fails.
pub fn get_api_key(source: &str) -> CredentialResult<Option<String>> {
    read(API_KEY_CREDENTIAL, source)
}

/// Deletes an enrichment source's API key. A missing entry is not an error.
///
/// # Errors
///
/// Returns an error if the keyring operation fails.
pub fn delete_api_key(source: &str) -> CredentialResult<()> {
    delete(API_KEY_CREDENTIAL, source)
}
