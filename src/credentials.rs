use anyhow::{anyhow, Context, Result};
use keyring::{Entry, Error as KeyringError};

use crate::config::RemoteEndpoint;

const APP_NAME: &str = "imapmirror";

/// Password storage in the system keyring, keyed by `user@server`.
#[derive(Clone)]
pub struct CredentialManager {
    app_name: String,
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialManager {
    pub fn new() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
        }
    }

    fn service(&self, password_type: &str) -> String {
        format!("{}-{}", self.app_name, password_type)
    }

    /// Store a password securely in the system keyring
    pub fn store_password(&self, account_id: &str, password_type: &str, password: &str) -> Result<()> {
        let entry = Entry::new(&self.service(password_type), account_id).context("Failed to create keyring entry")?;

        entry
            .set_password(password)
            .context("Failed to store password in keyring")?;

        log::debug!("Password stored securely for {} ({})", account_id, password_type);
        Ok(())
    }

    /// Retrieve a password from the system keyring
    pub fn get_password(&self, account_id: &str, password_type: &str) -> Result<Option<String>> {
        let entry = Entry::new(&self.service(password_type), account_id).context("Failed to create keyring entry")?;

        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(anyhow!("Failed to retrieve password: {}", e)),
        }
    }

    /// The IMAP password for an endpoint: the one in the config file if
    /// present, otherwise the keyring entry saved with `set-password`.
    pub fn resolve_password(&self, endpoint: &RemoteEndpoint) -> Result<String> {
        if let Some(password) = endpoint.password.as_ref().filter(|p| !p.is_empty()) {
            return Ok(password.clone());
        }

        let account = endpoint.account_id();
        self.get_password(&account, "imap")?.ok_or_else(|| {
            anyhow!(
                "No password for {}: set one in the config file or run `imapmirror set-password --account {}`",
                account,
                account
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::ImapSecurity;

    #[test]
    fn test_service_name() {
        assert_eq!(CredentialManager::new().service("imap"), "imapmirror-imap");
    }

    #[test]
    fn test_config_password_wins() {
        let endpoint = RemoteEndpoint {
            server: "imap.example.com".to_string(),
            port: 993,
            security: ImapSecurity::SSL,
            user: "me".to_string(),
            password: Some("from-config".to_string()),
            folder: "INBOX".to_string(),
            uidfile: PathBuf::from("imap_uid.txt"),
        };

        let password = CredentialManager::new().resolve_password(&endpoint).unwrap();

        assert_eq!(password, "from-config");
    }
}
