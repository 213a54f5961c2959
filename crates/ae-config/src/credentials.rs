//! Event bus credential file
//!
//! The bus credential is mounted as `auth.yaml` under a fixed directory and
//! carries `token` and/or `username`/`password`.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory the event bus credential file is mounted into
pub const EVENT_BUS_AUTH_FILE_MOUNT_PATH: &str = "/etc/eventbus/auth";

/// File name of the credential file inside the mount directory
pub const EVENT_BUS_AUTH_FILE_NAME: &str = "auth.yaml";

/// Credential loaded from the mounted auth file
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl std::fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCredential")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AuthCredential {
    /// Path of the credential file inside `mount_dir`
    pub fn file_path(mount_dir: &Path) -> PathBuf {
        mount_dir.join(EVENT_BUS_AUTH_FILE_NAME)
    }

    /// Load the credential file from `mount_dir`
    pub fn load(mount_dir: &Path) -> ConfigResult<Self> {
        let path = Self::file_path(mount_dir);

        if !path.exists() {
            return Err(ConfigError::CredentialFileNotFound { path });
        }

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            source: e,
        })?;

        let credential: AuthCredential =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Yaml {
                path: path.clone(),
                source: e,
            })?;

        debug!(path = %path.display(), "Loaded event bus credential");

        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_token() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("auth.yaml"), "token: s3cr3t\n").unwrap();

        let cred = AuthCredential::load(dir.path()).unwrap();
        assert_eq!(cred.token.as_deref(), Some("s3cr3t"));
        assert!(cred.username.is_none());
    }

    #[test]
    fn test_load_basic() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("auth.yaml"),
            "username: bus\npassword: hunter2\n",
        )
        .unwrap();

        let cred = AuthCredential::load(dir.path()).unwrap();
        assert_eq!(cred.username.as_deref(), Some("bus"));
        assert_eq!(cred.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = AuthCredential::load(dir.path());
        assert!(matches!(
            result,
            Err(ConfigError::CredentialFileNotFound { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cred = AuthCredential {
            token: Some("s3cr3t".to_string()),
            username: None,
            password: Some("hunter2".to_string()),
        };
        let printed = format!("{:?}", cred);
        assert!(!printed.contains("s3cr3t"));
        assert!(!printed.contains("hunter2"));
    }
}
