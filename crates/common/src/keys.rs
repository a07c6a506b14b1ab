//! Key provisioning for installer users

use std::path::PathBuf;

use tracing::debug;

use crate::crypto::KeyPair;
use crate::types::KeyKind;
use crate::validation;
use crate::Result;

/// Where a user's key material ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedKey {
    pub public_key: String,
    pub public_key_path: PathBuf,
    pub private_key_path: Option<PathBuf>,
}

/// Source of key material for build users
pub trait KeyProvider: Send + Sync {
    /// Store the uploaded public key, or generate a fresh pair when none was given
    fn provision(&self, username: &str, uploaded_key: Option<&str>) -> Result<ProvisionedKey>;
}

/// Writes `<name>.publickey` / `<name>.privatekey` files under a build directory
#[derive(Debug, Clone)]
pub struct DirectoryKeyProvider {
    root: PathBuf,
}

impl DirectoryKeyProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, kind: KeyKind, username: &str) -> PathBuf {
        self.root
            .join(kind.directory())
            .join(format!("{}.{}", username, kind.extension()))
    }

    fn write_key(&self, kind: KeyKind, username: &str, contents: &str) -> Result<PathBuf> {
        let path = self.key_path(kind, username);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

impl KeyProvider for DirectoryKeyProvider {
    fn provision(&self, username: &str, uploaded_key: Option<&str>) -> Result<ProvisionedKey> {
        validation::validate_username(username)?;

        match uploaded_key {
            Some(key) => {
                validation::validate_public_key(key)?;
                let public_key_path = self.write_key(KeyKind::Public, username, key)?;
                debug!(username, "stored uploaded public key");
                Ok(ProvisionedKey {
                    public_key: key.to_string(),
                    public_key_path,
                    private_key_path: None,
                })
            }
            None => {
                let kp = KeyPair::generate();
                let public_key = kp.public_key_hex();
                let public_key_path = self.write_key(KeyKind::Public, username, &public_key)?;
                let private_key_path =
                    self.write_key(KeyKind::Private, username, &kp.private_key_hex())?;
                debug!(username, "generated key pair");
                Ok(ProvisionedKey {
                    public_key,
                    public_key_path,
                    private_key_path: Some(private_key_path),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_pair_when_no_upload() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DirectoryKeyProvider::new(dir.path());
        let key = provider.provision("alex", None).unwrap();

        assert_eq!(key.public_key.len(), 64);
        assert_eq!(
            key.public_key_path,
            dir.path().join("public_keys").join("alex.publickey")
        );
        assert_eq!(
            std::fs::read_to_string(&key.public_key_path).unwrap(),
            key.public_key
        );
        let private = key.private_key_path.unwrap();
        assert!(private.ends_with("private_keys/alex.privatekey"));
        assert_eq!(std::fs::read_to_string(private).unwrap().len(), 64);
    }

    #[test]
    fn test_stores_uploaded_key_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DirectoryKeyProvider::new(dir.path());
        let uploaded = KeyPair::generate().public_key_hex();

        let key = provider.provision("bill", Some(&uploaded)).unwrap();
        assert_eq!(key.public_key, uploaded);
        assert!(key.private_key_path.is_none());
        assert_eq!(std::fs::read_to_string(&key.public_key_path).unwrap(), uploaded);
        assert!(!dir.path().join("private_keys").join("bill.privatekey").exists());
    }

    #[test]
    fn test_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DirectoryKeyProvider::new(dir.path());
        assert!(provider.provision("../etc", None).is_err());
        assert!(provider.provision("carol", Some("garbage")).is_err());
    }
}
