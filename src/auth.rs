//! Authentication callback types and host/client key helpers.

use std::path::Path;
use std::sync::Arc;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{Error, Result};

/// Password callback: accept or reject `(context, password)`.
pub type PasswordHandler = Arc<dyn Fn(&Context, &str) -> bool + Send + Sync>;

/// Extended password callback. An `Err` rejects;
/// [`Error::PermissionDenied`] with `partial_success` set marks a partial
/// authentication success for multi-step policies.
pub type PasswordHandlerExplicit = Arc<dyn Fn(&Context, &str) -> Result<()> + Send + Sync>;

/// Public-key callback. On acceptance the key is recorded in the context
/// and visible to sessions via [`Session::public_key`](crate::Session::public_key).
pub type PublicKeyHandler = Arc<dyn Fn(&Context, &PublicKey) -> bool + Send + Sync>;

/// One step of a keyboard-interactive exchange.
#[derive(Debug, Clone)]
pub enum InteractiveDecision {
    /// Send the client a challenge; each prompt pairs the text with its
    /// echo flag.
    Challenge {
        name: String,
        instruction: String,
        prompts: Vec<(String, bool)>,
    },
    Accept,
    Reject,
}

/// Keyboard-interactive callback, driven once per protocol round: the
/// first call receives `None` (no answers yet) and should normally return
/// a challenge; subsequent calls receive the client's answers in prompt
/// order and either accept, reject, or challenge again.
pub type KeyboardInteractiveHandler =
    Arc<dyn Fn(&Context, &str, Option<Vec<String>>) -> InteractiveDecision + Send + Sync>;

/// Constant-time comparison of two public keys over their wire encoding,
/// to keep key checks timing-safe.
pub fn keys_equal(a: &PublicKey, b: &PublicKey) -> bool {
    let (Ok(a), Ok(b)) = (a.to_bytes(), b.to_bytes()) else {
        return false;
    };
    a.len() == b.len() && bool::from(a.ct_eq(&b))
}

/// Generates an ephemeral Ed25519 host key.
pub fn generate_host_key() -> Result<PrivateKey> {
    Ok(PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?)
}

/// Decodes a host key from PEM/OpenSSH text. Undecodable input is fatal to
/// option application.
pub fn decode_host_key(pem: &str) -> Result<PrivateKey> {
    Ok(russh::keys::decode_secret_key(pem, None)?)
}

/// Loads a host key from `path`, or generates and persists one (mode 0600)
/// when the file does not exist.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        debug!(path = %path.display(), "loading host key");
        return Ok(russh::keys::load_secret_key(path, None)?);
    }
    info!(path = %path.display(), "generating new host key");
    let key = generate_host_key()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::Configuration(format!("encode host key: {e}")))?;
    std::fs::write(path, encoded.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(key)
}

/// Entry parsed from an `authorized_keys` file.
#[derive(Debug, Clone)]
pub struct AuthorizedKeyEntry {
    pub key: PublicKey,
    pub options: Option<String>,
    pub comment: String,
}

/// Parsed `authorized_keys` content, usable from a public-key callback.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    entries: Vec<AuthorizedKeyEntry>,
}

impl AuthorizedKeys {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(AuthorizedKeys::default());
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if is_known_key_type(parts[0]) {
                if let Ok(key) = PublicKey::from_openssh(line) {
                    entries.push(AuthorizedKeyEntry {
                        comment: key.comment().to_string(),
                        key,
                        options: None,
                    });
                }
            } else if parts.len() >= 2 && is_known_key_type(parts[1]) {
                let rest = parts[1..].join(" ");
                if let Ok(key) = PublicKey::from_openssh(&rest) {
                    entries.push(AuthorizedKeyEntry {
                        comment: key.comment().to_string(),
                        key,
                        options: Some(parts[0].to_string()),
                    });
                }
            }
        }
        Ok(AuthorizedKeys { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Finds the entry matching `key`, comparing in constant time per
    /// candidate.
    pub fn find(&self, key: &PublicKey) -> Option<&AuthorizedKeyEntry> {
        self.entries.iter().find(|e| keys_equal(&e.key, key))
    }
}

fn is_known_key_type(s: &str) -> bool {
    s.starts_with("ssh-")
        || s.starts_with("ecdsa-")
        || s.starts_with("sk-ssh-")
        || s.starts_with("sk-ecdsa-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generated_public_key() -> PublicKey {
        generate_host_key().unwrap().public_key().clone()
    }

    #[test]
    fn keys_equal_is_reflexive_and_discriminates() {
        let a = generated_public_key();
        let b = generated_public_key();
        assert!(keys_equal(&a, &a));
        assert!(!keys_equal(&a, &b));
    }

    #[test]
    fn parse_authorized_keys_with_options_and_comments() {
        let key = generate_host_key().unwrap();
        let openssh = key.public_key().to_openssh().unwrap();
        let content = format!(
            "# header comment\n\n{openssh} alice@example\nrestrict,port-forwarding {openssh} bob\nnot a key line\n"
        );
        let keys = AuthorizedKeys::parse(&content).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.find(key.public_key()).is_some());
        assert_eq!(
            keys.entries[1].options.as_deref(),
            Some("restrict,port-forwarding")
        );
    }

    #[test]
    fn find_rejects_unknown_key() {
        let keys = AuthorizedKeys::parse("").unwrap();
        assert!(keys.is_empty());
        assert!(keys.find(&generated_public_key()).is_none());
    }

    #[test]
    fn host_key_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostkey");
        let first = load_or_generate_host_key(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate_host_key(&path).unwrap();
        assert!(keys_equal(first.public_key(), second.public_key()));
    }

    #[test]
    fn decode_host_key_rejects_garbage() {
        assert!(decode_host_key("-----BEGIN GARBAGE-----\nzzzz\n-----END GARBAGE-----").is_err());
    }
}
