//! Secret Box: scoped sealing of device credential blobs
//!
//! Credentials are sealed with AES-256-GCM under a key file living in the
//! scope-selected application folder. Service-mode deployments use the
//! machine scope, interactive ones the user scope; the startup rekey pass
//! moves stored blobs between the two so a deployment-mode switch does not
//! strand credentials.

use crate::catalog::CatalogStore;
use crate::errors::{AppError, AppResult};
use log::{info, warn};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use std::path::{Path, PathBuf};

/// Which key file seals credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretScope {
    User,
    Machine,
}

impl SecretScope {
    /// Chosen by the deployment flag; the service wrapper sets machine scope
    pub fn from_env() -> Self {
        match std::env::var("AGENT_MACHINE_SCOPE").ok().as_deref() {
            Some("1") | Some("true") | Some("True") => SecretScope::Machine,
            _ => SecretScope::User,
        }
    }

    fn key_file(&self, folder: &Path) -> PathBuf {
        match self {
            SecretScope::User => folder.join("secret.user.key"),
            SecretScope::Machine => folder.join("secret.machine.key"),
        }
    }
}

/// Opaque seal/open capability
pub trait SecretBox: Send + Sync {
    fn seal(&self, plain: &[u8]) -> AppResult<Vec<u8>>;
    fn open(&self, sealed: &[u8]) -> AppResult<Vec<u8>>;
}

/// AES-256-GCM secret box keyed from a scope-local key file
pub struct KeyfileSecretBox {
    key: LessSafeKey,
    rng: SystemRandom,
    scope: SecretScope,
}

impl KeyfileSecretBox {
    /// Load the scope's key file, creating it on first use
    pub fn load_or_create(scope: SecretScope, folder: &Path) -> AppResult<Self> {
        let path = scope.key_file(folder);
        let rng = SystemRandom::new();
        let key_bytes: Vec<u8> = match std::fs::read(&path) {
            Ok(bytes) if bytes.len() == 32 => bytes,
            _ => {
                let mut fresh = vec![0u8; 32];
                rng.fill(&mut fresh)
                    .map_err(|_| AppError::SecretBox {
                        message: "key generation failed".into(),
                    })?;
                std::fs::write(&path, &fresh)?;
                info!("secret key created at {}", path.display());
                fresh
            }
        };
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes).map_err(|_| AppError::SecretBox {
            message: "invalid key material".into(),
        })?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng,
            scope,
        })
    }

    /// Load the scope's key file only if it already exists
    pub fn load_existing(scope: SecretScope, folder: &Path) -> Option<Self> {
        let path = scope.key_file(folder);
        let bytes = std::fs::read(&path).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let unbound = UnboundKey::new(&AES_256_GCM, &bytes).ok()?;
        Some(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
            scope,
        })
    }

    pub fn scope(&self) -> SecretScope {
        self.scope
    }
}

impl SecretBox for KeyfileSecretBox {
    fn seal(&self, plain: &[u8]) -> AppResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| AppError::SecretBox {
            message: "nonce generation failed".into(),
        })?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let mut buf = plain.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .map_err(|_| AppError::SecretBox {
                message: "seal failed".into(),
            })?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&buf);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> AppResult<Vec<u8>> {
        if sealed.len() <= NONCE_LEN {
            return Err(AppError::SecretBox {
                message: "sealed blob too short".into(),
            });
        }
        let nonce = Nonce::try_assume_unique_for_key(&sealed[..NONCE_LEN]).map_err(|_| {
            AppError::SecretBox {
                message: "bad nonce".into(),
            }
        })?;
        let mut buf = sealed[NONCE_LEN..].to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| AppError::SecretBox {
                message: "open failed (wrong scope or corrupt blob)".into(),
            })?;
        Ok(plain.to_vec())
    }
}

/// Startup rekey pass: re-seal every stored credential blob under the
/// current scope. Blobs sealed under the alternate scope are migrated;
/// unreadable blobs are left alone. Best-effort, never fatal.
pub fn rekey_all(
    catalog: &CatalogStore,
    current: &dyn SecretBox,
    alternate: Option<&dyn SecretBox>,
) -> usize {
    let mut changed = 0;
    for device in catalog.list_devices_raw() {
        let Some(sealed) = device.secrets_sealed.as_deref() else {
            continue;
        };
        if current.open(sealed).is_ok() {
            continue;
        }
        let Some(alt) = alternate else { continue };
        match alt.open(sealed) {
            Ok(plain) => match current.seal(&plain) {
                Ok(resealed) => {
                    if let Err(e) = catalog.set_device_secrets(&device.id, resealed) {
                        warn!("rekey persist failed for {}: {}", device.id, e);
                    } else {
                        changed += 1;
                    }
                }
                Err(e) => warn!("rekey seal failed for {}: {}", device.id, e),
            },
            Err(_) => {
                warn!("rekey: secrets for {} unreadable under either scope", device.id);
            }
        }
    }
    if changed > 0 {
        info!("rekey pass resealed {} device secret(s)", changed);
    }
    changed
}
