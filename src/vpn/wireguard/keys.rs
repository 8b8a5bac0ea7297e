//! WireGuard key pair handling

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use tracing::{debug, info};

use crate::error::VpnctlResult;
use crate::metrics::KeyPairSource;
use crate::process::{ProcessLauncher, ProcessSpec};
use crate::validation::{self, WIREGUARD_KEY_LEN};

/// Generate a clamped Curve25519 private key, base64 encoded
pub fn generate_private_key() -> String {
    let mut key = [0u8; WIREGUARD_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    STANDARD.encode(key)
}

/// Derive the public key by piping the private key into `wg pubkey`
pub async fn derive_public_key(launcher: &dyn ProcessLauncher, wg: &Path, private_key: &str) -> VpnctlResult<String> {
    let spec = ProcessSpec::new(wg)
        .arg("pubkey")
        .stdin(format!("{}\n", private_key));
    let output = launcher.run(spec).await?.check("wg pubkey")?;

    let public_key = output.stdout.trim().to_string();
    validation::validate_wireguard_key(&public_key)?;
    Ok(public_key)
}

/// Key pair of a profile
#[derive(Debug, Clone)]
pub struct KeyPair {
    private_key: Option<String>,
    public_key: Option<String>,
    /// Private key the current public key was derived from
    derived_from: Option<String>,
    source: KeyPairSource,
}

impl KeyPair {
    pub fn new(private_key: Option<String>, public_key: Option<String>) -> Self {
        let private_key = private_key.filter(|k| !k.is_empty());
        // A stored public key belongs to the stored private key
        let derived_from = public_key.as_ref().and(private_key.clone());
        Self {
            private_key,
            public_key,
            derived_from,
            source: KeyPairSource::UserInput,
        }
    }

    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    pub fn source(&self) -> KeyPairSource {
        self.source
    }

    /// Replace the private key, e.g. from user input
    pub fn set_private_key(&mut self, key: String) -> VpnctlResult<()> {
        validation::validate_wireguard_key(&key)?;
        self.private_key = Some(key);
        self.source = KeyPairSource::UserInput;
        Ok(())
    }

    /// Make sure both keys exist; returns whether anything changed
    pub async fn save(&mut self, launcher: &dyn ProcessLauncher, wg: &Path) -> VpnctlResult<bool> {
        let mut changed = false;

        let private_key = match &self.private_key {
            Some(key) => key.clone(),
            None => {
                info!("Generating WireGuard private key");
                let key = generate_private_key();
                self.private_key = Some(key.clone());
                self.source = KeyPairSource::Generated;
                changed = true;
                key
            }
        };

        if self.derived_from.as_deref() == Some(private_key.as_str()) {
            debug!("WireGuard public key is current");
            return Ok(changed);
        }

        self.public_key = Some(derive_public_key(launcher, wg, &private_key).await?);
        self.derived_from = Some(private_key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_is_clamped() {
        let key = generate_private_key();
        validation::validate_wireguard_key(&key).unwrap();

        let raw = STANDARD.decode(&key).unwrap();
        assert_eq!(raw[0] & 7, 0);
        assert_eq!(raw[31] & 128, 0);
        assert_eq!(raw[31] & 64, 64);
        assert_ne!(generate_private_key(), key);
    }

    #[test]
    fn test_stored_pair_is_current() {
        let pair = KeyPair::new(Some("priv".to_string()), Some("pub".to_string()));
        assert_eq!(pair.derived_from.as_deref(), Some("priv"));
        assert_eq!(pair.source(), KeyPairSource::UserInput);

        let pair = KeyPair::new(Some(String::new()), None);
        assert_eq!(pair.private_key(), None);
        assert_eq!(pair.derived_from, None);
    }
}
