//! At-rest obfuscation for stored upstream credentials.
//!
//! Values are XORed with a SHA-256 keystream derived from the configured
//! application secret and a per-value nonce, then hex encoded with a marker
//! prefix. This keeps cleartext out of the store and out of backups; it is
//! not a substitute for protecting the application secret itself.

use sha2::{Digest, Sha256};

const MARKER: &str = "enc1:";

#[derive(Clone)]
pub struct CredentialVault {
    key: [u8; 32],
}

impl CredentialVault {
    pub fn new(app_secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"tvarr-credential-vault");
        hasher.update(app_secret.as_bytes());
        Self {
            key: hasher.finalize().into(),
        }
    }

    pub fn seal(&self, cleartext: &str) -> String {
        let nonce: [u8; 8] = rand::random();
        let mut data = cleartext.as_bytes().to_vec();
        self.apply_keystream(&nonce, &mut data);
        format!("{MARKER}{}{}", hex::encode(nonce), hex::encode(data))
    }

    /// Open a sealed value. Unsealed values pass through untouched so rows
    /// written before obfuscation was enabled keep working.
    pub fn open(&self, stored: &str) -> Result<String, String> {
        let Some(payload) = stored.strip_prefix(MARKER) else {
            return Ok(stored.to_string());
        };
        if payload.len() < 16 {
            return Err("sealed credential too short".to_string());
        }
        let (nonce_hex, data_hex) = payload.split_at(16);
        let nonce: [u8; 8] = hex::decode(nonce_hex)
            .map_err(|e| format!("bad nonce encoding: {e}"))?
            .try_into()
            .map_err(|_| "bad nonce length".to_string())?;
        let mut data = hex::decode(data_hex).map_err(|e| format!("bad data encoding: {e}"))?;
        self.apply_keystream(&nonce, &mut data);
        String::from_utf8(data).map_err(|_| "sealed credential is not UTF-8".to_string())
    }

    fn apply_keystream(&self, nonce: &[u8; 8], data: &mut [u8]) {
        let mut counter: u64 = 0;
        let mut offset = 0;
        while offset < data.len() {
            let mut hasher = Sha256::new();
            hasher.update(self.key);
            hasher.update(nonce);
            hasher.update(counter.to_be_bytes());
            let block = hasher.finalize();
            for byte in block.iter() {
                if offset >= data.len() {
                    break;
                }
                data[offset] ^= byte;
                offset += 1;
            }
            counter += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let vault = CredentialVault::new("app-secret");
        let sealed = vault.seal("hunter2");
        assert!(sealed.starts_with(MARKER));
        assert!(!sealed.contains("hunter2"));
        assert_eq!(vault.open(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn distinct_nonces_give_distinct_ciphertexts() {
        let vault = CredentialVault::new("app-secret");
        assert_ne!(vault.seal("same"), vault.seal("same"));
    }

    #[test]
    fn legacy_cleartext_passes_through() {
        let vault = CredentialVault::new("app-secret");
        assert_eq!(vault.open("plain-password").unwrap(), "plain-password");
    }

    #[test]
    fn wrong_key_does_not_round_trip() {
        let sealed = CredentialVault::new("key-a").seal("value");
        let opened = CredentialVault::new("key-b").open(&sealed);
        // Either invalid UTF-8 or garbage; never the original.
        if let Ok(text) = opened {
            assert_ne!(text, "value");
        }
    }
}
