//! Device identity: a process-local ECDSA P-256 keypair used to prove control
//! of a device during the gateway connect handshake.
//!
//! The private key never leaves the process; the device id is derived from the
//! public key, so a client cannot claim an id it does not hold the key for.

use std::path::{Path, PathBuf};

use {
    base64::Engine,
    p256::{
        ecdsa::{
            Signature, SigningKey, VerifyingKey,
            signature::{Signer, Verifier},
        },
        pkcs8::{DecodePrivateKey, EncodePrivateKey},
    },
    rand_core::OsRng,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    tracing::info,
};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("bad key encoding: {0}")]
    BadKey(String),

    #[error("bad signature encoding")]
    BadSignature,
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Persisted form ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    #[serde(rename = "deviceId")]
    device_id: String,
    /// Base64 URL-safe SEC1 public key.
    #[serde(rename = "publicKey")]
    public_key: String,
    /// PKCS#8 PEM private key. Never transmitted.
    #[serde(rename = "privateKeyPem")]
    private_key_pem: String,
}

// ── Device identity ─────────────────────────────────────────────────────────

/// A loaded device keypair.
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
}

impl DeviceIdentity {
    /// Load the identity from `path`, creating and persisting a fresh keypair
    /// on first use. The file is written with owner-only permissions.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let stored: StoredIdentity = serde_json::from_str(&raw)?;
            let signing_key = SigningKey::from_pkcs8_pem(&stored.private_key_pem)
                .map_err(|e| Error::BadKey(e.to_string()))?;
            return Ok(Self {
                device_id: derive_device_id(signing_key.verifying_key()),
                signing_key,
            });
        }

        let signing_key = SigningKey::random(&mut OsRng);
        let identity = Self {
            device_id: derive_device_id(signing_key.verifying_key()),
            signing_key,
        };
        identity.persist(path)?;
        info!(device_id = %identity.device_id, path = %path.display(), "created device identity");
        Ok(identity)
    }

    fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pem = self
            .signing_key
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .map_err(|e| Error::BadKey(e.to_string()))?;
        let stored = StoredIdentity {
            device_id: self.device_id.clone(),
            public_key: self.public_key_b64(),
            private_key_pem: pem.to_string(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&stored)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Default identity path under the given data directory.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("identity.json")
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Base64 URL-safe SEC1 public key, as sent in the connect handshake.
    pub fn public_key_b64(&self) -> String {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        B64.encode(point.as_bytes())
    }

    /// Sign a payload, returning a base64 URL-safe fixed-size signature.
    pub fn sign(&self, payload: &str) -> String {
        let signature: Signature = self.signing_key.sign(payload.as_bytes());
        B64.encode(signature.to_bytes())
    }
}

// ── Free functions ──────────────────────────────────────────────────────────

/// Device id = hex SHA-256 of the uncompressed SEC1 public key.
pub fn derive_device_id(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    hex(&Sha256::digest(point.as_bytes()))
}

/// Check that `device_id` is the one derived from `public_key_b64`.
pub fn device_id_matches(device_id: &str, public_key_b64: &str) -> bool {
    decode_public_key(public_key_b64)
        .map(|key| derive_device_id(&key) == device_id)
        .unwrap_or(false)
}

/// Deterministic serialization of the fields covered by the handshake
/// signature. Both sides must build the exact same string.
pub fn build_auth_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at_ms: u64,
    token: Option<&str>,
) -> String {
    format!(
        "v1|{device_id}|{client_id}|{client_mode}|{role}|{}|{signed_at_ms}|{}",
        scopes.join(","),
        token.unwrap_or("")
    )
}

/// Verify `signature_b64` over `payload` with the given public key.
pub fn verify(payload: &str, signature_b64: &str, public_key_b64: &str) -> Result<bool> {
    let key = decode_public_key(public_key_b64)?;
    let sig_bytes = B64.decode(signature_b64).map_err(|_| Error::BadSignature)?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| Error::BadSignature)?;
    Ok(key.verify(payload.as_bytes(), &signature).is_ok())
}

fn decode_public_key(public_key_b64: &str) -> Result<VerifyingKey> {
    let bytes = B64
        .decode(public_key_b64)
        .map_err(|e| Error::BadKey(e.to_string()))?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| Error::BadKey(e.to_string()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn fresh() -> DeviceIdentity {
        let dir = tempfile::tempdir().unwrap();
        DeviceIdentity::load_or_create(&dir.path().join("identity.json")).unwrap()
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let id = fresh();
        let payload = build_auth_payload(
            id.device_id(),
            "cli-1",
            "operator",
            "operator",
            &["operator.admin".into()],
            1_700_000_000_000,
            Some("tok_test_123"),
        );
        let sig = id.sign(&payload);
        assert!(verify(&payload, &sig, &id.public_key_b64()).unwrap());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let id = fresh();
        let payload = build_auth_payload(id.device_id(), "c", "m", "operator", &[], 1, None);
        let sig = id.sign(&payload);
        let tampered = payload.replace("|1|", "|2|");
        assert!(!verify(&tampered, &sig, &id.public_key_b64()).unwrap());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let a = fresh();
        let b = fresh();
        let payload = build_auth_payload(a.device_id(), "c", "m", "operator", &[], 1, None);
        let sig = a.sign(&payload);
        assert!(!verify(&payload, &sig, &b.public_key_b64()).unwrap());
    }

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let first = DeviceIdentity::load_or_create(&path).unwrap();
        let second = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key_b64(), second.public_key_b64());
    }

    #[test]
    fn device_id_derivation_binds_key() {
        let id = fresh();
        assert!(device_id_matches(id.device_id(), &id.public_key_b64()));
        assert!(!device_id_matches("someone-else", &id.public_key_b64()));
    }

    #[test]
    fn garbage_signature_is_an_error_or_false() {
        let id = fresh();
        assert!(matches!(
            verify("p", "!!!not-base64!!!", &id.public_key_b64()),
            Err(Error::BadSignature)
        ));
    }
}
