//! Connect-time authentication: device identity proof plus the optional
//! shared secret.
//!
//! The device signature is rebuilt server-side from the connect fields, so a
//! client cannot sign one thing and claim another. Auth failures leave the
//! socket open; the client may retry the connect request with corrected
//! credentials.

use {
    tether_config::schema::AuthConfig,
    tether_identity::{build_auth_payload, device_id_matches, verify},
    tether_protocol::{CLOCK_SKEW_MS, ConnectParams, ErrorShape, roles, scopes},
};

/// Role and scopes granted to an authenticated connection.
#[derive(Debug)]
pub struct Granted {
    pub role: String,
    pub scopes: Vec<String>,
}

fn full_scopes() -> Vec<String> {
    vec![
        scopes::ADMIN.to_string(),
        scopes::READ.to_string(),
        scopes::WRITE.to_string(),
        scopes::PAIRING.to_string(),
    ]
}

/// Validate a connect request. `Err` carries the wire error; the handshake
/// stays open for another attempt.
pub fn authorize_connect(
    auth: &AuthConfig,
    params: &ConnectParams,
    now_ms: u64,
) -> Result<Granted, ErrorShape> {
    let role = params
        .role
        .clone()
        .unwrap_or_else(|| roles::OPERATOR.to_string());
    let requested_scopes = params.scopes.clone().unwrap_or_default();

    // Device identity proof.
    let device = &params.device;
    if !device_id_matches(&device.id, &device.public_key) {
        return Err(ErrorShape::unauthorized("device id does not match key"));
    }
    let skew = now_ms.abs_diff(device.signed_at);
    if skew > CLOCK_SKEW_MS {
        return Err(ErrorShape::unauthorized("signature timestamp out of window"));
    }
    let token = params.auth.as_ref().and_then(|a| a.token.as_deref());
    let payload = build_auth_payload(
        &device.id,
        &params.client.id,
        &params.client.mode,
        &role,
        &requested_scopes,
        device.signed_at,
        token,
    );
    match verify(&payload, &device.signature, &device.public_key) {
        Ok(true) => {},
        Ok(false) => return Err(ErrorShape::unauthorized("bad device signature")),
        Err(_) => return Err(ErrorShape::unauthorized("malformed device signature")),
    }

    // Shared secret, when configured.
    if auth.required() {
        let password = params.auth.as_ref().and_then(|a| a.password.as_deref());
        let token_ok = matches!((token, auth.token.as_deref()), (Some(t), Some(want)) if t == want);
        let password_ok =
            matches!((password, auth.password.as_deref()), (Some(p), Some(want)) if p == want);
        if !token_ok && !password_ok {
            return Err(ErrorShape::unauthorized("invalid credentials"));
        }
    }

    // Empty requested scopes means full access.
    let granted_scopes = if requested_scopes.is_empty() {
        full_scopes()
    } else {
        requested_scopes
    };

    Ok(Granted {
        role,
        scopes: granted_scopes,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        tether_identity::DeviceIdentity,
        tether_protocol::{ClientInfo, ConnectAuth, DeviceInfo},
    };

    fn signed_params(
        identity: &DeviceIdentity,
        token: Option<&str>,
        signed_at: u64,
    ) -> ConnectParams {
        let payload = build_auth_payload(
            identity.device_id(),
            "cli-1",
            "operator",
            "operator",
            &[],
            signed_at,
            token,
        );
        ConnectParams {
            min_protocol: 1,
            max_protocol: 1,
            client: ClientInfo {
                id: "cli-1".to_string(),
                display_name: None,
                version: "0.3.0".to_string(),
                platform: "linux".to_string(),
                mode: "operator".to_string(),
            },
            caps: None,
            role: Some("operator".to_string()),
            scopes: None,
            device: DeviceInfo {
                id: identity.device_id().to_string(),
                public_key: identity.public_key_b64(),
                signature: identity.sign(&payload),
                signed_at,
            },
            auth: token.map(|t| ConnectAuth {
                token: Some(t.to_string()),
                password: None,
            }),
        }
    }

    fn identity() -> (DeviceIdentity, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let id = DeviceIdentity::load_or_create(&dir.path().join("identity.json")).unwrap();
        (id, dir)
    }

    #[test]
    fn open_auth_accepts_signed_connect() {
        let (id, _dir) = identity();
        let params = signed_params(&id, None, 1_000);
        let granted = authorize_connect(&AuthConfig::default(), &params, 1_000).unwrap();
        assert_eq!(granted.role, "operator");
        assert!(granted.scopes.contains(&"operator.admin".to_string()));
    }

    #[test]
    fn token_auth_accepts_matching_token() {
        let (id, _dir) = identity();
        let auth = AuthConfig {
            token: Some("tok_test_123".to_string()),
            password: None,
        };
        let params = signed_params(&id, Some("tok_test_123"), 1_000);
        assert!(authorize_connect(&auth, &params, 1_000).is_ok());
    }

    #[test]
    fn token_auth_rejects_wrong_token() {
        let (id, _dir) = identity();
        let auth = AuthConfig {
            token: Some("tok_test_123".to_string()),
            password: None,
        };
        let params = signed_params(&id, Some("wrong"), 1_000);
        let err = authorize_connect(&auth, &params, 1_000).unwrap_err();
        assert_eq!(err.code, "UNAUTHORIZED");
    }

    #[test]
    fn token_auth_rejects_missing_token() {
        let (id, _dir) = identity();
        let auth = AuthConfig {
            token: Some("tok_test_123".to_string()),
            password: None,
        };
        let params = signed_params(&id, None, 1_000);
        assert!(authorize_connect(&auth, &params, 1_000).is_err());
    }

    #[test]
    fn mismatched_device_id_is_rejected() {
        let (id, _dir) = identity();
        let mut params = signed_params(&id, None, 1_000);
        params.device.id = "someone-else".to_string();
        let err = authorize_connect(&AuthConfig::default(), &params, 1_000).unwrap_err();
        assert_eq!(err.code, "UNAUTHORIZED");
    }

    #[test]
    fn stale_signature_is_rejected() {
        let (id, _dir) = identity();
        let params = signed_params(&id, None, 1_000);
        let now = 1_000 + CLOCK_SKEW_MS + 1;
        let err = authorize_connect(&AuthConfig::default(), &params, now).unwrap_err();
        assert_eq!(err.code, "UNAUTHORIZED");
    }

    #[test]
    fn tampered_fields_break_signature() {
        let (id, _dir) = identity();
        let mut params = signed_params(&id, None, 1_000);
        // Signature covered mode "operator"; claiming another mode must fail.
        params.client.mode = "node".to_string();
        let err = authorize_connect(&AuthConfig::default(), &params, 1_000).unwrap_err();
        assert_eq!(err.code, "UNAUTHORIZED");
    }
}
