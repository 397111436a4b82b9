//! Durable registry of node pairing requests and approved nodes.
//!
//! Backed by a single JSON file; tokens are stored only as SHA-256 hashes.
//! The store is the sole owner of pairing state; the gateway and bridge
//! mutate it exclusively through these methods.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    tether_common::unix_now_ms,
    tracing::{info, warn},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pair request not found")]
    RequestNotFound,

    #[error("node not paired")]
    NodeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Records ─────────────────────────────────────────────────────────────────

/// A node asking to pair, awaiting an operator decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub platform: String,
    pub version: String,
    #[serde(rename = "deviceFamily", skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(rename = "modelIdentifier", skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
    #[serde(rename = "requestedAtMs")]
    pub requested_at_ms: u64,
}

/// An approved node. The issued token exists in plaintext only in the
/// approval response; here it is a hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedNode {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub platform: String,
    pub version: String,
    #[serde(rename = "tokenHash")]
    pub token_hash: String,
    /// Deduplicated, sorted capability list captured at approval time.
    pub caps: Vec<String>,
    /// Authoritative command allowlist for `node.invoke`.
    pub commands: Vec<String>,
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
    /// Binaries the node reported discovering on its host.
    #[serde(default)]
    pub bins: Vec<String>,
    #[serde(rename = "approvedAtMs")]
    pub approved_at_ms: u64,
    #[serde(rename = "lastConnectedMs", skip_serializing_if = "Option::is_none")]
    pub last_connected_ms: Option<u64>,
}

impl PairedNode {
    /// Allowlist check: empty or missing commands deny everything.
    pub fn command_allowed(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    pending: HashMap<String, PairingRequest>,
    #[serde(default)]
    paired: HashMap<String, PairedNode>,
}

// ── Store ───────────────────────────────────────────────────────────────────

/// File-backed pairing store. Every mutation persists before returning.
pub struct PairingStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl PairingStore {
    /// Load the store from `path`, starting empty if the file is absent. A
    /// corrupt file is logged and replaced rather than aborting startup.
    pub fn load(path: PathBuf) -> Result<Self> {
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt pairing store, starting empty");
                    StoreState::default()
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Default store path under the given data directory.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("pairing.json")
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, StoreState> {
        // A poisoned lock means a panic mid-mutation; the persisted file is
        // still consistent, so continue with the in-memory state as-is.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn save(&self, state: &StoreState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // ── Pending requests ────────────────────────────────────────────────

    /// Record a pairing request. Returns the stored request and whether it is
    /// newly created: a duplicate request for a nodeId that already has one
    /// pending returns the existing record with `created = false`, so the
    /// caller does not re-broadcast the operator event. `is_repair` bypasses
    /// the one-outstanding-request rule.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_request(
        &self,
        node_id: &str,
        display_name: Option<&str>,
        platform: &str,
        version: &str,
        device_family: Option<&str>,
        model_identifier: Option<&str>,
        caps: &[String],
        commands: &[String],
        permissions: HashMap<String, bool>,
        is_repair: bool,
    ) -> Result<(PairingRequest, bool)> {
        let mut state = self.locked();

        if !is_repair
            && let Some(existing) = state.pending.values().find(|r| r.node_id == node_id)
        {
            return Ok((existing.clone(), false));
        }

        let request = PairingRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            display_name: display_name.map(str::to_string),
            platform: platform.to_string(),
            version: version.to_string(),
            device_family: device_family.map(str::to_string),
            model_identifier: model_identifier.map(str::to_string),
            caps: dedup_sorted(caps),
            commands: dedup_sorted(commands),
            permissions,
            requested_at_ms: unix_now_ms(),
        };
        state
            .pending
            .insert(request.request_id.clone(), request.clone());
        self.save(&state)?;
        info!(node_id, request_id = %request.request_id, "pairing requested");
        Ok((request, true))
    }

    /// Approve a pending request. Issues a token (returned in plaintext
    /// exactly once) and persists the paired record.
    pub fn approve(&self, request_id: &str) -> Result<(PairedNode, String)> {
        let mut state = self.locked();
        let request = state
            .pending
            .remove(request_id)
            .ok_or(Error::RequestNotFound)?;

        let token = uuid::Uuid::new_v4().to_string();
        let node = PairedNode {
            node_id: request.node_id.clone(),
            display_name: request.display_name,
            platform: request.platform,
            version: request.version,
            token_hash: hash_token(&token),
            caps: dedup_sorted(&request.caps),
            commands: dedup_sorted(&request.commands),
            permissions: request.permissions,
            bins: Vec::new(),
            approved_at_ms: unix_now_ms(),
            last_connected_ms: None,
        };
        state.paired.insert(node.node_id.clone(), node.clone());
        self.save(&state)?;
        info!(node_id = %node.node_id, request_id, "pairing approved");
        Ok((node, token))
    }

    /// Deny a pending request, removing it.
    pub fn deny(&self, request_id: &str) -> Result<PairingRequest> {
        let mut state = self.locked();
        let request = state
            .pending
            .remove(request_id)
            .ok_or(Error::RequestNotFound)?;
        self.save(&state)?;
        info!(node_id = %request.node_id, request_id, "pairing denied");
        Ok(request)
    }

    /// The outstanding request for a nodeId, if any.
    pub fn pending_for(&self, node_id: &str) -> Option<PairingRequest> {
        self.locked()
            .pending
            .values()
            .find(|r| r.node_id == node_id)
            .cloned()
    }

    pub fn list_pending(&self) -> Vec<PairingRequest> {
        let mut list: Vec<_> = self.locked().pending.values().cloned().collect();
        list.sort_by(|a, b| a.requested_at_ms.cmp(&b.requested_at_ms));
        list
    }

    // ── Paired nodes ────────────────────────────────────────────────────

    pub fn list_paired(&self) -> Vec<PairedNode> {
        let mut list: Vec<_> = self.locked().paired.values().cloned().collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }

    pub fn get(&self, node_id: &str) -> Option<PairedNode> {
        self.locked().paired.get(node_id).cloned()
    }

    /// Constant-shape token check: hashes the candidate and compares against
    /// the stored hash for that nodeId only.
    pub fn verify_token(&self, node_id: &str, token: &str) -> bool {
        self.locked()
            .paired
            .get(node_id)
            .is_some_and(|n| n.token_hash == hash_token(token))
    }

    /// Refresh metadata on reconnect: last-connected time plus any updated
    /// capability/command lists (deduplicated and sorted).
    pub fn touch_connected(
        &self,
        node_id: &str,
        caps: Option<&[String]>,
        commands: Option<&[String]>,
    ) -> Result<PairedNode> {
        let mut state = self.locked();
        let node = state.paired.get_mut(node_id).ok_or(Error::NodeNotFound)?;
        node.last_connected_ms = Some(unix_now_ms());
        if let Some(caps) = caps {
            node.caps = dedup_sorted(caps);
        }
        if let Some(commands) = commands {
            node.commands = dedup_sorted(commands);
        }
        let updated = node.clone();
        self.save(&state)?;
        Ok(updated)
    }

    /// Record binaries discovered on the node's host.
    pub fn set_bins(&self, node_id: &str, bins: &[String]) -> Result<()> {
        let mut state = self.locked();
        let node = state.paired.get_mut(node_id).ok_or(Error::NodeNotFound)?;
        node.bins = dedup_sorted(bins);
        self.save(&state)?;
        Ok(())
    }

    /// Cosmetic rename of a paired node.
    pub fn rename(&self, node_id: &str, display_name: &str) -> Result<()> {
        let mut state = self.locked();
        let node = state.paired.get_mut(node_id).ok_or(Error::NodeNotFound)?;
        node.display_name = Some(display_name.to_string());
        self.save(&state)?;
        Ok(())
    }

    /// Explicit unpair: removes the node; its token stops verifying.
    pub fn unpair(&self, node_id: &str) -> Result<PairedNode> {
        let mut state = self.locked();
        let node = state.paired.remove(node_id).ok_or(Error::NodeNotFound)?;
        self.save(&state)?;
        info!(node_id, "node unpaired");
        Ok(node)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Deduplicate and sort a list, so repeated identical entries from a flaky
/// node do not pollute the paired record.
fn dedup_sorted(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = items.to_vec();
    out.sort();
    out.dedup();
    out
}
