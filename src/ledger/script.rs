//! Commit script construction
//!
//! Diploma mints use a commit-reveal flow: the mint payload is locked into
//! a script whose P2SH-style address the user funds first, and the reveal
//! transaction publishes the payload in a second step. Signing happens in
//! the user's wallet; the core only builds the script envelope.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ledger::payload::{encode, ProofPayload, ProtocolPayload};
use crate::types::Result;

/// A commit script and its derived address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintScript {
    /// Locking script carrying the mint payload (hex)
    pub script_hex: String,
    /// P2SH-style address the wallet must fund to commit
    pub commit_address: String,
    /// The payload envelope the reveal transaction will publish
    pub mint_payload: String,
}

/// Builds commit scripts for mint payloads
pub trait ScriptBuilder: Send + Sync {
    /// Build the commit script for one diploma token
    fn build_mint_commit(
        &self,
        certificate_id: &str,
        course_id: &str,
        recipient: &str,
        token_id: u64,
    ) -> Result<MintScript>;
}

/// Script builder deriving P2SH-style commit addresses by hashing the
/// locking script, prefixed with the configured network tag
pub struct P2shScriptBuilder {
    network_prefix: String,
}

impl P2shScriptBuilder {
    pub fn new(network_prefix: impl Into<String>) -> Self {
        Self {
            network_prefix: network_prefix.into(),
        }
    }
}

impl ScriptBuilder for P2shScriptBuilder {
    fn build_mint_commit(
        &self,
        certificate_id: &str,
        course_id: &str,
        recipient: &str,
        token_id: u64,
    ) -> Result<MintScript> {
        let mint_payload = encode(&ProtocolPayload::Proof(ProofPayload {
            certificate_id: certificate_id.to_string(),
            course_id: course_id.to_string(),
            recipient: recipient.to_string(),
            token_id: Some(token_id),
            timestamp: chrono::Utc::now().timestamp(),
        }));

        // Envelope push: payload length prefix + payload bytes
        let payload_bytes = mint_payload.as_bytes();
        let mut script = Vec::with_capacity(payload_bytes.len() + 4);
        script.extend_from_slice(&(payload_bytes.len() as u32).to_le_bytes());
        script.extend_from_slice(payload_bytes);
        let script_hex = hex::encode(&script);

        let mut hasher = Sha256::new();
        hasher.update(&script);
        let script_hash = hasher.finalize();
        let commit_address = format!("{}:{}", self.network_prefix, hex::encode(script_hash));

        Ok(MintScript {
            script_hex,
            commit_address,
            mint_payload,
        })
    }
}
