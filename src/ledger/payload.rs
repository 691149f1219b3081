//! On-chain protocol payload envelope
//!
//! Every payload the core writes to or reads from the ledger is wrapped in
//! a tagged envelope: `laurel:1:<kind>:<json>`. Decoding is strict: an
//! unknown tag, version, or malformed body yields a typed error, never a
//! partially-populated value.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Envelope prefix for all protocol payloads
pub const PROTOCOL_PREFIX: &str = "laurel";

/// Current envelope version
pub const PROTOCOL_VERSION: u8 = 1;

/// Payload decode failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload does not carry the protocol prefix")]
    MissingPrefix,

    #[error("unsupported payload version: {0}")]
    UnsupportedVersion(String),

    #[error("unknown payload kind: {0}")]
    UnknownKind(String),

    #[error("malformed payload body: {0}")]
    Malformed(String),
}

/// Discriminant for the payload kinds the core understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Conversation handshake (initiates a conversation)
    Handshake,
    /// Handshake response (accept/decline)
    Response,
    /// Forum post broadcast within a conversation
    Post,
    /// Course completion proof backing a diploma mint
    Proof,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Handshake => "handshake",
            PayloadKind::Response => "response",
            PayloadKind::Post => "post",
            PayloadKind::Proof => "proof",
        }
    }
}

/// Conversation handshake payload
///
/// The embedded `conversation_id` must equal the value derived from both
/// participant addresses; this binding is what defeats naive replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakePayload {
    pub conversation_id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_key: Option<String>,
    pub timestamp: i64,
}

/// Handshake response payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponsePayload {
    pub conversation_id: String,
    pub sender: String,
    pub accepted: bool,
    pub timestamp: i64,
}

/// Forum post payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostPayload {
    pub conversation_id: String,
    pub author: String,
    pub content: String,
    pub timestamp: i64,
}

/// Course completion proof payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofPayload {
    pub certificate_id: String,
    pub course_id: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u64>,
    pub timestamp: i64,
}

/// A decoded protocol payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolPayload {
    Handshake(HandshakePayload),
    Response(ResponsePayload),
    Post(PostPayload),
    Proof(ProofPayload),
}

impl ProtocolPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            ProtocolPayload::Handshake(_) => PayloadKind::Handshake,
            ProtocolPayload::Response(_) => PayloadKind::Response,
            ProtocolPayload::Post(_) => PayloadKind::Post,
            ProtocolPayload::Proof(_) => PayloadKind::Proof,
        }
    }
}

/// Encode a payload into its on-chain envelope
pub fn encode(payload: &ProtocolPayload) -> String {
    let (kind, body) = match payload {
        ProtocolPayload::Handshake(p) => (PayloadKind::Handshake, serde_json::to_string(p)),
        ProtocolPayload::Response(p) => (PayloadKind::Response, serde_json::to_string(p)),
        ProtocolPayload::Post(p) => (PayloadKind::Post, serde_json::to_string(p)),
        ProtocolPayload::Proof(p) => (PayloadKind::Proof, serde_json::to_string(p)),
    };
    // Serialization of these structs cannot fail; fall back to "{}" anyway
    let body = body.unwrap_or_else(|_| "{}".to_string());
    format!(
        "{}:{}:{}:{}",
        PROTOCOL_PREFIX,
        PROTOCOL_VERSION,
        kind.as_str(),
        body
    )
}

/// Decode raw on-chain bytes into a typed payload
pub fn decode(raw: &[u8]) -> std::result::Result<ProtocolPayload, PayloadError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| PayloadError::Malformed(format!("not valid utf-8: {e}")))?;

    let rest = text
        .strip_prefix(PROTOCOL_PREFIX)
        .and_then(|t| t.strip_prefix(':'))
        .ok_or(PayloadError::MissingPrefix)?;

    let (version, rest) = rest
        .split_once(':')
        .ok_or_else(|| PayloadError::Malformed("missing version separator".into()))?;
    if version != PROTOCOL_VERSION.to_string() {
        return Err(PayloadError::UnsupportedVersion(version.to_string()));
    }

    let (kind, body) = rest
        .split_once(':')
        .ok_or_else(|| PayloadError::Malformed("missing kind separator".into()))?;

    let malformed = |e: serde_json::Error| PayloadError::Malformed(e.to_string());
    match kind {
        "handshake" => serde_json::from_str(body)
            .map(ProtocolPayload::Handshake)
            .map_err(malformed),
        "response" => serde_json::from_str(body)
            .map(ProtocolPayload::Response)
            .map_err(malformed),
        "post" => serde_json::from_str(body)
            .map(ProtocolPayload::Post)
            .map_err(malformed),
        "proof" => serde_json::from_str(body)
            .map(ProtocolPayload::Proof)
            .map_err(malformed),
        other => Err(PayloadError::UnknownKind(other.to_string())),
    }
}

/// Derive the deterministic conversation id for a participant pair
///
/// sha256 over the lexicographically sorted addresses, hex encoded.
/// Symmetric in its arguments, and not forgeable without knowing both
/// addresses.
pub fn derive_conversation_id(participant_a: &str, participant_b: &str) -> String {
    let (first, second) = if participant_a <= participant_b {
        (participant_a, participant_b)
    } else {
        (participant_b, participant_a)
    };
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(b"|");
    hasher.update(second.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> ProtocolPayload {
        ProtocolPayload::Handshake(HandshakePayload {
            conversation_id: derive_conversation_id("laurel:alice", "laurel:bob"),
            sender: "laurel:alice".into(),
            recipient: "laurel:bob".into(),
            alias_key: None,
            timestamp: 1_700_000_000,
        })
    }

    #[test]
    fn test_envelope_round_trip() {
        let payload = handshake();
        let encoded = encode(&payload);
        assert!(encoded.starts_with("laurel:1:handshake:"));
        assert_eq!(decode(encoded.as_bytes()).unwrap(), payload);
    }

    #[test]
    fn test_decode_rejects_missing_prefix() {
        assert_eq!(
            decode(b"ciph_msg:1:handshake:{}"),
            Err(PayloadError::MissingPrefix)
        );
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert_eq!(
            decode(b"laurel:1:payout:{}"),
            Err(PayloadError::UnknownKind("payout".into()))
        );
    }

    #[test]
    fn test_decode_rejects_unsupported_version() {
        assert_eq!(
            decode(b"laurel:9:handshake:{}"),
            Err(PayloadError::UnsupportedVersion("9".into()))
        );
    }

    #[test]
    fn test_decode_rejects_partial_body() {
        // Missing required fields must be a typed failure, not a
        // partially-populated payload
        let raw = br#"laurel:1:handshake:{"sender":"laurel:alice"}"#;
        assert!(matches!(decode(raw), Err(PayloadError::Malformed(_))));
    }

    #[test]
    fn test_conversation_id_is_symmetric() {
        let a = derive_conversation_id("laurel:alice", "laurel:bob");
        let b = derive_conversation_id("laurel:bob", "laurel:alice");
        assert_eq!(a, b);
        assert_ne!(a, derive_conversation_id("laurel:alice", "laurel:carol"));
    }
}
