//! On-chain payload verification
//!
//! Before any state transition driven by a claimed on-chain event, the
//! referenced transaction is fetched from the ledger and its payload is
//! checked against what the caller claims it proves. The chain is never
//! trusted by hash alone.

use tracing::{debug, warn};

use crate::ledger::payload::{self, PayloadKind, ProtocolPayload};
use crate::types::{Result, SettlementError};

use super::ReconciliationEngine;

/// What a claimed transaction must bind to
#[derive(Debug, Clone)]
pub struct ExpectedBinding {
    pub participant_a: String,
    pub participant_b: String,
    /// When present, the funding origin must resolve to this address
    pub claimed_sender: Option<String>,
}

impl ReconciliationEngine {
    /// Fetch a transaction and verify its payload against a claim
    ///
    /// Checks, in order: the transaction exists, carries a payload, the
    /// payload decodes as the expected kind, a handshake's embedded
    /// conversation id matches the participant pair, and the funding
    /// origin matches the claimed sender. Under strict mode an
    /// unresolvable funding origin is a failure; otherwise it degrades to
    /// a logged warning.
    pub async fn verify_on_chain(
        &self,
        tx_hash: &str,
        expected_kind: PayloadKind,
        binding: &ExpectedBinding,
    ) -> Result<ProtocolPayload> {
        let tx = self.rpc().get_transaction(tx_hash).await?.ok_or_else(|| {
            warn!(tx_hash = %tx_hash, "Claimed transaction not found on ledger");
            SettlementError::VerificationFailed(format!(
                "transaction {tx_hash} not found on ledger"
            ))
        })?;

        // A mempool transaction can still be orphaned; state transitions
        // only follow the confirmed set
        if !tx.confirmed {
            warn!(tx_hash = %tx_hash, "Claimed transaction is not yet confirmed");
            return Err(SettlementError::VerificationFailed(format!(
                "transaction {tx_hash} is not yet confirmed"
            )));
        }

        let raw = tx.payload.as_deref().ok_or_else(|| {
            warn!(tx_hash = %tx_hash, "Claimed transaction carries no payload");
            SettlementError::VerificationFailed(format!(
                "transaction {tx_hash} carries no protocol payload"
            ))
        })?;

        let decoded = payload::decode(raw).map_err(|e| {
            warn!(tx_hash = %tx_hash, error = %e, "Claimed transaction payload failed to decode");
            SettlementError::VerificationFailed(format!(
                "payload of {tx_hash} failed to decode: {e}"
            ))
        })?;

        if decoded.kind() != expected_kind {
            warn!(
                tx_hash = %tx_hash,
                expected = expected_kind.as_str(),
                actual = decoded.kind().as_str(),
                "Claimed transaction carries the wrong payload kind"
            );
            return Err(SettlementError::VerificationFailed(format!(
                "expected {} payload in {tx_hash}, found {}",
                expected_kind.as_str(),
                decoded.kind().as_str()
            )));
        }

        // Replay binding: a handshake lifted from another participant
        // pair decodes fine but embeds the wrong conversation id
        if let ProtocolPayload::Handshake(ref handshake) = decoded {
            let expected_id =
                payload::derive_conversation_id(&binding.participant_a, &binding.participant_b);
            if handshake.conversation_id != expected_id {
                warn!(
                    tx_hash = %tx_hash,
                    expected = %expected_id,
                    embedded = %handshake.conversation_id,
                    "Handshake conversation id does not bind to the participant pair"
                );
                return Err(SettlementError::VerificationFailed(format!(
                    "handshake in {tx_hash} is bound to a different participant pair"
                )));
            }
        }

        self.check_funding_origin(tx_hash, tx.funding_address.as_deref(), binding, &decoded)?;

        debug!(
            tx_hash = %tx_hash,
            kind = decoded.kind().as_str(),
            "On-chain payload verified"
        );
        Ok(decoded)
    }

    fn check_funding_origin(
        &self,
        tx_hash: &str,
        funding_address: Option<&str>,
        binding: &ExpectedBinding,
        decoded: &ProtocolPayload,
    ) -> Result<()> {
        let claimed = binding.claimed_sender.as_deref().or_else(|| match decoded {
            ProtocolPayload::Handshake(h) => Some(h.sender.as_str()),
            ProtocolPayload::Response(r) => Some(r.sender.as_str()),
            ProtocolPayload::Post(p) => Some(p.author.as_str()),
            ProtocolPayload::Proof(_) => None,
        });

        let Some(claimed) = claimed else {
            return Ok(());
        };

        match funding_address {
            Some(origin) => {
                // A relay funding the transaction on the sender's behalf
                // is the normal sponsored-fee path
                if origin != claimed
                    && !self
                        .config()
                        .relay_addresses
                        .iter()
                        .any(|relay| relay == origin)
                {
                    warn!(
                        tx_hash = %tx_hash,
                        origin = %origin,
                        claimed = %claimed,
                        "Funding origin does not match claimed sender"
                    );
                    return Err(SettlementError::VerificationFailed(format!(
                        "funding origin of {tx_hash} does not match claimed sender {claimed}"
                    )));
                }
                Ok(())
            }
            None if self.config().strict_sender_check => {
                Err(SettlementError::VerificationFailed(format!(
                    "funding origin of {tx_hash} could not be resolved"
                )))
            }
            None => {
                warn!(
                    tx_hash = %tx_hash,
                    claimed = %claimed,
                    "Funding origin unresolved, accepting payload on embedded sender alone"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryConversationStore;
    use crate::ledger::payload::{derive_conversation_id, encode, HandshakePayload};
    use crate::ledger::rpc::LedgerTransaction;
    use crate::reconcile::test_support::{StubIndexer, StubRpc};
    use crate::reconcile::ReconcileConfig;
    use std::sync::Arc;

    fn engine(rpc: Arc<StubRpc>, config: ReconcileConfig) -> ReconciliationEngine {
        ReconciliationEngine::new(
            Arc::new(StubIndexer::default()),
            rpc,
            Arc::new(MemoryConversationStore::new()),
            config,
        )
    }

    fn handshake_tx(
        hash: &str,
        sender: &str,
        recipient: &str,
        funding: Option<&str>,
    ) -> LedgerTransaction {
        let payload = ProtocolPayload::Handshake(HandshakePayload {
            conversation_id: derive_conversation_id(sender, recipient),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            alias_key: None,
            timestamp: 1_700_000_000,
        });
        LedgerTransaction {
            hash: hash.to_string(),
            payload: Some(encode(&payload).into_bytes()),
            funding_address: funding.map(|f| f.to_string()),
            confirmed: true,
        }
    }

    fn binding(a: &str, b: &str) -> ExpectedBinding {
        ExpectedBinding {
            participant_a: a.to_string(),
            participant_b: b.to_string(),
            claimed_sender: None,
        }
    }

    #[tokio::test]
    async fn test_verifies_valid_handshake() {
        let rpc = Arc::new(StubRpc::default());
        rpc.put(handshake_tx("tx1", "laurel:alice", "laurel:bob", Some("laurel:alice")));
        let engine = engine(rpc, ReconcileConfig::default());

        let decoded = engine
            .verify_on_chain("tx1", PayloadKind::Handshake, &binding("laurel:alice", "laurel:bob"))
            .await
            .unwrap();
        assert_eq!(decoded.kind(), PayloadKind::Handshake);
    }

    #[tokio::test]
    async fn test_rejects_missing_transaction() {
        let engine = engine(Arc::new(StubRpc::default()), ReconcileConfig::default());
        let err = engine
            .verify_on_chain("nope", PayloadKind::Handshake, &binding("laurel:alice", "laurel:bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::VerificationFailed(_)));
    }

    #[tokio::test]
    async fn test_rejects_unconfirmed_transaction() {
        let rpc = Arc::new(StubRpc::default());
        let mut tx = handshake_tx("tx1", "laurel:alice", "laurel:bob", Some("laurel:alice"));
        tx.confirmed = false;
        rpc.put(tx);
        let engine = engine(rpc, ReconcileConfig::default());

        let err = engine
            .verify_on_chain("tx1", PayloadKind::Handshake, &binding("laurel:alice", "laurel:bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::VerificationFailed(_)));
    }

    #[tokio::test]
    async fn test_rejects_replayed_handshake() {
        // A real handshake between alice and carol, claimed for the
        // alice/bob conversation
        let rpc = Arc::new(StubRpc::default());
        rpc.put(handshake_tx("tx1", "laurel:alice", "laurel:carol", Some("laurel:alice")));
        let engine = engine(rpc, ReconcileConfig::default());

        let err = engine
            .verify_on_chain("tx1", PayloadKind::Handshake, &binding("laurel:alice", "laurel:bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::VerificationFailed(_)));
    }

    #[tokio::test]
    async fn test_rejects_wrong_kind() {
        let rpc = Arc::new(StubRpc::default());
        rpc.put(handshake_tx("tx1", "laurel:alice", "laurel:bob", Some("laurel:alice")));
        let engine = engine(rpc, ReconcileConfig::default());

        let err = engine
            .verify_on_chain("tx1", PayloadKind::Proof, &binding("laurel:alice", "laurel:bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::VerificationFailed(_)));
    }

    #[tokio::test]
    async fn test_rejects_foreign_funding_origin() {
        let rpc = Arc::new(StubRpc::default());
        rpc.put(handshake_tx("tx1", "laurel:alice", "laurel:bob", Some("laurel:mallory")));
        let engine = engine(rpc, ReconcileConfig::default());

        let err = engine
            .verify_on_chain("tx1", PayloadKind::Handshake, &binding("laurel:alice", "laurel:bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::VerificationFailed(_)));
    }

    #[tokio::test]
    async fn test_accepts_relay_funding_origin() {
        let rpc = Arc::new(StubRpc::default());
        rpc.put(handshake_tx("tx1", "laurel:alice", "laurel:bob", Some("laurel:treasury")));
        let config = ReconcileConfig {
            relay_addresses: vec!["laurel:treasury".to_string()],
            ..ReconcileConfig::default()
        };
        let engine = engine(rpc, config);

        assert!(engine
            .verify_on_chain("tx1", PayloadKind::Handshake, &binding("laurel:alice", "laurel:bob"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unresolved_origin_strictness() {
        let rpc = Arc::new(StubRpc::default());
        rpc.put(handshake_tx("tx1", "laurel:alice", "laurel:bob", None));

        let lenient = engine(Arc::clone(&rpc), ReconcileConfig::default());
        assert!(lenient
            .verify_on_chain("tx1", PayloadKind::Handshake, &binding("laurel:alice", "laurel:bob"))
            .await
            .is_ok());

        let strict = engine(
            rpc,
            ReconcileConfig {
                strict_sender_check: true,
                ..ReconcileConfig::default()
            },
        );
        assert!(strict
            .verify_on_chain("tx1", PayloadKind::Handshake, &binding("laurel:alice", "laurel:bob"))
            .await
            .is_err());
    }
}
