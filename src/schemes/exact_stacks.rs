//! Implementation of the "exact" payment scheme for Stacks networks.
//!
//! The payer signs a transfer of exactly `maxAmountRequired` of the requested
//! asset to `payTo`. The signed transfer travels unbroadcast in the proof; the
//! facilitator checks it and hands it to the ledger.

use crate::errors::{Result, X402Error};
use crate::schemes::{Scheme, VerifiedPayment};
use crate::signer::verify_transfer_signature;
use crate::types::{PaymentProof, PaymentRequirements, UnsignedTransfer, X402_VERSION};
use crate::utils::{current_timestamp, generate_nonce, is_unexpired};

/// Seconds of clock drift tolerated between payer and verifier.
const CLOCK_SKEW_SECONDS: u64 = 60;

/// Implementation of the "exact" scheme for Stacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactStacks;

impl ExactStacks {
    /// Scheme name on the wire.
    pub const NAME: &'static str = "exact";

    /// Creates a new instance of the ExactStacks scheme.
    pub fn new() -> Self {
        Self
    }
}

fn invalid(reason: impl Into<String>) -> X402Error {
    X402Error::ProofInvalid(reason.into())
}

impl Scheme for ExactStacks {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn build_transfer(
        &self,
        requirements: &PaymentRequirements,
        payer: &str,
    ) -> Result<UnsignedTransfer> {
        if requirements.scheme != Self::NAME {
            return Err(X402Error::UnsupportedScheme(requirements.scheme.clone()));
        }
        if !requirements.network.is_stacks() {
            return Err(X402Error::UnsupportedMethod(format!(
                "exact scheme cannot pay on {}",
                requirements.network
            )));
        }
        Ok(UnsignedTransfer {
            network: requirements.network.clone(),
            asset: requirements.asset.clone(),
            from: payer.to_string(),
            to: requirements.pay_to.clone(),
            amount: requirements.max_amount_required,
            nonce: generate_nonce(),
            valid_before: current_timestamp() + requirements.max_timeout_seconds,
            memo: None,
        })
    }

    fn verify(
        &self,
        proof: &PaymentProof,
        requirements: &PaymentRequirements,
    ) -> Result<VerifiedPayment> {
        if proof.x402_version != X402_VERSION {
            return Err(invalid(format!(
                "unsupported x402Version {}",
                proof.x402_version
            )));
        }
        if proof.accepted.scheme != Self::NAME || requirements.scheme != Self::NAME {
            return Err(invalid(format!(
                "scheme mismatch: proof uses '{}'",
                proof.accepted.scheme
            )));
        }
        if proof.accepted.network != requirements.network {
            return Err(invalid(format!(
                "network mismatch: proof targets {}, route expects {}",
                proof.accepted.network, requirements.network
            )));
        }

        let signed = proof.signed_transfer().map_err(|e| invalid(e.to_string()))?;
        let transfer = &signed.transfer;

        if transfer.network != requirements.network {
            return Err(invalid(format!(
                "network mismatch: transfer targets {}, route expects {}",
                transfer.network, requirements.network
            )));
        }
        if transfer.asset != requirements.asset {
            return Err(invalid(format!(
                "asset mismatch: transfer moves {}, route expects {}",
                transfer.asset, requirements.asset
            )));
        }
        if transfer.to != requirements.pay_to {
            return Err(invalid(format!(
                "recipient mismatch: transfer pays {}, route expects {}",
                transfer.to, requirements.pay_to
            )));
        }
        if transfer.amount != requirements.max_amount_required {
            return Err(invalid(format!(
                "amount mismatch: transfer carries {}, route requires exactly {}",
                transfer.amount, requirements.max_amount_required
            )));
        }

        if !is_unexpired(transfer.valid_before) {
            return Err(invalid("transfer has expired"));
        }
        if transfer.valid_before > current_timestamp() + requirements.max_timeout_seconds + CLOCK_SKEW_SECONDS {
            return Err(invalid("transfer validity exceeds maxTimeoutSeconds"));
        }

        verify_transfer_signature(&signed).map_err(|e| invalid(e.to_string()))?;

        Ok(VerifiedPayment {
            payer: transfer.from.clone(),
            transfer: signed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use crate::signer::{LocalKeySigner, PaymentSigner};
    use crate::types::{OutputSchema, SignedTransfer, TokenAmount, EXACT_SCHEME, STX_ASSET};

    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const PAYER: &str = "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1";
    const PAYEE: &str = "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM";

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: EXACT_SCHEME.to_string(),
            network: Network::stacks_testnet(),
            asset: STX_ASSET.to_string(),
            max_amount_required: TokenAmount(10_000),
            resource: "http://localhost:3000/weather".to_string(),
            description: "Weather".to_string(),
            mime_type: "application/json".to_string(),
            pay_to: PAYEE.to_string(),
            max_timeout_seconds: 300,
            output_schema: Some(OutputSchema::http("GET")),
            extra: None,
        }
    }

    async fn sign(transfer: &UnsignedTransfer) -> SignedTransfer {
        LocalKeySigner::from_hex(KEY, PAYER, Network::stacks_testnet())
            .unwrap()
            .sign_transfer(transfer)
            .await
            .unwrap()
    }

    async fn proof_for(transfer: UnsignedTransfer) -> PaymentProof {
        PaymentProof::new(requirements(), &sign(&transfer).await).unwrap()
    }

    #[test]
    fn test_exact_stacks_name() {
        assert_eq!(ExactStacks::new().name(), "exact");
    }

    #[test]
    fn test_build_transfer_matches_requirements() {
        let transfer = ExactStacks::new()
            .build_transfer(&requirements(), PAYER)
            .unwrap();
        assert_eq!(transfer.amount, TokenAmount(10_000));
        assert_eq!(transfer.to, PAYEE);
        assert_eq!(transfer.from, PAYER);
        assert_eq!(transfer.asset, STX_ASSET);
        assert!(transfer.valid_before > current_timestamp());
    }

    #[test]
    fn test_build_transfer_rejects_foreign_namespace() {
        let mut req = requirements();
        req.network = "eip155:8453".parse().unwrap();
        assert!(ExactStacks::new().build_transfer(&req, PAYER).is_err());
    }

    #[tokio::test]
    async fn test_verify_accepts_exact_payment() {
        let scheme = ExactStacks::new();
        let transfer = scheme.build_transfer(&requirements(), PAYER).unwrap();
        let proof = proof_for(transfer).await;

        let verified = scheme.verify(&proof, &requirements()).unwrap();
        assert_eq!(verified.payer, PAYER);
    }

    #[tokio::test]
    async fn test_verify_rejects_any_amount_difference() {
        let scheme = ExactStacks::new();
        for amount in [9_999u128, 10_001, 0] {
            let mut transfer = scheme.build_transfer(&requirements(), PAYER).unwrap();
            transfer.amount = TokenAmount(amount);
            let proof = proof_for(transfer).await;
            let err = scheme.verify(&proof, &requirements()).unwrap_err();
            assert!(err.to_string().contains("amount mismatch"), "{amount}: {err}");
        }
    }

    #[tokio::test]
    async fn test_verify_rejects_network_mismatch() {
        let scheme = ExactStacks::new();
        let transfer = scheme.build_transfer(&requirements(), PAYER).unwrap();
        let mut proof = proof_for(transfer).await;
        proof.accepted.network = Network::stacks_mainnet();

        let err = scheme.verify(&proof, &requirements()).unwrap_err();
        assert!(matches!(err, X402Error::ProofInvalid(ref m) if m.contains("network mismatch")));
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_recipient_and_asset() {
        let scheme = ExactStacks::new();

        let mut transfer = scheme.build_transfer(&requirements(), PAYER).unwrap();
        transfer.to = PAYER.to_string();
        let err = scheme.verify(&proof_for(transfer).await, &requirements()).unwrap_err();
        assert!(err.to_string().contains("recipient mismatch"));

        let mut transfer = scheme.build_transfer(&requirements(), PAYER).unwrap();
        transfer.asset = "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.sbtc-token::sbtc".to_string();
        let err = scheme.verify(&proof_for(transfer).await, &requirements()).unwrap_err();
        assert!(err.to_string().contains("asset mismatch"));
    }

    #[tokio::test]
    async fn test_verify_rejects_expired_transfer() {
        let scheme = ExactStacks::new();
        let mut transfer = scheme.build_transfer(&requirements(), PAYER).unwrap();
        transfer.valid_before = current_timestamp() - 10;
        let err = scheme.verify(&proof_for(transfer).await, &requirements()).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_verify_rejects_forged_signature() {
        let scheme = ExactStacks::new();
        let transfer = scheme.build_transfer(&requirements(), PAYER).unwrap();
        let mut signed = sign(&transfer).await;
        signed.transfer.from = PAYEE.to_string();
        let proof = PaymentProof::new(requirements(), &signed).unwrap();
        assert!(matches!(
            scheme.verify(&proof, &requirements()),
            Err(X402Error::ProofInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_rejects_key_that_does_not_own_sender() {
        use ethers::core::k256::ecdsa::SigningKey;

        let scheme = ExactStacks::new();
        let transfer = scheme.build_transfer(&requirements(), PAYER).unwrap();

        // A well-formed signature by a key that is not PAYER's.
        let key = SigningKey::from_slice(&[0x22; 32]).unwrap();
        let digest = transfer.signing_digest().unwrap();
        let (signature, recovery_id) = key.sign_prehash_recoverable(&digest).unwrap();
        let mut sig_bytes = vec![recovery_id.to_byte()];
        sig_bytes.extend_from_slice(&signature.to_bytes());
        let forged = SignedTransfer {
            transfer,
            public_key: hex::encode(key.verifying_key().to_encoded_point(true).as_bytes()),
            signature: hex::encode(sig_bytes),
        };

        let proof = PaymentProof::new(requirements(), &forged).unwrap();
        let err = scheme.verify(&proof, &requirements()).unwrap_err();
        assert!(matches!(err, X402Error::ProofInvalid(ref m) if m.contains("not the sender")));
    }
}
