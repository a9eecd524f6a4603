//! Payment scheme implementations.
//!
//! A scheme knows how to turn a [`PaymentRequirements`] entry into a transfer for
//! the payer to sign, and how to check that a received [`PaymentProof`] really
//! pays what the requirements ask for.

pub mod exact_stacks;

use crate::errors::Result;
use crate::types::{PaymentProof, PaymentRequirements, SignedTransfer, UnsignedTransfer};
use std::sync::Arc;

/// Outcome of a successful scheme verification.
#[derive(Debug, Clone)]
pub struct VerifiedPayment {
    /// Payer principal
    pub payer: String,
    /// The signed transfer that will be broadcast
    pub transfer: SignedTransfer,
}

/// Trait for implementing different payment schemes.
pub trait Scheme: Send + Sync {
    /// Returns the name of this scheme (e.g., "exact").
    fn name(&self) -> &str;

    /// Builds the unsigned transfer that satisfies `requirements` when sent by `payer`.
    fn build_transfer(
        &self,
        requirements: &PaymentRequirements,
        payer: &str,
    ) -> Result<UnsignedTransfer>;

    /// Verifies a proof against the requirements the server expects.
    ///
    /// Failures are reported as [`X402Error::ProofInvalid`](crate::errors::X402Error::ProofInvalid).
    fn verify(
        &self,
        proof: &PaymentProof,
        requirements: &PaymentRequirements,
    ) -> Result<VerifiedPayment>;
}

/// Looks up a scheme implementation by name.
pub fn scheme_for(name: &str) -> Option<Arc<dyn Scheme>> {
    match name {
        exact_stacks::ExactStacks::NAME => Some(Arc::new(exact_stacks::ExactStacks::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_lookup() {
        assert_eq!(scheme_for("exact").unwrap().name(), "exact");
        assert!(scheme_for("upto").is_none());
    }
}
