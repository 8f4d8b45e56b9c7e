//! Authorization of plans before a run is created

use crate::planner::ExecutionPlan;

use ethers::types::{Bytes, RecoveryMessage, Signature};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A plan together with the signer's signature over its hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPlan {
    pub plan: ExecutionPlan,
    pub signature: Bytes,
}

pub trait SignatureVerifier: Send + Sync {
    /// Check an opaque signature against the plan's hash
    fn verify(&self, plan: &ExecutionPlan, signature: &[u8]) -> bool;
}

/// secp256k1 signature over the raw plan hash, recovered against the plan owner
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerSignatureVerifier;

impl SignatureVerifier for OwnerSignatureVerifier {
    fn verify(&self, plan: &ExecutionPlan, signature: &[u8]) -> bool {
        let signature = match Signature::try_from(signature) {
            Ok(signature) => signature,
            Err(e) => {
                debug!("Malformed signature for plan {:?}: {}", plan.hash, e);
                return false;
            }
        };

        signature
            .verify(RecoveryMessage::Hash(plan.hash), plan.owner)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::FeeInstruction;
    use crate::registry::TokenId;
    use crate::testing::{sign_plan, wallet};
    use ethers::signers::Signer;
    use ethers::types::{Address, U256};

    fn plan(owner: Address) -> ExecutionPlan {
        ExecutionPlan::new(
            owner,
            vec![],
            FeeInstruction {
                chain_id: 10,
                token: TokenId::from("USDC"),
                amount: U256::from(42u64),
            },
        )
    }

    #[test]
    fn test_owner_signature_verifies() {
        let wallet = wallet();
        let plan = plan(wallet.address());
        let signature = sign_plan(&plan);
        assert!(OwnerSignatureVerifier.verify(&plan, &signature));
    }

    #[test]
    fn test_wrong_owner_or_garbage_rejected() {
        let wallet = wallet();
        let signature = sign_plan(&plan(wallet.address()));

        assert!(!OwnerSignatureVerifier.verify(&plan(Address::repeat_byte(3)), &signature));
        assert!(!OwnerSignatureVerifier.verify(&plan(wallet.address()), &[0u8; 12]));
    }
}
