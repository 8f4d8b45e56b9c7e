//! Bridge transfers through a route's deposit contract
//!
//! A transfer approves the route contract and deposits in one transaction
//! from the owner's delegated account. It is considered settled once the
//! recipient's balance on the destination chain has grown by the bridged
//! amount since the deposit. The coordinator runs at most one transfer per
//! recipient, destination chain and token at a time, so the baseline belongs
//! to a single transfer.

use super::sender::{encode_execution, TransactionSender};
use crate::coordination::{
    BridgeProvider, BridgeTransfer, Inclusion, PlanAuthorization, Settlement,
};
use crate::error::{ExecutorError, ExecutorResult};
use crate::instruction::Call;
use crate::planner::{BalanceSource, BridgeStep};
use crate::registry::{BridgeRoute, ChainId, ChainRegistry, TokenId};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use tracing::{debug, info, warn};

const APPROVE_GAS: u64 = 60_000;
const DEPOSIT_GAS: u64 = 200_000;

/// Bookkeeping for one transfer until it settles
#[derive(Debug, Clone)]
struct PendingTransfer {
    source_chain: ChainId,
    destination_chain: ChainId,
    token: TokenId,
    recipient: Address,
    baseline: U256,
    target: U256,
    deposit_tx: H256,
}

pub struct EvmBridgeProvider {
    route: BridgeRoute,
    registry: Arc<ChainRegistry>,
    sender: Arc<TransactionSender>,
    transfers: DashMap<String, PendingTransfer>,
}

impl EvmBridgeProvider {
    pub fn new(
        route: BridgeRoute,
        registry: Arc<ChainRegistry>,
        sender: Arc<TransactionSender>,
    ) -> Self {
        Self {
            route,
            registry,
            sender,
            transfers: DashMap::new(),
        }
    }

    fn bridge_error(&self, message: impl Into<String>) -> ExecutorError {
        ExecutorError::Bridge {
            route_id: self.route.id.clone(),
            message: message.into(),
        }
    }
}

/// ERC-20 `approve(spender, amount)`
pub fn approve_calldata(spender: Address, amount: U256) -> Bytes {
    let mut data = ethers::utils::id("approve(address,uint256)").to_vec();
    data.extend(abi::encode(&[Token::Address(spender), Token::Uint(amount)]));
    Bytes::from(data)
}

/// `depositFor(recipient, token, amount, destinationChainId)`
pub fn deposit_calldata(
    recipient: Address,
    token: Address,
    amount: U256,
    destination: ChainId,
) -> Bytes {
    let mut data = ethers::utils::id("depositFor(address,address,uint256,uint256)").to_vec();
    data.extend(abi::encode(&[
        Token::Address(recipient),
        Token::Address(token),
        Token::Uint(amount),
        Token::Uint(U256::from(destination)),
    ]));
    Bytes::from(data)
}

#[async_trait]
impl BridgeProvider for EvmBridgeProvider {
    async fn initiate(
        &self,
        auth: &PlanAuthorization,
        step: &BridgeStep,
    ) -> ExecutorResult<BridgeTransfer> {
        if step.route_id != self.route.id {
            return Err(self.bridge_error(format!("step planned for route {}", step.route_id)));
        }

        let source_token = self
            .registry
            .token_address(step.source_chain, &step.token)
            .ok_or_else(|| {
                self.bridge_error(format!(
                    "{} not deployed on chain {}",
                    step.token, step.source_chain
                ))
            })?;

        let chain_manager = self.sender.chain_manager();
        let baseline = chain_manager
            .balance_of(step.recipient, step.destination_chain, &step.token)
            .await?;
        let target = baseline.checked_add(step.amount).ok_or_else(|| {
            self.bridge_error(format!("recipient balance cannot grow by {}", step.amount))
        })?;

        let calls = [
            Call::new(
                source_token,
                approve_calldata(self.route.contract, step.amount),
                APPROVE_GAS,
            ),
            Call::new(
                self.route.contract,
                deposit_calldata(step.recipient, source_token, step.amount, step.destination_chain),
                DEPOSIT_GAS,
            ),
        ];
        let (data, gas) = encode_execution(auth, &calls)?;
        let deposit_tx = self
            .sender
            .send(step.source_chain, auth.owner, data, gas)
            .await?;

        let transfer_id = format!("{:?}", deposit_tx);
        self.transfers.insert(
            transfer_id.clone(),
            PendingTransfer {
                source_chain: step.source_chain,
                destination_chain: step.destination_chain,
                token: step.token.clone(),
                recipient: step.recipient,
                baseline,
                target,
                deposit_tx,
            },
        );

        info!(
            "Bridging {} {} from chain {} to {} via {} (deposit {:?})",
            step.amount,
            step.token,
            step.source_chain,
            step.destination_chain,
            self.route.id,
            deposit_tx
        );

        Ok(BridgeTransfer {
            route_id: self.route.id.clone(),
            transfer_id,
            source_tx: Some(deposit_tx),
        })
    }

    async fn settlement(&self, transfer: &BridgeTransfer) -> ExecutorResult<Settlement> {
        let pending = self
            .transfers
            .get(&transfer.transfer_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| {
                self.bridge_error(format!("unknown transfer {}", transfer.transfer_id))
            })?;

        let chain_manager = self.sender.chain_manager();
        let tracker = chain_manager.get_tracker(pending.source_chain)?;
        match tracker.inclusion(pending.deposit_tx).await {
            Ok(Inclusion::Pending) => return Ok(Settlement::InFlight),
            Ok(Inclusion::Reverted { reason }) => {
                self.transfers.remove(&transfer.transfer_id);
                tracker.forget(pending.deposit_tx).await;
                return Ok(Settlement::Failed { reason });
            }
            Ok(Inclusion::Included { .. }) => {
                self.sender
                    .settle_nonce(pending.source_chain, pending.deposit_tx)
                    .await?;
            }
            Err(e @ ExecutorError::ReorgDetected { .. }) => {
                self.transfers.remove(&transfer.transfer_id);
                return Ok(Settlement::Failed {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        let balance = chain_manager
            .balance_of(pending.recipient, pending.destination_chain, &pending.token)
            .await?;

        if balance >= pending.target {
            self.transfers.remove(&transfer.transfer_id);
            tracker.forget(pending.deposit_tx).await;
            info!("Transfer {} on {} settled", transfer.transfer_id, self.route.id);
            Ok(Settlement::Settled)
        } else {
            debug!(
                "Transfer {} waiting: balance {} below {}",
                transfer.transfer_id,
                balance,
                pending.target
            );
            if balance < pending.baseline {
                warn!(
                    "Recipient balance on chain {} fell below baseline during transfer {}",
                    pending.destination_chain, transfer.transfer_id
                );
            }
            Ok(Settlement::InFlight)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deposit_calldata_layout() {
        let recipient = Address::from_low_u64_be(0xaa);
        let token = Address::from_low_u64_be(0xbb);
        let data = deposit_calldata(recipient, token, U256::from(300_000u64), 8453);

        assert_eq!(data.len(), 4 + 4 * 32);
        assert_eq!(
            &data[..4],
            &ethers::utils::id("depositFor(address,address,uint256,uint256)")
        );
        assert_eq!(&data[4 + 12..4 + 32], recipient.as_bytes());
        assert_eq!(U256::from_big_endian(&data[4 + 64..4 + 96]), U256::from(300_000u64));
        assert_eq!(U256::from_big_endian(&data[4 + 96..]), U256::from(8453u64));
    }

    #[test]
    fn test_approve_calldata_layout() {
        let spender = Address::from_low_u64_be(0xcc);
        let data = approve_calldata(spender, U256::MAX);
        assert_eq!(data.len(), 4 + 2 * 32);
        assert_eq!(&data[4 + 12..4 + 32], spender.as_bytes());
        assert_eq!(U256::from_big_endian(&data[4 + 32..]), U256::MAX);
    }
}
