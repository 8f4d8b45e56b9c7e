//! Transaction sender and the EVM chain dispatcher built on it

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{ChainManager, ChainProvider, GasPrice};
use crate::config::WalletConfig;
use crate::coordination::{ChainDispatcher, DispatchReceipt, Inclusion, PlanAuthorization};
use crate::error::{ExecutorError, ExecutorResult};
use crate::instruction::{Call, Instruction};
use crate::planner::FeeInstruction;
use crate::registry::{ChainId, ChainRegistry};

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Entry point of the owner's delegated account
pub const EXECUTE_SIGNATURE: &str =
    "executeSupertransaction(bytes32,(address,uint256,bytes)[],bytes)";

/// Signature check and dispatch loop of the delegated account
const EXECUTION_OVERHEAD: u64 = 40_000;
const OVERHEAD_PER_CALL: u64 = 5_000;
const FEE_TRANSFER_GAS: u64 = 65_000;

/// Broadcasts of one signed transaction before falling back to a lookup
const SEND_ATTEMPTS: u32 = 3;

const KEYSTORE_PASSWORD_ENV: &str = "EXECUTOR_KEYSTORE_PASSWORD";

/// Signs and broadcasts transactions from the executor wallet
pub struct TransactionSender {
    chain_manager: Arc<ChainManager>,
    nonce_manager: Arc<NonceManager>,
    gas_estimator: GasEstimator,
    wallet: LocalWallet,
    send_timeout: Duration,
    resend_delay: Duration,
}

impl TransactionSender {
    pub async fn new(
        chain_manager: Arc<ChainManager>,
        wallet: LocalWallet,
    ) -> ExecutorResult<Self> {
        let wallet_address = wallet.address();
        info!("Transaction sender initialized with wallet: {:?}", wallet_address);

        let nonce_manager = Arc::new(NonceManager::new(wallet_address));

        for chain_id in chain_manager.connected_chains() {
            if let Ok(provider) = chain_manager.get_provider(chain_id) {
                if let Err(e) = nonce_manager.init_chain(chain_id, &provider).await {
                    warn!("Failed to init nonce for chain {}: {}", chain_id, e);
                }
            }
        }

        Ok(Self {
            chain_manager,
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            wallet,
            send_timeout: Duration::from_secs(30),
            resend_delay: Duration::from_millis(500),
        })
    }

    /// Load wallet from environment or keystore
    pub fn load_wallet(config: &WalletConfig) -> ExecutorResult<LocalWallet> {
        if let Ok(key) = std::env::var(&config.private_key_env) {
            return key
                .parse::<LocalWallet>()
                .map_err(|e| ExecutorError::Wallet(format!("Invalid private key: {}", e)));
        }

        if let Some(path) = &config.keystore_path {
            let password = std::env::var(KEYSTORE_PASSWORD_ENV).map_err(|_| {
                ExecutorError::Wallet(format!(
                    "{} not set for keystore {}",
                    KEYSTORE_PASSWORD_ENV, path
                ))
            })?;
            return LocalWallet::decrypt_keystore(path, password)
                .map_err(|e| ExecutorError::Wallet(format!("Failed to decrypt keystore: {}", e)));
        }

        Err(ExecutorError::Wallet(format!(
            "No wallet configured. Set {} or configure a keystore",
            config.private_key_env
        )))
    }

    pub fn chain_manager(&self) -> &Arc<ChainManager> {
        &self.chain_manager
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Send one transaction; `declared_gas` is buffered before use
    ///
    /// The transaction is signed once. Retryable broadcast errors resend the
    /// same bytes; if the outcome stays unknown the nonce is kept reserved
    /// and the send fails without re-signing.
    pub async fn send(
        &self,
        chain_id: ChainId,
        to: Address,
        data: Bytes,
        declared_gas: U256,
    ) -> ExecutorResult<H256> {
        let provider = self.chain_manager.get_provider(chain_id)?;
        let gas_limit = self.gas_estimator.buffered_gas_limit(declared_gas);
        let gas_price = self.gas_estimator.get_gas_price(&provider).await?;

        let need = GasEstimator::calculate_cost(gas_limit, &gas_price);
        let have = provider.native_balance(self.wallet.address()).await?;
        if have < need {
            return Err(ExecutorError::InsufficientBalance {
                chain_id,
                have: have.to_string(),
                need: need.to_string(),
            });
        }

        let mut resynced = false;
        loop {
            let nonce = self.nonce_manager.get_nonce(chain_id).await?;
            let tx = build_tx(chain_id, to, data.clone(), nonce, gas_limit, &gas_price);

            let raw = match self.sign(chain_id, &tx).await {
                Ok(raw) => raw,
                Err(e) => {
                    self.nonce_manager.release_nonce(chain_id, nonce).await?;
                    return Err(e);
                }
            };
            let tx_hash = H256::from(ethers::utils::keccak256(&raw));

            let outcome = broadcast_signed(
                tx_hash,
                SEND_ATTEMPTS,
                self.resend_delay,
                || self.broadcast(&provider, raw.clone()),
                || provider.has_transaction(tx_hash),
            )
            .await;

            match outcome {
                Broadcast::Accepted(tx_hash) => {
                    self.nonce_manager.mark_pending(chain_id, nonce, tx_hash).await?;
                    crate::metrics::record_tx_submitted(chain_id);
                    info!(
                        "Transaction sent on chain {}: {:?} (nonce {})",
                        chain_id, tx_hash, nonce
                    );
                    return Ok(tx_hash);
                }
                Broadcast::Rejected(e) => {
                    self.nonce_manager.release_nonce(chain_id, nonce).await?;
                    crate::metrics::record_tx_failed(chain_id);

                    if matches!(e, ExecutorError::Nonce { .. }) && !resynced {
                        warn!("Nonce {} rejected on chain {}, syncing", nonce, chain_id);
                        self.nonce_manager.sync(chain_id, &provider).await?;
                        resynced = true;
                        continue;
                    }
                    return Err(e);
                }
                Broadcast::Unresolved(e) => {
                    self.nonce_manager.mark_pending(chain_id, nonce, tx_hash).await?;
                    crate::metrics::record_tx_failed(chain_id);
                    error!(
                        "Broadcast of {:?} on chain {} unresolved, nonce {} held: {}",
                        tx_hash, chain_id, nonce, e
                    );
                    return Err(ExecutorError::Transaction(format!(
                        "broadcast of {:?} on chain {} unresolved: {}",
                        tx_hash, chain_id, e
                    )));
                }
            }
        }
    }

    async fn sign(&self, chain_id: ChainId, tx: &TypedTransaction) -> ExecutorResult<Bytes> {
        let wallet = self.wallet.clone().with_chain_id(chain_id);
        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| ExecutorError::Wallet(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }

    async fn broadcast(&self, provider: &ChainProvider, raw: Bytes) -> ExecutorResult<H256> {
        match timeout(self.send_timeout, provider.send_raw_transaction(raw)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout {
                operation: format!("send transaction on chain {}", provider.chain_id()),
            }),
        }
    }

    /// Release the nonce of a transaction that reached a terminal state
    pub async fn settle_nonce(&self, chain_id: ChainId, tx_hash: H256) -> ExecutorResult<()> {
        self.nonce_manager.confirm_tx(chain_id, tx_hash).await
    }
}

fn build_tx(
    chain_id: ChainId,
    to: Address,
    data: Bytes,
    nonce: u64,
    gas_limit: U256,
    gas_price: &GasPrice,
) -> TypedTransaction {
    match gas_price {
        GasPrice::Legacy(price) => TransactionRequest::new()
            .to(to)
            .data(data)
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(*price)
            .chain_id(chain_id)
            .into(),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Eip1559TransactionRequest::new()
            .to(to)
            .data(data)
            .nonce(nonce)
            .gas(gas_limit)
            .max_fee_per_gas(*max_fee_per_gas)
            .max_priority_fee_per_gas(*max_priority_fee_per_gas)
            .chain_id(chain_id)
            .into(),
    }
}

/// Outcome of broadcasting one signed transaction
#[derive(Debug)]
pub(crate) enum Broadcast {
    Accepted(H256),
    /// The node refused the transaction; it never entered the pool
    Rejected(ExecutorError),
    /// It may or may not have reached the pool
    Unresolved(ExecutorError),
}

/// Broadcast the same signed bytes up to `attempts` times
///
/// Only a definitive error on the first attempt counts as a rejection. Once
/// an attempt may have reached the node, any later failure is settled by
/// looking the hash up.
pub(crate) async fn broadcast_signed<S, SF, L, LF>(
    tx_hash: H256,
    attempts: u32,
    resend_delay: Duration,
    mut send: S,
    lookup: L,
) -> Broadcast
where
    S: FnMut() -> SF,
    SF: Future<Output = ExecutorResult<H256>>,
    L: FnOnce() -> LF,
    LF: Future<Output = ExecutorResult<bool>>,
{
    let mut last_error = None;
    for attempt in 0..attempts.max(1) {
        match send().await {
            Ok(hash) => return Broadcast::Accepted(hash),
            Err(e) if attempt == 0 && !e.is_retryable() => return Broadcast::Rejected(e),
            Err(e) if e.is_retryable() => {
                warn!("Broadcast of {:?} failed (attempt {}): {}", tx_hash, attempt + 1, e);
                last_error = Some(e);
                sleep(resend_delay).await;
            }
            Err(e) => {
                last_error = Some(e);
                break;
            }
        }
    }

    let error = last_error
        .unwrap_or_else(|| ExecutorError::Internal(format!("no broadcast of {:?}", tx_hash)));
    match lookup().await {
        Ok(true) => {
            debug!("Transaction {:?} found after failed broadcast", tx_hash);
            Broadcast::Accepted(tx_hash)
        }
        Ok(false) => Broadcast::Unresolved(error),
        Err(lookup_error) => {
            warn!("Lookup of {:?} failed: {}", tx_hash, lookup_error);
            Broadcast::Unresolved(error)
        }
    }
}

/// ERC-20 `transfer(to, amount)`
pub fn transfer_calldata(to: Address, amount: U256) -> Bytes {
    let mut data = ethers::utils::id("transfer(address,uint256)").to_vec();
    data.extend(abi::encode(&[Token::Address(to), Token::Uint(amount)]));
    Bytes::from(data)
}

/// Calldata and declared gas for running `calls` from the owner's account
///
/// The transaction targets the owner's delegated account, which checks the
/// plan signature and runs every call or reverts as a whole. Call values
/// are paid from the owner's balance, so the transaction itself carries none.
pub fn encode_execution(
    auth: &PlanAuthorization,
    calls: &[Call],
) -> ExecutorResult<(Bytes, U256)> {
    if calls.is_empty() {
        return Err(ExecutorError::InvalidInstructionSet(
            "instruction has no calls".to_string(),
        ));
    }

    let entries = calls
        .iter()
        .map(|call| {
            Token::Tuple(vec![
                Token::Address(call.to),
                Token::Uint(call.value),
                Token::Bytes(call.data.to_vec()),
            ])
        })
        .collect();

    let mut data = ethers::utils::id(EXECUTE_SIGNATURE).to_vec();
    data.extend(abi::encode(&[
        Token::FixedBytes(auth.plan_hash.as_bytes().to_vec()),
        Token::Array(entries),
        Token::Bytes(auth.signature.to_vec()),
    ]));

    let gas = calls
        .iter()
        .try_fold(U256::from(EXECUTION_OVERHEAD), |acc, call| {
            acc.checked_add(call.gas_limit)?
                .checked_add(U256::from(OVERHEAD_PER_CALL))
        })
        .ok_or_else(|| {
            ExecutorError::InvalidInstructionSet("declared gas overflows".to_string())
        })?;

    Ok((Bytes::from(data), gas))
}

/// Call paying `fee` to `recipient`, as a native transfer or an ERC-20 transfer
pub fn fee_call(
    registry: &ChainRegistry,
    fee: &FeeInstruction,
    recipient: Address,
) -> ExecutorResult<Call> {
    let chain = registry.chain(fee.chain_id)?;
    if fee.token.as_str() == chain.native_symbol {
        return Ok(Call::new(recipient, Vec::<u8>::new(), FEE_TRANSFER_GAS).with_value(fee.amount));
    }

    let token = registry
        .token_address(fee.chain_id, &fee.token)
        .ok_or_else(|| ExecutorError::UnsupportedFeeToken {
            chain_id: fee.chain_id,
            token: fee.token.to_string(),
        })?;
    Ok(Call::new(token, transfer_calldata(recipient, fee.amount), FEE_TRANSFER_GAS))
}

/// Runs plan calls on one EVM chain through the owner's delegated account;
/// the executor wallet only pays gas
pub struct EvmDispatcher {
    chain_id: ChainId,
    registry: Arc<ChainRegistry>,
    sender: Arc<TransactionSender>,
}

impl EvmDispatcher {
    pub fn new(
        chain_id: ChainId,
        registry: Arc<ChainRegistry>,
        sender: Arc<TransactionSender>,
    ) -> Self {
        Self {
            chain_id,
            registry,
            sender,
        }
    }

    async fn execute(
        &self,
        auth: &PlanAuthorization,
        label: &str,
        calls: &[Call],
    ) -> ExecutorResult<DispatchReceipt> {
        let (data, gas) = encode_execution(auth, calls)?;
        debug!(
            "Dispatching {} for {:?} on chain {} ({} calls)",
            label,
            auth.owner,
            self.chain_id,
            calls.len()
        );

        let tx_hash = self
            .sender
            .send(self.chain_id, auth.owner, data, gas)
            .await
            .map_err(|e| {
                if e.should_alert() {
                    error!(
                        "{} on chain {} needs operator attention: {}",
                        label, self.chain_id, e
                    );
                }
                e
            })?;
        Ok(DispatchReceipt {
            chain_id: self.chain_id,
            tx_hash,
        })
    }
}

#[async_trait]
impl ChainDispatcher for EvmDispatcher {
    async fn submit(
        &self,
        auth: &PlanAuthorization,
        instruction: &Instruction,
    ) -> ExecutorResult<DispatchReceipt> {
        self.execute(auth, &format!("instruction {}", instruction.id), &instruction.calls)
            .await
    }

    async fn collect_fee(
        &self,
        auth: &PlanAuthorization,
        fee: &FeeInstruction,
    ) -> ExecutorResult<DispatchReceipt> {
        if fee.chain_id != self.chain_id {
            return Err(ExecutorError::Internal(format!(
                "fee on chain {} sent to dispatcher for chain {}",
                fee.chain_id, self.chain_id
            )));
        }
        let call = fee_call(&self.registry, fee, self.sender.wallet_address())?;
        self.execute(auth, &format!("fee of {} {}", fee.amount, fee.token), &[call])
            .await
    }

    async fn inclusion(&self, receipt: &DispatchReceipt) -> ExecutorResult<Inclusion> {
        let tracker = self.sender.chain_manager().get_tracker(self.chain_id)?;
        let inclusion = tracker.inclusion(receipt.tx_hash).await?;

        if !matches!(inclusion, Inclusion::Pending) {
            self.sender
                .settle_nonce(self.chain_id, receipt.tx_hash)
                .await?;
        }
        Ok(inclusion)
    }

    async fn release(&self, receipt: &DispatchReceipt) {
        match self.sender.chain_manager().get_tracker(self.chain_id) {
            Ok(tracker) => tracker.forget(receipt.tx_hash).await,
            Err(e) => debug!("No tracker to release {:?}: {}", receipt.tx_hash, e),
        }
    }
}
