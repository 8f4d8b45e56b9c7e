//! Error types for the Supertransaction executor

use thiserror::Error;

/// Main error type for the executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    // Resolution errors: fatal before quoting
    #[error("Invalid instruction set: {0}")]
    InvalidInstructionSet(String),

    #[error(
        "Unsatisfiable resource requirement: instruction {instruction} needs {amount} {token} on chain {chain_id}"
    )]
    UnsatisfiableRequirement {
        instruction: String,
        token: String,
        amount: String,
        chain_id: u64,
    },

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    // Planning errors: fatal before quoting
    #[error("No bridge route available from chain {from} to chain {to} for {token}")]
    NoBridgeRoute { from: u64, to: u64, token: String },

    #[error("Fee token {token} unsupported on chain {chain_id}")]
    UnsupportedFeeToken { chain_id: u64, token: String },

    #[error("Funding invariant violated: {0}")]
    FundingInvariant(String),

    #[error("No price configured for {0}")]
    MissingPrice(String),

    #[error("Quote out of range: {0}")]
    QuoteOutOfRange(String),

    // Authorization errors: run never created
    #[error("Signature/plan mismatch for plan {plan_hash}")]
    SignatureMismatch { plan_hash: String },

    #[error("Plan {plan_hash} was not quoted by this executor")]
    PlanNotIssued { plan_hash: String },

    // Execution errors: localized to a node
    #[error("Dispatch rejected on chain {chain_id}: {message}")]
    DispatchRejected { chain_id: u64, message: String },

    #[error("Bridge route {route_id} error: {message}")]
    Bridge { route_id: String, message: String },

    // Run lifecycle errors
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Cancellation rejected for run {run_id}: {reason}")]
    CancellationRejected { run_id: String, reason: String },

    #[error("Run {run_id} already started")]
    RunAlreadyStarted { run_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Infrastructure errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Reorg detected on chain {chain_id} at block {block_number}")]
    ReorgDetected { chain_id: u64, block_number: u64 },

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classes used for API status codes and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resolution,
    Planning,
    Authorization,
    Execution,
    Runtime,
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Resolution => "resolution",
            ErrorKind::Planning => "planning",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Execution => "execution",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::InvalidInstructionSet(_)
            | ExecutorError::UnsatisfiableRequirement { .. }
            | ExecutorError::DependencyCycle { .. } => ErrorKind::Resolution,

            ExecutorError::NoBridgeRoute { .. }
            | ExecutorError::UnsupportedFeeToken { .. }
            | ExecutorError::FundingInvariant(_)
            | ExecutorError::MissingPrice(_)
            | ExecutorError::QuoteOutOfRange(_) => ErrorKind::Planning,

            ExecutorError::SignatureMismatch { .. } | ExecutorError::PlanNotIssued { .. } => {
                ErrorKind::Authorization
            }

            ExecutorError::DispatchRejected { .. }
            | ExecutorError::Bridge { .. }
            | ExecutorError::ReorgDetected { .. }
            | ExecutorError::InsufficientBalance { .. }
            | ExecutorError::Transaction(_) => ErrorKind::Execution,

            ExecutorError::RunNotFound { .. }
            | ExecutorError::CancellationRejected { .. }
            | ExecutorError::RunAlreadyStarted { .. }
            | ExecutorError::InvalidStateTransition { .. } => ErrorKind::Runtime,

            _ => ErrorKind::Infrastructure,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::ChainConnection { .. }
                | ExecutorError::Timeout { .. }
                | ExecutorError::RateLimited { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            ExecutorError::InsufficientBalance { .. }
                | ExecutorError::ReorgDetected { .. }
                | ExecutorError::Wallet(_)
        )
    }
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;
