//! On-chain settlement backend.
//!
//! Settles payments through the payer's smart-account wallet: the contract at
//! `authorization.from` performs signature recovery and nonce consumption when
//! `executeTransferWithAuthorization` is called, so the chain itself is the
//! authoritative replay defense. `simulate` issues the call as a
//! read-only `eth_call`; `settle` re-sends it as a transaction and waits for the
//! configured confirmation count.
//!
//! The connected node's chain id is fetched once per client lifetime and compared
//! against the configured expectation; a mismatch is fatal and every subsequent
//! call keeps failing until the operator fixes the endpoint.

use alloy::network::EthereumWallet;
use alloy::primitives::{Bytes, FixedBytes};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::instrument;
use url::Url;

use crate::settlement::{SettlementClient, SettlementError, SettlementMode};
use crate::types::{EvmAddress, Network, NormalizedPaymentRequest, TransactionHash};

sol!(
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract SmartAccount {
        struct TransferAuthorization {
            address from;
            address to;
            address token;
            uint256 value;
            uint256 validAfter;
            uint256 validBefore;
            bytes32 nonce;
        }

        function executeTransferWithAuthorization(
            bytes32 sessionId,
            TransferAuthorization calldata authorization,
            bytes calldata signature,
            bytes calldata metadata
        ) external returns (bool);
    }
);

/// Chain-id verification failure, mapped to a phase-appropriate
/// [`SettlementError`] at the call site.
enum ChainIdError {
    Mismatch { expected: u64, actual: u64 },
    Rpc(String),
}

/// Settlement client backed by an EVM JSON-RPC endpoint.
pub struct ChainSettlement {
    provider: DynProvider,
    network: Network,
    expected_chain_id: u64,
    confirmations: u64,
    rpc_timeout: Duration,
    signer_address: Option<EvmAddress>,
    /// Node chain id, fetched at most once for the lifetime of this client.
    fetched_chain_id: OnceCell<u64>,
}

impl ChainSettlement {
    /// Connects a settlement client to `rpc_url`.
    ///
    /// Without a signer the client can still `simulate`; `settle` fails with
    /// [`SettlementError::MissingPrivateKey`].
    pub fn new(
        rpc_url: &Url,
        network: Network,
        expected_chain_id: u64,
        signer: Option<PrivateKeySigner>,
        confirmations: u64,
        rpc_timeout: Duration,
    ) -> Self {
        let signer_address = signer.as_ref().map(|s| EvmAddress(s.address()));
        let provider = match signer {
            Some(signer) => ProviderBuilder::new()
                .wallet(EthereumWallet::from(signer))
                .connect_http(rpc_url.clone())
                .erased(),
            None => ProviderBuilder::new().connect_http(rpc_url.clone()).erased(),
        };
        if let Some(address) = &signer_address {
            tracing::info!(network = %network, signer = %address, "chain settlement ready");
        } else {
            tracing::warn!(network = %network, "chain settlement has no signing key, settle disabled");
        }
        ChainSettlement {
            provider,
            network,
            expected_chain_id,
            confirmations,
            rpc_timeout,
            signer_address,
            fetched_chain_id: OnceCell::new(),
        }
    }

    /// Fetch-once, compare-always chain id check. RPC failures are not cached, so
    /// the check retries while the cache warms; a successful fetch is permanent.
    async fn assert_chain_id(&self) -> Result<(), ChainIdError> {
        let actual = self
            .fetched_chain_id
            .get_or_try_init(|| async {
                tokio::time::timeout(self.rpc_timeout, self.provider.get_chain_id())
                    .await
                    .map_err(|_| ChainIdError::Rpc("chain id fetch timed out".to_string()))?
                    .map_err(|e| ChainIdError::Rpc(e.to_string()))
            })
            .await?;
        if *actual != self.expected_chain_id {
            return Err(ChainIdError::Mismatch {
                expected: self.expected_chain_id,
                actual: *actual,
            });
        }
        Ok(())
    }

    /// Assembles the `executeTransferWithAuthorization` arguments from a
    /// normalized request.
    fn call_args(
        &self,
        request: &NormalizedPaymentRequest,
    ) -> Result<
        (
            FixedBytes<32>,
            SmartAccount::TransferAuthorization,
            Bytes,
            Bytes,
        ),
        SettlementError,
    > {
        let authorization = SmartAccount::TransferAuthorization {
            from: request.authorization.from.into(),
            to: request.authorization.to.into(),
            token: request.authorization.token.into(),
            value: request.authorization.value.into(),
            validAfter: request.authorization.valid_after.into(),
            validBefore: request.authorization.valid_before.into(),
            nonce: FixedBytes(request.authorization.nonce.0),
        };
        let metadata = hex::decode(request.metadata_bytes.trim_start_matches("0x"))
            .map_err(|_| SettlementError::SimulationFailed("invalid metadata bytes".to_string()))?;
        Ok((
            FixedBytes(request.session_id.0),
            authorization,
            Bytes::from(request.signature.0.to_vec()),
            Bytes::from(metadata),
        ))
    }
}

#[async_trait]
impl SettlementClient for ChainSettlement {
    fn mode(&self) -> SettlementMode {
        SettlementMode::Chain
    }

    fn configured(&self) -> bool {
        self.signer_address.is_some()
    }

    /// Read-only dry run of `executeTransferWithAuthorization` on the payer's
    /// smart account. The contract rejects invalid signatures, out-of-window
    /// authorizations, and consumed nonces; all three surface as
    /// `simulation_failed`.
    #[instrument(skip_all, err, fields(
        network = %self.network,
        payment_request_id = %request.payment_request_id,
        payer = %request.authorization.from,
    ))]
    async fn simulate(&self, request: &NormalizedPaymentRequest) -> Result<(), SettlementError> {
        self.assert_chain_id().await.map_err(|e| match e {
            ChainIdError::Mismatch { expected, actual } => {
                SettlementError::ChainIdMismatch { expected, actual }
            }
            ChainIdError::Rpc(message) => SettlementError::SimulationFailed(message),
        })?;
        let wallet = SmartAccount::new(request.authorization.from.into(), &self.provider);
        let (session_id, authorization, signature, metadata) = self.call_args(request)?;
        let call = wallet.executeTransferWithAuthorization(session_id, authorization, signature, metadata);
        tokio::time::timeout(self.rpc_timeout, call.call())
            .await
            .map_err(|_| SettlementError::SimulationFailed("RPC call timed out".to_string()))?
            .map_err(|e| SettlementError::SimulationFailed(e.to_string()))?;
        Ok(())
    }

    /// Broadcasts the transfer and waits for the configured confirmation count.
    #[instrument(skip_all, err, fields(
        network = %self.network,
        payment_request_id = %request.payment_request_id,
        payer = %request.authorization.from,
    ))]
    async fn settle(
        &self,
        request: &NormalizedPaymentRequest,
    ) -> Result<String, SettlementError> {
        if self.signer_address.is_none() {
            return Err(SettlementError::MissingPrivateKey);
        }
        self.assert_chain_id().await.map_err(|e| match e {
            ChainIdError::Mismatch { expected, actual } => {
                SettlementError::ChainIdMismatch { expected, actual }
            }
            ChainIdError::Rpc(message) => SettlementError::SettlementFailed(message),
        })?;

        let wallet = SmartAccount::new(request.authorization.from.into(), &self.provider);
        let (session_id, authorization, signature, metadata) = self.call_args(request)?;
        let call = wallet.executeTransferWithAuthorization(session_id, authorization, signature, metadata);
        let pending = tokio::time::timeout(self.rpc_timeout, call.send())
            .await
            .map_err(|_| SettlementError::SettlementFailed("broadcast timed out".to_string()))?
            .map_err(|e| SettlementError::SettlementFailed(e.to_string()))?;

        // Confirmation waits scale with the confirmation count; the per-call RPC
        // timeout alone is too tight for block inclusion.
        let receipt_timeout = self.rpc_timeout * (self.confirmations.max(1) as u32 + 1);
        let receipt = tokio::time::timeout(
            receipt_timeout,
            pending
                .with_required_confirmations(self.confirmations)
                .get_receipt(),
        )
        .await
        .map_err(|_| SettlementError::SettlementFailed("confirmation timed out".to_string()))?
        .map_err(|e| SettlementError::SettlementFailed(e.to_string()))?;

        let tx_hash = TransactionHash(receipt.transaction_hash.0);
        if receipt.status() {
            tracing::info!(tx = %tx_hash, "executeTransferWithAuthorization succeeded");
            Ok(tx_hash.to_string())
        } else {
            tracing::warn!(tx = %tx_hash, "executeTransferWithAuthorization reverted");
            Err(SettlementError::SettlementFailed(format!(
                "transaction {tx_hash} reverted"
            )))
        }
    }

    async fn reachability(&self) -> Result<(), SettlementError> {
        self.assert_chain_id().await.map_err(|e| match e {
            ChainIdError::Mismatch { expected, actual } => {
                SettlementError::ChainIdMismatch { expected, actual }
            }
            ChainIdError::Rpc(message) => SettlementError::SettlementFailed(message),
        })
    }
}
