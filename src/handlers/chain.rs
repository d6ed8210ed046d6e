//! Chain-backed collaborators: hypervisor snapshots and timestamp to block
//! lookup over JSON-RPC.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::aliases::I24;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;

use crate::db::{DbError, DbOperation, DbPool, DbValue};
use crate::recovery::{BlockLocator, CollaboratorError, HypervisorSnapshot, SnapshotBuilder};
use crate::rpc::RpcClient;

sol! {
    interface IHypervisor {
        function totalSupply() external view returns (uint256);
        function getTotalAmounts() external view returns (uint256 total0, uint256 total1);
        function pool() external view returns (address);
        function baseLower() external view returns (int24);
        function baseUpper() external view returns (int24);
        function limitLower() external view returns (int24);
        function limitUpper() external view returns (int24);
    }

    interface IUniswapV3Pool {
        function positions(bytes32 key) external view returns (
            uint128 liquidity,
            uint256 feeGrowthInside0LastX128,
            uint256 feeGrowthInside1LastX128,
            uint128 tokensOwed0,
            uint128 tokensOwed1
        );
    }
}

/// RPC clients by network name.
#[derive(Debug, Clone, Default)]
pub struct NetworkClients {
    clients: HashMap<String, Arc<RpcClient>>,
}

impl NetworkClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, network: &str, client: Arc<RpcClient>) {
        self.clients.insert(network.to_string(), client);
    }

    pub fn get(&self, network: &str) -> Result<&Arc<RpcClient>, CollaboratorError> {
        self.clients.get(network).ok_or_else(|| {
            CollaboratorError::InvalidRequest(format!("no RPC client for network {}", network))
        })
    }
}

fn parse_address(address: &str) -> Result<Address, CollaboratorError> {
    Address::from_str(address)
        .map_err(|e| CollaboratorError::Decode(format!("invalid address {}: {}", address, e)))
}

fn request<C: SolCall>(to: Address, call: &C) -> TransactionRequest {
    TransactionRequest::default()
        .to(to)
        .input(Bytes::from(call.abi_encode()).into())
}

fn decode<C: SolCall>(raw: &Bytes) -> Result<C::Return, CollaboratorError> {
    C::abi_decode_returns(raw)
        .map_err(|e| CollaboratorError::Decode(format!("{}: {}", C::SIGNATURE, e)))
}

fn tick<C: SolCall<Return = I24>>(raw: &Bytes) -> Result<i32, CollaboratorError> {
    let value = decode::<C>(raw)?;
    i32::try_from(value)
        .map_err(|_| CollaboratorError::Decode(format!("{} out of range", C::SIGNATURE)))
}

/// Storage key of a Uniswap V3 position: `keccak256(abi.encodePacked(owner, tickLower, tickUpper))`.
pub fn position_key(owner: Address, tick_lower: i32, tick_upper: i32) -> B256 {
    let mut packed = Vec::with_capacity(26);
    packed.extend_from_slice(owner.as_slice());
    packed.extend_from_slice(&tick_lower.to_be_bytes()[1..]);
    packed.extend_from_slice(&tick_upper.to_be_bytes()[1..]);
    keccak256(packed)
}

/// Builds hypervisor snapshots from contract state and stores them in
/// `hypervisor_status`.
pub struct ChainSnapshotBuilder {
    clients: NetworkClients,
    db: Arc<DbPool>,
}

impl ChainSnapshotBuilder {
    pub fn new(clients: NetworkClients, db: Arc<DbPool>) -> Self {
        Self { clients, db }
    }
}

#[async_trait]
impl SnapshotBuilder for ChainSnapshotBuilder {
    async fn build(
        &self,
        network: &str,
        address: &str,
        block: u64,
    ) -> Result<HypervisorSnapshot, CollaboratorError> {
        let client = self.clients.get(network)?;
        let hypervisor = parse_address(address)?;

        let calls = [
            request(hypervisor, &IHypervisor::totalSupplyCall {}),
            request(hypervisor, &IHypervisor::getTotalAmountsCall {}),
            request(hypervisor, &IHypervisor::poolCall {}),
            request(hypervisor, &IHypervisor::baseLowerCall {}),
            request(hypervisor, &IHypervisor::baseUpperCall {}),
            request(hypervisor, &IHypervisor::limitLowerCall {}),
            request(hypervisor, &IHypervisor::limitUpperCall {}),
        ];
        let raw = client.call_many(&calls, block).await?;

        let total_supply = decode::<IHypervisor::totalSupplyCall>(&raw[0])?;
        let amounts = decode::<IHypervisor::getTotalAmountsCall>(&raw[1])?;
        let pool = decode::<IHypervisor::poolCall>(&raw[2])?;
        let base = (
            tick::<IHypervisor::baseLowerCall>(&raw[3])?,
            tick::<IHypervisor::baseUpperCall>(&raw[4])?,
        );
        let limit = (
            tick::<IHypervisor::limitLowerCall>(&raw[5])?,
            tick::<IHypervisor::limitUpperCall>(&raw[6])?,
        );

        let positions = [
            request(
                pool,
                &IUniswapV3Pool::positionsCall {
                    key: position_key(hypervisor, base.0, base.1),
                },
            ),
            request(
                pool,
                &IUniswapV3Pool::positionsCall {
                    key: position_key(hypervisor, limit.0, limit.1),
                },
            ),
        ];
        let raw = client.call_many(&positions, block).await?;
        let base_position = decode::<IUniswapV3Pool::positionsCall>(&raw[0])?;
        let limit_position = decode::<IUniswapV3Pool::positionsCall>(&raw[1])?;

        Ok(HypervisorSnapshot {
            address: address.to_lowercase(),
            block,
            total_supply,
            total_amounts: [amounts.total0, amounts.total1],
            fees_owed: [
                U256::from(base_position.tokensOwed0) + U256::from(limit_position.tokensOwed0),
                U256::from(base_position.tokensOwed1) + U256::from(limit_position.tokensOwed1),
            ],
        })
    }

    async fn persist(
        &self,
        network: &str,
        snapshots: &[HypervisorSnapshot],
    ) -> Result<(), CollaboratorError> {
        let operations = snapshots
            .iter()
            .map(|snapshot| snapshot_upsert(network, snapshot))
            .collect::<Result<Vec<_>, _>>()?;
        self.db.execute_transaction(operations).await?;
        Ok(())
    }
}

fn snapshot_upsert(network: &str, snapshot: &HypervisorSnapshot) -> Result<DbOperation, DbError> {
    Ok(DbOperation::Upsert {
        table: "hypervisor_status".to_string(),
        columns: vec![
            "network".to_string(),
            "address".to_string(),
            "block".to_string(),
            "total_supply".to_string(),
            "total_amount0".to_string(),
            "total_amount1".to_string(),
            "fees_owed0".to_string(),
            "fees_owed1".to_string(),
        ],
        values: vec![
            DbValue::Text(network.to_string()),
            DbValue::Text(snapshot.address.to_lowercase()),
            DbValue::uint("block", snapshot.block)?,
            DbValue::Numeric(snapshot.total_supply.to_string()),
            DbValue::Numeric(snapshot.total_amounts[0].to_string()),
            DbValue::Numeric(snapshot.total_amounts[1].to_string()),
            DbValue::Numeric(snapshot.fees_owed[0].to_string()),
            DbValue::Numeric(snapshot.fees_owed[1].to_string()),
        ],
        conflict_columns: vec![
            "network".to_string(),
            "address".to_string(),
            "block".to_string(),
        ],
        update_columns: vec![
            "total_supply".to_string(),
            "total_amount0".to_string(),
            "total_amount1".to_string(),
            "fees_owed0".to_string(),
            "fees_owed1".to_string(),
        ],
    })
}

/// Finds blocks by timestamp with a binary search over block headers.
pub struct RpcBlockLocator {
    clients: NetworkClients,
}

impl RpcBlockLocator {
    pub fn new(clients: NetworkClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl BlockLocator for RpcBlockLocator {
    async fn block_at(&self, network: &str, timestamp: u64) -> Result<u64, CollaboratorError> {
        let client = self.clients.get(network)?;
        let latest = client.get_block_number().await?;
        locate_block(latest, timestamp, |block| async move {
            Ok::<_, CollaboratorError>(client.get_block_timestamp(block).await?)
        })
        .await
    }
}

/// Last block in `0..=latest` whose timestamp is at or before `target`.
/// Block 0 when `target` predates every block.
pub async fn locate_block<F, Fut>(
    latest: u64,
    target: u64,
    mut timestamp_of: F,
) -> Result<u64, CollaboratorError>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<u64, CollaboratorError>>,
{
    if timestamp_of(latest).await? <= target {
        return Ok(latest);
    }

    let (mut lo, mut hi) = (0u64, latest);
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if timestamp_of(mid).await? <= target {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}
