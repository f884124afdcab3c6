//! Per-chain mutual exclusion held while a chain tail is hashed
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};
use uuid7::uuid7;

use crate::error::ChainError;
use crate::types::ChainKey;

const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
struct LeaseRecord {
    #[n(0)]
    owner: String,
    #[n(1)]
    expires_at_ms: i64,
}

/// Held lease on one chain. Released on drop if still owned.
#[derive(Debug)]
pub struct ChainLease {
    tree: sled::Tree,
    key: Vec<u8>,
    record: Vec<u8>,
    chain: String,
}

impl ChainLease {
    /// Blocks until the lease on `chain` is free or `wait` elapses. A lease
    /// whose holder outlived `ttl` is taken over.
    pub fn acquire(
        tree: &sled::Tree,
        chain: &ChainKey,
        wait: Duration,
        ttl: Duration,
    ) -> Result<Self, ChainError> {
        let key = chain.storage_prefix();
        let owner = uuid7().to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let started = Instant::now();
        let mut backoff = Duration::from_millis(1);

        loop {
            let now_ms = Utc::now().timestamp_millis();
            let record = minicbor::to_vec(LeaseRecord {
                owner: owner.clone(),
                expires_at_ms: now_ms.saturating_add(ttl_ms),
            })?;

            let current = tree.get(&key)?;
            let expired = match &current {
                Some(raw) => {
                    let held: LeaseRecord = minicbor::decode(raw)?;
                    held.expires_at_ms <= now_ms
                }
                None => false,
            };

            if current.is_none() || expired {
                if tree
                    .compare_and_swap(&key, current.as_ref(), Some(record.clone()))?
                    .is_ok()
                {
                    if expired {
                        warn!(chain = %chain, "took over expired chain lease");
                    }
                    debug!(chain = %chain, owner = %owner, "chain lease acquired");
                    return Ok(Self {
                        tree: tree.clone(),
                        key,
                        record,
                        chain: chain.to_string(),
                    });
                }
                // lost the race, retry at once
                continue;
            }

            if started.elapsed() >= wait {
                return Err(ChainError::SigningUnavailable(format!(
                    "timed out waiting for the lease on chain {chain}"
                )));
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl Drop for ChainLease {
    fn drop(&mut self) {
        match self
            .tree
            .compare_and_swap(&self.key, Some(&self.record), None::<&[u8]>)
        {
            Ok(Ok(())) => debug!(chain = %self.chain, "chain lease released"),
            Ok(Err(_)) => warn!(chain = %self.chain, "chain lease was taken over before release"),
            Err(err) => warn!(chain = %self.chain, error = %err, "failed to release chain lease"),
        }
    }
}
