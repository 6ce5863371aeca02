use std::{hash::BuildHasher, num::NonZeroUsize, sync::Arc};

use ahash::RandomState;
use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;

use codec::{
    message::{Args, Kwargs},
    value::canonical_key,
};

use crate::error::BridgeError;

/// Shard count. A power of two, so shard selection is a mask.
pub const SHARD_COUNT: usize = 16;

/// Default total number of resident instances across all shards.
pub const DEFAULT_CAPACITY: usize = 128;

/// Canonical cache key derived from one constructor argument set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey(Box<[u8]>);

impl InstanceKey {
    pub fn new(ctor_args: &Args, ctor_kwargs: &Kwargs) -> Result<Self, BridgeError> {
        canonical_key(ctor_args, ctor_kwargs)
            .map(|bytes| Self(bytes.into_boxed_slice()))
            .map_err(|_| {
                BridgeError::Arg(
                    "constructor arguments contain a value that cannot key the cache".to_string(),
                )
            })
    }
}

/// A sharded LRU of constructed target instances.
///
/// Each shard owns its own mutex and its own recency order, so
/// concurrent invocations with different keys rarely contend.
/// Constructors run outside the shard lock: two racing misses on one
/// key may construct twice, and the insert that lands last wins.
pub struct ShardedCache<T> {
    shards: Box<[Mutex<LruCache<InstanceKey, Arc<T>>>]>,
    hasher: RandomState,
    mask: usize,
}

impl<T> ShardedCache<T> {
    pub fn new(total_capacity: usize) -> Self {
        Self::with_shards(SHARD_COUNT, total_capacity)
    }

    /// Invariant: `shards` is a power of two.
    pub fn with_shards(shards: usize, total_capacity: usize) -> Self {
        debug_assert!(shards.is_power_of_two());

        let per_shard = NonZeroUsize::new(total_capacity.div_ceil(shards).max(1))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            hasher: RandomState::new(),
            mask: shards - 1,
        }
    }

    /// Fetch the instance for `key`, constructing it on a miss.
    ///
    /// A hit refreshes the key's recency. A failed constructor leaves
    /// the shard untouched.
    pub fn get_or_create<F>(&self, key: InstanceKey, ctor: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let shard = &self.shards[(self.hasher.hash_one(&key) as usize) & self.mask];
        if let Some(hit) = shard.lock().get(&key) {
            return Ok(hit.clone());
        }

        let instance = Arc::new(ctor()?);
        shard.lock().put(key, instance.clone());
        Ok(instance)
    }

    /// Number of resident instances across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
