//! Duplicate request cache for datagram servers.
//!
//! Datagram clients retransmit when a reply is slow or lost. A server that
//! re-executed every retransmission would break non-idempotent procedures,
//! so the last `N` replies are kept and replayed verbatim when the same call
//! shows up again.
//!
//! Entries live in two structures: hash chains indexed by
//! `xid % (N * SPARSENESS)` for lookup, and a FIFO of keys that fixes the
//! eviction order.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::config::DuplicateKeyMode;
use crate::message::CallHeader;

/// Hash chains per cached entry.
pub const SPARSENESS: usize = 4;

/// Identity of a call as seen by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateKey {
    /// Transaction id.
    pub xid: u32,
    /// Procedure number.
    pub proc: u32,
    /// Program version.
    pub vers: u32,
    /// Program number.
    pub prog: u32,
    /// Address the call came from.
    pub client: SocketAddr,
    /// SHA-256 of the request, present in `CallIdentityAndDigest` mode.
    pub digest: Option<[u8; 32]>,
}

impl DuplicateKey {
    /// Derives the key of a call under the given mode.
    pub fn new(
        header: &CallHeader,
        client: SocketAddr,
        request: &[u8],
        mode: DuplicateKeyMode,
    ) -> Self {
        let digest = match mode {
            DuplicateKeyMode::CallIdentity => None,
            DuplicateKeyMode::CallIdentityAndDigest => {
                let mut digest = [0u8; 32];
                digest.copy_from_slice(&Sha256::digest(request));
                Some(digest)
            }
        };
        Self {
            xid: header.xid,
            proc: header.proc,
            vers: header.vers,
            prog: header.prog,
            client,
            digest,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    key: DuplicateKey,
    reply: Bytes,
}

/// Counters reported by [`DuplicateCache::stats`].
#[derive(Debug, Clone, Default)]
pub struct DuplicateCacheStats {
    /// Lookups that returned a cached reply.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Replies stored.
    pub insertions: u64,
    /// Replies dropped to make room.
    pub evictions: u64,
    /// Replies currently held.
    pub current_entries: usize,
}

impl DuplicateCacheStats {
    /// Fraction of lookups answered from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded FIFO cache of recent replies.
#[derive(Debug)]
pub struct DuplicateCache {
    capacity: usize,
    mode: DuplicateKeyMode,
    chains: Vec<Vec<CacheEntry>>,
    fifo: VecDeque<DuplicateKey>,
    stats: DuplicateCacheStats,
}

impl DuplicateCache {
    /// Creates a cache holding up to `capacity` replies. A capacity of zero
    /// disables caching.
    pub fn new(capacity: usize, mode: DuplicateKeyMode) -> Self {
        let chains = (0..capacity.saturating_mul(SPARSENESS))
            .map(|_| Vec::new())
            .collect();
        Self {
            capacity,
            mode,
            chains,
            fifo: VecDeque::with_capacity(capacity),
            stats: DuplicateCacheStats::default(),
        }
    }

    /// Maximum number of cached replies.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Key mode in effect.
    pub fn mode(&self) -> DuplicateKeyMode {
        self.mode
    }

    /// Number of cached replies.
    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    /// Returns the cached reply for a retransmitted call, if any.
    pub fn lookup(
        &mut self,
        header: &CallHeader,
        client: SocketAddr,
        request: &[u8],
    ) -> Option<Bytes> {
        if self.capacity == 0 {
            return None;
        }
        let key = DuplicateKey::new(header, client, request, self.mode);
        let found = self.chains[self.chain_of(key.xid)]
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.reply.clone());
        match found {
            Some(reply) => {
                self.stats.hits += 1;
                trace!(xid = key.xid, %client, "duplicate cache hit");
                Some(reply)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Remembers the reply to a call, evicting the oldest entry when full.
    /// A call that is already cached keeps its first reply; the return value
    /// says whether anything was stored.
    pub fn insert(
        &mut self,
        header: &CallHeader,
        client: SocketAddr,
        request: &[u8],
        reply: Bytes,
    ) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let key = DuplicateKey::new(header, client, request, self.mode);
        let chain = self.chain_of(key.xid);
        if self.chains[chain].iter().any(|entry| entry.key == key) {
            return false;
        }
        if self.fifo.len() >= self.capacity {
            self.evict_oldest();
        }
        self.chains[chain].push(CacheEntry { key, reply });
        self.fifo.push_back(key);
        self.stats.insertions += 1;
        true
    }

    fn evict_oldest(&mut self) {
        let Some(oldest) = self.fifo.pop_front() else {
            return;
        };
        let chain = self.chain_of(oldest.xid);
        if let Some(pos) = self.chains[chain].iter().position(|e| e.key == oldest) {
            self.chains[chain].swap_remove(pos);
            self.stats.evictions += 1;
        }
    }

    fn chain_of(&self, xid: u32) -> usize {
        xid as usize % self.chains.len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DuplicateCacheStats {
        DuplicateCacheStats {
            current_entries: self.fifo.len(),
            ..self.stats.clone()
        }
    }
}

/// A [`DuplicateCache`] behind a single lock, shared by every task serving
/// one datagram socket.
#[derive(Debug)]
pub struct SharedDuplicateCache {
    inner: Mutex<DuplicateCache>,
}

impl SharedDuplicateCache {
    /// Wraps a new cache.
    pub fn new(capacity: usize, mode: DuplicateKeyMode) -> Self {
        Self {
            inner: Mutex::new(DuplicateCache::new(capacity, mode)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut DuplicateCache) -> R) -> R {
        let mut cache = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut cache)
    }

    /// See [`DuplicateCache::lookup`].
    pub fn lookup(
        &self,
        header: &CallHeader,
        client: SocketAddr,
        request: &[u8],
    ) -> Option<Bytes> {
        self.with(|cache| cache.lookup(header, client, request))
    }

    /// See [`DuplicateCache::insert`].
    pub fn insert(
        &self,
        header: &CallHeader,
        client: SocketAddr,
        request: &[u8],
        reply: Bytes,
    ) -> bool {
        self.with(|cache| cache.insert(header, client, request, reply))
    }

    /// See [`DuplicateCache::stats`].
    pub fn stats(&self) -> DuplicateCacheStats {
        self.with(|cache| cache.stats())
    }

    /// Number of cached replies.
    pub fn len(&self) -> usize {
        self.with(|cache| cache.len())
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.with(|cache| cache.is_empty())
    }
}
