//! Reference-counted brick texture cache with LRU eviction under a byte budget.

use serde::Serialize;
use std::collections::HashMap;

use super::key::BrickKey;
use super::texture::{TextureBackend, TextureDesc, TextureFormat, TextureHandle};
use crate::dataset::{BrickSource, DatasetId};
use crate::util::{Error, Result};

/// Counters since the cache was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub uploads: u64,
    pub evictions: u64,
    /// Misses refused because referenced entries left no room.
    pub exhausted: u64,
    pub entries: usize,
    pub resident_bytes: u64,
    pub referenced_bytes: u64,
    pub budget_bytes: u64,
}

struct Entry<T> {
    handle: TextureHandle,
    texture: T,
    byte_size: u64,
    ref_count: u32,
    last_used: u64,
}

/// Maps brick keys to uploaded textures.
///
/// Entries with references are never evicted. Entries released to zero
/// references stay resident until space is needed, so the next frame can
/// reuse them.
pub struct BrickCache<B: TextureBackend> {
    backend: B,
    budget: u64,
    entries: HashMap<BrickKey, Entry<B::Texture>>,
    handles: HashMap<TextureHandle, BrickKey>,
    next_handle: u64,
    tick: u64,
    resident: u64,
    referenced: u64,
    stats: CacheStats,
}

impl<B: TextureBackend> BrickCache<B> {
    pub fn new(backend: B, budget_bytes: u64) -> Self {
        Self {
            backend,
            budget: budget_bytes,
            entries: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
            tick: 0,
            resident: 0,
            referenced: 0,
            stats: CacheStats::default(),
        }
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[inline]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Change the budget, evicting unreferenced entries that no longer fit.
    pub fn set_budget(&mut self, budget_bytes: u64) {
        self.budget = budget_bytes;
        while self.resident > self.budget && self.evict_one() {}
    }

    #[inline]
    pub fn resident_bytes(&self) -> u64 {
        self.resident
    }

    #[inline]
    pub fn referenced_bytes(&self) -> u64 {
        self.referenced
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &BrickKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            resident_bytes: self.resident,
            referenced_bytes: self.referenced,
            budget_bytes: self.budget,
            ..self.stats
        }
    }

    /// Texture behind a live handle.
    pub fn texture(&self, handle: TextureHandle) -> Option<&B::Texture> {
        let key = self.handles.get(&handle)?;
        self.entries.get(key).map(|e| &e.texture)
    }

    /// Current reference count of a live handle.
    pub fn ref_count(&self, handle: TextureHandle) -> Option<u32> {
        let key = self.handles.get(&handle)?;
        self.entries.get(key).map(|e| e.ref_count)
    }

    /// Texture for a brick, loading and uploading it on a miss.
    ///
    /// A hit adds a reference to the existing entry. A miss reads the brick,
    /// evicts unreferenced entries in least-recently-used order until it fits,
    /// uploads it and drops the sample buffer. If the brick cannot fit even
    /// after evicting everything unreferenced, nothing is evicted and
    /// [`Error::CacheExhausted`] is returned.
    pub fn acquire(&mut self, source: &dyn BrickSource, lod: &[u64], brick: &[u64]) -> Result<TextureHandle> {
        self.tick += 1;
        let key = BrickKey::new(source.dataset_id(), lod, brick);

        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.ref_count == 0 {
                self.referenced += entry.byte_size;
            }
            entry.ref_count += 1;
            entry.last_used = self.tick;
            self.stats.hits += 1;
            tracing::trace!(%key, handle = %entry.handle, refs = entry.ref_count, "cache hit");
            return Ok(entry.handle);
        }

        self.stats.misses += 1;
        let format = TextureFormat::from_element(source.bit_width(), source.component_count())?;
        let voxels = source.brick_voxels(lod, brick)?;
        let desc = TextureDesc { extent: texture_extent(&voxels)?, format, label: key.to_string() };
        let size = self.backend.footprint(&desc);

        let available = self.budget.saturating_sub(self.referenced);
        if size > available {
            self.stats.exhausted += 1;
            tracing::debug!(%key, requested = size, available, "cache exhausted");
            return Err(Error::CacheExhausted { requested: size, available });
        }

        let data = source.read_brick(lod, brick)?;
        while self.resident + size > self.budget {
            if !self.evict_one() {
                break;
            }
        }
        let texture = self.backend.create_texture_3d(&desc, &data)?;
        drop(data);

        let handle = TextureHandle(self.next_handle);
        self.next_handle += 1;
        self.resident += size;
        self.referenced += size;
        self.stats.uploads += 1;
        tracing::debug!(%key, %handle, bytes = size, resident = self.resident, "uploaded brick");

        self.handles.insert(handle, key.clone());
        self.entries.insert(
            key,
            Entry { handle, texture, byte_size: size, ref_count: 1, last_used: self.tick },
        );
        Ok(handle)
    }

    /// Drop one reference. The entry stays resident at zero references.
    pub fn release(&mut self, handle: TextureHandle) -> Result<()> {
        let entry = self
            .handles
            .get(&handle)
            .and_then(|key| self.entries.get_mut(key))
            .ok_or(Error::InvalidHandle(handle.value()))?;
        if entry.ref_count == 0 {
            return Err(Error::InvalidHandle(handle.value()));
        }
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            self.referenced -= entry.byte_size;
        }
        Ok(())
    }

    /// Remove every entry of `dataset`, referenced or not. Returns the count.
    pub fn invalidate(&mut self, dataset: DatasetId) -> usize {
        let keys: Vec<BrickKey> = self.entries.keys().filter(|k| k.dataset == dataset).cloned().collect();
        for key in &keys {
            self.remove(key);
        }
        if !keys.is_empty() {
            tracing::debug!(%dataset, removed = keys.len(), "invalidated dataset");
        }
        keys.len()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        let keys: Vec<BrickKey> = self.entries.keys().cloned().collect();
        for key in &keys {
            self.remove(key);
        }
    }

    /// Evict the least recently used unreferenced entry, if any.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| e.ref_count == 0)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                tracing::debug!(%key, "evicting brick");
                self.remove(&key);
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: &BrickKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.handles.remove(&entry.handle);
            self.resident -= entry.byte_size;
            if entry.ref_count > 0 {
                self.referenced -= entry.byte_size;
            }
            self.backend.destroy_texture(entry.texture);
        }
    }
}

impl<B: TextureBackend> Drop for BrickCache<B> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<B: TextureBackend> std::fmt::Debug for BrickCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrickCache")
            .field("entries", &self.entries.len())
            .field("resident", &self.resident)
            .field("referenced", &self.referenced)
            .field("budget", &self.budget)
            .finish()
    }
}

/// 3-D texture extent of a brick; missing axes are 1, extra axes must be 1.
fn texture_extent(voxels: &[u64]) -> Result<[u32; 3]> {
    if voxels.iter().skip(3).any(|&n| n != 1) {
        return Err(Error::unsupported(format!(
            "brick {:?} does not fit a 3-D texture",
            voxels
        )));
    }
    let mut extent = [1u32; 3];
    for (dst, &n) in extent.iter_mut().zip(voxels) {
        *dst = u32::try_from(n).map_err(|_| Error::unsupported(format!("brick axis of {} voxels", n)))?;
    }
    Ok(extent)
}
