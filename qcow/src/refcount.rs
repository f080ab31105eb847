// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io;

use remain::sorted;
use thiserror::Error;

use crate::qcow_raw_file::QcowRawFile;
use crate::vec_cache::{CacheMap, Cacheable, VecCache};

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    /// Error writing a refblock from the cache to disk.
    #[error("Failed to write a refblock from the cache to disk")]
    EvictingRefCounts(#[source] io::Error),
    /// Address requested isn't within the range of the disk.
    #[error("Address requested is not within the range of the disk")]
    InvalidIndex,
    /// Handle this error by reading the cluster and calling the function again.
    #[error("Cluster with addr={0} needs to be read")]
    NeedCluster(u64),
    /// Handle this error by allocating a cluster and calling the function again.
    #[error("New cluster needs to be allocated for refcounts")]
    NeedNewCluster,
    /// Error reading the file in to the refcount cache.
    #[error("Failed to read the file into the refcount cache")]
    ReadingRefCounts(#[source] io::Error),
    /// A refcount table entry points inside a cluster instead of at its start.
    #[error("Refblock at {0:#x} is not cluster aligned")]
    RefblockUnaligned(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Represents the refcount entries for an open qcow file.
#[derive(Clone, Debug)]
pub struct RefCount {
    ref_table: VecCache<u64>,
    refcount_table_offset: u64,
    refblock_cache: CacheMap<VecCache<u16>>,
    refcount_block_entries: u64, // number of refcounts in a cluster.
    cluster_size: u64,
    max_valid_cluster_offset: u64,
}

impl RefCount {
    /// Creates a `RefCount` from `file`, reading the refcount table from `refcount_table_offset`.
    /// `refcount_table_entries` specifies the number of refcount blocks used by this image.
    /// `refcount_block_entries` indicates the number of refcounts in each refcount block.
    /// Each refcount table entry points to a refcount block.
    pub fn new(
        raw_file: &QcowRawFile,
        refcount_table_offset: u64,
        refcount_table_entries: u64,
        refcount_block_entries: u64,
        cluster_size: u64,
    ) -> io::Result<RefCount> {
        let ref_table = VecCache::from_vec(raw_file.read_pointer_table(
            refcount_table_offset,
            refcount_table_entries,
            None,
        )?);
        Ok(Self::with_table(
            ref_table,
            refcount_table_offset,
            refcount_block_entries,
            cluster_size,
        ))
    }

    fn with_table(
        ref_table: VecCache<u64>,
        refcount_table_offset: u64,
        refcount_block_entries: u64,
        cluster_size: u64,
    ) -> RefCount {
        let max_valid_cluster_index = (ref_table.len() as u64) * refcount_block_entries - 1;
        let max_valid_cluster_offset = max_valid_cluster_index * cluster_size;
        RefCount {
            ref_table,
            refcount_table_offset,
            refblock_cache: CacheMap::new(50),
            refcount_block_entries,
            cluster_size,
            max_valid_cluster_offset,
        }
    }

    /// Returns the number of refcounts per block.
    pub fn refcounts_per_block(&self) -> u64 {
        self.refcount_block_entries
    }

    /// Returns the maximum valid cluster offset in the raw file for this refcount table.
    pub fn max_valid_cluster_offset(&self) -> u64 {
        self.max_valid_cluster_offset
    }

    /// Moves the refcount table to `new_offset` with room for `entries` refcount blocks. The
    /// existing block addresses are kept and the whole table is written by the next
    /// `flush_table()`.
    pub fn relocate_table(&mut self, new_offset: u64, entries: u64) {
        let mut table = self.ref_table.get_values().to_vec();
        table.resize(entries as usize, 0);
        self.ref_table = VecCache::from_vec(table);
        self.ref_table.mark_dirty();
        self.refcount_table_offset = new_offset;
        self.max_valid_cluster_offset =
            (entries * self.refcount_block_entries - 1) * self.cluster_size;
    }

    /// Returns `NeedNewCluster` if a new cluster needs to be allocated for refcounts. If an
    /// existing cluster needs to be read, `NeedCluster(addr)` is returned. The Caller should
    /// allocate a cluster or read the required one and call this function again with the cluster.
    /// On success, an optional address of a dropped cluster is returned. The dropped cluster can
    /// be reused for other purposes.
    pub fn set_cluster_refcount(
        &mut self,
        raw_file: &QcowRawFile,
        cluster_address: u64,
        refcount: u16,
        mut new_cluster: Option<(u64, VecCache<u16>)>,
    ) -> Result<Option<u64>> {
        let (table_index, block_index) = self.get_refcount_index(cluster_address);

        let block_addr_disk = *self.ref_table.get(table_index).ok_or(Error::InvalidIndex)?;

        // Fill the cache if this block isn't yet there.
        if !self.refblock_cache.contains_key(table_index) {
            // Need a new cluster
            if let Some((addr, table)) = new_cluster.take() {
                self.ref_table[table_index] = addr;
                let ref_table = &self.ref_table;
                self.refblock_cache
                    .insert(table_index, table, |index, evicted| {
                        raw_file.write_refcount_block(ref_table[index], evicted.get_values())
                    })
                    .map_err(Error::EvictingRefCounts)?;
            } else {
                if block_addr_disk == 0 {
                    return Err(Error::NeedNewCluster);
                }
                if raw_file.cluster_offset(block_addr_disk) != 0 {
                    return Err(Error::RefblockUnaligned(block_addr_disk));
                }
                return Err(Error::NeedCluster(block_addr_disk));
            }
        }

        // Unwrap is safe here as the entry was filled directly above.
        let dropped_cluster = if !self.refblock_cache.get(table_index).unwrap().dirty() {
            // Free the previously used block and use a new one. Writing modified counts to new
            // blocks keeps the on-disk state consistent even if it's out of date.
            if let Some((addr, _)) = new_cluster.take() {
                self.ref_table[table_index] = addr;
                Some(block_addr_disk)
            } else {
                return Err(Error::NeedNewCluster);
            }
        } else {
            None
        };

        self.refblock_cache.get_mut(table_index).unwrap()[block_index] = refcount;
        Ok(dropped_cluster)
    }

    /// Flush the dirty refcount blocks. This must be done before flushing the table that points to
    /// the blocks.
    pub fn flush_blocks(&mut self, raw_file: &QcowRawFile) -> io::Result<bool> {
        let mut flushed = false;
        for (table_index, block) in self.refblock_cache.iter_mut().filter(|(_k, v)| v.dirty()) {
            let addr = self.ref_table[*table_index];
            if addr == 0 {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            raw_file.write_refcount_block(addr, block.get_values())?;
            block.mark_clean();
            flushed = true;
        }
        Ok(flushed)
    }

    /// Flush the refcount table that keeps the address of the refcounts blocks.
    /// Returns true if the table changed since the previous `flush_table()` call.
    pub fn flush_table(&mut self, raw_file: &QcowRawFile) -> io::Result<bool> {
        if self.ref_table.dirty() {
            raw_file
                .write_pointer_table_direct(self.refcount_table_offset, self.ref_table.get_values())?;
            self.ref_table.mark_clean();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Returns true if any block or the table itself has changes that are not on disk.
    pub fn is_dirty(&mut self) -> bool {
        self.ref_table.dirty() || self.refblock_cache.iter_mut().any(|(_k, v)| v.dirty())
    }

    /// Gets the refcount for a cluster with the given address.
    pub fn get_cluster_refcount(&mut self, raw_file: &QcowRawFile, address: u64) -> Result<u16> {
        let (table_index, block_index) = self.get_refcount_index(address);
        match self.cached_block(raw_file, table_index)? {
            Some(block) => Ok(block[block_index]),
            None => Ok(0),
        }
    }

    /// Returns the refcount table for this file.
    pub fn ref_table(&self) -> &[u64] {
        self.ref_table.get_values()
    }

    /// Returns the refcounts stored in the given block.
    pub fn refcount_block(
        &mut self,
        raw_file: &QcowRawFile,
        table_index: usize,
    ) -> Result<Option<&[u16]>> {
        Ok(self
            .cached_block(raw_file, table_index)?
            .map(|block| block.get_values()))
    }

    // Loads the block at `table_index` in the cache, `None` if it isn't allocated.
    fn cached_block(
        &mut self,
        raw_file: &QcowRawFile,
        table_index: usize,
    ) -> Result<Option<&VecCache<u16>>> {
        let block_addr_disk = *self.ref_table.get(table_index).ok_or(Error::InvalidIndex)?;
        if block_addr_disk == 0 {
            return Ok(None);
        }
        if raw_file.cluster_offset(block_addr_disk) != 0 {
            return Err(Error::RefblockUnaligned(block_addr_disk));
        }
        if !self.refblock_cache.contains_key(table_index) {
            let table = VecCache::from_vec(
                raw_file
                    .read_refcount_block(block_addr_disk)
                    .map_err(Error::ReadingRefCounts)?,
            );
            let ref_table = &self.ref_table;
            self.refblock_cache
                .insert(table_index, table, |index, evicted| {
                    raw_file.write_refcount_block(ref_table[index], evicted.get_values())
                })
                .map_err(Error::EvictingRefCounts)?;
        }
        // The index must exist as it was just inserted if it didn't already.
        Ok(self.refblock_cache.get(table_index))
    }

    // Gets the address of the refcount block and the index into the block for the given address.
    fn get_refcount_index(&self, address: u64) -> (usize, usize) {
        let block_index = (address / self.cluster_size) % self.refcount_block_entries;
        let refcount_table_index = (address / self.cluster_size) / self.refcount_block_entries;
        (refcount_table_index as usize, block_index as usize)
    }
}
