// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! The qcow2 allocator: maps guest clusters to clusters of the image file.

use std::cmp::{max, min};
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::sync::Mutex;

use libc::{EINVAL, ENOSPC};
use log::{debug, error, warn};

use crate::chain::BackingFile;
use crate::header::{
    offset_is_cluster_boundary, QcowHeader, DEFAULT_REFCOUNT_ORDER, MAX_RAM_POINTER_TABLE_SIZE,
};
use crate::qcow_raw_file::QcowRawFile;
use crate::refcount::{self, RefCount};
use crate::tables::{
    div_round_up_u64, l1_entry_make, l2_entry_is_compressed, l2_entry_is_empty, l2_entry_is_zero,
    l2_entry_make_std, l2_entry_std_cluster_addr, L1_TABLE_OFFSET_MASK,
};
use crate::vec_cache::{CacheMap, Cacheable, VecCache};
use crate::{Error, FormatError, LogicalRead, ResourceError, Result};

// Out of space is a resource error, anything else keeps the context it happened in.
fn io_error(e: io::Error, context: fn(io::Error) -> Error) -> Error {
    if e.raw_os_error() == Some(ENOSPC) {
        ResourceError::NoSpace.into()
    } else {
        context(e)
    }
}

// A metadata table that runs past the end of the file means the image was cut short.
fn metadata_read_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FormatError::Truncated.into()
    } else {
        Error::ReadingMetadata(e)
    }
}

fn refcount_error(e: refcount::Error) -> Error {
    match e {
        refcount::Error::EvictingRefCounts(e) => io_error(e, Error::WritingMetadata),
        refcount::Error::ReadingRefCounts(e) => metadata_read_error(e),
        refcount::Error::RefblockUnaligned(addr) => FormatError::MisalignedCluster(addr).into(),
        e => Error::ReadingMetadata(io::Error::new(io::ErrorKind::InvalidData, e)),
    }
}

// Where the guest cluster containing an address lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClusterLocation {
    // Not allocated in this image: the backing file, or zeros without one.
    Unallocated,
    // Reads as zeros regardless of the backing file.
    Zero,
    // Stored in the image file at this cluster address.
    Data(u64),
}

/// Result of walking every table of an image and comparing the references found with the
/// stored refcounts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Clusters in the image file.
    pub total_clusters: u64,
    /// Guest clusters with data stored in the image itself.
    pub allocated_clusters: u64,
    /// Clusters with a refcount that nothing references.
    pub leaked_clusters: u64,
    /// Clusters whose refcount does not match the number of references to them.
    pub corruptions: u64,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.leaked_clusters == 0 && self.corruptions == 0
    }
}

/// Represents a qcow2 file. This is a sparse file format maintained by the qemu project.
/// Full documentation of the format can be found in the qemu repository.
///
/// Reads take a shared reference so many readers can work on one image. Writes take a mutable
/// reference and commit their metadata before returning.
#[derive(Debug)]
pub struct QcowFile {
    raw_file: QcowRawFile,
    header: QcowHeader,
    l1_table: VecCache<u64>,
    l2_entries: u64,
    l2_cache: Mutex<CacheMap<VecCache<u64>>>,
    refcounts: RefCount,
    unref_clusters: Vec<u64>, // List of freshly unreferenced clusters.
    // List of unreferenced clusters available to be used. unref clusters become available once the
    // removal of references to them have been synced to disk.
    avail_clusters: Vec<u64>,
    backing_file: Option<BackingFile>,
    writable: bool,
}

impl QcowFile {
    /// Opens the qcow2 image in `file`. The backing file, if any, is attached separately with
    /// `set_backing_file`.
    pub fn from(file: File, writable: bool) -> Result<QcowFile> {
        let mut qcow = Self::open(file, writable)?;
        if writable {
            qcow.find_avail_clusters()?;
        }
        Ok(qcow)
    }

    fn open(file: File, writable: bool) -> Result<QcowFile> {
        let header = QcowHeader::read_from(&file)?;

        if header.is_dirty() {
            if writable {
                return Err(FormatError::DirtyImage.into());
            }
            warn!("qcow2 image was not closed cleanly, opening it read-only");
        }

        // Make sure that the L1 table fits in RAM.
        if u64::from(header.l1_size) > MAX_RAM_POINTER_TABLE_SIZE {
            return Err(FormatError::InvalidL1TableSize(u64::from(header.l1_size)).into());
        }

        let cluster_size = header.cluster_size();

        // Need at least one refcount cluster
        if header.refcount_table_clusters == 0 {
            return Err(FormatError::NoRefcountClusters.into());
        }
        if header.refcount_table_offset == 0 || (header.l1_size != 0 && header.l1_table_offset == 0)
        {
            return Err(FormatError::HeaderOverlap(0).into());
        }
        offset_is_cluster_boundary(header.l1_table_offset, header.cluster_bits)?;
        offset_is_cluster_boundary(header.snapshots_offset, header.cluster_bits)?;
        // refcount table must be a cluster boundary, and within the file's virtual or actual size.
        offset_is_cluster_boundary(header.refcount_table_offset, header.cluster_bits)?;
        let file_size = file.metadata().map_err(Error::GettingFileSize)?.len();
        if header.refcount_table_offset > max(file_size, header.size) {
            return Err(FormatError::RefcountTableOffEnd.into());
        }

        let entries_per_cluster = cluster_size / size_of::<u64>() as u64;
        let num_clusters = div_round_up_u64(header.size, cluster_size);
        let num_l2_clusters = div_round_up_u64(num_clusters, entries_per_cluster);
        if u64::from(header.l1_size) < num_l2_clusters {
            return Err(FormatError::InvalidL1TableSize(u64::from(header.l1_size)).into());
        }
        let refcount_table_entries =
            u64::from(header.refcount_table_clusters) * cluster_size / size_of::<u64>() as u64;
        if refcount_table_entries > MAX_RAM_POINTER_TABLE_SIZE {
            return Err(FormatError::InvalidRefcountTableSize(refcount_table_entries).into());
        }

        // Check that the L1 and refcount tables fit in a 64bit address space and in the file.
        let l1_table_end = header
            .l1_table_offset
            .checked_add(num_l2_clusters * size_of::<u64>() as u64)
            .ok_or(FormatError::InvalidOffset(header.l1_table_offset))?;
        let refcount_table_end = header
            .refcount_table_offset
            .checked_add(u64::from(header.refcount_table_clusters) * cluster_size)
            .ok_or(FormatError::InvalidOffset(header.refcount_table_offset))?;
        if l1_table_end > file_size || refcount_table_end > file_size {
            return Err(FormatError::Truncated.into());
        }

        let raw_file = QcowRawFile::from(file, cluster_size)
            .ok_or(FormatError::InvalidClusterBits(header.cluster_bits))?;
        let (l1_table, refcounts) = Self::load_tables(&raw_file, &header)?;

        Ok(QcowFile {
            raw_file,
            header,
            l1_table,
            l2_entries: entries_per_cluster,
            l2_cache: Mutex::new(CacheMap::new(100)),
            refcounts,
            unref_clusters: Vec::new(),
            avail_clusters: Vec::new(),
            backing_file: None,
            writable,
        })
    }

    // Reads the committed L1 table and refcount table.
    fn load_tables(raw_file: &QcowRawFile, header: &QcowHeader) -> Result<(VecCache<u64>, RefCount)> {
        let cluster_size = header.cluster_size();
        let num_clusters = div_round_up_u64(header.size, cluster_size);
        let num_l2_clusters = div_round_up_u64(num_clusters, cluster_size / size_of::<u64>() as u64);
        let l1_table = VecCache::from_vec(
            raw_file
                .read_pointer_table(
                    header.l1_table_offset,
                    num_l2_clusters,
                    Some(L1_TABLE_OFFSET_MASK),
                )
                .map_err(metadata_read_error)?,
        );

        let refcount_bits = 0x01u64 << DEFAULT_REFCOUNT_ORDER;
        let refcount_block_entries = cluster_size * 8 / refcount_bits;
        let refcounts = RefCount::new(
            raw_file,
            header.refcount_table_offset,
            u64::from(header.refcount_table_clusters) * cluster_size / size_of::<u64>() as u64,
            refcount_block_entries,
            cluster_size,
        )
        .map_err(metadata_read_error)?;

        Ok((l1_table, refcounts))
    }

    /// Creates a new image in `file` laid out as described by `header`. No data clusters are
    /// allocated, only the header, the L1 table, the refcount table and its first refcount block.
    pub fn create(file: File, header: &QcowHeader) -> Result<QcowFile> {
        header.write_to(&file)?;

        let mut qcow = Self::open(file, true)?;

        // Set the refcount for each metadata cluster, up to the end of the refcount table.
        let cluster_size = qcow.raw_file.cluster_size();
        let refcount_table_base = qcow.header.refcount_table_offset;
        let end_cluster_addr =
            refcount_table_base + u64::from(qcow.header.refcount_table_clusters) * cluster_size;

        let mut cluster_addr = 0;
        while cluster_addr < end_cluster_addr {
            qcow.set_cluster_refcount_track_freed(cluster_addr, 1)?;
            cluster_addr += cluster_size;
        }
        qcow.sync_caches()?;

        debug!(
            "Created qcow2 image: virtual size {} cluster size {}",
            qcow.header.size, cluster_size
        );
        Ok(qcow)
    }

    pub fn set_backing_file(&mut self, backing: Option<BackingFile>) {
        self.backing_file = backing;
    }

    pub fn backing_file(&self) -> Option<&BackingFile> {
        self.backing_file.as_ref()
    }

    /// Returns the `QcowHeader` for this file.
    pub fn header(&self) -> &QcowHeader {
        &self.header
    }

    /// Returns the L1 lookup table for this file.
    pub fn l1_table(&self) -> &[u64] {
        self.l1_table.get_values()
    }

    /// Returns the refcount table for this file.
    pub fn ref_table(&self) -> &[u64] {
        self.refcounts.ref_table()
    }

    pub fn file(&self) -> &File {
        self.raw_file.file()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn cluster_size(&self) -> u64 {
        self.raw_file.cluster_size()
    }

    // Gets the maximum virtual size of this image.
    pub fn virtual_size(&self) -> u64 {
        self.header.size
    }

    /// Returns true if the guest cluster containing `address` is allocated in this image, as data
    /// or as an explicit zero cluster.
    pub fn cluster_allocated(&self, address: u64) -> Result<bool> {
        self.check_range(address, 1)?;
        Ok(self.cluster_location(address)? != ClusterLocation::Unallocated)
    }

    /// Gets the refcount of the cluster at `address` in the image file.
    pub fn cluster_refcount(&mut self, address: u64) -> Result<u16> {
        self.refcounts
            .get_cluster_refcount(&self.raw_file, address)
            .map_err(refcount_error)
    }

    /// Reads the guest bytes at `offset` into `buf`. Clusters that are not allocated are read
    /// from the backing file, or as zeros without one.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;

        let mut nread: usize = 0;
        while nread < buf.len() {
            let curr_addr = offset + nread as u64;
            let count = self.limit_range_cluster(curr_addr, buf.len() - nread);
            let chunk = &mut buf[nread..(nread + count)];

            match self.cluster_location(curr_addr)? {
                ClusterLocation::Data(cluster_addr) => {
                    let start = cluster_addr + self.raw_file.cluster_offset(curr_addr);
                    self.raw_file.read_data(start, chunk).map_err(|e| {
                        if e.kind() == io::ErrorKind::UnexpectedEof {
                            FormatError::Truncated.into()
                        } else {
                            Error::ReadingData(e)
                        }
                    })?;
                }
                ClusterLocation::Unallocated => match &self.backing_file {
                    Some(backing) => backing.read_at(curr_addr, chunk)?,
                    // Previously unwritten region, return zeros
                    None => chunk.fill(0),
                },
                ClusterLocation::Zero => chunk.fill(0),
            }

            nread += count;
        }
        Ok(())
    }

    /// Writes `buf` at the guest `offset`, allocating clusters as needed, and commits the
    /// metadata. If allocation fails the image file is returned to its state before the call.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::NotWritable);
        }
        self.check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }

        let cluster_size = self.raw_file.cluster_size();
        let first_cluster = offset / cluster_size;
        let last_cluster = (offset + buf.len() as u64 - 1) / cluster_size;
        self.reserve_refcount_capacity(last_cluster - first_cluster + 1)?;

        let committed_len = self.raw_file.file_len().map_err(Error::GettingFileSize)?;
        if let Err(e) = self
            .write_clusters(offset, buf)
            .and_then(|()| self.sync_caches())
        {
            if matches!(e, Error::Resource(ResourceError::NoSpace)) {
                error!("Out of space writing {} bytes at {offset:#x}", buf.len());
            }
            if let Err(rollback_err) = self.rollback(committed_len) {
                error!("Failed to roll back image metadata: {rollback_err}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Commits all metadata and syncs the image file to storage.
    pub fn flush(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.sync_caches()?;
        self.raw_file
            .file()
            .sync_all()
            .map_err(Error::SyncingFile)
    }

    fn write_clusters(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let cluster_size = self.raw_file.cluster_size() as usize;
        let mut nwritten: usize = 0;
        while nwritten < buf.len() {
            let curr_addr = offset + nwritten as u64;
            let count = self.limit_range_cluster(curr_addr, buf.len() - nwritten);
            let host_offset = self.file_offset_write(curr_addr, count == cluster_size)?;
            self.raw_file
                .write_data(host_offset, &buf[nwritten..(nwritten + count)])
                .map_err(|e| io_error(e, Error::WritingData))?;
            nwritten += count;
        }
        Ok(())
    }

    // Returns the file to `committed_len` and drops every in-memory change that was not
    // committed.
    fn rollback(&mut self, committed_len: u64) -> Result<()> {
        self.raw_file
            .file()
            .set_len(committed_len)
            .map_err(Error::SettingFileSize)?;
        self.l2_cache.get_mut().unwrap().clear();
        let (l1_table, refcounts) = Self::load_tables(&self.raw_file, &self.header)?;
        self.l1_table = l1_table;
        self.refcounts = refcounts;
        self.unref_clusters.clear();
        self.avail_clusters.clear();
        self.find_avail_clusters()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.virtual_size() => Ok(()),
            _ => Err(Error::InvalidRange {
                offset,
                len: len as u64,
                size: self.virtual_size(),
            }),
        }
    }

    // Limits the range so that it doesn't overflow the end of a cluster.
    fn limit_range_cluster(&self, address: u64, count: usize) -> usize {
        let offset: u64 = self.raw_file.cluster_offset(address);
        let limit = self.raw_file.cluster_size() - offset;
        min(count as u64, limit) as usize
    }

    // Gets the offset of `address` in the L1 table.
    fn l1_table_index(&self, address: u64) -> u64 {
        (address / self.raw_file.cluster_size()) / self.l2_entries
    }

    // Gets the offset of `address` in the L2 table.
    fn l2_table_index(&self, address: u64) -> u64 {
        (address / self.raw_file.cluster_size()) % self.l2_entries
    }

    // Reads an L2 cluster from the disk.
    fn read_l2_cluster(&self, cluster_addr: u64) -> Result<Vec<u64>> {
        if self.raw_file.cluster_offset(cluster_addr) != 0 {
            return Err(FormatError::MisalignedCluster(cluster_addr).into());
        }
        self.raw_file
            .read_pointer_cluster(cluster_addr, None)
            .map_err(metadata_read_error)
    }

    fn cluster_location(&self, address: u64) -> Result<ClusterLocation> {
        let l1_index = self.l1_table_index(address) as usize;
        let l2_addr_disk = *self.l1_table.get(l1_index).ok_or(Error::InvalidRange {
            offset: address,
            len: 0,
            size: self.virtual_size(),
        })?;

        if l2_addr_disk == 0 {
            // The whole L2 table for this address is not allocated yet,
            // so the cluster must also be unallocated.
            return Ok(ClusterLocation::Unallocated);
        }

        let l2_index = self.l2_table_index(address) as usize;
        let l2_entry = {
            let mut l2_cache = self.l2_cache.lock().unwrap();
            if !l2_cache.contains_key(l1_index) {
                let table = VecCache::from_vec(self.read_l2_cluster(l2_addr_disk)?);
                let l1_table = &self.l1_table;
                let raw_file = &self.raw_file;
                l2_cache
                    .insert(l1_index, table, |index, evicted| {
                        raw_file.write_pointer_table_direct(l1_table[index], evicted.get_values())
                    })
                    .map_err(|e| io_error(e, Error::WritingMetadata))?;
            }
            // The index must exist as it was just inserted if it didn't already.
            l2_cache.get(l1_index).unwrap()[l2_index]
        };

        self.decode_l2_entry(address, l2_entry)
    }

    fn decode_l2_entry(&self, address: u64, l2_entry: u64) -> Result<ClusterLocation> {
        if l2_entry_is_empty(l2_entry) {
            return Ok(ClusterLocation::Unallocated);
        }
        if l2_entry_is_compressed(l2_entry) {
            return Err(FormatError::CompressedCluster(self.raw_file.cluster_address(address)).into());
        }
        let cluster_addr = l2_entry_std_cluster_addr(l2_entry);
        if cluster_addr != 0 {
            self.check_data_cluster(cluster_addr)?;
        }
        if l2_entry_is_zero(l2_entry) {
            return Ok(ClusterLocation::Zero);
        }
        if cluster_addr == 0 {
            return Ok(ClusterLocation::Unallocated);
        }
        Ok(ClusterLocation::Data(cluster_addr))
    }

    // Guest data lives in whole clusters of its own, inside the file.
    fn check_data_cluster(&self, cluster_addr: u64) -> Result<()> {
        if self.raw_file.cluster_offset(cluster_addr) != 0 {
            return Err(FormatError::MisalignedCluster(cluster_addr).into());
        }
        if self.overlaps_fixed_metadata(cluster_addr) {
            return Err(FormatError::HeaderOverlap(cluster_addr).into());
        }
        let file_len = self.raw_file.file_len().map_err(Error::GettingFileSize)?;
        if cluster_addr >= file_len {
            return Err(FormatError::Truncated.into());
        }
        Ok(())
    }

    // True if `cluster_addr` is the header cluster or holds part of the L1 or refcount table.
    fn overlaps_fixed_metadata(&self, cluster_addr: u64) -> bool {
        let cluster_size = self.raw_file.cluster_size();
        let l1_bytes = u64::from(self.header.l1_size) * size_of::<u64>() as u64;
        let l1_start = self.header.l1_table_offset;
        let l1_end = l1_start + div_round_up_u64(l1_bytes, cluster_size) * cluster_size;
        let refcount_start = self.header.refcount_table_offset;
        let refcount_end =
            refcount_start + u64::from(self.header.refcount_table_clusters) * cluster_size;
        cluster_addr < cluster_size
            || (l1_start..l1_end).contains(&cluster_addr)
            || (refcount_start..refcount_end).contains(&cluster_addr)
    }

    // Gets the offset of the given guest address in the host file. If L1, L2, or data clusters need
    // to be allocated, they will be. `whole_cluster` tells that the caller overwrites the full
    // cluster, so no backing data needs to be copied into a new one.
    fn file_offset_write(&mut self, address: u64, whole_cluster: bool) -> Result<u64> {
        let l1_index = self.l1_table_index(address) as usize;
        let l2_addr_disk = self.l1_table[l1_index];
        let l2_index = self.l2_table_index(address) as usize;

        let mut set_refcounts = Vec::new();

        if let Some(new_addr) = self.cache_l2_cluster(l1_index, l2_addr_disk, true)? {
            // The cluster refcount starts at one meaning it is used but doesn't need COW.
            set_refcounts.push((new_addr, 1));
        }

        let l2_entry = self.l2_cache.get_mut().unwrap().get(l1_index).unwrap()[l2_index];
        let cluster_addr = match self.decode_l2_entry(address, l2_entry)? {
            ClusterLocation::Data(cluster_addr) => cluster_addr,
            ClusterLocation::Zero if l2_entry_std_cluster_addr(l2_entry) != 0 => {
                // Preallocated zero cluster, clear it and drop the zero flag.
                let cluster_addr = l2_entry_std_cluster_addr(l2_entry);
                self.raw_file
                    .zero_cluster(cluster_addr)
                    .map_err(|e| io_error(e, Error::WritingData))?;
                self.update_cluster_addr(l1_index, l2_index, cluster_addr, &mut set_refcounts)?;
                cluster_addr
            }
            location => {
                let initial_data = match (&self.backing_file, location, whole_cluster) {
                    (Some(backing), ClusterLocation::Unallocated, false) => {
                        let cluster_size = self.raw_file.cluster_size();
                        let cluster_begin = self.raw_file.cluster_address(address);
                        let mut cluster_data = vec![0u8; cluster_size as usize];
                        backing.read_at(cluster_begin, &mut cluster_data)?;
                        Some(cluster_data)
                    }
                    _ => None,
                };
                // Need to allocate a data cluster
                let cluster_addr = self.append_data_cluster(initial_data.as_deref())?;
                self.update_cluster_addr(l1_index, l2_index, cluster_addr, &mut set_refcounts)?;
                cluster_addr
            }
        };

        for (addr, count) in set_refcounts {
            self.set_cluster_refcount_track_freed(addr, count)?;
        }

        Ok(cluster_addr + self.raw_file.cluster_offset(address))
    }

    // Updates the l1 and l2 tables to point to the new `cluster_addr`.
    fn update_cluster_addr(
        &mut self,
        l1_index: usize,
        l2_index: usize,
        cluster_addr: u64,
        set_refcounts: &mut Vec<(u64, u16)>,
    ) -> Result<()> {
        if !self
            .l2_cache
            .get_mut()
            .unwrap()
            .get(l1_index)
            .unwrap()
            .dirty()
        {
            // Free the previously used cluster if one exists. Modified tables are always
            // written to new clusters so the L1 table can be committed to disk after they
            // are and L1 never points at an invalid table.
            let addr = self.l1_table[l1_index];
            if addr != 0 {
                self.unref_clusters.push(addr);
                set_refcounts.push((addr, 0));
            }

            // Allocate a new cluster to store the L2 table and update the L1 table to point
            // to the new table. The cluster will be written when the cache is flushed, no
            // need to copy the data now.
            let new_addr: u64 = self.get_new_cluster(None)?;
            // The cluster refcount starts at one indicating it is used but doesn't need
            // COW.
            set_refcounts.push((new_addr, 1));
            self.l1_table[l1_index] = new_addr;
        }
        // 'unwrap' is OK because it was just added.
        self.l2_cache
            .get_mut()
            .unwrap()
            .get_mut(l1_index)
            .unwrap()[l2_index] = l2_entry_make_std(cluster_addr);
        Ok(())
    }

    // Allocate a new cluster and return its offset within the raw file.
    fn get_new_cluster(&mut self, initial_data: Option<&[u8]>) -> Result<u64> {
        // First use a pre allocated cluster if one is available.
        if let Some(free_cluster) = self.avail_clusters.pop() {
            if free_cluster == 0 {
                return Err(FormatError::HeaderOverlap(free_cluster).into());
            }
            match initial_data {
                Some(data) => self.raw_file.write_cluster(free_cluster, data),
                None => self.raw_file.zero_cluster(free_cluster),
            }
            .map_err(|e| io_error(e, Error::WritingData))?;
            return Ok(free_cluster);
        }

        let max_valid_cluster_offset = self.refcounts.max_valid_cluster_offset();
        match self
            .raw_file
            .add_cluster_end(max_valid_cluster_offset)
            .map_err(|e| io_error(e, Error::SettingFileSize))?
        {
            Some(new_cluster) => {
                if let Some(data) = initial_data {
                    self.raw_file
                        .write_cluster(new_cluster, data)
                        .map_err(|e| io_error(e, Error::WritingData))?;
                }
                Ok(new_cluster)
            }
            None => {
                error!("No free clusters in get_new_cluster()");
                Err(ResourceError::NoSpace.into())
            }
        }
    }

    // Allocate and initialize a new data cluster. Returns the offset of the
    // cluster into the file on success.
    fn append_data_cluster(&mut self, initial_data: Option<&[u8]>) -> Result<u64> {
        let new_addr: u64 = self.get_new_cluster(initial_data)?;
        // The cluster refcount starts at one indicating it is used but doesn't need COW.
        self.set_cluster_refcount_track_freed(new_addr, 1)?;
        Ok(new_addr)
    }

    // Put an L2 cluster to the cache with evicting less-used cluster
    // The new cluster may be allocated if necessary
    // (may_alloc argument is true and l2_addr_disk == 0)
    fn cache_l2_cluster(
        &mut self,
        l1_index: usize,
        l2_addr_disk: u64,
        may_alloc: bool,
    ) -> Result<Option<u64>> {
        let mut new_cluster: Option<u64> = None;
        if !self.l2_cache.get_mut().unwrap().contains_key(l1_index) {
            // Not in the cache.
            let l2_table = if may_alloc && l2_addr_disk == 0 {
                // Allocate a new cluster to store the L2 table and update the L1 table to point
                // to the new table.
                let new_addr: u64 = self.get_new_cluster(None)?;
                new_cluster = Some(new_addr);
                self.l1_table[l1_index] = new_addr;
                VecCache::new(self.l2_entries as usize)
            } else {
                VecCache::from_vec(self.read_l2_cluster(l2_addr_disk)?)
            };
            let l1_table = &self.l1_table;
            let raw_file = &self.raw_file;
            self.l2_cache
                .get_mut()
                .unwrap()
                .insert(l1_index, l2_table, |index, evicted| {
                    raw_file.write_pointer_table_direct(l1_table[index], evicted.get_values())
                })
                .map_err(|e| io_error(e, Error::WritingMetadata))?;
        }
        Ok(new_cluster)
    }

    // Set the refcount for a cluster and add any unreferenced clusters to the unref list.
    fn set_cluster_refcount_track_freed(&mut self, address: u64, refcount: u16) -> Result<()> {
        let mut newly_unref = self.set_cluster_refcount(address, refcount)?;
        self.unref_clusters.append(&mut newly_unref);
        Ok(())
    }

    // Set the refcount for a cluster with the given address.
    // Returns a list of any refblocks that can be reused, this happens when a refblock is moved,
    // the old location can be reused.
    fn set_cluster_refcount(&mut self, address: u64, refcount: u16) -> Result<Vec<u64>> {
        let mut added_clusters = Vec::new();
        let mut unref_clusters = Vec::new();
        let mut refcount_set = false;
        let mut new_cluster = None;

        while !refcount_set {
            match self.refcounts.set_cluster_refcount(
                &self.raw_file,
                address,
                refcount,
                new_cluster.take(),
            ) {
                Ok(None) => {
                    refcount_set = true;
                }
                Ok(Some(freed_cluster)) => {
                    // Recursively set the freed refcount block's refcount to 0
                    let mut freed = self.set_cluster_refcount(freed_cluster, 0)?;
                    unref_clusters.push(freed_cluster);
                    unref_clusters.append(&mut freed);
                    refcount_set = true;
                }
                Err(refcount::Error::NeedCluster(addr)) => {
                    // Read the address and call set_cluster_refcount again.
                    new_cluster = Some((
                        addr,
                        VecCache::from_vec(
                            self.raw_file
                                .read_refcount_block(addr)
                                .map_err(metadata_read_error)?,
                        ),
                    ));
                }
                Err(refcount::Error::NeedNewCluster) => {
                    // Allocate the cluster and call set_cluster_refcount again.
                    let addr = self.get_new_cluster(None)?;
                    added_clusters.push(addr);
                    new_cluster = Some((
                        addr,
                        VecCache::new(self.refcounts.refcounts_per_block() as usize),
                    ));
                }
                Err(refcount::Error::InvalidIndex) => {
                    return Err(Error::WritingMetadata(io::Error::from_raw_os_error(EINVAL)));
                }
                Err(e) => return Err(refcount_error(e)),
            }
        }

        for addr in added_clusters {
            self.set_cluster_refcount(addr, 1)?;
        }
        Ok(unref_clusters)
    }

    fn find_avail_clusters(&mut self) -> Result<()> {
        let cluster_size = self.raw_file.cluster_size();
        let file_size = self.raw_file.file_len().map_err(Error::GettingFileSize)?;

        for i in (0..file_size).step_by(cluster_size as usize) {
            let refcount = match self.refcounts.get_cluster_refcount(&self.raw_file, i) {
                Ok(refcount) => refcount,
                // Clusters past the refcount table's reach are never handed out.
                Err(refcount::Error::InvalidIndex) => break,
                Err(e) => return Err(refcount_error(e)),
            };
            if refcount == 0 {
                self.avail_clusters.push(i);
            }
        }

        Ok(())
    }

    // Makes sure the refcount table can describe every cluster a write touching `clusters` guest
    // clusters may append to the file, growing the table when it cannot.
    fn reserve_refcount_capacity(&mut self, clusters: u64) -> Result<()> {
        let cluster_size = self.raw_file.cluster_size();
        // Data clusters plus the L2 tables mapping them, plus refcount blocks for all of those,
        // each of which may be copied once.
        let new_clusters = clusters + clusters / self.l2_entries + 2;
        let refcount_blocks = new_clusters / self.refcounts.refcounts_per_block() + 2;
        let needed = (new_clusters + 2 * refcount_blocks) * cluster_size;

        loop {
            let file_end = self
                .raw_file
                .file_len()
                .map_err(Error::GettingFileSize)?
                .next_multiple_of(cluster_size);
            if file_end + needed <= self.refcounts.max_valid_cluster_offset() {
                return Ok(());
            }
            self.grow_refcount_table()?;
        }
    }

    /// Doubles the refcount table. The new table is written at the end of the file before the
    /// header is switched to it, then the clusters of the old table are released.
    pub(crate) fn grow_refcount_table(&mut self) -> Result<()> {
        // Start from committed metadata so the old table stays valid until the switch.
        self.sync_caches()?;

        let cluster_size = self.raw_file.cluster_size();
        let old_offset = self.header.refcount_table_offset;
        let old_clusters = u64::from(self.header.refcount_table_clusters);
        let new_clusters = old_clusters * 2;
        let new_entries = new_clusters * cluster_size / size_of::<u64>() as u64;
        if new_entries > MAX_RAM_POINTER_TABLE_SIZE {
            error!("Refcount table cannot grow past {new_entries} entries");
            return Err(ResourceError::NoSpace.into());
        }

        let new_offset = self
            .raw_file
            .add_clusters_end(new_clusters)
            .map_err(|e| io_error(e, Error::SettingFileSize))?;
        debug!(
            "Moving refcount table from {old_offset:#x} ({old_clusters} clusters) to \
             {new_offset:#x} ({new_clusters} clusters)"
        );
        self.refcounts.relocate_table(new_offset, new_entries);

        // Reference the new table, then release the old one.
        for i in 0..new_clusters {
            self.set_cluster_refcount_track_freed(new_offset + i * cluster_size, 1)?;
        }
        for i in 0..old_clusters {
            self.set_cluster_refcount_track_freed(old_offset + i * cluster_size, 0)?;
            self.unref_clusters.push(old_offset + i * cluster_size);
        }

        self.refcounts
            .flush_blocks(&self.raw_file)
            .map_err(|e| io_error(e, Error::WritingMetadata))?;
        self.refcounts
            .flush_table(&self.raw_file)
            .map_err(|e| io_error(e, Error::WritingMetadata))?;
        self.raw_file
            .file()
            .sync_all()
            .map_err(Error::SyncingFile)?;

        // The header switch commits the new table.
        self.header.refcount_table_offset = new_offset;
        self.header.refcount_table_clusters = new_clusters as u32;
        self.header
            .write_refcount_table_location(self.raw_file.file())?;
        self.raw_file
            .file()
            .sync_data()
            .map_err(Error::SyncingFile)?;

        self.avail_clusters.append(&mut self.unref_clusters);
        Ok(())
    }

    // Writes the dirty metadata: L2 tables and refcount blocks first, then the L1 table and the
    // refcount table that point at them.
    fn sync_caches(&mut self) -> Result<()> {
        // Write out all dirty L2 tables.
        let mut l2_flushed = false;
        for (l1_index, l2_table) in self
            .l2_cache
            .get_mut()
            .unwrap()
            .iter_mut()
            .filter(|(_k, v)| v.dirty())
        {
            // The index must be valid from when we inserted it.
            let addr = self.l1_table[*l1_index];
            if addr == 0 {
                return Err(Error::WritingMetadata(io::Error::from_raw_os_error(EINVAL)));
            }
            self.raw_file
                .write_pointer_table_direct(addr, l2_table.get_values())
                .map_err(|e| io_error(e, Error::WritingMetadata))?;
            l2_table.mark_clean();
            l2_flushed = true;
        }
        // Write the modified refcount blocks.
        let blocks_flushed = self
            .refcounts
            .flush_blocks(&self.raw_file)
            .map_err(|e| io_error(e, Error::WritingMetadata))?;
        if !(l2_flushed || blocks_flushed || self.l1_table.dirty() || self.refcounts.is_dirty()) {
            return Ok(());
        }
        // Make sure metadata(file len) and all data clusters are written.
        self.raw_file
            .file()
            .sync_all()
            .map_err(Error::SyncingFile)?;

        // Push L1 table and refcount table last as all the clusters they point to are now
        // guaranteed to be valid.
        if self.l1_table.dirty() {
            // Write L1 table with OFLAG_COPIED bits
            let refcounts = &mut self.refcounts;
            self.raw_file
                .write_pointer_table(
                    self.header.l1_table_offset,
                    self.l1_table.get_values().iter(),
                    |raw_file, l2_addr| {
                        if l2_addr == 0 {
                            Ok(0)
                        } else {
                            let refcount = refcounts
                                .get_cluster_refcount(raw_file, l2_addr)
                                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                            Ok(l1_entry_make(l2_addr, refcount == 1))
                        }
                    },
                )
                .map_err(|e| io_error(e, Error::WritingMetadata))?;
            self.l1_table.mark_clean();
        }
        self.refcounts
            .flush_table(&self.raw_file)
            .map_err(|e| io_error(e, Error::WritingMetadata))?;
        self.raw_file
            .file()
            .sync_data()
            .map_err(Error::SyncingFile)?;

        self.avail_clusters.append(&mut self.unref_clusters);
        Ok(())
    }

    /// Walks the header, the L1 and L2 tables and the refcount structures, counting the
    /// references to every cluster, and compares them with the stored refcounts.
    pub fn check(&mut self) -> Result<CheckReport> {
        if self.writable {
            self.sync_caches()?;
        }

        let cluster_size = self.raw_file.cluster_size();
        let file_size = self.raw_file.file_len().map_err(Error::GettingFileSize)?;
        let total_clusters = div_round_up_u64(file_size, cluster_size);
        let mut report = CheckReport {
            total_clusters,
            ..Default::default()
        };
        let mut references = vec![0u64; total_clusters as usize];
        let mut add_ref = |report: &mut CheckReport, address: u64| {
            match references.get_mut((address / cluster_size) as usize) {
                Some(count) => *count += 1,
                // Referenced past the end of the file.
                None => report.corruptions += 1,
            }
        };

        // The header.
        add_ref(&mut report, 0);
        let l1_bytes = u64::from(self.header.l1_size) * size_of::<u64>() as u64;
        for i in 0..div_round_up_u64(l1_bytes, cluster_size) {
            add_ref(&mut report, self.header.l1_table_offset + i * cluster_size);
        }
        for i in 0..u64::from(self.header.refcount_table_clusters) {
            add_ref(&mut report, self.header.refcount_table_offset + i * cluster_size);
        }
        for &block_addr in self.refcounts.ref_table() {
            if block_addr != 0 {
                add_ref(&mut report, block_addr);
            }
        }

        for &l2_addr in self.l1_table.get_values() {
            if l2_addr == 0 {
                continue;
            }
            add_ref(&mut report, l2_addr);
            for l2_entry in self.read_l2_cluster(l2_addr)? {
                if l2_entry_is_empty(l2_entry) {
                    continue;
                }
                if l2_entry_is_compressed(l2_entry) {
                    report.corruptions += 1;
                    continue;
                }
                let data_addr = l2_entry_std_cluster_addr(l2_entry);
                if data_addr != 0 {
                    add_ref(&mut report, data_addr);
                    report.allocated_clusters += 1;
                }
            }
        }

        for (index, &expected) in references.iter().enumerate() {
            let stored = u64::from(self.cluster_refcount(index as u64 * cluster_size)?);
            match (stored, expected) {
                (0, 0) => {}
                (_, 0) => report.leaked_clusters += 1,
                (stored, expected) if stored != expected => report.corruptions += 1,
                _ => {}
            }
        }

        if !report.is_clean() {
            warn!(
                "Image check found {} leaked clusters and {} corruptions",
                report.leaked_clusters, report.corruptions
            );
        }
        Ok(report)
    }
}

impl LogicalRead for QcowFile {
    fn virtual_size(&self) -> u64 {
        QcowFile::virtual_size(self)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        QcowFile::read_at(self, offset, buf)
    }
}

impl Drop for QcowFile {
    fn drop(&mut self) {
        if self.writable {
            if let Err(e) = self.sync_caches() {
                warn!("Failed to commit qcow2 metadata on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use std::io::Write;
    use std::os::unix::fs::FileExt;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::header::{BackingFileConfig, DEFAULT_CLUSTER_BITS};
    use crate::raw::RawDisk;
    use crate::tables::{CLUSTER_USED_FLAG, COMPRESSED_FLAG, ZERO_FLAG};
    use crate::ImageType;

    fn new_qcow(size: u64, cluster_bits: u32) -> QcowFile {
        let header = QcowHeader::create_for_size_and_path(3, size, cluster_bits, None).unwrap();
        QcowFile::create(TempFile::new().unwrap().into_file(), &header).unwrap()
    }

    fn reopen(qcow: QcowFile, writable: bool) -> QcowFile {
        let file = qcow.file().try_clone().unwrap();
        drop(qcow);
        QcowFile::from(file, writable).unwrap()
    }

    #[test]
    fn fresh_image_layout() {
        let mut qcow = new_qcow(100 * 1024 * 1024, DEFAULT_CLUSTER_BITS);
        assert_eq!(qcow.virtual_size(), 100 * 1024 * 1024);
        assert!(qcow.l1_table().iter().all(|&e| e == 0));
        // Header, L1 table, refcount table and one refcount block.
        assert_eq!(qcow.file().metadata().unwrap().len(), 4 * 0x1_0000);
        assert_eq!(qcow.ref_table()[0], 3 * 0x1_0000);
        for cluster in 0..4 {
            assert_eq!(qcow.cluster_refcount(cluster * 0x1_0000).unwrap(), 1);
        }
        assert!(qcow.check().unwrap().is_clean());
    }

    #[test]
    fn write_read_start() {
        let mut qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        qcow.write_at(0, b"test first bytes").unwrap();
        let mut buf = [0u8; 4];
        qcow.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"test");

        let qcow = reopen(qcow, false);
        let mut buf = [0u8; 16];
        qcow.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"test first bytes");
        assert!(qcow.cluster_allocated(0).unwrap());
        assert!(!qcow.cluster_allocated(0x1_0000).unwrap());
    }

    #[test]
    fn unwritten_reads_zeros() {
        let qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        let mut buf = [0xffu8; 0x2_0000];
        qcow.read_at(0x8_0000, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn offset_write_read_across_clusters() {
        let mut qcow = new_qcow(0x10_0000, 9);
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        qcow.write_at(1000, &data).unwrap();
        let mut buf = vec![0u8; 3000];
        qcow.read_at(1000, &mut buf).unwrap();
        assert_eq!(buf, data);

        let mut qcow = reopen(qcow, true);
        qcow.read_at(1000, &mut buf).unwrap();
        assert_eq!(buf, data);
        let report = qcow.check().unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.allocated_clusters, 7);
    }

    #[test]
    fn overwrite_keeps_allocation() {
        let mut qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        qcow.write_at(0x1_0000, &[1u8; 512]).unwrap();
        let len = qcow.file().metadata().unwrap().len();
        qcow.write_at(0x1_0000, &[2u8; 512]).unwrap();
        assert_eq!(qcow.file().metadata().unwrap().len(), len);
        let mut buf = [0u8; 512];
        qcow.read_at(0x1_0000, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 512]);
        assert!(qcow.check().unwrap().is_clean());
    }

    #[test]
    fn out_of_range_rejected() {
        let mut qcow = new_qcow(0x1000, 9);
        let mut buf = [0u8; 16];
        assert!(matches!(
            qcow.read_at(0x1000 - 8, &mut buf),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(
            qcow.write_at(u64::MAX, &buf),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn read_only_rejects_writes() {
        let qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        let mut qcow = reopen(qcow, false);
        assert!(matches!(qcow.write_at(0, &[1]), Err(Error::NotWritable)));
    }

    #[test]
    fn backing_file_copy_on_write() {
        let mut base = TempFile::new().unwrap().into_file();
        base.write_all(&[0xaa; 0x2_0000]).unwrap();
        let backing = RawDisk::new(base).unwrap();

        let config = BackingFileConfig {
            path: "base.raw".to_string(),
            format: Some(ImageType::Raw),
        };
        let header =
            QcowHeader::create_for_size_and_path(3, 0x4_0000, DEFAULT_CLUSTER_BITS, Some(&config))
                .unwrap();
        let mut qcow = QcowFile::create(TempFile::new().unwrap().into_file(), &header).unwrap();
        qcow.set_backing_file(Some(BackingFile::new(Box::new(backing))));

        qcow.write_at(0x100, b"child").unwrap();

        let mut buf = vec![0u8; 0x4_0000];
        qcow.read_at(0, &mut buf).unwrap();
        assert!(buf[..0x100].iter().all(|&b| b == 0xaa));
        assert_eq!(&buf[0x100..0x105], b"child");
        assert!(buf[0x105..0x2_0000].iter().all(|&b| b == 0xaa));
        // Past the end of the shorter backing file.
        assert!(buf[0x2_0000..].iter().all(|&b| b == 0));
        assert!(qcow.check().unwrap().is_clean());
    }

    #[test]
    fn zero_flag_reads_zeros() {
        let mut qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        qcow.write_at(0, &[0x55; 0x1_0000]).unwrap();
        let l2_addr = qcow.l1_table()[0];
        let data_addr = qcow.read_l2_cluster(l2_addr).unwrap()[0] & !CLUSTER_USED_FLAG;
        let qcow_file = qcow.file().try_clone().unwrap();
        drop(qcow);
        // Mark the cluster as reading zeros while keeping its storage.
        qcow_file
            .write_all_at(
                &(data_addr | CLUSTER_USED_FLAG | ZERO_FLAG).to_be_bytes(),
                l2_addr,
            )
            .unwrap();

        let mut qcow = QcowFile::from(qcow_file, true).unwrap();
        let mut buf = [0xffu8; 16];
        qcow.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        // Writing to it clears the whole cluster first.
        qcow.write_at(8, &[1u8; 8]).unwrap();
        qcow.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1]);
        assert!(qcow.check().unwrap().is_clean());
    }

    #[test]
    fn compressed_cluster_rejected() {
        let mut qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        qcow.write_at(0, &[0x55; 16]).unwrap();
        let l2_addr = qcow.l1_table()[0];
        let qcow_file = qcow.file().try_clone().unwrap();
        drop(qcow);
        qcow_file
            .write_all_at(&(COMPRESSED_FLAG | 0x5_0000).to_be_bytes(), l2_addr)
            .unwrap();

        let qcow = QcowFile::from(qcow_file, false).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            qcow.read_at(0, &mut buf),
            Err(Error::Format(FormatError::CompressedCluster(0)))
        ));
    }

    #[test]
    fn cut_before_tables_is_truncated() {
        let qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        let file = qcow.file().try_clone().unwrap();
        drop(qcow);
        // Only the header cluster is left.
        file.set_len(0x1_0000).unwrap();
        assert!(matches!(
            QcowFile::from(file.try_clone().unwrap(), false),
            Err(Error::Format(FormatError::Truncated))
        ));
        assert!(matches!(
            QcowFile::from(file, true),
            Err(Error::Format(FormatError::Truncated))
        ));
    }

    #[test]
    fn cut_l2_table_is_truncated() {
        let mut qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        qcow.write_at(0, &[0x55; 16]).unwrap();
        let l2_addr = qcow.l1_table()[0];
        let file = qcow.file().try_clone().unwrap();
        drop(qcow);
        file.set_len(l2_addr).unwrap();

        let qcow = QcowFile::from(file, false).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            qcow.read_at(0, &mut buf),
            Err(Error::Format(FormatError::Truncated))
        ));
    }

    // Points the first L2 entry of an image holding one written cluster at `data_addr`.
    fn with_first_l2_entry(data_addr: u64) -> QcowFile {
        let mut qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        qcow.write_at(0, &[0x55; 16]).unwrap();
        let l2_addr = qcow.l1_table()[0];
        let file = qcow.file().try_clone().unwrap();
        drop(qcow);
        file.write_all_at(&(CLUSTER_USED_FLAG | data_addr).to_be_bytes(), l2_addr)
            .unwrap();
        QcowFile::from(file, false).unwrap()
    }

    #[test]
    fn data_cluster_in_metadata_rejected() {
        let header = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS).header().clone();
        for metadata_addr in [header.l1_table_offset, header.refcount_table_offset] {
            let qcow = with_first_l2_entry(metadata_addr);
            let mut buf = [0u8; 8];
            assert!(matches!(
                qcow.read_at(0, &mut buf),
                Err(Error::Format(FormatError::HeaderOverlap(addr))) if addr == metadata_addr
            ));
            assert!(qcow.cluster_allocated(0).is_err());
        }
    }

    #[test]
    fn data_cluster_past_end_rejected() {
        let qcow = with_first_l2_entry(0x100_0000);
        let mut buf = [0u8; 8];
        assert!(matches!(
            qcow.read_at(0, &mut buf),
            Err(Error::Format(FormatError::Truncated))
        ));
    }

    #[test]
    fn dirty_image_is_read_only() {
        let qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        let file = qcow.file().try_clone().unwrap();
        drop(qcow);
        // incompatible_features lives at byte 72.
        file.write_all_at(&1u64.to_be_bytes(), 72).unwrap();

        assert!(matches!(
            QcowFile::from(file.try_clone().unwrap(), true),
            Err(Error::Format(FormatError::DirtyImage))
        ));
        let qcow = QcowFile::from(file, false).unwrap();
        assert!(qcow.header().is_dirty());
    }

    #[test]
    fn refcount_table_growth_preserves_data() {
        let mut qcow = new_qcow(0x40_0000, 9);
        let old_offset = qcow.header().refcount_table_offset;
        let old_clusters = qcow.header().refcount_table_clusters;
        let old_max = qcow.refcounts.max_valid_cluster_offset();
        qcow.write_at(0, &[0x11; 4096]).unwrap();

        qcow.grow_refcount_table().unwrap();
        assert_eq!(qcow.header().refcount_table_clusters, old_clusters * 2);
        assert_ne!(qcow.header().refcount_table_offset, old_offset);
        assert!(qcow.refcounts.max_valid_cluster_offset() > old_max);
        assert_eq!(qcow.cluster_refcount(old_offset).unwrap(), 0);

        qcow.write_at(0x20_0000, &[0x22; 4096]).unwrap();

        let mut qcow = reopen(qcow, true);
        let mut buf = [0u8; 4096];
        qcow.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0x11; 4096]);
        qcow.read_at(0x20_0000, &mut buf).unwrap();
        assert_eq!(buf, [0x22; 4096]);
        let report = qcow.check().unwrap();
        assert!(report.is_clean(), "{report:?}");
    }

    #[test]
    fn writes_grow_refcount_table_on_demand() {
        // 512 byte clusters, one refcount table cluster covers 16384 clusters (8 MiB).
        let mut header = QcowHeader::create_for_size_and_path(3, 0x100_0000, 9, None).unwrap();
        header.refcount_table_clusters = 1;
        let mut qcow = QcowFile::create(TempFile::new().unwrap().into_file(), &header).unwrap();
        let chunk = vec![0x33u8; 0x10_0000];
        for i in 0..12 {
            qcow.write_at(i * 0x10_0000, &chunk).unwrap();
        }
        assert!(qcow.header().refcount_table_clusters > 1);

        let mut qcow = reopen(qcow, true);
        let mut buf = vec![0u8; 0x10_0000];
        qcow.read_at(11 * 0x10_0000, &mut buf).unwrap();
        assert_eq!(buf, chunk);
        assert!(qcow.check().unwrap().is_clean());
    }

    #[test]
    fn rollback_restores_committed_state() {
        let mut qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        qcow.write_at(0, &[1u8; 16]).unwrap();
        let committed_len = qcow.raw_file.file_len().unwrap();

        qcow.write_clusters(0x8_0000, &[2u8; 16]).unwrap();
        assert!(qcow.raw_file.file_len().unwrap() > committed_len);
        qcow.rollback(committed_len).unwrap();

        assert_eq!(qcow.raw_file.file_len().unwrap(), committed_len);
        assert!(!qcow.cluster_allocated(0x8_0000).unwrap());
        let mut buf = [0u8; 16];
        qcow.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16]);
        assert!(qcow.check().unwrap().is_clean());

        // The image is still usable after a rollback.
        qcow.write_at(0x8_0000, &[3u8; 16]).unwrap();
        qcow.read_at(0x8_0000, &mut buf).unwrap();
        assert_eq!(buf, [3u8; 16]);
    }

    #[test]
    fn check_reports_leaks() {
        let mut qcow = new_qcow(0x10_0000, DEFAULT_CLUSTER_BITS);
        qcow.write_at(0, &[1u8; 16]).unwrap();
        // Reference a cluster from nowhere.
        let leaked = qcow.raw_file.add_clusters_end(1).unwrap();
        qcow.set_cluster_refcount_track_freed(leaked, 1).unwrap();
        qcow.sync_caches().unwrap();

        let report = qcow.check().unwrap();
        assert_eq!(report.leaked_clusters, 1);
        assert_eq!(report.corruptions, 0);
    }

}
