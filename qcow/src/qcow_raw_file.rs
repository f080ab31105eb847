// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::unix::fs::FileExt;

use crate::tables::{
    decode_pointer_table, decode_refcount_block, encode_pointer_table, encode_refcount_block,
};

fn invalid_data(e: crate::FormatError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// A qcow file. Allows reading/writing clusters and appending clusters.
///
/// All accesses are positional, so a shared reference is enough to read.
#[derive(Debug)]
pub struct QcowRawFile {
    file: File,
    cluster_size: u64,
    cluster_mask: u64,
}

impl QcowRawFile {
    /// Creates a `QcowRawFile` from the given `File`, `None` is returned if `cluster_size` is not
    /// a power of two.
    pub fn from(file: File, cluster_size: u64) -> Option<Self> {
        if !cluster_size.is_power_of_two() {
            return None;
        }
        Some(QcowRawFile {
            file,
            cluster_size,
            cluster_mask: cluster_size - 1,
        })
    }

    /// Reads `count` 64 bit offsets and returns them as a vector.
    /// `mask` optionally `&`s out some of the bits on the file.
    pub fn read_pointer_table(
        &self,
        offset: u64,
        count: u64,
        mask: Option<u64>,
    ) -> io::Result<Vec<u64>> {
        let mut bytes = vec![0u8; count as usize * size_of::<u64>()];
        self.file.read_exact_at(&mut bytes, offset)?;
        let mut table = decode_pointer_table(&bytes).map_err(invalid_data)?;
        if let Some(m) = mask {
            for ptr in &mut table {
                *ptr &= m;
            }
        }
        Ok(table)
    }

    /// Reads a cluster's worth of 64 bit offsets and returns them as a vector.
    /// `mask` optionally `&`s out some of the bits on the file.
    pub fn read_pointer_cluster(&self, offset: u64, mask: Option<u64>) -> io::Result<Vec<u64>> {
        let count = self.cluster_size / size_of::<u64>() as u64;
        self.read_pointer_table(offset, count, mask)
    }

    /// Writes a pointer table to `offset` in the file.
    /// Entries are computed on-the-fly by the callback.
    pub fn write_pointer_table<'a>(
        &mut self,
        offset: u64,
        entries: impl Iterator<Item = &'a u64>,
        mut f: impl FnMut(&mut QcowRawFile, u64) -> io::Result<u64>,
    ) -> io::Result<()> {
        let mut table = Vec::with_capacity(entries.size_hint().0);
        for addr in entries {
            table.push(f(self, *addr)?);
        }
        self.file.write_all_at(&encode_pointer_table(&table), offset)
    }

    /// Writes a pointer table directly without transforming values.
    pub fn write_pointer_table_direct(&self, offset: u64, table: &[u64]) -> io::Result<()> {
        self.file.write_all_at(&encode_pointer_table(table), offset)
    }

    /// Read a refcount block from the file and returns a Vec containing the block.
    /// Always returns a cluster's worth of data.
    pub fn read_refcount_block(&self, offset: u64) -> io::Result<Vec<u16>> {
        let mut bytes = vec![0u8; self.cluster_size as usize];
        self.file.read_exact_at(&mut bytes, offset)?;
        decode_refcount_block(&bytes).map_err(invalid_data)
    }

    /// Writes a refcount block to the file.
    pub fn write_refcount_block(&self, offset: u64, table: &[u16]) -> io::Result<()> {
        self.file.write_all_at(&encode_refcount_block(table), offset)
    }

    /// Allocates a new cluster at the end of the current file, return the address.
    pub fn add_cluster_end(&mut self, max_valid_cluster_offset: u64) -> io::Result<Option<u64>> {
        // Determine where the new end of the file should be and set_len, which
        // translates to truncate(2).
        let file_end: u64 = self.file_len()?;
        let new_cluster_address: u64 = (file_end + self.cluster_size - 1) & !self.cluster_mask;

        if new_cluster_address > max_valid_cluster_offset {
            return Ok(None);
        }

        self.file.set_len(new_cluster_address + self.cluster_size)?;

        Ok(Some(new_cluster_address))
    }

    /// Extends the file by `count` clusters and returns the address of the first one.
    pub fn add_clusters_end(&mut self, count: u64) -> io::Result<u64> {
        let file_end: u64 = self.file_len()?;
        let first_address: u64 = (file_end + self.cluster_size - 1) & !self.cluster_mask;
        self.file
            .set_len(first_address + count * self.cluster_size)?;
        Ok(first_address)
    }

    /// Returns a reference to the underlying file.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Returns the current length of the file.
    pub fn file_len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Returns the size of the file's clusters.
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// Returns the offset of `address` within a cluster.
    pub fn cluster_offset(&self, address: u64) -> u64 {
        address & self.cluster_mask
    }

    /// Returns the address of the cluster containing `address`.
    pub fn cluster_address(&self, address: u64) -> u64 {
        address & !self.cluster_mask
    }

    /// Reads `buf.len()` bytes at `address`, which must stay within one cluster.
    pub fn read_data(&self, address: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, address)
    }

    /// Writes `buf` at `address`, which must stay within one cluster.
    pub fn write_data(&self, address: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, address)
    }

    /// Writes a full cluster of data at `address`.
    pub fn write_cluster(&self, address: u64, data: &[u8]) -> io::Result<()> {
        let cluster_size = self.cluster_size as usize;
        if data.len() != cluster_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cluster data must be {cluster_size} bytes"),
            ));
        }
        self.file.write_all_at(data, address)
    }

    /// Fills the cluster at `address` with zeros.
    pub fn zero_cluster(&self, address: u64) -> io::Result<()> {
        let cluster_size = self.cluster_size as usize;
        self.file.write_all_at(&vec![0u8; cluster_size], address)
    }
}
