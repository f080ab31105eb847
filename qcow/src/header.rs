// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! qcow2 header parsing, validation, and creation.

use std::cmp::min;
use std::fs::File;
use std::io::Cursor;
use std::mem::size_of;
use std::os::unix::fs::FileExt;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::tables::{div_round_up_u64, encode_pointer_table};
use crate::{Error, FormatError, ImageType, Result};

// Maximum data size supported.
pub const MAX_QCOW_FILE_SIZE: u64 = 0x01 << 44; // 16 TB.

// QCOW magic constant that starts the header.
pub const QCOW_MAGIC: u32 = 0x5146_49fb;
// Default to a cluster size of 2^DEFAULT_CLUSTER_BITS
pub const DEFAULT_CLUSTER_BITS: u32 = 16;
// Limit clusters to reasonable sizes. Choose the same limits as qemu. Making the clusters smaller
// increases the amount of overhead for book keeping.
pub const MIN_CLUSTER_BITS: u32 = 9;
pub const MAX_CLUSTER_BITS: u32 = 21;
// The L1 and RefCount table are kept in RAM, only handle files that require less than 35M entries.
pub(crate) const MAX_RAM_POINTER_TABLE_SIZE: u64 = 35_000_000;
// 16-bit refcounts.
pub const DEFAULT_REFCOUNT_ORDER: u32 = 4;

pub(crate) const V2_BARE_HEADER_SIZE: u32 = 72;
pub(crate) const V3_BARE_HEADER_SIZE: u32 = 104;
// The compression type byte plus padding, written by every v3 image we create.
const COMPRESSION_TYPE_FIELD_SIZE: u32 = 8;

// Byte offset of the refcount table location inside the header.
const REFCOUNT_TABLE_OFFSET_FIELD: u64 = 48;

// Header extension types
const HEADER_EXT_END: u32 = 0x0000_0000;
// Backing file format name (raw, qcow2)
const HEADER_EXT_BACKING_FORMAT: u32 = 0xe279_2aca;
const HEADER_EXT_HEADER_SIZE: u64 = 8;

// Longest backing file name qcow2 allows
pub const MAX_BACKING_FILE_SIZE: u32 = 1023;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u64 {
        const DIRTY = 1 << 0;
        const CORRUPT = 1 << 1;
        const DATA_FILE = 1 << 2;
        const COMPRESSION = 1 << 3;
        const EXTENDED_L2 = 1 << 4;
    }
}

impl IncompatFeatures {
    /// Features an image may carry and still be opened.
    pub(crate) const SUPPORTED: IncompatFeatures = IncompatFeatures::DIRTY;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackingFileConfig {
    pub path: String,
    // If this is None, the format is detected when the chain is resolved.
    pub format: Option<ImageType>,
}

/// Contains the information from the header of a qcow file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QcowHeader {
    pub magic: u32,
    pub version: u32,

    pub backing_file_offset: u64,
    pub backing_file_size: u32,

    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,

    pub l1_size: u32,
    pub l1_table_offset: u64,

    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,

    pub nb_snapshots: u32,
    pub snapshots_offset: u64,

    // v3 entries
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_size: u32,

    // Post-header entries
    pub backing_file: Option<BackingFileConfig>,
}

fn read_u32_be(cursor: &mut Cursor<&[u8]>) -> std::result::Result<u32, FormatError> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|_| FormatError::Truncated)
}

fn read_u64_be(cursor: &mut Cursor<&[u8]>) -> std::result::Result<u64, FormatError> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|_| FormatError::Truncated)
}

impl QcowHeader {
    /// Decodes a header from the leading bytes of an image, normally its first cluster.
    pub fn decode(bytes: &[u8]) -> std::result::Result<QcowHeader, FormatError> {
        let mut cursor = Cursor::new(bytes);
        let magic = read_u32_be(&mut cursor)?;
        if magic != QCOW_MAGIC {
            return Err(FormatError::BadMagic);
        }

        let version = read_u32_be(&mut cursor)?;
        // Only v2 and v3 files are supported.
        if version != 2 && version != 3 {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let mut header = QcowHeader {
            magic,
            version,
            backing_file_offset: read_u64_be(&mut cursor)?,
            backing_file_size: read_u32_be(&mut cursor)?,
            cluster_bits: read_u32_be(&mut cursor)?,
            size: read_u64_be(&mut cursor)?,
            crypt_method: read_u32_be(&mut cursor)?,
            l1_size: read_u32_be(&mut cursor)?,
            l1_table_offset: read_u64_be(&mut cursor)?,
            refcount_table_offset: read_u64_be(&mut cursor)?,
            refcount_table_clusters: read_u32_be(&mut cursor)?,
            nb_snapshots: read_u32_be(&mut cursor)?,
            snapshots_offset: read_u64_be(&mut cursor)?,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: DEFAULT_REFCOUNT_ORDER,
            header_size: V2_BARE_HEADER_SIZE,
            backing_file: None,
        };
        if version == 3 {
            header.incompatible_features = read_u64_be(&mut cursor)?;
            header.compatible_features = read_u64_be(&mut cursor)?;
            header.autoclear_features = read_u64_be(&mut cursor)?;
            header.refcount_order = read_u32_be(&mut cursor)?;
            header.header_size = read_u32_be(&mut cursor)?;
            if header.header_size < V3_BARE_HEADER_SIZE {
                return Err(FormatError::Truncated);
            }
        }

        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&header.cluster_bits) {
            return Err(FormatError::InvalidClusterBits(header.cluster_bits));
        }
        if header.crypt_method != 0 {
            return Err(FormatError::EncryptedImage);
        }
        if header.refcount_order != DEFAULT_REFCOUNT_ORDER {
            return Err(FormatError::UnsupportedRefcountOrder(header.refcount_order));
        }
        // Limit the total size of the disk.
        if header.size > MAX_QCOW_FILE_SIZE {
            return Err(FormatError::FileTooBig(header.size));
        }
        let unsupported = IncompatFeatures::from_bits_retain(header.incompatible_features)
            - IncompatFeatures::SUPPORTED;
        if !unsupported.is_empty() {
            return Err(FormatError::UnsupportedFeature(unsupported));
        }

        let backing_format = header.read_header_extensions(bytes)?;

        if header.backing_file_offset != 0 {
            if header.backing_file_size > MAX_BACKING_FILE_SIZE {
                return Err(FormatError::BackingFileTooLong(
                    header.backing_file_size as usize,
                ));
            }
            let start = header.backing_file_offset;
            let end = start.saturating_add(u64::from(header.backing_file_size));
            if start < u64::from(header.header_size) || end > header.cluster_size() {
                return Err(FormatError::InvalidBackingFileOffset(start));
            }
            let name = bytes
                .get(start as usize..end as usize)
                .ok_or(FormatError::Truncated)?;
            let path = std::str::from_utf8(name)
                .map_err(FormatError::InvalidBackingFileName)?
                .to_string();
            header.backing_file = Some(BackingFileConfig {
                path,
                format: backing_format,
            });
        }

        Ok(header)
    }

    // Walks the header extension area, returning the backing format if one is recorded.
    fn read_header_extensions(
        &self,
        bytes: &[u8],
    ) -> std::result::Result<Option<ImageType>, FormatError> {
        // The area ends where the backing file name starts, or with the header cluster.
        let mut limit = min(bytes.len() as u64, self.cluster_size());
        if self.backing_file_offset != 0 {
            limit = min(limit, self.backing_file_offset);
        }

        let mut format = None;
        let mut pos = u64::from(self.header_size);
        while pos + HEADER_EXT_HEADER_SIZE <= limit {
            let ext_type = BigEndian::read_u32(&bytes[pos as usize..]);
            if ext_type == HEADER_EXT_END {
                break;
            }
            let ext_length = u64::from(BigEndian::read_u32(&bytes[pos as usize + 4..]));
            let data_start = pos + HEADER_EXT_HEADER_SIZE;
            let data_end = data_start + ext_length;
            if data_end > limit {
                return Err(FormatError::Truncated);
            }

            if ext_type == HEADER_EXT_BACKING_FORMAT {
                let format_str = std::str::from_utf8(&bytes[data_start as usize..data_end as usize])
                    .map_err(FormatError::InvalidBackingFileName)?;
                format = Some(format_str.parse()?);
            }

            // Skip to the next 8 byte boundary
            pos = data_end + (8 - (ext_length % 8)) % 8;
        }

        Ok(format)
    }

    /// Reads and decodes the header of `file`.
    pub fn read_from(file: &File) -> Result<QcowHeader> {
        let file_len = file.metadata().map_err(Error::GettingFileSize)?.len();
        let mut bytes = vec![0u8; min(file_len, 1 << MIN_CLUSTER_BITS) as usize];
        file.read_exact_at(&mut bytes, 0)
            .map_err(Error::ReadingHeader)?;

        // Extensions and the backing file name live anywhere in the first cluster.
        if bytes.len() >= 24 {
            let cluster_bits = BigEndian::read_u32(&bytes[20..24]);
            if (MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
                let len = min(file_len, 1 << cluster_bits) as usize;
                if len > bytes.len() {
                    bytes.resize(len, 0);
                    file.read_exact_at(&mut bytes, 0)
                        .map_err(Error::ReadingHeader)?;
                }
            }
        }

        Ok(QcowHeader::decode(&bytes)?)
    }

    pub fn create_for_size_and_path(
        version: u32,
        size: u64,
        cluster_bits: u32,
        backing_file: Option<&BackingFileConfig>,
    ) -> std::result::Result<QcowHeader, FormatError> {
        if version != 2 && version != 3 {
            return Err(FormatError::UnsupportedVersion(version));
        }
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            return Err(FormatError::InvalidClusterBits(cluster_bits));
        }
        if size > MAX_QCOW_FILE_SIZE {
            return Err(FormatError::FileTooBig(size));
        }

        let header_size = if version == 2 {
            V2_BARE_HEADER_SIZE
        } else {
            V3_BARE_HEADER_SIZE + COMPRESSION_TYPE_FIELD_SIZE
        };
        let cluster_size = 0x01u64 << cluster_bits;

        let backing_file_offset = backing_file.map_or(0, |backing| {
            u64::from(header_size)
                + backing
                    .format
                    .map_or(0, |f| extension_size(f.to_string().len() as u64))
                + HEADER_EXT_HEADER_SIZE
        });
        if let Some(backing) = backing_file {
            let len = backing.path.len();
            if len > MAX_BACKING_FILE_SIZE as usize
                || backing_file_offset + len as u64 > cluster_size
            {
                return Err(FormatError::BackingFileTooLong(len));
            }
        }

        // L2 blocks are always one cluster long. They contain cluster_size/sizeof(u64) addresses.
        let entries_per_cluster = cluster_size / size_of::<u64>() as u64;
        let num_clusters = div_round_up_u64(size, cluster_size);
        let num_l2_clusters = div_round_up_u64(num_clusters, entries_per_cluster);
        if num_l2_clusters > MAX_RAM_POINTER_TABLE_SIZE {
            return Err(FormatError::InvalidL1TableSize(num_l2_clusters));
        }
        let l1_clusters = div_round_up_u64(num_l2_clusters, entries_per_cluster);
        let header_clusters = 1;

        // Pre-allocate enough clusters for the entire refcount table as it must be continuous in
        // the file. Allocate enough space to refcount all clusters, including the refcount
        // clusters.
        let max_refcount_clusters = max_refcount_clusters(
            DEFAULT_REFCOUNT_ORDER,
            cluster_size,
            num_clusters + l1_clusters + num_l2_clusters + header_clusters,
        );
        // The refcount table needs to store the offset of each refcount cluster.
        let refcount_table_clusters = div_round_up_u64(
            max_refcount_clusters * size_of::<u64>() as u64,
            cluster_size,
        );
        if refcount_table_clusters > MAX_RAM_POINTER_TABLE_SIZE {
            return Err(FormatError::InvalidRefcountTableSize(
                refcount_table_clusters,
            ));
        }

        Ok(QcowHeader {
            magic: QCOW_MAGIC,
            version,
            backing_file_offset,
            backing_file_size: backing_file.map_or(0, |b| b.path.len()) as u32,
            cluster_bits,
            size,
            crypt_method: 0,
            l1_size: num_l2_clusters as u32,
            l1_table_offset: cluster_size,
            // The refcount table is after l1 + header.
            refcount_table_offset: cluster_size * (l1_clusters + 1),
            refcount_table_clusters: refcount_table_clusters as u32,
            nb_snapshots: 0,
            snapshots_offset: 0,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: DEFAULT_REFCOUNT_ORDER,
            header_size,
            backing_file: backing_file.cloned(),
        })
    }

    /// Encodes the header, its extension area and the backing file name.
    ///
    /// The layout matches the one `create_for_size_and_path` computes: the backing file name
    /// directly follows the extension end marker.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_size as usize + 64);
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.backing_file_offset.to_be_bytes());
        buf.extend_from_slice(&self.backing_file_size.to_be_bytes());
        buf.extend_from_slice(&self.cluster_bits.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.crypt_method.to_be_bytes());
        buf.extend_from_slice(&self.l1_size.to_be_bytes());
        buf.extend_from_slice(&self.l1_table_offset.to_be_bytes());
        buf.extend_from_slice(&self.refcount_table_offset.to_be_bytes());
        buf.extend_from_slice(&self.refcount_table_clusters.to_be_bytes());
        buf.extend_from_slice(&self.nb_snapshots.to_be_bytes());
        buf.extend_from_slice(&self.snapshots_offset.to_be_bytes());

        if self.version == 3 {
            buf.extend_from_slice(&self.incompatible_features.to_be_bytes());
            buf.extend_from_slice(&self.compatible_features.to_be_bytes());
            buf.extend_from_slice(&self.autoclear_features.to_be_bytes());
            buf.extend_from_slice(&self.refcount_order.to_be_bytes());
            buf.extend_from_slice(&self.header_size.to_be_bytes());
            // Compression type zlib plus padding, for header sizes past the bare header.
            buf.resize(self.header_size as usize, 0);
        }

        if let Some(format) = self.backing_file.as_ref().and_then(|b| b.format) {
            let name = format.to_string();
            buf.extend_from_slice(&HEADER_EXT_BACKING_FORMAT.to_be_bytes());
            buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.resize(buf.len().next_multiple_of(8), 0);
        }
        // End of the header extension area.
        buf.extend_from_slice(&[0u8; HEADER_EXT_HEADER_SIZE as usize]);

        if let Some(backing_file) = &self.backing_file {
            buf.resize(self.backing_file_offset as usize, 0);
            buf.extend_from_slice(backing_file.path.as_bytes());
        }
        buf
    }

    /// Writes a freshly created header to `file`, with a zeroed L1 table and refcount table.
    pub fn write_to(&self, file: &File) -> Result<()> {
        file.write_all_at(&self.encode(), 0)
            .map_err(Error::WritingHeader)?;
        // Extending the file zeroes the L1 and refcount table clusters without allocating them.
        let refcount_table_size = u64::from(self.refcount_table_clusters) << self.cluster_bits;
        file.set_len(self.refcount_table_offset + refcount_table_size)
            .map_err(Error::SettingFileSize)
    }

    /// Rewrites only the refcount table location fields, leaving the rest of the header alone.
    pub(crate) fn write_refcount_table_location(&self, file: &File) -> Result<()> {
        let mut fields = encode_pointer_table(&[self.refcount_table_offset]);
        fields.extend_from_slice(&self.refcount_table_clusters.to_be_bytes());
        file.write_all_at(&fields, REFCOUNT_TABLE_OFFSET_FIELD)
            .map_err(Error::WritingHeader)
    }

    pub fn cluster_size(&self) -> u64 {
        0x01 << self.cluster_bits
    }

    pub fn is_dirty(&self) -> bool {
        IncompatFeatures::from_bits_truncate(self.incompatible_features)
            .contains(IncompatFeatures::DIRTY)
    }
}

// Size of a header extension holding `len` bytes of data, padded to 8 bytes.
fn extension_size(len: u64) -> u64 {
    HEADER_EXT_HEADER_SIZE + len.next_multiple_of(8)
}

pub(crate) fn max_refcount_clusters(
    refcount_order: u32,
    cluster_size: u64,
    num_clusters: u64,
) -> u64 {
    let refcount_bits = 0x01u64 << u64::from(refcount_order);
    let cluster_bits = cluster_size * 8;
    let for_data = div_round_up_u64(num_clusters * refcount_bits, cluster_bits);
    let for_refcounts = div_round_up_u64(for_data * refcount_bits, cluster_bits);
    for_data + for_refcounts
}

/// Returns an Error if the given offset doesn't align to a cluster boundary.
pub(crate) fn offset_is_cluster_boundary(
    offset: u64,
    cluster_bits: u32,
) -> std::result::Result<(), FormatError> {
    if offset & ((0x01 << cluster_bits) - 1) != 0 {
        return Err(FormatError::InvalidOffset(offset));
    }
    Ok(())
}
