// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Encoding of the qcow2 pointer tables (L1, L2, refcount table) and of
//! refcount blocks. Every entry is stored big-endian.

use std::mem::size_of;

use byteorder::{BigEndian, ByteOrder};

use crate::FormatError;

pub const L1_TABLE_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
pub const L2_TABLE_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
pub const ZERO_FLAG: u64 = 1 << 0;
pub const COMPRESSED_FLAG: u64 = 1 << 62;
pub const CLUSTER_USED_FLAG: u64 = 1 << 63;

/// Decodes a table of big-endian u64 entries.
pub fn decode_pointer_table(bytes: &[u8]) -> Result<Vec<u64>, FormatError> {
    if bytes.len() % size_of::<u64>() != 0 {
        return Err(FormatError::Truncated);
    }
    let mut table = vec![0u64; bytes.len() / size_of::<u64>()];
    BigEndian::read_u64_into(bytes, &mut table);
    Ok(table)
}

pub fn encode_pointer_table(entries: &[u64]) -> Vec<u8> {
    let mut bytes = vec![0u8; entries.len() * size_of::<u64>()];
    BigEndian::write_u64_into(entries, &mut bytes);
    bytes
}

/// Decodes a refcount block holding 16-bit refcounts.
pub fn decode_refcount_block(bytes: &[u8]) -> Result<Vec<u16>, FormatError> {
    if bytes.len() % size_of::<u16>() != 0 {
        return Err(FormatError::Truncated);
    }
    let mut block = vec![0u16; bytes.len() / size_of::<u16>()];
    BigEndian::read_u16_into(bytes, &mut block);
    Ok(block)
}

pub fn encode_refcount_block(refcounts: &[u16]) -> Vec<u8> {
    let mut bytes = vec![0u8; refcounts.len() * size_of::<u16>()];
    BigEndian::write_u16_into(refcounts, &mut bytes);
    bytes
}

pub(crate) fn l2_entry_is_empty(l2_entry: u64) -> bool {
    l2_entry == 0
}

// Check bit 0 - only valid for standard clusters.
pub(crate) fn l2_entry_is_zero(l2_entry: u64) -> bool {
    l2_entry & ZERO_FLAG != 0
}

pub(crate) fn l2_entry_is_compressed(l2_entry: u64) -> bool {
    l2_entry & COMPRESSED_FLAG != 0
}

// Get file offset of a standard (non-compressed) cluster.
pub(crate) fn l2_entry_std_cluster_addr(l2_entry: u64) -> u64 {
    l2_entry & L2_TABLE_OFFSET_MASK
}

// Make an L2 entry for a standard cluster owned by this image only.
pub(crate) fn l2_entry_make_std(cluster_addr: u64) -> u64 {
    (cluster_addr & L2_TABLE_OFFSET_MASK) | CLUSTER_USED_FLAG
}

// Make an L1 entry, flagging tables whose refcount is exactly one.
pub(crate) fn l1_entry_make(cluster_addr: u64, refcount_is_one: bool) -> u64 {
    (cluster_addr & L1_TABLE_OFFSET_MASK) | (refcount_is_one as u64 * CLUSTER_USED_FLAG)
}

pub(crate) fn div_round_up_u64(dividend: u64, divisor: u64) -> u64 {
    dividend.div_ceil(divisor)
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn pointer_table_is_big_endian() {
        let bytes = encode_pointer_table(&[0x1_0000, CLUSTER_USED_FLAG | 0x3_0000]);
        assert_eq!(
            bytes,
            [
                0, 0, 0, 0, 0, 1, 0, 0, //
                0x80, 0, 0, 0, 0, 3, 0, 0,
            ]
        );
        assert_eq!(
            decode_pointer_table(&bytes).unwrap(),
            [0x1_0000, CLUSTER_USED_FLAG | 0x3_0000]
        );
    }

    #[test]
    fn refcount_block_is_big_endian() {
        let bytes = encode_refcount_block(&[1, 0x0203]);
        assert_eq!(bytes, [0, 1, 2, 3]);
        assert_eq!(decode_refcount_block(&bytes).unwrap(), [1, 0x0203]);
    }

    #[test]
    fn partial_entries_are_truncated() {
        assert!(matches!(
            decode_pointer_table(&[0u8; 12]),
            Err(FormatError::Truncated)
        ));
        assert!(matches!(
            decode_refcount_block(&[0u8; 3]),
            Err(FormatError::Truncated)
        ));
    }

    #[test]
    fn l2_entry_flags() {
        let entry = l2_entry_make_std(0x5_0000);
        assert!(!l2_entry_is_empty(entry));
        assert!(!l2_entry_is_zero(entry));
        assert!(!l2_entry_is_compressed(entry));
        assert_eq!(l2_entry_std_cluster_addr(entry), 0x5_0000);
        assert!(l2_entry_is_zero(entry | ZERO_FLAG));
        assert_eq!(l2_entry_std_cluster_addr(entry | ZERO_FLAG), 0x5_0000);
        assert!(l2_entry_is_compressed(COMPRESSED_FLAG | 0x1234));
    }

    #[test]
    fn l1_entry_copied_flag() {
        assert_eq!(l1_entry_make(0x2_0000, true), CLUSTER_USED_FLAG | 0x2_0000);
        assert_eq!(l1_entry_make(0x2_0000, false), 0x2_0000);
    }
}
