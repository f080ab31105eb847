// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Native engine for qcow2 and raw disk images.
//!
//! The crate is layered leaf first:
//!
//! * a big-endian codec for the qcow2 header and its L1/L2/refcount tables
//!   ([`header`], [`tables`]),
//! * a backing-chain resolver ([`chain`]),
//! * an allocator that maps guest clusters into the image file
//!   ([`qcow_file`]),
//! * a content materializer that reads, hashes, flattens and copies images
//!   through their backing chain ([`materialize`]).
//!
//! [`Image`] is the handle applications hold on to; [`Disk`] opens either
//! format for read-only work such as [`Disk::info`].

pub mod chain;
pub mod config;
pub mod header;
pub mod image;
pub mod info;
pub mod lock;
pub mod materialize;
pub mod qcow_file;
mod qcow_raw_file;
pub mod raw;
mod refcount;
pub mod tables;
mod vec_cache;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::str::{FromStr, Utf8Error};

use remain::sorted;
use serde::Serialize;
use thiserror::Error;

pub use crate::chain::{resolve, BackingChain, BackingFile, ChainLink};
pub use crate::config::{CopyOptions, CreateOptions};
pub use crate::header::{IncompatFeatures, QcowHeader};
pub use crate::image::{Disk, Image, ImageState};
pub use crate::info::ImageInfo;
pub use crate::materialize::{copy, flatten, hash, read_range, DigestAlgorithm};
pub use crate::qcow_file::{CheckReport, QcowFile};
pub use crate::raw::RawDisk;

/// Nesting depth limit for images that can open other images.
pub const MAX_NESTING_DEPTH: u32 = 10;

/// Malformed or unsupported on-disk structures. Never retried.
#[sorted]
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Backing file name is too long: {0} bytes")]
    BackingFileTooLong(usize),
    #[error("Invalid magic")]
    BadMagic,
    #[error("Compressed cluster at guest offset {0:#x} is not supported")]
    CompressedCluster(u64),
    #[error("Image was not closed cleanly and cannot be opened for writing")]
    DirtyImage,
    #[error("Encrypted images are not supported")]
    EncryptedImage,
    #[error("Virtual size larger than max of {max}: {0}", max = header::MAX_QCOW_FILE_SIZE)]
    FileTooBig(u64),
    #[error("Cluster {0:#x} overlaps the image header")]
    HeaderOverlap(u64),
    #[error("Failed to parse backing file name")]
    InvalidBackingFileName(#[source] Utf8Error),
    #[error("Backing file name at {0:#x} lies outside the header cluster")]
    InvalidBackingFileOffset(u64),
    #[error("Invalid cluster bits: {0}")]
    InvalidClusterBits(u32),
    #[error("Invalid L1 table size: {0}")]
    InvalidL1TableSize(u64),
    #[error("Offset {0:#x} is not aligned to a cluster boundary")]
    InvalidOffset(u64),
    #[error("Invalid refcount table size: {0}")]
    InvalidRefcountTableSize(u64),
    #[error("Table entry points to unaligned cluster {0:#x}")]
    MisalignedCluster(u64),
    #[error("No refcount clusters")]
    NoRefcountClusters,
    #[error("Refcount table offset past file end")]
    RefcountTableOffEnd,
    #[error("Image data ends before a required structure")]
    Truncated,
    #[error("Unsupported backing file format: {0}")]
    UnsupportedBackingFileFormat(String),
    #[error("Unsupported incompatible features: {0:?}")]
    UnsupportedFeature(IncompatFeatures),
    #[error("Unsupported refcount order: {0}")]
    UnsupportedRefcountOrder(u32),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
}

/// Problems with the chain of backing files. The referenced path or format
/// has to be fixed by the caller.
#[sorted]
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Backing chain is longer than {0} images")]
    ChainTooDeep(u32),
    #[error("Backing chain loops back to {}", .0.display())]
    CycleDetected(PathBuf),
    #[error("Backing file {} is declared as {declared} but is {detected}", .path.display())]
    FormatMismatch {
        path: PathBuf,
        declared: ImageType,
        detected: ImageType,
    },
    #[error("Backing file {} does not exist", .0.display())]
    MissingBackingFile(PathBuf),
}

/// Contention and exhaustion of local resources.
#[sorted]
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Image {} is locked by another handle", .0.display())]
    Locked(PathBuf),
    #[error("No space left to allocate a cluster")]
    NoSpace,
}

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid image")]
    Format(#[from] FormatError),
    #[error("Failed to get file size")]
    GettingFileSize(#[source] io::Error),
    #[error("Invalid option: {0}")]
    InvalidOption(String),
    #[error("Range {offset:#x}+{len:#x} is outside the virtual size {size:#x}")]
    InvalidRange { offset: u64, len: u64, size: u64 },
    #[error("Failed to check or set the image lock")]
    Locking(#[source] io::Error),
    #[error("Image handle is not writable")]
    NotWritable,
    #[error("Failed to open {}", .0.display())]
    OpeningFile(PathBuf, #[source] io::Error),
    #[error("Failed to read data")]
    ReadingData(#[source] io::Error),
    #[error("Failed to read header")]
    ReadingHeader(#[source] io::Error),
    #[error("Failed to read metadata tables")]
    ReadingMetadata(#[source] io::Error),
    #[error("Failed to resolve backing chain")]
    Resolution(#[from] ResolutionError),
    #[error("Resource unavailable")]
    Resource(#[from] ResourceError),
    #[error("Failed to set file size")]
    SettingFileSize(#[source] io::Error),
    #[error("Failed to sync file")]
    SyncingFile(#[source] io::Error),
    #[error("Failed to write data")]
    WritingData(#[source] io::Error),
    #[error("Failed to write header")]
    WritingHeader(#[source] io::Error),
    #[error("Failed to write metadata tables")]
    WritingMetadata(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by callers that only care
/// about how to react to a failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or unsupported on-disk structures.
    Format,
    /// Backing chain problems.
    Resolution,
    /// Lock contention or disk full.
    Resource,
    /// Underlying storage failures.
    Io,
    /// The caller asked for something the handle cannot do.
    Usage,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Format(_) => ErrorClass::Format,
            Error::Resolution(_) => ErrorClass::Resolution,
            Error::Resource(_) => ErrorClass::Resource,
            Error::InvalidOption(_) | Error::InvalidRange { .. } | Error::NotWritable => {
                ErrorClass::Usage
            }
            Error::GettingFileSize(_)
            | Error::Locking(_)
            | Error::OpeningFile(..)
            | Error::ReadingData(_)
            | Error::ReadingHeader(_)
            | Error::ReadingMetadata(_)
            | Error::SettingFileSize(_)
            | Error::SyncingFile(_)
            | Error::WritingData(_)
            | Error::WritingHeader(_)
            | Error::WritingMetadata(_) => ErrorClass::Io,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Raw,
    Qcow2,
}

impl Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageType::Raw => write!(f, "raw"),
            ImageType::Qcow2 => write!(f, "qcow2"),
        }
    }
}

impl FromStr for ImageType {
    type Err = FormatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ImageType::Raw),
            "qcow2" => Ok(ImageType::Qcow2),
            _ => Err(FormatError::UnsupportedBackingFileFormat(s.to_string())),
        }
    }
}

/// Read access to the logical bytes of a disk image, as a guest would see them.
pub trait LogicalRead: Send + Sync {
    /// Size of the logical byte stream.
    fn virtual_size(&self) -> u64;

    /// Fills `buf` with the logical bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Detect the type of an image file by checking for the qcow2 magic.
///
/// Files too short to hold the magic are raw.
pub fn detect_image_type(file: &File) -> Result<ImageType> {
    let mut magic = [0u8; 4];
    match file.read_exact_at(&mut magic, 0) {
        Ok(()) if u32::from_be_bytes(magic) == header::QCOW_MAGIC => Ok(ImageType::Qcow2),
        Ok(()) => Ok(ImageType::Raw),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(ImageType::Raw),
        Err(e) => Err(Error::ReadingHeader(e)),
    }
}
