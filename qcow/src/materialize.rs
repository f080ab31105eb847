// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Whole-image operations on the logical content: reading, hashing, flattening and copying.

use std::cmp::min;
use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;

use log::debug;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::chain::BackingFile;
use crate::config::{CopyOptions, CreateOptions};
use crate::image::{Disk, Image};
use crate::{Error, LogicalRead, Result};

// Hashing reads the image in chunks of this size.
const HASH_CHUNK_SIZE: usize = 1 << 20;
// Largest run of clusters written at once by flatten and copy.
const MAX_WRITE_RUN: usize = 1 << 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DigestAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Sha1 => write!(f, "sha1"),
            DigestAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            _ => Err(Error::InvalidOption(format!("unknown digest algorithm: {s}"))),
        }
    }
}

/// Reads `length` logical bytes at `offset`: the image's own data, else the backing chain's,
/// else zeros.
pub fn read_range<R: LogicalRead + ?Sized>(image: &R, offset: u64, length: u64) -> Result<Vec<u8>> {
    let size = image.virtual_size();
    match offset.checked_add(length) {
        Some(end) if end <= size => {}
        _ => {
            return Err(Error::InvalidRange {
                offset,
                len: length,
                size,
            })
        }
    }
    let mut buf = vec![0u8; length as usize];
    image.read_at(offset, &mut buf)?;
    Ok(buf)
}

/// Hex digest of the whole logical content of `image`.
pub fn hash<R: LogicalRead + ?Sized>(image: &R, algorithm: DigestAlgorithm) -> Result<String> {
    match algorithm {
        DigestAlgorithm::Sha1 => digest::<Sha1, R>(image),
        DigestAlgorithm::Sha256 => digest::<Sha256, R>(image),
    }
}

fn digest<D: Digest, R: LogicalRead + ?Sized>(image: &R) -> Result<String> {
    let mut hasher = D::new();
    let size = image.virtual_size();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    let mut offset = 0;
    while offset < size {
        let count = min(HASH_CHUNK_SIZE as u64, size - offset) as usize;
        image.read_at(offset, &mut buf[..count])?;
        hasher.update(&buf[..count]);
        offset += count as u64;
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

// Collects adjacent clusters so they are committed with one write.
struct WriteRun<'a> {
    dest: &'a Image,
    start: u64,
    data: Vec<u8>,
    written_clusters: u64,
}

impl<'a> WriteRun<'a> {
    fn new(dest: &'a Image) -> Self {
        WriteRun {
            dest,
            start: 0,
            data: Vec::with_capacity(MAX_WRITE_RUN),
            written_clusters: 0,
        }
    }

    fn push(&mut self, offset: u64, cluster: &[u8]) -> Result<()> {
        if !self.data.is_empty()
            && (self.start + self.data.len() as u64 != offset
                || self.data.len() + cluster.len() > MAX_WRITE_RUN)
        {
            self.flush()?;
        }
        if self.data.is_empty() {
            self.start = offset;
        }
        self.data.extend_from_slice(cluster);
        self.written_clusters += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.data.is_empty() {
            self.dest.write_at(self.start, &self.data)?;
            self.data.clear();
        }
        Ok(())
    }
}

// Reads `source` one destination cluster at a time and writes the clusters `wanted` selects.
fn copy_clusters<F>(source: &Disk, dest: &Image, mut wanted: F) -> Result<u64>
where
    F: FnMut(u64, &[u8]) -> Result<bool>,
{
    let cluster_size = dest.cluster_size();
    let size = source.virtual_size();
    let mut buf = vec![0u8; cluster_size as usize];
    let mut run = WriteRun::new(dest);
    let mut offset = 0;
    while offset < size {
        let count = min(cluster_size, size - offset) as usize;
        let chunk = &mut buf[..count];
        match source {
            Disk::Raw { disk, .. } if !disk.has_data(offset, count as u64)? => chunk.fill(0),
            _ => source.read_at(offset, chunk)?,
        }
        if wanted(offset, chunk)? {
            run.push(offset, chunk)?;
        }
        offset += count as u64;
    }
    run.flush()?;
    dest.flush()?;
    Ok(run.written_clusters)
}

fn is_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

fn create_options(source: &Disk) -> CreateOptions {
    let mut options = CreateOptions {
        size: Some(source.virtual_size()),
        ..Default::default()
    };
    if let Some(cluster_size) = source.cluster_size() {
        options.cluster_size = cluster_size;
    }
    options
}

/// Writes the logical content of `source` to a new qcow2 image at `dest` without a backing
/// file. Clusters that read as zeros are left unallocated.
pub fn flatten(source: &Disk, dest: &Path) -> Result<Image> {
    let image = Image::create_with(dest, &create_options(source))?;
    let written = copy_clusters(source, &image, |_, data| Ok(!is_zero(data)))?;
    debug!(
        "Flattened {} into {}: {written} clusters",
        source.path().display(),
        dest.display()
    );
    Ok(image)
}

/// Copies `source` to a new qcow2 image at `dest` with the same logical content.
///
/// With a parent the copy is backed by it and stores only the clusters that differ from it.
/// Without one the copy keeps the backing file of `source` and stores the clusters `source`
/// stores itself. A raw source without a parent is flattened.
pub fn copy(source: &Disk, dest: &Path, options: &CopyOptions) -> Result<Image> {
    if let Some(parent) = &options.parent {
        let parent_disk = BackingFile::new(Box::new(Disk::open(parent)?));
        let mut create = create_options(source);
        create.backing_file = Some(parent.clone());
        let image = Image::create_with(dest, &create)?;

        let mut parent_data = vec![0u8; image.cluster_size() as usize];
        let written = copy_clusters(source, &image, |offset, data| {
            let parent_data = &mut parent_data[..data.len()];
            parent_disk.read_at(offset, parent_data)?;
            Ok(parent_data != data)
        })?;
        debug!(
            "Copied {} onto parent {}: {written} clusters differ",
            source.path().display(),
            parent.display()
        );
        return Ok(image);
    }

    match source {
        Disk::Raw { .. } => flatten(source, dest),
        Disk::Qcow2(source_image) => {
            let mut create = create_options(source);
            if let Some(backing) = source_image.chain().backing() {
                create.backing_file = Some(backing.path.clone());
                create.backing_format = Some(backing.format);
            }
            let image = Image::create_with(dest, &create)?;
            let written = copy_clusters(source, &image, |offset, _| {
                source_image.cluster_allocated(offset)
            })?;
            debug!(
                "Copied {} to {}: {written} clusters",
                source.path().display(),
                dest.display()
            );
            Ok(image)
        }
    }
}
