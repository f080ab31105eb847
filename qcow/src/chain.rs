// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Resolution of backing chains: the list of images linked by backing file references, and the
//! read handles used to reach through them.

use std::cmp::min;
use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::header::QcowHeader;
use crate::lock::{self, LockType};
use crate::qcow_file::QcowFile;
use crate::raw::RawDisk;
use crate::{
    detect_image_type, Error, ImageType, LogicalRead, ResolutionError, Result, MAX_NESTING_DEPTH,
};

/// One image of a backing chain.
#[derive(Clone, Debug)]
pub struct ChainLink {
    /// Canonical path of the image.
    pub path: PathBuf,
    /// Format detected from the file content.
    pub format: ImageType,
    /// Format the referencing image declared, if any.
    pub declared_format: Option<ImageType>,
    pub virtual_size: u64,
    /// Header of qcow2 images. Raw images only contribute their length.
    pub header: Option<QcowHeader>,
}

/// The chain of images starting at one image and following backing references, root-most last.
#[derive(Clone, Debug)]
pub struct BackingChain {
    links: Vec<ChainLink>,
}

impl BackingChain {
    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    /// The image the chain was resolved from.
    pub fn top(&self) -> &ChainLink {
        &self.links[0]
    }

    /// The direct backing image of the top image.
    pub fn backing(&self) -> Option<&ChainLink> {
        self.links.get(1)
    }

    /// Number of backing images below the top one.
    pub fn depth(&self) -> usize {
        self.links.len() - 1
    }

    /// Opens read-only handles for every image below link `depth` and stacks them so a read
    /// through the result falls through to the next image wherever one is unallocated. Each
    /// image takes a shared lock for as long as the handle lives.
    pub fn open_backing(&self, depth: usize) -> Result<Option<BackingFile>> {
        let mut backing = None;
        for link in self.links.iter().skip(depth + 1).rev() {
            let file = OpenOptions::new()
                .read(true)
                .open(&link.path)
                .map_err(|e| Error::OpeningFile(link.path.clone(), e))?;
            lock::try_acquire_lock(&file, LockType::Read, &link.path)?;

            let inner: Box<dyn LogicalRead> = match link.format {
                ImageType::Raw => Box::new(RawDisk::new(file)?),
                ImageType::Qcow2 => {
                    let mut qcow = QcowFile::from(file, false)?;
                    qcow.set_backing_file(backing.take());
                    Box::new(qcow)
                }
            };
            backing = Some(BackingFile::new(inner));
        }
        Ok(backing)
    }
}

/// Resolves a reference found in the image at `referrer`. Relative references are relative to
/// the directory of the referencing image.
fn reference_path(referrer: &Path, reference: &str) -> PathBuf {
    let reference = Path::new(reference);
    if reference.is_absolute() {
        return reference.to_path_buf();
    }
    referrer
        .parent()
        .map_or_else(|| reference.to_path_buf(), |dir| dir.join(reference))
}

/// Opens `path` read-only, then each image it references in turn, until an image without a
/// backing reference is reached.
pub fn resolve(path: &Path) -> Result<BackingChain> {
    let mut links: Vec<ChainLink> = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some((path.to_path_buf(), None));

    while let Some((path, declared_format)) = next.take() {
        let canonical = match fs::canonicalize(&path) {
            Ok(canonical) => canonical,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !links.is_empty() => {
                return Err(ResolutionError::MissingBackingFile(path).into());
            }
            Err(e) => return Err(Error::OpeningFile(path, e)),
        };
        if !seen.insert(canonical.clone()) {
            return Err(ResolutionError::CycleDetected(canonical).into());
        }
        if links.len() > MAX_NESTING_DEPTH as usize {
            return Err(ResolutionError::ChainTooDeep(MAX_NESTING_DEPTH).into());
        }

        let file = File::open(&canonical).map_err(|e| Error::OpeningFile(canonical.clone(), e))?;
        let format = detect_image_type(&file)?;
        if let Some(declared) = declared_format {
            if declared != format {
                return Err(ResolutionError::FormatMismatch {
                    path: canonical,
                    declared,
                    detected: format,
                }
                .into());
            }
        }

        let (virtual_size, header) = match format {
            ImageType::Raw => (file.metadata().map_err(Error::GettingFileSize)?.len(), None),
            ImageType::Qcow2 => {
                let header = QcowHeader::read_from(&file)?;
                if let Some(backing) = &header.backing_file {
                    next = Some((reference_path(&canonical, &backing.path), backing.format));
                }
                (header.size, Some(header))
            }
        };
        debug!(
            "Chain link {}: {} {format} image of {virtual_size} bytes",
            links.len(),
            canonical.display()
        );

        links.push(ChainLink {
            path: canonical,
            format,
            declared_format,
            virtual_size,
            header,
        });
    }

    Ok(BackingChain { links })
}

/// Read handle of a backing image. Reads past the end of a shorter backing image return zeros.
pub struct BackingFile {
    inner: Box<dyn LogicalRead>,
}

impl BackingFile {
    pub fn new(inner: Box<dyn LogicalRead>) -> Self {
        BackingFile { inner }
    }

    pub fn virtual_size(&self) -> u64 {
        self.inner.virtual_size()
    }

    pub fn read_at(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let size = self.inner.virtual_size();
        if address >= size {
            buf.fill(0);
            return Ok(());
        }
        let count = min(buf.len() as u64, size - address) as usize;
        let (head, tail) = buf.split_at_mut(count);
        self.inner.read_at(address, head)?;
        tail.fill(0);
        Ok(())
    }
}

impl Debug for BackingFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingFile")
            .field("virtual_size", &self.inner.virtual_size())
            .finish()
    }
}

#[cfg(test)]
mod unit_tests {
    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::header::{BackingFileConfig, DEFAULT_CLUSTER_BITS};

    fn create_qcow(path: &Path, size: u64, backing: Option<(&str, Option<ImageType>)>) {
        let config = backing.map(|(path, format)| BackingFileConfig {
            path: path.to_string(),
            format,
        });
        let header =
            QcowHeader::create_for_size_and_path(3, size, DEFAULT_CLUSTER_BITS, config.as_ref())
                .unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .unwrap();
        QcowFile::create(file, &header).unwrap();
    }

    fn create_raw(path: &Path, data: &[u8]) {
        fs::write(path, data).unwrap();
    }

    #[test]
    fn single_image() {
        let dir = TempDir::new().unwrap();
        let base = dir.as_path().join("base.qcow2");
        create_qcow(&base, 0x10_0000, None);

        let chain = resolve(&base).unwrap();
        assert_eq!(chain.depth(), 0);
        assert_eq!(chain.top().format, ImageType::Qcow2);
        assert_eq!(chain.top().virtual_size, 0x10_0000);
        assert!(chain.backing().is_none());
        assert!(chain.open_backing(0).unwrap().is_none());
    }

    #[test]
    fn relative_references_follow_the_referrer() {
        let dir = TempDir::new().unwrap();
        create_raw(&dir.as_path().join("root.raw"), &[7u8; 0x1000]);
        create_qcow(
            &dir.as_path().join("mid.qcow2"),
            0x10_0000,
            Some(("root.raw", Some(ImageType::Raw))),
        );
        let sub = dir.as_path().join("sub");
        fs::create_dir(&sub).unwrap();
        let top = sub.join("top.qcow2");
        create_qcow(&top, 0x10_0000, Some(("../mid.qcow2", None)));

        let chain = resolve(&top).unwrap();
        let formats: Vec<_> = chain.links().iter().map(|l| l.format).collect();
        assert_eq!(
            formats,
            [ImageType::Qcow2, ImageType::Qcow2, ImageType::Raw]
        );
        assert_eq!(chain.links()[2].virtual_size, 0x1000);
        assert_eq!(chain.links()[2].declared_format, Some(ImageType::Raw));
        assert!(chain.links()[2].header.is_none());

        // Reads through both backing images, zeros past the shorter raw root.
        let backing = chain.open_backing(0).unwrap().unwrap();
        assert_eq!(backing.virtual_size(), 0x10_0000);
        let mut buf = [0xffu8; 16];
        backing.read_at(0xff8, &mut buf).unwrap();
        assert_eq!(buf, [7, 7, 7, 7, 7, 7, 7, 7, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn missing_backing_file() {
        let dir = TempDir::new().unwrap();
        let top = dir.as_path().join("top.qcow2");
        create_qcow(&top, 0x10_0000, Some(("gone.qcow2", None)));

        match resolve(&top) {
            Err(Error::Resolution(ResolutionError::MissingBackingFile(path))) => {
                assert!(path.ends_with("gone.qcow2"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            resolve(&dir.as_path().join("nothing.qcow2")),
            Err(Error::OpeningFile(..))
        ));
    }

    #[test]
    fn cycles_detected() {
        let dir = TempDir::new().unwrap();
        let a = dir.as_path().join("a.qcow2");
        let b = dir.as_path().join("b.qcow2");
        create_qcow(&a, 0x10_0000, Some(("b.qcow2", None)));
        create_qcow(&b, 0x10_0000, Some(("a.qcow2", None)));
        assert!(matches!(
            resolve(&a),
            Err(Error::Resolution(ResolutionError::CycleDetected(_)))
        ));

        let own = dir.as_path().join("own.qcow2");
        create_qcow(&own, 0x10_0000, Some(("own.qcow2", None)));
        assert!(matches!(
            resolve(&own),
            Err(Error::Resolution(ResolutionError::CycleDetected(_)))
        ));
    }

    #[test]
    fn format_mismatch() {
        let dir = TempDir::new().unwrap();
        create_raw(&dir.as_path().join("base.raw"), &[0u8; 512]);
        let top = dir.as_path().join("top.qcow2");
        create_qcow(&top, 0x10_0000, Some(("base.raw", Some(ImageType::Qcow2))));

        match resolve(&top) {
            Err(Error::Resolution(ResolutionError::FormatMismatch {
                declared, detected, ..
            })) => {
                assert_eq!(declared, ImageType::Qcow2);
                assert_eq!(detected, ImageType::Raw);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn chain_depth_limit() {
        let dir = TempDir::new().unwrap();
        create_qcow(&dir.as_path().join("0.qcow2"), 0x10_0000, None);
        for i in 1..=MAX_NESTING_DEPTH {
            let reference = format!("{}.qcow2", i - 1);
            create_qcow(
                &dir.as_path().join(format!("{i}.qcow2")),
                0x10_0000,
                Some((&reference, None)),
            );
        }
        let deepest = dir.as_path().join(format!("{MAX_NESTING_DEPTH}.qcow2"));
        assert_eq!(resolve(&deepest).unwrap().depth(), MAX_NESTING_DEPTH as usize);

        let reference = format!("{MAX_NESTING_DEPTH}.qcow2");
        let too_deep = dir.as_path().join("too_deep.qcow2");
        create_qcow(&too_deep, 0x10_0000, Some((&reference, None)));
        assert!(matches!(
            resolve(&too_deep),
            Err(Error::Resolution(ResolutionError::ChainTooDeep(
                MAX_NESTING_DEPTH
            )))
        ));
    }

    #[test]
    fn backing_reads_fall_through() {
        let dir = TempDir::new().unwrap();
        let base = dir.as_path().join("base.qcow2");
        create_qcow(&base, 0x20_0000, None);
        {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&base)
                .unwrap();
            let mut qcow = QcowFile::from(file, true).unwrap();
            qcow.write_at(0x1_0000, b"base data").unwrap();
        }
        let top = dir.as_path().join("top.qcow2");
        create_qcow(&top, 0x20_0000, Some(("base.qcow2", None)));

        let chain = resolve(&top).unwrap();
        let backing = chain.open_backing(0).unwrap().unwrap();
        let mut buf = [0u8; 9];
        backing.read_at(0x1_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"base data");

        // The backing image is locked shared while the handle lives.
        let file = File::open(&base).unwrap();
        assert!(lock::is_locked(&file, LockType::Write).unwrap());
        assert!(!lock::is_locked(&file, LockType::Read).unwrap());
        drop(backing);
        assert!(!lock::is_locked(&file, LockType::Write).unwrap());
    }
}
