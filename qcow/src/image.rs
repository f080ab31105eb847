// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Image handles: an open qcow2 image with its lock and backing chain, and `Disk`, which
//! also covers raw images for read-only work.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::chain::{self, BackingChain};
use crate::config::CreateOptions;
use crate::header::{BackingFileConfig, QcowHeader};
use crate::info::ImageInfo;
use crate::lock::{self, LockType};
use crate::qcow_file::{CheckReport, QcowFile};
use crate::raw::RawDisk;
use crate::{
    detect_image_type, Error, FormatError, ImageType, LogicalRead, ResolutionError, Result,
};

/// Lifecycle of an image handle. A handle is closed by consuming it with `Image::close`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageState {
    /// Freshly created, nothing read or written yet.
    Created,
    /// Idle.
    Open,
    /// At least one read in progress.
    Reading,
    /// A write or metadata commit in progress. Excludes reads and other writes.
    Writing,
}

// Counts a handle as busy for as long as it lives.
struct Activity<'a>(&'a AtomicUsize);

impl<'a> Activity<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Activity(counter)
    }
}

impl Drop for Activity<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn file_allocated_size(path: &Path) -> Result<u64> {
    let metadata = std::fs::metadata(path).map_err(Error::GettingFileSize)?;
    Ok(metadata.blocks() * 512)
}

/// An open qcow2 image.
///
/// Many threads may read through a shared handle at once. A write waits for the reads in
/// progress and holds the image alone until its metadata is committed.
#[derive(Debug)]
pub struct Image {
    path: PathBuf,
    qcow: RwLock<QcowFile>,
    chain: Arc<BackingChain>,
    fresh: AtomicBool,
    readers: AtomicUsize,
    writers: AtomicUsize,
}

impl Image {
    /// Creates a qcow2 image at `path`. With a backing image the size defaults to the backing
    /// image's virtual size.
    pub fn create(path: &Path, backing: Option<&Path>, virtual_size: Option<u64>) -> Result<Image> {
        Self::create_with(
            path,
            &CreateOptions {
                size: virtual_size,
                backing_file: backing.map(Path::to_path_buf),
                ..Default::default()
            },
        )
    }

    pub fn create_with(path: &Path, options: &CreateOptions) -> Result<Image> {
        let cluster_bits = options.validate()?;

        let backing_chain = options
            .backing_file
            .as_deref()
            .map(chain::resolve)
            .transpose()?;
        if let Some(backing_chain) = &backing_chain {
            // An image cannot back itself, anywhere in its chain.
            match path.canonicalize() {
                Ok(canonical) => {
                    if backing_chain.links().iter().any(|link| link.path == canonical) {
                        return Err(ResolutionError::CycleDetected(canonical).into());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::OpeningFile(path.to_path_buf(), e)),
            }
        }

        let mut backing_size = None;
        let backing_config = match &backing_chain {
            Some(backing_chain) => {
                let parent = backing_chain.top();
                if let Some(declared) = options.backing_format {
                    if declared != parent.format {
                        return Err(ResolutionError::FormatMismatch {
                            path: parent.path.clone(),
                            declared,
                            detected: parent.format,
                        }
                        .into());
                    }
                }
                backing_size = Some(parent.virtual_size);
                let backing_path = parent.path.to_str().ok_or_else(|| {
                    Error::InvalidOption(format!(
                        "backing file path {} is not UTF-8",
                        parent.path.display()
                    ))
                })?;
                Some(BackingFileConfig {
                    path: backing_path.to_string(),
                    format: Some(parent.format),
                })
            }
            None => None,
        };
        let size = options
            .size
            .or(backing_size)
            .ok_or_else(|| Error::InvalidOption("virtual size is required".to_string()))?;

        let header = QcowHeader::create_for_size_and_path(
            options.version,
            size,
            cluster_bits,
            backing_config.as_ref(),
        )?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::OpeningFile(path.to_path_buf(), e))?;
        // Never clobber an image someone else has open.
        lock::try_acquire_lock(&file, LockType::Write, path)?;
        file.set_len(0).map_err(Error::SettingFileSize)?;

        let qcow = QcowFile::create(file, &header)?;
        debug!(
            "Created {} with virtual size {size}, backing {:?}",
            path.display(),
            backing_config.as_ref().map(|b| &b.path)
        );
        let image = Self::with_chain(path, qcow)?;
        image.fresh.store(true, Ordering::SeqCst);
        Ok(image)
    }

    /// Opens a qcow2 image for reading and writing. The image is locked exclusively.
    pub fn open(path: &Path) -> Result<Image> {
        Self::open_with_access(path, true)
    }

    /// Opens a qcow2 image for reading only. The image is locked shared, so other readers may
    /// open it too.
    pub fn open_read_only(path: &Path) -> Result<Image> {
        Self::open_with_access(path, false)
    }

    fn open_with_access(path: &Path, writable: bool) -> Result<Image> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| Error::OpeningFile(path.to_path_buf(), e))?;
        lock::try_acquire_lock(&file, LockType::for_access(writable), path)?;
        if detect_image_type(&file)? != ImageType::Qcow2 {
            return Err(FormatError::BadMagic.into());
        }
        let qcow = QcowFile::from(file, writable)?;
        Self::with_chain(path, qcow)
    }

    fn with_chain(path: &Path, mut qcow: QcowFile) -> Result<Image> {
        let chain = Arc::new(chain::resolve(path)?);
        qcow.set_backing_file(chain.open_backing(0)?);
        Ok(Image {
            path: path.to_path_buf(),
            qcow: RwLock::new(qcow),
            chain,
            fresh: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The resolved chain, this image first.
    pub fn chain(&self) -> &Arc<BackingChain> {
        &self.chain
    }

    pub fn header(&self) -> QcowHeader {
        self.qcow.read().unwrap().header().clone()
    }

    pub fn virtual_size(&self) -> u64 {
        self.qcow.read().unwrap().virtual_size()
    }

    pub fn cluster_size(&self) -> u64 {
        self.qcow.read().unwrap().cluster_size()
    }

    pub fn is_writable(&self) -> bool {
        self.qcow.read().unwrap().is_writable()
    }

    pub fn state(&self) -> ImageState {
        if self.writers.load(Ordering::SeqCst) > 0 {
            ImageState::Writing
        } else if self.readers.load(Ordering::SeqCst) > 0 {
            ImageState::Reading
        } else if self.fresh.load(Ordering::SeqCst) {
            ImageState::Created
        } else {
            ImageState::Open
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let qcow = self.qcow.read().unwrap();
        let _reading = Activity::start(&self.readers);
        self.fresh.store(false, Ordering::SeqCst);
        qcow.read_at(offset, buf)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut qcow = self.qcow.write().unwrap();
        let _writing = Activity::start(&self.writers);
        self.fresh.store(false, Ordering::SeqCst);
        qcow.write_at(offset, buf)
    }

    /// True if this image stores the guest cluster containing `offset` itself, rather than
    /// leaving it to the backing chain.
    pub fn cluster_allocated(&self, offset: u64) -> Result<bool> {
        self.qcow.read().unwrap().cluster_allocated(offset)
    }

    pub fn flush(&self) -> Result<()> {
        let mut qcow = self.qcow.write().unwrap();
        let _writing = Activity::start(&self.writers);
        qcow.flush()
    }

    pub fn check(&self) -> Result<CheckReport> {
        let mut qcow = self.qcow.write().unwrap();
        let _writing = Activity::start(&self.writers);
        qcow.check()
    }

    pub fn info(&self) -> Result<ImageInfo> {
        let header = self.header();
        let backing = header.backing_file.as_ref();
        Ok(ImageInfo {
            filename: self.path.display().to_string(),
            format: ImageType::Qcow2,
            virtual_size: header.size,
            actual_size: file_allocated_size(&self.path)?,
            cluster_size: Some(header.cluster_size()),
            backing_filename: backing.map(|b| b.path.clone()),
            backing_filename_format: backing.and_then(|b| {
                b.format
                    .or_else(|| self.chain.backing().map(|link| link.format))
            }),
            dirty_flag: Some(header.is_dirty()),
        })
    }

    /// Commits everything and releases the image and its backing images.
    pub fn close(self) -> Result<()> {
        let mut qcow = self.qcow.into_inner().unwrap();
        qcow.flush()?;
        lock::clear_lock(qcow.file(), &self.path)
    }
}

impl LogicalRead for Image {
    fn virtual_size(&self) -> u64 {
        Image::virtual_size(self)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        Image::read_at(self, offset, buf)
    }
}

/// An image of either format, opened read-only.
#[derive(Debug)]
pub enum Disk {
    Raw { path: PathBuf, disk: RawDisk },
    Qcow2(Image),
}

impl Disk {
    /// Opens the image at `path` read-only, detecting its format.
    pub fn open(path: &Path) -> Result<Disk> {
        let file = File::open(path).map_err(|e| Error::OpeningFile(path.to_path_buf(), e))?;
        match detect_image_type(&file)? {
            ImageType::Raw => {
                lock::try_acquire_lock(&file, LockType::Read, path)?;
                Ok(Disk::Raw {
                    path: path.to_path_buf(),
                    disk: RawDisk::new(file)?,
                })
            }
            ImageType::Qcow2 => {
                drop(file);
                Ok(Disk::Qcow2(Image::open_read_only(path)?))
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Disk::Raw { path, .. } => path,
            Disk::Qcow2(image) => image.path(),
        }
    }

    pub fn format(&self) -> ImageType {
        match self {
            Disk::Raw { .. } => ImageType::Raw,
            Disk::Qcow2(_) => ImageType::Qcow2,
        }
    }

    /// Cluster size of qcow2 images, `None` for raw images.
    pub fn cluster_size(&self) -> Option<u64> {
        match self {
            Disk::Raw { .. } => None,
            Disk::Qcow2(image) => Some(image.cluster_size()),
        }
    }

    pub fn info(&self) -> Result<ImageInfo> {
        match self {
            Disk::Raw { path, disk } => Ok(ImageInfo {
                filename: path.display().to_string(),
                format: ImageType::Raw,
                virtual_size: disk.virtual_size(),
                actual_size: file_allocated_size(path)?,
                cluster_size: None,
                backing_filename: None,
                backing_filename_format: None,
                dirty_flag: None,
            }),
            Disk::Qcow2(image) => image.info(),
        }
    }
}

impl LogicalRead for Disk {
    fn virtual_size(&self) -> u64 {
        match self {
            Disk::Raw { disk, .. } => disk.virtual_size(),
            Disk::Qcow2(image) => image.virtual_size(),
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Disk::Raw { disk, .. } => disk.read_at(offset, buf),
            Disk::Qcow2(image) => image.read_at(offset, buf),
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use std::fs;
    use std::sync::Barrier;
    use std::thread;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::{ErrorClass, ResourceError};

    #[test]
    fn create_then_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("disk.qcow2");
        let image = Image::create(&path, None, Some(0x10_0000)).unwrap();
        assert_eq!(image.state(), ImageState::Created);
        assert!(image.is_writable());
        image.write_at(0, b"hello").unwrap();
        assert_eq!(image.state(), ImageState::Open);
        image.close().unwrap();

        let image = Image::open_read_only(&path).unwrap();
        assert!(!image.is_writable());
        let mut buf = [0u8; 5];
        image.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(matches!(image.write_at(0, b"x"), Err(Error::NotWritable)));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("disk.qcow2");
        let image = Image::create(&path, None, Some(0x10_0000)).unwrap();

        let err = Image::open(&path).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Resource);
        assert!(matches!(
            err,
            Error::Resource(ResourceError::Locked(ref locked)) if locked == &path
        ));
        assert!(Image::open_read_only(&path).is_err());
        assert!(Image::create(&path, None, Some(0x1000)).is_err());

        image.close().unwrap();
        let reader = Image::open_read_only(&path).unwrap();
        let other_reader = Image::open_read_only(&path).unwrap();
        assert!(Image::open(&path).is_err());
        drop(reader);
        drop(other_reader);
        Image::open(&path).unwrap();
    }

    #[test]
    fn size_defaults_to_backing() {
        let dir = TempDir::new().unwrap();
        let base = dir.as_path().join("base.raw");
        fs::write(&base, vec![3u8; 0x3000]).unwrap();
        let child = dir.as_path().join("child.qcow2");
        let image = Image::create(&child, Some(&base), None).unwrap();
        assert_eq!(image.virtual_size(), 0x3000);

        let info = image.info().unwrap();
        assert_eq!(info.backing_filename_format, Some(ImageType::Raw));
        assert!(info.backing_filename.unwrap().ends_with("base.raw"));
        assert_eq!(image.chain().depth(), 1);

        let mut buf = [0u8; 4];
        image.read_at(0x2ffc, &mut buf).unwrap();
        assert_eq!(buf, [3u8; 4]);
    }

    #[test]
    fn missing_size_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("disk.qcow2");
        assert!(matches!(
            Image::create(&path, None, None),
            Err(Error::InvalidOption(_))
        ));
    }

    #[test]
    fn declared_backing_format_must_match() {
        let dir = TempDir::new().unwrap();
        let base = dir.as_path().join("base.raw");
        fs::write(&base, [0u8; 512]).unwrap();
        let options = CreateOptions {
            size: Some(0x10_0000),
            backing_file: Some(base),
            backing_format: Some(ImageType::Qcow2),
            ..Default::default()
        };
        assert!(matches!(
            Image::create_with(&dir.as_path().join("child.qcow2"), &options),
            Err(Error::Resolution(ResolutionError::FormatMismatch { .. }))
        ));
    }

    #[test]
    fn raw_is_not_opened_as_qcow2() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("disk.raw");
        fs::write(&path, [0u8; 4096]).unwrap();
        assert!(matches!(
            Image::open(&path),
            Err(Error::Format(FormatError::BadMagic))
        ));

        let disk = Disk::open(&path).unwrap();
        assert_eq!(disk.format(), ImageType::Raw);
        assert_eq!(disk.cluster_size(), None);
        let info = disk.info().unwrap();
        assert_eq!(info.virtual_size, 4096);
        assert_eq!(info.dirty_flag, None);
    }

    #[test]
    fn concurrent_readers() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("disk.qcow2");
        let image = Image::create(&path, None, Some(0x40_0000)).unwrap();
        for i in 0..4u8 {
            image
                .write_at(u64::from(i) * 0x10_0000, &[i + 1; 0x1000])
                .unwrap();
        }

        let barrier = Barrier::new(4);
        thread::scope(|s| {
            for i in 0..4u8 {
                let image = &image;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let mut buf = [0u8; 0x1000];
                    image.read_at(u64::from(i) * 0x10_0000, &mut buf).unwrap();
                    assert_eq!(buf, [i + 1; 0x1000]);
                });
            }
        });
        assert_eq!(image.state(), ImageState::Open);
        assert!(image.check().unwrap().is_clean());
    }

    #[test]
    fn close_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("disk.qcow2");
        let image = Image::create(&path, None, Some(0x10_0000)).unwrap();
        // Shares the handle's open file description, and so its lock.
        let held = image.qcow.read().unwrap().file().try_clone().unwrap();
        image.close().unwrap();

        let other = File::open(&path).unwrap();
        assert!(!lock::is_locked(&other, LockType::Write).unwrap());
        Image::open(&path).unwrap();
        drop(held);
    }

    #[test]
    fn image_cannot_back_itself() {
        let dir = TempDir::new().unwrap();
        let base = dir.as_path().join("base.raw");
        fs::write(&base, vec![0xab; 0x10_0000]).unwrap();

        let err = Image::create(&base, Some(&base), None).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Resolution);
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::CycleDetected(ref cycle))
                if cycle == &base.canonicalize().unwrap()
        ));
        assert_eq!(fs::read(&base).unwrap(), vec![0xab; 0x10_0000]);

        // Same through a qcow2 child sitting on top of the file being created.
        let child = dir.as_path().join("child.qcow2");
        Image::create(&child, Some(&base), None).unwrap().close().unwrap();
        let before = fs::read(&base).unwrap();
        assert!(matches!(
            Image::create(&base, Some(&child), None),
            Err(Error::Resolution(ResolutionError::CycleDetected(_)))
        ));
        assert_eq!(fs::read(&base).unwrap(), before);
    }
}
