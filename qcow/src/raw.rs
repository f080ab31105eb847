// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Raw images: the logical bytes are the file bytes.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use vmm_sys_util::seek_hole::SeekHole;

use crate::{Error, LogicalRead, Result};

#[derive(Debug)]
pub struct RawDisk {
    file: File,
    size: u64,
}

impl RawDisk {
    /// Wraps `file`. The virtual size is the length of the file when it is opened.
    pub fn new(file: File) -> Result<Self> {
        let size = file.metadata().map_err(Error::GettingFileSize)?.len();
        Ok(RawDisk { file, size })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Returns false when the range `[offset, offset + len)` is a hole of the file, so it is
    /// known to read as zeros without reading it.
    pub fn has_data(&self, offset: u64, len: u64) -> Result<bool> {
        // The seek position is shared with `file` but reads are positional.
        let mut file = self.file.try_clone().map_err(Error::ReadingData)?;
        match file.seek_data(offset) {
            Ok(Some(data)) => Ok(data < offset + len),
            Ok(None) => Ok(false),
            // Filesystems without hole reporting are all data.
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(true),
            Err(e) => Err(Error::ReadingData(e)),
        }
    }
}

impl LogicalRead for RawDisk {
    fn virtual_size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut nread = 0;
        while nread < buf.len() {
            match self.file.read_at(&mut buf[nread..], offset + nread as u64) {
                // Past the end of the file, the rest reads as zeros.
                Ok(0) => {
                    buf[nread..].fill(0);
                    break;
                }
                Ok(n) => nread += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::ReadingData(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod unit_tests {
    use std::io::Write;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn reads_file_bytes() {
        let mut file = TempFile::new().unwrap().into_file();
        file.write_all(b"raw disk contents").unwrap();
        let disk = RawDisk::new(file).unwrap();
        assert_eq!(disk.virtual_size(), 17);

        let mut buf = [0u8; 4];
        disk.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"disk");
    }

    #[test]
    fn zero_fill_past_end() {
        let mut file = TempFile::new().unwrap().into_file();
        file.write_all(&[0xff; 8]).unwrap();
        let disk = RawDisk::new(file).unwrap();

        let mut buf = [0xaau8; 16];
        disk.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0xff; 4]);
        assert_eq!(&buf[4..], &[0; 12]);
    }

    #[test]
    fn holes_have_no_data() {
        let file = TempFile::new().unwrap().into_file();
        file.set_len(0x40_0000).unwrap();
        file.write_all_at(&[1u8; 4096], 0x20_0000).unwrap();
        let disk = RawDisk::new(file).unwrap();

        assert!(disk.has_data(0x20_0000, 4096).unwrap());
        assert!(disk.has_data(0x1f_f000, 0x2000).unwrap());
        // Filesystems without hole support report everything as data.
        let _ = disk.has_data(0, 0x1000).unwrap();
    }
}
