// Copyright © 2020 Intel Corporation
//
// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0
//

//! Options for creating and copying images, parsed from `key=value,...` strings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::header::{DEFAULT_CLUSTER_BITS, MAX_CLUSTER_BITS, MIN_CLUSTER_BITS};
use crate::{Error, ImageType, Result};

/// A size in bytes, with an optional `K`, `M`, `G` or `T` binary suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteSized(pub u64);

impl FromStr for ByteSized {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let shift = match s.chars().last() {
            Some('K') | Some('k') => 10,
            Some('M') | Some('m') => 20,
            Some('G') | Some('g') => 30,
            Some('T') | Some('t') => 40,
            _ => 0,
        };
        let digits = s.trim_end_matches(['K', 'k', 'M', 'm', 'G', 'g', 'T', 't']);
        digits
            .parse::<u64>()
            .ok()
            .and_then(|v| v.checked_mul(1 << shift))
            .map(ByteSized)
            .ok_or_else(|| Error::InvalidOption(format!("invalid size: {s}")))
    }
}

// Splits `key=value,...`, rejecting keys outside `known` and repeated keys.
fn parse_options<'a>(input: &'a str, known: &[&str]) -> Result<HashMap<&'a str, &'a str>> {
    let mut options = HashMap::new();
    if input.trim().is_empty() {
        return Ok(options);
    }
    for option in input.split(',') {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| Error::InvalidOption(format!("expected key=value: {option}")))?;
        let key = key.trim();
        if !known.contains(&key) {
            return Err(Error::InvalidOption(format!("unknown option: {key}")));
        }
        if options.insert(key, value.trim()).is_some() {
            return Err(Error::InvalidOption(format!("option given twice: {key}")));
        }
    }
    Ok(options)
}

/// How a new qcow2 image is laid out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateOptions {
    /// Virtual size. Defaults to the size of the backing image when there is one.
    pub size: Option<u64>,
    pub cluster_size: u64,
    /// qcow2 version, 2 or 3.
    pub version: u32,
    pub backing_file: Option<PathBuf>,
    /// Format of the backing image, detected when not given.
    pub backing_format: Option<ImageType>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            size: None,
            cluster_size: 1 << DEFAULT_CLUSTER_BITS,
            version: 3,
            backing_file: None,
            backing_format: None,
        }
    }
}

impl CreateOptions {
    pub const SYNTAX: &'static str = "size=<bytes>,cluster_size=<bytes>,version=<2|3>,\
        backing_file=<path>,backing_fmt=<raw|qcow2>";

    /// Returns the number of bits of the cluster size, after checking the options are coherent.
    pub fn validate(&self) -> Result<u32> {
        if !self.cluster_size.is_power_of_two() {
            return Err(Error::InvalidOption(format!(
                "cluster size {} is not a power of two",
                self.cluster_size
            )));
        }
        let cluster_bits = self.cluster_size.trailing_zeros();
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            return Err(Error::InvalidOption(format!(
                "cluster size {} must be between {} and {}",
                self.cluster_size,
                1u64 << MIN_CLUSTER_BITS,
                1u64 << MAX_CLUSTER_BITS
            )));
        }
        if self.version != 2 && self.version != 3 {
            return Err(Error::InvalidOption(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.backing_file.is_none() {
            if self.size.is_none() {
                return Err(Error::InvalidOption(
                    "size is required without a backing file".to_string(),
                ));
            }
            if self.backing_format.is_some() {
                return Err(Error::InvalidOption(
                    "backing_fmt given without backing_file".to_string(),
                ));
            }
        }
        Ok(cluster_bits)
    }
}

impl FromStr for CreateOptions {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let options = parse_options(
            s,
            &["size", "cluster_size", "version", "backing_file", "backing_fmt"],
        )?;
        let mut create = CreateOptions::default();
        if let Some(size) = options.get("size") {
            create.size = Some(size.parse::<ByteSized>()?.0);
        }
        if let Some(cluster_size) = options.get("cluster_size") {
            create.cluster_size = cluster_size.parse::<ByteSized>()?.0;
        }
        if let Some(version) = options.get("version") {
            create.version = version
                .parse()
                .map_err(|_| Error::InvalidOption(format!("invalid version: {version}")))?;
        }
        create.backing_file = options.get("backing_file").map(PathBuf::from);
        if let Some(format) = options.get("backing_fmt") {
            create.backing_format = Some(format.parse()?);
        }
        create.validate()?;
        Ok(create)
    }
}

/// How an image is copied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Image to back the copy with. Only clusters that differ from it are stored.
    pub parent: Option<PathBuf>,
}

impl CopyOptions {
    pub const SYNTAX: &'static str = "parent=<path>";
}

impl FromStr for CopyOptions {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let options = parse_options(s, &["parent"])?;
        let parent = match options.get("parent") {
            Some(parent) if parent.is_empty() => {
                return Err(Error::InvalidOption("parent path is empty".to_string()))
            }
            parent => parent.map(PathBuf::from),
        };
        Ok(CopyOptions { parent })
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn byte_sized() {
        assert_eq!("1024".parse::<ByteSized>().unwrap().0, 1024);
        assert_eq!("64K".parse::<ByteSized>().unwrap().0, 0x1_0000);
        assert_eq!(" 100M ".parse::<ByteSized>().unwrap().0, 100 << 20);
        assert_eq!("2g".parse::<ByteSized>().unwrap().0, 2 << 30);
        assert_eq!("1T".parse::<ByteSized>().unwrap().0, 1 << 40);
        assert!("M".parse::<ByteSized>().is_err());
        assert!("12X".parse::<ByteSized>().is_err());
        assert!("99999999999T".parse::<ByteSized>().is_err());
    }

    #[test]
    fn create_options_parse() {
        let options: CreateOptions = "size=1G,cluster_size=4K,version=2".parse().unwrap();
        assert_eq!(options.size, Some(1 << 30));
        assert_eq!(options.cluster_size, 4096);
        assert_eq!(options.version, 2);
        assert_eq!(options.validate().unwrap(), 12);

        let options: CreateOptions = "backing_file=base.raw,backing_fmt=raw".parse().unwrap();
        assert_eq!(options.size, None);
        assert_eq!(options.backing_file, Some(PathBuf::from("base.raw")));
        assert_eq!(options.backing_format, Some(ImageType::Raw));
    }

    #[test]
    fn create_options_rejected() {
        for bad in [
            "size=1M,cluster_size=1000",
            "size=1M,cluster_size=256",
            "size=1M,cluster_size=4M",
            "size=1M,version=4",
            "cluster_size=64K",
            "size=1M,backing_fmt=raw",
            "size=1M,backing_fmt=vmdk,backing_file=a",
            "size=1M,preallocation=full",
            "size=1M,size=2M",
            "size",
        ] {
            assert!(bad.parse::<CreateOptions>().is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn copy_options() {
        assert_eq!("".parse::<CopyOptions>().unwrap(), CopyOptions::default());
        assert_eq!(
            "parent=/images/base.qcow2"
                .parse::<CopyOptions>()
                .unwrap()
                .parent,
            Some(PathBuf::from("/images/base.qcow2"))
        );
        assert!(matches!(
            "parent=a,compress=on".parse::<CopyOptions>(),
            Err(Error::InvalidOption(_))
        ));
        assert!(matches!(
            "parent=".parse::<CopyOptions>(),
            Err(Error::InvalidOption(_))
        ));
        assert!(matches!(
            "base.qcow2".parse::<CopyOptions>(),
            Err(Error::InvalidOption(_))
        ));
    }
}
