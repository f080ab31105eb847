// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Description of an image, as printed by `qcow-img info`.

use std::fmt::{self, Display};

use serde::Serialize;

use crate::ImageType;

/// Properties of an image file. Serializes to the same keys as the `info` command's JSON output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    pub filename: String,
    pub format: ImageType,
    pub virtual_size: u64,
    /// Bytes the file occupies on disk.
    pub actual_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_size: Option<u64>,
    /// Backing reference as stored in the image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_filename_format: Option<ImageType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirty_flag: Option<bool>,
}

impl ImageInfo {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

// 1536 -> "1.5 KiB"
fn human_size(size: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut unit = 0;
    let mut value = size as f64;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        return format!("{size} B");
    }
    let mut number = format!("{value:.2}");
    while number.ends_with('0') {
        number.pop();
    }
    if number.ends_with('.') {
        number.pop();
    }
    format!("{number} {}", UNITS[unit])
}

impl Display for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "image: {}", self.filename)?;
        writeln!(f, "file format: {}", self.format)?;
        writeln!(
            f,
            "virtual size: {} ({} bytes)",
            human_size(self.virtual_size),
            self.virtual_size
        )?;
        write!(f, "disk size: {}", human_size(self.actual_size))?;
        if let Some(cluster_size) = self.cluster_size {
            write!(f, "\ncluster_size: {cluster_size}")?;
        }
        if let Some(backing) = &self.backing_filename {
            write!(f, "\nbacking file: {backing}")?;
        }
        if let Some(format) = self.backing_filename_format {
            write!(f, "\nbacking file format: {format}")?;
        }
        if let Some(dirty) = self.dirty_flag {
            write!(f, "\ndirty flag: {dirty}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod unit_tests {
    use serde_json::json;

    use super::*;

    fn child_info() -> ImageInfo {
        ImageInfo {
            filename: "child.qcow2".to_string(),
            format: ImageType::Qcow2,
            virtual_size: 2 << 20,
            actual_size: 200 << 10,
            cluster_size: Some(65536),
            backing_filename: Some("/images/base.raw".to_string()),
            backing_filename_format: Some(ImageType::Raw),
            dirty_flag: Some(false),
        }
    }

    #[test]
    fn json_keys() {
        let value = serde_json::to_value(child_info()).unwrap();
        assert_eq!(
            value,
            json!({
                "filename": "child.qcow2",
                "format": "qcow2",
                "virtual-size": 2097152,
                "actual-size": 204800,
                "cluster-size": 65536,
                "backing-filename": "/images/base.raw",
                "backing-filename-format": "raw",
                "dirty-flag": false,
            })
        );
    }

    #[test]
    fn raw_info_omits_qcow2_keys() {
        let info = ImageInfo {
            filename: "disk.raw".to_string(),
            format: ImageType::Raw,
            virtual_size: 512,
            actual_size: 4096,
            cluster_size: None,
            backing_filename: None,
            backing_filename_format: None,
            dirty_flag: None,
        };
        let value = serde_json::to_value(&info).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(
            keys.len(),
            4,
            "unexpected keys {keys:?} in {}",
            info.to_json().unwrap()
        );
        assert!(value.get("backing-filename").is_none());
        assert!(value.get("cluster-size").is_none());
    }

    #[test]
    fn text_form() {
        let text = child_info().to_string();
        assert_eq!(
            text,
            "image: child.qcow2\n\
             file format: qcow2\n\
             virtual size: 2 MiB (2097152 bytes)\n\
             disk size: 200 KiB\n\
             cluster_size: 65536\n\
             backing file: /images/base.raw\n\
             backing file format: raw\n\
             dirty flag: false"
        );
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(100 << 20), "100 MiB");
        assert_eq!(human_size(1 << 40), "1 TiB");
    }
}
