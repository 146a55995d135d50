//! Block device discovery
//!
//! Validation needs to know which disks exist right now. `DeviceSet` is a
//! snapshot taken once, before validation, from `lsblk`'s JSON output.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::process_guard::CommandProcessGroup;

/// One whole-disk device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub path: PathBuf,
    /// Size in bytes, 0 when lsblk did not report it
    pub size: u64,
    pub model: Option<String>,
    pub read_only: bool,
}

/// Snapshot of the disks present on the machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSet {
    devices: BTreeMap<PathBuf, BlockDevice>,
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    size: Value,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    ro: Value,
}

impl DeviceSet {
    /// Query `lsblk` for all disks.
    pub fn discover() -> Result<Self> {
        let output = Command::new("lsblk")
            .args(["-J", "-d", "-b", "-o", "NAME,PATH,SIZE,TYPE,MODEL,RO"])
            .in_new_process_group()
            .output()
            .context("Failed to run lsblk")?;

        if !output.status.success() {
            anyhow::bail!(
                "lsblk failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let set = Self::from_lsblk_json(&String::from_utf8_lossy(&output.stdout))?;
        tracing::debug!("Discovered {} disk(s)", set.len());
        Ok(set)
    }

    /// Parse `lsblk -J` output, keeping only `disk` entries.
    ///
    /// Older util-linux prints sizes and flags as strings; both forms are
    /// accepted.
    pub fn from_lsblk_json(json: &str) -> Result<Self> {
        let parsed: LsblkOutput =
            serde_json::from_str(json).context("Failed to parse lsblk JSON output")?;

        let devices = parsed
            .blockdevices
            .into_iter()
            .filter(|d| d.kind.as_deref().is_none_or(|k| k == "disk"))
            .map(|d| {
                let path = d
                    .path
                    .map(PathBuf::from)
                    .unwrap_or_else(|| Path::new("/dev").join(&d.name));
                let device = BlockDevice {
                    path: path.clone(),
                    size: value_as_u64(&d.size),
                    model: d
                        .model
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty()),
                    read_only: value_as_bool(&d.ro),
                };
                (path, device)
            })
            .collect();

        Ok(Self { devices })
    }

    /// Build a set from known paths (dry runs, tests)
    pub fn from_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let devices = paths
            .into_iter()
            .map(|p| {
                let path = p.into();
                let device = BlockDevice {
                    path: path.clone(),
                    size: 0,
                    model: None,
                    read_only: false,
                };
                (path, device)
            })
            .collect();
        Self { devices }
    }

    /// Add or replace a device
    pub fn insert(&mut self, device: BlockDevice) {
        self.devices.insert(device.path.clone(), device);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.devices.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<&BlockDevice> {
        self.devices.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn value_as_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_u64() == Some(1),
        Value::String(s) => s.trim() == "1" || s.trim() == "true",
        _ => false,
    }
}

/// Format a byte count the way lsblk's human output does (`465.8G`)
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "K", "M", "G", "T", "P"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modern_lsblk() {
        let json = r#"{
           "blockdevices": [
              {"name":"sda", "path":"/dev/sda", "size":500107862016, "type":"disk", "model":"Samsung SSD 860  ", "ro":false},
              {"name":"sr0", "path":"/dev/sr0", "size":1073741312, "type":"rom", "model":"DVD", "ro":false},
              {"name":"nvme0n1", "path":"/dev/nvme0n1", "size":1000204886016, "type":"disk", "model":null, "ro":true}
           ]
        }"#;
        let set = DeviceSet::from_lsblk_json(json).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(Path::new("/dev/sda")));
        assert!(!set.contains(Path::new("/dev/sr0")));

        let sda = set.get(Path::new("/dev/sda")).unwrap();
        assert_eq!(sda.size, 500107862016);
        assert_eq!(sda.model.as_deref(), Some("Samsung SSD 860"));

        let nvme = set.get(Path::new("/dev/nvme0n1")).unwrap();
        assert!(nvme.read_only);
        assert!(nvme.model.is_none());
    }

    #[test]
    fn test_parse_legacy_string_fields() {
        let json = r#"{"blockdevices": [{"name":"vda", "size":"21474836480", "type":"disk", "ro":"0"}]}"#;
        let set = DeviceSet::from_lsblk_json(json).unwrap();
        let vda = set.get(Path::new("/dev/vda")).unwrap();
        assert_eq!(vda.size, 21474836480);
        assert!(!vda.read_only);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(DeviceSet::from_lsblk_json("not json").is_err());
    }

    #[test]
    fn test_from_paths() {
        let set = DeviceSet::from_paths(["/dev/sdX"]);
        assert!(set.contains(Path::new("/dev/sdX")));
        assert!(!set.is_empty());
    }

    #[test]
    fn test_insert_replaces_by_path() {
        let mut set = DeviceSet::from_paths(["/dev/sdX"]);
        set.insert(BlockDevice {
            path: PathBuf::from("/dev/sdX"),
            size: 1024,
            model: Some("QEMU HARDDISK".into()),
            read_only: false,
        });
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(Path::new("/dev/sdX")).map(|d| d.size), Some(1024));
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1536), "1.5K");
        assert_eq!(human_size(500107862016), "465.8G");
    }
}
