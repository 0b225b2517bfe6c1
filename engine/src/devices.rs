//! Removable storage discovery.
//!
//! Devices are read from `lsblk` JSON output. Only filesystems mounted under
//! the usual removable-media roots are reported; system partitions are
//! filtered out.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ToolCommand;
use crate::error::EngineError;
use crate::size::parse_size_to_gb;

/// Columns requested from `lsblk`.
pub const LSBLK_COLUMNS: &str = "NAME,MOUNTPOINT,LABEL,SIZE,FSUSED,FSAVAIL,FSTYPE,TYPE,PKNAME,VENDOR,MODEL,PATH";

/// Mount roots under which removable media usually appear.
pub const DEFAULT_MOUNT_PREFIXES: [&str; 3] = ["/media/", "/mnt/", "/run/media/"];

const EXCLUDED_FSTYPES: [&str; 2] = ["swap", "squashfs"];
const SYSTEM_CARD_PREFIX: &str = "/dev/mmcblk0";

/// A mounted filesystem that can serve as a copy source or destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub mount_path: String,
    pub label: String,
    pub total_gb: f64,
    pub free_gb: f64,
    /// Kernel device name, e.g. `/dev/sdb1`
    pub device: String,
    pub vendor: String,
    pub model: String,
}

/// Source of the device list.
pub trait DeviceLister {
    /// Currently mounted candidate devices. Failures are logged and yield an
    /// empty list.
    fn list_devices(&self) -> impl Future<Output = Vec<Device>> + Send;
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct BlockDevice {
    name: Option<String>,
    mountpoint: Option<String>,
    label: Option<String>,
    size: Option<String>,
    fsavail: Option<String>,
    fstype: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    pkname: Option<String>,
    vendor: Option<String>,
    model: Option<String>,
    path: Option<String>,
    children: Vec<BlockDevice>,
}

/// Lists devices by running `lsblk`.
#[derive(Debug, Clone)]
pub struct LsblkDeviceLister {
    pub tool: ToolCommand,
    pub mount_prefixes: Vec<String>,
}

impl Default for LsblkDeviceLister {
    fn default() -> Self {
        LsblkDeviceLister {
            tool: ToolCommand::new("lsblk"),
            mount_prefixes: DEFAULT_MOUNT_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl LsblkDeviceLister {
    pub fn new(tool: ToolCommand) -> Self {
        LsblkDeviceLister {
            tool,
            ..Self::default()
        }
    }

    async fn run(&self) -> Result<Vec<Device>, EngineError> {
        let output = self
            .tool
            .command(["-Jfpno", LSBLK_COLUMNS])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::LaunchFailed {
                program: self.tool.program.clone(),
                source: e,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(EngineError::DeviceListing {
                reason: format!(
                    "empty output (exit code {:?}): {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        parse_lsblk_output(&stdout, &self.mount_prefixes)
    }
}

impl DeviceLister for LsblkDeviceLister {
    async fn list_devices(&self) -> Vec<Device> {
        match self.run().await {
            Ok(devices) => {
                debug!(count = devices.len(), "listed devices");
                devices
            }
            Err(e) => {
                warn!(error = %e, "device listing failed");
                Vec::new()
            }
        }
    }
}

/// Interpret `lsblk -J` output, keeping entries mounted under one of
/// `mount_prefixes`.
pub fn parse_lsblk_output(json: &str, mount_prefixes: &[String]) -> Result<Vec<Device>, EngineError> {
    let parsed: LsblkOutput = serde_json::from_str(json).map_err(|e| EngineError::DeviceListing {
        reason: e.to_string(),
    })?;
    let disks = &parsed.blockdevices;

    let candidates = disks.iter().flat_map(|disk| {
        if disk.children.is_empty() {
            vec![disk]
        } else {
            disk.children.iter().collect()
        }
    });

    Ok(candidates
        .filter(|d| is_candidate(d, mount_prefixes))
        .map(|d| to_device(d, disks))
        .collect())
}

fn is_candidate(d: &BlockDevice, mount_prefixes: &[String]) -> bool {
    let Some(mountpoint) = d.mountpoint.as_deref() else {
        return false;
    };
    let mounted = mount_prefixes.iter().any(|p| mountpoint.starts_with(p.as_str()));
    let kind = d.kind.as_deref().unwrap_or("").to_ascii_lowercase();
    let valid_type = kind == "part" || (kind == "disk" && mounted);

    let system = d.fstype.as_deref().is_some_and(|t| EXCLUDED_FSTYPES.contains(&t))
        || mountpoint == "/"
        || mountpoint.starts_with("/boot")
        || d.path.as_deref().is_some_and(|p| p.starts_with(SYSTEM_CARD_PREFIX));

    mounted && valid_type && !system
}

fn to_device(d: &BlockDevice, disks: &[BlockDevice]) -> Device {
    let mount_path = d.mountpoint.clone().unwrap_or_default();
    let name = d.name.clone().unwrap_or_default();
    let parent = d
        .pkname
        .as_deref()
        .and_then(|pk| disks.iter().find(|disk| disk.name.as_deref() == Some(pk)));

    let vendor = inherited(&d.vendor, parent.map(|p| &p.vendor));
    let model = inherited(&d.model, parent.map(|p| &p.model));

    let label = non_empty(&d.label)
        .map(str::to_string)
        .or_else(|| {
            Path::new(&mount_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| name.clone());

    Device {
        total_gb: d.size.as_deref().map(parse_size_to_gb).unwrap_or(0.0),
        free_gb: d.fsavail.as_deref().map(parse_size_to_gb).unwrap_or(0.0),
        mount_path,
        label,
        device: name,
        vendor,
        model,
    }
}

fn inherited(own: &Option<String>, parent: Option<&Option<String>>) -> String {
    non_empty(own)
        .or_else(|| parent.and_then(non_empty))
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
       "blockdevices": [
          {"name":"/dev/sda", "mountpoint":null, "label":null, "size":"238.5G", "fsused":null, "fsavail":null,
           "fstype":null, "type":"disk", "pkname":null, "vendor":"ATA     ", "model":"Samsung SSD", "path":"/dev/sda",
           "children": [
              {"name":"/dev/sda1", "mountpoint":"/boot/efi", "label":null, "size":"512M", "fsused":"6M", "fsavail":"506M",
               "fstype":"vfat", "type":"part", "pkname":"/dev/sda", "vendor":null, "model":null, "path":"/dev/sda1"},
              {"name":"/dev/sda2", "mountpoint":"/", "label":null, "size":"238G", "fsused":"40G", "fsavail":"186G",
               "fstype":"ext4", "type":"part", "pkname":"/dev/sda", "vendor":null, "model":null, "path":"/dev/sda2"}
           ]
          },
          {"name":"/dev/sdb", "mountpoint":null, "label":null, "size":"59.5G", "fsused":null, "fsavail":null,
           "fstype":null, "type":"disk", "pkname":null, "vendor":"SanDisk ", "model":"Extreme Pro ", "path":"/dev/sdb",
           "children": [
              {"name":"/dev/sdb1", "mountpoint":"/media/pi/EOS_DIGITAL", "label":"EOS_DIGITAL", "size":"59,5G",
               "fsused":"12G", "fsavail":"47.5G", "fstype":"exfat", "type":"part", "pkname":"/dev/sdb",
               "vendor":null, "model":null, "path":"/dev/sdb1"}
           ]
          },
          {"name":"/dev/sdc", "mountpoint":"/mnt/backup", "label":null, "size":"1.8T", "fsused":"1T", "fsavail":"819G",
           "fstype":"ext4", "type":"disk", "pkname":null, "vendor":"WD", "model":"Elements", "path":"/dev/sdc"},
          {"name":"/dev/mmcblk0p1", "mountpoint":"/media/pi/bootfs", "label":"bootfs", "size":"256M", "fsused":"50M",
           "fsavail":"206M", "fstype":"vfat", "type":"part", "pkname":"/dev/mmcblk0", "vendor":null, "model":null,
           "path":"/dev/mmcblk0p1"},
          {"name":"/dev/loop0", "mountpoint":"/mnt/snap", "label":null, "size":"50M", "fsused":"50M", "fsavail":"0",
           "fstype":"squashfs", "type":"loop", "pkname":null, "vendor":null, "model":null, "path":"/dev/loop0"}
       ]
    }"#;

    fn prefixes() -> Vec<String> {
        DEFAULT_MOUNT_PREFIXES.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_parse_filters_system_devices() {
        let devices = parse_lsblk_output(SAMPLE, &prefixes()).expect("Failed to parse");
        let names: Vec<&str> = devices.iter().map(|d| d.device.as_str()).collect();
        assert_eq!(names, vec!["/dev/sdb1", "/dev/sdc"]);
    }

    #[test]
    fn test_partition_inherits_parent_vendor_and_model() {
        let devices = parse_lsblk_output(SAMPLE, &prefixes()).expect("Failed to parse");
        let card = &devices[0];
        assert_eq!(card.mount_path, "/media/pi/EOS_DIGITAL");
        assert_eq!(card.label, "EOS_DIGITAL");
        assert_eq!(card.vendor, "SanDisk");
        assert_eq!(card.model, "Extreme Pro");
        assert!((card.total_gb - 59.5).abs() < 1e-9);
        assert!((card.free_gb - 47.5).abs() < 1e-9);
    }

    #[test]
    fn test_label_falls_back_to_mount_directory() {
        let devices = parse_lsblk_output(SAMPLE, &prefixes()).expect("Failed to parse");
        let disk = &devices[1];
        assert_eq!(disk.label, "backup");
        assert!((disk.total_gb - 1.8 * 1024.0).abs() < 1e-9);
    }

    #[test]
    fn test_unmounted_part_is_skipped() {
        let json = r#"{"blockdevices":[{"name":"/dev/sdd1","mountpoint":null,"type":"part","path":"/dev/sdd1"}]}"#;
        assert!(parse_lsblk_output(json, &prefixes()).expect("Failed to parse").is_empty());
    }

    #[test]
    fn test_invalid_json_is_listing_error() {
        assert!(matches!(
            parse_lsblk_output("not json", &prefixes()),
            Err(EngineError::DeviceListing { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lister_runs_tool_and_recovers_from_failure() {
        let json = r#"{"blockdevices":[{"name":"/dev/sdb1","mountpoint":"/media/CARD","type":"part","size":"8G","fsavail":"2G","path":"/dev/sdb1"}]}"#;
        let script = format!("echo '{}'", json);
        let lister = LsblkDeviceLister::new(ToolCommand::new("sh").with_args(["-c", script.as_str(), "lsblk"]));
        let devices = lister.list_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].label, "CARD");

        let broken = LsblkDeviceLister::new(ToolCommand::new("sh").with_args(["-c", "exit 32", "lsblk"]));
        assert!(broken.list_devices().await.is_empty());

        let missing = LsblkDeviceLister::new(ToolCommand::new("/nonexistent/lsblk"));
        assert!(missing.list_devices().await.is_empty());
    }
}
