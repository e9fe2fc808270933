//! Disk data contract
//!
//! Enumeration itself is pluggable through [`DiskSource`]; this module only
//! defines what the disk and partition steps consume and what they store.
//!
//! # Stored values
//!
//! Choosing a device writes `disk` (device path and name), `disk_is_partition`
//! and `disk_efi_partition` to the store. The install scripts receive them as
//! `OSI_DEVICE_PATH`, `OSI_DEVICE_IS_PARTITION` and `OSI_DEVICE_EFI_PARTITION`.

use std::fmt;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::{ConfigStore, Key, Value};

/// Detected firmware mode of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareMode {
    Uefi,
    Bios,
}

impl FirmwareMode {
    /// Check `/sys/firmware/efi`, which only exists when booted via UEFI.
    pub fn detect() -> Self {
        if Path::new("/sys/firmware/efi").exists() {
            log::debug!("UEFI firmware detected");
            Self::Uefi
        } else {
            log::debug!("BIOS firmware detected");
            Self::Bios
        }
    }

    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }
}

impl fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uefi => write!(f, "UEFI"),
            Self::Bios => write!(f, "BIOS"),
        }
    }
}

/// A block device or partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Label or vendor/model, may be empty
    pub name: String,
    /// Size in bytes, 0 if unknown
    pub size: u64,
    pub size_text: String,
    pub device_path: String,
    pub is_efi: bool,
}

impl DeviceInfo {
    pub fn new(name: &str, size: u64, device_path: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            size,
            size_text: size_to_text(size),
            device_path: device_path.to_string(),
            is_efi: false,
        }
    }

    pub fn efi(mut self) -> Self {
        self.is_efi = true;
        self
    }

    /// Whether the device is large enough. Unknown sizes are accepted.
    pub fn fits(&self, minimum_size: u64) -> bool {
        self.size == 0 || self.size >= minimum_size
    }

    /// Name to show and store, the device path when unnamed.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.device_path
        } else {
            &self.name
        }
    }
}

/// A whole disk with its partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub info: DeviceInfo,
    pub partitions: Vec<DeviceInfo>,
}

impl Disk {
    pub fn new(info: DeviceInfo, partitions: Vec<DeviceInfo>) -> Self {
        Self { info, partitions }
    }

    /// Device path of the first EFI system partition.
    pub fn efi_partition(&self) -> Option<&str> {
        self.partitions
            .iter()
            .find(|partition| partition.is_efi)
            .map(|partition| partition.device_path.as_str())
    }
}

/// What the partition step can offer for a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAvailability {
    /// The disk vanished since enumeration
    NoDisk,
    NoPartitions,
    /// Booted via UEFI but the disk has no EFI partition to boot from
    NoBootPartition,
    Available,
}

/// Decide what the partition step shows for `disk`.
pub fn partition_availability(disk: &Disk, exists: bool, firmware: FirmwareMode) -> PartitionAvailability {
    if !exists {
        PartitionAvailability::NoDisk
    } else if disk.partitions.is_empty() {
        PartitionAvailability::NoPartitions
    } else if firmware.is_uefi() && disk.efi_partition().is_none() {
        PartitionAvailability::NoBootPartition
    } else {
        PartitionAvailability::Available
    }
}

/// Source of disk information.
pub trait DiskSource: Send + Sync {
    /// All installable disks.
    fn disks(&self) -> Result<Vec<Disk>>;

    /// Whether the device still exists.
    fn disk_exists(&self, device: &DeviceInfo) -> bool;
}

/// Fixed set of fake disks for demo mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct DemoDiskSource;

impl DiskSource for DemoDiskSource {
    fn disks(&self) -> Result<Vec<Disk>> {
        Ok(vec![
            Disk::new(
                DeviceInfo::new("Dummy", 10_000, "/dev/null"),
                vec![DeviceInfo::new("Too small partition", 1_000, "/dev/00null")],
            ),
            Disk::new(
                DeviceInfo::new("Totally real device", 100_000_000_000, "/dev/sda"),
                vec![
                    DeviceInfo::new("EFI", 200_000_000, "/dev/sda_efi").efi(),
                    DeviceInfo::new("Previous Installation", 20_000_000_000, "/dev/sda_yes"),
                    DeviceInfo::new("", 20_000_000_000, "/dev/sda_unnamed"),
                    DeviceInfo::new("Swap", 8_000_000_000, "/dev/sda_swap"),
                ],
            ),
            Disk::new(
                DeviceInfo::new("VERY BIG DISK", 1_000_000_000_000_000, "/dev/sdb_very_big"),
                Vec::new(),
            ),
        ])
    }

    fn disk_exists(&self, _device: &DeviceInfo) -> bool {
        true
    }
}

const EFI_PARTITION_GUID: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    size: Option<u64>,
    model: Option<String>,
    vendor: Option<String>,
    label: Option<String>,
    parttype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Disks as reported by `lsblk`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LsblkDiskSource;

impl LsblkDiskSource {
    /// Parse `lsblk --json --bytes` output into disks, skipping optical
    /// drives, loop devices and everything else that is not a disk.
    pub fn parse(json: &str) -> Result<Vec<Disk>> {
        let output: LsblkOutput = serde_json::from_str(json).context("Unexpected lsblk output")?;
        Ok(output
            .blockdevices
            .into_iter()
            .filter(|device| device.kind == "disk")
            .map(|device| {
                let name = format!(
                    "{} {}",
                    device.vendor.as_deref().unwrap_or_default().trim(),
                    device.model.as_deref().unwrap_or_default().trim()
                );
                let partitions = device
                    .children
                    .iter()
                    .filter(|child| child.kind == "part")
                    .map(|child| {
                        let info = DeviceInfo::new(
                            child.label.as_deref().unwrap_or_default(),
                            child.size.unwrap_or(0),
                            &child.path,
                        );
                        let is_efi = child
                            .parttype
                            .as_deref()
                            .is_some_and(|parttype| parttype.eq_ignore_ascii_case(EFI_PARTITION_GUID));
                        if is_efi { info.efi() } else { info }
                    })
                    .collect();
                Disk::new(
                    DeviceInfo::new(&name, device.size.unwrap_or(0), &device.path),
                    partitions,
                )
            })
            .collect())
    }
}

impl DiskSource for LsblkDiskSource {
    fn disks(&self) -> Result<Vec<Disk>> {
        let output = Command::new("lsblk")
            .args(["--json", "--bytes", "-o", "PATH,TYPE,SIZE,MODEL,VENDOR,LABEL,PARTTYPE"])
            .output()
            .context("Failed to run lsblk")?;
        if !output.status.success() {
            anyhow::bail!(
                "lsblk failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Self::parse(&String::from_utf8_lossy(&output.stdout))
    }

    fn disk_exists(&self, device: &DeviceInfo) -> bool {
        Path::new(&device.device_path).exists()
    }
}

/// Human readable size with one decimal, in SI units.
pub fn size_to_text(size: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit + 1 < UNITS.len() {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", size)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Store the whole disk as installation target.
pub fn select_disk(config: &ConfigStore, disk: &Disk) {
    store_device(config, disk, &disk.info, false);
}

/// Store one partition of `disk` as installation target.
pub fn select_partition(config: &ConfigStore, disk: &Disk, partition: &DeviceInfo) {
    store_device(config, disk, partition, true);
}

fn store_device(config: &ConfigStore, disk: &Disk, device: &DeviceInfo, is_partition: bool) {
    log::info!(
        "Selected {} {} ({})",
        if is_partition { "partition" } else { "disk" },
        device.device_path,
        device.size_text
    );
    config.set(
        Key::Disk,
        Value::pair(device.device_path.clone(), device.display_name().to_string()),
    );
    config.set(Key::DiskIsPartition, Value::Bool(is_partition));
    config.set(
        Key::DiskEfiPartition,
        Value::text(disk.efi_partition().unwrap_or_default()),
    );
}
