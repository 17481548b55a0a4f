//! Partition layout and the registry the session engine stages into
//!
//! A layout holds one optional factory partition plus any number of OTA
//! slots. Roles (running, boot target, last failed) are assignments over
//! that fixed table; partitions are never created or removed at runtime.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::image::AppDescriptor;

/// Kind of application partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    /// Factory image, never an update target
    Factory,
    /// Numbered OTA slot
    Ota(u8),
}

/// A contiguous region of flash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// Partition table label
    pub label: String,
    /// Partition kind
    pub kind: PartitionKind,
    /// Byte offset in flash
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
}

impl Partition {
    /// Create a partition entry
    pub fn new(label: impl Into<String>, kind: PartitionKind, offset: u64, size: u64) -> Self {
        Self {
            label: label.into(),
            kind,
            offset,
            size,
        }
    }

    /// Address used for writes
    pub fn address(&self) -> u64 {
        self.offset
    }

    /// Whether two entries describe the same physical region
    pub fn same_region(&self, other: &Partition) -> bool {
        self.offset == other.offset && self.size == other.size
    }

    /// Whether this is an OTA slot
    pub fn is_ota(&self) -> bool {
        matches!(self.kind, PartitionKind::Ota(_))
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@0x{:08x}", self.label, self.offset)
    }
}

/// Role a partition currently plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionRole {
    /// Image currently executing
    Running,
    /// Named by the boot pointer
    Boot,
    /// Where the next update would be staged
    StagingCandidate,
    /// Most recent image that failed to boot
    LastFailed,
}

/// Partition status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Partition entry
    pub partition: Partition,

    /// Roles currently assigned
    pub roles: Vec<PartitionRole>,

    /// Descriptor of the image stored here, if one decodes
    pub descriptor: Option<AppDescriptor>,
}

impl PartitionInfo {
    /// Whether the partition holds the given role
    pub fn has_role(&self, role: PartitionRole) -> bool {
        self.roles.contains(&role)
    }
}

/// Partition table plus role assignments
///
/// Shared bookkeeping for registry implementations: staging selection and
/// the boot pointer live here, storage of partition bytes does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashLayout {
    /// Partition table
    pub partitions: Vec<Partition>,
    /// Label of the running partition
    pub running: String,
    /// Label named by the boot pointer
    pub boot: String,
    /// Label of the last partition that failed to boot
    pub last_failed: Option<String>,
}

impl FlashLayout {
    /// Factory partition followed by two OTA slots of `slot_size` bytes each,
    /// running and booting from factory
    pub fn factory_and_two_slots(slot_size: u64) -> Self {
        let base = 0x1_0000u64;
        let partitions = vec![
            Partition::new("factory", PartitionKind::Factory, base, slot_size),
            Partition::new(
                "ota_0",
                PartitionKind::Ota(0),
                base.saturating_add(slot_size),
                slot_size,
            ),
            Partition::new(
                "ota_1",
                PartitionKind::Ota(1),
                base.saturating_add(slot_size.saturating_mul(2)),
                slot_size,
            ),
        ];
        Self {
            partitions,
            running: "factory".to_string(),
            boot: "factory".to_string(),
            last_failed: None,
        }
    }

    /// Look up a partition by label
    pub fn get(&self, label: &str) -> Result<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.label == label)
            .with_context(|| format!("Unknown partition label: {label}"))
    }

    /// Running partition
    pub fn running_partition(&self) -> Result<&Partition> {
        self.get(&self.running)
    }

    /// Partition named by the boot pointer
    pub fn boot_partition(&self) -> Result<&Partition> {
        self.get(&self.boot)
    }

    /// Last partition that failed to boot
    pub fn last_failed_partition(&self) -> Result<Option<&Partition>> {
        self.last_failed.as_deref().map(|l| self.get(l)).transpose()
    }

    /// OTA slot following the running one, wrapping
    ///
    /// Never the running slot nor the slot the boot pointer names, which may
    /// hold a committed image that has not booted yet.
    /// From the factory image the first OTA slot is chosen.
    pub fn next_staging_partition(&self) -> Result<Option<&Partition>> {
        let running = self.running_partition()?;
        let boot = self.boot_partition()?;
        let slots: Vec<&Partition> = self.partitions.iter().filter(|p| p.is_ota()).collect();
        let start = slots
            .iter()
            .position(|p| p.same_region(running))
            .map_or(0, |i| i.saturating_add(1));
        let count = slots.len();
        Ok((0..count)
            .filter_map(|step| slots.get(start.saturating_add(step) % count).copied())
            .find(|p| !p.same_region(running) && !p.same_region(boot)))
    }

    /// Point the boot pointer at `label`
    pub fn set_boot(&mut self, label: &str) -> Result<()> {
        self.get(label)?;
        self.boot = label.to_string();
        Ok(())
    }

    /// Apply the boot pointer, as a restart would
    pub fn reboot(&mut self) {
        self.running = self.boot.clone();
    }

    /// Record that the booted image failed and fall back to `previous`
    pub fn fail_boot(&mut self, previous: &str) -> Result<()> {
        self.get(previous)?;
        self.last_failed = Some(self.running.clone());
        self.running = previous.to_string();
        self.boot = previous.to_string();
        Ok(())
    }
}

/// Append-only write cursor into a staging partition
///
/// Dropping a writer without sealing it discards the session; the partial
/// bytes stay in flash but are never referenced by the boot pointer.
#[async_trait]
pub trait StagingWriter: Send {
    /// Append `data` at the cursor
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flush and close the staged image
    async fn seal(self: Box<Self>) -> Result<()>;
}

/// Storage layout the session engine reads and stages into
#[async_trait]
pub trait PartitionRegistry: Send + Sync {
    /// Full partition table
    async fn partitions(&self) -> Result<Vec<Partition>>;

    /// Partition the current image runs from
    async fn running_partition(&self) -> Result<Partition>;

    /// Partition named by the boot pointer
    async fn boot_partition(&self) -> Result<Partition>;

    /// Partition to stage the next image into, never the running or boot one
    async fn next_staging_partition(&self) -> Result<Option<Partition>>;

    /// Partition whose image last failed to boot
    async fn last_failed_partition(&self) -> Result<Option<Partition>>;

    /// Descriptor of the image stored in `partition`, if one decodes
    async fn read_descriptor(&self, partition: &Partition) -> Result<Option<AppDescriptor>>;

    /// Open a writer at offset zero of `partition`
    async fn open_writer(
        &self,
        partition: &Partition,
        declared_length: u64,
    ) -> Result<Box<dyn StagingWriter>>;

    /// Persist `partition` as the next boot target
    async fn set_boot_pointer(&self, partition: &Partition) -> Result<()>;
}

/// Snapshot every partition with its roles and descriptor
pub async fn describe_partitions(registry: &dyn PartitionRegistry) -> Result<Vec<PartitionInfo>> {
    let running = registry.running_partition().await?;
    let boot = registry.boot_partition().await?;
    let staging = registry.next_staging_partition().await?;
    let last_failed = registry.last_failed_partition().await?;

    let mut infos = Vec::new();
    for partition in registry.partitions().await? {
        let mut roles = Vec::new();
        if partition.same_region(&running) {
            roles.push(PartitionRole::Running);
        }
        if partition.same_region(&boot) {
            roles.push(PartitionRole::Boot);
        }
        if staging.as_ref().is_some_and(|s| s.same_region(&partition)) {
            roles.push(PartitionRole::StagingCandidate);
        }
        if last_failed.as_ref().is_some_and(|s| s.same_region(&partition)) {
            roles.push(PartitionRole::LastFailed);
        }
        let descriptor = registry
            .read_descriptor(&partition)
            .await
            .with_context(|| format!("Failed to read descriptor of {partition}"))?;
        infos.push(PartitionInfo {
            partition,
            roles,
            descriptor,
        });
    }
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_from_factory_is_first_slot() -> Result<()> {
        let layout = FlashLayout::factory_and_two_slots(0x10_0000);
        let staging = layout.next_staging_partition()?.context("no staging")?;
        assert_eq!(staging.label, "ota_0");
        Ok(())
    }

    #[test]
    fn test_staging_alternates_between_slots() -> Result<()> {
        let mut layout = FlashLayout::factory_and_two_slots(0x10_0000);
        layout.running = "ota_0".to_string();
        assert_eq!(layout.next_staging_partition()?.context("none")?.label, "ota_1");
        layout.running = "ota_1".to_string();
        assert_eq!(layout.next_staging_partition()?.context("none")?.label, "ota_0");
        Ok(())
    }

    #[test]
    fn test_staging_skips_pending_boot_slot() -> Result<()> {
        let mut layout = FlashLayout::factory_and_two_slots(0x10_0000);
        layout.set_boot("ota_0")?;
        assert_eq!(layout.next_staging_partition()?.context("none")?.label, "ota_1");

        layout.running = "ota_0".to_string();
        layout.set_boot("ota_1")?;
        assert!(layout.next_staging_partition()?.is_none());
        Ok(())
    }

    #[test]
    fn test_single_slot_running_has_no_staging() -> Result<()> {
        let layout = FlashLayout {
            partitions: vec![Partition::new("ota_0", PartitionKind::Ota(0), 0x1_0000, 0x1000)],
            running: "ota_0".to_string(),
            boot: "ota_0".to_string(),
            last_failed: None,
        };
        assert!(layout.next_staging_partition()?.is_none());
        Ok(())
    }

    #[test]
    fn test_fail_boot_records_last_failed() -> Result<()> {
        let mut layout = FlashLayout::factory_and_two_slots(0x1000);
        layout.set_boot("ota_0")?;
        layout.reboot();
        assert_eq!(layout.running, "ota_0");

        layout.fail_boot("factory")?;
        assert_eq!(layout.running, "factory");
        assert_eq!(layout.boot, "factory");
        assert_eq!(layout.last_failed.as_deref(), Some("ota_0"));
        Ok(())
    }

    #[test]
    fn test_set_boot_rejects_unknown_label() {
        let mut layout = FlashLayout::factory_and_two_slots(0x1000);
        assert!(layout.set_boot("nvs").is_err());
        assert_eq!(layout.boot, "factory");
    }

    #[test]
    fn test_partition_display_and_region() {
        let a = Partition::new("ota_0", PartitionKind::Ota(0), 0x11_0000, 0x10_0000);
        let b = Partition::new("renamed", PartitionKind::Ota(1), 0x11_0000, 0x10_0000);
        assert_eq!(a.to_string(), "ota_0@0x00110000");
        assert!(a.same_region(&b));
        assert_ne!(a, b);
        assert_eq!(a.address(), 0x11_0000);
    }
}
