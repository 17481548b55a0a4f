//! In-memory partition registry
//!
//! Backs tests, benches and the simulator. The layout follows the usual
//! factory plus two OTA slots table, and faults can be injected into the
//! write, seal and boot pointer paths.

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::image::{AppDescriptor, HeaderOutcome, extract};
use crate::partition::{FlashLayout, Partition, PartitionRegistry, StagingWriter};

/// Erased flash reads as all ones
pub const ERASED_BYTE: u8 = 0xFF;

/// Faults to inject into the next operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail the write that covers this partition offset
    pub fail_write_at: Option<u64>,
    /// Fail sealing the staged image
    pub fail_seal: bool,
    /// Fail persisting the boot pointer
    pub fail_boot_pointer: bool,
}

#[derive(Debug)]
struct FlashState {
    layout: FlashLayout,
    slots: HashMap<String, Vec<u8>>,
    faults: FaultPlan,
    boot_pointer_writes: u32,
    live_writers: u32,
}

impl FlashState {
    fn slot_mut(&mut self, label: &str) -> Result<&mut Vec<u8>> {
        self.slots
            .get_mut(label)
            .with_context(|| format!("Unknown partition label: {label}"))
    }
}

/// Partition registry over RAM
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    state: Arc<Mutex<FlashState>>,
}

impl MemoryFlash {
    /// Factory partition plus two OTA slots, each `slot_size` bytes, erased
    pub fn new(slot_size: u64) -> Self {
        Self::with_layout(FlashLayout::factory_and_two_slots(slot_size))
    }

    /// Erased flash with an arbitrary layout
    pub fn with_layout(layout: FlashLayout) -> Self {
        let slots = layout
            .partitions
            .iter()
            .map(|p| {
                let size = usize::try_from(p.size).unwrap_or(0);
                (p.label.clone(), vec![ERASED_BYTE; size])
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(FlashState {
                layout,
                slots,
                faults: FaultPlan::default(),
                boot_pointer_writes: 0,
                live_writers: 0,
            })),
        }
    }

    /// Place `image` at the start of a partition, bypassing the session engine
    pub fn install(&self, label: &str, image: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(label)?;
        let dst = slot
            .get_mut(..image.len())
            .with_context(|| format!("Image of {} bytes does not fit {label}", image.len()))?;
        dst.copy_from_slice(image);
        Ok(())
    }

    /// Mark a partition as running and booted
    pub fn set_running(&self, label: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.layout.set_boot(label)?;
        state.layout.reboot();
        Ok(())
    }

    /// Record (or clear) the partition that last failed to boot
    pub fn set_last_failed(&self, label: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(label) = label {
            state.layout.get(label)?;
        }
        state.layout.last_failed = label.map(str::to_string);
        Ok(())
    }

    /// Replace the fault plan
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }

    /// Current layout and role assignments
    pub fn layout(&self) -> FlashLayout {
        self.state.lock().layout.clone()
    }

    /// Full contents of a partition
    pub fn contents(&self, label: &str) -> Option<Vec<u8>> {
        self.state.lock().slots.get(label).cloned()
    }

    /// First `len` bytes of a partition
    pub fn staged_bytes(&self, label: &str, len: usize) -> Option<Vec<u8>> {
        self.state
            .lock()
            .slots
            .get(label)
            .and_then(|slot| slot.get(..len))
            .map(<[u8]>::to_vec)
    }

    /// Label named by the boot pointer
    pub fn boot_label(&self) -> String {
        self.state.lock().layout.boot.clone()
    }

    /// Label of the running partition
    pub fn running_label(&self) -> String {
        self.state.lock().layout.running.clone()
    }

    /// Successful boot pointer updates so far
    pub fn boot_pointer_writes(&self) -> u32 {
        self.state.lock().boot_pointer_writes
    }

    /// Writers opened and not yet sealed or dropped
    pub fn live_writers(&self) -> u32 {
        self.state.lock().live_writers
    }

    /// Simulate a restart into the boot partition
    pub fn reboot(&self) {
        self.state.lock().layout.reboot();
    }

    /// Simulate a failed boot that falls back to `previous`
    pub fn fail_boot(&self, previous: &str) -> Result<()> {
        self.state.lock().layout.fail_boot(previous)
    }
}

#[async_trait]
impl PartitionRegistry for MemoryFlash {
    async fn partitions(&self) -> Result<Vec<Partition>> {
        Ok(self.state.lock().layout.partitions.clone())
    }

    async fn running_partition(&self) -> Result<Partition> {
        self.state.lock().layout.running_partition().cloned()
    }

    async fn boot_partition(&self) -> Result<Partition> {
        self.state.lock().layout.boot_partition().cloned()
    }

    async fn next_staging_partition(&self) -> Result<Option<Partition>> {
        Ok(self.state.lock().layout.next_staging_partition()?.cloned())
    }

    async fn last_failed_partition(&self) -> Result<Option<Partition>> {
        Ok(self.state.lock().layout.last_failed_partition()?.cloned())
    }

    async fn read_descriptor(&self, partition: &Partition) -> Result<Option<AppDescriptor>> {
        let state = self.state.lock();
        let slot = state
            .slots
            .get(&partition.label)
            .with_context(|| format!("Unknown partition label: {}", partition.label))?;
        Ok(match extract(slot) {
            HeaderOutcome::Decoded(desc) => Some(desc.app),
            HeaderOutcome::Incomplete { .. } | HeaderOutcome::Malformed(_) => None,
        })
    }

    async fn open_writer(
        &self,
        partition: &Partition,
        declared_length: u64,
    ) -> Result<Box<dyn StagingWriter>> {
        ensure!(
            declared_length <= partition.size,
            "{declared_length} bytes do not fit {partition}"
        );
        let mut state = self.state.lock();
        state.slot_mut(&partition.label)?.fill(ERASED_BYTE);
        state.live_writers = state.live_writers.saturating_add(1);
        debug!("Erased {} for a {} byte image", partition, declared_length);
        Ok(Box::new(MemoryWriter {
            state: Arc::clone(&self.state),
            label: partition.label.clone(),
            cursor: 0,
        }))
    }

    async fn set_boot_pointer(&self, partition: &Partition) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.fail_boot_pointer {
            bail!("injected boot pointer failure");
        }
        state.layout.set_boot(&partition.label)?;
        state.boot_pointer_writes = state.boot_pointer_writes.saturating_add(1);
        Ok(())
    }
}

struct MemoryWriter {
    state: Arc<Mutex<FlashState>>,
    label: String,
    cursor: u64,
}

#[async_trait]
impl StagingWriter for MemoryWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let end = self.cursor.saturating_add(data.len() as u64);
        if let Some(at) = state.faults.fail_write_at
            && (self.cursor..end).contains(&at)
        {
            bail!("injected write failure at offset {at}");
        }
        let start = usize::try_from(self.cursor)?;
        let slot = state.slot_mut(&self.label)?;
        let dst = slot
            .get_mut(start..start.saturating_add(data.len()))
            .with_context(|| format!("Write past the end of {}", self.label))?;
        dst.copy_from_slice(data);
        self.cursor = end;
        Ok(())
    }

    async fn seal(self: Box<Self>) -> Result<()> {
        if self.state.lock().faults.fail_seal {
            bail!("injected seal failure");
        }
        debug!("Sealed {} after {} bytes", self.label, self.cursor);
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live_writers = state.live_writers.saturating_sub(1);
    }
}
