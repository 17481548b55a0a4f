//! Directory-backed partition registry
//!
//! Each partition is a file named `<label>.bin` under the flash directory.
//! An empty or short file reads as erased flash. Roles and the boot pointer
//! live in `layout.json`, which is replaced through a temp file and a rename
//! so a crash never leaves a half-written boot pointer behind.

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use flashgate_update::{
    AppDescriptor, FlashLayout, HEADER_WINDOW, Partition, PartitionRegistry, StagingWriter, extract,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::CliError;

/// Name of the layout record inside a flash directory
pub const LAYOUT_FILE: &str = "layout.json";

/// Flash simulated as a directory of partition files
pub struct DirFlash {
    root: PathBuf,
    layout: Mutex<FlashLayout>,
}

impl DirFlash {
    /// Create a new flash directory with erased partitions
    pub async fn create(root: &Path, layout: FlashLayout) -> Result<Self> {
        if fs::try_exists(root.join(LAYOUT_FILE)).await.unwrap_or(false) {
            return Err(CliError::LayoutExists(root.to_path_buf()).into());
        }
        fs::create_dir_all(root)
            .await
            .with_context(|| format!("Failed to create flash directory {}", root.display()))?;

        let flash = Self {
            root: root.to_path_buf(),
            layout: Mutex::new(layout.clone()),
        };
        for partition in &layout.partitions {
            let path = flash.partition_path(partition);
            fs::File::create(&path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }
        flash.persist(&layout).await?;
        info!(
            "Created flash layout with {} partitions in {}",
            layout.partitions.len(),
            root.display()
        );
        Ok(flash)
    }

    /// Open an existing flash directory
    pub async fn open(root: &Path) -> Result<Self> {
        let path = root.join(LAYOUT_FILE);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CliError::LayoutNotFound(root.to_path_buf()).into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let layout: FlashLayout = serde_json::from_str(&text).map_err(CliError::from)?;
        debug!("Opened flash layout from {}", path.display());
        Ok(Self {
            root: root.to_path_buf(),
            layout: Mutex::new(layout),
        })
    }

    /// Flash directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `partition`
    pub fn partition_path(&self, partition: &Partition) -> PathBuf {
        self.root.join(format!("{}.bin", partition.label))
    }

    /// Current layout
    pub async fn layout(&self) -> FlashLayout {
        self.layout.lock().await.clone()
    }

    /// Write `image` into the partition labelled `label`, bypassing any session
    pub async fn install(&self, label: &str, image: &[u8]) -> Result<()> {
        let partition = self.layout.lock().await.get(label)?.clone();
        ensure!(
            image.len() as u64 <= partition.size,
            "Image of {} bytes does not fit {} ({} bytes)",
            image.len(),
            partition,
            partition.size
        );
        let path = self.partition_path(&partition);
        fs::write(&path, image)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply the boot pointer, as a successful restart would
    ///
    /// Returns the partition now running.
    pub async fn reboot(&self) -> Result<Partition> {
        let mut layout = self.layout.lock().await;
        ensure_restart_pending(&layout)?;
        let mut next = layout.clone();
        next.reboot();
        self.persist(&next).await?;
        *layout = next;
        let running = layout.running_partition()?.clone();
        info!("Rebooted into {}", running);
        Ok(running)
    }

    /// Simulate a failed boot of the partition named by the boot pointer
    ///
    /// The failed partition is recorded as last failed and both the boot
    /// pointer and the running role fall back to the previously running
    /// partition. Returns the failed partition.
    pub async fn mark_failed(&self) -> Result<Partition> {
        let mut layout = self.layout.lock().await;
        ensure_restart_pending(&layout)?;
        let failed = layout.boot_partition()?.clone();
        let previous = layout.running.clone();
        let mut next = layout.clone();
        next.reboot();
        next.fail_boot(&previous)?;
        self.persist(&next).await?;
        *layout = next;
        info!("Boot of {} failed, fell back to {}", failed, previous);
        Ok(failed)
    }

    async fn persist(&self, layout: &FlashLayout) -> Result<()> {
        let path = self.root.join(LAYOUT_FILE);
        let tmp = self.root.join(format!("{LAYOUT_FILE}.tmp"));
        let text = serde_json::to_string_pretty(layout)?;
        fs::write(&tmp, text)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

fn ensure_restart_pending(layout: &FlashLayout) -> Result<()> {
    if layout.boot == layout.running {
        return Err(CliError::InvalidState(format!(
            "boot pointer already names the running partition '{}'",
            layout.running
        ))
        .into());
    }
    Ok(())
}

#[async_trait]
impl PartitionRegistry for DirFlash {
    async fn partitions(&self) -> Result<Vec<Partition>> {
        Ok(self.layout.lock().await.partitions.clone())
    }

    async fn running_partition(&self) -> Result<Partition> {
        Ok(self.layout.lock().await.running_partition()?.clone())
    }

    async fn boot_partition(&self) -> Result<Partition> {
        Ok(self.layout.lock().await.boot_partition()?.clone())
    }

    async fn next_staging_partition(&self) -> Result<Option<Partition>> {
        Ok(self.layout.lock().await.next_staging_partition()?.cloned())
    }

    async fn last_failed_partition(&self) -> Result<Option<Partition>> {
        Ok(self.layout.lock().await.last_failed_partition()?.cloned())
    }

    async fn read_descriptor(&self, partition: &Partition) -> Result<Option<AppDescriptor>> {
        let path = self.partition_path(partition);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
        };
        let mut window = Vec::with_capacity(HEADER_WINDOW);
        file.take(HEADER_WINDOW as u64)
            .read_to_end(&mut window)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(extract(&window).descriptor().map(|d| d.app.clone()))
    }

    async fn open_writer(
        &self,
        partition: &Partition,
        declared_length: u64,
    ) -> Result<Box<dyn StagingWriter>> {
        ensure!(
            declared_length <= partition.size,
            "{} bytes do not fit {} ({} bytes)",
            declared_length,
            partition,
            partition.size
        );
        let path = self.partition_path(partition);
        let file = fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to erase {}", path.display()))?;
        debug!("Erased {} for staging", path.display());
        Ok(Box::new(DirWriter {
            file,
            path,
            written: 0,
            capacity: partition.size,
        }))
    }

    async fn set_boot_pointer(&self, partition: &Partition) -> Result<()> {
        let mut layout = self.layout.lock().await;
        let mut next = layout.clone();
        next.set_boot(&partition.label)?;
        self.persist(&next).await?;
        *layout = next;
        Ok(())
    }
}

struct DirWriter {
    file: fs::File,
    path: PathBuf,
    written: u64,
    capacity: u64,
}

#[async_trait]
impl StagingWriter for DirWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let end = self.written.saturating_add(data.len() as u64);
        ensure!(
            end <= self.capacity,
            "write would end at {} past the partition end {}",
            end,
            self.capacity
        );
        self.file
            .write_all(data)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        self.written = end;
        Ok(())
    }

    async fn seal(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("Failed to sync {}", self.path.display()))?;
        debug!("Sealed {} after {} bytes", self.path.display(), self.written);
        Ok(())
    }
}
