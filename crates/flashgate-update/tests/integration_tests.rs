//! Integration tests for the update session lifecycle

use anyhow::{Context, Result};
use async_trait::async_trait;
use flashgate_update::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const ROOT: &str = "/spiffs";
const SLOT: u64 = 0x10_0000;

struct Rig {
    flash: MemoryFlash,
    restart: Arc<RestartFlag>,
    engine: Arc<UpdateEngine>,
}

fn rig_with(config: UpdateConfig, flash: MemoryFlash) -> Result<Rig> {
    let restart = Arc::new(RestartFlag::new());
    let engine = UpdateEngine::new(config, Arc::new(flash.clone()), restart.clone())?;
    Ok(Rig {
        flash,
        restart,
        engine: Arc::new(engine),
    })
}

/// Factory image v1.0 running from a fresh three-slot layout
fn rig(config: UpdateConfig) -> Result<Rig> {
    let flash = MemoryFlash::new(SLOT);
    flash.install("factory", &ImageBuilder::new("v1.0").build())?;
    rig_with(config, flash)
}

fn assert_untouched(rig: &Rig) {
    assert_eq!(rig.flash.boot_label(), "factory");
    assert_eq!(rig.flash.boot_pointer_writes(), 0);
    assert!(!rig.restart.is_requested());
    assert!(!rig.engine.is_busy(), "guard must be released");
    assert_eq!(rig.flash.live_writers(), 0, "writer must be released");
}

/// Source that hands back more bytes than it was asked for
struct Overrun;

#[async_trait]
impl ChunkSource for Overrun {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ChunkError> {
        Ok(buf.len() + 1)
    }
}

/// Source that reports success with no data
struct Silent;

#[async_trait]
impl ChunkSource for Silent {
    async fn read_chunk(&mut self, _buf: &mut [u8]) -> Result<usize, ChunkError> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_happy_path_commits_and_requests_restart() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let image = ImageBuilder::new("v2.0").total_len(2048).build();
    let mut source = SliceSource::new(image.clone(), 256);

    let report = rig.engine.upload(2048, ROOT, &mut source).await?;

    assert_eq!(report.state, SessionState::RestartRequested);
    assert_eq!(report.bytes_written, 2048);
    assert_eq!(report.target.label, "ota_0");
    assert_eq!(report.header_state, HeaderState::Validated);
    assert_eq!(report.decision, Some(VersionDecision::Proceed));
    assert!(report.warnings.is_empty());
    assert_eq!(
        report.descriptor.map(|d| d.version),
        Some(FirmwareVersion::new("v2.0"))
    );

    assert_eq!(rig.flash.boot_label(), "ota_0");
    assert_eq!(rig.flash.running_label(), "factory");
    assert_eq!(rig.flash.staged_bytes("ota_0", 2048), Some(image));
    assert_eq!(rig.restart.count(), 1);
    assert!(!rig.engine.is_busy());
    assert_eq!(rig.flash.live_writers(), 0);
    Ok(())
}

#[tokio::test]
async fn test_too_large_is_rejected_before_any_partition_is_touched() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let mut source = SliceSource::new(vec![0; 16], 16);

    let result = rig.engine.upload(1024 * 1024 + 1, ROOT, &mut source).await;

    assert!(matches!(
        result,
        Err(UpdateError::TooLarge {
            declared: 1_048_577,
            limit: 1_048_576
        })
    ));
    assert_eq!(source.position(), 0);
    assert_eq!(
        rig.flash.contents("ota_0").context("slot")?,
        vec![0xFF; SLOT as usize]
    );
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_transport_error_midway_aborts_without_commit() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let image = ImageBuilder::new("v2.0").total_len(2048).build();
    let mut source = SliceSource::new(image.clone(), 100).fail_at(500, "connection reset");

    let result = rig.engine.upload(2048, ROOT, &mut source).await;

    match result {
        Err(UpdateError::TransportFailure { received, reason }) => {
            assert_eq!(received, 500);
            assert!(reason.contains("connection reset"));
        }
        other => panic!("expected transport failure, got {other:?}"),
    }
    assert_eq!(rig.flash.staged_bytes("ota_0", 500), image.get(..500).map(<[u8]>::to_vec));
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_same_as_failed_version_warns_and_still_commits() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let image = ImageBuilder::new("v2.0").build();

    // First attempt boots, fails and is rolled back to factory.
    let mut source = SliceSource::new(image.clone(), 1024);
    rig.engine.upload(image.len() as u64, ROOT, &mut source).await?;
    rig.flash.reboot();
    assert_eq!(rig.flash.running_label(), "ota_0");
    rig.flash.fail_boot("factory")?;

    let mut source = SliceSource::new(image.clone(), 1024);
    let report = rig.engine.upload(image.len() as u64, ROOT, &mut source).await?;

    assert_eq!(report.decision, Some(VersionDecision::WarnSameAsFailed));
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.state, SessionState::RestartRequested);
    assert_eq!(rig.flash.boot_label(), "ota_0");
    assert_eq!(rig.restart.count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_reject_known_bad_blocks_failed_version() -> Result<()> {
    let config = UpdateConfig {
        version_mode: VersionMode::RejectKnownBad,
        ..UpdateConfig::default()
    };
    let rig = rig(config)?;
    rig.flash.install("ota_1", &ImageBuilder::new("v2.0").build())?;
    rig.flash.set_last_failed(Some("ota_1"))?;

    let image = ImageBuilder::new("v2.0").build();
    let mut source = SliceSource::new(image.clone(), 1024);
    let result = rig.engine.upload(image.len() as u64, ROOT, &mut source).await;

    assert!(matches!(result, Err(UpdateError::VersionRejected(_))));
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_same_as_running_stays_advisory_under_reject_known_bad() -> Result<()> {
    let config = UpdateConfig {
        version_mode: VersionMode::RejectKnownBad,
        ..UpdateConfig::default()
    };
    let rig = rig(config)?;
    let image = ImageBuilder::new("v1.0").build();
    let mut source = SliceSource::new(image.clone(), 1024);

    let report = rig.engine.upload(image.len() as u64, ROOT, &mut source).await?;

    assert_eq!(report.decision, Some(VersionDecision::WarnNoNewer));
    assert_eq!(rig.flash.boot_label(), "ota_0");
    Ok(())
}

#[tokio::test]
async fn test_chunk_sizes_produce_identical_partition_contents() -> Result<()> {
    let image = ImageBuilder::new("v5.5").total_len(20_000).build();
    let n = image.len();
    let mut staged = Vec::new();

    for chunk in [1, 17, 8192, n] {
        let rig = rig(UpdateConfig::default())?;
        let mut source = SliceSource::new(image.clone(), chunk);
        let report = rig.engine.upload(n as u64, ROOT, &mut source).await?;
        assert_eq!(report.header_state, HeaderState::Validated, "chunk size {chunk}");
        staged.push((report.sha256, rig.flash.contents("ota_0").context("slot")?));
    }

    let (first_digest, first_contents) = staged.first().context("no runs")?;
    for (digest, contents) in &staged {
        assert_eq!(digest, first_digest);
        assert_eq!(contents, first_contents);
    }
    assert_eq!(first_contents.get(..n), Some(image.as_slice()));
    Ok(())
}

#[tokio::test]
async fn test_first_chunk_mode_writes_unvalidated_image_on_short_first_chunk() -> Result<()> {
    let config = UpdateConfig {
        header_mode: HeaderMode::FirstChunk,
        ..UpdateConfig::default()
    };
    let rig = rig(config)?;
    let image = ImageBuilder::new("v2.0").build();
    let mut source = SliceSource::new(image.clone(), 100);

    let report = rig.engine.upload(image.len() as u64, ROOT, &mut source).await?;

    assert_eq!(report.header_state, HeaderState::Rejected);
    assert!(report.decision.is_none());
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.state, SessionState::RestartRequested);
    assert_eq!(rig.flash.staged_bytes("ota_0", image.len()), Some(image));
    Ok(())
}

#[tokio::test]
async fn test_accumulate_mode_validates_across_short_chunks() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let image = ImageBuilder::new("v2.0").build();
    let mut source = SliceSource::new(image.clone(), 100);

    let report = rig.engine.upload(image.len() as u64, ROOT, &mut source).await?;

    assert_eq!(report.header_state, HeaderState::Validated);
    assert_eq!(report.decision, Some(VersionDecision::Proceed));
    Ok(())
}

#[tokio::test]
async fn test_strict_mode_rejects_stream_shorter_than_header() -> Result<()> {
    let config = UpdateConfig {
        header_mode: HeaderMode::Strict,
        ..UpdateConfig::default()
    };
    let rig = rig(config)?;
    let image = ImageBuilder::new("v2.0").build();
    let short = image.get(..200).context("image")?.to_vec();
    let mut source = SliceSource::new(short, 64);

    let result = rig.engine.upload(200, ROOT, &mut source).await;

    assert!(matches!(result, Err(UpdateError::HeaderRejected(_))));
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_strict_mode_rejects_malformed_header() -> Result<()> {
    let config = UpdateConfig {
        header_mode: HeaderMode::Strict,
        ..UpdateConfig::default()
    };
    let rig = rig(config)?;
    let mut image = ImageBuilder::new("v2.0").build();
    if let Some(magic) = image.first_mut() {
        *magic = 0x00;
    }
    let mut source = SliceSource::new(image.clone(), 1024);

    let result = rig.engine.upload(image.len() as u64, ROOT, &mut source).await;

    assert!(matches!(result, Err(UpdateError::HeaderRejected(_))));
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_malformed_header_is_advisory_by_default() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let mut image = ImageBuilder::new("v2.0").build();
    if let Some(magic) = image.first_mut() {
        *magic = 0x00;
    }
    let mut source = SliceSource::new(image.clone(), 1024);

    let report = rig.engine.upload(image.len() as u64, ROOT, &mut source).await?;

    assert_eq!(report.header_state, HeaderState::Rejected);
    assert_eq!(rig.flash.boot_label(), "ota_0");
    Ok(())
}

#[tokio::test]
async fn test_timeouts_are_retried_without_consuming_quota() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let image = ImageBuilder::new("v2.0").total_len(4096).build();
    let mut source = SliceSource::new(image.clone(), 512)
        .timeouts_at(0, 5)
        .timeouts_at(1024, 3);

    let report = rig.engine.upload(4096, ROOT, &mut source).await?;

    assert_eq!(source.timeouts_served(), 8);
    assert_eq!(report.bytes_written, 4096);
    assert_eq!(rig.flash.staged_bytes("ota_0", 4096), Some(image));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_receive_deadline_aborts_stalled_stream() -> Result<()> {
    let config = UpdateConfig {
        receive_deadline_ms: Some(5_000),
        ..UpdateConfig::default()
    };
    let rig = rig(config)?;
    let image = ImageBuilder::new("v2.0").total_len(4096).build();
    let mut source = SliceSource::new(image, 512)
        .stall_at(1024)
        .with_timeout_delay(Duration::from_secs(1));

    let result = rig.engine.upload(4096, ROOT, &mut source).await;

    assert!(matches!(
        result,
        Err(UpdateError::DeadlineExceeded(d)) if d == Duration::from_secs(5)
    ));
    assert!(source.timeouts_served() >= 4);
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_short_stalls_stay_within_deadline() -> Result<()> {
    let config = UpdateConfig {
        receive_deadline_ms: Some(5_000),
        ..UpdateConfig::default()
    };
    let rig = rig(config)?;
    let image = ImageBuilder::new("v2.0").total_len(4096).build();
    let mut source = SliceSource::new(image, 512)
        .timeouts_at(512, 3)
        .timeouts_at(2048, 3)
        .with_timeout_delay(Duration::from_secs(1));

    let report = rig.engine.upload(4096, ROOT, &mut source).await?;

    assert_eq!(report.bytes_written, 4096);
    Ok(())
}

#[tokio::test]
async fn test_cancel_aborts_active_session() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let image = ImageBuilder::new("v2.0").total_len(2048).build();
    let mut progress = rig.engine.subscribe_progress();

    let engine = Arc::clone(&rig.engine);
    let task = tokio::spawn(async move {
        let mut source = SliceSource::new(image, 256)
            .stall_at(512)
            .with_timeout_delay(Duration::from_millis(5));
        engine.upload(2048, ROOT, &mut source).await
    });

    loop {
        let snapshot = tokio::time::timeout(Duration::from_secs(5), progress.recv()).await??;
        if snapshot.bytes_written >= 512 {
            break;
        }
    }
    rig.engine.cancel()?;

    let result = task.await?;
    assert!(matches!(result, Err(UpdateError::Cancelled(512))));
    assert_untouched(&rig);
    assert!(matches!(rig.engine.cancel(), Err(UpdateError::NoActiveSession)));
    Ok(())
}

#[tokio::test]
async fn test_write_failure_aborts_with_offset() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    rig.flash.set_faults(FaultPlan {
        fail_write_at: Some(1000),
        ..FaultPlan::default()
    });
    let image = ImageBuilder::new("v2.0").total_len(2048).build();
    let mut source = SliceSource::new(image, 512);

    let result = rig.engine.upload(2048, ROOT, &mut source).await;

    assert!(matches!(
        result,
        Err(UpdateError::WriteFailure { offset: 512, .. })
    ));
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_seal_failure_leaves_boot_pointer() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    rig.flash.set_faults(FaultPlan {
        fail_seal: true,
        ..FaultPlan::default()
    });
    let image = ImageBuilder::new("v2.0").build();
    let mut source = SliceSource::new(image.clone(), 1024);

    let result = rig.engine.upload(image.len() as u64, ROOT, &mut source).await;

    assert!(matches!(result, Err(UpdateError::SealFailure(_))));
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_boot_pointer_failure_leaves_image_inert() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    rig.flash.set_faults(FaultPlan {
        fail_boot_pointer: true,
        ..FaultPlan::default()
    });
    let image = ImageBuilder::new("v2.0").build();
    let mut source = SliceSource::new(image.clone(), 1024);

    let result = rig.engine.upload(image.len() as u64, ROOT, &mut source).await;

    assert!(matches!(result, Err(UpdateError::BootPointerFailure(_))));
    assert_eq!(rig.flash.staged_bytes("ota_0", image.len()), Some(image));
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_overrun_aborts_with_length_exceeded() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let result = rig.engine.upload(4096, ROOT, &mut Overrun).await;

    assert!(matches!(
        result,
        Err(UpdateError::LengthExceeded {
            declared: 4096,
            received: 4097
        })
    ));
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_empty_read_is_transport_failure() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let result = rig.engine.upload(4096, ROOT, &mut Silent).await;

    assert!(matches!(
        result,
        Err(UpdateError::TransportFailure { received: 0, .. })
    ));
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_admission_rejections() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;

    let zero = rig.engine.begin(0, ROOT).await;
    assert!(matches!(zero, Err(UpdateError::InvalidLength(0))));

    let foreign = rig.engine.begin(1024, "/sdcard").await;
    assert!(matches!(foreign, Err(UpdateError::InvalidTarget(_))));

    for err in [zero, foreign].into_iter().filter_map(|r| r.err()) {
        assert!(err.is_admission());
        assert_eq!(err.status_code(), 400);
    }
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_declared_length_larger_than_slot_is_too_large() -> Result<()> {
    let rig = rig_with(UpdateConfig::default(), MemoryFlash::new(0x1000))?;
    let result = rig.engine.begin(0x2000, ROOT).await;

    assert!(matches!(
        result,
        Err(UpdateError::TooLarge {
            declared: 0x2000,
            limit: 0x1000
        })
    ));
    assert_eq!(rig.flash.live_writers(), 0);
    Ok(())
}

#[tokio::test]
async fn test_single_slot_layout_has_no_staging_partition() -> Result<()> {
    let layout = FlashLayout {
        partitions: vec![Partition::new(
            "ota_0",
            flashgate_update::PartitionKind::Ota(0),
            0x1_0000,
            0x1000,
        )],
        running: "ota_0".to_string(),
        boot: "ota_0".to_string(),
        last_failed: None,
    };
    let rig = rig_with(UpdateConfig::default(), MemoryFlash::with_layout(layout))?;

    let result = rig.engine.begin(16, ROOT).await;

    assert!(matches!(result, Err(UpdateError::NoStagingPartition)));
    assert!(!rig.engine.is_busy());
    Ok(())
}

#[tokio::test]
async fn test_second_admission_is_rejected_while_first_is_active() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let first = rig.engine.begin(2048, ROOT).await?;

    let second = rig.engine.begin(2048, ROOT).await;
    assert!(matches!(second, Err(UpdateError::AlreadyInProgress(_))));

    let mut source = SliceSource::new(vec![0; 2048], 512);
    let third = rig.engine.upload(2048, ROOT, &mut source).await;
    assert!(matches!(&third, Err(e) if e.status_code() == 409));
    assert_eq!(source.position(), 0);

    drop(first);
    assert!(!rig.engine.is_busy());
    assert_eq!(rig.flash.live_writers(), 0);
    assert!(rig.engine.begin(2048, ROOT).await.is_ok());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admissions_admit_exactly_one() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let barrier = Arc::new(tokio::sync::Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&rig.engine);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                let session = engine.begin(1024, ROOT).await;
                // Keep the winner admitted until every task has tried.
                barrier.wait().await;
                session.is_ok()
            })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await? {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
    assert!(!rig.engine.is_busy());
    Ok(())
}

#[tokio::test]
async fn test_commit_refuses_incomplete_session() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let mut session = rig.engine.begin(2048, ROOT).await?;

    let result = rig.engine.commit(&mut session).await;

    assert!(matches!(
        result,
        Err(UpdateError::IncompleteTransfer {
            written: 0,
            declared: 2048
        })
    ));
    assert!(session.holds_writer());
    drop(session);
    assert_untouched(&rig);
    Ok(())
}

#[tokio::test]
async fn test_progress_is_reported_per_chunk() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let mut rx = rig.engine.subscribe_progress();
    let image = ImageBuilder::new("v2.0").total_len(2048).build();
    let mut source = SliceSource::new(image, 500);

    rig.engine.upload(2048, ROOT, &mut source).await?;

    let mut snapshots = Vec::new();
    while let Ok(snapshot) = rx.try_recv() {
        snapshots.push(snapshot);
    }
    let phases: Vec<UpdatePhase> = snapshots.iter().map(|s| s.phase).collect();
    assert_eq!(phases.first(), Some(&UpdatePhase::Admitted));
    assert_eq!(phases.last(), Some(&UpdatePhase::RestartRequested));

    let receiving: Vec<u8> = snapshots
        .iter()
        .filter(|s| s.phase == UpdatePhase::Receiving)
        .map(|s| s.progress_percent)
        .collect();
    assert_eq!(receiving, vec![24, 48, 73, 97, 100]);
    Ok(())
}

#[tokio::test]
async fn test_upload_from_file_reader() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("app.bin");
    let image = ImageBuilder::new("v6.0").total_len(10_000).build();
    tokio::fs::write(&path, &image).await?;

    let file = tokio::fs::File::open(&path).await?;
    let mut source = ReaderSource::new(file);
    let report = rig.engine.upload(image.len() as u64, ROOT, &mut source).await?;

    assert_eq!(report.state, SessionState::RestartRequested);
    assert_eq!(rig.flash.staged_bytes("ota_0", image.len()), Some(image));
    Ok(())
}

#[tokio::test]
async fn test_staging_alternates_after_reboot() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;

    for (version, expected) in [("v2.0", "ota_0"), ("v3.0", "ota_1"), ("v4.0", "ota_0")] {
        let image = ImageBuilder::new(version).build();
        let mut source = SliceSource::new(image.clone(), 4096);
        let report = rig.engine.upload(image.len() as u64, ROOT, &mut source).await?;
        assert_eq!(report.target.label, expected);
        rig.flash.reboot();
        assert_eq!(rig.flash.running_label(), expected);
    }

    let infos = describe_partitions(&rig.flash).await?;
    let running = infos
        .iter()
        .find(|i| i.has_role(PartitionRole::Running))
        .context("no running partition")?;
    assert_eq!(running.partition.label, "ota_0");
    assert_eq!(
        running.descriptor.as_ref().map(|d| d.version),
        Some(FirmwareVersion::new("v4.0"))
    );
    assert!(
        infos
            .iter()
            .any(|i| i.partition.label == "ota_1" && i.has_role(PartitionRole::StagingCandidate))
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_upload_before_restart_keeps_pending_boot_image() -> Result<()> {
    let rig = rig(UpdateConfig::default())?;
    let committed = ImageBuilder::new("v2.0").build();
    let mut source = SliceSource::new(committed.clone(), 4096);
    rig.engine.upload(committed.len() as u64, ROOT, &mut source).await?;
    assert_eq!(rig.flash.boot_label(), "ota_0");
    assert_eq!(rig.flash.running_label(), "factory");

    // No restart yet: the next session must stage elsewhere.
    let next = ImageBuilder::new("v3.0").total_len(2048).build();
    let mut source = SliceSource::new(next.clone(), 100).fail_at(500, "connection reset");
    let result = rig.engine.upload(2048, ROOT, &mut source).await;

    assert!(matches!(
        result,
        Err(UpdateError::TransportFailure { received: 500, .. })
    ));
    assert_eq!(rig.flash.boot_label(), "ota_0");
    assert_eq!(rig.flash.boot_pointer_writes(), 1);
    assert_eq!(rig.flash.staged_bytes("ota_0", committed.len()), Some(committed));
    assert_eq!(rig.flash.staged_bytes("ota_1", 500), next.get(..500).map(<[u8]>::to_vec));
    assert!(!rig.engine.is_busy());
    assert_eq!(rig.flash.live_writers(), 0);

    rig.flash.reboot();
    assert_eq!(rig.flash.running_label(), "ota_0");
    Ok(())
}
