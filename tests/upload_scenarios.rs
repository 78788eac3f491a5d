//! End-to-end upload sessions against scripted storage servers.

mod common;

use common::{fast_config, random_data, FailingReader, FailureScript, Harness, ScriptedClient};
use shardstream::coordinator::{
    ChunkState, CoordinatorError, FailureReason, SessionStatus, UploadRequest,
};
use shardstream::integrity::IntegrityVerifier;
use shardstream::ledger::{LedgerEntry, LedgerError};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

fn request(data: &[u8]) -> UploadRequest {
    UploadRequest::new("payload.bin", "application/octet-stream", data.len() as u64)
}

#[tokio::test]
async fn test_ten_mib_in_four_mib_chunks() {
    let harness = Harness::new(
        fast_config(4 * MIB),
        vec![
            ScriptedClient::new("s1"),
            ScriptedClient::new("s2"),
            ScriptedClient::new("s3"),
        ],
    )
    .await;
    let data = random_data(10 * MIB);

    let handle = harness
        .coordinator
        .start_upload(Cursor::new(data.clone()), request(&data))
        .unwrap();
    let session_id = handle.session_id().to_string();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.progress_percent, 100.0);
    assert_eq!(outcome.total_chunks, 3);

    let sizes: Vec<u64> = outcome.chunks.iter().map(|c| c.size).collect();
    assert_eq!(sizes, vec![4 * MIB as u64, 4 * MIB as u64, 2 * MIB as u64]);
    assert!(outcome.chunks.iter().all(|c| c.state.attempts() == 1));

    assert_eq!(harness.reassemble(&outcome), data);
    assert_eq!(
        outcome.checksum.as_deref(),
        Some(hex::encode(IntegrityVerifier::calculate_checksum(&data)).as_str())
    );

    assert_eq!(
        harness.recorder.session_statuses(&session_id),
        vec!["preparing", "distributing", "uploading", "completed"]
    );
}

#[tokio::test]
async fn test_chunk_retried_on_other_servers() {
    let script = Arc::new(FailureScript::default());
    script.fail_chunk(1, 2);

    let harness = Harness::new(
        fast_config(1024),
        vec![
            ScriptedClient::new("s1").with_script(script.clone()),
            ScriptedClient::new("s2").with_script(script.clone()),
            ScriptedClient::new("s3").with_script(script.clone()),
        ],
    )
    .await;
    let data = random_data(3000);

    let handle = harness
        .coordinator
        .start_upload(Cursor::new(data.clone()), request(&data))
        .unwrap();
    let session_id = handle.session_id().to_string();
    let outcome = handle.wait().await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(outcome.chunk(1).unwrap().state.attempts(), 3);
    assert_eq!(outcome.chunk(0).unwrap().state.attempts(), 1);
    assert_eq!(outcome.chunk(2).unwrap().state.attempts(), 1);
    assert!(outcome.chunk(1).unwrap().last_error.is_some());

    // Each failing server was excluded, so every server saw chunk 1 once.
    for client in &harness.clients {
        assert_eq!(client.attempts_for(1), 1);
    }

    let retries = harness
        .recorder
        .chunk_events(&session_id, 1)
        .iter()
        .filter(|e| e.reason.as_deref() == Some("dispatch_failed"))
        .count();
    assert_eq!(retries, 2);
    assert_eq!(harness.reassemble(&outcome), data);
}

#[tokio::test]
async fn test_no_capable_server_keeps_completed_chunks() {
    let mut config = fast_config(256);
    config.max_in_flight = 1;
    let harness = Harness::new(
        config,
        vec![ScriptedClient::new("small")
            .with_free_space(640)
            .consuming_space()],
    )
    .await;
    let data = random_data(768);

    let outcome = harness
        .coordinator
        .upload(Cursor::new(data.clone()), request(&data))
        .await
        .unwrap();

    assert_eq!(outcome.failure_reason(), Some(FailureReason::NoCapableServer));
    assert!(outcome.chunk(0).unwrap().state.is_completed());
    assert!(matches!(
        outcome.chunk(1).unwrap().state,
        ChunkState::Failed {
            reason: FailureReason::NoCapableServer,
            ..
        }
    ));

    let checksum = outcome.checksum.unwrap();
    let entry = harness
        .coordinator
        .ledger()
        .find_by_checksum(&checksum)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.completed_indices().into_iter().collect::<Vec<_>>(), vec![0]);
    assert_eq!(entry.total_chunks, 3);
}

#[tokio::test]
async fn test_resume_skips_ledger_chunks() {
    let mut config = fast_config(256);
    config.max_in_flight = 1;
    let harness = Harness::new(
        config,
        vec![ScriptedClient::new("node")
            .with_free_space(640)
            .consuming_space()],
    )
    .await;
    let data = random_data(1000);

    let first = harness
        .coordinator
        .upload(Cursor::new(data.clone()), request(&data))
        .await
        .unwrap();
    assert_eq!(first.failure_reason(), Some(FailureReason::NoCapableServer));
    let checksum = first.checksum.clone().unwrap();

    let node = harness.client("node");
    assert_eq!(node.attempts_for(0), 1);
    node.set_free_space(1 << 20);

    let resumed = harness
        .coordinator
        .resume_upload(&checksum, Cursor::new(data.clone()), None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(resumed.is_completed());
    assert!(resumed.resumed);
    assert!(resumed.chunk(0).unwrap().from_ledger);
    assert!(!resumed.chunk(1).unwrap().from_ledger);

    // Chunk 0 was never sent again.
    assert_eq!(node.attempts_for(0), 1);
    assert_eq!(node.stored_count(), 4);
    assert_eq!(harness.reassemble(&resumed), data);

    assert!(harness
        .coordinator
        .ledger()
        .find_by_checksum(&checksum)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_plain_upload_resumes_matching_ledger_entry() {
    let harness = Harness::new(fast_config(100), vec![ScriptedClient::new("node")]).await;
    let data = random_data(450);
    let checksum = hex::encode(IntegrityVerifier::calculate_checksum(&data));

    let ledger = harness.coordinator.ledger();
    let entry = LedgerEntry {
        checksum: checksum.clone(),
        file_name: "payload.bin".into(),
        total_size: data.len() as u64,
        mime_type: "application/octet-stream".into(),
        total_chunks: 5,
        chunk_size: 100,
        owner: Some("alice".into()),
        completed: Vec::new(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    ledger.create_or_update(&entry).await.unwrap();
    for index in [0, 3] {
        ledger
            .mark_chunk_complete(&checksum, index, "node", &format!("elsewhere/{index}"), "00")
            .await
            .unwrap();
    }

    let outcome = harness
        .coordinator
        .upload(Cursor::new(data.clone()), request(&data))
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert!(outcome.resumed);
    let node = harness.client("node");
    assert_eq!(node.attempts_for(0), 0);
    assert_eq!(node.attempts_for(3), 0);
    assert_eq!(node.stored_count(), 3);

    // Finished, so nothing left to resume.
    assert!(ledger.list(Some("alice")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_with_mismatched_size_rejected() {
    let harness = Harness::new(fast_config(100), vec![ScriptedClient::new("node")]).await;
    let data = random_data(300);
    let checksum = hex::encode(IntegrityVerifier::calculate_checksum(&data));

    harness
        .coordinator
        .ledger()
        .create_or_update(&LedgerEntry {
            checksum: checksum.clone(),
            file_name: "payload.bin".into(),
            total_size: 301,
            mime_type: "application/octet-stream".into(),
            total_chunks: 4,
            chunk_size: 100,
            owner: None,
            completed: Vec::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let check = harness.coordinator.check_resumable(&checksum, 300).await;
    assert!(matches!(
        check,
        Err(CoordinatorError::LedgerError(LedgerError::SizeMismatch { .. }))
    ));

    let outcome = harness
        .coordinator
        .upload(Cursor::new(data.clone()), request(&data))
        .await
        .unwrap();
    assert_eq!(outcome.failure_reason(), Some(FailureReason::InputError));
    assert_eq!(harness.client("node").attempts(), 0);
}

#[tokio::test]
async fn test_resume_with_different_content_rejected() {
    let mut config = fast_config(100);
    config.max_in_flight = 1;
    let harness = Harness::new(
        config,
        vec![ScriptedClient::new("node").with_free_space(250).consuming_space()],
    )
    .await;
    let data = random_data(300);

    let first = harness
        .coordinator
        .upload(Cursor::new(data.clone()), request(&data))
        .await
        .unwrap();
    assert!(!first.is_completed());
    let checksum = first.checksum.unwrap();

    let other = random_data(300);
    let outcome = harness
        .coordinator
        .resume_upload(&checksum, Cursor::new(other), None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome.failure_reason(), Some(FailureReason::InputError));
}

#[tokio::test]
async fn test_chunk_failing_everywhere_fails_session() {
    let harness = Harness::new(
        fast_config(128),
        vec![
            ScriptedClient::new("s1").failing(),
            ScriptedClient::new("s2").failing(),
            ScriptedClient::new("s3").failing(),
        ],
    )
    .await;
    let data = random_data(128);

    let outcome = harness
        .coordinator
        .upload(Cursor::new(data.clone()), request(&data))
        .await
        .unwrap();

    assert_eq!(outcome.failure_reason(), Some(FailureReason::RetriesExhausted));
    match &outcome.chunk(0).unwrap().state {
        ChunkState::Failed {
            reason,
            attempts,
            excluded,
            ..
        } => {
            assert_eq!(*reason, FailureReason::RetriesExhausted);
            assert_eq!(*attempts, 3);
            assert_eq!(excluded, &vec!["s1".to_string(), "s2".into(), "s3".into()]);
        }
        other => panic!("unexpected chunk state {other:?}"),
    }

    // Every reservation was handed back.
    for record in harness.coordinator.accountant().list().await.unwrap() {
        assert_eq!(record.reserved_bytes, 0);
        assert_eq!(record.used_bytes, 0);
    }
}

#[tokio::test]
async fn test_every_server_failed_before_ceiling_exhausts_retries() {
    let mut config = fast_config(128);
    config.selection_timeout = Duration::from_secs(20);
    let harness = Harness::new(
        config,
        vec![ScriptedClient::new("s1").failing(), ScriptedClient::new("s2").failing()],
    )
    .await;
    let data = random_data(100);

    let started = std::time::Instant::now();
    let outcome = harness
        .coordinator
        .upload(Cursor::new(data.clone()), request(&data))
        .await
        .unwrap();

    // Reported as a dispatch failure, without sitting out the selection timeout.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.failure_reason(), Some(FailureReason::RetriesExhausted));
    assert_eq!(outcome.chunk(0).unwrap().state.attempts(), 2);
}

#[tokio::test]
async fn test_read_error_after_hashing_is_input_error() {
    let mut config = fast_config(256);
    config.max_in_flight = 2;
    let harness = Harness::new(
        config,
        vec![ScriptedClient::new("s1"), ScriptedClient::new("s2")],
    )
    .await;
    let data = random_data(1024);
    let checksum = hex::encode(IntegrityVerifier::calculate_checksum(&data));

    // Hash pass plus the first batch of two chunks, then the disk goes away.
    let source = FailingReader::new(data.clone(), 1024 + 512);
    let outcome = harness
        .coordinator
        .upload(source, request(&data))
        .await
        .unwrap();

    assert_eq!(outcome.failure_reason(), Some(FailureReason::InputError));
    let attempts: usize = harness.clients.iter().map(|c| c.attempts()).sum();
    assert_eq!(attempts, 2);
    let retries = harness
        .recorder
        .events()
        .iter()
        .filter(|e| e.reason.as_deref() == Some("dispatch_failed"))
        .count();
    assert_eq!(retries, 0);

    let entry = harness
        .coordinator
        .ledger()
        .find_by_checksum(&checksum)
        .await
        .unwrap()
        .expect("partial upload kept");
    assert_eq!(entry.completed_indices().into_iter().collect::<Vec<_>>(), vec![0, 1]);
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_chunks_settle() {
    let mut config = fast_config(100);
    config.max_in_flight = 1;
    let harness = Harness::new(
        config,
        vec![ScriptedClient::new("slow").with_delay(Duration::from_millis(200))],
    )
    .await;
    let data = random_data(1000);

    let handle = harness
        .coordinator
        .start_upload(Cursor::new(data.clone()), request(&data))
        .unwrap();
    for _ in 0..400 {
        if harness.client("slow").attempts() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.client("slow").attempts(), 1);

    assert!(harness.coordinator.shutdown().await);

    // The chunk already on the wire finished and was recorded.
    assert_eq!(harness.client("slow").stored_count(), 1);
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.failure_reason(), Some(FailureReason::Cancelled));
    assert!(outcome.chunk(0).unwrap().state.is_completed());

    let checksum = outcome.checksum.clone().unwrap();
    let entry = harness
        .coordinator
        .ledger()
        .find_by_checksum(&checksum)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.completed.len(), 1);
    for record in harness.coordinator.accountant().list().await.unwrap() {
        assert_eq!(record.reserved_bytes, 0);
    }
    let usage = harness
        .coordinator
        .accountant()
        .get("acct-slow")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.used_bytes, 100);

    assert!(matches!(
        harness
            .coordinator
            .start_upload(Cursor::new(data.clone()), request(&data)),
        Err(CoordinatorError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_cancel_stops_dispatching() {
    let mut config = fast_config(100);
    config.max_in_flight = 1;
    let harness = Harness::new(
        config,
        vec![ScriptedClient::new("slow").with_delay(Duration::from_millis(150))],
    )
    .await;
    let data = random_data(1000);

    let handle = harness
        .coordinator
        .start_upload(Cursor::new(data.clone()), request(&data))
        .unwrap();
    let session_id = handle.session_id().to_string();

    let mut checksum = None;
    for _ in 0..200 {
        let progress = harness.coordinator.progress(&session_id).unwrap();
        if progress.status == SessionStatus::Uploading {
            checksum = progress.checksum;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let checksum = checksum.expect("session never started uploading");

    assert!(matches!(
        harness.coordinator.delete_partial_upload(&checksum).await,
        Err(CoordinatorError::AlreadyInProgress(_))
    ));

    harness.coordinator.cancel_upload(&session_id).unwrap();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.failure_reason(), Some(FailureReason::Cancelled));
    assert!(harness.client("slow").stored_count() < 10);
    assert!(harness.coordinator.list_active().is_empty());

    // Finished sessions can be abandoned.
    assert!(harness
        .coordinator
        .delete_partial_upload(&checksum)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_concurrent_sessions_share_servers() {
    let harness = Harness::new(
        fast_config(512),
        vec![ScriptedClient::new("s1"), ScriptedClient::new("s2")],
    )
    .await;

    let mut handles = Vec::new();
    let mut files = Vec::new();
    for _ in 0..4 {
        let data = random_data(4096);
        handles.push(
            harness
                .coordinator
                .start_upload(Cursor::new(data.clone()), request(&data))
                .unwrap(),
        );
        files.push(data);
    }

    for (handle, data) in handles.into_iter().zip(files) {
        let outcome = handle.wait().await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(harness.reassemble(&outcome), data);
    }

    let stored: usize = harness.clients.iter().map(|c| c.stored_count()).sum();
    assert_eq!(stored, 4 * 8);

    let used: u64 = harness
        .coordinator
        .accountant()
        .list()
        .await
        .unwrap()
        .iter()
        .map(|r| r.used_bytes)
        .sum();
    assert_eq!(used, 4 * 4096);
}
