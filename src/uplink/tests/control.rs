use super::*;

#[tokio::test]
async fn test_stats_count_each_state() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::scripted([Step::Fail(TransferError::Permanent(
        "403 Forbidden".to_string(),
    ))]);
    let uplink = create_uplink_with(dir.path(), mock, |c| {
        c.upload.max_concurrent_uploads = 1;
    })
    .await;

    let dead = submit_bytes(&uplink, "dead", b"1", Priority::High).await;
    let done = submit_bytes(&uplink, "done", b"2", Priority::Normal).await;

    assert_eq!(uplink.stats().await.unwrap().pending, 2);

    uplink.start_scheduler();
    wait_for_state(&uplink, dead, ArtifactState::Dead).await;
    wait_for_state(&uplink, done, ArtifactState::Done).await;
    uplink.shutdown().await.unwrap();

    submit_pending_directly(&uplink).await;

    let stats = uplink.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.done, 1);
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.outstanding(), 1);

    assert_eq!(
        uplink.artifacts_in(ArtifactState::Dead).await.unwrap()[0].id,
        dead
    );
    assert_eq!(uplink.artifacts().await.unwrap().len(), 3);
}

async fn submit_pending_directly(uplink: &Uplink) {
    uplink
        .db
        .enqueue(&crate::db::NewArtifact {
            name: "late".to_string(),
            source: "test:late".to_string(),
            payload_path: "/nonexistent".into(),
            owns_payload: false,
            size_bytes: 1,
            checksum: "00".to_string(),
            priority: Priority::Normal,
            created_at: 0,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_artifact_is_not_found() {
    let (uplink, _dir) = create_test_uplink().await;

    let err = uplink.artifact(ArtifactId(4242)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(ArtifactId(4242))), "got {err:?}");
}

#[tokio::test]
async fn test_history_lists_transitions_in_order() {
    let (uplink, _dir) = create_test_uplink().await;
    let id = submit_bytes(&uplink, "a", b"payload", Priority::Normal).await;

    uplink.start_scheduler();
    wait_for_state(&uplink, id, ArtifactState::Done).await;
    uplink.shutdown().await.unwrap();

    let history = uplink.history(id).await.unwrap();
    assert_eq!(history[0].from, None);
    assert_eq!(history[0].to, ArtifactState::Pending);
    assert_eq!(history.last().unwrap().to, ArtifactState::Done);
    assert!(history.windows(2).all(|w| w[0].at <= w[1].at));
}

#[tokio::test]
async fn test_speed_limit_can_change_at_runtime() {
    let (uplink, _dir) = create_test_uplink().await;
    assert_eq!(uplink.speed_limit(), None);

    uplink.set_speed_limit(Some(1_000_000));
    assert_eq!(uplink.speed_limit(), Some(1_000_000));

    uplink.set_speed_limit(None);
    assert_eq!(uplink.speed_limit(), None);
}

#[tokio::test]
async fn test_active_count_tracks_running_transfers() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::scripted([Step::Hang { bytes: 0 }]);
    let uplink = create_uplink_with(dir.path(), mock, |_| {}).await;

    assert_eq!(uplink.active_count().await, 0);
    let id = submit_bytes(&uplink, "a", b"payload", Priority::Normal).await;
    uplink.start_scheduler();
    wait_for_state(&uplink, id, ArtifactState::InFlight).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while uplink.active_count().await != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    uplink.shutdown().await.unwrap();
    assert_eq!(uplink.active_count().await, 0);
}
