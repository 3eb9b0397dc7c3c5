use super::*;
use crate::Error;
use crate::db::Claim;
use crate::error::StoreError;
use crate::types::ArtifactState;
use crate::utils::now_millis;
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Enqueue
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_enqueue_and_get_artifact() {
    let (db, _dir) = open_store().await;

    let id = db
        .enqueue(&new_artifact("2024-05-01T12:00:00+0000.jpg", Priority::High, 1_000))
        .await
        .unwrap();
    assert!(id.0 > 0);

    let artifact = db.get_artifact(id).await.unwrap().unwrap();
    assert_eq!(artifact.name, "2024-05-01T12:00:00+0000.jpg");
    assert_eq!(artifact.state(), ArtifactState::Pending);
    assert_eq!(artifact.priority(), Priority::High);
    assert_eq!(artifact.attempts(), 0);
    assert_eq!(artifact.created_at, 1_000);
    assert_eq!(artifact.size_bytes, 1024);
    assert!(artifact.resume_token.is_none());

    let log = db.transitions(id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].from, None);
    assert_eq!(log[0].to, ArtifactState::Pending);

    db.close().await;
}

#[tokio::test]
async fn test_duplicate_checksum_and_source_is_rejected() {
    let (db, _dir) = open_store().await;
    let artifact = new_artifact("frame.jpg", Priority::Normal, 1);

    let first = db.enqueue(&artifact).await.unwrap();
    match db.enqueue(&artifact).await {
        Err(Error::DuplicateArtifact { existing, checksum }) => {
            assert_eq!(existing, first);
            assert_eq!(checksum, artifact.checksum);
        }
        other => panic!("expected duplicate error, got {other:?}"),
    }

    // Same bytes from a different source is a different artifact
    let mut other_source = artifact.clone();
    other_source.source = "camera-2".to_string();
    db.enqueue(&other_source).await.unwrap();

    assert_eq!(db.list_artifacts().await.unwrap().len(), 2);
    db.close().await;
}

// ----------------------------------------------------------------------------
// Scheduling order
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_next_eligible_orders_by_priority_then_age() {
    let (db, _dir) = open_store().await;

    let low_old = db
        .enqueue(&new_artifact("low-old", Priority::Low, 10))
        .await
        .unwrap();
    let high_new = db
        .enqueue(&new_artifact("high-new", Priority::High, 30))
        .await
        .unwrap();
    let high_old = db
        .enqueue(&new_artifact("high-old", Priority::High, 20))
        .await
        .unwrap();
    let normal = db
        .enqueue(&new_artifact("normal", Priority::Normal, 5))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(next) = db.next_eligible(now_millis()).await.unwrap() {
        db.claim(next.id).await.unwrap();
        order.push(next.id);
    }
    assert_eq!(order, vec![high_old, high_new, normal, low_old]);

    db.close().await;
}

#[tokio::test]
async fn test_next_eligible_respects_backoff() {
    let (db, _dir) = open_store().await;
    let id = db
        .enqueue(&new_artifact("a", Priority::Normal, 1))
        .await
        .unwrap();

    let claim = db.claim(id).await.unwrap();
    let state = db
        .mark_failed(claim, "503 Service Unavailable", Duration::from_secs(60), 5)
        .await
        .unwrap();
    assert_eq!(state, ArtifactState::Retrying);

    assert!(db.next_eligible(now_millis()).await.unwrap().is_none());
    let wake = db.next_wake_time().await.unwrap().unwrap();
    assert!(wake >= now_millis() + 55_000);

    let later = db.next_eligible(now_millis() + 61_000).await.unwrap();
    assert_eq!(later.map(|a| a.id), Some(id));

    db.close().await;
}

#[tokio::test]
async fn test_next_wake_time_is_none_when_nothing_waits() {
    let (db, _dir) = open_store().await;
    assert_eq!(db.next_wake_time().await.unwrap(), None);
    db.close().await;
}

// ----------------------------------------------------------------------------
// Claim
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_exactly_one_winner() {
    let (db, _dir) = open_store().await;
    let db = Arc::new(db);
    let id = db
        .enqueue(&new_artifact("contended", Priority::Normal, 1))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move { db.claim(id).await }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(Error::AlreadyClaimed(lost)) => assert_eq!(lost, id),
            Err(e) => panic!("unexpected claim error: {e:?}"),
        }
    }
    assert_eq!(winners, 1);

    let log = db.transitions(id).await.unwrap();
    let claims = log
        .iter()
        .filter(|t| t.to == ArtifactState::InFlight)
        .count();
    assert_eq!(claims, 1);

    db.close().await;
}

#[tokio::test]
async fn test_claim_missing_artifact_is_not_found() {
    let (db, _dir) = open_store().await;
    assert!(matches!(
        db.claim(ArtifactId(999)).await,
        Err(Error::NotFound(ArtifactId(999)))
    ));
    db.close().await;
}

// ----------------------------------------------------------------------------
// Resolution
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_pending_cannot_jump_to_done() {
    let (db, _dir) = open_store().await;
    let id = db
        .enqueue(&new_artifact("a", Priority::Normal, 1))
        .await
        .unwrap();

    match db.mark_complete(Claim { id, seq: 0 }, Some("conf-1")).await {
        Err(Error::Store(StoreError::InvalidTransition { from, to, .. })) => {
            assert_eq!(from, ArtifactState::Pending);
            assert_eq!(to, ArtifactState::Done);
        }
        other => panic!("expected invalid transition, got {other:?}"),
    }
    assert_eq!(
        db.get_artifact(id).await.unwrap().unwrap().state(),
        ArtifactState::Pending
    );

    db.close().await;
}

#[tokio::test]
async fn test_complete_is_recorded_once() {
    let (db, _dir) = open_store().await;
    let id = db
        .enqueue(&new_artifact("a", Priority::Normal, 1))
        .await
        .unwrap();

    let claim = db.claim(id).await.unwrap();
    db.record_progress(claim, Some("up-1"), 512).await.unwrap();
    db.mark_complete(claim, Some("conf-1")).await.unwrap();
    assert!(db.mark_complete(claim, Some("conf-2")).await.is_err());

    let artifact = db.get_artifact(id).await.unwrap().unwrap();
    assert_eq!(artifact.state(), ArtifactState::Done);
    assert_eq!(artifact.confirmation_id.as_deref(), Some("conf-1"));
    assert!(artifact.finished_at.is_some());
    assert!(artifact.resume_token.is_none());

    let states: Vec<ArtifactState> = db
        .transitions(id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(
        states,
        vec![
            ArtifactState::Pending,
            ArtifactState::InFlight,
            ArtifactState::Done
        ]
    );

    db.close().await;
}

#[tokio::test]
async fn test_failures_dead_letter_at_max_attempts() {
    let (db, _dir) = open_store().await;
    let id = db
        .enqueue(&new_artifact("flaky", Priority::Normal, 1))
        .await
        .unwrap();

    for attempt in 1..=3u32 {
        let claim = db.claim(id).await.unwrap();
        assert_eq!(claim.seq, i64::from(attempt));
        let state = db
            .mark_failed(claim, "connection reset", Duration::ZERO, 3)
            .await
            .unwrap();
        let artifact = db.get_artifact(id).await.unwrap().unwrap();
        assert_eq!(artifact.attempts(), attempt);
        if attempt < 3 {
            assert_eq!(state, ArtifactState::Retrying);
        } else {
            assert_eq!(state, ArtifactState::Dead);
            assert!(artifact.finished_at.is_some());
            assert_eq!(artifact.last_error.as_deref(), Some("connection reset"));
        }
    }

    // Dead letters never resurface
    assert!(db.next_eligible(i64::MAX).await.unwrap().is_none());
    assert!(matches!(
        db.claim(id).await,
        Err(Error::AlreadyClaimed(_))
    ));
    assert_eq!(db.list_dead_letters().await.unwrap().len(), 1);

    db.close().await;
}

#[tokio::test]
async fn test_mark_dead_counts_the_detecting_attempt() {
    let (db, _dir) = open_store().await;
    let id = db
        .enqueue(&new_artifact("corrupt", Priority::Normal, 1))
        .await
        .unwrap();

    let claim = db.claim(id).await.unwrap();
    db.mark_dead(claim, "checksum mismatch").await.unwrap();

    let artifact = db.get_artifact(id).await.unwrap().unwrap();
    assert_eq!(artifact.state(), ArtifactState::Dead);
    assert_eq!(artifact.attempts(), 1);

    db.close().await;
}

#[tokio::test]
async fn test_requeue_keeps_attempts_and_resume_token() {
    let (db, _dir) = open_store().await;
    let id = db
        .enqueue(&new_artifact("big", Priority::Normal, 1))
        .await
        .unwrap();

    let first = db.claim(id).await.unwrap();
    db.mark_failed(first, "timeout", Duration::ZERO, 5)
        .await
        .unwrap();
    let second = db.claim(id).await.unwrap();
    db.record_progress(second, Some("up-7"), 4096).await.unwrap();
    db.requeue(second, "shutdown requested").await.unwrap();

    let artifact = db.get_artifact(id).await.unwrap().unwrap();
    assert_eq!(artifact.state(), ArtifactState::Retrying);
    assert_eq!(artifact.attempts(), 1, "requeue must not count an attempt");
    assert_eq!(artifact.resume_token.as_deref(), Some("up-7"));
    assert_eq!(artifact.bytes_confirmed, 4096);
    assert!(db.next_eligible(now_millis()).await.unwrap().is_some());

    db.close().await;
}

#[tokio::test]
async fn test_progress_and_heartbeat_only_while_in_flight() {
    let (db, _dir) = open_store().await;
    let id = db
        .enqueue(&new_artifact("a", Priority::Normal, 1))
        .await
        .unwrap();

    let unclaimed = Claim { id, seq: 0 };
    assert!(!db.heartbeat(unclaimed).await.unwrap());
    assert!(!db.record_progress(unclaimed, Some("t"), 1).await.unwrap());

    let claim = db.claim(id).await.unwrap();
    assert!(db.heartbeat(claim).await.unwrap());
    assert!(db.record_progress(claim, Some("t"), 1).await.unwrap());

    db.close().await;
}

// ----------------------------------------------------------------------------
// Recovery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_reclaim_stale_only_touches_expired_heartbeats() {
    let (db, _dir) = open_store().await;
    let stale = db
        .enqueue(&new_artifact("stale", Priority::Normal, 1))
        .await
        .unwrap();
    let live = db
        .enqueue(&new_artifact("live", Priority::Normal, 2))
        .await
        .unwrap();

    db.claim(stale).await.unwrap();
    db.claim(live).await.unwrap();
    sqlx::query("UPDATE artifacts SET heartbeat_at = 0 WHERE id = ?")
        .bind(stale)
        .execute(db.pool())
        .await
        .unwrap();

    let reclaimed = db.reclaim_stale(now_millis() - 60_000).await.unwrap();
    assert_eq!(reclaimed, vec![stale]);
    assert_eq!(
        db.get_artifact(live).await.unwrap().unwrap().state(),
        ArtifactState::InFlight
    );

    let all = db.reclaim_all_in_flight().await.unwrap();
    assert_eq!(all, vec![live]);
    assert_eq!(db.state_counts().await.unwrap().retrying, 2);

    db.close().await;
}

#[tokio::test]
async fn test_reclaimed_artifact_rejects_writes_from_previous_claim() {
    let (db, _dir) = open_store().await;
    let id = db
        .enqueue(&new_artifact("slow", Priority::Normal, 1))
        .await
        .unwrap();

    let old = db.claim(id).await.unwrap();
    sqlx::query("UPDATE artifacts SET heartbeat_at = 0 WHERE id = ?")
        .bind(id)
        .execute(db.pool())
        .await
        .unwrap();
    assert_eq!(db.reclaim_stale(now_millis() - 60_000).await.unwrap(), vec![id]);
    let new = db.claim(id).await.unwrap();
    assert!(new.seq > old.seq);

    // The previous worker wakes up late and tries to resolve
    assert!(!db.heartbeat(old).await.unwrap());
    assert!(!db.record_progress(old, Some("stale"), 99).await.unwrap());
    let superseded = |result: crate::Result<()>| {
        assert!(
            matches!(result, Err(Error::Store(StoreError::ClaimSuperseded(lost))) if lost == id),
            "got {result:?}"
        );
    };
    superseded(db.mark_failed(old, "late failure", Duration::ZERO, 5).await.map(|_| ()));
    superseded(db.mark_dead(old, "late dead letter").await);
    superseded(db.requeue(old, "late requeue").await);
    superseded(db.mark_complete(old, Some("late")).await);

    let artifact = db.get_artifact(id).await.unwrap().unwrap();
    assert_eq!(artifact.state(), ArtifactState::InFlight);
    assert_eq!(artifact.attempts(), 0);
    assert_eq!(artifact.claim_seq, new.seq);
    assert_eq!(artifact.bytes_confirmed, 0);
    assert!(artifact.last_error.is_none());

    assert!(db.heartbeat(new).await.unwrap());
    db.mark_complete(new, Some("conf-new")).await.unwrap();
    assert_eq!(
        db.get_artifact(id).await.unwrap().unwrap().confirmation_id.as_deref(),
        Some("conf-new")
    );

    db.close().await;
}

// ----------------------------------------------------------------------------
// Retention
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_prune_removes_only_old_terminal_records() {
    let (db, _dir) = open_store().await;
    let done = db
        .enqueue(&new_artifact("done", Priority::Normal, 1))
        .await
        .unwrap();
    let dead = db
        .enqueue(&NewArtifact {
            owns_payload: true,
            ..new_artifact("dead", Priority::Normal, 2)
        })
        .await
        .unwrap();
    let waiting = db
        .enqueue(&new_artifact("waiting", Priority::Normal, 3))
        .await
        .unwrap();

    let claim = db.claim(done).await.unwrap();
    db.mark_complete(claim, None).await.unwrap();
    let claim = db.claim(dead).await.unwrap();
    db.mark_dead(claim, "413 Payload Too Large").await.unwrap();

    // Nothing is old enough yet
    assert!(db.prune(0).await.unwrap().is_empty());

    let pruned = db.prune(now_millis() + 1).await.unwrap();
    assert_eq!(pruned.len(), 2);
    let dead_summary = pruned.iter().find(|p| p.id == dead).unwrap();
    assert_eq!(dead_summary.state, ArtifactState::Dead);
    assert_eq!(dead_summary.attempts, 1);
    assert_eq!(
        dead_summary.last_error.as_deref(),
        Some("413 Payload Too Large")
    );
    assert!(dead_summary.owned_payload.is_some());
    assert!(pruned.iter().find(|p| p.id == done).unwrap().owned_payload.is_none());

    assert!(db.get_artifact(done).await.unwrap().is_none());
    assert!(db.transitions(dead).await.unwrap().is_empty());
    assert!(db.get_artifact(waiting).await.unwrap().is_some());

    db.close().await;
}

#[tokio::test]
async fn test_state_counts() {
    let (db, _dir) = open_store().await;
    for i in 0..3 {
        db.enqueue(&new_artifact(&format!("a{i}"), Priority::Normal, i))
            .await
            .unwrap();
    }
    let first = db.next_eligible(now_millis()).await.unwrap().unwrap();
    db.claim(first.id).await.unwrap();

    let stats = db.state_counts().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.outstanding(), 3);
    assert_eq!(
        db.list_by_state(ArtifactState::Pending).await.unwrap().len(),
        2
    );

    db.close().await;
}
