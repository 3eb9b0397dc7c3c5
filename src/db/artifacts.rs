//! Artifact queue: enqueue, claim, resolution, recovery and inspection.
//!
//! Every state change runs in a transaction whose first statement appends to
//! `transitions` with an `INSERT ... SELECT` guarded on the expected source
//! state. Being a write, it takes SQLite's write lock before anything is read,
//! so two workers racing for the same record serialize on the lock and the
//! loser sees zero matching rows.

use crate::error::StoreError;
use crate::types::{ArtifactId, ArtifactState, QueueStats};
use crate::utils::now_millis;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Artifact, Claim, Database, NewArtifact, PrunedArtifact, Transition};

const ARTIFACT_COLUMNS: &str = r#"
    id, name, source, payload_path, owns_payload, size_bytes, checksum,
    priority, state, attempts, last_error, next_eligible_at, resume_token,
    bytes_confirmed, confirmation_id, heartbeat_at, claim_seq, created_at, updated_at,
    finished_at
"#;

/// States the scheduler may pick from
const WAITING: &[ArtifactState] = &[ArtifactState::Pending, ArtifactState::Retrying];
const IN_FLIGHT: &[ArtifactState] = &[ArtifactState::InFlight];

fn query_failed(what: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Store(StoreError::QueryFailed(format!("Failed to {}: {}", what, e)))
}

fn state_list(states: &[ArtifactState]) -> String {
    states
        .iter()
        .map(|s| s.to_i32().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl Database {
    /// Record a new artifact in `pending`
    ///
    /// Fails with [`Error::DuplicateArtifact`] when the same checksum and
    /// source identity are already stored.
    pub async fn enqueue(&self, artifact: &NewArtifact) -> Result<ArtifactId> {
        let now = now_millis();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin enqueue"))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO artifacts (
                name, source, payload_path, owns_payload, size_bytes, checksum,
                priority, state, attempts, next_eligible_at, bytes_confirmed,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 0, ?, ?)
            "#,
        )
        .bind(&artifact.name)
        .bind(&artifact.source)
        .bind(artifact.payload_path.to_string_lossy().into_owned())
        .bind(artifact.owns_payload)
        .bind(artifact.size_bytes)
        .bind(&artifact.checksum)
        .bind(artifact.priority.to_i32())
        .bind(ArtifactState::Pending.to_i32())
        .bind(now)
        .bind(artifact.created_at)
        .bind(now)
        .execute(&mut *tx)
        .await;

        let id = match inserted {
            Ok(result) => ArtifactId(result.last_insert_rowid()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                drop(tx);
                let existing = self
                    .find_by_checksum(&artifact.checksum, &artifact.source)
                    .await?
                    .ok_or_else(|| {
                        Error::Store(StoreError::QueryFailed(
                            "Duplicate reported but no matching record found".to_string(),
                        ))
                    })?;
                return Err(Error::DuplicateArtifact {
                    existing,
                    checksum: artifact.checksum.clone(),
                });
            }
            Err(e) => return Err(query_failed("insert artifact")(e)),
        };

        sqlx::query(
            "INSERT INTO transitions (artifact_id, from_state, to_state, at) VALUES (?, NULL, ?, ?)",
        )
        .bind(id)
        .bind(ArtifactState::Pending.to_i32())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(query_failed("log initial transition"))?;

        tx.commit().await.map_err(query_failed("commit enqueue"))?;
        Ok(id)
    }

    /// Find a stored artifact by checksum and source identity
    pub async fn find_by_checksum(&self, checksum: &str, source: &str) -> Result<Option<ArtifactId>> {
        sqlx::query_scalar::<_, ArtifactId>(
            "SELECT id FROM artifacts WHERE checksum = ? AND source = ?",
        )
        .bind(checksum)
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("look up artifact by checksum"))
    }

    /// Peek at the next artifact to send
    ///
    /// Highest priority first, then oldest creation time, then lowest id,
    /// among pending/retrying records whose backoff has elapsed at `now`.
    pub async fn next_eligible(&self, now: i64) -> Result<Option<Artifact>> {
        sqlx::query_as::<_, Artifact>(&format!(
            r#"
            SELECT {ARTIFACT_COLUMNS}
            FROM artifacts
            WHERE state IN ({}) AND next_eligible_at <= ?
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT 1
            "#,
            state_list(WAITING)
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("select next eligible artifact"))
    }

    /// Earliest `next_eligible_at` among waiting artifacts (Unix milliseconds)
    pub async fn next_wake_time(&self) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, Option<i64>>(&format!(
            "SELECT MIN(next_eligible_at) FROM artifacts WHERE state IN ({})",
            state_list(WAITING)
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(query_failed("query next wake time"))
    }

    /// Atomically move a pending/retrying artifact to `in_flight`
    ///
    /// Exactly one of several concurrent claimers succeeds; the others get
    /// [`Error::AlreadyClaimed`]. The returned [`Claim`] must accompany every
    /// later write for this attempt.
    pub async fn claim(&self, id: ArtifactId) -> Result<Claim> {
        let now = now_millis();
        let mut tx = self.pool.begin().await.map_err(query_failed("begin claim"))?;

        if !log_transition(&mut tx, id, WAITING, ArtifactState::InFlight, None, now).await? {
            let exists = current_state(&mut tx, id).await?.is_some();
            return Err(if exists {
                Error::AlreadyClaimed(id)
            } else {
                Error::NotFound(id)
            });
        }

        let seq: i64 = sqlx::query_scalar(&format!(
            r#"
            UPDATE artifacts
            SET state = ?, heartbeat_at = ?, claim_seq = claim_seq + 1, updated_at = ?
            WHERE id = ? AND state IN ({})
            RETURNING claim_seq
            "#,
            state_list(WAITING)
        ))
        .bind(ArtifactState::InFlight.to_i32())
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_failed("claim artifact"))?;

        tx.commit().await.map_err(query_failed("commit claim"))?;
        Ok(Claim { id, seq })
    }

    /// Refresh the liveness timestamp of an in-flight artifact
    ///
    /// Returns false when the claim no longer holds.
    pub async fn heartbeat(&self, claim: Claim) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE artifacts SET heartbeat_at = ? WHERE id = ? AND state = ? AND claim_seq = ?",
        )
        .bind(now_millis())
        .bind(claim.id)
        .bind(ArtifactState::InFlight.to_i32())
        .bind(claim.seq)
        .execute(&self.pool)
        .await
        .map_err(query_failed("refresh heartbeat"))?;

        Ok(result.rows_affected() == 1)
    }

    /// Persist the resume point acknowledged by the remote endpoint
    ///
    /// Also counts as a heartbeat. Returns false when the claim no longer holds.
    pub async fn record_progress(
        &self,
        claim: Claim,
        resume_token: Option<&str>,
        bytes_confirmed: u64,
    ) -> Result<bool> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE artifacts
            SET resume_token = ?, bytes_confirmed = ?, heartbeat_at = ?, updated_at = ?
            WHERE id = ? AND state = ? AND claim_seq = ?
            "#,
        )
        .bind(resume_token)
        .bind(i64::try_from(bytes_confirmed).unwrap_or(i64::MAX))
        .bind(now)
        .bind(now)
        .bind(claim.id)
        .bind(ArtifactState::InFlight.to_i32())
        .bind(claim.seq)
        .execute(&self.pool)
        .await
        .map_err(query_failed("record progress"))?;

        Ok(result.rows_affected() == 1)
    }

    /// `in_flight -> done`
    ///
    /// Any other source state, or a superseded claim, is rejected, so an
    /// artifact completes at most once.
    pub async fn mark_complete(&self, claim: Claim, confirmation_id: Option<&str>) -> Result<()> {
        let Claim { id, seq } = claim;
        let now = now_millis();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin completion"))?;

        if !log_transition(&mut tx, id, IN_FLIGHT, ArtifactState::Done, Some(seq), now).await? {
            return Err(transition_conflict(&mut tx, claim, ArtifactState::Done).await);
        }

        sqlx::query(
            r#"
            UPDATE artifacts
            SET state = ?, confirmation_id = ?, resume_token = NULL, heartbeat_at = NULL,
                updated_at = ?, finished_at = ?
            WHERE id = ? AND state = ? AND claim_seq = ?
            "#,
        )
        .bind(ArtifactState::Done.to_i32())
        .bind(confirmation_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(ArtifactState::InFlight.to_i32())
        .bind(seq)
        .execute(&mut *tx)
        .await
        .map_err(query_failed("mark artifact complete"))?;

        tx.commit().await.map_err(query_failed("commit completion"))?;
        Ok(())
    }

    /// Count a failed attempt
    ///
    /// `in_flight -> dead` when the new attempt count reaches `max_attempts`,
    /// otherwise `in_flight -> retrying` with the next attempt due after
    /// `backoff`. Returns the resulting state.
    pub async fn mark_failed(
        &self,
        claim: Claim,
        error: &str,
        backoff: Duration,
        max_attempts: u32,
    ) -> Result<ArtifactState> {
        let Claim { id, seq } = claim;
        let now = now_millis();
        let next_eligible_at =
            now.saturating_add(i64::try_from(backoff.as_millis()).unwrap_or(i64::MAX));
        let retrying = ArtifactState::Retrying.to_i32();
        let dead = ArtifactState::Dead.to_i32();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin failure"))?;

        let logged = sqlx::query(
            r#"
            INSERT INTO transitions (artifact_id, from_state, to_state, at)
            SELECT id, state, CASE WHEN attempts + 1 >= ? THEN ? ELSE ? END, ?
            FROM artifacts
            WHERE id = ? AND state = ? AND claim_seq = ?
            "#,
        )
        .bind(i64::from(max_attempts))
        .bind(dead)
        .bind(retrying)
        .bind(now)
        .bind(id)
        .bind(ArtifactState::InFlight.to_i32())
        .bind(seq)
        .execute(&mut *tx)
        .await
        .map_err(query_failed("log failure transition"))?;

        if logged.rows_affected() == 0 {
            return Err(transition_conflict(&mut tx, claim, ArtifactState::Retrying).await);
        }

        let state: i32 = sqlx::query_scalar(
            r#"
            UPDATE artifacts
            SET attempts = attempts + 1,
                state = CASE WHEN attempts + 1 >= ? THEN ? ELSE ? END,
                next_eligible_at = CASE WHEN attempts + 1 >= ? THEN next_eligible_at ELSE ? END,
                finished_at = CASE WHEN attempts + 1 >= ? THEN ? ELSE NULL END,
                last_error = ?, heartbeat_at = NULL, updated_at = ?
            WHERE id = ? AND state = ? AND claim_seq = ?
            RETURNING state
            "#,
        )
        .bind(i64::from(max_attempts))
        .bind(dead)
        .bind(retrying)
        .bind(i64::from(max_attempts))
        .bind(next_eligible_at)
        .bind(i64::from(max_attempts))
        .bind(now)
        .bind(error)
        .bind(now)
        .bind(id)
        .bind(ArtifactState::InFlight.to_i32())
        .bind(seq)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_failed("record failed attempt"))?;

        tx.commit().await.map_err(query_failed("commit failure"))?;
        Ok(ArtifactState::from_i32(state).unwrap_or(ArtifactState::Dead))
    }

    /// `in_flight -> dead`, counting the attempt that detected the problem
    pub async fn mark_dead(&self, claim: Claim, error: &str) -> Result<()> {
        let Claim { id, seq } = claim;
        let now = now_millis();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin dead-letter"))?;

        if !log_transition(&mut tx, id, IN_FLIGHT, ArtifactState::Dead, Some(seq), now).await? {
            return Err(transition_conflict(&mut tx, claim, ArtifactState::Dead).await);
        }

        sqlx::query(
            r#"
            UPDATE artifacts
            SET state = ?, attempts = attempts + 1, last_error = ?, heartbeat_at = NULL,
                updated_at = ?, finished_at = ?
            WHERE id = ? AND state = ? AND claim_seq = ?
            "#,
        )
        .bind(ArtifactState::Dead.to_i32())
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(ArtifactState::InFlight.to_i32())
        .bind(seq)
        .execute(&mut *tx)
        .await
        .map_err(query_failed("dead-letter artifact"))?;

        tx.commit().await.map_err(query_failed("commit dead-letter"))?;
        Ok(())
    }

    /// `in_flight -> retrying` without counting an attempt, eligible immediately
    ///
    /// Used when the attempt was interrupted locally (shutdown). The resume
    /// token is kept.
    pub async fn requeue(&self, claim: Claim, reason: &str) -> Result<()> {
        let Claim { id, seq } = claim;
        let now = now_millis();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin requeue"))?;

        if !log_transition(&mut tx, id, IN_FLIGHT, ArtifactState::Retrying, Some(seq), now).await? {
            return Err(transition_conflict(&mut tx, claim, ArtifactState::Retrying).await);
        }

        sqlx::query(
            r#"
            UPDATE artifacts
            SET state = ?, next_eligible_at = ?, heartbeat_at = NULL, updated_at = ?
            WHERE id = ? AND state = ? AND claim_seq = ?
            "#,
        )
        .bind(ArtifactState::Retrying.to_i32())
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(ArtifactState::InFlight.to_i32())
        .bind(seq)
        .execute(&mut *tx)
        .await
        .map_err(query_failed("requeue artifact"))?;

        tx.commit().await.map_err(query_failed("commit requeue"))?;
        tracing::debug!(artifact_id = id.0, reason, "artifact requeued");
        Ok(())
    }

    /// Hand orphaned in-flight records back to the queue
    ///
    /// Every `in_flight` record whose heartbeat is older than `heartbeat_cutoff`
    /// (Unix milliseconds) moves to `retrying` without penalty, keeping its
    /// resume token.
    pub async fn reclaim_stale(&self, heartbeat_cutoff: i64) -> Result<Vec<ArtifactId>> {
        let now = now_millis();
        let in_flight = ArtifactState::InFlight.to_i32();
        let retrying = ArtifactState::Retrying.to_i32();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin reclaim"))?;

        sqlx::query(
            r#"
            INSERT INTO transitions (artifact_id, from_state, to_state, at)
            SELECT id, state, ?, ?
            FROM artifacts
            WHERE state = ? AND (heartbeat_at IS NULL OR heartbeat_at < ?)
            "#,
        )
        .bind(retrying)
        .bind(now)
        .bind(in_flight)
        .bind(heartbeat_cutoff)
        .execute(&mut *tx)
        .await
        .map_err(query_failed("log reclaim transitions"))?;

        let ids = sqlx::query_scalar::<_, ArtifactId>(
            r#"
            UPDATE artifacts
            SET state = ?, next_eligible_at = ?, heartbeat_at = NULL, updated_at = ?
            WHERE state = ? AND (heartbeat_at IS NULL OR heartbeat_at < ?)
            RETURNING id
            "#,
        )
        .bind(retrying)
        .bind(now)
        .bind(now)
        .bind(in_flight)
        .bind(heartbeat_cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(query_failed("reclaim in-flight artifacts"))?;

        tx.commit().await.map_err(query_failed("commit reclaim"))?;
        Ok(ids)
    }

    /// Hand every in-flight record back to the queue
    ///
    /// Only safe while no worker is running, i.e. at startup of the single
    /// process that owns the store.
    pub async fn reclaim_all_in_flight(&self) -> Result<Vec<ArtifactId>> {
        self.reclaim_stale(i64::MAX).await
    }

    /// Delete delivered and dead-lettered records that finished before `older_than`
    ///
    /// Each removed dead letter is logged with enough detail to investigate
    /// it after the record is gone.
    pub async fn prune(&self, older_than: i64) -> Result<Vec<PrunedArtifact>> {
        let rows = sqlx::query_as::<_, (ArtifactId, String, i32, i64, Option<String>, String, bool, String)>(
            r#"
            DELETE FROM artifacts
            WHERE state IN (?, ?) AND finished_at IS NOT NULL AND finished_at < ?
            RETURNING id, name, state, attempts, last_error, checksum, owns_payload, payload_path
            "#,
        )
        .bind(ArtifactState::Done.to_i32())
        .bind(ArtifactState::Dead.to_i32())
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("prune finished artifacts"))?;

        let pruned: Vec<PrunedArtifact> = rows
            .into_iter()
            .map(
                |(id, name, state, attempts, last_error, checksum, owns_payload, payload_path)| {
                    PrunedArtifact {
                        id,
                        name,
                        state: ArtifactState::from_i32(state).unwrap_or(ArtifactState::Dead),
                        attempts: u32::try_from(attempts).unwrap_or(0),
                        last_error,
                        checksum,
                        owned_payload: owns_payload.then(|| PathBuf::from(payload_path)),
                    }
                },
            )
            .collect();

        for record in pruned.iter().filter(|p| p.state == ArtifactState::Dead) {
            tracing::error!(
                artifact_id = record.id.0,
                name = %record.name,
                attempts = record.attempts,
                last_error = record.last_error.as_deref().unwrap_or(""),
                checksum = %record.checksum,
                "pruning dead-lettered artifact"
            );
        }

        Ok(pruned)
    }

    /// Whether any stored record still points at `path`
    pub async fn payload_referenced(&self, path: &Path) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE payload_path = ?")
            .bind(path.to_string_lossy().into_owned())
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed("check payload references"))?;

        Ok(count > 0)
    }

    /// Get an artifact by ID
    pub async fn get_artifact(&self, id: ArtifactId) -> Result<Option<Artifact>> {
        sqlx::query_as::<_, Artifact>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("get artifact"))
    }

    /// List all artifacts in scheduling order
    pub async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        sqlx::query_as::<_, Artifact>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts ORDER BY priority DESC, created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list artifacts"))
    }

    /// List artifacts in one state, in scheduling order
    pub async fn list_by_state(&self, state: ArtifactState) -> Result<Vec<Artifact>> {
        sqlx::query_as::<_, Artifact>(&format!(
            r#"
            SELECT {ARTIFACT_COLUMNS}
            FROM artifacts
            WHERE state = ?
            ORDER BY priority DESC, created_at ASC, id ASC
            "#
        ))
        .bind(state.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list artifacts by state"))
    }

    /// Dead-lettered artifacts, most recent first
    pub async fn list_dead_letters(&self) -> Result<Vec<Artifact>> {
        sqlx::query_as::<_, Artifact>(&format!(
            r#"
            SELECT {ARTIFACT_COLUMNS}
            FROM artifacts
            WHERE state = ?
            ORDER BY finished_at DESC, id DESC
            "#
        ))
        .bind(ArtifactState::Dead.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list dead letters"))
    }

    /// The state transition log of one artifact, oldest first
    pub async fn transitions(&self, id: ArtifactId) -> Result<Vec<Transition>> {
        let rows: Vec<(Option<i32>, i32, i64)> = sqlx::query_as(
            "SELECT from_state, to_state, at FROM transitions WHERE artifact_id = ? ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list transitions"))?;

        Ok(rows
            .into_iter()
            .filter_map(|(from, to, at)| {
                Some(Transition {
                    from: from.and_then(ArtifactState::from_i32),
                    to: ArtifactState::from_i32(to)?,
                    at,
                })
            })
            .collect())
    }

    /// Number of records in each state
    pub async fn state_counts(&self) -> Result<QueueStats> {
        let rows: Vec<(i32, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM artifacts GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(query_failed("count artifacts by state"))?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match ArtifactState::from_i32(state) {
                Some(ArtifactState::Pending) => stats.pending = count,
                Some(ArtifactState::InFlight) => stats.in_flight = count,
                Some(ArtifactState::Retrying) => stats.retrying = count,
                Some(ArtifactState::Done) => stats.done = count,
                Some(ArtifactState::Dead) => stats.dead = count,
                None => tracing::warn!(state, count, "artifacts with unknown state code"),
            }
        }
        Ok(stats)
    }
}

/// Append a transition row if the artifact is currently in one of `from`
/// (and, with `claim_seq`, still held under that claim)
///
/// Returns whether the guard matched.
async fn log_transition(
    conn: &mut SqliteConnection,
    id: ArtifactId,
    from: &[ArtifactState],
    to: ArtifactState,
    claim_seq: Option<i64>,
    now: i64,
) -> Result<bool> {
    let result = sqlx::query(&format!(
        r#"
        INSERT INTO transitions (artifact_id, from_state, to_state, at)
        SELECT id, state, ?, ?
        FROM artifacts
        WHERE id = ? AND state IN ({}) AND (? IS NULL OR claim_seq = ?)
        "#,
        state_list(from)
    ))
    .bind(to.to_i32())
    .bind(now)
    .bind(id)
    .bind(claim_seq)
    .bind(claim_seq)
    .execute(&mut *conn)
    .await
    .map_err(query_failed("log transition"))?;

    Ok(result.rows_affected() == 1)
}

async fn current_state(conn: &mut SqliteConnection, id: ArtifactId) -> Result<Option<ArtifactState>> {
    Ok(current_claim(conn, id).await?.map(|(state, _)| state))
}

async fn current_claim(
    conn: &mut SqliteConnection,
    id: ArtifactId,
) -> Result<Option<(ArtifactState, i64)>> {
    let row: Option<(i32, i64)> =
        sqlx::query_as("SELECT state, claim_seq FROM artifacts WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(query_failed("read artifact state"))?;

    Ok(row.map(|(s, seq)| (ArtifactState::from_i32(s).unwrap_or(ArtifactState::Dead), seq)))
}

/// Explain why a guarded transition matched nothing
async fn transition_conflict(conn: &mut SqliteConnection, claim: Claim, to: ArtifactState) -> Error {
    let id = claim.id;
    match current_claim(conn, id).await {
        Ok(Some((_, seq))) if seq != claim.seq => Error::Store(StoreError::ClaimSuperseded(id)),
        Ok(Some((from, _))) => Error::Store(StoreError::InvalidTransition { id, from, to }),
        Ok(None) => Error::NotFound(id),
        Err(e) => e,
    }
}
