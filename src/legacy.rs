//! Explicit reconciliation with the legacy document-store user mirror.
//!
//! The legacy store is only ever read. Values flow one way into the
//! relational record, and only upward, so running this twice is harmless.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    error::{Error, Result},
    gamification::{Rank, economy::adjust_gems_in},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyUser {
    pub email: String,
    #[serde(default)]
    pub rank: Option<Rank>,
    #[serde(default)]
    pub experience: i64,
    #[serde(default)]
    pub gems: i64,
}

#[async_trait]
pub trait LegacyDirectory: Send + Sync {
    async fn lookup(&self, email: &str) -> Result<Option<LegacyUser>>;
}

/// Export of the legacy store, one JSON object per line.
pub struct JsonLinesDirectory {
    path: PathBuf,
}

impl JsonLinesDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LegacyDirectory for JsonLinesDirectory {
    async fn lookup(&self, email: &str) -> Result<Option<LegacyUser>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", self.path.display(), e))?;
        let email = email.trim().to_lowercase();
        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let user: LegacyUser = match serde_json::from_str(line) {
                Ok(user) => user,
                Err(e) => {
                    warn!("skipping line {} of {}: {e}", n + 1, self.path.display());
                    continue;
                }
            };
            if user.email.trim().to_lowercase() == email {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct Reconciliation {
    pub rank: Option<Rank>,
    pub experience_raised: i64,
    pub gems_raised: i64,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.rank.is_none() && self.experience_raised == 0 && self.gems_raised == 0
    }
}

pub async fn reconcile(
    database: &SqlitePool,
    directory: &dyn LegacyDirectory,
    student_id: i64,
    now: OffsetDateTime,
) -> Result<Reconciliation> {
    let email = sqlx::query_scalar::<_, String>("select email from student where id = ?")
        .bind(student_id)
        .fetch_optional(database)
        .await?
        .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;
    let Some(legacy) = directory.lookup(&email).await? else {
        return Ok(Reconciliation::default());
    };

    let mut outcome = Reconciliation::default();
    let mut tx = database.begin().await?;
    // Take the write lock before reading the balances we compare against.
    sqlx::query("update student set experience = experience where id = ?")
        .bind(student_id)
        .execute(&mut *tx)
        .await?;
    let (rank, experience, gems) = sqlx::query_as::<_, (i64, i64, i64)>(
        "select rank, experience, gems from student where id = ?",
    )
    .bind(student_id)
    .fetch_one(&mut *tx)
    .await?;

    if legacy.experience > experience {
        sqlx::query("update student set experience = ? where id = ?")
            .bind(legacy.experience)
            .bind(student_id)
            .execute(&mut *tx)
            .await?;
        outcome.experience_raised = legacy.experience - experience;
    }
    let adoptable = legacy
        .rank
        .filter(|r| *r != Rank::Trial && !r.is_admin() && !r.is_suspended());
    if let Some(target) = adoptable.filter(|_| rank == Rank::Trial as i64) {
        sqlx::query("update student set rank = ? where id = ?")
            .bind(target as i64)
            .bind(student_id)
            .execute(&mut *tx)
            .await?;
        outcome.rank = Some(target);
    }
    if legacy.gems > gems {
        adjust_gems_in(&mut tx, student_id, legacy.gems - gems, "legacy reconciliation", now)
            .await?;
        outcome.gems_raised = legacy.gems - gems;
    }
    tx.commit().await?;

    if !outcome.is_noop() {
        info!(student_id, ?outcome, "legacy record reconciled");
    }
    Ok(outcome)
}

/// Login-time wrapper: a broken legacy store never blocks sign-in.
pub async fn reconcile_quietly(
    database: &SqlitePool,
    directory: Option<&dyn LegacyDirectory>,
    student_id: i64,
    now: OffsetDateTime,
) {
    let Some(directory) = directory else {
        return;
    };
    if let Err(e) = reconcile(database, directory, student_id, now).await {
        warn!(student_id, "legacy reconciliation failed: {e}");
    }
}
