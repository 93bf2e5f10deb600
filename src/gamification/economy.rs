use std::sync::Arc;

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use super::{
    EconomyState, EvaluationOutcome, LevelUp, Rank, Reward, apply_evaluation, apply_reward,
    level_for, reward_for,
};
use crate::{
    config::GamificationConfig,
    course::Chapter,
    error::{Error, Result},
    utils::Clock,
};

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct GemTransaction {
    pub id: i64,
    pub delta: i64,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Experience, gem and rank sink for one database.
#[derive(Clone)]
pub struct Economy {
    database: SqlitePool,
    config: GamificationConfig,
    clock: Arc<dyn Clock>,
}

impl Economy {
    pub fn new(database: SqlitePool, config: GamificationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            database,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &GamificationConfig {
        &self.config
    }

    pub async fn state(&self, student_id: i64) -> Result<EconomyState> {
        let (experience, gems) = sqlx::query_as::<_, (i64, i64)>(
            "select experience, gems from student where id = ?",
        )
        .bind(student_id)
        .fetch_optional(&self.database)
        .await?
        .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;
        Ok(EconomyState { experience, gems })
    }

    pub async fn credit_experience(&self, student_id: i64, amount: i64) -> Result<EvaluationOutcome> {
        if amount < 0 {
            return Err(Error::validation("experience can only be credited"));
        }
        let mut conn = self.database.acquire().await?;
        let reward = Reward {
            experience: amount,
            gems: 0,
        };
        credit_in(&mut conn, &self.config, student_id, reward, self.clock.now()).await
    }

    /// Credits or debits gems. A debit larger than the balance fails with
    /// `InsufficientBalance` and leaves the balance untouched.
    pub async fn adjust_gems(&self, student_id: i64, delta: i64, reason: &str) -> Result<i64> {
        let mut tx = self.database.begin().await?;
        let balance = adjust_gems_in(&mut tx, student_id, delta, reason, self.clock.now()).await?;
        tx.commit().await?;
        info!(student_id, delta, balance, reason, "gems adjusted");
        Ok(balance)
    }

    pub async fn ledger(&self, student_id: i64) -> Result<Vec<GemTransaction>> {
        let rows = sqlx::query_as::<_, GemTransaction>(
            "select id, delta, reason, created_at from gem_transaction where student_id = ? order by id asc",
        )
        .bind(student_id)
        .fetch_all(&self.database)
        .await?;
        Ok(rows)
    }

    /// Returns a pending level-up exactly once per threshold crossing.
    pub async fn take_level_up(&self, student_id: i64) -> Result<Option<LevelUp>> {
        let (experience, notified) = sqlx::query_as::<_, (i64, i64)>(
            "select experience, notified_level from student where id = ?",
        )
        .bind(student_id)
        .fetch_optional(&self.database)
        .await?
        .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;
        let level = level_for(&self.config, experience);
        if level <= notified {
            return Ok(None);
        }
        let updated = sqlx::query(
            "update student set notified_level = ? where id = ? and notified_level = ?",
        )
        .bind(level)
        .bind(student_id)
        .bind(notified)
        .execute(&self.database)
        .await?;
        if updated.rows_affected() == 1 {
            Ok(Some(LevelUp {
                from: notified,
                to: level,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn rank(&self, student_id: i64) -> Result<Rank> {
        let mut conn = self.database.acquire().await?;
        rank_in(&mut conn, student_id).await
    }

    pub async fn set_rank(&self, student_id: i64, rank: Rank) -> Result<()> {
        let updated = sqlx::query("update student set rank = ? where id = ?")
            .bind(rank as i64)
            .bind(student_id)
            .execute(&self.database)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("student {student_id}")));
        }
        info!(student_id, %rank, "rank set");
        Ok(())
    }
}

pub(crate) async fn rank_in(conn: &mut SqliteConnection, student_id: i64) -> Result<Rank> {
    let rank = sqlx::query_scalar::<_, i64>("select rank from student where id = ?")
        .bind(student_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;
    Rank::try_from(rank)
}

/// Adds a reward to the student's balances and returns the balances from
/// before it. One statement, so concurrent credits never lose an update.
async fn add_reward_in(
    conn: &mut SqliteConnection,
    student_id: i64,
    reward: Reward,
    reason: &str,
    now: OffsetDateTime,
) -> Result<EconomyState> {
    let (experience, gems) = sqlx::query_as::<_, (i64, i64)>(
        "update student set experience = experience + ?, gems = gems + ? where id = ? returning experience, gems",
    )
    .bind(reward.experience)
    .bind(reward.gems)
    .bind(student_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;
    if reward.gems > 0 {
        insert_ledger(conn, student_id, reward.gems, reason, now).await?;
    }
    Ok(EconomyState {
        experience: experience - reward.experience,
        gems: gems - reward.gems,
    })
}

fn log_level_up(student_id: i64, outcome: &EvaluationOutcome) {
    if let Some(level_up) = outcome.level_up {
        info!(student_id, from = level_up.from, to = level_up.to, "level up");
    }
}

/// Applies a plain reward inside the caller's transaction.
pub(crate) async fn credit_in(
    conn: &mut SqliteConnection,
    config: &GamificationConfig,
    student_id: i64,
    reward: Reward,
    now: OffsetDateTime,
) -> Result<EvaluationOutcome> {
    let before = add_reward_in(conn, student_id, reward, "experience credit", now).await?;
    let outcome = apply_reward(config, before, reward);
    log_level_up(student_id, &outcome);
    Ok(outcome)
}

/// Credits the reward of a scored chapter inside the caller's transaction.
pub(crate) async fn credit_evaluation_in(
    conn: &mut SqliteConnection,
    config: &GamificationConfig,
    student_id: i64,
    chapter: &Chapter,
    score: i64,
    late: bool,
    now: OffsetDateTime,
) -> Result<EvaluationOutcome> {
    let reward = reward_for(config, score, chapter.reward_exp, chapter.reward_gems, late);
    let before = add_reward_in(conn, student_id, reward, "evaluation reward", now).await?;
    let outcome = apply_evaluation(
        config,
        before,
        score,
        chapter.reward_exp,
        chapter.reward_gems,
        late,
    );
    log_level_up(student_id, &outcome);
    Ok(outcome)
}

/// Guarded balance change: the `gems + delta >= 0` condition is evaluated by
/// the same statement that writes, so concurrent debits cannot overdraw.
pub(crate) async fn adjust_gems_in(
    conn: &mut SqliteConnection,
    student_id: i64,
    delta: i64,
    reason: &str,
    now: OffsetDateTime,
) -> Result<i64> {
    if delta == 0 {
        return Err(Error::validation("gem adjustment must be non-zero"));
    }
    let balance = sqlx::query_scalar::<_, i64>(
        "update student set gems = gems + ?1 where id = ?2 and gems + ?1 >= 0 returning gems",
    )
    .bind(delta)
    .bind(student_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(balance) = balance else {
        let current = sqlx::query_scalar::<_, i64>("select gems from student where id = ?")
            .bind(student_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;
        return Err(Error::InsufficientBalance {
            balance: current,
            requested: -delta,
        });
    };
    insert_ledger(conn, student_id, delta, reason, now).await?;
    Ok(balance)
}

async fn insert_ledger(
    conn: &mut SqliteConnection,
    student_id: i64,
    delta: i64,
    reason: &str,
    now: OffsetDateTime,
) -> Result<()> {
    sqlx::query(
        "insert into gem_transaction (student_id, delta, reason, created_at) values (?, ?, ?, ?)",
    )
    .bind(student_id)
    .bind(delta)
    .bind(reason)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Raises the rank when `target` is higher on the ladder. Returns the new rank
/// when a promotion happened.
pub(crate) async fn promote_in(
    conn: &mut SqliteConnection,
    student_id: i64,
    target: Rank,
) -> Result<Option<Rank>> {
    let current = rank_in(conn, student_id).await?;
    let Some(next) = current.promoted_to(target) else {
        return Ok(None);
    };
    let updated = sqlx::query("update student set rank = ? where id = ? and rank = ?")
        .bind(next as i64)
        .bind(student_id)
        .bind(current as i64)
        .execute(&mut *conn)
        .await?;
    Ok((updated.rows_affected() == 1).then_some(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn debit_beyond_balance_is_rejected() {
        let fx = testing::Fixture::new().await;
        let economy = fx.economy();
        economy.adjust_gems(fx.student, 30, "grant").await.unwrap();
        let err = economy.adjust_gems(fx.student, -31, "purchase").await.unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientBalance {
                balance: 30,
                requested: 31
            }
        ));
        assert_eq!(economy.state(fx.student).await.unwrap().gems, 30);
        assert_eq!(economy.ledger(fx.student).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_debits_exhaust_balance_exactly() {
        let (fx, _dir) = testing::Fixture::file_backed().await;
        let economy = fx.economy();
        economy.adjust_gems(fx.student, 50, "grant").await.unwrap();
        let tasks = (0..12).map(|_| {
            let economy = economy.clone();
            let student = fx.student;
            tokio::spawn(async move { economy.adjust_gems(student, -10, "purchase").await })
        });
        let results = futures::future::join_all(tasks).await;
        let mut ok = 0;
        for result in results {
            match result.unwrap() {
                Ok(balance) => {
                    assert!(balance >= 0);
                    ok += 1;
                }
                Err(Error::InsufficientBalance { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 5);
        assert_eq!(economy.state(fx.student).await.unwrap().gems, 0);
    }

    #[tokio::test]
    async fn level_up_is_taken_once() {
        let fx = testing::Fixture::new().await;
        let economy = fx.economy();
        economy.credit_experience(fx.student, 950).await.unwrap();
        assert_eq!(economy.take_level_up(fx.student).await.unwrap(), None);
        let outcome = economy.credit_experience(fx.student, 100).await.unwrap();
        assert_eq!(outcome.experience, 1050);
        assert_eq!(outcome.level_up, Some(LevelUp { from: 1, to: 2 }));
        assert_eq!(
            economy.take_level_up(fx.student).await.unwrap(),
            Some(LevelUp { from: 1, to: 2 })
        );
        assert_eq!(economy.take_level_up(fx.student).await.unwrap(), None);
    }

    #[tokio::test]
    async fn chapter_reward_is_the_pure_evaluation() {
        let fx = testing::Fixture::new().await;
        let economy = fx.economy();
        economy.credit_experience(fx.student, 990).await.unwrap();
        let before = economy.state(fx.student).await.unwrap();
        let (course, idx) = fx
            .progression()
            .catalog()
            .get_chapter(fx.chapters[0])
            .await
            .unwrap();
        let chapter = &course.chapters[idx];
        let expected = apply_evaluation(
            economy.config(),
            before,
            80,
            chapter.reward_exp,
            chapter.reward_gems,
            false,
        );

        let mut tx = fx.database.begin().await.unwrap();
        let outcome = credit_evaluation_in(
            &mut tx,
            economy.config(),
            fx.student,
            chapter,
            80,
            false,
            testing::T0,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(outcome, expected);
        let after = economy.state(fx.student).await.unwrap();
        assert_eq!(after.experience, outcome.experience);
        assert_eq!(after.gems, outcome.gems);
    }

    #[tokio::test]
    async fn promotion_never_demotes() {
        let fx = testing::Fixture::new().await;
        let economy = fx.economy();
        let mut conn = fx.database.acquire().await.unwrap();
        assert_eq!(
            promote_in(&mut conn, fx.student, Rank::Chuden).await.unwrap(),
            Some(Rank::Chuden)
        );
        assert_eq!(promote_in(&mut conn, fx.student, Rank::Shoden).await.unwrap(), None);
        drop(conn);
        assert_eq!(economy.rank(fx.student).await.unwrap(), Rank::Chuden);
    }
}
