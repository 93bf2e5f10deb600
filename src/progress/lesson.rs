use std::{sync::Arc, time::Duration};

use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::{ChapterProgress, ChapterStatus, Claim, Submission, store};
use crate::{
    config::{Config, GamificationConfig, ProgressionConfig},
    course::{Chapter, Course, progression::{CourseStatus, Progression}},
    error::{Error, Result},
    gamification::{EvaluationOutcome, economy::credit_evaluation_in},
    oracle::{Rubric, ScoringOracle, evaluate_bounded},
    utils::Clock,
};

const CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NextChapter {
    pub chapter_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub available_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskOutcome {
    pub submission: Submission,
    pub status: ChapterStatus,
    /// The chapter was scored before; nothing was re-evaluated.
    pub replayed: bool,
    pub reward: Option<EvaluationOutcome>,
    pub course_status: Option<CourseStatus>,
    pub next_chapter: Option<NextChapter>,
}

impl TaskOutcome {
    fn replay(progress: ChapterProgress) -> Result<Self> {
        let submission = progress
            .submission
            .ok_or_else(|| Error::Fatal(anyhow::anyhow!("replay without a submission")))?;
        Ok(Self {
            submission,
            status: progress.status,
            replayed: true,
            reward: None,
            course_status: None,
            next_chapter: None,
        })
    }
}

/// A task whose scoring claim is held by this request.
struct ClaimedTask {
    student_id: i64,
    course: Arc<Course>,
    idx: usize,
    rubric: Rubric,
    content: String,
    token: i64,
    late: bool,
}

/// Lesson viewing and task submission for ordinary chapters.
#[derive(Clone)]
pub struct LessonService {
    database: SqlitePool,
    progression: Progression,
    oracle: Arc<dyn ScoringOracle>,
    oracle_timeout: Duration,
    stale_claim_ms: i64,
    rules: ProgressionConfig,
    gamification: GamificationConfig,
    clock: Arc<dyn Clock>,
}

impl LessonService {
    pub fn new(
        database: SqlitePool,
        progression: Progression,
        oracle: Arc<dyn ScoringOracle>,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            database,
            progression,
            oracle,
            oracle_timeout: config.oracle.timeout(),
            stale_claim_ms: config.oracle.stale_claim_secs.max(1) * 1000,
            rules: config.progression.clone(),
            gamification: config.gamification.clone(),
            clock,
        }
    }

    async fn lesson_chapter(&self, chapter_id: i64) -> Result<(Arc<Course>, usize)> {
        let (course, idx) = self.progression.catalog().get_chapter(chapter_id).await?;
        if course.chapters[idx].is_final_exam {
            return Err(Error::validation(format!(
                "chapter {chapter_id} is a final exam"
            )));
        }
        Ok((course, idx))
    }

    async fn load(&self, student_id: i64, chapter_id: i64) -> Result<Option<ChapterProgress>> {
        let mut conn = self.database.acquire().await?;
        store::get(&mut conn, student_id, chapter_id).await
    }

    /// First access creates the progress row and starts the chapter's clock.
    pub async fn open_chapter(&self, student_id: i64, chapter_id: i64) -> Result<ChapterProgress> {
        let (course, idx) = self.lesson_chapter(chapter_id).await?;
        self.progression.ensure_open(student_id, &course, idx).await?;
        let chapter = &course.chapters[idx];
        let mut conn = self.database.acquire().await?;
        let fresh = ChapterProgress::first_access(student_id, chapter, self.clock.now());
        if store::insert_if_absent(&mut conn, &fresh).await? {
            info!(student_id, chapter_id, "chapter opened");
        }
        let mut progress = store::get(&mut conn, student_id, chapter_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("progress of chapter {chapter_id}")))?;
        let expected = (progress.status, progress.claimed_at);
        if progress.refresh_deadline(chapter, self.clock.now())?
            && !store::update_guarded(&mut conn, &progress, expected.0, expected.1).await?
        {
            // another writer got there first; theirs is what is stored
            progress = store::get(&mut conn, student_id, chapter_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("progress of chapter {chapter_id}")))?;
        }
        Ok(progress)
    }

    /// Media tick from the player. The stored watch rate only grows; a report
    /// far below it is rejected.
    pub async fn record_media_progress(
        &self,
        student_id: i64,
        chapter_id: i64,
        position: f64,
        watch_rate: f64,
    ) -> Result<ChapterProgress> {
        let mut progress = self.open_chapter(student_id, chapter_id).await?;
        let (course, idx) = self.lesson_chapter(chapter_id).await?;
        let chapter = &course.chapters[idx];
        for _ in 0..CAS_ATTEMPTS {
            let now = self.clock.now();
            let expected = (progress.status, progress.claimed_at);
            progress.refresh_deadline(chapter, now)?;
            let change = progress.record_media(position, watch_rate, &self.rules, now)?;
            let mut conn = self.database.acquire().await?;
            if progress.submission.is_some() {
                store::update_playback(&mut conn, &progress).await?;
                return Ok(progress);
            }
            if store::update_guarded(&mut conn, &progress, expected.0, expected.1).await? {
                if change.lesson_completed {
                    info!(student_id, chapter_id, "lesson completed");
                }
                return Ok(progress);
            }
            progress = store::get(&mut conn, student_id, chapter_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("progress of chapter {chapter_id}")))?;
        }
        Err(Error::SubmissionInProgress)
    }

    /// Scores the chapter's task once. A repeated call returns the stored
    /// result without asking the oracle again; a failed evaluation stores
    /// nothing.
    pub async fn submit_task(
        &self,
        student_id: i64,
        chapter_id: i64,
        content: &str,
    ) -> Result<TaskOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::validation("submission is empty"));
        }
        let (course, idx) = self.lesson_chapter(chapter_id).await?;
        let chapter = &course.chapters[idx];
        let rubric = chapter
            .task
            .clone()
            .ok_or_else(|| Error::validation(format!("chapter {chapter_id} has no task")))?;

        let stored = self.load(student_id, chapter_id).await?;
        if let Some(progress) = stored.as_ref().filter(|p| p.submission.is_some()) {
            return TaskOutcome::replay(progress.clone());
        }
        self.progression.ensure_open(student_id, &course, idx).await?;
        let Some(mut progress) = stored else {
            return Err(Error::validation(format!(
                "lesson must be watched to {:.0}% before submitting",
                self.rules.lesson_threshold
            )));
        };

        let now = self.clock.now();
        let expected = (progress.status, progress.claimed_at);
        progress.refresh_deadline(chapter, now)?;
        let token = match progress.claim(&self.rules, now, self.stale_claim_ms)? {
            Claim::Taken(token) => token,
            Claim::AlreadyScored => return TaskOutcome::replay(progress),
        };
        {
            let mut conn = self.database.acquire().await?;
            if !store::update_guarded(&mut conn, &progress, expected.0, expected.1).await? {
                return self.lost_race(student_id, chapter_id).await;
            }
        }
        info!(student_id, chapter_id, "task claimed for scoring");

        // detached: the claim is finished or released even if the caller goes away
        let service = self.clone();
        let claimed = ClaimedTask {
            student_id,
            course,
            idx,
            rubric,
            content: content.to_string(),
            token,
            late: progress.late,
        };
        tokio::spawn(async move { service.score_claimed(claimed).await })
            .await
            .map_err(|e| Error::Fatal(anyhow::anyhow!("task scoring aborted: {e}")))?
    }

    async fn score_claimed(&self, task: ClaimedTask) -> Result<TaskOutcome> {
        let ClaimedTask {
            student_id,
            course,
            idx,
            rubric,
            content,
            token,
            late,
        } = task;
        let chapter = &course.chapters[idx];
        let chapter_id = chapter.id;
        let evaluation =
            match evaluate_bounded(self.oracle.as_ref(), &rubric, &content, self.oracle_timeout).await {
                Ok(evaluation) => evaluation,
                Err(e) => {
                    self.release(student_id, chapter_id, token).await;
                    return Err(e);
                }
            };

        let now = self.clock.now();
        let mut submission = Submission {
            content,
            score: evaluation.score,
            feedback: evaluation.feedback,
            next_step: evaluation.next_step,
            submitted_at: now,
            late,
        };
        let mut tx = self.database.begin().await?;
        let Some(late) = store::finish(&mut tx, student_id, chapter_id, token, &submission).await?
        else {
            drop(tx);
            return self.lost_race(student_id, chapter_id).await;
        };
        submission.late = late;
        let outcome = credit_evaluation_in(
            &mut tx,
            &self.gamification,
            student_id,
            chapter,
            submission.score,
            late,
            now,
        )
        .await?;
        tx.commit().await?;
        info!(
            student_id,
            chapter_id,
            score = submission.score,
            late,
            experience = outcome.experience_gained,
            "task scored"
        );

        let enrollment = self.progression.course_status(student_id, course.id).await?;
        let next_chapter = course.chapters.get(idx + 1).map(|next: &Chapter| NextChapter {
            chapter_id: next.id,
            available_at: now + next.wait(),
        });
        Ok(TaskOutcome {
            submission,
            status: if late {
                ChapterStatus::Failed
            } else {
                ChapterStatus::Completed
            },
            replayed: false,
            reward: Some(outcome),
            course_status: Some(enrollment.status),
            next_chapter,
        })
    }

    /// Another request changed the row under us: replay its result if it
    /// scored, otherwise report the in-flight submission.
    async fn lost_race(&self, student_id: i64, chapter_id: i64) -> Result<TaskOutcome> {
        match self.load(student_id, chapter_id).await? {
            Some(progress) if progress.submission.is_some() => TaskOutcome::replay(progress),
            _ => Err(Error::SubmissionInProgress),
        }
    }

    async fn release(&self, student_id: i64, chapter_id: i64, token: i64) {
        let released = match self.database.acquire().await {
            Ok(mut conn) => {
                store::release(&mut conn, student_id, chapter_id, token, self.clock.now()).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = released {
            // the claim goes stale and is taken over by the next attempt
            warn!(student_id, chapter_id, "release scoring claim failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Fixture};
    use time::Duration as TimeDuration;

    #[tokio::test]
    async fn stored_watch_rate_never_decreases() {
        let fx = Fixture::new().await;
        let lessons = fx.lessons();
        let chapter = fx.chapters[0];
        let first = lessons.record_media_progress(fx.student, chapter, 30.0, 40.0).await.unwrap();
        assert_eq!(first.status, ChapterStatus::LessonInProgress);
        assert_eq!(first.started_at, testing::T0);
        let seek_back = lessons.record_media_progress(fx.student, chapter, 10.0, 38.0).await.unwrap();
        assert_eq!(seek_back.lesson_watch_rate, 40.0);
        assert!(matches!(
            lessons.record_media_progress(fx.student, chapter, 0.0, 5.0).await,
            Err(Error::Validation(_))
        ));
        fx.clock.advance(TimeDuration::minutes(5));
        let done = lessons.record_media_progress(fx.student, chapter, 580.0, 97.0).await.unwrap();
        assert_eq!(done.status, ChapterStatus::LessonCompleted);
        assert_eq!(done.started_at, testing::T0);
        let rewatch = lessons.record_media_progress(fx.student, chapter, 5.0, 93.0).await.unwrap();
        assert_eq!(rewatch.status, ChapterStatus::LessonCompleted);
        assert_eq!(rewatch.lesson_watch_rate, 97.0);
    }

    #[tokio::test]
    async fn unwatched_lesson_cannot_be_submitted() {
        let fx = Fixture::new().await;
        let lessons = fx.lessons();
        let chapter = fx.chapters[0];
        lessons.record_media_progress(fx.student, chapter, 100.0, 94.0).await.unwrap();
        assert!(matches!(
            lessons.submit_task(fx.student, chapter, "answer").await,
            Err(Error::Validation(_))
        ));
        assert_eq!(fx.oracle.calls(), 0);
        let progress = lessons.load(fx.student, chapter).await.unwrap().unwrap();
        assert!(progress.submission.is_none());
        assert_eq!(progress.status, ChapterStatus::LessonInProgress);
    }

    #[tokio::test]
    async fn empty_submission_is_rejected_before_scoring() {
        let fx = Fixture::new().await;
        let lessons = fx.lessons();
        lessons.record_media_progress(fx.student, fx.chapters[0], 1.0, 100.0).await.unwrap();
        assert!(matches!(
            lessons.submit_task(fx.student, fx.chapters[0], "   ").await,
            Err(Error::Validation(_))
        ));
        assert_eq!(fx.oracle.calls(), 0);
    }

    #[tokio::test]
    async fn repeated_submission_replays_the_stored_result() {
        let fx = Fixture::new().await;
        let lessons = fx.lessons();
        let chapter = fx.chapters[0];
        lessons.record_media_progress(fx.student, chapter, 600.0, 100.0).await.unwrap();
        let first = lessons.submit_task(fx.student, chapter, "ownership moves").await.unwrap();
        assert!(!first.replayed);
        assert_eq!(first.status, ChapterStatus::Completed);
        assert_eq!(first.submission.score, 80);
        // 200 * 80 / 100, plus 5 gems for a passing score
        let reward = first.reward.unwrap();
        assert_eq!(reward.experience_gained, 160);
        assert_eq!(reward.gems_gained, 5);
        assert_eq!(
            first.next_chapter.as_ref().map(|n| n.chapter_id),
            Some(fx.chapters[1])
        );

        fx.oracle.set_score(10);
        let second = lessons.submit_task(fx.student, chapter, "ownership moves").await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.submission, first.submission);
        assert_eq!(fx.oracle.calls(), 1);
        assert_eq!(fx.economy().state(fx.student).await.unwrap().experience, 160);
    }

    #[tokio::test]
    async fn oracle_failure_leaves_nothing_behind() {
        let fx = Fixture::new().await;
        let lessons = fx.lessons();
        let chapter = fx.chapters[0];
        lessons.record_media_progress(fx.student, chapter, 600.0, 100.0).await.unwrap();
        fx.oracle.fail_next(Error::Oracle("upstream 502".into()));
        let err = lessons.submit_task(fx.student, chapter, "answer").await.unwrap_err();
        assert!(err.is_retryable());
        let progress = lessons.load(fx.student, chapter).await.unwrap().unwrap();
        assert_eq!(progress.status, ChapterStatus::LessonCompleted);
        assert!(progress.submission.is_none());
        assert_eq!(progress.claimed_at, None);
        assert_eq!(fx.economy().state(fx.student).await.unwrap().experience, 0);

        let retry = lessons.submit_task(fx.student, chapter, "answer").await.unwrap();
        assert_eq!(retry.status, ChapterStatus::Completed);
    }

    #[tokio::test]
    async fn stalled_oracle_times_out_and_releases_the_claim() {
        let mut fx = Fixture::new().await;
        fx.config.oracle.timeout_secs = 1;
        let lessons = fx.lessons();
        let chapter = fx.chapters[0];
        lessons.record_media_progress(fx.student, chapter, 600.0, 100.0).await.unwrap();
        fx.oracle.stall(true);
        assert!(matches!(
            lessons.submit_task(fx.student, chapter, "answer").await,
            Err(Error::OracleTimeout)
        ));
        let progress = lessons.load(fx.student, chapter).await.unwrap().unwrap();
        assert_eq!(progress.status, ChapterStatus::LessonCompleted);
        fx.oracle.stall(false);
        assert!(lessons.submit_task(fx.student, chapter, "answer").await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_submissions_score_once() {
        let (fx, _dir) = Fixture::file_backed().await;
        let lessons = fx.lessons();
        let chapter = fx.chapters[0];
        lessons.record_media_progress(fx.student, chapter, 600.0, 100.0).await.unwrap();
        fx.oracle.delay(std::time::Duration::from_millis(200));
        let tasks = (0..6).map(|_| {
            let lessons = lessons.clone();
            let student = fx.student;
            tokio::spawn(async move { lessons.submit_task(student, chapter, "same answer").await })
        });
        let mut scored = 0;
        for result in futures::future::join_all(tasks).await {
            match result.unwrap() {
                Ok(outcome) if !outcome.replayed => scored += 1,
                Ok(_) | Err(Error::SubmissionInProgress) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(scored, 1);
        assert_eq!(fx.oracle.calls(), 1);
        assert_eq!(fx.economy().state(fx.student).await.unwrap().experience, 160);
    }

    #[tokio::test]
    async fn dropped_request_still_stores_its_result() {
        let fx = Fixture::new().await;
        let lessons = fx.lessons();
        let chapter = fx.chapters[0];
        lessons.record_media_progress(fx.student, chapter, 600.0, 100.0).await.unwrap();
        fx.oracle.delay(std::time::Duration::from_millis(300));
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            lessons.submit_task(fx.student, chapter, "sent then closed the tab"),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        let progress = lessons.load(fx.student, chapter).await.unwrap().unwrap();
        assert_eq!(progress.status, ChapterStatus::Completed);
        assert_eq!(progress.claimed_at, None);
        let retry = lessons.submit_task(fx.student, chapter, "second try").await.unwrap();
        assert!(retry.replayed);
        assert_eq!(retry.submission.content, "sent then closed the tab");
        assert_eq!(fx.oracle.calls(), 1);
        assert_eq!(fx.economy().state(fx.student).await.unwrap().experience, 160);
    }

    #[tokio::test]
    async fn racing_opens_return_the_stored_deadline_state() {
        let (fx, _dir) = Fixture::file_backed().await;
        let lessons = fx.lessons();
        let chapter = fx.chapters[0];
        lessons.record_media_progress(fx.student, chapter, 60.0, 50.0).await.unwrap();
        fx.clock.advance(TimeDuration::minutes(121));
        let opens = (0..6).map(|_| {
            let lessons = lessons.clone();
            let student = fx.student;
            tokio::spawn(async move { lessons.open_chapter(student, chapter).await })
        });
        let ticks = (0..6).map(|_| {
            let lessons = lessons.clone();
            let student = fx.student;
            tokio::spawn(async move { lessons.record_media_progress(student, chapter, 300.0, 80.0).await })
        });
        let (opens, ticks) = tokio::join!(
            futures::future::join_all(opens),
            futures::future::join_all(ticks)
        );
        for tick in ticks {
            match tick.unwrap() {
                Ok(_) | Err(Error::SubmissionInProgress) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        let stored = lessons.load(fx.student, chapter).await.unwrap().unwrap();
        assert_eq!(stored.status, ChapterStatus::Failed);
        assert!(stored.late);
        for open in opens {
            let progress = open.unwrap().unwrap();
            assert_eq!(progress.status, ChapterStatus::Failed);
            assert!(progress.late);
            assert!(progress.lesson_watch_rate <= stored.lesson_watch_rate);
        }
    }

    #[tokio::test]
    async fn late_work_is_accepted_but_flagged() {
        let fx = Fixture::new().await;
        let lessons = fx.lessons();
        let chapter = fx.chapters[0];
        lessons.record_media_progress(fx.student, chapter, 600.0, 100.0).await.unwrap();
        fx.clock.advance(TimeDuration::minutes(121));
        let outcome = lessons.submit_task(fx.student, chapter, "late answer").await.unwrap();
        assert_eq!(outcome.status, ChapterStatus::Failed);
        assert!(outcome.submission.late);
        let reward = outcome.reward.unwrap();
        assert_eq!(reward.experience_gained, 80);
        assert_eq!(reward.gems_gained, 0);
        // failed-but-submitted still unlocks the next chapter after its wait
        fx.clock.advance(TimeDuration::minutes(60));
        assert_eq!(
            fx.progression().unlock_next(fx.student, fx.course_id).await.unwrap(),
            Some(fx.chapters[1])
        );
    }
}
