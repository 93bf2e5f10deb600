pub mod lesson;
pub mod store;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::{
    config::ProgressionConfig,
    course::Chapter,
    error::{Error, Result},
    oracle::Evaluation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i64)]
pub enum ChapterStatus {
    NotStarted = 0,
    LessonInProgress = 1,
    LessonCompleted = 2,
    TaskInProgress = 3,
    Completed = 4,
    /// Time limit elapsed before completion. Work may still be submitted.
    Failed = 5,
}

impl TryFrom<i64> for ChapterStatus {
    type Error = Error;
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(ChapterStatus::NotStarted),
            1 => Ok(ChapterStatus::LessonInProgress),
            2 => Ok(ChapterStatus::LessonCompleted),
            3 => Ok(ChapterStatus::TaskInProgress),
            4 => Ok(ChapterStatus::Completed),
            5 => Ok(ChapterStatus::Failed),
            other => Err(Error::Fatal(anyhow::anyhow!(
                "unknown chapter status {other}"
            ))),
        }
    }
}

impl ChapterStatus {
    /// Every legal edge of the chapter state machine.
    pub fn can_transition(self, to: ChapterStatus) -> bool {
        use ChapterStatus::*;
        match (self, to) {
            (NotStarted, LessonInProgress) => true,
            (LessonInProgress, LessonCompleted) => true,
            (LessonCompleted, TaskInProgress) => true,
            (TaskInProgress, Completed) => true,
            // scoring failed, the claim is released
            (TaskInProgress, LessonCompleted) => true,
            // late work: scored or released while past the deadline
            (TaskInProgress, Failed) => true,
            (Failed, TaskInProgress) => true,
            (NotStarted | LessonInProgress | LessonCompleted, Failed) => true,
            (NotStarted, _)
            | (LessonInProgress, _)
            | (LessonCompleted, _)
            | (TaskInProgress, _)
            | (Completed, _)
            | (Failed, _) => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChapterStatus::Completed | ChapterStatus::Failed)
    }
}

/// The single scored submission of a chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Submission {
    pub content: String,
    pub score: i64,
    pub feedback: String,
    pub next_step: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    pub late: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChapterProgress {
    pub student_id: i64,
    pub chapter_id: i64,
    pub course_id: i64,
    pub status: ChapterStatus,
    pub lesson_watch_rate: f64,
    pub last_position: f64,
    /// Set on first access, never changed afterwards.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// The time limit elapsed before completion.
    pub late: bool,
    /// Millisecond timestamp of the in-flight scoring claim.
    #[serde(skip)]
    pub claimed_at: Option<i64>,
    pub submission: Option<Submission>,
    #[serde(with = "time::serde::rfc3339")]
    pub update_time: OffsetDateTime,
}

/// What `record_media` changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaChange {
    pub started: bool,
    pub lesson_completed: bool,
}

/// Result of trying to claim a chapter for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The claim was taken; carries the claim token.
    Taken(i64),
    /// A submission already exists; nothing to do.
    AlreadyScored,
}

pub fn claim_token(now: OffsetDateTime) -> i64 {
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

impl ChapterProgress {
    /// Progress created by the first access to a chapter.
    pub fn first_access(
        student_id: i64,
        chapter: &Chapter,
        now: OffsetDateTime,
    ) -> ChapterProgress {
        ChapterProgress {
            student_id,
            chapter_id: chapter.id,
            course_id: chapter.course_id,
            status: ChapterStatus::LessonInProgress,
            lesson_watch_rate: 0.0,
            last_position: 0.0,
            started_at: now,
            late: false,
            claimed_at: None,
            submission: None,
            update_time: now,
        }
    }

    pub fn time_out_at(&self, chapter: &Chapter) -> Option<OffsetDateTime> {
        chapter.deadline_from(self.started_at)
    }

    fn transition(&mut self, to: ChapterStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::Fatal(anyhow::anyhow!(
                "illegal chapter transition {:?} -> {:?}",
                self.status,
                to
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Flags the attempt as failed once the time limit has passed without a
    /// completion. Returns whether anything changed.
    pub fn refresh_deadline(&mut self, chapter: &Chapter, now: OffsetDateTime) -> Result<bool> {
        let Some(deadline) = self.time_out_at(chapter) else {
            return Ok(false);
        };
        if now <= deadline || self.late || self.submission.is_some() {
            return Ok(false);
        }
        self.late = true;
        match self.status {
            // an in-flight scoring keeps its claim; the release or finish picks up `late`
            ChapterStatus::TaskInProgress => {}
            ChapterStatus::Completed | ChapterStatus::Failed => {}
            _ => self.transition(ChapterStatus::Failed)?,
        }
        self.update_time = now;
        Ok(true)
    }

    pub fn record_media(
        &mut self,
        position: f64,
        watch_rate: f64,
        config: &ProgressionConfig,
        now: OffsetDateTime,
    ) -> Result<MediaChange> {
        if !watch_rate.is_finite() || !(0.0..=100.0).contains(&watch_rate) {
            return Err(Error::validation("watch rate must be between 0 and 100"));
        }
        if !position.is_finite() || position < 0.0 {
            return Err(Error::validation("position must be non-negative"));
        }
        if watch_rate < self.lesson_watch_rate - config.watch_regress_tolerance {
            return Err(Error::validation(format!(
                "watch rate {watch_rate:.1} regresses below recorded {:.1}",
                self.lesson_watch_rate
            )));
        }
        let mut change = MediaChange {
            started: false,
            lesson_completed: false,
        };
        if self.status == ChapterStatus::NotStarted {
            self.transition(ChapterStatus::LessonInProgress)?;
            change.started = true;
        }
        self.lesson_watch_rate = self.lesson_watch_rate.max(watch_rate);
        self.last_position = position;
        if self.status == ChapterStatus::LessonInProgress
            && self.lesson_watch_rate >= config.lesson_threshold
        {
            self.transition(ChapterStatus::LessonCompleted)?;
            change.lesson_completed = true;
        }
        self.update_time = now;
        Ok(change)
    }

    pub fn lesson_watched(&self, config: &ProgressionConfig) -> bool {
        self.lesson_watch_rate >= config.lesson_threshold
    }

    /// Takes the scoring claim. A claim older than `stale_after_ms` belongs to
    /// an abandoned request and may be taken over.
    pub fn claim(
        &mut self,
        config: &ProgressionConfig,
        now: OffsetDateTime,
        stale_after_ms: i64,
    ) -> Result<Claim> {
        if self.submission.is_some() {
            return Ok(Claim::AlreadyScored);
        }
        if !self.lesson_watched(config) {
            return Err(Error::validation(format!(
                "lesson must be watched to {:.0}% before submitting",
                config.lesson_threshold
            )));
        }
        let token = claim_token(now);
        match self.status {
            ChapterStatus::TaskInProgress => {
                let fresh = self
                    .claimed_at
                    .is_some_and(|claimed| token - claimed < stale_after_ms);
                if fresh {
                    return Err(Error::SubmissionInProgress);
                }
            }
            ChapterStatus::LessonCompleted | ChapterStatus::Failed => {
                self.transition(ChapterStatus::TaskInProgress)?;
            }
            other => {
                return Err(Error::Fatal(anyhow::anyhow!(
                    "watched lesson in unexpected status {other:?}"
                )));
            }
        }
        self.claimed_at = Some(token);
        self.update_time = now;
        Ok(Claim::Taken(token))
    }

    pub fn finish(
        &mut self,
        content: String,
        evaluation: Evaluation,
        now: OffsetDateTime,
    ) -> Result<()> {
        let to = if self.late {
            ChapterStatus::Failed
        } else {
            ChapterStatus::Completed
        };
        self.transition(to)?;
        self.submission = Some(Submission {
            content,
            score: evaluation.score,
            feedback: evaluation.feedback,
            next_step: evaluation.next_step,
            submitted_at: now,
            late: self.late,
        });
        self.claimed_at = None;
        self.update_time = now;
        Ok(())
    }

    pub fn release(&mut self, now: OffsetDateTime) -> Result<()> {
        let to = if self.late {
            ChapterStatus::Failed
        } else {
            ChapterStatus::LessonCompleted
        };
        self.transition(to)?;
        self.claimed_at = None;
        self.update_time = now;
        Ok(())
    }

    /// When the chapter counts as done for unlocking the next one.
    pub fn done_at(&self) -> Option<OffsetDateTime> {
        self.submission.as_ref().map(|s| s.submitted_at)
    }
}
