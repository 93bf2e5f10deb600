pub mod controller;
pub mod grading;
pub mod store;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

use crate::{
    course::Chapter,
    error::{Error, Result},
    utils::seconds_until,
};

/// One scored exam section. Never changed once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct SectionResult {
    pub section_index: i64,
    pub content: String,
    pub score: i64,
    pub feedback: String,
    pub next_step: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExamProgress {
    pub student_id: i64,
    pub chapter_id: i64,
    pub course_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Minutes, copied from the chapter when the exam starts.
    pub time_limit: i64,
    pub section_count: i64,
    pub current_section: i64,
    #[serde(skip)]
    pub claimed_section: Option<i64>,
    #[serde(skip)]
    pub claimed_at: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub timed_out: bool,
    pub final_score: Option<f64>,
    pub grade: Option<String>,
    /// `results.len() == current_section` at all times.
    pub results: Vec<SectionResult>,
}

impl ExamProgress {
    pub fn start(student_id: i64, chapter: &Chapter, now: OffsetDateTime) -> Self {
        Self {
            student_id,
            chapter_id: chapter.id,
            course_id: chapter.course_id,
            started_at: now,
            time_limit: chapter.time_limit,
            section_count: chapter.sections().len() as i64,
            current_section: 0,
            claimed_section: None,
            claimed_at: None,
            completed_at: None,
            timed_out: false,
            final_score: None,
            grade: None,
            results: Vec::new(),
        }
    }

    pub fn deadline(&self) -> OffsetDateTime {
        self.started_at + Duration::minutes(self.time_limit)
    }

    pub fn remaining_secs(&self, now: OffsetDateTime) -> i64 {
        if self.is_complete() {
            return 0;
        }
        seconds_until(now, self.deadline())
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn all_sections_done(&self) -> bool {
        self.current_section >= self.section_count
    }

    /// Whether the time limit has run out, allowing `slack` of clock skew.
    pub fn expired(&self, now: OffsetDateTime, slack: Duration) -> bool {
        now + slack >= self.deadline()
    }

    /// The claim on the current section is held by a live request.
    pub fn claim_is_fresh(&self, token: i64, stale_after_ms: i64) -> bool {
        self.claimed_section == Some(self.current_section)
            && self
                .claimed_at
                .is_some_and(|claimed| token - claimed < stale_after_ms)
    }

    /// Rejects anything but the open section, carrying the stored result when
    /// the section was already scored.
    pub fn check_section(&self, index: i64) -> Result<()> {
        if self.is_complete() {
            return Err(Error::sequence(
                "exam is already complete",
                serde_json::to_value(&self.results).ok(),
            ));
        }
        if index == self.current_section && index < self.section_count {
            return Ok(());
        }
        let existing = usize::try_from(index)
            .ok()
            .and_then(|i| self.results.get(i))
            .and_then(|result| serde_json::to_value(result).ok());
        if existing.is_some() {
            return Err(Error::sequence(
                format!("section {index} is already submitted"),
                existing,
            ));
        }
        Err(Error::sequence(
            format!(
                "section {index} is not open, current section is {}",
                self.current_section
            ),
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn progress() -> ExamProgress {
        ExamProgress {
            student_id: 1,
            chapter_id: 3,
            course_id: 1,
            started_at: datetime!(2026-04-01 10:00 +9),
            time_limit: 60,
            section_count: 3,
            current_section: 1,
            claimed_section: None,
            claimed_at: None,
            completed_at: None,
            timed_out: false,
            final_score: None,
            grade: None,
            results: vec![SectionResult {
                section_index: 0,
                content: "moves transfer ownership".into(),
                score: 70,
                feedback: "ok".into(),
                next_step: "borrowing".into(),
                submitted_at: datetime!(2026-04-01 10:10 +9),
            }],
        }
    }

    #[test]
    fn only_the_current_section_is_open() {
        let progress = progress();
        assert!(progress.check_section(1).is_ok());
        match progress.check_section(0) {
            Err(Error::SequenceViolation { existing, .. }) => {
                assert_eq!(existing.unwrap()["score"], 70);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            progress.check_section(2),
            Err(Error::SequenceViolation { existing: None, .. })
        ));
        assert!(progress.check_section(-1).is_err());
    }

    #[test]
    fn remaining_time_is_server_computed() {
        let progress = progress();
        let now = datetime!(2026-04-01 10:59:30 +9);
        assert_eq!(progress.remaining_secs(now), 30);
        assert!(!progress.expired(now, Duration::ZERO));
        assert!(progress.expired(now, Duration::seconds(30)));
        assert_eq!(progress.remaining_secs(datetime!(2026-04-01 12:00 +9)), 0);
    }
}
