use std::{sync::Arc, time::Duration};

use dashmap::DashSet;
use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::{
    ExamProgress, SectionResult,
    grading::{ExamGrade, final_score},
    store,
};
use crate::{
    config::{Config, ExamConfig, GamificationConfig},
    course::{Chapter, Course, progression::Progression},
    error::{Error, Result},
    gamification::{EvaluationOutcome, economy::credit_evaluation_in},
    oracle::{Rubric, ScoringOracle, evaluate_bounded},
    progress::claim_token,
    utils::Clock,
};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SectionPrompt {
    pub index: i64,
    pub title: String,
    pub materials: String,
    pub task: String,
    pub max_points: i64,
}

/// What the exam page renders. Every time field is computed by the server.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ExamView {
    pub chapter_id: i64,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
    pub remaining_secs: i64,
    pub section_count: i64,
    pub current_section: i64,
    pub is_complete: bool,
    pub timed_out: bool,
    pub section: Option<SectionPrompt>,
    pub draft: Option<String>,
    pub results: Vec<SectionResult>,
    pub grade: Option<ExamGrade>,
    pub autosave_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SectionOutcome {
    /// `None` when the exam closed before this content could be scored.
    pub result: Option<SectionResult>,
    pub current_section: i64,
    /// Show the results page instead of the next section.
    pub is_complete: bool,
    pub grade: Option<ExamGrade>,
    pub reward: Option<EvaluationOutcome>,
}

/// Removes the in-flight timeout marker however the handler exits.
struct TimeoutGuard<'a> {
    handling: &'a DashSet<(i64, i64)>,
    key: (i64, i64),
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        self.handling.remove(&self.key);
    }
}

/// A section whose scoring claim is held by this request.
struct ClaimedSection {
    course: Arc<Course>,
    idx: usize,
    progress: ExamProgress,
    rubric: Rubric,
    content: String,
    token: i64,
}

/// The timed, multi-section final exam.
#[derive(Clone)]
pub struct ExamController {
    database: SqlitePool,
    progression: Progression,
    oracle: Arc<dyn ScoringOracle>,
    oracle_timeout: Duration,
    stale_claim_ms: i64,
    rules: ExamConfig,
    gamification: GamificationConfig,
    clock: Arc<dyn Clock>,
    handling_timeout: Arc<DashSet<(i64, i64)>>,
}

impl ExamController {
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
            rules: config.exam.clone(),
            gamification: config.gamification.clone(),
            clock,
            handling_timeout: Arc::new(DashSet::new()),
        }
    }

    async fn exam_chapter(&self, chapter_id: i64) -> Result<(Arc<Course>, usize)> {
        let (course, idx) = self.progression.catalog().get_chapter(chapter_id).await?;
        let chapter = &course.chapters[idx];
        if !chapter.is_final_exam || chapter.sections().is_empty() {
            return Err(Error::validation(format!(
                "chapter {chapter_id} is not a final exam"
            )));
        }
        Ok((course, idx))
    }

    async fn load(&self, student_id: i64, chapter_id: i64) -> Result<Option<ExamProgress>> {
        let mut conn = self.database.acquire().await?;
        store::get(&mut conn, student_id, chapter_id).await
    }

    async fn load_started(&self, student_id: i64, chapter_id: i64) -> Result<ExamProgress> {
        self.load(student_id, chapter_id)
            .await?
            .ok_or_else(|| Error::validation("exam has not been started"))
    }

    fn grace(&self) -> time::Duration {
        time::Duration::seconds(self.rules.timeout_grace_secs.max(0))
    }

    /// Starts the exam, or resumes it unchanged when it already exists so a
    /// reload never resets the timer.
    pub async fn start_exam(&self, student_id: i64, chapter_id: i64) -> Result<ExamView> {
        let (course, idx) = self.exam_chapter(chapter_id).await?;
        if self.load(student_id, chapter_id).await?.is_none() {
            self.progression.ensure_open(student_id, &course, idx).await?;
            let progress = ExamProgress::start(student_id, &course.chapters[idx], self.clock.now());
            let mut conn = self.database.acquire().await?;
            if store::insert_if_absent(&mut conn, &progress).await? {
                info!(student_id, chapter_id, "exam started");
            }
        }
        self.exam_view(student_id, chapter_id).await
    }

    /// Current exam state. An exam left running past its deadline and grace
    /// period is closed here with the results it has.
    pub async fn exam_view(&self, student_id: i64, chapter_id: i64) -> Result<ExamView> {
        let (course, idx) = self.exam_chapter(chapter_id).await?;
        let chapter = &course.chapters[idx];
        let mut progress = self.load_started(student_id, chapter_id).await?;
        let now = self.clock.now();
        if !progress.is_complete() && now > progress.deadline() + self.grace() {
            self.close(chapter, &progress, true).await?;
            self.after_completion(student_id, course.id).await;
            progress = self.load_started(student_id, chapter_id).await?;
        }
        let draft = if progress.is_complete() {
            None
        } else {
            let mut conn = self.database.acquire().await?;
            store::get_draft(&mut conn, student_id, chapter_id, progress.current_section)
                .await?
                .map(|draft| draft.content)
        };
        Ok(self.view(chapter, progress, draft, now))
    }

    fn view(
        &self,
        chapter: &Chapter,
        progress: ExamProgress,
        draft: Option<String>,
        now: OffsetDateTime,
    ) -> ExamView {
        let section = (!progress.is_complete())
            .then(|| {
                let index = progress.current_section;
                chapter
                    .sections()
                    .get(usize::try_from(index).ok()?)
                    .map(|s| SectionPrompt {
                        index,
                        title: s.title.clone(),
                        materials: s.materials.clone(),
                        task: s.task.clone(),
                        max_points: s.max_points,
                    })
            })
            .flatten();
        let grade = match (progress.final_score, &progress.grade) {
            (Some(score), Some(letter)) => Some(ExamGrade {
                score,
                letter: letter.clone(),
            }),
            _ => None,
        };
        ExamView {
            chapter_id: chapter.id,
            title: chapter.title.clone(),
            started_at: progress.started_at,
            deadline: progress.deadline(),
            remaining_secs: progress.remaining_secs(now),
            section_count: progress.section_count,
            current_section: progress.current_section,
            is_complete: progress.is_complete(),
            timed_out: progress.timed_out,
            section,
            draft,
            grade,
            results: progress.results,
            autosave_interval_secs: self.rules.autosave_interval_secs,
        }
    }

    /// Scores `content` as section `index`. Only the open section is
    /// accepted; a section that was already scored comes back as a
    /// `SequenceViolation` carrying the stored result.
    pub async fn submit_section(
        &self,
        student_id: i64,
        chapter_id: i64,
        index: i64,
        content: &str,
    ) -> Result<SectionOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::validation("answer is empty"));
        }
        let (course, idx) = self.exam_chapter(chapter_id).await?;
        let chapter = &course.chapters[idx];
        let progress = self.load_started(student_id, chapter_id).await?;
        progress.check_section(index)?;

        let now = self.clock.now();
        if now > progress.deadline() + self.grace() {
            // too late to score; close with what was submitted in time
            debug!(student_id, chapter_id, index, "section arrived after the deadline");
            let grade = self.close(chapter, &progress, true).await?;
            self.after_completion(student_id, course.id).await;
            let progress = self.load_started(student_id, chapter_id).await?;
            return Ok(SectionOutcome {
                result: None,
                current_section: progress.current_section,
                is_complete: progress.is_complete(),
                grade: grade.map(|(grade, _)| grade),
                reward: None,
            });
        }
        self.score_section(course.clone(), idx, progress, content, now).await
    }

    async fn score_section(
        &self,
        course: Arc<Course>,
        idx: usize,
        progress: ExamProgress,
        content: &str,
        now: OffsetDateTime,
    ) -> Result<SectionOutcome> {
        let (student_id, chapter_id) = (progress.student_id, progress.chapter_id);
        let index = progress.current_section;
        let rubric = course.chapters[idx]
            .sections()
            .get(usize::try_from(index).unwrap_or(usize::MAX))
            .ok_or_else(|| Error::sequence(format!("section {index} does not exist"), None))?
            .rubric();

        let token = claim_token(now);
        if progress.claim_is_fresh(token, self.stale_claim_ms) {
            return Err(Error::SubmissionInProgress);
        }
        let claimed = {
            let mut conn = self.database.acquire().await?;
            store::claim_section(&mut conn, student_id, chapter_id, index, progress.claimed_at, token)
                .await?
        };
        if !claimed {
            return Err(self.lost_race(student_id, chapter_id, index).await);
        }

        // detached: the claim is recorded or released even if the caller goes away
        let controller = self.clone();
        let claimed = ClaimedSection {
            course,
            idx,
            progress,
            rubric,
            content: content.to_string(),
            token,
        };
        tokio::spawn(async move { controller.record_claimed(claimed).await })
            .await
            .map_err(|e| Error::Fatal(anyhow::anyhow!("section scoring aborted: {e}")))?
    }

    async fn record_claimed(&self, claimed: ClaimedSection) -> Result<SectionOutcome> {
        let ClaimedSection {
            course,
            idx,
            progress,
            rubric,
            content,
            token,
        } = claimed;
        let chapter = &course.chapters[idx];
        let (student_id, chapter_id) = (progress.student_id, progress.chapter_id);
        let index = progress.current_section;
        let evaluation =
            match evaluate_bounded(self.oracle.as_ref(), &rubric, &content, self.oracle_timeout).await {
                Ok(evaluation) => evaluation,
                Err(e) => {
                    self.release(student_id, chapter_id, token).await;
                    return Err(e);
                }
            };

        let now = self.clock.now();
        let result = SectionResult {
            section_index: index,
            content,
            score: evaluation.score,
            feedback: evaluation.feedback,
            next_step: evaluation.next_step,
            submitted_at: now,
        };
        let mut tx = self.database.begin().await?;
        if !store::append_result(&mut tx, student_id, chapter_id, token, &result).await? {
            drop(tx);
            return Err(self.lost_race(student_id, chapter_id, index).await);
        }
        let mut results = progress.results;
        results.push(result.clone());
        let current_section = index + 1;
        let past_deadline = now > progress.started_at + time::Duration::minutes(progress.time_limit);
        let mut closing = None;
        if current_section >= progress.section_count || past_deadline {
            closing = self
                .close_in(&mut tx, chapter, student_id, &results, past_deadline, now)
                .await?;
        }
        tx.commit().await?;
        info!(student_id, chapter_id, index, score = result.score, "exam section scored");
        let is_complete = closing.is_some();
        if is_complete {
            self.after_completion(student_id, course.id).await;
        }
        let (grade, reward) = closing.unzip();
        Ok(SectionOutcome {
            result: Some(result),
            current_section,
            is_complete,
            grade,
            reward,
        })
    }

    async fn lost_race(&self, student_id: i64, chapter_id: i64, index: i64) -> Error {
        match self.load(student_id, chapter_id).await {
            Ok(Some(progress)) => match progress.check_section(index) {
                Err(e) => e,
                Ok(()) => Error::SubmissionInProgress,
            },
            Ok(None) => Error::validation("exam has not been started"),
            Err(e) => e,
        }
    }

    async fn release(&self, student_id: i64, chapter_id: i64, token: i64) {
        let released = match self.database.acquire().await {
            Ok(mut conn) => store::release_section(&mut conn, student_id, chapter_id, token).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = released {
            warn!(student_id, chapter_id, "release section claim failed: {e}");
        }
    }

    /// Grades the results so far and closes the exam in the caller's
    /// transaction. `None` when someone else closed or advanced it first.
    async fn close_in(
        &self,
        conn: &mut sqlx::SqliteConnection,
        chapter: &Chapter,
        student_id: i64,
        results: &[SectionResult],
        timed_out: bool,
        now: OffsetDateTime,
    ) -> Result<Option<(ExamGrade, EvaluationOutcome)>> {
        let score = final_score(chapter.sections(), results);
        let grade = self.progression.grading().grade(score);
        let closed = store::complete(
            conn,
            student_id,
            chapter.id,
            results.len() as i64,
            now,
            timed_out,
            grade.score,
            &grade.letter,
        )
        .await?;
        if !closed {
            return Ok(None);
        }
        let outcome = credit_evaluation_in(
            conn,
            &self.gamification,
            student_id,
            chapter,
            score.round() as i64,
            false,
            now,
        )
        .await?;
        info!(
            student_id,
            chapter_id = chapter.id,
            score,
            letter = %grade.letter,
            timed_out,
            "exam completed"
        );
        Ok(Some((grade, outcome)))
    }

    async fn close(
        &self,
        chapter: &Chapter,
        progress: &ExamProgress,
        timed_out: bool,
    ) -> Result<Option<(ExamGrade, EvaluationOutcome)>> {
        let mut tx = self.database.begin().await?;
        let closed = self
            .close_in(
                &mut tx,
                chapter,
                progress.student_id,
                &progress.results,
                timed_out,
                self.clock.now(),
            )
            .await?;
        tx.commit().await?;
        Ok(closed)
    }

    async fn after_completion(&self, student_id: i64, course_id: i64) {
        if let Err(e) = self.progression.course_status(student_id, course_id).await {
            warn!(student_id, course_id, "course status after exam failed: {e}");
        }
    }

    /// Forced submission when the timer runs out. The server decides whether
    /// time is really up; an early call returns the exam unchanged and a
    /// call after the grace period closes it without scoring the buffer. A
    /// repeated call while one is being handled is ignored. Never fails for
    /// scoring problems: the exam closes with the results it has.
    pub async fn handle_timeout(
        &self,
        student_id: i64,
        chapter_id: i64,
        content: &str,
    ) -> Result<ExamView> {
        let key = (student_id, chapter_id);
        if !self.handling_timeout.insert(key) {
            debug!(student_id, chapter_id, "timeout already being handled");
            return self.exam_view(student_id, chapter_id).await;
        }
        let _guard = TimeoutGuard {
            handling: &self.handling_timeout,
            key,
        };

        let (course, idx) = self.exam_chapter(chapter_id).await?;
        let chapter = &course.chapters[idx];
        let progress = self.load_started(student_id, chapter_id).await?;
        let now = self.clock.now();
        let tolerance = time::Duration::seconds(self.rules.timeout_early_tolerance_secs.max(0));
        if progress.is_complete() || !progress.expired(now, tolerance) {
            return self.exam_view(student_id, chapter_id).await;
        }
        if progress.claim_is_fresh(claim_token(now), self.stale_claim_ms) {
            // a regular submission of this section is being scored
            return self.exam_view(student_id, chapter_id).await;
        }

        let content = content.trim();
        if now > progress.deadline() + self.grace() {
            // the buffer arrived after the grace period and does not count
            debug!(student_id, chapter_id, "timeout arrived after the grace period");
            self.close(chapter, &progress, true).await?;
        } else if content.is_empty() || progress.all_sections_done() {
            self.close(chapter, &progress, true).await?;
        } else {
            match self.score_section(course.clone(), idx, progress, content, now).await {
                Ok(outcome) if outcome.is_complete => {}
                Ok(_) => {
                    let progress = self.load_started(student_id, chapter_id).await?;
                    self.close(chapter, &progress, true).await?;
                }
                Err(e) => {
                    warn!(student_id, chapter_id, "timeout submission not scored: {e}");
                    let progress = self.load_started(student_id, chapter_id).await?;
                    self.close(chapter, &progress, true).await?;
                }
            }
        }
        self.after_completion(student_id, course.id).await;
        self.exam_view(student_id, chapter_id).await
    }

    /// Stores the answer buffer of the open section without scoring it.
    /// Empty buffers are not saved.
    pub async fn save_draft(
        &self,
        student_id: i64,
        chapter_id: i64,
        index: i64,
        content: &str,
    ) -> Result<()> {
        if content.trim().is_empty() {
            return Ok(());
        }
        let progress = self.load_started(student_id, chapter_id).await?;
        progress.check_section(index)?;
        let mut conn = self.database.acquire().await?;
        store::save_draft(&mut conn, student_id, chapter_id, index, content, self.clock.now())
            .await?;
        Ok(())
    }

    /// `save_draft` for the periodic client autosave: failures are logged
    /// and never reach the learner.
    pub async fn autosave(&self, student_id: i64, chapter_id: i64, index: i64, content: &str) {
        if let Err(e) = self.save_draft(student_id, chapter_id, index, content).await {
            warn!(student_id, chapter_id, index, "autosave failed: {e}");
        }
    }
}
