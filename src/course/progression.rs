use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use super::{Chapter, Course, CourseMeta, catalog::Catalog};
use crate::{
    config::GradingConfig,
    error::{Error, Result},
    exam::{self, ExamProgress, grading::GradePolicy},
    gamification::economy::{promote_in, rank_in},
    progress::{self, ChapterProgress, ChapterStatus},
    utils::{Clock, seconds_until},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i64)]
pub enum CourseStatus {
    Active = 0,
    Completed = 1,
    /// The course period ran out; the learner is un-enrolled.
    Failed = 2,
}

impl TryFrom<i64> for CourseStatus {
    type Error = Error;
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(CourseStatus::Active),
            1 => Ok(CourseStatus::Completed),
            2 => Ok(CourseStatus::Failed),
            other => Err(Error::Fatal(anyhow::anyhow!(
                "unknown course status {other}"
            ))),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    student_id: i64,
    course_id: i64,
    enrolled_at: OffsetDateTime,
    status: i64,
    certifiable: bool,
    completed_at: Option<OffsetDateTime>,
    final_score: Option<f64>,
    final_grade: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Enrollment {
    pub student_id: i64,
    pub course_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub enrolled_at: OffsetDateTime,
    pub status: CourseStatus,
    /// Cleared by re-enrolling after the course period ran out.
    pub certifiable: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub final_score: Option<f64>,
    pub final_grade: Option<String>,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = Error;
    fn try_from(row: EnrollmentRow) -> Result<Self> {
        Ok(Enrollment {
            student_id: row.student_id,
            course_id: row.course_id,
            enrolled_at: row.enrolled_at,
            status: CourseStatus::try_from(row.status)?,
            certifiable: row.certifiable,
            completed_at: row.completed_at,
            final_score: row.final_score,
            final_grade: row.final_grade,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChapterAccess {
    Open,
    /// Visible with a countdown; submissions are refused until `available_at`.
    Waiting {
        #[serde(with = "time::serde::rfc3339")]
        available_at: OffsetDateTime,
        remaining_secs: i64,
    },
    /// The previous chapter is not done yet.
    Locked,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChapterView {
    pub id: i64,
    pub order_index: i64,
    pub title: String,
    pub media_url: Option<String>,
    pub is_final_exam: bool,
    pub status: ChapterStatus,
    pub access: ChapterAccess,
    pub lesson_watch_rate: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    pub remaining_secs: Option<i64>,
    pub late: bool,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CourseView {
    pub course: CourseMeta,
    pub enrollment: Enrollment,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub chapters: Vec<ChapterView>,
}

/// Everything a learner has stored for one course.
#[derive(Default)]
struct Snapshot {
    chapters: HashMap<i64, ChapterProgress>,
    exams: HashMap<i64, ExamProgress>,
}

impl Snapshot {
    async fn load(conn: &mut SqliteConnection, student_id: i64, course_id: i64) -> Result<Self> {
        let chapters = progress::store::list_for_course(conn, student_id, course_id)
            .await?
            .into_iter()
            .map(|p| (p.chapter_id, p))
            .collect();
        let exams = exam::store::list_for_course(conn, student_id, course_id)
            .await?
            .into_iter()
            .map(|p| (p.chapter_id, p))
            .collect();
        Ok(Self { chapters, exams })
    }

    fn accessed(&self, chapter_id: i64) -> bool {
        self.chapters.contains_key(&chapter_id) || self.exams.contains_key(&chapter_id)
    }

    /// When the chapter was submitted; late submissions count.
    fn done_at(&self, chapter: &Chapter) -> Option<OffsetDateTime> {
        if chapter.is_final_exam {
            self.exams.get(&chapter.id).and_then(|e| e.completed_at)
        } else {
            self.chapters.get(&chapter.id).and_then(|p| p.done_at())
        }
    }

    fn score(&self, chapter: &Chapter) -> Option<f64> {
        if chapter.is_final_exam {
            self.exams.get(&chapter.id).and_then(|e| e.final_score)
        } else {
            self.chapters
                .get(&chapter.id)
                .and_then(|p| p.submission.as_ref())
                .map(|s| s.score as f64)
        }
    }
}

/// Access to the chapter at `idx`: once touched it stays open; otherwise it
/// opens `wait_time` after the previous chapter was done (after enrolling,
/// for the first chapter).
fn access_at(
    course: &Course,
    idx: usize,
    enrolled_at: OffsetDateTime,
    snapshot: &Snapshot,
    now: OffsetDateTime,
) -> ChapterAccess {
    let chapter = &course.chapters[idx];
    if snapshot.accessed(chapter.id) {
        return ChapterAccess::Open;
    }
    let since = match idx {
        0 => Some(enrolled_at),
        _ => snapshot.done_at(&course.chapters[idx - 1]),
    };
    let Some(since) = since else {
        return ChapterAccess::Locked;
    };
    let available_at = since + chapter.wait();
    if now >= available_at {
        ChapterAccess::Open
    } else {
        ChapterAccess::Waiting {
            available_at,
            remaining_secs: seconds_until(now, available_at),
        }
    }
}

async fn load_enrollment(
    conn: &mut SqliteConnection,
    student_id: i64,
    course_id: i64,
) -> Result<Option<Enrollment>> {
    sqlx::query_as::<_, EnrollmentRow>(
        "select student_id, course_id, enrolled_at, status, certifiable, completed_at, final_score, final_grade \
         from enrollment where student_id = ? and course_id = ?",
    )
    .bind(student_id)
    .bind(course_id)
    .fetch_optional(&mut *conn)
    .await?
    .map(Enrollment::try_from)
    .transpose()
}

/// Course Progression Controller: enrolment, chapter unlocking and the
/// course-level terminal states.
#[derive(Clone)]
pub struct Progression {
    database: SqlitePool,
    catalog: Arc<Catalog>,
    grading: GradePolicy,
    clock: Arc<dyn Clock>,
}

impl Progression {
    pub fn new(
        database: SqlitePool,
        catalog: Arc<Catalog>,
        grading: GradingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            database,
            catalog,
            grading: GradePolicy::new(&grading),
            clock,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn grading(&self) -> &GradePolicy {
        &self.grading
    }

    pub async fn enroll(&self, student_id: i64, course_id: i64) -> Result<Enrollment> {
        let course = self.catalog.get_course(course_id).await?;
        let (rank, existing) = {
            let mut conn = self.database.acquire().await?;
            let rank = rank_in(&mut conn, student_id).await?;
            let existing = load_enrollment(&mut conn, student_id, course_id).await?;
            (rank, existing)
        };
        if rank.is_suspended() {
            return Err(Error::Forbidden("account is suspended".to_string()));
        }
        if !rank.satisfies(course.required_rank) {
            return Err(Error::Forbidden(format!(
                "course '{}' requires rank {}",
                course.slug, course.required_rank
            )));
        }
        let now = self.clock.now();
        match existing {
            None => {
                sqlx::query(
                    "insert into enrollment (student_id, course_id, enrolled_at) values (?, ?, ?) \
                     on conflict (student_id, course_id) do nothing",
                )
                .bind(student_id)
                .bind(course_id)
                .bind(now)
                .execute(&self.database)
                .await?;
                info!(student_id, course_id, "enrolled");
            }
            Some(_) => {
                if self.course_status(student_id, course_id).await?.status == CourseStatus::Failed {
                    sqlx::query(
                        "update enrollment set status = ?, enrolled_at = ?, certifiable = 0, completed_at = null, \
                         final_score = null, final_grade = null \
                         where student_id = ? and course_id = ? and status = ?",
                    )
                    .bind(CourseStatus::Active as i64)
                    .bind(now)
                    .bind(student_id)
                    .bind(course_id)
                    .bind(CourseStatus::Failed as i64)
                    .execute(&self.database)
                    .await?;
                    info!(student_id, course_id, "re-enrolled after expiry");
                }
            }
        }
        self.course_status(student_id, course_id).await
    }

    pub async fn enrollments(&self, student_id: i64) -> Result<Vec<Enrollment>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "select course_id from enrollment where student_id = ? order by enrolled_at asc",
        )
        .bind(student_id)
        .fetch_all(&self.database)
        .await?;
        let mut enrollments = Vec::with_capacity(ids.len());
        for course_id in ids {
            enrollments.push(self.course_status(student_id, course_id).await?);
        }
        Ok(enrollments)
    }

    /// Current course-level state. An active enrolment is settled here: it
    /// becomes `Completed` once every chapter is done within the course
    /// period, `Failed` once the period is over.
    pub async fn course_status(&self, student_id: i64, course_id: i64) -> Result<Enrollment> {
        let course = self.catalog.get_course(course_id).await?;
        let (enrollment, snapshot) = {
            let mut conn = self.database.acquire().await?;
            let enrollment = load_enrollment(&mut conn, student_id, course_id)
                .await?
                .ok_or_else(|| Error::Forbidden(format!("not enrolled in course {course_id}")))?;
            if enrollment.status != CourseStatus::Active {
                return Ok(enrollment);
            }
            let snapshot = Snapshot::load(&mut conn, student_id, course_id).await?;
            (enrollment, snapshot)
        };
        let now = self.clock.now();
        let expires_at = course.expires_at(enrollment.enrolled_at);
        let finished_at = course
            .chapters
            .iter()
            .map(|ch| snapshot.done_at(ch))
            .collect::<Option<Vec<_>>>()
            .and_then(|done| done.into_iter().max());
        match (finished_at, expires_at) {
            (Some(done), Some(expiry)) if done > expiry => {
                self.expire(&enrollment).await?;
            }
            (Some(done), _) => {
                self.complete(&course, &enrollment, &snapshot, done).await?;
            }
            (None, Some(expiry)) if now > expiry => {
                self.expire(&enrollment).await?;
            }
            _ => return Ok(enrollment),
        }
        let mut conn = self.database.acquire().await?;
        load_enrollment(&mut conn, student_id, course_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("enrollment in course {course_id}")))
    }

    async fn expire(&self, enrollment: &Enrollment) -> Result<()> {
        let updated = sqlx::query(
            "update enrollment set status = ? where student_id = ? and course_id = ? and status = ? and enrolled_at = ?",
        )
        .bind(CourseStatus::Failed as i64)
        .bind(enrollment.student_id)
        .bind(enrollment.course_id)
        .bind(CourseStatus::Active as i64)
        .bind(enrollment.enrolled_at)
        .execute(&self.database)
        .await?;
        if updated.rows_affected() == 1 {
            info!(
                student_id = enrollment.student_id,
                course_id = enrollment.course_id,
                "course period expired"
            );
        }
        Ok(())
    }

    async fn complete(
        &self,
        course: &Course,
        enrollment: &Enrollment,
        snapshot: &Snapshot,
        done: OffsetDateTime,
    ) -> Result<()> {
        let final_score = match course.final_exam() {
            Some(exam) => snapshot.score(exam).unwrap_or(0.0),
            None => {
                let scores: Vec<f64> = course
                    .chapters
                    .iter()
                    .filter_map(|ch| snapshot.score(ch))
                    .collect();
                if scores.is_empty() {
                    0.0
                } else {
                    (scores.iter().sum::<f64>() / scores.len() as f64 * 100.0).round() / 100.0
                }
            }
        };
        let grade = self.grading.letter(final_score).to_string();
        let mut tx = self.database.begin().await?;
        let updated = sqlx::query(
            "update enrollment set status = ?, completed_at = ?, final_score = ?, final_grade = ? \
             where student_id = ? and course_id = ? and status = ? and enrolled_at = ?",
        )
        .bind(CourseStatus::Completed as i64)
        .bind(done)
        .bind(final_score)
        .bind(&grade)
        .bind(enrollment.student_id)
        .bind(enrollment.course_id)
        .bind(CourseStatus::Active as i64)
        .bind(enrollment.enrolled_at)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Ok(());
        }
        let promoted = match course.grants_rank {
            Some(target) if enrollment.certifiable => {
                promote_in(&mut tx, enrollment.student_id, target).await?
            }
            _ => None,
        };
        tx.commit().await?;
        info!(
            student_id = enrollment.student_id,
            course_id = course.id,
            final_score,
            %grade,
            ?promoted,
            "course completed"
        );
        Ok(())
    }

    /// Fails unless the learner may work on the chapter at `idx` right now.
    pub async fn ensure_open(&self, student_id: i64, course: &Course, idx: usize) -> Result<Enrollment> {
        let rank = {
            let mut conn = self.database.acquire().await?;
            rank_in(&mut conn, student_id).await?
        };
        if rank.is_suspended() {
            return Err(Error::Forbidden("account is suspended".to_string()));
        }
        let enrollment = self.course_status(student_id, course.id).await?;
        if enrollment.status == CourseStatus::Failed {
            return Err(Error::Forbidden(
                "course period is over, enroll again to continue".to_string(),
            ));
        }
        let snapshot = {
            let mut conn = self.database.acquire().await?;
            Snapshot::load(&mut conn, student_id, course.id).await?
        };
        match access_at(course, idx, enrollment.enrolled_at, &snapshot, self.clock.now()) {
            ChapterAccess::Open => Ok(enrollment),
            ChapterAccess::Waiting { available_at, .. } => Err(Error::ChapterLocked {
                available_at: Some(available_at),
            }),
            ChapterAccess::Locked => Err(Error::ChapterLocked { available_at: None }),
        }
    }

    /// The chapter after the last one the learner opened, if it may be opened
    /// now. `Ok(None)` once there is nothing left to unlock.
    pub async fn unlock_next(&self, student_id: i64, course_id: i64) -> Result<Option<i64>> {
        let course = self.catalog.get_course(course_id).await?;
        let enrollment = self.course_status(student_id, course_id).await?;
        if enrollment.status == CourseStatus::Failed {
            return Err(Error::Forbidden(
                "course period is over, enroll again to continue".to_string(),
            ));
        }
        let snapshot = {
            let mut conn = self.database.acquire().await?;
            Snapshot::load(&mut conn, student_id, course_id).await?
        };
        let next = course
            .chapters
            .iter()
            .rposition(|ch| snapshot.accessed(ch.id))
            .map_or(0, |current| current + 1);
        if next >= course.chapters.len() {
            return Ok(None);
        }
        match access_at(&course, next, enrollment.enrolled_at, &snapshot, self.clock.now()) {
            ChapterAccess::Open => Ok(Some(course.chapters[next].id)),
            ChapterAccess::Waiting { available_at, .. } => Err(Error::ChapterLocked {
                available_at: Some(available_at),
            }),
            ChapterAccess::Locked => Err(Error::ChapterLocked { available_at: None }),
        }
    }

    pub async fn course_view(&self, student_id: i64, course_id: i64) -> Result<CourseView> {
        let course = self.catalog.get_course(course_id).await?;
        let enrollment = self.course_status(student_id, course_id).await?;
        let snapshot = {
            let mut conn = self.database.acquire().await?;
            Snapshot::load(&mut conn, student_id, course_id).await?
        };
        let now = self.clock.now();
        let mut chapters = Vec::with_capacity(course.chapters.len());
        for (idx, chapter) in course.chapters.iter().enumerate() {
            let access = access_at(&course, idx, enrollment.enrolled_at, &snapshot, now);
            chapters.push(chapter_view(chapter, access, &snapshot, now)?);
        }
        Ok(CourseView {
            course: CourseMeta::from(course.as_ref()),
            expires_at: course.expires_at(enrollment.enrolled_at),
            enrollment,
            chapters,
        })
    }

    /// Deletes every trace of the learner in one course: chapter and exam
    /// progress, section results, drafts and the enrolment itself.
    pub async fn format_course(&self, student_id: i64, course_id: i64) -> Result<()> {
        let mut tx = self.database.begin().await?;
        sqlx::query(
            "delete from exam_draft where student_id = ? and chapter_id in (select id from chapter where course_id = ?)",
        )
        .bind(student_id)
        .bind(course_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "delete from exam_section_result where student_id = ? and chapter_id in (select id from chapter where course_id = ?)",
        )
        .bind(student_id)
        .bind(course_id)
        .execute(&mut *tx)
        .await?;
        for table in ["exam_progress", "chapter_progress", "enrollment"] {
            sqlx::query(&format!(
                "delete from {table} where student_id = ? and course_id = ?"
            ))
            .bind(student_id)
            .bind(course_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(student_id, course_id, "course formatted");
        Ok(())
    }
}

fn chapter_view(
    chapter: &Chapter,
    access: ChapterAccess,
    snapshot: &Snapshot,
    now: OffsetDateTime,
) -> Result<ChapterView> {
    let mut view = ChapterView {
        id: chapter.id,
        order_index: chapter.order_index,
        title: chapter.title.clone(),
        media_url: chapter.media_url.clone(),
        is_final_exam: chapter.is_final_exam,
        status: ChapterStatus::NotStarted,
        access,
        lesson_watch_rate: 0.0,
        deadline: None,
        remaining_secs: None,
        late: false,
        score: snapshot.score(chapter),
    };
    if chapter.is_final_exam {
        if let Some(exam) = snapshot.exams.get(&chapter.id) {
            view.status = if exam.is_complete() {
                ChapterStatus::Completed
            } else {
                ChapterStatus::TaskInProgress
            };
            view.deadline = Some(exam.deadline());
            view.remaining_secs = (!exam.is_complete()).then(|| exam.remaining_secs(now));
            view.late = exam.timed_out;
        }
    } else if let Some(stored) = snapshot.chapters.get(&chapter.id) {
        // derived view only; the deadline is persisted by the next write
        let mut progress = stored.clone();
        progress.refresh_deadline(chapter, now)?;
        view.status = progress.status;
        view.lesson_watch_rate = progress.lesson_watch_rate;
        view.deadline = progress.time_out_at(chapter);
        view.remaining_secs = match (view.deadline, &progress.submission) {
            (Some(deadline), None) => Some(seconds_until(now, deadline)),
            _ => None,
        };
        view.late = progress.late;
    }
    Ok(view)
}
