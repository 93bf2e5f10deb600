use sqlx::SqliteConnection;
use time::OffsetDateTime;

use super::{ExamProgress, SectionResult};
use crate::error::Result;

#[derive(sqlx::FromRow)]
struct ExamRow {
    student_id: i64,
    chapter_id: i64,
    course_id: i64,
    started_at: OffsetDateTime,
    time_limit: i64,
    section_count: i64,
    current_section: i64,
    claimed_section: Option<i64>,
    claimed_at: Option<i64>,
    completed_at: Option<OffsetDateTime>,
    timed_out: bool,
    final_score: Option<f64>,
    grade: Option<String>,
}

impl ExamRow {
    fn into_progress(self, results: Vec<SectionResult>) -> ExamProgress {
        ExamProgress {
            student_id: self.student_id,
            chapter_id: self.chapter_id,
            course_id: self.course_id,
            started_at: self.started_at,
            time_limit: self.time_limit,
            section_count: self.section_count,
            current_section: self.current_section,
            claimed_section: self.claimed_section,
            claimed_at: self.claimed_at,
            completed_at: self.completed_at,
            timed_out: self.timed_out,
            final_score: self.final_score,
            grade: self.grade,
            results,
        }
    }
}

const COLUMNS: &str = "student_id, chapter_id, course_id, started_at, time_limit, section_count, current_section, claimed_section, claimed_at, completed_at, timed_out, final_score, grade";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Draft {
    pub section_index: i64,
    pub content: String,
    pub saved_at: OffsetDateTime,
}

pub async fn get(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
) -> Result<Option<ExamProgress>> {
    let Some(row) = sqlx::query_as::<_, ExamRow>(&format!(
        "select {COLUMNS} from exam_progress where student_id = ? and chapter_id = ?"
    ))
    .bind(student_id)
    .bind(chapter_id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };
    let results = sqlx::query_as::<_, SectionResult>(
        "select section_index, content, score, feedback, next_step, submitted_at from exam_section_result \
         where student_id = ? and chapter_id = ? order by section_index asc",
    )
    .bind(student_id)
    .bind(chapter_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(Some(row.into_progress(results)))
}

/// Exam rows of one course without their section results.
pub async fn list_for_course(
    conn: &mut SqliteConnection,
    student_id: i64,
    course_id: i64,
) -> Result<Vec<ExamProgress>> {
    let rows = sqlx::query_as::<_, ExamRow>(&format!(
        "select {COLUMNS} from exam_progress where student_id = ? and course_id = ?"
    ))
    .bind(student_id)
    .bind(course_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|row| row.into_progress(Vec::new())).collect())
}

pub async fn insert_if_absent(conn: &mut SqliteConnection, progress: &ExamProgress) -> Result<bool> {
    let inserted = sqlx::query(
        "insert into exam_progress (student_id, chapter_id, course_id, started_at, time_limit, section_count) \
         values (?, ?, ?, ?, ?, ?) on conflict (student_id, chapter_id) do nothing",
    )
    .bind(progress.student_id)
    .bind(progress.chapter_id)
    .bind(progress.course_id)
    .bind(progress.started_at)
    .bind(progress.time_limit)
    .bind(progress.section_count)
    .execute(&mut *conn)
    .await?;
    Ok(inserted.rows_affected() == 1)
}

/// Takes the scoring claim on `section`. `expected` is the claim being taken
/// over, `None` when the section is unclaimed.
pub async fn claim_section(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
    section: i64,
    expected: Option<i64>,
    token: i64,
) -> Result<bool> {
    let updated = sqlx::query(
        "update exam_progress set claimed_section = ?1, claimed_at = ?2 \
         where student_id = ?3 and chapter_id = ?4 and current_section = ?1 and completed_at is null and claimed_at is ?5",
    )
    .bind(section)
    .bind(token)
    .bind(student_id)
    .bind(chapter_id)
    .bind(expected)
    .execute(&mut *conn)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Advances `current_section` and stores the result, provided the claim is
/// still ours. Run inside a transaction.
pub async fn append_result(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
    token: i64,
    result: &SectionResult,
) -> Result<bool> {
    let advanced = sqlx::query(
        "update exam_progress set current_section = current_section + 1, claimed_section = null, claimed_at = null \
         where student_id = ? and chapter_id = ? and current_section = ? and claimed_at = ? and completed_at is null",
    )
    .bind(student_id)
    .bind(chapter_id)
    .bind(result.section_index)
    .bind(token)
    .execute(&mut *conn)
    .await?;
    if advanced.rows_affected() != 1 {
        return Ok(false);
    }
    sqlx::query(
        "insert into exam_section_result (student_id, chapter_id, section_index, content, score, feedback, next_step, submitted_at) \
         values (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(student_id)
    .bind(chapter_id)
    .bind(result.section_index)
    .bind(&result.content)
    .bind(result.score)
    .bind(&result.feedback)
    .bind(&result.next_step)
    .bind(result.submitted_at)
    .execute(&mut *conn)
    .await?;
    sqlx::query("delete from exam_draft where student_id = ? and chapter_id = ? and section_index = ?")
        .bind(student_id)
        .bind(chapter_id)
        .bind(result.section_index)
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

pub async fn release_section(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
    token: i64,
) -> Result<bool> {
    let updated = sqlx::query(
        "update exam_progress set claimed_section = null, claimed_at = null \
         where student_id = ? and chapter_id = ? and claimed_at = ?",
    )
    .bind(student_id)
    .bind(chapter_id)
    .bind(token)
    .execute(&mut *conn)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Closes the exam. `section_count_done` pins the results the grade was
/// computed from; a concurrent append makes this a no-op.
#[allow(clippy::too_many_arguments)]
pub async fn complete(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
    section_count_done: i64,
    now: OffsetDateTime,
    timed_out: bool,
    final_score: f64,
    grade: &str,
) -> Result<bool> {
    let updated = sqlx::query(
        "update exam_progress set completed_at = ?, timed_out = ?, final_score = ?, grade = ?, claimed_section = null, claimed_at = null \
         where student_id = ? and chapter_id = ? and current_section = ? and completed_at is null",
    )
    .bind(now)
    .bind(timed_out)
    .bind(final_score)
    .bind(grade)
    .bind(student_id)
    .bind(chapter_id)
    .bind(section_count_done)
    .execute(&mut *conn)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Upserts the draft of the open section; completed exams are left alone.
pub async fn save_draft(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
    section_index: i64,
    content: &str,
    now: OffsetDateTime,
) -> Result<bool> {
    let saved = sqlx::query(
        "insert into exam_draft (student_id, chapter_id, section_index, content, saved_at) \
         select ?1, ?2, ?3, ?4, ?5 from exam_progress \
         where student_id = ?1 and chapter_id = ?2 and current_section = ?3 and completed_at is null \
         on conflict (student_id, chapter_id, section_index) do update set content = excluded.content, saved_at = excluded.saved_at",
    )
    .bind(student_id)
    .bind(chapter_id)
    .bind(section_index)
    .bind(content)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(saved.rows_affected() == 1)
}

pub async fn get_draft(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
    section_index: i64,
) -> Result<Option<Draft>> {
    let draft = sqlx::query_as::<_, Draft>(
        "select section_index, content, saved_at from exam_draft where student_id = ? and chapter_id = ? and section_index = ?",
    )
    .bind(student_id)
    .bind(chapter_id)
    .bind(section_index)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(draft)
}
