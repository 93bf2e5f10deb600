use sqlx::SqliteConnection;
use time::OffsetDateTime;

use super::{ChapterProgress, ChapterStatus, Submission};
use crate::error::Result;

#[derive(sqlx::FromRow)]
struct ProgressRow {
    student_id: i64,
    chapter_id: i64,
    course_id: i64,
    status: i64,
    lesson_watch_rate: f64,
    last_position: f64,
    started_at: OffsetDateTime,
    late: bool,
    claimed_at: Option<i64>,
    content: Option<String>,
    score: Option<i64>,
    feedback: Option<String>,
    next_step: Option<String>,
    submitted_at: Option<OffsetDateTime>,
    update_time: OffsetDateTime,
}

impl TryFrom<ProgressRow> for ChapterProgress {
    type Error = crate::Error;
    fn try_from(row: ProgressRow) -> Result<Self> {
        let submission = match (row.content, row.score, row.submitted_at) {
            (Some(content), Some(score), Some(submitted_at)) => Some(Submission {
                content,
                score,
                feedback: row.feedback.unwrap_or_default(),
                next_step: row.next_step.unwrap_or_default(),
                submitted_at,
                late: row.late,
            }),
            _ => None,
        };
        Ok(ChapterProgress {
            student_id: row.student_id,
            chapter_id: row.chapter_id,
            course_id: row.course_id,
            status: ChapterStatus::try_from(row.status)?,
            lesson_watch_rate: row.lesson_watch_rate,
            last_position: row.last_position,
            started_at: row.started_at,
            late: row.late,
            claimed_at: row.claimed_at,
            submission,
            update_time: row.update_time,
        })
    }
}

const COLUMNS: &str = "student_id, chapter_id, course_id, status, lesson_watch_rate, last_position, started_at, late, claimed_at, content, score, feedback, next_step, submitted_at, update_time";

pub async fn get(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
) -> Result<Option<ChapterProgress>> {
    let row = sqlx::query_as::<_, ProgressRow>(&format!(
        "select {COLUMNS} from chapter_progress where student_id = ? and chapter_id = ?"
    ))
    .bind(student_id)
    .bind(chapter_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(ChapterProgress::try_from).transpose()
}

pub async fn list_for_course(
    conn: &mut SqliteConnection,
    student_id: i64,
    course_id: i64,
) -> Result<Vec<ChapterProgress>> {
    sqlx::query_as::<_, ProgressRow>(&format!(
        "select {COLUMNS} from chapter_progress where student_id = ? and course_id = ?"
    ))
    .bind(student_id)
    .bind(course_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(ChapterProgress::try_from)
    .collect()
}

/// Creates the row on first access. Returns false when it already existed;
/// `started_at` of an existing row is never touched.
pub async fn insert_if_absent(conn: &mut SqliteConnection, progress: &ChapterProgress) -> Result<bool> {
    let inserted = sqlx::query(
        "insert into chapter_progress (student_id, chapter_id, course_id, status, lesson_watch_rate, last_position, started_at, late, update_time) \
         values (?, ?, ?, ?, ?, ?, ?, ?, ?) on conflict (student_id, chapter_id) do nothing",
    )
    .bind(progress.student_id)
    .bind(progress.chapter_id)
    .bind(progress.course_id)
    .bind(progress.status as i64)
    .bind(progress.lesson_watch_rate)
    .bind(progress.last_position)
    .bind(progress.started_at)
    .bind(progress.late)
    .bind(progress.update_time)
    .execute(&mut *conn)
    .await?;
    Ok(inserted.rows_affected() == 1)
}

/// Compare-and-swap on `(status, claimed_at)`. The watch rate is merged with
/// `max` in SQL so a lost race can never lower it. Submissions are written
/// only through [`finish`].
pub async fn update_guarded(
    conn: &mut SqliteConnection,
    progress: &ChapterProgress,
    expected_status: ChapterStatus,
    expected_claim: Option<i64>,
) -> Result<bool> {
    let updated = sqlx::query(
        "update chapter_progress set status = ?, lesson_watch_rate = max(lesson_watch_rate, ?), last_position = ?, \
         late = ?, claimed_at = ?, update_time = ? \
         where student_id = ? and chapter_id = ? and status = ? and claimed_at is ? and score is null",
    )
    .bind(progress.status as i64)
    .bind(progress.lesson_watch_rate)
    .bind(progress.last_position)
    .bind(progress.late)
    .bind(progress.claimed_at)
    .bind(progress.update_time)
    .bind(progress.student_id)
    .bind(progress.chapter_id)
    .bind(expected_status as i64)
    .bind(expected_claim)
    .execute(&mut *conn)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Media ticks on an already scored chapter only move the playhead.
pub async fn update_playback(
    conn: &mut SqliteConnection,
    progress: &ChapterProgress,
) -> Result<()> {
    sqlx::query(
        "update chapter_progress set lesson_watch_rate = max(lesson_watch_rate, ?), last_position = ?, update_time = ? \
         where student_id = ? and chapter_id = ?",
    )
    .bind(progress.lesson_watch_rate)
    .bind(progress.last_position)
    .bind(progress.update_time)
    .bind(progress.student_id)
    .bind(progress.chapter_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Stores the scored submission if, and only if, the caller still holds the
/// claim `token` and nothing was stored before. The final status comes from
/// the row's `late` flag as it is at write time. Returns the stored `late`.
pub async fn finish(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
    token: i64,
    submission: &Submission,
) -> Result<Option<bool>> {
    let late = sqlx::query_scalar::<_, bool>(
        "update chapter_progress set status = case when late = 1 then ?1 else ?2 end, \
         content = ?3, score = ?4, feedback = ?5, next_step = ?6, submitted_at = ?7, claimed_at = null, update_time = ?7 \
         where student_id = ?8 and chapter_id = ?9 and status = ?10 and claimed_at = ?11 and score is null \
         returning late",
    )
    .bind(ChapterStatus::Failed as i64)
    .bind(ChapterStatus::Completed as i64)
    .bind(&submission.content)
    .bind(submission.score)
    .bind(&submission.feedback)
    .bind(&submission.next_step)
    .bind(submission.submitted_at)
    .bind(student_id)
    .bind(chapter_id)
    .bind(ChapterStatus::TaskInProgress as i64)
    .bind(token)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(late)
}

/// Drops the claim after a failed scoring attempt.
pub async fn release(
    conn: &mut SqliteConnection,
    student_id: i64,
    chapter_id: i64,
    token: i64,
    now: OffsetDateTime,
) -> Result<bool> {
    let updated = sqlx::query(
        "update chapter_progress set status = case when late = 1 then ?1 else ?2 end, claimed_at = null, update_time = ?3 \
         where student_id = ?4 and chapter_id = ?5 and status = ?6 and claimed_at = ?7 and score is null",
    )
    .bind(ChapterStatus::Failed as i64)
    .bind(ChapterStatus::LessonCompleted as i64)
    .bind(now)
    .bind(student_id)
    .bind(chapter_id)
    .bind(ChapterStatus::TaskInProgress as i64)
    .bind(token)
    .execute(&mut *conn)
    .await?;
    Ok(updated.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ProgressionConfig, progress::Claim, testing};

    #[tokio::test]
    async fn cas_rejects_stale_expectation() {
        let fx = testing::Fixture::new().await;
        let course = fx.catalog.get_course(fx.course_id).await.unwrap();
        let chapter = &course.chapters[0];
        let mut conn = fx.database.acquire().await.unwrap();
        let mut progress = ChapterProgress::first_access(fx.student, chapter, testing::T0);
        assert!(insert_if_absent(&mut conn, &progress).await.unwrap());
        assert!(!insert_if_absent(&mut conn, &progress).await.unwrap());

        let config = ProgressionConfig::default();
        progress.record_media(0.0, 100.0, &config, testing::T0).unwrap();
        let before = ChapterStatus::LessonInProgress;
        assert!(update_guarded(&mut conn, &progress, before, None).await.unwrap());
        // a second writer that read the same old state loses
        assert!(!update_guarded(&mut conn, &progress, before, None).await.unwrap());

        let expected = progress.status;
        let Claim::Taken(token) = progress.claim(&config, testing::T0, 60_000).unwrap() else {
            panic!("expected claim");
        };
        assert!(update_guarded(&mut conn, &progress, expected, None).await.unwrap());
        let submission = Submission {
            content: "answer".into(),
            score: 90,
            feedback: "fine".into(),
            next_step: "go on".into(),
            submitted_at: testing::T0,
            late: false,
        };
        assert_eq!(
            finish(&mut conn, fx.student, chapter.id, token + 1, &submission).await.unwrap(),
            None
        );
        assert_eq!(
            finish(&mut conn, fx.student, chapter.id, token, &submission).await.unwrap(),
            Some(false)
        );
        assert_eq!(
            finish(&mut conn, fx.student, chapter.id, token, &submission).await.unwrap(),
            None
        );
        let stored = get(&mut conn, fx.student, chapter.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChapterStatus::Completed);
        assert_eq!(stored.submission.unwrap().score, 90);
        assert_eq!(stored.started_at, testing::T0);
    }
}
