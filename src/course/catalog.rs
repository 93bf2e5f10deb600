use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use moka::future::Cache;
use sqlx::SqlitePool;
use tracing::{error, info};

use super::{Chapter, Course, CourseManifest, CourseMeta, ExamSettings};
use crate::{
    error::{Error, Result},
    gamification::Rank,
    oracle::Rubric,
};

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: i64,
    slug: String,
    title: String,
    description: Option<String>,
    time_limit_days: Option<i64>,
    required_rank: i64,
    grants_rank: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct ChapterRow {
    id: i64,
    course_id: i64,
    order_index: i64,
    title: String,
    media_url: Option<String>,
    time_limit: i64,
    wait_time: i64,
    is_final_exam: bool,
    reward_exp: i64,
    reward_gems: i64,
    task: Option<String>,
    exam_settings: Option<String>,
}

impl TryFrom<ChapterRow> for Chapter {
    type Error = Error;
    fn try_from(row: ChapterRow) -> Result<Self> {
        let task = row
            .task
            .map(|task| serde_json::from_str::<Rubric>(&task))
            .transpose()
            .map_err(|e| Error::Fatal(e.into()))?;
        let exam_settings = row
            .exam_settings
            .map(|settings| serde_json::from_str::<ExamSettings>(&settings))
            .transpose()
            .map_err(|e| Error::Fatal(e.into()))?;
        Ok(Chapter {
            id: row.id,
            course_id: row.course_id,
            order_index: row.order_index,
            title: row.title,
            media_url: row.media_url,
            time_limit: row.time_limit,
            wait_time: row.wait_time,
            is_final_exam: row.is_final_exam,
            reward_exp: row.reward_exp,
            reward_gems: row.reward_gems,
            task,
            exam_settings,
        })
    }
}

/// Read-mostly view of the admin-authored course configuration.
pub struct Catalog {
    database: SqlitePool,
    courses: Cache<i64, Arc<Course>>,
}

impl Catalog {
    pub fn new(database: SqlitePool) -> Self {
        Self {
            database,
            courses: Cache::builder()
                .max_capacity(256)
                .time_to_live(Duration::from_secs(600))
                .build(),
        }
    }

    pub async fn get_course(&self, course_id: i64) -> Result<Arc<Course>> {
        self.courses
            .try_get_with(course_id, self.load_course(course_id))
            .await
            .map_err(|e| match e.as_ref() {
                Error::NotFound(what) => Error::NotFound(what.clone()),
                other => Error::Fatal(anyhow::anyhow!("load course {course_id}: {other}")),
            })
    }

    /// Returns the course owning `chapter_id` and the chapter's position in it.
    pub async fn get_chapter(&self, chapter_id: i64) -> Result<(Arc<Course>, usize)> {
        let course_id = sqlx::query_scalar::<_, i64>("select course_id from chapter where id = ?")
            .bind(chapter_id)
            .fetch_optional(&self.database)
            .await?
            .ok_or_else(|| Error::NotFound(format!("chapter {chapter_id}")))?;
        let course = self.get_course(course_id).await?;
        let (idx, _) = course
            .chapter(chapter_id)
            .ok_or_else(|| Error::NotFound(format!("chapter {chapter_id}")))?;
        Ok((course, idx))
    }

    pub async fn list_courses(&self) -> Result<Vec<CourseMeta>> {
        let ids = sqlx::query_scalar::<_, i64>("select id from course order by id asc")
            .fetch_all(&self.database)
            .await?;
        let mut courses = Vec::with_capacity(ids.len());
        for id in ids {
            courses.push(CourseMeta::from(self.get_course(id).await?.as_ref()));
        }
        Ok(courses)
    }

    async fn load_course(&self, course_id: i64) -> Result<Arc<Course>> {
        let row = sqlx::query_as::<_, CourseRow>(
            "select id, slug, title, description, time_limit_days, required_rank, grants_rank from course where id = ?",
        )
        .bind(course_id)
        .fetch_optional(&self.database)
        .await?
        .ok_or_else(|| Error::NotFound(format!("course {course_id}")))?;
        let chapters = sqlx::query_as::<_, ChapterRow>(
            "select id, course_id, order_index, title, media_url, time_limit, wait_time, is_final_exam, reward_exp, reward_gems, task, exam_settings from chapter where course_id = ? order by order_index asc",
        )
        .bind(course_id)
        .fetch_all(&self.database)
        .await?
        .into_iter()
        .map(Chapter::try_from)
        .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(Course {
            id: row.id,
            slug: row.slug,
            title: row.title,
            description: row.description,
            time_limit_days: row.time_limit_days,
            required_rank: Rank::try_from(row.required_rank)?,
            grants_rank: row.grants_rank.map(Rank::try_from).transpose()?,
            chapters,
        }))
    }

    /// Stores a manifest. With `replace`, an existing course with the same slug
    /// is updated in place: chapters are matched by `order_index` so learner
    /// progress on kept chapters survives, chapters missing from the manifest
    /// are removed.
    pub async fn import(&self, manifest: &CourseManifest, replace: bool) -> Result<i64> {
        manifest.validate()?;
        let mut tx = self.database.begin().await?;
        let existing = sqlx::query_scalar::<_, i64>("select id from course where slug = ?")
            .bind(&manifest.slug)
            .fetch_optional(&mut *tx)
            .await?;
        let required_rank = manifest.required_rank as i64;
        let grants_rank = manifest.grants_rank.map(|rank| rank as i64);
        let course_id = match existing {
            Some(_) if !replace => {
                return Err(Error::validation(format!(
                    "course '{}' already exists",
                    manifest.slug
                )));
            }
            Some(id) => {
                sqlx::query(
                    "update course set title = ?, description = ?, time_limit_days = ?, required_rank = ?, grants_rank = ? where id = ?",
                )
                .bind(&manifest.title)
                .bind(&manifest.description)
                .bind(manifest.time_limit_days)
                .bind(required_rank)
                .bind(grants_rank)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => sqlx::query(
                "insert into course (slug, title, description, time_limit_days, required_rank, grants_rank) values (?, ?, ?, ?, ?, ?)",
            )
            .bind(&manifest.slug)
            .bind(&manifest.title)
            .bind(&manifest.description)
            .bind(manifest.time_limit_days)
            .bind(required_rank)
            .bind(grants_rank)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid(),
        };

        let mut kept = Vec::with_capacity(manifest.chapters.len());
        for (i, ch) in manifest.chapters.iter().enumerate() {
            let order_index = ch.order_index.unwrap_or(i as i64 + 1);
            kept.push(order_index);
            let task = ch
                .task
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| Error::Fatal(e.into()))?;
            let exam = ch
                .exam
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| Error::Fatal(e.into()))?;
            sqlx::query(
                "insert into chapter (course_id, order_index, title, media_url, time_limit, wait_time, is_final_exam, reward_exp, reward_gems, task, exam_settings) \
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 on conflict (course_id, order_index) do update set \
                 title = excluded.title, media_url = excluded.media_url, time_limit = excluded.time_limit, \
                 wait_time = excluded.wait_time, is_final_exam = excluded.is_final_exam, \
                 reward_exp = excluded.reward_exp, reward_gems = excluded.reward_gems, \
                 task = excluded.task, exam_settings = excluded.exam_settings",
            )
            .bind(course_id)
            .bind(order_index)
            .bind(&ch.title)
            .bind(&ch.media_url)
            .bind(ch.time_limit)
            .bind(ch.wait_time)
            .bind(ch.is_final_exam)
            .bind(ch.reward_exp)
            .bind(ch.reward_gems)
            .bind(task)
            .bind(exam)
            .execute(&mut *tx)
            .await?;
        }
        let stored = sqlx::query_scalar::<_, i64>("select order_index from chapter where course_id = ?")
            .bind(course_id)
            .fetch_all(&mut *tx)
            .await?;
        for order_index in stored.into_iter().filter(|o| !kept.contains(o)) {
            sqlx::query("delete from chapter where course_id = ? and order_index = ?")
                .bind(course_id)
                .bind(order_index)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.courses.invalidate(&course_id).await;
        info!("import course {}-{} success", course_id, manifest.slug);
        Ok(course_id)
    }

    pub async fn import_file(&self, path: impl AsRef<Path>, replace: bool) -> Result<i64> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::validation(format!("read {}: {e}", path.display())))?;
        let manifest = CourseManifest::parse(&content)?;
        self.import(&manifest, replace).await
    }

    /// Imports every `*.toml` manifest below `dir`; failures are logged and skipped.
    pub async fn import_dir(&self, dir: impl AsRef<Path>, replace: bool) -> Vec<i64> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in walkdir::WalkDir::new(dir.as_ref()) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!("walkdir error: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "toml")
            {
                paths.push(entry.path().to_path_buf());
            }
        }
        paths.sort();
        let mut ids = Vec::new();
        for path in paths {
            match self.import_file(&path, replace).await {
                Ok(id) => ids.push(id),
                Err(e) => error!("import course {} failed: {}", path.display(), e),
            }
        }
        ids
    }

    pub async fn remove_course(&self, course_id: i64) -> Result<()> {
        let deleted = sqlx::query("delete from course where id = ?")
            .bind(course_id)
            .execute(&self.database)
            .await?;
        self.courses.invalidate(&course_id).await;
        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound(format!("course {course_id}")));
        }
        info!("course {} removed", course_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FIXTURE_COURSE};

    #[tokio::test]
    async fn import_then_lookup_by_chapter() {
        let fx = testing::Fixture::new().await;
        let course = fx.catalog.get_course(fx.course_id).await.unwrap();
        assert_eq!(course.chapters.len(), 3);
        assert!(course.chapters.windows(2).all(|w| w[0].order_index < w[1].order_index));
        let (found, idx) = fx.catalog.get_chapter(fx.chapters[1]).await.unwrap();
        assert_eq!(found.id, fx.course_id);
        assert_eq!(idx, 1);
        assert_eq!(course.final_exam().unwrap().sections().len(), 3);
    }

    #[tokio::test]
    async fn reimport_requires_replace_and_keeps_chapter_ids() {
        let fx = testing::Fixture::new().await;
        let mut manifest = CourseManifest::parse(FIXTURE_COURSE).unwrap();
        assert!(matches!(
            fx.catalog.import(&manifest, false).await,
            Err(Error::Validation(_))
        ));
        manifest.title = "Rust Dojo, second edition".to_string();
        let id = fx.catalog.import(&manifest, true).await.unwrap();
        assert_eq!(id, fx.course_id);
        let course = fx.catalog.get_course(id).await.unwrap();
        assert_eq!(course.title, "Rust Dojo, second edition");
        assert_eq!(course.chapters[0].id, fx.chapters[0]);
    }

    #[tokio::test]
    async fn unknown_chapter_is_not_found() {
        let fx = testing::Fixture::new().await;
        assert!(matches!(
            fx.catalog.get_chapter(9999).await,
            Err(Error::NotFound(_))
        ));
    }
}
