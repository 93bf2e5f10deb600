pub mod catalog;
pub mod progression;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

use crate::{gamification::Rank, oracle::Rubric};

/// One graded part of the final exam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExamSection {
    pub title: String,
    #[serde(default)]
    pub materials: String,
    pub task: String,
    pub evaluation_criteria: String,
    #[serde(default = "default_max_points")]
    pub max_points: i64,
}

fn default_max_points() -> i64 {
    100
}

impl ExamSection {
    pub fn rubric(&self) -> Rubric {
        Rubric {
            system_message: self.evaluation_criteria.clone(),
            reference_text: self.materials.clone(),
            task: self.task.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExamSettings {
    pub sections: Vec<ExamSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Chapter {
    pub id: i64,
    pub course_id: i64,
    pub order_index: i64,
    pub title: String,
    pub media_url: Option<String>,
    /// Minutes for lesson and task together, `0` for no limit.
    pub time_limit: i64,
    /// Minutes between finishing the previous chapter (or enrolling, for the
    /// first chapter) and this chapter opening.
    pub wait_time: i64,
    pub is_final_exam: bool,
    pub reward_exp: i64,
    pub reward_gems: i64,
    pub task: Option<Rubric>,
    pub exam_settings: Option<ExamSettings>,
}

impl Chapter {
    pub fn time_limit(&self) -> Option<Duration> {
        (self.time_limit > 0).then(|| Duration::minutes(self.time_limit))
    }

    pub fn deadline_from(&self, started_at: OffsetDateTime) -> Option<OffsetDateTime> {
        self.time_limit().map(|limit| started_at + limit)
    }

    pub fn wait(&self) -> Duration {
        Duration::minutes(self.wait_time.max(0))
    }

    pub fn sections(&self) -> &[ExamSection] {
        self.exam_settings
            .as_ref()
            .map(|settings| settings.sections.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Course {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub time_limit_days: Option<i64>,
    pub required_rank: Rank,
    pub grants_rank: Option<Rank>,
    /// Sorted by `order_index`.
    pub chapters: Vec<Chapter>,
}

impl Course {
    pub fn chapter(&self, chapter_id: i64) -> Option<(usize, &Chapter)> {
        self.chapters
            .iter()
            .enumerate()
            .find(|(_, ch)| ch.id == chapter_id)
    }

    pub fn expires_at(&self, enrolled_at: OffsetDateTime) -> Option<OffsetDateTime> {
        self.time_limit_days
            .filter(|days| *days > 0)
            .map(|days| enrolled_at + Duration::days(days))
    }

    pub fn final_exam(&self) -> Option<&Chapter> {
        self.chapters.iter().find(|ch| ch.is_final_exam)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CourseMeta {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub required_rank: Rank,
    pub chapter_count: usize,
}

impl From<&Course> for CourseMeta {
    fn from(course: &Course) -> Self {
        Self {
            id: course.id,
            slug: course.slug.clone(),
            title: course.title.clone(),
            description: course.description.clone(),
            required_rank: course.required_rank,
            chapter_count: course.chapters.len(),
        }
    }
}

/// Admin-authored course file.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CourseManifest {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub time_limit_days: Option<i64>,
    #[serde(default = "default_required_rank")]
    pub required_rank: Rank,
    #[serde(default)]
    pub grants_rank: Option<Rank>,
    pub chapters: Vec<ChapterManifest>,
}

fn default_required_rank() -> Rank {
    Rank::Trial
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChapterManifest {
    pub title: String,
    /// Defaults to the chapter's 1-based position in the file.
    #[serde(default)]
    pub order_index: Option<i64>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub time_limit: i64,
    #[serde(default)]
    pub wait_time: i64,
    #[serde(default)]
    pub is_final_exam: bool,
    #[serde(default)]
    pub reward_exp: i64,
    #[serde(default)]
    pub reward_gems: i64,
    #[serde(default)]
    pub task: Option<Rubric>,
    #[serde(default)]
    pub exam: Option<ExamSettings>,
}

impl CourseManifest {
    pub fn parse(content: &str) -> crate::Result<Self> {
        let manifest: CourseManifest = toml::from_str(content)
            .map_err(|e| crate::Error::validation(format!("invalid course manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;
        if self.slug.trim().is_empty() {
            return Err(Error::validation("course slug is empty"));
        }
        if self.chapters.is_empty() {
            return Err(Error::validation("course has no chapters"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for (i, ch) in self.chapters.iter().enumerate() {
            let order = ch.order_index.unwrap_or(i as i64 + 1);
            if !seen.insert(order) {
                return Err(Error::validation(format!(
                    "duplicate order_index {order} in chapter '{}'",
                    ch.title
                )));
            }
            if ch.time_limit < 0 || ch.wait_time < 0 {
                return Err(Error::validation(format!(
                    "negative time in chapter '{}'",
                    ch.title
                )));
            }
            if ch.is_final_exam {
                let sections = ch.exam.as_ref().map(|e| e.sections.len()).unwrap_or(0);
                if sections == 0 {
                    return Err(Error::validation(format!(
                        "final exam '{}' has no sections",
                        ch.title
                    )));
                }
                if ch.time_limit == 0 {
                    return Err(Error::validation(format!(
                        "final exam '{}' needs a time limit",
                        ch.title
                    )));
                }
                if ch
                    .exam
                    .iter()
                    .flat_map(|e| &e.sections)
                    .any(|s| s.max_points <= 0)
                {
                    return Err(Error::validation(format!(
                        "final exam '{}' has a section without points",
                        ch.title
                    )));
                }
            } else if ch.task.is_none() {
                return Err(Error::validation(format!(
                    "chapter '{}' has no task",
                    ch.title
                )));
            }
        }
        if self.chapters.iter().filter(|ch| ch.is_final_exam).count() > 1 {
            return Err(Error::validation("course has more than one final exam"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FIXTURE_COURSE;

    #[test]
    fn fixture_manifest_parses() {
        let manifest = CourseManifest::parse(FIXTURE_COURSE).unwrap();
        assert_eq!(manifest.slug, "rust-dojo");
        assert_eq!(manifest.required_rank, Rank::Trial);
        assert_eq!(manifest.grants_rank, Some(Rank::Shoden));
        assert_eq!(manifest.chapters.len(), 3);
        let exam = manifest.chapters[2].exam.as_ref().unwrap();
        assert_eq!(exam.sections.len(), 3);
    }

    #[test]
    fn exam_without_sections_is_rejected() {
        let err = CourseManifest::parse(
            r#"
            slug = "broken"
            title = "Broken"
            [[chapters]]
            title = "Final"
            is_final_exam = true
            time_limit = 30
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)));
    }

    #[test]
    fn duplicate_order_is_rejected() {
        let err = CourseManifest::parse(
            r#"
            slug = "dup"
            title = "Dup"
            [[chapters]]
            title = "A"
            order_index = 1
            task = { system_message = "s", task = "t" }
            [[chapters]]
            title = "B"
            order_index = 1
            task = { system_message = "s", task = "t" }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate order_index"));
    }
}
