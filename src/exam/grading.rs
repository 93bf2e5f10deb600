use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::SectionResult;
use crate::{config::GradingConfig, course::ExamSection};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub letter: String,
    /// Lowest score (inclusive) that earns this letter.
    pub min: f64,
}

impl GradeBand {
    pub fn new(letter: impl Into<String>, min: f64) -> Self {
        Self {
            letter: letter.into(),
            min,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExamGrade {
    pub score: f64,
    pub letter: String,
}

/// Maps a 0-100 score onto the letter ladder.
#[derive(Debug, Clone)]
pub struct GradePolicy {
    bands: Vec<GradeBand>,
    failing_letter: String,
}

impl GradePolicy {
    pub fn new(config: &GradingConfig) -> Self {
        let mut bands = config.bands.clone();
        bands.sort_by(|a, b| b.min.total_cmp(&a.min));
        Self {
            bands,
            failing_letter: config.failing_letter.clone(),
        }
    }

    pub fn letter(&self, score: f64) -> &str {
        self.bands
            .iter()
            .find(|band| score >= band.min)
            .map(|band| band.letter.as_str())
            .unwrap_or(self.failing_letter.as_str())
    }

    pub fn grade(&self, score: f64) -> ExamGrade {
        ExamGrade {
            score,
            letter: self.letter(score).to_string(),
        }
    }
}

/// Score out of 100, each section weighted by its `max_points`. Sections
/// without a result count as zero.
pub fn final_score(sections: &[ExamSection], results: &[SectionResult]) -> f64 {
    let total: i64 = sections.iter().map(|s| s.max_points.max(0)).sum();
    if total == 0 {
        return 0.0;
    }
    let earned: f64 = results
        .iter()
        .filter_map(|r| {
            let section = sections.get(usize::try_from(r.section_index).ok()?)?;
            Some(r.score.clamp(0, 100) as f64 / 100.0 * section.max_points.max(0) as f64)
        })
        .sum();
    (earned / total as f64 * 10000.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn section(max_points: i64) -> ExamSection {
        ExamSection {
            title: "s".into(),
            materials: String::new(),
            task: "t".into(),
            evaluation_criteria: "c".into(),
            max_points,
        }
    }

    fn result(section_index: i64, score: i64) -> SectionResult {
        SectionResult {
            section_index,
            content: "a".into(),
            score,
            feedback: String::new(),
            next_step: String::new(),
            submitted_at: datetime!(2026-04-01 10:00 +9),
        }
    }

    #[test]
    fn default_bands() {
        let policy = GradePolicy::new(&GradingConfig::default());
        assert_eq!(policy.letter(100.0), "秀");
        assert_eq!(policy.letter(90.0), "秀");
        assert_eq!(policy.letter(89.99), "優");
        assert_eq!(policy.letter(80.0), "優");
        assert_eq!(policy.letter(70.0), "良");
        assert_eq!(policy.letter(60.0), "可");
        assert_eq!(policy.letter(59.9), "不可");
        assert_eq!(policy.letter(0.0), "不可");
    }

    #[test]
    fn bands_may_be_listed_in_any_order() {
        let config = GradingConfig {
            bands: vec![GradeBand::new("pass", 50.0), GradeBand::new("merit", 75.0)],
            failing_letter: "fail".into(),
        };
        let policy = GradePolicy::new(&config);
        assert_eq!(policy.letter(80.0), "merit");
        assert_eq!(policy.letter(60.0), "pass");
        assert_eq!(policy.letter(10.0), "fail");
    }

    #[test]
    fn weighted_by_max_points() {
        let sections = [section(30), section(30), section(40)];
        let all = [result(0, 100), result(1, 50), result(2, 75)];
        assert_eq!(final_score(&sections, &all), 75.0);
        // the missing last section counts as zero
        assert_eq!(final_score(&sections, &all[..2]), 45.0);
        assert_eq!(final_score(&[], &[]), 0.0);
    }
}
