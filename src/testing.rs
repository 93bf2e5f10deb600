//! Shared fixtures for the unit tests.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tempfile::TempDir;
use time::{OffsetDateTime, macros::datetime};

use crate::{
    config::Config,
    course::{CourseManifest, catalog::Catalog, progression::Progression},
    db,
    error::{Error, Result},
    exam::controller::ExamController,
    gamification::economy::Economy,
    oracle::{Evaluation, Rubric, ScoringOracle},
    progress::lesson::LessonService,
    shop::Shop,
    utils::{Clock, ManualClock},
};

pub const T0: OffsetDateTime = datetime!(2026-04-01 09:00 +9);

pub const FIXTURE_COURSE: &str = r#"
slug = "rust-dojo"
title = "Rust Dojo"
description = "From ownership to a graded final exam"
time_limit_days = 90
grants_rank = "初伝"

[[chapters]]
title = "Ownership"
media_url = "https://media.example.com/ownership.mp4"
time_limit = 120
reward_exp = 200
reward_gems = 5
task = { system_message = "You grade short Rust answers.", reference_text = "Every value has exactly one owner.", task = "Explain ownership in your own words." }

[[chapters]]
title = "Borrowing"
media_url = "https://media.example.com/borrowing.mp4"
time_limit = 120
wait_time = 60
reward_exp = 200
reward_gems = 5
task = { system_message = "You grade short Rust answers.", task = "When does the borrow checker reject two references?" }

[[chapters]]
title = "Final exam"
is_final_exam = true
time_limit = 60
reward_exp = 500
reward_gems = 20

[[chapters.exam.sections]]
title = "Ownership"
task = "Describe a move."
evaluation_criteria = "Correctness of move semantics."
max_points = 30

[[chapters.exam.sections]]
title = "Borrowing"
materials = "Shared and mutable references."
task = "Explain aliasing XOR mutability."
evaluation_criteria = "Mentions the exclusivity rule."
max_points = 30

[[chapters.exam.sections]]
title = "Lifetimes"
task = "Why does a returned reference need a lifetime?"
evaluation_criteria = "Relates lifetimes to the borrowed input."
max_points = 40
"#;

/// Scripted oracle: returns a fixed score, counts calls, can fail once or hang.
pub struct MockOracle {
    score: AtomicI64,
    calls: AtomicUsize,
    stalled: AtomicBool,
    delay: Mutex<Option<std::time::Duration>>,
    failure: Mutex<Option<Error>>,
}

impl MockOracle {
    pub fn scoring(score: i64) -> Self {
        Self {
            score: AtomicI64::new(score),
            calls: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            delay: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub fn set_score(&self, score: i64) {
        self.score.store(score, Ordering::SeqCst);
    }

    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn delay(&self, delay: std::time::Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fail_next(&self, error: Error) {
        *self.failure.lock() = Some(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoringOracle for MockOracle {
    async fn evaluate(&self, _rubric: &Rubric, submission: &str) -> Result<Evaluation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.failure.lock().take() {
            return Err(error);
        }
        let score = self.score.load(Ordering::SeqCst);
        Ok(Evaluation {
            score,
            feedback: format!("{} characters reviewed", submission.chars().count()),
            next_step: "Read the next chapter".to_string(),
        })
    }
}

pub struct Fixture {
    pub database: SqlitePool,
    pub clock: Arc<ManualClock>,
    pub oracle: Arc<MockOracle>,
    pub config: Config,
    pub catalog: Arc<Catalog>,
    pub student: i64,
    pub course_id: i64,
    /// Chapter ids of the fixture course in order.
    pub chapters: Vec<i64>,
}

impl Fixture {
    /// In-memory database with one enrolled student.
    pub async fn new() -> Self {
        let database = db::connect_memory().await.unwrap();
        Self::with_database(database).await
    }

    /// File-backed database with a multi-connection pool.
    pub async fn file_backed() -> (Self, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let database = db::connect(dir.path().join("kaiden.db"), 8).await.unwrap();
        (Self::with_database(database).await, dir)
    }

    async fn with_database(database: SqlitePool) -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let catalog = Arc::new(Catalog::new(database.clone()));
        let manifest = CourseManifest::parse(FIXTURE_COURSE).unwrap();
        let course_id = catalog.import(&manifest, false).await.unwrap();
        let chapters = catalog
            .get_course(course_id)
            .await
            .unwrap()
            .chapters
            .iter()
            .map(|ch| ch.id)
            .collect();
        let mut fx = Self {
            database,
            clock,
            oracle: Arc::new(MockOracle::scoring(80)),
            config: Config::default(),
            catalog,
            student: 0,
            course_id,
            chapters,
        };
        fx.student = fx.add_student("aiko").await;
        fx.progression().enroll(fx.student, course_id).await.unwrap();
        fx
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub async fn add_student(&self, name: &str) -> i64 {
        sqlx::query("insert into student (name, email, password, created_at) values (?, ?, ?, ?)")
            .bind(name)
            .bind(format!("{name}@example.com"))
            .bind("not-a-hash")
            .bind(self.clock.now())
            .execute(&self.database)
            .await
            .unwrap()
            .last_insert_rowid()
    }

    pub fn economy(&self) -> Economy {
        Economy::new(
            self.database.clone(),
            self.config.gamification.clone(),
            self.clock(),
        )
    }

    pub fn progression(&self) -> Progression {
        Progression::new(
            self.database.clone(),
            self.catalog.clone(),
            self.config.grading.clone(),
            self.clock(),
        )
    }

    pub fn lessons(&self) -> LessonService {
        LessonService::new(
            self.database.clone(),
            self.progression(),
            self.oracle.clone(),
            &self.config,
            self.clock(),
        )
    }

    pub fn exams(&self) -> ExamController {
        ExamController::new(
            self.database.clone(),
            self.progression(),
            self.oracle.clone(),
            &self.config,
            self.clock(),
        )
    }

    pub fn shop(&self) -> Shop {
        Shop::new(self.database.clone(), self.clock())
    }

    /// Watches and submits the chapter at `idx`, returning its id.
    pub async fn complete_chapter(&self, idx: usize) -> i64 {
        let chapter = self.chapters[idx];
        let lessons = self.lessons();
        lessons
            .record_media_progress(self.student, chapter, 600.0, 100.0)
            .await
            .unwrap();
        lessons
            .submit_task(self.student, chapter, "my answer")
            .await
            .unwrap();
        chapter
    }
}
