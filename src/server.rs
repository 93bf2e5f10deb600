use std::{sync::Arc, time::Duration};

use axum::Router;
use sqlx::SqlitePool;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tower_sessions::{Expiry, SessionManagerLayer};
use tower_sessions_sqlx_store::SqliteStore;
use utoipa::OpenApi;

use crate::{
    api::{
        learn::get_learn_scope, manager::get_manager_scope, public::get_public_scope,
        user::get_user_scope,
    },
    config::Config,
    course::{catalog::Catalog, progression::Progression},
    exam::controller::ExamController,
    gamification::economy::Economy,
    legacy::{JsonLinesDirectory, LegacyDirectory},
    oracle::ScoringOracle,
    progress::lesson::LessonService,
    shop::Shop,
    utils::Clock,
};

/// Every service the handlers reach, built once over one pool and one clock.
pub struct AppState {
    pub database: SqlitePool,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub catalog: Arc<Catalog>,
    pub progression: Progression,
    pub lessons: LessonService,
    pub exams: ExamController,
    pub economy: Economy,
    pub shop: Shop,
    pub legacy: Option<Arc<dyn LegacyDirectory>>,
}

impl AppState {
    pub fn new(
        database: SqlitePool,
        config: Config,
        oracle: Arc<dyn ScoringOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let catalog = Arc::new(Catalog::new(database.clone()));
        let progression = Progression::new(
            database.clone(),
            catalog.clone(),
            config.grading.clone(),
            clock.clone(),
        );
        let lessons = LessonService::new(
            database.clone(),
            progression.clone(),
            oracle.clone(),
            &config,
            clock.clone(),
        );
        let exams = ExamController::new(
            database.clone(),
            progression.clone(),
            oracle,
            &config,
            clock.clone(),
        );
        let economy = Economy::new(database.clone(), config.gamification.clone(), clock.clone());
        let shop = Shop::new(database.clone(), clock.clone());
        let legacy = config
            .legacy
            .export_path
            .clone()
            .map(|path| Arc::new(JsonLinesDirectory::new(path)) as Arc<dyn LegacyDirectory>);
        Self {
            database,
            config,
            clock,
            catalog,
            progression,
            lessons,
            exams,
            economy,
            shop,
            legacy,
        }
    }

    pub fn with_legacy(mut self, directory: Arc<dyn LegacyDirectory>) -> Self {
        self.legacy = Some(directory);
        self
    }
}

#[derive(OpenApi)]
#[openapi(paths(
    crate::api::public::list_courses,
    crate::api::public::list_products,
    crate::api::user::create_user,
    crate::api::user::login,
    crate::api::user::logout,
    crate::api::user::user_info,
    crate::api::user::take_level_up,
    crate::api::user::gem_ledger,
    crate::api::user::purchase,
    crate::api::learn::enroll,
    crate::api::learn::enrollments,
    crate::api::learn::course_view,
    crate::api::learn::unlock_next,
    crate::api::learn::open_chapter,
    crate::api::learn::media_progress,
    crate::api::learn::submit_task,
    crate::api::learn::start_exam,
    crate::api::learn::exam_view,
    crate::api::learn::submit_section,
    crate::api::learn::exam_timeout,
    crate::api::learn::autosave,
))]
pub struct UserApiDoc;

#[derive(OpenApi)]
#[openapi(paths(
    crate::api::manager::import_course,
    crate::api::manager::remove_course,
    crate::api::manager::list_students,
    crate::api::manager::set_rank,
    crate::api::manager::adjust_gems,
    crate::api::manager::add_product,
    crate::api::manager::format_course,
    crate::api::public::list_courses,
))]
pub struct ManagerApiDoc;

/// The whole `/api` tree with session, tracing, CORS and timeout layers.
pub async fn build_router(state: Arc<AppState>) -> anyhow::Result<Router> {
    let store = SqliteStore::new(state.database.clone());
    store.migrate().await?;
    let sessions = SessionManagerLayer::new(store)
        .with_secure(false)
        .with_expiry(Expiry::OnInactivity(time::Duration::days(
            state.config.server.session_days.max(1),
        )));
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));
    let api = Router::new()
        .merge(get_public_scope())
        .merge(get_user_scope())
        .merge(get_learn_scope())
        .merge(get_manager_scope());
    Ok(Router::new()
        .nest("/api", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new())
                .layer(TimeoutLayer::new(timeout))
                .layer(sessions),
        )
        .with_state(state))
}

/// Merged OpenAPI document of both scopes.
pub fn openapi_json() -> anyhow::Result<String> {
    let mut doc = UserApiDoc::openapi();
    doc.merge(ManagerApiDoc::openapi());
    Ok(doc.to_pretty_json()?)
}
