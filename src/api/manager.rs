use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::info;
use utoipa::ToSchema;

use super::{require_admin, user::Created};
use crate::{
    course::CourseManifest,
    error::Result,
    gamification::Rank,
    server::AppState,
    student::{self, StudentInfo},
};

#[derive(Deserialize, ToSchema)]
pub struct ImportCourseRequest {
    /// Course manifest in TOML.
    pub manifest: String,
    /// Replace a course with the same slug.
    #[serde(default)]
    pub replace: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct SetRankRequest {
    pub student_id: i64,
    pub rank: Rank,
}

#[derive(Deserialize, ToSchema)]
pub struct AdjustGemsRequest {
    pub student_id: i64,
    /// Positive to grant, negative to debit.
    pub delta: i64,
    pub reason: String,
}

#[derive(Serialize, ToSchema)]
pub struct Balance {
    pub gems: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct AddProductRequest {
    pub name: String,
    pub price: i64,
    /// Omit for unlimited stock.
    pub stock: Option<i64>,
}

#[derive(Deserialize, ToSchema)]
pub struct FormatCourseRequest {
    pub student_id: i64,
    pub course_id: i64,
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/import_course",
    method(post),
    request_body = ImportCourseRequest,
    responses(
        (status = 200, description = "Course imported", body = Created),
        (status = 400, description = "Invalid manifest or duplicate slug"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not an administrator")
    )
)]
pub async fn import_course(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<ImportCourseRequest>,
) -> Result<Json<Created>> {
    let admin = require_admin(&state, &session).await?;
    let manifest = CourseManifest::parse(&req.manifest)?;
    let id = state.catalog.import(&manifest, req.replace).await?;
    info!(admin, course_id = id, slug = %manifest.slug, "course imported over http");
    Ok(Json(Created { id }))
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/remove_course/{course_id}",
    method(post),
    params(("course_id" = i64, Path, description = "ID of the course to remove")),
    responses(
        (status = 200, description = "Course removed successfully"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not an administrator"),
        (status = 404, description = "No such course")
    )
)]
pub async fn remove_course(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(course_id): Path<i64>,
) -> Result<&'static str> {
    require_admin(&state, &session).await?;
    state.catalog.remove_course(course_id).await?;
    Ok("Course removed successfully")
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/list_students",
    method(get),
    responses(
        (status = 200, description = "List of students", body = Vec<StudentInfo>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not an administrator")
    )
)]
pub async fn list_students(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> Result<Json<Vec<StudentInfo>>> {
    require_admin(&state, &session).await?;
    let students = student::get_student_list(&state.database, &state.config.gamification).await?;
    Ok(Json(students))
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/set_rank",
    method(post),
    request_body = SetRankRequest,
    responses(
        (status = 200, description = "Rank updated"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not an administrator"),
        (status = 404, description = "No such student")
    )
)]
pub async fn set_rank(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<SetRankRequest>,
) -> Result<&'static str> {
    require_admin(&state, &session).await?;
    state.economy.set_rank(req.student_id, req.rank).await?;
    Ok("Rank updated")
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/adjust_gems",
    method(post),
    request_body = AdjustGemsRequest,
    responses(
        (status = 200, description = "New balance", body = Balance),
        (status = 402, description = "Debit exceeds the balance"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not an administrator")
    )
)]
pub async fn adjust_gems(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<AdjustGemsRequest>,
) -> Result<Json<Balance>> {
    let admin = require_admin(&state, &session).await?;
    let reason = format!("admin {admin}: {}", req.reason.trim());
    let gems = state
        .economy
        .adjust_gems(req.student_id, req.delta, &reason)
        .await?;
    Ok(Json(Balance { gems }))
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/add_product",
    method(post),
    request_body = AddProductRequest,
    responses(
        (status = 200, description = "Product added", body = Created),
        (status = 400, description = "Negative price or stock"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not an administrator")
    )
)]
pub async fn add_product(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<AddProductRequest>,
) -> Result<Json<Created>> {
    require_admin(&state, &session).await?;
    let id = state.shop.add_product(&req.name, req.price, req.stock).await?;
    Ok(Json(Created { id }))
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/format_course",
    method(post),
    request_body = FormatCourseRequest,
    responses(
        (status = 200, description = "All progress of the student in the course deleted"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not an administrator")
    )
)]
pub async fn format_course(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<FormatCourseRequest>,
) -> Result<&'static str> {
    require_admin(&state, &session).await?;
    state
        .progression
        .format_course(req.student_id, req.course_id)
        .await?;
    Ok("Course formatted")
}

pub fn get_manager_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/manager",
        Router::new()
            .route("/import_course", post(import_course))
            .route("/remove_course/{course_id}", post(remove_course))
            .route("/list_students", get(list_students))
            .route("/set_rank", post(set_rank))
            .route("/adjust_gems", post(adjust_gems))
            .route("/add_product", post(add_product))
            .route("/format_course", post(format_course)),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        api::test_support::{app, call, sign_in},
        gamification::Rank,
        testing::Fixture,
    };

    #[tokio::test]
    async fn learners_cannot_reach_the_manager_scope() {
        let fx = Fixture::new().await;
        let app = app(&fx).await;
        let (status, _, _) = call(&app, "GET", "/api/manager/list_students", None, None).await;
        assert_eq!(status, 401);
        let cookie = sign_in(&fx, &app).await;
        let (status, _, body) =
            call(&app, "GET", "/api/manager/list_students", Some(&cookie), None).await;
        assert_eq!(status, 403);
        assert_eq!(body["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn admin_grants_gems_and_formats_a_course() {
        let fx = Fixture::new().await;
        fx.economy().set_rank(fx.student, Rank::Admin).await.unwrap();
        fx.complete_chapter(0).await;
        let app = app(&fx).await;
        let cookie = sign_in(&fx, &app).await;

        let (status, _, body) = call(
            &app,
            "POST",
            "/api/manager/adjust_gems",
            Some(&cookie),
            Some(json!({ "student_id": fx.student, "delta": 15, "reason": "festival" })),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["gems"], 20);

        let (status, _, _) = call(
            &app,
            "POST",
            "/api/manager/format_course",
            Some(&cookie),
            Some(json!({ "student_id": fx.student, "course_id": fx.course_id })),
        )
        .await;
        assert_eq!(status, 200);
        assert!(fx.progression().enrollments(fx.student).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn import_rejects_a_duplicate_slug() {
        let fx = Fixture::new().await;
        fx.economy().set_rank(fx.student, Rank::Admin).await.unwrap();
        let app = app(&fx).await;
        let cookie = sign_in(&fx, &app).await;
        let manifest = crate::testing::FIXTURE_COURSE;
        let (status, _, _) = call(
            &app,
            "POST",
            "/api/manager/import_course",
            Some(&cookie),
            Some(json!({ "manifest": manifest })),
        )
        .await;
        assert_eq!(status, 400);
        let renamed = manifest.replacen("rust-dojo", "rust-dojo-2", 1);
        let (status, _, body) = call(
            &app,
            "POST",
            "/api/manager/import_course",
            Some(&cookie),
            Some(json!({ "manifest": renamed })),
        )
        .await;
        assert_eq!(status, 200);
        assert!(body["id"].as_i64().unwrap() > fx.course_id);
    }
}
