use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use utoipa::ToSchema;

use super::current_student;
use crate::{
    course::progression::{CourseView, Enrollment},
    error::Result,
    exam::controller::{ExamView, SectionOutcome},
    progress::{ChapterProgress, lesson::TaskOutcome},
    server::AppState,
};

#[derive(Deserialize, ToSchema)]
pub struct MediaProgressRequest {
    /// Playback position in seconds.
    pub position: f64,
    /// Share of the media watched, 0 to 100.
    pub watch_rate: f64,
}

#[derive(Deserialize, ToSchema)]
pub struct AnswerRequest {
    pub content: String,
}

#[derive(Deserialize, ToSchema)]
pub struct AutosaveRequest {
    pub section_index: i64,
    pub content: String,
}

#[derive(Serialize, ToSchema)]
pub struct UnlockResponse {
    /// Chapter that is open now, if any.
    pub chapter_id: Option<i64>,
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/enroll/{course_id}",
    method(post),
    params(("course_id" = i64, Path, description = "Course to enroll in")),
    responses(
        (status = 200, description = "Enrollment", body = Enrollment),
        (status = 403, description = "Rank too low or account suspended"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn enroll(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(course_id): Path<i64>,
) -> Result<Json<Enrollment>> {
    let id = current_student(&session).await?;
    Ok(Json(state.progression.enroll(id, course_id).await?))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/enrollments",
    method(get),
    responses(
        (status = 200, description = "Enrollments of the signed-in student", body = Vec<Enrollment>),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn enrollments(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> Result<Json<Vec<Enrollment>>> {
    let id = current_student(&session).await?;
    Ok(Json(state.progression.enrollments(id).await?))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/course/{course_id}",
    method(get),
    params(("course_id" = i64, Path, description = "Course ID")),
    responses(
        (status = 200, description = "Chapters with status, access and countdowns", body = CourseView),
        (status = 404, description = "Not enrolled or no such course"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn course_view(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(course_id): Path<i64>,
) -> Result<Json<CourseView>> {
    let id = current_student(&session).await?;
    Ok(Json(state.progression.course_view(id, course_id).await?))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/course/{course_id}/unlock_next",
    method(post),
    params(("course_id" = i64, Path, description = "Course ID")),
    responses(
        (status = 200, description = "Next open chapter", body = UnlockResponse),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn unlock_next(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(course_id): Path<i64>,
) -> Result<Json<UnlockResponse>> {
    let id = current_student(&session).await?;
    let chapter_id = state.progression.unlock_next(id, course_id).await?;
    Ok(Json(UnlockResponse { chapter_id }))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/chapter/{chapter_id}/open",
    method(post),
    params(("chapter_id" = i64, Path, description = "Chapter ID")),
    responses(
        (status = 200, description = "Progress of the chapter, started on first access", body = ChapterProgress),
        (status = 423, description = "Chapter not available yet"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn open_chapter(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(chapter_id): Path<i64>,
) -> Result<Json<ChapterProgress>> {
    let id = current_student(&session).await?;
    Ok(Json(state.lessons.open_chapter(id, chapter_id).await?))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/chapter/{chapter_id}/media",
    method(post),
    params(("chapter_id" = i64, Path, description = "Chapter ID")),
    request_body = MediaProgressRequest,
    responses(
        (status = 200, description = "Updated progress", body = ChapterProgress),
        (status = 400, description = "Out of range or regressing watch rate"),
        (status = 423, description = "Chapter not available yet"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn media_progress(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(chapter_id): Path<i64>,
    Json(req): Json<MediaProgressRequest>,
) -> Result<Json<ChapterProgress>> {
    let id = current_student(&session).await?;
    let progress = state
        .lessons
        .record_media_progress(id, chapter_id, req.position, req.watch_rate)
        .await?;
    Ok(Json(progress))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/chapter/{chapter_id}/submit",
    method(post),
    params(("chapter_id" = i64, Path, description = "Chapter ID")),
    request_body = AnswerRequest,
    responses(
        (status = 200, description = "Evaluation; a repeated call replays the stored one", body = TaskOutcome),
        (status = 400, description = "Empty answer or lesson not watched"),
        (status = 409, description = "Already being scored"),
        (status = 504, description = "Scoring timed out, nothing was stored"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(chapter_id): Path<i64>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<TaskOutcome>> {
    let id = current_student(&session).await?;
    Ok(Json(state.lessons.submit_task(id, chapter_id, &req.content).await?))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/exam/{chapter_id}/start",
    method(post),
    params(("chapter_id" = i64, Path, description = "Final exam chapter ID")),
    responses(
        (status = 200, description = "Exam state; resumes a started exam", body = ExamView),
        (status = 423, description = "Exam not available yet"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn start_exam(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(chapter_id): Path<i64>,
) -> Result<Json<ExamView>> {
    let id = current_student(&session).await?;
    Ok(Json(state.exams.start_exam(id, chapter_id).await?))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/exam/{chapter_id}",
    method(get),
    params(("chapter_id" = i64, Path, description = "Final exam chapter ID")),
    responses(
        (status = 200, description = "Exam state with server-computed remaining time", body = ExamView),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn exam_view(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(chapter_id): Path<i64>,
) -> Result<Json<ExamView>> {
    let id = current_student(&session).await?;
    Ok(Json(state.exams.exam_view(id, chapter_id).await?))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/exam/{chapter_id}/section/{index}",
    method(post),
    params(
        ("chapter_id" = i64, Path, description = "Final exam chapter ID"),
        ("index" = i64, Path, description = "Zero-based section index")
    ),
    request_body = AnswerRequest,
    responses(
        (status = 200, description = "Section result", body = SectionOutcome),
        (status = 409, description = "Section out of sequence; carries the stored result when there is one"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn submit_section(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path((chapter_id, index)): Path<(i64, i64)>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<SectionOutcome>> {
    let id = current_student(&session).await?;
    let outcome = state
        .exams
        .submit_section(id, chapter_id, index, &req.content)
        .await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/exam/{chapter_id}/timeout",
    method(post),
    params(("chapter_id" = i64, Path, description = "Final exam chapter ID")),
    request_body = AnswerRequest,
    responses(
        (status = 200, description = "Exam state after the forced submission", body = ExamView),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn exam_timeout(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(chapter_id): Path<i64>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<ExamView>> {
    let id = current_student(&session).await?;
    Ok(Json(state.exams.handle_timeout(id, chapter_id, &req.content).await?))
}

#[utoipa::path(
    context_path = "/api/learn",
    path = "/exam/{chapter_id}/autosave",
    method(post),
    params(("chapter_id" = i64, Path, description = "Final exam chapter ID")),
    request_body = AutosaveRequest,
    responses(
        (status = 204, description = "Accepted; failures are only logged"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn autosave(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(chapter_id): Path<i64>,
    Json(req): Json<AutosaveRequest>,
) -> Result<StatusCode> {
    let id = current_student(&session).await?;
    state
        .exams
        .autosave(id, chapter_id, req.section_index, &req.content)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

pub fn get_learn_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/learn",
        Router::new()
            .route("/enroll/{course_id}", post(enroll))
            .route("/enrollments", get(enrollments))
            .route("/course/{course_id}", get(course_view))
            .route("/course/{course_id}/unlock_next", post(unlock_next))
            .route("/chapter/{chapter_id}/open", post(open_chapter))
            .route("/chapter/{chapter_id}/media", post(media_progress))
            .route("/chapter/{chapter_id}/submit", post(submit_task))
            .route("/exam/{chapter_id}", get(exam_view))
            .route("/exam/{chapter_id}/start", post(start_exam))
            .route("/exam/{chapter_id}/section/{index}", post(submit_section))
            .route("/exam/{chapter_id}/timeout", post(exam_timeout))
            .route("/exam/{chapter_id}/autosave", post(autosave)),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration;

    use crate::{
        api::test_support::{app, call, sign_in},
        testing::Fixture,
    };

    #[tokio::test]
    async fn lesson_then_task_over_http() {
        let fx = Fixture::new().await;
        let app = app(&fx).await;
        let cookie = sign_in(&fx, &app).await;
        let chapter = fx.chapters[0];

        let (status, _, body) = call(
            &app,
            "POST",
            &format!("/api/learn/chapter/{chapter}/submit"),
            Some(&cookie),
            Some(json!({ "content": "ownership moves values" })),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let (status, _, body) = call(
            &app,
            "POST",
            &format!("/api/learn/chapter/{chapter}/media"),
            Some(&cookie),
            Some(json!({ "position": 580.0, "watch_rate": 97.0 })),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "LESSON_COMPLETED");

        let uri = format!("/api/learn/chapter/{chapter}/submit");
        let answer = Some(json!({ "content": "ownership moves values" }));
        let (status, _, first) = call(&app, "POST", &uri, Some(&cookie), answer.clone()).await;
        assert_eq!(status, 200);
        assert_eq!(first["submission"]["score"], 80);
        assert_eq!(first["replayed"], false);
        let (status, _, again) = call(&app, "POST", &uri, Some(&cookie), answer).await;
        assert_eq!(status, 200);
        assert_eq!(again["replayed"], true);
        assert_eq!(fx.oracle.calls(), 1);
    }

    #[tokio::test]
    async fn waiting_chapter_reports_when_it_opens() {
        let fx = Fixture::new().await;
        fx.complete_chapter(0).await;
        let app = app(&fx).await;
        let cookie = sign_in(&fx, &app).await;
        let (status, _, body) = call(
            &app,
            "POST",
            &format!("/api/learn/chapter/{}/open", fx.chapters[1]),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(status, 423);
        assert_eq!(body["code"], "CHAPTER_LOCKED");
        assert!(body["available_at"].is_string());

        let (status, _, view) = call(
            &app,
            "GET",
            &format!("/api/learn/course/{}", fx.course_id),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(view["chapters"][0]["status"], "COMPLETED");
        assert_eq!(view["chapters"][1]["access"]["state"], "waiting");
        assert_eq!(view["chapters"][2]["access"]["state"], "locked");
    }

    #[tokio::test]
    async fn duplicate_exam_section_returns_stored_result() {
        let fx = Fixture::new().await;
        fx.complete_chapter(0).await;
        fx.clock.advance(Duration::minutes(61));
        fx.complete_chapter(1).await;
        let exam = fx.chapters[2];
        let app = app(&fx).await;
        let cookie = sign_in(&fx, &app).await;

        let (status, _, view) = call(
            &app,
            "POST",
            &format!("/api/learn/exam/{exam}/start"),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(view["remaining_secs"], 3600);

        let uri = format!("/api/learn/exam/{exam}/section/0");
        let answer = Some(json!({ "content": "a move transfers ownership" }));
        let (status, _, outcome) = call(&app, "POST", &uri, Some(&cookie), answer.clone()).await;
        assert_eq!(status, 200);
        assert_eq!(outcome["current_section"], 1);
        let (status, _, body) = call(&app, "POST", &uri, Some(&cookie), answer).await;
        assert_eq!(status, 409);
        assert_eq!(body["code"], "SEQUENCE_VIOLATION");
        assert_eq!(body["existing"]["section_index"], 0);
        assert_eq!(fx.oracle.calls(), 3);

        let (status, _, _) = call(
            &app,
            "POST",
            &format!("/api/learn/exam/{exam}/autosave"),
            Some(&cookie),
            Some(json!({ "section_index": 1, "content": "half an answer" })),
        )
        .await;
        assert_eq!(status, 204);
        let (_, _, view) = call(&app, "GET", &format!("/api/learn/exam/{exam}"), Some(&cookie), None).await;
        assert_eq!(view["draft"], "half an answer");
    }
}
