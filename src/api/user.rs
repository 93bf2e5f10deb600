use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use utoipa::ToSchema;

use super::{STUDENT_KEY, current_student};
use crate::{
    error::Result,
    gamification::{LevelUp, Rank, economy::GemTransaction},
    legacy,
    server::AppState,
    shop::PurchaseReceipt,
    student::{self, StudentInfo},
};

#[derive(Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, ToSchema)]
pub struct Created {
    pub id: i64,
}

#[derive(Serialize, ToSchema)]
pub struct LevelUpNotice {
    pub level_up: Option<LevelUp>,
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/create",
    method(post),
    request_body = CreateUserRequest,
    responses(
        (status = 200, description = "Account created", body = Created),
        (status = 400, description = "Invalid name, email or password")
    )
)]
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<Created>> {
    let id = student::create_student(
        &state.database,
        &req.name,
        &req.email,
        &req.password,
        Rank::Trial,
        state.clock.now(),
    )
    .await?;
    Ok(Json(Created { id }))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/login",
    method(post),
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = StudentInfo),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(req): Json<LoginRequest>,
) -> Result<Json<StudentInfo>> {
    let id = student::login(&state.database, &req.email, &req.password).await?;
    legacy::reconcile_quietly(
        &state.database,
        state.legacy.as_deref(),
        id,
        state.clock.now(),
    )
    .await;
    session
        .cycle_id()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to rotate session: {}", e))?;
    session
        .insert(STUDENT_KEY, id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to store session: {}", e))?;
    let info = student::get_student_info(&state.database, &state.config.gamification, id).await?;
    Ok(Json(info))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/logout",
    method(post),
    responses(
        (status = 200, description = "Logout successful")
    )
)]
pub async fn logout(session: Session) -> &'static str {
    let _ = session.delete().await;
    "Logout successful"
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/info",
    method(get),
    responses(
        (status = 200, description = "Profile of the signed-in student", body = StudentInfo),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn user_info(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> Result<Json<StudentInfo>> {
    let id = current_student(&session).await?;
    let info = student::get_student_info(&state.database, &state.config.gamification, id).await?;
    Ok(Json(info))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/level_up",
    method(post),
    responses(
        (status = 200, description = "Pending level-up, reported once", body = LevelUpNotice),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn take_level_up(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> Result<Json<LevelUpNotice>> {
    let id = current_student(&session).await?;
    let level_up = state.economy.take_level_up(id).await?;
    Ok(Json(LevelUpNotice { level_up }))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/gems",
    method(get),
    responses(
        (status = 200, description = "Gem ledger, oldest first", body = Vec<GemTransaction>),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn gem_ledger(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> Result<Json<Vec<GemTransaction>>> {
    let id = current_student(&session).await?;
    Ok(Json(state.economy.ledger(id).await?))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/purchase/{product_id}",
    method(post),
    params(
        ("product_id" = i64, Path, description = "Product to buy")
    ),
    responses(
        (status = 200, description = "Purchase recorded", body = PurchaseReceipt),
        (status = 400, description = "Sold out"),
        (status = 402, description = "Not enough gems"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn purchase(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(product_id): Path<i64>,
) -> Result<Json<PurchaseReceipt>> {
    let id = current_student(&session).await?;
    Ok(Json(state.shop.purchase(id, product_id).await?))
}

pub fn get_user_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/user",
        Router::new()
            .route("/create", post(create_user))
            .route("/login", post(login))
            .route("/logout", post(logout))
            .route("/info", get(user_info))
            .route("/level_up", post(take_level_up))
            .route("/gems", get(gem_ledger))
            .route("/purchase/{product_id}", post(purchase)),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        api::test_support::{app, call, sign_in},
        testing::Fixture,
    };

    #[tokio::test]
    async fn register_login_and_profile() {
        let fx = Fixture::new().await;
        let app = app(&fx).await;
        let (status, _, body) = call(
            &app,
            "POST",
            "/api/user/create",
            None,
            Some(json!({ "name": "Haru", "email": "haru@example.com", "password": "spring-rain" })),
        )
        .await;
        assert_eq!(status, 200);
        assert!(body["id"].as_i64().is_some());

        let (status, cookie, body) = call(
            &app,
            "POST",
            "/api/user/login",
            None,
            Some(json!({ "email": "haru@example.com", "password": "spring-rain" })),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["rank"], "お試し");
        let cookie = cookie.unwrap();

        let (status, _, body) = call(&app, "GET", "/api/user/info", Some(&cookie), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["name"], "Haru");
        assert_eq!(body["level"], 1);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let fx = Fixture::new().await;
        let app = app(&fx).await;
        sign_in(&fx, &app).await;
        let (status, _, body) = call(
            &app,
            "POST",
            "/api/user/login",
            None,
            Some(json!({ "email": "aiko@example.com", "password": "nope-nope" })),
        )
        .await;
        assert_eq!(status, 401);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "UNAUTHORIZED");
        let (status, _, _) = call(&app, "GET", "/api/user/info", None, None).await;
        assert_eq!(status, 401);
    }

    #[tokio::test]
    async fn purchase_without_gems_reports_balance() {
        let fx = Fixture::new().await;
        let product = fx.shop().add_product("Scroll", 50, None).await.unwrap();
        let app = app(&fx).await;
        let cookie = sign_in(&fx, &app).await;
        let uri = format!("/api/user/purchase/{product}");
        let (status, _, body) = call(&app, "POST", &uri, Some(&cookie), None).await;
        assert_eq!(status, 402);
        assert_eq!(body["code"], "INSUFFICIENT_BALANCE");

        fx.economy().adjust_gems(fx.student, 60, "grant").await.unwrap();
        let (status, _, body) = call(&app, "POST", &uri, Some(&cookie), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["balance"], 10);
        let (_, _, ledger) = call(&app, "GET", "/api/user/gems", Some(&cookie), None).await;
        assert_eq!(ledger.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn login_pulls_the_legacy_record() {
        use std::{io::Write, sync::Arc};

        use crate::{
            api::test_support::set_password,
            legacy::JsonLinesDirectory,
            server::{AppState, build_router},
        };

        let fx = Fixture::new().await;
        let mut export = tempfile::NamedTempFile::new().unwrap();
        writeln!(export, r#"{{"email": "aiko@example.com", "rank": "奥伝", "gems": 12}}"#).unwrap();
        let state = AppState::new(fx.database.clone(), fx.config.clone(), fx.oracle.clone(), fx.clock())
            .with_legacy(Arc::new(JsonLinesDirectory::new(export.path())));
        let app = build_router(Arc::new(state)).await.unwrap();
        set_password(&fx, fx.student, "correct-horse").await;
        let (status, _, body) = call(
            &app,
            "POST",
            "/api/user/login",
            None,
            Some(json!({ "email": "aiko@example.com", "password": "correct-horse" })),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["rank"], "奥伝");
        assert_eq!(body["gems"], 12);
    }
}
