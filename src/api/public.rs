use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use crate::{course::CourseMeta, error::Result, server::AppState, shop::Product};

#[utoipa::path(
    context_path = "/api/public",
    path = "/courses",
    method(get),
    responses(
        (status = 200, description = "All courses", body = Vec<CourseMeta>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_courses(State(state): State<Arc<AppState>>) -> Result<Json<Vec<CourseMeta>>> {
    Ok(Json(state.catalog.list_courses().await?))
}

#[utoipa::path(
    context_path = "/api/public",
    path = "/products",
    method(get),
    responses(
        (status = 200, description = "Products in the gem shop", body = Vec<Product>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_products(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Product>>> {
    Ok(Json(state.shop.list_products().await?))
}

pub fn get_public_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/public",
        Router::new()
            .route("/courses", get(list_courses))
            .route("/products", get(list_products)),
    )
}
