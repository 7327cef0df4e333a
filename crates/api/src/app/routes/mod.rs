use axum::{
    Router,
    routing::{get, post},
};

pub mod companies;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route(
            "/companies",
            post(companies::create_company).get(companies::list_companies),
        )
        .route(
            "/companies/:id",
            get(companies::get_company)
                .put(companies::replace_company)
                .patch(companies::patch_company)
                .delete(companies::delete_company),
        )
        .route("/companies/:id/republish", post(companies::republish_company))
}
