use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Extension, Path, Query,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use companies_core::{CompanyId, CompanyPatch, IdempotencyKey};
use companies_infra::Operation;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::BearerToken;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub async fn create_company(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(token): Extension<BearerToken>,
    headers: HeaderMap,
    body: Result<Json<dto::CompanyRequest>, JsonRejection>,
) -> Response {
    if let Err(e) = services.companies.check_access(token.as_str(), Operation::Create) {
        return errors::service_error_to_response(e);
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection(rejection),
    };
    let draft = match body.into_draft() {
        Ok(draft) => draft,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let key = match idempotency_key(&headers) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    match services.companies.create(token.as_str(), draft, key).await {
        Ok(created) => {
            let status = if created.replayed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(created.company)).into_response()
        }
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_companies(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(token): Extension<BearerToken>,
    query: Result<Query<dto::ListQuery>, QueryRejection>,
) -> Response {
    if let Err(e) = services.companies.check_access(token.as_str(), Operation::List) {
        return errors::service_error_to_response(e);
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::query_rejection(rejection),
    };
    let page = query.page();

    match services.companies.list(token.as_str(), page).await {
        Ok(items) => (
            StatusCode::OK,
            Json(dto::CompanyList {
                items,
                limit: page.limit,
                offset: page.offset,
            }),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_company(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(token): Extension<BearerToken>,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = services.companies.check_access(token.as_str(), Operation::Get) {
        return errors::service_error_to_response(e);
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.companies.get(token.as_str(), id).await {
        Ok(company) => (StatusCode::OK, Json(company)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Full replacement: every attribute is taken from the body.
pub async fn replace_company(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(token): Extension<BearerToken>,
    Path(id): Path<String>,
    body: Result<Json<dto::CompanyRequest>, JsonRejection>,
) -> Response {
    if let Err(e) = services.companies.check_access(token.as_str(), Operation::Update) {
        return errors::service_error_to_response(e);
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection(rejection),
    };
    let patch = match body.into_draft() {
        Ok(draft) => CompanyPatch::from(draft),
        Err(e) => return errors::domain_error_to_response(e),
    };

    update(services, token, id, patch).await
}

pub async fn patch_company(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(token): Extension<BearerToken>,
    Path(id): Path<String>,
    body: Result<Json<dto::PatchCompanyRequest>, JsonRejection>,
) -> Response {
    if let Err(e) = services.companies.check_access(token.as_str(), Operation::Update) {
        return errors::service_error_to_response(e);
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection(rejection),
    };
    let patch = match body.into_patch() {
        Ok(patch) => patch,
        Err(e) => return errors::domain_error_to_response(e),
    };

    update(services, token, id, patch).await
}

async fn update(
    services: Arc<AppServices>,
    token: BearerToken,
    id: CompanyId,
    patch: CompanyPatch,
) -> Response {
    match services.companies.update(token.as_str(), id, patch).await {
        Ok(company) => (StatusCode::OK, Json(company)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn delete_company(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(token): Extension<BearerToken>,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = services.companies.check_access(token.as_str(), Operation::Delete) {
        return errors::service_error_to_response(e);
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.companies.delete(token.as_str(), id).await {
        Ok(tombstone) => (StatusCode::OK, Json(tombstone)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Re-publish the event for the company's current revision (recovery after `emit_incomplete`).
pub async fn republish_company(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(token): Extension<BearerToken>,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = services.companies.check_access(token.as_str(), Operation::Republish) {
        return errors::service_error_to_response(e);
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.companies.republish(token.as_str(), id).await {
        Ok(key) => (StatusCode::ACCEPTED, Json(key)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

fn parse_id(raw: &str) -> Result<CompanyId, Response> {
    raw.parse::<CompanyId>()
        .map_err(errors::domain_error_to_response)
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<IdempotencyKey>, Response> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let raw = value.to_str().map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Idempotency-Key must be printable ASCII",
        )
    })?;
    IdempotencyKey::parse(raw)
        .map(Some)
        .map_err(errors::domain_error_to_response)
}
