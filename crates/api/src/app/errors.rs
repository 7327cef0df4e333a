use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use companies_core::DomainError;
use companies_infra::ServiceError;

/// Map a service failure to its HTTP response.
///
/// Every body carries `retry_safe`: whether repeating the same request cannot
/// apply the change twice.
pub fn service_error_to_response(err: ServiceError) -> Response {
    let code = err.kind();
    let retry_safe = err.retry_safe();
    let body = |message: String| {
        json!({
            "error": code,
            "message": message,
            "retry_safe": retry_safe,
        })
    };

    match err {
        ServiceError::Unauthenticated(msg) => {
            (StatusCode::UNAUTHORIZED, axum::Json(body(msg))).into_response()
        }
        ServiceError::NotFound => (
            StatusCode::NOT_FOUND,
            axum::Json(body("company not found".to_string())),
        )
            .into_response(),
        ServiceError::Conflict(msg) => (StatusCode::CONFLICT, axum::Json(body(msg))).into_response(),
        ServiceError::Validation(msg) => {
            (StatusCode::BAD_REQUEST, axum::Json(body(msg))).into_response()
        }
        ServiceError::StorageUnavailable(msg) | ServiceError::PublishUnavailable(msg) => {
            retry_after((StatusCode::SERVICE_UNAVAILABLE, axum::Json(body(msg))).into_response())
        }
        ServiceError::EmitIncomplete { company, cause } => {
            let mut payload = body(format!(
                "change committed but its event was not confirmed: {cause}"
            ));
            payload["sequence"] = json!(company.revision);
            payload["company"] = json!(company);
            (StatusCode::BAD_GATEWAY, axum::Json(payload)).into_response()
        }
        ServiceError::AmbiguousCommit { company_id, detail } => {
            let mut payload = body(detail);
            payload["company_id"] = json!(company_id);
            (StatusCode::GATEWAY_TIMEOUT, axum::Json(payload)).into_response()
        }
        ServiceError::Internal(msg) => {
            tracing::error!(error = %msg, "internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(body("internal error".to_string())),
            )
                .into_response()
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
    }
}

pub fn json_rejection(rejection: JsonRejection) -> Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

pub fn query_rejection(rejection: QueryRejection) -> Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

fn retry_after(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    response
}
