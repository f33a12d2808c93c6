pub mod parser;

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse as _, Response},
};
use parser::{JSON_MIME_TYPE, RequestId};
use serde_json::json;

/// JSON-RPC shaped authorization denial: `{"id": <id>, "error": {"code": 403, "message": "Unauthorized"}}`.
pub(crate) fn unauthorized_response(id: Option<&RequestId>) -> Response {
    let body = json!({
        "id": id,
        "error": {
            "code": 403,
            "message": "Unauthorized",
        }
    });
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, JSON_MIME_TYPE)],
        body.to_string(),
    )
        .into_response()
}
