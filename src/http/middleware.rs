//! Cross-origin middleware
//!
//! The admission API is called from arbitrary game-client origins, so every
//! response carries permissive CORS headers and preflight requests are
//! answered directly with 204.

use axum::{
    extract::Request,
    http::{header::HeaderValue, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,HEAD,POST,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("content-type"),
    );
}

/// Answer preflight requests with 204 and stamp CORS headers on everything else
pub async fn permissive_cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut());
        return response;
    }

    let mut response = next.run(req).await;
    apply_cors(response.headers_mut());
    response
}
