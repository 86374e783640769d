//! Route manifest endpoint

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use meshtun_proto::ROUTES_PATH;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// `GET /routes` serving the route file, re-read on every request
pub fn routes_router(route_file: PathBuf) -> Router {
    Router::new()
        .route(ROUTES_PATH, get(serve_routes))
        .with_state(Arc::new(route_file))
        .layer(TraceLayer::new_for_http())
}

async fn serve_routes(State(route_file): State<Arc<PathBuf>>) -> Response {
    match tokio::fs::read_to_string(route_file.as_ref()).await {
        Ok(content) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            content,
        )
            .into_response(),
        Err(e) => {
            warn!("Cannot read route file {}: {}", route_file.display(), e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_serves_route_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.txt");
        std::fs::write(&path, "1.0.0.0/8\n8.8.8.8/32\n").unwrap();

        let response = routes_router(path)
            .oneshot(Request::builder().uri("/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"1.0.0.0/8\n8.8.8.8/32\n");
    }

    #[tokio::test]
    async fn test_missing_route_file() {
        let dir = tempfile::tempdir().unwrap();
        let response = routes_router(dir.path().join("gone.txt"))
            .oneshot(Request::builder().uri("/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
