//! Local HTTP endpoint serving the output of a running relay.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use relay_engine::{PLAYLIST_FILENAME, RelayService};
use tower_http::trace::TraceLayer;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

type Service = Arc<dyn RelayService>;

pub fn router(service: Service) -> Router {
    Router::new()
        .route(&format!("/{PLAYLIST_FILENAME}"), get(playlist))
        .route("/{segment}", get(segment))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}

async fn playlist(State(service): State<Service>) -> Response {
    match service.output_playlist() {
        Some(text) => ([(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)], text).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn segment(State(service): State<Service>, Path(name): Path<String>) -> Response {
    match service.output_segment(&name) {
        Some(data) => ([(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)], data).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{body::Body, http::Request};
    use bytes::Bytes;
    use tower::ServiceExt;

    use super::*;

    #[derive(Default)]
    struct StubRelay {
        playlist: Option<String>,
        segments: HashMap<String, Bytes>,
    }

    impl RelayService for StubRelay {
        fn output_playlist(&self) -> Option<String> {
            self.playlist.clone()
        }

        fn output_segment(&self, name: &str) -> Option<Bytes> {
            self.segments.get(name).cloned()
        }

        fn stop(&self) {}
    }

    async fn request(router: Router, uri: &str) -> Response {
        router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    #[tokio::test]
    async fn playlist_is_404_until_available() {
        let response = request(router(Arc::new(StubRelay::default())), "/stream.m3u8").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let relay = StubRelay {
            playlist: Some("#EXTM3U\n".into()),
            ..Default::default()
        };
        let response = request(router(Arc::new(relay)), "/stream.m3u8").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PLAYLIST_CONTENT_TYPE
        );
        assert_eq!(body(response).await, "#EXTM3U\n");
    }

    #[tokio::test]
    async fn segments_are_served_by_name() {
        let mut relay = StubRelay::default();
        relay
            .segments
            .insert("seg1.ts".into(), Bytes::from_static(b"media"));
        let app = router(Arc::new(relay));

        let response = request(app.clone(), "/seg1.ts").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], SEGMENT_CONTENT_TYPE);
        assert_eq!(body(response).await, "media");

        let response = request(app.clone(), "/seg2.ts").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = request(app, "/nested/seg1.ts").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
