//! Combine per-service routers into a single dispatchable service.

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use connect_rs_core::{ConnectError, RpcContentType};

use crate::context::ServerConfig;
use crate::layer::ConnectLayer;
use crate::request::get_context_or_default;
use crate::response::error_response;

/// Builder that merges generated per-service routers, installs the
/// unknown-procedure fallback, and applies [`ConnectLayer`].
///
/// The endpoint table is fixed once [`build`](Self::build) runs; dispatch
/// afterwards is read-only.
pub struct MakeServiceBuilder {
    router: Router,
    config: ServerConfig,
    prefix: Option<String>,
}

impl MakeServiceBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            config: ServerConfig::default(),
            prefix: None,
        }
    }

    /// Merge one service router (as produced by the generated
    /// `{Service}Builder`).
    pub fn add_router(mut self, router: Router) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Merge several service routers.
    pub fn add_routers(mut self, routers: impl IntoIterator<Item = Router>) -> Self {
        for router in routers {
            self.router = self.router.merge(router);
        }
        self
    }

    /// Serve every procedure under a path prefix (e.g. `/rpc`).
    pub fn route_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn message_limits(mut self, limits: crate::limits::MessageLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Require `Connect-Protocol-Version: 1` on every request.
    pub fn require_protocol_header(mut self, require: bool) -> Self {
        self.config.require_protocol_header = require;
        self
    }

    /// Content type assumed for unary POSTs without a Content-Type header;
    /// `None` rejects them.
    pub fn default_unary_content_type(mut self, default: Option<RpcContentType>) -> Self {
        self.config.default_unary_content_type = default;
        self
    }

    pub fn compression(mut self, compression: connect_rs_core::CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    /// Finish the endpoint table and produce the dispatchable router.
    pub fn build(self) -> Router {
        let router = self.router.fallback(unknown_procedure);
        let router = match self.prefix {
            Some(prefix) => Router::new().nest_service(&prefix, router),
            None => router,
        };
        router.layer(ConnectLayer::with_config(self.config))
    }
}

impl Default for MakeServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

async fn unknown_procedure(req: Request<Body>) -> Response {
    let ctx = get_context_or_default(&req);
    error_response(
        ctx.protocol,
        ConnectError::unimplemented(format!("unknown procedure {}", req.uri().path())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn unknown_path_is_unimplemented() {
        let app = MakeServiceBuilder::new().build();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/pkg.Svc/Nope")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "unimplemented");
    }

    #[tokio::test]
    async fn routing_is_case_sensitive() {
        use connect_rs_core::{IdempotencyLevel, MethodSpec, RpcKind};

        #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
        struct Empty {}

        let spec = MethodSpec::new("pkg.Svc", "Echo", RpcKind::Unary, IdempotencyLevel::Unknown);
        let service = Router::new().route(
            "/pkg.Svc/Echo",
            crate::handler::unary(spec, |_ctx, _req: Empty| async move { Ok(Empty {}) }),
        );
        let app = MakeServiceBuilder::new().add_router(service).build();

        let request = |path: &str| {
            Request::builder()
                .method(Method::POST)
                .uri(path)
                .header(header::CONTENT_TYPE, "application/proto")
                .body(Body::empty())
                .unwrap()
        };

        let hit = app.clone().oneshot(request("/pkg.Svc/Echo")).await.unwrap();
        assert_eq!(hit.status(), StatusCode::OK);

        let miss = app.oneshot(request("/pkg.svc/echo")).await.unwrap();
        assert_eq!(miss.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
