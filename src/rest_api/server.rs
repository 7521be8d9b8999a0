//! # REST API HTTP Server
//!
//! Axum-based HTTP server exposing every public model under
//! `<root>/<plural>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::errors::{RestError, RestResult};
use super::parser::{parse_body, QueryParams};
use super::response::{list_body, CountResponse, DeleteResponse};
use crate::auth::{AuthError, JwtManager};
use crate::config::AppConfig;
use crate::model::{Model, Registry, RequestContext};
use crate::value::parse_id;

/// REST API server state
pub struct RestServer {
    registry: Arc<Registry>,
    jwt_manager: JwtManager,
    root: String,
    request_timeout: Option<Duration>,
}

impl RestServer {
    pub fn new(registry: Arc<Registry>, jwt_secret: &str, root: impl Into<String>) -> Self {
        Self {
            registry,
            jwt_manager: JwtManager::new(jwt_secret),
            root: root.into(),
            request_timeout: None,
        }
    }

    pub fn from_app_config(registry: Arc<Registry>, app: &AppConfig) -> Self {
        Self::new(registry, &app.jwt_secret_key, app.rest_api_root.clone())
    }

    /// Bound every datasource call made while serving a request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build the Axum router
    pub fn router(self) -> Router {
        let root = self.root.trim_end_matches('/').to_string();
        let state = Arc::new(self);

        let api = Router::new()
            .route("/:plural", get(list_handler).post(create_handler))
            .route("/:plural/count", get(count_handler))
            .route(
                "/:plural/:id",
                get(get_handler).patch(update_handler).delete(delete_handler),
            )
            .with_state(state);

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let router = if root.is_empty() {
            api
        } else {
            Router::new().nest(&root, api)
        };
        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Bind `addr` and serve until the process stops
    pub async fn serve(self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, root = %self.root, "serving REST API");
        axum::serve(listener, self.router()).await
    }

    fn model(&self, plural: &str) -> RestResult<Arc<Model>> {
        self.registry
            .by_plural(plural)
            .cloned()
            .ok_or_else(|| RestError::UnknownCollection(plural.to_string()))
    }

    /// Principal from the bearer token; anonymous without one
    fn extract_context(&self, headers: &HeaderMap) -> RestResult<Arc<RequestContext>> {
        let mut ctx = match headers.get(AUTHORIZATION) {
            None => RequestContext::anonymous(),
            Some(value) => {
                let token = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .ok_or(AuthError::MalformedToken)?;
                RequestContext::new(self.jwt_manager.decode(token.trim())?)
            }
        };
        if let Some(timeout) = self.request_timeout {
            ctx = ctx.with_timeout(timeout);
        }
        Ok(Arc::new(ctx))
    }
}

/// Shared state type
type ServerState = Arc<RestServer>;

fn body_json(body: &Bytes) -> RestResult<Value> {
    serde_json::from_slice(body).map_err(|e| RestError::InvalidBody(e.to_string()))
}

/// List records handler
async fn list_handler(
    State(server): State<ServerState>,
    Path(plural): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> RestResult<Json<Value>> {
    let model = server.model(&plural)?;
    let ctx = server.extract_context(&headers)?;
    let params = QueryParams::parse(&query)?;

    let instances = model.find_many(params.filter, &ctx).await?;
    Ok(Json(list_body(&instances)))
}

/// Count records handler
async fn count_handler(
    State(server): State<ServerState>,
    Path(plural): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> RestResult<Json<CountResponse>> {
    let model = server.model(&plural)?;
    let ctx = server.extract_context(&headers)?;
    let where_ = QueryParams::parse(&query)?.into_where();

    let count = model.count(where_, &ctx).await?;
    Ok(Json(CountResponse { count }))
}

/// Get single record handler
async fn get_handler(
    State(server): State<ServerState>,
    Path((plural, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> RestResult<Json<Value>> {
    let model = server.model(&plural)?;
    let ctx = server.extract_context(&headers)?;
    let params = QueryParams::parse(&query)?;

    let instance = model
        .find_by_id(parse_id(&id), Some(params.filter), &ctx)
        .await?;
    Ok(Json(instance.to_json()))
}

/// Create record handler
async fn create_handler(
    State(server): State<ServerState>,
    Path(plural): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> RestResult<(StatusCode, Json<Value>)> {
    let model = server.model(&plural)?;
    let ctx = server.extract_context(&headers)?;
    let data = parse_body(body_json(&body)?)?;

    let instance = model.create(data, &ctx).await?;
    Ok((StatusCode::CREATED, Json(instance.to_json())))
}

/// Update record handler
async fn update_handler(
    State(server): State<ServerState>,
    Path((plural, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RestResult<Json<Value>> {
    let model = server.model(&plural)?;
    let ctx = server.extract_context(&headers)?;
    let patch = parse_body(body_json(&body)?)?;

    let instance = model.update_by_id(parse_id(&id), patch, &ctx).await?;
    Ok(Json(instance.to_json()))
}

/// Delete record handler
async fn delete_handler(
    State(server): State<ServerState>,
    Path((plural, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> RestResult<Json<DeleteResponse>> {
    let model = server.model(&plural)?;
    let ctx = server.extract_context(&headers)?;

    let deleted = model.delete_by_id(parse_id(&id), &ctx).await?;
    Ok(Json(DeleteResponse::from(deleted)))
}
