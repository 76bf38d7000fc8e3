mod analyzer;
mod config;
mod credentials;
mod ebay;
mod http;
mod images;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod pricing;
mod security;
mod singleflight;
mod store;

use analyzer::Analyzer;
use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::AppConfig;
use credentials::CredentialStore;
use ebay::{EbayConfig, MarketplaceClient, authorization_url, exchange_code};
use eyre::WrapErr;
use images::{EncodedImage, ImageFile};
use llm::{LlmClient, LlmConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, Condition, InlineImagePart, MarketAnalysis, MarketplaceData, PriceSuggestion,
    Product, ProductId, ProductInsight,
};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind, RunMode, RunReport, RunRequest};
use security::{AuthContext, AuthState, OAuthStateSigner, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use store::{CredentialRepository, InMemoryStore, ProductRepository, SupabaseClient};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "inventory.api", error = %err, "server crashed");
        return Err(err);
    }
    Ok(())
}

async fn run() -> eyre::Result<()> {
    let config = AppConfig::from_env().wrap_err("invalid configuration")?;
    let ebay_config = EbayConfig::from_env();
    let llm_config = LlmConfig::from_env();
    if llm_config.api_key.is_none() {
        warn!(
            target = "inventory.api",
            "GEMINI_API_KEY is not set; analysis requests will fail"
        );
    }

    let (products, credential_repo): (Arc<dyn ProductRepository>, Arc<dyn CredentialRepository>) =
        match SupabaseClient::from_env() {
            Some(client) => {
                info!(target = "inventory.api", "using supabase storage");
                (Arc::new(client.clone()), Arc::new(client))
            }
            None => {
                warn!(
                    target = "inventory.api",
                    "SUPABASE_URL not set; using in-memory storage"
                );
                let store = InMemoryStore::new();
                (Arc::new(store.clone()), Arc::new(store))
            }
        };

    let credentials = CredentialStore::new(credential_repo);
    let oracle = Arc::new(MarketplaceClient::new(
        ebay_config.clone(),
        credentials.clone(),
        &config.settings_path,
    ));
    let analyzer = Analyzer::new(
        Arc::new(LlmClient::new(llm_config.clone())),
        llm_config.timeout,
    );
    let pipeline = Pipeline::new(
        analyzer,
        oracle,
        products,
        credentials,
        config.settings_path.clone(),
    );
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone(), config.queue_capacity);
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;

    let port = config.port;
    let state = AppState {
        pipeline,
        queue,
        signer: OAuthStateSigner::new(&config.session_secret),
        config: Arc::new(config),
        ebay: Arc::new(ebay_config),
        http: http::build_client(),
        prometheus_handle,
    };
    let app = build_router(state, AuthState::from_env());

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "inventory.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    config: Arc<AppConfig>,
    ebay: Arc<EbayConfig>,
    http: reqwest::Client,
    signer: OAuthStateSigner,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);
    let body_limit = state.config.body_limit;

    let protected = Router::new()
        .route("/credentials/auth-url", get(credentials_auth_url))
        .route("/credentials/status", get(credentials_status))
        .route("/marketplace/price", get(marketplace_price))
        .route("/analyze/text", post(analyze_text))
        .route("/analyze/images", post(analyze_images))
        .route("/price/synthesize", post(price_synthesize))
        .route("/products/{id}/analyze", post(analyze_product))
        .route("/products/{id}/generate-listing", post(generate_listing))
        .nest(
            "/jobs",
            Router::new()
                .route("/analyze", post(enqueue_analysis_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/credentials/callback", get(credentials_callback))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "listing-intel-api",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Some(secret) = &state.config.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Provider consent URL for linking the caller's eBay account.
///
/// - Method: `GET`
/// - Path: `/credentials/auth-url`
/// - Response: `{ authUrl }`; the embedded `state` is signed for the caller.
async fn credentials_auth_url(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/credentials/auth-url");
    let oauth_state = state.signer.sign(&context.user_id);
    let url = authorization_url(&state.ebay, &oauth_state)
        .map_err(|err| PipelineError::internal("credentials", err.to_string()))?;
    Ok(Json(json!({ "authUrl": url })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialStatus {
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

async fn credentials_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<CredentialStatus>, AppError> {
    crate::metrics::inc_requests("/credentials/status");
    let store = state.pipeline.credentials();
    let connected = store
        .is_connected(&context.user_id)
        .await
        .map_err(PipelineError::from)?;
    let expires_at = if connected {
        store
            .expires_at(&context.user_id)
            .await
            .map_err(PipelineError::from)?
    } else {
        None
    };
    Ok(Json(CredentialStatus {
        connected,
        expires_at,
    }))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// OAuth redirect target. Exchanges the code, stores the tokens for the
/// user named by the signed `state`, and sends the browser back to the
/// settings page with `status=success` or `status=error`.
async fn credentials_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/credentials/callback");
    let Some(code) = params.code.filter(|code| !code.trim().is_empty()) else {
        return Err(PipelineError::invalid_input("credentials_callback", "missing code").into());
    };
    let Some(user_id) = params
        .state
        .as_deref()
        .and_then(|raw| state.signer.verify(raw))
    else {
        warn!(target = "inventory.api", "oauth_state_rejected");
        return Ok(found(state.config.settings_redirect(false)));
    };

    let success = match exchange_code(&state.http, &state.ebay, &code).await {
        Ok(token) => match state
            .pipeline
            .credentials()
            .store(
                &user_id,
                &token.access_token,
                token.refresh_token.as_deref(),
                token.expires_in,
            )
            .await
        {
            Ok(_) => true,
            Err(err) => {
                error!(target = "inventory.api", user_id = %user_id, error = %err, "credential_store_failed");
                false
            }
        },
        Err(err) => {
            warn!(target = "inventory.api", user_id = %user_id, error = %err, "oauth_exchange_failed");
            false
        }
    };
    Ok(found(state.config.settings_redirect(success)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceQuery {
    #[serde(default)]
    product_name: Option<String>,
}

/// Aggregated marketplace prices for a free-text query.
///
/// - Method: `GET`
/// - Path: `/marketplace/price?productName=`
/// - Response: `MarketplaceData`; 403 with `redirectTo` when the account is not linked.
async fn marketplace_price(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<PriceQuery>,
) -> Result<Json<MarketplaceData>, AppError> {
    crate::metrics::inc_requests("/marketplace/price");
    let product_name = query
        .product_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| PipelineError::invalid_input("marketplace_price", "productName is required"))?;
    let data = state
        .pipeline
        .oracle()
        .fetch_price_stats(&context.user_id, &product_name)
        .await
        .map_err(PipelineError::from)?;
    Ok(Json(data))
}

#[derive(Debug, Deserialize)]
struct AnalyzeTextRequest {
    name: String,
    description: String,
}

async fn analyze_text(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    payload: Result<Json<AnalyzeTextRequest>, JsonRejection>,
) -> Result<Json<MarketAnalysis>, AppError> {
    crate::metrics::inc_requests("/analyze/text");
    let Json(body) = payload?;
    info!(target = "inventory.api", user_id = %context.user_id, "text analysis invoked");
    let analysis = state
        .pipeline
        .analyzer()
        .analyze_text(&body.name, &body.description)
        .await
        .map_err(PipelineError::from)?;
    Ok(Json(analysis))
}

#[derive(Debug, Deserialize)]
struct AnalyzeImagesRequest {
    images: Vec<InlineImagePart>,
}

/// Image-first analysis of already-normalized inline images.
///
/// - Method: `POST`
/// - Path: `/analyze/images`
/// - Body: `{ images: [{ inlineData: { data, mimeType } }] }`
/// - Response: `ProductInsight`
async fn analyze_images(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    payload: Result<Json<AnalyzeImagesRequest>, JsonRejection>,
) -> Result<Json<ProductInsight>, AppError> {
    crate::metrics::inc_requests("/analyze/images");
    let Json(body) = payload?;
    info!(
        target = "inventory.api",
        user_id = %context.user_id,
        images = body.images.len(),
        "image analysis invoked"
    );
    let images: Vec<EncodedImage> = body
        .images
        .into_iter()
        .map(|part| EncodedImage {
            mime_type: part.inline_data.mime_type,
            data: part.inline_data.data,
        })
        .collect();
    let insight = state
        .pipeline
        .analyzer()
        .analyze_images(&images)
        .await
        .map_err(PipelineError::from)?;
    Ok(Json(insight))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest {
    buy_price: f64,
    #[serde(default)]
    current_price: Option<f64>,
    #[serde(default)]
    condition: Condition,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    product_id: Option<ProductId>,
}

/// Recommended sale price for a purchase.
///
/// - Method: `POST`
/// - Path: `/price/synthesize`
/// - Body: `{ buyPrice, currentPrice?, condition, category?, productId? }`
/// - Response: `{ recommendedSalePrice }`
async fn price_synthesize(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    payload: Result<Json<SynthesizeRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/price/synthesize");
    let Json(body) = payload?;
    if !(body.buy_price.is_finite() && body.buy_price > 0.0) {
        return Err(
            PipelineError::invalid_input("synthesize", "buyPrice must be a positive number").into(),
        );
    }
    if body
        .current_price
        .is_some_and(|price| !price.is_finite() || price < 0.0)
    {
        return Err(PipelineError::invalid_input(
            "synthesize",
            "currentPrice must be a non-negative number",
        )
        .into());
    }

    let (mut suggestion, mut marketplace) = (None, None);
    if let Some(product_id) = body.product_id {
        let product = state
            .pipeline
            .load_owned(&context.user_id, product_id)
            .await?;
        if let Some(analysis) = product.analysis {
            suggestion = analysis.market_analysis.map(|a| a.price_suggestion);
            marketplace = analysis.marketplace_data;
        }
    }
    let suggestion = suggestion.or(body.current_price.map(|price| PriceSuggestion {
        min: price,
        max: price,
    }));

    let price = pricing::synthesize_from_suggestion(
        body.condition,
        Some(body.buy_price),
        suggestion,
        marketplace.as_ref(),
    )
    .ok_or_else(|| PipelineError::internal("synthesize", "no price signal"))?;
    info!(
        target = "inventory.api",
        user_id = %context.user_id,
        condition = body.condition.as_str(),
        category = ?body.category,
        price,
        "sale price synthesized"
    );
    Ok(Json(json!({ "recommendedSalePrice": price })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AnalyzeMode {
    #[default]
    Text,
    Images,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadedImage {
    data: String,
    mime_type: String,
    #[serde(default)]
    file_name: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeProductRequest {
    #[serde(default)]
    mode: AnalyzeMode,
    #[serde(default)]
    images: Vec<UploadedImage>,
    #[serde(default = "default_true")]
    marketplace: bool,
}

/// Run the listing intelligence pipeline for one product.
///
/// - Method: `POST`
/// - Path: `/products/{id}/analyze`
/// - Body: `{ mode?: "text" | "images", images?: [{ data, mimeType, fileName? }], marketplace?: bool }`
/// - Response: `RunReport` (stored product, final state, per-stage transcript, `redirectTo?`)
async fn analyze_product(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(product_id): Path<ProductId>,
    payload: Result<Json<AnalyzeProductRequest>, JsonRejection>,
) -> Result<Json<RunReport>, AppError> {
    crate::metrics::inc_requests("/products/{id}/analyze");
    let Json(body) = payload?;
    let mode = match body.mode {
        AnalyzeMode::Text => RunMode::Text,
        AnalyzeMode::Images => RunMode::Images(
            body.images
                .into_iter()
                .map(|image| ImageFile::from_base64(image.file_name, &image.mime_type, &image.data))
                .collect::<Result<Vec<_>, _>>()
                .map_err(PipelineError::from)?,
        ),
    };
    info!(
        target = "inventory.api",
        user_id = %context.user_id,
        api_key = %context.api_key_id,
        product_id,
        "listing pipeline invoked"
    );
    let report = state
        .pipeline
        .run(RunRequest {
            user_id: context.user_id,
            product_id,
            mode,
            marketplace: body.marketplace,
        })
        .await?;
    Ok(Json(report))
}

async fn generate_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(product_id): Path<ProductId>,
) -> Result<Json<Product>, AppError> {
    crate::metrics::inc_requests("/products/{id}/generate-listing");
    let product = state
        .pipeline
        .generate_listing(&context.user_id, product_id)
        .await?;
    Ok(Json(product))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    product_ids: Vec<ProductId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_analysis_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/analyze");
    let Json(body) = payload?;
    let id = state
        .queue
        .enqueue_batch(&context.user_id, body.product_ids)
        .await?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(PipelineError::invalid_input("jobs", "invalid_job_id").into());
    };
    state
        .queue
        .get(&context.user_id, uuid)
        .await
        .map(Json)
        .ok_or_else(|| PipelineError::not_found("jobs", "job not found").into())
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Pipeline(PipelineError::invalid_input(
            "request",
            rejection.body_text(),
        ))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let (status, code) = match err.kind() {
                    PipelineErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, "invalid_input"),
                    PipelineErrorKind::AuthRequired => (StatusCode::FORBIDDEN, "auth_required"),
                    PipelineErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
                    PipelineErrorKind::NoData => (StatusCode::NOT_FOUND, "no_data"),
                    PipelineErrorKind::UpstreamMarketplace => {
                        (StatusCode::BAD_GATEWAY, "marketplace_unavailable")
                    }
                    PipelineErrorKind::UpstreamAi => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "analysis_failed")
                    }
                    PipelineErrorKind::UpstreamTimeout => {
                        (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
                    }
                    PipelineErrorKind::Storage => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
                    PipelineErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
                };
                let detail = match err.kind() {
                    PipelineErrorKind::Storage | PipelineErrorKind::Internal => {
                        error!(target = "inventory.api", stage = err.stage(), error = %err, "request_failed");
                        None
                    }
                    _ => Some(err.detail().to_string()),
                };
                let payload = ApiError {
                    error: code.to_string(),
                    detail,
                    redirect_to: err.redirect_to().map(str::to_string),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tests::{ScriptedGenerator, analysis_json};
    use crate::ebay::{MarketError, PriceOracle};
    use crate::security::TokenBuckets;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Oracle;

    #[async_trait]
    impl PriceOracle for Oracle {
        async fn fetch_price_stats(
            &self,
            _user_id: &str,
            query: &str,
        ) -> Result<MarketplaceData, MarketError> {
            match query {
                "Brass lamp" => Ok(MarketplaceData {
                    current_price: 40.0,
                    average_price: 42.0,
                    lowest_price: 20.0,
                    highest_price: 70.0,
                    sold_count: 12,
                    active_listings: 9,
                    recommended_price: 39.9,
                    last_updated: Utc::now(),
                }),
                "nothing" => Err(MarketError::NoData),
                "flaky" => Err(MarketError::Upstream {
                    status: 500,
                    body: "stack trace".into(),
                }),
                _ => Err(MarketError::AuthRequired {
                    redirect_to: "/settings/marketplace".into(),
                }),
            }
        }
    }

    fn product(id: ProductId, owner: &str) -> Product {
        Product {
            id,
            owner_user_id: owner.into(),
            name: "Nikon FM2".into(),
            description: "Mechanical 35mm SLR body".into(),
            condition: Condition::UsedGood,
            category: None,
            brand: None,
            purchase_price: Some(50.0),
            sale_price: None,
            quantity: 1,
            image_url: None,
            sold: false,
            created_at: Utc::now(),
            analysis: None,
            marketplace_listing_id: None,
        }
    }

    async fn test_app(api_root: String) -> (Router, AppState) {
        let store = InMemoryStore::new();
        store.insert_product(product(1, "alice")).await;
        store.insert_product(product(2, "bob")).await;
        let credentials = CredentialStore::new(Arc::new(store.clone()));
        let generator = ScriptedGenerator::replying(analysis_json(40.0, 75.0).to_string());
        let pipeline = Pipeline::new(
            Analyzer::new(Arc::new(generator), Duration::from_secs(30)),
            Arc::new(Oracle),
            Arc::new(store.clone()),
            credentials,
            "/settings/marketplace",
        );
        let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone(), 4);
        let config = AppConfig::from_lookup(|key: &str| match key {
            "SESSION_SECRET" => Some("test-secret".into()),
            "FRONTEND_URL" => Some("https://shop.example".into()),
            "METRICS_KEY" => Some("m-key".into()),
            _ => None,
        })
        .unwrap();
        let ebay = EbayConfig {
            client_id: "app-id".into(),
            client_secret: "app-secret".into(),
            redirect_uri: "Shop-RuName".into(),
            api_root,
            auth_root: "https://auth.example".into(),
            marketplace_id: "EBAY_US".into(),
            search_limit: 10,
            timeout: Duration::from_secs(10),
        };
        let state = AppState {
            pipeline,
            queue,
            signer: OAuthStateSigner::new(&config.session_secret),
            config: Arc::new(config),
            ebay: Arc::new(ebay),
            http: http::build_client(),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        let auth = AuthState::new("alice:k-alice,bob:k-bob", TokenBuckets::new(100.0, 100.0));
        (build_router(state.clone(), auth), state)
    }

    fn get_as(uri: &str, key: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-Api-Key", key)
            .body(Body::empty())
            .unwrap()
    }

    fn post_as(uri: &str, key: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("X-Api-Key", key)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_is_public_and_protected_routes_need_a_key() {
        let (app, _) = test_app("http://127.0.0.1:9".into()).await;
        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let anonymous = app
            .oneshot(
                Request::builder()
                    .uri("/credentials/auth-url")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_require_the_configured_key() {
        let (app, _) = test_app("http://127.0.0.1:9".into()).await;
        let denied = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        let allowed = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .header("X-Metrics-Key", "m-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oauth_round_trip_connects_the_caller() {
        let token_server = Router::new().route(
            "/identity/v1/oauth2/token",
            post(|| async {
                Json(json!({"access_token": "fresh", "refresh_token": "r-1", "expires_in": 7200}))
            }),
        );
        let root = serve(token_server).await;
        let (app, state) = test_app(root).await;

        let response = app
            .clone()
            .oneshot(get_as("/credentials/auth-url", "k-alice"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let auth_url = json_body(response).await["authUrl"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(auth_url.contains("sell.inventory"));
        let encoded_state = auth_url.split("state=").nth(1).unwrap();
        let oauth_state = urlencoding::decode(encoded_state).unwrap().into_owned();

        let callback = Request::builder()
            .uri(format!(
                "/credentials/callback?code=abc&state={}",
                urlencoding::encode(&oauth_state)
            ))
            .body(Body::empty())
            .unwrap();
        let redirect = app.clone().oneshot(callback).await.unwrap();
        assert_eq!(redirect.status(), StatusCode::FOUND);
        assert_eq!(
            redirect.headers()[header::LOCATION],
            "https://shop.example/settings/marketplace?status=success"
        );
        assert!(state.pipeline.credentials().is_connected("alice").await.unwrap());

        let status = app
            .oneshot(get_as("/credentials/status", "k-alice"))
            .await
            .unwrap();
        let status = json_body(status).await;
        assert_eq!(status["connected"], json!(true));
        assert!(status["expiresAt"].is_string());
    }

    #[tokio::test]
    async fn callback_without_code_or_with_forged_state() {
        let (app, _) = test_app("http://127.0.0.1:9".into()).await;
        let missing = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/credentials/callback?state=x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let forged = app
            .oneshot(
                Request::builder()
                    .uri("/credentials/callback?code=abc&state=forged")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::FOUND);
        assert_eq!(
            forged.headers()[header::LOCATION],
            "https://shop.example/settings/marketplace?status=error"
        );
    }

    #[tokio::test]
    async fn marketplace_price_maps_errors() {
        let (app, _) = test_app("http://127.0.0.1:9".into()).await;
        let ok = app
            .clone()
            .oneshot(get_as("/marketplace/price?productName=Brass%20lamp", "k-alice"))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["recommendedPrice"], json!(39.9));

        let not_linked = app
            .clone()
            .oneshot(get_as("/marketplace/price?productName=camera", "k-alice"))
            .await
            .unwrap();
        assert_eq!(not_linked.status(), StatusCode::FORBIDDEN);
        let body = json_body(not_linked).await;
        assert_eq!(body["redirectTo"], json!("/settings/marketplace"));
        assert!(body["error"].is_string());

        let empty = app
            .clone()
            .oneshot(get_as("/marketplace/price?productName=nothing", "k-alice"))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::NOT_FOUND);

        let upstream = app
            .clone()
            .oneshot(get_as("/marketplace/price?productName=flaky", "k-alice"))
            .await
            .unwrap();
        assert_eq!(upstream.status(), StatusCode::BAD_GATEWAY);
        assert!(!json_body(upstream).await.to_string().contains("stack trace"));

        let blank = app
            .oneshot(get_as("/marketplace/price", "k-alice"))
            .await
            .unwrap();
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn synthesize_validates_and_prices() {
        let (app, _) = test_app("http://127.0.0.1:9".into()).await;
        let rejected = app
            .clone()
            .oneshot(post_as(
                "/price/synthesize",
                "k-alice",
                json!({"buyPrice": 0, "condition": "new"}),
            ))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        let priced = app
            .oneshot(post_as(
                "/price/synthesize",
                "k-alice",
                json!({"buyPrice": 50, "currentPrice": 80, "condition": "used_good", "category": "Cameras"}),
            ))
            .await
            .unwrap();
        assert_eq!(priced.status(), StatusCode::OK);
        assert_eq!(json_body(priced).await["recommendedSalePrice"], json!(60.0));
    }

    #[tokio::test]
    async fn product_analysis_reports_redirect_when_not_linked() {
        let (app, _) = test_app("http://127.0.0.1:9".into()).await;
        let response = app
            .clone()
            .oneshot(post_as("/products/1/analyze", "k-alice", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["state"], json!("done"));
        assert_eq!(report["redirectTo"], json!("/settings/marketplace"));
        assert!(report["product"]["analysis"]["marketAnalysis"].is_object());

        let foreign = app
            .oneshot(post_as("/products/2/analyze", "k-alice", json!({})))
            .await
            .unwrap();
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn generate_listing_requires_linked_account() {
        let (app, _) = test_app("http://127.0.0.1:9".into()).await;
        let response = app
            .oneshot(post_as("/products/1/generate-listing", "k-alice", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            json_body(response).await["redirectTo"],
            json!("/settings/marketplace")
        );
    }

    #[tokio::test]
    async fn malformed_bodies_are_bad_requests() {
        let (app, _) = test_app("http://127.0.0.1:9".into()).await;
        let response = app
            .clone()
            .oneshot(post_as("/analyze/images", "k-alice", json!({"images": "nope"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let gif = app
            .oneshot(post_as(
                "/analyze/images",
                "k-alice",
                json!({"images": [{"inlineData": {"data": "R0lGOD", "mimeType": "image/gif"}}]}),
            ))
            .await
            .unwrap();
        assert_eq!(gif.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn analysis_jobs_are_scoped_to_their_owner() {
        let (app, _) = test_app("http://127.0.0.1:9".into()).await;
        let response = app
            .clone()
            .oneshot(post_as("/jobs/analyze", "k-alice", json!({"productIds": [1]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job_id = json_body(response).await["jobId"].as_str().unwrap().to_string();

        let own = app
            .clone()
            .oneshot(get_as(&format!("/jobs/{job_id}"), "k-alice"))
            .await
            .unwrap();
        assert_eq!(own.status(), StatusCode::OK);
        let other = app
            .clone()
            .oneshot(get_as(&format!("/jobs/{job_id}"), "k-bob"))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::NOT_FOUND);
        let invalid = app.oneshot(get_as("/jobs/not-a-uuid", "k-alice")).await.unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
