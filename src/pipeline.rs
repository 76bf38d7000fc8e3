use crate::analyzer::{Analyzer, AnalyzerError};
use crate::credentials::{CredentialError, CredentialStore};
use crate::ebay::{MarketError, PriceOracle};
use crate::images::{ImageError, ImageFile, Normalizer};
use crate::llm::LlmError;
use crate::models::{
    Analysis, MarketAnalysis, MarketplaceData, Product, ProductId, ProductInsight, ProductPatch,
    StageReport,
};
use crate::pricing::synthesize;
use crate::singleflight::SingleFlight;
use crate::store::{ProductRepository, StoreError};
use serde::Serialize;
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Marketplace data widens the AI price range to at least
/// `[recommended * 0.9, recommended * 1.1]`.
pub const WIDEN_LOW: f64 = 0.9;
pub const WIDEN_HIGH: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    RunningAi,
    RunningMarketplace,
    Merged,
    Done,
    Failed,
}

impl RunState {
    pub fn can_advance(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, RunningAi)
                | (RunningAi, RunningMarketplace)
                | (RunningAi, Done)
                | (RunningMarketplace, Merged)
                | (RunningMarketplace, Failed)
                | (Merged, Done)
        )
    }
}

struct RunTracker {
    product_id: ProductId,
    state: RunState,
}

impl RunTracker {
    fn new(product_id: ProductId) -> Self {
        Self {
            product_id,
            state: RunState::Idle,
        }
    }

    fn advance(&mut self, next: RunState) -> Result<(), PipelineError> {
        if !self.state.can_advance(next) {
            return Err(PipelineError::internal(
                "run_state",
                format!("illegal transition {:?} -> {:?}", self.state, next),
            ));
        }
        debug!(
            target = "inventory.pipeline",
            product_id = self.product_id,
            from = ?self.state,
            to = ?next,
            "run_state_changed"
        );
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum RunMode {
    Text,
    Images(Vec<ImageFile>),
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub user_id: String,
    pub product_id: ProductId,
    pub mode: RunMode,
    pub marketplace: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub product: Product,
    pub state: RunState,
    pub stages: Vec<StageReport>,
    pub redirect_to: Option<String>,
    pub warning: Option<String>,
}

/// Widen `analysis.price_suggestion` around the marketplace recommendation.
/// Never narrows the range.
pub fn widen_suggestion(mut analysis: MarketAnalysis, data: &MarketplaceData) -> MarketAnalysis {
    let recommended = data.recommended_price;
    let suggestion = &mut analysis.price_suggestion;
    suggestion.min = suggestion.min.min(recommended * WIDEN_LOW);
    suggestion.max = suggestion.max.max(recommended * WIDEN_HIGH);
    analysis
}

#[derive(Clone)]
pub struct Pipeline {
    analyzer: Analyzer,
    oracle: Arc<dyn PriceOracle>,
    products: Arc<dyn ProductRepository>,
    credentials: CredentialStore,
    normalizer: Normalizer,
    flights: SingleFlight<ProductId>,
    settings_path: String,
}

impl Pipeline {
    pub fn new(
        analyzer: Analyzer,
        oracle: Arc<dyn PriceOracle>,
        products: Arc<dyn ProductRepository>,
        credentials: CredentialStore,
        settings_path: impl Into<String>,
    ) -> Self {
        Self {
            analyzer,
            oracle,
            products,
            credentials,
            normalizer: Normalizer::default(),
            flights: SingleFlight::new(),
            settings_path: settings_path.into(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn oracle(&self) -> &dyn PriceOracle {
        self.oracle.as_ref()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    fn auth_required(&self, stage: &'static str) -> PipelineError {
        PipelineError::auth_required(stage, self.settings_path.clone())
    }

    /// Product `product_id`, provided it belongs to `user_id`.
    pub async fn load_owned(
        &self,
        user_id: &str,
        product_id: ProductId,
    ) -> Result<Product, PipelineError> {
        match self.products.get(product_id).await? {
            Some(product) if product.owner_user_id == user_id => Ok(product),
            _ => Err(PipelineError::not_found(
                "load_product",
                format!("product {product_id} not found"),
            )),
        }
    }

    /// Enrich one product. Runs for the same product are serialized.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, PipelineError> {
        let _flight = self.flights.acquire(request.product_id).await;
        let started = Instant::now();
        let result = self.run_locked(request).await;
        crate::metrics::run_finished(
            result.as_ref().map(|report| report.state).ok(),
            started.elapsed().as_millis(),
        );
        result
    }

    async fn run_locked(&self, request: RunRequest) -> Result<RunReport, PipelineError> {
        let mut stages = Vec::new();
        let mut tracker = RunTracker::new(request.product_id);
        let product = self
            .load_owned(&request.user_id, request.product_id)
            .await?;

        tracker.advance(RunState::RunningAi)?;
        let (market_analysis, catalogue) = match request.mode {
            RunMode::Text => {
                if product.name.trim().is_empty() || product.description.trim().is_empty() {
                    return Err(PipelineError::invalid_input(
                        "analyze_text",
                        "product needs a name and a description for text analysis",
                    ));
                }
                let analysis = self
                    .capture_stage("analyze_text", &mut stages, async {
                        let analysis = self
                            .analyzer
                            .analyze_text(&product.name, &product.description)
                            .await?;
                        let output = analysis_output(&analysis);
                        Ok::<_, PipelineError>(StageOutcome::new(analysis, output))
                    })
                    .await?;
                (analysis, None)
            }
            RunMode::Images(files) => {
                if files.is_empty() {
                    return Err(PipelineError::invalid_input(
                        "normalize_images",
                        "at least one image is required",
                    ));
                }
                let encoded = self
                    .capture_stage("normalize_images", &mut stages, async {
                        let encoded = self.normalizer.normalize_batch(files).await?;
                        let output = json!({
                            "count": encoded.len(),
                            "bytes": encoded.iter().map(|image| image.data.len()).sum::<usize>(),
                        });
                        Ok::<_, PipelineError>(StageOutcome::new(encoded, output))
                    })
                    .await?;
                let insight = self
                    .capture_stage("analyze_images", &mut stages, async {
                        let insight = self.analyzer.analyze_images(&encoded).await?;
                        let mut output = analysis_output(&insight.market_analysis);
                        output["title"] = json!(insight.title);
                        Ok::<_, PipelineError>(StageOutcome::new(insight, output))
                    })
                    .await?;
                let ProductInsight {
                    title,
                    description,
                    category,
                    market_analysis,
                } = insight;
                (market_analysis, Some((title, description, category)))
            }
        };

        // Existing marketplace data survives an AI-only refresh.
        let mut analysis = product.analysis.clone().unwrap_or_default();
        analysis.market_analysis = Some(market_analysis.clone());
        let mut patch = ProductPatch {
            sale_price: synthesize(
                product.condition,
                product.purchase_price,
                Some(&market_analysis),
                None,
            ),
            analysis: Some(analysis),
            ..ProductPatch::default()
        };
        if let Some((title, description, category)) = catalogue {
            patch.name = Some(title);
            patch.description = Some(description);
            patch.category = Some(category);
        }
        let mut product = self.persist("persist_analysis", &mut stages, &product, &patch).await?;

        let finished = |product: Product, state: RunState, stages, redirect_to, warning| RunReport {
            product,
            state,
            stages,
            redirect_to,
            warning,
        };

        if !request.marketplace {
            tracker.advance(RunState::Done)?;
            return Ok(finished(product, tracker.state, stages, None, None));
        }

        if !self.credentials.is_connected(&request.user_id).await? {
            tracker.advance(RunState::Done)?;
            info!(
                target = "inventory.pipeline",
                product_id = product.id,
                user_id = %request.user_id,
                "marketplace_leg_skipped_not_connected"
            );
            return Ok(finished(
                product,
                tracker.state,
                stages,
                Some(self.settings_path.clone()),
                None,
            ));
        }

        tracker.advance(RunState::RunningMarketplace)?;
        let started = Instant::now();
        let fetched = self
            .oracle
            .fetch_price_stats(&request.user_id, &product.name)
            .await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed("marketplace_price", elapsed_ms);

        match fetched {
            Ok(data) => {
                stages.push(StageReport::new(
                    "marketplace_price",
                    elapsed_ms,
                    json!({
                        "recommendedPrice": data.recommended_price,
                        "activeListings": data.active_listings,
                        "soldCount": data.sold_count,
                    }),
                ));
                let widened = widen_suggestion(market_analysis, &data);
                let patch = ProductPatch {
                    sale_price: synthesize(
                        product.condition,
                        product.purchase_price,
                        Some(&widened),
                        Some(&data),
                    ),
                    analysis: Some(Analysis {
                        market_analysis: Some(widened),
                        marketplace_data: Some(data),
                    }),
                    ..ProductPatch::default()
                };
                tracker.advance(RunState::Merged)?;
                product = self
                    .persist("persist_marketplace", &mut stages, &product, &patch)
                    .await?;
                tracker.advance(RunState::Done)?;
                info!(
                    target = "inventory.pipeline",
                    product_id = product.id,
                    sale_price = ?product.sale_price,
                    "run_merged"
                );
                Ok(finished(product, tracker.state, stages, None, None))
            }
            Err(MarketError::AuthRequired { redirect_to }) => {
                stages.push(StageReport::new(
                    "marketplace_price",
                    elapsed_ms,
                    json!({"error": "auth_required"}),
                ));
                tracker.advance(RunState::Failed)?;
                warn!(
                    target = "inventory.pipeline",
                    product_id = product.id,
                    user_id = %request.user_id,
                    "marketplace_token_rejected"
                );
                Ok(finished(
                    product,
                    tracker.state,
                    stages,
                    Some(redirect_to),
                    Some("marketplace account must be reconnected".into()),
                ))
            }
            Err(MarketError::NoData) => {
                stages.push(StageReport::new(
                    "marketplace_price",
                    elapsed_ms,
                    json!({"error": "no_data"}),
                ));
                tracker.advance(RunState::Failed)?;
                let warning = format!("no priced listings found for \"{}\"", product.name);
                Ok(finished(product, tracker.state, stages, None, Some(warning)))
            }
            Err(err) => {
                tracker.advance(RunState::Failed)?;
                warn!(
                    target = "inventory.pipeline",
                    product_id = product.id,
                    error = %err,
                    "marketplace_leg_failed"
                );
                Err(PipelineError::from(err).with_stage("marketplace_price"))
            }
        }
    }

    /// Assign a marketplace listing id to a product, analyzing it first
    /// when it has never been analyzed.
    pub async fn generate_listing(
        &self,
        user_id: &str,
        product_id: ProductId,
    ) -> Result<Product, PipelineError> {
        if !self.credentials.is_connected(user_id).await? {
            return Err(self.auth_required("generate_listing"));
        }
        let _flight = self.flights.acquire(product_id).await;
        let product = self.load_owned(user_id, product_id).await?;

        let analyzed = product
            .analysis
            .as_ref()
            .is_some_and(|analysis| analysis.market_analysis.is_some());
        if !analyzed {
            self.run_locked(RunRequest {
                user_id: user_id.to_string(),
                product_id,
                mode: RunMode::Text,
                marketplace: true,
            })
            .await?;
        }

        let listing_id = format!("EBAY-{}", Uuid::new_v4());
        let patch = ProductPatch {
            marketplace_listing_id: Some(listing_id.clone()),
            ..ProductPatch::default()
        };
        let product = self
            .products
            .update(product_id, &patch)
            .await
            .map_err(|err| PipelineError::from(err).with_stage("generate_listing"))?;
        info!(
            target = "inventory.pipeline",
            product_id,
            listing_id = %listing_id,
            "listing_generated"
        );
        Ok(product)
    }

    /// Store an analysis produced outside a run (batch jobs). Follows the
    /// same write rules as the AI step of a run.
    pub async fn apply_analysis(
        &self,
        user_id: &str,
        product_id: ProductId,
        market_analysis: MarketAnalysis,
    ) -> Result<Product, PipelineError> {
        let _flight = self.flights.acquire(product_id).await;
        let product = self.load_owned(user_id, product_id).await?;
        let mut analysis = product.analysis.clone().unwrap_or_default();
        let sale_price = synthesize(
            product.condition,
            product.purchase_price,
            Some(&market_analysis),
            None,
        );
        analysis.market_analysis = Some(market_analysis);
        let patch = ProductPatch {
            sale_price,
            analysis: Some(analysis),
            ..ProductPatch::default()
        };
        self.products
            .update(product_id, &patch)
            .await
            .map_err(|err| PipelineError::from(err).with_stage("persist_analysis"))
    }

    async fn persist(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        product: &Product,
        patch: &ProductPatch,
    ) -> Result<Product, PipelineError> {
        self.capture_stage(name, stages, async {
            let stored = self.products.update(product.id, patch).await?;
            let output = json!({
                "salePrice": stored.sale_price,
                "catalogueUpdated": patch.name.is_some(),
            });
            Ok::<_, PipelineError>(StageOutcome::new(stored, output))
        })
        .await
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await.map_err(|err| err.with_stage(name))?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn analysis_output(analysis: &MarketAnalysis) -> Value {
    json!({
        "demandScore": analysis.demand_score,
        "competitionLevel": analysis.competition_level,
        "priceSuggestion": analysis.price_suggestion,
        "category": analysis.category,
    })
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
    redirect_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    AuthRequired,
    NotFound,
    NoData,
    UpstreamMarketplace,
    UpstreamAi,
    UpstreamTimeout,
    Storage,
    Internal,
}

impl PipelineError {
    pub fn new(stage: &'static str, kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
            redirect_to: None,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::InvalidInput, message)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::NotFound, message)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Internal, message)
    }

    pub fn auth_required(stage: &'static str, redirect_to: impl Into<String>) -> Self {
        Self {
            redirect_to: Some(redirect_to.into()),
            ..Self::new(
                stage,
                PipelineErrorKind::AuthRequired,
                "marketplace account must be connected",
            )
        }
    }

    pub fn with_stage(mut self, stage: &'static str) -> Self {
        self.stage = stage;
        self
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    pub fn redirect_to(&self) -> Option<&str> {
        self.redirect_to.as_deref()
    }
}

impl From<AnalyzerError> for PipelineError {
    fn from(err: AnalyzerError) -> Self {
        let kind = match &err {
            AnalyzerError::InvalidInput(_) | AnalyzerError::AnalysisInvalid(_) => {
                PipelineErrorKind::InvalidInput
            }
            AnalyzerError::Upstream(LlmError::MissingApiKey) => PipelineErrorKind::Internal,
            AnalyzerError::Upstream(_) => PipelineErrorKind::UpstreamAi,
            AnalyzerError::Timeout => PipelineErrorKind::UpstreamTimeout,
        };
        Self::new("analyze", kind, err.to_string())
    }
}

impl From<MarketError> for PipelineError {
    fn from(err: MarketError) -> Self {
        let stage = "marketplace_price";
        match err {
            MarketError::AuthRequired { redirect_to } => Self::auth_required(stage, redirect_to),
            MarketError::NoData => Self::new(stage, PipelineErrorKind::NoData, err.to_string()),
            MarketError::Timeout => {
                Self::new(stage, PipelineErrorKind::UpstreamTimeout, err.to_string())
            }
            // Upstream bodies are logged by the client, never echoed.
            MarketError::Upstream { status, .. } => Self::new(
                stage,
                PipelineErrorKind::UpstreamMarketplace,
                format!("marketplace responded with HTTP {status}"),
            ),
            MarketError::Request(_) => Self::new(
                stage,
                PipelineErrorKind::UpstreamMarketplace,
                "marketplace request failed",
            ),
            MarketError::Storage(_) => Self::new(stage, PipelineErrorKind::Storage, err.to_string()),
        }
    }
}

impl From<ImageError> for PipelineError {
    fn from(err: ImageError) -> Self {
        let kind = match err {
            ImageError::Encode(_) => PipelineErrorKind::Internal,
            _ => PipelineErrorKind::InvalidInput,
        };
        Self::new("normalize_images", kind, err.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        let kind = match err {
            StoreError::NotFound(_) => PipelineErrorKind::NotFound,
            _ => PipelineErrorKind::Storage,
        };
        Self::new("storage", kind, err.to_string())
    }
}

impl From<CredentialError> for PipelineError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NotAuthorized => Self::new(
                "credentials",
                PipelineErrorKind::AuthRequired,
                err.to_string(),
            ),
            CredentialError::InvalidLifetime(_) => Self::invalid_input("credentials", err.to_string()),
            CredentialError::Storage(inner) => Self::from(inner).with_stage("credentials"),
        }
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}
