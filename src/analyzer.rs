use crate::images::{ACCEPTED_MIME_TYPES, EncodedImage};
use crate::llm::{GenerateRequest, Generator, LlmError, Part, Sampling};
use crate::models::{MarketAnalysis, ProductId, ProductInsight};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

pub const BATCH_CHUNK_SIZE: usize = 5;
pub const BATCH_CHUNK_GAP: Duration = Duration::from_secs(1);

const SEO_KEYWORDS: std::ops::RangeInclusive<usize> = 5..=7;
const SUGGESTIONS: std::ops::RangeInclusive<usize> = 3..=5;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("model response failed validation: {0}")]
    AnalysisInvalid(String),
    #[error("model call failed: {0}")]
    Upstream(#[from] LlmError),
    #[error("model call timed out")]
    Timeout,
}

static RESPONSE_SHAPE: Lazy<String> = Lazy::new(|| {
    let shape = json!({
        "demandScore": "integer 0-100",
        "competitionLevel": "one of: low, medium, high",
        "priceSuggestion": {"min": "number, USD", "max": "number, USD, >= min"},
        "seoKeywords": "array of 5-7 short search keywords",
        "suggestions": "array of 3-5 short, actionable selling tips",
        "category": "marketplace category name",
        "title": "listing title, at most 80 characters",
        "description": "listing description, 2-4 sentences"
    });
    serde_json::to_string_pretty(&shape).unwrap_or_default()
});

fn text_prompt(name: &str, description: &str) -> String {
    format!(
        "You are a resale market analyst for a small online shop.\n\
         Analyze the product below for resale on eBay US.\n\n\
         Product name: {name}\n\
         Product description: {description}\n\n\
         Respond with one JSON object and nothing else. Use exactly these keys and no others:\n{shape}",
        shape = *RESPONSE_SHAPE,
    )
}

fn image_prompt(count: usize) -> String {
    format!(
        "You are a resale market analyst for a small online shop.\n\
         Identify the product shown in the {count} attached photo(s) and analyze it for resale on eBay US.\n\
         The `title`, `description` and `category` keys are required and must describe the pictured item.\n\n\
         Respond with one JSON object and nothing else. Use exactly these keys and no others:\n{shape}",
        shape = *RESPONSE_SHAPE,
    )
}

/// First balanced `{...}` span of `text`, ignoring braces inside JSON strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn invalid(message: impl Into<String>) -> AnalyzerError {
    AnalyzerError::AnalysisInvalid(message.into())
}

fn trimmed_list(values: Vec<String>, field: &str) -> Result<Vec<String>, AnalyzerError> {
    let cleaned: Vec<String> = values
        .into_iter()
        .map(|value| value.trim().to_string())
        .collect();
    if cleaned.iter().any(String::is_empty) {
        return Err(invalid(format!("{field} contains an empty entry")));
    }
    Ok(cleaned)
}

pub fn validate(mut analysis: MarketAnalysis) -> Result<MarketAnalysis, AnalyzerError> {
    if analysis.demand_score > 100 {
        return Err(invalid("demandScore out of range"));
    }
    let suggestion = analysis.price_suggestion;
    if !suggestion.min.is_finite() || !suggestion.max.is_finite() || suggestion.min < 0.0 {
        return Err(invalid("priceSuggestion must be non-negative numbers"));
    }
    if suggestion.min > suggestion.max {
        return Err(invalid("priceSuggestion.min exceeds max"));
    }
    analysis.seo_keywords = trimmed_list(analysis.seo_keywords, "seoKeywords")?;
    if !SEO_KEYWORDS.contains(&analysis.seo_keywords.len()) {
        return Err(invalid(format!(
            "expected 5-7 seoKeywords, got {}",
            analysis.seo_keywords.len()
        )));
    }
    analysis.suggestions = trimmed_list(analysis.suggestions, "suggestions")?;
    if !SUGGESTIONS.contains(&analysis.suggestions.len()) {
        return Err(invalid(format!(
            "expected 3-5 suggestions, got {}",
            analysis.suggestions.len()
        )));
    }
    analysis.category = analysis.category.trim().to_string();
    if analysis.category.is_empty() {
        return Err(invalid("category is empty"));
    }
    analysis.title = analysis.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
    analysis.description = analysis
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());
    Ok(analysis)
}

pub fn parse_response(text: &str) -> Result<MarketAnalysis, AnalyzerError> {
    let span = extract_json_object(text).ok_or_else(|| invalid("no JSON object in response"))?;
    let analysis: MarketAnalysis =
        serde_json::from_str(span).map_err(|err| invalid(err.to_string()))?;
    validate(analysis)
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub id: ProductId,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Ok {
        #[serde(rename = "marketAnalysis")]
        market_analysis: MarketAnalysis,
    },
    Failed {
        error: String,
    },
}

/// Structured market analysis on top of a generative model.
#[derive(Clone)]
pub struct Analyzer {
    generator: Arc<dyn Generator>,
    timeout: Duration,
    sampling: Sampling,
    chunk_gap: Duration,
}

impl Analyzer {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self {
            generator,
            timeout,
            sampling: Sampling::default(),
            chunk_gap: BATCH_CHUNK_GAP,
        }
    }

    async fn call(&self, parts: Vec<Part>) -> Result<String, AnalyzerError> {
        let request = GenerateRequest {
            parts,
            sampling: self.sampling,
        };
        timeout(self.timeout, self.generator.generate(&request))
            .await
            .map_err(|_| AnalyzerError::Timeout)?
            .map_err(AnalyzerError::from)
    }

    pub async fn analyze_text(
        &self,
        name: &str,
        description: &str,
    ) -> Result<MarketAnalysis, AnalyzerError> {
        let (name, description) = (name.trim(), description.trim());
        if name.is_empty() || description.is_empty() {
            return Err(AnalyzerError::InvalidInput(
                "name and description are required".into(),
            ));
        }
        let text = self.call(vec![Part::Text(text_prompt(name, description))]).await?;
        let analysis = parse_response(&text).inspect_err(|err| {
            warn!(target = "inventory.analyzer", error = %err, mode = "text", "analysis_rejected");
        })?;
        info!(
            target = "inventory.analyzer",
            mode = "text",
            demand_score = analysis.demand_score,
            "analysis_ready"
        );
        Ok(analysis)
    }

    pub async fn analyze_images(
        &self,
        images: &[EncodedImage],
    ) -> Result<ProductInsight, AnalyzerError> {
        if images.is_empty() {
            return Err(AnalyzerError::InvalidInput("at least one image is required".into()));
        }
        let mut parts = vec![Part::Text(image_prompt(images.len()))];
        for image in images {
            if !ACCEPTED_MIME_TYPES.contains(&image.mime_type.as_str()) {
                return Err(AnalyzerError::InvalidInput(format!(
                    "unsupported image type {}",
                    image.mime_type
                )));
            }
            if image.data.is_empty() || BASE64.decode(&image.data).is_err() {
                return Err(AnalyzerError::InvalidInput("image data is not base64".into()));
            }
            parts.push(Part::InlineData {
                mime_type: image.mime_type.clone(),
                data: image.data.clone(),
            });
        }

        let text = self.call(parts).await?;
        let analysis = parse_response(&text).inspect_err(|err| {
            warn!(target = "inventory.analyzer", error = %err, mode = "images", "analysis_rejected");
        })?;
        let title = analysis
            .title
            .clone()
            .ok_or_else(|| invalid("title is required for image analysis"))?;
        let description = analysis
            .description
            .clone()
            .ok_or_else(|| invalid("description is required for image analysis"))?;
        info!(
            target = "inventory.analyzer",
            mode = "images",
            images = images.len(),
            demand_score = analysis.demand_score,
            "analysis_ready"
        );
        Ok(ProductInsight {
            title,
            description,
            category: analysis.category.clone(),
            market_analysis: analysis,
        })
    }

    /// Text analysis for many products. Items run in concurrent chunks with
    /// a pause between chunks; a failing item never fails the batch.
    pub async fn analyze_batch(&self, items: Vec<BatchItem>) -> BTreeMap<ProductId, BatchOutcome> {
        let mut results = BTreeMap::new();
        let chunks: Vec<Vec<BatchItem>> = items
            .chunks(BATCH_CHUNK_SIZE)
            .map(<[BatchItem]>::to_vec)
            .collect();
        let total_chunks = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let handles: Vec<_> = chunk
                .into_iter()
                .map(|item| {
                    let analyzer = self.clone();
                    let id = item.id;
                    let handle = tokio::spawn(async move {
                        analyzer.analyze_text(&item.name, &item.description).await
                    });
                    (id, handle)
                })
                .collect();

            for (id, handle) in handles {
                let outcome = match handle.await {
                    Ok(Ok(market_analysis)) => BatchOutcome::Ok { market_analysis },
                    Ok(Err(err)) => BatchOutcome::Failed {
                        error: err.to_string(),
                    },
                    Err(err) => BatchOutcome::Failed {
                        error: format!("analysis task aborted: {err}"),
                    },
                };
                results.insert(id, outcome);
            }

            if index + 1 < total_chunks {
                sleep(self.chunk_gap).await;
            }
        }
        results
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    pub(crate) fn analysis_json(min: f64, max: f64) -> serde_json::Value {
        json!({
            "demandScore": 72,
            "competitionLevel": "medium",
            "priceSuggestion": {"min": min, "max": max},
            "seoKeywords": ["vintage camera", "35mm", "film slr", "nikon", "manual focus"],
            "suggestions": ["Photograph the shutter", "Mention light seals", "Ship insured"],
            "category": "Film Cameras",
            "title": "Nikon FM2 35mm Film Camera Body",
            "description": "Fully mechanical SLR in working order."
        })
    }

    /// Generator that replays a canned reply and records every prompt.
    pub(crate) struct ScriptedGenerator {
        pub reply: Mutex<Box<dyn Fn(&GenerateRequest) -> Result<String, LlmError> + Send>>,
        pub calls: AtomicUsize,
        pub last: Mutex<Option<GenerateRequest>>,
        pub delay: Duration,
        in_flight: AtomicUsize,
        pub peak: AtomicUsize,
    }

    impl ScriptedGenerator {
        pub(crate) fn new(
            reply: impl Fn(&GenerateRequest) -> Result<String, LlmError> + Send + 'static,
        ) -> Self {
            Self {
                reply: Mutex::new(Box::new(reply)),
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        pub(crate) fn replying(text: String) -> Self {
            Self::new(move |_| Ok(text.clone()))
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request.clone());
            (self.reply.lock().unwrap())(request)
        }
    }

    fn analyzer(generator: Arc<ScriptedGenerator>) -> Analyzer {
        Analyzer::new(generator, Duration::from_secs(30))
    }

    #[test]
    fn extracts_first_object_around_prose() {
        let text = "Sure! Here is the analysis:\n{\"a\": {\"b\": \"}{\"}, \"c\": 1}\nLet me know {if} you need more.";
        assert_eq!(
            extract_json_object(text),
            Some("{\"a\": {\"b\": \"}{\"}, \"c\": 1}")
        );
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("{\"open\": true"), None);
        assert_eq!(
            extract_json_object(r#"{"q": "say \"hi\" {"}"#),
            Some(r#"{"q": "say \"hi\" {"}"#)
        );
    }

    #[tokio::test]
    async fn text_mode_parses_wrapped_json() {
        let reply = format!("```json\n{}\n```", analysis_json(40.0, 75.0));
        let generator = Arc::new(ScriptedGenerator::replying(reply));
        let analysis = analyzer(generator.clone())
            .analyze_text("Nikon FM2", "Mechanical 35mm SLR body")
            .await
            .expect("analysis");
        assert_eq!(analysis.demand_score, 72);
        assert_eq!(analysis.price_suggestion.min, 40.0);
        assert_eq!(analysis.seo_keywords.len(), 5);

        let request = generator.last.lock().unwrap().clone().unwrap();
        let Part::Text(prompt) = &request.parts[0] else {
            panic!("expected text prompt");
        };
        assert!(prompt.contains("Nikon FM2"));
        assert!(prompt.contains("Mechanical 35mm SLR body"));
        assert!(request.sampling.temperature <= 0.7);
        assert!(request.sampling.top_p <= 0.8);
        assert!(request.sampling.top_k <= 40);
    }

    #[tokio::test]
    async fn inverted_price_range_is_rejected() {
        let generator = Arc::new(ScriptedGenerator::replying(
            analysis_json(90.0, 10.0).to_string(),
        ));
        let err = analyzer(generator)
            .analyze_text("Lamp", "Brass desk lamp")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::AnalysisInvalid(_)));
    }

    #[tokio::test]
    async fn extra_keys_and_short_lists_are_rejected() {
        let mut extra = analysis_json(1.0, 2.0);
        extra["confidence"] = json!(0.9);
        assert!(matches!(
            parse_response(&extra.to_string()),
            Err(AnalyzerError::AnalysisInvalid(_))
        ));

        let mut short = analysis_json(1.0, 2.0);
        short["seoKeywords"] = json!(["one", "two", "three", "four"]);
        assert!(matches!(
            parse_response(&short.to_string()),
            Err(AnalyzerError::AnalysisInvalid(_))
        ));

        let mut bad_level = analysis_json(1.0, 2.0);
        bad_level["competitionLevel"] = json!("extreme");
        assert!(parse_response(&bad_level.to_string()).is_err());

        let mut high_score = analysis_json(1.0, 2.0);
        high_score["demandScore"] = json!(140);
        assert!(parse_response(&high_score.to_string()).is_err());
    }

    #[tokio::test]
    async fn missing_inputs_never_reach_the_model() {
        let generator = Arc::new(ScriptedGenerator::replying("{}".into()));
        let analyzer = analyzer(generator.clone());
        assert!(matches!(
            analyzer.analyze_text("  ", "desc").await,
            Err(AnalyzerError::InvalidInput(_))
        ));
        let gif = EncodedImage {
            mime_type: "image/gif".into(),
            data: "R0lGOD".into(),
        };
        assert!(matches!(
            analyzer.analyze_images(&[gif]).await,
            Err(AnalyzerError::InvalidInput(_))
        ));
        assert!(matches!(
            analyzer.analyze_images(&[]).await,
            Err(AnalyzerError::InvalidInput(_))
        ));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn image_mode_attaches_inline_parts() {
        let generator = Arc::new(ScriptedGenerator::replying(
            analysis_json(60.0, 110.0).to_string(),
        ));
        let images = vec![
            EncodedImage {
                mime_type: "image/jpeg".into(),
                data: BASE64.encode([0xFF, 0xD8, 0xFF]),
            },
            EncodedImage {
                mime_type: "image/webp".into(),
                data: BASE64.encode(b"RIFF"),
            },
        ];
        let insight = analyzer(generator.clone())
            .analyze_images(&images)
            .await
            .expect("insight");
        assert_eq!(insight.title, "Nikon FM2 35mm Film Camera Body");
        assert_eq!(insight.category, "Film Cameras");

        let request = generator.last.lock().unwrap().clone().unwrap();
        assert_eq!(request.parts.len(), 3);
        assert!(matches!(
            &request.parts[2],
            Part::InlineData { mime_type, .. } if mime_type == "image/webp"
        ));
    }

    #[tokio::test]
    async fn image_mode_requires_title() {
        let mut reply = analysis_json(60.0, 110.0);
        reply.as_object_mut().unwrap().remove("title");
        let generator = Arc::new(ScriptedGenerator::replying(reply.to_string()));
        let image = EncodedImage {
            mime_type: "image/png".into(),
            data: BASE64.encode(b"\x89PNG"),
        };
        assert!(matches!(
            analyzer(generator).analyze_images(&[image]).await,
            Err(AnalyzerError::AnalysisInvalid(_))
        ));
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let mut generator = ScriptedGenerator::replying(analysis_json(1.0, 2.0).to_string());
        generator.delay = Duration::from_millis(200);
        let analyzer = Analyzer::new(Arc::new(generator), Duration::from_millis(20));
        assert!(matches!(
            analyzer.analyze_text("Lamp", "Brass").await,
            Err(AnalyzerError::Timeout)
        ));
    }

    #[tokio::test]
    async fn batch_isolates_failures_and_paces_chunks() {
        let mut generator = ScriptedGenerator::new(|request| {
            let Part::Text(prompt) = &request.parts[0] else {
                unreachable!()
            };
            if prompt.contains("Broken") {
                Err(LlmError::Http("HTTP 500".into()))
            } else {
                Ok(analysis_json(5.0, 9.0).to_string())
            }
        });
        generator.delay = Duration::from_millis(30);
        let generator = Arc::new(generator);
        let items: Vec<BatchItem> = (1..=7)
            .map(|id| BatchItem {
                id,
                name: if id == 3 { "Broken".into() } else { format!("Item {id}") },
                description: "Used, works".into(),
            })
            .collect();

        let started = Instant::now();
        let results = analyzer(generator.clone()).analyze_batch(items).await;
        assert!(started.elapsed() >= BATCH_CHUNK_GAP);
        assert_eq!(results.len(), 7);
        assert!(matches!(results[&3], BatchOutcome::Failed { .. }));
        assert!(matches!(results[&7], BatchOutcome::Ok { .. }));
        assert!(generator.peak.load(Ordering::SeqCst) <= BATCH_CHUNK_SIZE);
        assert_eq!(generator.calls(), 7);
    }
}
