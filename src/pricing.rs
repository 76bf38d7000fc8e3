use crate::models::{Condition, MarketAnalysis, MarketplaceData, PriceSuggestion};

/// Minimum sale price multiple over purchase cost.
pub const MIN_MARGIN: f64 = 1.20;

/// Markup applied to purchase cost when no market signal is available.
pub const BASELINE_MARKUP: f64 = 1.40;

const HIGH_DEMAND_SOLD: u64 = 30;
const LOW_DEMAND_SOLD: u64 = 10;
const HIGH_COMPETITION_LISTINGS: u32 = 50;

const HIGH_DEMAND_FACTOR: f64 = 1.10;
const LOW_DEMAND_FACTOR: f64 = 0.90;
const HIGH_COMPETITION_FACTOR: f64 = 0.95;

const MARKET_WEIGHT: f64 = 0.6;
const SUGGESTION_WEIGHT: f64 = 0.4;

// Binary float noise (e.g. 220 * 0.7) must not push a value across a whole unit.
const EPSILON: f64 = 1e-9;

/// Derive a sale price from the strongest signal available.
///
/// Precedence: marketplace data (adjusted for demand and competition, blended
/// with the AI suggestion when both exist), then the AI suggestion alone, then
/// a markup over purchase cost. Whenever a purchase price is known the result
/// never drops below `ceil(purchase_price * 1.20)`.
///
/// Returns `None` when no signal at all was provided.
pub fn synthesize(
    condition: Condition,
    purchase_price: Option<f64>,
    market_analysis: Option<&MarketAnalysis>,
    marketplace_data: Option<&MarketplaceData>,
) -> Option<f64> {
    synthesize_from_suggestion(
        condition,
        purchase_price,
        market_analysis.map(|analysis| analysis.price_suggestion),
        marketplace_data,
    )
}

/// [`synthesize`] over a bare price range, for callers that hold a price
/// hint but no full analysis.
pub fn synthesize_from_suggestion(
    condition: Condition,
    purchase_price: Option<f64>,
    suggestion: Option<PriceSuggestion>,
    marketplace_data: Option<&MarketplaceData>,
) -> Option<f64> {
    let discount = condition.discount();

    let adjusted = if let Some(market) = marketplace_data {
        let mut base = market.recommended_price;
        if market.sold_count > HIGH_DEMAND_SOLD {
            base *= HIGH_DEMAND_FACTOR;
        } else if market.sold_count < LOW_DEMAND_SOLD {
            base *= LOW_DEMAND_FACTOR;
        }
        if market.active_listings > HIGH_COMPETITION_LISTINGS {
            base *= HIGH_COMPETITION_FACTOR;
        }
        if let Some(suggestion) = suggestion {
            base = MARKET_WEIGHT * base + SUGGESTION_WEIGHT * suggestion.midpoint();
        }
        floor_whole(base * discount)
    } else if let Some(suggestion) = suggestion {
        floor_whole(suggestion.min * discount)
    } else {
        let purchase = purchase_price?;
        ceil_whole(purchase * BASELINE_MARKUP / discount)
    };

    let clamped = match purchase_price {
        Some(purchase) => adjusted.max(minimum_sale_price(purchase)),
        None => adjusted,
    };
    Some(round_two(clamped))
}

/// Lowest sale price that keeps the required margin over `purchase_price`.
pub fn minimum_sale_price(purchase_price: f64) -> f64 {
    ceil_whole(purchase_price * MIN_MARGIN)
}

pub fn round_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn floor_whole(value: f64) -> f64 {
    (value + EPSILON).floor()
}

fn ceil_whole(value: f64) -> f64 {
    (value - EPSILON).ceil()
}
