use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const KNOWN_PRODUCTS: &[&str] = &[
    "onion", "apple", "milk", "bread", "rice", "oil", "sugar", "salt",
];

/// Priority order used when a single platform is extracted.
pub const KNOWN_PLATFORMS: &[&str] = &["blinkit", "zepto", "instamart", "bigbasket"];

/// Check order for comparisons; the resulting platform list keeps this order.
const COMPARISON_PLATFORMS: &[&str] = &["zepto", "instamart", "blinkit", "bigbasket"];

pub const KNOWN_CATEGORIES: &[&str] = &["fruit", "vegetable", "dairy", "grocery", "snacks"];

const DEFAULT_PRODUCT: &str = "product";
const DEFAULT_DISCOUNT_PERCENT: u32 = 20;
const DEFAULT_PLATFORM: &str = "blinkit";
const DEFAULT_CATEGORY: &str = "grocery";
const DEFAULT_COMPARISON_PLATFORMS: &[&str] = &["blinkit", "zepto"];
const DEFAULT_BUDGET: u32 = 1000;

static DISCOUNT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)%").expect("discount pattern is valid"));

static BUDGET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[₹$]\s*(\d+)").expect("budget pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum QueryIntent {
    CheapestProduct {
        product: String,
    },
    DiscountedProducts {
        min_discount_percent: u32,
        platform: String,
    },
    ComparePrices {
        category: String,
        /// Distinct platform names in check order.
        platforms: Vec<String>,
    },
    BestDeals {
        budget: u32,
    },
    GenericSearch {
        raw_text: String,
    },
}

struct Rule {
    name: &'static str,
    matches: fn(&str) -> bool,
    build: fn(&str) -> QueryIntent,
}

/// Evaluated top to bottom against the lower-cased text; the first match wins.
const RULES: &[Rule] = &[
    Rule {
        name: "cheapest_product",
        matches: asks_for_cheapest_product,
        build: cheapest_product,
    },
    Rule {
        name: "discounted_products",
        matches: asks_for_platform_discounts,
        build: discounted_products,
    },
    Rule {
        name: "compare_prices",
        matches: asks_for_comparison,
        build: compare_prices,
    },
    Rule {
        name: "best_deals",
        matches: asks_for_best_deals,
        build: best_deals,
    },
];

/// Names of the classification rules in evaluation order.
pub fn rule_names() -> impl Iterator<Item = &'static str> {
    RULES.iter().map(|rule| rule.name)
}

/// Resolves free text to exactly one intent. Never fails: text no rule
/// accepts becomes a [`QueryIntent::GenericSearch`] over the original text.
pub fn classify(text: &str) -> QueryIntent {
    let lowered = text.to_lowercase();

    match RULES.iter().find(|rule| (rule.matches)(&lowered)) {
        Some(rule) => {
            log::debug!("classified {:?} as {}", text, rule.name);
            (rule.build)(&lowered)
        }
        None => {
            log::debug!("no rule matched {:?}, using generic search", text);
            QueryIntent::GenericSearch {
                raw_text: text.to_owned(),
            }
        }
    }
}

fn first_known<'a>(text: &str, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .find(|candidate| text.contains(candidate))
}

fn first_number(pattern: &Regex, text: &str) -> Option<u32> {
    pattern
        .captures(text)
        .and_then(|captures| captures[1].parse().ok())
}

fn asks_for_cheapest_product(text: &str) -> bool {
    text.contains("cheapest") && first_known(text, KNOWN_PRODUCTS).is_some()
}

fn asks_for_platform_discounts(text: &str) -> bool {
    text.contains("discount") && first_known(text, KNOWN_PLATFORMS).is_some()
}

fn asks_for_comparison(text: &str) -> bool {
    text.contains("compare") && text.contains("between")
}

fn asks_for_best_deals(text: &str) -> bool {
    text.contains("best deals") || text.contains("grocery list")
}

fn cheapest_product(text: &str) -> QueryIntent {
    QueryIntent::CheapestProduct {
        product: first_known(text, KNOWN_PRODUCTS)
            .unwrap_or(DEFAULT_PRODUCT)
            .to_owned(),
    }
}

fn discounted_products(text: &str) -> QueryIntent {
    QueryIntent::DiscountedProducts {
        min_discount_percent: first_number(&DISCOUNT_PATTERN, text)
            .unwrap_or(DEFAULT_DISCOUNT_PERCENT),
        platform: first_known(text, KNOWN_PLATFORMS)
            .unwrap_or(DEFAULT_PLATFORM)
            .to_owned(),
    }
}

fn compare_prices(text: &str) -> QueryIntent {
    let mut platforms: Vec<String> = COMPARISON_PLATFORMS
        .iter()
        .filter(|platform| text.contains(*platform))
        .map(|platform| platform.to_string())
        .collect();

    if platforms.is_empty() {
        platforms = DEFAULT_COMPARISON_PLATFORMS
            .iter()
            .map(|platform| platform.to_string())
            .collect();
    }

    QueryIntent::ComparePrices {
        category: first_known(text, KNOWN_CATEGORIES)
            .unwrap_or(DEFAULT_CATEGORY)
            .to_owned(),
        platforms,
    }
}

fn best_deals(text: &str) -> QueryIntent {
    QueryIntent::BestDeals {
        budget: first_number(&BUDGET_PATTERN, text).unwrap_or(DEFAULT_BUDGET),
    }
}
