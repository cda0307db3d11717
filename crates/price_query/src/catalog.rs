use std::{cmp::Ordering, collections::BTreeSet, fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use cache::Clock;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{
    executor::{ExecutionError, Executor, ResultRow},
    query_spec::{Direction, Field, Predicate, QuerySpec, SortKey},
};

const REFERENCE_PRODUCTS: &[(&str, &str, f64)] = &[
    ("Onion", "Vegetables", 40.0),
    ("Apple", "Fruits", 150.0),
    ("Milk", "Dairy", 55.0),
    ("Bread", "Grocery", 25.0),
    ("Rice", "Grocery", 80.0),
    ("Oil", "Grocery", 120.0),
    ("Sugar", "Grocery", 50.0),
    ("Salt", "Grocery", 20.0),
];

/// (platform, price multiplier, mrp markup)
const REFERENCE_PLATFORMS: &[(&str, f64, f64)] = &[
    ("blinkit", 1.0, 1.2),
    ("zepto", 0.95, 1.15),
    ("instamart", 1.05, 1.1),
    ("bigbasket", 0.98, 1.25),
];

/// One observed price of a product on a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub name: String,
    pub platform: String,
    pub category: String,
    pub price: f64,
    pub mrp: f64,
    pub discount_percent: f64,
    pub observed_at: NaiveDateTime,
}

/// Distinct products, platforms and categories a catalog covers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub total_products: usize,
    pub total_platforms: usize,
    pub total_categories: usize,
}

/// In-memory price dataset that evaluates query specs directly.
pub struct MemoryCatalog {
    records: Vec<PriceRecord>,
    clock: Arc<dyn Clock>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl MemoryCatalog {
    pub fn new(records: Vec<PriceRecord>, clock: Arc<dyn Clock>) -> Self {
        Self { records, clock }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read price catalog {}", path.display()))?;
        let records: Vec<PriceRecord> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse price catalog {}", path.display()))?;

        log::info!("loaded {} price records from {}", records.len(), path.display());
        Ok(Self::new(records, clock))
    }

    /// Staple products on every platform, observed at the clock's current time.
    pub fn with_reference_prices(clock: Arc<dyn Clock>) -> Self {
        let observed_at = clock.now();
        let records = REFERENCE_PLATFORMS
            .iter()
            .flat_map(|&(platform, multiplier, markup)| {
                REFERENCE_PRODUCTS
                    .iter()
                    .map(move |&(name, category, base_price)| {
                        let price = round2(base_price * multiplier);
                        let mrp = round2(price * markup);
                        PriceRecord {
                            name: name.to_owned(),
                            platform: platform.to_owned(),
                            category: category.to_owned(),
                            price,
                            mrp,
                            discount_percent: round2((mrp - price) / mrp * 100.0),
                            observed_at,
                        }
                    })
            })
            .collect();

        Self::new(records, clock)
    }

    pub fn records(&self) -> &[PriceRecord] {
        &self.records
    }

    pub fn summary(&self) -> CatalogSummary {
        let distinct = |field: fn(&PriceRecord) -> &str| {
            self.records
                .iter()
                .map(|record| field(record).to_lowercase())
                .collect::<BTreeSet<_>>()
                .len()
        };

        CatalogSummary {
            total_products: distinct(|record| record.name.as_str()),
            total_platforms: distinct(|record| record.platform.as_str()),
            total_categories: distinct(|record| record.category.as_str()),
        }
    }

    pub fn query(&self, spec: &QuerySpec) -> Vec<ResultRow> {
        let now = self.clock.now();
        let mut matching: Vec<&PriceRecord> = self
            .records
            .iter()
            .filter(|record| {
                spec.predicates
                    .iter()
                    .all(|predicate| matches(predicate, record, now))
            })
            .collect();

        matching.sort_by(|a, b| compare(&spec.order_by, a, b));
        if let Some(limit) = spec.limit {
            matching.truncate(limit);
        }

        matching
            .into_iter()
            .map(|record| ResultRow {
                name: record.name.clone(),
                platform: record.platform.clone(),
                price: record.price,
                discount_percent: record.discount_percent,
                savings: spec
                    .include_savings
                    .then(|| round2(record.mrp - record.price)),
            })
            .collect()
    }
}

fn matches(predicate: &Predicate, record: &PriceRecord, now: NaiveDateTime) -> bool {
    match predicate {
        Predicate::NameContains { value } => contains_ignore_case(&record.name, value),
        Predicate::PlatformContains { value } => contains_ignore_case(&record.platform, value),
        Predicate::CategoryContains { value } => contains_ignore_case(&record.category, value),
        Predicate::PlatformIn { values } => values
            .iter()
            .any(|platform| platform.eq_ignore_ascii_case(&record.platform)),
        Predicate::DiscountAtLeast { percent } => record.discount_percent >= f64::from(*percent),
        Predicate::DiscountAbove { percent } => record.discount_percent > f64::from(*percent),
        Predicate::PriceAtMost { amount } => record.price <= f64::from(*amount),
        Predicate::ObservedWithin { seconds } => i64::try_from(*seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|window| now.checked_sub_signed(window))
            .is_none_or(|since| record.observed_at >= since),
    }
}

fn compare(order_by: &[SortKey], a: &PriceRecord, b: &PriceRecord) -> Ordering {
    for key in order_by {
        let ordering = match key.field {
            Field::ProductName => a.name.cmp(&b.name),
            Field::Platform => a.platform.cmp(&b.platform),
            Field::Category => a.category.cmp(&b.category),
            Field::DiscountPercent => a.discount_percent.total_cmp(&b.discount_percent),
            Field::Price => a.price.total_cmp(&b.price),
        };
        let ordering = match key.direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl Executor for MemoryCatalog {
    async fn execute(&self, spec: &QuerySpec) -> Result<Vec<ResultRow>, ExecutionError> {
        Ok(self.query(spec))
    }
}
