use std::fmt;

use serde::{Deserialize, Serialize};

use crate::intent::QueryIntent;

pub const FRESHNESS_WINDOW_SECS: u64 = 60 * 60;
pub const CHEAPEST_LIMIT: usize = 10;
pub const DISCOUNTED_LIMIT: usize = 20;
pub const BEST_DEALS_LIMIT: usize = 50;
pub const GENERIC_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    ProductName,
    Platform,
    Category,
    DiscountPercent,
    Price,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub field: Field,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(field: Field) -> Self {
        Self {
            field,
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: Field) -> Self {
        Self {
            field,
            direction: Direction::Desc,
        }
    }
}

/// One filter condition. A spec's predicates are combined with AND; text
/// comparisons are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    NameContains { value: String },
    PlatformContains { value: String },
    CategoryContains { value: String },
    PlatformIn { values: Vec<String> },
    DiscountAtLeast { percent: u32 },
    DiscountAbove { percent: u32 },
    PriceAtMost { amount: u32 },
    ObservedWithin { seconds: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySpec {
    pub predicates: Vec<Predicate>,
    pub order_by: Vec<SortKey>,
    /// `None` means unbounded.
    pub limit: Option<usize>,
    /// Rows carry `savings = mrp - price`.
    pub include_savings: bool,
}

pub fn build(intent: &QueryIntent) -> QuerySpec {
    match intent {
        QueryIntent::CheapestProduct { product } => QuerySpec {
            predicates: vec![
                Predicate::NameContains {
                    value: product.clone(),
                },
                Predicate::ObservedWithin {
                    seconds: FRESHNESS_WINDOW_SECS,
                },
            ],
            order_by: vec![SortKey::asc(Field::Price)],
            limit: Some(CHEAPEST_LIMIT),
            include_savings: false,
        },
        QueryIntent::DiscountedProducts {
            min_discount_percent,
            platform,
        } => QuerySpec {
            predicates: vec![
                Predicate::DiscountAtLeast {
                    percent: *min_discount_percent,
                },
                Predicate::PlatformContains {
                    value: platform.clone(),
                },
            ],
            order_by: vec![SortKey::desc(Field::DiscountPercent)],
            limit: Some(DISCOUNTED_LIMIT),
            include_savings: false,
        },
        QueryIntent::ComparePrices {
            category,
            platforms,
        } => QuerySpec {
            predicates: vec![
                Predicate::CategoryContains {
                    value: category.clone(),
                },
                Predicate::PlatformIn {
                    values: platforms.clone(),
                },
            ],
            order_by: vec![SortKey::asc(Field::ProductName), SortKey::asc(Field::Price)],
            limit: None,
            include_savings: false,
        },
        QueryIntent::BestDeals { budget } => QuerySpec {
            predicates: vec![
                Predicate::PriceAtMost { amount: *budget },
                Predicate::DiscountAbove { percent: 0 },
            ],
            order_by: vec![SortKey::desc(Field::DiscountPercent)],
            limit: Some(BEST_DEALS_LIMIT),
            include_savings: true,
        },
        QueryIntent::GenericSearch { raw_text } => QuerySpec {
            predicates: vec![Predicate::NameContains {
                value: raw_text.clone(),
            }],
            order_by: vec![SortKey::asc(Field::Price)],
            limit: Some(GENERIC_LIMIT),
            include_savings: false,
        },
    }
}

fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn like(value: &str) -> String {
    quoted(&format!("%{}%", value))
}

impl Field {
    fn column(self) -> &'static str {
        match self {
            Field::ProductName => "p.name",
            Field::Platform => "pl.name",
            Field::Category => "c.name",
            Field::DiscountPercent => "ph.discount_percentage",
            Field::Price => "ph.price",
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::NameContains { value } => write!(f, "p.name LIKE {}", like(value)),
            Predicate::PlatformContains { value } => write!(f, "pl.name LIKE {}", like(value)),
            Predicate::CategoryContains { value } => write!(f, "c.name LIKE {}", like(value)),
            Predicate::PlatformIn { values } => {
                let values: Vec<String> = values.iter().map(|value| quoted(value)).collect();
                write!(f, "pl.name IN ({})", values.join(", "))
            }
            Predicate::DiscountAtLeast { percent } => {
                write!(f, "ph.discount_percentage >= {}", percent)
            }
            Predicate::DiscountAbove { percent } => {
                write!(f, "ph.discount_percentage > {}", percent)
            }
            Predicate::PriceAtMost { amount } => write!(f, "ph.price <= {}", amount),
            Predicate::ObservedWithin { seconds } => {
                write!(f, "ph.timestamp >= datetime('now', '-{} seconds')", seconds)
            }
        }
    }
}

/// Renders the query as the equivalent SQL over the relational price schema.
impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SELECT p.name, pl.name AS platform, ph.price, ph.discount_percentage"
        )?;
        if self.include_savings {
            write!(f, ", (ph.mrp - ph.price) AS savings")?;
        }
        write!(
            f,
            " FROM products p \
             JOIN price_histories ph ON p.id = ph.product_id \
             JOIN platforms pl ON ph.platform_id = pl.id"
        )?;

        let needs_category = self
            .predicates
            .iter()
            .any(|predicate| matches!(predicate, Predicate::CategoryContains { .. }))
            || self.order_by.iter().any(|key| key.field == Field::Category);
        if needs_category {
            write!(f, " JOIN categories c ON p.category_id = c.id")?;
        }

        if !self.predicates.is_empty() {
            let conditions: Vec<String> = self.predicates.iter().map(|p| p.to_string()).collect();
            write!(f, " WHERE {}", conditions.join(" AND "))?;
        }

        if !self.order_by.is_empty() {
            let keys: Vec<String> = self
                .order_by
                .iter()
                .map(|key| match key.direction {
                    Direction::Asc => format!("{} ASC", key.field.column()),
                    Direction::Desc => format!("{} DESC", key.field.column()),
                })
                .collect();
            write!(f, " ORDER BY {}", keys.join(", "))?;
        }

        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }

        Ok(())
    }
}
