mod price_query_tool;
mod query_stats;
mod utils;

pub use crate::{
    price_query_tool::PriceQueryTool, query_stats::QueryStatsTool, utils::RateLimiter,
};
