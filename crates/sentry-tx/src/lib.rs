//! # Sentry Filters - Stream Processing Operators
//!
//! This crate provides the filter operators sitting between a source and a
//! sink in a watchtower-sentry pipeline. Filters consume `(key, value, time)`
//! samples from upstream and emit zero or more samples per input.
//!
//! ## Available Filters
//!
//! - **TimeOrder**: restore strict per-key time order with a bounded reorder buffer
//! - **TimeOrderChecker**: assert per-key time order, passing samples through
//! - **Keyfilter**: pass only samples whose key matches a pattern
//! - **KeyEntity**: rewrite keys to `entitytype/code` via pattern captures
//! - **ToSigned**: reinterpret 64-bit unsigned magnitudes as signed
//! - **AggSum**: sum values across groups of keys with bucket and timeout expiry
//! - **AggTimeMedian**: per-key median over aligned time bins
//! - **MovingStat**: sliding-window statistic with inpainting of extremes
//!
//! Each filter keeps its streaming logic in synchronous `process`/`finish`
//! methods; the async `Filter` impl is a thin channel loop around them, and
//! unit tests drive the methods directly.

use sentry_core::{config::StageSpec, Context, Filter, SentryError};

pub mod agg_sum;
pub mod agg_time_median;
pub mod key_entity;
pub mod key_filter;
pub mod moving_stat;
pub mod time_order;
pub mod time_order_checker;
pub mod to_signed;

pub use agg_sum::AggSum;
pub use agg_time_median::AggTimeMedian;
pub use key_entity::KeyEntity;
pub use key_filter::Keyfilter;
pub use moving_stat::MovingStat;
pub use time_order::TimeOrder;
pub use time_order_checker::TimeOrderChecker;
pub use to_signed::ToSigned;

/// Build a filter from its configuration entry.
pub fn create_filter(spec: &StageSpec, ctx: &mut Context) -> Result<Box<dyn Filter>, SentryError> {
    match spec {
        StageSpec::TimeOrder(s) => Ok(Box::new(TimeOrder::new(s.clone()))),
        StageSpec::TimeOrderChecker(s) => Ok(Box::new(TimeOrderChecker::new(s.clone()))),
        StageSpec::Keyfilter(s) => Ok(Box::new(Keyfilter::new(s.clone())?)),
        StageSpec::KeyEntity(s) => Ok(Box::new(KeyEntity::new(s.clone())?)),
        StageSpec::ToSigned(s) => Ok(Box::new(ToSigned::new(s.clone()))),
        StageSpec::AggSum(s) => Ok(Box::new(AggSum::new(s.clone())?)),
        StageSpec::AggTimeMedian(s) => Ok(Box::new(AggTimeMedian::new(s.clone()))),
        StageSpec::MovingStat(s) => Ok(Box::new(MovingStat::new(s.clone(), ctx)?)),
        other => Err(SentryError::user(format!(
            "{} is not a Filter",
            other.module()
        ))),
    }
}
