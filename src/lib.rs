//! hyperstats - facet-permutation aggregation over a reliable queue
//!
//! - `pipeline` - the aggregator daemon's building blocks
//! - `sink` - producer side: validate and enqueue records
//! - `lookup` - read durable stats back by facet

pub mod pipeline;
pub mod sink;
pub mod lookup;
