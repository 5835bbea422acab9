//! Facet algebra - pure functions over facet components
//!
//! A record tagged with `device: [tablet, apple]` and `time: [2013, 1]`
//! contributes to every rollup built from prefix chains of its dimensions:
//!
//! ```text
//! [device, tablet]                    [time, 2013]
//! [device, tablet, apple]             [time, 2013, 1]
//! [device, tablet, time, 2013]        [device, tablet, apple, time, 2013]
//! [device, tablet, time, 2013, 1]     [device, tablet, apple, time, 2013, 1]
//! ```
//!
//! A record with D dimensions of depth `k_d` expands into `∏(1+k_d) − 1`
//! facets. Callers bound the shape of their facet sets (see
//! `permutation_count`); the algebra itself does not.

use super::types::{Facet, FacetId, FacetValue};
use sha1::{Digest, Sha1};

/// Digest bytes kept in a facet id (hex encoded → 18 chars)
pub const FACET_ID_BYTES: usize = 9;

/// Hash an ordered sequence of byte strings into a facet-style id
///
/// Each part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` hash
/// differently.
pub fn digest_parts<I, P>(parts: I) -> FacetId
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha1::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..FACET_ID_BYTES])
}

/// Stable content id of a facet component sequence
///
/// A single scalar is a one-element slice: `make_facet_id(&[value])`.
pub fn make_facet_id(components: &[FacetValue]) -> FacetId {
    digest_parts(components.iter().map(FacetValue::canonical))
}

/// Flatten a list of chains into one component sequence
///
/// `[[derp, 123], [merp, 456]]` becomes `[derp, 123, merp, 456]`.
pub fn flatten_facet(chains: &[Vec<FacetValue>]) -> Vec<FacetValue> {
    chains.iter().flatten().cloned().collect()
}

/// Split a flat component sequence into id, parent id and child label
///
/// Sequences of fewer than two components are root facets: their parent is
/// the empty sequence and their child label is empty.
pub fn split_facet(components: &[FacetValue]) -> Facet {
    let id = make_facet_id(components);
    match components.split_last() {
        Some((last, parent)) if !parent.is_empty() => Facet {
            id,
            parent_id: make_facet_id(parent),
            child: last.canonical(),
        },
        _ => Facet {
            id,
            parent_id: make_facet_id(&[]),
            child: String::new(),
        },
    }
}

/// Prefix chains of one dimension: `[dim, L1]`, `[dim, L1, L2]`, ...
fn prefix_chains(name: &str, levels: &[FacetValue]) -> Vec<Vec<FacetValue>> {
    (1..=levels.len())
        .map(|depth| {
            let mut chain = Vec::with_capacity(depth + 1);
            chain.push(FacetValue::Text(name.to_string()));
            chain.extend_from_slice(&levels[..depth]);
            chain
        })
        .collect()
}

/// All subsets of `items` with at least `min_len` members
///
/// Enumerated in binary counting order with the first item as the most
/// significant bit, so the output order is stable for a given input order.
fn power_set<T: Clone>(items: &[T], min_len: usize) -> Vec<Vec<T>> {
    let mut subsets: Vec<Vec<T>> = vec![Vec::new()];
    for item in items {
        let mut next = Vec::with_capacity(subsets.len() * 2);
        for subset in subsets {
            let mut with_item = subset.clone();
            with_item.push(item.clone());
            next.push(subset);
            next.push(with_item);
        }
        subsets = next;
    }
    subsets.retain(|s| s.len() >= min_len);
    subsets
}

/// Every concatenation choosing one chain per selected dimension
fn permute(dims: &[Vec<Vec<FacetValue>>]) -> Vec<Vec<FacetValue>> {
    let mut results: Vec<Vec<FacetValue>> = vec![Vec::new()];
    for chains in dims {
        let mut next = Vec::with_capacity(results.len() * chains.len());
        for prefix in &results {
            for chain in chains {
                let mut combined = prefix.clone();
                combined.extend_from_slice(chain);
                next.push(combined);
            }
        }
        results = next;
    }
    results
}

/// All dimensional rollups a facet set contributes to, as flat sequences
///
/// Dimensions without levels contribute nothing.
pub fn all_permutations(facets: &[(String, Vec<FacetValue>)]) -> Vec<Vec<FacetValue>> {
    let dims: Vec<Vec<Vec<FacetValue>>> = facets
        .iter()
        .filter(|(_, levels)| !levels.is_empty())
        .map(|(name, levels)| prefix_chains(name, levels))
        .collect();

    power_set(&dims, 1)
        .iter()
        .flat_map(|selection| permute(selection))
        .collect()
}

/// Flat components of the single facet a facet set names exactly
///
/// Every dimension at its full depth, in the given order. This is the facet
/// lookups address; it is also the last rollup `all_permutations` yields.
pub fn facet_components(facets: &[(String, Vec<FacetValue>)]) -> Vec<FacetValue> {
    let chains: Vec<Vec<FacetValue>> = facets
        .iter()
        .filter_map(|(name, levels)| prefix_chains(name, levels).pop())
        .collect();
    flatten_facet(&chains)
}

/// Number of facets `all_permutations` will produce (saturating)
pub fn permutation_count(facets: &[(String, Vec<FacetValue>)]) -> usize {
    facets
        .iter()
        .fold(1usize, |acc, (_, levels)| acc.saturating_mul(levels.len() + 1))
        - 1
}

/// Expand a facet set straight into `Facet`s
pub fn expand(facets: &[(String, Vec<FacetValue>)]) -> Vec<Facet> {
    all_permutations(facets)
        .iter()
        .map(|components| split_facet(components))
        .collect()
}
