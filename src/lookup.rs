//! Read durable stats back by facet
//!
//! - `get_values` - counters of exactly one facet
//! - `find_values` - child labels (and optionally counters) under a facet,
//!   sorted by label, paged with a start key

use crate::pipeline::backend::{BackendError, StatsStore};
use crate::pipeline::facets::{facet_components, make_facet_id, split_facet};
use crate::pipeline::types::{CounterMap, FacetSet};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindQuery {
    pub limit: usize,

    /// Only children whose label sorts strictly after this one
    pub start_key: Option<String>,

    pub with_values: bool,
}

impl Default for FindQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            start_key: None,
            with_values: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FindResults {
    Labels(Vec<String>),
    Values(BTreeMap<String, CounterMap>),
}

impl FindResults {
    pub fn len(&self) -> usize {
        match self {
            FindResults::Labels(labels) => labels.len(),
            FindResults::Values(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable counters of one facet; `None` if it was never synced
pub async fn get_values<S: StatsStore>(store: &S, facets: &FacetSet) -> Result<Option<CounterMap>, BackendError> {
    let facet = split_facet(&facet_components(facets));
    Ok(store.get(&facet.id).await?.map(|record| record.values))
}

/// Children of the facet named by `facets`
///
/// For `{"device": ["tablet"]}` this lists the labels stored one level
/// below `device/tablet`, e.g. `apple`, `samsung`.
pub async fn find_values<S: StatsStore>(
    store: &S,
    facets: &FacetSet,
    query: &FindQuery,
) -> Result<FindResults, BackendError> {
    let parent_id = make_facet_id(&facet_components(facets));
    let children = store
        .scan_children(&parent_id, query.start_key.as_deref(), query.limit)
        .await?;

    Ok(if query.with_values {
        FindResults::Values(children.into_iter().map(|r| (r.facet, r.values)).collect())
    } else {
        FindResults::Labels(children.into_iter().map(|r| r.facet).collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::backend::{AggregationBuffer, FacetWrite};
    use crate::pipeline::facets::expand;
    use crate::pipeline::memory::MemoryBackend;
    use crate::pipeline::reconciler::{Reconciler, ReconcilerConfig};
    use crate::pipeline::scheduler::sweep;
    use crate::pipeline::state::{DaemonContext, StopFlag};
    use crate::pipeline::types::FacetValue;
    use std::time::Duration;

    fn device(levels: &[&str]) -> FacetSet {
        vec![("device".to_string(), levels.iter().map(|l| FacetValue::from(*l)).collect())]
    }

    fn views(n: i64) -> CounterMap {
        let mut values = CounterMap::new();
        values.insert("views".to_string(), n);
        values
    }

    async fn synced(records: &[(&[&str], i64)]) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for (levels, n) in records {
            let writes: Vec<FacetWrite> = expand(&device(levels))
                .into_iter()
                .map(|facet| FacetWrite { facet, deltas: views(*n) })
                .collect();
            backend.apply(&writes).await.unwrap();
        }
        let reconciler = Reconciler::new(backend.clone(), ReconcilerConfig::default());
        let mut ctx = DaemonContext::new(StopFlag::new(), Duration::from_secs(3600));
        sweep(&backend, &reconciler, &mut ctx).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_get_values() {
        let backend = synced(&[(&["tablet", "apple"], 2), (&["tablet", "samsung"], 1)]).await;

        assert_eq!(get_values(&backend, &device(&["tablet"])).await.unwrap(), Some(views(3)));
        assert_eq!(get_values(&backend, &device(&["tablet", "apple"])).await.unwrap(), Some(views(2)));
        assert_eq!(get_values(&backend, &device(&["phone"])).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_values_pages_children() {
        let backend = synced(&[
            (&["tablet", "apple"], 2),
            (&["tablet", "samsung"], 1),
            (&["tablet", "lenovo"], 4),
            (&["phone", "apple"], 1),
        ])
        .await;

        let tablet = device(&["tablet"]);
        let all = find_values(&backend, &tablet, &FindQuery::default()).await.unwrap();
        assert_eq!(
            all,
            FindResults::Labels(vec!["apple".into(), "lenovo".into(), "samsung".into()])
        );

        let page = FindQuery {
            limit: 1,
            start_key: Some("apple".into()),
            with_values: true,
        };
        let next = find_values(&backend, &tablet, &page).await.unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("lenovo".to_string(), views(4));
        assert_eq!(next, FindResults::Values(expected));

        assert!(find_values(&backend, &device(&["laptop"]), &FindQuery::default())
            .await
            .unwrap()
            .is_empty());
    }
}
