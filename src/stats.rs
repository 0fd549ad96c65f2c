//! Read side of the count log: paginated listing and the latest record.
//! Zero matches is a successful, empty answer.

use serde::Serialize;

use crate::storage::{CountFilter, RecordStore};
use crate::{CountRecord, OccupancyError, OccupancyResult};

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_LIMIT: u32 = 10;
pub const MAX_LIMIT: u32 = 1000;

/// Inclusive epoch-second window, 1-based page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountQuery {
    pub start_epoch_s: Option<i64>,
    pub end_epoch_s: Option<i64>,
    pub page: u32,
    pub limit: u32,
}

impl Default for CountQuery {
    fn default() -> Self {
        Self {
            start_epoch_s: None,
            end_epoch_s: None,
            page: DEFAULT_PAGE,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl CountQuery {
    pub fn validate(&self) -> OccupancyResult<()> {
        if self.page < 1 {
            return Err(OccupancyError::invalid_input("page must be >= 1"));
        }
        if self.limit < 1 || self.limit > MAX_LIMIT {
            return Err(OccupancyError::invalid_input(format!(
                "limit must be within 1..={}",
                MAX_LIMIT
            )));
        }
        if let (Some(start), Some(end)) = (self.start_epoch_s, self.end_epoch_s) {
            if start > end {
                return Err(OccupancyError::invalid_input(
                    "start_time must not be after end_time",
                ));
            }
        }
        Ok(())
    }

    fn filter(&self) -> CountFilter {
        CountFilter {
            start_ms: self.start_epoch_s.map(|s| s.saturating_mul(1000)),
            end_ms: self
                .end_epoch_s
                .map(|s| s.saturating_mul(1000).saturating_add(999)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CountPage {
    pub page: u32,
    pub limit: u32,
    /// Summed over `data`, not over every match.
    pub total_in: u64,
    pub total_out: u64,
    pub total_records: u64,
    pub data: Vec<CountRecord>,
}

/// Newest first.
pub fn query_counts<S: RecordStore + ?Sized>(
    store: &mut S,
    query: &CountQuery,
) -> OccupancyResult<CountPage> {
    query.validate()?;
    let filter = query.filter();
    let skip = u64::from(query.page - 1) * u64::from(query.limit);
    let data = store
        .find_counts(&filter, skip, u64::from(query.limit))
        .map_err(OccupancyError::upstream)?;
    let total_records = store
        .count_counts(&filter)
        .map_err(OccupancyError::upstream)?;
    Ok(CountPage {
        page: query.page,
        limit: query.limit,
        total_in: data.iter().map(|c| u64::from(c.in_count)).sum(),
        total_out: data.iter().map(|c| u64::from(c.out_count)).sum(),
        total_records,
        data,
    })
}

pub fn latest_count<S: RecordStore + ?Sized>(store: &mut S) -> OccupancyResult<Option<CountRecord>> {
    store.latest_count().map_err(OccupancyError::upstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::ErrorKind;
    use std::collections::BTreeMap;

    fn seed(store: &mut InMemoryStore, ts_s: i64, in_count: u32, out_count: u32) {
        store
            .insert_count(&CountRecord {
                id: None,
                zone_id: 1,
                in_count,
                out_count,
                in_people_ids: vec![],
                out_people_ids: vec![],
                in_tracker_keys: vec![],
                out_tracker_keys: vec![],
                in_occurrences: BTreeMap::new(),
                timestamp_ms: ts_s * 1000 + 250,
            })
            .unwrap();
    }

    #[test]
    fn empty_log_is_success() {
        let mut store = InMemoryStore::new();
        let page = query_counts(&mut store, &CountQuery::default()).unwrap();
        assert_eq!(page.total_records, 0);
        assert!(page.data.is_empty());
        assert!(latest_count(&mut store).unwrap().is_none());
    }

    #[test]
    fn pages_newest_first_with_page_totals() {
        let mut store = InMemoryStore::new();
        for (ts, i, o) in [(100, 1, 0), (200, 2, 1), (300, 3, 2), (400, 4, 3)] {
            seed(&mut store, ts, i, o);
        }
        let query = CountQuery {
            start_epoch_s: Some(200),
            end_epoch_s: Some(400),
            page: 1,
            limit: 2,
        };
        let first = query_counts(&mut store, &query).unwrap();
        assert_eq!(first.total_records, 3);
        assert_eq!(first.data[0].in_count, 4);
        assert_eq!(first.total_in, 7);
        assert_eq!(first.total_out, 5);

        let second = query_counts(&mut store, &CountQuery { page: 2, ..query }).unwrap();
        assert_eq!(second.data.len(), 1);
        assert_eq!(second.data[0].in_count, 2);
    }

    #[test]
    fn rejects_inverted_window_and_bad_limits() {
        let mut store = InMemoryStore::new();
        let inverted = CountQuery {
            start_epoch_s: Some(10),
            end_epoch_s: Some(5),
            ..CountQuery::default()
        };
        assert_eq!(
            query_counts(&mut store, &inverted).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        let zero_limit = CountQuery {
            limit: 0,
            ..CountQuery::default()
        };
        assert!(query_counts(&mut store, &zero_limit).is_err());
        let zero_page = CountQuery {
            page: 0,
            ..CountQuery::default()
        };
        assert!(query_counts(&mut store, &zero_page).is_err());
    }

    #[test]
    fn store_outage_is_upstream() {
        let mut store = InMemoryStore::new();
        store.set_unavailable(true);
        assert_eq!(
            latest_count(&mut store).unwrap_err().kind(),
            ErrorKind::UpstreamUnavailable
        );
    }
}
