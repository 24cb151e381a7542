//! Sorted in-memory backend for small datasets and tests.

use propwatch_core::TransactionRecord;

use crate::{StoreError, TransactionFilter, TransactionQuery};

/// Records kept sorted by (transfer date, postcode) so date ranges resolve by binary search.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransactionIndex {
    rows: Vec<TransactionRecord>,
}

impl InMemoryTransactionIndex {
    pub fn new(mut rows: Vec<TransactionRecord>) -> Self {
        rows.sort_by(|a, b| {
            a.transfer_date
                .cmp(&b.transfer_date)
                .then_with(|| a.postcode.cmp(&b.postcode))
        });
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl TransactionQuery for InMemoryTransactionIndex {
    fn query(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>, StoreError> {
        let window = match filter.date_range {
            Some((from, to)) => {
                let start = self.rows.partition_point(|r| r.transfer_date < from);
                let end = self.rows.partition_point(|r| r.transfer_date <= to);
                &self.rows[start..end.max(start)]
            }
            None => &self.rows[..],
        };
        Ok(window
            .iter()
            .filter(|r| filter.postcode_matches(r.postcode.as_deref()))
            .cloned()
            .collect())
    }
}
