use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::event::EventRow;
use crate::sinks::{InsertResult, RowError, RowErrorReason, Sink, SinkRow};

#[derive(Default)]
struct Inner {
    // Rows in insertion order, deduplicated by insert id
    rows: Vec<SinkRow>,
    by_insert_id: HashMap<String, usize>,
    // Results served instead of a real insert, oldest first
    injected: VecDeque<InsertResult>,
    batches: Vec<usize>,
}

/// In-memory sink that collapses rows sharing an insert id, like the real sink does.
///
/// Duplicates are silently absorbed (reported as success). Failures can be injected to
/// exercise the error paths: an injected result is served for the next insert call and
/// nothing is stored for it, except rows not listed in an injected partial failure.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `result` for the next insert call.
    pub fn inject(&self, result: InsertResult) {
        self.lock().injected.push_back(result);
    }

    /// Convenience for injecting a partial failure from `(index, reason)` pairs.
    pub fn inject_row_errors(&self, errors: &[(usize, &str)]) {
        self.inject(InsertResult::PartialFailure(
            errors
                .iter()
                .map(|(index, reason)| RowError {
                    index: *index,
                    reason: RowErrorReason::from(*reason),
                    message: format!("injected {reason}"),
                })
                .collect(),
        ));
    }

    /// Stored rows, in the order they were first inserted.
    pub fn rows(&self) -> Vec<EventRow> {
        self.lock().rows.iter().map(|row| row.json.clone()).collect()
    }

    pub fn insert_ids(&self) -> Vec<String> {
        self.lock()
            .rows
            .iter()
            .map(|row| row.insert_id.clone())
            .collect()
    }

    /// Size of every insert call received so far.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batches.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock can only come from a failing test
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn store(&mut self, row: SinkRow) {
        if self.by_insert_id.contains_key(&row.insert_id) {
            return;
        }
        self.by_insert_id
            .insert(row.insert_id.clone(), self.rows.len());
        self.rows.push(row);
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn insert(&self, rows: Vec<SinkRow>) -> InsertResult {
        let mut inner = self.lock();
        inner.batches.push(rows.len());

        match inner.injected.pop_front() {
            None => {
                for row in rows {
                    inner.store(row);
                }
                InsertResult::Success
            }
            Some(InsertResult::PartialFailure(errors)) => {
                for (index, row) in rows.into_iter().enumerate() {
                    let rejected = errors
                        .iter()
                        .any(|e| e.index == index && e.reason != RowErrorReason::Duplicate);
                    if !rejected {
                        inner.store(row);
                    }
                }
                InsertResult::PartialFailure(errors)
            }
            Some(result) => result,
        }
    }
}
