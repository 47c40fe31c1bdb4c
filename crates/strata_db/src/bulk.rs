//! Options and results of batched bulk operations.

use serde::{Deserialize, Serialize};

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOptions {
    /// Items per transaction. Zero means [`DEFAULT_BATCH_SIZE`].
    pub batch_size: usize,
    pub continue_on_error: bool,
    /// When false, successes are reported as the input items instead of
    /// the rows the store returned.
    pub return_results: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            continue_on_error: false,
            return_results: true,
        }
    }
}

impl BulkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn return_results(mut self, return_results: bool) -> Self {
        self.return_results = return_results;
        self
    }

    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkFailure<T> {
    pub item: T,
    pub error: String,
}

/// Accumulated outcome of a bulk call.
///
/// Every input item ends up in exactly one of `success` or `failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkResult<T> {
    pub success: Vec<T>,
    pub failed: Vec<BulkFailure<T>>,
    pub total_processed: usize,
    pub success_count: usize,
    pub failed_count: usize,
}

impl<T> Default for BulkResult<T> {
    fn default() -> Self {
        Self {
            success: Vec::new(),
            failed: Vec::new(),
            total_processed: 0,
            success_count: 0,
            failed_count: 0,
        }
    }
}

impl<T> BulkResult<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_success(&mut self, item: T) {
        self.success.push(item);
        self.success_count += 1;
        self.total_processed += 1;
    }

    pub fn push_failure(&mut self, item: T, error: impl Into<String>) {
        self.failed.push(BulkFailure {
            item,
            error: error.into(),
        });
        self.failed_count += 1;
        self.total_processed += 1;
    }

    /// Moves every item of `other` into `self`.
    pub fn absorb(&mut self, other: BulkResult<T>) {
        for item in other.success {
            self.push_success(item);
        }
        for failure in other.failed {
            self.push_failure(failure.item, failure.error);
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}
