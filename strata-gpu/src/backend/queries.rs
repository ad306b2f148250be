//! Bookkeeping for backends whose occlusion results arrive late.
//!
//! Every time a query id is begun it gets a new generation. Results are
//! accepted only for the generation they were issued under, so a readback
//! still in flight when its id is recycled cannot overwrite the new result.

use std::collections::HashMap;

use tracing::trace;

use crate::error::StrataError;

#[derive(Debug, Clone, Copy)]
struct Issue {
    generation: u64,
    any_samples: bool,
    samples: Option<u64>,
}

/// Query ids, their current generation and their resolved counts.
#[derive(Debug)]
pub struct QueryLedger {
    capacity: u32,
    next: u32,
    free: Vec<u32>,
    issues: HashMap<u32, Issue>,
    generation: u64,
}

impl QueryLedger {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next: 0,
            free: Vec::new(),
            issues: HashMap::new(),
            generation: 0,
        }
    }

    /// Ids handed out and not released.
    pub fn live(&self) -> usize {
        self.next as usize - self.free.len()
    }

    /// A released id if any, a fresh one otherwise.
    pub fn allocate(&mut self) -> Result<u32, StrataError> {
        if let Some(query) = self.free.pop() {
            return Ok(query);
        }
        if self.next >= self.capacity {
            return Err(StrataError::QueryCapacityExhausted(self.capacity));
        }
        self.next += 1;
        Ok(self.next - 1)
    }

    /// Makes `query` available again. Results still in flight for it are
    /// dropped on arrival.
    pub fn release(&mut self, query: u32) {
        self.issues.remove(&query);
        if query < self.next && !self.free.contains(&query) {
            self.free.push(query);
        }
    }

    /// Starts a new use of `query` and returns its generation.
    pub fn issue(&mut self, query: u32, any_samples: bool) -> u64 {
        self.generation += 1;
        self.issues.insert(
            query,
            Issue {
                generation: self.generation,
                any_samples,
                samples: None,
            },
        );
        self.generation
    }

    /// Generation of the current use of `query`.
    pub fn generation(&self, query: u32) -> Option<u64> {
        self.issues.get(&query).map(|issue| issue.generation)
    }

    /// Stores `samples` if `generation` is the current use of `query`.
    /// Any-samples queries are clamped to 0 or 1.
    pub fn accept(&mut self, query: u32, generation: u64, samples: u64) -> bool {
        match self.issues.get_mut(&query) {
            Some(issue) if issue.generation == generation => {
                issue.samples = Some(if issue.any_samples {
                    samples.min(1)
                } else {
                    samples
                });
                true
            }
            _ => {
                trace!(
                    "Dropping stale result of query {} from generation {}",
                    query, generation
                );
                false
            }
        }
    }

    pub fn result(&self, query: u32) -> Option<u64> {
        self.issues.get(&query).and_then(|issue| issue.samples)
    }
}
