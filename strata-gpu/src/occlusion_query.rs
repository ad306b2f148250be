//! Pipelined occlusion queries.
//!
//! A group numbers the passes that issue queries, keeps up to
//! [`MAX_QUERY_LATENCY`] passes in flight and reports, per pass, the sum of
//! the samples its queries counted once every one of them resolved.

use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::backend::QueryBackend;
use crate::constants::MAX_QUERY_LATENCY;
use crate::error::StrataError;

/// Latest known result of one queried object.
#[derive(Debug, Clone)]
struct ObjectQueries<Q> {
    in_flight: VecDeque<(Q, u64)>,
    /// Whether `samples` holds a resolved result.
    valid: bool,
    samples: u64,
}

impl<Q> Default for ObjectQueries<Q> {
    fn default() -> Self {
        Self {
            in_flight: VecDeque::with_capacity(MAX_QUERY_LATENCY + 1),
            valid: false,
            samples: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PassRecord {
    number: u64,
    issued: usize,
    resolved: usize,
    samples: u64,
}

impl PassRecord {
    fn complete(&self) -> bool {
        self.resolved == self.issued
    }
}

/// Resolved result of a whole pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSamples {
    pub pass: u64,
    pub samples: u64,
}

pub struct OcclusionQueryGroup<Q> {
    available: Vec<Q>,
    /// Issued queries in issue order, with the object they belong to.
    pending: VecDeque<(Q, usize)>,
    objects: Vec<ObjectQueries<Q>>,
    passes: VecDeque<PassRecord>,
    pass: u64,
    started: Option<usize>,
    query_capacity: Option<u32>,
    created: u32,
}

impl<Q: Copy + Eq + std::fmt::Debug> Default for OcclusionQueryGroup<Q> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q: Copy + Eq + std::fmt::Debug> OcclusionQueryGroup<Q> {
    pub fn new() -> Self {
        Self {
            available: Vec::new(),
            pending: VecDeque::new(),
            objects: Vec::new(),
            passes: VecDeque::new(),
            pass: 0,
            started: None,
            query_capacity: None,
            created: 0,
        }
    }

    /// Bounds the number of query objects the group may create.
    pub fn with_query_capacity(mut self, capacity: u32) -> Self {
        self.query_capacity = Some(capacity);
        self
    }

    /// Number of the current pass, 0 before the first [`begin_pass`](Self::begin_pass).
    pub fn current_pass(&self) -> u64 {
        self.pass
    }

    pub fn begin_pass(&mut self) {
        self.pass += 1;
        self.passes.push_back(PassRecord {
            number: self.pass,
            issued: 0,
            resolved: 0,
            samples: 0,
        });
    }

    /// Starts the query of object `index`. Returns `None` if a query is
    /// already running.
    pub fn begin_query<B>(
        &mut self,
        backend: &mut B,
        index: usize,
        any_samples: bool,
    ) -> Result<Option<Q>, StrataError>
    where
        B: QueryBackend<Query = Q>,
    {
        if self.started.is_some() {
            warn!("Trying to start an overlapping occlusion query. Ignoring");
            return Ok(None);
        }
        let query = match self.available.pop() {
            Some(query) => query,
            None => {
                if let Some(capacity) = self.query_capacity {
                    if self.created >= capacity {
                        return Err(StrataError::QueryCapacityExhausted(capacity));
                    }
                }
                self.created += 1;
                backend.create_query()?
            }
        };
        if self.objects.len() <= index {
            self.objects.resize_with(index + 1, ObjectQueries::default);
        }
        self.objects[index].in_flight.push_back((query, self.pass));
        self.pending.push_back((query, index));
        if let Some(record) = self.passes.back_mut() {
            record.issued += 1;
        }
        self.started = Some(index);
        backend.begin_query(query, any_samples);
        Ok(Some(query))
    }

    pub fn end_query<B>(&mut self, backend: &mut B)
    where
        B: QueryBackend<Query = Q>,
    {
        if self.started.take().is_some() {
            backend.end_query();
        }
    }

    /// Collects finished queries.
    ///
    /// Queries older than `latency` passes are waited for, younger ones are
    /// only collected when available. Returns the latest pass whose queries
    /// all resolved during this call.
    pub fn check_queries<B>(
        &mut self,
        backend: &mut B,
        latency: usize,
    ) -> Result<Option<PassSamples>, StrataError>
    where
        B: QueryBackend<Query = Q>,
    {
        let latency = latency.min(MAX_QUERY_LATENCY) as u64;
        while let Some(&(query, index)) = self.pending.front() {
            let Some(&(object_query, query_pass)) = self.objects[index].in_flight.front() else {
                break;
            };
            debug_assert_eq!(object_query, query, "queries must resolve in issue order");
            let force = query_pass + latency <= self.pass;
            if !force && !backend.query_available(query) {
                break;
            }
            let samples = backend.query_result(query)?;
            trace!(
                "Query of object {} in pass {} counted {} samples",
                index, query_pass, samples
            );
            self.pending.pop_front();
            let object = &mut self.objects[index];
            object.in_flight.pop_front();
            object.valid = true;
            object.samples = samples;
            self.available.push(query);
            if let Some(record) = self.passes.iter_mut().find(|p| p.number == query_pass) {
                record.resolved += 1;
                record.samples += samples;
            }
        }

        let mut latest = None;
        while let Some(record) = self.passes.front() {
            if !record.complete() {
                break;
            }
            latest = Some(PassSamples {
                pass: record.number,
                samples: record.samples,
            });
            self.passes.pop_front();
        }
        Ok(latest)
    }

    /// Latest resolved sample count of object `index`.
    pub fn latest_samples_passed(&self, index: usize) -> Option<u64> {
        self.objects
            .get(index)
            .filter(|o| o.valid)
            .map(|o| o.samples)
    }

    /// Whether object `index` has queries that have not resolved yet.
    pub fn has_pending(&self, index: usize) -> bool {
        self.objects
            .get(index)
            .is_some_and(|o| !o.in_flight.is_empty())
    }

    /// Gives every query object back to `backend`, outstanding ones
    /// included, and resets the group.
    pub fn release<B>(&mut self, backend: &mut B)
    where
        B: QueryBackend<Query = Q>,
    {
        self.end_query(backend);
        self.reset();
        for query in self.available.drain(..) {
            backend.release_query(query);
        }
        self.created = 0;
    }

    /// Drops all outstanding queries and starts numbering passes from 0.
    /// Their ids are reused; backends discard the late results.
    pub fn reset(&mut self) {
        for (query, _) in self.pending.drain(..) {
            self.available.push(query);
        }
        for object in &mut self.objects {
            object.in_flight.clear();
            object.valid = false;
            object.samples = 0;
        }
        self.passes.clear();
        self.started = None;
        self.pass = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Queries resolve once `ready` is set for them.
    #[derive(Default)]
    struct ScriptedQueries {
        next: u32,
        results: HashMap<u32, u64>,
        ready: HashMap<u32, bool>,
        running: Option<u32>,
        scripted: VecDeque<u64>,
        released: Vec<u32>,
    }

    impl QueryBackend for ScriptedQueries {
        type Query = u32;

        fn create_query(&mut self) -> Result<u32, StrataError> {
            self.next += 1;
            Ok(self.next)
        }

        fn release_query(&mut self, query: u32) {
            self.released.push(query);
            self.ready.remove(&query);
            self.results.remove(&query);
        }

        fn begin_query(&mut self, query: u32, _any_samples: bool) {
            self.running = Some(query);
            self.ready.insert(query, false);
        }

        fn end_query(&mut self) {
            if let Some(query) = self.running.take() {
                let samples = self.scripted.pop_front().unwrap_or(0);
                self.results.insert(query, samples);
            }
        }

        fn query_available(&mut self, query: u32) -> bool {
            self.ready.get(&query).copied().unwrap_or(false)
        }

        fn query_result(&mut self, query: u32) -> Result<u64, StrataError> {
            Ok(self.results[&query])
        }
    }

    fn issue(group: &mut OcclusionQueryGroup<u32>, backend: &mut ScriptedQueries, index: usize) {
        group.begin_query(backend, index, false).unwrap().unwrap();
        group.end_query(backend);
    }

    #[test]
    fn test_synchronous_pass_sums_objects() {
        let mut backend = ScriptedQueries {
            scripted: VecDeque::from([3, 4]),
            ..Default::default()
        };
        let mut group = OcclusionQueryGroup::new();
        group.begin_pass();
        issue(&mut group, &mut backend, 0);
        issue(&mut group, &mut backend, 1);

        let resolved = group.check_queries(&mut backend, 0).unwrap();
        assert_eq!(resolved, Some(PassSamples { pass: 1, samples: 7 }));
        assert_eq!(group.latest_samples_passed(0), Some(3));
        assert_eq!(group.latest_samples_passed(1), Some(4));
        assert_eq!(group.latest_samples_passed(2), None);
    }

    #[test]
    fn test_latency_defers_unavailable_results() {
        let mut backend = ScriptedQueries {
            scripted: VecDeque::from([5, 2, 0]),
            ..Default::default()
        };
        let mut group = OcclusionQueryGroup::new();

        group.begin_pass();
        issue(&mut group, &mut backend, 0);
        assert_eq!(group.check_queries(&mut backend, 2).unwrap(), None);
        assert!(group.has_pending(0));

        group.begin_pass();
        issue(&mut group, &mut backend, 0);
        assert_eq!(group.check_queries(&mut backend, 2).unwrap(), None);

        group.begin_pass();
        issue(&mut group, &mut backend, 0);
        // Pass 1 is now two passes old and must be waited for.
        let resolved = group.check_queries(&mut backend, 2).unwrap();
        assert_eq!(resolved, Some(PassSamples { pass: 1, samples: 5 }));

        backend.ready.values_mut().for_each(|r| *r = true);
        let resolved = group.check_queries(&mut backend, 2).unwrap();
        assert_eq!(resolved, Some(PassSamples { pass: 3, samples: 0 }));
        assert!(!group.has_pending(0));
    }

    #[test]
    fn test_overlapping_query_is_ignored() {
        let mut backend = ScriptedQueries::default();
        let mut group = OcclusionQueryGroup::new();
        group.begin_pass();
        assert!(group.begin_query(&mut backend, 0, false).unwrap().is_some());
        assert!(group.begin_query(&mut backend, 1, false).unwrap().is_none());
        group.end_query(&mut backend);
        assert!(!group.has_pending(1));
    }

    #[test]
    fn test_queries_are_recycled_after_reset() {
        let mut backend = ScriptedQueries::default();
        let mut group = OcclusionQueryGroup::new().with_query_capacity(1);
        group.begin_pass();
        issue(&mut group, &mut backend, 0);
        group.reset();
        assert_eq!(group.current_pass(), 0);
        assert_eq!(group.latest_samples_passed(0), None);

        group.begin_pass();
        issue(&mut group, &mut backend, 0);
        assert_eq!(backend.next, 1);

        assert!(matches!(
            group.begin_query(&mut backend, 1, false),
            Err(StrataError::QueryCapacityExhausted(1))
        ));
    }

    #[test]
    fn test_release_returns_pending_and_idle_queries() {
        let mut backend = ScriptedQueries::default();
        let mut group = OcclusionQueryGroup::new().with_query_capacity(2);
        group.begin_pass();
        issue(&mut group, &mut backend, 0);
        issue(&mut group, &mut backend, 1);
        backend.ready.insert(1, true);
        group.check_queries(&mut backend, 1).unwrap();
        assert!(group.has_pending(1));

        group.release(&mut backend);
        backend.released.sort_unstable();
        assert_eq!(backend.released, vec![1, 2]);
        assert!(!group.has_pending(1));

        // Capacity is counted afresh after a release.
        group.begin_pass();
        issue(&mut group, &mut backend, 0);
        issue(&mut group, &mut backend, 1);
        assert_eq!(backend.next, 4);
    }

    #[test]
    fn test_pass_without_queries_completes_immediately() {
        let mut backend = ScriptedQueries::default();
        let mut group = OcclusionQueryGroup::<u32>::new();
        group.begin_pass();
        let resolved = group.check_queries(&mut backend, 0).unwrap();
        assert_eq!(resolved, Some(PassSamples { pass: 1, samples: 0 }));
    }
}
