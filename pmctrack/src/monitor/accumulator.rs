//! # Accumulation Engine
//!
//! Aggregate (`-A`) mode folds every raw sample into a running total per
//! (entity, experiment). Entities are kept in discovery order: a `Vec` of
//! accumulators plus a `HashMap` from entity to position.
//!
//! The first sample of an experiment seeds the aggregate, metadata included;
//! later ones only add their counter values through the [`SampleMerge`]
//! contract. An optional capacity bounds the number of entities; samples of
//! entities beyond it are rejected and counted as dropped.

use std::collections::HashMap;

use pmctrack_common::PmcSample;

use crate::domain::{AccumulatorError, EntityId};
use crate::pmc::SampleMerge;

/// Running total of one experiment for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExperimentAggregate {
    pub sample: PmcSample,
    /// Raw samples folded in so far
    pub count: u64,
}

/// Per-entity state
#[derive(Debug, Clone)]
pub struct EntityAccumulator {
    entity: EntityId,
    experiments: Vec<Option<ExperimentAggregate>>,
}

impl EntityAccumulator {
    fn new(entity: EntityId, nr_experiments: usize) -> Self {
        Self { entity, experiments: vec![None; nr_experiments] }
    }

    #[must_use]
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    #[must_use]
    pub fn has_seen(&self, exp_idx: usize) -> bool {
        self.experiments.get(exp_idx).is_some_and(Option::is_some)
    }

    #[must_use]
    pub fn aggregate(&self, exp_idx: usize) -> Option<&ExperimentAggregate> {
        self.experiments.get(exp_idx)?.as_ref()
    }

    /// Seen experiments in increasing index order
    pub fn seen(&self) -> impl Iterator<Item = (usize, &ExperimentAggregate)> {
        self.experiments.iter().enumerate().filter_map(|(idx, slot)| slot.as_ref().map(|agg| (idx, agg)))
    }
}

/// Merges samples into per-entity accumulators
#[derive(Debug)]
pub struct AccumulationEngine<M: SampleMerge> {
    merge: M,
    nr_experiments: usize,
    capacity: Option<usize>,
    accumulators: Vec<EntityAccumulator>,
    index: HashMap<EntityId, usize>,
    dropped: u64,
}

impl<M: SampleMerge> AccumulationEngine<M> {
    #[must_use]
    pub fn new(merge: M, nr_experiments: usize, capacity: Option<usize>) -> Self {
        Self {
            merge,
            nr_experiments,
            capacity,
            accumulators: Vec::new(),
            index: HashMap::new(),
            dropped: 0,
        }
    }

    /// Fold `sample` into the accumulator of `entity`
    ///
    /// # Errors
    /// The experiment index is out of range or a new entity would exceed the
    /// capacity. The sample is counted as dropped either way.
    pub fn add(&mut self, entity: EntityId, sample: &PmcSample) -> Result<(), AccumulatorError> {
        let result = self.try_add(entity, sample);
        if result.is_err() {
            self.dropped += 1;
        }
        result
    }

    fn try_add(&mut self, entity: EntityId, sample: &PmcSample) -> Result<(), AccumulatorError> {
        let exp_idx = usize::try_from(sample.exp_idx)
            .ok()
            .filter(|&idx| idx < self.nr_experiments)
            .ok_or(AccumulatorError::ExperimentOutOfRange {
                exp_idx: sample.exp_idx,
                nr_experiments: self.nr_experiments,
            })?;

        let position = self.locate_or_insert(entity)?;
        let slot = &mut self.accumulators[position].experiments[exp_idx];

        match slot {
            Some(agg) => {
                agg.count += 1;
                self.merge.merge(&mut agg.sample, sample, false);
            }
            None => {
                let mut seeded = PmcSample::default();
                self.merge.merge(&mut seeded, sample, true);
                *slot = Some(ExperimentAggregate { sample: seeded, count: 1 });
            }
        }
        Ok(())
    }

    fn locate_or_insert(&mut self, entity: EntityId) -> Result<usize, AccumulatorError> {
        if let Some(&position) = self.index.get(&entity) {
            return Ok(position);
        }
        if let Some(capacity) = self.capacity {
            if self.accumulators.len() >= capacity {
                return Err(AccumulatorError::CapacityExceeded { capacity, entity });
            }
        }
        let position = self.accumulators.len();
        self.accumulators.push(EntityAccumulator::new(entity, self.nr_experiments));
        self.index.insert(entity, position);
        Ok(position)
    }

    /// Accumulators in discovery order
    #[must_use]
    pub fn accumulators(&self) -> &[EntityAccumulator] {
        &self.accumulators
    }

    #[must_use]
    pub fn get(&self, entity: EntityId) -> Option<&EntityAccumulator> {
        self.index.get(&entity).map(|&position| &self.accumulators[position])
    }

    /// Report rows: discovery order, then increasing experiment index
    pub fn rows(&self) -> impl Iterator<Item = (EntityId, usize, &ExperimentAggregate)> {
        self.accumulators.iter().flat_map(|acc| acc.seen().map(move |(idx, agg)| (acc.entity, idx, agg)))
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CpuId, Pid};
    use crate::pmc::KernelMerge;

    fn sample(pid: i32, exp_idx: i32, value: u64) -> PmcSample {
        let mut s = PmcSample { pid, exp_idx, pmc_mask: 1, nr_counters: 1, elapsed_time: 100, ..PmcSample::default() };
        s.pmc_counts[0] = value;
        s
    }

    fn thread(pid: i32) -> EntityId {
        EntityId::Thread(Pid(pid))
    }

    #[test]
    fn test_first_sample_seeds_then_sums() {
        let mut engine = AccumulationEngine::new(KernelMerge, 1, None);
        engine.add(thread(7), &sample(7, 0, 10)).unwrap();
        engine.add(thread(7), &sample(7, 0, 5)).unwrap();

        let agg = engine.get(thread(7)).unwrap().aggregate(0).unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.sample.counter_value(0), Some(15));
        assert_eq!(agg.sample.elapsed_time, 200);
    }

    #[test]
    fn test_discovery_order_and_experiment_order() {
        let mut engine = AccumulationEngine::new(KernelMerge, 2, None);
        for (pid, exp) in [(30, 1), (10, 0), (30, 0), (10, 0), (20, 1)] {
            engine.add(thread(pid), &sample(pid, exp, 1)).unwrap();
        }

        let rows: Vec<(EntityId, usize, u64)> = engine.rows().map(|(e, idx, agg)| (e, idx, agg.count)).collect();
        assert_eq!(
            rows,
            vec![(thread(30), 0, 1), (thread(30), 1, 1), (thread(10), 0, 2), (thread(20), 1, 1)]
        );
        assert!(!engine.get(thread(20)).unwrap().has_seen(0));
    }

    #[test]
    fn test_entity_discovery_is_idempotent() {
        let mut engine = AccumulationEngine::new(KernelMerge, 1, None);
        for _ in 0..10 {
            engine.add(EntityId::Cpu(CpuId(2)), &sample(2, 0, 1)).unwrap();
        }
        assert_eq!(engine.accumulators().len(), 1);
        assert_eq!(engine.rows().next().unwrap().2.count, 10);
    }

    #[test]
    fn test_capacity_is_recoverable() {
        let mut engine = AccumulationEngine::new(KernelMerge, 1, Some(2));
        engine.add(thread(1), &sample(1, 0, 1)).unwrap();
        engine.add(thread(2), &sample(2, 0, 1)).unwrap();

        let err = engine.add(thread(3), &sample(3, 0, 1)).unwrap_err();
        assert_eq!(err, AccumulatorError::CapacityExceeded { capacity: 2, entity: thread(3) });

        // known entities keep accumulating
        engine.add(thread(1), &sample(1, 0, 1)).unwrap();
        assert_eq!(engine.dropped(), 1);
        assert_eq!(engine.accumulators().len(), 2);
    }

    #[test]
    fn test_experiment_out_of_range() {
        let mut engine = AccumulationEngine::new(KernelMerge, 2, None);
        assert!(matches!(
            engine.add(thread(1), &sample(1, 2, 1)),
            Err(AccumulatorError::ExperimentOutOfRange { exp_idx: 2, nr_experiments: 2 })
        ));
        assert!(engine.add(thread(1), &sample(1, -1, 1)).is_err());
        assert!(engine.accumulators().is_empty());
        assert_eq!(engine.dropped(), 2);
    }

    /// Merge that only counts invocations
    struct CountingMerge(std::cell::Cell<(u32, u32)>);

    impl SampleMerge for CountingMerge {
        fn merge(&self, aggregate: &mut PmcSample, sample: &PmcSample, copy_metadata: bool) {
            let (copies, sums) = self.0.get();
            self.0.set(if copy_metadata { (copies + 1, sums) } else { (copies, sums + 1) });
            aggregate.accumulate(sample, copy_metadata);
        }
    }

    #[test]
    fn test_metadata_copied_once_per_experiment() {
        let mut engine = AccumulationEngine::new(CountingMerge(std::cell::Cell::new((0, 0))), 2, None);
        for exp in [0, 1, 0, 1, 1] {
            engine.add(thread(9), &sample(9, exp, 1)).unwrap();
        }
        assert_eq!(engine.merge.0.get(), (2, 3));
    }
}
