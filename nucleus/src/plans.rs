//! Plan scheduling for the simulation kernel.
//!
//! A plan is a unit of work deferred to a future simulation time. Plans are
//! processed in time order; plans scheduled at the same time are processed in
//! arrival order using a monotonically increasing sequence number, which keeps
//! execution deterministic regardless of the underlying heap's tie-breaking.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
};

use crate::error::{NucleusError, NucleusResult};

/// A plan scheduled for execution at a specific simulation time.
///
/// The payload is generic so the queue can be exercised independently of the
/// simulation's callback type.
#[derive(Debug)]
pub struct ScheduledPlan<T> {
    time: f64,
    sequence: u64,
    key: Option<String>,
    payload: T,
}

impl<T> ScheduledPlan<T> {
    /// Returns the scheduled execution time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Returns the arrival sequence number assigned at insertion.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the cancellation key, if one was supplied.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Consumes the plan and returns its payload.
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T> PartialEq for ScheduledPlan<T> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
            && self.time.total_cmp(&other.time) == Ordering::Equal
    }
}

impl<T> Eq for ScheduledPlan<T> {}

impl<T> Ord for ScheduledPlan<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap, but we want the earliest time first, so
        // both comparisons are reversed. Sequence numbers break ties at equal
        // times: earlier arrivals pop first.
        match other.time.total_cmp(&self.time) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

impl<T> PartialOrd for ScheduledPlan<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A priority queue of plans ordered by (time, arrival sequence).
///
/// Keyed plans can be canceled before they fire. Cancellation is
/// tombstone-based: the heap entry stays in place and is discarded when it
/// reaches the front, so cancellation is O(1).
#[derive(Debug)]
pub struct PlanQueue<T> {
    heap: BinaryHeap<ScheduledPlan<T>>,
    next_sequence: u64,
    keyed: HashMap<String, u64>,
    canceled: HashSet<u64>,
}

impl<T> PlanQueue<T> {
    /// Creates a new empty plan queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
            keyed: HashMap::new(),
            canceled: HashSet::new(),
        }
    }

    /// Schedules a plan for execution at `time`.
    ///
    /// `current_time` is the simulation's clock at the moment of scheduling;
    /// plans cannot be scheduled into the past. A key, when supplied, must not
    /// collide with another pending keyed plan.
    ///
    /// Returns the sequence number assigned to the plan.
    pub fn schedule(
        &mut self,
        time: f64,
        current_time: f64,
        key: Option<String>,
        payload: T,
    ) -> NucleusResult<u64> {
        if !time.is_finite() {
            return Err(NucleusError::NonFinitePlanningTime { time });
        }
        if time < current_time {
            return Err(NucleusError::PastPlanningTime { time, current_time });
        }
        if let Some(key) = &key {
            if self.keyed.contains_key(key) {
                return Err(NucleusError::DuplicatePlanKey { key: key.clone() });
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        if let Some(key) = &key {
            self.keyed.insert(key.clone(), sequence);
        }
        self.heap.push(ScheduledPlan {
            time,
            sequence,
            key,
            payload,
        });
        Ok(sequence)
    }

    /// Cancels the pending plan registered under `key`.
    ///
    /// Returns `true` if a pending plan was canceled. Canceling an unknown or
    /// already-fired key is a no-op, not an error.
    pub fn cancel(&mut self, key: &str) -> bool {
        match self.keyed.remove(key) {
            Some(sequence) => {
                self.canceled.insert(sequence);
                true
            }
            None => false,
        }
    }

    /// Removes and returns the pending plan with the smallest
    /// (time, sequence) pair, skipping canceled entries.
    pub fn pop_earliest(&mut self) -> Option<ScheduledPlan<T>> {
        while let Some(plan) = self.heap.pop() {
            if self.canceled.remove(&plan.sequence) {
                continue;
            }
            if let Some(key) = &plan.key {
                self.keyed.remove(key);
            }
            return Some(plan);
        }
        None
    }

    /// Returns a reference to the earliest pending plan without removing it.
    pub fn peek_earliest(&mut self) -> Option<&ScheduledPlan<T>> {
        loop {
            let canceled = match self.heap.peek() {
                Some(plan) => self.canceled.contains(&plan.sequence),
                None => return None,
            };
            if !canceled {
                break;
            }
            if let Some(plan) = self.heap.pop() {
                self.canceled.remove(&plan.sequence);
            }
        }
        self.heap.peek()
    }

    /// Returns `true` if no pending (non-canceled) plans remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of pending plans, excluding canceled entries.
    pub fn len(&self) -> usize {
        self.heap.len() - self.canceled.len()
    }

    /// Discards all pending plans and cancellation bookkeeping.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.keyed.clear();
        self.canceled.clear();
    }
}

impl<T> Default for PlanQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_pop_in_time_order() {
        let mut queue = PlanQueue::new();
        queue.schedule(30.0, 0.0, None, "late").unwrap();
        queue.schedule(10.0, 0.0, None, "early").unwrap();
        queue.schedule(20.0, 0.0, None, "mid").unwrap();

        assert_eq!(queue.pop_earliest().unwrap().into_payload(), "early");
        assert_eq!(queue.pop_earliest().unwrap().into_payload(), "mid");
        assert_eq!(queue.pop_earliest().unwrap().into_payload(), "late");
        assert!(queue.pop_earliest().is_none());
    }

    #[test]
    fn equal_time_plans_pop_in_arrival_order() {
        let mut queue = PlanQueue::new();
        queue.schedule(5.0, 0.0, None, "first").unwrap();
        queue.schedule(5.0, 0.0, None, "second").unwrap();
        queue.schedule(5.0, 0.0, None, "third").unwrap();

        let a = queue.pop_earliest().unwrap();
        let b = queue.pop_earliest().unwrap();
        let c = queue.pop_earliest().unwrap();
        assert!(a.sequence() < b.sequence());
        assert!(b.sequence() < c.sequence());
        assert_eq!(a.into_payload(), "first");
        assert_eq!(b.into_payload(), "second");
        assert_eq!(c.into_payload(), "third");
    }

    #[test]
    fn scheduling_into_the_past_is_rejected() {
        let mut queue = PlanQueue::new();
        let err = queue.schedule(1.0, 2.0, None, ()).unwrap_err();
        assert_eq!(
            err,
            NucleusError::PastPlanningTime {
                time: 1.0,
                current_time: 2.0
            }
        );
    }

    #[test]
    fn non_finite_times_are_rejected() {
        let mut queue = PlanQueue::new();
        assert!(matches!(
            queue.schedule(f64::NAN, 0.0, None, ()),
            Err(NucleusError::NonFinitePlanningTime { .. })
        ));
        assert!(matches!(
            queue.schedule(f64::INFINITY, 0.0, None, ()),
            Err(NucleusError::NonFinitePlanningTime { .. })
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn scheduling_at_current_time_is_allowed() {
        let mut queue = PlanQueue::new();
        queue.schedule(2.0, 2.0, None, "now").unwrap();
        assert_eq!(queue.pop_earliest().unwrap().into_payload(), "now");
    }

    #[test]
    fn canceled_plan_never_pops() {
        let mut queue = PlanQueue::new();
        queue.schedule(1.0, 0.0, Some("a".to_string()), "a").unwrap();
        queue.schedule(2.0, 0.0, None, "b").unwrap();

        assert!(queue.cancel("a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_earliest().unwrap().into_payload(), "b");
        assert!(queue.pop_earliest().is_none());
    }

    #[test]
    fn cancel_unknown_or_fired_key_is_noop() {
        let mut queue = PlanQueue::new();
        assert!(!queue.cancel("never-scheduled"));

        queue.schedule(1.0, 0.0, Some("k".to_string()), ()).unwrap();
        assert!(queue.pop_earliest().is_some());
        assert!(!queue.cancel("k"));
    }

    #[test]
    fn duplicate_pending_key_is_rejected() {
        let mut queue = PlanQueue::new();
        queue.schedule(1.0, 0.0, Some("k".to_string()), ()).unwrap();
        let err = queue
            .schedule(2.0, 0.0, Some("k".to_string()), ())
            .unwrap_err();
        assert_eq!(
            err,
            NucleusError::DuplicatePlanKey {
                key: "k".to_string()
            }
        );
    }

    #[test]
    fn key_is_reusable_after_fire_or_cancel() {
        let mut queue = PlanQueue::new();
        queue.schedule(1.0, 0.0, Some("k".to_string()), 1).unwrap();
        queue.pop_earliest().unwrap();
        queue.schedule(2.0, 0.0, Some("k".to_string()), 2).unwrap();
        assert!(queue.cancel("k"));
        queue.schedule(3.0, 0.0, Some("k".to_string()), 3).unwrap();
        assert_eq!(queue.pop_earliest().unwrap().into_payload(), 3);
    }

    #[test]
    fn cancel_everything_leaves_queue_empty() {
        let mut queue = PlanQueue::new();
        for i in 0..10 {
            queue
                .schedule(i as f64, 0.0, Some(format!("plan-{i}")), i)
                .unwrap();
        }
        for i in 0..10 {
            assert!(queue.cancel(&format!("plan-{i}")));
        }
        assert!(queue.is_empty());
        assert!(queue.pop_earliest().is_none());
    }

    #[test]
    fn peek_skips_canceled_entries() {
        let mut queue = PlanQueue::new();
        queue.schedule(1.0, 0.0, Some("a".to_string()), "a").unwrap();
        queue.schedule(2.0, 0.0, None, "b").unwrap();
        queue.cancel("a");
        assert_eq!(queue.peek_earliest().unwrap().time(), 2.0);
    }

    #[test]
    fn deterministic_across_runs() {
        fn run() -> Vec<(f64, u64)> {
            let mut queue = PlanQueue::new();
            for &t in &[5.0, 3.0, 5.0, 1.0, 3.0] {
                queue.schedule(t, 0.0, None, ()).unwrap();
            }
            let mut order = Vec::new();
            while let Some(plan) = queue.pop_earliest() {
                order.push((plan.time(), plan.sequence()));
            }
            order
        }

        let first = run();
        for _ in 0..10 {
            assert_eq!(run(), first);
        }
        for window in first.windows(2) {
            assert!(
                (window[0].0, window[0].1) <= (window[1].0, window[1].1),
                "plans out of order: {:?} vs {:?}",
                window[0],
                window[1]
            );
        }
    }
}
