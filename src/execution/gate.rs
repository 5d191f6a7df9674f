//! Per-category admission control.
//!
//! The gate only does bookkeeping: counters and wait queues keyed by
//! execution ID. Record transitions and dispatch belong to the scheduler,
//! which owns the gate and mutates it from its event loop only.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use uuid::Uuid;

use super::record::ExecutionCategory;

/// Ordering policy for executions waiting on a full category.
pub trait WaitQueue: Send {
    fn push(&mut self, id: Uuid);
    /// Next execution to promote.
    fn pop(&mut self) -> Option<Uuid>;
    /// Drop a waiting execution. Returns false if it was not queued.
    fn remove(&mut self, id: Uuid) -> bool;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strict arrival-order queue.
#[derive(Debug, Default)]
pub struct FifoQueue {
    items: VecDeque<Uuid>,
}

impl WaitQueue for FifoQueue {
    fn push(&mut self, id: Uuid) {
        self.items.push_back(id);
    }

    fn pop(&mut self) -> Option<Uuid> {
        self.items.pop_front()
    }

    fn remove(&mut self, id: Uuid) -> bool {
        match self.items.iter().position(|queued| *queued == id) {
            Some(index) => self.items.remove(index).is_some(),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Point-in-time view of one category's gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateSnapshot {
    /// `None` means uncapped.
    pub capacity: Option<usize>,
    pub in_flight: usize,
    pub queued: usize,
}

struct CategoryGate {
    capacity: Option<usize>,
    in_flight: usize,
    queue: Box<dyn WaitQueue>,
}

impl CategoryGate {
    fn new(capacity: Option<usize>, queue: Box<dyn WaitQueue>) -> Self {
        Self {
            capacity,
            in_flight: 0,
            queue,
        }
    }

    fn has_free_slot(&self) -> bool {
        self.capacity.is_none_or(|cap| self.in_flight < cap)
    }
}

/// Bounded counters plus wait queues, one pair per category.
pub struct ConcurrencyGate {
    gates: HashMap<ExecutionCategory, CategoryGate>,
}

impl ConcurrencyGate {
    /// Create a gate with FIFO queues for the given capacities.
    /// Categories not listed are uncapped.
    pub fn new(capacities: impl IntoIterator<Item = (ExecutionCategory, Option<usize>)>) -> Self {
        let mut gate = Self {
            gates: HashMap::new(),
        };
        for (category, capacity) in capacities {
            gate.set_policy(category, capacity, Box::new(FifoQueue::default()));
        }
        gate
    }

    /// Install a category with a custom promotion policy.
    pub fn set_policy(
        &mut self,
        category: ExecutionCategory,
        capacity: Option<usize>,
        queue: Box<dyn WaitQueue>,
    ) {
        self.gates
            .insert(category, CategoryGate::new(capacity, queue));
    }

    fn gate_mut(&mut self, category: ExecutionCategory) -> &mut CategoryGate {
        self.gates
            .entry(category)
            .or_insert_with(|| CategoryGate::new(None, Box::new(FifoQueue::default())))
    }

    /// Take a slot if one is free and nobody is already waiting for it.
    pub fn try_admit(&mut self, category: ExecutionCategory) -> bool {
        let gate = self.gate_mut(category);
        if gate.has_free_slot() && gate.queue.is_empty() {
            gate.in_flight += 1;
            true
        } else {
            false
        }
    }

    /// Park an execution until a slot frees up.
    pub fn enqueue(&mut self, category: ExecutionCategory, id: Uuid) {
        let gate = self.gate_mut(category);
        gate.queue.push(id);
        tracing::debug!(
            category = %category,
            execution_id = %id,
            depth = gate.queue.len(),
            "Execution queued"
        );
    }

    /// Remove a queued execution (cancel-while-queued). Slots are untouched.
    pub fn remove_queued(&mut self, category: ExecutionCategory, id: Uuid) -> bool {
        self.gate_mut(category).queue.remove(id)
    }

    /// Free the slot of a finished execution and hand it straight to the next
    /// waiter, if any. The returned execution already owns the slot.
    pub fn release_and_promote(&mut self, category: ExecutionCategory) -> Option<Uuid> {
        let gate = self.gate_mut(category);
        debug_assert!(gate.in_flight > 0, "released a {category} slot that was never admitted");
        gate.in_flight = gate.in_flight.saturating_sub(1);

        if !gate.has_free_slot() {
            return None;
        }
        let next = gate.queue.pop()?;
        gate.in_flight += 1;
        Some(next)
    }

    /// Drain every waiter of a category without admitting them.
    pub fn drain_queue(&mut self, category: ExecutionCategory) -> Vec<Uuid> {
        let gate = self.gate_mut(category);
        std::iter::from_fn(|| gate.queue.pop()).collect()
    }

    pub fn snapshot(&self, category: ExecutionCategory) -> GateSnapshot {
        match self.gates.get(&category) {
            Some(gate) => GateSnapshot {
                capacity: gate.capacity,
                in_flight: gate.in_flight,
                queued: gate.queue.len(),
            },
            None => GateSnapshot {
                capacity: None,
                in_flight: 0,
                queued: 0,
            },
        }
    }
}
