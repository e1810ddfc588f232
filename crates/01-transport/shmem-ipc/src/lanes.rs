use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

const PREALLOC: usize = 64;

/// Transmit lane, highest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High = 0,
    Mid = 1,
    Low = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Mid, Priority::Low];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Maps the firmware's numeric priority (0 = highest).
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Priority::High),
            1 => Some(Priority::Mid),
            2 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Bounded FIFO lanes (High ≻ Mid ≻ Low) with O(1) enqueue/dequeue.
#[derive(Debug)]
pub struct PriorityLanes<T> {
    lanes: [VecDeque<T>; 3],
    capacity: usize,
}

impl<T> PriorityLanes<T> {
    /// Creates empty lanes holding at most `capacity` items each.
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: std::array::from_fn(|_| VecDeque::with_capacity(capacity.min(PREALLOC))),
            capacity,
        }
    }

    /// Per-lane bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` when every lane is empty.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Number of items per lane ordered as [High, Mid, Low].
    pub fn len_per_lane(&self) -> [usize; 3] {
        [self.lanes[0].len(), self.lanes[1].len(), self.lanes[2].len()]
    }

    pub fn is_full(&self, priority: Priority) -> bool {
        self.lanes[priority.index()].len() >= self.capacity
    }

    /// Appends `item` to its lane, handing it back when the lane is full.
    pub fn try_push(&mut self, priority: Priority, item: T) -> Result<(), T> {
        if self.is_full(priority) {
            return Err(item);
        }
        self.lanes[priority.index()].push_back(item);
        Ok(())
    }

    /// Puts an item back at the head of its lane, ignoring the bound.
    pub fn push_front(&mut self, priority: Priority, item: T) {
        self.lanes[priority.index()].push_front(item);
    }

    /// Pops the head of the highest non-empty lane.
    pub fn pop_next(&mut self) -> Option<(Priority, T)> {
        Priority::ALL
            .into_iter()
            .find_map(|p| self.lanes[p.index()].pop_front().map(|item| (p, item)))
    }

    /// Returns the highest lane that currently has items.
    pub fn current_priority(&self) -> Option<Priority> {
        Priority::ALL
            .into_iter()
            .find(|p| !self.lanes[p.index()].is_empty())
    }

    /// Empties every lane, highest first.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        for lane in &mut self.lanes {
            out.extend(lane.drain(..));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Ensures higher lanes always pop before lower ones.
    #[test]
    fn priority_ordering_respected() {
        let mut lanes = PriorityLanes::new(4);

        lanes.try_push(Priority::Mid, "middle-1").unwrap();
        lanes.try_push(Priority::Low, "low").unwrap();
        lanes.try_push(Priority::High, "high-1").unwrap();
        lanes.try_push(Priority::High, "high-2").unwrap();
        lanes.try_push(Priority::Mid, "middle-2").unwrap();

        let order: Vec<_> = std::iter::from_fn(|| lanes.pop_next().map(|(_, v)| v)).collect();
        assert_eq!(order, ["high-1", "high-2", "middle-1", "middle-2", "low"]);
    }

    /// A full lane refuses new work without disturbing the others.
    #[test]
    fn full_lane_hands_item_back() {
        let mut lanes = PriorityLanes::new(2);
        lanes.try_push(Priority::Low, 1).unwrap();
        lanes.try_push(Priority::Low, 2).unwrap();
        assert_eq!(lanes.try_push(Priority::Low, 3), Err(3));
        assert!(lanes.try_push(Priority::High, 4).is_ok());
        assert_eq!(lanes.len_per_lane(), [1, 0, 2]);
        assert_eq!(lanes.current_priority(), Some(Priority::High));
    }

    #[test]
    fn push_front_restores_head() {
        let mut lanes = PriorityLanes::new(1);
        lanes.try_push(Priority::Mid, 'a').unwrap();
        let (p, item) = lanes.pop_next().unwrap();
        lanes.push_front(p, item);
        assert_eq!(lanes.pop_next(), Some((Priority::Mid, 'a')));
        assert!(lanes.is_empty());
    }

    #[test]
    fn numeric_priorities_map_to_lanes() {
        assert_eq!(Priority::from_index(0), Some(Priority::High));
        assert_eq!(Priority::from_index(2), Some(Priority::Low));
        assert_eq!(Priority::from_index(3), None);
    }

    proptest! {
        /// Whatever the interleaving, each lane is FIFO and a lower lane never
        /// pops while a higher one holds items.
        #[test]
        fn lanes_are_fifo_and_strictly_ordered(ops in proptest::collection::vec((0u32..3, any::<bool>()), 1..200)) {
            let mut lanes = PriorityLanes::new(usize::MAX);
            let mut model: [VecDeque<u32>; 3] = Default::default();
            let mut seq = 0u32;
            for (lane, pop) in ops {
                if pop {
                    let expected = (0..3).find_map(|i| model[i].pop_front().map(|v| (i, v)));
                    let got = lanes.pop_next().map(|(p, v)| (p.index(), v));
                    prop_assert_eq!(got, expected);
                } else {
                    let priority = Priority::from_index(lane).unwrap();
                    lanes.try_push(priority, seq).unwrap();
                    model[lane as usize].push_back(seq);
                    seq += 1;
                }
            }
        }
    }
}
