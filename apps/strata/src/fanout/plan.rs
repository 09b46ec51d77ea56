//! # Fan-out Plan
//!
//! A plan is a tree whose branches fan work out and whose leaves perform
//! it. Branch width is capped, so the tree depth is the smallest `d` with
//! `branching_cap^d >= concurrency`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One unit of work, addressed by a caller-chosen key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: String,
    #[serde(default)]
    pub args: Value,
}

impl WorkItem {
    pub fn new(key: impl Into<String>, args: Value) -> Self {
        Self {
            key: key.into(),
            args,
        }
    }
}

/// A node of the distribution tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum PlanNode {
    Branch { children: Vec<PlanNode> },
    Leaf { items: Vec<WorkItem> },
}

impl PlanNode {
    /// Every item in the tree, leaves visited left to right.
    #[must_use]
    pub fn items(&self) -> Vec<&WorkItem> {
        match self {
            PlanNode::Leaf { items } => items.iter().collect(),
            PlanNode::Branch { children } => children.iter().flat_map(PlanNode::items).collect(),
        }
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            PlanNode::Leaf { .. } => 1,
            PlanNode::Branch { children } => children.iter().map(PlanNode::leaf_count).sum(),
        }
    }

    /// Longest root-to-leaf path, counted in edges.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            PlanNode::Leaf { .. } => 0,
            PlanNode::Branch { children } => {
                children.iter().map(PlanNode::depth).max().map_or(1, |d| d + 1)
            }
        }
    }

    /// Widest branch in the tree.
    #[must_use]
    pub fn max_width(&self) -> usize {
        match self {
            PlanNode::Leaf { .. } => 0,
            PlanNode::Branch { children } => children
                .iter()
                .map(PlanNode::max_width)
                .max()
                .unwrap_or(0)
                .max(children.len()),
        }
    }
}

/// Smallest depth whose full tree of width `branching_cap` has at least
/// `concurrency` leaves.
#[must_use]
pub fn tree_depth(concurrency: usize, branching_cap: usize) -> usize {
    let cap = branching_cap.max(2);
    let mut depth = 0;
    let mut leaves = 1usize;
    while leaves < concurrency {
        leaves = leaves.saturating_mul(cap);
        depth += 1;
    }
    depth
}

/// Distribute `items` over a balanced tree of `concurrency` leaves.
///
/// Items go to the least-loaded leaf (ties to the leftmost), then empty
/// leaves and branches are pruned. An empty input yields an empty branch.
#[must_use]
pub fn build_plan(items: Vec<WorkItem>, concurrency: usize, branching_cap: usize) -> PlanNode {
    let leaves = concurrency.max(1);
    let cap = branching_cap.max(2);
    let depth = tree_depth(leaves, cap);

    let mut buckets: Vec<Vec<WorkItem>> = vec![Vec::new(); leaves];
    let mut heap: BinaryHeap<Reverse<(usize, usize)>> =
        (0..leaves).map(|index| Reverse((0, index))).collect();
    for item in items {
        let Some(Reverse((load, index))) = heap.pop() else {
            break;
        };
        if let Some(bucket) = buckets.get_mut(index) {
            bucket.push(item);
        }
        heap.push(Reverse((load + 1, index)));
    }

    let mut buckets = buckets.into_iter();
    shape(&mut buckets, leaves, depth, cap).unwrap_or(PlanNode::Branch {
        children: Vec::new(),
    })
}

/// Build a subtree over the next `leaves` buckets. `None` when every
/// bucket underneath is empty.
fn shape(
    buckets: &mut impl Iterator<Item = Vec<WorkItem>>,
    leaves: usize,
    depth: usize,
    cap: usize,
) -> Option<PlanNode> {
    if depth == 0 || leaves <= 1 {
        let items: Vec<WorkItem> = buckets.by_ref().take(leaves.max(1)).flatten().collect();
        return (!items.is_empty()).then_some(PlanNode::Leaf { items });
    }

    let width = cap.min(leaves);
    let base = leaves / width;
    let extra = leaves % width;
    let children: Vec<PlanNode> = (0..width)
        .filter_map(|i| {
            let share = base + usize::from(i < extra);
            shape(&mut *buckets, share, depth - 1, cap)
        })
        .collect();
    (!children.is_empty()).then_some(PlanNode::Branch { children })
}

// =============================================================================
// TESTS
// =============================================================================
