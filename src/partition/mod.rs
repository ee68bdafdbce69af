//! CSR graphs and recursive balanced partitioning
//!
//! Triangle and cluster grouping both reduce to the same problem: split
//! a weighted adjacency graph into parts of bounded size while cutting
//! as little edge weight as possible. The 2-way split strategy is
//! injected through [`GraphPartitioner`] so an external partitioner can
//! replace the built-in one; the recursive driver, the stable index
//! remapping and the range bookkeeping live here.

use crate::core::Error;
use crate::core::types::{Range, Result, div_round_nearest};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, VecDeque};

/// Compressed sparse row adjacency graph with edge costs
#[derive(Clone, Debug, Default)]
pub struct Graph {
    pub num: u32,
    pub adjacency_offset: Vec<u32>,
    pub adjacency: Vec<u32>,
    pub adjacency_cost: Vec<i32>,
}

impl Graph {
    pub fn neighbors(&self, node: u32) -> impl Iterator<Item = (u32, i32)> + '_ {
        let begin = self.adjacency_offset[node as usize] as usize;
        let end = self.adjacency_offset[node as usize + 1] as usize;
        self.adjacency[begin..end]
            .iter()
            .copied()
            .zip(self.adjacency_cost[begin..end].iter().copied())
    }
}

/// Accumulates edge costs, then lays the graph out in CSR form
///
/// Edges are directed; callers add both directions. Duplicate edges
/// accumulate their costs. The map is ordered so the resulting CSR
/// layout is deterministic.
#[derive(Clone, Debug)]
pub struct GraphBuilder {
    num: u32,
    edges: BTreeMap<(u32, u32), i32>,
}

impl GraphBuilder {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            edges: BTreeMap::new(),
        }
    }

    pub fn add_edge_cost(&mut self, from: u32, to: u32, cost: i32) {
        *self.edges.entry((from, to)).or_insert(0) += cost;
    }

    pub fn build(self) -> Graph {
        let mut graph = Graph {
            num: self.num,
            adjacency_offset: Vec::with_capacity(self.num as usize + 1),
            adjacency: Vec::with_capacity(self.edges.len()),
            adjacency_cost: Vec::with_capacity(self.edges.len()),
        };
        let mut edges = self.edges.into_iter().peekable();
        for node in 0..self.num {
            graph.adjacency_offset.push(graph.adjacency.len() as u32);
            while let Some(&((from, to), cost)) = edges.peek() {
                if from != node {
                    break;
                }
                graph.adjacency.push(to);
                graph.adjacency_cost.push(cost);
                edges.next();
            }
        }
        graph.adjacency_offset.push(graph.adjacency.len() as u32);
        graph
    }
}

/// 2-way split strategy
///
/// Returns one part id (0 or 1) per node; `target_left` is the node
/// count the caller wants in part 0. Both parts must be non-empty.
pub trait GraphPartitioner {
    fn bisect(&self, graph: &Graph, target_left: u32) -> Result<Vec<i32>>;
}

/// Built-in deterministic bisector
///
/// Grows part 0 greedily from a pseudo-peripheral seed (double BFS),
/// always absorbing the boundary node with the highest attached edge
/// weight, then runs a bounded number of gain-positive boundary passes.
#[derive(Clone, Copy, Debug, Default)]
pub struct GreedyBisect;

impl GreedyBisect {
    fn farthest_from(graph: &Graph, start: u32) -> u32 {
        let mut visited = vec![false; graph.num as usize];
        let mut queue = VecDeque::new();
        visited[start as usize] = true;
        queue.push_back(start);
        let mut last = start;
        while let Some(node) = queue.pop_front() {
            last = node;
            for (adjacent, _) in graph.neighbors(node) {
                if !visited[adjacent as usize] {
                    visited[adjacent as usize] = true;
                    queue.push_back(adjacent);
                }
            }
        }
        last
    }

    fn refine(graph: &Graph, part: &mut [i32], target_left: u32) {
        let mut left = part.iter().filter(|&&p| p == 0).count() as i64;
        let target = target_left as i64;
        let num = graph.num as i64;
        for _ in 0..2 {
            let mut moved = false;
            for node in 0..graph.num {
                let side = part[node as usize];
                let mut internal = 0i64;
                let mut external = 0i64;
                for (adjacent, cost) in graph.neighbors(node) {
                    if part[adjacent as usize] == side {
                        internal += cost as i64;
                    } else {
                        external += cost as i64;
                    }
                }
                if external <= internal {
                    continue;
                }
                let new_left = if side == 0 { left - 1 } else { left + 1 };
                if new_left < 1 || new_left > num - 1 {
                    continue;
                }
                if (new_left - target).abs() > (left - target).abs() {
                    continue;
                }
                part[node as usize] = 1 - side;
                left = new_left;
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }
}

impl GraphPartitioner for GreedyBisect {
    fn bisect(&self, graph: &Graph, target_left: u32) -> Result<Vec<i32>> {
        let num = graph.num;
        if num < 2 {
            return Err(Error::Partition(format!(
                "cannot bisect a graph of {} nodes",
                num
            )));
        }
        let target = target_left.clamp(1, num - 1);

        let seed = Self::farthest_from(graph, Self::farthest_from(graph, 0));

        let mut part = vec![1i32; num as usize];
        let mut gain = vec![0i64; num as usize];
        // Max-heap on gain; ties resolve to the smallest node index
        let mut heap: BinaryHeap<(i64, Reverse<u32>)> = BinaryHeap::new();

        let mut grown = 0u32;
        let absorb = |node: u32,
                      part: &mut Vec<i32>,
                      gain: &mut Vec<i64>,
                      heap: &mut BinaryHeap<(i64, Reverse<u32>)>| {
            part[node as usize] = 0;
            for (adjacent, cost) in graph.neighbors(node) {
                if part[adjacent as usize] == 1 {
                    gain[adjacent as usize] += cost as i64;
                    heap.push((gain[adjacent as usize], Reverse(adjacent)));
                }
            }
        };

        absorb(seed, &mut part, &mut gain, &mut heap);
        grown += 1;

        let mut scan = 0u32;
        while grown < target {
            let mut picked = None;
            while let Some((g, Reverse(node))) = heap.pop() {
                if part[node as usize] == 0 || g != gain[node as usize] {
                    continue;
                }
                picked = Some(node);
                break;
            }
            let node = match picked {
                Some(node) => node,
                None => {
                    // Disconnected component; take the next unassigned node
                    while part[scan as usize] == 0 {
                        scan += 1;
                    }
                    scan
                }
            };
            absorb(node, &mut part, &mut gain, &mut heap);
            grown += 1;
        }

        Self::refine(graph, &mut part, target);
        Ok(part)
    }
}

/// Result of a strict partition: contiguous ranges over a permuted
/// node order
#[derive(Clone, Debug, Default)]
pub struct PartitionResult {
    /// Inclusive ranges in the permuted order, covering all nodes
    pub ranges: Vec<Range>,
    /// Permuted order: `indices[new] == old`
    pub indices: Vec<u32>,
}

/// Recursive bisection driver
pub struct Partitioner<'a> {
    strategy: &'a dyn GraphPartitioner,
}

impl<'a> Partitioner<'a> {
    pub fn new(strategy: &'a dyn GraphPartitioner) -> Self {
        Self { strategy }
    }

    /// Split into contiguous parts no larger than `max_size`
    ///
    /// `(min_size + max_size) / 2` steers the balance target of each
    /// bisection; sizes below `min_size` can still occur on remainders.
    pub fn partition_strict(
        &self,
        graph: &Graph,
        min_size: u32,
        max_size: u32,
    ) -> Result<PartitionResult> {
        if min_size == 0 || max_size < min_size {
            return Err(Error::Partition(format!(
                "invalid part size bounds [{}, {}]",
                min_size, max_size
            )));
        }
        let mut result = PartitionResult {
            ranges: Vec::new(),
            indices: (0..graph.num).collect(),
        };
        if graph.num == 0 {
            return Ok(result);
        }
        if graph.num < max_size {
            result.ranges.push(Range::new(0, graph.num));
            return Ok(result);
        }
        self.bisect_recurse(graph, 0, min_size, max_size, &mut result)?;
        Ok(result)
    }

    fn bisect_recurse(
        &self,
        graph: &Graph,
        offset: u32,
        min_size: u32,
        max_size: u32,
        result: &mut PartitionResult,
    ) -> Result<()> {
        let num = graph.num;
        if num <= max_size {
            result.ranges.push(Range::new(offset, num));
            return Ok(());
        }

        let expected = (min_size + max_size) / 2;
        let expected_parts = div_round_nearest(num, expected).max(2);
        let target_left = (num as u64 * (expected_parts >> 1) as u64 / expected_parts as u64) as u32;

        let part = self.strategy.bisect(graph, target_left)?;
        if part.len() != num as usize {
            return Err(Error::Partition(format!(
                "bisection returned {} assignments for {} nodes",
                part.len(),
                num
            )));
        }
        let left = part.iter().filter(|&&p| p == 0).count() as u32;
        let right = num - left;
        if left == 0 || right == 0 {
            return Err(Error::Partition(
                "bisection produced an empty half".to_string(),
            ));
        }

        // Stable remap: part-0 nodes keep their relative order ahead of
        // part-1 nodes
        let old_indices: Vec<u32> =
            result.indices[offset as usize..(offset + num) as usize].to_vec();
        let mut map_to = vec![0u32; num as usize];
        let mut map_back = vec![0u32; num as usize];
        let mut indexer = [0u32, left];
        for (local, &p) in part.iter().enumerate() {
            let new_local = indexer[p as usize];
            indexer[p as usize] += 1;
            map_to[local] = new_local;
            map_back[new_local as usize] = local as u32;
            result.indices[(offset + new_local) as usize] = old_indices[local];
        }

        if left <= max_size && right <= max_size {
            result.ranges.push(Range::new(offset, left));
            result.ranges.push(Range::new(offset + left, right));
            return Ok(());
        }

        // Subgraphs keep intra-half edges only
        let mut halves = [Graph::default(), Graph::default()];
        halves[0].num = left;
        halves[1].num = right;
        for new_local in 0..num {
            let (half, base) = if new_local < left {
                (&mut halves[0], 0)
            } else {
                (&mut halves[1], left)
            };
            half.adjacency_offset.push(half.adjacency.len() as u32);
            let old_local = map_back[new_local as usize];
            for (adjacent, cost) in graph.neighbors(old_local) {
                let mapped = map_to[adjacent as usize];
                if mapped >= base && mapped < base + half.num {
                    half.adjacency.push(mapped - base);
                    half.adjacency_cost.push(cost);
                }
            }
        }
        halves[0]
            .adjacency_offset
            .push(halves[0].adjacency.len() as u32);
        halves[1]
            .adjacency_offset
            .push(halves[1].adjacency.len() as u32);

        self.bisect_recurse(&halves[0], offset, min_size, max_size, result)?;
        self.bisect_recurse(&halves[1], offset + left, min_size, max_size, result)
    }
}
