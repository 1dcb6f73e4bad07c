use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

/// Vertices that could not be ordered, listed along one dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub vertices: Vec<usize>,
}

/// Directed graph over `0..len` where an edge `a -> b` means `a` must come first.
///
/// Edge labels record why the edge exists, for diagnostics.
#[derive(Debug, Clone)]
pub struct DependencyGraph<L> {
    successors: Vec<BTreeSet<usize>>,
    predecessors: Vec<BTreeSet<usize>>,
    labels: Vec<(usize, usize, L)>,
}

impl<L> DependencyGraph<L> {
    pub fn new(len: usize) -> Self {
        Self {
            successors: vec![BTreeSet::new(); len],
            predecessors: vec![BTreeSet::new(); len],
            labels: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.successors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successors.is_empty()
    }

    /// Adds `from -> to`. Self-loops are ignored and reported as `false`.
    pub fn add_edge(&mut self, from: usize, to: usize, label: L) -> bool {
        if from == to {
            return false;
        }
        if self.successors[from].insert(to) {
            self.predecessors[to].insert(from);
            self.labels.push((from, to, label));
        }
        true
    }

    pub fn has_edge(&self, from: usize, to: usize) -> bool {
        self.successors[from].contains(&to)
    }

    pub fn edge_count(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> impl Iterator<Item = &(usize, usize, L)> {
        self.labels.iter()
    }

    /// Kahn's algorithm; among ready vertices the lowest index goes first,
    /// so identical input always yields the identical order.
    pub fn topological_sort(&self) -> Result<Vec<usize>, Cycle> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(BTreeSet::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(v, _)| Reverse(v))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(v)) = ready.pop() {
            order.push(v);
            for &next in &self.successors[v] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() == self.len() {
            return Ok(order);
        }
        let remaining: Vec<bool> = in_degree.iter().map(|d| *d > 0).collect();
        Err(self.find_cycle(&remaining))
    }

    /// Walks predecessor edges inside the unresolved set until a vertex repeats.
    fn find_cycle(&self, remaining: &[bool]) -> Cycle {
        let Some(start) = remaining.iter().position(|r| *r) else {
            return Cycle { vertices: Vec::new() };
        };
        let mut path = vec![start];
        let mut seen = vec![None; self.len()];
        seen[start] = Some(0);
        let mut current = start;
        loop {
            // every unresolved vertex keeps at least one unresolved predecessor
            let Some(&prev) = self.predecessors[current].iter().find(|p| remaining[**p]) else {
                return Cycle { vertices: path };
            };
            if let Some(pos) = seen[prev] {
                let mut vertices = path.split_off(pos);
                vertices.reverse();
                return Cycle { vertices };
            }
            seen[prev] = Some(path.len());
            path.push(prev);
            current = prev;
        }
    }
}
