//! Grouping device-supported operations for an offload adapter.
//!
//! Only the selection lives here; replacing a partition with a fused
//! unit is the adapter's job.

use nnrt_core::{ensure_arg, Device, IntermediateGraph, NnrtResult};
use tracing::debug;

/// Connected supported operations, by operation index in ascending order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub nodes: Vec<usize>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn find(parent: &mut [usize], mut node: usize) -> usize {
    while parent[node] != node {
        parent[node] = parent[parent[node]];
        node = parent[node];
    }
    node
}

/// Groups supported operations joined by a producer → consumer edge.
///
/// Partitions come out ordered by their first operation.
pub fn supported_partitions(
    graph: &IntermediateGraph,
    supported: &[bool],
) -> NnrtResult<Vec<Partition>> {
    let ops = graph.operations();
    ensure_arg!(
        supported.len() == ops.len(),
        "support flags cover {} operations, graph has {}",
        supported.len(),
        ops.len()
    );

    let mut parent: Vec<usize> = (0..ops.len()).collect();
    for (consumer, op) in ops.iter().enumerate() {
        if !supported[consumer] {
            continue;
        }
        for input in &op.inputs {
            let Some(producer) = graph.producer(*input) else { continue };
            if supported[producer] {
                let (a, b) = (find(&mut parent, producer), find(&mut parent, consumer));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut partitions: Vec<(usize, Partition)> = Vec::new();
    for node in (0..ops.len()).filter(|n| supported[*n]) {
        let root = find(&mut parent, node);
        match partitions.iter_mut().find(|(r, _)| *r == root) {
            Some((_, partition)) => partition.nodes.push(node),
            None => partitions.push((root, Partition { nodes: vec![node] })),
        }
    }
    Ok(partitions.into_iter().map(|(_, p)| p).collect())
}

/// Keeps the `max` largest partitions, earlier ones winning ties, in
/// their original order.
pub fn limit_partitions(partitions: Vec<Partition>, max: usize) -> Vec<Partition> {
    if partitions.len() <= max {
        return partitions;
    }
    let mut ranked: Vec<usize> = (0..partitions.len()).collect();
    ranked.sort_by_key(|i| std::cmp::Reverse(partitions[*i].len()));
    let mut kept = ranked[..max].to_vec();
    kept.sort_unstable();
    debug!(
        candidates = partitions.len(),
        kept = max,
        "partition count limited"
    );
    partitions
        .into_iter()
        .enumerate()
        .filter(|(i, _)| kept.binary_search(i).is_ok())
        .map(|(_, p)| p)
        .collect()
}

/// Asks `device` which operations it runs and groups them.
pub fn device_partitions(
    device: &dyn Device,
    graph: &IntermediateGraph,
    max: Option<usize>,
) -> NnrtResult<Vec<Partition>> {
    let supported = device.supported_operations(graph)?;
    let partitions = supported_partitions(graph, &supported)?;
    Ok(match max {
        Some(max) => limit_partitions(partitions, max),
        None => partitions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(nodes: &[usize]) -> Partition {
        Partition {
            nodes: nodes.to_vec(),
        }
    }

    #[test]
    fn keeps_largest_with_earliest_ties() {
        let parts = vec![part(&[0]), part(&[1, 2]), part(&[3]), part(&[4, 5]), part(&[6, 7, 8])];
        assert_eq!(
            limit_partitions(parts.clone(), 2),
            vec![part(&[1, 2]), part(&[6, 7, 8])]
        );
        assert_eq!(
            limit_partitions(parts.clone(), 3),
            vec![part(&[1, 2]), part(&[4, 5]), part(&[6, 7, 8])]
        );
        assert_eq!(limit_partitions(parts.clone(), 9), parts);
        assert!(limit_partitions(parts, 0).is_empty());
    }
}
