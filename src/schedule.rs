// --- File: schedule.rs ---
// Per-iteration dependency graph. Each stage is one enqueued command; edges
// name the events a stage must wait for, either from the same iteration or
// carried over from the previous one. The synchronization policy only
// changes which carried edges exist.
use crate::accel::QueueId;
use crate::config::SyncPolicy;
use crate::constants::{COMPUTE_QUEUE, TRANSFER_QUEUE};
use crate::error::{Error, Result};
use std::collections::VecDeque;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Grow,
    ReduceStage1,
    ReduceStage2,
    ReadStats,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Grow,
        Stage::ReduceStage1,
        Stage::ReduceStage2,
        Stage::ReadStats,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn queue(self) -> QueueId {
        match self {
            Stage::ReadStats => TRANSFER_QUEUE,
            _ => COMPUTE_QUEUE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Grow => "grass",
            Stage::ReduceStage1 => "reduce_grass1",
            Stage::ReduceStage2 => "reduce_grass2",
            Stage::ReadStats => "read stats",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub from: Stage,
    pub to: Stage,
    // The producer belongs to the previous iteration
    pub carried: bool,
}

impl Dependency {
    const fn same(from: Stage, to: Stage) -> Self {
        Self {
            from,
            to,
            carried: false,
        }
    }

    const fn carried(from: Stage, to: Stage) -> Self {
        Self {
            from,
            to,
            carried: true,
        }
    }
}

// Producer/consumer chain inside one iteration
const INTRA_EDGES: [Dependency; 3] = [
    Dependency::same(Stage::Grow, Stage::ReduceStage1),
    Dependency::same(Stage::ReduceStage1, Stage::ReduceStage2),
    Dependency::same(Stage::ReduceStage2, Stage::ReadStats),
];

// Hazards between consecutive iterations when queues are not drained:
// the stats record must be read before stage 2 overwrites it, read-backs
// land in iteration order, and growth must not rewrite the grid while
// stage 1 of the previous iteration still reads it.
const CARRIED_EDGES: [Dependency; 3] = [
    Dependency::carried(Stage::ReadStats, Stage::ReduceStage2),
    Dependency::carried(Stage::ReadStats, Stage::ReadStats),
    Dependency::carried(Stage::ReduceStage1, Stage::Grow),
];

#[derive(Debug, Clone)]
pub struct IterationGraph {
    order: Vec<Stage>,
    edges: Vec<Dependency>,
}

impl IterationGraph {
    pub fn new(policy: SyncPolicy) -> Result<Self> {
        let mut edges = INTRA_EDGES.to_vec();
        if policy == SyncPolicy::Pipelined {
            edges.extend_from_slice(&CARRIED_EDGES);
        }
        Self::from_edges(edges)
    }

    pub fn from_edges(edges: Vec<Dependency>) -> Result<Self> {
        let order = topological_order(&edges)?;
        Ok(Self { order, edges })
    }

    pub fn order(&self) -> &[Stage] {
        &self.order
    }

    pub fn dependencies(&self, stage: Stage) -> impl Iterator<Item = &Dependency> {
        self.edges.iter().filter(move |edge| edge.to == stage)
    }

    // Stages whose events must outlive their own iteration.
    pub fn carried_sources(&self) -> Vec<Stage> {
        let mut sources: Vec<Stage> = self
            .edges
            .iter()
            .filter(|edge| edge.carried)
            .map(|edge| edge.from)
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

// Kahn's algorithm over the same-iteration edges. Carried edges point at the
// previous iteration, which is always complete in issue terms, so they never
// constrain the order.
fn topological_order(edges: &[Dependency]) -> Result<Vec<Stage>> {
    let mut in_degree = [0usize; Stage::ALL.len()];
    for edge in edges.iter().filter(|edge| !edge.carried) {
        in_degree[edge.to.index()] += 1;
    }
    let mut ready: VecDeque<Stage> = Stage::ALL
        .iter()
        .copied()
        .filter(|stage| in_degree[stage.index()] == 0)
        .collect();
    let mut order = Vec::with_capacity(Stage::ALL.len());
    while let Some(stage) = ready.pop_front() {
        order.push(stage);
        for edge in edges.iter().filter(|edge| !edge.carried && edge.from == stage) {
            in_degree[edge.to.index()] -= 1;
            if in_degree[edge.to.index()] == 0 {
                ready.push_back(edge.to);
            }
        }
    }
    if order.len() != Stage::ALL.len() {
        return Err(Error::Config(
            "iteration dependency graph contains a cycle".into(),
        ));
    }
    Ok(order)
}

// --- Event Bookkeeping ---

// Events produced by the stages of one iteration.
#[derive(Debug)]
pub struct StageEvents<E> {
    events: [Option<E>; 4],
}

impl<E> Default for StageEvents<E> {
    fn default() -> Self {
        Self {
            events: [None, None, None, None],
        }
    }
}

impl<E> StageEvents<E> {
    pub fn get(&self, stage: Stage) -> Option<&E> {
        self.events[stage.index()].as_ref()
    }

    fn set(&mut self, stage: Stage, event: E) {
        self.events[stage.index()] = Some(event);
    }

    fn take(&mut self, stage: Stage) -> Option<E> {
        self.events[stage.index()].take()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &E)> {
        Stage::ALL
            .iter()
            .filter_map(move |&stage| self.get(stage).map(|event| (stage, event)))
    }

    pub fn len(&self) -> usize {
        self.events.iter().filter(|event| event.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Issues one iteration at a time in topological order, threading wait-lists
// from the graph. Only events on carried edges survive into the next
// iteration; everything else is handed back to the caller to drop.
pub struct Scheduler<E> {
    graph: IterationGraph,
    carried_sources: Vec<Stage>,
    previous: StageEvents<E>,
}

impl<E: Clone> Scheduler<E> {
    pub fn new(graph: IterationGraph) -> Self {
        let carried_sources = graph.carried_sources();
        Self {
            graph,
            carried_sources,
            previous: StageEvents::default(),
        }
    }

    pub fn run_iteration<F>(&mut self, mut issue: F) -> Result<StageEvents<E>>
    where
        F: FnMut(Stage, &[E]) -> Result<E>,
    {
        let mut current = StageEvents::default();
        for &stage in self.graph.order() {
            let wait: Vec<E> = self
                .graph
                .dependencies(stage)
                .filter_map(|edge| {
                    let source = if edge.carried {
                        &self.previous
                    } else {
                        &current
                    };
                    source.get(edge.from).cloned()
                })
                .collect();
            let event = issue(stage, &wait)?;
            current.set(stage, event);
        }

        let mut kept = StageEvents::default();
        for &stage in &self.carried_sources {
            if let Some(event) = current.get(stage) {
                kept.set(stage, event.clone());
            }
        }
        self.previous = kept;
        Ok(current)
    }

    // Drop carried events, e.g. after both queues were drained.
    pub fn release_carried(&mut self) -> usize {
        let mut released = 0;
        for stage in Stage::ALL {
            if self.previous.take(stage).is_some() {
                released += 1;
            }
        }
        released
    }

    pub fn carried_len(&self) -> usize {
        self.previous.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_graph_is_a_chain_without_carried_edges() {
        let graph = IterationGraph::new(SyncPolicy::Strict).unwrap();
        assert_eq!(graph.order(), &Stage::ALL);
        assert!(graph.carried_sources().is_empty());
    }

    #[test]
    fn pipelined_graph_keeps_stage1_and_read_events() {
        let graph = IterationGraph::new(SyncPolicy::Pipelined).unwrap();
        assert_eq!(graph.order(), &Stage::ALL);
        assert_eq!(
            graph.carried_sources(),
            vec![Stage::ReduceStage1, Stage::ReadStats]
        );
        let waits: Vec<_> = graph.dependencies(Stage::ReduceStage2).collect();
        assert_eq!(waits.len(), 2);
    }

    #[test]
    fn cycle_is_rejected() {
        let edges = vec![
            Dependency::same(Stage::Grow, Stage::ReduceStage1),
            Dependency::same(Stage::ReduceStage1, Stage::Grow),
        ];
        assert!(IterationGraph::from_edges(edges).is_err());
    }

    #[test]
    fn wait_lists_follow_edges_across_iterations() {
        let graph = IterationGraph::new(SyncPolicy::Pipelined).unwrap();
        let mut scheduler: Scheduler<String> = Scheduler::new(graph);
        let mut issued: Vec<(String, Vec<String>)> = Vec::new();
        for iter in 1..=2 {
            scheduler
                .run_iteration(|stage, wait| {
                    let name = format!("{}#{}", stage.label(), iter);
                    issued.push((name.clone(), wait.to_vec()));
                    Ok(name)
                })
                .unwrap();
        }
        assert_eq!(issued[0].1, Vec::<String>::new());
        // Second iteration: growth waits for stage 1 of the first
        assert_eq!(issued[4].0, "grass#2");
        assert_eq!(issued[4].1, vec!["reduce_grass1#1".to_string()]);
        // Stage 2 waits for its own stage 1 and the previous read-back
        assert_eq!(
            issued[6].1,
            vec!["reduce_grass1#2".to_string(), "read stats#1".to_string()]
        );
        assert_eq!(
            issued[7].1,
            vec!["reduce_grass2#2".to_string(), "read stats#1".to_string()]
        );
        assert_eq!(scheduler.carried_len(), 2);
        assert_eq!(scheduler.release_carried(), 2);
        assert_eq!(scheduler.carried_len(), 0);
    }

    #[test]
    fn failing_stage_stops_the_iteration() {
        let graph = IterationGraph::new(SyncPolicy::Strict).unwrap();
        let mut scheduler: Scheduler<u32> = Scheduler::new(graph);
        let mut count = 0;
        let result = scheduler.run_iteration(|stage, _| {
            count += 1;
            if stage == Stage::ReduceStage2 {
                Err(Error::enqueue("kernel launch", stage.label(), "boom"))
            } else {
                Ok(count)
            }
        });
        assert!(result.is_err());
        assert_eq!(count, 3);
    }
}
// --- End of File: schedule.rs ---
