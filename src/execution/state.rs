// src/execution/state.rs

//! The run state machine.
//!
//! The allowed transitions form a small directed graph which is built once
//! with `petgraph` and queried for both single-edge checks and reachability.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};

/// Persisted lifecycle state of an execution.
///
/// Preparation is modelled as a single step: there is no stored `preparing`
/// state, an execution goes straight from `Initial` to `Prepared` (or `Error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Initial,
    Prepared,
    Submitted,
    Completing,
    Completed,
    Canceling,
    Canceled,
    Error,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 8] = [
        ExecutionState::Initial,
        ExecutionState::Prepared,
        ExecutionState::Submitted,
        ExecutionState::Completing,
        ExecutionState::Completed,
        ExecutionState::Canceling,
        ExecutionState::Canceled,
        ExecutionState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Initial => "initial",
            ExecutionState::Prepared => "prepared",
            ExecutionState::Submitted => "submitted",
            ExecutionState::Completing => "completing",
            ExecutionState::Completed => "completed",
            ExecutionState::Canceling => "canceling",
            ExecutionState::Canceled => "canceled",
            ExecutionState::Error => "error",
        }
    }

    /// `completed`, `canceled` and `error` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Canceled | ExecutionState::Error
        )
    }

    /// Whether a cancellation request may move this state to `canceling`.
    pub fn is_cancelable(&self) -> bool {
        self.can_transition_to(ExecutionState::Canceling)
    }

    /// Whether the state machine has an edge `self -> next`.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        transition_graph().allows(*self, next)
    }

    /// States that can only be reached by passing through `submitted`, and
    /// therefore always carry a remote run id.
    pub fn requires_run_id(&self) -> bool {
        transition_graph().requires_run_id(*self)
    }

    /// Whether a remote run id may be present in this state.
    pub fn permits_run_id(&self) -> bool {
        transition_graph().reachable(ExecutionState::Submitted, *self)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed-transition graph of the run state machine.
#[derive(Debug)]
pub struct TransitionGraph {
    graph: DiGraphMap<ExecutionState, ()>,
    run_id_states: BTreeSet<ExecutionState>,
}

impl TransitionGraph {
    fn new() -> Self {
        use ExecutionState::*;

        let edges = [
            (Initial, Prepared),
            (Initial, Error),
            (Prepared, Submitted),
            (Prepared, Error),
            (Submitted, Completing),
            (Submitted, Error),
            (Completing, Completed),
            (Completing, Error),
            (Initial, Canceling),
            (Prepared, Canceling),
            (Submitted, Canceling),
            (Canceling, Canceled),
            (Canceling, Error),
        ];

        let mut graph: DiGraphMap<ExecutionState, ()> = DiGraphMap::new();
        for state in ExecutionState::ALL {
            graph.add_node(state);
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        // A state requires a run id when removing `submitted` from the graph
        // makes it unreachable from `initial`.
        let mut bypass = graph.clone();
        bypass.remove_node(Submitted);
        let run_id_states = ExecutionState::ALL
            .into_iter()
            .filter(|s| *s == Submitted || (*s != Initial && !has_path_connecting(&bypass, Initial, *s, None)))
            .collect();

        Self {
            graph,
            run_id_states,
        }
    }

    pub fn allows(&self, from: ExecutionState, to: ExecutionState) -> bool {
        self.graph.contains_edge(from, to)
    }

    /// Whether `to` can be reached from `from` along zero or more edges.
    pub fn reachable(&self, from: ExecutionState, to: ExecutionState) -> bool {
        has_path_connecting(&self.graph, from, to, None)
    }

    pub fn requires_run_id(&self, state: ExecutionState) -> bool {
        self.run_id_states.contains(&state)
    }

    /// All edges, in no particular order.
    pub fn edges(&self) -> impl Iterator<Item = (ExecutionState, ExecutionState)> + '_ {
        self.graph.all_edges().map(|(from, to, _)| (from, to))
    }
}

static GRAPH: LazyLock<TransitionGraph> = LazyLock::new(TransitionGraph::new);

/// The process-wide transition graph.
pub fn transition_graph() -> &'static TransitionGraph {
    &GRAPH
}

#[cfg(test)]
mod tests {
    use super::ExecutionState::*;
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [Completed, Canceled, Error] {
            assert!(from.is_terminal());
            for to in ExecutionState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must not exist");
            }
        }
    }

    #[test]
    fn happy_path_is_a_chain() {
        assert!(Initial.can_transition_to(Prepared));
        assert!(Prepared.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Completing));
        assert!(Completing.can_transition_to(Completed));

        // No skipping.
        assert!(!Initial.can_transition_to(Submitted));
        assert!(!Prepared.can_transition_to(Completing));
        assert!(!Submitted.can_transition_to(Completed));
    }

    #[test]
    fn cancellation_only_from_early_states() {
        let cancelable: Vec<_> = ExecutionState::ALL
            .into_iter()
            .filter(|s| s.is_cancelable())
            .collect();
        assert_eq!(cancelable, vec![Initial, Prepared, Submitted]);
        assert!(Canceling.can_transition_to(Canceled));
        assert!(Canceling.can_transition_to(Error));
        assert!(!Canceling.can_transition_to(Completed));
    }

    #[test]
    fn run_id_requirements_follow_the_graph() {
        let required: Vec<_> = ExecutionState::ALL
            .into_iter()
            .filter(|s| s.requires_run_id())
            .collect();
        assert_eq!(required, vec![Submitted, Completing, Completed]);

        assert!(!Initial.permits_run_id());
        assert!(!Prepared.permits_run_id());
        assert!(Canceling.permits_run_id());
        assert!(Error.permits_run_id());
    }

    #[test]
    fn graph_has_thirteen_edges() {
        assert_eq!(transition_graph().edges().count(), 13);
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&Completing).unwrap();
        assert_eq!(json, "\"completing\"");
        let back: ExecutionState = serde_json::from_str("\"canceling\"").unwrap();
        assert_eq!(back, Canceling);
    }
}
