//! Properties of graph building and planning that hold for any stack.

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use proptest::sample::Index;
use stackdiff::error::GraphError;
use stackdiff::graph::{Edge, ResourceDeclaration, ResourceGraph, ResourceKind};
use stackdiff::planner::plan;

/// Resources `r0..rN` in which `ri` only references resources below `i`.
fn layered(picks: &[Vec<Index>]) -> Vec<ResourceDeclaration> {
    picks
        .iter()
        .enumerate()
        .map(|(i, targets)| {
            let decl = ResourceDeclaration::new(format!("r{i}"), ResourceKind::Instance);
            if i == 0 {
                return decl;
            }
            targets.iter().enumerate().fold(decl, |decl, (slot, target)| {
                decl.reference(format!("dep{slot}"), format!("r{}", target.index(i)))
            })
        })
        .collect()
}

fn acyclic_stack() -> impl Strategy<Value = Vec<ResourceDeclaration>> {
    prop::collection::vec(prop::collection::vec(any::<Index>(), 0..4), 1..16)
        .prop_map(|picks| layered(&picks))
        .prop_shuffle()
}

/// A loop `c0 -> c1 -> ... -> c0` plus acyclic resources that may point into
/// it. Returns the declarations and the ids on the loop.
fn stack_with_loop() -> impl Strategy<Value = (Vec<ResourceDeclaration>, BTreeSet<String>)> {
    (
        1..6usize,
        prop::collection::vec(prop::collection::vec(any::<Index>(), 0..3), 0..8),
        prop::collection::vec(prop::option::of(any::<Index>()), 8),
    )
        .prop_flat_map(|(loop_len, picks, into_loop)| {
            let members: Vec<String> = (0..loop_len).map(|i| format!("c{i}")).collect();
            let mut decls: Vec<ResourceDeclaration> = members
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    ResourceDeclaration::new(id.clone(), ResourceKind::Instance)
                        .reference("next", members[(i + 1) % loop_len].clone())
                })
                .collect();

            for (decl, target) in layered(&picks).into_iter().zip(&into_loop) {
                decls.push(match target {
                    Some(target) => {
                        decl.reference("member", members[target.index(loop_len)].clone())
                    }
                    None => decl,
                });
            }

            let members: BTreeSet<String> = members.into_iter().collect();
            (Just(decls).prop_shuffle(), Just(members))
        })
}

proptest! {
    #[test]
    fn prop_edges_are_exactly_the_references(decls in acyclic_stack()) {
        let expected: BTreeSet<Edge> = decls
            .iter()
            .flat_map(|decl| {
                decl.references().map(|(property, target)| Edge {
                    from: decl.id.clone(),
                    to: target.to_string(),
                    property: property.to_string(),
                })
            })
            .collect();

        let graph = ResourceGraph::build(decls).unwrap();
        let edges: BTreeSet<Edge> = graph.edges().into_iter().collect();
        prop_assert_eq!(edges, expected);
    }

    #[test]
    fn prop_referenced_resources_are_created_first(decls in acyclic_stack()) {
        let graph = ResourceGraph::build(decls).unwrap();
        let ops = plan(&graph, None).unwrap();
        prop_assert_eq!(ops.len(), graph.len());

        let position: HashMap<&str, usize> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| (op.id.as_str(), i))
            .collect();
        for edge in graph.edges() {
            prop_assert!(
                position[edge.to.as_str()] < position[edge.from.as_str()],
                "{} planned before its dependency {}",
                edge.from,
                edge.to
            );
        }
    }

    #[test]
    fn prop_plan_against_itself_is_empty(decls in acyclic_stack()) {
        let graph = ResourceGraph::build(decls).unwrap();
        prop_assert!(plan(&graph, Some(&graph)).unwrap().is_empty());
    }

    #[test]
    fn prop_cycle_names_every_member((decls, members) in stack_with_loop()) {
        let err = ResourceGraph::build(decls).unwrap_err();
        let GraphError::CyclicDependency { cycle } = err else {
            return Err(TestCaseError::fail(format!("expected a cycle, got {err}")));
        };

        let found: BTreeSet<String> = cycle.iter().cloned().collect();
        prop_assert_eq!(found.len(), cycle.len(), "cycle repeats a member: {:?}", cycle);
        prop_assert_eq!(found, members);
    }
}
