//! Step connector.
//!
//! The conversation steps form a directed acyclic graph. Every step has a
//! sequential edge to its fixed successor; bypass edges jump forward over one
//! or more steps and are taken only when their predicate holds for the answer
//! recorded at the edge's source step.

use serde_json::Value;

use crate::domain::conversation::{ConversationState, Step};
use crate::flows::FlowTransitionError;

/// Pure decision over conversation state. Never mutates the state it inspects.
pub trait StepConnector {
    /// Step to move to after `just_completed`; `None` once the final step is done.
    fn next_step(
        &self,
        state: &ConversationState,
        just_completed: Step,
        answer: &Value,
    ) -> Option<Step>;

    /// Whether `step` is currently bypassed by an active skip edge.
    fn can_skip(&self, state: &ConversationState, step: Step) -> bool;

    /// The step actually visited before the current one.
    fn previous_step(&self, state: &ConversationState) -> Option<Step>;
}

pub type EdgePredicate = fn(&Value) -> bool;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Sequential,
    Bypass,
}

#[derive(Clone, Debug)]
pub struct StepEdge {
    pub from: Step,
    pub to: Step,
    pub kind: EdgeKind,
    pub name: &'static str,
    predicate: EdgePredicate,
}

impl StepEdge {
    pub fn is_active(&self, answer: &Value) -> bool {
        (self.predicate)(answer)
    }
}

#[derive(Clone, Debug)]
pub struct StepGraph {
    edges: Vec<StepEdge>,
}

impl StepGraph {
    /// Graph with only the fixed sequential edges.
    pub fn sequential() -> Self {
        let edges = Step::ALL
            .windows(2)
            .map(|pair| StepEdge {
                from: pair[0],
                to: pair[1],
                kind: EdgeKind::Sequential,
                name: "sequential",
                predicate: always,
            })
            .collect();
        Self { edges }
    }

    /// Adds a bypass edge. Edges must point forward so the graph stays acyclic.
    pub fn with_bypass(
        mut self,
        name: &'static str,
        from: Step,
        to: Step,
        predicate: EdgePredicate,
    ) -> Result<Self, FlowTransitionError> {
        if to <= from {
            return Err(FlowTransitionError::CyclicEdge { from, to });
        }
        if to.position() == from.position() + 1 {
            return Err(FlowTransitionError::RedundantBypass { from, to });
        }
        self.edges.push(StepEdge { from, to, kind: EdgeKind::Bypass, name, predicate });
        Ok(self)
    }

    pub fn edges_from(&self, step: Step) -> impl Iterator<Item = &StepEdge> {
        self.edges.iter().filter(move |edge| edge.from == step)
    }

    fn active_bypass_over(&self, state: &ConversationState, step: Step) -> Option<&StepEdge> {
        self.edges.iter().find(|edge| {
            edge.kind == EdgeKind::Bypass
                && edge.from < step
                && step < edge.to
                && state.answer(edge.from).is_some_and(|answer| edge.is_active(answer))
        })
    }
}

impl Default for StepGraph {
    fn default() -> Self {
        Self {
            edges: Self::sequential()
                .edges
                .into_iter()
                .chain(std::iter::once(StepEdge {
                    from: Step::ProgramSelection,
                    to: Step::CreditDistribution,
                    kind: EdgeKind::Bypass,
                    name: "program_without_course_choice",
                    predicate: program_needs_no_course_choice,
                }))
                .collect(),
        }
    }
}

impl StepConnector for StepGraph {
    fn next_step(
        &self,
        _state: &ConversationState,
        just_completed: Step,
        answer: &Value,
    ) -> Option<Step> {
        let mut sequential = None;
        for edge in self.edges_from(just_completed) {
            match edge.kind {
                EdgeKind::Bypass if edge.is_active(answer) => return Some(edge.to),
                EdgeKind::Bypass => {}
                EdgeKind::Sequential => sequential = Some(edge.to),
            }
        }
        sequential
    }

    fn can_skip(&self, state: &ConversationState, step: Step) -> bool {
        self.active_bypass_over(state, step).is_some()
    }

    fn previous_step(&self, state: &ConversationState) -> Option<Step> {
        state.completed_steps.iter().rev().copied().find(|step| *step < state.current_step)
    }
}

fn always(_: &Value) -> bool {
    true
}

/// The program answer makes course selection moot when the program has no
/// course-level choice, or when the student delegates course picking to the agent.
pub fn program_needs_no_course_choice(answer: &Value) -> bool {
    let no_choice =
        answer.get("requires_course_selection").and_then(Value::as_bool) == Some(false);
    let delegated = answer
        .get("course_selection_method")
        .and_then(Value::as_str)
        .is_some_and(|method| method.eq_ignore_ascii_case("ai"));
    no_choice || delegated
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{StepConnector, StepGraph};
    use crate::domain::conversation::{ConversationId, Step};
    use crate::flows::conversation::ConversationFlow;
    use crate::flows::FlowTransitionError;

    fn initial() -> crate::domain::conversation::ConversationState {
        ConversationFlow::default().create_initial(ConversationId("conv-1".to_string()))
    }

    #[test]
    fn next_step_follows_fixed_successor_by_default() {
        let graph = StepGraph::default();
        let state = initial();
        let answer = json!({"ok": true});

        let pairs = [
            (Step::ProfileCheck, Some(Step::ProgramSelection)),
            (Step::ProgramSelection, Some(Step::CourseSelection)),
            (Step::CourseSelection, Some(Step::CreditDistribution)),
            (Step::CreditDistribution, Some(Step::MilestonesAndConstraints)),
            (Step::MilestonesAndConstraints, Some(Step::GeneratingPlan)),
            (Step::GeneratingPlan, None),
        ];
        for (completed, expected) in pairs {
            assert_eq!(graph.next_step(&state, completed, &answer), expected);
        }
    }

    #[test]
    fn program_without_course_choice_skips_course_selection() {
        let graph = StepGraph::default();
        let state = initial();

        let no_choice = json!({"program_id": "cert-1", "requires_course_selection": false});
        assert_eq!(
            graph.next_step(&state, Step::ProgramSelection, &no_choice),
            Some(Step::CreditDistribution)
        );

        let delegated = json!({"program_id": "cs-bs", "course_selection_method": "AI"});
        assert_eq!(
            graph.next_step(&state, Step::ProgramSelection, &delegated),
            Some(Step::CreditDistribution)
        );

        let manual = json!({"program_id": "cs-bs", "course_selection_method": "manual"});
        assert_eq!(
            graph.next_step(&state, Step::ProgramSelection, &manual),
            Some(Step::CourseSelection)
        );
    }

    #[test]
    fn skip_predicate_only_applies_to_its_source_step() {
        let graph = StepGraph::default();
        let state = initial();
        let answer = json!({"requires_course_selection": false});

        assert_eq!(
            graph.next_step(&state, Step::ProfileCheck, &answer),
            Some(Step::ProgramSelection)
        );
        assert_eq!(
            graph.next_step(&state, Step::CourseSelection, &answer),
            Some(Step::CreditDistribution)
        );
    }

    #[test]
    fn can_skip_reflects_recorded_program_answer() -> Result<(), FlowTransitionError> {
        let flow = ConversationFlow::default();
        let graph = StepGraph::default();
        let state = initial();
        assert!(!graph.can_skip(&state, Step::CourseSelection));

        let state = flow.record_answer(&state, Step::ProfileCheck, json!({"verified": true}))?;
        let state = flow.advance_to(&state, Step::ProgramSelection)?;
        let state = flow.record_answer(
            &state,
            Step::ProgramSelection,
            json!({"requires_course_selection": false}),
        )?;

        assert!(graph.can_skip(&state, Step::CourseSelection));
        assert!(!graph.can_skip(&state, Step::CreditDistribution));
        assert!(!graph.can_skip(&state, Step::ProgramSelection));
        Ok(())
    }

    #[test]
    fn bypass_edges_must_point_forward() {
        let backward = StepGraph::sequential().with_bypass(
            "loop",
            Step::CreditDistribution,
            Step::ProgramSelection,
            |_| true,
        );
        assert!(matches!(backward, Err(FlowTransitionError::CyclicEdge { .. })));

        let adjacent = StepGraph::sequential().with_bypass(
            "adjacent",
            Step::ProfileCheck,
            Step::ProgramSelection,
            |_| true,
        );
        assert!(matches!(adjacent, Err(FlowTransitionError::RedundantBypass { .. })));
    }

    #[test]
    fn additional_bypass_rules_are_added_as_edges() -> Result<(), FlowTransitionError> {
        let graph = StepGraph::default().with_bypass(
            "milestones_preset",
            Step::CreditDistribution,
            Step::GeneratingPlan,
            |answer| answer.get("milestones_preset").is_some(),
        )?;
        let state = initial();

        assert_eq!(
            graph.next_step(&state, Step::CreditDistribution, &json!({"milestones_preset": []})),
            Some(Step::GeneratingPlan)
        );
        assert_eq!(
            graph.next_step(&state, Step::CreditDistribution, &json!({})),
            Some(Step::MilestonesAndConstraints)
        );
        Ok(())
    }

    #[test]
    fn previous_step_is_last_visited_step() -> Result<(), FlowTransitionError> {
        let flow = ConversationFlow::default();
        let graph = StepGraph::default();
        let state = initial();
        assert_eq!(graph.previous_step(&state), None);

        let state = flow.record_answer(&state, Step::ProfileCheck, json!({}))?;
        let state = flow.advance_to(&state, Step::ProgramSelection)?;
        let state = flow.record_answer(
            &state,
            Step::ProgramSelection,
            json!({"course_selection_method": "ai"}),
        )?;
        let state = flow.advance_to(&state, Step::CreditDistribution)?;

        assert_eq!(graph.previous_step(&state), Some(Step::ProgramSelection));
        Ok(())
    }
}
