use serde_json::Value;

use gradplan_core::domain::conversation::Step;

const ANSWER_FORMAT: &str = "When this step is settled, reply with only a JSON object holding \
the step answer and nothing else. If you need information only the student can give, reply \
with a short plain-text question instead. Use the tools for student and catalog data; never \
invent catalog facts.";

fn step_instructions(step: Step) -> &'static str {
    match step {
        Step::ProfileCheck => {
            "Review the student's profile with get_student_profile. Confirm the expected \
             graduation term and note completed courses. Answer with the profile facts the \
             later steps rely on."
        }
        Step::ProgramSelection => {
            "Settle the programs the plan covers. Use list_programs and \
             get_program_requirements. Answer with `program_id`, `requires_course_selection` \
             (false when every requirement is a fixed course list) and, if the student leaves \
             electives to you, `course_selection_method: \"ai\"`."
        }
        Step::CourseSelection => {
            "Choose the elective courses for each requirement group that needs a choice. \
             Answer with the selected course codes per group."
        }
        Step::CreditDistribution => {
            "Decide how many credits to take per term until graduation. Use \
             list_course_offerings to check availability. Answer with the per-term credit load."
        }
        Step::MilestonesAndConstraints => {
            "Collect milestones and constraints such as internships or part-time terms. \
             Answer with the list, which may be empty."
        }
        Step::GeneratingPlan => {
            "Build the term-by-term plan from the recorded answers and submit it by calling \
             generate_plan. Each term lists its courses with code and credits."
        }
    }
}

/// System instructions for one reasoning turn at `step`.
pub fn system_prompt(step: Step, input_payload: &Value) -> String {
    format!(
        "You are a graduation planning assistant working through a fixed sequence of steps.\n\
         Current step: {} ({} of {}).\n{}\n{}\nRequest details: {}",
        step.label(),
        step.position(),
        Step::ALL.len(),
        step_instructions(step),
        ANSWER_FORMAT,
        input_payload
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use gradplan_core::domain::conversation::Step;

    use super::system_prompt;

    #[test]
    fn prompt_names_step_and_request() {
        let prompt = system_prompt(Step::GeneratingPlan, &json!({"target_term": "2029-SPRING"}));
        assert!(prompt.contains("Generate Plan (6 of 6)"));
        assert!(prompt.contains("generate_plan"));
        assert!(prompt.contains("2029-SPRING"));
    }
}
