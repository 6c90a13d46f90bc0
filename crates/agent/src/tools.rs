//! Tool registry: the declared tools, their argument and result schemas, and the
//! envelopes that carry calls and results through the transcript.

use std::collections::BTreeMap;

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use gradplan_core::domain::tool::{ToolCall, ToolCallId, ToolOutcome, ToolResult};

pub const GET_STUDENT_PROFILE: &str = "get_student_profile";
pub const LIST_PROGRAMS: &str = "list_programs";
pub const GET_PROGRAM_REQUIREMENTS: &str = "get_program_requirements";
pub const LIST_COURSE_OFFERINGS: &str = "list_course_offerings";
pub const GENERATE_PLAN: &str = "generate_plan";

/// Arguments for `get_student_profile`. The student comes from the job, never the model.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StudentProfileArgs {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StudentProfileOutput {
    #[schemars(description = "Student identifier")]
    pub user_id: String,
    #[schemars(description = "Student name")]
    pub display_name: String,
    #[schemars(description = "Year of admission")]
    pub admission_year: Option<i32>,
    #[schemars(description = "Target graduation term")]
    pub expected_graduation_term: Option<String>,
    #[schemars(description = "Whether the student transferred in")]
    pub is_transfer: bool,
    #[schemars(description = "Course codes already completed")]
    pub completed_courses: Vec<String>,
    #[schemars(description = "Free-text career goals")]
    pub career_goals: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListProgramsArgs {
    #[schemars(description = "major | minor | certificate | general_education")]
    pub kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSummary {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub total_credits: u32,
    #[schemars(description = "False when every requirement is a fixed course list")]
    pub requires_course_selection: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListProgramsOutput {
    #[schemars(description = "Matching programs")]
    pub programs: Vec<ProgramSummary>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProgramRequirementsArgs {
    #[schemars(description = "Program identifier")]
    pub program_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequirementGroupSummary {
    pub id: String,
    pub name: String,
    pub credits_required: u32,
    pub course_codes: Vec<String>,
    #[schemars(description = "Courses to pick from courseCodes; absent means all are required")]
    pub min_courses: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ProgramRequirementsOutput {
    #[schemars(description = "Program summary")]
    pub program: ProgramSummary,
    #[schemars(description = "Requirement groups")]
    pub groups: Vec<RequirementGroupSummary>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CourseOfferingsArgs {
    #[schemars(description = "Course codes to look up")]
    pub course_codes: Vec<String>,
    #[schemars(description = "Restrict to one term, e.g. 2026-FALL")]
    pub term: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct OfferingSummary {
    pub code: String,
    pub term: String,
    pub title: String,
    pub credits: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CourseOfferingsOutput {
    #[schemars(description = "Scheduled offerings")]
    pub offerings: Vec<OfferingSummary>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlannedCourse {
    #[schemars(description = "Course code, e.g. CS201")]
    pub code: String,
    pub credits: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlannedTerm {
    #[schemars(description = "Term label, e.g. 2026-FALL")]
    pub term: String,
    pub courses: Vec<PlannedCourse>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GeneratePlanArgs {
    #[schemars(description = "Ordered terms with the courses taken in each")]
    pub terms: Vec<PlannedTerm>,
    #[schemars(description = "Advice or caveats for the student")]
    pub notes: Option<String>,
}

/// The finished plan stored as the job's result.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GeneratePlanOutput {
    #[schemars(description = "Validated terms")]
    pub terms: Vec<PlannedTerm>,
    #[schemars(description = "Sum of planned credits")]
    pub total_credits: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Advice or caveats for the student")]
    pub notes: Option<String>,
}

type Conformance = fn(&Value) -> Result<(), String>;

fn conforms<T: DeserializeOwned>(value: &Value) -> Result<(), String> {
    T::deserialize(value).map(|_| ()).map_err(|error| error.to_string())
}

/// Inline JSON Schema for `T`, without the meta-schema and title noise.
fn json_schema<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|settings| {
            settings.inline_subschemas = true;
            settings.meta_schema = None;
        })
        .into_generator();
    let mut schema = serde_json::to_value(generator.into_root_schema_for::<T>())
        .unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(object) = schema.as_object_mut() {
        object.remove("title");
    }
    schema
}

#[derive(Clone, Debug)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub output_schema: Value,
    check_arguments: Conformance,
    check_output: Conformance,
}

impl ToolSpec {
    /// Spec whose schemas and validation both come from the argument and output types.
    pub fn typed<A, O>(name: &'static str, description: &'static str) -> Self
    where
        A: JsonSchema + DeserializeOwned,
        O: JsonSchema + DeserializeOwned,
    {
        Self {
            name,
            description,
            parameters: json_schema::<A>(),
            output_schema: json_schema::<O>(),
            check_arguments: conforms::<A>,
            check_output: conforms::<O>,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolRegistryError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {}", problems.join("; "))]
    InvalidToolArguments { tool: String, problems: Vec<String> },
    #[error("invalid output from `{tool}`: {}", problems.join("; "))]
    InvalidToolOutput { tool: String, problems: Vec<String> },
}

#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolSpec>,
}

impl ToolRegistry {
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name, spec);
    }

    /// The five tools the planning conversation can call.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for spec in builtin_specs() {
            registry.register(spec);
        }
        registry
    }

    pub fn describe(&self, name: &str) -> Result<&ToolSpec, ToolRegistryError> {
        self.tools.get(name).ok_or_else(|| ToolRegistryError::UnknownTool(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tools.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Fresh id for a call recorded in a transcript.
    pub fn next_call_id() -> ToolCallId {
        ToolCallId(format!("call-{}", Uuid::new_v4()))
    }

    pub fn encode_call(&self, name: &str, arguments: Value) -> Result<ToolCall, ToolRegistryError> {
        let spec = self.describe(name)?;
        if let Err(problem) = (spec.check_arguments)(&arguments) {
            return Err(ToolRegistryError::InvalidToolArguments {
                tool: name.to_string(),
                problems: vec![problem],
            });
        }
        Ok(ToolCall { id: Self::next_call_id(), name: spec.name.to_string(), arguments })
    }

    pub fn encode_result(
        &self,
        call_id: &ToolCallId,
        name: &str,
        output: Value,
    ) -> Result<ToolResult, ToolRegistryError> {
        let spec = self.describe(name)?;
        self.validate_output(spec, &output)?;
        Ok(ToolResult {
            call_id: call_id.clone(),
            name: spec.name.to_string(),
            outcome: ToolOutcome::Output(output),
        })
    }

    pub fn encode_failure(
        &self,
        call_id: &ToolCallId,
        name: &str,
        message: impl Into<String>,
    ) -> ToolResult {
        ToolResult {
            call_id: call_id.clone(),
            name: name.to_string(),
            outcome: ToolOutcome::Error(message.into()),
        }
    }

    /// Checks `output` against the output schema of tool `name`.
    pub fn check_output(&self, name: &str, output: &Value) -> Result<(), ToolRegistryError> {
        let spec = self.describe(name)?;
        self.validate_output(spec, output)
    }

    /// `{name, description, parameters}` per tool, sorted by name.
    pub fn catalog(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.parameters,
                })
            })
            .collect()
    }

    fn validate_output(&self, spec: &ToolSpec, output: &Value) -> Result<(), ToolRegistryError> {
        (spec.check_output)(output).map_err(|problem| ToolRegistryError::InvalidToolOutput {
            tool: spec.name.to_string(),
            problems: vec![problem],
        })
    }
}

fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::typed::<StudentProfileArgs, StudentProfileOutput>(
            GET_STUDENT_PROFILE,
            "Look up the requesting student's academic profile.",
        ),
        ToolSpec::typed::<ListProgramsArgs, ListProgramsOutput>(
            LIST_PROGRAMS,
            "List academic programs, optionally filtered by kind.",
        ),
        ToolSpec::typed::<ProgramRequirementsArgs, ProgramRequirementsOutput>(
            GET_PROGRAM_REQUIREMENTS,
            "Fetch a program and its requirement groups.",
        ),
        ToolSpec::typed::<CourseOfferingsArgs, CourseOfferingsOutput>(
            LIST_COURSE_OFFERINGS,
            "List scheduled offerings for the given course codes.",
        ),
        ToolSpec::typed::<GeneratePlanArgs, GeneratePlanOutput>(
            GENERATE_PLAN,
            "Submit the finished term-by-term graduation plan.",
        ),
    ]
}
