use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use gradplan_core::domain::catalog::{
    CourseOffering, Program, ProgramId, ProgramKind, RequirementGroup, StudentProfile,
};
use gradplan_core::domain::conversation::ConversationId;
use gradplan_core::domain::job::UserId;
use gradplan_db::repositories::{CatalogRepository, RepositoryError};

use crate::tools::{
    CourseOfferingsArgs, CourseOfferingsOutput, GeneratePlanArgs, GeneratePlanOutput,
    ListProgramsArgs, ListProgramsOutput, OfferingSummary, ProgramRequirementsArgs,
    ProgramRequirementsOutput, ProgramSummary, RequirementGroupSummary, StudentProfileArgs,
    StudentProfileOutput, GENERATE_PLAN, GET_PROGRAM_REQUIREMENTS, GET_STUDENT_PROFILE,
    LIST_COURSE_OFFERINGS, LIST_PROGRAMS,
};

/// Who a tool runs on behalf of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolContext {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Error)]
pub enum ToolExecutionError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),
    #[error("catalog lookup failed")]
    Repository(#[from] RepositoryError),
    #[error("tool output could not be encoded: {0}")]
    Encode(String),
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invoke(&self, context: &ToolContext, arguments: Value)
        -> Result<Value, ToolExecutionError>;
}

#[derive(Clone, Default)]
pub struct ToolDispatcher {
    handlers: HashMap<&'static str, Arc<dyn ToolHandler>>,
}

impl ToolDispatcher {
    /// Handlers for every built-in tool, reading from `catalog`.
    pub fn with_catalog_handlers(catalog: Arc<dyn CatalogRepository>) -> Self {
        let mut dispatcher = Self::default();
        dispatcher.register(Arc::new(StudentProfileTool { catalog: catalog.clone() }));
        dispatcher.register(Arc::new(ProgramListTool { catalog: catalog.clone() }));
        dispatcher.register(Arc::new(ProgramRequirementsTool { catalog: catalog.clone() }));
        dispatcher.register(Arc::new(CourseOfferingsTool { catalog }));
        dispatcher.register(Arc::new(GeneratePlanTool));
        dispatcher
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct StudentProfileTool {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl ToolHandler for StudentProfileTool {
    fn name(&self) -> &'static str {
        GET_STUDENT_PROFILE
    }

    async fn invoke(
        &self,
        context: &ToolContext,
        arguments: Value,
    ) -> Result<Value, ToolExecutionError> {
        let StudentProfileArgs {} = parse_arguments(arguments)?;
        let profile =
            self.catalog.student_profile(&context.user_id).await?.ok_or_else(|| {
                ToolExecutionError::NotFound("no profile exists for this student".to_string())
            })?;
        encode_output(&StudentProfileOutput::from(&profile))
    }
}

struct ProgramListTool {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl ToolHandler for ProgramListTool {
    fn name(&self) -> &'static str {
        LIST_PROGRAMS
    }

    async fn invoke(
        &self,
        _context: &ToolContext,
        arguments: Value,
    ) -> Result<Value, ToolExecutionError> {
        let args: ListProgramsArgs = parse_arguments(arguments)?;
        let kind = match non_blank(args.kind.as_deref()) {
            Some(raw) => Some(ProgramKind::parse(raw).ok_or_else(|| {
                ToolExecutionError::InvalidInput(format!("unknown program kind `{raw}`"))
            })?),
            None => None,
        };

        let programs = self.catalog.list_programs(kind).await?;
        encode_output(&ListProgramsOutput {
            programs: programs.iter().map(ProgramSummary::from).collect(),
        })
    }
}

struct ProgramRequirementsTool {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl ToolHandler for ProgramRequirementsTool {
    fn name(&self) -> &'static str {
        GET_PROGRAM_REQUIREMENTS
    }

    async fn invoke(
        &self,
        _context: &ToolContext,
        arguments: Value,
    ) -> Result<Value, ToolExecutionError> {
        let args: ProgramRequirementsArgs = parse_arguments(arguments)?;
        let program_id = non_blank(Some(args.program_id.as_str()))
            .ok_or_else(|| ToolExecutionError::InvalidInput("programId is required".to_string()))?;
        let requirements = self
            .catalog
            .program_requirements(&ProgramId(program_id.to_string()))
            .await?
            .ok_or_else(|| {
                ToolExecutionError::NotFound(format!("program `{program_id}` does not exist"))
            })?;

        encode_output(&ProgramRequirementsOutput {
            program: ProgramSummary::from(&requirements.program),
            groups: requirements.groups.iter().map(RequirementGroupSummary::from).collect(),
        })
    }
}

struct CourseOfferingsTool {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl ToolHandler for CourseOfferingsTool {
    fn name(&self) -> &'static str {
        LIST_COURSE_OFFERINGS
    }

    async fn invoke(
        &self,
        _context: &ToolContext,
        arguments: Value,
    ) -> Result<Value, ToolExecutionError> {
        let args: CourseOfferingsArgs = parse_arguments(arguments)?;
        let codes: Vec<String> = args
            .course_codes
            .iter()
            .filter_map(|code| non_blank(Some(code.as_str())))
            .map(str::to_ascii_uppercase)
            .collect();
        if codes.is_empty() {
            return Err(ToolExecutionError::InvalidInput(
                "courseCodes must name at least one course".to_string(),
            ));
        }

        let offerings =
            self.catalog.course_offerings(&codes, non_blank(args.term.as_deref())).await?;
        encode_output(&CourseOfferingsOutput {
            offerings: offerings.iter().map(OfferingSummary::from).collect(),
        })
    }
}

/// Terminal tool: checks the plan's shape and totals its credits.
struct GeneratePlanTool;

#[async_trait]
impl ToolHandler for GeneratePlanTool {
    fn name(&self) -> &'static str {
        GENERATE_PLAN
    }

    async fn invoke(
        &self,
        _context: &ToolContext,
        arguments: Value,
    ) -> Result<Value, ToolExecutionError> {
        let GeneratePlanArgs { terms, notes } = parse_arguments(arguments)?;
        if terms.is_empty() {
            return Err(ToolExecutionError::InvalidInput("plan has no terms".to_string()));
        }

        let mut total_credits = 0u32;
        for (index, term) in terms.iter().enumerate() {
            if term.term.trim().is_empty() {
                return Err(ToolExecutionError::InvalidInput(format!(
                    "terms[{index}].term must be a non-empty string"
                )));
            }
            if term.courses.iter().any(|course| course.code.trim().is_empty()) {
                return Err(ToolExecutionError::InvalidInput(format!(
                    "a course in `{}` has no code",
                    term.term
                )));
            }
            total_credits = term
                .courses
                .iter()
                .try_fold(total_credits, |sum, course| sum.checked_add(course.credits))
                .ok_or_else(|| {
                    ToolExecutionError::InvalidInput("plan credit total overflows".to_string())
                })?;
        }

        let notes = notes.filter(|notes| !notes.trim().is_empty());
        encode_output(&GeneratePlanOutput { terms, total_credits, notes })
    }
}

fn parse_arguments<T: DeserializeOwned>(arguments: Value) -> Result<T, ToolExecutionError> {
    serde_json::from_value(arguments)
        .map_err(|error| ToolExecutionError::InvalidInput(error.to_string()))
}

fn encode_output<T: Serialize>(output: &T) -> Result<Value, ToolExecutionError> {
    serde_json::to_value(output).map_err(|error| ToolExecutionError::Encode(error.to_string()))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

impl From<&StudentProfile> for StudentProfileOutput {
    fn from(profile: &StudentProfile) -> Self {
        Self {
            user_id: profile.user_id.0.clone(),
            display_name: profile.display_name.clone(),
            admission_year: profile.admission_year,
            expected_graduation_term: profile.expected_graduation_term.clone(),
            is_transfer: profile.is_transfer,
            completed_courses: profile.completed_courses.clone(),
            career_goals: profile.career_goals.clone(),
        }
    }
}

impl From<&Program> for ProgramSummary {
    fn from(program: &Program) -> Self {
        Self {
            id: program.id.0.clone(),
            name: program.name.clone(),
            kind: program.kind.as_str().to_string(),
            total_credits: program.total_credits,
            requires_course_selection: program.requires_course_selection,
        }
    }
}

impl From<&RequirementGroup> for RequirementGroupSummary {
    fn from(group: &RequirementGroup) -> Self {
        Self {
            id: group.id.clone(),
            name: group.name.clone(),
            credits_required: group.credits_required,
            course_codes: group.course_codes.clone(),
            min_courses: group.min_courses,
        }
    }
}

impl From<&CourseOffering> for OfferingSummary {
    fn from(offering: &CourseOffering) -> Self {
        Self {
            code: offering.code.clone(),
            term: offering.term.clone(),
            title: offering.title.clone(),
            credits: offering.credits,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use gradplan_core::domain::catalog::{
        CourseOffering, Program, ProgramId, ProgramKind, StudentProfile,
    };
    use gradplan_core::domain::conversation::ConversationId;
    use gradplan_core::domain::job::UserId;
    use gradplan_db::repositories::{CatalogRepository, InMemoryCatalogRepository};

    use super::{ToolContext, ToolDispatcher, ToolExecutionError};
    use crate::tools::ToolRegistry;

    fn context() -> ToolContext {
        ToolContext {
            user_id: UserId("student-1".to_string()),
            conversation_id: ConversationId("conv-1".to_string()),
        }
    }

    async fn dispatcher() -> ToolDispatcher {
        let catalog = Arc::new(InMemoryCatalogRepository::default());
        catalog
            .save_profile(StudentProfile {
                user_id: UserId("student-1".to_string()),
                display_name: "Sam Rivera".to_string(),
                admission_year: Some(2024),
                expected_graduation_term: None,
                is_transfer: false,
                completed_courses: vec!["CS101".to_string()],
                career_goals: None,
                updated_at: Utc::now(),
            })
            .await
            .expect("save profile");
        catalog
            .save_program(
                Program {
                    id: ProgramId("cs-bs".to_string()),
                    name: "Computer Science BS".to_string(),
                    kind: ProgramKind::Major,
                    total_credits: 120,
                    requires_course_selection: true,
                },
                Vec::new(),
            )
            .await
            .expect("save program");
        catalog
            .save_offering(CourseOffering {
                code: "CS201".to_string(),
                term: "2026-FALL".to_string(),
                title: "Data Structures".to_string(),
                credits: 4,
            })
            .await
            .expect("save offering");
        ToolDispatcher::with_catalog_handlers(catalog)
    }

    #[tokio::test]
    async fn every_registered_tool_has_a_handler() {
        let dispatcher = dispatcher().await;
        let registry = ToolRegistry::builtin();
        let registered: Vec<&str> = registry.names().collect();
        assert_eq!(dispatcher.names(), registered);
    }

    #[tokio::test]
    async fn profile_output_satisfies_registry_schema() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.get("get_student_profile").expect("handler");
        let output = handler.invoke(&context(), json!({})).await.expect("profile");

        assert_eq!(output["displayName"], "Sam Rivera");
        ToolRegistry::builtin().check_output("get_student_profile", &output).expect("schema");
    }

    #[tokio::test]
    async fn missing_profile_is_not_found() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.get("get_student_profile").expect("handler");
        let stranger = ToolContext { user_id: UserId("student-9".to_string()), ..context() };

        let error = handler.invoke(&stranger, json!({})).await.expect_err("no profile");
        assert!(matches!(error, ToolExecutionError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_programs_rejects_unknown_kind() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.get("list_programs").expect("handler");

        let majors = handler.invoke(&context(), json!({"kind": "major"})).await.expect("majors");
        assert_eq!(majors["programs"][0]["id"], "cs-bs");

        let error =
            handler.invoke(&context(), json!({"kind": "bootcamp"})).await.expect_err("bad kind");
        assert!(matches!(error, ToolExecutionError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unknown_program_requirements_are_not_found() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.get("get_program_requirements").expect("handler");
        let error = handler
            .invoke(&context(), json!({"programId": "history-ba"}))
            .await
            .expect_err("unknown program");
        assert_eq!(error.to_string(), "program `history-ba` does not exist");
    }

    #[tokio::test]
    async fn course_offerings_normalize_codes() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.get("list_course_offerings").expect("handler");
        let output = handler
            .invoke(&context(), json!({"courseCodes": [" cs201 "], "term": "2026-FALL"}))
            .await
            .expect("offerings");
        assert_eq!(output["offerings"][0]["credits"], 4);
    }

    #[tokio::test]
    async fn generate_plan_totals_credits() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.get("generate_plan").expect("handler");
        let output = handler
            .invoke(
                &context(),
                json!({
                    "terms": [
                        {"term": "2026-FALL", "courses": [{"code": "CS201", "credits": 4}]},
                        {"term": "2027-SPRING", "courses": [
                            {"code": "CS301", "credits": 3},
                            {"code": "MATH220", "credits": 3}
                        ]}
                    ],
                    "notes": "Take CS301 before the internship."
                }),
            )
            .await
            .expect("plan");

        assert_eq!(output["totalCredits"], 10);
        assert_eq!(output["notes"], "Take CS301 before the internship.");
        ToolRegistry::builtin().check_output("generate_plan", &output).expect("schema");
    }

    #[tokio::test]
    async fn generate_plan_rejects_empty_or_malformed_terms() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.get("generate_plan").expect("handler");

        let empty = handler.invoke(&context(), json!({"terms": []})).await;
        assert!(matches!(empty, Err(ToolExecutionError::InvalidInput(_))));

        let no_credits = handler
            .invoke(
                &context(),
                json!({"terms": [{"term": "2026-FALL", "courses": [{"code": "CS201"}]}]}),
            )
            .await
            .expect_err("missing credits");
        assert!(matches!(no_credits, ToolExecutionError::InvalidInput(_)));
        assert!(no_credits.to_string().contains("missing field `credits`"));

        let blank_term = handler
            .invoke(&context(), json!({"terms": [{"term": " ", "courses": []}]}))
            .await
            .expect_err("blank term");
        assert_eq!(blank_term.to_string(), "terms[0].term must be a non-empty string");
    }

    #[tokio::test]
    async fn handlers_reject_fields_outside_their_argument_type() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.get("get_student_profile").expect("handler");
        let error = handler
            .invoke(&context(), json!({"userId": "student-2"}))
            .await
            .expect_err("profile lookups are scoped to the job's student");
        assert!(error.to_string().contains("unknown field `userId`"));
    }
}
