use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use gradplan_core::domain::catalog::{
    CourseOffering, Program, ProgramId, ProgramKind, ProgramRequirements, RequirementGroup,
    StudentProfile,
};
use gradplan_core::domain::conversation::{ConversationId, ConversationState};
use gradplan_core::domain::job::{
    GenerationJob, JobEvent, JobId, JobPatch, JobStatus, NewJobEvent, UserId,
};

use super::{
    CatalogRepository, ConversationRepository, InsertOutcome, JobRepository, RepositoryError,
};

#[derive(Default)]
struct JobStore {
    jobs: HashMap<String, GenerationJob>,
    events: Vec<JobEvent>,
}

impl JobStore {
    fn active_for(&self, user_id: &UserId, conversation_id: &ConversationId) -> Option<&GenerationJob> {
        self.jobs.values().find(|job| {
            &job.user_id == user_id
                && &job.conversation_id == conversation_id
                && !job.status.is_terminal()
        })
    }
}

/// Job store used by service tests. One lock guards jobs and events so every
/// operation is atomic with respect to the others.
#[derive(Default)]
pub struct InMemoryJobRepository {
    store: RwLock<JobStore>,
}

#[async_trait::async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn find_active(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Option<GenerationJob>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.active_for(user_id, conversation_id).cloned())
    }

    async fn insert(&self, job: GenerationJob) -> Result<InsertOutcome, RepositoryError> {
        let mut store = self.store.write().await;
        if !job.status.is_terminal() {
            if let Some(existing) = store.active_for(&job.user_id, &job.conversation_id) {
                return Ok(InsertOutcome::ActiveConflict(existing.clone()));
            }
        }
        store.jobs.insert(job.id.0.clone(), job.clone());
        Ok(InsertOutcome::Inserted(job))
    }

    async fn get(&self, id: &JobId) -> Result<Option<GenerationJob>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.jobs.get(&id.0).cloned())
    }

    async fn compare_and_swap_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        expected_attempt: Option<u32>,
        next: JobStatus,
        patch: &JobPatch,
    ) -> Result<bool, RepositoryError> {
        let mut store = self.store.write().await;
        let Some(job) = store.jobs.get_mut(&id.0) else {
            return Ok(false);
        };
        if job.status != expected || expected_attempt.is_some_and(|attempt| job.attempt != attempt)
        {
            return Ok(false);
        }
        job.status = next;
        patch.apply_to(job);
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_fields(&self, id: &JobId, patch: &JobPatch) -> Result<bool, RepositoryError> {
        let mut store = self.store.write().await;
        match store.jobs.get_mut(&id.0) {
            Some(job) if !job.status.is_terminal() => {
                patch.apply_to(job);
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<GenerationJob>, RepositoryError> {
        let store = self.store.read().await;
        let mut jobs: Vec<GenerationJob> =
            store.jobs.values().filter(|job| job.status == status).cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn list_stale_running(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<GenerationJob>, RepositoryError> {
        let store = self.store.read().await;
        let mut jobs: Vec<GenerationJob> = store
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running && job.updated_at < updated_before)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.updated_at);
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn append_event(&self, event: NewJobEvent) -> Result<JobEvent, RepositoryError> {
        let mut store = self.store.write().await;
        let id = store.events.last().map_or(1, |last| last.id + 1);
        let stored = JobEvent::from_new(id, event);
        store.events.push(stored.clone());
        Ok(stored)
    }

    async fn list_events(
        &self,
        job_id: &JobId,
        after_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<JobEvent>, RepositoryError> {
        let store = self.store.read().await;
        let after_id = after_id.unwrap_or(0);
        Ok(store
            .events
            .iter()
            .filter(|event| &event.job_id == job_id && event.id > after_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    states: RwLock<HashMap<(String, String), ConversationState>>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn load(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let states = self.states.read().await;
        Ok(states.get(&(user_id.0.clone(), conversation_id.0.clone())).cloned())
    }

    async fn save(
        &self,
        user_id: &UserId,
        state: ConversationState,
    ) -> Result<(), RepositoryError> {
        let mut states = self.states.write().await;
        states.insert((user_id.0.clone(), state.conversation_id.0.clone()), state);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCatalogRepository {
    profiles: RwLock<HashMap<String, StudentProfile>>,
    programs: RwLock<HashMap<String, ProgramRequirements>>,
    offerings: RwLock<Vec<CourseOffering>>,
}

#[async_trait::async_trait]
impl CatalogRepository for InMemoryCatalogRepository {
    async fn student_profile(
        &self,
        user_id: &UserId,
    ) -> Result<Option<StudentProfile>, RepositoryError> {
        let profiles = self.profiles.read().await;
        Ok(profiles.get(&user_id.0).cloned())
    }

    async fn list_programs(
        &self,
        kind: Option<ProgramKind>,
    ) -> Result<Vec<Program>, RepositoryError> {
        let programs = self.programs.read().await;
        let mut listed: Vec<Program> = programs
            .values()
            .map(|entry| entry.program.clone())
            .filter(|program| kind.map_or(true, |kind| program.kind == kind))
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn program_requirements(
        &self,
        program_id: &ProgramId,
    ) -> Result<Option<ProgramRequirements>, RepositoryError> {
        let programs = self.programs.read().await;
        Ok(programs.get(&program_id.0).cloned())
    }

    async fn course_offerings(
        &self,
        codes: &[String],
        term: Option<&str>,
    ) -> Result<Vec<CourseOffering>, RepositoryError> {
        let offerings = self.offerings.read().await;
        let mut matched: Vec<CourseOffering> = offerings
            .iter()
            .filter(|offering| codes.contains(&offering.code))
            .filter(|offering| term.map_or(true, |term| offering.term == term))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.code.cmp(&b.code).then_with(|| a.term.cmp(&b.term)));
        Ok(matched)
    }

    async fn save_profile(&self, profile: StudentProfile) -> Result<(), RepositoryError> {
        let mut profiles = self.profiles.write().await;
        profiles.insert(profile.user_id.0.clone(), profile);
        Ok(())
    }

    async fn save_program(
        &self,
        program: Program,
        groups: Vec<RequirementGroup>,
    ) -> Result<(), RepositoryError> {
        let mut programs = self.programs.write().await;
        programs.insert(program.id.0.clone(), ProgramRequirements { program, groups });
        Ok(())
    }

    async fn save_offering(&self, offering: CourseOffering) -> Result<(), RepositoryError> {
        let mut offerings = self.offerings.write().await;
        offerings.retain(|existing| {
            !(existing.code == offering.code && existing.term == offering.term)
        });
        offerings.push(offering);
        Ok(())
    }
}
