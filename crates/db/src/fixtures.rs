use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

const DEMO_USER_ID: &str = "student-demo";

const DEMO_PROGRAMS: &[ProgramContract] = &[
    ProgramContract { id: "cs-bs", requirement_groups: 2, requires_course_selection: true },
    ProgramContract { id: "math-minor", requirement_groups: 2, requires_course_selection: true },
    ProgramContract { id: "data-cert", requirement_groups: 1, requires_course_selection: false },
];

const DEMO_OFFERING_COUNT: i64 = 11;

/// Small deterministic catalog: one student, three programs and a handful of offerings.
///
/// `data-cert` has no elective groups, so a conversation that picks it takes the
/// program-selection to credit-distribution bypass.
pub struct DemoCatalog;

impl DemoCatalog {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_catalog.sql");

    pub const USER_ID: &str = DEMO_USER_ID;

    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        Ok(SeedResult {
            user_id: DEMO_USER_ID,
            programs_seeded: DEMO_PROGRAMS.iter().map(|program| program.id).collect(),
            offerings_seeded: DEMO_OFFERING_COUNT,
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let profile_exists: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM student_profile WHERE user_id = ?1)")
                .bind(DEMO_USER_ID)
                .fetch_one(pool)
                .await?;
        checks.push(("student-profile".to_owned(), profile_exists == 1));

        for program in DEMO_PROGRAMS {
            let flag: Option<i64> = sqlx::query_scalar(
                "SELECT requires_course_selection FROM program WHERE id = ?1",
            )
            .bind(program.id)
            .fetch_optional(pool)
            .await?;
            checks.push((
                format!("program-{}", program.id),
                flag.map(|value| value != 0) == Some(program.requires_course_selection),
            ));

            let groups: i64 = sqlx::query_scalar(
                "SELECT COUNT(1) FROM program_requirement WHERE program_id = ?1",
            )
            .bind(program.id)
            .fetch_one(pool)
            .await?;
            checks.push((
                format!("program-{}-requirements", program.id),
                groups == program.requirement_groups,
            ));
        }

        let offerings: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM course_offering").fetch_one(pool).await?;
        checks.push(("course-offerings".to_owned(), offerings >= DEMO_OFFERING_COUNT));

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM student_profile WHERE user_id = ?1")
            .bind(DEMO_USER_ID)
            .execute(&mut *tx)
            .await?;
        for program in DEMO_PROGRAMS {
            sqlx::query("DELETE FROM program_requirement WHERE program_id = ?1")
                .bind(program.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM program WHERE id = ?1")
                .bind(program.id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM course_offering").execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ProgramContract {
    id: &'static str,
    requirement_groups: i64,
    requires_course_selection: bool,
}

#[derive(Debug)]
pub struct SeedResult {
    pub user_id: &'static str,
    pub programs_seeded: Vec<&'static str>,
    pub offerings_seeded: i64,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}
