use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use gradplan_core::domain::catalog::{
    CourseOffering, Program, ProgramId, ProgramKind, ProgramRequirements, RequirementGroup,
    StudentProfile,
};
use gradplan_core::domain::job::UserId;

use super::{format_timestamp, parse_timestamp, parse_u32, CatalogRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCatalogRepository {
    pool: DbPool,
}

impl SqlCatalogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_program(&self, id: &ProgramId) -> Result<Option<Program>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, kind, total_credits, requires_course_selection
             FROM program
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(program_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl CatalogRepository for SqlCatalogRepository {
    async fn student_profile(
        &self,
        user_id: &UserId,
    ) -> Result<Option<StudentProfile>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                user_id,
                display_name,
                admission_year,
                expected_graduation_term,
                is_transfer,
                completed_courses_json,
                career_goals,
                updated_at
             FROM student_profile
             WHERE user_id = ?",
        )
        .bind(&user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(profile_from_row).transpose()
    }

    async fn list_programs(
        &self,
        kind: Option<ProgramKind>,
    ) -> Result<Vec<Program>, RepositoryError> {
        let rows = if let Some(kind) = kind {
            sqlx::query(
                "SELECT id, name, kind, total_credits, requires_course_selection
                 FROM program
                 WHERE kind = ?
                 ORDER BY name ASC",
            )
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, name, kind, total_credits, requires_course_selection
                 FROM program
                 ORDER BY name ASC",
            )
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(program_from_row).collect()
    }

    async fn program_requirements(
        &self,
        program_id: &ProgramId,
    ) -> Result<Option<ProgramRequirements>, RepositoryError> {
        let Some(program) = self.find_program(program_id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT id, program_id, name, credits_required, course_codes_json, min_courses
             FROM program_requirement
             WHERE program_id = ?
             ORDER BY id ASC",
        )
        .bind(&program_id.0)
        .fetch_all(&self.pool)
        .await?;
        let groups = rows.into_iter().map(group_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ProgramRequirements { program, groups }))
    }

    async fn course_offerings(
        &self,
        codes: &[String],
        term: Option<&str>,
    ) -> Result<Vec<CourseOffering>, RepositoryError> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT code, term, title, credits FROM course_offering WHERE code IN (",
        );
        let mut separated = builder.separated(", ");
        for code in codes {
            separated.push_bind(code.as_str());
        }
        separated.push_unseparated(")");
        if let Some(term) = term {
            builder.push(" AND term = ").push_bind(term);
        }
        builder.push(" ORDER BY code ASC, term ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(offering_from_row).collect()
    }

    async fn save_profile(&self, profile: StudentProfile) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO student_profile (
                user_id,
                display_name,
                admission_year,
                expected_graduation_term,
                is_transfer,
                completed_courses_json,
                career_goals,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                admission_year = excluded.admission_year,
                expected_graduation_term = excluded.expected_graduation_term,
                is_transfer = excluded.is_transfer,
                completed_courses_json = excluded.completed_courses_json,
                career_goals = excluded.career_goals,
                updated_at = excluded.updated_at",
        )
        .bind(&profile.user_id.0)
        .bind(&profile.display_name)
        .bind(profile.admission_year.map(i64::from))
        .bind(profile.expected_graduation_term.as_deref())
        .bind(i64::from(profile.is_transfer))
        .bind(serde_json::to_string(&profile.completed_courses)?)
        .bind(profile.career_goals.as_deref())
        .bind(format_timestamp(profile.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_program(
        &self,
        program: Program,
        groups: Vec<RequirementGroup>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO program (id, name, kind, total_credits, requires_course_selection)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                total_credits = excluded.total_credits,
                requires_course_selection = excluded.requires_course_selection",
        )
        .bind(&program.id.0)
        .bind(&program.name)
        .bind(program.kind.as_str())
        .bind(i64::from(program.total_credits))
        .bind(i64::from(program.requires_course_selection))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM program_requirement WHERE program_id = ?")
            .bind(&program.id.0)
            .execute(&mut *tx)
            .await?;

        for group in &groups {
            sqlx::query(
                "INSERT INTO program_requirement (
                    id,
                    program_id,
                    name,
                    credits_required,
                    course_codes_json,
                    min_courses
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&group.id)
            .bind(&program.id.0)
            .bind(&group.name)
            .bind(i64::from(group.credits_required))
            .bind(serde_json::to_string(&group.course_codes)?)
            .bind(group.min_courses.map(i64::from))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_offering(&self, offering: CourseOffering) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO course_offering (code, term, title, credits)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(code, term) DO UPDATE SET
                title = excluded.title,
                credits = excluded.credits",
        )
        .bind(&offering.code)
        .bind(&offering.term)
        .bind(&offering.title)
        .bind(i64::from(offering.credits))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn profile_from_row(row: SqliteRow) -> Result<StudentProfile, RepositoryError> {
    let admission_year = row
        .try_get::<Option<i64>, _>("admission_year")?
        .map(|year| {
            i32::try_from(year).map_err(|_| {
                RepositoryError::Decode(format!("invalid value for `admission_year`: {year}"))
            })
        })
        .transpose()?;

    Ok(StudentProfile {
        user_id: UserId(row.try_get("user_id")?),
        display_name: row.try_get("display_name")?,
        admission_year,
        expected_graduation_term: row.try_get("expected_graduation_term")?,
        is_transfer: row.try_get::<i64, _>("is_transfer")? != 0,
        completed_courses: serde_json::from_str(
            &row.try_get::<String, _>("completed_courses_json")?,
        )?,
        career_goals: row.try_get("career_goals")?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn program_from_row(row: SqliteRow) -> Result<Program, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = ProgramKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown program kind `{kind_raw}`")))?;

    Ok(Program {
        id: ProgramId(row.try_get("id")?),
        name: row.try_get("name")?,
        kind,
        total_credits: parse_u32("total_credits", row.try_get("total_credits")?)?,
        requires_course_selection: row.try_get::<i64, _>("requires_course_selection")? != 0,
    })
}

fn group_from_row(row: SqliteRow) -> Result<RequirementGroup, RepositoryError> {
    Ok(RequirementGroup {
        id: row.try_get("id")?,
        program_id: ProgramId(row.try_get("program_id")?),
        name: row.try_get("name")?,
        credits_required: parse_u32("credits_required", row.try_get("credits_required")?)?,
        course_codes: serde_json::from_str(&row.try_get::<String, _>("course_codes_json")?)?,
        min_courses: row
            .try_get::<Option<i64>, _>("min_courses")?
            .map(|value| parse_u32("min_courses", value))
            .transpose()?,
    })
}

fn offering_from_row(row: SqliteRow) -> Result<CourseOffering, RepositoryError> {
    Ok(CourseOffering {
        code: row.try_get("code")?,
        term: row.try_get("term")?,
        title: row.try_get("title")?,
        credits: parse_u32("credits", row.try_get("credits")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use gradplan_core::domain::catalog::{
        CourseOffering, Program, ProgramId, ProgramKind, RequirementGroup, StudentProfile,
    };
    use gradplan_core::domain::job::UserId;

    use super::SqlCatalogRepository;
    use crate::repositories::CatalogRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    #[tokio::test]
    async fn profile_round_trip() {
        let repo = SqlCatalogRepository::new(setup_pool().await);
        let profile = StudentProfile {
            user_id: UserId("student-1".to_owned()),
            display_name: "Ada Lovelace".to_owned(),
            admission_year: Some(2024),
            expected_graduation_term: Some("2028-SPRING".to_owned()),
            is_transfer: false,
            completed_courses: vec!["CS101".to_owned(), "MATH120".to_owned()],
            career_goals: Some("compilers".to_owned()),
            updated_at: ts("2026-03-01T09:00:00Z"),
        };

        repo.save_profile(profile.clone()).await.expect("save");

        assert_eq!(repo.student_profile(&profile.user_id).await.expect("load"), Some(profile));
        assert!(repo
            .student_profile(&UserId("nobody".to_owned()))
            .await
            .expect("missing")
            .is_none());
    }

    #[tokio::test]
    async fn programs_filter_by_kind_and_carry_requirement_groups() {
        let repo = SqlCatalogRepository::new(setup_pool().await);
        let major = program("cs-bs", "Computer Science", ProgramKind::Major);
        let minor = program("math-minor", "Mathematics", ProgramKind::Minor);
        let group = RequirementGroup {
            id: "cs-core".to_owned(),
            program_id: major.id.clone(),
            name: "Core".to_owned(),
            credits_required: 12,
            course_codes: vec!["CS101".to_owned(), "CS201".to_owned()],
            min_courses: None,
        };
        repo.save_program(major.clone(), vec![group.clone()]).await.expect("save major");
        repo.save_program(minor.clone(), Vec::new()).await.expect("save minor");

        let majors = repo.list_programs(Some(ProgramKind::Major)).await.expect("majors");
        assert_eq!(majors, vec![major.clone()]);
        assert_eq!(repo.list_programs(None).await.expect("all").len(), 2);

        let requirements =
            repo.program_requirements(&major.id).await.expect("requirements").expect("exists");
        assert_eq!(requirements.program, major);
        assert_eq!(requirements.groups, vec![group]);
        assert!(repo
            .program_requirements(&ProgramId("missing".to_owned()))
            .await
            .expect("missing")
            .is_none());
    }

    #[tokio::test]
    async fn course_offerings_filter_by_codes_and_term() {
        let repo = SqlCatalogRepository::new(setup_pool().await);
        let offerings =
            [("CS101", "2026-FALL"), ("CS101", "2027-SPRING"), ("CS201", "2026-FALL")];
        for (code, term) in offerings {
            repo.save_offering(CourseOffering {
                code: code.to_owned(),
                term: term.to_owned(),
                title: format!("{code} lecture"),
                credits: 4,
            })
            .await
            .expect("save offering");
        }

        let fall = repo
            .course_offerings(&["CS101".to_owned(), "CS201".to_owned()], Some("2026-FALL"))
            .await
            .expect("fall");
        assert_eq!(fall.len(), 2);

        let cs101 = repo.course_offerings(&["CS101".to_owned()], None).await.expect("cs101");
        assert_eq!(cs101.len(), 2);

        assert!(repo.course_offerings(&[], None).await.expect("empty").is_empty());
    }

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:?cache=shared", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    fn program(id: &str, name: &str, kind: ProgramKind) -> Program {
        Program {
            id: ProgramId(id.to_owned()),
            name: name.to_owned(),
            kind,
            total_credits: 120,
            requires_course_selection: true,
        }
    }
}
