use crate::commands::{load_config, open_pool, runtime, CommandResult, Failure};
use gradplan_db::{migrations, DbPool, DemoCatalog, SeedResult};

pub fn run() -> CommandResult {
    match load_demo_catalog() {
        Ok(seeded) => CommandResult::success(
            "seed",
            format!(
                "demo catalog loaded for `{}`: programs {} with {} course offerings",
                seeded.user_id,
                seeded.programs_seeded.join(", "),
                seeded.offerings_seeded
            ),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn load_demo_catalog() -> Result<SeedResult, Failure> {
    let config = load_config()?;
    let runtime = runtime()?;

    runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let outcome = seed_and_verify(&pool).await;
        pool.close().await;
        outcome
    })
}

async fn seed_and_verify(pool: &DbPool) -> Result<SeedResult, Failure> {
    migrations::run_pending(pool).await.map_err(|error| ("migration", error.to_string(), 5u8))?;
    let seeded = DemoCatalog::load(pool)
        .await
        .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
    let verification = DemoCatalog::verify(pool)
        .await
        .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

    if verification.all_present {
        Ok(seeded)
    } else {
        Err(("seed_verification", verification_message(&verification.checks), 6))
    }
}

fn verification_message(checks: &[(String, bool)]) -> String {
    let failed = checks
        .iter()
        .filter_map(|(check, passed)| (!passed).then_some(check.as_str()))
        .collect::<Vec<_>>();
    if failed.is_empty() {
        "demo catalog verification failed".to_string()
    } else {
        format!("demo catalog verification failed for checks: {}", failed.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_message_names_failed_checks() {
        let checks = vec![
            ("student-profile".to_string(), true),
            ("program-cs-bs".to_string(), false),
            ("course-offerings".to_string(), false),
        ];

        assert_eq!(
            verification_message(&checks),
            "demo catalog verification failed for checks: program-cs-bs, course-offerings"
        );
    }

    #[test]
    fn verification_message_is_generic_without_failed_labels() {
        let checks = vec![("student-profile".to_string(), true)];
        assert_eq!(verification_message(&checks), "demo catalog verification failed");
    }
}
