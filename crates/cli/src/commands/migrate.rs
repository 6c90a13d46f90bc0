use crate::commands::{load_config, open_pool, runtime, CommandResult, Failure};
use gradplan_core::config::AppConfig;
use gradplan_db::migrations;

pub fn run() -> CommandResult {
    match apply() {
        Ok(versions) => CommandResult::success("migrate", describe(&versions)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}

fn apply() -> Result<Vec<i64>, Failure> {
    let config = load_config()?;
    let runtime = runtime()?;

    runtime.block_on(migrate(&config))?;

    Ok(migrations::known_versions())
}

async fn migrate(config: &AppConfig) -> Result<(), Failure> {
    let pool = open_pool(config).await?;
    let applied =
        migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5));
    pool.close().await;
    applied
}

fn describe(versions: &[i64]) -> String {
    match versions.last() {
        Some(latest) => {
            format!("schema is at version {latest} ({} migrations known)", versions.len())
        }
        None => "no migrations are bundled".to_string(),
    }
}
