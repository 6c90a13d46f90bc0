use sqlx::{sqlite::SqliteRow, Row};

use gradplan_core::domain::conversation::{AgentStatus, ConversationId, ConversationState, Step};
use gradplan_core::domain::job::UserId;

use super::{format_timestamp, parse_timestamp, ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn load(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                conversation_id,
                current_step,
                completed_steps_json,
                answers_json,
                messages_json,
                agent_status,
                created_at,
                updated_at
             FROM conversation_state
             WHERE user_id = ? AND conversation_id = ?",
        )
        .bind(&user_id.0)
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(state_from_row).transpose()
    }

    async fn save(
        &self,
        user_id: &UserId,
        state: ConversationState,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation_state (
                user_id,
                conversation_id,
                current_step,
                completed_steps_json,
                answers_json,
                messages_json,
                agent_status,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, conversation_id) DO UPDATE SET
                current_step = excluded.current_step,
                completed_steps_json = excluded.completed_steps_json,
                answers_json = excluded.answers_json,
                messages_json = excluded.messages_json,
                agent_status = excluded.agent_status,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at",
        )
        .bind(&user_id.0)
        .bind(&state.conversation_id.0)
        .bind(state.current_step.as_str())
        .bind(serde_json::to_string(&state.completed_steps)?)
        .bind(serde_json::to_string(&state.answers)?)
        .bind(serde_json::to_string(&state.messages)?)
        .bind(state.agent_status.as_str())
        .bind(format_timestamp(state.created_at))
        .bind(format_timestamp(state.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn state_from_row(row: SqliteRow) -> Result<ConversationState, RepositoryError> {
    let step_raw = row.try_get::<String, _>("current_step")?;
    let current_step = Step::parse(&step_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown conversation step `{step_raw}`")))?;
    let status_raw = row.try_get::<String, _>("agent_status")?;
    let agent_status = AgentStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown agent status `{status_raw}`")))?;

    Ok(ConversationState {
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        current_step,
        completed_steps: serde_json::from_str(&row.try_get::<String, _>("completed_steps_json")?)?,
        answers: serde_json::from_str(&row.try_get::<String, _>("answers_json")?)?,
        messages: serde_json::from_str(&row.try_get::<String, _>("messages_json")?)?,
        agent_status,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
