use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::dispatch::ToolDispatcher;
use crate::tools::ToolRegistry;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogCheck {
    pub tools: Vec<&'static str>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuntimeInitError {
    #[error("tools registered without a handler: {}", .0.join(", "))]
    MissingHandlers(Vec<String>),
    #[error("runtime initialization state is poisoned")]
    Poisoned,
}

/// Process-wide one-time setup shared by every service instance built from it.
/// Once recorded, the check is never repeated or reset.
#[derive(Debug, Default)]
pub struct RuntimeInit {
    catalog_check: Mutex<Option<CatalogCheck>>,
}

impl RuntimeInit {
    pub fn ensure_catalog(
        &self,
        registry: &ToolRegistry,
        dispatcher: &ToolDispatcher,
    ) -> Result<CatalogCheck, RuntimeInitError> {
        let mut slot = self.catalog_check.lock().map_err(|_| RuntimeInitError::Poisoned)?;
        if let Some(check) = slot.as_ref() {
            return Ok(check.clone());
        }

        let missing: Vec<String> = registry
            .names()
            .filter(|name| dispatcher.get(name).is_none())
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(RuntimeInitError::MissingHandlers(missing));
        }

        let check = CatalogCheck { tools: registry.names().collect(), checked_at: Utc::now() };
        info!(
            event_name = "runtime.init.tool_catalog",
            tool_count = check.tools.len(),
            "tool catalog verified"
        );
        *slot = Some(check.clone());
        Ok(check)
    }

    pub fn catalog_check(&self) -> Option<CatalogCheck> {
        self.catalog_check.lock().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gradplan_db::repositories::InMemoryCatalogRepository;

    use super::{RuntimeInit, RuntimeInitError};
    use crate::dispatch::ToolDispatcher;
    use crate::tools::ToolRegistry;

    #[test]
    fn catalog_check_runs_once() {
        let runtime = RuntimeInit::default();
        let registry = ToolRegistry::builtin();
        let dispatcher =
            ToolDispatcher::with_catalog_handlers(Arc::new(InMemoryCatalogRepository::default()));

        let first = runtime.ensure_catalog(&registry, &dispatcher).expect("first check");
        let second = runtime.ensure_catalog(&registry, &dispatcher).expect("second check");

        assert_eq!(first, second);
        assert_eq!(first.tools.len(), 5);
        assert_eq!(runtime.catalog_check(), Some(first));
    }

    #[test]
    fn missing_handler_fails_and_leaves_slot_empty() {
        let runtime = RuntimeInit::default();
        let registry = ToolRegistry::builtin();

        let error = runtime
            .ensure_catalog(&registry, &ToolDispatcher::default())
            .expect_err("no handlers registered");

        assert!(matches!(error, RuntimeInitError::MissingHandlers(ref names) if names.len() == 5));
        assert!(runtime.catalog_check().is_none());
    }
}
