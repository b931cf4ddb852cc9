//! Continue-token persistence.
//!
//! The sweep checkpoints its pagination cursor into the migration's
//! `spec.continueToken` so a restarted migrator resumes where the previous
//! one stopped instead of re-listing from the beginning.

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::clients::MigrationClient;
use crate::error::ApiError;
use crate::retry::RetryConfig;

/// Load and save the pagination cursor of one migration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Progress: Send + Sync {
    /// The last saved cursor, if any
    async fn load(&self) -> Result<Option<String>, ApiError>;

    /// Persist a new cursor
    async fn save(&self, continue_token: &str) -> Result<(), ApiError>;
}

/// Progress stored in the migration's own spec
pub struct MigrationProgress {
    migrations: Arc<dyn MigrationClient>,
    name: String,
}

impl MigrationProgress {
    /// Track progress of the named migration
    pub fn new(migrations: Arc<dyn MigrationClient>, name: impl Into<String>) -> Self {
        Self {
            migrations,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Progress for MigrationProgress {
    async fn load(&self) -> Result<Option<String>, ApiError> {
        let migration = self.migrations.get(&self.name).await?;
        Ok(migration.spec.continue_token)
    }

    async fn save(&self, continue_token: &str) -> Result<(), ApiError> {
        let config = RetryConfig::on_conflict();
        let mut attempt = 0u32;
        loop {
            let mut migration = self.migrations.get(&self.name).await?;
            migration.spec.continue_token = Some(continue_token.to_string());
            match self.migrations.update(&migration).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    attempt += 1;
                    if attempt >= config.steps {
                        return Err(e);
                    }
                    tokio::time::sleep(config.delay_for(attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
