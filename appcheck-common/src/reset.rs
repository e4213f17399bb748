//! Database reset gate.
//!
//! Before an instance may start, the shared database is reset with the
//! app's `reset.sql` and the app's initialization marker must be NULL.

use crate::error::PreconditionError;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::info;

/// Database operations needed by the reset gate.
pub trait ResetDatabase: Send + Sync {
    /// Execute a multi-statement SQL script verbatim.
    fn execute_script(
        &self,
        script: &str,
    ) -> impl Future<Output = Result<(), PreconditionError>> + Send;

    /// `initialized_at` of the app's `public.eliona_app` row, as text.
    ///
    /// A missing row is [`PreconditionError::AppRowMissing`].
    fn initialized_at(
        &self,
        app_name: &str,
    ) -> impl Future<Output = Result<Option<String>, PreconditionError>> + Send;
}

/// Runs the reset script and checks the app is uninitialized.
#[derive(Debug)]
pub struct ResetGate<D> {
    db: D,
    script_path: PathBuf,
}

impl<D: ResetDatabase> ResetGate<D> {
    pub fn new(db: D, script_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            script_path: script_path.into(),
        }
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    pub async fn reset_and_verify(&self, app_name: &str) -> Result<(), PreconditionError> {
        let script = tokio::fs::read_to_string(&self.script_path)
            .await
            .map_err(|source| PreconditionError::ResetScriptRead {
                path: self.script_path.clone(),
                source,
            })?;

        info!(script = %self.script_path.display(), "Resetting database");
        self.db.execute_script(&script).await?;

        match self.db.initialized_at(app_name).await? {
            None => {
                info!(app = app_name, "Database reset, app is uninitialized");
                Ok(())
            }
            Some(initialized_at) => Err(PreconditionError::AlreadyInitialized {
                app: app_name.to_string(),
                initialized_at,
            }),
        }
    }
}
