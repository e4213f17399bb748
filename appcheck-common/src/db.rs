//! Postgres access shared by the reset gate and the database checks.

use crate::error::PreconditionError;
use crate::reset::ResetDatabase;
use std::fmt;
use tokio::sync::OnceCell;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

/// Lazily connected Postgres client.
///
/// The connection is opened on first use and its driver task runs on the
/// tokio runtime until the client is dropped.
pub struct PgDatabase {
    connection_string: String,
    client: OnceCell<Client>,
}

impl PgDatabase {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            client: OnceCell::new(),
        }
    }

    pub async fn client(&self) -> Result<&Client, tokio_postgres::Error> {
        self.client
            .get_or_try_init(|| async {
                let (client, connection) =
                    tokio_postgres::connect(&self.connection_string, NoTls).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        warn!(error = %err, "Database connection closed with error");
                    }
                });
                debug!("Connected to database");
                Ok(client)
            })
            .await
    }
}

impl fmt::Debug for PgDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgDatabase")
            .field("connected", &self.client.initialized())
            .finish_non_exhaustive()
    }
}

/// Query returning the initialization marker as text, whatever its column type.
pub const INITIALIZED_AT_QUERY: &str =
    "SELECT initialized_at::text FROM public.eliona_app WHERE app_name = $1";

impl ResetDatabase for PgDatabase {
    async fn execute_script(&self, script: &str) -> Result<(), PreconditionError> {
        let client = self
            .client()
            .await
            .map_err(|err| PreconditionError::DatabaseConnect(err.to_string()))?;
        client
            .batch_execute(script)
            .await
            .map_err(|err| PreconditionError::ResetScript(err.to_string()))
    }

    async fn initialized_at(&self, app_name: &str) -> Result<Option<String>, PreconditionError> {
        let client = self
            .client()
            .await
            .map_err(|err| PreconditionError::DatabaseConnect(err.to_string()))?;
        let row = client
            .query_opt(INITIALIZED_AT_QUERY, &[&app_name])
            .await
            .map_err(|err| PreconditionError::InitQuery(err.to_string()))?
            .ok_or_else(|| PreconditionError::AppRowMissing(app_name.to_string()))?;
        row.try_get::<_, Option<String>>(0)
            .map_err(|err| PreconditionError::InitQuery(err.to_string()))
    }
}
