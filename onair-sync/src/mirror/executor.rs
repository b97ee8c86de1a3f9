//! Command execution against the legacy store

use super::command::{CommandOutcome, MirrorStatement};
use crate::error::{Error, Result};
use crate::tunnel::{TunnelConnector, TunnelledConnectionManager};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlPool};
use sqlx::query::Query;
use sqlx::MySql;
use tracing::debug;

/// Applies one mirror statement
///
/// Every error returned here is treated as transient by the queue and counted
/// against the command's attempt budget.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    async fn execute(&self, statement: &MirrorStatement) -> Result<CommandOutcome>;

    /// Release held resources; called once at process shutdown
    async fn shutdown(&self) {}
}

/// Executes statements on the legacy MySQL store through a managed tunnel
pub struct MySqlExecutor<C>
where
    C: TunnelConnector<Connection = MySqlPool>,
{
    manager: TunnelledConnectionManager<C>,
}

impl<C> MySqlExecutor<C>
where
    C: TunnelConnector<Connection = MySqlPool>,
{
    pub fn new(manager: TunnelledConnectionManager<C>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &TunnelledConnectionManager<C> {
        &self.manager
    }
}

#[async_trait]
impl<C> CommandExecutor for MySqlExecutor<C>
where
    C: TunnelConnector<Connection = MySqlPool>,
{
    async fn execute(&self, statement: &MirrorStatement) -> Result<CommandOutcome> {
        let statement = statement.clone();
        self.manager
            .with_connection(|pool| async move {
                let mut query = sqlx::query(&statement.sql);
                for param in &statement.params {
                    query = bind_json(query, param);
                }

                let result = query
                    .execute(&pool)
                    .await
                    .map_err(|e| Error::TransientExecution(e.to_string()))?;

                debug!("Mirror statement affected {} rows", result.rows_affected());
                Ok(CommandOutcome {
                    rows_affected: result.rows_affected(),
                })
            })
            .await
    }

    async fn shutdown(&self) {
        self.manager.dispose().await;
    }
}

/// Bind a JSON value as the next positional parameter
///
/// Arrays and objects are bound as their JSON text.
fn bind_json<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}
