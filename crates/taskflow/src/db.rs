use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;

/// Connection pool settings. `Config::from_env` fills these from
/// `TASKFLOW_DB_*`.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Short claim queries gain nothing from JIT.
    pub disable_jit: bool,
    /// Server-side cap per statement; `None` keeps the server default.
    pub statement_timeout: Option<Duration>,
    pub application_name: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            disable_jit: true,
            statement_timeout: None,
            application_name: "taskflow".to_string(),
        }
    }
}

impl PoolSettings {
    /// Statements run on every new connection.
    pub fn session_statements(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.disable_jit {
            out.push("SET jit = OFF".to_string());
        }
        if let Some(t) = self.statement_timeout {
            out.push(format!("SET statement_timeout = {}", t.as_millis()));
        }
        if !self.application_name.is_empty() {
            let name = self.application_name.replace('\'', "''");
            out.push(format!("SET application_name = '{name}'"));
        }
        out
    }
}

pub async fn make_pool(database_url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let statements = settings.session_statements();

    let opts = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(move |conn, _meta| {
            let statements = statements.clone();
            Box::pin(async move {
                for sql in &statements {
                    sqlx::query(sql).execute(&mut *conn).await?;
                }
                Ok(())
            })
        });

    let pool = opts.connect(database_url).await?;
    info!(
        max_connections = settings.max_connections,
        acquire_timeout_secs = settings.acquire_timeout.as_secs(),
        disable_jit = settings.disable_jit,
        statement_timeout_ms = settings.statement_timeout.map(|t| t.as_millis() as u64),
        "database pool ready"
    );

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_disables_jit_and_names_the_app() {
        assert_eq!(
            PoolSettings::default().session_statements(),
            vec!["SET jit = OFF", "SET application_name = 'taskflow'"]
        );
    }

    #[test]
    fn statement_timeout_is_sent_in_millis_and_names_are_quoted() {
        let s = PoolSettings {
            disable_jit: false,
            statement_timeout: Some(Duration::from_secs(5)),
            application_name: "o'brien".to_string(),
            ..PoolSettings::default()
        };
        assert_eq!(
            s.session_statements(),
            vec![
                "SET statement_timeout = 5000",
                "SET application_name = 'o''brien'"
            ]
        );
    }
}
