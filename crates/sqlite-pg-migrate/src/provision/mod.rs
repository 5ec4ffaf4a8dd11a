//! Target database provisioning.
//!
//! Ensures the target database exists, using a connection to a maintenance
//! database. Provisioning never aborts a run: an unreachable server or a
//! refused `CREATE DATABASE` is reported as skipped and later stages assume
//! the database is already there.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::identifier::quote_pg;
use crate::error::{MigrateError, Result};
use crate::target::tls::split_ssl_mode;
use crate::target::PgTarget;

/// Outcome of a provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisionOutcome {
    /// The database was created by this run.
    Created,
    /// The database already existed.
    AlreadyExists,
    /// Provisioning could not be performed.
    Skipped { reason: String },
}

/// Creates the target database when it does not exist yet.
pub struct DatabaseProvisioner {
    admin_dsn: String,
}

impl DatabaseProvisioner {
    /// Create a provisioner for an administrative DSN.
    pub fn new(admin_dsn: impl Into<String>) -> Self {
        Self {
            admin_dsn: admin_dsn.into(),
        }
    }

    /// Ensure `database` exists, optionally owned by `owner`.
    ///
    /// Invalid names are rejected before connecting; every other failure
    /// becomes [`ProvisionOutcome::Skipped`].
    pub async fn ensure(&self, database: &str, owner: Option<&str>) -> Result<ProvisionOutcome> {
        let db_ident = quote_pg(database)?;
        let owner_ident = owner.map(quote_pg).transpose()?;

        match self.try_ensure(database, &db_ident, owner_ident.as_deref()).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Provisioning skipped for {}: {}", database, e);
                Ok(ProvisionOutcome::Skipped {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn try_ensure(
        &self,
        database: &str,
        db_ident: &str,
        owner_ident: Option<&str>,
    ) -> Result<ProvisionOutcome> {
        let admin = PgTarget::connect(&self.admin_dsn, 1)
            .await
            .map_err(|e| MigrateError::Provisioning(format!("admin connection: {}", e)))?;
        let client = admin.client().await?;

        let exists = client
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&database])
            .await?
            .is_some();
        if exists {
            info!("Database {} already exists", database);
            return Ok(ProvisionOutcome::AlreadyExists);
        }

        let mut sql = format!("CREATE DATABASE {}", db_ident);
        if let Some(owner) = owner_ident {
            sql.push_str(&format!(" OWNER {}", owner));
        }
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| MigrateError::Provisioning(format!("{}: {}", sql, e)))?;

        info!("Created database {}", database);
        Ok(ProvisionOutcome::Created)
    }
}

/// Owner for a new database: the explicit value, else the user named in the
/// application DSN.
pub fn resolve_owner(explicit: Option<&str>, app_dsn: Option<&str>) -> Option<String> {
    if let Some(owner) = explicit {
        return Some(owner.to_string());
    }
    let (stripped, _) = split_ssl_mode(app_dsn?).ok()?;
    let config: tokio_postgres::Config = stripped.parse().ok()?;
    config.get_user().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_is_skipped() {
        let provisioner = DatabaseProvisioner::new(
            "host=127.0.0.1 port=1 user=postgres dbname=postgres connect_timeout=1",
        );
        let outcome = provisioner.ensure("slippers", Some("app")).await.unwrap();
        assert!(matches!(outcome, ProvisionOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let provisioner = DatabaseProvisioner::new("host=127.0.0.1 port=1");
        assert!(provisioner.ensure("", None).await.is_err());
    }

    #[test]
    fn test_owner_falls_back_to_app_user() {
        let dsn = "host=db dbname=slippers user=app sslmode=require";
        assert_eq!(resolve_owner(Some("admin"), Some(dsn)).as_deref(), Some("admin"));
        assert_eq!(resolve_owner(None, Some(dsn)).as_deref(), Some("app"));
        assert_eq!(
            resolve_owner(None, Some("postgres://svc:pw@db/slippers")).as_deref(),
            Some("svc")
        );
        assert_eq!(resolve_owner(None, Some("host=db")), None);
        assert_eq!(resolve_owner(None, None), None);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&ProvisionOutcome::Skipped {
            reason: "refused".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"skipped","reason":"refused"}"#);
        assert_eq!(
            serde_json::to_string(&ProvisionOutcome::AlreadyExists).unwrap(),
            r#"{"status":"already_exists"}"#
        );
    }
}
