//! # Staging Schemas and Data Migration
//!
//! Every source environment is imported into its own staging schema in the
//! target database, named after the environment. [`MigrationEngine`] then
//! merges the staged rows into the shared `public` tables:
//!
//! 1. rows previously migrated at or above the environment's offset are
//!    deleted, dependents before parents
//! 2. staged rows are inserted with every primary and foreign key shifted by
//!    the offset, service types translated through `service_type_map`, and
//!    natural keys suffixed with the environment name
//!
//! Each environment runs in its own transaction, so a repeated migration
//! with unchanged staged data leaves the shared tables exactly as they were.

use super::naming::quote_ident;
use super::partition::IdSpacePartition;
use crate::config::{ServiceTypeMapping, SyndicationSettings};
use crate::constants::migration::SYNDICATED_USER_PASSWORD;
use crate::error::Result;
use crate::logging::log_database_operation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of merging one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub source_environment: String,
    pub offset: i64,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
}

impl MigrationReport {
    /// Audit line describing the change to shared data
    pub fn audit_body(&self, target_environment: &str) -> String {
        format!(
            "syndication migrate {} into {target_environment}: offset {}, {} rows deleted, {} rows inserted",
            self.source_environment, self.offset, self.rows_deleted, self.rows_inserted
        )
    }
}

/// Database work behind the migration steps
#[async_trait]
pub trait StagingMigrator: Send + Sync {
    /// Drop and recreate the staging schema of `source_env`, seeding its
    /// service type translation table
    async fn recreate_schema(&self, source_env: &str, mappings: &[ServiceTypeMapping]) -> Result<()>;

    /// Replace the shared rows of `source_env` with its staged rows shifted
    /// by `offset`
    async fn migrate_environment(&self, source_env: &str, offset: i64) -> Result<MigrationReport>;
}

/// Drives a [`StagingMigrator`] over the configured source environments
pub struct MigrationEngine {
    migrator: Arc<dyn StagingMigrator>,
    partition: IdSpacePartition,
    settings: SyndicationSettings,
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("partition", &self.partition)
            .field("target_environment", &self.settings.target_environment)
            .finish_non_exhaustive()
    }
}

impl MigrationEngine {
    pub fn new(
        migrator: Arc<dyn StagingMigrator>,
        partition: IdSpacePartition,
        settings: SyndicationSettings,
    ) -> Self {
        Self {
            migrator,
            partition,
            settings,
        }
    }

    pub fn partition(&self) -> IdSpacePartition {
        self.partition
    }

    /// Recreate one staging schema per source environment, in list order.
    /// Returns the environments whose schema was created.
    pub async fn create_all_schemas(&self, source_environments: &[String]) -> Result<Vec<String>> {
        let mut created = Vec::with_capacity(source_environments.len());
        for env in source_environments {
            let mappings: Vec<ServiceTypeMapping> =
                self.settings.mappings_for(env).into_iter().cloned().collect();
            info!(source_environment = %env, mappings = mappings.len(), "Creating staging schema");
            self.migrator.recreate_schema(env, &mappings).await?;
            created.push(env.clone());
        }
        Ok(created)
    }

    /// Merge every staged environment into the shared tables. The
    /// environment at index `i` receives `partition.offset(i)`.
    pub async fn migrate_all_data(&self, source_environments: &[String]) -> Result<Vec<MigrationReport>> {
        let mut reports = Vec::with_capacity(source_environments.len());
        for (env, offset) in self.partition.assign(source_environments) {
            info!(source_environment = %env, offset, "Migrating staged data");
            let report = self.migrator.migrate_environment(env, offset).await?;
            reports.push(report);
        }
        Ok(reports)
    }
}

/// Statements creating the staging schema of one environment
pub fn staging_schema_statements(source_env: &str, owner: Option<&str>) -> Vec<String> {
    let schema = quote_ident(source_env);
    let authorization = owner
        .map(|role| format!(" AUTHORIZATION {}", quote_ident(role)))
        .unwrap_or_default();

    vec![
        format!("DROP SCHEMA IF EXISTS {schema} CASCADE"),
        format!("CREATE SCHEMA {schema}{authorization}"),
        format!(
            r#"CREATE TABLE {schema}.countries (
    id bigserial NOT NULL,
    enabled bool NULL,
    "name" varchar NULL,
    iso_two_letter_code varchar NULL,
    geojson jsonb NULL,
    lat numeric(12,8) NOT NULL DEFAULT '0'::numeric,
    lng numeric(12,8) NOT NULL DEFAULT '0'::numeric,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    CONSTRAINT countries_pkey PRIMARY KEY (id)
)"#
        ),
        format!(
            r#"CREATE TABLE {schema}.settlements (
    id bigserial NOT NULL,
    "name" varchar NULL,
    geojson jsonb NULL DEFAULT '{{}}'::jsonb,
    lat numeric(12,8) NULL,
    lng numeric(12,8) NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    country_id int8 NULL REFERENCES {schema}.countries(id),
    CONSTRAINT settlements_pkey PRIMARY KEY (id)
)"#
        ),
        format!(
            r#"CREATE TABLE {schema}.service_types (
    id bigserial NOT NULL,
    "name" varchar NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    CONSTRAINT service_types_pkey PRIMARY KEY (id)
)"#
        ),
        format!(
            r#"CREATE TABLE {schema}.service_points (
    id bigserial NOT NULL,
    service_type_id int8 NULL REFERENCES {schema}.service_types(id),
    settlement_id int8 NULL REFERENCES {schema}.settlements(id),
    "name" varchar NULL,
    lat numeric(12,8) NULL,
    lng numeric(12,8) NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    CONSTRAINT service_points_pkey PRIMARY KEY (id)
)"#
        ),
        format!(
            r#"CREATE TABLE {schema}.users (
    id bigserial NOT NULL,
    email varchar NOT NULL DEFAULT '',
    encrypted_password varchar NOT NULL DEFAULT '',
    reset_password_token varchar NULL,
    reset_password_sent_at timestamptz NULL,
    remember_created_at timestamptz NULL,
    sign_in_count int4 NOT NULL DEFAULT 0,
    current_sign_in_at timestamptz NULL,
    last_sign_in_at timestamptz NULL,
    current_sign_in_ip inet NULL,
    last_sign_in_ip inet NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    is_admin bool NOT NULL DEFAULT false,
    provider varchar NOT NULL DEFAULT 'email',
    uid varchar NOT NULL DEFAULT '',
    tokens json NULL,
    settlement_id int8 NULL REFERENCES {schema}.settlements(id),
    is_survey bool NOT NULL DEFAULT false,
    is_service_provider bool NULL DEFAULT false,
    CONSTRAINT users_pkey PRIMARY KEY (id)
)"#
        ),
        format!(
            r#"CREATE TABLE {schema}.responses (
    id bigserial NOT NULL,
    service_point_id int8 NULL REFERENCES {schema}.service_points(id),
    satisfied bool NULL,
    idea varchar NULL,
    lat numeric(12,8) NULL,
    lng numeric(12,8) NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    phase2_id int8 NULL,
    uploaded_at timestamptz NULL,
    unique_id varchar NULL,
    user_id int8 NULL REFERENCES {schema}.users(id),
    response_type varchar NOT NULL DEFAULT '',
    is_starred bool NULL DEFAULT false,
    nlp_extract_adjectives_processed bool NULL DEFAULT false,
    idea_language varchar(128) NULL DEFAULT 'es',
    idea_token_vector tsvector NULL,
    CONSTRAINT responses_pkey PRIMARY KEY (id),
    CONSTRAINT responses_unique_id_unique UNIQUE (unique_id)
)"#
        ),
        format!(
            r#"CREATE TABLE {schema}.service_type_map (
    source_env varchar NULL,
    source_service_type_id int8 NULL,
    source_service_type_name varchar NULL,
    target_env varchar NULL,
    target_service_type_id int8 NULL,
    target_service_type_name varchar NULL
)"#
        ),
    ]
}

/// Postgres implementation against the target database
#[derive(Debug, Clone)]
pub struct PgStagingMigrator {
    pool: PgPool,
    target_environment: String,
    schema_owner: Option<String>,
}

impl PgStagingMigrator {
    pub fn new(pool: PgPool, settings: &SyndicationSettings) -> Self {
        Self {
            pool,
            target_environment: settings.target_environment.clone(),
            schema_owner: settings.staging_schema_owner.clone(),
        }
    }
}

#[async_trait]
impl StagingMigrator for PgStagingMigrator {
    async fn recreate_schema(&self, source_env: &str, mappings: &[ServiceTypeMapping]) -> Result<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        for statement in staging_schema_statements(source_env, self.schema_owner.as_deref()) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        let insert_mapping = format!(
            "INSERT INTO {}.service_type_map \
             (source_env, source_service_type_id, source_service_type_name, target_env, target_service_type_id, target_service_type_name) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            quote_ident(source_env)
        );
        for mapping in mappings {
            sqlx::query(&insert_mapping)
                .bind(&mapping.source_env)
                .bind(mapping.source_service_type_id)
                .bind(&mapping.source_service_type_name)
                .bind(&self.target_environment)
                .bind(mapping.target_service_type_id)
                .bind(&mapping.target_service_type_name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        log_database_operation(
            "recreate_staging_schema",
            Some(source_env),
            Some(mappings.len() as u64),
            "success",
            Some(started.elapsed().as_millis() as u64),
            None,
        );
        Ok(())
    }

    async fn migrate_environment(&self, source_env: &str, offset: i64) -> Result<MigrationReport> {
        let started = Instant::now();
        let schema = quote_ident(source_env);
        let name_prefix = format!("{} ", source_env.to_uppercase());
        let login_suffix = format!(".{source_env}");
        let unique_id_suffix = source_env.to_uppercase();

        let mut tx = self.pool.begin().await?;
        let mut rows_deleted = 0;

        // Tags of previously migrated responses and their provenance go first
        rows_deleted += sqlx::query(
            "DELETE FROM public.tag_provenance WHERE tag_id IN \
             (SELECT id FROM public.tags WHERE response_id >= $1)",
        )
        .bind(offset)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        rows_deleted += sqlx::query("DELETE FROM public.tags WHERE response_id >= $1")
            .bind(offset)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for table in ["responses", "users", "service_points", "settlements"] {
            let deleted = sqlx::query(&format!("DELETE FROM public.{table} WHERE id >= $1"))
                .bind(offset)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            debug!(table, deleted, offset, "Deleted previously migrated rows");
            rows_deleted += deleted;
        }

        let mut rows_inserted = 0;

        rows_inserted += sqlx::query(&format!(
            r#"INSERT INTO public.settlements (id, "name", geojson, lat, lng, created_at, updated_at, country_id)
SELECT id + $1, concat($2::text, "name"), geojson, lat, lng, created_at, updated_at, country_id
FROM {schema}.settlements"#
        ))
        .bind(offset)
        .bind(&name_prefix)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        rows_inserted += sqlx::query(&format!(
            r#"INSERT INTO public.users (id, email, encrypted_password, reset_password_token, reset_password_sent_at, remember_created_at, sign_in_count, current_sign_in_at, last_sign_in_at, current_sign_in_ip, last_sign_in_ip, created_at, updated_at, is_admin, provider, uid, tokens, settlement_id, is_survey, is_service_provider)
SELECT u.id + $1, concat(u.email, $2::text), $3, u.reset_password_token, u.reset_password_sent_at, u.remember_created_at, u.sign_in_count, u.current_sign_in_at, u.last_sign_in_at, u.current_sign_in_ip, u.last_sign_in_ip, u.created_at, u.updated_at, u.is_admin, u.provider, concat(u.uid, $2::text), u.tokens, u.settlement_id + $1, u.is_survey, u.is_service_provider
FROM {schema}.users u"#
        ))
        .bind(offset)
        .bind(&login_suffix)
        .bind(SYNDICATED_USER_PASSWORD)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        rows_inserted += sqlx::query(&format!(
            r#"INSERT INTO public.service_points (id, service_type_id, settlement_id, "name", lat, lng, created_at, updated_at)
SELECT sp.id + $1, st_map.target_service_type_id, sp.settlement_id + $1, concat($2::text, sp."name"), sp.lat, sp.lng, sp.created_at, sp.updated_at
FROM {schema}.service_points sp
INNER JOIN {schema}.service_type_map st_map
ON st_map.source_env = $3 AND sp.service_type_id = st_map.source_service_type_id AND st_map.target_env = $4"#
        ))
        .bind(offset)
        .bind(&name_prefix)
        .bind(source_env)
        .bind(&self.target_environment)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        rows_inserted += sqlx::query(&format!(
            r#"INSERT INTO public.responses (id, service_point_id, satisfied, idea, lat, lng, created_at, updated_at, phase2_id, uploaded_at, unique_id, user_id, response_type, is_starred, nlp_extract_adjectives_processed, idea_language, idea_token_vector)
SELECT id + $1, service_point_id + $1, satisfied, idea, lat, lng, created_at, updated_at, phase2_id, uploaded_at, concat(unique_id, $2::text), user_id + $1, response_type, is_starred, nlp_extract_adjectives_processed, idea_language, idea_token_vector
FROM {schema}.responses"#
        ))
        .bind(offset)
        .bind(&unique_id_suffix)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let report = MigrationReport {
            source_environment: source_env.to_string(),
            offset,
            rows_deleted,
            rows_inserted,
        };
        log_database_operation(
            "migrate_environment",
            Some(source_env),
            Some(rows_inserted),
            "success",
            Some(started.elapsed().as_millis() as u64),
            Some(&format!("offset {offset}, {rows_deleted} rows deleted")),
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_quote_environment() {
        let statements = staging_schema_statements("world-vision", None);
        assert_eq!(statements[0], "DROP SCHEMA IF EXISTS \"world-vision\" CASCADE");
        assert_eq!(statements[1], "CREATE SCHEMA \"world-vision\"");
        assert!(statements
            .iter()
            .skip(2)
            .all(|statement| statement.starts_with("CREATE TABLE \"world-vision\".")));
        assert!(statements.last().unwrap().contains("service_type_map"));
    }

    #[test]
    fn test_schema_owner_is_optional() {
        let statements = staging_schema_statements("crc", Some("cloudsqlsuperuser"));
        assert_eq!(statements[1], "CREATE SCHEMA \"crc\" AUTHORIZATION \"cloudsqlsuperuser\"");
    }

    #[test]
    fn test_settlement_geojson_default_is_literal_braces() {
        let statements = staging_schema_statements("crc", None);
        assert!(statements[3].contains("DEFAULT '{}'::jsonb"));
    }

    #[test]
    fn test_audit_body_names_both_environments() {
        let report = MigrationReport {
            source_environment: "crc".to_string(),
            offset: 1_000_000_000,
            rows_deleted: 3,
            rows_inserted: 7,
        };
        let body = report.audit_body("ofda");
        assert!(body.contains("crc into ofda"));
        assert!(body.contains("offset 1000000000"));
    }
}
