//! Forward-only schema migrations.
//!
//! A [`Migration`] is a version, a name and the SQL statements it runs. Applying one records the
//! SHA-256 of its statements in `_qlistener_migrations`; if a recorded migration's statements no
//! longer hash the same, [`Migrator::run`] refuses to start. Schema fixes go in a new migration.

mod m001_create_lifecycle_tables;
mod m002_create_campaigns_table;

use log::{debug, info};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashMap;

/// Every migration, by ascending version. New migrations go at the end.
pub const MIGRATIONS: &[Migration] = &[
    m001_create_lifecycle_tables::CREATE_LIFECYCLE_TABLES,
    m002_create_campaigns_table::CREATE_CAMPAIGNS_TABLE,
];

const CREATE_TRACKING_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _qlistener_migrations (
        version BIGINT PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        checksum VARCHAR(64) NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const SELECT_RECORDED: &str = r#"
    SELECT version, checksum FROM _qlistener_migrations
"#;

const RECORD_MIGRATION: &str = r#"
    INSERT INTO _qlistener_migrations (version, name, checksum)
    VALUES ($1, $2, $3)
"#;

/// Errors raised while migrating the schema.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The tracking table couldn't be read or written
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// An applied migration's statements changed since
    #[error("migration {version} ({name}) was edited after it was applied")]
    Edited {
        /// Version of the edited migration
        version: i64,
        /// Its name
        name: &'static str,
    },
    /// The database was migrated by a newer build
    #[error("schema version {0} is unknown to this build")]
    UnknownVersion(i64),
    /// A statement of a migration failed; nothing of that migration is kept
    #[error("migration {version} ({name}) failed at statement {statement}: {source}")]
    Failed {
        /// Version of the failed migration
        version: i64,
        /// Its name
        name: &'static str,
        /// 1-based index of the failing statement
        statement: usize,
        /// The database error
        #[source]
        source: sqlx::Error,
    },
}

/// One schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Position in the migration sequence, starting at 1
    pub version: i64,
    /// Short snake_case description
    pub name: &'static str,
    /// Statements run in order inside one transaction
    pub statements: &'static [&'static str],
}

impl Migration {
    /// Hex SHA-256 of the trimmed statements.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for statement in self.statements {
            hasher.update(statement.trim().as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    async fn apply(&self, pool: &PgPool) -> Result<(), MigrationError> {
        let mut tx = pool.begin().await?;
        for (i, statement) in self.statements.iter().enumerate() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrationError::Failed {
                    version: self.version,
                    name: self.name,
                    statement: i + 1,
                    source,
                })?;
        }
        sqlx::query(RECORD_MIGRATION)
            .bind(self.version)
            .bind(self.name)
            .bind(self.checksum())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Brings the schema up to the latest [`Migration`].
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
    migrations: &'static [Migration],
}

impl Migrator {
    /// A migrator applying [`MIGRATIONS`].
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            migrations: MIGRATIONS,
        }
    }

    /// Verifies the applied migrations and applies the missing ones. Returns how many ran.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        sqlx::query(CREATE_TRACKING_TABLE)
            .execute(&self.pool)
            .await?;
        let recorded: HashMap<i64, String> = sqlx::query_as::<_, (i64, String)>(SELECT_RECORDED)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect();

        if let Some(&version) = recorded
            .keys()
            .filter(|v| !self.migrations.iter().any(|m| m.version == **v))
            .max()
        {
            return Err(MigrationError::UnknownVersion(version));
        }

        let mut applied = 0;
        for migration in self.migrations {
            match recorded.get(&migration.version) {
                Some(checksum) if *checksum == migration.checksum() => {
                    debug!("Migration {} ({}) already applied", migration.version, migration.name);
                }
                Some(_) => {
                    return Err(MigrationError::Edited {
                        version: migration.version,
                        name: migration.name,
                    });
                }
                None => {
                    info!("Applying migration {} ({})", migration.version, migration.name);
                    migration.apply(&self.pool).await?;
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }
}
