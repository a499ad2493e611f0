//! Migration 002: the campaigns reference table.

use super::Migration;

/// The `campaigns` table read by the campaigns cache.
pub(super) const CREATE_CAMPAIGNS_TABLE: Migration = Migration {
    version: 2,
    name: "create_campaigns_table",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS campaigns (
            id BIGSERIAL PRIMARY KEY,
            hash VARCHAR(32) NOT NULL,
            service_id_1 BIGINT NOT NULL,
            status INT NOT NULL DEFAULT 1,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_campaigns_hash ON campaigns (hash)",
    ],
};
