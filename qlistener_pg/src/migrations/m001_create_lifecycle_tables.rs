//! Migration 001: the subscription lifecycle tables.

use super::Migration;

/// Subscriptions, retries and their expired archive, the transactions ledger, the negative lists.
pub(super) const CREATE_LIFECYCLE_TABLES: Migration = Migration {
    version: 1,
    name: "create_lifecycle_tables",
    statements: STATEMENTS,
};

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        id BIGSERIAL PRIMARY KEY,
        msisdn VARCHAR(32) NOT NULL,
        id_service VARCHAR(64) NOT NULL DEFAULT '',
        id_campaign VARCHAR(64) NOT NULL DEFAULT '',
        operator_code BIGINT NOT NULL DEFAULT 0,
        country_code BIGINT NOT NULL DEFAULT 0,
        result VARCHAR(32) NOT NULL DEFAULT '',
        status INT NOT NULL DEFAULT 1,
        attempts_count INT NOT NULL DEFAULT 0,
        last_pay_attempt_at TIMESTAMPTZ,
        periodic BOOLEAN NOT NULL DEFAULT FALSE,
        price INT NOT NULL DEFAULT 0,
        outflow_reason VARCHAR(255) NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_subscriptions_msisdn_service
    ON subscriptions (msisdn, id_service)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS retries (
        id BIGSERIAL PRIMARY KEY,
        tid VARCHAR(64) NOT NULL DEFAULT '',
        id_subscription BIGINT NOT NULL DEFAULT 0,
        id_campaign VARCHAR(64) NOT NULL DEFAULT '',
        id_service VARCHAR(64) NOT NULL DEFAULT '',
        msisdn VARCHAR(32) NOT NULL,
        operator_code BIGINT NOT NULL DEFAULT 0,
        country_code BIGINT NOT NULL DEFAULT 0,
        keep_days INT NOT NULL CHECK (keep_days > 0),
        delay_hours INT NOT NULL CHECK (delay_hours > 0),
        price INT NOT NULL DEFAULT 0,
        status VARCHAR(32) NOT NULL DEFAULT '',
        attempts_count INT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_pay_attempt_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS retries_expired (
        id BIGINT PRIMARY KEY,
        tid VARCHAR(64) NOT NULL DEFAULT '',
        id_subscription BIGINT NOT NULL DEFAULT 0,
        id_campaign VARCHAR(64) NOT NULL DEFAULT '',
        id_service VARCHAR(64) NOT NULL DEFAULT '',
        msisdn VARCHAR(32) NOT NULL,
        operator_code BIGINT NOT NULL DEFAULT 0,
        country_code BIGINT NOT NULL DEFAULT 0,
        keep_days INT NOT NULL,
        delay_hours INT NOT NULL,
        price INT NOT NULL DEFAULT 0,
        status VARCHAR(32) NOT NULL DEFAULT '',
        attempts_count INT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        last_pay_attempt_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id BIGSERIAL PRIMARY KEY,
        tid VARCHAR(64) NOT NULL DEFAULT '',
        sent_at TIMESTAMPTZ NOT NULL,
        msisdn VARCHAR(32) NOT NULL,
        result VARCHAR(32) NOT NULL DEFAULT '',
        operator_code BIGINT NOT NULL DEFAULT 0,
        country_code BIGINT NOT NULL DEFAULT 0,
        id_service VARCHAR(64) NOT NULL DEFAULT '',
        id_subscription BIGINT NOT NULL DEFAULT 0,
        id_campaign VARCHAR(64) NOT NULL DEFAULT '',
        operator_token VARCHAR(255) NOT NULL DEFAULT '',
        price INT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS msisdn_blacklist (
        id BIGSERIAL PRIMARY KEY,
        msisdn VARCHAR(32) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS msisdn_postpaid (
        id BIGSERIAL PRIMARY KEY,
        msisdn VARCHAR(32) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];
