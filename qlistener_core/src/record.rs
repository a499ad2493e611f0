//! The `Record` carried in every MT manager envelope.
//!
//! A record is a superset of the fields any lifecycle handler may need. Each handler reads the
//! subset it cares about and ignores the rest, so every field is optional on the wire and falls
//! back to its zero value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription and retry status values as stored in the database.
pub mod status {
    /// A subscription still being billed. Stored as the empty string.
    pub const PENDING: &str = "";
    /// The operator confirmed the charge.
    pub const PAID: &str = "paid";
    /// The subscriber asked to leave the service.
    pub const CANCELED: &str = "canceled";
    /// Removed by a purge request for the whole msisdn.
    pub const PURGED: &str = "purged";
    /// The operator rejected the charge.
    pub const REJECTED: &str = "rejected";
    /// The msisdn is on the blacklist.
    pub const BLACKLISTED: &str = "blacklisted";
    /// The msisdn belongs to a postpaid plan and can't be charged.
    pub const POSTPAID: &str = "postpaid";

    /// Statuses after which no retry should target a subscription.
    pub const TERMINAL: [&str; 5] = [CANCELED, PURGED, REJECTED, BLACKLISTED, POSTPAID];

    /// Whether `status` is one of the [`TERMINAL`] statuses.
    pub fn is_terminal(status: &str) -> bool {
        TERMINAL.contains(&status)
    }
}

/// Reason stored on subscriptions purged without an explicit `outflow_reason`.
pub const DEFAULT_PURGE_REASON: &str = "purge request";

/// The payload of an MT manager event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    /// Transaction id used to correlate logs across services
    pub tid: String,
    /// Subscriber phone number
    pub msisdn: String,
    /// Service code
    #[serde(rename = "id_service")]
    pub service_code: String,
    /// Campaign code
    #[serde(rename = "id_campaign")]
    pub campaign_code: String,
    /// Mobile operator code
    pub operator_code: i64,
    /// Country code
    pub country_code: i64,
    /// Price in the operator's minor currency unit
    pub price: i32,
    /// How many days a retry is kept before it expires
    pub keep_days: i32,
    /// Hours between two billing attempts of a retry
    pub delay_hours: i32,
    /// Subscription id
    #[serde(rename = "id_subscription")]
    pub subscription_id: i64,
    /// Retry id
    #[serde(rename = "id_retry")]
    pub retry_id: i64,
    /// Billing result as reported by the operator
    pub result: String,
    /// Subscription status requested by the caller. Empty means pending.
    pub subscription_status: String,
    /// Whether the subscription is billed periodically
    pub periodic: bool,
    /// Why the subscription left active billing
    pub outflow_reason: String,
    /// When the billing attempt was sent
    pub sent_at: Option<DateTime<Utc>>,
    /// Token returned by the operator for the transaction
    pub operator_token: String,
    /// Billing attempts made so far
    pub attempts_count: i32,
}

impl Record {
    /// The time of the billing attempt, or now if the producer didn't send one.
    pub fn attempted_at(&self) -> DateTime<Utc> {
        self.sent_at.unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_zero_values() {
        let record: Record = serde_json::from_str(r#"{"msisdn":"79990001122"}"#).unwrap();
        assert_eq!(record.msisdn, "79990001122");
        assert_eq!(record.service_code, "");
        assert_eq!(record.keep_days, 0);
        assert_eq!(record.sent_at, None);
        assert!(!record.periodic);
    }

    #[test]
    fn wire_names_map_to_fields() {
        let record: Record = serde_json::from_str(
            r#"{"id_service":"SVC1","id_campaign":"CMP1","id_subscription":7,"id_retry":9}"#,
        )
        .unwrap();
        assert_eq!(record.service_code, "SVC1");
        assert_eq!(record.campaign_code, "CMP1");
        assert_eq!(record.subscription_id, 7);
        assert_eq!(record.retry_id, 9);
    }

    #[test]
    fn terminal_statuses() {
        assert!(status::is_terminal(status::PURGED));
        assert!(status::is_terminal(status::POSTPAID));
        assert!(!status::is_terminal(status::PAID));
        assert!(!status::is_terminal(status::PENDING));
    }
}
