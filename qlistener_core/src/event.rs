//! Envelope decoding and the closed set of MT manager events.
//!
//! Messages arrive as `{"event_name": "...", "event_data": {...}}`. The name is resolved into an
//! [`MtEvent`] variant at decode time, so the dispatcher matches exhaustively and adding a new
//! event is a compile-time checked change.

use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The generic wrapper every queue message is sent in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The name of the event, e.g. `StartRetry`
    pub event_name: String,
    /// The event payload
    #[serde(default)]
    pub event_data: Record,
}

impl Envelope {
    /// Wraps a record for the given event kind.
    pub fn new(kind: EventKind, record: Record) -> Self {
        Self {
            event_name: kind.as_str().to_string(),
            event_data: record,
        }
    }

    /// Checks the mandatory fields for this envelope's event name.
    ///
    /// Every event except `Unsubscribe` and `UnsubscribeAll` needs a msisdn and a service code.
    /// Unknown names are held to the same rule; routing rejects them afterwards.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if matches!(
            self.event_name.parse::<EventKind>(),
            Ok(EventKind::Unsubscribe | EventKind::UnsubscribeAll)
        ) {
            return Ok(());
        }
        if self.event_data.msisdn.is_empty() {
            return Err(ValidationError::EmptyMsisdn);
        }
        if self.event_data.service_code.is_empty() {
            return Err(ValidationError::EmptyServiceCode);
        }
        Ok(())
    }
}

/// The names of the events handled by the MT manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Schedule a new billing retry
    StartRetry,
    /// Record a billing attempt on a retry
    TouchRetry,
    /// Retire a retry, archiving it unless it was paid
    RemoveRetry,
    /// Set the status of a subscription
    WriteSubscriptionStatus,
    /// Set the periodic flag of a subscription
    WriteSubscriptionPeriodic,
    /// Cancel the latest subscription of a msisdn to a service
    Unsubscribe,
    /// Purge every active subscription of a msisdn
    UnsubscribeAll,
    /// Add a msisdn to the blacklist
    AddBlacklistedNumber,
    /// Add a msisdn to the postpaid list
    AddPostPaidNumber,
    /// Append a billing transaction to the ledger
    WriteTransaction,
}

impl EventKind {
    /// All event kinds.
    pub const ALL: [EventKind; 10] = [
        EventKind::StartRetry,
        EventKind::TouchRetry,
        EventKind::RemoveRetry,
        EventKind::WriteSubscriptionStatus,
        EventKind::WriteSubscriptionPeriodic,
        EventKind::Unsubscribe,
        EventKind::UnsubscribeAll,
        EventKind::AddBlacklistedNumber,
        EventKind::AddPostPaidNumber,
        EventKind::WriteTransaction,
    ];

    /// The wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StartRetry => "StartRetry",
            EventKind::TouchRetry => "TouchRetry",
            EventKind::RemoveRetry => "RemoveRetry",
            EventKind::WriteSubscriptionStatus => "WriteSubscriptionStatus",
            EventKind::WriteSubscriptionPeriodic => "WriteSubscriptionPeriodic",
            EventKind::Unsubscribe => "Unsubscribe",
            EventKind::UnsubscribeAll => "UnsubscribeAll",
            EventKind::AddBlacklistedNumber => "AddBlacklistedNumber",
            EventKind::AddPostPaidNumber => "AddPostPaidNumber",
            EventKind::WriteTransaction => "WriteTransaction",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownEvent(s.to_string()))
    }
}

/// A decoded MT manager event.
#[derive(Debug, Clone, PartialEq)]
pub enum MtEvent {
    /// See [`EventKind::StartRetry`]
    StartRetry(Record),
    /// See [`EventKind::TouchRetry`]
    TouchRetry(Record),
    /// See [`EventKind::RemoveRetry`]
    RemoveRetry(Record),
    /// See [`EventKind::WriteSubscriptionStatus`]
    WriteSubscriptionStatus(Record),
    /// See [`EventKind::WriteSubscriptionPeriodic`]
    WriteSubscriptionPeriodic(Record),
    /// See [`EventKind::Unsubscribe`]
    Unsubscribe(Record),
    /// See [`EventKind::UnsubscribeAll`]
    UnsubscribeAll(Record),
    /// See [`EventKind::AddBlacklistedNumber`]
    AddBlacklistedNumber(Record),
    /// See [`EventKind::AddPostPaidNumber`]
    AddPostPaidNumber(Record),
    /// See [`EventKind::WriteTransaction`]
    WriteTransaction(Record),
}

impl MtEvent {
    /// Builds the event of the given kind.
    pub fn new(kind: EventKind, record: Record) -> Self {
        match kind {
            EventKind::StartRetry => MtEvent::StartRetry(record),
            EventKind::TouchRetry => MtEvent::TouchRetry(record),
            EventKind::RemoveRetry => MtEvent::RemoveRetry(record),
            EventKind::WriteSubscriptionStatus => MtEvent::WriteSubscriptionStatus(record),
            EventKind::WriteSubscriptionPeriodic => MtEvent::WriteSubscriptionPeriodic(record),
            EventKind::Unsubscribe => MtEvent::Unsubscribe(record),
            EventKind::UnsubscribeAll => MtEvent::UnsubscribeAll(record),
            EventKind::AddBlacklistedNumber => MtEvent::AddBlacklistedNumber(record),
            EventKind::AddPostPaidNumber => MtEvent::AddPostPaidNumber(record),
            EventKind::WriteTransaction => MtEvent::WriteTransaction(record),
        }
    }

    /// Decodes, validates and routes a raw message body.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        envelope.validate()?;
        MtEvent::try_from(envelope)
    }

    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            MtEvent::StartRetry(_) => EventKind::StartRetry,
            MtEvent::TouchRetry(_) => EventKind::TouchRetry,
            MtEvent::RemoveRetry(_) => EventKind::RemoveRetry,
            MtEvent::WriteSubscriptionStatus(_) => EventKind::WriteSubscriptionStatus,
            MtEvent::WriteSubscriptionPeriodic(_) => EventKind::WriteSubscriptionPeriodic,
            MtEvent::Unsubscribe(_) => EventKind::Unsubscribe,
            MtEvent::UnsubscribeAll(_) => EventKind::UnsubscribeAll,
            MtEvent::AddBlacklistedNumber(_) => EventKind::AddBlacklistedNumber,
            MtEvent::AddPostPaidNumber(_) => EventKind::AddPostPaidNumber,
            MtEvent::WriteTransaction(_) => EventKind::WriteTransaction,
        }
    }

    /// The payload of this event.
    pub fn record(&self) -> &Record {
        match self {
            MtEvent::StartRetry(r)
            | MtEvent::TouchRetry(r)
            | MtEvent::RemoveRetry(r)
            | MtEvent::WriteSubscriptionStatus(r)
            | MtEvent::WriteSubscriptionPeriodic(r)
            | MtEvent::Unsubscribe(r)
            | MtEvent::UnsubscribeAll(r)
            | MtEvent::AddBlacklistedNumber(r)
            | MtEvent::AddPostPaidNumber(r)
            | MtEvent::WriteTransaction(r) => r,
        }
    }
}

impl TryFrom<Envelope> for MtEvent {
    type Error = DecodeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let kind: EventKind = envelope.event_name.parse()?;
        Ok(MtEvent::new(kind, envelope.event_data))
    }
}

impl From<MtEvent> for Envelope {
    fn from(event: MtEvent) -> Self {
        let kind = event.kind();
        let record = match event {
            MtEvent::StartRetry(r)
            | MtEvent::TouchRetry(r)
            | MtEvent::RemoveRetry(r)
            | MtEvent::WriteSubscriptionStatus(r)
            | MtEvent::WriteSubscriptionPeriodic(r)
            | MtEvent::Unsubscribe(r)
            | MtEvent::UnsubscribeAll(r)
            | MtEvent::AddBlacklistedNumber(r)
            | MtEvent::AddPostPaidNumber(r)
            | MtEvent::WriteTransaction(r) => r,
        };
        Envelope::new(kind, record)
    }
}

/// A mandatory field is missing from the event data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The msisdn is empty
    #[error("empty msisdn")]
    EmptyMsisdn,
    /// The service code is empty
    #[error("empty service code")]
    EmptyServiceCode,
}

/// Reasons a message can never be turned into an [`MtEvent`].
///
/// All of them are permanent: redelivering the same bytes would fail the same way.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The body is not a valid envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Mandatory fields are missing
    #[error("invalid event data: {0}")]
    Invalid(#[from] ValidationError),
    /// The event name doesn't match any handler
    #[error("unknown event: {0:?}")]
    UnknownEvent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_its_name() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn decode_start_retry() {
        let body = br#"{"event_name":"StartRetry","event_data":{"tid":"T1","msisdn":"79990001122","id_service":"SVC1","id_campaign":"CMP1","keep_days":5,"delay_hours":24,"price":100}}"#;
        let event = MtEvent::decode(body).unwrap();
        assert_eq!(event.kind(), EventKind::StartRetry);
        assert_eq!(event.record().keep_days, 5);
        assert_eq!(event.record().delay_hours, 24);
        assert_eq!(event.record().price, 100);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            MtEvent::decode(b"not-json"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_msisdn() {
        let body = br#"{"event_name":"TouchRetry","event_data":{"id_service":"SVC1","id_retry":1}}"#;
        assert!(matches!(
            MtEvent::decode(body),
            Err(DecodeError::Invalid(ValidationError::EmptyMsisdn))
        ));
    }

    #[test]
    fn decode_rejects_missing_service() {
        let body = br#"{"event_name":"WriteTransaction","event_data":{"msisdn":"7999"}}"#;
        assert!(matches!(
            MtEvent::decode(body),
            Err(DecodeError::Invalid(ValidationError::EmptyServiceCode))
        ));
    }

    #[test]
    fn unsubscribe_events_skip_field_validation() {
        let body = br#"{"event_name":"UnsubscribeAll","event_data":{"msisdn":"7999"}}"#;
        assert_eq!(
            MtEvent::decode(body).unwrap().kind(),
            EventKind::UnsubscribeAll
        );
        let body = br#"{"event_name":"Unsubscribe","event_data":{}}"#;
        assert_eq!(MtEvent::decode(body).unwrap().kind(), EventKind::Unsubscribe);
    }

    #[test]
    fn decode_rejects_unknown_names() {
        let body = br#"{"event_name":"Resubscribe","event_data":{"msisdn":"7999","id_service":"S"}}"#;
        match MtEvent::decode(body) {
            Err(DecodeError::UnknownEvent(name)) => assert_eq!(name, "Resubscribe"),
            other => panic!("expected unknown event, got {:?}", other),
        }
    }

    #[test]
    fn envelope_from_event_keeps_name_and_data() {
        let record = Record {
            msisdn: "7999".into(),
            ..Default::default()
        };
        let envelope = Envelope::from(MtEvent::AddPostPaidNumber(record.clone()));
        assert_eq!(envelope.event_name, "AddPostPaidNumber");
        assert_eq!(envelope.event_data, record);
    }
}
