use qlistener_core::cache::{CAMPAIGNS_TABLE, SUBSCRIPTIONS_TABLE};
use qlistener_core::prelude::*;
use qlistener_mem::{
    InMemoryCampaignSource, InMemoryNotifier, InMemoryStore, InMemorySubscriptionSource,
    NewSubscription,
};
use serde_json::json;
use std::sync::Arc;

fn setup() -> (Dispatcher<InMemoryStore>, InMemoryStore, InMemoryNotifier) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = InMemoryStore::new();
    let notifier = InMemoryNotifier::new();
    let manager = MtManager::new(store.clone(), Arc::new(notifier.clone()));
    (Dispatcher::new("mt_manager", manager), store, notifier)
}

fn body(value: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

#[tokio::test]
async fn start_retry_message_is_applied_and_acked() {
    let (dispatcher, store, _) = setup();
    let message = body(json!({
        "event_name": "StartRetry",
        "event_data": {
            "tid": "T1",
            "msisdn": "79990001122",
            "id_service": "SVC1",
            "id_campaign": "CMP1",
            "keep_days": 5,
            "delay_hours": 24,
            "price": 100,
            "id_subscription": 12
        }
    }));

    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Ack);

    let retries = store.retries().await;
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].keep_days, 5);
    assert_eq!(retries[0].delay_hours, 24);
    assert_eq!(retries[0].price, 100);
    assert_eq!(retries[0].subscription_id, 12);
    assert_eq!(
        dispatcher.counters().snapshot(),
        CountersSnapshot {
            success: 1,
            ..Default::default()
        }
    );
}

#[tokio::test]
async fn malformed_body_is_dropped() {
    let (dispatcher, store, notifier) = setup();

    assert_eq!(dispatcher.dispatch(b"not-json").await, Disposition::Ack);

    assert_eq!(
        dispatcher.counters().snapshot(),
        CountersSnapshot {
            dropped: 1,
            ..Default::default()
        }
    );
    assert!(store.retries().await.is_empty());
    assert!(store.transactions().await.is_empty());
    assert!(notifier.published().await.is_empty());
}

#[tokio::test]
async fn missing_msisdn_is_counted_as_empty() {
    let (dispatcher, store, _) = setup();
    let message = body(json!({
        "event_name": "AddBlacklistedNumber",
        "event_data": { "id_service": "SVC1" }
    }));

    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Ack);

    let counters = dispatcher.counters().snapshot();
    assert_eq!(counters.dropped, 1);
    assert_eq!(counters.empty, 1);
    assert!(store.blacklist().await.is_empty());
}

#[tokio::test]
async fn unsubscribe_all_needs_no_service_code() {
    let (dispatcher, store, _) = setup();
    let id = store
        .insert_subscription(NewSubscription {
            msisdn: "79990001122".into(),
            service_code: "SVC1".into(),
            ..Default::default()
        })
        .await;
    let message = body(json!({
        "event_name": "UnsubscribeAll",
        "event_data": { "msisdn": "79990001122" }
    }));

    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Ack);

    assert_eq!(store.subscription(id).await.unwrap().status, "purged");
    assert_eq!(dispatcher.counters().snapshot().success, 1);
}

#[tokio::test]
async fn unknown_event_is_dropped() {
    let (dispatcher, _, _) = setup();
    let message = body(json!({
        "event_name": "Refund",
        "event_data": { "msisdn": "79990001122", "id_service": "SVC1" }
    }));

    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Ack);

    let counters = dispatcher.counters().snapshot();
    assert_eq!(counters.dropped, 1);
    assert_eq!(counters.unknown, 1);
    assert_eq!(counters.success, 0);
}

#[tokio::test]
async fn failed_precondition_is_dropped_as_rejected() {
    let (dispatcher, store, _) = setup();
    let message = body(json!({
        "event_name": "StartRetry",
        "event_data": { "msisdn": "79990001122", "id_service": "SVC1", "delay_hours": 24 }
    }));

    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Ack);

    let counters = dispatcher.counters().snapshot();
    assert_eq!(counters.dropped, 1);
    assert_eq!(counters.rejected, 1);
    assert!(store.retries().await.is_empty());
}

#[tokio::test]
async fn storage_outage_requeues_and_the_redelivery_succeeds() {
    let (dispatcher, store, _) = setup();
    let message = body(json!({
        "event_name": "WriteTransaction",
        "event_data": {
            "tid": "T7",
            "msisdn": "79990001122",
            "id_service": "SVC1",
            "result": "paid",
            "price": 100
        }
    }));

    store.set_unavailable(true);
    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Requeue);
    assert_eq!(dispatcher.counters().snapshot().db_errors, 1);
    assert!(store.transactions().await.is_empty());

    store.set_unavailable(false);
    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Ack);
    assert_eq!(store.transactions().await.len(), 1);

    let counters = dispatcher.counters().snapshot();
    assert_eq!(counters.db_errors, 1);
    assert_eq!(counters.success, 1);
    assert_eq!(counters.dropped, 0);
}

#[tokio::test]
async fn notifier_failure_still_acks() {
    let (dispatcher, store, notifier) = setup();
    notifier.set_failing(true);
    let message = body(json!({
        "event_name": "WriteTransaction",
        "event_data": { "tid": "T8", "msisdn": "79990001122", "id_service": "SVC1" }
    }));

    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Ack);
    assert_eq!(store.transactions().await.len(), 1);
    assert_eq!(dispatcher.counters().snapshot().success, 1);
}

#[tokio::test]
async fn dispatcher_is_a_delivery_handler() {
    let (dispatcher, store, _) = setup();
    let handler: Arc<dyn DeliveryHandler> = Arc::new(dispatcher);
    let message = body(json!({
        "event_name": "AddPostPaidNumber",
        "event_data": { "msisdn": "79990001122", "id_service": "SVC1" }
    }));

    assert_eq!(handler.handle(&message).await, Disposition::Ack);
    assert_eq!(store.postpaid().await, vec!["79990001122".to_string()]);
}

#[tokio::test]
async fn caches_follow_their_tables_on_reload() {
    let store = InMemoryStore::new();
    let active = store
        .insert_subscription(NewSubscription {
            msisdn: "79990001122".into(),
            service_code: "SVC1".into(),
            ..Default::default()
        })
        .await;
    store
        .insert_subscription(NewSubscription {
            msisdn: "79990001122".into(),
            service_code: "SVC2".into(),
            active: false,
            ..Default::default()
        })
        .await;

    let campaign_source = InMemoryCampaignSource::new(vec![CampaignEntry {
        hash: "h1".into(),
        id: 1,
        service_id: 10,
    }]);
    let campaigns = Arc::new(ReferenceCache::new(campaign_source.clone()));
    let subscriptions = Arc::new(ReferenceCache::new(InMemorySubscriptionSource::new(
        store.clone(),
    )));

    let mut registry = CacheRegistry::new();
    registry.register(campaigns.clone());
    registry.register(subscriptions.clone());
    assert_eq!(
        registry.tables(),
        vec![CAMPAIGNS_TABLE.to_string(), SUBSCRIPTIONS_TABLE.to_string()]
    );

    registry.reload_all().await.unwrap();
    assert_eq!(campaigns.get(&"h1".to_string()).await.map(|c| c.id), Some(1));
    assert_eq!(
        subscriptions
            .get(&SubscriptionKey::new("79990001122", "SVC1"))
            .await,
        Some(active)
    );
    assert_eq!(
        subscriptions
            .get(&SubscriptionKey::new("79990001122", "SVC2"))
            .await,
        None
    );

    campaign_source
        .replace(vec![CampaignEntry {
            hash: "h2".into(),
            id: 2,
            service_id: 10,
        }])
        .await;
    assert_eq!(registry.reload(CAMPAIGNS_TABLE).await.unwrap(), 1);
    assert!(campaigns.get(&"h1".to_string()).await.is_none());
    assert_eq!(campaigns.get(&"h2".to_string()).await.map(|c| c.service_id), Some(10));

    assert!(matches!(
        registry.reload("operators").await,
        Err(CacheError::UnknownTable(_))
    ));
}

#[tokio::test]
async fn empty_subscription_status_resets_to_pending_and_ignores_result() {
    let (dispatcher, store, notifier) = setup();
    let id = store
        .insert_subscription(NewSubscription {
            msisdn: "79990001122".into(),
            service_code: "SVC1".into(),
            status: "paid".into(),
            ..Default::default()
        })
        .await;
    let message = body(json!({
        "event_name": "WriteSubscriptionStatus",
        "event_data": {
            "tid": "T5",
            "msisdn": "79990001122",
            "id_service": "SVC1",
            "id_subscription": id,
            "subscription_status": "",
            "result": "failed"
        }
    }));

    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Ack);

    assert_eq!(store.subscription(id).await.unwrap().status, "");
    let outflow = notifier.published_to(NotifyQueue::Outflow).await;
    assert_eq!(outflow.len(), 1);
    assert_eq!(outflow[0].transaction_result, "");
}

#[tokio::test]
async fn paid_result_without_paid_status_still_archives_the_retry() {
    let (dispatcher, store, _) = setup();
    let id = store
        .insert_retry(&NewRetry::from(&Record {
            msisdn: "79990001122".into(),
            service_code: "SVC1".into(),
            keep_days: 5,
            delay_hours: 24,
            ..Default::default()
        }))
        .await
        .unwrap();
    let message = body(json!({
        "event_name": "RemoveRetry",
        "event_data": {
            "tid": "T6",
            "msisdn": "79990001122",
            "id_service": "SVC1",
            "id_retry": id,
            "subscription_status": "",
            "result": "paid"
        }
    }));

    assert_eq!(dispatcher.dispatch(&message).await, Disposition::Ack);

    assert!(store.retry(id).await.is_none());
    let archived = store.retries_expired().await;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, id);
}
