mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{auto_ack, request, response_for};
use dm_engine::{
    ChangeNotifier, DeviceData, DeviceLocation, Dispatcher, EndpointConfig, Envelope, JsonCodec,
    ManagedEndpoint, ManagementChannel, MemoryTransport, ResponseCode, Transport,
};
use serde_json::json;

async fn managed_endpoint() -> (ManagedEndpoint, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    auto_ack(&transport);
    let device = DeviceData::builder("sensor", "d1")
        .location(DeviceLocation::new(51.5, -0.12))
        .build();
    let endpoint = ManagedEndpoint::builder(
        EndpointConfig::new("sensor", "d1").with_response_timeout(Duration::from_millis(500)),
        transport.clone(),
    )
    .device_data(device)
    .build()
    .unwrap();
    endpoint.manage().await.unwrap();
    transport.clear_published();
    (endpoint, transport)
}

fn notifications(transport: &MemoryTransport) -> Vec<Envelope> {
    transport.published_on(ManagementChannel::Notify)
}

#[tokio::test]
async fn test_unregistered_channel_is_dropped_silently() {
    let transport = Arc::new(MemoryTransport::new());
    let notifier = Arc::new(ChangeNotifier::new(
        transport.clone(),
        Arc::new(JsonCodec),
        1,
        Duration::from_millis(100),
    ));
    let dispatcher = Dispatcher::new(Arc::new(JsonCodec), notifier);

    assert!(dispatcher.dispatch("observe", br#"{"reqId":"r1"}"#).await.is_none());
    assert!(dispatcher.dispatch("no-such-channel", b"{}").await.is_none());
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn test_observe_then_change_is_notified() {
    let (endpoint, transport) = managed_endpoint().await;

    transport
        .deliver_envelope("observe", &request("r1", json!({"fields": [{"field": "location"}]})))
        .await;

    let response = response_for(&transport, "r1").expect("observe answered");
    assert_eq!(response.rc(), Some(ResponseCode::Success));
    let field = &response.data.as_ref().unwrap()["fields"][0];
    assert_eq!(field["field"], "location");
    assert_eq!(field["value"]["latitude"], 51.5);

    endpoint
        .update_location(DeviceLocation::new(48.85, 2.35))
        .await
        .unwrap();

    let notes = transport
        .wait_for(ManagementChannel::Notify, 1, Duration::from_secs(1))
        .await;
    assert_eq!(notes.len(), 1);
    let note = &notes[0];
    let request_id = note.request_id.as_deref().unwrap();
    assert_ne!(request_id, "r1");
    let field = &note.data.as_ref().unwrap()["fields"][0];
    assert_eq!(field["field"], "location");
    assert_eq!(field["value"]["latitude"], 48.85);
    assert_eq!(field["value"]["longitude"], 2.35);
}

#[tokio::test]
async fn test_cancel_stops_notifications() {
    let (endpoint, transport) = managed_endpoint().await;

    transport
        .deliver_envelope("observe", &request("r1", json!({"fields": [{"field": "location"}]})))
        .await;
    endpoint
        .update_location(DeviceLocation::new(1.0, 1.0))
        .await
        .unwrap();
    transport
        .wait_for(ManagementChannel::Notify, 1, Duration::from_secs(1))
        .await;

    transport
        .deliver_envelope("cancel", &request("r2", json!({"fields": [{"field": "location"}]})))
        .await;
    assert_eq!(
        response_for(&transport, "r2").unwrap().rc(),
        Some(ResponseCode::Success)
    );

    endpoint
        .update_location(DeviceLocation::new(2.0, 2.0))
        .await
        .unwrap();
    endpoint
        .update_location(DeviceLocation::new(3.0, 3.0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifications(&transport).len(), 1);
}

#[tokio::test]
async fn test_unchanged_value_is_not_notified() {
    let (endpoint, transport) = managed_endpoint().await;
    transport
        .deliver_envelope("observe", &request("r1", json!({"fields": ["location"]})))
        .await;

    endpoint.device().location().apply_local_update(|_| {});
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(notifications(&transport).is_empty());
}

#[tokio::test]
async fn test_structured_diff_carries_changed_keys_only() {
    let (endpoint, transport) = managed_endpoint().await;
    transport
        .deliver_envelope("observe", &request("r1", json!({"fields": ["location"]})))
        .await;

    endpoint
        .device()
        .location()
        .apply_local_update(|l| l.elevation = Some(35.0));

    let notes = transport
        .wait_for(ManagementChannel::Notify, 1, Duration::from_secs(1))
        .await;
    let value = &notes[0].data.as_ref().unwrap()["fields"][0]["value"];
    assert_eq!(value, &json!({"elevation": 35.0}));
}

#[tokio::test]
async fn test_cleared_key_is_notified_and_restoring_it_is_not_suppressed() {
    let (endpoint, transport) = managed_endpoint().await;
    let location = endpoint.device().location().clone();
    location.apply_local_update(|l| l.accuracy = Some(4.0));
    transport
        .deliver_envelope("observe", &request("r1", json!({"fields": ["location"]})))
        .await;

    location.apply_local_update(|l| l.accuracy = None);
    location.apply_local_update(|l| l.accuracy = Some(4.0));

    let notes = transport
        .wait_for(ManagementChannel::Notify, 2, Duration::from_secs(1))
        .await;
    assert_eq!(notes.len(), 2);
    let values: Vec<_> = notes
        .iter()
        .map(|n| n.data.as_ref().unwrap()["fields"][0]["value"].clone())
        .collect();
    assert_eq!(values, vec![json!({"accuracy": null}), json!({"accuracy": 4.0})]);
}

#[tokio::test]
async fn test_device_update_reports_unresolved_fields() {
    let (endpoint, transport) = managed_endpoint().await;

    transport
        .deliver_envelope(
            "device-update",
            &request(
                "u1",
                json!({"fields": [
                    {"field": "location", "value": {"latitude": 10.0, "longitude": 11.0}},
                    {"field": "battery", "value": 80},
                    {"field": "firmwareVersion", "value": "x"}
                ]}),
            ),
        )
        .await;

    let response = response_for(&transport, "u1").unwrap();
    assert_eq!(response.rc(), Some(ResponseCode::NotFound));
    assert_eq!(
        response.data,
        Some(json!({"fields": ["battery", "firmwareVersion"]}))
    );
    assert_eq!(endpoint.device().location().read(|l| l.latitude), 10.0);

    transport
        .deliver_envelope(
            "device-update",
            &request("u2", json!({"fields": [{"field": "location", "value": {"latitude": 12.0}}]})),
        )
        .await;
    assert_eq!(
        response_for(&transport, "u2").unwrap().rc(),
        Some(ResponseCode::UpdateSuccess)
    );
}

#[tokio::test]
async fn test_server_update_of_observed_field_is_not_echoed() {
    let (_endpoint, transport) = managed_endpoint().await;
    transport
        .deliver_envelope("observe", &request("r1", json!({"fields": ["location"]})))
        .await;

    transport
        .deliver_envelope(
            "device-update",
            &request("u1", json!({"fields": [{"field": "location", "value": {"latitude": 0.5}}]})),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(notifications(&transport).is_empty());
}

#[tokio::test]
async fn test_malformed_request_gets_bad_request() {
    let (_endpoint, transport) = managed_endpoint().await;

    transport.deliver("observe", br#"{"reqId":"m1","d":"#).await;
    transport.deliver("observe", br#"["not", "an", "object"]"#).await;

    let responses = transport.published_on(ManagementChannel::Response);
    assert_eq!(responses.len(), 2);
    assert!(responses
        .iter()
        .all(|r| r.rc() == Some(ResponseCode::BadRequest)));
}

#[tokio::test]
async fn test_generic_request_acknowledged() {
    let (_endpoint, transport) = managed_endpoint().await;
    transport
        .deliver_envelope("generic", &request("g1", json!({"anything": true})))
        .await;
    assert_eq!(
        response_for(&transport, "g1").unwrap().rc(),
        Some(ResponseCode::Success)
    );
}

#[tokio::test]
async fn test_notify_and_wait_times_out() {
    let transport = Arc::new(MemoryTransport::new());
    let notifier = ChangeNotifier::new(
        transport.clone(),
        Arc::new(JsonCodec),
        1,
        Duration::from_secs(5),
    );

    let started = tokio::time::Instant::now();
    let response = notifier
        .notify_and_wait(json!({"x": 1}), Duration::from_millis(50))
        .await;

    assert!(response.is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(notifier.pending_count(), 0);
    assert_eq!(transport.published_on(ManagementChannel::Notify).len(), 1);
}

#[tokio::test]
async fn test_notify_and_wait_matches_response() {
    let transport = Arc::new(MemoryTransport::new());
    transport.respond_with(ManagementChannel::Notify, ResponseCode::Success);
    let notifier = Arc::new(ChangeNotifier::new(
        transport.clone(),
        Arc::new(JsonCodec),
        1,
        Duration::from_secs(5),
    ));
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(JsonCodec), notifier.clone()));
    transport
        .subscribe(ManagementChannel::Response, dispatcher)
        .await
        .unwrap();

    let response = notifier
        .notify_and_wait(json!({"x": 1}), Duration::from_secs(1))
        .await
        .expect("response matched");

    let sent = &transport.published_on(ManagementChannel::Notify)[0];
    assert_eq!(response.request_id, sent.request_id);
    assert_eq!(response.rc(), Some(ResponseCode::Success));
    assert_eq!(notifier.pending_count(), 0);
}
