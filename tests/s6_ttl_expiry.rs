use std::sync::Arc;
use std::time::Duration;

use illm_mailbox::kv::MemoryKv;
use illm_mailbox::model::{
    AddressingMode, ContentType, DeliveryOptions, DeliveryStatus, Message, Payload, RoutingInfo, RoutingResult,
};
use illm_mailbox::router::RouterConfig;
use illm_mailbox::{Mailbox, MailboxConfig};

#[tokio::test]
async fn a_short_lived_message_with_no_subscriber_expires_on_a_retry_pass() {
    let router = RouterConfig {
        retry_check_interval: Duration::from_millis(50),
        cleanup_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let mb = Mailbox::new(Arc::new(MemoryKv::new()), MailboxConfig { router, ..Default::default() });
    mb.start().await.unwrap();

    let msg = Message::new(
        "alpha",
        ContentType::Text,
        Payload::Text("ephemeral".into()),
        RoutingInfo {
            addressing_mode: AddressingMode::Direct,
            target: "inbox-ghost".into(),
            priority: Default::default(),
            ttl_seconds: Some(1),
        },
        DeliveryOptions {
            confirmation_required: true,
            ..Default::default()
        },
        Default::default(),
    )
    .unwrap();

    let msg_id = msg.id.to_string();
    let result = mb.route_message(&msg).await.unwrap();
    assert_eq!(result, RoutingResult::Queued);
    assert_eq!(mb.get_delivery_status(&msg_id).unwrap().status, DeliveryStatus::Pending);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let confirmation = mb.get_delivery_status(&msg_id).unwrap();
    assert_eq!(confirmation.status, DeliveryStatus::Expired);
}
