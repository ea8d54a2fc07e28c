use std::sync::Arc;
use std::time::Duration;

use illm_mailbox::kv::MemoryKv;
use illm_mailbox::model::DeliveryStatus;
use illm_mailbox::router::RouterConfig;
use illm_mailbox::{Mailbox, MailboxConfig};

#[tokio::test]
async fn failed_deliveries_back_off_exponentially_then_succeed() {
    let router = RouterConfig {
        max_retry_attempts: 3,
        base_delay: Duration::from_secs(1),
        exp_factor: 2.0,
        max_delay: Duration::from_secs(60),
        jitter: false,
        ..Default::default()
    };
    let mb = Mailbox::new(Arc::new(MemoryKv::new()), MailboxConfig { router, ..Default::default() });

    let msg_id = uuid::Uuid::new_v4().to_string();

    mb.handle_delivery_confirmation(&msg_id, DeliveryStatus::Failed, "inbox-bravo", Some("timeout".into()), None)
        .await
        .unwrap();
    let after_first = mb.get_delivery_status(&msg_id).unwrap();
    assert_eq!(after_first.status, DeliveryStatus::Failed);
    let first_delay = after_first.next_retry_at.unwrap() - after_first.updated_at;
    assert!(first_delay >= chrono::Duration::milliseconds(950) && first_delay <= chrono::Duration::milliseconds(1100));

    mb.handle_delivery_confirmation(&msg_id, DeliveryStatus::Failed, "inbox-bravo", Some("timeout".into()), None)
        .await
        .unwrap();
    let after_second = mb.get_delivery_status(&msg_id).unwrap();
    let second_delay = after_second.next_retry_at.unwrap() - after_second.updated_at;
    assert!(second_delay >= chrono::Duration::milliseconds(1950) && second_delay <= chrono::Duration::milliseconds(2100));
    assert!(second_delay >= first_delay);

    mb.handle_delivery_confirmation(&msg_id, DeliveryStatus::Delivered, "inbox-bravo", None, Some(12))
        .await
        .unwrap();
    let final_confirmation = mb.get_delivery_status(&msg_id).unwrap();
    assert_eq!(final_confirmation.status, DeliveryStatus::Delivered);
    assert_eq!(final_confirmation.attempts.len(), 3);
    assert!(final_confirmation.next_retry_at.is_none());
}
