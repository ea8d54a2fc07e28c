use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use illm_mailbox::kv::MemoryKv;
use illm_mailbox::model::{
    AddressingMode, ContentType, DeliveryOptions, Message, Payload, RoutingInfo, RoutingResult,
    SubscriptionOptions,
};
use illm_mailbox::{Mailbox, MailboxConfig};

fn direct_message(target: &str) -> Message {
    Message::new(
        "alpha",
        ContentType::Text,
        Payload::Text("hi".into()),
        RoutingInfo {
            addressing_mode: AddressingMode::Direct,
            target: target.into(),
            priority: Default::default(),
            ttl_seconds: None,
        },
        DeliveryOptions::default(),
        Default::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn message_to_an_unregistered_agent_is_queued_then_flushed_on_reconnect() {
    let mb = Mailbox::new(Arc::new(MemoryKv::new()), MailboxConfig::default());
    mb.create_mailbox("inbox-bravo", "bravo").await.unwrap();
    mb.create_subscription("bravo", "inbox-bravo", None, SubscriptionOptions::default())
        .await
        .unwrap();

    let result = mb.route_message(&direct_message("inbox-bravo")).await.unwrap();
    assert_eq!(result, RoutingResult::Queued);

    let invocations = Arc::new(AtomicU32::new(0));
    let invocations_clone = Arc::clone(&invocations);
    mb.register_handler(
        "bravo",
        Arc::new(move |_msg, _sub| {
            let invocations = Arc::clone(&invocations_clone);
            Box::pin(async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }),
    );

    // Nothing fires until the agent is reported as having come back online;
    // the message sits in the durable offline queue until then.
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    mb.handle_connection_restored("bravo").await.unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}
