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
async fn direct_message_reaches_a_live_handler_and_lands_in_the_mailbox() {
    let mb = Mailbox::new(Arc::new(MemoryKv::new()), MailboxConfig::default());
    mb.create_mailbox("inbox-bravo", "bravo").await.unwrap();
    mb.create_subscription("bravo", "inbox-bravo", None, SubscriptionOptions::default())
        .await
        .unwrap();

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

    let result = mb.route_message(&direct_message("inbox-bravo")).await.unwrap();
    assert_eq!(result, RoutingResult::Success);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let page = mb.get_messages("inbox-bravo", 0, 10, None, false).await.unwrap();
    assert_eq!(page.messages.len(), 1);

    assert_eq!(mb.get_unread_count("inbox-bravo", "bravo").await.unwrap(), 1);
    let msg_id = page.messages[0].id.to_string();
    assert!(mb.mark_message_read("inbox-bravo", &msg_id, "bravo").await.unwrap());
    assert_eq!(mb.get_unread_count("inbox-bravo", "bravo").await.unwrap(), 0);
}
