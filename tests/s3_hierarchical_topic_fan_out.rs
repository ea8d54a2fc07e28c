use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use illm_mailbox::kv::MemoryKv;
use illm_mailbox::model::{
    AddressingMode, ContentType, DeliveryOptions, Message, Payload, RoutingInfo, RoutingResult,
    SubscriptionOptions, TopicConfig,
};
use illm_mailbox::{Mailbox, MailboxConfig};

fn counting_handler(counter: &Arc<AtomicU32>) -> illm_mailbox::subscription::manager::Handler {
    let counter = Arc::clone(counter);
    Arc::new(move |_msg, _sub| {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    })
}

#[tokio::test]
async fn publish_to_a_topic_reaches_exact_and_prefix_subscribers_exactly_once() {
    let mb = Mailbox::new(Arc::new(MemoryKv::new()), MailboxConfig::default());

    // c1 subscribes to the whole `ai.models.*` subtree via an explicit
    // hierarchical pattern, c2 subscribes to the exact leaf topic.
    mb.create_subscription("c1", "ai.models.gpt", Some("ai.models.**".into()), SubscriptionOptions::default())
        .await
        .unwrap();

    mb.create_topic(TopicConfig::new("ai.models.gpt")).await.unwrap();
    mb.subscribe_to_topic("c2", "ai.models.gpt", SubscriptionOptions::default(), false)
        .await
        .unwrap();

    let c1_hits = Arc::new(AtomicU32::new(0));
    let c2_hits = Arc::new(AtomicU32::new(0));
    mb.register_handler("c1", counting_handler(&c1_hits));
    mb.register_handler("c2", counting_handler(&c2_hits));

    let msg = Message::new(
        "alpha",
        ContentType::Text,
        Payload::Text("model update".into()),
        RoutingInfo {
            addressing_mode: AddressingMode::Topic,
            target: "ai.models.gpt".into(),
            priority: Default::default(),
            ttl_seconds: None,
        },
        DeliveryOptions::default(),
        Default::default(),
    )
    .unwrap();

    let result = mb.route_message(&msg).await.unwrap();
    assert_eq!(result, RoutingResult::Success);

    assert_eq!(c1_hits.load(Ordering::SeqCst), 1);
    assert_eq!(c2_hits.load(Ordering::SeqCst), 1);
}
