#[path = "common.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use fanmq::broker::Broker;
use fanmq::core::channel::ChannelError;
use fanmq::core::message::{unix_nanos, Message};

const CLIENT: i64 = 1;

#[tokio::test]
async fn unacked_message_is_redelivered_with_bumped_attempts() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("redelivery-test");
    let channel = topic.get_channel("c");

    let consumer = Arc::new(common::TestConsumer::new(CLIENT));
    channel.add_client(CLIENT, consumer.clone()).unwrap();

    let msg = Message::new(topic.generate_id(), Bytes::from_static(b"work"));
    topic.put_message(msg).unwrap();
    assert!(common::wait_until(|| channel.depth() == 1, Duration::from_millis(100)).await);

    let msg = channel.try_pop_message().unwrap();
    let id = msg.id;
    channel
        .start_in_flight_timeout(msg, CLIENT, Duration::from_millis(50))
        .unwrap();
    assert_eq!(channel.in_flight_count(), 1);
    assert_eq!(channel.depth(), 0);

    // before the deadline nothing expires
    assert!(!channel.process_in_flight_queue(unix_nanos()));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(channel.process_in_flight_queue(unix_nanos()));
    assert_eq!(channel.in_flight_count(), 0);
    assert_eq!(channel.depth(), 1);
    assert_eq!(channel.timeout_count(), 1);
    assert_eq!(
        consumer.timeouts.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    let redelivered = channel.try_pop_message().unwrap();
    assert_eq!(redelivered.id, id);
    assert_eq!(redelivered.attempts, 2);

    broker.exit().await;
}

#[tokio::test]
async fn finish_acknowledges_exactly_once() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("fin-test");
    let channel = topic.get_channel("c");

    let msg = Message::new(topic.generate_id(), Bytes::from_static(b"x"));
    let id = msg.id;
    channel
        .start_in_flight_timeout(msg, CLIENT, Duration::from_secs(10))
        .unwrap();

    channel.finish_message(CLIENT, &id).unwrap();
    assert!(matches!(
        channel.finish_message(CLIENT, &id),
        Err(ChannelError::MessageNotInFlight)
    ));
    assert_eq!(channel.in_flight_count(), 0);

    broker.exit().await;
}

#[tokio::test]
async fn only_the_owning_client_may_act_on_a_message() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("owner-test");
    let channel = topic.get_channel("c");

    let msg = Message::new(topic.generate_id(), Bytes::from_static(b"x"));
    let id = msg.id;
    channel
        .start_in_flight_timeout(msg, CLIENT, Duration::from_secs(10))
        .unwrap();

    assert!(matches!(
        channel.finish_message(CLIENT + 1, &id),
        Err(ChannelError::ClientNotFound)
    ));
    assert!(matches!(
        channel.requeue_message(CLIENT + 1, &id, Duration::ZERO),
        Err(ChannelError::ClientNotFound)
    ));
    // still owned and in flight
    channel.finish_message(CLIENT, &id).unwrap();

    broker.exit().await;
}

#[tokio::test]
async fn starting_the_same_id_twice_fails() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("dup-test");
    let channel = topic.get_channel("c");

    let msg = Message::new(topic.generate_id(), Bytes::from_static(b"x"));
    let dup = msg.clone();
    channel
        .start_in_flight_timeout(msg, CLIENT, Duration::from_secs(10))
        .unwrap();
    assert!(matches!(
        channel.start_in_flight_timeout(dup, CLIENT, Duration::from_secs(10)),
        Err(ChannelError::AlreadyInFlight)
    ));

    broker.exit().await;
}

#[tokio::test]
async fn requeue_zero_returns_the_message_immediately() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("req-now-test");
    let channel = topic.get_channel("c");

    let msg = Message::new(topic.generate_id(), Bytes::from_static(b"again"));
    let id = msg.id;
    channel
        .start_in_flight_timeout(msg, CLIENT, Duration::from_secs(10))
        .unwrap();

    channel.requeue_message(CLIENT, &id, Duration::ZERO).unwrap();
    assert_eq!(channel.requeue_count(), 1);
    assert_eq!(channel.in_flight_count(), 0);
    assert_eq!(channel.depth(), 1);

    broker.exit().await;
}

#[tokio::test]
async fn requeue_with_timeout_parks_in_the_deferred_queue() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("req-defer-test");
    let channel = topic.get_channel("c");

    let msg = Message::new(topic.generate_id(), Bytes::from_static(b"later"));
    let id = msg.id;
    channel
        .start_in_flight_timeout(msg, CLIENT, Duration::from_secs(10))
        .unwrap();

    channel
        .requeue_message(CLIENT, &id, Duration::from_millis(80))
        .unwrap();
    // never in both priority queues at once
    assert_eq!(channel.in_flight_count(), 0);
    assert_eq!(channel.deferred_count(), 1);
    assert_eq!(channel.depth(), 0);

    assert!(!channel.process_deferred_queue(unix_nanos()));
    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(channel.process_deferred_queue(unix_nanos()));
    assert_eq!(channel.deferred_count(), 0);
    assert_eq!(channel.depth(), 1);

    broker.exit().await;
}

#[tokio::test]
async fn deferred_release_is_driven_by_the_scan_loop() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("defer-scan-test");
    let channel = topic.get_channel("c");
    broker.start();

    let msg = Message::new(topic.generate_id(), Bytes::from_static(b"tick"));
    channel
        .put_message_deferred(msg, Duration::from_millis(200))
        .unwrap();

    assert_eq!(channel.depth(), 0);
    assert_eq!(channel.deferred_count(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.depth(), 0, "released before its delay elapsed");

    let released =
        common::wait_until(|| channel.depth() == 1, Duration::from_millis(600)).await;
    assert!(released, "scan loop should release the deferred message");
    assert_eq!(channel.deferred_count(), 0);

    broker.exit().await;
}

#[tokio::test]
async fn touch_never_shortens_the_deadline() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("touch-test");
    let channel = topic.get_channel("c");

    let msg = Message::new(topic.generate_id(), Bytes::from_static(b"x"));
    let id = msg.id;
    channel
        .start_in_flight_timeout(msg, CLIENT, Duration::from_secs(10))
        .unwrap();

    // a tiny touch must not pull the deadline forward
    channel
        .touch_message(CLIENT, &id, Duration::from_millis(1))
        .unwrap();
    assert!(!channel.process_in_flight_queue(unix_nanos() + 50_000_000));
    assert_eq!(channel.in_flight_count(), 1);

    broker.exit().await;
}

#[tokio::test]
async fn touch_extends_the_deadline() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("touch-extend-test");
    let channel = topic.get_channel("c");

    let msg = Message::new(topic.generate_id(), Bytes::from_static(b"x"));
    let id = msg.id;
    channel
        .start_in_flight_timeout(msg, CLIENT, Duration::from_millis(40))
        .unwrap();

    channel
        .touch_message(CLIENT, &id, Duration::from_secs(5))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !channel.process_in_flight_queue(unix_nanos()),
        "touched message must outlive its original deadline"
    );
    assert_eq!(channel.in_flight_count(), 1);

    broker.exit().await;
}

#[tokio::test]
async fn empty_clears_all_pending_state() {
    common::init_logging();

    let (_dir, opts) = common::test_opts();
    let broker = Broker::new(opts).unwrap();
    let topic = broker.get_topic("empty-test");
    let channel = topic.get_channel("c");

    for _ in 0..3 {
        let msg = Message::new(topic.generate_id(), Bytes::from_static(b"x"));
        channel.put_message(msg).unwrap();
    }
    let in_flight = Message::new(topic.generate_id(), Bytes::from_static(b"y"));
    channel
        .start_in_flight_timeout(in_flight, CLIENT, Duration::from_secs(10))
        .unwrap();
    let deferred = Message::new(topic.generate_id(), Bytes::from_static(b"z"));
    channel
        .put_message_deferred(deferred, Duration::from_secs(10))
        .unwrap();

    channel.empty().unwrap();
    assert_eq!(channel.depth(), 0);
    assert_eq!(channel.in_flight_count(), 0);
    assert_eq!(channel.deferred_count(), 0);

    broker.exit().await;
}
