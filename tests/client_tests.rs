mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use casession::{
    ChannelState, ClientError, DeliveryMode,
    client::{ChannelSettings, CircuitState, ConnectionEvent},
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue},
    messages::{ErrorCondition, Message, MonitorMask},
    pvgroup::{PvGroup, PvGroupBuilder, ReadOnly},
};
use common::{TestServer, init_logging};
use tokio::sync::mpsc;

fn test_group() -> PvGroup {
    PvGroupBuilder::new("TEST:")
        .add("COUNT", 42i32)
        .add("GAIN", 1.5f64)
        .add("OFFSET", 0i16)
        .add_with("SERIAL", "SN-0042", ReadOnly)
        .build()
        .unwrap()
}

/// Collect every delivered event on a channel the test can wait on
fn collector() -> (
    impl FnMut(Vec<Dbr>) + Send + 'static,
    mpsc::UnboundedReceiver<Dbr>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |batch: Vec<Dbr>| {
        for event in batch {
            let _ = tx.send(event);
        }
    };
    (callback, rx)
}

/// Wait for an event carrying exactly this value, skipping others
async fn expect_value(events: &mut mpsc::UnboundedReceiver<Dbr>, expected: &DbrValue) {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event.value() == expected {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "Never received {expected:?}");
}

#[tokio::test]
async fn read_and_write_through_a_channel() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server.context_builder().start().await.unwrap();

    let channel = context.get_channel("TEST:COUNT").await.unwrap();
    let info = channel
        .wait_for_connection(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(info.native_type, DbrBasicType::Long);
    assert_eq!(info.native_count, 1);
    assert_eq!(info.server, server.tcp_address);
    assert_eq!(channel.state(), ChannelState::Connected);

    let value = channel.read(None, None).await.unwrap();
    assert_eq!(value.data_type(), DbrType::new(DbrBasicType::Long, DbrCategory::Time));
    assert_eq!(value.value(), &DbrValue::Long(vec![42]));
    assert!(value.timestamp().is_some());

    let as_double = channel
        .read(Some(DbrType::new(DbrBasicType::Double, DbrCategory::Basic)), None)
        .await
        .unwrap();
    assert_eq!(as_double.value(), &DbrValue::Double(vec![42.0]));

    channel.write(7i32, None).await.unwrap();
    assert_eq!(
        channel.read(None, None).await.unwrap().value(),
        &DbrValue::Long(vec![7])
    );
    // Converted to the native type on the serving side
    channel.write(12.0f64, None).await.unwrap();
    assert_eq!(
        server.group.read("TEST:COUNT").unwrap().value(),
        &DbrValue::Long(vec![12])
    );

    context.shutdown();
}

#[tokio::test]
async fn server_refusals_surface_as_errors() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server.context_builder().start().await.unwrap();

    let serial = context.get_channel("TEST:SERIAL").await.unwrap();
    assert_eq!(
        serial.read(None, None).await.unwrap().value(),
        &DbrValue::String(vec!["SN-0042".into()])
    );
    let result = serial.write("SN-9999", None).await;
    assert!(
        matches!(result, Err(ClientError::Server(ErrorCondition::NoWtAccess))),
        "Unexpected write result: {result:?}"
    );

    // Strings do not convert to a number
    let count = context.get_channel("TEST:COUNT").await.unwrap();
    let result = count
        .read(Some(DbrType::new(DbrBasicType::String, DbrCategory::Basic)), None)
        .await;
    assert!(result.is_ok(), "Numbers should read as strings: {result:?}");
    let result = count.write("not a number", None).await;
    assert!(
        matches!(result, Err(ClientError::Server(ErrorCondition::NoConvert))),
        "Unexpected write result: {result:?}"
    );
    context.shutdown();
}

#[tokio::test]
async fn unknown_names_never_connect() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server.context_builder().start().await.unwrap();

    let channel = context.get_channel("TEST:MISSING").await.unwrap();
    let result = channel.read(None, Some(Duration::from_millis(300))).await;
    assert!(
        matches!(result, Err(ClientError::ConnectTimeout(ref name)) if name == "TEST:MISSING"),
        "Unexpected read result: {result:?}"
    );
    assert_eq!(channel.state(), ChannelState::Searching);
    context.shutdown();
}

#[tokio::test]
async fn channels_are_shared_per_name() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server.context_builder().start().await.unwrap();

    let first = context.get_channel("TEST:COUNT").await.unwrap();
    let second = context.get_channel("TEST:COUNT").await.unwrap();
    let other = context.get_channel("TEST:GAIN").await.unwrap();
    first.wait_for_connection(None).await.unwrap();
    second.wait_for_connection(None).await.unwrap();
    other.wait_for_connection(None).await.unwrap();

    // Every channel to one server goes over the same circuit
    let circuits = context.circuits().await.unwrap();
    assert_eq!(circuits.len(), 1, "{circuits:?}");
    assert_eq!(circuits[0].0.address, server.tcp_address);
    assert_eq!(circuits[0].1, CircuitState::Connected);

    let creates = server
        .received()
        .into_iter()
        .filter(|r| matches!(&r.message, Message::CreateChannel(c) if c.channel_name == "TEST:COUNT"))
        .count();
    assert_eq!(creates, 1);
    context.shutdown();
}

#[tokio::test]
async fn subscriptions_deliver_updates() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server.context_builder().start().await.unwrap();
    let channel = context.get_channel("TEST:GAIN").await.unwrap();

    let (callback, mut events) = collector();
    let subscription = channel
        .subscribe(None, MonitorMask::default(), DeliveryMode::Lossless, callback)
        .await
        .unwrap();
    expect_value(&mut events, &DbrValue::Double(vec![1.5])).await;

    server.group.store("TEST:GAIN", 2.5f64).unwrap();
    expect_value(&mut events, &DbrValue::Double(vec![2.5])).await;

    subscription.unsubscribe().await.unwrap();
    assert!(
        server
            .wait_for(
                |r| matches!(r.message, Message::EventCancel(_)),
                Duration::from_secs(2)
            )
            .await
    );
    server.group.store("TEST:GAIN", 3.5f64).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        events.try_recv().is_err(),
        "Nothing should arrive after unsubscribing"
    );
    context.shutdown();
}

#[tokio::test]
async fn pending_reads_fail_when_the_circuit_drops() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server.context_builder().start().await.unwrap();
    let channel = context.get_channel("TEST:COUNT").await.unwrap();
    channel.wait_for_connection(None).await.unwrap();
    let mut connection_events = channel.connection_events();

    server.ignore_reads("TEST:COUNT");
    let reader = channel.clone();
    let read = tokio::spawn(async move { reader.read(None, Some(Duration::from_secs(10))).await });
    assert!(
        server
            .wait_for(
                |r| matches!(r.message, Message::ReadNotify(_)),
                Duration::from_secs(2)
            )
            .await
    );

    server.kill_connections();
    let result = tokio::time::timeout(Duration::from_secs(2), read)
        .await
        .expect("Read was not failed promptly")
        .unwrap();
    assert!(
        matches!(result, Err(ClientError::Disconnected)),
        "Unexpected read result: {result:?}"
    );

    // The circuit comes back on its own
    channel
        .wait_for_connection(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut disconnects = 0;
    let mut reconnects = 0;
    while let Ok(event) = connection_events.try_recv() {
        match event {
            ConnectionEvent::Disconnected => disconnects += 1,
            ConnectionEvent::Connected(_) => reconnects += 1,
            _ => {}
        }
    }
    assert_eq!(disconnects, 1);
    assert_eq!(reconnects, 1);
    context.shutdown();
}

#[tokio::test]
async fn subscriptions_restart_paced_after_reconnect() {
    init_logging();
    let period = Duration::from_millis(200);
    let server = TestServer::start(test_group()).await;
    let context = server
        .context_builder()
        .restart_subs_period(period)
        .start()
        .await
        .unwrap();

    let mut streams = Vec::new();
    let mut subscriptions = Vec::new();
    for name in ["TEST:COUNT", "TEST:GAIN", "TEST:OFFSET"] {
        let channel = context.get_channel(name).await.unwrap();
        let (callback, events) = collector();
        subscriptions.push(
            channel
                .subscribe(None, MonitorMask::default(), DeliveryMode::Lossless, callback)
                .await
                .unwrap(),
        );
        streams.push(events);
    }
    expect_value(&mut streams[0], &DbrValue::Long(vec![42])).await;

    server.kill_connections();
    let restarted = server
        .wait_for(
            |r| r.connection == 2 && matches!(r.message, Message::EventAdd(_)),
            Duration::from_secs(5),
        )
        .await;
    assert!(restarted);
    tokio::time::sleep(period * 4).await;

    let restarts: Vec<_> = server
        .received()
        .into_iter()
        .filter(|r| r.connection == 2 && matches!(r.message, Message::EventAdd(_)))
        .map(|r| r.at)
        .collect();
    assert_eq!(restarts.len(), 3);
    for pair in restarts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= period.mul_f64(0.8),
            "Restarts only {gap:?} apart"
        );
    }

    // And the restarted subscriptions are live
    server.group.store("TEST:OFFSET", 5i16).unwrap();
    expect_value(&mut streams[2], &DbrValue::Int(vec![5])).await;
    context.shutdown();
}

#[tokio::test]
async fn unreachable_servers_leave_the_registry() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server
        .context_builder()
        .min_retry_search_interval(Duration::from_millis(50))
        .max_retry_search_interval(Duration::from_millis(200))
        .circuit_death_attempts(3)
        .start()
        .await
        .unwrap();
    let channel = context.get_channel("TEST:COUNT").await.unwrap();
    channel.wait_for_connection(None).await.unwrap();
    assert_eq!(context.circuits().await.unwrap().len(), 1);

    server.stop_listening();
    let removed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if context.circuits().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(removed.is_ok(), "Dead circuit was never removed");

    // The channel went back to searching and no circuit is revived behind it
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(context.circuits().await.unwrap().is_empty());
    assert!(matches!(
        channel.state(),
        ChannelState::Searching | ChannelState::Disconnected
    ));
    context.shutdown();
}

#[tokio::test]
async fn closed_channels_and_contexts_refuse_work() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server.context_builder().start().await.unwrap();

    let channel = context.get_channel("TEST:COUNT").await.unwrap();
    channel.wait_for_connection(None).await.unwrap();
    channel.close().await;
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Closed);
    let result = channel.read(None, None).await;
    assert!(matches!(result, Err(ClientError::ChannelClosed)), "{result:?}");
    assert!(
        server
            .wait_for(
                |r| matches!(r.message, Message::ClearChannel(_)),
                Duration::from_secs(2)
            )
            .await
    );

    let other = context.get_channel("TEST:GAIN").await.unwrap();
    other.wait_for_connection(None).await.unwrap();
    context.shutdown();
    assert!(context.is_shut_down());
    let result = other.read(None, None).await;
    assert!(
        matches!(result, Err(ClientError::ContextDisconnected)),
        "{result:?}"
    );
    assert!(matches!(
        context.get_channel("TEST:GAIN").await,
        Err(ClientError::ContextDisconnected)
    ));
}

#[tokio::test]
async fn handles_keep_their_own_default_timeout() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server.context_builder().start().await.unwrap();

    let short = context
        .get_channel_with(
            "TEST:MISSING",
            ChannelSettings {
                default_timeout: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let long = context
        .get_channel_with(
            "TEST:MISSING",
            ChannelSettings {
                default_timeout: Some(Duration::from_millis(800)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let start = Instant::now();
    let result = short.read(None, None).await;
    let elapsed = start.elapsed();
    assert!(matches!(result, Err(ClientError::ConnectTimeout(_))), "{result:?}");
    assert!(elapsed < Duration::from_millis(600), "Short handle waited {elapsed:?}");

    let start = Instant::now();
    let result = long.read(None, None).await;
    let elapsed = start.elapsed();
    assert!(matches!(result, Err(ClientError::ConnectTimeout(_))), "{result:?}");
    assert!(elapsed >= Duration::from_millis(700), "Long handle waited {elapsed:?}");

    assert_eq!(short.state(), ChannelState::Searching);
    assert_eq!(long.state(), ChannelState::Searching);
    context.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_callbacks_coalesce_scalar_updates() {
    init_logging();
    let server = TestServer::start(test_group()).await;
    let context = server.context_builder().start().await.unwrap();
    let channel = context.get_channel("TEST:GAIN").await.unwrap();

    let (tx, mut events) = mpsc::unbounded_channel();
    let first = Arc::new(AtomicBool::new(true));
    let callback = move |batch: Vec<Dbr>| {
        for event in batch {
            let _ = tx.send(event);
        }
        // Hold up delivery while updates pile up behind the first event
        if first.swap(false, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(300));
        }
    };
    let subscription = channel
        .subscribe(None, MonitorMask::default(), DeliveryMode::Coalesce, callback)
        .await
        .unwrap();
    expect_value(&mut events, &DbrValue::Double(vec![1.5])).await;

    for i in 1..=10 {
        server.group.store("TEST:GAIN", i as f64 * 10.0).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    expect_value(&mut events, &DbrValue::Double(vec![100.0])).await;
    assert!(
        subscription.dropped_events() > 0,
        "Every update was delivered to a blocked callback"
    );

    subscription.unsubscribe().await.unwrap();
    context.shutdown();
}

#[tokio::test]
async fn reads_time_out_when_the_server_stops_reading() {
    init_logging();
    let group = PvGroupBuilder::new("BULK:")
        .add("WAVE", vec![0.0f64; 100_000])
        .build()
        .unwrap();
    let server = TestServer::start(group).await;
    server.stall_after_create("BULK:WAVE");
    let context = server.context_builder().start().await.unwrap();
    let channel = context.get_channel("BULK:WAVE").await.unwrap();
    channel
        .wait_for_connection(Some(Duration::from_secs(5)))
        .await
        .unwrap();

    // Far more than the socket buffers hold, with nobody draining them
    let writer = channel.clone();
    let flood = tokio::spawn(async move {
        for _ in 0..64 {
            if writer.write_no_wait(vec![1.0f64; 100_000]).await.is_err() {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        channel.read(None, Some(Duration::from_millis(500))),
    )
    .await
    .expect("Read never timed out");
    assert!(
        matches!(result, Err(ClientError::ChannelReadError)),
        "Unexpected read result: {result:?}"
    );
    assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());

    // The rest of the context is still responsive
    let circuits = tokio::time::timeout(Duration::from_secs(1), context.circuits())
        .await
        .expect("Context stuck behind the circuit")
        .unwrap();
    assert_eq!(circuits.len(), 1);

    flood.abort();
    context.shutdown();
}
