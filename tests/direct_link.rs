mod common;

use std::time::Duration;

use tokio::time::Instant;

use itr90_rs::codec::encode_frame;
use itr90_rs::errors::DriverError;
use itr90_rs::transport::{event_channel, ConnectionState, DirectLink, DirectLinkConfig, LinkEvent};
use itr90_rs::Command;

use common::{
    count_errors, drain, events_until, next_event, readings, FlappingOpener, ScriptedOpener, Step,
};

fn config(grace_ms: u64, retry_ms: u64) -> DirectLinkConfig {
    DirectLinkConfig {
        grace_window: Duration::from_millis(grace_ms),
        retry_interval: Duration::from_millis(retry_ms),
        ..DirectLinkConfig::default()
    }
}

#[tokio::test]
async fn readings_flow_across_split_chunks() {
    let a = encode_frame(0, 0, 0x60, 0x00, 0x14, 10);
    let b = encode_frame(0x10, 0, 0x70, 0x40, 0x14, 10);
    let mut first = a.to_vec();
    first.extend_from_slice(&b[..4]);

    let opener = ScriptedOpener::new(vec![Some(vec![
        Step::Bytes(first),
        Step::Bytes(b[4..].to_vec()),
    ])]);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(1000, 50), opener.clone(), tx);

    link.connect().await.expect("connect");
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connected);
    assert_eq!(link.state(), ConnectionState::Connected);

    let events = events_until(&mut rx, |e| matches!(e, LinkEvent::Reading(r) if r.raw == b)).await;
    assert_eq!(readings(&events), vec![a, b]);

    link.disconnect().await;
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn send_writes_command_bytes() {
    let opener = ScriptedOpener::new(vec![Some(vec![])]);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(1000, 50), opener.clone(), tx);
    link.connect().await.expect("connect");

    link.send(Command::SET_TORR.as_bytes()).await.expect("send");
    assert_eq!(opener.written.bytes(), vec![3, 16, 62, 1, 79]);

    let events =
        events_until(&mut rx, |e| matches!(e, LinkEvent::Log(m) if m.starts_with("sent"))).await;
    assert_eq!(
        events.last(),
        Some(&LinkEvent::Log("sent [3, 16, 62, 1, 79]".into()))
    );

    link.disconnect().await;
}

#[tokio::test]
async fn malformed_command_is_rejected_without_writing() {
    let opener = ScriptedOpener::new(vec![Some(vec![])]);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(1000, 50), opener.clone(), tx);
    link.connect().await.expect("connect");

    let err = link.send(&[3, 16, 62]).await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidCommand(_)));
    assert!(link.send(&[]).await.is_err());
    assert!(opener.written.bytes().is_empty());
    assert_eq!(link.state(), ConnectionState::Connected);

    let events = events_until(&mut rx, |e| matches!(e, LinkEvent::Error(_))).await;
    assert_eq!(count_errors(&events), 1);

    link.disconnect().await;
}

#[tokio::test]
async fn send_while_disconnected_reports_error() {
    let opener = ScriptedOpener::new(vec![]);
    let (tx, mut rx) = event_channel();
    let link = DirectLink::with_opener(config(1000, 50), opener.clone(), tx);

    let err = link.send(Command::DEGAS_ON.as_bytes()).await.unwrap_err();
    assert!(matches!(err, DriverError::NotConnected));
    assert!(matches!(next_event(&mut rx).await, LinkEvent::Error(_)));
    assert_eq!(opener.opens(), 0);
}

#[tokio::test]
async fn failed_open_is_reported_once() {
    let opener = ScriptedOpener::new(vec![]);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(200, 50), opener.clone(), tx);

    assert!(link.connect().await.is_err());
    assert_eq!(link.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let events = drain(&mut rx);
    assert_eq!(count_errors(&events), 1);
    assert!(!events.contains(&LinkEvent::Connected));
    assert_eq!(opener.opens(), 1);
}

#[tokio::test]
async fn transient_failures_recover_inside_grace_window() {
    let a = encode_frame(0, 0, 0x60, 0x00, 0x14, 10);
    let stale = encode_frame(0, 0, 0x80, 0x00, 0x14, 10);
    let b = encode_frame(0, 0, 0x90, 0x00, 0x14, 10);

    let mut before = a.to_vec();
    before.extend_from_slice(&stale[..5]);
    let mut after = stale[5..].to_vec();
    after.extend_from_slice(&b);

    // fails four times, then the device comes back
    let opener = ScriptedOpener::new(vec![
        Some(vec![Step::Bytes(before), Step::Fail]),
        None,
        None,
        None,
        None,
        Some(vec![Step::Bytes(after)]),
    ]);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(1000, 50), opener.clone(), tx);
    link.connect().await.expect("connect");

    let events = events_until(&mut rx, |e| matches!(e, LinkEvent::Reading(r) if r.raw == b)).await;

    // the half frame from before the failure is discarded, not stitched
    assert_eq!(readings(&events), vec![a, b]);
    assert_eq!(count_errors(&events), 0);
    assert!(!events.contains(&LinkEvent::Disconnected));
    assert!(events
        .iter()
        .any(|e| matches!(e, LinkEvent::Log(m) if m.contains("reacquired after 5 attempt"))));
    assert_eq!(opener.opens(), 6);
    assert_eq!(link.state(), ConnectionState::Connected);

    link.disconnect().await;
}

#[tokio::test]
async fn exhausted_grace_window_reports_one_error_then_disconnects() {
    let opener = ScriptedOpener::new(vec![Some(vec![Step::Fail])]);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(200, 50), opener.clone(), tx);
    link.connect().await.expect("connect");

    let events = events_until(&mut rx, |e| *e == LinkEvent::Disconnected).await;
    assert_eq!(count_errors(&events), 1);
    let error_at = events
        .iter()
        .position(|e| matches!(e, LinkEvent::Error(_)))
        .expect("error event");
    assert_eq!(error_at, events.len() - 2);
    assert_eq!(link.state(), ConnectionState::Disconnected);

    // no more attempts once the link is declared lost
    let opens = opener.opens();
    assert!(opens >= 4, "only {opens} open attempts");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(opener.opens(), opens);
    assert_eq!(count_errors(&drain(&mut rx)), 0);

    assert!(matches!(
        link.send(Command::SET_MBAR.as_bytes()).await,
        Err(DriverError::NotConnected)
    ));
}

#[tokio::test]
async fn disconnect_during_grace_window_stops_retrying() {
    let opener = ScriptedOpener::new(vec![Some(vec![Step::Fail])]);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(5000, 30), opener.clone(), tx);
    link.connect().await.expect("connect");

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(link.state(), ConnectionState::Connecting);

    link.disconnect().await;
    assert_eq!(link.state(), ConnectionState::Disconnected);
    let opens = opener.opens();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(opener.opens(), opens);

    let events = drain(&mut rx);
    assert_eq!(count_errors(&events), 0);
    assert_eq!(
        events.iter().filter(|e| **e == LinkEvent::Disconnected).count(),
        1
    );
}

#[tokio::test]
async fn end_of_stream_disconnects_without_error() {
    let opener = ScriptedOpener::new(vec![Some(vec![Step::Eof])]);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(1000, 50), opener.clone(), tx);
    link.connect().await.expect("connect");

    let events = events_until(&mut rx, |e| *e == LinkEvent::Disconnected).await;
    assert_eq!(count_errors(&events), 0);
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(opener.opens(), 1);
}

#[tokio::test]
async fn disconnect_twice_and_reconnect() {
    let opener = ScriptedOpener::new(vec![Some(vec![]), Some(vec![])]);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(1000, 50), opener.clone(), tx);

    link.disconnect().await;
    link.connect().await.expect("connect");
    assert!(matches!(
        link.connect().await,
        Err(DriverError::AlreadyActive(_))
    ));

    link.disconnect().await;
    link.disconnect().await;
    let events = drain(&mut rx);
    assert_eq!(
        events.iter().filter(|e| **e == LinkEvent::Disconnected).count(),
        1
    );

    link.connect().await.expect("second connect");
    assert_eq!(link.state(), ConnectionState::Connected);
    assert_eq!(opener.opens(), 2);
    link.disconnect().await;
}

#[tokio::test]
async fn each_reacquisition_restarts_the_grace_window() {
    let frame = encode_frame(0, 0, 0x60, 0x00, 0x14, 10);

    // two outages of ~250 ms each; together they outlast the 400 ms window
    let mut sessions = vec![Some(vec![Step::Fail])];
    sessions.extend([None, None, None, None]);
    sessions.push(Some(vec![Step::Fail]));
    sessions.extend([None, None, None, None]);
    sessions.push(Some(vec![Step::Bytes(frame.to_vec())]));

    let opener = ScriptedOpener::new(sessions);
    let (tx, mut rx) = event_channel();
    let mut link = DirectLink::with_opener(config(400, 50), opener.clone(), tx);
    link.connect().await.expect("connect");

    let events = events_until(&mut rx, |e| matches!(e, LinkEvent::Reading(_))).await;
    assert_eq!(count_errors(&events), 0);
    assert!(!events.contains(&LinkEvent::Disconnected));
    let recoveries = events
        .iter()
        .filter(|e| matches!(e, LinkEvent::Log(m) if m.starts_with("link reacquired")))
        .count();
    assert_eq!(recoveries, 2);
    assert_eq!(opener.opens(), 11);
    assert_eq!(link.state(), ConnectionState::Connected);

    link.disconnect().await;
}

#[tokio::test]
async fn disconnect_releases_link_while_it_keeps_flapping() {
    let opener = FlappingOpener::new();
    let (tx, _rx) = event_channel();
    let mut link = DirectLink::with_opener(config(5000, 2), opener.clone(), tx);
    link.connect().await.expect("connect");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(opener.opens() > 2);
    link.disconnect().await;

    // opens still running on the blocking pool drop their halves
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(opener.written.live_writers(), 0);
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn slow_write_does_not_stall_other_tasks() {
    let opener = ScriptedOpener::with_write_delay(vec![Some(vec![])], Duration::from_millis(200));
    let (tx, _rx) = event_channel();
    let mut link = DirectLink::with_opener(config(1000, 50), opener.clone(), tx);
    link.connect().await.expect("connect");

    let ticker = tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Instant::now()
    });
    link.send(Command::SET_PA.as_bytes()).await.expect("send");
    let sent_at = Instant::now();
    let ticked_at = ticker.await.unwrap();

    assert!(ticked_at + Duration::from_millis(100) < sent_at);
    assert_eq!(opener.written.bytes(), vec![3, 16, 62, 2, 80]);

    link.disconnect().await;
}
