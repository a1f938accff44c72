//! Zone and multicast uris played end to end

mod common;

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{FakeSender, RecordingDriver, LOOPBACK};
use ohm_receiver::protocol::ZoneMsg;
use ohm_receiver::{Error, PlayMode, Receiver, TransportState};

#[test]
fn test_unanswered_zone_keeps_waiting() {
    let driver = Arc::new(RecordingDriver::default());
    let receiver = Receiver::new(LOOPBACK, 1, driver.clone()).unwrap();

    receiver.play("ohz://239.255.255.250:51999/kitchen").unwrap();
    assert_eq!(receiver.play_mode(), PlayMode::Null(Some("kitchen".into())));
    assert!(driver.wait_until(|d| d.states() == vec![TransportState::Waiting]));

    // outlast the whole query budget
    thread::sleep(Duration::from_millis(1300));
    assert_eq!(receiver.transport_state(), TransportState::Waiting);
    assert_eq!(receiver.zone(), Some(("kitchen".to_string(), None)));
    assert_eq!(receiver.multicast_stats().resend_requests, 0);
    assert_eq!(receiver.unicast_stats().resend_requests, 0);
    assert!(driver.frames().is_empty());

    receiver.stop();
    assert_eq!(receiver.transport_state(), TransportState::Stopped);
    assert_eq!(receiver.zone(), None);
}

#[test]
fn test_stream_uri_replaces_zone() {
    let driver = Arc::new(RecordingDriver::default());
    let sender = FakeSender::bind();
    let receiver = Receiver::new(LOOPBACK, 1, driver.clone()).unwrap();

    receiver.play("ohz://239.255.255.250:51998/den").unwrap();
    assert!(driver.wait_until(|d| d.states() == vec![TransportState::Waiting]));

    receiver.play(&sender.uri()).unwrap();
    assert_eq!(receiver.zone(), None);
    assert_eq!(receiver.play_mode(), PlayMode::Unicast(sender.endpoint()));
    sender.accept();
    assert!(driver.wait_until(|d| d.states()
        == vec![
            TransportState::Waiting,
            TransportState::Stopped,
            TransportState::Buffering
        ]));
}

#[test]
fn test_multicast_uri_selects_multicast() {
    let driver = Arc::new(RecordingDriver::default());
    let receiver = Receiver::new(LOOPBACK, 1, driver.clone()).unwrap();
    let group = SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 1), 51990);

    match receiver.play(&format!("ohm://{}", group)) {
        Ok(()) => {
            assert_eq!(receiver.play_mode(), PlayMode::Multicast(group));
            assert!(driver.wait_until(|d| d.states() == vec![TransportState::Buffering]));
            receiver.stop();
            assert_eq!(receiver.transport_state(), TransportState::Stopped);
        }
        // hosts without multicast on loopback cannot join; the receiver stays idle
        Err(Error::Network(_)) => {
            assert_eq!(receiver.play_mode(), PlayMode::None);
            assert_eq!(receiver.transport_state(), TransportState::Stopped);
        }
        Err(e) => panic!("unexpected error: {}", e),
    }
}

#[test]
#[ignore = "needs multicast routing on the default interface"]
fn test_zone_announcement_switches_to_sender() {
    let driver = Arc::new(RecordingDriver::default());
    let sender = FakeSender::bind();
    let receiver = Receiver::new(Ipv4Addr::UNSPECIFIED, 1, driver.clone()).unwrap();
    let group = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 51997);

    receiver.play(&format!("ohz://{}/office", group)).unwrap();
    assert!(driver.wait_until(|d| d.states() == vec![TransportState::Waiting]));

    let announcer = UdpSocket::bind("0.0.0.0:0").unwrap();
    announcer.set_multicast_loop_v4(true).unwrap();
    let announcement = ZoneMsg::Uri {
        zone: "office".into(),
        uri: sender.uri(),
    }
    .encode()
    .unwrap();
    announcer.send_to(&announcement, group).unwrap();

    let peer = sender.accept();
    assert_eq!(receiver.play_mode(), PlayMode::Unicast(sender.endpoint()));
    assert_eq!(receiver.zone(), Some(("office".to_string(), Some(sender.uri()))));

    sender.send_audio(peer, 1, 0);
    sender.send_audio(peer, 2, 0);
    assert!(driver.wait_until(|d| d.states().last() == Some(&TransportState::Playing)));
}
