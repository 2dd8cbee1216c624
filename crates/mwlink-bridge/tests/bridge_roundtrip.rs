//! End-to-end bridge tests over a socket-pair "serial port" and a
//! loopback TCP "session manager".

#![cfg(unix)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::BytesMut;
use mwlink_bridge::{BridgeConfig, LinkBridge};
use mwlink_frame::{
    encode_envelope_frame, encode_link_frame, Direction, EnvelopeDecoder, EnvelopeFrame,
    LinkDecoder, LinkFrame,
};
use mwlink_transport::Redial;

/// The device side of the fake serial link.
struct FakeDevice {
    stream: UnixStream,
    decoder: LinkDecoder,
}

impl FakeDevice {
    fn new(stream: UnixStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout should apply");
        Self {
            stream,
            decoder: LinkDecoder::new(Direction::Request),
        }
    }

    fn next_request(&mut self) -> LinkFrame {
        let mut chunk = [0u8; 512];
        loop {
            if let Some(frame) = self.decoder.decode() {
                return frame;
            }
            let n = self
                .stream
                .read(&mut chunk)
                .expect("device should receive a link frame");
            assert!(n > 0, "bridge closed the serial link");
            self.decoder.extend(&chunk[..n]);
        }
    }

    fn respond(&mut self, code: u8, payload: &[u8]) {
        let mut wire = BytesMut::new();
        encode_link_frame(Direction::Response, code, payload, &mut wire)
            .expect("payload should fit");
        self.stream
            .write_all(&wire)
            .expect("device should write the response");
    }
}

/// The session-manager side of the network link.
struct FakeServer {
    stream: TcpStream,
    decoder: EnvelopeDecoder,
}

impl FakeServer {
    fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().expect("bridge should connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout should apply");
        Self {
            stream,
            decoder: EnvelopeDecoder::new(Direction::Response),
        }
    }

    fn request(&mut self, id: u8, code: u8, priority: bool, payload: &[u8]) {
        let mut wire = BytesMut::new();
        encode_envelope_frame(Direction::Request, id, code, priority, payload, &mut wire)
            .expect("payload should fit");
        self.stream
            .write_all(&wire)
            .expect("server should write the request");
    }

    fn next_response(&mut self) -> EnvelopeFrame {
        let mut chunk = [0u8; 512];
        loop {
            if let Some(frame) = self.decoder.decode() {
                return frame;
            }
            let n = self
                .stream
                .read(&mut chunk)
                .expect("server should receive a response envelope");
            assert!(n > 0, "bridge closed the network link");
            self.decoder.extend(&chunk[..n]);
        }
    }
}

fn start_bridge(config: BridgeConfig) -> (LinkBridge, FakeDevice, TcpListener) {
    let (bridge_side, device_side) = UnixStream::pair().expect("socket pair should open");
    let serial_reader = bridge_side
        .try_clone()
        .expect("serial half should clone");

    let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an addr");
    let redial = Redial::new(addr.to_string(), Duration::from_millis(20));

    let bridge = LinkBridge::start(serial_reader, bridge_side, redial, config);
    (bridge, FakeDevice::new(device_side), listener)
}

#[test]
fn request_roundtrip_tags_response_with_original_id() {
    let (_bridge, mut device, listener) = start_bridge(BridgeConfig::default());
    let mut server = FakeServer::accept(&listener);

    server.request(7, 101, false, b"");

    let request = device.next_request();
    assert_eq!(request.code, 101);
    assert!(request.payload.is_empty());

    device.respond(101, b"status-data");

    let response = server.next_response();
    assert_eq!(response.id, 7);
    assert_eq!(response.code, 101);
    assert_eq!(response.payload.as_ref(), b"status-data");
}

#[test]
fn advance_timer_reclaims_a_silent_device_slot() {
    let config = BridgeConfig {
        advance_timeout: Duration::from_millis(150),
        ..BridgeConfig::default()
    };
    let (_bridge, mut device, listener) = start_bridge(config);
    let mut server = FakeServer::accept(&listener);

    server.request(1, 101, false, b"");
    server.request(2, 102, false, b"");

    let first = device.next_request();
    assert_eq!(first.code, 101);
    // Stay silent; the advance timer must clear the slot.

    let second = device.next_request();
    assert_eq!(second.code, 102);
    device.respond(102, b"late-but-answered");

    // Nothing was forwarded for the abandoned request.
    let response = server.next_response();
    assert_eq!(response.id, 2);
    assert_eq!(response.payload.as_ref(), b"late-but-answered");
}

#[test]
fn priority_requests_jump_the_backlog() {
    let config = BridgeConfig {
        advance_timeout: Duration::from_millis(200),
        ..BridgeConfig::default()
    };
    let (_bridge, mut device, listener) = start_bridge(config);
    let mut server = FakeServer::accept(&listener);

    // The first request occupies the slot while the rest queue up.
    server.request(1, 101, false, b"");
    let first = device.next_request();
    assert_eq!(first.code, 101);

    server.request(2, 102, false, b"");
    server.request(3, 103, false, b"");
    server.request(4, 200, true, b"\x01");

    // Let the advance timer expire the silent first request, then answer
    // everything else as it arrives.
    let mut served = Vec::new();
    for _ in 0..3 {
        let request = device.next_request();
        served.push(request.code);
        device.respond(request.code, b"ok");
    }
    assert_eq!(served, vec![200, 102, 103]);
}

#[test]
fn unsolicited_serial_frames_are_discarded() {
    let (_bridge, mut device, listener) = start_bridge(BridgeConfig::default());
    let mut server = FakeServer::accept(&listener);

    device.respond(110, b"nobody asked");

    server.request(9, 105, false, b"");
    let request = device.next_request();
    assert_eq!(request.code, 105);
    device.respond(105, b"rc-frame");

    let response = server.next_response();
    assert_eq!(response.id, 9, "the stray frame must not reach the network");
    assert_eq!(response.payload.as_ref(), b"rc-frame");
}

#[test]
fn bridge_redials_after_the_server_drops_the_connection() {
    let (_bridge, mut device, listener) = start_bridge(BridgeConfig {
        advance_timeout: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(20),
    });

    let server = FakeServer::accept(&listener);
    drop(server);

    let mut server = FakeServer::accept(&listener);
    server.request(3, 108, false, b"");

    let request = device.next_request();
    assert_eq!(request.code, 108);
    device.respond(108, b"attitude");

    let response = server.next_response();
    assert_eq!(response.id, 3);
    assert_eq!(response.payload.as_ref(), b"attitude");
}
