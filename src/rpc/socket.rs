//! UDP socket wrapper that correlates requests with responses by
//! transaction id, retransmits on timeout and keeps traffic counters.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::messages::{
    ErrorSpecific, Message, MessageType, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
};
use crate::core::config::Config;
use crate::core::statistics::{MessageCounters, MessageKind};

const VERSION: [u8; 4] = [107, 97, 0, 1]; // "ka" 0.1
const MTU: usize = 2048;

/// How long [KrpcSocket::recv_from] blocks before giving the actor loop a
/// chance to run queries and maintenance.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct InflightRequest {
    tid: u16,
    to: SocketAddrV4,
    sent_at: Instant,
    /// Transmissions so far, the initial send included.
    attempts: u8,
    request: RequestSpecific,
}

#[derive(Debug)]
pub struct KrpcSocket {
    next_tid: u16,
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    request_timeout: Duration,
    max_retries: u8,
    inflight_requests: Vec<InflightRequest>,
    pub counters: MessageCounters,
}

impl KrpcSocket {
    pub fn new(config: &Config) -> Result<Self, std::io::Error> {
        let socket = match config.port {
            Some(port) => UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?,
            None => UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?,
        };

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
        };

        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        Ok(Self {
            next_tid: 0,
            socket,
            local_addr,
            request_timeout: config.request_timeout,
            max_retries: config.max_retries,
            inflight_requests: Vec::new(),
            counters: MessageCounters::default(),
        })
    }

    // === Getters ===

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Send a request and track it until a response arrives or all
    /// retransmissions are exhausted. Returns the transaction id.
    pub fn request(&mut self, address: SocketAddrV4, request: RequestSpecific) -> u16 {
        let tid = self.tid();
        let message = self.request_message(tid, request.clone());

        self.counters.record_sent(request_kind(&request));
        self.inflight_requests.push(InflightRequest {
            tid,
            to: address,
            sent_at: Instant::now(),
            attempts: 1,
            request,
        });

        trace!(context = "socket_message_sending", message = ?message);
        self.send(address, &message);

        tid
    }

    /// Send a response to a request we received.
    pub fn response(&mut self, address: SocketAddrV4, transaction_id: u16, response: ResponseSpecific) {
        let message = Message {
            transaction_id,
            version: Some(VERSION),
            message_type: MessageType::Response(response),
        };

        self.counters.record_sent(MessageKind::Response);

        trace!(context = "socket_message_sending", message = ?message);
        self.send(address, &message);
    }

    /// Send an error to a request we received.
    pub fn error(&mut self, address: SocketAddrV4, transaction_id: u16, error: ErrorSpecific) {
        let message = Message {
            transaction_id,
            version: Some(VERSION),
            message_type: MessageType::Error(error),
        };

        self.counters.record_sent(MessageKind::Response);

        trace!(context = "socket_message_sending", message = ?message);
        self.send(address, &message);
    }

    /// Retransmit timed out requests that still have retries left, and
    /// return the ones that exhausted all their attempts.
    pub fn tick(&mut self) -> Vec<(u16, RequestSpecific, SocketAddrV4)> {
        let now = Instant::now();
        let timeout = self.request_timeout;
        let max_attempts = 1 + self.max_retries;

        let mut resend = Vec::new();
        let mut expired = Vec::new();

        self.inflight_requests.retain_mut(|inflight| {
            if now.duration_since(inflight.sent_at) < timeout {
                return true;
            }

            if inflight.attempts < max_attempts {
                inflight.attempts += 1;
                inflight.sent_at = now;
                resend.push((inflight.tid, inflight.to, inflight.request.clone()));

                true
            } else {
                expired.push((inflight.tid, inflight.request.clone(), inflight.to));

                false
            }
        });

        for (tid, to, request) in resend {
            debug!(?tid, address = ?to, "Retransmitting timed out request");

            self.counters.record_sent(request_kind(&request));
            let message = self.request_message(tid, request);
            self.send(to, &message);
        }

        for (tid, request, to) in &expired {
            debug!(?tid, address = ?to, "Request failed after all retries");

            self.counters.record_failed(request_kind(request));
        }

        expired
    }

    /// Receive one packet if any is pending, blocking for at most
    /// [READ_TIMEOUT].
    ///
    /// Responses and errors are only returned when they match an inflight
    /// request's transaction id and origin address; everything else from
    /// unexpected senders is dropped.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0_u8; MTU];

        let (amt, from) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(_) => return None,
        };

        let from = match from {
            SocketAddr::V4(addr) if addr.port() != 0 => addr,
            _ => return None,
        };

        let message = match Message::from_bytes(&buf[..amt]) {
            Ok(message) => message,
            Err(error) => {
                debug!(?error, ?from, "Received invalid packet");
                return None;
            }
        };

        trace!(context = "socket_message_receiving", ?message, ?from);

        match &message.message_type {
            MessageType::Request(request) => {
                self.counters.record_received(request_kind(request));
            }
            MessageType::Response(_) | MessageType::Error(_) => {
                let position = self.inflight_requests.iter().position(|inflight| {
                    inflight.tid == message.transaction_id && inflight.to == from
                })?;

                self.inflight_requests.remove(position);
                self.counters.record_received(MessageKind::Response);
            }
        }

        Some((message, from))
    }

    // === Private Methods ===

    fn tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);

        tid
    }

    fn request_message(&self, transaction_id: u16, request: RequestSpecific) -> Message {
        Message {
            transaction_id,
            version: Some(VERSION),
            message_type: MessageType::Request(request),
        }
    }

    fn send(&self, address: SocketAddrV4, message: &Message) {
        match message.to_bytes() {
            Ok(bytes) => {
                if let Err(error) = self.socket.send_to(&bytes, address) {
                    debug!(?error, ?address, "Failed to send message");
                }
            }
            Err(error) => {
                debug!(?error, "Failed to encode message");
            }
        }
    }
}

pub fn request_kind(request: &RequestSpecific) -> MessageKind {
    match request.request_type {
        RequestTypeSpecific::Ping => MessageKind::Ping,
        RequestTypeSpecific::FindNode(_) => MessageKind::FindNode,
        RequestTypeSpecific::FindValue(_) => MessageKind::FindValue,
        RequestTypeSpecific::Store(_) => MessageKind::Store,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::common::messages::PongResponseArguments;
    use crate::common::Id;

    fn test_socket(request_timeout: Duration, max_retries: u8) -> KrpcSocket {
        let config = Config {
            request_timeout,
            max_retries,
            ..Default::default()
        };

        KrpcSocket::new(&config).expect("bind ephemeral socket")
    }

    #[test]
    fn tids_wrap_around() {
        let mut socket = test_socket(Duration::from_secs(1), 0);
        socket.next_tid = u16::MAX;

        let silent = SocketAddrV4::new([127, 0, 0, 1].into(), 9);
        let request = RequestSpecific {
            requester_id: Id::random(),
            request_type: RequestTypeSpecific::Ping,
        };

        assert_eq!(socket.request(silent, request.clone()), u16::MAX);
        assert_eq!(socket.request(silent, request), 0);
    }

    #[test]
    fn exhausts_retries_then_reports_failure() {
        let mut socket = test_socket(Duration::from_millis(20), 2);

        // A bound socket that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let to = match silent.local_addr().expect("addr") {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to IPv4"),
        };

        let tid = socket.request(
            to,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            },
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut expired = Vec::new();

        while expired.is_empty() && Instant::now() < deadline {
            expired = socket.tick();
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, tid);

        // Initial send plus two retransmissions.
        assert_eq!(socket.counters.ping.sent, 3);
        assert_eq!(socket.counters.ping.failed, 1);
        assert!(socket.inflight_requests.is_empty());
    }

    #[test]
    fn response_traffic_is_counted() {
        let mut socket = test_socket(Duration::from_secs(5), 0);

        let peer = UdpSocket::bind("127.0.0.1:0").expect("bind");
        peer.set_read_timeout(Some(Duration::from_secs(1)))
            .expect("timeout");
        let peer_addr = match peer.local_addr().expect("addr") {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to IPv4"),
        };

        socket.response(
            peer_addr,
            7,
            ResponseSpecific::Pong(PongResponseArguments {
                responder_id: Id::random(),
            }),
        );
        assert_eq!(socket.counters.response.sent, 1);

        let tid = socket.request(
            peer_addr,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            },
        );

        // The peer sees the pong first, then the ping request.
        let mut buf = [0_u8; MTU];
        peer.recv_from(&mut buf).expect("pong arrives");
        let (_, from) = peer.recv_from(&mut buf).expect("request arrives");

        let pong = Message {
            transaction_id: tid,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::Pong(PongResponseArguments {
                responder_id: Id::random(),
            })),
        };
        peer.send_to(&pong.to_bytes().expect("encodes"), from)
            .expect("send");

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = None;
        while received.is_none() && Instant::now() < deadline {
            received = socket.recv_from();
        }

        assert!(received.is_some());
        assert_eq!(socket.counters.response.received, 1);
        assert!(socket.inflight_requests.is_empty());
    }

    #[test]
    fn response_from_wrong_address_is_dropped() {
        let mut socket = test_socket(Duration::from_secs(5), 0);
        let target = test_socket(Duration::from_secs(5), 0).local_addr();

        let tid = socket.request(
            target,
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            },
        );

        // A third party spoofs a matching tid from a different address.
        let stranger = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let pong = Message {
            transaction_id: tid,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::Pong(PongResponseArguments {
                responder_id: Id::random(),
            })),
        };
        stranger
            .send_to(&pong.to_bytes().expect("encodes"), socket.local_addr())
            .expect("send");

        std::thread::sleep(Duration::from_millis(50));

        assert!(socket.recv_from().is_none());
        // The real request is still pending.
        assert_eq!(socket.inflight_requests.len(), 1);
    }
}
