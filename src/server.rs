use crate::error::{Error, ProtocolError};
use crate::proto::{self, Confirmation, Header, PacketType, Token};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// A second request from the same address is rejected while a response
/// younger than this is still unconfirmed. Intentionally a rejection, not a
/// re-send, so a response lost on the wire cannot be hammered back out.
const DECLINE_TIMER: Duration = Duration::from_secs(30);

/// Lifecycle notifications, drained from the channel returned by
/// [`Server::events`]. A failure of the receive loop itself is not an event,
/// it is the `Err` return of [`Server::run`].
#[derive(Debug)]
pub enum Event {
    ReceivedRequest(SocketAddr),
    SentResponse(SocketAddr),
    ReceivedConfirmation(SocketAddr),
    ResponseConfirmed(SocketAddr),
    NonfatalError(Error),
}

struct Unconfirmed {
    responded_at: Instant,
    request_token: Token,
    response_token: Token,
}

/// Discovery rendezvous server.
///
/// Answers each request with the sender's observed address and port and keeps
/// one unconfirmed-session record per remote ip until the matching
/// confirmation arrives. Datagrams are processed strictly one at a time, the
/// session table has no other mutation path.
pub struct Server {
    socket: UdpSocket,
    unconfirmed: HashMap<IpAddr, Unconfirmed>,
    events: Option<UnboundedSender<Event>>,
    stop: CancellationToken,
    rng: OsRng,
}

impl Server {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self, Error> {
        let socket = UdpSocket::bind(listen_addr).await?;

        Ok(Self {
            socket,
            unconfirmed: HashMap::new(),
            events: None,
            stop: CancellationToken::new(),
            rng: OsRng,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Channel the lifecycle notifications are sent on. Replaces any channel
    /// handed out earlier.
    pub fn events(&mut self) -> UnboundedReceiver<Event> {
        let (tx, rx) = unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Cancel the returned token to stop the receive loop; [`Server::run`]
    /// returns `Ok(())` the next time it wakes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Receive loop. Errors on a single datagram are reported as
    /// [`Event::NonfatalError`] and processing continues; a failure of the
    /// receive itself terminates the loop with `Err`.
    pub async fn run(mut self) -> Result<(), Error> {
        let mut buf = [0u8; 1500];

        loop {
            let (n, from) = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                recvd = self.socket.recv_from(&mut buf) => recvd?,
            };

            if let Err(e) = self.process_datagram(&buf[..n], from).await {
                log::debug!("dropping datagram from {}: {}", from, e);
                self.emit(Event::NonfatalError(e));
            }
        }
    }

    async fn process_datagram(&mut self, data: &[u8], from: SocketAddr) -> Result<(), Error> {
        // Version is checked before the type byte is interpreted, a foreign
        // version is dropped silently even when the rest of the header would
        // not parse.
        if proto::is_unsupported_version(data) {
            return Ok(());
        }
        let header = proto::decode_header(data)?;

        match header.packet_type {
            PacketType::Request => self.handle_request(&header, from).await,
            PacketType::Response => Err(ProtocolError::UnexpectedResponse(from).into()),
            PacketType::Confirmation => {
                let conf = proto::decode_confirmation(data)?;
                self.handle_confirmation(&conf, from)
            }
        }
    }

    async fn handle_request(&mut self, header: &Header, from: SocketAddr) -> Result<(), Error> {
        self.emit(Event::ReceivedRequest(from));

        let remote_ip = from.ip();
        if let Some(pending) = self.unconfirmed.get(&remote_ip) {
            if pending.responded_at.elapsed() < DECLINE_TIMER {
                return Err(ProtocolError::DuplicateRequest(remote_ip).into());
            }
            // Decline window elapsed, the old record is stale.
            self.unconfirmed.remove(&remote_ip);
        }

        let mut response_token = Token::default();
        self.rng.fill_bytes(&mut response_token);

        let response = proto::encode_response(
            &header.request_token,
            &response_token,
            from.port(),
            remote_ip,
        );
        self.socket.send_to(&response, from).await?;

        self.unconfirmed.insert(
            remote_ip,
            Unconfirmed {
                responded_at: Instant::now(),
                request_token: header.request_token,
                response_token,
            },
        );

        self.emit(Event::SentResponse(from));
        Ok(())
    }

    fn handle_confirmation(&mut self, conf: &Confirmation, from: SocketAddr) -> Result<(), Error> {
        self.emit(Event::ReceivedConfirmation(from));

        let remote_ip = from.ip();
        let pending = self
            .unconfirmed
            .get(&remote_ip)
            .ok_or(ProtocolError::NoPendingResponse(remote_ip))?;

        if pending.request_token != conf.header.request_token {
            return Err(ProtocolError::RequestTokenMismatch(remote_ip).into());
        }
        if pending.response_token != conf.response_token {
            return Err(ProtocolError::ResponseTokenMismatch(remote_ip).into());
        }

        self.unconfirmed.remove(&remote_ip);

        self.emit(Event::ResponseConfirmed(from));
        Ok(())
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::FormatError;

    async fn test_server() -> Server {
        Server::new("127.0.0.1:0").await.unwrap()
    }

    /// A live socket whose address poses as the remote peer, so responses
    /// sent by the server have somewhere to land.
    async fn peer() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn request(token: &Token) -> Vec<u8> {
        proto::encode_header(PacketType::Request, token)
    }

    #[tokio::test]
    async fn request_creates_record_and_sends_response() {
        let mut server = test_server().await;
        let (peer, peer_addr) = peer().await;
        let token = [1u8; 16];

        server
            .process_datagram(&request(&token), peer_addr)
            .await
            .unwrap();

        let record = server.unconfirmed.get(&peer_addr.ip()).unwrap();
        assert_eq!(record.request_token, token);

        let mut buf = [0u8; 1500];
        let n = peer.recv(&mut buf).await.unwrap();
        let resp = proto::decode_response(&buf[..n]).unwrap();
        assert_eq!(resp.header.request_token, token);
        assert_eq!(resp.response_token, record.response_token);
        assert_eq!(resp.public_port, peer_addr.port());
        assert_eq!(resp.public_addr, peer_addr.ip());
    }

    #[tokio::test]
    async fn duplicate_request_rejected_and_record_untouched() {
        let mut server = test_server().await;
        let (_peer, peer_addr) = peer().await;

        server
            .process_datagram(&request(&[1u8; 16]), peer_addr)
            .await
            .unwrap();
        let issued = server.unconfirmed[&peer_addr.ip()].response_token;

        let result = server.process_datagram(&request(&[2u8; 16]), peer_addr).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::DuplicateRequest(_)))
        ));

        let record = &server.unconfirmed[&peer_addr.ip()];
        assert_eq!(record.request_token, [1u8; 16]);
        assert_eq!(record.response_token, issued);
    }

    #[tokio::test]
    async fn request_after_decline_window_overwrites_record() {
        let mut server = test_server().await;
        let (_peer, peer_addr) = peer().await;

        server
            .process_datagram(&request(&[1u8; 16]), peer_addr)
            .await
            .unwrap();
        let first_issued = server.unconfirmed[&peer_addr.ip()].response_token;

        // Instant cannot represent times before the clock origin, skip on
        // platforms whose monotonic clock started too recently.
        let Some(backdated) = Instant::now().checked_sub(DECLINE_TIMER + Duration::from_secs(1))
        else {
            return;
        };
        server
            .unconfirmed
            .get_mut(&peer_addr.ip())
            .unwrap()
            .responded_at = backdated;

        server
            .process_datagram(&request(&[2u8; 16]), peer_addr)
            .await
            .unwrap();

        let record = &server.unconfirmed[&peer_addr.ip()];
        assert_eq!(record.request_token, [2u8; 16]);
        assert_ne!(record.response_token, first_issued);
    }

    #[tokio::test]
    async fn confirmation_without_pending_record_rejected() {
        let mut server = test_server().await;
        let (_peer, peer_addr) = peer().await;

        let conf = proto::encode_confirmation(&[1u8; 16], &[2u8; 16]);
        let result = server.process_datagram(&conf, peer_addr).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::NoPendingResponse(_)))
        ));
    }

    #[tokio::test]
    async fn confirmation_with_wrong_response_token_keeps_record() {
        let mut server = test_server().await;
        let (_peer, peer_addr) = peer().await;
        let token = [1u8; 16];

        server
            .process_datagram(&request(&token), peer_addr)
            .await
            .unwrap();

        let mut wrong = server.unconfirmed[&peer_addr.ip()].response_token;
        wrong[0] ^= 0xff;

        let conf = proto::encode_confirmation(&token, &wrong);
        let result = server.process_datagram(&conf, peer_addr).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::ResponseTokenMismatch(_)))
        ));
        assert!(server.unconfirmed.contains_key(&peer_addr.ip()));
    }

    #[tokio::test]
    async fn confirmation_with_wrong_request_token_keeps_record() {
        let mut server = test_server().await;
        let (_peer, peer_addr) = peer().await;

        server
            .process_datagram(&request(&[1u8; 16]), peer_addr)
            .await
            .unwrap();
        let issued = server.unconfirmed[&peer_addr.ip()].response_token;

        let conf = proto::encode_confirmation(&[9u8; 16], &issued);
        let result = server.process_datagram(&conf, peer_addr).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::RequestTokenMismatch(_)))
        ));
        assert!(server.unconfirmed.contains_key(&peer_addr.ip()));
    }

    #[tokio::test]
    async fn valid_confirmation_removes_record_and_emits_events() {
        let mut server = test_server().await;
        let mut events = server.events();
        let (_peer, peer_addr) = peer().await;
        let token = [1u8; 16];

        server
            .process_datagram(&request(&token), peer_addr)
            .await
            .unwrap();
        let issued = server.unconfirmed[&peer_addr.ip()].response_token;

        let conf = proto::encode_confirmation(&token, &issued);
        server.process_datagram(&conf, peer_addr).await.unwrap();
        assert!(!server.unconfirmed.contains_key(&peer_addr.ip()));

        assert!(matches!(events.try_recv(), Ok(Event::ReceivedRequest(a)) if a == peer_addr));
        assert!(matches!(events.try_recv(), Ok(Event::SentResponse(a)) if a == peer_addr));
        assert!(matches!(events.try_recv(), Ok(Event::ReceivedConfirmation(a)) if a == peer_addr));
        assert!(matches!(events.try_recv(), Ok(Event::ResponseConfirmed(a)) if a == peer_addr));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn response_packet_from_client_rejected() {
        let mut server = test_server().await;
        let (_peer, peer_addr) = peer().await;

        let resp = proto::encode_response(&[1u8; 16], &[2u8; 16], peer_addr.port(), peer_addr.ip());
        let result = server.process_datagram(&resp, peer_addr).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::UnexpectedResponse(_)))
        ));
    }

    #[tokio::test]
    async fn unsupported_version_is_a_noop() {
        let mut server = test_server().await;
        let mut events = server.events();
        let (_peer, peer_addr) = peer().await;

        let mut packet = request(&[1u8; 16]);
        packet[4] = 2;

        server.process_datagram(&packet, peer_addr).await.unwrap();
        assert!(server.unconfirmed.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsupported_version_with_unknown_type_is_a_noop() {
        let mut server = test_server().await;
        let mut events = server.events();
        let (_peer, peer_addr) = peer().await;

        let mut packet = request(&[1u8; 16]);
        packet[4] = 9;
        packet[5] = 200;

        server.process_datagram(&packet, peer_addr).await.unwrap();
        assert!(server.unconfirmed.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_magic_is_a_format_error() {
        let mut server = test_server().await;
        let (_peer, peer_addr) = peer().await;

        let mut packet = request(&[1u8; 16]);
        packet[0] = b'X';

        let result = server.process_datagram(&packet, peer_addr).await;
        assert!(matches!(
            result,
            Err(Error::Format(FormatError::BadMagic))
        ));
    }
}
