use crate::error::Error;
use crate::proto::{self, PacketType, Token};
use rand::{rngs::OsRng, RngCore};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery client.
///
/// Asks a rendezvous server what public address and port it is seen from.
/// One transaction may be in flight at a time, concurrent callers queue on an
/// internal mutex. Each transaction binds a fresh socket at the configured
/// local address, so sequential calls reuse the same local port.
///
/// # example
/// ```no_run
/// use spade::client::Client;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), spade::Error> {
/// let client = Client::new("0.0.0.0:0".parse().unwrap());
/// let public = client
///     .discover_host("spade.example.net", 8808, &CancellationToken::new())
///     .await?;
/// println!("seen from {}", public);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    local_addr: SocketAddr,
    timeout: Duration,
    lock: Mutex<OsRng>,
}

impl Client {
    /// Local address transactions bind to. Port 0 picks an ephemeral port
    /// per transaction.
    pub fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            timeout: DEFAULT_TIMEOUT,
            lock: Mutex::new(OsRng),
        }
    }

    /// Receive window of a single transaction, 10s if not set.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Resolve `host` and run [`discover`](Self::discover) against the first
    /// address matching the local address family. A literal ip address skips
    /// resolution.
    pub async fn discover_host(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<SocketAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.discover(SocketAddr::new(ip, port), cancel).await;
        }

        let server_addr = lookup_host((host, port))
            .await?
            .find(|addr| addr.is_ipv4() == self.local_addr.is_ipv4())
            .ok_or(Error::NoMatchingAddress)?;

        self.discover(server_addr, cancel).await
    }

    /// Perform one request/response/confirmation handshake with the server
    /// and return the public endpoint it observed.
    ///
    /// Fails with [`Error::Canceled`] when `cancel` fires first, with
    /// [`Error::Timeout`] when no response arrives within the receive window.
    /// A lost request is not retried, issue a new call instead, it generates
    /// a fresh token.
    pub async fn discover(
        &self,
        server_addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<SocketAddr, Error> {
        let mut rng = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Canceled),
            guard = self.lock.lock() => guard,
        };

        let socket = self.bind_socket(server_addr)?;

        let mut request_token = Token::default();
        rng.fill_bytes(&mut request_token);

        let request = proto::encode_header(PacketType::Request, &request_token);
        socket.send(&request).await?;

        let mut buf = [0u8; 1500];
        let resp = loop {
            let recvd = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Canceled),
                r = timeout(self.timeout, socket.recv_from(&mut buf)) => r,
            };

            let (n, from) = match recvd {
                Ok(r) => r?,
                Err(_) => return Err(Error::Timeout),
            };

            // The socket is connected, but connect() on udp is only a hint.
            // Check the source before trusting the datagram.
            if from != server_addr {
                log::debug!("discarding datagram from unexpected source {}", from);
                continue;
            }

            break proto::decode_response(&buf[..n])?;
        };

        if resp.header.request_token != request_token {
            return Err(proto::FormatError::TokenMismatch.into());
        }

        let public = SocketAddr::new(resp.public_addr, resp.public_port);

        let confirmation = proto::encode_confirmation(&request_token, &resp.response_token);
        socket.send(&confirmation).await?;

        Ok(public)
    }

    fn bind_socket(&self, server_addr: SocketAddr) -> Result<UdpSocket, Error> {
        let domain = Domain::for_address(self.local_addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&self.local_addr.into())?;
        socket.connect(&server_addr.into())?;
        socket.set_nonblocking(true)?;

        Ok(UdpSocket::from_std(socket.into())?)
    }
}
