//! One client connection, plain TCP or TLS over TCP.
//!
//! All I/O is non-blocking. `WouldBlock` is only ever reported when the
//! socket itself would block, so the caller can rely on an edge-triggered
//! readiness event to resume.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};

use super::wire::Origin;
use super::{PollAction, TransferError, TransferId};
use crate::socket::SocketRef;

pub(crate) struct Connection {
    pub stream: TcpStream,
    pub origin: Origin,
    tls: Option<ClientConnection>,
    tls_eof: bool,
    /// Transfer currently using the connection.
    pub transfer: Option<TransferId>,
    /// Socket reference assigned by the reactor while watched.
    pub socketp: Option<SocketRef>,
    pub watching: Option<PollAction>,
    pub idle_since: Option<Instant>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        origin: Origin,
        tls_config: &Arc<ClientConfig>,
    ) -> Result<Self, TransferError> {
        let tls = if origin.tls {
            let name = ServerName::try_from(origin.host.clone())
                .map_err(|_| TransferError::UrlMalformat)?;
            let conn = ClientConnection::new(Arc::clone(tls_config), name)
                .map_err(|_| TransferError::Tls)?;
            Some(conn)
        } else {
            None
        };
        Ok(Self {
            stream,
            origin,
            tls,
            tls_eof: false,
            transfer: None,
            socketp: None,
            watching: None,
            idle_since: None,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Interest needed while a request is being written.
    pub fn send_interest(&self) -> PollAction {
        if self.is_tls() {
            PollAction::InOut
        } else {
            PollAction::Out
        }
    }

    /// Interest needed while a response is being read.
    pub fn recv_interest(&self) -> PollAction {
        match &self.tls {
            Some(tls) if tls.wants_write() => PollAction::InOut,
            _ => PollAction::In,
        }
    }

    /// Result of a non-blocking connect, once the socket reports readiness.
    /// `Ok(false)` means still in progress.
    pub fn connect_result(&self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Hand plaintext to the connection. For TLS, `Ok(0)` means the record
    /// buffer is full and [`flush`](Self::flush) must run first.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.tls {
            Some(tls) => tls.writer().write(data),
            None => match self.stream.write(data)? {
                0 if !data.is_empty() => Err(io::ErrorKind::WriteZero.into()),
                n => Ok(n),
            },
        }
    }

    /// Push buffered TLS records and finish the handshake.
    /// Returns `Ok(true)` once nothing is left to do.
    pub fn flush(&mut self) -> io::Result<bool> {
        let Some(tls) = &mut self.tls else {
            return Ok(true);
        };
        loop {
            if tls.wants_write() {
                match tls.write_tls(&mut self.stream) {
                    Ok(_) => continue,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
            if tls.is_handshaking() {
                match tls.read_tls(&mut self.stream) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => {
                        tls.process_new_packets().map_err(io::Error::other)?;
                        continue;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
            return Ok(true);
        }
    }

    /// Read response bytes. `Ok(0)` is end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(tls) = &mut self.tls else {
            return self.stream.read(buf);
        };
        loop {
            match tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if self.tls_eof {
                        return Ok(0);
                    }
                }
                Err(err) => return Err(err),
            }

            match tls.read_tls(&mut self.stream) {
                Ok(0) => self.tls_eof = true,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            tls.process_new_packets().map_err(io::Error::other)?;

            // Key updates and alerts may need an answer.
            while tls.wants_write() {
                match tls.write_tls(&mut self.stream) {
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err),
                }
            }
        }
    }

    /// Quick liveness probe for a parked keep-alive connection: anything
    /// other than "no data yet" means the peer closed or misbehaved.
    pub fn idle_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        matches!(self.stream.peek(&mut probe), Err(err) if err.kind() == io::ErrorKind::WouldBlock)
    }
}

/// Map an I/O failure from a TLS connection to a transfer error.
pub(crate) fn classify(err: &io::Error, fallback: TransferError) -> TransferError {
    match err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        Some(rustls::Error::InvalidCertificate(_)) => TransferError::PeerFailedVerification,
        Some(_) => TransferError::Tls,
        None => fallback,
    }
}
