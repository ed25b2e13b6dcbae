use net2::UdpBuilder;
use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::record::RequestRecord;
use crate::KBUFSIZE;

/// Where generator workers push encoded requests.
pub trait RequestSink: Send + Sync {
    fn send_record(&self, record: &RequestRecord) -> io::Result<()>;
}

/// Where the collector polls for responses. `Ok(None)` means nothing is
/// waiting right now; it must never block.
pub trait ResponseSource: Send + Sync {
    fn try_recv_record(&self) -> io::Result<Option<RequestRecord>>;
}

fn udp_builder(addr: &SocketAddr) -> io::Result<UdpBuilder> {
    match addr {
        SocketAddr::V4(_) => UdpBuilder::new_v4(),
        SocketAddr::V6(_) => UdpBuilder::new_v6(),
    }
}

/// A UDP socket carrying fixed-size records.
///
/// Clients get a non-blocking socket connected to the server so that any
/// number of sender threads and one polling receiver can share it without
/// locks. The router gets a blocking socket bound to its listen address.
#[derive(Debug)]
pub struct Channel {
    socket: UdpSocket,
}

impl Channel {
    pub fn dial(server: SocketAddr) -> io::Result<Channel> {
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = udp_builder(&server)?.bind(local)?;
        socket.connect(server)?;
        socket.set_nonblocking(true)?;
        Ok(Channel { socket })
    }

    pub fn bind(addr: SocketAddr, reuse_port: bool) -> io::Result<Channel> {
        let builder = udp_builder(&addr)?;
        builder.reuse_address(true)?;
        if reuse_port {
            #[cfg(unix)]
            {
                use net2::unix::UnixUdpBuilderExt;
                builder.reuse_port(true)?;
            }
        }
        let socket = builder.bind(addr)?;
        Ok(Channel { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }
}

impl RequestSink for Channel {
    fn send_record(&self, record: &RequestRecord) -> io::Result<()> {
        let buf = record.encode();
        let sent = self.socket.send(&buf[..])?;
        if sent != buf.len() {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                format!("Short send: {} of {} bytes", sent, buf.len()),
            ));
        }
        Ok(())
    }
}

impl ResponseSource for Channel {
    fn try_recv_record(&self) -> io::Result<Option<RequestRecord>> {
        let mut buf = [0u8; KBUFSIZE];
        match self.socket.recv(&mut buf) {
            Ok(len) => RequestRecord::decode(&buf[..len]).map(Some),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}
