//! Socket setup and bounded read/write helpers shared by client and server.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tcplink_core::{LinkError, Result, SocketConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};

fn new_socket(addr: &SocketAddr, config: &SocketConfig) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_recv_buffer_size(clamp_u32(config.receive_buffer_size))?;
    socket.set_send_buffer_size(clamp_u32(config.send_buffer_size))?;
    Ok(socket)
}

/// Resolve `host:port` and connect to the first address that accepts.
pub(crate) async fn open_stream(host: &str, port: u16, config: &SocketConfig) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in lookup_host((host, port)).await? {
        let socket = new_socket(&addr, config)?;
        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(config.no_delay)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no addresses found for {host}"))
    }))
}

/// Bind a listener with SO_REUSEADDR and the requested backlog.
///
/// Accepted sockets inherit the buffer sizes set here.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32, config: &SocketConfig) -> io::Result<TcpListener> {
    let socket = new_socket(&addr, config)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog.max(1))
}

/// Write the whole buffer, failing with `SendTimeout` if `limit` elapses first.
pub(crate) async fn write_all_bounded<W>(writer: &mut W, data: &[u8], limit: Option<Duration>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, writer.write_all(data)).await {
            Ok(result) => result.map_err(LinkError::from),
            Err(_) => Err(LinkError::SendTimeout(limit)),
        },
        None => writer.write_all(data).await.map_err(LinkError::from),
    }
}

/// Read once into `buf`. An elapsed `limit` surfaces as `TimedOut`.
pub(crate) async fn read_bounded<R>(reader: &mut R, buf: &mut [u8], limit: Option<Duration>) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no data received for {limit:?}"),
            )),
        },
        None => reader.read(buf).await,
    }
}

pub(crate) fn endpoint_string(addr: io::Result<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|_| "unknown".into())
}

fn clamp_u32(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_bounded_times_out_as_transport_error() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 4, &SocketConfig::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = open_stream("127.0.0.1", addr.port(), &SocketConfig::default()).await.unwrap();
        let (_server_side, _) = listener.accept().await.unwrap();

        let mut buf = [0u8; 16];
        let err = read_bounded(&mut client, &mut buf, Some(Duration::from_millis(50))).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(tcplink_core::is_transport_error(&err));
    }

    #[tokio::test]
    async fn open_stream_applies_no_delay() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 4, &SocketConfig::default()).unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = SocketConfig::default().no_delay(true);
        let stream = open_stream("127.0.0.1", port, &config).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn open_stream_reports_refused_port() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 1, &SocketConfig::default()).unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = open_stream("127.0.0.1", port, &SocketConfig::default()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
