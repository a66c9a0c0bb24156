//! Blocking TCP Client
//!
//! Line- and frame-oriented client used by replication workers. All reads
//! carry an explicit timeout; lines and frames are capped by the client's
//! capacity.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

use super::Network;

struct Conn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    session_id: u64,
    peer: SocketAddr,
}

/// Blocking TCP client with per-read timeouts
pub struct BlockingClient {
    network: Arc<Network>,
    capacity: usize,
    conn: Option<Conn>,
}

impl BlockingClient {
    pub(crate) fn new(network: Arc<Network>, capacity: usize) -> Self {
        Self {
            network,
            capacity,
            conn: None,
        }
    }

    /// Connect to a remote peer within `timeout`
    pub fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let address = format!("{}:{}", host, port);
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::ConnectionFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    let writer = stream.try_clone()?;
                    let session_id = self.network.register_session(stream.try_clone()?);
                    self.conn = Some(Conn {
                        reader: BufReader::new(stream),
                        writer,
                        session_id,
                        peer: addr,
                    });
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::ConnectionFailed {
            address,
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".to_string()),
        })
    }

    /// Session id owning the connection, if connected
    pub fn session_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.session_id)
    }

    /// Remote peer representation for logs and stats
    pub fn remote_repr(&self) -> String {
        match &self.conn {
            Some(c) => c.peer.to_string(),
            None => "???".to_string(),
        }
    }

    /// Send one line, appending the terminator
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let conn = self.conn_mut()?;
        conn.writer.write_all(line.as_bytes())?;
        conn.writer.write_all(b"\n")?;
        conn.writer.flush()?;
        Ok(())
    }

    /// Read one line within `timeout`, stripping the terminator
    pub fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let capacity = self.capacity;
        let conn = self.conn_mut()?;
        set_read_timeout(&conn.reader, timeout)?;

        let mut buf = Vec::new();
        let n = conn
            .reader
            .read_until(b'\n', &mut buf)
            .map_err(map_read_err)?;
        if n == 0 {
            return Err(Error::Network("connection closed by peer".into()));
        }
        if buf.len() > capacity {
            return Err(Error::Internal("line exceeds client capacity".into()));
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|_| Error::Internal("line is not valid utf-8".into()))
    }

    /// Send one crc-checked, length-prefixed frame
    pub fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        let conn = self.conn_mut()?;
        conn.writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        conn.writer.write_all(&crc32fast::hash(bytes).to_le_bytes())?;
        conn.writer.write_all(bytes)?;
        conn.writer.flush()?;
        Ok(())
    }

    /// Read one frame within `timeout`
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let capacity = self.capacity;
        let conn = self.conn_mut()?;
        set_read_timeout(&conn.reader, timeout)?;

        let mut header = [0u8; 8];
        conn.reader.read_exact(&mut header).map_err(map_read_err)?;
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let expected = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if len > capacity {
            return Err(Error::Internal("frame exceeds client capacity".into()));
        }

        let mut bytes = vec![0u8; len];
        conn.reader.read_exact(&mut bytes).map_err(map_read_err)?;
        if crc32fast::hash(&bytes) != expected {
            return Err(Error::Network("frame checksum mismatch".into()));
        }
        Ok(bytes)
    }

    fn conn_mut(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Network("client is not connected".into()))
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.network.deregister_session(conn.session_id);
        }
    }
}

fn set_read_timeout(reader: &BufReader<TcpStream>, timeout: Duration) -> Result<()> {
    let timeout = timeout.max(Duration::from_millis(1));
    reader.get_ref().set_read_timeout(Some(timeout))?;
    Ok(())
}

fn map_read_err(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            Error::Timeout("read timed out".into())
        }
        std::io::ErrorKind::UnexpectedEof => Error::Network("connection closed by peer".into()),
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader as StdBufReader, Write as StdWrite};
    use std::net::TcpListener;
    use std::thread;

    fn echo_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_line_roundtrip() {
        let (listener, addr) = echo_listener();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let mut stream = stream;
            stream.write_all(b"+PONG\r\n").unwrap();
            line
        });

        let network = Arc::new(Network::new("127.0.0.1", 0));
        let mut client = network.create_blocking_client(1024);
        client
            .connect("127.0.0.1", addr.port(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(network.session_count(), 1);

        client.write_line("PING").unwrap();
        let reply = client.read_line(Duration::from_secs(2)).unwrap();
        assert_eq!(reply, "+PONG");
        assert_eq!(server.join().unwrap(), "PING\n");

        drop(client);
        assert_eq!(network.session_count(), 0);
    }

    #[test]
    fn test_read_timeout() {
        let (listener, addr) = echo_listener();
        let _server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // hold the socket open without writing
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let network = Arc::new(Network::new("127.0.0.1", 0));
        let mut client = network.create_blocking_client(1024);
        client
            .connect("127.0.0.1", addr.port(), Duration::from_secs(1))
            .unwrap();
        let err = client.read_line(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);
    }

    #[test]
    fn test_cancel_session_unblocks_reader() {
        let (listener, addr) = echo_listener();
        let _server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(5));
            drop(stream);
        });

        let network = Arc::new(Network::new("127.0.0.1", 0));
        let mut client = network.create_blocking_client(1024);
        client
            .connect("127.0.0.1", addr.port(), Duration::from_secs(1))
            .unwrap();
        let session_id = client.session_id().unwrap();

        let canceller = {
            let network = Arc::clone(&network);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                network.cancel_session(session_id).unwrap();
            })
        };

        let err = client.read_line(Duration::from_secs(5)).unwrap_err();
        assert!(!matches!(err, Error::Timeout(_)), "got {:?}", err);
        canceller.join().unwrap();
    }

    #[test]
    fn test_frame_roundtrip() {
        let (listener, addr) = echo_listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let payload = b"frame payload";
            stream.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            stream
                .write_all(&crc32fast::hash(payload).to_le_bytes())
                .unwrap();
            stream.write_all(payload).unwrap();
        });

        let network = Arc::new(Network::new("127.0.0.1", 0));
        let mut client = network.create_blocking_client(1024);
        client
            .connect("127.0.0.1", addr.port(), Duration::from_secs(1))
            .unwrap();
        let frame = client.read_frame(Duration::from_secs(2)).unwrap();
        assert_eq!(frame, b"frame payload");
        server.join().unwrap();
    }
}
