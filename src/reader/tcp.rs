//! TCP reader transport
//!
//! Network readers push line-protocol frames over a plain TCP stream. The
//! read timeout doubles as the idle poll interval.

use super::driver::{DriverRead, ReaderDriver};
use crate::error::{Result, RfidError};
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

const READ_BUFFER_SIZE: usize = 4096;

/// TCP client driver
#[derive(Debug)]
pub struct TcpDriver {
    reader_id: String,
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    buffer: Box<[u8; READ_BUFFER_SIZE]>,
}

impl TcpDriver {
    pub fn new(reader_id: &str, address: String, connect_timeout: Duration) -> Self {
        Self {
            reader_id: reader_id.to_string(),
            address,
            connect_timeout,
            stream: None,
            buffer: Box::new([0; READ_BUFFER_SIZE]),
        }
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = self
            .address
            .to_socket_addrs()
            .map_err(|e| RfidError::connection(&self.reader_id, format!("resolve {}: {}", self.address, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(RfidError::connection(
                &self.reader_id,
                format!("{} resolved to no addresses", self.address),
            ));
        }
        Ok(addrs)
    }
}

impl ReaderDriver for TcpDriver {
    fn open(&mut self) -> Result<()> {
        self.close();
        let mut last_error = None;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!("[{}] connected to {}", self.reader_id, addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_error = Some(format!("{}: {}", addr, e)),
            }
        }
        Err(RfidError::connection(
            &self.reader_id,
            last_error.unwrap_or_else(|| format!("unable to connect to {}", self.address)),
        ))
    }

    fn read(&mut self, timeout: Duration) -> Result<DriverRead> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(RfidError::connection(&self.reader_id, "read on closed link"));
        };
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        match stream.read(&mut self.buffer[..]) {
            Ok(0) => {
                self.stream = None;
                Ok(DriverRead::Closed)
            }
            Ok(n) => Ok(DriverRead::Data(self.buffer[..n].to_vec())),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                Ok(DriverRead::Idle)
            }
            Err(e) => {
                self.stream = None;
                Err(RfidError::connection(&self.reader_id, e.to_string()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

impl Drop for TcpDriver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn test_reads_data_then_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"TAG,AB01\n").unwrap();
        });

        let mut driver = TcpDriver::new("t", address, Duration::from_secs(1));
        driver.open().unwrap();
        assert!(driver.is_open());

        let mut received = Vec::new();
        loop {
            match driver.read(Duration::from_millis(200)).unwrap() {
                DriverRead::Data(bytes) => received.extend(bytes),
                DriverRead::Idle => continue,
                DriverRead::Closed => break,
            }
        }
        server.join().unwrap();
        assert_eq!(received, b"TAG,AB01\n");
        assert!(!driver.is_open());
    }

    #[test]
    fn test_idle_when_nothing_arrives() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut driver = TcpDriver::new("t", address, Duration::from_secs(1));
        driver.open().unwrap();
        let _conn = listener.accept().unwrap();
        assert_eq!(driver.read(Duration::from_millis(20)).unwrap(), DriverRead::Idle);
    }

    #[test]
    fn test_unreachable_endpoint_is_connection_error() {
        // Bind then drop to get a port with nothing listening
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let mut driver = TcpDriver::new("dock", address, Duration::from_millis(200));
        let err = driver.open().unwrap_err();
        assert!(matches!(err, RfidError::Connection { ref reader_id, .. } if reader_id == "dock"));
        assert!(!driver.is_open());
    }
}
