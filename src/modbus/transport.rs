use crate::error::RegisterError;
use crate::modbus::client::Transport;
use crate::modbus::frame::EXCEPTION_LEN;
use crate::prelude::*;

use async_trait::async_trait;
use net2::TcpStreamExt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const TCP_KEEPALIVE_SECS: u64 = 60;

/// Serial-over-TCP link to a register slave. The connection is opened
/// lazily and dropped on any I/O failure so the next exchange reconnects.
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            stream: None,
        }
    }

    async fn connect(&self) -> Result<TcpStream, RegisterError> {
        info!("modbus {}:{}: connecting", self.host, self.port);

        let stream = match tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(RegisterError::Transport(e.to_string())),
            Err(_) => {
                return Err(RegisterError::Transport(format!(
                    "connection timeout after {} seconds",
                    CONNECT_TIMEOUT_SECS
                )))
            }
        };

        let std_stream = stream
            .into_std()
            .map_err(|e| RegisterError::Transport(e.to_string()))?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
            warn!(
                "modbus {}:{}: failed to set TCP keepalive: {}",
                self.host, self.port, e
            );
        }
        TcpStream::from_std(std_stream).map_err(|e| RegisterError::Transport(e.to_string()))
    }

    /// Throws away anything left over from an earlier, abandoned exchange.
    fn drain(stream: &TcpStream) -> Result<usize, RegisterError> {
        let mut scratch = [0u8; 256];
        let mut drained = 0;
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => return Err(RegisterError::Transport("connection closed".to_string())),
                Ok(n) => drained += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(drained),
                Err(e) => return Err(RegisterError::Transport(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(
        &mut self,
        request: &[u8],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, RegisterError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let drained = Self::drain(&stream)?;
        if drained > 0 {
            debug!("modbus: discarded {} stale bytes", drained);
        }

        stream
            .write_all(request)
            .await
            .map_err(|e| RegisterError::Transport(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = Vec::with_capacity(expected_len);
        let mut chunk = [0u8; 256];

        while buf.len() < expected_len && !is_exception(&buf) {
            match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(RegisterError::Transport("connection closed".to_string())),
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(RegisterError::Transport(e.to_string())),
                Err(_) => break,
            }
        }

        self.stream = Some(stream);

        if buf.is_empty() {
            return Err(RegisterError::Timeout(timeout.as_millis() as u64));
        }
        // partial frames go to validation, which reports them as short
        Ok(buf)
    }
}

fn is_exception(buf: &[u8]) -> bool {
    buf.len() >= EXCEPTION_LEN && buf[1] & 0x80 != 0
}
