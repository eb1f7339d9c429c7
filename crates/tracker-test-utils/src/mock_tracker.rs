//! A scripted tracker device speaking raw TCP.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockTracker {
    stream: TcpStream,
}

impl MockTracker {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(MockTracker { stream })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Read exactly one short or long frame sent by the server.
    pub async fn recv_frame(&mut self) -> io::Result<Vec<u8>> {
        timeout(IO_TIMEOUT, self.read_frame())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no frame from server"))?
    }

    async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut magic = [0u8; 2];
        self.stream.read_exact(&mut magic).await?;
        let mut frame = magic.to_vec();
        let len = match magic {
            [0x78, 0x78] => {
                let len = self.stream.read_u8().await?;
                frame.push(len);
                len as usize
            }
            [0x79, 0x79] => {
                let len = self.stream.read_u16().await?;
                frame.extend_from_slice(&len.to_be_bytes());
                len as usize
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected magic {:02X?}", other),
                ));
            }
        };
        let mut rest = vec![0u8; len + 2];
        self.stream.read_exact(&mut rest).await?;
        frame.extend_from_slice(&rest);
        Ok(frame)
    }

    /// True once the server has closed the connection (EOF or reset).
    pub async fn expect_closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        match timeout(IO_TIMEOUT, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) | Err(_) => false,
        }
    }
}
