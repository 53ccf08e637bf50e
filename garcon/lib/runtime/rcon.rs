//! A minimal Source-RCON client used to ask game servers to shut down
//! gracefully.
//!
//! Packets are little-endian framed as `size(4) | id(4) | type(4) |
//! payload(utf8) | 0 | 0`. The handshake is a type-3 auth request; a
//! response id of `-1` means the password was rejected. Commands are type-2
//! packets answered by a type-0 response carrying the same id.

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::{GarconError, GarconResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The RCON connection timeout.
pub const RCON_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const PACKET_TYPE_AUTH: i32 = 3;
const PACKET_TYPE_COMMAND: i32 = 2;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A minimal RCON client bound to one address and password.
#[derive(Debug, Clone)]
pub struct RconClient {
    address: String,
    password: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RconClient {
    /// Creates a client for the given `host:port` address.
    pub fn new(address: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: password.into(),
        }
    }

    /// Connects, authenticates and executes a single command, returning the
    /// response body.
    ///
    /// A connection closed by the peer after successful authentication is
    /// treated as an empty success: shutdown-style commands may tear the
    /// socket down as the game exits.
    pub async fn execute(&self, command: &str) -> GarconResult<String> {
        let mut stream = timeout(RCON_CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                GarconError::native_process(format!("rcon connect to {} timed out", self.address))
            })?
            .map_err(|e| {
                GarconError::native_process(format!(
                    "rcon connect to {} failed: {}",
                    self.address, e
                ))
            })?;

        self.authenticate(&mut stream).await?;

        let command_id = 2;
        write_packet(&mut stream, command_id, PACKET_TYPE_COMMAND, command).await?;

        loop {
            match read_packet(&mut stream).await {
                Ok((id, _, body)) if id == command_id => return Ok(body),
                Ok(_) => continue,
                // The game may close the socket while executing a shutdown
                // command; auth already succeeded, so report success.
                Err(e) if is_connection_closed(&e) => return Ok(String::new()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> GarconResult<()> {
        let auth_id = 1;
        write_packet(stream, auth_id, PACKET_TYPE_AUTH, &self.password).await?;

        loop {
            let (id, _, _) = read_packet(stream).await?;
            if id == -1 {
                return Err(GarconError::native_process("rcon authentication failed"));
            }
            if id == auth_id {
                return Ok(());
            }
            // Some servers echo an empty response packet before the auth
            // reply; keep reading.
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn write_packet(
    stream: &mut TcpStream,
    id: i32,
    packet_type: i32,
    payload: &str,
) -> GarconResult<()> {
    let payload_bytes = payload.as_bytes();
    let size = (10 + payload_bytes.len()) as i32;

    stream.write_i32_le(size).await?;
    stream.write_i32_le(id).await?;
    stream.write_i32_le(packet_type).await?;
    stream.write_all(payload_bytes).await?;
    stream.write_all(&[0, 0]).await?;
    stream.flush().await?;

    Ok(())
}

async fn read_packet(stream: &mut TcpStream) -> GarconResult<(i32, i32, String)> {
    let size = stream.read_i32_le().await?;
    if !(10..=4096 + 10).contains(&size) {
        return Err(GarconError::native_process(format!(
            "rcon packet with invalid size {}",
            size
        )));
    }

    let id = stream.read_i32_le().await?;
    let packet_type = stream.read_i32_le().await?;

    // read_exact reassembles partial frames from the socket.
    let mut payload = vec![0u8; (size - 10) as usize];
    stream.read_exact(&mut payload).await?;

    let mut trailer = [0u8; 2];
    stream.read_exact(&mut trailer).await?;

    let body = String::from_utf8_lossy(&payload).into_owned();
    Ok((id, packet_type, body))
}

fn is_connection_closed(error: &GarconError) -> bool {
    match error {
        GarconError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
