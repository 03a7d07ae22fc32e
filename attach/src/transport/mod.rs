//! SSH transport layer (RFC 4253) over an arbitrary byte stream.
//!
//! Only one algorithm set is spoken: curve25519-sha256 key exchange, an
//! ed25519 host key, aes128-ctr and hmac-sha2-256, no compression.
//! Re-keying is not supported; a second KEXINIT ends the connection.

pub mod cipher;
pub mod hostkey;
pub mod kex;

use rand::RngCore;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use self::cipher::{Cipher, BLOCK_SIZE, MAC_LEN};
use self::hostkey::HostKey;
use self::kex::Versions;
use crate::AttachError;
use crate::msgs::{MSG_DEBUG, MSG_DISCONNECT, MSG_IGNORE};
use crate::wire::{Cursor, Put};

pub const VERSION: &str = "SSH-2.0-vigil_1.0";

const PLAIN_BLOCK: usize = 8;
const MAX_PACKET: usize = 256 * 1024;
const MAX_VERSION_LINE: usize = 255;
const MAX_BANNER_LINES: usize = 64;

pub const DISCONNECT_PROTOCOL_ERROR: u32 = 2;
pub const DISCONNECT_BY_APPLICATION: u32 = 11;

fn closed(e: std::io::Error) -> AttachError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        AttachError::Disconnected("connection closed".into())
    } else {
        AttachError::Io(e)
    }
}

pub struct PacketReader<R> {
    inner: R,
    seq: u32,
    cipher: Option<Cipher>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            seq: 0,
            cipher: None,
        }
    }

    fn enable(&mut self, cipher: Cipher) {
        self.cipher = Some(cipher);
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>, AttachError> {
        let block = if self.cipher.is_some() { BLOCK_SIZE } else { PLAIN_BLOCK };

        let mut packet = vec![0u8; block];
        self.inner.read_exact(&mut packet).await.map_err(closed)?;
        if let Some(c) = &mut self.cipher {
            c.apply(&mut packet);
        }

        let len = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
        if !(5..=MAX_PACKET).contains(&len) || (len + 4) % block != 0 || len + 4 < block {
            return Err(AttachError::protocol(format!("bad packet length {}", len)));
        }
        packet.resize(len + 4, 0);
        self.inner.read_exact(&mut packet[block..]).await.map_err(closed)?;

        if let Some(c) = &mut self.cipher {
            c.apply(&mut packet[block..]);
            let mut tag = [0u8; MAC_LEN];
            self.inner.read_exact(&mut tag).await.map_err(closed)?;
            c.check(self.seq, &packet, &tag)?;
        }
        self.seq = self.seq.wrapping_add(1);

        let padding = packet[4] as usize;
        if padding < 4 || padding + 1 >= len {
            return Err(AttachError::protocol(format!("bad padding length {}", padding)));
        }
        packet.truncate(4 + len - padding);
        packet.drain(..5);
        Ok(packet)
    }

    /// The next message, skipping IGNORE and DEBUG. A DISCONNECT from the
    /// peer is returned as an error.
    pub async fn read(&mut self) -> Result<Vec<u8>, AttachError> {
        loop {
            let payload = self.read_packet().await?;
            match payload.first() {
                None => return Err(AttachError::protocol("empty packet")),
                Some(&MSG_IGNORE) | Some(&MSG_DEBUG) => continue,
                Some(&MSG_DISCONNECT) => {
                    let mut c = Cursor::new(&payload[1..]);
                    let code = c.u32()?;
                    let description = c.utf8().unwrap_or_default();
                    return Err(AttachError::Disconnected(format!("{} (code {})", description, code)));
                }
                Some(_) => return Ok(payload),
            }
        }
    }
}

pub struct PacketWriter<W> {
    inner: W,
    seq: u32,
    cipher: Option<Cipher>,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            seq: 0,
            cipher: None,
        }
    }

    fn enable(&mut self, cipher: Cipher) {
        self.cipher = Some(cipher);
    }

    pub async fn write(&mut self, payload: &[u8]) -> Result<(), AttachError> {
        let block = if self.cipher.is_some() { BLOCK_SIZE } else { PLAIN_BLOCK };
        let mut padding = block - (5 + payload.len()) % block;
        if padding < 4 {
            padding += block;
        }

        let mut packet = Vec::with_capacity(5 + payload.len() + padding + MAC_LEN);
        packet.put_u32((1 + payload.len() + padding) as u32);
        packet.put_u8(padding as u8);
        packet.extend_from_slice(payload);
        let start = packet.len();
        packet.resize(start + padding, 0);
        OsRng.fill_bytes(&mut packet[start..]);

        if let Some(c) = &mut self.cipher {
            let tag = c.sign(self.seq, &packet)?;
            c.apply(&mut packet);
            packet.extend_from_slice(&tag);
        }
        self.seq = self.seq.wrapping_add(1);

        self.inner.write_all(&packet).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Tell the peer why the connection is ending.
    pub async fn disconnect(&mut self, code: u32, description: &str) -> Result<(), AttachError> {
        let mut msg = vec![MSG_DISCONNECT];
        msg.put_u32(code);
        msg.put_string(description.as_bytes());
        msg.put_string(b"");
        self.write(&msg).await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// An established, keyed transport.
pub struct Transport<S> {
    pub reader: PacketReader<ReadHalf<S>>,
    pub writer: PacketWriter<WriteHalf<S>>,
    pub session_id: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub async fn accept(stream: S, key: &HostKey) -> Result<Self, AttachError> {
        let (mut rd, mut wr) = tokio::io::split(stream);
        send_version(&mut wr).await?;
        let client = read_version(&mut rd).await?;
        tracing::debug!("client identifies as {}", client);
        let versions = Versions {
            client,
            server: VERSION.to_string(),
        };

        let mut reader = PacketReader::new(rd);
        let mut writer = PacketWriter::new(wr);
        let session_id = kex::serve(&mut reader, &mut writer, &versions, key).await?;
        Ok(Self {
            reader,
            writer,
            session_id,
        })
    }

    /// Returns the transport and the server's host key blob.
    pub async fn connect(stream: S) -> Result<(Self, Vec<u8>), AttachError> {
        let (mut rd, mut wr) = tokio::io::split(stream);
        send_version(&mut wr).await?;
        let server = read_version(&mut rd).await?;
        tracing::debug!("server identifies as {}", server);
        let versions = Versions {
            client: VERSION.to_string(),
            server,
        };

        let mut reader = PacketReader::new(rd);
        let mut writer = PacketWriter::new(wr);
        let (session_id, host_key) = kex::connect(&mut reader, &mut writer, &versions).await?;
        Ok((
            Self {
                reader,
                writer,
                session_id,
            },
            host_key,
        ))
    }
}

async fn send_version<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), AttachError> {
    w.write_all(format!("{}\r\n", VERSION).as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Read the peer's identification string. Lines before it are ignored.
/// Reads byte by byte so nothing past the line is consumed.
async fn read_version<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, AttachError> {
    for _ in 0..MAX_BANNER_LINES {
        let mut line = Vec::new();
        loop {
            let b = r.read_u8().await.map_err(closed)?;
            if b == b'\n' {
                break;
            }
            line.push(b);
            if line.len() > MAX_VERSION_LINE {
                return Err(AttachError::protocol("identification line too long"));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.starts_with(b"SSH-") {
            let version = String::from_utf8(line)
                .map_err(|_| AttachError::protocol("identification string is not UTF-8"))?;
            if !version.starts_with("SSH-2.0-") && !version.starts_with("SSH-1.99-") {
                return Err(AttachError::protocol(format!("unsupported protocol version {}", version)));
            }
            return Ok(version);
        }
    }
    Err(AttachError::protocol("no identification string from peer"))
}
