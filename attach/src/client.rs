//! The host side of attach.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use vigil_executor::pty::WindowSize;
use vigil_serial::Handshaker;

use crate::auth;
use crate::connection::{Channel, Connection};
use crate::msgs::{
    marshal_signal, marshal_window_change, ContainersMsg, ATTACH_CHANNEL, CLOSE_STDIN_REQ,
    CONTAINERS_REQ, SIGNAL_REQ, WINDOW_CHANGE_REQ,
};
use crate::AttachError;

pub struct AttachClient {
    conn: Connection,
    host_key: Vec<u8>,
}

impl AttachClient {
    /// Synchronize the link as handshake initiator, then log in.
    pub async fn connect<S>(mut stream: S, cancel: &CancellationToken) -> Result<Self, AttachError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Handshaker::new().initiate_until(&mut stream, cancel).await?;
        let (conn, host_key) = Connection::connect(stream, auth::USER, "").await?;
        Ok(Self { conn, host_key })
    }

    /// The agent's host key in SSH wire form.
    pub fn host_key(&self) -> &[u8] {
        &self.host_key
    }

    pub async fn container_ids(&self) -> Result<Vec<String>, AttachError> {
        match self.conn.global_request(CONTAINERS_REQ, Vec::new()).await? {
            Some(payload) => Ok(ContainersMsg::unmarshal(&payload)?.ids),
            None => Err(AttachError::RequestFailed(CONTAINERS_REQ.to_string())),
        }
    }

    pub async fn attach(&self, id: &str) -> Result<AttachedSession, AttachError> {
        let channel = self.conn.open_channel(ATTACH_CHANNEL, id.as_bytes()).await?;
        Ok(AttachedSession { channel })
    }

    /// The underlying connection, for requests and channels beyond attach.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn disconnect(self) {
        self.conn.disconnect();
    }
}

/// An attach channel to one session.
pub struct AttachedSession {
    channel: Channel,
}

impl AttachedSession {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), AttachError> {
        self.channel.write(data).await
    }

    /// Next chunk of the session's stdout; `None` once the session is gone.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.channel.read().await
    }

    pub async fn read_stderr(&mut self) -> Option<Vec<u8>> {
        self.channel.read_stderr().await
    }

    async fn request(&self, name: &str, payload: Vec<u8>) -> Result<(), AttachError> {
        if self.channel.request(name, payload).await? {
            Ok(())
        } else {
            Err(AttachError::RequestFailed(name.to_string()))
        }
    }

    pub async fn resize(&self, size: WindowSize) -> Result<(), AttachError> {
        self.request(WINDOW_CHANGE_REQ, marshal_window_change(size)).await
    }

    /// Deliver a signal by SSH name, e.g. `INT`.
    pub async fn signal(&self, name: &str) -> Result<(), AttachError> {
        self.request(SIGNAL_REQ, marshal_signal(name)).await
    }

    pub async fn close_stdin(&self) -> Result<(), AttachError> {
        self.request(CLOSE_STDIN_REQ, Vec::new()).await
    }

    pub fn close(self) -> Result<(), AttachError> {
        self.channel.close()
    }
}
