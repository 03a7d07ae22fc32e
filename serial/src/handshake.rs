use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::SerialError;

pub const SYN: u8 = 0x16;
pub const ACK: u8 = 0x06;
pub const DEBUG_ACK: u8 = 0x07;
pub const NAK: u8 = 0x15;

/// Echoed back when the initiator asks for a lossiness check.
pub const PROBE: &[u8; 23] = b"\x1b[32mhello world\x1b[39m!\n";

const PURGE_IDLE: Duration = Duration::from_millis(10);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// The echo of a sequence token. The high bit keeps it clear of the
/// reserved control bytes.
pub fn echo(token: u8) -> u8 {
    token.wrapping_add(1) | 0x80
}

type Result<T> = std::result::Result<T, SerialError>;

/// Runs either side of the SYN/ACK/NAK exchange.
pub struct Handshaker {
    rng: StdRng,
    timeout: Duration,
    debug: bool,
    /// Responder bytes read from the link but not yet consumed.
    pending: VecDeque<u8>,
}

impl Default for Handshaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshaker {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// A handshaker with reproducible sequence tokens.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            rng,
            timeout: DEFAULT_TIMEOUT,
            debug: false,
            pending: VecDeque::new(),
        }
    }

    /// How long to wait for the peer's answer within one attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the responder for the post-handshake lossiness probe.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Initiate until the link is synchronized or `cancel` fires.
    pub async fn initiate_until<S>(&mut self, conn: &mut S, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SerialError::Cancelled),
                r = self.initiate(conn) => r,
            };
            match result {
                Ok(()) => {
                    tracing::info!(attempts, "initiator: handshake complete");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!("initiator: retrying after {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Respond until the link is synchronized or `cancel` fires.
    pub async fn respond_until<S>(&mut self, conn: &mut S, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.pending.clear();
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SerialError::Cancelled),
                r = self.respond(conn) => r,
            };
            match result {
                Ok(()) => {
                    tracing::info!(attempts, "responder: handshake complete");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!("responder: retrying after {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One initiator attempt.
    pub async fn initiate<S>(&mut self, conn: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        purge_incoming(conn).await?;

        let p: u8 = self.rng.r#gen();
        conn.write_all(&[SYN, p]).await?;
        conn.flush().await?;

        let synack = bounded(self.timeout, read_synack(conn)).await?;
        if synack[0] != ACK || synack[1] != echo(p) {
            let msg = format!(
                "did not receive synack: {:#04x?} != [{:#04x}, {:#04x}]",
                &synack[..2],
                ACK,
                echo(p)
            );
            conn.write_all(&[NAK]).await?;
            return Err(SerialError::Handshake(msg));
        }
        tracing::debug!("initiator: received synack {:#04x?}", synack);

        let flag = if self.debug { DEBUG_ACK } else { ACK };
        conn.write_all(&[flag, echo(synack[2])]).await?;
        conn.flush().await?;

        if self.debug {
            conn.write_all(PROBE).await?;
            conn.flush().await?;
            let mut rx = [0u8; PROBE.len()];
            bounded(self.timeout, async { conn.read_exact(&mut rx).await.map_err(SerialError::from) })
                .await?;
            if &rx != PROBE {
                conn.write_all(&[NAK]).await?;
                return Err(SerialError::Lossy(format!("initiator received {:#04x?}", rx)));
            }
            conn.write_all(&[ACK]).await?;
            conn.flush().await?;
            tracing::info!("initiator: lossiness check passed");
        }

        Ok(())
    }

    /// One responder attempt.
    ///
    /// Waits for a SYN without a deadline, since the peer may not exist yet.
    pub async fn respond<S>(&mut self, conn: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let p = self.await_syn(conn).await?;

        let q: u8 = self.rng.r#gen();
        conn.write_all(&[ACK, echo(p), q]).await?;
        conn.flush().await?;

        let mut ack = [0u8; 2];
        for slot in ack.iter_mut() {
            *slot = bounded(self.timeout, next_byte(&mut self.pending, conn)).await?;
        }
        if (ack[0] != ACK && ack[0] != DEBUG_ACK) || ack[1] != echo(q) {
            conn.write_all(&[NAK]).await?;
            // the second byte may be the start of a fresh SYN
            self.pending.push_front(ack[1]);
            return Err(SerialError::Handshake(format!(
                "did not receive ack: {:#04x?} != [{:#04x}, {:#04x}]",
                ack,
                ACK,
                echo(q)
            )));
        }
        tracing::debug!("responder: received ack {:#04x?}", ack);

        if ack[0] == DEBUG_ACK {
            let mut rx = [0u8; PROBE.len()];
            for slot in rx.iter_mut() {
                *slot = bounded(self.timeout, next_byte(&mut self.pending, conn)).await?;
            }
            conn.write_all(&rx).await?;
            conn.flush().await?;

            let done = bounded(self.timeout, next_byte(&mut self.pending, conn)).await?;
            if done != ACK {
                return Err(SerialError::Lossy(format!(
                    "responder expected ack, got {:#04x}",
                    done
                )));
            }
            tracing::info!("responder: lossiness check passed");
        }

        Ok(())
    }

    /// Discard input until `[SYN, p]` and return `p`.
    async fn await_syn<S>(&mut self, conn: &mut S) -> Result<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            if self.pending.is_empty() {
                let mut buf = [0u8; 256];
                let n = conn.read(&mut buf).await?;
                if n == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                }
                self.pending.extend(&buf[..n]);
            }

            match self.pending.iter().position(|b| *b == SYN) {
                Some(0) => break,
                Some(pos) => {
                    tracing::debug!("responder: discarding {} bytes before SYN", pos);
                    self.pending.drain(..pos);
                    conn.write_all(&[NAK]).await?;
                    break;
                }
                None => {
                    tracing::debug!("responder: discarding {} bytes", self.pending.len());
                    self.pending.clear();
                    conn.write_all(&[NAK]).await?;
                }
            }
        }

        self.pending.pop_front();
        next_byte(&mut self.pending, conn).await
    }

}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| SerialError::Timeout)?
}

/// Drain whatever is already waiting on the link.
///
/// Returns once the link has been idle for a short while.
pub async fn purge_incoming<S>(conn: &mut S) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 255];
    let mut discarded = 0;
    loop {
        match tokio::time::timeout(PURGE_IDLE, conn.read(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                tracing::debug!("discarding following {} bytes from input channel", n);
                discarded += n;
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(discarded)
}

/// Read the three synack bytes, skipping NAKs left over from the peer
/// discarding our earlier garbage.
async fn read_synack<S>(conn: &mut S) -> Result<[u8; 3]>
where
    S: AsyncRead + Unpin,
{
    let mut first = conn.read_u8().await?;
    while first == NAK {
        first = conn.read_u8().await?;
    }
    let mut rest = [0u8; 2];
    conn.read_exact(&mut rest).await?;
    Ok([first, rest[0], rest[1]])
}

async fn next_byte<S>(pending: &mut VecDeque<u8>, conn: &mut S) -> Result<u8>
where
    S: AsyncRead + Unpin,
{
    match pending.pop_front() {
        Some(b) => Ok(b),
        None => Ok(conn.read_u8().await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    /// Drops every NAK written through it.
    struct NakLoss(DuplexStream);

    impl AsyncRead for NakLoss {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for NakLoss {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let kept: Vec<u8> = buf.iter().copied().filter(|b| *b != NAK).collect();
            if kept.is_empty() {
                return Poll::Ready(Ok(buf.len()));
            }
            match Pin::new(&mut self.0).poll_write(cx, &kept) {
                Poll::Ready(Ok(n)) if n == kept.len() => Poll::Ready(Ok(buf.len())),
                Poll::Ready(Ok(_)) => Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "partial write in test transport",
                ))),
                other => other,
            }
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    fn garbage(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.r#gen()).collect()
    }

    async fn run_pair<S>(mut a: S, b: S, seed: u64, debug: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let responder = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut hs = Handshaker::with_seed(seed ^ 0x5a5a).timeout(Duration::from_millis(200));
                let mut b = b;
                let r = hs.respond_until(&mut b, &cancel).await;
                (r, b)
            })
        };

        let mut hs = Handshaker::with_seed(seed)
            .timeout(Duration::from_millis(200))
            .debug(debug);
        let initiated = tokio::time::timeout(
            Duration::from_secs(30),
            hs.initiate_until(&mut a, &cancel),
        )
        .await
        .expect("initiator did not converge");
        initiated.unwrap();

        let (responded, mut b) = tokio::time::timeout(Duration::from_secs(30), responder)
            .await
            .expect("responder did not converge")
            .unwrap();
        responded.unwrap();

        // the link carries payload afterwards
        a.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        let mut line = [0u8; 14];
        b.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"SSH-2.0-test\r\n");
    }

    #[tokio::test]
    async fn test_clean_link() {
        let (a, b) = duplex(64 * 1024);
        run_pair(a, b, 1, false).await;
    }

    #[tokio::test]
    async fn test_garbage_prefix_both_directions() {
        for (seed, len) in [(7u64, 1usize), (11, 100), (13, 4096)] {
            let (mut a, mut b) = duplex(64 * 1024);
            let mut junk = garbage(len, seed);
            // make sure a stray SYN is in there
            junk[len / 2] = SYN;
            a.write_all(&junk).await.unwrap();
            b.write_all(&garbage(len, seed + 1)).await.unwrap();
            run_pair(a, b, seed, false).await;
        }
    }

    #[tokio::test]
    async fn test_converges_under_nak_loss() {
        for seed in 0..8u64 {
            let (a, b) = duplex(64 * 1024);
            let (mut a, b) = (NakLoss(a), NakLoss(b));
            a.write_all(&garbage(512, seed)).await.unwrap();
            run_pair(a, b, seed, false).await;
        }
    }

    #[tokio::test]
    async fn test_debug_probe() {
        let (a, b) = duplex(64 * 1024);
        run_pair(a, b, 3, true).await;
    }

    #[tokio::test]
    async fn test_responder_naks_bad_ack() {
        let (mut client, mut server) = duplex(1024);
        let responder = tokio::spawn(async move {
            let mut hs = Handshaker::with_seed(9).timeout(Duration::from_millis(200));
            hs.respond(&mut server).await
        });

        client.write_all(&[SYN, 200]).await.unwrap();
        let mut synack = [0u8; 3];
        client.read_exact(&mut synack).await.unwrap();
        assert_eq!(synack[0], ACK);
        assert_eq!(synack[1], echo(200));

        client.write_all(&[ACK, echo(synack[2]) ^ 0x01]).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), NAK);
        let err = responder.await.unwrap().unwrap_err();
        assert!(matches!(err, SerialError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_responder() {
        let (_client, mut server) = duplex(1024);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { Handshaker::new().respond_until(&mut server, &cancel).await })
        };
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SerialError::Cancelled));
    }

    #[tokio::test]
    async fn test_closed_link_is_not_retried() {
        let (client, mut server) = duplex(1024);
        drop(client);
        let cancel = CancellationToken::new();
        let err = Handshaker::new()
            .respond_until(&mut server, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SerialError::Io(_)));
    }

    #[test]
    fn test_echo_sets_high_bit() {
        for t in 0..=255u8 {
            let e = echo(t);
            assert!(e & 0x80 != 0);
            assert!(![SYN, ACK, DEBUG_ACK, NAK].contains(&e));
        }
    }
}
