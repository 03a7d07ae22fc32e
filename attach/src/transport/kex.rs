//! Algorithm negotiation and curve25519-sha256 key exchange (RFC 8731).

use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::cipher::{self, Cipher, DirectionKeys};
use super::hostkey::{self, HostKey};
use super::{PacketReader, PacketWriter};
use crate::AttachError;
use crate::msgs::{MSG_KEX_ECDH_INIT, MSG_KEX_ECDH_REPLY, MSG_KEXINIT, MSG_NEWKEYS};
use crate::wire::{Cursor, Put};

pub const KEX_ALGORITHMS: &[&str] = &["curve25519-sha256", "curve25519-sha256@libssh.org"];
const COMPRESSION: &str = "none";

/// The identification strings exchanged before the first packet.
pub struct Versions {
    pub client: String,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    pub kex: Vec<String>,
    pub host_key: Vec<String>,
    pub cipher_c2s: Vec<String>,
    pub cipher_s2c: Vec<String>,
    pub mac_c2s: Vec<String>,
    pub mac_s2c: Vec<String>,
    pub compression_c2s: Vec<String>,
    pub compression_s2c: Vec<String>,
    pub first_kex_follows: bool,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl KexInit {
    /// What this implementation offers, on either side.
    pub fn ours() -> Self {
        Self {
            kex: names(KEX_ALGORITHMS),
            host_key: names(&[hostkey::ALGORITHM]),
            cipher_c2s: names(&[cipher::CIPHER]),
            cipher_s2c: names(&[cipher::CIPHER]),
            mac_c2s: names(&[cipher::MAC]),
            mac_s2c: names(&[cipher::MAC]),
            compression_c2s: names(&[COMPRESSION]),
            compression_s2c: names(&[COMPRESSION]),
            first_kex_follows: false,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut cookie = [0u8; 16];
        OsRng.fill_bytes(&mut cookie);

        let mut out = vec![MSG_KEXINIT];
        out.extend_from_slice(&cookie);
        for list in [
            &self.kex,
            &self.host_key,
            &self.cipher_c2s,
            &self.cipher_s2c,
            &self.mac_c2s,
            &self.mac_s2c,
            &self.compression_c2s,
            &self.compression_s2c,
        ] {
            let list: Vec<&str> = list.iter().map(String::as_str).collect();
            out.put_name_list(&list);
        }
        // languages
        out.put_name_list(&[]);
        out.put_name_list(&[]);
        out.put_bool(self.first_kex_follows);
        out.put_u32(0);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, AttachError> {
        let mut c = Cursor::new(payload);
        if c.u8()? != MSG_KEXINIT {
            return Err(AttachError::protocol("expected KEXINIT"));
        }
        for _ in 0..16 {
            c.u8()?;
        }
        let init = Self {
            kex: c.name_list()?,
            host_key: c.name_list()?,
            cipher_c2s: c.name_list()?,
            cipher_s2c: c.name_list()?,
            mac_c2s: c.name_list()?,
            mac_s2c: c.name_list()?,
            compression_c2s: c.name_list()?,
            compression_s2c: c.name_list()?,
            first_kex_follows: {
                c.name_list()?;
                c.name_list()?;
                c.bool()?
            },
        };
        Ok(init)
    }
}

/// The client's first preference the server also supports.
fn pick<'a>(what: &str, client: &'a [String], server: &[String]) -> Result<&'a str, AttachError> {
    client
        .iter()
        .find(|c| server.contains(c))
        .map(String::as_str)
        .ok_or_else(|| AttachError::protocol(format!("no common {} algorithm", what)))
}

/// Check every category has a usable algorithm and return the chosen key
/// exchange method.
pub fn negotiate<'a>(client: &'a KexInit, server: &KexInit) -> Result<&'a str, AttachError> {
    let kex = pick("key exchange", &client.kex, &server.kex)?;
    pick("host key", &client.host_key, &server.host_key)?;
    pick("cipher", &client.cipher_c2s, &server.cipher_c2s)?;
    pick("cipher", &client.cipher_s2c, &server.cipher_s2c)?;
    pick("MAC", &client.mac_c2s, &server.mac_c2s)?;
    pick("MAC", &client.mac_s2c, &server.mac_s2c)?;
    pick("compression", &client.compression_c2s, &server.compression_c2s)?;
    pick("compression", &client.compression_s2c, &server.compression_s2c)?;
    Ok(kex)
}

pub struct HashInput<'a> {
    pub versions: &'a Versions,
    pub client_init: &'a [u8],
    pub server_init: &'a [u8],
    pub host_key: &'a [u8],
    pub client_public: &'a [u8],
    pub server_public: &'a [u8],
    /// Shared secret, already mpint encoded.
    pub shared: &'a [u8],
}

pub fn exchange_hash(input: &HashInput<'_>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_string(input.versions.client.as_bytes());
    buf.put_string(input.versions.server.as_bytes());
    buf.put_string(input.client_init);
    buf.put_string(input.server_init);
    buf.put_string(input.host_key);
    buf.put_string(input.client_public);
    buf.put_string(input.server_public);
    buf.extend_from_slice(input.shared);
    Sha256::digest(&buf).to_vec()
}

fn agree(secret: EphemeralSecret, peer: &[u8]) -> Result<Vec<u8>, AttachError> {
    let peer: [u8; 32] = peer
        .try_into()
        .map_err(|_| AttachError::protocol("curve25519 public key must be 32 bytes"))?;
    let shared = secret.diffie_hellman(&PublicKey::from(peer));
    if !shared.was_contributory() {
        return Err(AttachError::protocol("degenerate curve25519 shared secret"));
    }
    let mut k = Vec::new();
    k.put_mpint(shared.as_bytes());
    Ok(k)
}

async fn expect<R: AsyncRead + Unpin>(r: &mut PacketReader<R>, msg: u8) -> Result<Vec<u8>, AttachError> {
    let payload = r.read().await?;
    if payload[0] != msg {
        return Err(AttachError::protocol(format!(
            "expected message {} during key exchange, got {}",
            msg, payload[0]
        )));
    }
    Ok(payload)
}

/// Run key exchange as the server. Returns the session identifier.
pub async fn serve<R, W>(
    r: &mut PacketReader<R>,
    w: &mut PacketWriter<W>,
    versions: &Versions,
    key: &HostKey,
) -> Result<Vec<u8>, AttachError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ours = KexInit::ours();
    let server_init = ours.marshal();
    w.write(&server_init).await?;

    let client_init = expect(r, MSG_KEXINIT).await?;
    let peer = KexInit::parse(&client_init)?;
    let kex = negotiate(&peer, &ours)?;
    if peer.first_kex_follows && peer.kex.first().map(String::as_str) != Some(kex) {
        // wrong guess, drop it
        r.read().await?;
    }

    let init = expect(r, MSG_KEX_ECDH_INIT).await?;
    let client_public = Cursor::new(&init[1..]).string()?.to_vec();

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&secret);
    let shared = agree(secret, &client_public)?;
    let host_key = key.public_blob();
    let hash = exchange_hash(&HashInput {
        versions,
        client_init: &client_init,
        server_init: &server_init,
        host_key: &host_key,
        client_public: &client_public,
        server_public: server_public.as_bytes(),
        shared: &shared,
    });

    let mut reply = vec![MSG_KEX_ECDH_REPLY];
    reply.put_string(&host_key);
    reply.put_string(server_public.as_bytes());
    reply.put_string(&key.sign(&hash));
    w.write(&reply).await?;

    w.write(&[MSG_NEWKEYS]).await?;
    w.enable(Cipher::new(&DirectionKeys::derive(&shared, &hash, &hash, false))?);
    expect(r, MSG_NEWKEYS).await?;
    r.enable(Cipher::new(&DirectionKeys::derive(&shared, &hash, &hash, true))?);

    tracing::debug!(kex, "key exchange complete");
    Ok(hash)
}

/// Run key exchange as the client. Returns the session identifier and the
/// server's host key blob, whose signature has been checked.
pub async fn connect<R, W>(
    r: &mut PacketReader<R>,
    w: &mut PacketWriter<W>,
    versions: &Versions,
) -> Result<(Vec<u8>, Vec<u8>), AttachError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ours = KexInit::ours();
    let client_init = ours.marshal();
    w.write(&client_init).await?;

    let server_init = expect(r, MSG_KEXINIT).await?;
    let peer = KexInit::parse(&server_init)?;
    let kex = negotiate(&ours, &peer)?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let client_public = PublicKey::from(&secret);
    let mut init = vec![MSG_KEX_ECDH_INIT];
    init.put_string(client_public.as_bytes());
    w.write(&init).await?;

    let reply = expect(r, MSG_KEX_ECDH_REPLY).await?;
    let mut c = Cursor::new(&reply[1..]);
    let host_key = c.string()?.to_vec();
    let server_public = c.string()?.to_vec();
    let signature = c.string()?.to_vec();

    let shared = agree(secret, &server_public)?;
    let hash = exchange_hash(&HashInput {
        versions,
        client_init: &client_init,
        server_init: &server_init,
        host_key: &host_key,
        client_public: client_public.as_bytes(),
        server_public: &server_public,
        shared: &shared,
    });
    hostkey::verify(&host_key, &hash, &signature)?;

    w.write(&[MSG_NEWKEYS]).await?;
    w.enable(Cipher::new(&DirectionKeys::derive(&shared, &hash, &hash, true))?);
    expect(r, MSG_NEWKEYS).await?;
    r.enable(Cipher::new(&DirectionKeys::derive(&shared, &hash, &hash, false))?);

    tracing::debug!(kex, "key exchange complete");
    Ok((hash, host_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kexinit_parses_back() {
        let ours = KexInit::ours();
        let wire = ours.marshal();
        assert_eq!(wire[0], MSG_KEXINIT);
        assert_eq!(KexInit::parse(&wire).unwrap(), ours);
    }

    #[test]
    fn test_negotiate_prefers_client_order() {
        let server = KexInit::ours();
        let mut client = KexInit::ours();
        client.kex = names(&["diffie-hellman-group14-sha256", "curve25519-sha256@libssh.org"]);
        assert_eq!(negotiate(&client, &server).unwrap(), "curve25519-sha256@libssh.org");

        client.cipher_s2c = names(&["chacha20-poly1305@openssh.com"]);
        let err = negotiate(&client, &server).unwrap_err();
        assert!(err.to_string().contains("no common cipher"), "{}", err);
    }
}
