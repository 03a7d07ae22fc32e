//! Binary packet protection: aes128-ctr with hmac-sha2-256.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::AttachError;

pub const CIPHER: &str = "aes128-ctr";
pub const MAC: &str = "hmac-sha2-256";

pub const BLOCK_SIZE: usize = 16;
pub const KEY_LEN: usize = 16;
pub const MAC_LEN: usize = 32;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Key material for one direction of the connection.
pub struct DirectionKeys {
    pub iv: Vec<u8>,
    pub key: Vec<u8>,
    pub mac: Vec<u8>,
}

/// RFC 4253 section 7.2 key derivation.
pub fn derive(shared: &[u8], hash: &[u8], letter: u8, session_id: &[u8], len: usize) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(shared);
    h.update(hash);
    h.update([letter]);
    h.update(session_id);
    let mut out = h.finalize().to_vec();
    while out.len() < len {
        let mut h = Sha256::new();
        h.update(shared);
        h.update(hash);
        h.update(&out);
        out.extend_from_slice(&h.finalize());
    }
    out.truncate(len);
    out
}

impl DirectionKeys {
    /// Letters are `A`/`C`/`E` for client to server and `B`/`D`/`F` back.
    pub fn derive(shared: &[u8], hash: &[u8], session_id: &[u8], client_to_server: bool) -> Self {
        let (iv, key, mac) = if client_to_server {
            (b'A', b'C', b'E')
        } else {
            (b'B', b'D', b'F')
        };
        Self {
            iv: derive(shared, hash, iv, session_id, BLOCK_SIZE),
            key: derive(shared, hash, key, session_id, KEY_LEN),
            mac: derive(shared, hash, mac, session_id, MAC_LEN),
        }
    }
}

pub struct Cipher {
    stream: Aes128Ctr,
    mac_key: Vec<u8>,
}

impl Cipher {
    pub fn new(keys: &DirectionKeys) -> Result<Self, AttachError> {
        let stream = Aes128Ctr::new_from_slices(&keys.key, &keys.iv)
            .map_err(|_| AttachError::protocol("bad aes128-ctr key length"))?;
        Ok(Self {
            stream,
            mac_key: keys.mac.clone(),
        })
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        self.stream.apply_keystream(buf);
    }

    fn hmac(&self, seq: u32, packet: &[u8]) -> Result<HmacSha256, AttachError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|_| AttachError::protocol("bad hmac key length"))?;
        mac.update(&seq.to_be_bytes());
        mac.update(packet);
        Ok(mac)
    }

    /// MAC over the sequence number and the plaintext packet.
    pub fn sign(&self, seq: u32, packet: &[u8]) -> Result<Vec<u8>, AttachError> {
        Ok(self.hmac(seq, packet)?.finalize().into_bytes().to_vec())
    }

    pub fn check(&self, seq: u32, packet: &[u8], tag: &[u8]) -> Result<(), AttachError> {
        self.hmac(seq, packet)?
            .verify_slice(tag)
            .map_err(|_| AttachError::protocol(format!("bad MAC on packet {}", seq)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_lengths_and_letters() {
        let a = derive(b"k", b"h", b'A', b"sid", 16);
        let b = derive(b"k", b"h", b'B', b"sid", 16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        let long = derive(b"k", b"h", b'E', b"sid", 48);
        assert_eq!(&long[..32], &derive(b"k", b"h", b'E', b"sid", 32)[..]);
    }

    #[test]
    fn test_both_ends_agree() {
        let keys = DirectionKeys::derive(b"shared", b"hash", b"hash", true);
        let mut seal = Cipher::new(&keys).unwrap();
        let mut open = Cipher::new(&keys).unwrap();

        let plain = b"0123456789abcdef0123456789abcdef".to_vec();
        let tag = seal.sign(3, &plain).unwrap();
        let mut buf = plain.clone();
        seal.apply(&mut buf);
        assert_ne!(buf, plain);

        open.apply(&mut buf[..16]);
        open.apply(&mut buf[16..]);
        assert_eq!(buf, plain);
        open.check(3, &buf, &tag).unwrap();
        assert!(open.check(4, &buf, &tag).is_err());
    }
}
