//! SSH data type encoding (RFC 4251 section 5).

use crate::AttachError;

/// Appends SSH-encoded values to a buffer.
pub trait Put {
    fn put_u8(&mut self, v: u8);
    fn put_u32(&mut self, v: u32);
    fn put_bool(&mut self, v: bool);
    fn put_string(&mut self, v: &[u8]);
    fn put_name_list(&mut self, names: &[&str]);
    /// Unsigned big-endian magnitude as an mpint.
    fn put_mpint(&mut self, magnitude: &[u8]);
}

impl Put for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_bool(&mut self, v: bool) {
        self.push(v as u8);
    }

    fn put_string(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.extend_from_slice(v);
    }

    fn put_name_list(&mut self, names: &[&str]) {
        self.put_string(names.join(",").as_bytes());
    }

    fn put_mpint(&mut self, magnitude: &[u8]) {
        let start = magnitude.iter().position(|b| *b != 0).unwrap_or(magnitude.len());
        let digits = &magnitude[start..];
        if digits.first().is_some_and(|b| b & 0x80 != 0) {
            self.put_u32(digits.len() as u32 + 1);
            self.push(0);
        } else {
            self.put_u32(digits.len() as u32);
        }
        self.extend_from_slice(digits);
    }
}

/// Reads SSH-encoded values off a message.
pub struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], AttachError> {
        if self.buf.len() < n {
            return Err(AttachError::protocol(format!(
                "message truncated: wanted {} bytes, have {}",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, AttachError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, AttachError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn bool(&mut self) -> Result<bool, AttachError> {
        Ok(self.u8()? != 0)
    }

    pub fn string(&mut self) -> Result<&'a [u8], AttachError> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    pub fn utf8(&mut self) -> Result<String, AttachError> {
        let raw = self.string()?;
        String::from_utf8(raw.to_vec()).map_err(|_| AttachError::protocol("string is not UTF-8"))
    }

    pub fn name_list(&mut self) -> Result<Vec<String>, AttachError> {
        let list = self.utf8()?;
        if list.is_empty() {
            return Ok(Vec::new());
        }
        Ok(list.split(',').map(str::to_string).collect())
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpint_encoding() {
        let cases: &[(&[u8], &[u8])] = &[
            (&[], &[0, 0, 0, 0]),
            (&[0, 0], &[0, 0, 0, 0]),
            (&[0x09, 0xa3], &[0, 0, 0, 2, 0x09, 0xa3]),
            (&[0x00, 0x80], &[0, 0, 0, 2, 0x00, 0x80]),
            (&[0xff, 0x01], &[0, 0, 0, 3, 0x00, 0xff, 0x01]),
        ];
        for (magnitude, want) in cases {
            let mut out = Vec::new();
            out.put_mpint(magnitude);
            assert_eq!(&out, want, "mpint of {:02x?}", magnitude);
        }
    }

    #[test]
    fn test_cursor_reads_back() {
        let mut msg = Vec::new();
        msg.put_u8(98);
        msg.put_u32(7);
        msg.put_string(b"window-change");
        msg.put_bool(true);
        msg.put_name_list(&["tee1", "tee2"]);
        msg.extend_from_slice(b"tail");

        let mut c = Cursor::new(&msg);
        assert_eq!(c.u8().unwrap(), 98);
        assert_eq!(c.u32().unwrap(), 7);
        assert_eq!(c.utf8().unwrap(), "window-change");
        assert!(c.bool().unwrap());
        assert_eq!(c.name_list().unwrap(), vec!["tee1", "tee2"]);
        assert_eq!(c.rest(), b"tail");
        assert!(c.u8().is_err());
    }

    #[test]
    fn test_empty_name_list() {
        let mut msg = Vec::new();
        msg.put_name_list(&[]);
        assert!(Cursor::new(&msg).name_list().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_string() {
        let msg = [0, 0, 0, 9, b'a'];
        assert!(matches!(
            Cursor::new(&msg).string(),
            Err(AttachError::Protocol(_))
        ));
    }
}
