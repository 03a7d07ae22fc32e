//! Bring `lo` up before anything else listens on localhost.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

fn request(name: &str) -> io::Result<IfReq> {
    // SAFETY: IfReq is plain old data; all-zero is a valid value.
    let mut req: IfReq = unsafe { std::mem::zeroed() };
    if name.len() >= req.name.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    Ok(req)
}

/// Set the UP flag on interface `name`, keeping its other flags.
pub fn link_up(name: &str) -> io::Result<()> {
    // SAFETY: plain socket(2); ownership moves into OwnedFd right away.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut req = request(name)?;
    // SAFETY: req is a valid ifreq for the lifetime of both calls.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    req.flags |= libc::IFF_UP as libc::c_short;
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn setup_loopback() -> io::Result<()> {
    link_up("lo")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_name() {
        let req = request("lo").unwrap();
        assert_eq!(req.name[0], b'l' as libc::c_char);
        assert_eq!(req.name[1], b'o' as libc::c_char);
        assert_eq!(req.name[2], 0);
        assert_eq!(req.flags, 0);
    }

    #[test]
    fn test_long_name_rejected() {
        assert!(request("a-name-far-too-long").is_err());
    }
}
