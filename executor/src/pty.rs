//! Pseudo-terminal pairs for tty sessions.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};

/// Terminal dimensions as carried by a window-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
    pub width_px: u16,
    pub height_px: u16,
}

pub struct PtyPair {
    pub master: File,
    pub slave: File,
}

pub fn openpty() -> io::Result<PtyPair> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;

    if unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    } < 0
    {
        return Err(io::Error::last_os_error());
    }

    for fd in [master, slave] {
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }

    Ok(PtyPair {
        master: unsafe { File::from_raw_fd(master) },
        slave: unsafe { File::from_raw_fd(slave) },
    })
}

pub fn resize(pty: &File, size: WindowSize) -> io::Result<()> {
    let ws = libc::winsize {
        ws_row: size.rows,
        ws_col: size.columns,
        ws_xpixel: size.width_px,
        ws_ypixel: size.height_px,
    };

    if unsafe { libc::ioctl(pty.as_raw_fd(), libc::TIOCSWINSZ, &ws) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn size(pty: &File) -> io::Result<WindowSize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(pty.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(WindowSize {
        columns: ws.ws_col,
        rows: ws.ws_row,
        width_px: ws.ws_xpixel,
        height_px: ws.ws_ypixel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_round_trips_through_kernel() {
        let pair = openpty().unwrap();
        let want = WindowSize {
            columns: 132,
            rows: 43,
            width_px: 0,
            height_px: 0,
        };
        resize(&pair.master, want).unwrap();
        assert_eq!(size(&pair.slave).unwrap(), want);
    }
}
