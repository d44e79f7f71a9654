// src/syscalls.rs
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::{Error, Result};

// ---- Socket Operations ----

/// Create a non-blocking AF_UNIX stream listener at `path`.
///
/// Any stale socket file at the path is unlinked first; SO_REUSEADDR is set
/// and the backlog is 1024.
pub fn create_unix_listener(path: &Path) -> Result<RawFd> {
    let path_bytes = path.as_os_str().as_bytes();

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    if path_bytes.len() >= addr.sun_path.len() {
        return Err(Error::InvalidArgument(format!(
            "socket path too long ({} bytes, limit {})",
            path_bytes.len(),
            addr.sun_path.len() - 1
        )));
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(path_bytes) {
        *dst = *src as libc::c_char;
    }

    unlink_socket(path);

    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, 1024) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Accept one pending connection, already non-blocking.
/// Returns `Ok(None)` when the accept queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> Result<Option<RawFd>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(fd))
        }
    }
}

/// Raw non-blocking read. `Ok(0)` means the peer closed the stream;
/// `EAGAIN`/`EWOULDBLOCK` comes back as an error of kind `WouldBlock`.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Raw non-blocking write; same error convention as `read_nonblocking`.
pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// poll(2) over the given descriptor set. EINTR is reported as zero ready
/// descriptors so callers simply rebuild and retry.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: c_int) -> io::Result<usize> {
    unsafe {
        let res = libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(res as usize)
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Remove the socket file, ignoring a path that is already gone.
pub fn unlink_socket(path: &Path) {
    let _ = std::fs::remove_file(path);
}

// ---- Signal Operations ----

fn sigset_from(signals: &[c_int]) -> libc::sigset_t {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut mask);
        for &signum in signals {
            libc::sigaddset(&mut mask, signum);
        }
        mask
    }
}

/// Block the given signals for the calling thread. Threads spawned afterwards
/// inherit the mask, which is what routes delivery to the signalfd.
pub fn block_signals(signals: &[c_int]) -> io::Result<()> {
    let mask = sigset_from(signals);
    unsafe {
        if libc::sigprocmask(libc::SIG_BLOCK, &mask, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Unblock every signal for the calling thread.
pub fn unblock_all_signals() {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&mut mask);
        libc::sigprocmask(libc::SIG_UNBLOCK, &mask, ptr::null_mut());
    }
}

/// Create a non-blocking signalfd covering `signals`.
pub fn create_signalfd(signals: &[c_int]) -> io::Result<RawFd> {
    let mask = sigset_from(signals);
    unsafe {
        let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

/// Read one delivered signal from a signalfd. `Ok(None)` when drained.
pub fn read_signal(fd: RawFd) -> io::Result<Option<u32>> {
    unsafe {
        let mut info: libc::signalfd_siginfo = mem::zeroed();
        let want = mem::size_of::<libc::signalfd_siginfo>();
        let res = libc::read(fd, &mut info as *mut _ as *mut c_void, want);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        if res as usize != want {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short signalfd read",
            ));
        }
        Ok(Some(info.ssi_signo))
    }
}
