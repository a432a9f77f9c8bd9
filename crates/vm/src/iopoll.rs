//! I/O event notification.
//!
//! One contract: given a set of file descriptors and a timeout, return
//! the subset that is ready for reading. `poll(2)` provides it without
//! a descriptor-count ceiling; the scheduler neither knows nor cares
//! which facility sits underneath.

use crate::error::{VmError, VmResult};

/// Wait up to `timeout_ms` (-1 for no limit) for any of `fds` to become
/// readable; returns the ready subset. Descriptors that hung up or
/// errored count as readable so their owners get to observe it.
pub fn poll_read(fds: &[i32], timeout_ms: i32) -> VmResult<Vec<i32>> {
    if fds.is_empty() {
        return Ok(Vec::new());
    }
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            // Interrupted waits just look like a timeout to the caller.
            return Ok(Vec::new());
        }
        return Err(VmError::io(err.to_string()));
    }
    Ok(pollfds
        .iter()
        .filter(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .map(|p| p.fd)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed");
        (fds[0], fds[1])
    }

    #[test]
    fn empty_set_returns_immediately() {
        assert_eq!(poll_read(&[], -1).expect("poll"), Vec::<i32>::new());
    }

    #[test]
    fn readable_pipe_is_reported() {
        let (r, w) = pipe();
        let wrote = unsafe { libc::write(w, b"x".as_ptr().cast(), 1) };
        assert_eq!(wrote, 1);
        assert_eq!(poll_read(&[r], 1000).expect("poll"), vec![r]);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn idle_pipe_times_out() {
        let (r, w) = pipe();
        assert_eq!(poll_read(&[r], 0).expect("poll"), Vec::<i32>::new());
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
