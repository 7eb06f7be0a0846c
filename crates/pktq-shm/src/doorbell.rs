//! Socketpair doorbell for waking a consumer in another process.
//!
//! The [`WaitQueue`](crate::WaitQueue) only reaches threads of this
//! process. When the rx queue is read by a companion process that mapped the
//! region itself, producers ring a doorbell instead: each side holds one end
//! of a Unix datagram socketpair and every ring is a 1-byte datagram.
//!
//! ```ignore
//! // Capture side: keep one end as the endpoint's notifier
//! let (doorbell, peer) = Doorbell::pair()?;
//! let endpoint = Endpoint::with_notifier(0, config, Arc::new(doorbell));
//! // ...hand `peer` to the reader process, then drop it here...
//!
//! // Reader process
//! let doorbell = Doorbell::from_fd(peer)?;
//! let rings = doorbell.wait().await?;
//! ```

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;

use tokio::io::unix::AsyncFd;

use crate::wake::Notifier;

/// One end of a wake-up socketpair.
///
/// Ringing is a plain non-blocking send. Waiting goes through the tokio
/// reactor, so [`pair`](Self::pair), [`from_fd`](Self::from_fd) and
/// [`wait`](Self::wait) need a runtime.
pub struct Doorbell {
    sock: AsyncFd<UnixDatagram>,
}

impl Doorbell {
    /// Create both ends. The second is returned as a raw owned fd, left
    /// inheritable so it survives `exec` into a reader process.
    pub fn pair() -> io::Result<(Self, OwnedFd)> {
        let (local, peer) = UnixDatagram::pair()?;
        peer.set_nonblocking(true)?;
        let peer = OwnedFd::from(peer);
        clear_cloexec(peer.as_raw_fd())?;
        Ok((Self::from_socket(local)?, peer))
    }

    /// Wrap an end received from [`pair`](Self::pair).
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        Self::from_socket(UnixDatagram::from(fd))
    }

    fn from_socket(sock: UnixDatagram) -> io::Result<Self> {
        sock.set_nonblocking(true)?;
        // SAFETY: the AsyncFd owns the socket, so the fd stays open and
        // unchanged until it drops.
        let sock = unsafe { AsyncFd::register(sock) }?;
        Ok(Self { sock })
    }

    /// Ring the other side. Never blocks.
    pub fn ring(&self) {
        match self.sock.get_ref().send(&[1]) {
            Ok(_) => {}
            // Socket buffer full: the peer has unread rings already.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "doorbell ring failed"),
        }
    }

    /// Wait for at least one ring and consume every pending one.
    ///
    /// Returns how many rings were consumed.
    pub async fn wait(&self) -> io::Result<usize> {
        let mut buf = [0u8; 16];
        loop {
            let mut guard = self.sock.readable().await?;
            match guard.try_io(|sock| sock.get_ref().recv(&mut buf)) {
                Ok(Ok(0)) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(Ok(_)) => return Ok(1 + self.drain()),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Consume pending rings without waiting. Returns how many there were.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 16];
        let mut rings = 0;
        loop {
            match self.sock.get_ref().recv(&mut buf) {
                Ok(0) => return rings,
                Ok(_) => rings += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return rings,
                Err(e) => {
                    tracing::warn!(error = %e, "doorbell drain failed");
                    return rings;
                }
            }
        }
    }
}

impl AsRawFd for Doorbell {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.get_ref().as_raw_fd()
    }
}

impl Notifier for Doorbell {
    /// The reader lives in another process; assume it may be parked.
    fn has_waiters(&self) -> bool {
        true
    }

    fn wake(&self) {
        self.ring();
    }
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an fd we own, with no pointer arguments.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wake_reaches_peer() {
        let (producer, peer) = Doorbell::pair().unwrap();
        let reader = Doorbell::from_fd(peer).unwrap();

        assert!(producer.has_waiters());
        producer.wake();

        let rings = tokio::time::timeout(Duration::from_millis(100), reader.wait())
            .await
            .expect("timeout waiting for doorbell")
            .expect("wait failed");
        assert_eq!(rings, 1);
    }

    #[tokio::test]
    async fn test_repeated_rings_coalesce() {
        let (producer, peer) = Doorbell::pair().unwrap();
        let reader = Doorbell::from_fd(peer).unwrap();

        for _ in 0..100 {
            producer.ring();
        }

        let rings = tokio::time::timeout(Duration::from_millis(100), reader.wait())
            .await
            .expect("timeout")
            .expect("wait failed");
        assert_eq!(rings, 100);
        assert_eq!(reader.drain(), 0);
    }

    #[tokio::test]
    async fn test_registered_socket_keeps_its_fd() {
        let (producer, peer) = Doorbell::pair().unwrap();
        let raw = peer.as_raw_fd();
        let reader = Doorbell::from_fd(peer).unwrap();
        assert_eq!(reader.sock.get_ref().as_raw_fd(), raw);

        producer.ring();
        let rings = tokio::time::timeout(Duration::from_millis(100), reader.wait())
            .await
            .expect("timeout")
            .expect("wait failed");
        assert_eq!(rings, 1);
    }

    #[tokio::test]
    async fn test_peer_fd_is_inheritable() {
        let (_producer, peer) = Doorbell::pair().unwrap();
        let flags = unsafe { libc::fcntl(peer.as_raw_fd(), libc::F_GETFD) };
        assert!(flags >= 0);
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
    }
}
