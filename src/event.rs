//! The per-socket "event fd" (§5, §6).
//!
//! Every XCM socket exposes exactly one file descriptor to the user's event
//! loop, always in read-ready mode regardless of which direction actually
//! became ready. We get this almost for free from the kernel: an `epoll`
//! instance is itself pollable, and becomes readable whenever any fd
//! registered *inside* it has a pending event -- independent of whether that
//! inner registration was for read or write interest. So each socket owns a
//! private epoll instance, registers its real descriptors into it (the
//! kernel socket fd, the CTL listener/client fds, and for UTLS the two
//! sub-sockets' own nested epoll fds), and hands that epoll fd to the caller
//! as "the" event fd.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::XcmError;

/// Interest a registered descriptor wants to be woken up for. Mirrors the
/// desired-condition bitset but at the level of a single underlying fd
/// rather than a whole socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest { readable: true, writable: false };
    pub const WRITE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };
    pub const NONE: Interest = Interest { readable: false, writable: false };

    fn to_epoll_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// A token identifying one descriptor registered into a socket's event fd,
/// opaque to callers -- just the raw fd value, since epoll keys off the fd
/// itself.
pub type Token = RawFd;

/// Owns a private epoll instance used as this socket's public event fd.
pub struct EventFd {
    epoll: Epoll,
}

impl EventFd {
    pub fn new() -> Result<Self, XcmError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll })
    }

    /// The raw fd to hand to the user's own event loop / outer epoll.
    pub fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    /// Registers (or re-registers) a descriptor with the given interest.
    /// Idempotent: calling with the same interest twice is a harmless no-op
    /// at the epoll level (`EPOLL_CTL_MOD` is always used after the first
    /// `EPOLL_CTL_ADD`).
    pub fn arm(&self, fd: BorrowedFd<'_>, token: Token, interest: Interest) -> Result<(), XcmError> {
        let mut event = EpollEvent::new(interest.to_epoll_flags(), token as u64);
        match self.epoll.add(fd, event) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EEXIST) => {
                self.epoll.modify(fd, &mut event)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deregisters a descriptor. Safe to call on a descriptor that was never
    /// armed, or was already removed (idempotent).
    pub fn disarm(&self, fd: BorrowedFd<'_>) -> Result<(), XcmError> {
        match self.epoll.delete(fd) {
            Ok(()) | Err(nix::errno::Errno::ENOENT) | Err(nix::errno::Errno::EBADF) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Registers another socket's event fd as a nested source -- this is how
    /// UTLS (§4.5.6) arms both sub-sockets on the same externally-visible
    /// fd: their own private epoll fds are themselves pollable descriptors.
    pub fn arm_nested(&self, child: &EventFd, token: Token) -> Result<(), XcmError> {
        // SAFETY: `child` outlives this borrow; epoll only reads the fd number.
        let fd = unsafe { BorrowedFd::borrow_raw(child.as_raw_fd()) };
        self.arm(fd, token, Interest::READ)
    }

    pub fn disarm_nested(&self, child: &EventFd) -> Result<(), XcmError> {
        let fd = unsafe { BorrowedFd::borrow_raw(child.as_raw_fd()) };
        self.disarm(fd)
    }

    /// Polls with a zero timeout, returning the tokens of descriptors that
    /// are currently ready. Used by tests and by transports that need to
    /// distinguish *which* inner fd woke the outer one up (e.g. CTL).
    pub fn poll_ready(&self) -> Result<Vec<Token>, XcmError> {
        let mut events = [EpollEvent::empty(); 16];
        let n = self.epoll.wait(&mut events, EpollTimeout::ZERO)?;
        Ok(events[..n].iter().map(|e| e.data() as Token).collect())
    }

    /// True if this event fd currently has at least one pending event --
    /// i.e. whether a user polling it would see it as readable.
    pub fn is_ready(&self) -> Result<bool, XcmError> {
        Ok(!self.poll_ready()?.is_empty())
    }

    /// Blocks indefinitely until at least one registered descriptor is
    /// ready. Used by the public API's blocking-mode retry loop (§5's
    /// "suspension points"); non-blocking callers never call this.
    pub fn wait_ready(&self) -> Result<(), XcmError> {
        let mut events = [EpollEvent::empty(); 16];
        self.epoll.wait(&mut events, EpollTimeout::NONE)?;
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}

/// Converts an owned fd into the epoll-friendly `BorrowedFd` for the
/// duration of a call; transports hold their real sockets as `OwnedFd`/
/// typed wrappers and borrow them only to (de)register.
pub fn borrow(fd: &OwnedFd) -> BorrowedFd<'_> {
    fd.as_fd()
}

use std::os::fd::AsFd;
