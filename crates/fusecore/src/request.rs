//! The context of an incoming request.

use crate::errno::Errno;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A token signalling that the caller of a request gave up waiting.
#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the associated request as interrupted.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The per-request context passed to every operation.
#[derive(Clone, Debug)]
pub struct Request {
    unique: u64,
    uid: u32,
    gid: u32,
    pid: u32,
    interrupt: Interrupt,
}

impl Request {
    /// Create a request issued by the superuser.
    pub fn new(unique: u64) -> Self {
        Self {
            unique,
            uid: 0,
            gid: 0,
            pid: 0,
            interrupt: Interrupt::new(),
        }
    }

    /// Set the credentials of the calling process.
    pub fn credentials(mut self, uid: u32, gid: u32, pid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self.pid = pid;
        self
    }

    /// Attach the token through which this request gets interrupted.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Return the unique ID of the request.
    #[inline]
    pub fn unique(&self) -> u64 {
        self.unique
    }

    /// Return the user ID of the calling process.
    #[inline]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Return the group ID of the calling process.
    #[inline]
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Return the process ID of the calling process.
    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Fail with `Interrupted` if the caller gave up on this request.
    pub fn check_interrupt(&self) -> Result<(), Errno> {
        if self.interrupt.is_interrupted() {
            return Err(Errno::Interrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_is_shared() {
        let token = Interrupt::new();
        let req = Request::new(1).with_interrupt(token.clone());
        assert_eq!(req.check_interrupt(), Ok(()));
        token.interrupt();
        assert_eq!(req.check_interrupt(), Err(Errno::Interrupted));
    }
}
