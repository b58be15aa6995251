//! Dual-completion join for one in-flight request.
//!
//! A request is finished by two independent signals: the engine reporting
//! the transfer complete, and the reactor confirming that every socket
//! context bound to the request has closed. They arrive in either order,
//! sometimes within the same drain cycle. `Lifecycle` counts open socket
//! contexts and tracks engine completion, and reports release exactly once.
//!
//! ```text
//!            engine done               last socket closed
//!  Active ───────────────► EngineDone ───────────────────► Released
//!    │  ▲                                                      ▲
//!    │  └── socket opened (reconnect)                          │
//!    └──────► SocketClosed ────────────────────────────────────┘
//!   last socket closed              engine done
//! ```

use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    EngineDone,
    SocketClosed,
    Released,
}

#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    open_sockets: u32,
    sockets_seen: bool,
    engine_done: bool,
    released: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        if self.released {
            Phase::Released
        } else if self.engine_done {
            Phase::EngineDone
        } else if self.sockets_seen && self.open_sockets == 0 {
            Phase::SocketClosed
        } else {
            Phase::Active
        }
    }

    pub fn open_sockets(&self) -> u32 {
        self.open_sockets
    }

    /// A socket context bound to this request started being watched.
    pub fn socket_opened(&mut self) -> Result<(), LifecycleError> {
        if self.released {
            return Err(LifecycleError::AlreadyReleased);
        }
        if self.engine_done {
            return Err(LifecycleError::SocketAfterCompletion);
        }
        self.open_sockets += 1;
        self.sockets_seen = true;
        Ok(())
    }

    /// A socket context bound to this request confirmed its close.
    ///
    /// Returns `true` when this signal completes the join.
    pub fn socket_closed(&mut self) -> Result<bool, LifecycleError> {
        if self.released {
            return Err(LifecycleError::AlreadyReleased);
        }
        if self.open_sockets == 0 {
            return Err(LifecycleError::NoOpenSocket);
        }
        self.open_sockets -= 1;
        Ok(self.try_release())
    }

    /// The engine reported the transfer complete.
    ///
    /// Returns `true` when this signal completes the join.
    pub fn engine_completed(&mut self) -> Result<bool, LifecycleError> {
        if self.released {
            return Err(LifecycleError::AlreadyReleased);
        }
        if self.engine_done {
            return Err(LifecycleError::AlreadyCompleted);
        }
        self.engine_done = true;
        Ok(self.try_release())
    }

    fn try_release(&mut self) -> bool {
        if self.engine_done && self.open_sockets == 0 {
            self.released = true;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_then_socket_releases_once() {
        let mut lc = Lifecycle::new();
        lc.socket_opened().unwrap();
        assert!(!lc.engine_completed().unwrap());
        assert_eq!(lc.phase(), Phase::EngineDone);
        assert!(lc.socket_closed().unwrap());
        assert_eq!(lc.phase(), Phase::Released);
    }

    #[test]
    fn socket_then_engine_releases_once() {
        let mut lc = Lifecycle::new();
        lc.socket_opened().unwrap();
        assert!(!lc.socket_closed().unwrap());
        assert_eq!(lc.phase(), Phase::SocketClosed);
        assert!(lc.engine_completed().unwrap());
        assert_eq!(lc.phase(), Phase::Released);
    }

    #[test]
    fn completion_without_sockets_releases_immediately() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.phase(), Phase::Active);
        assert!(lc.engine_completed().unwrap());
        assert_eq!(lc.phase(), Phase::Released);
    }

    #[test]
    fn reconnect_returns_to_active() {
        let mut lc = Lifecycle::new();
        lc.socket_opened().unwrap();
        lc.socket_closed().unwrap();
        lc.socket_opened().unwrap();
        assert_eq!(lc.phase(), Phase::Active);
        assert_eq!(lc.open_sockets(), 1);
        assert!(!lc.engine_completed().unwrap());
        assert!(lc.socket_closed().unwrap());
        assert_eq!(lc.open_sockets(), 0);
    }

    #[test]
    fn signals_after_release_are_rejected() {
        let mut lc = Lifecycle::new();
        lc.engine_completed().unwrap();
        assert_eq!(lc.engine_completed(), Err(LifecycleError::AlreadyReleased));
        assert_eq!(lc.socket_closed(), Err(LifecycleError::AlreadyReleased));
        assert_eq!(lc.socket_opened(), Err(LifecycleError::AlreadyReleased));
    }

    #[test]
    fn double_completion_is_rejected() {
        let mut lc = Lifecycle::new();
        lc.socket_opened().unwrap();
        lc.engine_completed().unwrap();
        assert_eq!(lc.engine_completed(), Err(LifecycleError::AlreadyCompleted));
    }

    #[test]
    fn unmatched_close_is_rejected() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.socket_closed(), Err(LifecycleError::NoOpenSocket));
    }

    #[test]
    fn socket_after_completion_is_rejected() {
        let mut lc = Lifecycle::new();
        lc.socket_opened().unwrap();
        lc.engine_completed().unwrap();
        assert_eq!(lc.socket_opened(), Err(LifecycleError::SocketAfterCompletion));
    }
}
