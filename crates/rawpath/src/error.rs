//! Datapath errors.
//!
//! Two kinds:
//!   `TransportError`: construction-time failures, returned to the caller.
//!   `NicFault`: a driver call failed on the hot path. The queue pair is in
//!               an unknown state and nothing may be retried.

use std::fmt;

use rawpath_core::config::ConfigError;

use crate::nic::{Lkey, NicStatus};

/// Hot-path driver operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultSite {
    PostSend,
    PollSendCq,
    PostRecv,
    PollRecvCq,
    PostMpRecv,
}

impl fmt::Display for FaultSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultSite::PostSend => "post_send",
            FaultSite::PollSendCq => "poll_send_cq",
            FaultSite::PostRecv => "post_recv",
            FaultSite::PollRecvCq => "poll_recv_cq",
            FaultSite::PostMpRecv => "post_mp_recv",
        };
        f.write_str(s)
    }
}

/// Fatal hardware or queue fault.
///
/// There is nothing to match on: a caller can log it, release what it must,
/// and then call [`NicFault::abort`]. The datapath cannot tell a transient
/// fault from a corrupted queue, so no retry is offered.
#[must_use = "a NIC fault is fatal; log it and call abort()"]
#[derive(Debug, thiserror::Error)]
#[error("{site} failed with {status}")]
pub struct NicFault {
    site: FaultSite,
    status: NicStatus,
}

impl NicFault {
    pub(crate) fn new(site: FaultSite, status: NicStatus) -> Self {
        Self { site, status }
    }

    /// Driver status code, for diagnostics.
    pub fn code(&self) -> i32 {
        self.status.code()
    }

    /// Log the fault and terminate the process.
    pub fn abort(self) -> ! {
        tracing::error!(op = %self.site, status = self.code(), "fatal NIC fault, terminating");
        eprintln!("rawpath: fatal error: {self}");
        std::process::exit(1)
    }
}

/// Errors building a transport or allocating message buffers for it.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to map receive ring of {0} bytes: {1}")]
    RingAlloc(usize, std::io::Error),

    #[error("memory registration of {0} bytes failed: {1}")]
    Registration(usize, NicStatus),

    #[error("deregistration of lkey {0} failed: {1}")]
    Deregistration(Lkey, NicStatus),

    #[error("receive queue setup failed: {0}")]
    QueueSetup(NicStatus),

    #[error("initial receive post failed: {0}")]
    InitialPost(NicStatus),

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MsgTooLarge { size: usize, max: usize },

    #[error("packets must carry at least one payload byte")]
    EmptyPacket,
}
