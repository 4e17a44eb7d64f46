use thiserror::Error;

/// Error enum for feedback on simulation errors.
///
/// Most of the failure modes in spec §7 are fatal by protocol (allocator
/// OOM, a missing anti-message twin, a transport failure) and are raised as
/// panics with a `tracing::error!` line rather than threaded through
/// `Result`, matching the "abort after emitting a fatal log" policy. The
/// variants below are the ones a caller can meaningfully recover from or
/// must be told about before the engine aborts on their behalf.
#[derive(Debug, Error)]
pub enum RootsimError {
    #[error("attempted to schedule an event in the past of the current simulation time")]
    TimeTravel,
    #[error("terminal time reached, no further scheduling is allowed")]
    PastTerminal,
    #[error("maximum number of logical processes already registered for this configuration")]
    MaximumLpsExceeded,
    #[error("cannot start the engine: not every configured logical process was spawned")]
    NotAllLpsRegistered,
    #[error("worker thread panicked")]
    ThreadPanic,
    #[error("message delivered to the wrong logical process")]
    MismatchedDeliveryAddress,
    #[error("invalid logical process id: {0}")]
    InvalidLpId(usize),
    #[error("invalid configuration: {0}")]
    ConfigError(String),
    #[error("buddy arena exhausted: requested block of 2^{0} bytes")]
    ArenaExhausted(u32),
    #[error("requested allocation of 2^{0} bytes exceeds the arena size 2^{1}")]
    BlockTooLarge(u32, u32),
    #[error("checkpoint log has no entry reachable at or before ref_idx {0}")]
    NoReachableCheckpoint(usize),
    #[error("remote-match map is full and cannot be resized outside a GVT barrier")]
    RemoteMatchMapFull,
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("thread join failed for worker {0}")]
    JoinFailed(usize),
}
