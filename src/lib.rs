//! # rootsim-core
//!
//! The speculative execution engine behind a Time Warp parallel
//! discrete-event simulator: a message, a rollback-capable logical process,
//! a buddy-arena checkpoint store, a per-thread message queue, a
//! remote-message matching map, and the GVT reduction that ties them
//! together.
//!
//! The command-line parser, the model-reflection loader, the statistics
//! sink, and the distributed transport are deliberately outside this crate;
//! they are consumed through the [`model`], [`transport`], and [`stats`]
//! trait boundaries.

pub mod autockpt;
pub mod buddy;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fossil;
pub mod gvt;
pub mod logger;
pub mod lp;
pub mod message;
pub mod model;
pub mod queue;
pub mod remote_match;
pub mod stats;
pub mod transport;

pub mod prelude {
    pub use crate::config::SimConfig;
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::RootsimError;
    pub use crate::message::{Message, MessageId};
    pub use crate::model::{Committed, Dispatcher, LP_FINI, LP_INIT};
    pub use crate::transport::{LoopbackTransport, Transport};
}

pub use error::RootsimError;
