//! # Courier Core - In-Process Event Bus and Context Scheduler
//!
//! Rust runtime for services built from units of work that talk through
//! addressed messages instead of shared memory:
//! - Execution contexts pinned to event-loop threads or the worker pool
//! - Blocking offload with per-context ordering
//! - Timers bound to contexts, cancelled when the context closes
//! - Event bus with send, publish and request/reply (timeouts, failures)
//! - Pluggable codecs for local transform and wire encoding
//! - Single and composite futures
//! - Backpressure streams (ReadStream, WriteStream, Pump)
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────────┐
//!                    │                 Courier                  │
//!   send/publish  →  │  ┌──────────┐  ┌──────────┐ ┌─────────┐  │
//!   request       →  │  │ EventBus │→ │ Handler  │ │ Codec   │  │
//!                    │  │          │  │  Table   │ │ Manager │  │
//!                    │  └────┬─────┘  └──────────┘ └─────────┘  │
//!                    │       │ run_on_context                   │
//!                    │  ┌────▼──────────────┐  ┌─────────────┐  │
//!                    │  │ Contexts          │  │ TimerTable  │  │
//!                    │  │  event loops (N)  │  │             │  │
//!                    │  │  worker pool      │  └─────────────┘  │
//!                    │  └───────────────────┘                   │
//!                    └──────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod courier;
pub mod eventbus;
pub mod future;
pub mod streams;
pub mod types;

// Internal utilities
pub mod observability;

pub use context::{Context, ContextKind, TimeoutStream};
pub use courier::Courier;
pub use eventbus::{
    DeliveryOptions, EventBus, Message, MessageCodec, MessageConsumer, MessageProducer, MultiMap,
    ReplyException, ReplyFailure,
};
pub use future::{CompositeFuture, Future};
pub use streams::{Pump, ReadStream, WriteStream};
pub use types::{Config, Error, Result};
