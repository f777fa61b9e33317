//! `trellis-core` — shared kernel for the trellis toolkit.
//!
//! Cross-cutting primitives used by every subsystem: the cancellation-aware
//! [`Context`], the payload [`codec`] sitting between dispatchers and queue
//! drivers, strongly-typed identifiers, the [`lifecycle::RunGroup`] that
//! drives long-running actors as one unit, and context-scoped [`Baggage`].

pub mod baggage;
pub mod codec;
pub mod context;
pub mod id;
pub mod lifecycle;

pub use baggage::Baggage;
pub use codec::{Codec, CodecError, JsonCodec, decode, encode};
pub use context::{CancelToken, Context, ContextError};
pub use id::CorrelationId;
pub use lifecycle::RunGroup;
