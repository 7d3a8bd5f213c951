//! Platform-specific type aliases and trait bounds
//!
//! This module provides conditional compilation for single-threaded (Rc-based)
//! vs multi-threaded (Arc-based) stream handles.
//!
//! - `send` feature (default): Uses Arc and requires Send bounds on chunks,
//!   transport primitives and observers
//! - `local` feature: Uses Rc and removes the Send requirements; `send` wins
//!   when both are enabled

#[cfg(not(any(feature = "send", feature = "local")))]
compile_error!("enable either the `send` or the `local` feature");

// ============================================================================
// MULTI-THREADED (send feature - default)
// ============================================================================
#[cfg(feature = "send")]
pub use std::sync::Arc as SharedPtr;

#[cfg(feature = "send")]
pub use futures::future::BoxFuture as PlatformFuture;

#[cfg(feature = "send")]
pub trait MaybeSend: Send {}
#[cfg(feature = "send")]
impl<T: Send> MaybeSend for T {}

#[cfg(feature = "send")]
pub trait MaybeSync: Sync {}
#[cfg(feature = "send")]
impl<T: Sync> MaybeSync for T {}

#[cfg(feature = "send")]
pub type PlatformBoxFutureStatic<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;

// Type alias for boxed QueuingStrategy trait objects
#[cfg(feature = "send")]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + Send + 'static>;

// Observer callbacks registered on a stream
#[cfg(feature = "send")]
pub type Listener<A> = Box<dyn FnMut(A) + Send + 'static>;

// ============================================================================
// SINGLE-THREADED (local)
// ============================================================================
#[cfg(all(feature = "local", not(feature = "send")))]
pub use std::rc::Rc as SharedPtr;

#[cfg(all(feature = "local", not(feature = "send")))]
pub use futures::future::LocalBoxFuture as PlatformFuture;

#[cfg(all(feature = "local", not(feature = "send")))]
pub trait MaybeSend {}
#[cfg(all(feature = "local", not(feature = "send")))]
impl<T> MaybeSend for T {}

#[cfg(all(feature = "local", not(feature = "send")))]
pub trait MaybeSync {}
#[cfg(all(feature = "local", not(feature = "send")))]
impl<T> MaybeSync for T {}

#[cfg(all(feature = "local", not(feature = "send")))]
pub type PlatformBoxFutureStatic<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + 'static>>;

#[cfg(all(feature = "local", not(feature = "send")))]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + 'static>;

#[cfg(all(feature = "local", not(feature = "send")))]
pub type Listener<A> = Box<dyn FnMut(A) + 'static>;
