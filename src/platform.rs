//! Platform-specific type aliases and trait bounds
//!
//! This module provides conditional compilation for single-threaded (Rc-based)
//! vs multi-threaded (Arc-based) stream state.
//!
//! - `send` feature (default): Uses Arc and requires Send+Sync bounds on sources,
//!   sinks, transformers and the driver futures they produce
//! - `local` feature: Uses Rc and removes Send+Sync requirements

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

// Boxed futures handed out by native sources
#[cfg(feature = "send")]
pub type PlatformBoxFutureStatic<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;

// Boxed QueuingStrategy trait objects stored inside stream state
#[cfg(feature = "send")]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + Send + 'static>;

// ============================================================================
// SINGLE-THREADED (local feature)
// ============================================================================
#[cfg(feature = "local")]
pub use std::rc::Rc as SharedPtr;

#[cfg(feature = "local")]
pub use futures::future::LocalBoxFuture as PlatformFuture;

#[cfg(feature = "local")]
pub trait MaybeSend {}
#[cfg(feature = "local")]
impl<T> MaybeSend for T {}

#[cfg(feature = "local")]
pub trait MaybeSync {}
#[cfg(feature = "local")]
impl<T> MaybeSync for T {}

#[cfg(feature = "local")]
pub type PlatformBoxFutureStatic<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + 'static>>;

#[cfg(feature = "local")]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + 'static>;
