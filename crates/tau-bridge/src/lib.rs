//! Tau Bridge - object identity and async plumbing for language boundaries
//!
//! Generated bindings between native code and a host runtime link against
//! this crate. It provides two independent pieces:
//!
//! - **Proxy identity cache**: [`ProxyCache`] - at most one live proxy per
//!   `(interface, object)` pair and boundary direction, so identity-based
//!   operations (listener removal, equality) keep working across crossings.
//! - **Task runtime**: [`Task`], [`ContinuationRunner`], [`Scheduler`] - suspend and
//!   resume async method bodies under a scheduler supplied by the caller, and
//!   [`callback`] to await foreign callback-style APIs.
//!
//! ```text
//!   host side                  this crate                   native side
//!   ─────────                  ──────────                   ───────────
//!   handle ──get(tag, h)──►  ProxyCache<HostToNative> ──► proxy (weak in cache)
//!   proxy  ◄──get(tag, h)──  ProxyCache<NativeToHost> ◄── Arc<dyn Interface>
//!
//!   call_async ──► Task::new(body).start(scheduler)
//!                    body: sub.await / callback(start).await
//!                    completion ──► ContinuationRunner ──► Scheduler
//! ```
//!
//! # Not in this crate
//!
//! Code generation, per-language marshalling and the host runtime's own
//! executor live in the bindings. This crate never spawns work on its own
//! except through [`Scheduler::thread`], and only when asked to.

pub mod callback;
pub mod config;
pub mod error;
pub mod proxy_cache;
pub mod schedule;
mod sync;
pub mod task;

pub use callback::{callback, CallbackAwaitable, CallbackHandle};
pub use config::{AllocPolicy, CacheConfig};
pub use error::{CacheError, Failure, ForeignError, TaskError};
pub use proxy_cache::{
    host_to_native, native_to_host, Boundary, ForeignRef, ForeignRefTable, HostToNative,
    Identify, InterfaceTag, NativeHandle, NativeToHost, ObjectId, ProxyCache, ProxyRef,
    ProxyRegistration, WeakProxyRef,
};
pub use schedule::{ContinuationRunner, DeferredQueue, Scheduler};
pub use task::{current_scheduler, current_task, Task, TaskId, TaskState};
