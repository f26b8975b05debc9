//! Wait, notify and yield integration between spinlock-guarded blocking
//! primitives and a cooperative task scheduler, for multi-core embedded
//! targets.
//!
//! Every blocking primitive of this crate ([`Mutex`], [`Semaphore`]) keeps
//! its state behind a hardware spinlock and suspends contenders through one
//! atomic unlock-and-wait protocol, implemented by [`LockCore`]. How a
//! contender suspends depends on whether a scheduler is running:
//!
//! - With an active scheduler, the contending task is blocked and the core
//!   runs other tasks until a notify wakes it.
//! - Before the scheduler starts, or after it stops, the contending core
//!   sleeps on wait-for-event until a send-event.
//!
//! The switch between both behaviors is a [`SchedulerPresence`], which every
//! operation reads afresh on each call.
//!
//! ## Ports
//!
//! The crate never touches registers or a concrete scheduler itself. All
//! platform capabilities come from a [`Port`], which bundles the bare
//! [`Hardware`] operations, the [`Scheduler`] hooks and the presence switch.
//! Primitives are generic over their port, so firmware plugs in zero-sized
//! ports backed by the real chip while tests plug in simulated ones.
//!
//! ## Owners
//!
//! An owner is who holds a mutex: the running task with an active
//! scheduler, or the executing core without one. See [`resolve_owner`].
//!
//! ## Features
//!
//! This crate does not provide any default features. Features that can be
//! enabled are:
//!
//! ### std
//!
//! The `std` feature requires linking to the standard library, so it is not
//! suitable for `no_std` environments. It enables the [`Yield`] relax policy
//! and the [`host`] module, a simulated multi-core machine with a
//! cooperative scheduler running on OS threads.
//!
//! [`Mutex`]: mutex::Mutex
//! [`Semaphore`]: semaphore::Semaphore
//! [`LockCore`]: lock_core::LockCore
//! [`SchedulerPresence`]: presence::SchedulerPresence
//! [`Port`]: port::Port
//! [`Hardware`]: port::Hardware
//! [`Scheduler`]: port::Scheduler
//! [`resolve_owner`]: owner::resolve_owner
//! [`Yield`]: relax::Yield
//! [`host`]: https://docs.rs/coopwait/latest/coopwait/host/index.html

#![no_std]
#![allow(clippy::doc_markdown)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]
#![warn(rust_2024_compatibility)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(any(feature = "std", loom, test))]
#[macro_use]
extern crate std;

pub mod lock_core;
pub mod mutex;
pub mod owner;
pub mod port;
pub mod presence;
pub mod relax;
pub mod semaphore;
pub mod spin;
pub mod time;
pub mod yielding;

#[cfg(any(feature = "std", test))]
#[cfg(not(all(loom, test)))]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod host;

pub(crate) mod cfg;

#[cfg(all(not(loom), test))]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;
