//! Named shared memory and the semaphores that synchronize it.
//!
//! A [`Segment`] is a POSIX shared-memory object addressed by a name of the form `/name`. Every
//! process that knows the name can open and map it, which is what distinguishes it from an
//! anonymous `memfd`. A [`Semaphore`] is an unnamed POSIX semaphore; it only works across
//! processes when it lives inside such a shared mapping and was initialized there.
//!
//! Everything in here is a thin layer over `libc`. Failures of the operating system are returned
//! as a [`ShmError`] with the failing operation attached; callers decide whether they are fatal.
//! Process-shared unnamed semaphores make this crate Linux-only in practice.

mod error;
mod segment;
mod sem;

pub use error::ShmError;
pub use segment::{Mapping, Protection, Segment};
pub use sem::{Semaphore, TimedWait, TryWait};
