//! User semaphores.
//!
//! A semaphore is a counter user code can update without entering the
//! kernel, plus a kernel wait queue for contended `down` calls. The
//! [`registry`] module keeps the kernel side of every semaphore, addressed
//! by [`SemaphoreId`].
//!
//! # Example
//!
//! ```ignore
//! let sem = kernel.semaphore_create(1);
//! let shared = kernel.semaphore_shared(sem).unwrap();
//!
//! if !shared.try_down() {
//!     kernel.semaphore_down(sem, Timeout::NEVER)?;
//! }
//! // ... critical section ...
//! if !shared.try_up() {
//!     kernel.semaphore_up(sem)?;
//! }
//! ```

pub mod registry;
mod semaphore;

pub(crate) use registry::SemaphoreTable;
pub use registry::SemaphoreId;
pub use semaphore::{SemOutcome, SemStatus, SemaphoreShared};
