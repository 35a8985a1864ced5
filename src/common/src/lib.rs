//! Wire-level types shared by the Rendezvous kernel and its collaborators.
//!
//! Everything here is a pure bit-packing codec: identifiers, flexpages,
//! message dopes, timeout words and descriptor words. No allocation and no
//! failure paths; malformed input decodes to some well-defined value.

#![cfg_attr(not(test), no_std)]

pub mod desc;
pub mod dope;
pub mod error;
pub mod fpage;
pub mod handle;
pub mod id;
pub mod timeout;

pub use desc::{ReceiveDesc, ReceiveKind, SendDesc, SendKind};
pub use dope::MsgDope;
pub use error::IpcError;
pub use fpage::{Fpage, FpageRights, FpageSpace, MapPlacement};
pub use handle::{ContextRef, SpaceId};
pub use id::{ThreadIdentifier, V2Fields, V2Id, V4Id};
pub use timeout::{AbsoluteFlags, Deadline, Timeout, TimeoutField, TimeoutValue};

/// Number of message words carried in registers.
pub const REGISTER_WORDS: usize = 2;

/// Identifier layout used kernel-wide.
#[cfg(not(feature = "abi-v4"))]
pub type ThreadId = V2Id;

/// Identifier layout used kernel-wide.
#[cfg(feature = "abi-v4")]
pub type ThreadId = V4Id;
