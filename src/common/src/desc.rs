//! Send and receive descriptor words, and the long-message buffer layout.
//!
//! A send descriptor word is either all ones (no send phase) or a buffer
//! address with two flag bits below it: bit 0 asks for deceiting, bit 1
//! marks a flexpage transfer. With a zero address the message lives only in
//! the registers; the map bit then means the two register words are a
//! single inline flexpage (hot spot, fpage).
//!
//! A receive descriptor word is either all ones (no receive phase) or a
//! buffer address with bit 0 marking an open wait and bit 1 marking a
//! register-only flexpage window carried in the word itself. The window
//! keeps its base and order; its rights are not carried.

use crate::fpage::Fpage;

const FLAG_MASK: u64 = 0b11;
const LOW_FLAG: u64 = 0b01;
const HIGH_FLAG: u64 = 0b10;

/// Where a message's words come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// The register words only.
    Registers,
    /// The register words are `(hot spot, flexpage)`.
    RegisterFpage,
    /// A long buffer follows the registers.
    Long { buffer: u64, map: bool },
}

/// Decoded send descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendDesc {
    pub kind: SendKind,
    /// Claim another identity (only honored inside the destination's task).
    pub deceite: bool,
}

impl SendDesc {
    pub const REGISTERS: SendDesc = SendDesc {
        kind: SendKind::Registers,
        deceite: false,
    };

    /// Decodes a raw word; all ones means "no send phase".
    pub const fn from_raw(raw: u64) -> Option<SendDesc> {
        if raw == u64::MAX {
            return None;
        }
        let buffer = raw & !FLAG_MASK;
        let map = raw & HIGH_FLAG != 0;
        let kind = match (buffer, map) {
            (0, false) => SendKind::Registers,
            (0, true) => SendKind::RegisterFpage,
            (buffer, map) => SendKind::Long { buffer, map },
        };
        Some(SendDesc {
            kind,
            deceite: raw & LOW_FLAG != 0,
        })
    }

    pub const fn raw(&self) -> u64 {
        let deceite = if self.deceite { LOW_FLAG } else { 0 };
        deceite
            | match self.kind {
                SendKind::Registers => 0,
                SendKind::RegisterFpage => HIGH_FLAG,
                SendKind::Long { buffer, map } => {
                    (buffer & !FLAG_MASK) | if map { HIGH_FLAG } else { 0 }
                }
            }
    }

    /// Whether the message carries a flexpage.
    pub const fn maps(&self) -> bool {
        matches!(
            self.kind,
            SendKind::RegisterFpage | SendKind::Long { map: true, .. }
        )
    }
}

/// Where a received message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveKind {
    Registers,
    /// Registers, and accept one flexpage into `window`.
    RegisterFpage { window: Fpage },
    Long { buffer: u64 },
}

/// Decoded receive descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveDesc {
    pub kind: ReceiveKind,
    /// Accept any sender rather than only the named one.
    pub open_wait: bool,
}

impl ReceiveDesc {
    pub const REGISTERS: ReceiveDesc = ReceiveDesc {
        kind: ReceiveKind::Registers,
        open_wait: false,
    };

    pub const OPEN: ReceiveDesc = ReceiveDesc {
        kind: ReceiveKind::Registers,
        open_wait: true,
    };

    /// Decodes a raw word; all ones means "no receive phase".
    pub const fn from_raw(raw: u64) -> Option<ReceiveDesc> {
        if raw == u64::MAX {
            return None;
        }
        let rest = raw & !FLAG_MASK;
        let kind = if raw & HIGH_FLAG != 0 {
            ReceiveKind::RegisterFpage {
                window: Fpage::from_raw(rest),
            }
        } else if rest == 0 {
            ReceiveKind::Registers
        } else {
            ReceiveKind::Long { buffer: rest }
        };
        Some(ReceiveDesc {
            kind,
            open_wait: raw & LOW_FLAG != 0,
        })
    }

    pub const fn raw(&self) -> u64 {
        let open = if self.open_wait { LOW_FLAG } else { 0 };
        open | match self.kind {
            ReceiveKind::Registers => 0,
            ReceiveKind::RegisterFpage { window } => (window.raw() & !FLAG_MASK) | HIGH_FLAG,
            ReceiveKind::Long { buffer } => buffer & !FLAG_MASK,
        }
    }
}

/// Byte offsets inside a long-message buffer.
///
/// ```text
/// +0   flexpage slot (send: fpage to map; receive: window)
/// +8   size dope    (capacity: words, strings)
/// +16  send dope    (sent: words, strings)
/// +24  words[size.words]
///      strings[size.strings] of { snd_size, snd_ptr, rcv_size, rcv_ptr }
/// ```
///
/// Word slots 0 and 1 mirror the register words and are never copied from
/// the buffer.
pub mod layout {
    /// Bytes per message word.
    pub const WORD: u64 = 8;
    pub const FPAGE_SLOT: u64 = 0;
    pub const SIZE_DOPE: u64 = 8;
    pub const SEND_DOPE: u64 = 16;
    pub const WORDS: u64 = 24;
    /// Words per indirect-string descriptor.
    pub const STRING_WORDS: u64 = 4;

    /// Address of message word `index`.
    pub const fn word(buffer: u64, index: u64) -> u64 {
        buffer.wrapping_add(WORDS + index * WORD)
    }

    /// Address of string descriptor `index`, given the buffer's declared
    /// word capacity.
    pub const fn string(buffer: u64, capacity: u64, index: u64) -> u64 {
        buffer.wrapping_add(WORDS + capacity * WORD + index * STRING_WORDS * WORD)
    }

    /// Bytes covered by a buffer holding `words` message words and
    /// `strings` string descriptors.
    pub const fn span(words: u64, strings: u64) -> u64 {
        WORDS + words * WORD + strings * STRING_WORDS * WORD
    }

    /// Offsets inside a string descriptor.
    pub const SND_SIZE: u64 = 0;
    pub const SND_PTR: u64 = WORD;
    pub const RCV_SIZE: u64 = 2 * WORD;
    pub const RCV_PTR: u64 = 3 * WORD;
}
