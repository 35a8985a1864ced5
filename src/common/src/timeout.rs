//! IPC timeout words.
//!
//! A [`Timeout`] packs a send and a receive timeout plus the two page-fault
//! timeouts into 32 bits:
//!
//! ```text
//!  31      24 23      16 15   12 11    8 7     4 3     0
//! +----------+----------+-------+-------+-------+-------+
//! | rcv man  | snd man  | snd pf| rcv pf| snd e | rcv e |
//! +----------+----------+-------+-------+-------+-------+
//! ```
//!
//! A (mantissa, exponent) field means `mantissa * 4^exponent` microseconds.
//! Exponent 15 is "never"; a zero mantissa with any other exponent is
//! "zero". A 4-bit page-fault field `p` means `4^p` microseconds, except 0
//! (zero) and 15 (never).
//!
//! When marked absolute through [`AbsoluteFlags`], a field names a point on
//! the monotonic clock instead: the mantissa replaces clock bits
//! `2e..2e+8` and the matching clock bit disambiguates which window is meant.

use bitflags::bitflags;

/// Exponent value meaning "never".
pub const NEVER_EXPONENT: u8 = 15;

const RCV_EXP_SHIFT: u32 = 0;
const SND_EXP_SHIFT: u32 = 4;
const RCV_PF_SHIFT: u32 = 8;
const SND_PF_SHIFT: u32 = 12;
const SND_MAN_SHIFT: u32 = 16;
const RCV_MAN_SHIFT: u32 = 24;

bitflags! {
    /// Marks timeout fields as absolute clock values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AbsoluteFlags: u8 {
        const SEND = 1 << 0;
        /// Expected value of the clock bit just above the send window.
        const SEND_CLOCK = 1 << 1;
        const RECEIVE = 1 << 2;
        /// Expected value of the clock bit just above the receive window.
        const RECEIVE_CLOCK = 1 << 3;
    }
}

/// Decoded meaning of one timeout field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutValue {
    Never,
    Zero,
    Micros(u64),
}

/// When a blocking operation must give up, relative to a clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Never,
    /// Already due; do not block at all.
    Expired,
    At(u64),
}

/// One (mantissa, exponent) send or receive timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeoutField {
    mantissa: u8,
    exponent: u8,
}

impl TimeoutField {
    pub const NEVER: TimeoutField = TimeoutField { mantissa: 0, exponent: NEVER_EXPONENT };
    pub const ZERO: TimeoutField = TimeoutField { mantissa: 0, exponent: 0 };

    pub const fn new(mantissa: u8, exponent: u8) -> Self {
        TimeoutField { mantissa, exponent: exponent & 0xf }
    }

    /// Smallest encoding not shorter than `micros`, saturating at the
    /// longest finite value.
    pub fn from_micros(micros: u64) -> Self {
        if micros == 0 {
            return Self::ZERO;
        }
        for exponent in 0..NEVER_EXPONENT {
            let shift = 2 * exponent as u32;
            let mantissa = micros.div_ceil(1u64 << shift);
            if mantissa <= u8::MAX as u64 {
                return Self::new(mantissa as u8, exponent);
            }
        }
        Self::new(u8::MAX, NEVER_EXPONENT - 1)
    }

    pub const fn mantissa(&self) -> u8 {
        self.mantissa
    }

    pub const fn exponent(&self) -> u8 {
        self.exponent
    }

    /// The field read as a relative duration.
    pub const fn value(&self) -> TimeoutValue {
        if self.exponent == NEVER_EXPONENT {
            TimeoutValue::Never
        } else if self.mantissa == 0 {
            TimeoutValue::Zero
        } else {
            TimeoutValue::Micros((self.mantissa as u64) << (2 * self.exponent as u32))
        }
    }

    /// The field read as an absolute clock value near `now`.
    ///
    /// Only meaningful for finite, non-zero fields.
    pub fn absolute(&self, now: u64, clock_bit: bool) -> u64 {
        let granule = 2 * self.exponent as u32;
        let window = 1u64 << (granule + 8);
        let mut at = (now & !(window - 1)) | (self.mantissa as u64) << granule;
        if ((now >> (granule + 8)) & 1 == 1) != clock_bit {
            at = at.wrapping_add(window);
        }
        if at > now.saturating_add(window) {
            at = at.saturating_sub(window << 1);
        }
        at
    }

    /// Deadline for this field, evaluated at `now`.
    pub fn deadline(&self, now: u64, absolute: bool, clock_bit: bool) -> Deadline {
        match self.value() {
            TimeoutValue::Never => Deadline::Never,
            TimeoutValue::Zero => Deadline::Expired,
            TimeoutValue::Micros(micros) => {
                let at = if absolute {
                    self.absolute(now, clock_bit)
                } else {
                    now.saturating_add(micros)
                };
                if at <= now {
                    Deadline::Expired
                } else {
                    Deadline::At(at)
                }
            }
        }
    }
}

/// Decodes a 4-bit page-fault timeout.
pub const fn pf_value(field: u8) -> TimeoutValue {
    match field & 0xf {
        0 => TimeoutValue::Zero,
        15 => TimeoutValue::Never,
        p => TimeoutValue::Micros(1u64 << (2 * p as u32)),
    }
}

/// A packed timeout word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timeout(u32);

impl Timeout {
    /// Never time out, in any phase.
    pub const NEVER: Timeout = Timeout::new(TimeoutField::NEVER, TimeoutField::NEVER, 15, 15);
    /// Poll: fail at once if the partner is not ready. Page faults are
    /// still waited for.
    pub const ZERO: Timeout = Timeout::new(TimeoutField::ZERO, TimeoutField::ZERO, 15, 15);

    pub const fn new(
        send: TimeoutField,
        receive: TimeoutField,
        send_pf: u8,
        receive_pf: u8,
    ) -> Self {
        Timeout(
            (receive.exponent as u32 & 0xf) << RCV_EXP_SHIFT
                | (send.exponent as u32 & 0xf) << SND_EXP_SHIFT
                | (receive_pf as u32 & 0xf) << RCV_PF_SHIFT
                | (send_pf as u32 & 0xf) << SND_PF_SHIFT
                | (send.mantissa as u32) << SND_MAN_SHIFT
                | (receive.mantissa as u32) << RCV_MAN_SHIFT,
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        Timeout(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn send(&self) -> TimeoutField {
        TimeoutField::new((self.0 >> SND_MAN_SHIFT) as u8, (self.0 >> SND_EXP_SHIFT) as u8 & 0xf)
    }

    pub const fn receive(&self) -> TimeoutField {
        TimeoutField::new((self.0 >> RCV_MAN_SHIFT) as u8, (self.0 >> RCV_EXP_SHIFT) as u8 & 0xf)
    }

    pub const fn send_pf(&self) -> u8 {
        (self.0 >> SND_PF_SHIFT) as u8 & 0xf
    }

    pub const fn receive_pf(&self) -> u8 {
        (self.0 >> RCV_PF_SHIFT) as u8 & 0xf
    }

    pub const fn with_send(self, send: TimeoutField) -> Self {
        Timeout::new(send, self.receive(), self.send_pf(), self.receive_pf())
    }

    pub const fn with_receive(self, receive: TimeoutField) -> Self {
        Timeout::new(self.send(), receive, self.send_pf(), self.receive_pf())
    }

    pub const fn with_pf(self, send_pf: u8, receive_pf: u8) -> Self {
        Timeout::new(self.send(), self.receive(), send_pf, receive_pf)
    }

    pub fn send_deadline(&self, now: u64, flags: AbsoluteFlags) -> Deadline {
        self.send().deadline(
            now,
            flags.contains(AbsoluteFlags::SEND),
            flags.contains(AbsoluteFlags::SEND_CLOCK),
        )
    }

    pub fn receive_deadline(&self, now: u64, flags: AbsoluteFlags) -> Deadline {
        self.receive().deadline(
            now,
            flags.contains(AbsoluteFlags::RECEIVE),
            flags.contains(AbsoluteFlags::RECEIVE_CLOCK),
        )
    }
}
