//! OCCP per-worker control register block.
//!
//! Each worker owns one control block: eight read-to-trigger control
//! operation slots (a read of the slot *is* the command), then status and
//! control registers. The layout is ABI-fixed.

/// Control-operation trigger slots, one DWORD each, in operation order.
pub mod op {
    /// `initialize` trigger slot.
    pub const INITIALIZE: u64 = 0x00;
    /// `start` trigger slot.
    pub const START: u64 = 0x04;
    /// `stop` trigger slot.
    pub const STOP: u64 = 0x08;
    /// `release` trigger slot.
    pub const RELEASE: u64 = 0x0C;
    /// `test` trigger slot.
    pub const TEST: u64 = 0x10;
    /// `beforeQuery` trigger slot.
    pub const BEFORE_QUERY: u64 = 0x14;
    /// `afterConfigure` trigger slot.
    pub const AFTER_CONFIGURE: u64 = 0x18;
    /// Reserved eighth slot.
    pub const RESERVED7: u64 = 0x1C;
}

/// Worker status register (sticky across software restarts).
pub const STATUS: u64 = 0x20;
/// Worker control register (reset/enable, timeout).
pub const CONTROL: u64 = 0x24;
/// Last configuration access address (debug).
pub const LAST_CONFIG: u64 = 0x28;
/// Write to clear sticky error bits in `STATUS`.
pub const CLEAR_ERROR: u64 = 0x2C;
/// Config-space page window for offsets beyond the direct window.
pub const WINDOW: u64 = 0x30;

/// Results a control-op trigger read can return.
pub mod result {
    /// Operation completed.
    pub const SUCCESS: u32 = 0xc0de_4201;
    /// Worker signalled an error from the operation.
    pub const ERROR: u32 = 0xc0de_4202;
    /// No OCP response from the worker within the control timeout.
    pub const TIMEOUT: u32 = 0xc0de_4203;
    /// Worker was held in reset when the operation was requested.
    pub const RESET: u32 = 0xc0de_4204;
    /// Worker signalled a fatal error.
    pub const FATAL: u32 = 0xc0de_4205;
}

/// Worker status register bits.
///
/// The low error bits qualify configuration accesses; the upper field
/// records the last successfully triggered control operation, which is
/// how a fresh process reconstructs worker state after a restart.
pub mod status {
    /// Config write timed out.
    pub const WRITE_TIMEOUT: u32 = 1 << 0;
    /// Config write rejected (busy).
    pub const WRITE_FAIL: u32 = 1 << 1;
    /// Worker returned an error response to a config write.
    pub const WRITE_ERROR: u32 = 1 << 2;
    /// Config read timed out.
    pub const READ_TIMEOUT: u32 = 1 << 3;
    /// Config read rejected (busy).
    pub const READ_FAIL: u32 = 1 << 4;
    /// Worker returned an error response to a config read.
    pub const READ_ERROR: u32 = 1 << 5;
    /// Control-plane access fault.
    pub const ACCESS_ERROR: u32 = 1 << 6;
    /// A control operation ended in FATAL; the worker is unusable.
    pub const UNUSABLE: u32 = 1 << 7;
    /// Worker declared itself finished.
    pub const FINISHED: u32 = 1 << 8;

    /// All sticky write-path errors.
    pub const WRITE_ERRORS: u32 = WRITE_TIMEOUT | WRITE_FAIL | WRITE_ERROR;
    /// All sticky read-path errors.
    pub const READ_ERRORS: u32 = READ_TIMEOUT | READ_FAIL | READ_ERROR;
    /// Every error bit.
    pub const ALL_ERRORS: u32 = WRITE_ERRORS | READ_ERRORS | ACCESS_ERROR | UNUSABLE;

    /// Shift of the last-control-op field.
    pub const LAST_OP_SHIFT: u32 = 24;
    /// Mask (post-shift) of the last-control-op field.
    pub const LAST_OP_MASK: u32 = 0x7;
    /// Set when the last-op field holds a real operation.
    pub const LAST_OP_VALID: u32 = 1 << 28;

    /// Extract the last triggered control operation, if any.
    pub const fn last_op(status: u32) -> Option<u32> {
        if status & LAST_OP_VALID != 0 {
            Some((status >> LAST_OP_SHIFT) & LAST_OP_MASK)
        } else {
            None
        }
    }
}

/// Worker control register bits.
pub mod control {
    /// Worker out of reset when set; writing without it asserts reset.
    pub const ENABLE: u32 = 1 << 31;
    /// Mask of the log2 control-timeout field in the low bits.
    pub const LOG_TIMEOUT_MASK: u32 = 0x1F;
}

/// Default control-operation timeout in control-clock cycles.
pub const DEFAULT_TIMEOUT: u32 = 16;

/// Floor of log2, used to program the control register timeout field.
pub const fn log2_timeout(timeout: u32) -> u32 {
    31 - timeout.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_slots_are_consecutive_dwords() {
        assert_eq!(op::INITIALIZE, 0);
        assert_eq!(op::START, 4);
        assert_eq!(op::AFTER_CONFIGURE, 0x18);
        assert_eq!(STATUS, 0x20);
    }

    #[test]
    fn result_codes_are_distinct() {
        let all = [
            result::SUCCESS,
            result::ERROR,
            result::TIMEOUT,
            result::RESET,
            result::FATAL,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn last_op_field_round_trips() {
        let status = status::LAST_OP_VALID | (3 << status::LAST_OP_SHIFT);
        assert_eq!(status::last_op(status), Some(3));
        assert_eq!(status::last_op(0), None);
    }

    #[test]
    fn log2_timeout_is_floor() {
        assert_eq!(log2_timeout(16), 4);
        assert_eq!(log2_timeout(17), 4);
        assert_eq!(log2_timeout(1), 0);
    }
}
