//! Worker control state machine.
//!
//! A worker's lifecycle lives in hardware: a control operation is
//! triggered by *reading* its slot in the worker's control register
//! block, and the 32-bit result word says what the worker did with it.
//! Software tracks the resulting state with a table-driven machine, and —
//! because the hardware state survives process restarts — can rebuild
//! that state from the sticky status register when reattaching.

use crate::access::Access;
use crate::error::{HdlError, Result};
use occp_chip::worker::{self, control, result, status};
use occp_chip::OCCP_WORKER_CONFIG_SIZE;
use std::fmt;
use std::time::Duration;

/// Lifecycle states a worker can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Initial / after reset or release.
    Exists,
    /// `initialize` completed.
    Initialized,
    /// Running.
    Operating,
    /// Stopped after running.
    Suspended,
    /// Terminal failure state.
    Unusable,
    /// Terminal normal completion.
    Finished,
    /// Sentinel: no state requirement / no transition.
    None,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exists => "exists",
            Self::Initialized => "initialized",
            Self::Operating => "operating",
            Self::Suspended => "suspended",
            Self::Unusable => "unusable",
            Self::Finished => "finished",
            Self::None => "none",
        })
    }
}

/// The control operations, in trigger-slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlOp {
    /// `initialize`.
    Initialize = 0,
    /// `start`.
    Start = 1,
    /// `stop`.
    Stop = 2,
    /// `release`.
    Release = 3,
    /// `test`.
    Test = 4,
    /// `beforeQuery`.
    BeforeQuery = 5,
    /// `afterConfigure`.
    AfterConfigure = 6,
}

impl ControlOp {
    /// All operations, slot order.
    pub const ALL: [Self; 7] = [
        Self::Initialize,
        Self::Start,
        Self::Stop,
        Self::Release,
        Self::Test,
        Self::BeforeQuery,
        Self::AfterConfigure,
    ];

    /// Trigger-slot offset within the worker control block.
    pub const fn offset(self) -> u64 {
        self as u64 * 4
    }

    /// Parse the CLI spelling of an operation.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "initialize" => Self::Initialize,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "release" => Self::Release,
            "test" => Self::Test,
            "beforeQuery" => Self::BeforeQuery,
            "afterConfigure" => Self::AfterConfigure,
            _ => return None,
        })
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initialize => "initialize",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Release => "release",
            Self::Test => "test",
            Self::BeforeQuery => "beforeQuery",
            Self::AfterConfigure => "afterConfigure",
        })
    }
}

struct Transition {
    valid: [ControlState; 4],
    next: ControlState,
}

use ControlState as S;

/// Which states each operation may be requested from, and where it goes.
/// `S::None` entries pad unused slots; a `next` of `S::None` leaves the
/// state unchanged.
const TRANSITIONS: [Transition; 7] = [
    // initialize
    Transition { valid: [S::Exists, S::None, S::None, S::None], next: S::Initialized },
    // start
    Transition { valid: [S::Initialized, S::Suspended, S::None, S::None], next: S::Operating },
    // stop
    Transition { valid: [S::Operating, S::None, S::None, S::None], next: S::Suspended },
    // release
    Transition { valid: [S::Exists, S::Initialized, S::Operating, S::Suspended], next: S::Exists },
    // test
    Transition { valid: [S::Initialized, S::None, S::None, S::None], next: S::None },
    // beforeQuery
    Transition { valid: [S::Initialized, S::Operating, S::Suspended, S::None], next: S::None },
    // afterConfigure
    Transition { valid: [S::Initialized, S::Operating, S::Suspended, S::None], next: S::None },
];

/// Rebuild a worker's control state from its sticky status register.
///
/// The hardware records the last state-changing operation; software
/// carries no memory of its own across restarts.
pub fn state_from_status(stat: u32) -> ControlState {
    if stat & status::UNUSABLE != 0 {
        return ControlState::Unusable;
    }
    if stat & status::FINISHED != 0 {
        return ControlState::Finished;
    }
    match status::last_op(stat) {
        None => ControlState::Exists,
        Some(op) if op == ControlOp::Initialize as u32 => ControlState::Initialized,
        Some(op) if op == ControlOp::Start as u32 => ControlState::Operating,
        Some(op) if op == ControlOp::Stop as u32 => ControlState::Suspended,
        Some(op) if op == ControlOp::Release as u32 => ControlState::Exists,
        Some(op) => {
            tracing::warn!("status register records non-state-changing op {op}");
            ControlState::Exists
        }
    }
}

/// Control interface to one hardware worker.
#[derive(Debug)]
pub struct WorkerControl {
    impl_name: String,
    inst_name: String,
    occp_index: usize,
    has_control: bool,
    control_mask: u32,
    timeout: u32,
    state: ControlState,
    window: u32,
    control: Access,
    properties: Access,
}

impl WorkerControl {
    /// Wrap the control and config windows of worker `occp_index`.
    pub fn new(
        impl_name: impl Into<String>,
        inst_name: impl Into<String>,
        occp_index: usize,
        control: Access,
        properties: Access,
        has_control: bool,
    ) -> Self {
        let mut mask = 0;
        if has_control {
            for op in ControlOp::ALL {
                mask |= 1 << op as u32;
            }
        }
        Self {
            impl_name: impl_name.into(),
            inst_name: inst_name.into(),
            occp_index,
            has_control,
            control_mask: mask,
            timeout: worker::DEFAULT_TIMEOUT,
            state: ControlState::Exists,
            window: 0,
            control,
            properties,
        }
    }

    /// Worker name for diagnostics, `impl:inst`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.impl_name, self.inst_name)
    }

    /// OCCP index of this worker.
    pub const fn occp_index(&self) -> usize {
        self.occp_index
    }

    /// Current software view of the control state.
    pub const fn state(&self) -> ControlState {
        self.state
    }

    /// Restrict which operations this worker implements.
    pub fn set_control_mask(&mut self, mask: u32) {
        // start is always triggerable
        self.control_mask = mask | 1 << ControlOp::Start as u32;
    }

    /// The worker's configuration window.
    pub const fn properties(&self) -> &Access {
        &self.properties
    }

    /// The worker's control register window.
    pub const fn control_access(&self) -> &Access {
        &self.control
    }

    /// True when the worker is held in reset.
    ///
    /// # Errors
    ///
    /// Transport errors reading the control register.
    pub fn is_reset(&self) -> Result<bool> {
        Ok(self.control.get32(worker::CONTROL)? & control::ENABLE == 0)
    }

    /// Assert reset, then release it with the control timeout programmed.
    ///
    /// # Errors
    ///
    /// Transport errors writing the control register.
    pub fn reset_cycle(&mut self) -> Result<()> {
        let log_timeout = worker::log2_timeout(self.timeout);
        self.control.set32(worker::CONTROL, log_timeout)?;
        std::thread::sleep(Duration::from_micros(10));
        self.control.set32(worker::CONTROL, control::ENABLE | log_timeout)?;
        self.state = ControlState::Exists;
        tracing::info!("deasserted reset on worker {}", self.name());
        Ok(())
    }

    /// Hold the worker in reset.
    ///
    /// # Errors
    ///
    /// Transport errors writing the control register.
    pub fn assert_reset(&mut self) -> Result<()> {
        let log_timeout = worker::log2_timeout(self.timeout);
        self.control.set32(worker::CONTROL, log_timeout)?;
        self.state = ControlState::Exists;
        Ok(())
    }

    /// Raw status register.
    ///
    /// # Errors
    ///
    /// Transport errors reading the status register.
    pub fn status(&self) -> Result<u32> {
        self.control.get32(worker::STATUS)
    }

    /// Clear sticky error bits.
    ///
    /// # Errors
    ///
    /// Transport errors writing the clear-error register.
    pub fn clear_errors(&self) -> Result<()> {
        self.control.set32(worker::CLEAR_ERROR, 0)
    }

    /// Reconstruct control state from the hardware after a software
    /// restart. The status register is the only source of truth here.
    ///
    /// # Errors
    ///
    /// Transport errors reading the status register.
    pub fn attach(&mut self) -> Result<ControlState> {
        let stat = self.status()?;
        self.state = state_from_status(stat);
        tracing::info!(
            "reattached worker {}: status {:#010x}, state '{}'",
            self.name(),
            stat,
            self.state
        );
        Ok(self.state)
    }

    /// Poll for autonomous completion: a worker that set FINISHED while
    /// operating moves to the Finished state.
    ///
    /// # Errors
    ///
    /// Transport errors reading the status register.
    pub fn check_state(&mut self) -> Result<()> {
        if !self.has_control {
            return Ok(());
        }
        let stat = self.status()?;
        if stat & status::ALL_ERRORS != 0 {
            tracing::debug!("worker {} has errors: {:#010x}", self.name(), stat);
        }
        if stat & status::FINISHED != 0
            && matches!(self.state, ControlState::Operating | ControlState::Suspended)
        {
            self.state = ControlState::Finished;
        }
        Ok(())
    }

    /// Request a control operation.
    ///
    /// Requesting the operation that would re-enter the current state is
    /// a no-op and does not re-trigger the hardware. A request from a
    /// state outside the operation's valid-source set fails without
    /// touching hardware or state.
    ///
    /// # Errors
    ///
    /// `InvalidControlSequence` / `WorkerUnusable` for bad sequencing,
    /// `ControlOpFailed` when the hardware reports a non-success result,
    /// or transport errors.
    pub fn control_op(&mut self, op: ControlOp) -> Result<()> {
        let cs = self.state;
        let t = &TRANSITIONS[op as usize];
        // Starting or stopping after normal completion is benign.
        if cs == ControlState::Finished && matches!(op, ControlOp::Start | ControlOp::Stop) {
            return Ok(());
        }
        // Already in the target state: callers and workers need not care.
        if t.next != ControlState::None && cs == t.next {
            tracing::debug!("worker {} already '{}', '{op}' ignored", self.name(), cs);
            return Ok(());
        }
        if !t.valid.iter().any(|&v| v != ControlState::None && v == cs) {
            return Err(if cs == ControlState::Unusable {
                HdlError::WorkerUnusable { worker: self.name(), op }
            } else {
                HdlError::InvalidControlSequence { worker: self.name(), op, state: cs }
            });
        }
        if self.has_control && self.control_mask & (1 << op as u32) != 0 {
            let res = self.control.get32(op.offset())?;
            if res != result::SUCCESS {
                let reason = match res {
                    result::TIMEOUT => "timed out performing control operation",
                    result::ERROR => "indicated an error from control operation",
                    result::RESET => "was in a reset state when control operation was requested",
                    result::FATAL => "indicated a fatal error from control operation",
                    _ => "returned unknown result value from control operation",
                };
                tracing::info!(
                    "control op failed: worker {}({}) op {op} {reason} ({res:#010x})",
                    self.name(),
                    self.occp_index
                );
                return Err(HdlError::ControlOpFailed {
                    worker: self.name(),
                    index: self.occp_index,
                    op,
                    reason,
                    code: res,
                });
            }
            tracing::debug!("control op '{op}' succeeded on worker {}", self.name());
        } else {
            tracing::debug!("control op '{op}' avoided on worker {}", self.name());
        }
        if t.next != ControlState::None {
            self.state = t.next;
        }
        Ok(())
    }

    /// Read a 32-bit configuration value, routing offsets beyond the
    /// direct window through the page-window register.
    ///
    /// # Errors
    ///
    /// Transport errors, or sticky config-read errors in status.
    pub fn config_read32(&mut self, offset: u64) -> Result<u32> {
        let off = self.check_window(offset, 4)?;
        let val = self.properties.get32(off)?;
        let stat = self.status()? & status::READ_ERRORS;
        if stat != 0 {
            return Err(self.config_error("read", stat));
        }
        Ok(val)
    }

    /// Write a 32-bit configuration value through the window.
    ///
    /// # Errors
    ///
    /// Transport errors, or sticky config-write errors in status.
    pub fn config_write32(&mut self, offset: u64, value: u32) -> Result<()> {
        let off = self.check_window(offset, 4)?;
        self.properties.set32(off, value)?;
        let stat = self.status()? & status::WRITE_ERRORS;
        if stat != 0 {
            return Err(self.config_error("write", stat));
        }
        Ok(())
    }

    fn config_error(&self, dir: &'static str, stat: u32) -> HdlError {
        let reason = if stat & (status::READ_TIMEOUT | status::WRITE_TIMEOUT) != 0 {
            "timeout"
        } else if stat & (status::READ_FAIL | status::WRITE_FAIL) != 0 {
            "busy"
        } else {
            "worker generated error response"
        };
        HdlError::ConfigAccess { worker: self.name(), dir, reason, status: stat }
    }

    /// Map a config offset into the direct window, paging if needed.
    fn check_window(&mut self, offset: u64, bytes: u64) -> Result<u64> {
        if offset + bytes <= OCCP_WORKER_CONFIG_SIZE {
            return Ok(offset);
        }
        let page = (offset >> 16) as u32;
        if self.window != page {
            self.control.set32(worker::WINDOW, page)?;
            self.window = page;
        }
        Ok(offset & (OCCP_WORKER_CONFIG_SIZE - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    use crate::access::SharedAccessor;
    use std::sync::{Arc, Mutex};

    fn sim_worker() -> (WorkerControl, Arc<Mutex<SimDevice>>) {
        let sim = SimDevice::shared("sim", "simpart");
        let acc: SharedAccessor = sim.clone();
        let control = Access::remote(acc.clone(), occp_chip::worker_control_offset(2), 0);
        let properties = Access::remote(acc, occp_chip::worker_config_offset(2), 0);
        let mut w = WorkerControl::new("bias", "bias0", 2, control, properties, true);
        w.reset_cycle().expect("unreset");
        (w, sim)
    }

    #[test]
    fn normal_lifecycle_walks_the_table() {
        let (mut w, _s) = sim_worker();
        assert_eq!(w.state(), ControlState::Exists);
        w.control_op(ControlOp::Initialize).expect("initialize");
        assert_eq!(w.state(), ControlState::Initialized);
        w.control_op(ControlOp::Start).expect("start");
        assert_eq!(w.state(), ControlState::Operating);
        w.control_op(ControlOp::Stop).expect("stop");
        assert_eq!(w.state(), ControlState::Suspended);
        w.control_op(ControlOp::Start).expect("restart");
        assert_eq!(w.state(), ControlState::Operating);
        w.control_op(ControlOp::Release).expect("release");
        assert_eq!(w.state(), ControlState::Exists);
    }

    #[test]
    fn start_from_exists_is_invalid_and_does_not_mutate() {
        let (mut w, _s) = sim_worker();
        match w.control_op(ControlOp::Start) {
            Err(HdlError::InvalidControlSequence { op, state, .. }) => {
                assert_eq!(op, ControlOp::Start);
                assert_eq!(state, ControlState::Exists);
            }
            other => panic!("expected invalid control sequence, got {other:?}"),
        }
        assert_eq!(w.state(), ControlState::Exists);
    }

    #[test]
    fn release_from_exists_is_valid() {
        let (mut w, _s) = sim_worker();
        w.control_op(ControlOp::Release).expect("release from exists");
        assert_eq!(w.state(), ControlState::Exists);
    }

    #[test]
    fn every_op_rejects_every_unlisted_source() {
        for op in ControlOp::ALL {
            let t = &TRANSITIONS[op as usize];
            for cs in [S::Exists, S::Initialized, S::Operating, S::Suspended] {
                let listed = t.valid.iter().any(|&v| v == cs);
                let idempotent = t.next != S::None && cs == t.next;
                let (mut w, _s) = sim_worker();
                w.state = cs;
                let r = w.control_op(op);
                if listed || idempotent {
                    assert!(r.is_ok(), "{op} from {cs} should pass");
                } else {
                    assert!(
                        matches!(r, Err(HdlError::InvalidControlSequence { .. })),
                        "{op} from {cs} should fail"
                    );
                    assert_eq!(w.state(), cs, "{op} from {cs} must not mutate");
                }
            }
        }
    }

    #[test]
    fn repeated_start_does_not_touch_hardware() {
        let (mut w, s) = sim_worker();
        w.control_op(ControlOp::Initialize).expect("initialize");
        w.control_op(ControlOp::Start).expect("start");
        let slot = occp_chip::worker_control_offset(2) + ControlOp::Start.offset();
        let before = s.lock().expect("sim").reads_at(slot);
        w.control_op(ControlOp::Start).expect("idempotent start");
        let after = s.lock().expect("sim").reads_at(slot);
        assert_eq!(before, after, "second start must not re-trigger the slot");
        assert_eq!(w.state(), ControlState::Operating);
    }

    #[test]
    fn unusable_worker_names_its_condition() {
        let (mut w, _s) = sim_worker();
        w.state = ControlState::Unusable;
        match w.control_op(ControlOp::Start) {
            Err(HdlError::WorkerUnusable { op, .. }) => assert_eq!(op, ControlOp::Start),
            other => panic!("expected worker unusable, got {other:?}"),
        }
    }

    #[test]
    fn hardware_result_words_map_to_named_failures() {
        let cases = [
            (result::TIMEOUT, "timed out performing control operation"),
            (result::ERROR, "indicated an error from control operation"),
            (result::RESET, "was in a reset state when control operation was requested"),
            (result::FATAL, "indicated a fatal error from control operation"),
            (0x1234_5678, "returned unknown result value from control operation"),
        ];
        for (code, want) in cases {
            let (mut w, s) = sim_worker();
            s.lock().expect("sim").set_op_result(2, ControlOp::Initialize.offset(), code);
            match w.control_op(ControlOp::Initialize) {
                Err(HdlError::ControlOpFailed { reason, code: got, .. }) => {
                    assert_eq!(reason, want);
                    assert_eq!(got, code);
                }
                other => panic!("expected control-op failure, got {other:?}"),
            }
            assert_eq!(w.state(), ControlState::Exists, "failure must not advance state");
        }
    }

    #[test]
    fn attach_rebuilds_state_from_sticky_status() {
        let (mut w, s) = sim_worker();
        w.control_op(ControlOp::Initialize).expect("initialize");
        w.control_op(ControlOp::Start).expect("start");
        // A fresh process knows nothing; only the status register remains.
        let acc: SharedAccessor = s.clone();
        let control = Access::remote(acc.clone(), occp_chip::worker_control_offset(2), 0);
        let properties = Access::remote(acc, occp_chip::worker_config_offset(2), 0);
        let mut fresh = WorkerControl::new("bias", "bias0", 2, control, properties, true);
        assert_eq!(fresh.attach().expect("attach"), ControlState::Operating);

        s.lock().expect("sim").set_status(2, status::UNUSABLE);
        assert_eq!(fresh.attach().expect("attach"), ControlState::Unusable);
    }

    #[test]
    fn finished_worker_tolerates_start_and_stop() {
        let (mut w, _s) = sim_worker();
        w.state = ControlState::Finished;
        w.control_op(ControlOp::Start).expect("start after finish");
        w.control_op(ControlOp::Stop).expect("stop after finish");
        assert_eq!(w.state(), ControlState::Finished);
    }
}
