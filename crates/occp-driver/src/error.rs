//! Error types for HDL device operations.
//!
//! One enum carries the whole taxonomy. The split matters to callers:
//! transport timeouts are *possibly* lost messages (another device or a
//! later retry may succeed), while worker-reported conditions are
//! definitive remote state; discovery errors are non-fatal to a scan;
//! control-sequence and negotiation errors are deterministic caller
//! mistakes and are never retried.

use crate::control::{ControlOp, ControlState};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for HDL operations.
pub type Result<T> = std::result::Result<T, HdlError>;

/// Errors that can occur during HDL device operations.
#[derive(Debug, Error)]
pub enum HdlError {
    /// Retries exhausted without any valid response from the device.
    #[error("ethernet timeout - no valid response from {dest} after {retries} attempts")]
    EtherTimeout {
        /// Address the requests were sent to.
        dest: String,
        /// Attempts made.
        retries: u32,
    },

    /// The device answered, reporting that the addressed worker timed out.
    #[error("HDL network {what} error: worker timeout")]
    WorkerTimeout {
        /// Request kind ("read", "write", "nop").
        what: &'static str,
    },

    /// The device answered, reporting a processing error.
    #[error("HDL network {what} error: worker error")]
    RemoteError {
        /// Request kind ("read", "write", "nop").
        what: &'static str,
    },

    /// A request was attempted on a transport already marked failed.
    #[error("network request after previous failure on {dest}")]
    TransportFailed {
        /// Device the transport talks to.
        dest: String,
    },

    /// A send on the raw socket failed.
    #[error("control frame send failed: {reason}")]
    SendFailed {
        /// OS-level reason.
        reason: String,
    },

    /// A discovery probe answer deviated from the prescribed pattern.
    #[error("bad ethernet discovery response from {addr}")]
    BadProbeResponse {
        /// Address the malformed response came from.
        addr: String,
    },

    /// A named device could not be opened.
    #[error("HDL device '{name}' not found: {reason}")]
    DeviceNotFound {
        /// Device name as given by the caller.
        name: String,
        /// Why the open failed.
        reason: String,
    },

    /// No devices found by a search that required at least one.
    #[error("no HDL devices found")]
    NoDevicesFound,

    /// A candidate device failed validation during discovery.
    #[error("discovery: {reason}")]
    Discovery {
        /// What disqualified the candidate.
        reason: String,
    },

    /// A sysfs attribute was unreadable or unparseable.
    #[error("cannot read {path}: {reason}")]
    Sysfs {
        /// Attribute path.
        path: PathBuf,
        /// Parse or I/O failure.
        reason: String,
    },

    /// The admin space did not carry the expected magic.
    #[error("HDL device '{name}' magic mismatch: got {magic:#018x}")]
    BadMagic {
        /// Device name.
        name: String,
        /// Value actually read.
        magic: u64,
    },

    /// The admin UUID block held a garbage platform name.
    #[error("HDL device '{name}' platform name in admin space is garbage")]
    BadPlatformName {
        /// Device name.
        name: String,
    },

    /// A control operation was requested from a state outside its
    /// valid-source set.
    #[error("invalid control sequence: '{op}' requested on worker '{worker}' in state '{state}'")]
    InvalidControlSequence {
        /// Worker name.
        worker: String,
        /// Operation requested.
        op: ControlOp,
        /// State the worker was in.
        state: ControlState,
    },

    /// A control operation was requested on a worker in the terminal
    /// failure state.
    #[error("worker unusable: '{op}' requested on worker '{worker}'")]
    WorkerUnusable {
        /// Worker name.
        worker: String,
        /// Operation requested.
        op: ControlOp,
    },

    /// The hardware returned a failure word for a control operation.
    #[error("control op failed: worker {worker}({index}) op {op} {reason} ({code:#010x})")]
    ControlOpFailed {
        /// Worker name.
        worker: String,
        /// OCCP worker index.
        index: usize,
        /// Operation that was triggered.
        op: ControlOp,
        /// Decoded hardware result.
        reason: &'static str,
        /// Raw result word.
        code: u32,
    },

    /// A configuration-space access reported a sticky error.
    #[error("config {dir} error on worker {worker}: {reason} (status {status:#010x})")]
    ConfigAccess {
        /// Worker name.
        worker: String,
        /// "read" or "write".
        dir: &'static str,
        /// Decoded status.
        reason: &'static str,
        /// Raw status word.
        status: u32,
    },

    /// Role negotiation could not produce a compatible assignment.
    #[error("{0}")]
    Negotiation(&'static str),

    /// ActiveMessage consumer found the producer's buffers larger than its
    /// own.
    #[error("at consumer, remote buffer size is larger than mine ({remote} > {local})")]
    RemoteBufferTooLarge {
        /// Peer buffer size.
        remote: u32,
        /// Local buffer size.
        local: u32,
    },

    /// ActiveMessage producer found the consumer's buffers smaller than
    /// its own.
    #[error("at producer, remote buffer size smaller than mine ({remote} < {local})")]
    RemoteBufferTooSmall {
        /// Peer buffer size.
        remote: u32,
        /// Local buffer size.
        local: u32,
    },

    /// Requested buffer geometry exceeds the port's OCDP memory.
    #[error(
        "requested buffer count/size ({count}/{size}) on port '{port}' won't fit in the OCDP's memory ({memory})"
    )]
    BuffersDontFit {
        /// Port name.
        port: String,
        /// Requested buffer count.
        count: u32,
        /// Requested buffer size.
        size: u32,
        /// OCDP memory available.
        memory: u32,
    },

    /// Endpoint string too long for the descriptor's fixed field.
    #[error("endpoint string of {len} bytes exceeds the {max}-byte descriptor field")]
    EndpointTooLong {
        /// Length including the terminating NUL.
        len: usize,
        /// Field capacity.
        max: usize,
    },

    /// A received connection descriptor could not be decoded.
    #[error("malformed connection descriptor")]
    DescriptorDecode,

    /// Two co-located ports do not reference the same static connection.
    #[error("ports '{a}' and '{b}' are both local in the same artifact, but are not connected")]
    NotConnectedInside {
        /// User-side port name.
        a: String,
        /// Provider-side port name.
        b: String,
    },

    /// I/O error during device communication.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

impl HdlError {
    /// Create a discovery error.
    pub fn discovery(reason: impl Into<String>) -> Self {
        Self::Discovery { reason: reason.into() }
    }

    /// Create a device-not-found error.
    pub fn device_not_found(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceNotFound { name: name.into(), reason: reason.into() }
    }

    /// Create a sysfs error.
    pub fn sysfs(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Sysfs { path: path.into(), reason: reason.into() }
    }

    /// True for transport-level timeouts where a retry elsewhere might
    /// succeed, as opposed to definitive remote state.
    pub const fn is_transport_timeout(&self) -> bool {
        matches!(self, Self::EtherTimeout { .. })
    }
}
