//! Port connection and RDMA descriptor negotiation.
//!
//! A data connection pairs a producer port with a consumer port and gives
//! exactly one side (or neither) responsibility for pushing data and
//! flow-control signals. Each side advertises the roles its data mover
//! can play; `choose_roles` resolves a single assignment, after which
//! both sides' options carry the mandated bit and the outcome is frozen.
//!
//! Remote connections exchange serialized descriptors: the provider
//! announces its geometry, the user resolves roles and finalizes its
//! side, and the provider confirms and finalizes in turn. Extra exchange
//! steps exist in the contract but the common case is two round trips;
//! unused steps return empty buffers. Co-located ports skip marshaling
//! entirely and are matched by their static connection identity.
//!
//! Finalization programs the port's OCDP block and drives the
//! interconnect (and any adapter) worker through initialize and start so
//! the hardware data mover comes alive.

use crate::control::{ControlOp, WorkerControl};
use crate::device::{Device, EndPoint};
use crate::error::{HdlError, Result};
use bytes::{Buf, BufMut};
use occp_chip::ocdp;
use std::fmt;

/// Transfer roles, enumerated so that the push roles scan first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortRole {
    /// This side pushes data directly into the peer's buffers.
    ActiveMessage = 0,
    /// This side pushes availability signals back to the peer.
    ActiveFlowControl = 1,
    /// This side has no remote-memory access; local staging only.
    ActiveOnly = 2,
    /// Both sides poll shared flags.
    Passive = 3,
    /// Unnegotiated.
    NoRole = 4,
}

/// Number of real roles (excludes `NoRole`).
pub const N_ROLES: u32 = 4;

/// Options bit freezing the role against renegotiation.
pub const MANDATED_ROLE: u32 = 1 << 4;

impl PortRole {
    /// Role for an options-bit index; out-of-range maps to `NoRole`.
    pub const fn from_index(i: u32) -> Self {
        match i {
            0 => Self::ActiveMessage,
            1 => Self::ActiveFlowControl,
            2 => Self::ActiveOnly,
            3 => Self::Passive,
            _ => Self::NoRole,
        }
    }

    /// The role the peer must hold for this one to function.
    pub const fn complement(self) -> Self {
        match self {
            Self::ActiveMessage => Self::ActiveFlowControl,
            Self::ActiveFlowControl => Self::ActiveMessage,
            Self::ActiveOnly => Self::Passive,
            Self::Passive => Self::ActiveOnly,
            Self::NoRole => Self::NoRole,
        }
    }

    /// This role's options bit.
    pub const fn bit(self) -> u32 {
        1 << self as u32
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ActiveMessage => "active-message",
            Self::ActiveFlowControl => "active-flowcontrol",
            Self::ActiveOnly => "active-only",
            Self::Passive => "passive",
            Self::NoRole => "no-role",
        })
    }
}

fn default_role(role: &mut PortRole, options: u32) -> Result<()> {
    if *role == PortRole::NoRole {
        for n in 0..N_ROLES {
            if options & (1 << n) != 0 {
                *role = PortRole::from_index(n);
                return Ok(());
            }
        }
        return Err(HdlError::Negotiation("port has no transfer roles"));
    }
    Ok(())
}

/// Resolve one role assignment for a connection.
///
/// Coming in, each side's role is `NoRole`, a preference, or (with
/// `MANDATED_ROLE` set in its options) a hard requirement; options is the
/// bitmask of roles the side can play. On success both roles are
/// complementary and both option words carry `MANDATED_ROLE`, freezing
/// the outcome.
///
/// The tie-break order below is deliberately kept as deployed bitstreams
/// expect it; see DESIGN.md before rearranging.
///
/// # Errors
///
/// `Negotiation` when no compatible assignment exists.
pub fn choose_roles(
    user_role: &mut PortRole,
    user_options: &mut u32,
    provider_role: &mut PortRole,
    provider_options: &mut u32,
) -> Result<()> {
    default_role(user_role, *user_options)?;
    default_role(provider_role, *provider_options)?;
    settle(user_role, user_options, provider_role, provider_options)?;
    *user_options |= MANDATED_ROLE;
    *provider_options |= MANDATED_ROLE;
    Ok(())
}

#[allow(clippy::too_many_lines)]
fn settle(
    u_role: &mut PortRole,
    u_options: &mut u32,
    p_role: &mut PortRole,
    p_options: &mut u32,
) -> Result<()> {
    use PortRole::{ActiveFlowControl, ActiveMessage, ActiveOnly, NoRole, Passive};
    let p_other = p_role.complement();
    let u_other = u_role.complement();
    if *p_options & MANDATED_ROLE != 0 {
        // provider has a mandate
        debug_assert!(*p_role != NoRole);
        if *u_role == p_other {
            return Ok(());
        }
        if *u_options & MANDATED_ROLE != 0 {
            return Err(HdlError::Negotiation("incompatible mandated transfer roles"));
        }
        if *u_options & p_other.bit() != 0 {
            *u_role = p_other;
            return Ok(());
        }
        return Err(HdlError::Negotiation("no compatible role available against mandated role"));
    } else if *p_role != NoRole {
        // provider has a preference
        if *u_options & MANDATED_ROLE != 0 {
            // user has a mandate
            debug_assert!(*u_role != NoRole);
            if *p_role == u_other {
                return Ok(());
            }
            if *p_options & u_other.bit() != 0 {
                *p_role = u_other;
                return Ok(());
            }
            return Err(HdlError::Negotiation(
                "no compatible role available against mandated role",
            ));
        } else if *u_role != NoRole {
            // Preferences on both sides, no mandate.
            if *p_role == u_other {
                return Ok(());
            }
            // A preference away from push wins over one toward it.
            if *u_role == ActiveFlowControl && *p_options & ActiveMessage.bit() != 0 {
                *p_role = ActiveMessage;
                return Ok(());
            }
            if *u_role == ActiveMessage && *p_options & ActiveFlowControl.bit() != 0 {
                *p_role = ActiveFlowControl;
                return Ok(());
            }
            if *p_role == ActiveFlowControl && *u_options & ActiveMessage.bit() != 0 {
                *u_role = ActiveMessage;
                return Ok(());
            }
            // Then the local-staging pair.
            if *u_role == ActiveOnly && *p_options & Passive.bit() != 0 {
                *p_role = Passive;
                return Ok(());
            }
            if *p_role == Passive && *u_options & ActiveOnly.bit() != 0 {
                *u_role = ActiveOnly;
                return Ok(());
            }
            // Keep whichever side holds the better (lower-valued) role.
            if (*u_role as u32) < (*p_role as u32) && *p_options & u_other.bit() != 0 {
                *p_role = u_other;
                return Ok(());
            }
            // Provider preference outranks the user's.
            if *u_options & p_other.bit() != 0 {
                *u_role = p_other;
                return Ok(());
            }
            if *p_options & u_other.bit() != 0 {
                *p_role = u_other;
                return Ok(());
            }
            // Neither preference is usable; fall through.
        } else if *u_options & p_other.bit() != 0 {
            *u_role = p_other;
            return Ok(());
        }
        // Provider preference unusable; fall through.
    } else if *u_options & MANDATED_ROLE != 0 {
        // Only the user has a mandate.
        if *p_options & u_other.bit() != 0 {
            *p_role = u_other;
            return Ok(());
        }
        return Err(HdlError::Negotiation("no compatible role available against mandated role"));
    } else if *u_role != NoRole {
        // Only the user has a preference.
        if *p_options & u_other.bit() != 0 {
            *p_role = u_other;
            return Ok(());
        }
        // fall through
    }
    // No usable mandate or preference anywhere: first mutually supported
    // pair in enum order, which biases toward the push roles.
    for i in 0..N_ROLES {
        let r = PortRole::from_index(i);
        if *u_options & r.bit() != 0 && *p_options & r.complement().bit() != 0 {
            *u_role = r;
            *p_role = r.complement();
            return Ok(());
        }
    }
    Err(HdlError::Negotiation("no compatible combination of roles exist"))
}

/// Which end of the connection a descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DescKind {
    /// Input / provider side.
    Consumer = 0,
    /// Output / user side.
    Producer = 1,
}

/// Capacity of the descriptor's endpoint string field, including the
/// terminating NUL. Longer strings are rejected, never truncated.
pub const MAX_ENDPOINT: usize = 128;

/// Out-of-band addressing the peer needs to reach this side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutOfBand {
    /// Opaque port identity.
    pub port_id: u64,
    /// Endpoint string (< [`MAX_ENDPOINT`] bytes with its NUL).
    pub endpoint: String,
    /// Opaque transport cookie.
    pub cookie: u64,
    /// Bus address of the endpoint origin; all base fields in the
    /// descriptor body are offsets from it.
    pub address: u64,
}

/// Buffer and flag geometry one side exposes to its peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Desc {
    /// Number of buffers.
    pub n_buffers: u32,
    /// Buffer region base (offset from `oob.address`).
    pub data_buffer_base: u64,
    /// Distance between buffers.
    pub data_buffer_pitch: u32,
    /// Usable bytes per buffer.
    pub data_buffer_size: u32,
    /// Metadata region base.
    pub metadata_base: u64,
    /// Distance between metadata records.
    pub metadata_pitch: u32,
    /// Full-flag region base.
    pub full_flag_base: u64,
    /// Width of a full flag.
    pub full_flag_size: u32,
    /// Distance between full flags.
    pub full_flag_pitch: u32,
    /// Value written to signal "full".
    pub full_flag_value: u64,
    /// Empty-flag region base.
    pub empty_flag_base: u64,
    /// Width of an empty flag.
    pub empty_flag_size: u32,
    /// Distance between empty flags.
    pub empty_flag_pitch: u32,
    /// Value written to signal "empty".
    pub empty_flag_value: u64,
    /// Out-of-band addressing.
    pub oob: OutOfBand,
}

/// The negotiable and negotiated parameters one side publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptors {
    /// Which end this is.
    pub kind: DescKind,
    /// Current role value (`NoRole`, preference, or mandated).
    pub role: PortRole,
    /// Supported-roles bitmask, plus [`MANDATED_ROLE`] once frozen.
    pub options: u32,
    /// Geometry.
    pub desc: Desc,
}

const LITTLE_ENDIAN_FLAG: u8 = 1;

/// Serialize a descriptor for the exchange.
///
/// # Errors
///
/// `EndpointTooLong` when the endpoint string cannot fit its field.
pub fn pack_descriptor(d: &Descriptors) -> Result<Vec<u8>> {
    if d.desc.oob.endpoint.len() + 1 > MAX_ENDPOINT {
        return Err(HdlError::EndpointTooLong {
            len: d.desc.oob.endpoint.len() + 1,
            max: MAX_ENDPOINT,
        });
    }
    let mut out = Vec::with_capacity(160);
    out.put_u8(LITTLE_ENDIAN_FLAG);
    out.put_u32_le(d.kind as u32);
    out.put_u32_le(d.role as u32);
    out.put_u32_le(d.options);
    let b = &d.desc;
    out.put_u32_le(b.n_buffers);
    out.put_u64_le(b.data_buffer_base);
    out.put_u32_le(b.data_buffer_pitch);
    out.put_u32_le(b.data_buffer_size);
    out.put_u64_le(b.metadata_base);
    out.put_u32_le(b.metadata_pitch);
    out.put_u64_le(b.full_flag_base);
    out.put_u32_le(b.full_flag_size);
    out.put_u32_le(b.full_flag_pitch);
    out.put_u64_le(b.full_flag_value);
    out.put_u64_le(b.empty_flag_base);
    out.put_u32_le(b.empty_flag_size);
    out.put_u32_le(b.empty_flag_pitch);
    out.put_u64_le(b.empty_flag_value);
    out.put_u64_le(b.oob.port_id);
    out.put_u32_le((b.oob.endpoint.len() + 1) as u32);
    out.put_slice(b.oob.endpoint.as_bytes());
    out.put_u8(0);
    out.put_u64_le(b.oob.cookie);
    out.put_u64_le(b.oob.address);
    Ok(out)
}

/// Deserialize a descriptor from the peer, honoring its byte-order flag.
///
/// # Errors
///
/// `DescriptorDecode` on truncation, oversize endpoint strings, or any
/// malformed field.
pub fn unpack_descriptor(data: &[u8]) -> Result<Descriptors> {
    let mut buf = data;
    let take4 = |buf: &mut &[u8], le: bool| -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(HdlError::DescriptorDecode);
        }
        Ok(if le { buf.get_u32_le() } else { buf.get_u32() })
    };
    let take8 = |buf: &mut &[u8], le: bool| -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(HdlError::DescriptorDecode);
        }
        Ok(if le { buf.get_u64_le() } else { buf.get_u64() })
    };
    if buf.remaining() < 1 {
        return Err(HdlError::DescriptorDecode);
    }
    let le = buf.get_u8() == LITTLE_ENDIAN_FLAG;
    let kind = match take4(&mut buf, le)? {
        0 => DescKind::Consumer,
        1 => DescKind::Producer,
        _ => return Err(HdlError::DescriptorDecode),
    };
    let role = PortRole::from_index(take4(&mut buf, le)?);
    let options = take4(&mut buf, le)?;
    let mut b = Desc {
        n_buffers: take4(&mut buf, le)?,
        data_buffer_base: take8(&mut buf, le)?,
        data_buffer_pitch: take4(&mut buf, le)?,
        data_buffer_size: take4(&mut buf, le)?,
        metadata_base: take8(&mut buf, le)?,
        metadata_pitch: take4(&mut buf, le)?,
        full_flag_base: take8(&mut buf, le)?,
        full_flag_size: take4(&mut buf, le)?,
        full_flag_pitch: take4(&mut buf, le)?,
        full_flag_value: take8(&mut buf, le)?,
        empty_flag_base: take8(&mut buf, le)?,
        empty_flag_size: take4(&mut buf, le)?,
        empty_flag_pitch: take4(&mut buf, le)?,
        empty_flag_value: take8(&mut buf, le)?,
        oob: OutOfBand::default(),
    };
    b.oob.port_id = take8(&mut buf, le)?;
    let slen = take4(&mut buf, le)? as usize;
    if slen == 0 || slen > MAX_ENDPOINT || buf.remaining() < slen {
        return Err(HdlError::DescriptorDecode);
    }
    let bytes = &buf[..slen];
    if bytes[slen - 1] != 0 {
        return Err(HdlError::DescriptorDecode);
    }
    b.oob.endpoint = std::str::from_utf8(&bytes[..slen - 1])
        .map_err(|_| HdlError::DescriptorDecode)?
        .to_string();
    buf.advance(slen);
    b.oob.cookie = take8(&mut buf, le)?;
    b.oob.address = take8(&mut buf, le)?;
    Ok(Descriptors { kind, role, options, desc: b })
}

/// Everything the loaded bitstream's metadata says about one port.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Port name.
    pub name: String,
    /// True for the consumer/input side.
    pub is_provider: bool,
    /// Identity of the static connection this port belongs to, when the
    /// assembly wires it internally.
    pub connection: Option<String>,
    /// Offset of this port's buffer memory within the data space.
    pub ocdp_offset: u64,
    /// OCCP index of the interconnect worker owning the OCDP block;
    /// `None` means the port cannot be externally connected.
    pub interconnect_index: Option<usize>,
    /// OCCP index of an adapter worker in the path, if any.
    pub adapter_index: Option<usize>,
    /// Configuration word for the adapter.
    pub adapter_config: Option<u32>,
    /// Buffer count to request.
    pub n_buffers: u32,
    /// Buffer size to request.
    pub buffer_size: u32,
}

/// A data-plane endpoint of a worker.
#[derive(Debug)]
pub struct Port {
    name: String,
    is_provider: bool,
    connection: Option<String>,
    ocdp_size: u32,
    control: Option<WorkerControl>,
    adapter: Option<WorkerControl>,
    adapter_config: Option<u32>,
    desc: Descriptors,
    endpoint: Option<EndPoint>,
    connected: bool,
}

impl Port {
    /// Build a port on `device` from bitstream metadata.
    ///
    /// # Errors
    ///
    /// Transport errors probing the OCDP block, or invalid worker
    /// indices.
    pub fn new(device: &Device, cfg: &PortConfig) -> Result<Self> {
        let kind = if cfg.is_provider { DescKind::Consumer } else { DescKind::Producer };
        let mut desc = Descriptors {
            kind,
            role: PortRole::NoRole,
            options: device.dma_options(cfg.is_provider),
            desc: Desc {
                n_buffers: cfg.n_buffers,
                data_buffer_size: cfg.buffer_size,
                // Fixed values not revisited at connect time.
                full_flag_size: 4,
                full_flag_pitch: 0,
                full_flag_value: 1,
                empty_flag_size: 4,
                empty_flag_pitch: 0,
                empty_flag_value: 1,
                metadata_pitch: ocdp::METADATA_SIZE,
                ..Desc::default()
            },
        };

        let Some(ic_index) = cfg.interconnect_index else {
            // Internally wired only; no OCDP, no descriptors.
            return Ok(Self {
                name: cfg.name.clone(),
                is_provider: cfg.is_provider,
                connection: cfg.connection.clone(),
                ocdp_size: 0,
                control: None,
                adapter: None,
                adapter_config: None,
                desc,
                endpoint: None,
                connected: false,
            });
        };

        let mut control = device.worker("ocdp", &format!("{}_ic", cfg.name), ic_index)?;
        if control.is_reset()? {
            control.reset_cycle()?;
        }
        let adapter = match cfg.adapter_index {
            Some(i) => {
                let mut a = device.worker("adapter", &format!("{}_ad", cfg.name), i)?;
                if a.is_reset()? {
                    a.reset_cycle()?;
                }
                Some(a)
            }
            None => None,
        };
        let ocdp_size = control.properties().get32(ocdp::MEMORY_BYTES)?;
        let endpoint = device.endpoint();

        desc.desc.oob.endpoint = endpoint.specifier.clone();
        desc.desc.oob.address = endpoint.address;
        desc.desc.data_buffer_base =
            device.data_space().bus_offset(cfg.ocdp_offset) - endpoint.address;
        let props = control.properties();
        // The flag the peer hits lives in the OCDP register space; which
        // register is which depends on direction.
        if cfg.is_provider {
            desc.desc.full_flag_base = props.bus_offset(ocdp::N_REMOTE_DONE) - endpoint.address;
            desc.desc.empty_flag_base = props.bus_offset(ocdp::N_READY) - endpoint.address;
        } else {
            desc.desc.empty_flag_base = props.bus_offset(ocdp::N_REMOTE_DONE) - endpoint.address;
            desc.desc.full_flag_base = props.bus_offset(ocdp::N_READY) - endpoint.address;
        }

        Ok(Self {
            name: cfg.name.clone(),
            is_provider: cfg.is_provider,
            connection: cfg.connection.clone(),
            ocdp_size,
            control: Some(control),
            adapter,
            adapter_config: cfg.adapter_config,
            desc,
            endpoint: Some(endpoint),
            connected: false,
        })
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for the consumer/input side.
    pub const fn is_provider(&self) -> bool {
        self.is_provider
    }

    /// True when the port can take part in an external connection.
    pub const fn can_be_external(&self) -> bool {
        self.control.is_some()
    }

    /// This side's current descriptor.
    pub const fn descriptors(&self) -> &Descriptors {
        &self.desc
    }

    /// The endpoint backing this port, when externally connectable.
    pub const fn endpoint(&self) -> Option<&EndPoint> {
        self.endpoint.as_ref()
    }

    /// True once `finish_connect` has completed.
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Apply a `transferRole` connection parameter: a preference, or a
    /// hard requirement when `mandated`.
    pub fn set_transfer_role(&mut self, role: PortRole, mandated: bool) {
        self.desc.role = role;
        if role != PortRole::NoRole {
            self.desc.options |= role.bit();
        }
        if mandated {
            self.desc.options |= MANDATED_ROLE;
        }
    }

    /// Announce-time work: validate geometry against the OCDP memory and
    /// fill in the derived descriptor fields. Commits no resources.
    ///
    /// # Errors
    ///
    /// `BuffersDontFit` when the requested geometry exceeds OCDP memory.
    pub fn start_connect(&mut self, _other: Option<&Descriptors>) -> Result<()> {
        if !self.can_be_external() {
            return Ok(());
        }
        if self.connected {
            return Err(HdlError::Negotiation("port is already connected"));
        }
        let d = &mut self.desc.desc;
        let needed = d.n_buffers * (ocdp::round_up(d.data_buffer_size) + ocdp::METADATA_SIZE);
        if needed > self.ocdp_size {
            return Err(HdlError::BuffersDontFit {
                port: self.name.clone(),
                count: d.n_buffers,
                size: d.data_buffer_size,
                memory: self.ocdp_size,
            });
        }
        d.data_buffer_pitch = ocdp::round_up(d.data_buffer_size);
        d.metadata_base = d.data_buffer_base + u64::from(self.ocdp_size)
            - u64::from(d.n_buffers) * u64::from(ocdp::METADATA_SIZE);
        Ok(())
    }

    /// All the info is in: program the OCDP block for the resolved role
    /// and bring the data mover up. Returns this side's final descriptor
    /// when the peer still needs it (user side), `None` otherwise.
    ///
    /// # Errors
    ///
    /// Buffer-size mismatches, unresolved roles, control-op failures, and
    /// transport errors. The OCDP presence check is a programming error
    /// and panics.
    pub fn finish_connect(&mut self, other: &Descriptors) -> Result<Option<&Descriptors>> {
        let control = self
            .control
            .as_mut()
            .ok_or(HdlError::Negotiation("port cannot be externally connected"))?;
        let props = control.properties().clone();
        // Not recoverable: the bitstream's OCDP block is absent or
        // miswired and register programming would scribble on nothing.
        assert_eq!(
            props.get32(ocdp::FOOD_FACE_REG)?,
            ocdp::FOOD_FACE,
            "OCDP signature missing on port '{}'",
            self.name
        );
        let mine = self.desc.desc.clone();
        props.set32(ocdp::N_LOCAL_BUFFERS, mine.n_buffers)?;
        props.set32(ocdp::LOCAL_BUFFER_SIZE, mine.data_buffer_pitch)?;
        props.set32(ocdp::LOCAL_BUFFER_BASE, 0)?;
        props.set32(
            ocdp::LOCAL_METADATA_BASE,
            self.ocdp_size - mine.n_buffers * ocdp::METADATA_SIZE,
        )?;

        let hw_role = match self.desc.role {
            PortRole::ActiveFlowControl => {
                let addr = other.desc.oob.address
                    + if self.is_provider {
                        other.desc.empty_flag_base
                    } else {
                        other.desc.full_flag_base
                    };
                let pitch = if self.is_provider {
                    other.desc.empty_flag_pitch
                } else {
                    other.desc.full_flag_pitch
                };
                props.set32(ocdp::REMOTE_FLAG_BASE, addr as u32)?;
                props.set32(ocdp::REMOTE_FLAG_HI, (addr >> 32) as u32)?;
                props.set32(ocdp::REMOTE_FLAG_PITCH, pitch)?;
                tracing::debug!(
                    "port '{}' is {} in AFC, remote flag {addr:#x} pitch {pitch}",
                    self.name,
                    if self.is_provider { "consumer" } else { "producer" }
                );
                ocdp::role::ACTIVE_FLOWCONTROL
            }
            PortRole::ActiveMessage => {
                let addr = other.desc.oob.address + other.desc.data_buffer_base;
                props.set32(ocdp::REMOTE_BUFFER_BASE, addr as u32)?;
                props.set32(ocdp::REMOTE_BUFFER_HI, (addr >> 32) as u32)?;
                let addr = other.desc.oob.address + other.desc.metadata_base;
                props.set32(ocdp::REMOTE_METADATA_BASE, addr as u32)?;
                props.set32(ocdp::REMOTE_METADATA_HI, (addr >> 32) as u32)?;
                if self.is_provider {
                    if other.desc.data_buffer_size > mine.data_buffer_size {
                        return Err(HdlError::RemoteBufferTooLarge {
                            remote: other.desc.data_buffer_size,
                            local: mine.data_buffer_size,
                        });
                    }
                } else if other.desc.data_buffer_size < mine.data_buffer_size {
                    return Err(HdlError::RemoteBufferTooSmall {
                        remote: other.desc.data_buffer_size,
                        local: mine.data_buffer_size,
                    });
                }
                props.set32(ocdp::N_REMOTE_BUFFERS, other.desc.n_buffers)?;
                props.set32(ocdp::REMOTE_BUFFER_SIZE, other.desc.data_buffer_pitch)?;
                props.set32(ocdp::REMOTE_METADATA_SIZE, other.desc.metadata_pitch)?;
                let addr = other.desc.oob.address
                    + if self.is_provider {
                        other.desc.empty_flag_base
                    } else {
                        other.desc.full_flag_base
                    };
                props.set32(ocdp::REMOTE_FLAG_BASE, addr as u32)?;
                props.set32(ocdp::REMOTE_FLAG_HI, (addr >> 32) as u32)?;
                props.set32(
                    ocdp::REMOTE_FLAG_PITCH,
                    if self.is_provider {
                        other.desc.empty_flag_pitch
                    } else {
                        other.desc.full_flag_pitch
                    },
                )?;
                ocdp::role::ACTIVE_MESSAGE
            }
            PortRole::Passive => ocdp::role::PASSIVE,
            role => {
                return Err(HdlError::Negotiation(match role {
                    PortRole::ActiveOnly => "active-only is not a hardware port role",
                    _ => "connection role was never resolved",
                }));
            }
        };
        props.set32(
            ocdp::CONTROL,
            ocdp::control_word(
                if self.is_provider { ocdp::direction::CONSUMER } else { ocdp::direction::PRODUCER },
                hw_role,
            ),
        )?;
        // The OCDP is not a proper worker in the assembly; someone has to
        // start it. Same for any adapter in the path.
        control.control_op(ControlOp::Initialize)?;
        if let Some(adapter) = &mut self.adapter {
            adapter.control_op(ControlOp::Initialize)?;
            if let Some(cfgword) = self.adapter_config {
                adapter.properties().set32(0, cfgword)?;
            }
            adapter.control_op(ControlOp::Start)?;
        }
        control.control_op(ControlOp::Start)?;
        self.connected = true;
        tracing::info!("port '{}' connected as {}", self.name, self.desc.role);
        Ok(if self.is_provider { None } else { Some(&self.desc) })
    }

    /// Step 1 (provider): announce geometry and role options. No
    /// resources are committed yet.
    ///
    /// # Errors
    ///
    /// Geometry validation and serialization errors.
    pub fn initial_provider_info(&mut self) -> Result<Vec<u8>> {
        debug_assert!(self.is_provider);
        self.start_connect(None)?;
        pack_descriptor(&self.desc)
    }

    /// Step 2 (user): resolve roles against the provider's announcement
    /// and — roles now being fixed — finalize this side immediately.
    /// Returns the serialized final user descriptor.
    ///
    /// # Errors
    ///
    /// Decode, negotiation, geometry, and finalization errors.
    pub fn apply_initial_provider_info(&mut self, info: &[u8]) -> Result<Vec<u8>> {
        debug_assert!(!self.is_provider);
        let mut other = unpack_descriptor(info)?;
        choose_roles(
            &mut self.desc.role,
            &mut self.desc.options,
            &mut other.role,
            &mut other.options,
        )?;
        self.start_connect(Some(&other))?;
        self.finish_connect(&other)?;
        pack_descriptor(&self.desc)
    }

    /// Step 3 (provider): confirm roles against the user's final
    /// descriptor and finalize this side. The returned buffer is empty:
    /// no further exchange is needed in the common case.
    ///
    /// # Errors
    ///
    /// Decode, negotiation, and finalization errors.
    pub fn apply_initial_user_info(&mut self, info: &[u8]) -> Result<Vec<u8>> {
        debug_assert!(self.is_provider);
        let mut other = unpack_descriptor(info)?;
        choose_roles(
            &mut other.role,
            &mut other.options,
            &mut self.desc.role,
            &mut self.desc.options,
        )?;
        self.finish_connect(&other)?;
        Ok(Vec::new())
    }

    /// Steps 4 and 5 exist for transports needing more exchange; this
    /// implementation never does.
    ///
    /// # Errors
    ///
    /// None currently.
    pub fn apply_final_info(&mut self, _info: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Connect two ports inside the same artifact: statically wired, so
    /// the only work is verifying they reference the same connection.
    ///
    /// # Errors
    ///
    /// `NotConnectedInside` when the static connection identities differ.
    pub fn connect_inside(&mut self, provider: &mut Port) -> Result<()> {
        provider.start_connect(None)?;
        match (&self.connection, &provider.connection) {
            (Some(a), Some(b)) if a == b => {
                self.connected = true;
                provider.connected = true;
                Ok(())
            }
            _ => Err(HdlError::NotConnectedInside {
                a: self.name.clone(),
                b: provider.name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(
        u: (PortRole, u32),
        p: (PortRole, u32),
    ) -> (Result<()>, (PortRole, u32), (PortRole, u32)) {
        let (mut ur, mut uo) = u;
        let (mut pr, mut po) = p;
        let r = choose_roles(&mut ur, &mut uo, &mut pr, &mut po);
        (r, (ur, uo), (pr, po))
    }

    use PortRole::{ActiveFlowControl, ActiveMessage, ActiveOnly, NoRole, Passive};

    #[test]
    fn unexpressed_preferences_scan_enum_order() {
        // user can message or stage, provider can flow-control or poll
        let (r, u, p) = roles(
            (NoRole, ActiveMessage.bit() | ActiveOnly.bit()),
            (NoRole, ActiveFlowControl.bit() | Passive.bit()),
        );
        r.expect("negotiation");
        assert_eq!(u.0, ActiveMessage);
        assert_eq!(p.0, ActiveFlowControl);
        assert_ne!(u.1 & MANDATED_ROLE, 0, "outcome must be frozen");
        assert_ne!(p.1 & MANDATED_ROLE, 0);
    }

    #[test]
    fn mandated_provider_forces_or_fails() {
        // Provider mandates ActiveMessage; user supports the complement.
        let (r, u, _p) = roles(
            (NoRole, ActiveFlowControl.bit() | Passive.bit()),
            (ActiveMessage, ActiveMessage.bit() | MANDATED_ROLE),
        );
        r.expect("negotiation");
        assert_eq!(u.0, ActiveFlowControl);

        // User cannot play the complement.
        let (r, _u, _p) = roles(
            (NoRole, Passive.bit()),
            (ActiveMessage, ActiveMessage.bit() | MANDATED_ROLE),
        );
        match r {
            Err(HdlError::Negotiation(msg)) => {
                assert_eq!(msg, "no compatible role available against mandated role");
            }
            other => panic!("expected negotiation failure, got {other:?}"),
        }

        // Two opposing mandates.
        let (r, _u, _p) = roles(
            (Passive, Passive.bit() | MANDATED_ROLE),
            (ActiveMessage, ActiveMessage.bit() | MANDATED_ROLE),
        );
        assert!(matches!(r, Err(HdlError::Negotiation("incompatible mandated transfer roles"))));
    }

    #[test]
    fn complementary_preferences_stand() {
        let (r, u, p) = roles(
            (ActiveMessage, ActiveMessage.bit()),
            (ActiveFlowControl, ActiveFlowControl.bit()),
        );
        r.expect("negotiation");
        assert_eq!((u.0, p.0), (ActiveMessage, ActiveFlowControl));
    }

    #[test]
    fn anti_push_preference_wins() {
        // User prefers AFC (pull); provider prefers AFC too but can do AM.
        let (r, u, p) = roles(
            (ActiveFlowControl, ActiveFlowControl.bit() | ActiveMessage.bit()),
            (ActiveFlowControl, ActiveFlowControl.bit() | ActiveMessage.bit()),
        );
        r.expect("negotiation");
        assert_eq!((u.0, p.0), (ActiveFlowControl, ActiveMessage));
    }

    #[test]
    fn negotiation_is_commutative_in_outcome() {
        let cases = [
            ((NoRole, ActiveMessage.bit() | ActiveOnly.bit()),
             (NoRole, ActiveFlowControl.bit() | Passive.bit())),
            ((ActiveMessage, ActiveMessage.bit() | Passive.bit()),
             (NoRole, ActiveFlowControl.bit() | ActiveOnly.bit())),
            ((ActiveOnly, ActiveOnly.bit() | ActiveMessage.bit()),
             (Passive, Passive.bit() | ActiveFlowControl.bit())),
            ((NoRole, Passive.bit() | ActiveFlowControl.bit()),
             (ActiveMessage, ActiveMessage.bit() | ActiveOnly.bit())),
        ];
        for (u, p) in cases {
            let (r1, u1, p1) = roles(u, p);
            let (r2, u2, p2) = roles(u, p);
            assert_eq!(r1.is_ok(), r2.is_ok());
            assert_eq!((u1, p1), (u2, p2), "same inputs must settle identically");
        }
    }

    #[test]
    fn no_overlap_fails_with_the_final_message() {
        let (r, _u, _p) = roles((NoRole, ActiveMessage.bit()), (NoRole, Passive.bit()));
        assert!(matches!(r, Err(HdlError::Negotiation("no compatible combination of roles exist"))));
    }

    fn full_descriptor() -> Descriptors {
        Descriptors {
            kind: DescKind::Producer,
            role: PortRole::ActiveMessage,
            options: ActiveMessage.bit() | MANDATED_ROLE,
            desc: Desc {
                n_buffers: 4,
                data_buffer_base: 0x10_0000,
                data_buffer_pitch: 4096,
                data_buffer_size: 4096,
                metadata_base: 0x13_ffc0,
                metadata_pitch: 16,
                full_flag_base: 0x2008,
                full_flag_size: 4,
                full_flag_pitch: 0,
                full_flag_value: 1,
                empty_flag_base: 0x2004,
                empty_flag_size: 4,
                empty_flag_pitch: 0,
                empty_flag_value: 1,
                oob: OutOfBand {
                    port_id: 7,
                    endpoint: "ocpi-dma-pio:0xf7800000.0x100000.0x800000".into(),
                    cookie: 0xfeed_beef_dead_f00d,
                    address: 0xf780_0000,
                },
            },
        }
    }

    #[test]
    fn descriptor_pack_unpack_is_bit_exact() {
        let d = full_descriptor();
        let packed = pack_descriptor(&d).expect("pack");
        let back = unpack_descriptor(&packed).expect("unpack");
        assert_eq!(back, d);
        let repacked = pack_descriptor(&back).expect("repack");
        assert_eq!(repacked, packed);
    }

    #[test]
    fn oversize_endpoint_is_rejected_not_truncated() {
        let mut d = full_descriptor();
        d.desc.oob.endpoint = "x".repeat(MAX_ENDPOINT - 1); // 127 chars + NUL = 128
        assert!(matches!(
            pack_descriptor(&d),
            Err(HdlError::EndpointTooLong { len: 128, max: 128 })
        ));
        d.desc.oob.endpoint = "x".repeat(MAX_ENDPOINT - 2);
        let packed = pack_descriptor(&d).expect("127 bytes with NUL fits");
        assert_eq!(unpack_descriptor(&packed).expect("unpack"), d);
    }

    #[test]
    fn truncated_descriptor_is_rejected() {
        let packed = pack_descriptor(&full_descriptor()).expect("pack");
        for cut in [0, 1, 8, packed.len() - 1] {
            assert!(matches!(
                unpack_descriptor(&packed[..cut]),
                Err(HdlError::DescriptorDecode)
            ));
        }
    }
}
