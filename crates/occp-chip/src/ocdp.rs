//! OCDP data-plane property block.
//!
//! One OCDP block per connected data port. Software programs local buffer
//! geometry and, depending on the negotiated transfer role, the peer's
//! remote buffer or flag addresses. The `FOOD_FACE` register is a
//! presence check: a bitstream whose OCDP is absent or miswired will not
//! read back the magic, and programming must not proceed.

/// Number of local buffers.
pub const N_LOCAL_BUFFERS: u64 = 0x00;
/// Count of buffers ready for the peer (read in passive mode).
pub const N_READY: u64 = 0x04;
/// Peer hits this to report remote buffer movement.
pub const N_REMOTE_DONE: u64 = 0x08;
/// Local buffer pitch in bytes.
pub const LOCAL_BUFFER_SIZE: u64 = 0x0C;
/// Local buffer base within the OCDP memory.
pub const LOCAL_BUFFER_BASE: u64 = 0x10;
/// Local metadata base within the OCDP memory.
pub const LOCAL_METADATA_BASE: u64 = 0x14;
/// Number of remote buffers (ActiveMessage).
pub const N_REMOTE_BUFFERS: u64 = 0x18;
/// Remote buffer base, low 32 bits (ActiveMessage).
pub const REMOTE_BUFFER_BASE: u64 = 0x1C;
/// Remote buffer base, high 32 bits.
pub const REMOTE_BUFFER_HI: u64 = 0x20;
/// Remote metadata base, low 32 bits (ActiveMessage).
pub const REMOTE_METADATA_BASE: u64 = 0x24;
/// Remote metadata base, high 32 bits.
pub const REMOTE_METADATA_HI: u64 = 0x28;
/// Remote buffer pitch (ActiveMessage).
pub const REMOTE_BUFFER_SIZE: u64 = 0x2C;
/// Remote metadata pitch (ActiveMessage).
pub const REMOTE_METADATA_SIZE: u64 = 0x30;
/// Remote flag base, low 32 bits (ActiveFlowControl / ActiveMessage).
pub const REMOTE_FLAG_BASE: u64 = 0x34;
/// Remote flag base, high 32 bits.
pub const REMOTE_FLAG_HI: u64 = 0x38;
/// Remote flag pitch.
pub const REMOTE_FLAG_PITCH: u64 = 0x3C;
/// Direction × role control word, see [`control_word`].
pub const CONTROL: u64 = 0x40;
/// Size of this port's OCDP buffer memory in bytes.
pub const MEMORY_BYTES: u64 = 0x44;
/// Presence magic register; reads [`FOOD_FACE`] on a live OCDP.
pub const FOOD_FACE_REG: u64 = 0x48;

/// Value `FOOD_FACE_REG` must read back.
pub const FOOD_FACE: u32 = 0xf00d_face;

/// Metadata record accompanying each buffer: length, opcode, tag, and a
/// reserved word. 16 bytes, ABI-fixed.
pub const METADATA_SIZE: u32 = 16;

/// Alignment of local buffers within OCDP memory.
pub const LOCAL_BUFFER_ALIGN: u32 = 16;

/// Hardware role encodings for the `CONTROL` register low bits.
pub mod role {
    /// Both sides poll; no pushing.
    pub const PASSIVE: u32 = 0;
    /// This side pushes flow-control flags only.
    pub const ACTIVE_FLOWCONTROL: u32 = 1;
    /// This side pushes data into remote buffers.
    pub const ACTIVE_MESSAGE: u32 = 2;
}

/// Direction encodings for the `CONTROL` register.
pub mod direction {
    /// Port consumes data.
    pub const CONSUMER: u32 = 0;
    /// Port produces data.
    pub const PRODUCER: u32 = 1;
}

/// Compose the OCDP control word from a direction and a hardware role.
pub const fn control_word(dir: u32, role: u32) -> u32 {
    (dir << 2) | (role & 0x3)
}

/// Round `n` up to the OCDP local buffer alignment.
pub const fn round_up(n: u32) -> u32 {
    (n + LOCAL_BUFFER_ALIGN - 1) & !(LOCAL_BUFFER_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_word_packs_direction_and_role() {
        assert_eq!(control_word(direction::CONSUMER, role::PASSIVE), 0);
        assert_eq!(control_word(direction::PRODUCER, role::ACTIVE_MESSAGE), 0b110);
        assert_eq!(control_word(direction::CONSUMER, role::ACTIVE_FLOWCONTROL), 0b001);
    }

    #[test]
    fn round_up_respects_alignment() {
        assert_eq!(round_up(1), 16);
        assert_eq!(round_up(16), 16);
        assert_eq!(round_up(4096), 4096);
        assert_eq!(round_up(4097), 4112);
    }

    #[test]
    fn registers_do_not_overlap() {
        assert_ne!(N_READY, N_REMOTE_DONE);
        assert_eq!(FOOD_FACE_REG, 0x48);
    }
}
