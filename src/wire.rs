//! Binary framing for the target -> executor event stream (spec §4.1).
//!
//! Every message starts with a fixed-size [`Header`]. `cond` and `gep`
//! headers are immediately followed by a second, type-specific record
//! ([`CondTrailer`], [`GepTrailer`]); `memcmp` is followed by a
//! variable-length byte blob whose length is carried in `Header::result`.
//!
//! Records are tightly packed C layouts on the target side; we decode them
//! field-by-field from a byte slice rather than transmuting, so endianness
//! and padding are explicit and host-independent.

use crate::error::MazerunnerError;

pub const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 4 + 4 + 4 + 8;
pub const COND_TRAILER_SIZE: usize = 8 + 4 + 4 + 8 + 8 + 4;
pub const GEP_TRAILER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Cond,
    Gep,
    Memcmp,
    Fsize,
    Loop,
    Fini,
}

impl MsgType {
    pub fn from_u32(v: u32) -> Option<MsgType> {
        match v {
            0 => Some(MsgType::Cond),
            1 => Some(MsgType::Gep),
            2 => Some(MsgType::Memcmp),
            3 => Some(MsgType::Fsize),
            4 => Some(MsgType::Loop),
            5 => Some(MsgType::Fini),
            _ => None,
        }
    }

    /// Whether a message of this type is followed by a fixed-size trailer
    /// record (as opposed to no trailer, or a variable-length one).
    pub fn has_fixed_trailer(self) -> bool {
        matches!(self, MsgType::Cond | MsgType::Gep)
    }
}

pub mod flags {
    pub const HAS_DISTANCE: u32 = 1 << 0;
    pub const LOOP_EXIT: u32 = 1 << 1;
    pub const LOOP_LATCH: u32 = 1 << 2;
}

/// The fixed-size header every message begins with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u32,
    pub flags: u32,
    pub instance_id: u32,
    pub addr: u64,
    pub context: u32,
    pub id: u32,
    pub label: u32,
    pub result: u64,
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Header, MazerunnerError> {
        if buf.len() < HEADER_SIZE {
            return Err(MazerunnerError::TruncatedMessage {
                expected: HEADER_SIZE,
                got: buf.len(),
            });
        }
        let mut off = 0;
        let msg_type = read_u32(buf, &mut off);
        let flags = read_u32(buf, &mut off);
        let instance_id = read_u32(buf, &mut off);
        let addr = read_u64(buf, &mut off);
        let context = read_u32(buf, &mut off);
        let id = read_u32(buf, &mut off);
        let label = read_u32(buf, &mut off);
        let result = read_u64(buf, &mut off);
        Ok(Header {
            msg_type,
            flags,
            instance_id,
            addr,
            context,
            id,
            label,
            result,
        })
    }

    pub fn has_distance(&self) -> bool {
        self.flags & flags::HAS_DISTANCE != 0
    }

    pub fn is_loop_exit_latch(&self) -> bool {
        self.flags & flags::LOOP_EXIT != 0 && self.flags & flags::LOOP_LATCH != 0
    }

    /// The `cond` action: 0 = branch not taken, 1 = taken.
    pub fn taken(&self) -> u8 {
        (self.result != 0) as u8
    }
}

/// The second record following a `cond` header (referred to in the spec as
/// the `mazerunner_msg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondTrailer {
    pub addr: u64,
    pub context: u32,
    pub id: u32,
    pub local_min_dist: u64,
    pub global_min_dist: u64,
    pub flags: u32,
}

impl CondTrailer {
    pub fn decode(buf: &[u8]) -> Result<CondTrailer, MazerunnerError> {
        if buf.len() < COND_TRAILER_SIZE {
            return Err(MazerunnerError::StateCorruption(format!(
                "mazerunner_msg too small: {}",
                buf.len()
            )));
        }
        let mut off = 0;
        Ok(CondTrailer {
            addr: read_u64(buf, &mut off),
            context: read_u32(buf, &mut off),
            id: read_u32(buf, &mut off),
            local_min_dist: read_u64(buf, &mut off),
            global_min_dist: read_u64(buf, &mut off),
            flags: read_u32(buf, &mut off),
        })
    }

    pub fn distance(&self) -> Option<u64> {
        if self.flags & flags::HAS_DISTANCE != 0 {
            Some(self.global_min_dist)
        } else {
            None
        }
    }
}

/// The second record following a `gep` header, echoing `index_label`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GepTrailer {
    pub index_label: u32,
}

impl GepTrailer {
    pub fn decode(buf: &[u8]) -> Result<GepTrailer, MazerunnerError> {
        if buf.len() < GEP_TRAILER_SIZE {
            return Err(MazerunnerError::StateCorruption(format!(
                "GEP message too small: {}",
                buf.len()
            )));
        }
        let mut off = 0;
        Ok(GepTrailer {
            index_label: read_u32(buf, &mut off),
        })
    }
}

fn read_u32(buf: &[u8], off: &mut usize) -> u32 {
    let v = u32::from_le_bytes(buf[*off..*off + 4].try_into().unwrap());
    *off += 4;
    v
}

fn read_u64(buf: &[u8], off: &mut usize) -> u64 {
    let v = u64::from_le_bytes(buf[*off..*off + 8].try_into().unwrap());
    *off += 8;
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_header(h: &Header) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&h.msg_type.to_le_bytes());
        buf.extend_from_slice(&h.flags.to_le_bytes());
        buf.extend_from_slice(&h.instance_id.to_le_bytes());
        buf.extend_from_slice(&h.addr.to_le_bytes());
        buf.extend_from_slice(&h.context.to_le_bytes());
        buf.extend_from_slice(&h.id.to_le_bytes());
        buf.extend_from_slice(&h.label.to_le_bytes());
        buf.extend_from_slice(&h.result.to_le_bytes());
        buf
    }

    #[test]
    fn header_round_trips() {
        let h = Header {
            msg_type: 0,
            flags: flags::HAS_DISTANCE,
            instance_id: 7,
            addr: 0xdead_beef,
            context: 42,
            id: 1,
            label: 9,
            result: 1,
        };
        let buf = encode_header(&h);
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded, h);
        assert!(decoded.has_distance());
        assert_eq!(decoded.taken(), 1);
    }

    #[test]
    fn header_rejects_short_buffer() {
        let err = Header::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, MazerunnerError::TruncatedMessage { .. }));
    }

    #[test]
    fn msg_type_trailer_classification() {
        assert!(MsgType::Cond.has_fixed_trailer());
        assert!(MsgType::Gep.has_fixed_trailer());
        assert!(!MsgType::Memcmp.has_fixed_trailer());
        assert!(!MsgType::Fini.has_fixed_trailer());
    }
}
