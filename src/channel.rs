//! The target -> executor event stream: decoding loop plus the OS-level
//! pipe/shared-memory plumbing used to carry it (spec §4.1).
//!
//! The decoding half ([`read_event`]) is pure and operates over anything
//! `Read`, so it can be exercised against a synthetic in-memory stream in
//! tests without a real child process. The OS half ([`EventPipe`]) wraps
//! the actual pipe fds, bounded-wait semantics, and pipe-capacity tuning,
//! modeled on `executor/forkserver.rs`'s use of `nix` for process I/O.

use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::unistd;

use crate::error::MazerunnerError;
use crate::wire::{CondTrailer, GepTrailer, Header, MsgType, COND_TRAILER_SIZE, GEP_TRAILER_SIZE, HEADER_SIZE};

/// Target OS pipe capacity, raised on a best-effort basis (spec glossary:
/// `PIPE_CAPACITY`).
pub const PIPE_CAPACITY: i32 = 4 * 1024 * 1024;

/// Bound on how long the executor waits for the pipe to become readable
/// before concluding the target has gone silent.
pub const READ_READY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub enum Event {
    Cond { header: Header, trailer: CondTrailer },
    Gep { header: Header, trailer: GepTrailer },
    Memcmp { header: Header, payload: Vec<u8> },
    Fsize { header: Header },
    Loop { header: Header },
    Fini { header: Header },
    /// An unrecognized `msg_type`. Treated, per spec, as carrying no
    /// trailer: the caller may log and continue rather than desyncing.
    Unknown { msg_type: u32 },
}

/// Decodes exactly one event from `r`.
///
/// Returns `Ok(None)` on a clean end of stream: either zero bytes available
/// (target closed its end) or a short read strictly smaller than the header
/// (per spec: "short reads < sizeof(header) terminate the loop cleanly").
/// A short read *after* a valid header (i.e. a truncated trailer) is a hard
/// error, since the remaining bytes can no longer be framed correctly.
pub fn read_event<R: Read>(r: &mut R) -> Result<Option<Event>, MazerunnerError> {
    let mut hbuf = [0u8; HEADER_SIZE];
    let n = read_partial(r, &mut hbuf)?;
    if n < HEADER_SIZE {
        return Ok(None);
    }
    let header = Header::decode(&hbuf)?;
    match MsgType::from_u32(header.msg_type) {
        Some(MsgType::Cond) => {
            let mut tbuf = [0u8; COND_TRAILER_SIZE];
            read_exact_or_truncated(r, &mut tbuf, COND_TRAILER_SIZE)?;
            let trailer = CondTrailer::decode(&tbuf)?;
            Ok(Some(Event::Cond { header, trailer }))
        }
        Some(MsgType::Gep) => {
            let mut tbuf = [0u8; GEP_TRAILER_SIZE];
            read_exact_or_truncated(r, &mut tbuf, GEP_TRAILER_SIZE)?;
            let trailer = GepTrailer::decode(&tbuf)?;
            Ok(Some(Event::Gep { header, trailer }))
        }
        Some(MsgType::Memcmp) => {
            let len = header.result as usize;
            let mut payload = vec![0u8; len];
            read_exact_or_truncated(r, &mut payload, len)?;
            Ok(Some(Event::Memcmp { header, payload }))
        }
        Some(MsgType::Fsize) => Ok(Some(Event::Fsize { header })),
        Some(MsgType::Loop) => Ok(Some(Event::Loop { header })),
        Some(MsgType::Fini) => Ok(Some(Event::Fini { header })),
        None => Ok(Some(Event::Unknown {
            msg_type: header.msg_type,
        })),
    }
}

/// A single `read(2)`-equivalent call: may return fewer bytes than
/// requested without that being an error (e.g. a pipe with less data
/// currently buffered).
fn read_partial<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn read_exact_or_truncated<R: Read>(
    r: &mut R,
    buf: &mut [u8],
    expected: usize,
) -> Result<(), MazerunnerError> {
    let n = read_partial(r, buf)?;
    if n < expected {
        return Err(MazerunnerError::TruncatedMessage { expected, got: n });
    }
    Ok(())
}

/// Owns the read end of the target's event pipe and exposes the
/// bounded-wait semantics the executor's loop relies on.
pub struct EventPipe {
    read_fd: OwnedFd,
}

impl EventPipe {
    pub fn from_fd(read_fd: OwnedFd) -> Self {
        EventPipe { read_fd }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Waits up to `timeout` for data to be available. Returns `false` if
    /// the timeout elapsed with nothing readable, meaning the target has
    /// gone silent and the executor should stop reading.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool, MazerunnerError> {
        let mut read_fds = FdSet::new();
        read_fds.insert(self.read_fd.as_fd());
        let mut tv = TimeVal::milliseconds(timeout.as_millis() as i64);
        let n = select(None, &mut read_fds, None, None, &mut tv)
            .map_err(|e| MazerunnerError::ChannelBroken(e.to_string()))?;
        Ok(n > 0)
    }
}

impl Read for EventPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        unistd::read(self.read_fd.as_raw_fd(), buf).map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

/// Raises the OS pipe capacity for `fd` to [`PIPE_CAPACITY`], on a
/// best-effort basis. Permission failures are logged and otherwise ignored,
/// per spec ("if denied, proceed with a logged warning").
pub fn raise_pipe_capacity(fd: RawFd) {
    // SAFETY: F_SETPIPE_SZ takes the requested capacity as an integer arg
    // and returns the new capacity or -1 on error; no pointers involved.
    let rc = unsafe { nix::libc::fcntl(fd, nix::libc::F_SETPIPE_SZ, PIPE_CAPACITY) };
    if rc < 0 {
        log::warn!(
            "failed to raise pipe capacity to {PIPE_CAPACITY} bytes; \
             continuing with the default. Try: echo {PIPE_CAPACITY} | sudo tee /proc/sys/fs/pipe-max-size"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_header(msg_type: u32, result: u64, label: u32, flags: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&msg_type.to_le_bytes());
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // instance_id
        buf.extend_from_slice(&0u64.to_le_bytes()); // addr
        buf.extend_from_slice(&0u32.to_le_bytes()); // context
        buf.extend_from_slice(&0u32.to_le_bytes()); // id
        buf.extend_from_slice(&label.to_le_bytes());
        buf.extend_from_slice(&result.to_le_bytes());
        buf
    }

    fn encode_cond_trailer() -> Vec<u8> {
        let mut buf = Vec::with_capacity(COND_TRAILER_SIZE);
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&5u64.to_le_bytes());
        buf.extend_from_slice(&5u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    #[test]
    fn decodes_n_well_formed_events_with_expected_dispatch_counts() {
        let mut stream = Vec::new();
        // one cond, one fsize, one loop, one fini
        stream.extend(encode_header(0, 1, 7, 0));
        stream.extend(encode_cond_trailer());
        stream.extend(encode_header(3, 0, 0, 0)); // fsize
        stream.extend(encode_header(4, 0, 0, 0)); // loop
        stream.extend(encode_header(5, 3, 0, 0)); // fini, result=distance

        let mut cursor = Cursor::new(stream);
        let mut counts = [0usize; 6];
        let mut decoded = 0;
        while let Some(ev) = read_event(&mut cursor).unwrap() {
            decoded += 1;
            match ev {
                Event::Cond { .. } => counts[0] += 1,
                Event::Gep { .. } => counts[1] += 1,
                Event::Memcmp { .. } => counts[2] += 1,
                Event::Fsize { .. } => counts[3] += 1,
                Event::Loop { .. } => counts[4] += 1,
                Event::Fini { .. } => counts[5] += 1,
                Event::Unknown { .. } => panic!("unexpected unknown event"),
            }
        }
        assert_eq!(decoded, 4);
        assert_eq!(counts, [1, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn truncated_trailer_aborts_without_consuming_later_bytes() {
        let mut stream = Vec::new();
        stream.extend(encode_header(0, 1, 7, 0));
        stream.extend(&encode_cond_trailer()[..4]); // short trailer
        stream.extend(encode_header(3, 0, 0, 0)); // would-be next event

        let mut cursor = Cursor::new(stream);
        let err = read_event(&mut cursor).unwrap_err();
        assert!(matches!(err, MazerunnerError::TruncatedMessage { .. }));
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_event(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn memcmp_payload_uses_header_result_as_length() {
        let mut stream = Vec::new();
        stream.extend(encode_header(2, 3, 0, 0));
        stream.extend([1u8, 2, 3]);
        let mut cursor = Cursor::new(stream);
        match read_event(&mut cursor).unwrap().unwrap() {
            Event::Memcmp { payload, .. } => assert_eq!(payload, vec![1, 2, 3]),
            _ => panic!("expected memcmp"),
        }
    }
}
