//! Named-channel endpoints.
//!
//! Three endpoint families, all FIFOs in `Config::channel_dir`:
//!
//! * the shared inbound request channel (many client writers, one reader),
//! * one reply channel per client pid (created by the client, opened here
//!   write-only per reply),
//! * one telemetry channel per vehicle (created here, written by the worker).
//!
//! Readers open their end read-write and non-blocking: holding a write end of
//! our own means a moment with zero external writers does not read as
//! end-of-stream, which is what lets the inbound channel survive client
//! churn. Both reader types plug into a mio `Poll` as event sources.

use mio::event::Source;
use std::{
  fs::{File, OpenOptions},
  io::{self, Read, Write},
  os::fd::AsRawFd,
  os::unix::fs::OpenOptionsExt,
  path::{Path, PathBuf},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{event, unix::SourceFd, Interest, Registry, Token};
use nix::{errno::Errno, sys::stat::Mode, unistd};

use crate::{
  error::{TransportError, TransportResult},
  wire::{Reply, Request, TelemetryRecord, REQUEST_RECORD_SIZE},
};

/// Create a FIFO at `path`. An endpoint that already exists is fine; the
/// record framing does not care who created it.
pub fn create_endpoint(path: &Path) -> TransportResult<()> {
  match unistd::mkfifo(path, Mode::from_bits_truncate(0o666)) {
    Ok(()) | Err(Errno::EEXIST) => Ok(()),
    Err(errno) => Err(TransportError::Create {
      path: path.to_path_buf(),
      source: io::Error::from(errno),
    }),
  }
}

/// Best-effort unlink; absence is not worth reporting.
pub fn remove_endpoint(path: &Path) {
  if let Err(e) = std::fs::remove_file(path) {
    if e.kind() != io::ErrorKind::NotFound {
      debug!("unlink {}: {e}", path.display());
    }
  }
}

// Read side of a FIFO, opened read-write + non-blocking.
struct FifoReader {
  file: File,
  path: PathBuf,
}

impl FifoReader {
  fn open(path: &Path) -> TransportResult<FifoReader> {
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .custom_flags(nix::libc::O_NONBLOCK)
      .open(path)
      .map_err(|source| TransportError::Open {
        path: path.to_path_buf(),
        source,
      })?;
    Ok(FifoReader {
      file,
      path: path.to_path_buf(),
    })
  }

  // Drain whatever is buffered in the pipe right now into `out`.
  fn read_available(&mut self, out: &mut Vec<u8>) {
    let mut buf = [0u8; 4096];
    loop {
      match self.file.read(&mut buf) {
        Ok(0) => break,
        Ok(n) => out.extend_from_slice(&buf[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => {
          warn!("read {}: {e}", self.path.display());
          break;
        }
      }
    }
  }

  // mio event::Source plumbing, delegated to the raw fd like any
  // foreign-fd source.
  fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
    SourceFd(&self.file.as_raw_fd()).register(registry, token, interests)
  }

  fn reregister(
    &mut self,
    registry: &Registry,
    token: Token,
    interests: Interest,
  ) -> io::Result<()> {
    SourceFd(&self.file.as_raw_fd()).reregister(registry, token, interests)
  }

  fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
    SourceFd(&self.file.as_raw_fd()).deregister(registry)
  }
}

/// The shared inbound request channel.
///
/// One client write is one record, so records never interleave; one read may
/// still span several records plus a partial tail, which stays buffered here
/// until the rest of it arrives.
pub struct InboundReader {
  fifo: FifoReader,
  carry: Vec<u8>,
}

impl InboundReader {
  pub fn open(path: &Path) -> TransportResult<InboundReader> {
    Ok(InboundReader {
      fifo: FifoReader::open(path)?,
      carry: Vec::new(),
    })
  }

  /// All complete, well-formed requests available right now. Records that do
  /// not decode are dropped with a log line.
  pub fn drain(&mut self) -> Vec<Request> {
    self.fifo.read_available(&mut self.carry);

    let mut requests = Vec::new();
    let mut consumed = 0;
    while self.carry.len() - consumed >= REQUEST_RECORD_SIZE {
      let record = &self.carry[consumed..consumed + REQUEST_RECORD_SIZE];
      match Request::decode(record) {
        Ok(request) => requests.push(request),
        Err(e) => warn!("dropping inbound record: {e}"),
      }
      consumed += REQUEST_RECORD_SIZE;
    }
    self.carry.drain(..consumed);
    requests
  }
}

impl event::Source for InboundReader {
  fn register(&mut self, registry: &Registry, token: Token, i: Interest) -> io::Result<()> {
    self.fifo.register(registry, token, i)
  }

  fn reregister(&mut self, registry: &Registry, token: Token, i: Interest) -> io::Result<()> {
    self.fifo.reregister(registry, token, i)
  }

  fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
    self.fifo.deregister(registry)
  }
}

/// Read side of one vehicle's telemetry channel. Line-framed; a line cut in
/// half by the pipe buffer stays here until its newline arrives.
pub struct TelemetryReader {
  fifo: FifoReader,
  partial: String,
  raw: Vec<u8>,
}

impl TelemetryReader {
  pub fn open(path: &Path) -> TransportResult<TelemetryReader> {
    Ok(TelemetryReader {
      fifo: FifoReader::open(path)?,
      partial: String::new(),
      raw: Vec::new(),
    })
  }

  /// All complete records available right now; malformed lines are dropped
  /// silently (framing contract), with a debug trace only.
  pub fn drain(&mut self) -> Vec<TelemetryRecord> {
    self.raw.clear();
    self.fifo.read_available(&mut self.raw);
    if self.raw.is_empty() {
      return Vec::new();
    }
    self.partial.push_str(&String::from_utf8_lossy(&self.raw));

    let mut records = Vec::new();
    while let Some(nl) = self.partial.find('\n') {
      let line: String = self.partial.drain(..=nl).collect();
      let line = line.trim_end();
      if line.is_empty() {
        continue;
      }
      match TelemetryRecord::parse(line) {
        Some(record) => records.push(record),
        None => debug!("dropping telemetry line {line:?}"),
      }
    }
    records
  }
}

impl event::Source for TelemetryReader {
  fn register(&mut self, registry: &Registry, token: Token, i: Interest) -> io::Result<()> {
    self.fifo.register(registry, token, i)
  }

  fn reregister(&mut self, registry: &Registry, token: Token, i: Interest) -> io::Result<()> {
    self.fifo.reregister(registry, token, i)
  }

  fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
    self.fifo.deregister(registry)
  }
}

/// Best-effort writer of [`Reply`] records to per-client channels.
///
/// Delivery is sacrificed before consistency: a client that disappeared, or
/// one that stopped reading, costs a log line and nothing else. The open is
/// non-blocking so a reader-less channel fails fast instead of wedging the
/// calling thread.
#[derive(Clone)]
pub struct ReplySender {
  channel_dir: PathBuf,
}

impl ReplySender {
  pub fn new(channel_dir: impl AsRef<Path>) -> ReplySender {
    ReplySender {
      channel_dir: channel_dir.as_ref().to_path_buf(),
    }
  }

  pub fn send(&self, client_pid: u32, reply: &Reply) {
    let path = self.channel_dir.join(format!("cli_{client_pid}"));
    let bytes = match reply.encode() {
      Ok(bytes) => bytes,
      Err(e) => {
        error!("encoding reply for {client_pid}: {e}");
        return;
      }
    };
    let result = OpenOptions::new()
      .write(true)
      .custom_flags(nix::libc::O_NONBLOCK)
      .open(&path)
      .and_then(|mut file| file.write_all(&bytes));
    if let Err(e) = result {
      warn!("Não consegui responder ao cliente {client_pid}: {e}");
    }
  }
}

/// Worker-side writer of telemetry lines.
///
/// The blocking open waits for the controller's demux to pick up the read
/// end; if that fails, a non-blocking attempt is made and, failing that too,
/// the worker keeps simulating with its telemetry discarded.
pub struct TelemetryWriter {
  file: Option<File>,
}

impl TelemetryWriter {
  pub fn open(path: &Path) -> TelemetryWriter {
    let file = OpenOptions::new().write(true).open(path).or_else(|_| {
      OpenOptions::new()
        .write(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path)
    });
    match file {
      Ok(file) => TelemetryWriter { file: Some(file) },
      Err(e) => {
        warn!("opening telemetry channel {}: {e}", path.display());
        TelemetryWriter { file: None }
      }
    }
  }

  pub fn send(&mut self, record: &TelemetryRecord) {
    if let Some(file) = self.file.as_mut() {
      if let Err(e) = writeln!(file, "{record}") {
        warn!("writing telemetry: {e}");
      }
    }
  }
}
