//! On-the-wire record layouts.
//!
//! Clients and the controller exchange fixed-size little-endian records over
//! named pipes; one record per write keeps the exchange atomic as long as a
//! record fits in the kernel pipe buffer. Vehicle workers speak a separate
//! newline-terminated text protocol, one pipe per vehicle.

use std::fmt;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::{Endianness, Readable, Writable};
use static_assertions::const_assert;

use crate::world::{ServiceId, VehicleId};

pub const CLIENT_NAME_LEN: usize = 50;
pub const REQUEST_DATA_LEN: usize = 256;
pub const REPLY_MESSAGE_LEN: usize = 256;

/// Serialized size of one [`Request`]: pid + name + kind + data.
pub const REQUEST_RECORD_SIZE: usize = 4 + CLIENT_NAME_LEN + 4 + REQUEST_DATA_LEN;
/// Serialized size of one [`Reply`]: success flag + message.
pub const REPLY_RECORD_SIZE: usize = 4 + REPLY_MESSAGE_LEN;

// A record must fit into the kernel pipe buffer in one piece, or concurrent
// writers could interleave.
const_assert!(REQUEST_RECORD_SIZE <= 4096);
const_assert!(REPLY_RECORD_SIZE <= 4096);

/// Reserved reply text: a client receiving it must exit immediately.
pub const SERVER_SHUTDOWN: &str = "SERVER_SHUTDOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  Login,
  Ride,
  Cancel,
  Consult,
  Terminate,
}

impl RequestKind {
  fn from_wire(raw: u32) -> Option<RequestKind> {
    match raw {
      0 => Some(RequestKind::Login),
      1 => Some(RequestKind::Ride),
      2 => Some(RequestKind::Cancel),
      3 => Some(RequestKind::Consult),
      4 => Some(RequestKind::Terminate),
      _ => None,
    }
  }

  fn to_wire(self) -> u32 {
    match self {
      RequestKind::Login => 0,
      RequestKind::Ride => 1,
      RequestKind::Cancel => 2,
      RequestKind::Consult => 3,
      RequestKind::Terminate => 4,
    }
  }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
  #[error("record serialization: {0}")]
  Codec(String),
  #[error("unknown request kind {0}")]
  UnknownKind(u32),
}

impl From<speedy::Error> for WireError {
  fn from(e: speedy::Error) -> WireError {
    WireError::Codec(e.to_string())
  }
}

// The raw structs mirror the record layout byte for byte; the public
// Request/Reply types carry the decoded strings.

#[derive(Debug, Readable, Writable)]
struct RequestRecord {
  client_pid: u32,
  client_name: [u8; CLIENT_NAME_LEN],
  kind: u32,
  data: [u8; REQUEST_DATA_LEN],
}

#[derive(Debug, Readable, Writable)]
struct ReplyRecord {
  success: u32,
  message: [u8; REPLY_MESSAGE_LEN],
}

/// One client request, as read from the shared inbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub client_pid: u32,
  pub client_name: String,
  pub kind: RequestKind,
  /// Free-form argument text; meaning depends on `kind`.
  pub data: String,
}

impl Request {
  pub fn new(client_pid: u32, client_name: &str, kind: RequestKind, data: &str) -> Request {
    Request {
      client_pid,
      client_name: client_name.to_string(),
      kind,
      data: data.to_string(),
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>, WireError> {
    let record = RequestRecord {
      client_pid: self.client_pid,
      client_name: to_fixed(&self.client_name),
      kind: self.kind.to_wire(),
      data: to_fixed(&self.data),
    };
    Ok(record.write_to_vec_with_ctx(Endianness::LittleEndian)?)
  }

  pub fn decode(buf: &[u8]) -> Result<Request, WireError> {
    let record = RequestRecord::read_from_buffer_with_ctx(Endianness::LittleEndian, buf)?;
    let kind = RequestKind::from_wire(record.kind).ok_or(WireError::UnknownKind(record.kind))?;
    Ok(Request {
      client_pid: record.client_pid,
      client_name: from_fixed(&record.client_name),
      kind,
      data: from_fixed(&record.data),
    })
  }
}

/// One controller (or worker) reply, written to a client's own channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
  pub success: bool,
  pub message: String,
}

impl Reply {
  pub fn ok(message: impl Into<String>) -> Reply {
    Reply {
      success: true,
      message: message.into(),
    }
  }

  pub fn fail(message: impl Into<String>) -> Reply {
    Reply {
      success: false,
      message: message.into(),
    }
  }

  pub fn is_shutdown(&self) -> bool {
    self.message == SERVER_SHUTDOWN
  }

  pub fn encode(&self) -> Result<Vec<u8>, WireError> {
    let record = ReplyRecord {
      success: u32::from(self.success),
      message: to_fixed(&self.message),
    };
    Ok(record.write_to_vec_with_ctx(Endianness::LittleEndian)?)
  }

  pub fn decode(buf: &[u8]) -> Result<Reply, WireError> {
    let record = ReplyRecord::read_from_buffer_with_ctx(Endianness::LittleEndian, buf)?;
    Ok(Reply {
      success: record.success != 0,
      message: from_fixed(&record.message),
    })
  }
}

// NUL-padded fixed field. Overlong input is truncated at a character
// boundary, always leaving room for the terminating NUL.
fn to_fixed<const N: usize>(s: &str) -> [u8; N] {
  let mut out = [0u8; N];
  let mut end = s.len().min(N - 1);
  while end > 0 && !s.is_char_boundary(end) {
    end -= 1;
  }
  out[..end].copy_from_slice(&s.as_bytes()[..end]);
  out
}

fn from_fixed(field: &[u8]) -> String {
  let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
  String::from_utf8_lossy(&field[..end]).into_owned()
}

// ------------------------------------------------------------------------
// ------------------------------------------------------------------------

/// One telemetry line from a vehicle worker:
/// `TYPE|vehicle_id|service_id[|payload]`.
///
/// A bare `CANCELLED` line (no ids) is also produced by workers that are
/// interrupted before the trip starts; the demux attributes it to the pipe
/// it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
  TripStarted {
    vehicle: VehicleId,
    service: ServiceId,
  },
  Progress {
    vehicle: VehicleId,
    service: ServiceId,
    percent: u8,
  },
  Distance {
    vehicle: VehicleId,
    service: ServiceId,
    km: f64,
  },
  Completed {
    vehicle: VehicleId,
    service: ServiceId,
    km: f64,
  },
  Cancelled {
    vehicle: Option<VehicleId>,
    service: Option<ServiceId>,
  },
}

impl TelemetryRecord {
  /// Parse one line. `None` means a malformed record, which the caller
  /// drops silently per the framing contract.
  pub fn parse(line: &str) -> Option<TelemetryRecord> {
    let line = line.trim_end();
    if line == "CANCELLED" {
      return Some(TelemetryRecord::Cancelled {
        vehicle: None,
        service: None,
      });
    }

    let mut fields = line.split('|');
    let kind = fields.next()?;
    let vehicle = VehicleId(fields.next()?.parse().ok()?);
    let service = ServiceId(fields.next()?.parse().ok()?);
    let payload = fields.next();

    match (kind, payload) {
      ("TRIP_STARTED", _) => Some(TelemetryRecord::TripStarted { vehicle, service }),
      ("PROGRESS", Some(p)) => Some(TelemetryRecord::Progress {
        vehicle,
        service,
        percent: p.parse().ok()?,
      }),
      ("DISTANCE", Some(p)) => Some(TelemetryRecord::Distance {
        vehicle,
        service,
        km: p.parse().ok()?,
      }),
      ("COMPLETED", Some(p)) => Some(TelemetryRecord::Completed {
        vehicle,
        service,
        km: p.parse().ok()?,
      }),
      ("CANCELLED", _) => Some(TelemetryRecord::Cancelled {
        vehicle: Some(vehicle),
        service: Some(service),
      }),
      _ => None,
    }
  }
}

impl fmt::Display for TelemetryRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TelemetryRecord::TripStarted { vehicle, service } => {
        write!(f, "TRIP_STARTED|{vehicle}|{service}")
      }
      TelemetryRecord::Progress {
        vehicle,
        service,
        percent,
      } => write!(f, "PROGRESS|{vehicle}|{service}|{percent}"),
      TelemetryRecord::Distance {
        vehicle,
        service,
        km,
      } => write!(f, "DISTANCE|{vehicle}|{service}|{km:.2}"),
      TelemetryRecord::Completed {
        vehicle,
        service,
        km,
      } => write!(f, "COMPLETED|{vehicle}|{service}|{km:.1}"),
      TelemetryRecord::Cancelled {
        vehicle: Some(v),
        service: Some(s),
      } => write!(f, "CANCELLED|{v}|{s}"),
      TelemetryRecord::Cancelled { .. } => write!(f, "CANCELLED"),
    }
  }
}

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use super::*;

  #[test]
  fn request_record_has_pinned_size() {
    let request = Request::new(1234, "ana", RequestKind::Ride, "2 casa 5.0");
    let bytes = request.encode().unwrap();
    assert_eq!(bytes.len(), REQUEST_RECORD_SIZE);
    assert_eq!(Request::decode(&bytes).unwrap(), request);
  }

  #[test]
  fn reply_record_has_pinned_size() {
    let reply = Reply::ok("Bem-vindo!");
    let bytes = reply.encode().unwrap();
    assert_eq!(bytes.len(), REPLY_RECORD_SIZE);
    assert_eq!(Reply::decode(&bytes).unwrap(), reply);
  }

  #[test]
  fn request_layout_is_little_endian_with_nul_padding() {
    let bytes = Request::new(0x0102_0304, "ab", RequestKind::Cancel, "7")
      .encode()
      .unwrap();
    assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
    assert_eq!(&bytes[4..8], b"ab\0\0");
    assert_eq!(&bytes[54..58], &[2, 0, 0, 0]);
    assert_eq!(&bytes[58..60], b"7\0");
  }

  #[test]
  fn unknown_kind_is_rejected() {
    let mut bytes = Request::new(1, "x", RequestKind::Login, "")
      .encode()
      .unwrap();
    bytes[54] = 9;
    assert_eq!(Request::decode(&bytes), Err(WireError::UnknownKind(9)));
  }

  #[test]
  fn overlong_fields_are_truncated_not_rejected() {
    let long = "x".repeat(300);
    let request = Request::new(1, &long, RequestKind::Login, &long);
    let decoded = Request::decode(&request.encode().unwrap()).unwrap();
    assert_eq!(decoded.client_name.len(), CLIENT_NAME_LEN - 1);
    assert_eq!(decoded.data.len(), REQUEST_DATA_LEN - 1);
  }

  #[test]
  fn truncation_respects_utf8_boundaries() {
    // 'ã' is two bytes; place it so the naive cut would split it.
    let name = format!("{}ã", "x".repeat(CLIENT_NAME_LEN - 2));
    let decoded = Request::decode(
      &Request::new(1, &name, RequestKind::Login, "").encode().unwrap(),
    )
    .unwrap();
    assert_eq!(decoded.client_name, "x".repeat(CLIENT_NAME_LEN - 2));
  }

  #[test_case("TRIP_STARTED|3|7" => Some(TelemetryRecord::TripStarted { vehicle: VehicleId(3), service: ServiceId(7) }); "trip started")]
  #[test_case("PROGRESS|3|7|40" => Some(TelemetryRecord::Progress { vehicle: VehicleId(3), service: ServiceId(7), percent: 40 }); "progress")]
  #[test_case("DISTANCE|3|7|2.50" => Some(TelemetryRecord::Distance { vehicle: VehicleId(3), service: ServiceId(7), km: 2.5 }); "distance")]
  #[test_case("COMPLETED|3|7|5.0" => Some(TelemetryRecord::Completed { vehicle: VehicleId(3), service: ServiceId(7), km: 5.0 }); "completed")]
  #[test_case("CANCELLED|3|7" => Some(TelemetryRecord::Cancelled { vehicle: Some(VehicleId(3)), service: Some(ServiceId(7)) }); "cancelled with ids")]
  #[test_case("CANCELLED" => Some(TelemetryRecord::Cancelled { vehicle: None, service: None }); "bare cancelled")]
  #[test_case("PROGRESS|3|7" => None; "progress without payload")]
  #[test_case("PROGRESS|x|7|40" => None; "non-numeric vehicle")]
  #[test_case("NONSENSE|3|7" => None; "unknown type")]
  #[test_case("" => None; "empty line")]
  fn telemetry_parse(line: &str) -> Option<TelemetryRecord> {
    TelemetryRecord::parse(line)
  }

  #[test]
  fn telemetry_lines_round_trip() {
    for record in [
      TelemetryRecord::TripStarted {
        vehicle: VehicleId(1),
        service: ServiceId(2),
      },
      TelemetryRecord::Progress {
        vehicle: VehicleId(1),
        service: ServiceId(2),
        percent: 90,
      },
      TelemetryRecord::Completed {
        vehicle: VehicleId(1),
        service: ServiceId(2),
        km: 7.5,
      },
    ] {
      assert_eq!(TelemetryRecord::parse(&record.to_string()), Some(record));
    }
  }
}
