use std::{
  env,
  path::{Path, PathBuf},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::world::VehicleId;

/// Environment variable selecting the fleet size.
pub const FLEET_SIZE_ENV: &str = "NVEICULOS";

pub const DEFAULT_FLEET_SIZE: usize = 10;
pub const MAX_CLIENTS: usize = 10;
/// Lifetime cap on services. Terminal services keep their slot, so this
/// bounds the total number of rides ever requested, like the original table.
pub const MAX_SERVICES: usize = 50;

/// Runtime configuration of the controller and of the worker processes.
///
/// The defaults reproduce the published channel paths under `/tmp`; tests
/// point `channel_dir` at a private directory instead.
#[derive(Debug, Clone)]
pub struct Config {
  /// Number of vehicles in the pool, ids `1..=fleet_size`.
  pub fleet_size: usize,
  /// Directory holding every named channel endpoint.
  pub channel_dir: PathBuf,
  /// Executable spawned for each active ride.
  pub worker_exe: PathBuf,
  pub max_clients: usize,
  pub max_services: usize,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      fleet_size: DEFAULT_FLEET_SIZE,
      channel_dir: PathBuf::from("/tmp"),
      worker_exe: default_worker_exe(),
      max_clients: MAX_CLIENTS,
      max_services: MAX_SERVICES,
    }
  }
}

impl Config {
  /// Configuration from the environment. An unset `NVEICULOS` gets the
  /// default with a warning, like the original controller; an unparsable or
  /// zero value is also a warning, not an error.
  pub fn from_env() -> Self {
    let fleet_size = match env::var(FLEET_SIZE_ENV) {
      Err(_) => {
        warn!("{FLEET_SIZE_ENV} não definido. A usar padrão ({DEFAULT_FLEET_SIZE}).");
        DEFAULT_FLEET_SIZE
      }
      Ok(s) => match s.trim().parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
          warn!("{FLEET_SIZE_ENV}={s:?} inválido. A usar padrão ({DEFAULT_FLEET_SIZE}).");
          DEFAULT_FLEET_SIZE
        }
      },
    };
    Config {
      fleet_size,
      ..Config::default()
    }
  }

  /// The shared inbound request channel.
  pub fn inbound_path(&self) -> PathBuf {
    self.channel_dir.join("server_pipe")
  }

  /// The reply channel a client created for itself before logging in.
  pub fn reply_path(&self, client_pid: u32) -> PathBuf {
    self.channel_dir.join(format!("cli_{client_pid}"))
  }

  /// The telemetry channel of one vehicle.
  pub fn telemetry_path(&self, vehicle: VehicleId) -> PathBuf {
    self.channel_dir.join(format!("veic_{vehicle}"))
  }

  pub fn with_channel_dir(mut self, dir: impl AsRef<Path>) -> Self {
    self.channel_dir = dir.as_ref().to_path_buf();
    self
  }
}

// The worker normally sits next to the controller executable. Falling back to
// a bare name delegates the search to PATH.
fn default_worker_exe() -> PathBuf {
  env::current_exe()
    .ok()
    .and_then(|exe| exe.parent().map(|d| d.join("veiculo")))
    .unwrap_or_else(|| PathBuf::from("veiculo"))
}
