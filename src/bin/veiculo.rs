//! Vehicle worker entry point. Spawned by the controller, one per ride.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;

use frota::{
  worker::{self, RideAssignment},
  Config, ServiceId, VehicleId,
};

/// Veículo simulado. Lançado pelo controlador; não invocar à mão.
#[derive(Parser)]
#[command(version)]
struct Args {
  vehicle_id: u32,
  service_id: u32,
  client_pid: u32,
  origin: String,
  distance_km: f64,
}

fn main() -> ExitCode {
  env_logger::init();
  let args = Args::parse();

  // The controller forwards its channel directory; anything else means the
  // default layout under /tmp.
  let channel_dir = std::env::var_os("FROTA_CHANNEL_DIR")
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("/tmp"));
  let config = Config::default().with_channel_dir(channel_dir);

  let ride = RideAssignment {
    vehicle: VehicleId(args.vehicle_id),
    service: ServiceId(args.service_id),
    client_pid: args.client_pid,
    origin: args.origin,
    distance_km: args.distance_km,
  };

  match worker::run(&config, ride) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("[VEICULO] {e}");
      ExitCode::FAILURE
    }
  }
}
