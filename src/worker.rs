//! The vehicle worker: one short-lived process per active ride.
//!
//! The controller hands the whole assignment over on the command line; from
//! there the worker only writes — telemetry into its vehicle channel, plus
//! one direct greeting to the client's reply channel. Cancellation arrives
//! as SIGUSR1 and is checked after every simulation step, so a cancel is
//! observed within one progress step.

use std::{
  io,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  thread,
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  config::Config,
  transport::{ReplySender, TelemetryWriter},
  wire::{Reply, TelemetryRecord},
  world::{ServiceId, VehicleId},
};

/// Everything a worker needs to know about its ride.
#[derive(Debug, Clone)]
pub struct RideAssignment {
  pub vehicle: VehicleId,
  pub service: ServiceId,
  pub client_pid: u32,
  pub origin: String,
  pub distance_km: f64,
}

/// Worker entry point: registers the cancel signal, then simulates.
pub fn run(config: &Config, ride: RideAssignment) -> io::Result<()> {
  let cancelled = Arc::new(AtomicBool::new(false));
  signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(&cancelled))?;
  simulate(config, ride, &cancelled);
  Ok(())
}

// The simulation itself, with the cancel flag injected so tests can pull it
// without delivering a real signal.
pub(crate) fn simulate(config: &Config, ride: RideAssignment, cancelled: &AtomicBool) {
  info!(
    "Veículo {} iniciado para serviço ID {} ({:.1} km)",
    ride.vehicle, ride.service, ride.distance_km
  );
  let mut telemetry = TelemetryWriter::open(&config.telemetry_path(ride.vehicle));
  let cancel_record = TelemetryRecord::Cancelled {
    vehicle: Some(ride.vehicle),
    service: Some(ride.service),
  };

  // The vehicle "arrives" and greets its passenger directly.
  ReplySender::new(&config.channel_dir).send(
    ride.client_pid,
    &Reply::ok(format!(
      "Veículo {} chegou a '{}'. A viagem está a iniciar!",
      ride.vehicle, ride.origin
    )),
  );

  if cancelled.load(Ordering::SeqCst) {
    telemetry.send(&cancel_record);
    return;
  }

  telemetry.send(&TelemetryRecord::TripStarted {
    vehicle: ride.vehicle,
    service: ride.service,
  });
  thread::sleep(Duration::from_secs(1));

  // 10% per step, distance/10 seconds per step.
  let step = Duration::from_secs_f64(ride.distance_km / 10.0);
  let mut percent: u8 = 0;
  while percent < 100 && !cancelled.load(Ordering::SeqCst) {
    thread::sleep(step);
    if cancelled.load(Ordering::SeqCst) {
      break;
    }
    percent += 10;
    telemetry.send(&TelemetryRecord::Progress {
      vehicle: ride.vehicle,
      service: ride.service,
      percent,
    });
    telemetry.send(&TelemetryRecord::Distance {
      vehicle: ride.vehicle,
      service: ride.service,
      km: f64::from(percent) / 100.0 * ride.distance_km,
    });
  }

  if cancelled.load(Ordering::SeqCst) {
    info!("Veículo {}: serviço cancelado (progresso: {percent}%)", ride.vehicle);
    telemetry.send(&cancel_record);
  } else {
    info!("Veículo {}: viagem concluída ({:.1} km)", ride.vehicle, ride.distance_km);
    telemetry.send(&TelemetryRecord::Completed {
      vehicle: ride.vehicle,
      service: ride.service,
      km: ride.distance_km,
    });
  }
}
