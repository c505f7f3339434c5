//! Vehicle worker processes: spawning, cancel signalling, reaping.

use std::{io, process::Command};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use nix::{
  sys::{
    signal::{kill, Signal},
    wait::{waitpid, WaitPidFlag, WaitStatus},
  },
  unistd::Pid,
};

use crate::{
  config::Config,
  transport,
  world::{Activity, ServiceId, World},
};

/// The seam between the scheduler and process management, so scheduling can
/// be exercised without forking anything.
pub trait Launcher {
  fn launch(&self, world: &mut World, service: ServiceId) -> io::Result<()>;
}

pub struct Supervisor {
  config: Config,
}

impl Supervisor {
  pub fn new(config: Config) -> Supervisor {
    Supervisor { config }
  }

  /// Deliver the cancel signal to a worker. The worker answers with a final
  /// CANCELLED telemetry record; nobody blocks waiting for it.
  pub fn signal_cancel(&self, worker_pid: i32) {
    if let Err(e) = kill(Pid::from_raw(worker_pid), Signal::SIGUSR1) {
      // Normal if the worker finished in the meantime.
      debug!("cancel signal to worker {worker_pid}: {e}");
    }
  }

  /// Collect exit statuses of finished workers without blocking. Called once
  /// per scheduler tick; keeps the process table free of zombies.
  pub fn reap(&self) {
    loop {
      match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => break,
        Ok(status) => trace!("worker reaped: {status:?}"),
        Err(_) => break, // ECHILD: no children at all
      }
    }
  }
}

impl Launcher for Supervisor {
  /// Start the worker for an already-bound service: fresh telemetry
  /// endpoint, then fork/exec with the ride parameters on the command line.
  fn launch(&self, world: &mut World, service_id: ServiceId) -> io::Result<()> {
    let service = world
      .service(service_id)
      .ok_or_else(|| io::Error::other(format!("service {service_id} not in table")))?
      .clone();
    let vehicle_id = service
      .vehicle
      .ok_or_else(|| io::Error::other(format!("service {service_id} has no vehicle")))?;
    if world.vehicle(vehicle_id).is_none() {
      return Err(io::Error::other(format!("vehicle {vehicle_id} not in pool")));
    }

    // Any stale endpoint still carries the previous trip's unread bytes;
    // recreate it and make the demux drop its reader before reopening.
    let path = self.config.telemetry_path(vehicle_id);
    transport::remove_endpoint(&path);
    transport::create_endpoint(&path).map_err(io::Error::other)?;

    let child = Command::new(&self.config.worker_exe)
      .arg(vehicle_id.to_string())
      .arg(service_id.to_string())
      .arg(service.client_pid.to_string())
      .arg(&service.origin)
      .arg(format!("{:.1}", service.distance_km))
      .env("FROTA_CHANNEL_DIR", &self.config.channel_dir)
      .spawn()?;

    let vehicle = world.vehicle_mut(vehicle_id).unwrap();
    vehicle.reader_reset = true;
    vehicle.worker_pid = Some(child.id() as i32);
    vehicle.activity = Activity::Active;
    // The Child handle is dropped on purpose; exits are collected by reap().
    Ok(())
  }
}
