//! The scheduler: a 1 Hz sweep binding due services to free vehicles.
//!
//! Binding is first-come-first-served on service creation order, with the
//! lowest-id free vehicle as the stable tie-break. A due service that finds
//! no vehicle simply stays SCHEDULED and is reconsidered next tick; there is
//! no aging and no timeout.

use std::{
  io,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  thread,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  clock::TICK,
  supervisor::{Launcher, Supervisor},
  world::{Availability, ClientStatus, ServiceId, ServiceStatus, SharedWorld, VehicleId, World},
};

pub fn spawn(
  world: SharedWorld,
  supervisor: Arc<Supervisor>,
  keep_running: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
  thread::Builder::new()
    .name("scheduler".to_string())
    .spawn(move || {
      while keep_running.load(Ordering::SeqCst) {
        thread::sleep(TICK);
        if !keep_running.load(Ordering::SeqCst) {
          break;
        }
        supervisor.reap();
        let mut world = world.lock().unwrap();
        tick(&mut world, supervisor.as_ref());
        debug_assert!(world.check_invariants().is_ok());
      }
    })
}

/// One sweep over the service table. Called under the world lock.
pub fn tick(world: &mut World, launcher: &dyn Launcher) {
  let now = world.sim_time;
  let due: Vec<ServiceId> = world
    .services
    .iter()
    .filter(|s| {
      s.status == ServiceStatus::Scheduled && s.scheduled_time <= now && s.vehicle.is_none()
    })
    .map(|s| s.id)
    .collect();

  for service_id in due {
    let Some(vehicle_id) = world.first_available_vehicle() else {
      // Pool exhausted; later services cannot overtake either, so the
      // remaining due list keeps its order for next tick.
      break;
    };

    bind(world, service_id, vehicle_id);
    info!("Lançando veículo {vehicle_id} para serviço ID {service_id}");

    if let Err(e) = launcher.launch(world, service_id) {
      // Steady-state resource failure: undo the binding and let a later
      // tick retry, leaving no half-started ride behind.
      error!("lançamento do veículo {vehicle_id} falhou: {e}");
      unbind(world, service_id);
    }
  }
}

fn bind(world: &mut World, service_id: ServiceId, vehicle_id: VehicleId) {
  let service = world.service_mut(service_id).unwrap();
  service.vehicle = Some(vehicle_id);
  service.status = ServiceStatus::InProgress;
  let client_pid = service.client_pid;

  let vehicle = world.vehicle_mut(vehicle_id).unwrap();
  vehicle.availability = Availability::Occupied;
  vehicle.bound_service = Some(service_id);

  if let Some(client) = world.client_by_pid_mut(client_pid) {
    client.status = ClientStatus::OnTrip;
  }
}

fn unbind(world: &mut World, service_id: ServiceId) {
  let service = world.service_mut(service_id).unwrap();
  let vehicle_id = service.vehicle.take();
  service.status = ServiceStatus::Scheduled;
  let client_pid = service.client_pid;

  if let Some(vehicle_id) = vehicle_id {
    let vehicle = world.vehicle_mut(vehicle_id).unwrap();
    vehicle.availability = Availability::Available;
    vehicle.bound_service = None;
  }
  if let Some(client) = world.client_by_pid_mut(client_pid) {
    client.status = ClientStatus::Waiting;
  }
}
