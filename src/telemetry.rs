//! Telemetry demultiplexer: one thread draining every vehicle's channel.
//!
//! Readers are opened lazily: a vehicle only gets one while a worker is
//! active, and the launch path re-creates the endpoint and flags
//! `reader_reset`, so the stale reader from a previous trip is dropped here
//! before a fresh one is opened. All fds live in this thread; other threads
//! only ever touch the flag.
//!
//! The poll carries a 50 ms timeout: readiness drives data, the timeout
//! drives lazy opens and shutdown checks.

use std::{
  collections::HashMap,
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
use mio::{event::Source, Events, Interest, Poll, Registry, Token, Waker};

use crate::{
  config::Config,
  transport::{self, ReplySender, TelemetryReader},
  wire::{Reply, TelemetryRecord},
  world::{
    Activity, Availability, ClientStatus, ServiceId, ServiceStatus, SharedWorld, VehicleId, World,
  },
};

// Token 0 is the shutdown waker; vehicle v reads on Token(v).
const WAKE: Token = Token(0);
const POLL_PERIOD: Duration = Duration::from_millis(50);

pub fn spawn(
  world: SharedWorld,
  config: Config,
  replies: ReplySender,
  keep_running: Arc<AtomicBool>,
) -> io::Result<(thread::JoinHandle<()>, Arc<Waker>)> {
  let poll = Poll::new()?;
  let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
  let handle = thread::Builder::new()
    .name("telemetry".to_string())
    .spawn(move || run(poll, world, config, replies, keep_running))?;
  Ok((handle, waker))
}

fn run(
  mut poll: Poll,
  world: SharedWorld,
  config: Config,
  replies: ReplySender,
  keep_running: Arc<AtomicBool>,
) {
  let mut readers: HashMap<usize, TelemetryReader> = HashMap::new();
  let mut events = Events::with_capacity(32);

  while keep_running.load(Ordering::SeqCst) {
    if let Err(e) = poll.poll(&mut events, Some(POLL_PERIOD)) {
      if e.kind() == io::ErrorKind::Interrupted {
        continue;
      }
      error!("telemetry poll: {e}");
      break;
    }

    for event in events.iter() {
      let token = event.token();
      if token == WAKE {
        continue;
      }
      let Some(reader) = readers.get_mut(&token.0) else {
        continue;
      };
      let records = reader.drain();
      if records.is_empty() {
        continue;
      }

      let vehicle = VehicleId(token.0 as u32);
      let mut world = world.lock().unwrap();
      for record in records {
        let record = attribute(record, vehicle);
        for (pid, reply) in apply_record(&mut world, &config, &record) {
          replies.send(pid, &reply);
        }
      }
      debug_assert!(world.check_invariants().is_ok());
    }

    maintain_readers(&mut readers, poll.registry(), &world, &config);
  }
}

// Lazy open / reset handling, run once per wakeup.
fn maintain_readers(
  readers: &mut HashMap<usize, TelemetryReader>,
  registry: &Registry,
  world: &SharedWorld,
  config: &Config,
) {
  let mut world = world.lock().unwrap();
  for vehicle in &mut world.vehicles {
    let key = vehicle.id.0 as usize;
    if vehicle.reader_reset {
      if let Some(mut reader) = readers.remove(&key) {
        let _ = reader.deregister(registry);
      }
      vehicle.reader_reset = false;
    }
    if vehicle.activity == Activity::Active && !readers.contains_key(&key) {
      // Endpoint absence is normal between unlink and the next launch.
      if let Ok(mut reader) = TelemetryReader::open(&config.telemetry_path(vehicle.id)) {
        match reader.register(registry, Token(key), Interest::READABLE) {
          Ok(()) => {
            readers.insert(key, reader);
          }
          Err(e) => warn!("registering telemetry reader for vehicle {}: {e}", vehicle.id),
        }
      }
    }
  }
}

// A bare CANCELLED line carries no ids; it belongs to the channel it came in
// on.
fn attribute(record: TelemetryRecord, vehicle: VehicleId) -> TelemetryRecord {
  match record {
    TelemetryRecord::Cancelled {
      vehicle: None,
      service,
    } => TelemetryRecord::Cancelled {
      vehicle: Some(vehicle),
      service,
    },
    other => other,
  }
}

/// Apply one record to the world; returns the client notifications to write.
/// Called under the world lock.
pub fn apply_record(
  world: &mut World,
  config: &Config,
  record: &TelemetryRecord,
) -> Vec<(u32, Reply)> {
  match *record {
    TelemetryRecord::TripStarted { service, .. } => {
      match world.service(service) {
        Some(s) if s.status == ServiceStatus::InProgress => {
          info!("Viagem iniciada (serviço ID {service})");
          vec![(s.client_pid, Reply::ok("Viagem iniciada!"))]
        }
        // Started after a cancel crossed it mid-air; the worker will see the
        // signal within a step.
        _ => Vec::new(),
      }
    }

    TelemetryRecord::Progress {
      vehicle, percent, ..
    } => {
      if let Some(v) = world.vehicle_mut(vehicle) {
        v.progress_percent = percent.min(100);
      }
      Vec::new()
    }

    TelemetryRecord::Distance { vehicle, km, .. } => {
      if let Some(v) = world.vehicle_mut(vehicle) {
        debug!("Veículo {vehicle} percorreu mais {:.1} km. Total: {km:.1} km", km - v.total_km);
        v.total_km = km;
      }
      Vec::new()
    }

    TelemetryRecord::Completed {
      vehicle, service, ..
    } => finish_trip(world, config, vehicle, Some(service), ServiceStatus::Completed),

    TelemetryRecord::Cancelled {
      vehicle: Some(vehicle),
      service,
    } => {
      let service = service.or_else(|| world.vehicle(vehicle).and_then(|v| v.bound_service));
      finish_trip(world, config, vehicle, service, ServiceStatus::Cancelled)
    }

    // Unattributed cancel: nothing to act on.
    TelemetryRecord::Cancelled { vehicle: None, .. } => Vec::new(),
  }
}

// Terminal transition plus vehicle release. Both halves are idempotent: a
// replayed COMPLETED/CANCELLED, or one arriving after an admin cancel
// already ended the service, only performs whatever cleanup is still due.
fn finish_trip(
  world: &mut World,
  config: &Config,
  vehicle_id: VehicleId,
  service_id: Option<ServiceId>,
  outcome: ServiceStatus,
) -> Vec<(u32, Reply)> {
  let mut notifications = Vec::new();

  if let Some(service_id) = service_id {
    if let Some(service) = world.service_mut(service_id) {
      if !service.status.is_terminal() {
        service.status = outcome;
        let client_pid = service.client_pid;
        let distance_km = service.distance_km;
        if let Some(client) = world.client_by_pid_mut(client_pid) {
          client.status = ClientStatus::Waiting;
        }
        let message = match outcome {
          ServiceStatus::Completed => {
            format!("Viagem concluída! Percorridos {distance_km:.1} km.")
          }
          _ => format!("Viagem cancelada. Serviço ID {service_id}"),
        };
        notifications.push((client_pid, Reply::ok(message)));
        info!("Serviço ID {service_id} terminou: {outcome:?}");
      }
    }
  }

  release_vehicle(world, config, vehicle_id, service_id);
  notifications
}

fn release_vehicle(
  world: &mut World,
  config: &Config,
  vehicle_id: VehicleId,
  for_service: Option<ServiceId>,
) {
  let Some(vehicle) = world.vehicle_mut(vehicle_id) else {
    return;
  };
  // Already rebound to a newer ride: this record is a leftover from the
  // previous worker and must not disturb the new binding.
  if let (Some(bound), Some(record_service)) = (vehicle.bound_service, for_service) {
    if bound != record_service {
      return;
    }
  }
  vehicle.availability = Availability::Available;
  vehicle.activity = Activity::Inactive;
  vehicle.progress_percent = 0;
  vehicle.bound_service = None;
  vehicle.worker_pid = None;
  vehicle.total_km = 0.0; // the km projection only counts trips in flight
  vehicle.reader_reset = true;
  transport::remove_endpoint(&config.telemetry_path(vehicle_id));
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::world::{Availability, Client, Service};

  struct Fixture {
    world: World,
    config: Config,
    _dir: TempDir,
  }

  // One client (pid 10) on an in-progress ride: service 1 on vehicle 1.
  fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = Config::default().with_channel_dir(dir.path());
    let mut world = World::new(2, 10, 50);
    world.clients.push(Client {
      pid: 10,
      name: "ana".to_string(),
      status: ClientStatus::OnTrip,
    });
    let id = world.allocate_service_id();
    world.services.push(Service {
      id,
      client_pid: 10,
      client_name: "ana".to_string(),
      scheduled_time: 0,
      origin: "casa".to_string(),
      destination: String::new(),
      distance_km: 5.0,
      vehicle: Some(VehicleId(1)),
      status: ServiceStatus::InProgress,
    });
    let vehicle = world.vehicle_mut(VehicleId(1)).unwrap();
    vehicle.availability = Availability::Occupied;
    vehicle.activity = Activity::Active;
    vehicle.bound_service = Some(id);
    vehicle.worker_pid = Some(4321);
    transport::create_endpoint(&config.telemetry_path(VehicleId(1))).unwrap();
    world.check_invariants().unwrap();
    Fixture {
      world,
      config,
      _dir: dir,
    }
  }

  #[test]
  fn trip_started_notifies_owner_only_while_in_progress() {
    let mut fx = fixture();
    let record = TelemetryRecord::TripStarted {
      vehicle: VehicleId(1),
      service: ServiceId(1),
    };
    let notes = apply_record(&mut fx.world, &fx.config, &record);
    assert_eq!(notes, vec![(10, Reply::ok("Viagem iniciada!"))]);

    fx.world.service_mut(ServiceId(1)).unwrap().status = ServiceStatus::Cancelled;
    fx.world.client_by_pid_mut(10).unwrap().status = ClientStatus::Waiting;
    assert!(apply_record(&mut fx.world, &fx.config, &record).is_empty());
  }

  #[test]
  fn progress_and_distance_update_the_vehicle() {
    let mut fx = fixture();
    apply_record(
      &mut fx.world,
      &fx.config,
      &TelemetryRecord::Progress {
        vehicle: VehicleId(1),
        service: ServiceId(1),
        percent: 40,
      },
    );
    apply_record(
      &mut fx.world,
      &fx.config,
      &TelemetryRecord::Distance {
        vehicle: VehicleId(1),
        service: ServiceId(1),
        km: 2.0,
      },
    );
    let vehicle = fx.world.vehicle(VehicleId(1)).unwrap();
    assert_eq!(vehicle.progress_percent, 40);
    assert_eq!(vehicle.total_km, 2.0);

    // Nonsense percent from a confused worker is clamped, not trusted.
    apply_record(
      &mut fx.world,
      &fx.config,
      &TelemetryRecord::Progress {
        vehicle: VehicleId(1),
        service: ServiceId(1),
        percent: 250,
      },
    );
    assert_eq!(fx.world.vehicle(VehicleId(1)).unwrap().progress_percent, 100);
  }

  #[test]
  fn completed_finishes_service_and_releases_vehicle() {
    let mut fx = fixture();
    let record = TelemetryRecord::Completed {
      vehicle: VehicleId(1),
      service: ServiceId(1),
      km: 5.0,
    };
    let notes = apply_record(&mut fx.world, &fx.config, &record);
    assert_eq!(notes, vec![(10, Reply::ok("Viagem concluída! Percorridos 5.0 km."))]);

    let service = fx.world.service(ServiceId(1)).unwrap();
    assert_eq!(service.status, ServiceStatus::Completed);
    assert_eq!(fx.world.client_by_pid(10).unwrap().status, ClientStatus::Waiting);

    let vehicle = fx.world.vehicle(VehicleId(1)).unwrap();
    assert_eq!(vehicle.availability, Availability::Available);
    assert_eq!(vehicle.activity, Activity::Inactive);
    assert_eq!(vehicle.worker_pid, None);
    assert_eq!(vehicle.total_km, 0.0);
    assert!(vehicle.reader_reset);
    assert!(!fx.config.telemetry_path(VehicleId(1)).exists());
    fx.world.check_invariants().unwrap();

    // Replay is absorbed without effect.
    assert!(apply_record(&mut fx.world, &fx.config, &record).is_empty());
    fx.world.check_invariants().unwrap();
  }

  #[test]
  fn cancelled_without_ids_resolves_through_the_binding() {
    let mut fx = fixture();
    let record = attribute(
      TelemetryRecord::Cancelled {
        vehicle: None,
        service: None,
      },
      VehicleId(1),
    );
    let notes = apply_record(&mut fx.world, &fx.config, &record);
    assert_eq!(notes, vec![(10, Reply::ok("Viagem cancelada. Serviço ID 1"))]);
    assert_eq!(
      fx.world.service(ServiceId(1)).unwrap().status,
      ServiceStatus::Cancelled
    );
    fx.world.check_invariants().unwrap();
  }

  #[test]
  fn late_cancelled_after_admin_cancel_only_cleans_the_vehicle() {
    let mut fx = fixture();
    // Admin already ended the service and unbound the vehicle, but the
    // worker had not yet confirmed.
    fx.world.service_mut(ServiceId(1)).unwrap().status = ServiceStatus::Cancelled;
    fx.world.service_mut(ServiceId(1)).unwrap().vehicle = Some(VehicleId(1));
    fx.world.client_by_pid_mut(10).unwrap().status = ClientStatus::Waiting;
    let vehicle = fx.world.vehicle_mut(VehicleId(1)).unwrap();
    vehicle.availability = Availability::Available;
    vehicle.bound_service = None;
    vehicle.progress_percent = 0;
    vehicle.total_km = 2.0;

    let notes = apply_record(
      &mut fx.world,
      &fx.config,
      &TelemetryRecord::Cancelled {
        vehicle: Some(VehicleId(1)),
        service: Some(ServiceId(1)),
      },
    );
    assert!(notes.is_empty()); // owner was already told by the admin path

    let vehicle = fx.world.vehicle(VehicleId(1)).unwrap();
    assert_eq!(vehicle.activity, Activity::Inactive);
    assert_eq!(vehicle.worker_pid, None);
    assert_eq!(vehicle.total_km, 0.0);
    fx.world.check_invariants().unwrap();
  }

  #[test]
  fn stale_record_cannot_disturb_a_rebound_vehicle() {
    let mut fx = fixture();
    // Finish ride 1, rebind the vehicle to a new ride 2 of another client.
    apply_record(
      &mut fx.world,
      &fx.config,
      &TelemetryRecord::Completed {
        vehicle: VehicleId(1),
        service: ServiceId(1),
        km: 5.0,
      },
    );
    fx.world.clients.push(Client {
      pid: 11,
      name: "rui".to_string(),
      status: ClientStatus::OnTrip,
    });
    let id = fx.world.allocate_service_id();
    fx.world.services.push(Service {
      id,
      client_pid: 11,
      client_name: "rui".to_string(),
      scheduled_time: 0,
      origin: "cais".to_string(),
      destination: String::new(),
      distance_km: 1.0,
      vehicle: Some(VehicleId(1)),
      status: ServiceStatus::InProgress,
    });
    let vehicle = fx.world.vehicle_mut(VehicleId(1)).unwrap();
    vehicle.availability = Availability::Occupied;
    vehicle.activity = Activity::Active;
    vehicle.bound_service = Some(id);
    vehicle.worker_pid = Some(5555);
    vehicle.progress_percent = 30;

    // A duplicate COMPLETED for the *old* ride arrives late.
    apply_record(
      &mut fx.world,
      &fx.config,
      &TelemetryRecord::Completed {
        vehicle: VehicleId(1),
        service: ServiceId(1),
        km: 5.0,
      },
    );
    let vehicle = fx.world.vehicle(VehicleId(1)).unwrap();
    assert_eq!(vehicle.availability, Availability::Occupied);
    assert_eq!(vehicle.bound_service, Some(ServiceId(2)));
    assert_eq!(vehicle.progress_percent, 30);
    fx.world.check_invariants().unwrap();
  }
}
