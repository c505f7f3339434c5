//! Administrative operations: read-only projections of the world, plus the
//! privileged cancel that can reach IN_PROGRESS rides.
//!
//! Everything here runs under the world lock and returns plain strings or an
//! effect list; the REPL in the controller binary does the printing, reply
//! writing and signalling.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  clock::format_sim_time,
  wire::Reply,
  world::{Availability, ClientStatus, ServiceId, ServiceStatus, World},
};

/// `listar`: every non-terminal service.
pub fn list_services(world: &World) -> String {
  let mut out = String::from("== SERVIÇOS AGENDADOS ==\n");
  let mut count = 0;
  for service in &world.services {
    if service.status.is_terminal() {
      continue;
    }
    let status = match service.status {
      ServiceStatus::Scheduled => "AGENDADO",
      _ => "EM CURSO",
    };
    let vehicle = service
      .vehicle
      .map_or_else(|| "-".to_string(), |v| v.to_string());
    out.push_str(&format!(
      "  [ID:{}] {} -> {} | Cliente: {} | Veículo: {} | Status: {}\n",
      service.id, service.origin, service.destination, service.client_name, vehicle, status
    ));
    count += 1;
  }
  if count == 0 {
    out.push_str("  (Nenhum serviço agendado ou em curso)\n");
  }
  out
}

/// `utiliz`: logged-in clients.
pub fn list_clients(world: &World) -> String {
  let mut out = format!(
    "== UTILIZADORES LIGADOS ({} / {}) ==\n",
    world.clients.len(),
    world.max_clients
  );
  for client in &world.clients {
    let status = match client.status {
      ClientStatus::OnTrip => "EM VIAGEM",
      ClientStatus::Waiting => "À ESPERA",
    };
    out.push_str(&format!("  - {} (PID: {}) [{}]\n", client.name, client.pid, status));
  }
  if world.clients.is_empty() {
    out.push_str("  (Nenhum utilizador ligado)\n");
  }
  out
}

/// `frota`: the vehicle pool with per-trip progress.
pub fn fleet_status(world: &World) -> String {
  let mut out = String::from("== ESTADO DA FROTA ==\n");
  for vehicle in &world.vehicles {
    match vehicle.availability {
      Availability::Available => {
        out.push_str(&format!("  [Veículo {}] DISPONÍVEL\n", vehicle.id));
      }
      Availability::Occupied => {
        let service = vehicle
          .bound_service
          .map_or_else(|| "-".to_string(), |s| s.to_string());
        out.push_str(&format!(
          "  [Veículo {}] EM SERVIÇO - Progresso: {}% (Serviço ID: {})\n",
          vehicle.id, vehicle.progress_percent, service
        ));
      }
    }
  }
  out
}

/// `km`: fleet total. Releases reset the per-vehicle counter, so this only
/// reflects trips currently in flight.
pub fn total_km(world: &World) -> f64 {
  world.vehicles.iter().map(|v| v.total_km).sum()
}

/// `hora`.
pub fn current_time(world: &World) -> String {
  format!(
    "{} ({} segundos)",
    format_sim_time(world.sim_time),
    world.sim_time
  )
}

/// What an admin cancel decided to do. The caller delivers the replies and
/// the signals after leaving the lock.
#[derive(Debug, Default)]
pub struct CancelOutcome {
  pub cancelled: usize,
  pub notifications: Vec<(u32, Reply)>,
  /// Worker pids owed a SIGUSR1.
  pub signals: Vec<i32>,
  pub found: bool,
}

/// `cancelar <id>`, or `cancelar 0` for every non-terminal service.
///
/// Unlike the client path this reaches IN_PROGRESS rides: the binding is
/// released here and the worker is signalled; the worker's own CANCELLED
/// record later completes the vehicle-side cleanup idempotently.
pub fn cancel(world: &mut World, service_id: u32) -> CancelOutcome {
  let mut outcome = CancelOutcome::default();
  let targets: Vec<ServiceId> = world
    .services
    .iter()
    .filter(|s| {
      !s.status.is_terminal() && (service_id == 0 || s.id.0 == service_id)
    })
    .map(|s| s.id)
    .collect();

  for id in targets {
    outcome.found = true;
    let service = world.service_mut(id).unwrap();
    service.status = ServiceStatus::Cancelled;
    let client_pid = service.client_pid;
    let vehicle_id = service.vehicle;

    if let Some(client) = world.client_by_pid_mut(client_pid) {
      client.status = ClientStatus::Waiting;
    }

    if let Some(vehicle_id) = vehicle_id {
      if let Some(vehicle) = world.vehicle_mut(vehicle_id) {
        vehicle.availability = Availability::Available;
        vehicle.progress_percent = 0;
        vehicle.bound_service = None;
        if let Some(pid) = vehicle.worker_pid.take() {
          outcome.signals.push(pid);
        }
      }
    }

    // The admin verdict is a failure reply, unlike the worker-confirmed one.
    outcome.notifications.push((client_pid, Reply::fail("Serviço cancelado")));
    outcome.cancelled += 1;
    info!("Serviço ID {id} cancelado pelo administrador.");
  }

  debug_assert!(world.check_invariants().is_ok());
  outcome
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::world::{Activity, Client, Service, ServiceId, VehicleId};

  fn world() -> World {
    let mut world = World::new(2, 10, 50);
    world.clients.push(Client {
      pid: 10,
      name: "ana".to_string(),
      status: ClientStatus::Waiting,
    });
    world.clients.push(Client {
      pid: 11,
      name: "rui".to_string(),
      status: ClientStatus::OnTrip,
    });
    let first = world.allocate_service_id();
    world.services.push(Service {
      id: first,
      client_pid: 10,
      client_name: "ana".to_string(),
      scheduled_time: 30,
      origin: "casa".to_string(),
      destination: String::new(),
      distance_km: 5.0,
      vehicle: None,
      status: ServiceStatus::Scheduled,
    });
    let second = world.allocate_service_id();
    world.services.push(Service {
      id: second,
      client_pid: 11,
      client_name: "rui".to_string(),
      scheduled_time: 0,
      origin: "cais".to_string(),
      destination: String::new(),
      distance_km: 2.0,
      vehicle: Some(VehicleId(1)),
      status: ServiceStatus::InProgress,
    });
    let vehicle = world.vehicle_mut(VehicleId(1)).unwrap();
    vehicle.availability = Availability::Occupied;
    vehicle.activity = Activity::Active;
    vehicle.bound_service = Some(ServiceId(2));
    vehicle.worker_pid = Some(7777);
    vehicle.progress_percent = 40;
    vehicle.total_km = 0.8;
    world.check_invariants().unwrap();
    world
  }

  #[test]
  fn listings_cover_the_tables() {
    let world = world();
    let services = list_services(&world);
    assert!(services.contains("[ID:1] casa ->  | Cliente: ana | Veículo: - | Status: AGENDADO"));
    assert!(services.contains("[ID:2] cais ->  | Cliente: rui | Veículo: 1 | Status: EM CURSO"));

    let clients = list_clients(&world);
    assert!(clients.contains("UTILIZADORES LIGADOS (2 / 10)"));
    assert!(clients.contains("- ana (PID: 10) [À ESPERA]"));
    assert!(clients.contains("- rui (PID: 11) [EM VIAGEM]"));

    let fleet = fleet_status(&world);
    assert!(fleet.contains("[Veículo 1] EM SERVIÇO - Progresso: 40% (Serviço ID: 2)"));
    assert!(fleet.contains("[Veículo 2] DISPONÍVEL"));
  }

  #[test]
  fn empty_listings_say_so() {
    let world = World::new(1, 10, 50);
    assert!(list_services(&world).contains("(Nenhum serviço agendado ou em curso)"));
    assert!(list_clients(&world).contains("(Nenhum utilizador ligado)"));
  }

  #[test]
  fn km_sums_active_vehicles_only() {
    let mut world = world();
    world.vehicle_mut(VehicleId(2)).unwrap().total_km = 1.2;
    assert!((total_km(&world) - 2.0).abs() < 1e-9);
  }

  #[test]
  fn hora_projection() {
    let mut world = world();
    world.sim_time = 3723;
    assert_eq!(current_time(&world), "01:02:03 (3723 segundos)");
  }

  #[test]
  fn cancel_scheduled_service_notifies_without_signalling() {
    let mut world = world();
    let outcome = cancel(&mut world, 1);
    assert!(outcome.found);
    assert_eq!(outcome.cancelled, 1);
    assert_eq!(outcome.signals, Vec::<i32>::new());
    assert_eq!(outcome.notifications, vec![(10, Reply::fail("Serviço cancelado"))]);
    assert_eq!(world.service(ServiceId(1)).unwrap().status, ServiceStatus::Cancelled);
  }

  #[test]
  fn cancel_in_progress_releases_binding_and_signals_worker() {
    let mut world = world();
    let outcome = cancel(&mut world, 2);
    assert_eq!(outcome.signals, vec![7777]);
    assert_eq!(outcome.notifications, vec![(11, Reply::fail("Serviço cancelado"))]);

    assert_eq!(world.service(ServiceId(2)).unwrap().status, ServiceStatus::Cancelled);
    assert_eq!(world.client_by_pid(11).unwrap().status, ClientStatus::Waiting);
    let vehicle = world.vehicle(VehicleId(1)).unwrap();
    assert_eq!(vehicle.availability, Availability::Available);
    assert_eq!(vehicle.progress_percent, 0);
    assert_eq!(vehicle.bound_service, None);
    assert_eq!(vehicle.worker_pid, None);
    // The worker is still running until it sees the signal; its CANCELLED
    // record finishes the cleanup.
    assert_eq!(vehicle.activity, Activity::Active);
  }

  #[test]
  fn cancel_all_is_idempotent() {
    let mut world = world();
    let first = cancel(&mut world, 0);
    assert_eq!(first.cancelled, 2);
    let second = cancel(&mut world, 0);
    assert_eq!(second.cancelled, 0);
    assert!(!second.found);
  }

  #[test]
  fn cancel_unknown_or_terminal_id_reports_not_found() {
    let mut world = world();
    assert!(!cancel(&mut world, 9).found);
    cancel(&mut world, 1);
    assert!(!cancel(&mut world, 1).found);
  }
}
