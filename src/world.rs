use std::{
  fmt,
  sync::{Arc, Mutex},
};

/// Vehicle identifier, `1..=fleet_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VehicleId(pub u32);

/// Service identifier, allocated from 1 in strictly increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub u32);

impl fmt::Display for VehicleId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

impl fmt::Display for ServiceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
  Waiting,
  OnTrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
  Scheduled,
  InProgress,
  Completed,
  Cancelled,
}

impl ServiceStatus {
  /// Terminal states are sinks: nothing mutates a service once it is here.
  pub fn is_terminal(self) -> bool {
    matches!(self, ServiceStatus::Completed | ServiceStatus::Cancelled)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
  Available,
  Occupied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
  Inactive,
  Active,
}

#[derive(Debug, Clone)]
pub struct Client {
  pub pid: u32,
  pub name: String,
  pub status: ClientStatus,
}

#[derive(Debug, Clone)]
pub struct Vehicle {
  pub id: VehicleId,
  pub availability: Availability,
  pub activity: Activity,
  pub progress_percent: u8,
  pub bound_service: Option<ServiceId>,
  /// OS pid of the worker currently simulating this vehicle's ride.
  pub worker_pid: Option<i32>,
  /// Kilometers reported for the current trip. Reset on release, so fleet
  /// totals only reflect trips in flight.
  pub total_km: f64,
  /// Set when the telemetry endpoint was re-created and the demux thread
  /// must drop its reader before lazily reopening.
  pub reader_reset: bool,
}

impl Vehicle {
  fn new(id: VehicleId) -> Self {
    Vehicle {
      id,
      availability: Availability::Available,
      activity: Activity::Inactive,
      progress_percent: 0,
      bound_service: None,
      worker_pid: None,
      total_km: 0.0,
      reader_reset: false,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Service {
  pub id: ServiceId,
  pub client_pid: u32,
  pub client_name: String,
  /// Simulated-time seconds at which the ride becomes due.
  pub scheduled_time: u32,
  pub origin: String,
  /// Present in the record and in admin listings, but no command path ever
  /// fills it in.
  pub destination: String,
  pub distance_km: f64,
  pub vehicle: Option<VehicleId>,
  pub status: ServiceStatus,
}

/// All controller state, guarded by one mutex.
///
/// Critical sections are bounded by the table sizes, so a single coarse lock
/// is enough; see the invariant list on [`World::check_invariants`].
#[derive(Debug)]
pub struct World {
  pub clients: Vec<Client>,
  pub vehicles: Vec<Vehicle>,
  pub services: Vec<Service>,
  /// Simulated wall clock in seconds. Never decreases, never resets.
  pub sim_time: u32,
  pub max_clients: usize,
  pub max_services: usize,
  next_service_id: u32,
}

pub type SharedWorld = Arc<Mutex<World>>;

impl World {
  pub fn new(fleet_size: usize, max_clients: usize, max_services: usize) -> Self {
    World {
      clients: Vec::new(),
      vehicles: (1..=fleet_size as u32)
        .map(|id| Vehicle::new(VehicleId(id)))
        .collect(),
      services: Vec::new(),
      sim_time: 0,
      max_clients,
      max_services,
      next_service_id: 1,
    }
  }

  pub fn new_shared(fleet_size: usize, max_clients: usize, max_services: usize) -> SharedWorld {
    Arc::new(Mutex::new(World::new(fleet_size, max_clients, max_services)))
  }

  pub fn client_by_pid(&self, pid: u32) -> Option<&Client> {
    self.clients.iter().find(|c| c.pid == pid)
  }

  pub fn client_by_pid_mut(&mut self, pid: u32) -> Option<&mut Client> {
    self.clients.iter_mut().find(|c| c.pid == pid)
  }

  pub fn vehicle(&self, id: VehicleId) -> Option<&Vehicle> {
    self.vehicles.iter().find(|v| v.id == id)
  }

  pub fn vehicle_mut(&mut self, id: VehicleId) -> Option<&mut Vehicle> {
    self.vehicles.iter_mut().find(|v| v.id == id)
  }

  pub fn service(&self, id: ServiceId) -> Option<&Service> {
    self.services.iter().find(|s| s.id == id)
  }

  pub fn service_mut(&mut self, id: ServiceId) -> Option<&mut Service> {
    self.services.iter_mut().find(|s| s.id == id)
  }

  /// Lowest-id free vehicle; the stable tie-break that makes scheduling
  /// deterministic.
  pub fn first_available_vehicle(&self) -> Option<VehicleId> {
    self
      .vehicles
      .iter()
      .find(|v| v.availability == Availability::Available)
      .map(|v| v.id)
  }

  /// Does this client own a service that is not yet COMPLETED/CANCELLED?
  pub fn has_open_service(&self, client_pid: u32) -> bool {
    self
      .services
      .iter()
      .any(|s| s.client_pid == client_pid && !s.status.is_terminal())
  }

  pub fn allocate_service_id(&mut self) -> ServiceId {
    let id = ServiceId(self.next_service_id);
    self.next_service_id += 1;
    id
  }

  /// Consistency sweep over the tables. Called from tests and from
  /// `debug_assert!` at the end of every mutating path.
  ///
  /// 1. A pid appears at most once among clients.
  /// 2. A display name appears at most once among clients.
  /// 3. A client is ON_TRIP iff it owns exactly one IN_PROGRESS service.
  /// 4. A vehicle is OCCUPIED iff exactly one IN_PROGRESS service binds it.
  /// 5. A client owns at most one non-terminal service.
  /// 6. SCHEDULED services carry no vehicle; IN_PROGRESS services carry one.
  /// 7. Service ids are strictly increasing in creation order.
  pub fn check_invariants(&self) -> Result<(), String> {
    for (i, c) in self.clients.iter().enumerate() {
      if self.clients[..i].iter().any(|o| o.pid == c.pid) {
        return Err(format!("duplicate client pid {}", c.pid));
      }
      if self.clients[..i].iter().any(|o| o.name == c.name) {
        return Err(format!("duplicate client name {:?}", c.name));
      }
      let in_progress = self
        .services
        .iter()
        .filter(|s| s.client_pid == c.pid && s.status == ServiceStatus::InProgress)
        .count();
      let on_trip = c.status == ClientStatus::OnTrip;
      if on_trip != (in_progress == 1) {
        return Err(format!(
          "client {} on_trip={} but owns {} in-progress services",
          c.pid, on_trip, in_progress
        ));
      }
      let open = self
        .services
        .iter()
        .filter(|s| s.client_pid == c.pid && !s.status.is_terminal())
        .count();
      if open > 1 {
        return Err(format!("client {} owns {} open services", c.pid, open));
      }
    }

    for v in &self.vehicles {
      let bound = self
        .services
        .iter()
        .filter(|s| s.vehicle == Some(v.id) && s.status == ServiceStatus::InProgress)
        .count();
      let occupied = v.availability == Availability::Occupied;
      if occupied != (bound == 1) {
        return Err(format!(
          "vehicle {} occupied={} but {} in-progress services bind it",
          v.id, occupied, bound
        ));
      }
    }

    for s in &self.services {
      match s.status {
        ServiceStatus::Scheduled if s.vehicle.is_some() => {
          return Err(format!("scheduled service {} has a vehicle", s.id));
        }
        ServiceStatus::InProgress if s.vehicle.is_none() => {
          return Err(format!("in-progress service {} has no vehicle", s.id));
        }
        _ => {}
      }
    }

    for w in self.services.windows(2) {
      if w[1].id <= w[0].id {
        return Err(format!("service ids not increasing: {} then {}", w[0].id, w[1].id));
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn service(id: u32, pid: u32, status: ServiceStatus, vehicle: Option<u32>) -> Service {
    Service {
      id: ServiceId(id),
      client_pid: pid,
      client_name: format!("c{pid}"),
      scheduled_time: 0,
      origin: "casa".to_string(),
      destination: String::new(),
      distance_km: 1.0,
      vehicle: vehicle.map(VehicleId),
      status,
    }
  }

  #[test]
  fn fresh_world_is_consistent() {
    let world = World::new(10, 10, 50);
    assert_eq!(world.vehicles.len(), 10);
    assert_eq!(world.vehicles[0].id, VehicleId(1));
    world.check_invariants().unwrap();
  }

  #[test]
  fn service_ids_are_strictly_increasing() {
    let mut world = World::new(2, 10, 50);
    assert_eq!(world.allocate_service_id(), ServiceId(1));
    assert_eq!(world.allocate_service_id(), ServiceId(2));
    assert_eq!(world.allocate_service_id(), ServiceId(3));
  }

  #[test]
  fn on_trip_without_in_progress_service_is_flagged() {
    let mut world = World::new(1, 10, 50);
    world.clients.push(Client {
      pid: 11,
      name: "ana".to_string(),
      status: ClientStatus::OnTrip,
    });
    assert!(world.check_invariants().is_err());

    world.services.push(service(1, 11, ServiceStatus::InProgress, Some(1)));
    let v = world.vehicle_mut(VehicleId(1)).unwrap();
    v.availability = Availability::Occupied;
    v.bound_service = Some(ServiceId(1));
    world.check_invariants().unwrap();
  }

  #[test]
  fn occupied_vehicle_needs_exactly_one_binding() {
    let mut world = World::new(1, 10, 50);
    world.vehicles[0].availability = Availability::Occupied;
    assert!(world.check_invariants().is_err());
  }

  #[test]
  fn open_service_cap_is_per_client() {
    let mut world = World::new(2, 10, 50);
    world.clients.push(Client {
      pid: 11,
      name: "ana".to_string(),
      status: ClientStatus::Waiting,
    });
    world.services.push(service(1, 11, ServiceStatus::Scheduled, None));
    world.services.push(service(2, 11, ServiceStatus::Cancelled, None));
    world.check_invariants().unwrap();
    assert!(world.has_open_service(11));

    world.services.push(service(3, 11, ServiceStatus::Scheduled, None));
    assert!(world.check_invariants().is_err());
  }
}
