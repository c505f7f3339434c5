//! Controller lifecycle: bring the endpoints and worker threads up, keep the
//! shared state reachable for the admin surface, and tear everything down on
//! request.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, Mutex,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::Waker;

use crate::{
  admin,
  clock,
  config::Config,
  dispatcher,
  error::{StartupError, StartupResult},
  scheduler,
  supervisor::Supervisor,
  telemetry,
  transport::{self, InboundReader, ReplySender},
  wire::{Reply, SERVER_SHUTDOWN},
  world::{SharedWorld, VehicleId, World},
};

pub struct Controller {
  config: Config,
  world: SharedWorld,
  keep_running: Arc<AtomicBool>,
  replies: ReplySender,
  supervisor: Arc<Supervisor>,
  wakers: Vec<Arc<Waker>>,
  threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Controller {
  /// Bring the system up: inbound endpoint, vehicle table with pre-created
  /// telemetry endpoints, then the four worker threads. Any failure here is
  /// fatal to the caller.
  pub fn start(config: Config) -> StartupResult<Arc<Controller>> {
    info!("A iniciar sistema...");
    let world = World::new_shared(config.fleet_size, config.max_clients, config.max_services);
    let keep_running = Arc::new(AtomicBool::new(true));
    let replies = ReplySender::new(&config.channel_dir);
    let supervisor = Arc::new(Supervisor::new(config.clone()));

    transport::create_endpoint(&config.inbound_path())?;
    let inbound = InboundReader::open(&config.inbound_path())?;
    for id in 1..=config.fleet_size as u32 {
      transport::create_endpoint(&config.telemetry_path(VehicleId(id)))?;
    }
    info!("{} veículos inicializados.", config.fleet_size);

    let thread_err = |name| move |source| StartupError::Thread { name, source };

    let (dispatcher_handle, dispatcher_waker) = dispatcher::spawn(
      inbound,
      Arc::clone(&world),
      replies.clone(),
      Arc::clone(&keep_running),
    )
    .map_err(thread_err("dispatcher"))?;

    let clock_handle =
      clock::spawn(Arc::clone(&world), Arc::clone(&keep_running)).map_err(thread_err("clock"))?;

    let scheduler_handle = scheduler::spawn(
      Arc::clone(&world),
      Arc::clone(&supervisor),
      Arc::clone(&keep_running),
    )
    .map_err(thread_err("scheduler"))?;

    let (telemetry_handle, telemetry_waker) = telemetry::spawn(
      Arc::clone(&world),
      config.clone(),
      replies.clone(),
      Arc::clone(&keep_running),
    )
    .map_err(thread_err("telemetry"))?;

    Ok(Arc::new(Controller {
      config,
      world,
      keep_running,
      replies,
      supervisor,
      wakers: vec![dispatcher_waker, telemetry_waker],
      threads: Mutex::new(vec![
        dispatcher_handle,
        clock_handle,
        scheduler_handle,
        telemetry_handle,
      ]),
    }))
  }

  pub fn world(&self) -> &SharedWorld {
    &self.world
  }

  pub fn is_running(&self) -> bool {
    self.keep_running.load(Ordering::SeqCst)
  }

  /// Admin cancel: mutate under the lock, then deliver replies and worker
  /// signals outside it.
  pub fn admin_cancel(&self, service_id: u32) -> admin::CancelOutcome {
    let outcome = {
      let mut world = self.world.lock().unwrap();
      admin::cancel(&mut world, service_id)
    };
    for (pid, reply) in &outcome.notifications {
      self.replies.send(*pid, reply);
    }
    for worker_pid in &outcome.signals {
      self.supervisor.signal_cancel(*worker_pid);
    }
    outcome
  }

  /// Stop the threads, tell every client, remove the endpoints. Safe to call
  /// twice; the second call returns at once. In-flight workers keep running,
  /// their rides are simply no longer observed.
  pub fn shutdown(&self) {
    if !self.keep_running.swap(false, Ordering::SeqCst) {
      return;
    }
    info!("A terminar sistema...");
    for waker in &self.wakers {
      if let Err(e) = waker.wake() {
        warn!("waking worker thread for shutdown: {e}");
      }
    }
    for handle in self.threads.lock().unwrap().drain(..) {
      let _ = handle.join();
    }

    info!("A avisar clientes do encerramento...");
    {
      let world = self.world.lock().unwrap();
      for client in &world.clients {
        self.replies.send(client.pid, &Reply::fail(SERVER_SHUTDOWN));
      }
    }

    transport::remove_endpoint(&self.config.inbound_path());
    for id in 1..=self.config.fleet_size as u32 {
      transport::remove_endpoint(&self.config.telemetry_path(VehicleId(id)));
    }
    info!("Encerrado.");
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  fn test_config(dir: &TempDir) -> Config {
    Config {
      fleet_size: 2,
      ..Config::default().with_channel_dir(dir.path())
    }
  }

  #[test]
  fn start_creates_endpoints_and_shutdown_removes_them() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let controller = Controller::start(config.clone()).unwrap();

    assert!(config.inbound_path().exists());
    assert!(config.telemetry_path(VehicleId(1)).exists());
    assert!(config.telemetry_path(VehicleId(2)).exists());
    assert!(controller.is_running());

    controller.shutdown();
    assert!(!controller.is_running());
    assert!(!config.inbound_path().exists());
    assert!(!config.telemetry_path(VehicleId(1)).exists());

    // Second shutdown is a no-op.
    controller.shutdown();
  }

  #[test]
  fn admin_cancel_without_targets_reports_not_found() {
    let dir = TempDir::new().unwrap();
    let controller = Controller::start(test_config(&dir)).unwrap();
    let outcome = controller.admin_cancel(3);
    assert!(!outcome.found);
    assert_eq!(outcome.cancelled, 0);
    controller.shutdown();
  }
}
