//! Simulated wall clock: one tick per real second, forever forward.

use std::{
  io,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  thread,
  time::Duration,
};

use crate::world::SharedWorld;

pub const TICK: Duration = Duration::from_secs(1);

/// `seconds` of simulated time as `HH:MM:SS`. Hours run past 23 when the
/// simulation does.
pub fn format_sim_time(seconds: u32) -> String {
  format!(
    "{:02}:{:02}:{:02}",
    seconds / 3600,
    (seconds % 3600) / 60,
    seconds % 60
  )
}

/// The ticker thread. Sleeps outside the lock and holds it only for the
/// increment.
pub fn spawn(world: SharedWorld, keep_running: Arc<AtomicBool>) -> io::Result<thread::JoinHandle<()>> {
  thread::Builder::new().name("clock".to_string()).spawn(move || {
    while keep_running.load(Ordering::SeqCst) {
      thread::sleep(TICK);
      if !keep_running.load(Ordering::SeqCst) {
        break;
      }
      world.lock().unwrap().sim_time += 1;
    }
  })
}
