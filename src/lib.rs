//! # frota
//!
//! Dispatch controller for a simulated ride-hailing fleet.
//!
//! The controller process owns all state: logged-in clients, a fixed vehicle
//! pool, and the service table, guarded by one mutex and worked on by four
//! internal threads — the request [`dispatcher`], the simulated [`clock`],
//! the [`scheduler`] that binds due services to free vehicles, and the
//! [`telemetry`] demux that follows the worker processes. Clients and
//! workers are separate OS processes; everything crosses process boundaries
//! through named pipes carrying the records of [`wire`].
//!
//! ```no_run
//! use frota::{Config, Controller};
//!
//! let controller = Controller::start(Config::from_env()).unwrap();
//! // ... admin loop ...
//! controller.shutdown();
//! ```
//!
//! The `controlador` binary wraps [`Controller`] with the admin REPL; the
//! `veiculo` binary wraps [`worker::run`].

pub mod admin;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod scheduler;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod wire;
pub mod worker;
pub mod world;

pub use config::Config;
pub use controller::Controller;
pub use error::StartupError;
pub use wire::{Reply, Request, RequestKind, TelemetryRecord, SERVER_SHUTDOWN};
pub use world::{ServiceId, VehicleId};
