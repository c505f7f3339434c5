//! The request dispatcher: single reader of the shared inbound channel.
//!
//! Each decoded request is handled under the world lock and answered with
//! exactly one reply on the caller's own channel (TERMINATE from an unknown
//! pid being the one silent case). Every failure a client can provoke comes
//! back as `Reply { success: false, .. }`; the dispatcher itself never goes
//! down over bad input.

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
use mio::{Events, Poll, Token, Waker};

use crate::{
  clock::format_sim_time,
  transport::{InboundReader, ReplySender},
  wire::{Reply, Request, RequestKind},
  world::{Client, ClientStatus, Service, ServiceId, ServiceStatus, SharedWorld, World},
};

const INBOUND: Token = Token(0);
const WAKE: Token = Token(1);

/// Spawn the dispatcher thread. The returned waker unblocks the poll so the
/// thread can observe `keep_running` going false.
pub fn spawn(
  mut inbound: InboundReader,
  world: SharedWorld,
  replies: ReplySender,
  keep_running: Arc<AtomicBool>,
) -> io::Result<(thread::JoinHandle<()>, Arc<Waker>)> {
  let mut poll = Poll::new()?;
  let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
  mio::event::Source::register(&mut inbound, poll.registry(), INBOUND, mio::Interest::READABLE)?;

  let handle = thread::Builder::new()
    .name("dispatcher".to_string())
    .spawn(move || {
      let mut events = Events::with_capacity(8);
      while keep_running.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, None) {
          if e.kind() == io::ErrorKind::Interrupted {
            continue;
          }
          error!("dispatcher poll: {e}");
          break;
        }
        for request in inbound.drain() {
          let mut world = world.lock().unwrap();
          if let Some(reply) = handle_request(&mut world, &request) {
            replies.send(request.client_pid, &reply);
          }
          debug_assert!(world.check_invariants().is_ok());
        }
      }
    })?;
  Ok((handle, waker))
}

/// Route one request to its handler. Called under the world lock.
pub fn handle_request(world: &mut World, request: &Request) -> Option<Reply> {
  trace!(
    "pedido {:?} de {} (PID {})",
    request.kind,
    request.client_name,
    request.client_pid
  );
  match request.kind {
    RequestKind::Login => Some(handle_login(world, request)),
    RequestKind::Ride => Some(handle_ride(world, request)),
    RequestKind::Cancel => Some(handle_cancel(world, request)),
    RequestKind::Consult => Some(handle_consult(world, request)),
    RequestKind::Terminate => handle_terminate(world, request),
  }
}

fn handle_login(world: &mut World, request: &Request) -> Reply {
  if request.client_name.is_empty() {
    return Reply::fail("Nome inválido");
  }
  if world.clients.iter().any(|c| c.name == request.client_name) {
    info!("Login falhou para {}: nome em uso.", request.client_name);
    return Reply::fail("Username em uso");
  }
  if world.client_by_pid(request.client_pid).is_some() {
    return Reply::fail("Sessão já ativa");
  }
  if world.clients.len() >= world.max_clients {
    info!("Login falhou para {}: servidor cheio.", request.client_name);
    return Reply::fail("Servidor cheio");
  }

  world.clients.push(Client {
    pid: request.client_pid,
    name: request.client_name.clone(),
    status: ClientStatus::Waiting,
  });
  info!(
    "Cliente {} (PID {}) logado com sucesso. Ativos: {}",
    request.client_name,
    request.client_pid,
    world.clients.len()
  );
  Reply::ok("Bem-vindo!")
}

fn handle_ride(world: &mut World, request: &Request) -> Reply {
  // "<hora> <local> <distancia>"; surplus tokens are ignored, like the
  // original scanf-based parser.
  let mut fields = request.data.split_whitespace();
  let parsed = match (fields.next(), fields.next(), fields.next()) {
    (Some(hour), Some(origin), Some(distance)) => {
      match (hour.parse::<i64>(), distance.parse::<f64>()) {
        (Ok(hour), Ok(distance)) if distance > 0.0 => Some((hour, origin, distance)),
        _ => None,
      }
    }
    _ => None,
  };
  let Some((hour, origin, distance_km)) = parsed else {
    return Reply::fail("Formato inválido. Use: agendar <hora> <local> <distancia>");
  };

  if world.services.len() >= world.max_services {
    return Reply::fail("Limite de serviços atingido");
  }
  // Anything before the current second is in the past; anything beyond u32
  // is nonsense from the same family.
  let scheduled_time = match u32::try_from(hour) {
    Ok(h) if h >= world.sim_time => h,
    _ => {
      return Reply::fail(format!(
        "Hora inválida. Deve ser no futuro. (Hora atual é {})",
        world.sim_time
      ));
    }
  };
  if world.has_open_service(request.client_pid) {
    return Reply::fail("Já tem uma viagem agendada ou em progresso. Aguarde a conclusão.");
  }

  let id = world.allocate_service_id();
  world.services.push(Service {
    id,
    client_pid: request.client_pid,
    client_name: request.client_name.clone(),
    scheduled_time,
    origin: truncate(origin, 99),
    destination: String::new(),
    distance_km,
    vehicle: None,
    status: ServiceStatus::Scheduled,
  });
  info!(
    "Serviço ID {id} agendado para {} (hora: {scheduled_time}, dist: {distance_km:.1}km)",
    request.client_name
  );
  Reply::ok(format!(
    "Serviço agendado com ID {id} para {}",
    format_sim_time(scheduled_time)
  ))
}

fn handle_cancel(world: &mut World, request: &Request) -> Reply {
  let Ok(service_id) = request.data.trim().parse::<u32>() else {
    return Reply::fail("Formato inválido. Use: cancelar <id>");
  };

  if service_id == 0 {
    // Every SCHEDULED service of the caller. In-progress rides are out of
    // reach of the client path.
    let mut cancelled = 0;
    for service in &mut world.services {
      if service.client_pid == request.client_pid && service.status == ServiceStatus::Scheduled {
        service.status = ServiceStatus::Cancelled;
        cancelled += 1;
      }
    }
    info!("{} cancelou {cancelled} serviço(s)", request.client_name);
    return Reply::ok(format!("{cancelled} serviço(s) cancelado(s)"));
  }

  let Some(service) = world
    .services
    .iter_mut()
    .find(|s| s.id == ServiceId(service_id) && s.client_pid == request.client_pid)
  else {
    return Reply::fail("Serviço não encontrado ou não pertence a si");
  };
  if service.status != ServiceStatus::Scheduled {
    return Reply::fail("Serviço não pode ser cancelado (já em execução ou concluído)");
  }
  service.status = ServiceStatus::Cancelled;
  info!("Serviço ID {service_id} cancelado por {}", request.client_name);
  Reply::ok("Serviço cancelado com sucesso")
}

fn handle_consult(world: &World, request: &Request) -> Reply {
  let mut listing = String::from("[SERVIÇOS]\n");
  let mut count = 0;
  for service in &world.services {
    if service.client_pid != request.client_pid || service.status.is_terminal() {
      continue;
    }
    let status = match service.status {
      ServiceStatus::Scheduled => "AGENDADO",
      _ => "EM CURSO",
    };
    listing.push_str(&format!(
      "ID:{} | {} | {} ({:.1}km) | {status}\n",
      service.id,
      format_sim_time(service.scheduled_time),
      service.origin,
      service.distance_km
    ));
    count += 1;
  }
  if count == 0 {
    return Reply::ok("Não tem serviços agendados");
  }
  Reply::ok(listing)
}

// No reply at all for a pid we never saw; a half-dead client re-sending
// TERMINATE should not grow the reply channel traffic.
fn handle_terminate(world: &mut World, request: &Request) -> Option<Reply> {
  let client = world.client_by_pid(request.client_pid)?;
  if client.status == ClientStatus::OnTrip {
    info!("{} tentou sair mas está em viagem", request.client_name);
    return Some(Reply::fail("Não pode sair. Está em viagem!"));
  }

  let mut cancelled = 0;
  for service in &mut world.services {
    if service.client_pid == request.client_pid && service.status == ServiceStatus::Scheduled {
      service.status = ServiceStatus::Cancelled;
      cancelled += 1;
    }
  }
  if cancelled > 0 {
    info!(
      "{cancelled} serviço(s) agendado(s) cancelado(s) para {}",
      request.client_name
    );
  }
  world.clients.retain(|c| c.pid != request.client_pid);
  info!("Cliente {} saiu. Ativos: {}", request.client_name, world.clients.len());
  Some(Reply::ok("Até breve!"))
}

fn truncate(s: &str, max: usize) -> String {
  let mut end = s.len().min(max);
  while end > 0 && !s.is_char_boundary(end) {
    end -= 1;
  }
  s[..end].to_string()
}
