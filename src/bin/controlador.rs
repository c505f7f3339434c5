//! Controller entry point: system startup plus the line-based admin console.

use std::{
  io::{self, BufRead, Write},
  path::PathBuf,
  process::ExitCode,
  sync::Arc,
};

use clap::Parser;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use frota::{admin, Config, Controller};

/// Controlador da frota simulada.
///
/// Os clientes ligam-se pelo canal partilhado; este processo é apenas para o
/// administrador.
#[derive(Parser)]
#[command(version)]
struct Args {
  /// Diretório dos canais nomeados.
  #[arg(long, default_value = "/tmp")]
  channel_dir: PathBuf,

  /// Executável do veículo (por omissão, o `veiculo` ao lado deste binário).
  #[arg(long)]
  worker_exe: Option<PathBuf>,
}

fn main() -> ExitCode {
  env_logger::init();
  let args = Args::parse();

  let mut config = Config::from_env().with_channel_dir(&args.channel_dir);
  if let Some(worker_exe) = args.worker_exe {
    config.worker_exe = worker_exe;
  }

  let controller = match Controller::start(config) {
    Ok(controller) => controller,
    Err(e) => {
      eprintln!("[CONTROLADOR] Erro no arranque: {e}");
      return ExitCode::FAILURE;
    }
  };

  // CTRL+C behaves like `terminar`.
  {
    let controller = Arc::clone(&controller);
    if let Err(e) = ctrlc::set_handler(move || {
      controller.shutdown();
      std::process::exit(0);
    }) {
      warn!("instalação do handler de CTRL+C falhou: {e}");
    }
  }

  admin_loop(&controller);
  controller.shutdown();
  ExitCode::SUCCESS
}

fn admin_loop(controller: &Controller) {
  let stdin = io::stdin();
  let mut lines = stdin.lock().lines();
  while controller.is_running() {
    print!("CMD> ");
    let _ = io::stdout().flush();
    let Some(Ok(line)) = lines.next() else {
      break; // EOF on stdin ends the session like `terminar`
    };
    let line = line.trim();

    match line {
      "" => {}
      "terminar" => break,
      "listar" => print!("{}", admin::list_services(&controller.world().lock().unwrap())),
      "utiliz" => print!("{}", admin::list_clients(&controller.world().lock().unwrap())),
      "frota" => print!("{}", admin::fleet_status(&controller.world().lock().unwrap())),
      "km" => {
        let total = admin::total_km(&controller.world().lock().unwrap());
        println!("Quilómetros totais percorridos: {total:.2} km");
      }
      "hora" => {
        let world = controller.world().lock().unwrap();
        println!("Tempo simulado: {}", admin::current_time(&world));
      }
      _ => match line.strip_prefix("cancelar ").map(str::trim) {
        Some(id) => match id.parse::<u32>() {
          Ok(id) => {
            let outcome = controller.admin_cancel(id);
            if id == 0 || outcome.found {
              println!("{} serviço(s) cancelado(s).", outcome.cancelled);
            } else {
              println!("Serviço ID {id} não encontrado ou já finalizado.");
            }
          }
          Err(_) => println!("Uso: cancelar <id>"),
        },
        None => {
          println!("Comando desconhecido. Comandos disponíveis:");
          println!("  listar, utiliz, frota, cancelar <id>, km, hora, terminar");
        }
      },
    }
  }
}
