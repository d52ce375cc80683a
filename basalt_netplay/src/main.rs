// CLI entry point for the Basalt dedicated server.
//
// Starts a standalone relay that game clients connect to. The server
// validates handshakes, relays order packets with the configured latency
// projection, and cross-checks sync hashes — it never runs the simulation.
// See `server.rs` for the networking architecture and `session.rs` for the
// lobby state.
//
// Usage:
//   basalt-server [OPTIONS]
//     --listen <ADDR>        Listen address, repeatable (default: 0.0.0.0:1889)
//     --name <NAME>          Server name (default: basalt-server)
//     --password <PASS>      Join password (optional)
//     --mod <ID>             Content id clients must match (default: basalt)
//     --game-version <V>     Version clients must match (default: dev)
//     --order-latency <N>    Frames of order delay (default: 3)
//     --ban <IP>             Banned address, repeatable
//     --require-auth         Only allow authenticated profiles
//     --no-spectators        Reject clients when all slots are taken
//     --slots <N>            Number of lobby slots (default: 4)
//     --replay <PATH>        Record the session to this file

use std::net::SocketAddr;
use std::time::Duration;

use basalt_netplay::replay::{ReplayRecorder, ReplaySink};
use basalt_netplay::server::{Collaborators, Server, ServerConfig, ServerState, ServerType};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config, replay_path) = parse_args();

    let replay: Option<Box<dyn ReplaySink>> = replay_path.map(|path| {
        match std::fs::File::create(&path) {
            Ok(file) => Box::new(ReplayRecorder::new(file)) as Box<dyn ReplaySink>,
            Err(e) => {
                eprintln!("Failed to create replay file {path}: {e}");
                std::process::exit(1);
            }
        }
    });
    let collaborators = Collaborators {
        replay,
        ..Collaborators::default()
    };

    let handle = match Server::start(config, collaborators) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    for addr in handle.local_addrs() {
        println!("Listening on {addr}");
    }
    println!("Press Ctrl+C to stop.");

    // The event loop runs on its own threads; park here until the session
    // ends itself or the process is killed (the default SIGINT/SIGTERM exit
    // is fine for a relay).
    loop {
        if handle.state() == ServerState::ShuttingDown {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    handle.join();
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching —
/// no clap dependency.
fn parse_args() -> (ServerConfig, Option<String>) {
    let mut config = ServerConfig {
        server_type: ServerType::Dedicated,
        order_latency: 3,
        ..ServerConfig::default()
    };
    let mut replay_path = None;
    let mut listen: Vec<SocketAddr> = Vec::new();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" => {
                i += 1;
                let addr = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--listen requires a valid socket address");
                    std::process::exit(1);
                });
                listen.push(addr);
            }
            "--name" => {
                i += 1;
                config.name = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--name requires a value");
                    std::process::exit(1);
                });
            }
            "--password" => {
                i += 1;
                config.password = args.get(i).cloned().or_else(|| {
                    eprintln!("--password requires a value");
                    std::process::exit(1);
                });
            }
            "--mod" => {
                i += 1;
                config.mod_id = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--mod requires a value");
                    std::process::exit(1);
                });
            }
            "--game-version" => {
                i += 1;
                config.version = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--game-version requires a value");
                    std::process::exit(1);
                });
            }
            "--order-latency" => {
                i += 1;
                config.order_latency =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--order-latency requires a valid number");
                        std::process::exit(1);
                    });
            }
            "--ban" => {
                i += 1;
                match args.get(i) {
                    Some(ip) => config.banned_ips.push(ip.clone()),
                    None => {
                        eprintln!("--ban requires an address");
                        std::process::exit(1);
                    }
                }
            }
            "--require-auth" => config.require_authentication = true,
            "--no-spectators" => config.allow_spectators = false,
            "--slots" => {
                i += 1;
                let count: usize = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--slots requires a valid number");
                    std::process::exit(1);
                });
                config.slots = (0..count).map(|n| format!("slot{n}")).collect();
            }
            "--replay" => {
                i += 1;
                replay_path = args.get(i).cloned().or_else(|| {
                    eprintln!("--replay requires a path");
                    std::process::exit(1);
                });
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    if listen.is_empty() {
        listen.push("0.0.0.0:1889".parse().unwrap_or_else(|_| {
            eprintln!("default listen address is invalid");
            std::process::exit(1);
        }));
    }
    config.listen_addrs = listen;

    (config, replay_path)
}

fn print_usage() {
    println!("Usage: basalt-server [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --listen <ADDR>        Listen address, repeatable (default: 0.0.0.0:1889)");
    println!("  --name <NAME>          Server name (default: basalt-server)");
    println!("  --password <PASS>      Join password (optional)");
    println!("  --mod <ID>             Content id clients must match (default: basalt)");
    println!("  --game-version <V>     Version clients must match (default: dev)");
    println!("  --order-latency <N>    Frames of order delay (default: 3)");
    println!("  --ban <IP>             Banned address, repeatable");
    println!("  --require-auth         Only allow authenticated profiles");
    println!("  --no-spectators        Reject clients when all slots are taken");
    println!("  --slots <N>            Number of lobby slots (default: 4)");
    println!("  --replay <PATH>        Record the session to this file");
    println!("  --help, -h             Show this help");
}
