use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use folio_cache::server::{self, LogEvents};
use folio_cache::{
    AppConfig, CacheRouter, CacheStorage, DiskStorage, HttpNetwork, Registration, ServiceWorker,
};
use tokio_util::sync::CancellationToken;

fn print_usage() {
    eprintln!("Usage: folio [COMMAND] [OPTIONS]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve               Install the worker and serve the site through it (default)");
    eprintln!("  install             Install and activate the worker, then exit");
    eprintln!("  status              Print entry counts for every cache partition");
    eprintln!("  clear               Delete every cache partition");
    eprintln!("  init <PATH>         Write the default configuration to PATH");
    eprintln!("  version             Print the worker version");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH> Configuration file (TOML)");
    eprintln!("  --origin <URL>      Site origin to route for");
    eprintln!("  --host <HOST>       Bind address (default: 127.0.0.1)");
    eprintln!("  --port <PORT>       Bind port (default: 8787)");
    eprintln!("  --cache-dir <DIR>   Cache storage directory");
    eprintln!("  -h, --help          Show this help");
}

#[derive(Debug, Default)]
struct Args {
    command: Option<String>,
    positional: Vec<String>,
    config: Option<PathBuf>,
    origin: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    cache_dir: Option<PathBuf>,
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut parsed = Args::default();

    let value = |i: usize, flag: &str| -> String {
        args.get(i).cloned().unwrap_or_else(|| {
            eprintln!("Error: {flag} requires a value");
            std::process::exit(1);
        })
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                parsed.config = Some(PathBuf::from(value(i, "--config")));
            }
            "--origin" => {
                i += 1;
                parsed.origin = Some(value(i, "--origin"));
            }
            "--host" => {
                i += 1;
                parsed.host = Some(value(i, "--host"));
            }
            "--port" => {
                i += 1;
                let raw = value(i, "--port");
                parsed.port = Some(raw.parse().unwrap_or_else(|_| {
                    eprintln!("Error: invalid port: {raw}");
                    std::process::exit(1);
                }));
            }
            "--cache-dir" => {
                i += 1;
                parsed.cache_dir = Some(PathBuf::from(value(i, "--cache-dir")));
            }
            flag if flag.starts_with('-') => {
                eprintln!("Error: unknown option {flag}");
                print_usage();
                std::process::exit(1);
            }
            arg => {
                if parsed.command.is_none() {
                    parsed.command = Some(arg.to_string());
                } else {
                    parsed.positional.push(arg.to_string());
                }
            }
        }
        i += 1;
    }
    parsed
}

fn load_config(args: &Args) -> folio_cache::Result<AppConfig> {
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(origin) = &args.origin {
        config.site.origin.clone_from(origin);
    }
    if let Some(host) = &args.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = &args.cache_dir {
        config.paths.cache_dir.clone_from(dir);
    }
    config.site.validate()?;
    Ok(config)
}

/// Builds a registration with one installed, active worker.
///
/// With `allow_restore`, a failed install falls back to the partitions a
/// previous run of the same version left on disk.
async fn start_worker(
    config: &AppConfig,
    allow_restore: bool,
) -> folio_cache::Result<(Arc<Registration>, Arc<HttpNetwork>)> {
    let storage = Arc::new(DiskStorage::open_at(&config.paths.cache_dir).await?);
    let network = Arc::new(HttpNetwork::new(config.site.origin_url()?)?);
    let scope = config.site.scope_url()?;

    let new_worker = || -> folio_cache::Result<Arc<ServiceWorker>> {
        let router = CacheRouter::new(
            config.site.clone(),
            Arc::clone(&storage),
            Arc::clone(&network),
        )?;
        Ok(Arc::new(ServiceWorker::new(router)))
    };

    let registration = Arc::new(Registration::new(scope, Arc::new(LogEvents)));
    if let Err(e) = registration.register(new_worker()?).await {
        if !allow_restore {
            return Err(e);
        }
        log::warn!("Install failed ({e}); serving the cached version");
        registration.restore(new_worker()?).await?;
    }
    Ok((registration, network))
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                log::warn!("Failed to register SIGTERM handler: {e}");
                tokio::signal::ctrl_c().await.ok();
                log::info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Received SIGINT");
    }
}

async fn serve(config: AppConfig) -> folio_cache::Result<()> {
    let (registration, network) = start_worker(&config, true).await?;
    let listener = server::bind(&config.server.host, config.server.port).await?;
    let app = server::app(registration, network, config.site.origin_url()?);

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        shutdown.cancel();
    });

    server::serve(listener, app, token).await?;
    log::info!("Server stopped");
    Ok(())
}

async fn status(config: &AppConfig) -> folio_cache::Result<()> {
    let storage = DiskStorage::open_at(&config.paths.cache_dir).await?;
    let status = storage.status().await?;
    if status.is_empty() {
        println!("No caches in {}", storage.root().display());
        return Ok(());
    }
    let width = status.keys().map(String::len).max().unwrap_or(0);
    for (name, count) in &status {
        let marker = if config.site.partitions.contains(name) {
            ""
        } else {
            "  (stale)"
        };
        println!("{name:<width$}  {count:>5}{marker}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> folio_cache::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args();
    let config = load_config(&args)?;

    match args.command.as_deref().unwrap_or("serve") {
        "serve" => serve(config).await,
        "install" => {
            let (registration, _) = start_worker(&config, false).await?;
            if let Some(worker) = registration.active() {
                println!("Installed {} ({})", worker.version(), worker.id());
            }
            status(&config).await
        }
        "status" => status(&config).await,
        "clear" => {
            let storage = DiskStorage::open_at(&config.paths.cache_dir).await?;
            storage.clear().await?;
            println!("All caches cleared");
            Ok(())
        }
        "init" => {
            let Some(path) = args.positional.first() else {
                eprintln!("Error: init requires a path");
                std::process::exit(1);
            };
            AppConfig::default().save(Path::new(path))?;
            println!("Wrote {path}");
            Ok(())
        }
        "version" => {
            println!(
                "folio {} (cache {})",
                env!("CARGO_PKG_VERSION"),
                config.site.partitions.primary
            );
            Ok(())
        }
        other => {
            eprintln!("Error: unknown command {other}");
            print_usage();
            std::process::exit(1);
        }
    }
}
