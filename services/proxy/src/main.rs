// proxy: HTTP-to-relay tunnel daemon.
//
// Parses the CLI, assembles the runtime configuration, wires the optional
// file-change shutdown trigger, and runs the proxy.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use notify::Watcher;
use proxy::config::{self, ProxyConfig};
use tokio::sync::watch;
use tracing::{error, info, warn};

fn cli() -> Command {
    Command::new("nostr-proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tunnels HTTP requests through encrypted gift-wrapped relay events")
        .disable_help_flag(true)
        .arg(
            Arg::new("help")
                .long("help")
                .action(ArgAction::Help)
                .help("Print help"),
        )
        .arg(
            Arg::new("port")
                .help("TCP port to listen on")
                .short('p')
                .long("port")
                .value_parser(clap::value_parser!(u16))
                .required(true),
        )
        .arg(
            Arg::new("host")
                .help("Bind host")
                .short('h')
                .long("host")
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::new("backlog")
                .help("Listen backlog (accepted for compatibility; not applied)")
                .long("backlog")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("exclusive")
                .help("Exclusive bind (accepted for compatibility; not applied)")
                .long("exclusive")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("nodejs_http_options")
                .help("Opaque HTTP listener options as JSON (validated, then ignored)")
                .long("nodejs-http-options")
                .default_value("{}"),
        )
        .arg(
            Arg::new("relays")
                .help("Initial relay URLs (each element may hold several, whitespace-separated)")
                .long("relays")
                .num_args(1..),
        )
        .arg(
            Arg::new("relays_file")
                .help("Persisted relay list; non-empty file overrides --relays")
                .long("relays-file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("keep_host")
                .help("Preserve the Host header instead of stripping it")
                .long("keep-host")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("nsec_file")
                .help("Secret key file (bech32 nsec)")
                .long("nsec-file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("save_nsec")
                .help("Generate and save the nsec file when it does not exist")
                .long("save-nsec")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout")
                .help("Per-request timeout in milliseconds")
                .long("timeout")
                .default_value("300000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("destination")
                .help("Fixed npub or nprofile destination for every request")
                .long("destination"),
        )
        .arg(
            Arg::new("max_cached_relays")
                .help("Maximum number of cached hint relays")
                .long("max-cached-relays")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("exit_on_file_change")
                .help("Exit gracefully when the nsec or relays file changes")
                .long("exit-on-file-change")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .help("Verbose logging")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
}

fn build_config(matches: &clap::ArgMatches) -> Result<ProxyConfig, config::ConfigError> {
    let cli_relays: Vec<String> = matches
        .get_many::<String>("relays")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let relays_file = matches.get_one::<PathBuf>("relays_file").cloned();
    let relays = config::resolve_relays(&cli_relays, relays_file.as_deref())?;

    let http_options = matches
        .get_one::<String>("nodejs_http_options")
        .map(|raw| serde_json::from_str(raw))
        .expect("nodejs-http-options has a default")
        .map_err(config::ConfigError::BadHttpOptions)?;

    let destination = matches
        .get_one::<String>("destination")
        .map(|raw| np_codec::decode_destination(raw))
        .transpose()
        .map_err(config::ConfigError::BadDestination)?;

    Ok(ProxyConfig {
        host: matches.get_one::<String>("host").expect("host has a default").clone(),
        port: *matches.get_one::<u16>("port").expect("port is required"),
        backlog: matches.get_one::<u32>("backlog").copied(),
        exclusive: matches.get_flag("exclusive"),
        http_options,
        relays,
        keep_host: matches.get_flag("keep_host"),
        nsec_file: matches.get_one::<PathBuf>("nsec_file").cloned(),
        save_nsec: matches.get_flag("save_nsec"),
        timeout_ms: *matches.get_one::<u64>("timeout").expect("timeout has a default"),
        destination,
        max_cached_relays: *matches
            .get_one::<usize>("max_cached_relays")
            .expect("max-cached-relays has a default"),
        exit_on_file_change: matches.get_flag("exit_on_file_change"),
        relays_file,
        verbose: matches.get_flag("verbose"),
    })
}

/// Watch the nsec/relays files (via their parent directories, so files
/// created after startup are still covered) and trip the shutdown signal on
/// any change.
fn spawn_file_watcher(
    cfg: &ProxyConfig,
    shutdown_tx: watch::Sender<bool>,
) -> Option<notify::RecommendedWatcher> {
    let watched: Vec<PathBuf> = [cfg.nsec_file.as_ref(), cfg.relays_file.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|p| std::path::absolute(p).ok())
        .collect();
    if watched.is_empty() {
        warn!("--exit-on-file-change set but no nsec or relays file configured");
        return None;
    }

    let filter = watched.clone();
    let mut watcher = match notify::recommended_watcher(
        move |result: Result<notify::Event, notify::Error>| {
            let Ok(event) = result else { return };
            let relevant = event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
            if relevant && event.paths.iter().any(|p| filter.contains(p)) {
                info!(paths = ?event.paths, "watched file changed; shutting down");
                let _ = shutdown_tx.send(true);
            }
        },
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(error = %e, "file watcher unavailable");
            return None;
        }
    };

    for path in &watched {
        let dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        if let Err(e) = watcher.watch(&dir, notify::RecursiveMode::NonRecursive) {
            warn!(path = %dir.display(), error = %e, "cannot watch directory");
        }
    }
    Some(watcher)
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    let verbose = matches.get_flag("verbose");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" })
            }),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "proxy starting");

    let cfg = match build_config(&matches) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };
    if let Some(backlog) = cfg.backlog {
        info!(backlog, "--backlog accepted but not applied");
    }
    if cfg.exclusive {
        info!("--exclusive accepted but not applied");
    }
    if cfg.http_options.as_object().is_some_and(|o| !o.is_empty()) {
        info!(options = %cfg.http_options, "--nodejs-http-options accepted but not applied");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _watcher = if cfg.exit_on_file_change {
        spawn_file_watcher(&cfg, shutdown_tx)
    } else {
        None
    };

    // Once a shutdown starts, give the drain ten seconds before forcing.
    let mut watchdog_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        if watchdog_rx.changed().await.is_ok() {
            tokio::time::sleep(Duration::from_secs(10)).await;
            error!("shutdown did not drain in time; forcing exit");
            std::process::exit(-1);
        }
    });

    if let Err(e) = proxy::run(cfg, shutdown_rx).await {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }
}
