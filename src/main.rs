mod blueprint;
mod capability;
mod combat;
mod config;
mod console;
mod containers;
mod driver;
mod error;
mod file_watcher;
mod instances;
mod persistence;
mod sandbox;
mod scheduler;
mod state_store;
mod validator;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use blueprint::{BlueprintId, DirectorySource, SourceProvider};
use config::DriverConfig;
use driver::Driver;
use file_watcher::WatchEvent;

struct Args {
    config: Option<PathBuf>,
    world: Option<PathBuf>,
    check: Option<String>,
}

fn usage_and_exit() -> ! {
    eprintln!("usage: mudriver [--config <path>] [--world <dir>] [--check <blueprint>]");
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut args = Args {
        config: None,
        world: None,
        check: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = || it.next().unwrap_or_else(|| usage_and_exit());
        match arg.as_str() {
            "--config" => args.config = Some(value().into()),
            "--world" => args.world = Some(value().into()),
            "--check" => args.check = Some(value()),
            _ => usage_and_exit(),
        }
    }
    args
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let config_path = args.config.unwrap_or_else(DriverConfig::default_path);
    let mut config = match DriverConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };
    if let Some(world) = args.world {
        config.world_dir = world;
    }

    let source = DirectorySource::new(config.world_dir.clone());
    if let Some(blueprint) = args.check {
        return check(config, source, &BlueprintId::from(blueprint.as_str()));
    }
    run(config, source);
    ExitCode::SUCCESS
}

/// Compiles and screens one blueprint without running any of its hooks.
fn check(config: DriverConfig, source: DirectorySource, blueprint: &BlueprintId) -> ExitCode {
    let mut driver = Driver::new(config, Box::new(source));
    match driver.ensure_loaded(blueprint) {
        Ok(module) => {
            println!(
                "{}: ok ({} handlers, capabilities: {})",
                module.type_name(),
                module.handlers().len(),
                module.capabilities().labels().join(", ")
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: DriverConfig, source: DirectorySource) {
    let tick = Duration::from_millis(config.tick_ms);
    let (console_state, console_requests) = console::channel();
    console::spawn(&config, console_state);

    let watcher = if config.watch_sources {
        match file_watcher::watch(&config.world_dir) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!(error = %err, dir = %config.world_dir.display(), "source watching disabled");
                None
            }
        }
    } else {
        None
    };

    let known = source.list();
    let mut driver = Driver::new(config, Box::new(source));
    let mut loaded = 0;
    for id in &known {
        if driver.ensure_loaded(id).is_ok() {
            loaded += 1;
        }
    }
    tracing::info!(blueprints = known.len(), loaded, "driver started");

    let mut next_tick = Instant::now() + tick;
    loop {
        console::serve_pending(&mut driver, &console_requests);

        if let Some(watcher) = &watcher {
            for event in watcher.events().try_iter() {
                let WatchEvent::SourceChanged(id) = event;
                if !driver.blueprints().is_active(&id) {
                    continue;
                }
                if let Err(err) = driver.reload(&id, false) {
                    tracing::warn!(blueprint = %id, error = %err, "reload after edit failed");
                }
            }
        }

        let report = driver.tick(tick.as_millis() as u64);
        tracing::trace!(?report, "tick");
        for message in driver.drain_outbox() {
            tracing::debug!(target: "outbox", to = %message.recipient, "{}", message.text);
        }

        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        }
        next_tick += tick;
    }
}
