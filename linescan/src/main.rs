mod config;
mod pnm;
mod scan;

use anyhow::{anyhow, Context};
use argh::FromArgs;
use config::{Config, SchedulerKind};
use liblinescan::{
    profile::find_model,
    sim::{SimConfig, SimulatedScanner},
    store::CalibrationStore,
    Backend, Scheduler,
};
use log::Level;
use scan::{Page, ScanJob, ScanState};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process,
    sync::Arc,
};
use tokio::sync::oneshot;

#[derive(FromArgs)]
/// Calibrated line-scan acquisition
struct Args {
    /// path to config
    #[argh(option)]
    config: PathBuf,

    /// where to write the scanned page as PNM
    #[argh(option, default = "PathBuf::from(\"scan.pnm\")")]
    output: PathBuf,

    /// device to scan from, overrides the config
    #[argh(option)]
    device: Option<String>,

    /// list attached devices and their options, then exit
    #[argh(switch)]
    list: bool,

    /// enable extra logs
    #[argh(switch)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args: Args = argh::from_env();

    let level = if args.verbose { Level::Trace } else { Level::Info };
    if let Err(err) = simple_logger::init_with_level(level) {
        eprintln!("Failed to init logger: {err}");
    }

    hello(&args);

    let config = match Config::read_from(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("Failed to read config: {err:#}");
            process::exit(1);
        }
    };

    if args.verbose {
        log::debug!("Use config {config:#?}");
    }

    if let Err(err) = run(args, config).await {
        log::error!("{err:#}");
        process::exit(1);
    }
}

fn hello(args: &Args) {
    log::info!(
        "{bin} version {version}, commit {commit}, config from {config_path}, verbose {verbose}",
        bin = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_HASH"),
        config_path = args.config.display(),
        verbose = if args.verbose { "on" } else { "off" },
    );
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let backend = build_backend(&config).context("attaching devices")?;

    if args.list {
        list_devices(&backend);
        return Ok(());
    }

    let device = args
        .device
        .or(config.scan.device.clone())
        .or_else(|| config.devices.first().map(|entry| entry.name.clone()))
        .ok_or_else(|| anyhow!("no device to scan from"))?;

    let job = ScanJob {
        backend: Arc::new(backend),
        device,
        options: config.scan.options.clone(),
    };

    let page = scan(job).await?;
    let Some(page) = page else {
        log::info!("Scan cancelled");
        return Ok(());
    };

    save_page(&args.output, &page).with_context(|| format!("writing '{}'", args.output.display()))?;
    log::info!(
        "Saved {}x{} page to {}",
        page.width,
        page.height,
        args.output.display()
    );

    Ok(())
}

fn build_backend(config: &Config) -> anyhow::Result<Backend> {
    let store = match &config.backend.calibration_dir {
        Some(dir) => Some(CalibrationStore::new(dir)),
        None => CalibrationStore::user_default(".linescan"),
    };
    let scheduler = match config.backend.scheduler {
        SchedulerKind::Thread => Scheduler::Thread,
        SchedulerKind::Tokio => Scheduler::current(),
    };

    let mut backend = Backend::new().with_store(store).with_scheduler(scheduler);

    for entry in &config.devices {
        let mut profile = find_model(&entry.model)
            .ok_or_else(|| anyhow!("unknown model '{}' for device '{}'", entry.model, entry.name))?;
        profile.apply(&entry.overrides);

        // Only the simulated transport ships with the front end.
        let sim = SimulatedScanner::new(SimConfig::for_profile(&profile));
        backend.attach(entry.name.as_str(), profile, sim.opener());
    }

    Ok(backend)
}

fn list_devices(backend: &Backend) {
    for device in backend.get_all_devices() {
        println!("{device}");

        let scanner = match backend.open(&device.name) {
            Ok(scanner) => scanner,
            Err(err) => {
                log::warn!("Failed to open {device}: {err}");
                continue;
            }
        };

        for option in scanner.options().into_iter().skip(1) {
            if option.name.is_empty() {
                println!("  {}:", option.title);
                continue;
            }

            let value = scanner
                .get_option(option.id)
                .map(|value| value.to_string())
                .unwrap_or_else(|_| "-".to_owned());
            let inactive = if option.is_active() { "" } else { " (inactive)" };
            println!("    --{} {value}{inactive}", option.name);
        }
    }
}

async fn scan(job: ScanJob) -> anyhow::Result<Option<Page>> {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let mut cancel_tx = Some(cancel_tx);
    let mut scan_state = scan::start(job, cancel_rx);

    loop {
        let state = tokio::select! {
            state = scan_state.recv() => state,
            signal = tokio::signal::ctrl_c(), if cancel_tx.is_some() => {
                if let Err(err) = signal {
                    log::warn!("Failed to listen for Ctrl-C: {err}");
                }
                log::info!("Cancelling scan");
                if let Some(cancel) = cancel_tx.take() {
                    _ = cancel.send(());
                }
                continue;
            }
        };

        match state {
            Some(ScanState::Prepare) => log::info!("Preparing scan"),
            Some(ScanState::Progress(progress)) => log::info!("Scan progress {progress:.0}%"),
            Some(ScanState::Done(page)) => return Ok(Some(page)),
            Some(ScanState::Error(err)) => return Err(err.context("scanning")),
            Some(ScanState::Cancelled) => return Ok(None),
            None => return Err(anyhow!("scan thread exited without a result")),
        }
    }
}

fn save_page(path: &Path, page: &Page) -> anyhow::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    pnm::write_page(&mut out, page)?;
    out.flush()?;
    Ok(())
}
