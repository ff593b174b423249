use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use anyhow::anyhow;
#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use gnssntpd::config::SECTOR_SIZE;
use gnssntpd::controller::SystemController;
use gnssntpd::platform::host::{FileFlash, GnssSimulator, HostMonotonic, HostUdpTransport};
use gnssntpd::status::SystemStatus;
use gnssntpd::traits::AlwaysStablePower;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "GNSS-disciplined Stratum-1 NTP server (host bench mode)", long_about = None)]
struct Args {
    /// UDP port to serve NTP on (123 needs privileges).
    #[arg(long, default_value_t = 123)]
    port: u16,

    /// Address to bind the NTP socket to.
    #[arg(long, default_value = "0.0.0.0")]
    bind: Ipv4Addr,

    /// Path of the file standing in for the config flash sector.
    #[arg(long, default_value = "gnssntpd.flash")]
    flash_image: PathBuf,

    /// Print the status snapshot every N seconds (0 disables).
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

fn enable_realtime_priority() {
    #[cfg(unix)]
    {
        unsafe {
            let param = libc::sched_param { sched_priority: 50 };
            if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 {
                info!("Realtime priority (SCHED_FIFO, 50) enabled.");
            } else {
                warn!(
                    "Failed to set realtime priority: {}. Timestamp jitter may suffer.",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

fn acquire_singleton_lock() -> Result<File> {
    #[cfg(unix)]
    {
        let lock_path = "/tmp/gnssntpd.lock";
        let file = File::create(lock_path)
            .map_err(|e| anyhow!("Failed to create lock file {}: {}", lock_path, e))?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => Ok(file),
            Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
                "Another instance of gnssntpd is already running! (Lockfile: {})",
                lock_path
            )),
            Err(e) => Err(e.into()),
        }
    }
    #[cfg(not(unix))]
    {
        Ok(File::create("gnssntpd.lock")?)
    }
}

fn notify_status(status: &SystemStatus) {
    #[cfg(unix)]
    {
        let line = format!(
            "v{} | {:?} | stratum {} | {} responses",
            env!("CARGO_PKG_VERSION"),
            status.state,
            status.stratum,
            status.ntp.responses_sent
        );
        let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Status(&line)]);
    }
    #[cfg(not(unix))]
    let _ = status;
}

fn run(args: Args, running: Arc<AtomicBool>) -> Result<()> {
    let mono = HostMonotonic::new();
    let transport = HostUdpTransport::bind(args.bind, args.port)?;
    let flash = FileFlash::open(&args.flash_image, SECTOR_SIZE)?;
    let (event_tx, event_rx) = channel();
    let status_shared = Arc::new(RwLock::new(SystemStatus::default()));

    let mut gnss = GnssSimulator::new();
    // The simulator shares the controller's tick origin, so edge instants
    // land on the same timeline the clock extrapolates from.
    let sim_mono = mono;
    let mut controller = SystemController::new(
        mono,
        transport,
        flash,
        AlwaysStablePower,
        event_rx,
        status_shared.clone(),
    );

    #[cfg(unix)]
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);

    info!("Serving NTP on {}:{}", args.bind, args.port);

    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        gnss.pump(&sim_mono, &event_tx);
        controller.run_iteration();

        if controller.restart_requested() {
            error!("Supervisor requested restart, exiting.");
            break;
        }

        if args.status_interval > 0
            && last_report.elapsed() >= Duration::from_secs(args.status_interval)
        {
            last_report = Instant::now();
            if let Ok(status) = status_shared.read() {
                info!(
                    "{:?} health={} stratum={} pps={} served={} limited={} avg={:.0}us",
                    status.state,
                    status.composite_health,
                    status.stratum,
                    status.pps_state,
                    status.ntp.responses_sent,
                    status.ntp.rate_limited,
                    status.ntp.avg_processing_us
                );
                notify_status(&status);
            }
        }

        thread::sleep(Duration::from_millis(1));
    }

    info!("Main loop exiting in state {:?}.", controller.state());
    #[cfg(unix)]
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .format_target(false)
        .init();

    info!("gnssntpd v{}", env!("CARGO_PKG_VERSION"));

    let _lock_file = match acquire_singleton_lock() {
        Ok(file) => file,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    enable_realtime_priority();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    run(args, running)
}
