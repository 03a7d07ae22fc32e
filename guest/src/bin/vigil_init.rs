//! vigil-init - the in-guest supervisor agent.
//!
//! Reads the guest configuration from a JSON key/value file, applies
//! hostname, networks and mounts, runs the configured sessions and serves
//! attach over a serial port until every session is done or it is told to
//! stop.
//!
//! Signals:
//!   SIGHUP         re-read the configuration file and reload
//!   SIGABRT        ask the hypervisor to fork this VM, then reload
//!   SIGTERM/SIGINT stop

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use vigil_attach::{AttachServer, SerialBackchannel};
use vigil_executor::{
    DataSink, EndpointWriter, Executor, ExecutorOptions, LinuxPlatform, Platform, spawn_guard,
};
use vigil_guest::loopback::setup_loopback;
use vigil_guest::{FileStore, Logging};
use vigil_mount::{BY_LABEL_DIR, LabelDir};
use vigil_net::dhcp::UdpClient;
use vigil_net::{IpCommand, NetworkEngine};

#[derive(Parser)]
#[command(name = "vigil-init")]
#[command(about = "In-guest session supervisor")]
struct Args {
    /// Guest configuration, a JSON object of keys to values
    #[arg(long, default_value = "/etc/vigil/guestinfo.json")]
    config: PathBuf,

    /// Filesystem root for pid files, /etc files and device paths
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Device or file that receives a copy of the agent log
    #[arg(long, default_value = "/dev/ttyS1")]
    debug_log: PathBuf,

    /// Write each session's output to <dir>/<id>.log instead of the agent's stdio
    #[arg(long)]
    session_log_dir: Option<PathBuf>,

    /// Serial device the attach server listens on
    #[arg(long, default_value = "/dev/ttyS2")]
    attach_port: PathBuf,

    /// Pid file directory, relative to the root
    #[arg(long, default_value = ".tether")]
    pidfile_dir: String,

    /// Command that asks the hypervisor to fork this VM
    #[arg(long, num_args = 1.., value_name = "ARGV")]
    fork_command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loopback = setup_loopback();
    let logging = Logging::init(Some(args.debug_log.clone()))?;
    info!(version = env!("CARGO_PKG_VERSION"), "vigil-init starting");
    if let Err(e) = loopback {
        warn!("unable to bring up lo: {}", e);
    }

    let store = Arc::new(FileStore::open(&args.config)?);
    info!("Using guest configuration {:?}", store.path());

    let netlink = IpCommand::new(&args.root).with_spawn_lock(Box::new(|| Box::new(spawn_guard())));
    let engine = NetworkEngine::new(Arc::new(netlink), Arc::new(UdpClient::new()), &args.root);
    engine.set_sink(Arc::new(EndpointWriter::new(store.clone())));

    let labels = LabelDir::new(args.root.join(BY_LABEL_DIR.trim_start_matches('/')));
    let mut platform = LinuxPlatform::new(&args.root, engine, labels).with_fork_command(args.fork_command);
    if let Some(dir) = &args.session_log_dir {
        platform = platform.with_log_dir(dir);
    }
    let platform: Arc<dyn Platform> = Arc::new(platform);

    let executor = Executor::new(
        ExecutorOptions {
            root: args.root.clone(),
            pidfile_dir: args.pidfile_dir,
            ..Default::default()
        },
        store.clone(),
        store.clone(),
        platform.clone(),
        logging,
    );
    let backchannel = Arc::new(SerialBackchannel::new(&args.attach_port));
    executor.register(Arc::new(AttachServer::new(platform, backchannel)));

    tokio::spawn(forks(executor.clone()));
    tokio::spawn(hangups(executor.clone(), store.clone()));
    tokio::spawn(terminations(executor.clone()));

    let result = executor.start().await;
    executor.stop().await;
    if let Err(e) = store.flush() {
        error!("failed to write back configuration: {}", e);
    }

    match result {
        Ok(()) => {
            info!("vigil-init exiting");
            Ok(())
        }
        Err(e) => {
            error!("executor failed: {}", e);
            Err(e.into())
        }
    }
}

/// Each SIGABRT asks the platform to fork the VM. A successful fork is
/// followed by a reload so the child picks up its new identity.
async fn forks(executor: Executor) {
    let mut aborts = match signal(SignalKind::from_raw(libc::SIGABRT)) {
        Ok(s) => s,
        Err(e) => {
            error!("unable to listen for SIGABRT: {}", e);
            return;
        }
    };
    let cancel = executor.cancel_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = aborts.recv() => {
                if received.is_none() {
                    return;
                }
                info!("Fork requested");
                match executor.platform().fork().await {
                    Ok(()) => executor.reload(),
                    Err(e) => error!("fork failed: {}", e),
                }
            }
        }
    }
}

async fn hangups(executor: Executor, store: Arc<FileStore>) {
    let mut hups = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("unable to listen for SIGHUP: {}", e);
            return;
        }
    };
    let cancel = executor.cancel_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = hups.recv() => {
                if received.is_none() {
                    return;
                }
                info!("Re-reading {:?}", store.path());
                match store.refresh() {
                    Ok(()) => executor.reload(),
                    Err(e) => error!("unable to re-read configuration: {}", e),
                }
            }
        }
    }
}

async fn terminations(executor: Executor) {
    let (mut term, mut int) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!("unable to listen for termination signals: {}", e);
            return;
        }
    };
    let cancel = executor.cancel_token();
    tokio::select! {
        _ = term.recv() => info!("SIGTERM received"),
        _ = int.recv() => info!("SIGINT received"),
        _ = cancel.cancelled() => return,
    }
    executor.stop().await;
}
