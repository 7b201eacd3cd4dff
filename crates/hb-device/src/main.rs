use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use clap::Parser;
use hb_action_log::ActionLog;
use hb_artifact_sink::{FileFlashSlot, FlashSlot};
use hb_device::bootloader::HostedBootloader;
use hb_device::identity::FileDeviceIdentity;
use hb_device::{config, scheduler};
use hb_session::{Session, SessionConfig};
use hb_transport::Transport;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hb-device", about = "hawkBit update client")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/hb-device/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "hb-device starting");

    let args = Args::parse();
    let cfg = match config::load_config_from_path(&args.config) {
        Ok(cfg) => {
            info!(host = %cfg.server.host, board = %cfg.server.board, "config loaded");
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let state_dir = Path::new(&cfg.action_log.sqlite_path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if let Err(e) = std::fs::create_dir_all(&state_dir) {
        eprintln!("FATAL: failed to create state directory {}: {e}", state_dir.display());
        std::process::exit(1);
    }

    let action_log = match ActionLog::open(Path::new(&cfg.action_log.sqlite_path)) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("FATAL: failed to open action log: {e}");
            std::process::exit(1);
        }
    };

    let bootloader = HostedBootloader::new(&state_dir);
    if !bootloader.is_confirmed().unwrap_or(false) {
        info!("running image is unconfirmed at startup, confirming and erasing spare bank");
        let _ = bootloader.confirm();
        let _ = bootloader.erase_bank();
    }

    let identity = FileDeviceIdentity::new(state_dir.join("device_id"));

    let transport = match Transport::new() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("FATAL: failed to build HTTP transport: {e}");
            std::process::exit(1);
        }
    };

    let spare_slot_path = PathBuf::from(cfg.spare_slot.path.clone());
    let spare_slot_size = cfg.spare_slot.size_bytes;
    let slot_factory = move |_declared_size: u64| {
        FileFlashSlot::create(&spare_slot_path).map(|s| Box::new(s) as Box<dyn FlashSlot>)
    };

    let scheme = if cfg.tls.enabled { "https" } else { "http" };
    let session_config = SessionConfig {
        json_url_root: format!(
            "{scheme}://{}:{}{}",
            cfg.server.host, cfg.server.port, cfg.server.json_url_root
        ),
        board: cfg.server.board.clone(),
        hw_revision: "3".to_owned(),
        spare_slot_size_bytes: spare_slot_size,
    };

    let poll_interval_ms = Arc::new(AtomicU32::new(cfg.poll_interval_minutes * 60 * 1000));

    let session = Session::new(
        Box::new(transport),
        action_log,
        Box::new(bootloader),
        Box::new(identity),
        Box::new(slot_factory),
        session_config,
        poll_interval_ms,
    );

    scheduler::run(session, || {
        info!("exiting process to stand in for a warm reboot");
        std::process::exit(0);
    })
    .await;
}
