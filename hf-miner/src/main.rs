use hf_miner::{
    config::{SessionConfig, UsbConfig},
    daemon::Daemon,
    tracing::{self, prelude::*},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let session_config = SessionConfig::from_env();
    let usb_config = UsbConfig::from_env();
    debug!(?session_config, ?usb_config, "Configuration");

    let daemon = Daemon::new(session_config, usb_config);
    daemon.run().await
}
