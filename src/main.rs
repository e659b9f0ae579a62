pub mod actuator;
pub mod command;
pub mod config;
pub mod identity;
pub mod mqtt;
pub mod net;
pub mod supervisor;

use crate::actuator::GpioRelayBank;
use crate::command::CommandDispatcher;
use crate::config::Config;
use crate::identity::DeviceIdentity;
use crate::mqtt::MqttBrokerSession;
use crate::net::{NetworkSession, NmcliStation};
use crate::supervisor::{supervise, ProcessReset, Supervisor};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    setup()?;

    let config = Config::load()?;
    if config.broker.host.is_empty() {
        warn!("Broker host is not configured; bring-up will exhaust its budget");
    }

    let identity = DeviceIdentity::detect();
    info!("Device identity: {}", identity);

    // Relais zuerst beanspruchen - ohne Ausgänge ist alles andere sinnlos
    let relays = GpioRelayBank::from_pins(&config.actuators)
        .map_err(|e| eyre!("Failed to claim relay outputs: {}", e))?;
    let dispatcher = CommandDispatcher::new(Box::new(relays));

    let station = NmcliStation::new(config.network.interface.clone());
    let network = NetworkSession::new(
        station,
        config.network.clone(),
        config.supervisor.join_timeout(),
        config.supervisor.join_poll(),
    );
    let broker = MqttBrokerSession::new(config.broker.clone(), identity);

    let supervisor = Supervisor::create(
        Box::new(network),
        Box::new(broker),
        dispatcher,
        config.supervisor.clone(),
        config.broker.ping_interval(),
    );

    // Runs until every budget is exhausted; only the terminal state returns.
    let fatal = supervise(supervisor);
    fatal.restart(&mut ProcessReset);

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
