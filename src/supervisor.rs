//! Connection supervisor with statum state machine for session lifecycle.
//!
//! Owns the one mutable session record of the whole agent and coordinates
//! the network and broker sessions through it. States are enforced at
//! compile time; every transition is a consuming method on the state it
//! leaves.
//!
//! # State Machine
//!
//! ```text
//!            join ok              open+subscribe ok
//! Offline ───────────► NetworkUp ───────────────► BrokerUp ──► Running
//!    ▲  ▲                  │                                      │
//!    │  │   broker budget  │                                      │
//!    │  └──────────────────┘ (cycle counter +1)                   │
//!    │                                                            │
//!    └────────────────────── transport fault (recover) ───────────┘
//!
//! any budget exhausted ──► Restarting (terminal; external reset only)
//! ```
//!
//! # Recovery Policy
//!
//! Join retries, broker attempts per cycle, and the number of full bring-up
//! cycles are all bounded by [`SupervisorPolicy`]. A transport fault in
//! steady state is not counted against the restart budget: the counter only
//! grows when a full broker bring-up cycle fails, and reaching `Running`
//! resets it. Exhaustion ends in `Restarting`, whose only exit is the
//! [`SystemReset`] collaborator.

use chrono::{DateTime, Local};
use statum::{machine, state};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::command::CommandDispatcher;
use crate::config::SupervisorPolicy;
use crate::mqtt::{BrokerError, BrokerLink};
use crate::net::NetLink;

/// Mutable session record, owned exclusively by the supervisor.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub network_connected: bool,
    pub broker_connected: bool,
    /// When the last successful liveness ping completed
    pub last_ping: Option<Instant>,
    /// When the current broker session reached steady state
    pub connected_since: Option<DateTime<Local>>,
}

/// The restart collaborator: the terminal state's single idempotent exit.
pub trait SystemReset {
    fn restart(&mut self);
}

/// Production reset: end the process and let the service manager relaunch it.
pub struct ProcessReset;

impl SystemReset for ProcessReset {
    fn restart(&mut self) {
        error!("Restarting process; all session state is discarded");
        std::process::exit(1);
    }
}

/// Supervisor lifecycle states using statum
#[state]
#[derive(Debug, Clone)]
pub enum SupervisorState {
    Offline,    // No wireless association
    NetworkUp,  // Wireless link verified, no broker session
    BrokerUp,   // Broker session open and subscribed
    Running,    // Steady-state poll/ping loop
    Restarting, // Terminal, waiting for the external reset
}

/// Connection supervisor with compile-time state safety via statum.
///
/// Collaborators come in behind trait objects so the machine can be driven
/// against scripted sessions in tests exactly as against hardware.
#[machine]
pub struct Supervisor<S: SupervisorState> {
    net: Box<dyn NetLink>,
    broker: Box<dyn BrokerLink>,
    dispatcher: CommandDispatcher,
    policy: SupervisorPolicy,
    ping_interval: Duration,
    session: SessionState,
    cycles: u32,
}

impl<S: SupervisorState> Supervisor<S> {
    pub fn session(&self) -> &SessionState {
        &self.session
    }
}

/// Result of the network bring-up stage.
pub enum NetworkOutcome {
    Up(Supervisor<NetworkUp>),
    Fatal(Supervisor<Restarting>),
}

/// Result of the broker bring-up stage.
pub enum BrokerOutcome {
    Up(Supervisor<BrokerUp>),
    Retry(Supervisor<Offline>),
    Fatal(Supervisor<Restarting>),
}

impl Supervisor<Offline> {
    pub fn create(
        net: Box<dyn NetLink>,
        broker: Box<dyn BrokerLink>,
        dispatcher: CommandDispatcher,
        policy: SupervisorPolicy,
        ping_interval: Duration,
    ) -> Self {
        info!("Initializing connection supervisor");
        Self::new(
            net,
            broker,
            dispatcher,
            policy,
            ping_interval,
            SessionState::default(),
            0, // cycles
        )
    }

    /// Brings the wireless link up within the join budget.
    ///
    /// Budget exhaustion is fatal network failure: the device cannot do
    /// anything useful without a link, so the machine goes terminal.
    pub fn establish_network(mut self) -> NetworkOutcome {
        for attempt in 1..=self.policy.join_attempts {
            if self.net.is_joined() {
                debug!("Wireless link already up");
                self.session.network_connected = true;
                return NetworkOutcome::Up(self.transition());
            }
            match self.net.join() {
                Ok(()) => {
                    info!(
                        "Network link established (attempt {}/{})",
                        attempt, self.policy.join_attempts
                    );
                    self.session.network_connected = true;
                    return NetworkOutcome::Up(self.transition());
                }
                Err(e) => {
                    warn!(
                        "Network join attempt {}/{} failed: {}",
                        attempt, self.policy.join_attempts, e
                    );
                    if attempt < self.policy.join_attempts {
                        thread::sleep(self.policy.retry_delay());
                    }
                }
            }
        }

        error!("Network join budget exhausted; requesting restart");
        self.session.network_connected = false;
        NetworkOutcome::Fatal(self.transition())
    }
}

impl Supervisor<NetworkUp> {
    /// Opens and subscribes the broker session within the attempt budget.
    ///
    /// Every attempt re-verifies the network link first and rejoins if it
    /// dropped. Budget exhaustion burns one bring-up cycle; exhausting the
    /// cycle budget is terminal.
    pub fn establish_broker(mut self) -> BrokerOutcome {
        for attempt in 1..=self.policy.broker_attempts {
            if !self.net.is_joined() {
                self.session.network_connected = false;
                warn!("Network link dropped during broker bring-up, rejoining");
                match self.net.leave_and_rejoin() {
                    Ok(()) => self.session.network_connected = true,
                    Err(e) => {
                        warn!("Rejoin failed: {}", e);
                        thread::sleep(self.policy.retry_delay());
                        continue;
                    }
                }
            }

            match self.try_broker_session() {
                Ok(()) => {
                    info!(
                        "Broker session up (attempt {}/{})",
                        attempt, self.policy.broker_attempts
                    );
                    self.session.broker_connected = true;
                    return BrokerOutcome::Up(self.transition());
                }
                Err(e) => {
                    self.describe_broker_failure(&e, attempt);
                    self.broker.close();
                    if attempt < self.policy.broker_attempts {
                        thread::sleep(self.policy.retry_delay());
                    }
                }
            }
        }

        self.cycles += 1;
        self.session.broker_connected = false;
        if self.cycles >= self.policy.max_bringup_cycles {
            error!(
                "Bring-up budget exhausted after {} cycles; requesting restart",
                self.cycles
            );
            BrokerOutcome::Fatal(self.transition())
        } else {
            warn!(
                "Broker bring-up failed; restarting sequence (cycle {}/{})",
                self.cycles, self.policy.max_bringup_cycles
            );
            BrokerOutcome::Retry(self.transition())
        }
    }

    fn try_broker_session(&mut self) -> Result<(), BrokerError> {
        self.broker.open()?;
        self.broker.subscribe()
    }

    /// Reachability problems and broker verdicts get different diagnostics;
    /// the retry policy is the same for both.
    fn describe_broker_failure(&self, error: &BrokerError, attempt: u32) {
        if error.is_reachability() {
            warn!(
                "Broker attempt {}/{} failed on the network path: {}",
                attempt, self.policy.broker_attempts, error
            );
        } else {
            error!(
                "Broker attempt {}/{} rejected: {}; check credentials and client id",
                attempt, self.policy.broker_attempts, error
            );
        }
    }
}

impl Supervisor<BrokerUp> {
    /// Stamps the session record and enters the steady-state loop.
    pub fn enter_steady_state(mut self) -> Supervisor<Running> {
        self.cycles = 0;
        self.session.last_ping = Some(Instant::now());
        self.session.connected_since = Some(Local::now());
        info!("Entering steady-state command loop");
        self.transition()
    }
}

impl Supervisor<Running> {
    /// The steady-state loop: drain, dispatch, ping, yield.
    ///
    /// Returns only on a transport fault, after tearing the broker session
    /// down. The caller re-runs the bring-up sequence.
    pub fn run(mut self) -> Supervisor<Offline> {
        loop {
            match self.broker.poll_incoming() {
                Ok(payloads) => {
                    for payload in payloads {
                        self.dispatcher.dispatch(&payload);
                    }
                }
                Err(e) => {
                    warn!("Transport fault while draining messages: {}", e);
                    return self.recover();
                }
            }

            if self.ping_due() {
                match self.broker.ping() {
                    Ok(()) => {
                        debug!("Liveness ping sent");
                        self.session.last_ping = Some(Instant::now());
                    }
                    Err(e) => {
                        warn!("Liveness ping failed: {}", e);
                        return self.recover();
                    }
                }
            }

            thread::sleep(self.policy.loop_yield());
        }
    }

    fn ping_due(&self) -> bool {
        match self.session.last_ping {
            Some(stamp) => stamp.elapsed() >= self.ping_interval,
            None => true,
        }
    }

    fn recover(mut self) -> Supervisor<Offline> {
        if let Some(since) = self.session.connected_since {
            let held = Local::now().signed_duration_since(since);
            info!("Broker session held for {}s before the fault", held.num_seconds());
        }
        self.broker.close();
        self.session.broker_connected = false;
        self.session.connected_since = None;
        info!("Recovering: re-validating network and rebuilding the broker session");
        self.transition()
    }
}

impl Supervisor<Restarting> {
    /// The terminal state's only exit.
    pub fn restart(mut self, reset: &mut dyn SystemReset) {
        self.broker.close();
        error!("Connection supervisor is out of options; requesting restart");
        reset.restart();
    }
}

/// Drives the supervisor until a budget exhausts.
///
/// This is the whole control flow of the agent: bring the network up, bring
/// the broker up, run until a fault, repeat. Only the terminal machine comes
/// back out.
pub fn supervise(mut supervisor: Supervisor<Offline>) -> Supervisor<Restarting> {
    loop {
        let network_up = match supervisor.establish_network() {
            NetworkOutcome::Up(s) => s,
            NetworkOutcome::Fatal(s) => return s,
        };
        let broker_up = match network_up.establish_broker() {
            BrokerOutcome::Up(s) => s,
            BrokerOutcome::Retry(s) => {
                supervisor = s;
                continue;
            }
            BrokerOutcome::Fatal(s) => return s,
        };
        supervisor = broker_up.enter_steady_state().run();
    }
}
