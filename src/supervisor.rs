//! Supervisor (spec §4.11): startup/shutdown sequencing. Mirrors the
//! teacher's `main.rs` shape (ctrlc flag, thread-per-component, join on
//! shutdown) but generalized to this pipeline's set of components and
//! built on `thread::scope` so components can borrow the Broker/Store
//! directly instead of everything living behind an `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Broker, CHANNEL_CALLS, CHANNEL_SMDR};
use crate::config::Config;
use crate::correlation::CorrelationEngine;
use crate::devlink::{DevLink3Connection, DevLink3Params};
use crate::error::Result;
use crate::health::{self, HealthState};
use crate::persist::{PersistBuffer, Store};
use crate::pipeline;
use crate::resolver::AgentResolver;
use crate::smdr;

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Blocks until SIGINT/SIGTERM, then drains in reverse startup order:
    /// stop accepting new work, flush PersistBuffer, drop the store.
    pub fn run(&self) -> Result<()> {
        crate::logging::init(&self.config.log_level);
        tracing::info!(environment = %self.config.environment, "devlink-bridge starting");

        let store = Store::open(&self.config.data_dir)?;
        let buffer = PersistBuffer::new(&store);
        let resolver = AgentResolver::new(&store)?;
        let broker = Broker::new();
        let correlation = CorrelationEngine::new(&store, &buffer, &resolver);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_handler = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("received shutdown signal");
            shutdown_for_handler.store(true, Ordering::SeqCst);
        })
        .map_err(|e| crate::error::BridgeError::InvalidInput(format!("signal handler: {e}")))?;

        let connection = DevLink3Connection::new(DevLink3Params {
            host: self.config.devlink3_host.clone(),
            port: self.config.devlink3_port,
            username: self.config.devlink3_username.clone(),
            password: self.config.devlink3_password.clone(),
            use_tls: self.config.devlink3_use_tls,
            tls_verify: self.config.devlink3_tls_verify,
            event_flags: self.config.devlink3_event_flags.clone(),
        });
        let connection_state = connection.state_handle();

        let (devlink_stop_tx, devlink_stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (corr_stop_tx, corr_stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (frame_tx, frame_rx) = crossbeam_channel::unbounded();
        let smdr_shutdown = Arc::new(AtomicBool::new(false));

        std::thread::scope(|scope| {
            scope.spawn(move || connection.run(devlink_stop_rx, frame_tx));

            let broker_ref = &broker;
            let buffer_ref = &buffer;
            scope.spawn(move || pipeline::run_event_loop(frame_rx, broker_ref, buffer_ref, unix_now));

            if self.config.smdr_enabled {
                let (smdr_tx, smdr_rx) = crossbeam_channel::unbounded();
                let bind_addr = format!("{}:{}", self.config.smdr_host, self.config.smdr_port);
                let smdr_shutdown_listener = Arc::clone(&smdr_shutdown);
                scope.spawn(move || {
                    if let Err(e) = smdr::run_listener(&bind_addr, smdr_shutdown_listener, smdr_tx) {
                        tracing::error!(error = %e, "smdr listener exited");
                    }
                });
                let broker_ref = &broker;
                scope.spawn(move || {
                    for record in smdr_rx {
                        broker_ref.publish(crate::broker::BrokerMessage::Smdr(record));
                    }
                });
            }

            let calls_rx = broker.subscribe(CHANNEL_CALLS);
            let smdr_rx_for_correlation = broker.subscribe(CHANNEL_SMDR);
            let correlation_ref = &correlation;
            scope.spawn(move || correlation_ref.run(calls_rx, smdr_rx_for_correlation, &corr_stop_rx));

            if let Err(e) = health::start(
                scope,
                &self.config.health_bind_addr,
                HealthState {
                    connection_state: Arc::clone(&connection_state),
                    broker: &broker,
                    resolver: &resolver,
                    correlation: &correlation,
                },
            ) {
                tracing::warn!(error = %e, "health endpoint failed to start");
            }

            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
            }

            tracing::info!("shutting down");
            smdr_shutdown.store(true, Ordering::Relaxed);
            let _ = devlink_stop_tx.send(());
            let _ = corr_stop_tx.send(());

            if let Err(e) = buffer.flush_pending() {
                tracing::error!(error = %e, "failed to flush persistence buffer on shutdown");
            }
        });

        tracing::info!("devlink-bridge stopped");
        Ok(())
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
