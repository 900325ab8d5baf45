//! Scan server: wires transport, driver, controller and heartbeat together.
//!
//! # Lifecycle
//!
//! 1. Connect with a retained `{connected:false}` last will
//! 2. Subscribe to the command topics
//! 3. Spawn the driver task, the controller and the availability monitor
//! 4. Publish retained `{connected:true}`
//! 5. Dispatch inbound commands until shutdown or the inbound stream closes
//! 6. Stop the heartbeat and controller, publish `{connected:false}`, disconnect

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::error::{ScanError, ScanResult};
use crate::hardware::{DaqDriver, DriverHandle};
use crate::protocol::{decode_command, Publisher, Topics};
use crate::scan::{AvailabilityMonitor, ControllerHandle, ScanController};
use crate::transport::{Message, Transport};

/// Runs one scan controller against one transport.
pub struct ScanServer {
    config: ScanConfig,
    transport: Arc<dyn Transport>,
    driver: Box<dyn DaqDriver>,
}

impl ScanServer {
    /// Server for `driver`, reachable through `transport`.
    pub fn new(config: ScanConfig, transport: Arc<dyn Transport>, driver: Box<dyn DaqDriver>) -> Self {
        Self {
            config,
            transport,
            driver,
        }
    }

    /// Serve until `shutdown` resolves or the transport stops delivering messages.
    pub async fn run<F>(self, shutdown: F) -> ScanResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            config,
            transport,
            driver,
        } = self;

        let topics = Topics::new(config.transport.base_topic.clone());
        let publisher = Publisher::new(Arc::clone(&transport), topics.clone());

        transport.connect(publisher.connection_message(false)?).await?;
        let mut inbound = transport.subscribe(&topics.command_filters()).await?;
        info!(
            broker = %config.transport.broker_host,
            client_id = %config.transport.client_id,
            base_topic = %topics.base(),
            "Transport connected"
        );

        let (driver, driver_task) = DriverHandle::spawn(driver, config.timing.command_queue);
        let (controller, controller_task) = ScanController::spawn(
            driver.clone(),
            publisher.clone(),
            config.board.clone(),
            config.timing.clone(),
        );
        let availability = AvailabilityMonitor::spawn(
            driver.clone(),
            publisher.clone(),
            config.timing.availability_interval(),
        );
        drop(driver);

        publisher.connected(true).await;
        info!("Scan server ready");

        dispatch_loop(&topics, &publisher, &controller, &mut inbound, shutdown).await;

        info!("Scan server shutting down");
        availability.stop().await;
        controller.shutdown().await;
        drop(controller);
        if let Err(e) = controller_task.await {
            warn!(error = %e, "Controller task failed");
        }
        if let Err(e) = driver_task.await {
            warn!(error = %e, "Driver task failed");
        }

        publisher.connected(false).await;
        transport.disconnect().await?;
        info!("Scan server stopped");
        Ok(())
    }
}

async fn dispatch_loop<F>(
    topics: &Topics,
    publisher: &Publisher,
    controller: &ControllerHandle,
    inbound: &mut mpsc::UnboundedReceiver<Message>,
    shutdown: F,
) where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            message = inbound.recv() => {
                let Some(message) = message else {
                    info!("Inbound stream closed");
                    break;
                };
                dispatch(topics, publisher, controller, message).await;
            }
        }
    }
}

/// Decode one inbound message and hand it to the controller.
///
/// Decode failures are reported on the error topic. Messages on topics that
/// carry no command are ignored.
pub async fn dispatch(
    topics: &Topics,
    publisher: &Publisher,
    controller: &ControllerHandle,
    message: Message,
) {
    match decode_command(topics, &message) {
        Ok(Some(command)) => {
            let kind = command.kind();
            debug!(topic = %message.topic, command = %kind, "Dispatching command");
            match controller.execute(command).await {
                Ok(()) => {}
                // The controller reports its own failures; only a dead controller is ours.
                Err(e @ ScanError::ControllerUnavailable) => {
                    publisher.error(kind.error_context(), &e).await;
                }
                Err(e) => debug!(command = %kind, error = %e, "Command finished with error"),
            }
        }
        Ok(None) => debug!(topic = %message.topic, "Ignoring message"),
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "Rejected inbound message");
            publisher.report(e.to_string()).await;
        }
    }
}
