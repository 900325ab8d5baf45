//! Single-owner access to a [`DaqDriver`].
//!
//! The driver is not safe to call from several places at once, yet both the
//! command path and the background monitors need it. `DriverHandle` moves the
//! driver onto one blocking-pool thread and forwards each call over an mpsc
//! channel, with the result returned on a oneshot channel:
//!
//! ```text
//! Controller / monitors               Driver task
//! ---------------------               -----------
//! 1. Wrap call + oneshot
//! 2. Send via mpsc channel    ------>
//!                                     3. Run call against the driver
//!                                     4. Send result
//! 5. Await oneshot receiver   <------
//! ```
//!
//! Calls are executed strictly in the order they were queued. Driver primitives
//! may block for as long as the hardware needs without stalling the runtime.
//! Handles are cheap to clone; the thread exits when the last handle is dropped.
//!
//! ```rust
//! use scan_daq::hardware::{DriverHandle, SimulatedBoard};
//!
//! # tokio_test::block_on(async {
//! let (driver, _task) = DriverHandle::spawn(Box::new(SimulatedBoard::new()), 8);
//! assert!(driver.is_available().await?);
//! # Ok::<(), scan_daq::DriverError>(())
//! # }).unwrap();
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{DriverError, DriverErrorKind, DriverResult};
use crate::hardware::driver::{
    DaqDriver, InputScanRequest, OutputRange, OutputScanRequest, ScanDirection, ScanStatus,
    TriggerConfig,
};

type DriverJob = Box<dyn FnOnce(&mut dyn DaqDriver) + Send>;

/// Cloneable handle to the task that owns the driver.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<DriverJob>,
    name: Arc<str>,
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("driver", &self.name)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl DriverHandle {
    /// Move `driver` onto a blocking thread and return a handle to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(driver: Box<dyn DaqDriver>, queue_capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DriverJob>(queue_capacity.max(1));
        let name: Arc<str> = Arc::from(driver.name());
        let task_name = name.clone();

        let task = tokio::task::spawn_blocking(move || {
            let mut driver = driver;
            debug!(driver = %task_name, "Driver task started");
            while let Some(job) = rx.blocking_recv() {
                job(driver.as_mut());
            }
            debug!(driver = %task_name, "Driver task stopped");
        });

        (Self { tx, name }, task)
    }

    /// Name of the owned driver.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call<R, F>(&self, op: &'static str, f: F) -> DriverResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn DaqDriver) -> DriverResult<R> + Send + 'static,
    {
        trace!(driver = %self.name, op, "Driver call");
        let (response_tx, response_rx) = oneshot::channel();
        let job: DriverJob = Box::new(move |driver| {
            let _ = response_tx.send(f(driver));
        });

        self.tx.send(job).await.map_err(|_| self.closed(op))?;
        response_rx.await.map_err(|_| self.closed(op))?
    }

    fn closed(&self, op: &str) -> DriverError {
        DriverError::new(
            self.name.as_ref(),
            DriverErrorKind::Communication,
            format!("driver task is not running ({})", op),
        )
    }

    /// See [`DaqDriver::is_available`].
    pub async fn is_available(&self) -> DriverResult<bool> {
        self.call("is_available", |d| d.is_available()).await
    }

    /// See [`DaqDriver::output_range`].
    pub async fn output_range(&self) -> DriverResult<OutputRange> {
        self.call("output_range", |d| d.output_range()).await
    }

    /// See [`DaqDriver::configure_trigger`].
    pub async fn configure_trigger(&self, trigger: TriggerConfig) -> DriverResult<()> {
        self.call("configure_trigger", move |d| d.configure_trigger(&trigger))
            .await
    }

    /// See [`DaqDriver::set_digital_bit`].
    pub async fn set_digital_bit(&self, port: u32, bit: u32, high: bool) -> DriverResult<()> {
        self.call("set_digital_bit", move |d| d.set_digital_bit(port, bit, high))
            .await
    }

    /// See [`DaqDriver::start_input_scan`].
    pub async fn start_input_scan(
        &self,
        request: InputScanRequest,
        buffer: Vec<f64>,
    ) -> DriverResult<()> {
        self.call("start_input_scan", move |d| d.start_input_scan(request, buffer))
            .await
    }

    /// See [`DaqDriver::start_output_scan`].
    pub async fn start_output_scan(&self, request: OutputScanRequest) -> DriverResult<()> {
        self.call("start_output_scan", move |d| d.start_output_scan(request))
            .await
    }

    /// See [`DaqDriver::scan_status`].
    pub async fn scan_status(&self, direction: ScanDirection) -> DriverResult<ScanStatus> {
        self.call("scan_status", move |d| d.scan_status(direction))
            .await
    }

    /// See [`DaqDriver::take_input_buffer`].
    pub async fn take_input_buffer(&self) -> DriverResult<Vec<f64>> {
        self.call("take_input_buffer", |d| d.take_input_buffer())
            .await
    }

    /// See [`DaqDriver::stop_background`].
    pub async fn stop_background(&self, direction: ScanDirection) -> DriverResult<()> {
        self.call("stop_background", move |d| d.stop_background(direction))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::{DriverCall, SimulatedBoard};
    use std::time::Duration;

    #[tokio::test]
    async fn test_calls_reach_driver_in_order() {
        let board = SimulatedBoard::new();
        let (handle, _task) = DriverHandle::spawn(Box::new(board.clone()), 8);

        handle.set_digital_bit(0, 0, true).await.unwrap();
        handle.set_digital_bit(0, 0, false).await.unwrap();
        handle.stop_background(ScanDirection::Input).await.unwrap();

        assert_eq!(
            board.calls(),
            vec![
                DriverCall::SetDigitalBit { port: 0, bit: 0, high: true },
                DriverCall::SetDigitalBit { port: 0, bit: 0, high: false },
                DriverCall::StopBackground(ScanDirection::Input),
            ]
        );
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_task() {
        let (handle, task) = DriverHandle::spawn(Box::new(SimulatedBoard::new()), 1);
        let clone = handle.clone();
        drop(handle);
        assert!(clone.is_available().await.unwrap());
        drop(clone);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    /// Driver whose availability check sleeps, or panics, in the calling thread.
    struct StallingBoard {
        check_delay: Duration,
        panic_on_check: bool,
    }

    impl DaqDriver for StallingBoard {
        fn name(&self) -> &str {
            "stalling"
        }

        fn is_available(&mut self) -> DriverResult<bool> {
            if self.panic_on_check {
                panic!("availability check crashed");
            }
            std::thread::sleep(self.check_delay);
            Ok(true)
        }

        fn output_range(&mut self) -> DriverResult<OutputRange> {
            Ok(OutputRange::default())
        }

        fn configure_trigger(&mut self, _trigger: &TriggerConfig) -> DriverResult<()> {
            Ok(())
        }

        fn set_digital_bit(&mut self, _port: u32, _bit: u32, _high: bool) -> DriverResult<()> {
            Ok(())
        }

        fn start_input_scan(
            &mut self,
            _request: InputScanRequest,
            _buffer: Vec<f64>,
        ) -> DriverResult<()> {
            Ok(())
        }

        fn start_output_scan(&mut self, _request: OutputScanRequest) -> DriverResult<()> {
            Ok(())
        }

        fn scan_status(&mut self, _direction: ScanDirection) -> DriverResult<ScanStatus> {
            Ok(ScanStatus::Idle)
        }

        fn take_input_buffer(&mut self) -> DriverResult<Vec<f64>> {
            Ok(Vec::new())
        }

        fn stop_background(&mut self, _direction: ScanDirection) -> DriverResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_blocking_primitive_does_not_stall_runtime() {
        let board = StallingBoard {
            check_delay: Duration::from_millis(300),
            panic_on_check: false,
        };
        let (handle, _task) = DriverHandle::spawn(Box::new(board), 1);
        let check = tokio::spawn(async move { handle.is_available().await });
        tokio::task::yield_now().await;

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "timer delayed by driver call: {:?}",
            started.elapsed()
        );

        assert!(check.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_crashed_driver_reports_communication_error() {
        let board = StallingBoard {
            check_delay: Duration::ZERO,
            panic_on_check: true,
        };
        let (handle, task) = DriverHandle::spawn(Box::new(board), 1);

        let err = handle.is_available().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);
        assert!(task.await.is_err());

        let err = handle.output_range().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);
    }
}
