//! Hardware emergency-stop bypass.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, error};

use crate::pipeline::Stage;
use crate::{Error, Result};

/// Direct, synchronous emergency-brake trigger.
///
/// An `Err` is treated as a hardware fault by the decision engine. Calls are
/// made from a dedicated thread (see [`BoundedTrigger`]), so a slow driver
/// delays only its own reply.
pub trait EmergencyStop: Send + Sync {
    /// Fire the brake. `timestamp` identifies the requesting decision.
    fn trigger(&self, timestamp: f64) -> Result<()>;
}

/// Trigger that only logs. For simulation and replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEmergencyStop;

impl EmergencyStop for LoggingEmergencyStop {
    fn trigger(&self, timestamp: f64) -> Result<()> {
        error!(timestamp, "emergency stop triggered");
        Ok(())
    }
}

struct TriggerRequest {
    timestamp: f64,
    reply: Sender<Result<()>>,
}

/// Runs an [`EmergencyStop`] on its own thread so every trigger attempt is
/// bounded by a deadline.
///
/// A request that misses its deadline stays issued: the driver still receives
/// it once it becomes responsive again, only the reply is discarded.
pub struct BoundedTrigger {
    requests: Sender<TriggerRequest>,
    deadline: Duration,
}

impl BoundedTrigger {
    /// Start the trigger thread.
    ///
    /// # Arguments
    /// * `hardware` - The emergency stop driven by the thread
    /// * `deadline` - Longest wait for one attempt, queueing included
    ///
    /// # Errors
    /// `IoError` if the thread cannot be spawned.
    pub fn spawn(hardware: Arc<dyn EmergencyStop>, deadline: Duration) -> Result<Self> {
        let (requests, incoming) = bounded::<TriggerRequest>(1);
        thread::Builder::new()
            .name("railsight-estop".to_string())
            .spawn(move || {
                for request in incoming.iter() {
                    let outcome = hardware.trigger(request.timestamp);
                    // Requester may have given up already
                    let _ = request.reply.send(outcome);
                }
                debug!("emergency stop thread stopped");
            })?;
        Ok(Self { requests, deadline })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Issue one trigger attempt and wait at most the deadline for its outcome.
    ///
    /// # Errors
    /// The driver's own error, `Timeout { stage: Decision }` when the
    /// deadline elapses, or `HardwareFault` if the trigger thread is gone.
    pub fn fire(&self, timestamp: f64) -> Result<()> {
        let started = Instant::now();
        let (reply, outcome) = bounded(1);

        self.requests
            .send_timeout(TriggerRequest { timestamp, reply }, self.deadline)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => Error::Timeout {
                    stage: Stage::Decision,
                },
                SendTimeoutError::Disconnected(_) => stopped(),
            })?;

        let remaining = self.deadline.saturating_sub(started.elapsed());
        match outcome.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout {
                stage: Stage::Decision,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(stopped()),
        }
    }
}

fn stopped() -> Error {
    Error::HardwareFault("emergency stop thread is not running".to_string())
}

impl fmt::Debug for BoundedTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTrigger")
            .field("deadline", &self.deadline)
            .field("pending", &self.requests.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct SleepingStop {
        delay: Duration,
        fired: Mutex<Vec<f64>>,
    }

    impl EmergencyStop for SleepingStop {
        fn trigger(&self, timestamp: f64) -> Result<()> {
            thread::sleep(self.delay);
            self.fired.lock().push(timestamp);
            Ok(())
        }
    }

    #[test]
    fn test_prompt_stop_reports_success() {
        let trigger = BoundedTrigger::spawn(Arc::new(LoggingEmergencyStop), Duration::from_secs(1)).unwrap();
        assert!(trigger.fire(0.5).is_ok());
    }

    #[test]
    fn test_driver_error_is_returned() {
        struct Broken;
        impl EmergencyStop for Broken {
            fn trigger(&self, _timestamp: f64) -> Result<()> {
                Err(Error::HardwareFault("no relay".to_string()))
            }
        }
        let trigger = BoundedTrigger::spawn(Arc::new(Broken), Duration::from_secs(1)).unwrap();
        assert!(matches!(trigger.fire(0.0), Err(Error::HardwareFault(_))));
    }

    #[test]
    fn test_slow_stop_times_out_but_still_fires() {
        let stop = Arc::new(SleepingStop {
            delay: Duration::from_millis(300),
            fired: Mutex::new(Vec::new()),
        });
        let trigger = BoundedTrigger::spawn(stop.clone(), Duration::from_millis(10)).unwrap();

        let started = Instant::now();
        let result = trigger.fire(1.25);

        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(matches!(
            result,
            Err(Error::Timeout {
                stage: Stage::Decision
            })
        ));
        // The late driver still receives the request
        thread::sleep(Duration::from_millis(600));
        assert_eq!(*stop.fired.lock(), vec![1.25]);
    }
}
