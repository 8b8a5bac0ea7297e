//! Generic multi-step asynchronous connection
//!
//! A connection is a sequence of driver-specific steps executed on one tokio
//! task. Each step is named after the milestone it starts from; running it
//! performs the next side effect and yields the next milestone, or the final
//! link and network configuration. Once connected the task supervises the
//! tunnel until it fails or is cancelled.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnecting -> Idle
//!             |                           ^
//!             +------- (failure) ---------+
//! ```
//!
//! Every attempt ends with exactly one [`ConnectionEvent::Failure`] or
//! [`ConnectionEvent::Stopped`], optionally preceded by
//! [`ConnectionEvent::Connected`].

use crate::device::LinkInfo;
use crate::error::{ConnectFailure, VpnctlError, VpnctlResult};
use crate::network_config::NetworkResult;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Ordered step of a connection; declaration order is execution order
pub trait ConnectStep: Copy + Ord + fmt::Debug + Send + Sync + 'static {
    const INITIAL: Self;
}

/// What running a step produced
#[derive(Debug)]
pub enum StepOutcome<S> {
    /// Milestone reached; schedule it next
    Next(S),
    /// The tunnel is up
    Connected { link: LinkInfo, network: NetworkResult },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { link: LinkInfo, network: NetworkResult },
    Failure { reason: ConnectFailure, detail: String },
    Stopped,
}

/// Driver-specific behaviour of a connection
#[async_trait]
pub trait ConnectionSteps: Send + 'static {
    type Step: ConnectStep;

    /// Name used in logs
    fn name(&self) -> &str;

    /// Perform the side effect that follows `step`
    async fn run_step(&mut self, step: Self::Step) -> VpnctlResult<StepOutcome<Self::Step>>;

    /// Watch a connected tunnel; resolves with the error that ends it
    async fn supervise(&mut self) -> VpnctlError {
        std::future::pending().await
    }

    /// Release everything acquired so far. Runs once per attempt on the
    /// connection task, whatever step was reached.
    async fn cleanup(&mut self);
}

/// Handle to a running connection
///
/// Dropping the handle cancels the connection like [`disconnect`], without
/// waiting for cleanup to finish.
///
/// [`disconnect`]: AsyncConnection::disconnect
pub struct AsyncConnection {
    name: String,
    state: watch::Receiver<ConnectionState>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AsyncConnection {
    /// Start running `steps` from the initial step
    pub fn connect<S: ConnectionSteps>(steps: S) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let name = steps.name().to_string();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        info!("{}: connecting", name);
        let runner = StepRunner {
            steps,
            current: None,
            state: state_tx,
            events: event_tx,
        };
        let task = tokio::spawn(runner.run(cancel_rx));

        let connection = Self {
            name,
            state: state_rx,
            cancel: Some(cancel_tx),
            task: Some(task),
        };
        (connection, event_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Cancel the connection and wait until its resources are released
    ///
    /// Calling this again, or after the connection failed, is a no-op.
    pub async fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // The task may already be gone after a failure
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("{}: connection task ended abnormally: {}", self.name, e);
            }
        }
    }
}

struct StepRunner<S: ConnectionSteps> {
    steps: S,
    current: Option<S::Step>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

enum Ending {
    Failed(VpnctlError),
    Cancelled,
}

impl<S: ConnectionSteps> StepRunner<S> {
    async fn run(mut self, mut cancel: oneshot::Receiver<()>) {
        let ending = tokio::select! {
            err = self.drive() => Ending::Failed(err),
            // A dropped handle counts as a disconnect
            _ = &mut cancel => Ending::Cancelled,
        };

        self.state.send_replace(ConnectionState::Disconnecting);
        let name = self.steps.name().to_string();

        match ending {
            Ending::Failed(err) => {
                let reason = err.connect_failure();
                error!("{}: failed at {:?} ({}): {}", name, self.current, reason, err.detail());
                self.emit(ConnectionEvent::Failure {
                    reason,
                    detail: err.detail(),
                });
                self.steps.cleanup().await;
                self.state.send_replace(ConnectionState::Idle);
            }
            Ending::Cancelled => {
                debug!("{}: disconnecting from {:?}", name, self.current);
                self.steps.cleanup().await;
                self.state.send_replace(ConnectionState::Idle);
                info!("{}: stopped", name);
                self.emit(ConnectionEvent::Stopped);
            }
        }
    }

    /// Run steps until connected, then supervise. Only returns on failure.
    async fn drive(&mut self) -> VpnctlError {
        let mut step = S::Step::INITIAL;
        loop {
            match self.schedule_connect_task(step).await {
                Ok(StepOutcome::Next(next)) => step = next,
                Ok(StepOutcome::Connected { link, network }) => {
                    info!("{}: connected on {} (index {})", self.steps.name(), link.name, link.index);
                    self.state.send_replace(ConnectionState::Connected);
                    self.emit(ConnectionEvent::Connected { link, network });
                    break;
                }
                Err(err) => return err,
            }
        }
        self.steps.supervise().await
    }

    /// Record `step` and perform its side effect
    async fn schedule_connect_task(&mut self, step: S::Step) -> VpnctlResult<StepOutcome<S::Step>> {
        if let Some(current) = self.current {
            if step <= current {
                return Err(VpnctlError::failure(
                    ConnectFailure::InternalFailure,
                    format!("Step {:?} does not follow {:?}", step, current),
                ));
            }
        }
        debug!("{}: step {:?}", self.steps.name(), step);
        self.current = Some(step);
        self.steps.run_step(step).await
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            warn!("{}: event receiver dropped", self.steps.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum TestStep {
        Start,
        Middle,
        End,
    }

    impl ConnectStep for TestStep {
        const INITIAL: Self = TestStep::Start;
    }

    #[derive(Clone, Copy)]
    enum Plan {
        Succeed,
        FailAt(TestStep),
        Repeat,
        Hang,
    }

    struct TestSteps {
        plan: Plan,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ConnectionSteps for TestSteps {
        type Step = TestStep;

        fn name(&self) -> &str {
            "test"
        }

        async fn run_step(&mut self, step: TestStep) -> VpnctlResult<StepOutcome<TestStep>> {
            self.log.lock().unwrap().push(format!("{:?}", step));
            match (self.plan, step) {
                (Plan::FailAt(at), _) if at == step => {
                    Err(VpnctlError::failure(ConnectFailure::SocketNotReady, "no socket"))
                }
                (Plan::Repeat, TestStep::Middle) => Ok(StepOutcome::Next(TestStep::Start)),
                (Plan::Hang, TestStep::Middle) => std::future::pending().await,
                (_, TestStep::Start) => Ok(StepOutcome::Next(TestStep::Middle)),
                (_, TestStep::Middle) => Ok(StepOutcome::Next(TestStep::End)),
                (_, TestStep::End) => Ok(StepOutcome::Connected {
                    link: LinkInfo {
                        name: "test0".to_string(),
                        index: 3,
                    },
                    network: NetworkResult::default(),
                }),
            }
        }

        async fn cleanup(&mut self) {
            self.log.lock().unwrap().push("cleanup".to_string());
        }
    }

    fn steps(plan: Plan) -> (TestSteps, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (TestSteps { plan, log: log.clone() }, log)
    }

    #[tokio::test]
    async fn test_steps_run_in_order_then_connect() {
        let (s, log) = steps(Plan::Succeed);
        let (mut conn, mut events) = AsyncConnection::connect(s);

        match events.recv().await.unwrap() {
            ConnectionEvent::Connected { link, .. } => assert_eq!(link.name, "test0"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.disconnect().await;
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Stopped);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(*log.lock().unwrap(), vec!["Start", "Middle", "End", "cleanup"]);
    }

    #[tokio::test]
    async fn test_failure_fires_once_then_cleans_up() {
        let (s, log) = steps(Plan::FailAt(TestStep::Middle));
        let (mut conn, mut events) = AsyncConnection::connect(s);

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Failure {
                reason: ConnectFailure::SocketNotReady,
                detail: "no socket".to_string()
            }
        );

        // Disconnect after failure must not produce a Stopped event
        conn.disconnect().await;
        assert!(events.recv().await.is_none());
        assert_eq!(*log.lock().unwrap(), vec!["Start", "Middle", "cleanup"]);
    }

    #[tokio::test]
    async fn test_backward_step_is_internal_failure() {
        let (s, _log) = steps(Plan::Repeat);
        let (_conn, mut events) = AsyncConnection::connect(s);

        match events.recv().await.unwrap() {
            ConnectionEvent::Failure { reason, .. } => assert_eq!(reason, ConnectFailure::InternalFailure),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_double_disconnect_stops_once() {
        let (s, log) = steps(Plan::Hang);
        let (mut conn, mut events) = AsyncConnection::connect(s);

        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.disconnect().await;
        conn.disconnect().await;

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Stopped);
        assert!(events.recv().await.is_none());
        assert_eq!(log.lock().unwrap().iter().filter(|l| *l == "cleanup").count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels() {
        let (s, log) = steps(Plan::Hang);
        let (conn, mut events) = AsyncConnection::connect(s);
        drop(conn);

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Stopped);
        assert!(log.lock().unwrap().contains(&"cleanup".to_string()));
    }
}
