//! Session: drives one provisioning attempt against one device
//!
//! ```text
//! Discovering ─negotiate─> MenuReady ─identify─> Identifying ─idle/timeout─> MenuReady
//!                             │
//!                             └─provision─> [AwaitingAuthorization] ─> Provisioning ─> Succeeded
//!                                                                                 └─> Failed
//! ```
//!
//! The session only moves on a notification that passes validation, on a
//! deadline, or on cancellation. Every wait, including negotiation and command
//! writes, races the cancel signal and a deadline, so the machine is re-entered
//! once per event and never concurrently.
//!
//! Notifications that arrive while nobody is waiting (at the menu, during a
//! write) are caught up before the next decision. They update the known device
//! state, but never count as the answer to a command written after them.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use improv_proto::{
    Capabilities, Characteristic, Credentials, DeviceState, ErrorCode, Frame, commands,
};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ProvisionConfig;
use crate::device::DeviceHandle;
use crate::negotiate::{NegotiationError, negotiate};
use crate::outcome::Outcome;
use crate::registry::SessionGuard;
use crate::transport::{Notification, NotificationStream, Transport};

/// Stand-in for deadlines too far away for `Instant` to represent
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Why a session ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Device is provisioned and already known to this controller
    AlreadyConfigured,
    /// Negotiation failed, the device is not a provisioning target
    CharacteristicMissing,
    /// Discovery ended without a matching device
    NoDevicesFound,
    /// Device reported an error on the error state characteristic
    Device(ErrorCode),
    /// A deadline expired, the caller may retry
    Timeout,
    Cancelled,
    /// Link dropped or a write failed
    Transport(String),
}

impl FailureReason {
    fn link_lost() -> Self {
        FailureReason::Transport("link lost".to_string())
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyConfigured => write!(f, "device is already configured"),
            Self::CharacteristicMissing => write!(f, "device does not expose the Improv service"),
            Self::NoDevicesFound => write!(f, "no Improv device found"),
            Self::Device(code) => write!(f, "device reported: {code}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Discovering,
    MenuReady,
    Identifying,
    AwaitingAuthorization,
    Provisioning,
    Succeeded { url: Option<String> },
    Failed(FailureReason),
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeeded { .. } | State::Failed(_))
    }

    /// Flow step the UI shows for this state, `None` once terminal
    pub fn step(&self) -> Option<Step> {
        match self {
            State::Discovering => Some(Step::BluetoothConfirm),
            State::MenuReady => Some(Step::MainMenu),
            State::Identifying => Some(Step::Identify),
            State::AwaitingAuthorization => Some(Step::Authorize),
            State::Provisioning => Some(Step::Provisioning),
            State::Succeeded { .. } | State::Failed(_) => None,
        }
    }
}

/// User-facing flow steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    BluetoothConfirm,
    MainMenu,
    Identify,
    /// Credentials form
    Provision,
    Authorize,
    Provisioning,
}

impl Step {
    pub fn key(self) -> &'static str {
        match self {
            Step::BluetoothConfirm => "bluetooth_confirm",
            Step::MainMenu => "main_menu",
            Step::Identify => "identify",
            Step::Provision => "provision",
            Step::Authorize => "authorize",
            Step::Provisioning => "provisioning",
        }
    }
}

/// Entries of the main menu, offered according to the negotiated capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuOption {
    Identify,
    Provision,
}

impl MenuOption {
    pub fn step(self) -> Step {
        match self {
            MenuOption::Identify => Step::Identify,
            MenuOption::Provision => Step::Provision,
        }
    }

    fn capability(self) -> Capabilities {
        match self {
            MenuOption::Identify => Capabilities::IDENTIFY,
            MenuOption::Provision => Capabilities::PROVISION,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session has not negotiated with the device yet")]
    NotStarted,
    #[error("device does not support {0:?}")]
    NotSupported(MenuOption),
    #[error("a command is already in flight")]
    CommandInFlight,
    #[error("session already finished")]
    Terminated,
    #[error("session failed: {0}")]
    Failed(FailureReason),
}

/// Cancels a session from outside the task driving it
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

enum Event {
    Signals(Vec<Signal>),
    Deadline,
    Cancelled,
    LinkLost,
}

#[derive(Debug)]
enum Signal {
    State(DeviceState),
    Error(ErrorCode),
    Result(Frame),
}

pub struct Session<T: Transport> {
    transport: T,
    device: DeviceHandle,
    config: ProvisionConfig,
    guard: SessionGuard,
    notifications: Option<NotificationStream>,
    link_lost: bool,
    state: watch::Sender<State>,
    device_state: Option<DeviceState>,
    last_error: ErrorCode,
    /// Command written and not yet settled
    pending: Option<u8>,
    deadline: Option<Instant>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl<T: Transport> Session<T> {
    /// `guard` must have been acquired for `device`'s address
    pub fn new(
        transport: T,
        device: DeviceHandle,
        config: ProvisionConfig,
        guard: SessionGuard,
    ) -> Self {
        let (state, _) = watch::channel(State::Discovering);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            transport,
            device,
            config,
            guard,
            notifications: None,
            link_lost: false,
            state,
            device_state: None,
            last_error: ErrorCode::NoError,
            pending: None,
            deadline: None,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    /// Follow state transitions, e.g. to render flow steps
    pub fn watch(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel_tx.clone())
    }

    /// Last state the device reported
    pub fn device_state(&self) -> Option<DeviceState> {
        self.device_state
    }

    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// Outcome of a terminal session
    pub fn outcome(&self) -> Option<Outcome> {
        Outcome::from_state(&self.state.borrow())
    }

    pub fn menu_options(&self) -> Vec<MenuOption> {
        [MenuOption::Identify, MenuOption::Provision]
            .into_iter()
            .filter(|o| self.device.supports(o.capability()))
            .collect()
    }

    fn transition(&mut self, next: State) {
        debug!("{}: {:?} -> {:?}", self.device, *self.state.borrow(), next);
        self.state.send_replace(next);
    }

    /// Negotiate with a connected device and open the main menu
    pub async fn start(&mut self) -> State {
        if *self.state.borrow() != State::Discovering {
            return self.state();
        }
        if *self.cancel_rx.borrow() {
            self.fail(FailureReason::Cancelled).await;
            return self.state();
        }

        let deadline = deadline_after(self.config.io_timeout);

        // subscribe before reading the state so no change in between is lost
        let subscribe = self.transport.subscribe(&Characteristic::NOTIFY);
        match race(&mut self.cancel_rx, deadline, subscribe).await {
            Ok(Ok(stream)) => self.notifications = Some(stream),
            Ok(Err(e)) => {
                self.fail(FailureReason::Transport(e.to_string())).await;
                return self.state();
            }
            Err(reason) => {
                self.fail(reason).await;
                return self.state();
            }
        }

        let negotiation = negotiate(&mut self.transport, &mut self.device);
        let negotiated = match race(&mut self.cancel_rx, deadline, negotiation).await {
            Ok(Ok(n)) => n,
            Ok(Err(NegotiationError::Unsupported(reason))) => {
                warn!("{}: {reason}", self.device);
                self.fail(FailureReason::CharacteristicMissing).await;
                return self.state();
            }
            Ok(Err(e)) => {
                self.fail(FailureReason::Transport(e.to_string())).await;
                return self.state();
            }
            Err(reason) => {
                self.fail(reason).await;
                return self.state();
            }
        };

        self.device_state = Some(negotiated.state);
        self.last_error = negotiated.error;
        self.catch_up();
        if self.link_lost {
            self.fail(FailureReason::link_lost()).await;
            return self.state();
        }

        if self.device_state == Some(DeviceState::Provisioned) && self.guard.is_known() {
            self.fail(FailureReason::AlreadyConfigured).await;
            return self.state();
        }

        info!(
            "{}: ready, capabilities=0x{:02x}, state={:?}",
            self.device,
            negotiated.capabilities.bits(),
            self.device_state
        );
        self.transition(State::MenuReady);
        self.state()
    }

    /// Ask the device to identify itself. Best effort: a timeout returns to
    /// the menu with a warning.
    pub async fn identify(&mut self) -> Result<(), SessionError> {
        self.ready_for(MenuOption::Identify).await?;

        self.transition(State::Identifying);
        self.send(Frame::identify(), self.config.identify_timeout).await?;

        loop {
            match self.next_event().await {
                Event::Cancelled => return Err(self.fail_err(FailureReason::Cancelled).await),
                Event::LinkLost => return Err(self.fail_err(FailureReason::link_lost()).await),
                Event::Deadline => {
                    warn!("{}: no response to identify, continuing", self.device);
                    break;
                }
                Event::Signals(signals) => {
                    let mut done = false;
                    for signal in signals {
                        match signal {
                            Signal::Error(code) => {
                                return Err(self.fail_err(FailureReason::Device(code)).await);
                            }
                            Signal::State(state) if state.is_idle() => done = true,
                            Signal::Result(frame) if frame.command == commands::IDENTIFY => {
                                done = true
                            }
                            other => {
                                debug!("{}: ignoring {other:?} while identifying", self.device)
                            }
                        }
                    }
                    if done {
                        break;
                    }
                }
            }
        }

        self.settle();
        self.transition(State::MenuReady);
        Ok(())
    }

    /// Send credentials and follow the device to a terminal state
    pub async fn provision(&mut self, credentials: &Credentials) -> Result<Outcome, SessionError> {
        self.ready_for(MenuOption::Provision).await?;

        // the device may have changed state while the menu was open
        self.catch_up();
        if self.link_lost {
            return Ok(self.fail(FailureReason::link_lost()).await);
        }

        if self.device_state == Some(DeviceState::AuthorizationRequired) {
            self.transition(State::AwaitingAuthorization);
            info!("{}: waiting for authorization on the device", self.device);
            self.deadline = Some(deadline_after(self.config.authorization_timeout));

            'authorize: loop {
                match self.next_event().await {
                    Event::Cancelled => return Ok(self.fail(FailureReason::Cancelled).await),
                    Event::LinkLost => return Ok(self.fail(FailureReason::link_lost()).await),
                    Event::Deadline => return Ok(self.fail(FailureReason::Timeout).await),
                    Event::Signals(signals) => {
                        for signal in signals {
                            match signal {
                                Signal::Error(code) => {
                                    return Ok(self.fail(FailureReason::Device(code)).await);
                                }
                                Signal::State(state)
                                    if state != DeviceState::AuthorizationRequired =>
                                {
                                    break 'authorize;
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            self.settle();
        }

        self.transition(State::Provisioning);
        info!("{}: sending credentials for {:?}", self.device, credentials.ssid());
        let frame = Frame::provision(credentials);
        match self.send(frame, self.config.provisioning_timeout).await {
            Ok(()) => {}
            Err(SessionError::Failed(reason)) => return Ok(Outcome::from_failure(&reason)),
            Err(e) => return Err(e),
        }

        let mut refreshes_left = self.config.provisioning_refreshes;
        let mut provisioned = false;
        let mut result: Option<Option<String>> = None;

        loop {
            match self.next_event().await {
                Event::Cancelled => return Ok(self.fail(FailureReason::Cancelled).await),
                // devices commonly drop the link once they are on the network
                Event::LinkLost if provisioned => return Ok(self.succeed(result.flatten()).await),
                Event::LinkLost => return Ok(self.fail(FailureReason::link_lost()).await),
                Event::Deadline if provisioned => return Ok(self.succeed(result.flatten()).await),
                Event::Deadline => return Ok(self.fail(FailureReason::Timeout).await),
                Event::Signals(signals) => {
                    for signal in signals {
                        match signal {
                            Signal::Error(code) => {
                                return Ok(self.fail(FailureReason::Device(code)).await);
                            }
                            Signal::State(DeviceState::Provisioned) => {
                                if let Some(url) = result {
                                    return Ok(self.succeed(url).await);
                                }
                                provisioned = true;
                                let grace = deadline_after(self.config.result_grace);
                                self.deadline = Some(self.deadline.map_or(grace, |d| d.min(grace)));
                            }
                            Signal::State(DeviceState::Provisioning) if !provisioned => {
                                if refreshes_left > 0 {
                                    refreshes_left -= 1;
                                    let timeout = self.config.provisioning_timeout;
                                    self.deadline = Some(deadline_after(timeout));
                                    debug!("{}: still provisioning, deadline reset", self.device);
                                }
                            }
                            Signal::Result(frame) if frame.command == commands::PROVISION => {
                                let url = redirect_url(&frame);
                                if provisioned {
                                    return Ok(self.succeed(url).await);
                                }
                                result = Some(url);
                            }
                            other => {
                                debug!("{}: ignoring {other:?} while provisioning", self.device)
                            }
                        }
                    }
                }
            }
        }
    }

    /// Cancel right away, disconnecting from the device
    pub async fn cancel(&mut self) -> Outcome {
        self.cancel_tx.send_replace(true);
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        self.fail(FailureReason::Cancelled).await
    }

    /// Disconnect and release the device without recording an outcome,
    /// e.g. after identify
    pub async fn close(mut self) {
        self.settle();
        self.notifications = None;
        if let Err(e) = self.transport.disconnect().await {
            debug!("{}: disconnect failed: {e}", self.device);
        }
        debug!("{}: closed", self.device);
    }

    async fn ready_for(&mut self, option: MenuOption) -> Result<(), SessionError> {
        if *self.cancel_rx.borrow() && !self.state.borrow().is_terminal() {
            self.fail(FailureReason::Cancelled).await;
        }
        match &*self.state.borrow() {
            State::MenuReady => {}
            State::Discovering => return Err(SessionError::NotStarted),
            s if s.is_terminal() => return Err(SessionError::Terminated),
            _ => return Err(SessionError::CommandInFlight),
        }
        if !self.device.supports(option.capability()) {
            return Err(SessionError::NotSupported(option));
        }
        Ok(())
    }

    /// Write one command and arm its deadline. At most one command is in flight.
    async fn send(&mut self, frame: Frame, timeout: Duration) -> Result<(), SessionError> {
        if self.pending.is_some() {
            return Err(SessionError::CommandInFlight);
        }
        let bytes = match frame.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail_err(FailureReason::Transport(e.to_string())).await),
        };

        // anything queued so far predates the command
        self.catch_up();
        if self.link_lost {
            return Err(self.fail_err(FailureReason::link_lost()).await);
        }

        let deadline = deadline_after(self.config.io_timeout);
        let write = self.transport.write(Characteristic::RpcCommand, &bytes);
        match race(&mut self.cancel_rx, deadline, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(self.fail_err(FailureReason::Transport(e.to_string())).await);
            }
            Err(reason) => return Err(self.fail_err(reason).await),
        }

        self.pending = Some(frame.command);
        self.deadline = Some(deadline_after(timeout));
        Ok(())
    }

    fn settle(&mut self) {
        self.pending = None;
        self.deadline = None;
    }

    /// Absorb notifications that are already queued. The device state and
    /// error are kept, the signals are dropped.
    fn catch_up(&mut self) {
        let Some(stream) = self.notifications.as_mut() else {
            return;
        };
        let mut queued = Vec::new();
        while let Some(next) = stream.next().now_or_never() {
            match next {
                Some(n) => queued.push(n),
                None => {
                    self.link_lost = true;
                    break;
                }
            }
        }
        if !queued.is_empty() {
            debug!("{}: catching up on {} notifications", self.device, queued.len());
            self.absorb(queued);
        }
    }

    async fn next_event(&mut self) -> Event {
        if *self.cancel_rx.borrow() {
            return Event::Cancelled;
        }
        if self.link_lost {
            return Event::LinkLost;
        }
        let Some(stream) = self.notifications.as_mut() else {
            return Event::LinkLost;
        };

        let deadline = self.deadline;
        let first = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel_rx) => return Event::Cancelled,
            n = stream.next() => n,
            _ = sleep_until(deadline) => return Event::Deadline,
        };
        let Some(first) = first else {
            self.link_lost = true;
            return Event::LinkLost;
        };

        // everything already delivered counts as arriving together
        let mut batch = vec![first];
        while let Some(next) = stream.next().now_or_never() {
            match next {
                Some(n) => batch.push(n),
                None => {
                    self.link_lost = true;
                    break;
                }
            }
        }
        Event::Signals(self.absorb(batch))
    }

    /// Validate notifications and record what the device reported. An error
    /// overrides anything it arrived with.
    fn absorb(&mut self, batch: Vec<Notification>) -> Vec<Signal> {
        let mut signals = Vec::with_capacity(batch.len());
        for n in batch {
            match n.characteristic {
                Characteristic::CurrentState => match DeviceState::from_value(&n.value) {
                    Some(state) => {
                        self.device_state = Some(state);
                        signals.push(Signal::State(state));
                    }
                    None => warn!("{}: discarding invalid state {:02x?}", self.device, n.value),
                },
                Characteristic::ErrorState => match ErrorCode::from_value(&n.value) {
                    Some(code) => {
                        self.last_error = code;
                        if code.is_error() {
                            signals.push(Signal::Error(code));
                        }
                    }
                    None => {
                        warn!("{}: discarding invalid error state {:02x?}", self.device, n.value)
                    }
                },
                Characteristic::RpcResult => match improv_proto::decode(&n.value) {
                    Ok(frame) => signals.push(Signal::Result(frame)),
                    Err(e) => warn!("{}: discarding RPC result: {e}", self.device),
                },
                other => debug!("{}: unexpected notification on {other:?}", self.device),
            }
        }

        if let Some(code) = signals.iter().find_map(|s| match s {
            Signal::Error(code) => Some(*code),
            _ => None,
        }) {
            return vec![Signal::Error(code)];
        }
        signals
    }

    async fn succeed(&mut self, url: Option<String>) -> Outcome {
        match &url {
            Some(url) => info!("{}: provisioned, {url}", self.device),
            None => info!("{}: provisioned", self.device),
        }
        self.guard.mark_known();
        self.finish(State::Succeeded { url }).await
    }

    async fn fail(&mut self, reason: FailureReason) -> Outcome {
        match reason {
            FailureReason::Cancelled => info!("{}: cancelled", self.device),
            _ => warn!("{}: provisioning failed: {reason}", self.device),
        }
        self.finish(State::Failed(reason)).await
    }

    async fn fail_err(&mut self, reason: FailureReason) -> SessionError {
        self.fail(reason.clone()).await;
        SessionError::Failed(reason)
    }

    async fn finish(&mut self, terminal: State) -> Outcome {
        self.settle();
        self.notifications = None;
        if let Err(e) = self.transport.disconnect().await {
            debug!("{}: disconnect failed: {e}", self.device);
        }
        let outcome = Outcome::from_state(&terminal).unwrap_or(Outcome::Unknown);
        self.transition(terminal);
        outcome
    }
}

fn redirect_url(frame: &Frame) -> Option<String> {
    match frame.strings() {
        Ok(strings) => strings.into_iter().find(|s| !s.is_empty()),
        Err(e) => {
            warn!("ignoring provision result payload: {e}");
            None
        }
    }
}

/// `now + timeout`, pushed far out instead of overflowing
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Run a transport call until it completes, the session is cancelled, or
/// `deadline` passes
async fn race<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    deadline: Instant,
    call: F,
) -> Result<F::Output, FailureReason> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(FailureReason::Cancelled),
        output = call => Ok(output),
        _ = tokio::time::sleep_until(deadline) => Err(FailureReason::Timeout),
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
