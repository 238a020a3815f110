//! One controlled gateway: connection state machine and the event loop that owns it.
//!
//! All mutable state (session, nonce count, matrix variables, timers) lives in
//! a single task. Network I/O runs in spawned tasks which post their results
//! back as commands tagged with the generation that started them; results from
//! an older generation (superseded by reconfiguration, failure or teardown) are
//! dropped.

use std::sync::Arc;

use anyhow::Result;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    actions::{self, ActionCommand},
    auth,
    config::GatewayConfig,
    error::{ErrorKind, GatewayError},
    feedbacks::{self, RouteTable},
    heartbeat,
    host::{Choice, InstanceStatus, ModuleHost, OptionValues},
    http::{HttpClient, HttpResponse, ReqwestClient},
    matrix::{self, MatrixVariables},
    reconnect::Backoff,
    session::Session,
    timer::{ScheduledTask, TimerSlot},
    variables,
};

/// Builds the HTTP client for a configuration.
pub type ClientFactory =
    Arc<dyn Fn(&GatewayConfig) -> Result<Arc<dyn HttpClient>> + Send + Sync>;

/// Client factory producing [ReqwestClient]s with the configured timeout.
pub fn reqwest_factory() -> ClientFactory {
    Arc::new(|config: &GatewayConfig| -> Result<Arc<dyn HttpClient>> {
        Ok(Arc::new(ReqwestClient::new(config.request_timeout())?))
    })
}

/// Point-in-time view of the instance.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub status: InstanceStatus,
    pub reconnect_attempts: u32,
    pub matrix: MatrixVariables,
    pub heartbeat_active: bool,
    pub reconnect_pending: bool,
    pub connect_in_progress: bool,
    /// Nonce count of the last authenticated request of the current session.
    pub nonce_count: Option<u32>,
    pub csrf_token: Option<String>,
}

enum Command {
    Configure(GatewayConfig),
    ConnectDue {
        generation: u64,
    },
    ConnectDone {
        generation: u64,
        result: Result<(Session, MatrixVariables)>,
    },
    HeartbeatTick {
        generation: u64,
    },
    HeartbeatDone {
        generation: u64,
        result: Result<HttpResponse>,
    },
    ExecuteAction {
        id: String,
        options: OptionValues,
        reply: oneshot::Sender<Result<()>>,
    },
    ActionDone {
        generation: u64,
        command: ActionCommand,
        result: Result<HttpResponse>,
        reply: oneshot::Sender<Result<()>>,
    },
    EvaluateFeedback {
        id: String,
        options: OptionValues,
        reply: oneshot::Sender<bool>,
    },
    VariableChoices {
        kind: String,
        reply: oneshot::Sender<Vec<Choice>>,
    },
    State {
        reply: oneshot::Sender<InstanceState>,
    },
    Destroy {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Handle to a running gateway instance.
///
/// Lifecycle mirrors the host: [init](GatewayInstance::init) once,
/// [config_updated](GatewayInstance::config_updated) on every settings change,
/// [destroy](GatewayInstance::destroy) on unload. Dropping the handle also
/// tears the instance down.
pub struct GatewayInstance {
    tx: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl GatewayInstance {
    /// Start the event loop using the `reqwest` transport.
    pub fn spawn(host: Arc<dyn ModuleHost>) -> Self {
        Self::spawn_with_client(host, reqwest_factory())
    }

    pub fn spawn_with_client(host: Arc<dyn ModuleHost>, client_factory: ClientFactory) -> Self {
        let (driver, rx) = Driver::new(host, client_factory);
        let tx = driver.tx.clone();
        let task = tokio::spawn(driver.run(rx));
        Self {
            tx,
            task: Some(task),
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("gateway instance is no longer running"))
    }

    pub fn init(&self, config: GatewayConfig) -> Result<()> {
        log::debug!("init {}", config.host);
        self.send(Command::Configure(config))
    }

    pub fn config_updated(&self, config: GatewayConfig) -> Result<()> {
        log::debug!("config updated {}", config.host);
        self.send(Command::Configure(config))
    }

    /// Run an action. Fails when not connected, when options do not match the
    /// discovered features or when the gateway refuses the request.
    pub async fn execute_action(&self, id: &str, options: OptionValues) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ExecuteAction {
            id: id.to_owned(),
            options,
            reply,
        })?;
        rx.await
            .map_err(|_| anyhow::anyhow!("instance stopped before action {} completed", id))?
    }

    pub async fn evaluate_feedback(&self, id: &str, options: OptionValues) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::EvaluateFeedback {
            id: id.to_owned(),
            options,
            reply,
        })?;
        Ok(rx.await?)
    }

    /// `{id, label}` choices for a matrix capability type; empty when unknown.
    pub async fn get_variable_choices(&self, kind: &str) -> Result<Vec<Choice>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::VariableChoices {
            kind: kind.to_owned(),
            reply,
        })?;
        Ok(rx.await?)
    }

    pub async fn state(&self) -> Result<InstanceState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::State { reply })?;
        Ok(rx.await?)
    }

    pub async fn status(&self) -> Result<InstanceStatus> {
        Ok(self.state().await?.status)
    }

    pub async fn reconnect_attempts(&self) -> Result<u32> {
        Ok(self.state().await?.reconnect_attempts)
    }

    pub async fn matrix_variables(&self) -> Result<MatrixVariables> {
        Ok(self.state().await?.matrix)
    }

    /// Cancel all timers and stop the event loop.
    pub async fn destroy(mut self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Destroy { reply: Some(reply) })?;
        rx.await?;
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for GatewayInstance {
    fn drop(&mut self) {
        if self.task.is_some() {
            _ = self.tx.send(Command::Destroy { reply: None });
        }
    }
}

struct Driver {
    host: Arc<dyn ModuleHost>,
    client_factory: ClientFactory,
    tx: mpsc::UnboundedSender<Command>,

    config: Option<GatewayConfig>,
    client: Option<Arc<dyn HttpClient>>,
    status: InstanceStatus,
    session: Option<Session>,
    matrix: MatrixVariables,
    routes: RouteTable,
    backoff: Backoff,

    heartbeat: TimerSlot,
    reconnect: TimerSlot,

    /// Bumped whenever in-flight work must no longer touch state.
    generation: u64,
    connecting: bool,
    heartbeat_in_flight: bool,
}

impl Driver {
    fn new(
        host: Arc<dyn ModuleHost>,
        client_factory: ClientFactory,
    ) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Self {
            host,
            client_factory,
            tx,
            config: None,
            client: None,
            status: InstanceStatus::Uninitialized,
            session: None,
            matrix: MatrixVariables::new(),
            routes: RouteTable::default(),
            backoff: Backoff::new(),
            heartbeat: TimerSlot::new("heartbeat"),
            reconnect: TimerSlot::new("reconnect"),
            generation: 0,
            connecting: false,
            heartbeat_in_flight: false,
        };
        (driver, rx)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Configure(config) => self.configure(config),
                Command::ConnectDue { generation } => {
                    if self.is_current(generation, "reconnect timer") {
                        self.start_connect();
                    }
                }
                Command::ConnectDone { generation, result } => {
                    if self.is_current(generation, "connect result") {
                        self.connect_done(result);
                    }
                }
                Command::HeartbeatTick { generation } => {
                    if self.is_current(generation, "heartbeat tick") {
                        self.heartbeat_tick();
                    }
                }
                Command::HeartbeatDone { generation, result } => {
                    if self.is_current(generation, "heartbeat result") {
                        self.heartbeat_done(result);
                    }
                }
                Command::ExecuteAction { id, options, reply } => {
                    self.execute_action(&id, &options, reply)
                }
                Command::ActionDone {
                    generation,
                    command,
                    result,
                    reply,
                } => {
                    if self.is_current(generation, "action result") {
                        self.action_done(command, result, reply);
                    } else {
                        _ = reply.send(Err(anyhow::anyhow!(
                            "connection was reset while the action was in flight"
                        )));
                    }
                }
                Command::EvaluateFeedback { id, options, reply } => {
                    _ = reply.send(feedbacks::evaluate(&id, &options, self.status, &self.routes));
                }
                Command::VariableChoices { kind, reply } => {
                    _ = reply.send(variables::get_variable_choices(&self.matrix, &kind));
                }
                Command::State { reply } => {
                    _ = reply.send(self.snapshot());
                }
                Command::Destroy { reply } => {
                    self.teardown();
                    if let Some(reply) = reply {
                        _ = reply.send(());
                    }
                    break;
                }
            }
        }
        log::debug!("gateway instance loop finished");
    }

    fn is_current(&self, generation: u64, what: &str) -> bool {
        if generation != self.generation {
            log::debug!(
                "ignoring stale {} (generation {} < {})",
                what,
                generation,
                self.generation
            );
            return false;
        }
        true
    }

    fn set_status(&mut self, status: InstanceStatus, message: Option<&str>) {
        let changed = self.status != status;
        self.status = status;
        self.host.set_status(status, message);
        if changed {
            self.host.check_feedbacks(&[feedbacks::CONNECTION_STATUS]);
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let host = self.config.as_ref().map(|c| c.host.as_str()).unwrap_or("");
        self.host.set_variable_values(variables::status_values(
            self.status,
            self.backoff.attempts(),
            host,
            self.session.as_ref().map(|s| s.last_auth()),
        ));
    }

    /// Forget the current session and everything in flight for it.
    fn invalidate(&mut self) {
        self.generation += 1;
        self.heartbeat.cancel();
        self.session = None;
        self.connecting = false;
        self.heartbeat_in_flight = false;
    }

    fn configure(&mut self, config: GatewayConfig) {
        self.invalidate();
        self.reconnect.cancel();

        if let Err(e) = config.validate() {
            log::error!("{}", e);
            self.config = Some(config);
            self.client = None;
            self.set_status(InstanceStatus::BadConfig, Some(&e.to_string()));
            return;
        }
        let client = match (self.client_factory)(&config) {
            Ok(c) => c,
            Err(e) => {
                log::error!("can't create http client: {:#}", e);
                self.config = Some(config);
                self.client = None;
                self.set_status(InstanceStatus::BadConfig, Some(&format!("{:#}", e)));
                return;
            }
        };
        log::info!("connecting to gateway {}", config.base_url());
        if self.config.as_ref().map(|c| &c.host) != Some(&config.host) {
            self.routes.clear();
        }
        self.config = Some(config);
        self.client = Some(client);
        self.start_connect();
    }

    fn start_connect(&mut self) {
        if self.connecting {
            log::debug!("connect already in progress");
            return;
        }
        let (Some(config), Some(client)) = (self.config.clone(), self.client.clone()) else {
            return;
        };
        self.connecting = true;
        self.set_status(InstanceStatus::Connecting, None);

        let generation = self.generation;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = connect_sequence(client.as_ref(), &config).await;
            _ = tx.send(Command::ConnectDone { generation, result });
        });
    }

    fn connect_done(&mut self, result: Result<(Session, MatrixVariables)>) {
        self.connecting = false;
        let (session, matrix) = match result {
            Ok(v) => v,
            Err(e) => return self.connection_failed("connect", &e),
        };
        self.session = Some(session);
        let previous = std::mem::replace(&mut self.matrix, matrix);
        self.routes.retain_known(&self.matrix);

        self.host
            .set_action_definitions(actions::action_definitions(&self.matrix));
        self.host
            .set_feedback_definitions(feedbacks::feedback_definitions(&self.matrix));
        self.host
            .set_variable_definitions(variables::variable_definitions(&self.matrix));
        let mut values = variables::removed_matrix_values(&previous, &self.matrix);
        values.extend(variables::matrix_values(&self.matrix));
        self.host.set_variable_values(values);

        self.backoff.reset();
        self.reconnect.cancel();
        self.set_status(InstanceStatus::Ok, None);
        self.host
            .check_feedbacks(&[feedbacks::CONNECTION_STATUS, feedbacks::ROUTE_ACTIVE]);
        self.start_heartbeat();
    }

    fn connection_failed(&mut self, stage: &str, err: &anyhow::Error) {
        let kind = GatewayError::classify(err);
        self.invalidate();
        let message = format!("{} failed: {:#}", stage, err);
        self.set_status(InstanceStatus::ConnectionFailure, Some(&message));
        if !GatewayError::is_retryable(kind) {
            log::error!("{}; not retrying", message);
            return;
        }
        self.schedule_reconnect(&message);
    }

    /// Arm the (single) reconnect timer with the next backoff delay.
    fn schedule_reconnect(&mut self, reason: &str) {
        let delay = self.backoff.next_delay();
        log::warn!(
            "{}; reconnecting in {} ms (attempt {})",
            reason,
            delay.as_millis(),
            self.backoff.attempts()
        );
        let generation = self.generation;
        let tx = self.tx.clone();
        self.reconnect.arm(ScheduledTask::once(delay, async move {
            _ = tx.send(Command::ConnectDue { generation });
        }));
        self.publish_status();
    }

    fn start_heartbeat(&mut self) {
        let Some(config) = &self.config else { return };
        let generation = self.generation;
        let tx = self.tx.clone();
        self.heartbeat.arm(ScheduledTask::repeating(
            config.heartbeat_interval(),
            move || {
                let tx = tx.clone();
                async move {
                    _ = tx.send(Command::HeartbeatTick { generation });
                }
            },
        ));
    }

    fn heartbeat_tick(&mut self) {
        if self.heartbeat_in_flight {
            log::debug!("previous heartbeat still in flight");
            return;
        }
        let (Some(session), Some(config), Some(client)) =
            (self.session.as_mut(), self.config.as_ref(), self.client.clone())
        else {
            return;
        };
        let request = heartbeat::heartbeat_request(session, &config.base_url());
        self.heartbeat_in_flight = true;

        let generation = self.generation;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = heartbeat::send_heartbeat(client.as_ref(), request).await;
            _ = tx.send(Command::HeartbeatDone { generation, result });
        });
    }

    fn heartbeat_done(&mut self, result: Result<HttpResponse>) {
        self.heartbeat_in_flight = false;
        match result {
            Ok(response) => {
                if let Some(session) = self.session.as_mut() {
                    session.apply_refresh(&response);
                }
            }
            Err(e) => self.connection_failed("heartbeat", &e),
        }
    }

    fn execute_action(
        &mut self,
        id: &str,
        options: &OptionValues,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.status != InstanceStatus::Ok {
            _ = reply.send(Err(GatewayError::Action(format!(
                "gateway not connected ({})",
                self.status
            ))
            .into()));
            return;
        }
        let command = match ActionCommand::parse(id, options, &self.matrix) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("action {} rejected: {:#}", id, e);
                _ = reply.send(Err(e));
                return;
            }
        };
        let (Some(session), Some(config), Some(client)) =
            (self.session.as_mut(), self.config.as_ref(), self.client.clone())
        else {
            _ = reply.send(Err(GatewayError::Action("no session".into()).into()));
            return;
        };
        let request = command.request(session, &config.base_url());
        log::debug!("action {} -> {} {}", id, request.method, request.path);

        let generation = self.generation;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = actions::send_action(client.as_ref(), request).await;
            _ = tx.send(Command::ActionDone {
                generation,
                command,
                result,
                reply,
            });
        });
    }

    fn action_done(
        &mut self,
        command: ActionCommand,
        result: Result<HttpResponse>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        match result {
            Ok(response) => {
                if let Some(session) = self.session.as_mut() {
                    session.apply_refresh(&response);
                }
                if self.routes.apply(&command) {
                    self.host.check_feedbacks(&[feedbacks::ROUTE_ACTIVE]);
                }
                _ = reply.send(Ok(()));
            }
            Err(e) => {
                log::warn!("action {} failed: {:#}", command.path(), e);
                if GatewayError::classify(&e) == ErrorKind::Authentication {
                    self.connection_failed("action", &e);
                }
                _ = reply.send(Err(e));
            }
        }
    }

    fn snapshot(&self) -> InstanceState {
        InstanceState {
            status: self.status,
            reconnect_attempts: self.backoff.attempts(),
            matrix: self.matrix.clone(),
            heartbeat_active: self.heartbeat.is_armed(),
            reconnect_pending: self.reconnect.is_armed(),
            connect_in_progress: self.connecting,
            nonce_count: self.session.as_ref().map(|s| s.nc()),
            csrf_token: self
                .session
                .as_ref()
                .and_then(|s| s.csrf_token().map(str::to_owned)),
        }
    }

    fn teardown(&mut self) {
        log::info!("gateway instance destroyed");
        self.invalidate();
        self.reconnect.cancel();
        self.client = None;
    }
}

/// Authenticate, then discover matrix features with the new session.
async fn connect_sequence(
    client: &dyn HttpClient,
    config: &GatewayConfig,
) -> Result<(Session, MatrixVariables)> {
    let mut session = auth::authenticate(client, config).await?;
    let matrix = matrix::fetch_matrix_features(client, config, &mut session).await?;
    Ok((session, matrix))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{
        actions::{CUSTOM_REQUEST, ROUTE_SOURCE},
        host::testing::RecordingHost,
        http::{
            testing::{device, ScriptedClient, CHALLENGE},
            HttpRequest, Method,
        },
        matrix::MATRIX_FEATURES_PATH,
    };

    const FEATURES: &str =
        r#"{"sources": ["Mic 1", "Codec A"], "destinations": ["PGM", "AUX"], "presets": ["Morning"]}"#;

    const FEATURES_NO_PRESETS: &str = r#"{"sources": ["Mic 1"], "destinations": ["PGM"]}"#;

    #[derive(Default)]
    struct Switches {
        down: AtomicBool,
        reject_posts: AtomicBool,
        drop_presets: AtomicBool,
    }

    fn gateway(switches: Arc<Switches>) -> ScriptedClient {
        ScriptedClient::with_fallback(move |req: &HttpRequest| {
            if switches.down.load(Ordering::SeqCst) {
                return Err(GatewayError::Network("connection refused".into()).into());
            }
            if req.header("Authorization").is_none() {
                return Ok(HttpResponse::new(401).with_header("WWW-Authenticate", CHALLENGE));
            }
            if req.method == Method::Post && switches.reject_posts.load(Ordering::SeqCst) {
                return Ok(HttpResponse::new(403));
            }
            if req.path == MATRIX_FEATURES_PATH {
                if switches.drop_presets.load(Ordering::SeqCst) {
                    return Ok(HttpResponse::new(200).with_body(FEATURES_NO_PRESETS));
                }
                return Ok(HttpResponse::new(200).with_body(FEATURES));
            }
            Ok(HttpResponse::new(200).with_header("X-CSRF-Token", "tok-1"))
        })
    }

    fn factory(client: Arc<ScriptedClient>) -> ClientFactory {
        Arc::new(move |_: &GatewayConfig| -> Result<Arc<dyn HttpClient>> { Ok(client.clone()) })
    }

    fn start(client: &Arc<ScriptedClient>) -> (Arc<RecordingHost>, GatewayInstance) {
        let host = Arc::new(RecordingHost::default());
        let instance = GatewayInstance::spawn_with_client(host.clone(), factory(client.clone()));
        (host, instance)
    }

    fn config() -> GatewayConfig {
        GatewayConfig::new("10.0.0.5", "admin", "secret")
    }

    fn opts(pairs: &[(&str, &str)]) -> OptionValues {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_registers() {
        let client = Arc::new(device(FEATURES));
        let (host, instance) = start(&client);
        instance.init(config()).unwrap();
        settle().await;

        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::Ok);
        assert_eq!(state.reconnect_attempts, 0);
        assert!(state.heartbeat_active);
        assert!(!state.reconnect_pending);
        assert!(!state.connect_in_progress);
        assert_eq!(state.nonce_count, Some(2));
        assert_eq!(state.csrf_token.as_deref(), Some("tok-1"));
        assert_eq!(state.matrix.get("destinations").unwrap().len(), 2);

        assert_eq!(
            host.status_history(),
            vec![InstanceStatus::Connecting, InstanceStatus::Ok]
        );
        assert_eq!(*host.registrations.lock().unwrap(), 1);
        assert_eq!(host.actions.lock().unwrap().len(), 4);
        assert_eq!(host.value("sources_count").as_deref(), Some("2"));
        assert_eq!(host.value("connection_status").as_deref(), Some("ok"));
        assert_eq!(host.value("device_host").as_deref(), Some("10.0.0.5"));

        let requests = client.recorded();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].url, "http://10.0.0.5:80/api/get_system_info");
        assert!(requests[0].header("Authorization").is_none());
        assert!(requests[1].header("Authorization").unwrap().contains("nc=00000001"));
        assert_eq!(requests[2].path, MATRIX_FEATURES_PATH);
        assert!(requests[2].header("Authorization").unwrap().contains("nc=00000002"));

        assert_eq!(
            instance.get_variable_choices("sources").await.unwrap(),
            vec![Choice::new("Mic 1"), Choice::new("Codec A")]
        );
        assert!(instance.get_variable_choices("inputs").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bad_config_makes_no_requests() {
        let client = Arc::new(device(FEATURES));
        let (host, instance) = start(&client);
        instance
            .init(GatewayConfig::new("", "admin", "secret"))
            .unwrap();
        settle().await;

        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::BadConfig);
        assert!(!state.heartbeat_active);
        assert!(!state.reconnect_pending);
        let (_, message) = host.statuses.lock().unwrap().last().cloned().unwrap();
        assert!(message.unwrap().contains("host is required"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(client.recorded().is_empty());

        let e = instance
            .execute_action(ROUTE_SOURCE, opts(&[("source", "Mic 1"), ("destination", "PGM")]))
            .await
            .unwrap_err();
        assert_eq!(GatewayError::classify(&e), ErrorKind::Action);

        // fixing the config connects
        instance.config_updated(config()).unwrap();
        settle().await;
        assert_eq!(instance.state().await.unwrap().status, InstanceStatus::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_password_on_running_instance_stops_everything() {
        let client = Arc::new(device(FEATURES));
        let (host, instance) = start(&client);
        instance.init(config()).unwrap();
        settle().await;
        assert_eq!(host.last_status(), Some(InstanceStatus::Ok));
        let sent = client.recorded().len();

        instance
            .config_updated(GatewayConfig::new("10.0.0.5", "admin", ""))
            .unwrap();
        settle().await;
        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::BadConfig);
        assert!(!state.heartbeat_active);
        assert!(!state.reconnect_pending);
        assert!(!state.connect_in_progress);
        assert_eq!(state.nonce_count, None);
        assert_eq!(host.last_status(), Some(InstanceStatus::BadConfig));

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(client.recorded().len(), sent);
        assert_eq!(host.last_status(), Some(InstanceStatus::BadConfig));
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_capability_values_are_cleared() {
        let switches = Arc::new(Switches::default());
        let client = Arc::new(gateway(switches.clone()));
        let (host, instance) = start(&client);
        instance.init(config()).unwrap();
        settle().await;
        assert_eq!(host.value("presets_count").as_deref(), Some("1"));
        assert_eq!(host.value("presets_list").as_deref(), Some("Morning"));

        switches.drop_presets.store(true, Ordering::SeqCst);
        instance.config_updated(config()).unwrap();
        settle().await;
        assert_eq!(instance.status().await.unwrap(), InstanceStatus::Ok);
        assert_eq!(host.value("presets_count").as_deref(), Some(""));
        assert_eq!(host.value("presets_list").as_deref(), Some(""));
        assert_eq!(host.value("sources_count").as_deref(), Some("1"));
        assert!(!host
            .variables
            .lock()
            .unwrap()
            .iter()
            .any(|v| v.id == "presets_count"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_session_and_detects_loss() {
        let switches = Arc::new(Switches::default());
        let client = Arc::new(gateway(switches.clone()));
        let (host, instance) = start(&client);
        instance.init(config()).unwrap();
        settle().await;
        assert_eq!(instance.state().await.unwrap().nonce_count, Some(2));

        tokio::time::sleep(Duration::from_secs(30)).await;
        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::Ok);
        assert_eq!(state.nonce_count, Some(3));
        let last = client.recorded().last().cloned().unwrap();
        assert_eq!(last.path, "/api/get_system_info");
        assert!(last.header("Authorization").unwrap().contains("nc=00000003"));

        switches.down.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::ConnectionFailure);
        assert!(!state.heartbeat_active);
        assert!(state.reconnect_pending);
        assert_eq!(state.reconnect_attempts, 1);
        assert_eq!(state.nonce_count, None);
        assert!(host.checked.lock().unwrap().iter().any(|f| f == "connection_status"));

        switches.down.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::Ok);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(state.nonce_count, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backs_off_then_recovers() {
        let switches = Arc::new(Switches::default());
        switches.down.store(true, Ordering::SeqCst);
        let client = Arc::new(gateway(switches.clone()));
        let (host, instance) = start(&client);
        instance.init(config()).unwrap();
        settle().await;

        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::ConnectionFailure);
        assert_eq!(state.reconnect_attempts, 1);
        assert!(state.reconnect_pending);
        assert_eq!(client.recorded().len(), 1);

        // retries at 1 s, then 2 s later, then 4 s later
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(instance.reconnect_attempts().await.unwrap(), 2);
        assert_eq!(client.recorded().len(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(instance.state().await.unwrap().reconnect_attempts, 3);
        assert_eq!(host.value("reconnect_attempts").as_deref(), Some("3"));

        switches.down.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::ConnectionFailure);
        assert_eq!(client.recorded().len(), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::Ok);
        assert_eq!(state.reconnect_attempts, 0);
        assert!(!state.reconnect_pending);
        assert!(state.heartbeat_active);
        assert_eq!(host.value("reconnect_attempts").as_deref(), Some("0"));
        assert_eq!(
            host.status_history(),
            vec![
                InstanceStatus::Connecting,
                InstanceStatus::ConnectionFailure,
                InstanceStatus::Connecting,
                InstanceStatus::ConnectionFailure,
                InstanceStatus::Connecting,
                InstanceStatus::ConnectionFailure,
                InstanceStatus::Connecting,
                InstanceStatus::Ok,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_discards_stale_connect() {
        let client = Arc::new(device(FEATURES).with_delay(Duration::from_secs(5)));
        let (host, instance) = start(&client);
        instance.init(config()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(instance.state().await.unwrap().connect_in_progress);

        instance
            .config_updated(GatewayConfig::new("10.0.0.6", "admin", "secret"))
            .unwrap();
        // first sequence completes at 15 s, second at 16 s
        tokio::time::sleep(Duration::from_millis(14_500)).await;
        assert_eq!(instance.state().await.unwrap().status, InstanceStatus::Connecting);
        assert_eq!(*host.registrations.lock().unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::Ok);
        assert_eq!(*host.registrations.lock().unwrap(), 1);
        assert_eq!(host.value("device_host").as_deref(), Some("10.0.0.6"));
        assert_eq!(
            host.status_history(),
            vec![
                InstanceStatus::Connecting,
                InstanceStatus::Connecting,
                InstanceStatus::Ok
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn actions_route_and_update_feedback() {
        let client = Arc::new(device(FEATURES));
        let (host, instance) = start(&client);
        instance.init(config()).unwrap();
        settle().await;

        let route = opts(&[("source", "Codec A"), ("destination", "PGM")]);
        assert!(!instance.evaluate_feedback(feedbacks::ROUTE_ACTIVE, route.clone()).await.unwrap());
        instance.execute_action(ROUTE_SOURCE, route.clone()).await.unwrap();
        assert!(instance.evaluate_feedback(feedbacks::ROUTE_ACTIVE, route.clone()).await.unwrap());
        assert!(instance
            .evaluate_feedback(feedbacks::CONNECTION_STATUS, OptionValues::new())
            .await
            .unwrap());
        assert!(host.checked.lock().unwrap().iter().any(|f| f == feedbacks::ROUTE_ACTIVE));

        let sent = client.recorded().last().cloned().unwrap();
        assert_eq!(sent.method, Method::Post);
        assert_eq!(sent.path, "/api/set_matrix_route");
        assert_eq!(sent.header("X-CSRF-Token"), Some("tok-1"));
        assert!(sent.header("Authorization").unwrap().contains("nc=00000003"));
        let body: serde_json::Value = serde_json::from_str(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"source": "Codec A", "destination": "PGM"}));

        let e = instance
            .execute_action(ROUTE_SOURCE, opts(&[("source", "Mic 9"), ("destination", "PGM")]))
            .await
            .unwrap_err();
        assert_eq!(GatewayError::classify(&e), ErrorKind::Action);
        assert_eq!(instance.state().await.unwrap().nonce_count, Some(3));

        instance
            .execute_action(
                CUSTOM_REQUEST,
                opts(&[("method", "GET"), ("path", "/api/get_all_programs")]),
            )
            .await
            .unwrap();
        assert_eq!(instance.state().await.unwrap().nonce_count, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_action_triggers_reconnect() {
        let switches = Arc::new(Switches::default());
        let client = Arc::new(gateway(switches.clone()));
        let (_host, instance) = start(&client);
        instance.init(config()).unwrap();
        settle().await;

        switches.reject_posts.store(true, Ordering::SeqCst);
        let e = instance
            .execute_action(ROUTE_SOURCE, opts(&[("source", "Mic 1"), ("destination", "AUX")]))
            .await
            .unwrap_err();
        assert_eq!(GatewayError::classify(&e), ErrorKind::Authentication);
        let state = instance.state().await.unwrap();
        assert_eq!(state.status, InstanceStatus::ConnectionFailure);
        assert!(state.reconnect_pending);

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(instance.status().await.unwrap(), InstanceStatus::Ok);
        assert_eq!(instance.matrix_variables().await.unwrap().get("presets").unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_stops_timers() {
        let client = Arc::new(device(FEATURES));
        let (host, instance) = start(&client);
        instance.init(config()).unwrap();
        settle().await;
        let sent = client.recorded().len();
        let statuses = host.statuses.lock().unwrap().len();

        instance.destroy().await.unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(client.recorded().len(), sent);
        assert_eq!(host.statuses.lock().unwrap().len(), statuses);
    }

    #[tokio::test(start_paused = true)]
    async fn double_schedule_leaves_one_reconnect() {
        let client = Arc::new(device(FEATURES));
        let host = Arc::new(RecordingHost::default());
        let (mut driver, mut rx) = Driver::new(host, factory(client));

        driver.schedule_reconnect("first");
        driver.schedule_reconnect("second");
        assert!(driver.reconnect.is_armed());
        assert_eq!(driver.backoff.attempts(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(rx.try_recv(), Ok(Command::ConnectDue { generation: 0 })));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
