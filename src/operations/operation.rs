//! Operation types, capability traits and the per-operation state

use crate::common::{Error, Result};
use crate::migration::transport::Transport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Task,
    Websocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    VolumeCreate,
    VolumeCopy,
    VolumeMove,
    VolumeMigrate,
    CustomVolumeBackupRestore,
}

impl OperationType {
    pub fn description(&self) -> &'static str {
        match self {
            OperationType::VolumeCreate => "Creating storage volume",
            OperationType::VolumeCopy => "Copying storage volume",
            OperationType::VolumeMove => "Moving storage volume",
            OperationType::VolumeMigrate => "Migrating storage volume",
            OperationType::CustomVolumeBackupRestore => "Restoring custom volume backup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl OperationStatus {
    pub(crate) fn rank(&self) -> u8 {
        match self {
            OperationStatus::Pending => 0,
            OperationStatus::Running => 1,
            OperationStatus::Success | OperationStatus::Failure | OperationStatus::Cancelled => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn code(&self) -> u16 {
        match self {
            OperationStatus::Pending => 105,
            OperationStatus::Running => 103,
            OperationStatus::Success => 200,
            OperationStatus::Failure => 400,
            OperationStatus::Cancelled => 401,
        }
    }
}

/// Handed to a runner while it executes
#[derive(Clone)]
pub struct OperationContext {
    pub operation: Arc<Operation>,
    pub cancel: CancellationToken,
}

/// Body of an operation
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, ctx: OperationContext) -> Result<()>;
}

/// Extra teardown on cancel; the cancellation token is always triggered
#[async_trait]
pub trait Canceller: Send + Sync {
    async fn cancel(&self) -> Result<()>;
}

/// Receives inbound channels of a websocket operation
#[async_trait]
pub trait ChannelAcceptor: Send + Sync {
    /// Whether `secret` would be accepted right now
    fn accepts(&self, secret: &str) -> bool;

    async fn connect(&self, secret: &str, transport: Box<dyn Transport>) -> Result<()>;
}

/// Canceller for runners that only watch the token
pub struct CooperativeCancel;

#[async_trait]
impl Canceller for CooperativeCancel {
    async fn cancel(&self) -> Result<()> {
        Ok(())
    }
}

/// Everything needed to register an operation
pub struct OperationSpec {
    pub class: OperationClass,
    pub op_type: OperationType,
    pub project: String,
    pub resources: Vec<String>,
    pub metadata: Map<String, Value>,
    pub runner: Arc<dyn Runner>,
    pub canceller: Option<Arc<dyn Canceller>>,
    pub acceptor: Option<Arc<dyn ChannelAcceptor>>,
    /// Conflicts with other exclusive operations on the same resources
    pub exclusive: bool,
}

impl OperationSpec {
    pub fn task(op_type: OperationType, project: &str, runner: Arc<dyn Runner>) -> Self {
        Self {
            class: OperationClass::Task,
            op_type,
            project: project.to_string(),
            resources: Vec::new(),
            metadata: Map::new(),
            runner,
            canceller: Some(Arc::new(CooperativeCancel)),
            acceptor: None,
            exclusive: true,
        }
    }

    pub fn websocket(
        op_type: OperationType,
        project: &str,
        runner: Arc<dyn Runner>,
        acceptor: Arc<dyn ChannelAcceptor>,
        canceller: Arc<dyn Canceller>,
    ) -> Self {
        Self {
            class: OperationClass::Websocket,
            op_type,
            project: project.to_string(),
            resources: Vec::new(),
            metadata: Map::new(),
            runner,
            canceller: Some(canceller),
            acceptor: Some(acceptor),
            exclusive: false,
        }
    }

    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Operation as exposed by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationView {
    pub id: String,
    pub class: OperationClass,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub status_code: u16,
    pub resources: Vec<String>,
    pub metadata: Map<String, Value>,
    pub may_cancel: bool,
    pub err: String,
    pub location: String,
}

struct State {
    status: OperationStatus,
    updated_at: DateTime<Utc>,
    metadata: Map<String, Value>,
    err: Option<String>,
}

pub struct Operation {
    id: String,
    class: OperationClass,
    op_type: OperationType,
    project: String,
    resources: Vec<String>,
    created_at: DateTime<Utc>,
    location: String,
    exclusive: bool,
    state: Mutex<State>,
    runner: Mutex<Option<Arc<dyn Runner>>>,
    canceller: Option<Arc<dyn Canceller>>,
    acceptor: Option<Arc<dyn ChannelAcceptor>>,
    cancel: CancellationToken,
    status_tx: watch::Sender<OperationStatus>,
}

impl Operation {
    pub(crate) fn new(id: String, spec: OperationSpec, location: &str) -> Self {
        let now = Utc::now();
        let (status_tx, _) = watch::channel(OperationStatus::Pending);
        Self {
            id,
            class: spec.class,
            op_type: spec.op_type,
            project: spec.project,
            resources: spec.resources,
            created_at: now,
            location: location.to_string(),
            exclusive: spec.exclusive,
            state: Mutex::new(State {
                status: OperationStatus::Pending,
                updated_at: now,
                metadata: spec.metadata,
                err: None,
            }),
            runner: Mutex::new(Some(spec.runner)),
            canceller: spec.canceller,
            acceptor: spec.acceptor,
            cancel: CancellationToken::new(),
            status_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // State updates never panic while holding the lock
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> String {
        format!("/1.0/operations/{}", self.id)
    }

    pub fn class(&self) -> OperationClass {
        self.class
    }

    pub fn op_type(&self) -> OperationType {
        self.op_type
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn status(&self) -> OperationStatus {
        self.state().status
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state().updated_at
    }

    pub fn may_cancel(&self) -> bool {
        self.canceller.is_some()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn canceller(&self) -> Option<Arc<dyn Canceller>> {
        self.canceller.clone()
    }

    pub(crate) fn acceptor(&self) -> Option<Arc<dyn ChannelAcceptor>> {
        self.acceptor.clone()
    }

    pub(crate) fn take_runner(&self) -> Option<Arc<dyn Runner>> {
        self.runner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn subscribe(&self) -> watch::Receiver<OperationStatus> {
        self.status_tx.subscribe()
    }

    /// Merge a key into the caller-visible metadata
    pub fn set_metadata(&self, key: &str, value: Value) {
        let mut state = self.state();
        state.metadata.insert(key.to_string(), value);
        state.updated_at = Utc::now();
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.state().metadata.clone()
    }

    /// Move forward to `to`; backwards or sideways moves are refused
    pub(crate) fn transition(&self, to: OperationStatus, err: Option<String>) -> Result<()> {
        let mut state = self.state();
        if to.rank() <= state.status.rank() {
            return Err(Error::Conflict(format!(
                "Operation {} cannot go from {:?} to {:?}",
                self.id, state.status, to
            )));
        }
        state.status = to;
        state.updated_at = Utc::now();
        if err.is_some() {
            state.err = err;
        }
        drop(state);
        self.status_tx.send_replace(to);
        Ok(())
    }

    pub fn view(&self) -> OperationView {
        let state = self.state();
        OperationView {
            id: self.id.clone(),
            class: self.class,
            description: self.op_type.description().to_string(),
            created_at: self.created_at,
            updated_at: state.updated_at,
            status: state.status,
            status_code: state.status.code(),
            resources: self.resources.clone(),
            metadata: state.metadata.clone(),
            may_cancel: self.canceller.is_some() && !state.status.is_terminal(),
            err: state.err.clone().unwrap_or_default(),
            location: self.location.clone(),
        }
    }
}
