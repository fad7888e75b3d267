//! Operation tracker
//!
//! Owns every operation from creation until it ages out after reaching a
//! terminal state. Runners execute on their own tokio task; the tracker
//! records the outcome and publishes status changes on a watch channel.

use crate::common::{Error, Result};
use crate::migration::transport::Transport;
use crate::operations::operation::{
    Operation, OperationClass, OperationContext, OperationSpec, OperationStatus, OperationView,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

pub struct OperationTracker {
    ops: RwLock<HashMap<String, Arc<Operation>>>,
    member: String,
    retention: Duration,
}

impl OperationTracker {
    pub fn new(member: impl Into<String>, retention: Duration) -> Self {
        Self {
            ops: RwLock::new(HashMap::new()),
            member: member.into(),
            retention,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Operation>>> {
        self.ops.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Operation>>> {
        self.ops.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new operation in Pending state. Nothing runs until `start`.
    pub fn create(&self, spec: OperationSpec) -> Result<Arc<Operation>> {
        match (spec.class, spec.acceptor.is_some()) {
            (OperationClass::Websocket, false) => {
                return Err(Error::InvalidInput(
                    "Websocket operations require a channel acceptor".into(),
                ))
            }
            (OperationClass::Task, true) => {
                return Err(Error::InvalidInput(
                    "Task operations cannot accept channels".into(),
                ))
            }
            _ => {}
        }

        self.prune();

        let mut ops = self.write();
        if spec.exclusive {
            conflict_in(ops.values(), &spec.resources)?;
        }

        let op = Arc::new(Operation::new(Uuid::new_v4().to_string(), spec, &self.member));
        ops.insert(op.id().to_string(), op.clone());
        tracing::debug!(operation = %op.id(), kind = ?op.op_type(), "Created operation");
        Ok(op)
    }

    /// Fail with `Conflict` if a live exclusive operation touches any of `resources`
    pub fn check_conflict(&self, resources: &[String]) -> Result<()> {
        conflict_in(self.read().values(), resources)
    }

    /// Pending → Running; the runner goes to its own task
    pub fn start(&self, op: &Arc<Operation>) -> Result<()> {
        let runner = op
            .take_runner()
            .ok_or_else(|| Error::Conflict(format!("Operation {} already started", op.id())))?;
        op.transition(OperationStatus::Running, None)?;

        let ctx = OperationContext {
            operation: op.clone(),
            cancel: op.cancel_token().clone(),
        };
        let op = op.clone();
        tokio::spawn(async move {
            let result = runner.run(ctx).await;
            let (status, err) = if op.cancel_token().is_cancelled() {
                (OperationStatus::Cancelled, result.err().map(|e| e.to_string()))
            } else {
                match result {
                    Ok(()) => (OperationStatus::Success, None),
                    Err(e) => (OperationStatus::Failure, Some(e.to_string())),
                }
            };

            match &err {
                Some(msg) => tracing::warn!(operation = %op.id(), status = ?status, "Operation finished: {}", msg),
                None => tracing::info!(operation = %op.id(), status = ?status, "Operation finished"),
            }
            if let Err(e) = op.transition(status, err) {
                tracing::error!(operation = %op.id(), error = %e, "Failed to record operation result");
            }
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<Operation>> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound("Operation not found".into()))
    }

    /// Operations, optionally limited to one project, oldest first
    pub fn list(&self, project: Option<&str>) -> Vec<OperationView> {
        self.prune();
        let mut views: Vec<OperationView> = self
            .read()
            .values()
            .filter(|op| project.map_or(true, |p| op.project() == p))
            .map(|op| op.view())
            .collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    /// Request early termination
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let op = self.get(id)?;
        let canceller = op.canceller().ok_or(Error::NotCancelable)?;
        if op.status().is_terminal() {
            return Err(Error::InvalidInput(format!(
                "Operation {} already finished",
                op.id()
            )));
        }

        let cancel_result = canceller.cancel().await;
        op.cancel_token().cancel();

        // never started: nothing will record the outcome
        if op.status() == OperationStatus::Pending && op.take_runner().is_some() {
            op.transition(OperationStatus::Cancelled, None)?;
        }
        tracing::info!(operation = %op.id(), "Operation cancelled");
        cancel_result
    }

    /// Check a channel secret before upgrading the connection
    pub fn check_secret(&self, id: &str, secret: &str) -> Result<()> {
        let op = self.get(id)?;
        let acceptor = op.acceptor().ok_or_else(|| {
            Error::InvalidInput("Only websocket operations can be connected".into())
        })?;
        if op.status().is_terminal() || !acceptor.accepts(secret) {
            return Err(Error::Forbidden("Invalid websocket secret".into()));
        }
        Ok(())
    }

    /// Hand an inbound channel to a websocket operation
    pub async fn connect(&self, id: &str, secret: &str, transport: Box<dyn Transport>) -> Result<()> {
        let op = self.get(id)?;
        let acceptor = op.acceptor().ok_or_else(|| {
            Error::InvalidInput("Only websocket operations can be connected".into())
        })?;
        if op.status().is_terminal() {
            return Err(Error::Forbidden("Operation already finished".into()));
        }
        acceptor.connect(secret, transport).await
    }

    /// Wait until the operation is terminal or `timeout` elapses
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<OperationView> {
        let op = self.get(id)?;
        let mut rx = op.subscribe();
        let done = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };

        match timeout {
            Some(t) => {
                let _ = tokio::time::timeout(t, done).await;
            }
            None => done.await,
        }
        Ok(op.view())
    }

    /// Forget terminal operations older than the retention period
    fn prune(&self) {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - retention;
        self.write()
            .retain(|_, op| !(op.status().is_terminal() && op.updated_at() < cutoff));
    }
}

fn conflict_in<'a>(
    ops: impl Iterator<Item = &'a Arc<Operation>>,
    resources: &[String],
) -> Result<()> {
    for op in ops {
        if !op.is_exclusive() || op.status().is_terminal() {
            continue;
        }
        if let Some(url) = op.resources().iter().find(|r| resources.contains(r)) {
            return Err(Error::Conflict(format!(
                "Operation {} on {} is already in progress",
                op.id(),
                url
            )));
        }
    }
    Ok(())
}
