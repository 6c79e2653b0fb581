use std::net::IpAddr;
use std::path::PathBuf;

use tracing::warn;

use super::host::{HostNetwork, Route};

/// A resource acquired during a multi-step operation, undone on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    DeleteLink(String),
    DeleteOvsBridge(String),
    DeleteNeighProxy { device: String, address: IpAddr },
    DeleteRoute(Route),
    RemoveFile(PathBuf),
}

/// Ordered list of undo actions. `fail` runs them newest first; `success` discards them.
#[derive(Debug, Default)]
pub struct Reverter {
    actions: Vec<UndoAction>,
}

impl Reverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    pub fn success(mut self) {
        self.actions.clear();
    }

    /// Hand the pending actions to an outer reverter, keeping their order.
    pub fn merge_into(mut self, outer: &mut Reverter) {
        outer.actions.append(&mut self.actions);
    }

    /// Undo everything in reverse. Individual failures are logged and skipped.
    pub async fn fail(mut self, host: &dyn HostNetwork) {
        while let Some(action) = self.actions.pop() {
            let result = match &action {
                UndoAction::DeleteLink(name) => host.delete_link(name).await,
                UndoAction::DeleteOvsBridge(name) => host.ovs_delete_bridge(name).await,
                UndoAction::DeleteNeighProxy { device, address } => {
                    host.delete_neigh_proxy(device, *address).await
                }
                UndoAction::DeleteRoute(route) => host.delete_route(route).await,
                UndoAction::RemoveFile(path) => match tokio::fs::remove_file(path).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                    _ => Ok(()),
                },
            };

            if let Err(e) = result {
                warn!(action = ?action, err = %e, "Failed reverting");
            }
        }
    }
}

impl Drop for Reverter {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(pending = self.actions.len(), "Reverter dropped with pending undo actions");
        }
    }
}
