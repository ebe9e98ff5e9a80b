//! Deployment configuration: context table shape, wait bounds and the
//! per-queue backend bindings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use transport::{MempoolBackend, RingBackend};

use crate::error::{CommError, CommResult};

pub const DEFAULT_CONTEXTS: usize = 1;
pub const DEFAULT_QUEUES_PER_CONTEXT: u32 = 5;
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 500;

/// Names one instance on a registered backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    pub backend: String,
    pub instance: u32,
}

impl BackendRef {
    pub fn new(backend: impl Into<String>, instance: u32) -> Self {
        Self {
            backend: backend.into(),
            instance,
        }
    }
}

/// Backends bound to one queue index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    pub ring: BackendRef,
    #[serde(default)]
    pub mempool: Option<BackendRef>,
}

impl QueueBinding {
    pub fn ring(ring: BackendRef) -> Self {
        Self {
            ring,
            mempool: None,
        }
    }

    pub fn with_mempool(mut self, mempool: BackendRef) -> Self {
        self.mempool = Some(mempool);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    pub contexts: usize,
    pub queues_per_context: u32,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub bindings: BTreeMap<u32, QueueBinding>,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            contexts: DEFAULT_CONTEXTS,
            queues_per_context: DEFAULT_QUEUES_PER_CONTEXT,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            bindings: BTreeMap::new(),
        }
    }
}

impl CommConfig {
    /// Adds or replaces the binding for queue `index`.
    pub fn bind(mut self, index: u32, binding: QueueBinding) -> Self {
        self.bindings.insert(index, binding);
        self
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub(crate) fn validate(&self) -> CommResult<()> {
        if self.contexts == 0 {
            return Err(CommError::config("at least one context is required"));
        }
        if self.queues_per_context == 0 {
            return Err(CommError::config("contexts need at least one queue"));
        }
        if self.recv_timeout_ms == 0 || self.send_timeout_ms == 0 {
            return Err(CommError::config("wait bounds must be non-zero"));
        }
        if let Some(index) = self
            .bindings
            .keys()
            .find(|index| **index >= self.queues_per_context)
        {
            return Err(CommError::config(format!(
                "binding for queue {index} exceeds {} queues per context",
                self.queues_per_context
            )));
        }
        Ok(())
    }
}

/// Registry resolving backend handles named in [`BackendRef`]s.
#[derive(Clone, Default)]
pub struct Backends {
    rings: HashMap<String, Arc<dyn RingBackend>>,
    mempools: HashMap<String, Arc<dyn MempoolBackend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ring(mut self, name: impl Into<String>, backend: Arc<dyn RingBackend>) -> Self {
        self.rings.insert(name.into(), backend);
        self
    }

    pub fn with_mempool(
        mut self,
        name: impl Into<String>,
        backend: Arc<dyn MempoolBackend>,
    ) -> Self {
        self.mempools.insert(name.into(), backend);
        self
    }

    pub(crate) fn ring(&self, name: &str) -> CommResult<Arc<dyn RingBackend>> {
        self.rings
            .get(name)
            .cloned()
            .ok_or_else(|| CommError::config(format!("no ring backend named {name:?}")))
    }

    pub(crate) fn mempool(&self, name: &str) -> CommResult<Arc<dyn MempoolBackend>> {
        self.mempools
            .get(name)
            .cloned()
            .ok_or_else(|| CommError::config(format!("no mempool backend named {name:?}")))
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("rings", &self.rings.keys().collect::<Vec<_>>())
            .field("mempools", &self.mempools.keys().collect::<Vec<_>>())
            .finish()
    }
}
