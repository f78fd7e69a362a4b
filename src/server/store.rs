//! An in-memory stand-in for the replicated CA state.
//!
//! [`CaStoreState::apply`] is the state transition that every replica runs
//! for a committed [`CaRequest`]. [`MemoryStore`] runs it directly, acting
//! as a single node log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use async_trait::async_trait;
use log::trace;
use crate::api::{
    ApplyResponse, CaConfiguration, CaRequest, CaRoot, ProviderState,
};
use crate::commons::error::Error;
use crate::commons::CaResult;
use super::delegate::CaStateAccess;


//------------ CaStoreState --------------------------------------------------

/// The replicated CA state of a datacenter.
#[derive(Clone, Debug, Default)]
pub struct CaStoreState {
    config: Option<CaConfiguration>,
    roots: Vec<CaRoot>,
    roots_index: u64,
    provider_states: HashMap<String, ProviderState>,
}

impl CaStoreState {
    pub fn config(&self) -> Option<&CaConfiguration> {
        self.config.as_ref()
    }

    pub fn roots(&self) -> &[CaRoot] {
        &self.roots
    }

    /// The index at which the roots were last modified.
    pub fn roots_index(&self) -> u64 {
        self.roots_index
    }

    pub fn provider_state(&self, id: &str) -> Option<&ProviderState> {
        self.provider_states.get(id)
    }

    /// Applies a committed request at log index `index`.
    ///
    /// Returns whether the request took effect. A request whose
    /// compare-and-set condition fails leaves the state untouched.
    pub fn apply(&mut self, index: u64, request: CaRequest) -> bool {
        match request {
            CaRequest::SetConfig { config, cas_index } => {
                if let Some(cas) = cas_index {
                    let current = self.config.as_ref()
                        .map(|c| c.modify_index)
                        .unwrap_or(0);
                    if current != cas {
                        return false
                    }
                }
                self.set_config(index, config);
                true
            }
            CaRequest::SetRoots { index: cas, roots, config, provider_state } => {
                if cas != self.roots_index {
                    return false
                }
                if roots.iter().filter(|root| root.active).count() > 1 {
                    return false
                }
                self.roots = roots.into_iter().map(|mut root| {
                    if root.create_index == 0 {
                        root.create_index = index;
                    }
                    root.modify_index = index;
                    root
                }).collect();
                self.roots_index = index;
                if let Some(config) = config {
                    self.set_config(index, config);
                }
                if let Some(state) = provider_state {
                    self.provider_states.insert(state.id.clone(), state);
                }
                true
            }
            CaRequest::DeleteProviderState { id } => {
                self.provider_states.remove(&id);
                true
            }
        }
    }

    fn set_config(&mut self, index: u64, mut config: CaConfiguration) {
        config.create_index = self.config.as_ref()
            .map(|c| c.create_index)
            .unwrap_or(index);
        config.modify_index = index;
        self.config = Some(config);
    }
}


//------------ MemoryStore ---------------------------------------------------

/// A single node [`CaStateAccess`] that keeps everything in memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    leader: AtomicBool,
    multi_dc: AtomicBool,
    applied: AtomicUsize,
}

#[derive(Debug, Default)]
struct Inner {
    state: CaStoreState,
    last_index: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store that is leader and supports multi-DC CAs.
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
            leader: AtomicBool::new(true),
            multi_dc: AtomicBool::new(true),
            applied: AtomicUsize::new(0),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst)
    }

    pub fn set_multi_dc_support(&self, supported: bool) {
        self.multi_dc.store(supported, Ordering::SeqCst)
    }

    /// Returns the number of requests committed so far.
    pub fn apply_count(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> CaStoreState {
        self.inner.lock().unwrap().state.clone()
    }
}

#[async_trait]
impl CaStateAccess for MemoryStore {
    fn ca_config(&self) -> CaResult<Option<CaConfiguration>> {
        Ok(self.inner.lock().unwrap().state.config.clone())
    }

    fn ca_roots(&self) -> CaResult<(u64, Vec<CaRoot>)> {
        let inner = self.inner.lock().unwrap();
        Ok((inner.state.roots_index, inner.state.roots.clone()))
    }

    fn active_root(&self) -> CaResult<Option<CaRoot>> {
        Ok(self.inner.lock().unwrap().state.roots.iter()
            .find(|root| root.active)
            .cloned())
    }

    fn provider_state(&self, id: &str) -> CaResult<Option<ProviderState>> {
        Ok(self.inner.lock().unwrap().state.provider_state(id).cloned())
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn servers_support_multi_dc_ca(&self) -> CaResult<()> {
        if self.multi_dc.load(Ordering::SeqCst) {
            Ok(())
        }
        else {
            Err(Error::MultiDcUnsupported(
                "not all servers support cross datacenter CA operations".into()
            ))
        }
    }

    async fn apply_ca_request(
        &self,
        request: CaRequest,
    ) -> CaResult<ApplyResponse> {
        if !self.is_leader() {
            return Err(Error::NotLeader)
        }
        let mut inner = self.inner.lock().unwrap();
        inner.last_index += 1;
        let index = inner.last_index;
        trace!("Committing {} at index {}", request, index);
        let applied = inner.state.apply(index, request);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(ApplyResponse { index, applied })
    }
}


//============ Tests =========================================================
