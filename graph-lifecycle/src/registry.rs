//! Single-owner lifecycle of the graph clients.
//!
//! Each logical name owns a slot that moves forward through
//! `Uninitialized -> Initializing -> Ready -> Disposing -> Disposed`. A failed
//! or cancelled construction drops back to `Uninitialized` so it can be
//! retried; nothing else ever moves backwards.
//!
//! Construction and disposal of a name are serialized by a per-slot async
//! gate. Lookups only take the slot's state lock for as long as it takes to
//! clone a handle, so they never wait for a construction or a close.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use common_bolt::GraphDriver;
use futures::FutureExt;

use crate::config::ConnectionConfig;
use crate::error::{DisposalFailure, InitError};
use crate::factory::SharedFactory;
use crate::metrics::{emit_disposal, emit_registration};
use crate::shutdown::{ShutdownCallback, ShutdownCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Disposing,
    Disposed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Disposing => "disposing",
            LifecycleState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, read-only view of a live client.
///
/// Cloning is cheap. Only the registry closes the underlying driver; holders
/// of a handle can ping it and read its statistics.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

pub(crate) struct HandleInner {
    name: String,
    driver: GraphDriver,
    config: ConnectionConfig,
    disposed: AtomicBool,
}

impl HandleInner {
    pub(crate) fn driver(&self) -> &GraphDriver {
        &self.driver
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl ClientHandle {
    fn new(name: &str, driver: GraphDriver, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name: name.to_string(),
                driver,
                config,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn driver(&self) -> &GraphDriver {
        &self.inner.driver
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// True once disposal of this handle has started.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Whether both handles refer to the same constructed client.
    pub fn same_client(&self, other: &ClientHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleInner> {
        Arc::downgrade(&self.inner)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("name", &self.inner.name)
            .field("endpoint", &self.inner.config.endpoint)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[derive(Debug)]
pub enum DisposalOutcome {
    /// This call closed the client.
    Closed,
    /// This call closed the client but the close reported a failure. The
    /// client is disposed regardless.
    ClosedWithFailure(DisposalFailure),
    /// The name was never constructed; nothing to close.
    NotReady,
    /// Another call closed, or is closing, the client.
    AlreadyDisposed,
}

impl DisposalOutcome {
    pub fn performed_close(&self) -> bool {
        matches!(
            self,
            DisposalOutcome::Closed | DisposalOutcome::ClosedWithFailure(_)
        )
    }
}

/// Single-use right to dispose of one registered client.
#[must_use = "dropping the token leaves the client open until someone disposes it by name"]
pub struct DisposalToken {
    registry: LifecycleRegistry,
    handle: ClientHandle,
}

impl DisposalToken {
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Disposes of the client. A no-op if it is no longer `Ready`.
    pub async fn dispose(self) -> DisposalOutcome {
        self.registry.dispose(self.handle.name()).await
    }

    pub fn into_shutdown_callback(self) -> ShutdownCallback {
        Box::new(move || {
            async move {
                self.dispose().await;
            }
            .boxed()
        })
    }
}

impl fmt::Debug for DisposalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposalToken")
            .field("name", &self.name())
            .finish()
    }
}

struct SlotState {
    lifecycle: LifecycleState,
    handle: Option<ClientHandle>,
    // number of construction attempts that have finished, successfully or not
    settled: u64,
    last_failure: Option<(u64, InitError)>,
}

struct Slot {
    gate: tokio::sync::Mutex<()>,
    state: RwLock<SlotState>,
    shutdown_attached: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            state: RwLock::new(SlotState {
                lifecycle: LifecycleState::Uninitialized,
                handle: None,
                settled: 0,
                last_failure: None,
            }),
            shutdown_attached: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SlotState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, SlotState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Puts a slot back to `Uninitialized` if a registration is dropped halfway.
struct InitializingGuard<'a> {
    name: &'a str,
    slot: &'a Slot,
    armed: bool,
}

impl InitializingGuard<'_> {
    fn settle(mut self, outcome: Result<ClientHandle, InitError>) {
        self.armed = false;
        let mut state = self.slot.write();
        state.settled += 1;
        match outcome {
            Ok(handle) => {
                state.lifecycle = LifecycleState::Ready;
                state.handle = Some(handle);
                state.last_failure = None;
            }
            Err(err) => {
                state.lifecycle = LifecycleState::Uninitialized;
                let attempt = state.settled;
                state.last_failure = Some((attempt, err));
            }
        }
    }
}

impl Drop for InitializingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.slot.write();
        if state.lifecycle == LifecycleState::Initializing {
            state.lifecycle = LifecycleState::Uninitialized;
            state.settled += 1;
            state.last_failure = None;
            tracing::warn!(client = %self.name, "Lifecycle: graph client registration cancelled");
        }
    }
}

/// Marks a slot `Disposed` once closing ends, including when the dispose
/// future is dropped mid-close.
struct DisposingGuard<'a> {
    slot: &'a Slot,
}

impl Drop for DisposingGuard<'_> {
    fn drop(&mut self) {
        self.slot.write().lifecycle = LifecycleState::Disposed;
    }
}

/// Owns every graph client of the process, one per logical name.
///
/// Built once at startup and passed by reference (or cheap clone) to whatever
/// needs a client; there is no global instance.
#[derive(Clone)]
pub struct LifecycleRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    factory: SharedFactory,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

impl LifecycleRegistry {
    pub fn new(factory: SharedFactory) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                factory,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn existing_slot(&self, name: &str) -> Option<Arc<Slot>> {
        let slots = match self.inner.slots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.get(name).cloned()
    }

    fn slot(&self, name: &str) -> Arc<Slot> {
        if let Some(slot) = self.existing_slot(name) {
            return slot;
        }
        let mut slots = match self.inner.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Constructs the client for `name` and publishes it.
    ///
    /// Concurrent calls for the same name construct once: the others wait
    /// and receive the same client, or the same error. After a failure the
    /// slot is back to `Uninitialized` and a later call may try again. Calling
    /// this on a `Ready` name hands out another token for the existing client.
    pub async fn register(
        &self,
        name: &str,
        config: ConnectionConfig,
    ) -> Result<DisposalToken, InitError> {
        let slot = self.slot(name);
        let seen = slot.read().settled;

        let _gate = slot.gate.lock().await;

        {
            let mut state = slot.write();
            match state.lifecycle {
                LifecycleState::Ready => {
                    if let Some(handle) = state.handle.clone() {
                        return Ok(DisposalToken {
                            registry: self.clone(),
                            handle,
                        });
                    }
                }
                LifecycleState::Disposing | LifecycleState::Disposed => {
                    return Err(InitError::Disposed(name.to_string()));
                }
                LifecycleState::Uninitialized | LifecycleState::Initializing => {}
            }
            // the attempt we queued behind failed: share its error rather
            // than constructing again
            if let Some((attempt, err)) = &state.last_failure {
                if *attempt > seen {
                    return Err(err.clone());
                }
            }
            state.lifecycle = LifecycleState::Initializing;
        }

        let guard = InitializingGuard {
            name,
            slot: &slot,
            armed: true,
        };
        tracing::info!(
            client = %name,
            endpoint = %config.endpoint,
            "Lifecycle: constructing graph client"
        );

        match self.inner.factory.build(&config).await {
            Ok(driver) => {
                let handle = ClientHandle::new(name, driver, config);
                guard.settle(Ok(handle.clone()));
                emit_registration(name, "success");
                tracing::info!(client = %name, "Lifecycle: graph client ready");
                Ok(DisposalToken {
                    registry: self.clone(),
                    handle,
                })
            }
            Err(err) => {
                guard.settle(Err(err.clone()));
                emit_registration(name, err.as_label());
                tracing::warn!(
                    client = %name,
                    error = %err,
                    retryable = err.is_retryable(),
                    "Lifecycle: graph client construction failed"
                );
                Err(err)
            }
        }
    }

    /// Registers `name` and hands its disposal to `coordinator`. The
    /// callback is attached once per name, however often this is called.
    pub async fn register_with_shutdown(
        &self,
        name: &str,
        config: ConnectionConfig,
        coordinator: &dyn ShutdownCoordinator,
    ) -> Result<ClientHandle, InitError> {
        let token = self.register(name, config).await?;
        let handle = token.handle().clone();

        let slot = self.slot(name);
        if !slot.shutdown_attached.swap(true, Ordering::SeqCst) {
            coordinator.on_shutdown(name, token.into_shutdown_callback());
        }
        Ok(handle)
    }

    /// The published client, if `name` is `Ready`. Never waits for an
    /// in-flight construction or close.
    pub fn get(&self, name: &str) -> Option<ClientHandle> {
        let slot = self.existing_slot(name)?;
        let state = slot.read();
        match state.lifecycle {
            LifecycleState::Ready => state.handle.clone(),
            _ => None,
        }
    }

    pub fn state(&self, name: &str) -> LifecycleState {
        self.existing_slot(name)
            .map_or(LifecycleState::Uninitialized, |slot| slot.read().lifecycle)
    }

    /// Closes the client published under `name`.
    ///
    /// Waits for an in-flight registration to settle first. Only the first
    /// call that finds the client `Ready` closes it; every other call is a
    /// no-op. The close is bounded by the client's dispose timeout and the
    /// slot ends `Disposed` whatever the close reports.
    pub async fn dispose(&self, name: &str) -> DisposalOutcome {
        let Some(slot) = self.existing_slot(name) else {
            return DisposalOutcome::NotReady;
        };

        let _gate = slot.gate.lock().await;

        let handle = {
            let mut state = slot.write();
            match state.lifecycle {
                LifecycleState::Ready => {
                    state.lifecycle = LifecycleState::Disposing;
                    state.handle.take()
                }
                LifecycleState::Disposing | LifecycleState::Disposed => {
                    return DisposalOutcome::AlreadyDisposed;
                }
                LifecycleState::Uninitialized | LifecycleState::Initializing => {
                    return DisposalOutcome::NotReady;
                }
            }
        };
        let _disposed = DisposingGuard { slot: &slot };

        let Some(handle) = handle else {
            return DisposalOutcome::AlreadyDisposed;
        };
        handle.inner.disposed.store(true, Ordering::SeqCst);
        tracing::info!(client = %name, "Lifecycle: disposing graph client");

        let timeout = handle.config().dispose_timeout;
        let outcome = match tokio::time::timeout(timeout, handle.driver().close()).await {
            Ok(Ok(())) => DisposalOutcome::Closed,
            Ok(Err(err)) => DisposalOutcome::ClosedWithFailure(DisposalFailure::CloseFailed(err)),
            Err(_) => DisposalOutcome::ClosedWithFailure(DisposalFailure::CloseTimedOut(timeout)),
        };

        match &outcome {
            DisposalOutcome::ClosedWithFailure(failure) => {
                emit_disposal(name, "failure");
                tracing::warn!(
                    client = %name,
                    error = %failure,
                    "Lifecycle: graph client disposed with errors"
                );
            }
            _ => {
                emit_disposal(name, "success");
                tracing::info!(client = %name, "Lifecycle: graph client disposed");
            }
        }
        outcome
    }
}
