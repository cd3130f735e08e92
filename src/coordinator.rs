//! Fan-out of downloads and health probes across the registered fleet
//!
//! Every fleet-wide operation snapshots the registry first, so registering or
//! removing endpoints while a fan-out is in flight never affects it. Each
//! targeted endpoint gets its own spawned task and its own result slot; the
//! coordinator joins all of them before building the report.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::client::WorkerClient;
use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::events::FleetEvent;
use crate::model::{
    DownloadOutcome, DownloadRequest, EndpointStatus, Failure, FleetReport, HealthState,
    ReportEntry,
};
use crate::registry::{Endpoint, Registry};

const EVENT_CHANNEL_CAPACITY: usize = 100;

type Operations = Mutex<HashMap<Uuid, CancelHandle>>;

pub struct FleetCoordinator {
    registry: RwLock<Registry>,
    client: WorkerClient,
    probe_timeout: Duration,
    download_timeout: Duration,
    fleet_deadline: Option<Duration>,
    catalog_hosts: Vec<String>,
    default_api_key: Option<String>,
    events: broadcast::Sender<FleetEvent>,
    operations: Operations,
}

impl FleetCoordinator {
    /// Coordinator over `registry` with the default timeouts and paths
    pub fn new(registry: Registry) -> Self {
        let defaults = FleetConfig::default();
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        FleetCoordinator {
            registry: RwLock::new(registry),
            client: WorkerClient::with_paths(&defaults.status_path, &defaults.download_path),
            probe_timeout: defaults.probe_timeout(),
            download_timeout: defaults.download_timeout(),
            fleet_deadline: defaults.fleet_deadline(),
            catalog_hosts: defaults.catalog_hosts,
            default_api_key: None,
            events,
            operations: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        config.validate()?;
        let registry = config.build_registry()?;
        Ok(Self::new(registry)
            .with_client(WorkerClient::with_paths(&config.status_path, &config.download_path))
            .with_probe_timeout(config.probe_timeout())
            .with_download_timeout(config.download_timeout())
            .with_fleet_deadline(config.fleet_deadline())
            .with_catalog_hosts(config.catalog_hosts.clone())
            .with_default_api_key(config.default_api_key.clone()))
    }

    pub fn with_client(mut self, client: WorkerClient) -> Self {
        self.client = client;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn with_fleet_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.fleet_deadline = deadline;
        self
    }

    pub fn with_catalog_hosts(mut self, hosts: Vec<String>) -> Self {
        self.catalog_hosts = hosts;
        self
    }

    pub fn with_default_api_key(mut self, key: Option<String>) -> Self {
        self.default_api_key = key;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    // === Registry ===

    pub async fn register(&self, endpoint: Endpoint) -> Result<()> {
        let mut registry = self.registry.write().await;
        registry.add(endpoint.clone())?;
        info!("Registered endpoint {} at {}", endpoint.name, endpoint.address);
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<Endpoint> {
        let mut registry = self.registry.write().await;
        let removed = registry.remove(name)?;
        info!("Removed endpoint {}", removed.name);
        Ok(removed)
    }

    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.registry.read().await.snapshot()
    }

    // === Health ===

    /// Probe every registered endpoint concurrently, registry order
    pub async fn check_fleet_status(&self) -> Vec<EndpointStatus> {
        let endpoints = self.endpoints().await;
        let states = self.probe_all(&endpoints).await;

        endpoints
            .into_iter()
            .zip(states)
            .map(|(endpoint, state)| EndpointStatus {
                name: endpoint.name,
                address: endpoint.address,
                state,
            })
            .collect()
    }

    /// Registered endpoints that currently answer as online
    pub async fn list_available(&self) -> Vec<Endpoint> {
        let endpoints = self.endpoints().await;
        let states = self.probe_all(&endpoints).await;

        endpoints
            .into_iter()
            .zip(states)
            .filter(|(_, state)| state.is_online())
            .map(|(endpoint, _)| endpoint)
            .collect()
    }

    async fn probe_all(&self, endpoints: &[Endpoint]) -> Vec<HealthState> {
        let probes = endpoints
            .iter()
            .map(|endpoint| self.client.probe(endpoint, self.probe_timeout));
        let states = join_all(probes).await;

        for (endpoint, state) in endpoints.iter().zip(&states) {
            debug!("Endpoint {} is {:?}", endpoint.name, state);
        }
        states
    }

    // === Downloads ===

    /// Direct pass-through to the invoker for one registered endpoint
    pub async fn download_to_one(&self, name: &str, request: DownloadRequest) -> Result<DownloadOutcome> {
        let endpoint = self.registry.read().await.by_name(name)?.clone();
        let request = self.prepare(request)?;

        info!("Dispatching {} to {}", request.source_url(), endpoint.name);
        let outcome = self
            .client
            .invoke(&endpoint, &request, self.download_timeout)
            .await;
        log_outcome(&endpoint.name, &outcome);
        Ok(outcome)
    }

    /// Every registered endpoint, no health filtering. Cancellable through
    /// `cancel` with the operation id announced in the `dispatched` events.
    pub async fn download_to_all(&self, request: DownloadRequest) -> Result<FleetReport> {
        let request = self.prepare(request)?;
        let endpoints = self.endpoints().await;
        let operation = self.track_operation();
        Ok(self
            .fan_out(operation.id, request, endpoints, operation.signal())
            .await)
    }

    /// Probe first; only online endpoints are dispatched to, the rest are
    /// reported as `Unavailable` failures. The fleet deadline and `cancel`
    /// cover the probe phase too.
    pub async fn download_to_online(&self, request: DownloadRequest) -> Result<FleetReport> {
        let request = self.prepare(request)?;
        let endpoints = self.endpoints().await;
        let started_at = Utc::now();
        let operation = self.track_operation();
        let signal = operation.signal().with_deadline(self.fleet_deadline);

        let states = tokio::select! {
            biased;
            states = self.probe_all(&endpoints) => states,
            _ = signal.cancelled() => {
                info!("Operation {}: cancelled while probing", operation.id);
                return Ok(cancelled_report(operation.id, started_at, &endpoints));
            }
        };

        let online: Vec<Endpoint> = endpoints
            .iter()
            .zip(&states)
            .filter(|(_, state)| state.is_online())
            .map(|(endpoint, _)| endpoint.clone())
            .collect();

        let mut report = self.fan_out(operation.id, request, online, signal).await;
        let mut dispatched: HashMap<String, DownloadOutcome> = report
            .entries
            .drain(..)
            .map(|entry| (entry.endpoint, entry.outcome))
            .collect();

        report.entries = endpoints
            .into_iter()
            .zip(states)
            .map(|(endpoint, state)| {
                let outcome = match dispatched.remove(&endpoint.name) {
                    Some(outcome) => outcome,
                    None => Failure::unavailable(state).into(),
                };
                ReportEntry {
                    endpoint: endpoint.name,
                    outcome,
                }
            })
            .collect();
        Ok(report)
    }

    /// Caller-chosen subset (e.g. the result of `list_available`) with an
    /// external cancel signal. The configured fleet deadline still applies.
    pub async fn download_to_endpoints(
        &self,
        request: DownloadRequest,
        endpoints: Vec<Endpoint>,
        cancel: CancelSignal,
    ) -> Result<FleetReport> {
        let endpoints = Registry::from_endpoints(endpoints)?.snapshot();
        let request = self.prepare(request)?;
        Ok(self.fan_out(Uuid::new_v4(), request, endpoints, cancel).await)
    }

    /// Abandon an in-flight fan-out. Returns false if the id is unknown or
    /// the operation already finished.
    pub async fn cancel(&self, operation_id: Uuid) -> bool {
        match lock_operations(&self.operations).get(&operation_id) {
            Some(handle) => {
                info!("Cancelling operation {}", operation_id);
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn active_operations(&self) -> Vec<Uuid> {
        lock_operations(&self.operations).keys().copied().collect()
    }

    fn prepare(&self, request: DownloadRequest) -> Result<DownloadRequest> {
        if !request.host_allowed(&self.catalog_hosts) {
            return Err(FleetError::DisallowedCatalogHost {
                host: request.host().to_string(),
            });
        }
        Ok(request.with_default_credential(self.default_api_key.as_deref()))
    }

    /// Register a cancellable operation. It stays registered until the
    /// returned guard drops, which also cancels anything still pending.
    fn track_operation(&self) -> TrackedOperation<'_> {
        let id = Uuid::new_v4();
        let (handle, _signal) = cancel_pair();
        lock_operations(&self.operations).insert(id, handle.clone());
        TrackedOperation {
            id,
            handle,
            operations: &self.operations,
        }
    }

    async fn fan_out(
        &self,
        operation_id: Uuid,
        request: DownloadRequest,
        endpoints: Vec<Endpoint>,
        cancel: CancelSignal,
    ) -> FleetReport {
        let started_at = Utc::now();
        let cancel = cancel.with_deadline(self.fleet_deadline);
        let request = Arc::new(request);

        info!(
            "Operation {}: dispatching {} to {} endpoint(s)",
            operation_id,
            request.source_url(),
            endpoints.len()
        );

        let tasks = endpoints.iter().map(|endpoint| {
            let client = self.client.clone();
            let endpoint = endpoint.clone();
            let request = Arc::clone(&request);
            let cancel = cancel.clone();
            let events = self.events.clone();
            let timeout = self.download_timeout;

            let _ = events.send(FleetEvent::dispatched(operation_id, &endpoint.name));

            tokio::spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    outcome = client.invoke(&endpoint, &request, timeout) => outcome,
                    _ = cancel.cancelled() => Failure::cancelled().into(),
                };
                log_outcome(&endpoint.name, &outcome);
                let _ = events.send(FleetEvent::settled(operation_id, &endpoint.name, &outcome));
                outcome
            })
        });
        let mut tasks = AbortOnDrop(tasks.collect());
        let results = join_all(tasks.0.iter_mut()).await;

        let entries: Vec<ReportEntry> = endpoints
            .into_iter()
            .zip(results)
            .map(|(endpoint, result)| {
                let outcome = result.unwrap_or_else(|e| {
                    warn!("Worker task for {} did not finish: {}", endpoint.name, e);
                    Failure::transport(format!("worker task failed: {}", e)).into()
                });
                ReportEntry {
                    endpoint: endpoint.name,
                    outcome,
                }
            })
            .collect();

        let report = FleetReport {
            operation_id,
            started_at,
            completed_at: Utc::now(),
            entries,
        };
        info!(
            "Operation {}: {}/{} endpoint(s) succeeded",
            operation_id,
            report.success_count(),
            report.len()
        );
        report
    }
}

struct TrackedOperation<'a> {
    id: Uuid,
    handle: CancelHandle,
    operations: &'a Operations,
}

impl TrackedOperation<'_> {
    fn signal(&self) -> CancelSignal {
        self.handle.signal()
    }
}

impl Drop for TrackedOperation<'_> {
    fn drop(&mut self) {
        lock_operations(self.operations).remove(&self.id);
        self.handle.cancel();
    }
}

/// Per-endpoint tasks of one fan-out; aborted if the fan-out is dropped
/// before they are joined.
struct AbortOnDrop(Vec<JoinHandle<DownloadOutcome>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

fn lock_operations(operations: &Operations) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancelHandle>> {
    operations.lock().unwrap_or_else(PoisonError::into_inner)
}

fn cancelled_report(
    operation_id: Uuid,
    started_at: DateTime<Utc>,
    endpoints: &[Endpoint],
) -> FleetReport {
    FleetReport {
        operation_id,
        started_at,
        completed_at: Utc::now(),
        entries: endpoints
            .iter()
            .map(|endpoint| ReportEntry {
                endpoint: endpoint.name.clone(),
                outcome: Failure::cancelled().into(),
            })
            .collect(),
    }
}

fn log_outcome(endpoint: &str, outcome: &DownloadOutcome) {
    match outcome {
        DownloadOutcome::Success(s) => info!("{}: downloaded {}", endpoint, s.filename),
        DownloadOutcome::Failure(f) => warn!("{}: {:?} failure: {}", endpoint, f.kind, f),
    }
}
