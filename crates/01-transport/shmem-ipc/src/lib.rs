//! Inter-processor message engine on top of the shared-memory rings.
//!
//! Clients register on a numeric address ([`ClientRegistry`]) and submit
//! descriptors on one of three priority lanes ([`TxSubmitter`]). A transmit
//! worker moves them into the outbound ring and hands each payload back once
//! the peer has consumed it ([`TxWorker`]); a receive worker routes inbound
//! descriptors to the addressed client ([`RxDispatcher`]). [`IpcEndpoint`]
//! ties one side together and [`WorkerSet`] runs its workers.

mod config;
mod dispatcher;
mod endpoint;
mod error;
mod lanes;
mod metrics;
mod pipeline;
mod registry;
mod runtime;

pub use config::{DoorbellConfig, HandshakeConfig, IpcConfig, PoolConfig, MAX_CLIENT_SLOTS};
pub use dispatcher::{RxDispatcher, RxStats};
pub use endpoint::{EndpointWiring, EndpointWorkers, IpcEndpoint};
pub use error::{IpcError, IpcResult, Rejected};
pub use lanes::{Priority, PriorityLanes};
pub use metrics::{IpcMetrics, IpcMetricsSnapshot};
pub use pipeline::{DrainStats, Outbound, SubmitPolicy, TxSubmitter, TxWorker};
pub use registry::{ClientRegistry, Delivery, FnClient, IpcClient};
pub use runtime::{run_engine, ServiceEngine, WorkerRuntime, WorkerSet};
