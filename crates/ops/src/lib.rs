//! kubelab ops: reconcile the workload, wait for readiness, and keep a local
//! port-forward alive.

#![forbid(unsafe_code)]

pub mod readiness;
pub mod reconcile;
pub mod supervisor;
pub mod tunnel;

pub use readiness::{wait_for_ready, WaitOptions};
pub use reconcile::{ReconcileOutcome, ReconcileStep, Reconciler};
pub use supervisor::{PortForwardSupervisor, SupervisorConfig};
pub use tunnel::{is_netns_closed, CancelHandle, ForwardEvent, KubeTunnel, StreamHandle, TunnelLauncher};
