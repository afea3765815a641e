//! Types and contracts shared between the control plane and managed hosts:
//! the on-host state file schema and the remote command executor contract.

pub mod exec;
pub mod state;

pub use exec::{ExecError, ExecOutput, Executor, MockExecutor};
pub use state::{
	DriftResult, DriftStatus, HelmChartRef, HostState, K0sState, ManagedFile, ManifestRef,
};
