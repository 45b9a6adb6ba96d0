pub mod error;
pub mod types;
pub mod sequence;
pub mod resolver;
pub mod cloud;
pub mod transport;
pub mod ssh;
pub mod scheduler;
pub mod aggregator;
pub mod workflow;
pub mod manager;
pub mod config;
pub mod utils;


pub use error::DispatchError;
pub use types::{
    CommandOutput, ExecutionResult, ExecutionStatus, FileTransferResult, Host, SshSettings,
};
pub use sequence::{ChainMode, CommandSequence};
pub use resolver::{GcloudResolver, HostResolver, StaticResolver};
pub use cloud::{GcloudCli, GcloudSettings};
pub use transport::{LocalExecutor, OpenSshExecutor, RemoteExecutor, TransportKind};
pub use ssh::{SshClient, SshExecutor};
pub use scheduler::{Batch, DispatchOptions, dispatch, dispatch_with, partition};
pub use aggregator::{AggregateReport, print_report, restrict, summarize, write_report};
pub use workflow::{Step, Target, Workflow, WorkflowOutcome, WorkflowPlan, WorkflowRunner};
pub use manager::{FleetManager, SshSettingsBuilder};
pub use config::{FleetConfig, ResolverConfig};

// 便捷的重新导出
pub type Result<T> = std::result::Result<T, DispatchError>;
