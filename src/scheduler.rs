//! 分批并发调度：批内每台主机一个 tokio 任务，批与批之间严格串行。

use crate::error::DispatchError;
use crate::sequence::CommandSequence;
use crate::transport::RemoteExecutor;
use crate::types::{CommandOutput, ExecutionResult, ExecutionStatus, Host};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, warn};

/// 主机列表中连续的一段，批内并发执行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub index: usize,
    pub hosts: Vec<Host>,
}

/// 一次 dispatch 的参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// 每批最多多少台主机，None 表示全部主机一批
    pub max_parallelism: Option<usize>,
    /// 单次调用的超时，超时记为 `TimedOut`（退出码 124）
    pub invocation_timeout: Option<Duration>,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_parallelism(mut self, max_parallelism: Option<usize>) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout;
        self
    }
}

/// 把主机列表切分为按顺序排列的批
pub fn partition(hosts: &[Host], max_parallelism: Option<usize>) -> Result<Vec<Batch>, DispatchError> {
    let size = match max_parallelism {
        Some(0) => {
            return Err(DispatchError::ConfigError(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        Some(size) => size,
        None => hosts.len().max(1),
    };

    Ok(hosts
        .chunks(size)
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            hosts: chunk.to_vec(),
        })
        .collect())
}

/// 在所有主机上执行同一个命令链
///
/// 命令链只渲染一次。单台主机失败不会影响同批的其它主机，也不会阻止
/// 后续批次；只有参数错误才返回 `Err`。
pub async fn dispatch(
    executor: Arc<dyn RemoteExecutor>,
    hosts: &[Host],
    commands: &CommandSequence,
    options: &DispatchOptions,
) -> Result<Vec<ExecutionResult>, DispatchError> {
    let command = Arc::new(commands.render());
    info!(
        "Dispatching {} command(s) to {} hosts via {}",
        commands.len(),
        hosts.len(),
        executor.name()
    );

    dispatch_with(hosts, options, move |host| {
        let executor = executor.clone();
        let command = command.clone();
        async move { executor.invoke(&host, &command).await }
    })
    .await
}

/// 通用的分批并发执行器，`operation` 对每台主机调用一次
pub async fn dispatch_with<F, Fut>(
    hosts: &[Host],
    options: &DispatchOptions,
    operation: F,
) -> Result<Vec<ExecutionResult>, DispatchError>
where
    F: Fn(Host) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<CommandOutput, DispatchError>> + Send + 'static,
{
    let batches = partition(hosts, options.max_parallelism)?;
    let mut results = Vec::with_capacity(hosts.len());

    for batch in &batches {
        info!(
            "Starting batch {}/{} with {} hosts",
            batch.index + 1,
            batches.len(),
            batch.hosts.len()
        );

        let mut handles = Vec::with_capacity(batch.hosts.len());
        for host in &batch.hosts {
            let handle = task::spawn(run_invocation(
                host.clone(),
                batch.index,
                options.invocation_timeout,
                operation.clone(),
            ));
            handles.push((host.clone(), Utc::now(), handle));
        }

        // 等待本批所有任务完成后才进入下一批
        for (host, spawned_at, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!("Invocation task for {} aborted: {}", host, e);
                    results.push(ExecutionResult::failed(
                        host,
                        batch.index,
                        spawned_at,
                        ExecutionStatus::InvocationFailed(format!("invocation task aborted: {}", e)),
                    ));
                }
            }
        }

        debug!("Batch {} completed", batch.index + 1);
    }

    Ok(results)
}

async fn run_invocation<F, Fut>(
    host: Host,
    batch: usize,
    timeout: Option<Duration>,
    operation: F,
) -> ExecutionResult
where
    F: Fn(Host) -> Fut,
    Fut: Future<Output = Result<CommandOutput, DispatchError>>,
{
    let started_at = Utc::now();
    debug!("Invocation started for host: {}", host);

    let invocation = operation(host.clone());
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, invocation).await.ok(),
        None => Some(invocation.await),
    };

    match outcome {
        Some(Ok(output)) => {
            debug!("Host {} exited with {}", host, output.exit_code);
            ExecutionResult::from_output(host, batch, started_at, output)
        }
        Some(Err(e)) => {
            warn!("Invocation on {} failed: {}", host, e);
            ExecutionResult::failed(
                host,
                batch,
                started_at,
                ExecutionStatus::InvocationFailed(e.to_string()),
            )
        }
        None => {
            warn!("Invocation on {} timed out", host);
            ExecutionResult::failed(host, batch, started_at, ExecutionStatus::TimedOut)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(n: usize) -> Vec<Host> {
        (0..n).map(|i| Host::new(format!("10.0.0.{}", i + 1))).collect()
    }

    #[test]
    fn test_partition_batch_count_and_order() {
        for n in 0..12 {
            for m in 1..6 {
                let list = hosts(n);
                let batches = partition(&list, Some(m)).unwrap();
                assert_eq!(batches.len(), n.div_ceil(m), "n={} m={}", n, m);

                let flattened: Vec<Host> = batches.iter().flat_map(|b| b.hosts.clone()).collect();
                assert_eq!(flattened, list);
                assert!(batches.iter().all(|b| !b.hosts.is_empty() && b.hosts.len() <= m));
                assert!(batches.iter().enumerate().all(|(i, b)| b.index == i));
            }
        }
    }

    #[test]
    fn test_partition_unbounded_is_single_batch() {
        let list = hosts(7);
        let batches = partition(&list, None).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].hosts, list);
    }

    #[test]
    fn test_partition_empty_has_no_batches() {
        assert!(partition(&[], None).unwrap().is_empty());
        assert!(partition(&[], Some(3)).unwrap().is_empty());
    }

    #[test]
    fn test_partition_zero_is_config_error() {
        let err = partition(&hosts(3), Some(0)).unwrap_err();
        assert!(matches!(err, DispatchError::ConfigError(_)));
    }

    #[test]
    fn test_partition_last_batch_smaller() {
        let batches = partition(&hosts(5), Some(2)).unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.hosts.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_dispatch_with_panicking_task_still_reports_host() {
        let list = hosts(3);
        let results = dispatch_with(&list, &DispatchOptions::new(), |host: Host| async move {
            if host.address() == "10.0.0.2" {
                panic!("boom");
            }
            Ok::<_, DispatchError>(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 3);
        let failed: Vec<&ExecutionResult> = results.iter().filter(|r| !r.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].host, Host::new("10.0.0.2"));
        assert!(matches!(failed[0].status, ExecutionStatus::InvocationFailed(_)));
    }
}
