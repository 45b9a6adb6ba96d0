use crate::aggregator::{self, AggregateReport};
use crate::cloud::GcloudCli;
use crate::config::{FleetConfig, ResolverConfig};
use crate::error::DispatchError;
use crate::resolver::{GcloudResolver, HostResolver, StaticResolver};
use crate::scheduler::{self, DispatchOptions};
use crate::sequence::{ChainMode, CommandSequence};
use crate::ssh::SshExecutor;
use crate::transport::{LocalExecutor, OpenSshExecutor, RemoteExecutor, TransportKind};
use crate::types::{ExecutionResult, Host, SshSettings};
use crate::workflow::{Workflow, WorkflowOutcome, WorkflowRunner};
use std::sync::Arc;
use tracing::{info, warn};

/// 面向运维人员的入口
///
/// 只持有注入的能力（解析器、执行器）和默认参数，不保存主机列表；
/// 每次操作都显式传入组名或主机列表。
pub struct FleetManager {
    resolver: Arc<dyn HostResolver>,
    executor: Arc<dyn RemoteExecutor>,
    cloud: Option<GcloudCli>,
    options: DispatchOptions,
    chain_mode: ChainMode,
}

impl FleetManager {
    pub fn new(resolver: Arc<dyn HostResolver>, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            resolver,
            executor,
            cloud: None,
            options: DispatchOptions::default(),
            chain_mode: ChainMode::default(),
        }
    }

    /// 只按配置组装解析器，不检查传输层设置
    pub fn resolver_from_config(
        config: &FleetConfig,
    ) -> Result<Arc<dyn HostResolver>, DispatchError> {
        config.validate_resolver()?;
        let resolver: Arc<dyn HostResolver> = match config.resolver {
            ResolverConfig::Gcloud(ref settings) => {
                Arc::new(GcloudResolver::new(GcloudCli::new(settings.clone())))
            }
            ResolverConfig::Static => Arc::new(StaticResolver::new(config.groups.clone())),
        };
        Ok(resolver)
    }

    /// 按配置组装解析器和执行器
    pub fn from_config(config: &FleetConfig) -> Result<Self, DispatchError> {
        config.validate()?;
        let options = config.dispatch_options();

        let executor: Arc<dyn RemoteExecutor> = match config.transport {
            TransportKind::Ssh2 => Arc::new(
                SshExecutor::new(config.ssh.clone())
                    .with_command_timeout(options.invocation_timeout),
            ),
            TransportKind::Openssh => Arc::new(OpenSshExecutor::new(config.ssh.clone())),
            TransportKind::Local => Arc::new(LocalExecutor::new()),
        };

        let mut manager = Self::new(Self::resolver_from_config(config)?, executor);
        if let Some(settings) = config.resolver.gcloud() {
            manager = manager.with_cloud(GcloudCli::new(settings.clone()));
        }

        info!(
            "Fleet manager ready (transport: {}, resolver: {:?}, chain mode: {})",
            config.transport, config.resolver, config.chain_mode
        );
        Ok(manager
            .with_default_options(options)
            .with_chain_mode(config.chain_mode))
    }

    pub fn with_cloud(mut self, cloud: GcloudCli) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_default_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn default_options(&self) -> DispatchOptions {
        self.options
    }

    /// 流程中每个命令步骤使用的连接方式
    pub fn with_chain_mode(mut self, mode: ChainMode) -> Self {
        self.chain_mode = mode;
        self
    }

    pub fn chain_mode(&self) -> ChainMode {
        self.chain_mode
    }

    /// 解析组内主机
    pub async fn resolve_group(&self, group: &str) -> Result<Vec<Host>, DispatchError> {
        let hosts = self.resolver.resolve(group).await?;
        if hosts.is_empty() {
            warn!("Group {} resolved to no hosts", group);
        }
        Ok(hosts)
    }

    /// 在给定主机上执行命令链，返回每台主机的结果
    pub async fn dispatch(
        &self,
        hosts: &[Host],
        commands: &CommandSequence,
        max_parallelism: Option<usize>,
    ) -> Result<Vec<ExecutionResult>, DispatchError> {
        let options = self.options_for(max_parallelism);
        scheduler::dispatch(self.executor.clone(), hosts, commands, &options).await
    }

    /// 解析、执行、打印报告
    ///
    /// `head_only` 时只在第 0 台主机上执行。
    pub async fn run(
        &self,
        group: &str,
        commands: &CommandSequence,
        max_parallelism: Option<usize>,
        head_only: bool,
    ) -> Result<AggregateReport, DispatchError> {
        let hosts = self.resolve_group(group).await?;
        let targets: Vec<Host> = if head_only {
            hosts.into_iter().take(1).collect()
        } else {
            hosts
        };

        let results = self.dispatch(&targets, commands, max_parallelism).await?;
        aggregator::print_report(group, &results);
        Ok(aggregator::summarize(&results))
    }

    /// 解析组并执行一个具名流程
    pub async fn run_workflow(
        &self,
        group: &str,
        workflow: &Workflow,
    ) -> Result<WorkflowOutcome, DispatchError> {
        let hosts = self.resolve_group(group).await?;
        self.run_workflow_on(group, &hosts, workflow).await
    }

    /// 在已解析的主机列表上执行流程，多个流程可复用同一份列表
    pub async fn run_workflow_on(
        &self,
        group: &str,
        hosts: &[Host],
        workflow: &Workflow,
    ) -> Result<WorkflowOutcome, DispatchError> {
        WorkflowRunner::new(self.executor.clone(), self.options)
            .with_cloud(self.cloud.as_ref())
            .with_chain_mode(self.chain_mode)
            .run(workflow, group, hosts)
            .await
    }

    fn options_for(&self, max_parallelism: Option<usize>) -> DispatchOptions {
        match max_parallelism {
            Some(_) => self.options.with_max_parallelism(max_parallelism),
            None => self.options,
        }
    }

    /// 创建 SSH 参数构建器
    pub fn ssh_builder() -> SshSettingsBuilder {
        SshSettingsBuilder::new()
    }
}

#[derive(Default)]
pub struct SshSettingsBuilder {
    settings: SshSettings,
}

impl SshSettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: SshSettings::default(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.settings.port = port;
        self
    }

    pub fn username(mut self, username: &str) -> Self {
        self.settings.username = username.to_string();
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.settings.password = Some(password.to_string());
        self
    }

    pub fn private_key_path(mut self, path: &str) -> Self {
        self.settings.private_key_path = Some(path.to_string());
        self
    }

    pub fn passphrase(mut self, passphrase: &str) -> Self {
        self.settings.passphrase = Some(passphrase.to_string());
        self
    }

    /// 设为 None 时命令直接交给远程登录 shell
    pub fn shell(mut self, shell: Option<&str>) -> Self {
        self.settings.shell = shell.map(str::to_string);
        self
    }

    pub fn forward_agent(mut self, enabled: bool) -> Self {
        self.settings.forward_agent = enabled;
        self
    }

    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.settings.connect_attempts = attempts;
        self
    }

    pub fn build(self) -> SshSettings {
        self.settings
    }
}
