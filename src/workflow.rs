//! 具名运维流程。每个流程只产生数据（步骤 + 命令链），由
//! [`WorkflowRunner`] 交给调度器执行。

use crate::aggregator::{self, AggregateReport};
use crate::cloud::GcloudCli;
use crate::error::DispatchError;
use crate::scheduler::{self, DispatchOptions};
use crate::sequence::{ChainMode, CommandSequence};
use crate::transport::RemoteExecutor;
use crate::types::{CommandOutput, Host};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// 步骤作用的主机子集
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    All,
    /// 第 0 台主机
    Head,
    AllButHead,
}

impl Target {
    pub fn select(&self, hosts: &[Host]) -> Vec<Host> {
        match self {
            Target::All => hosts.to_vec(),
            Target::Head => hosts.iter().take(1).cloned().collect(),
            Target::AllButHead => hosts.iter().skip(1).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Run {
        name: String,
        target: Target,
        commands: CommandSequence,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_parallelism: Option<usize>,
    },
    Upload {
        name: String,
        target: Target,
        remote_path: String,
        contents: String,
        mode: i32,
    },
    /// 本地、串行执行：把磁盘挂到 head 实例上
    AttachDisk { name: String, disk: String },
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Run { name, .. } | Step::Upload { name, .. } | Step::AttachDisk { name, .. } => {
                name.as_str()
            }
        }
    }

    fn target(&self) -> Option<Target> {
        match self {
            Step::Run { target, .. } | Step::Upload { target, .. } => Some(*target),
            Step::AttachDisk { .. } => Some(Target::Head),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub name: String,
    pub steps: Vec<Step>,
}

impl WorkflowPlan {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    /// 把所有命令步骤改成指定的连接方式
    pub fn with_chain_mode(mut self, mode: ChainMode) -> Self {
        for step in &mut self.steps {
            if let Step::Run { commands, .. } = step {
                *commands = std::mem::take(commands).with_mode(mode);
            }
        }
        self
    }

    fn run(mut self, name: &str, target: Target, commands: CommandSequence) -> Self {
        self.steps.push(Step::Run {
            name: name.to_string(),
            target,
            commands,
            max_parallelism: None,
        });
        self
    }

    fn run_bounded(
        mut self,
        name: &str,
        target: Target,
        commands: CommandSequence,
        max_parallelism: usize,
    ) -> Self {
        self.steps.push(Step::Run {
            name: name.to_string(),
            target,
            commands,
            max_parallelism: Some(max_parallelism),
        });
        self
    }

    fn upload(mut self, name: &str, target: Target, remote_path: &str, contents: String) -> Self {
        self.steps.push(Step::Upload {
            name: name.to_string(),
            target,
            remote_path: remote_path.to_string(),
            contents,
            mode: 0o644,
        });
        self
    }

    fn attach_disk(mut self, disk: &str) -> Self {
        self.steps.push(Step::AttachDisk {
            name: format!("attach disk {}", disk),
            disk: disk.to_string(),
        });
        self
    }

    pub fn needs_upload(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::Upload { .. }))
    }

    pub fn needs_cloud(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::AttachDisk { .. }))
    }

    pub fn needs_head(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.target(), Some(Target::Head)))
    }
}

/// conda 环境：`source <root>/bin/activate <name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CondaEnv {
    pub root: String,
    pub name: String,
}

impl Default for CondaEnv {
    fn default() -> Self {
        Self {
            root: "/anaconda3".to_string(),
            name: "torch-xla-nightly".to_string(),
        }
    }
}

impl CondaEnv {
    pub fn activate(&self) -> String {
        format!("source {}/bin/activate {}", self.root, self.name)
    }
}

fn default_models_dir() -> String {
    "/mnt/models-disk".to_string()
}

fn default_size_marker() -> String {
    "200G".to_string()
}

fn default_packages() -> Vec<String> {
    vec!["dstat".to_string()]
}

fn default_package() -> String {
    "transformers".to_string()
}

fn default_package_source() -> String {
    "git+https://github.com/matt-peters/transformers.git@working".to_string()
}

fn default_nofile() -> u64 {
    500_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "workflow", rename_all = "snake_case")]
pub enum Workflow {
    KillPython,
    DeployBranch {
        branch: String,
        code_dir: String,
        #[serde(default)]
        env: CondaEnv,
    },
    CreateImagenet100 {
        script: String,
        input_dir: String,
        output_dir: String,
        #[serde(default)]
        env: CondaEnv,
    },
    MountDisk {
        mount_location: String,
        /// `/dev` 下的设备名，例如 `sdb`
        device: String,
    },
    MountModelDisk {
        mount_location: String,
        device: String,
        #[serde(default = "default_models_dir")]
        models_dir: String,
    },
    MountHeadNodeModels {
        disk: String,
        #[serde(default = "default_size_marker")]
        size_marker: String,
        #[serde(default = "default_models_dir")]
        mount_location: String,
        #[serde(default = "default_packages")]
        packages: Vec<String>,
    },
    CopyFromHead {
        file_dir: String,
        file_name: String,
    },
    UpgradePackage {
        #[serde(default = "default_package")]
        package: String,
        #[serde(default = "default_package_source")]
        source: String,
        #[serde(default)]
        env: CondaEnv,
    },
    IncreaseUlimit {
        profile_path: String,
        #[serde(default = "default_nofile")]
        nofile: u64,
        #[serde(default)]
        env: CondaEnv,
    },
}

fn require(field: &str, value: &str) -> Result<(), DispatchError> {
    if value.trim().is_empty() {
        return Err(DispatchError::ValidationError(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

fn mount_commands(mount_location: &str, device: &str) -> CommandSequence {
    CommandSequence::new([
        format!("sudo mkdir -p {}", mount_location),
        format!("sudo chmod a+w {}", mount_location),
        format!(
            "sudo mount -o discard,defaults /dev/{} {}",
            device, mount_location
        ),
    ])
}

fn writable_dir_commands(dir: &str) -> CommandSequence {
    CommandSequence::new([format!("sudo mkdir -p {}", dir), format!("sudo chmod a+w {}", dir)])
}

/// 登录 shell 使用的 `.profile`，不再设置 ulimit
fn profile_contents(env: &CondaEnv) -> String {
    format!(
        r#"# if running bash
if [ -n "$BASH_VERSION" ]; then
    # include .bashrc if it exists
    if [ -f "$HOME/.bashrc" ]; then
    . "$HOME/.bashrc"
    fi
fi

# set PATH so it includes user's private bin if it exists
if [ -d "$HOME/bin" ] ; then
    PATH="$HOME/bin:$PATH"
fi

export PATH={}/bin:$HOME/bin:$HOME/.local/bin:$PATH
"#,
        env.root
    )
}

impl Workflow {
    pub fn name(&self) -> &'static str {
        match self {
            Workflow::KillPython => "kill_python",
            Workflow::DeployBranch { .. } => "deploy_branch",
            Workflow::CreateImagenet100 { .. } => "create_imagenet100",
            Workflow::MountDisk { .. } => "mount_disk",
            Workflow::MountModelDisk { .. } => "mount_model_disk",
            Workflow::MountHeadNodeModels { .. } => "mount_head_node_models",
            Workflow::CopyFromHead { .. } => "copy_from_head",
            Workflow::UpgradePackage { .. } => "upgrade_package",
            Workflow::IncreaseUlimit { .. } => "increase_ulimit",
        }
    }

    /// 生成执行计划；`hosts` 只用于需要 head 地址的流程
    pub fn plan(&self, hosts: &[Host]) -> Result<WorkflowPlan, DispatchError> {
        let plan = WorkflowPlan::new(self.name());

        let plan = match self {
            Workflow::KillPython => {
                plan.run("kill python", Target::All, CommandSequence::new(["pkill python"]))
            }
            Workflow::DeployBranch {
                branch,
                code_dir,
                env,
            } => {
                require("branch", branch)?;
                require("code_dir", code_dir)?;
                plan.run(
                    "deploy branch",
                    Target::All,
                    CommandSequence::new([
                        format!("cd {}", code_dir),
                        "git fetch origin".to_string(),
                        format!("git checkout {}", branch),
                        format!("git pull origin {}", branch),
                        env.activate(),
                        "python setup.py install".to_string(),
                    ]),
                )
            }
            Workflow::CreateImagenet100 {
                script,
                input_dir,
                output_dir,
                env,
            } => {
                require("script", script)?;
                require("input_dir", input_dir)?;
                require("output_dir", output_dir)?;
                plan.run(
                    "create imagenet100",
                    Target::All,
                    CommandSequence::new([
                        env.activate(),
                        format!("mkdir -p {}", output_dir),
                        format!(
                            "python {} --input_dir {} --output_dir {}",
                            script, input_dir, output_dir
                        ),
                    ]),
                )
            }
            Workflow::MountDisk {
                mount_location,
                device,
            } => {
                require("mount_location", mount_location)?;
                require("device", device)?;
                plan.run("mount disk", Target::All, mount_commands(mount_location, device))
            }
            Workflow::MountModelDisk {
                mount_location,
                device,
                models_dir,
            } => {
                require("mount_location", mount_location)?;
                require("device", device)?;
                plan.run("mount disk", Target::All, mount_commands(mount_location, device))
                    .run(
                        "create models directory",
                        Target::All,
                        writable_dir_commands(models_dir),
                    )
            }
            Workflow::MountHeadNodeModels {
                disk,
                size_marker,
                mount_location,
                packages,
            } => {
                require("disk", disk)?;
                let mut head = CommandSequence::new([
                    "sudo lsblk".to_string(),
                    format!(
                        r#"sb_loc=`sudo lsblk | grep {} | cut -f 1 -d " "`"#,
                        size_marker
                    ),
                    r#"echo "Got $sb_loc for mounting""#.to_string(),
                    format!("sudo mkdir -p {}", mount_location),
                    format!("sudo chmod ugo+w {}", mount_location),
                    format!(
                        "sudo mount -o discard,defaults /dev/$sb_loc {}",
                        mount_location
                    ),
                ]);
                if !packages.is_empty() {
                    head = head.then(format!("sudo apt-get -y install {}", packages.join(" ")));
                }
                // 其它节点也需要这个目录存在，日志会写到这里
                plan.attach_disk(disk)
                    .run("mount models disk on head", Target::Head, head)
                    .run(
                        "create models directory",
                        Target::All,
                        writable_dir_commands(mount_location),
                    )
            }
            Workflow::CopyFromHead {
                file_dir,
                file_name,
            } => {
                require("file_dir", file_dir)?;
                require("file_name", file_name)?;
                let head = hosts.first().ok_or_else(|| {
                    DispatchError::ValidationError(
                        "copy_from_head needs at least one host".to_string(),
                    )
                })?;
                let full_path = Path::new(file_dir).join(file_name);
                let full_path = full_path.to_string_lossy();
                plan.run_bounded(
                    "copy file from head",
                    Target::AllButHead,
                    CommandSequence::new([
                        format!("mkdir -p {}", file_dir),
                        format!(
                            "scp -oStrictHostKeyChecking=no {}:{} {}",
                            head, full_path, full_path
                        ),
                    ]),
                    4,
                )
            }
            Workflow::UpgradePackage {
                package,
                source,
                env,
            } => {
                require("package", package)?;
                require("source", source)?;
                plan.run(
                    "upgrade package",
                    Target::All,
                    CommandSequence::new([
                        env.activate(),
                        format!("yes | pip uninstall {}", package),
                        format!("pip install {}", source),
                    ]),
                )
            }
            Workflow::IncreaseUlimit {
                profile_path,
                nofile,
                env,
            } => {
                require("profile_path", profile_path)?;
                if *nofile == 0 {
                    return Err(DispatchError::ValidationError(
                        "nofile must be positive".to_string(),
                    ));
                }
                plan.upload(
                    "replace profile",
                    Target::All,
                    profile_path,
                    profile_contents(env),
                )
                .run(
                    "raise nofile limit",
                    Target::All,
                    CommandSequence::new([format!(
                        r#"printf '*  soft    nofile       {0}\n*  hard    nofile       {0}\n' | sudo tee /etc/security/limits.conf > /dev/null"#,
                        nofile
                    )]),
                )
            }
        };

        Ok(plan)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub name: String,
    /// 本地步骤（挂载磁盘）没有逐主机结果
    pub report: Option<AggregateReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub workflow: String,
    pub steps: Vec<StepOutcome>,
}

impl WorkflowOutcome {
    pub fn total_failures(&self) -> usize {
        self.steps
            .iter()
            .filter_map(|s| s.report.as_ref())
            .map(|r| r.failed)
            .sum()
    }
}

/// 执行流程计划
///
/// 步骤按顺序执行；某一步有主机失败时记录下来并继续后面的步骤。
pub struct WorkflowRunner<'a> {
    executor: Arc<dyn RemoteExecutor>,
    cloud: Option<&'a GcloudCli>,
    options: DispatchOptions,
    chain_mode: ChainMode,
}

impl<'a> WorkflowRunner<'a> {
    pub fn new(executor: Arc<dyn RemoteExecutor>, options: DispatchOptions) -> Self {
        Self {
            executor,
            cloud: None,
            options,
            chain_mode: ChainMode::default(),
        }
    }

    pub fn with_cloud(mut self, cloud: Option<&'a GcloudCli>) -> Self {
        self.cloud = cloud;
        self
    }

    pub fn with_chain_mode(mut self, mode: ChainMode) -> Self {
        self.chain_mode = mode;
        self
    }

    /// 在执行任何步骤之前检查能力是否齐全
    fn check(&self, plan: &WorkflowPlan, hosts: &[Host]) -> Result<(), DispatchError> {
        if plan.needs_upload() && !self.executor.supports_upload() {
            return Err(DispatchError::NotImplemented(format!(
                "workflow {} uploads files, which the {} transport does not support",
                plan.name,
                self.executor.name()
            )));
        }
        if plan.needs_cloud() && self.cloud.is_none() {
            return Err(DispatchError::NotImplemented(format!(
                "workflow {} attaches a disk and needs the gcloud backend",
                plan.name
            )));
        }
        if plan.needs_head() && hosts.is_empty() {
            return Err(DispatchError::ValidationError(format!(
                "workflow {} targets the head host but the group is empty",
                plan.name
            )));
        }
        Ok(())
    }

    pub async fn run(
        &self,
        workflow: &Workflow,
        group: &str,
        hosts: &[Host],
    ) -> Result<WorkflowOutcome, DispatchError> {
        let plan = workflow.plan(hosts)?;
        self.run_plan(&plan, group, hosts).await
    }

    pub async fn run_plan(
        &self,
        plan: &WorkflowPlan,
        group: &str,
        hosts: &[Host],
    ) -> Result<WorkflowOutcome, DispatchError> {
        self.check(plan, hosts)?;
        info!(
            "Running workflow {} ({} steps) on {} hosts",
            plan.name,
            plan.steps.len(),
            hosts.len()
        );

        let mut outcome = WorkflowOutcome {
            workflow: plan.name.clone(),
            steps: Vec::with_capacity(plan.steps.len()),
        };

        for step in &plan.steps {
            info!("Workflow {}: step '{}'", plan.name, step.name());
            let report = match step {
                Step::Run {
                    target,
                    commands,
                    max_parallelism,
                    ..
                } => {
                    let targets = target.select(hosts);
                    let options = match max_parallelism {
                        Some(m) => self.options.with_max_parallelism(Some(*m)),
                        None => self.options,
                    };
                    let commands = commands.clone().with_mode(self.chain_mode);
                    let results =
                        scheduler::dispatch(self.executor.clone(), &targets, &commands, &options)
                            .await?;
                    aggregator::print_report(step.name(), &results);
                    Some(aggregator::summarize(&results))
                }
                Step::Upload {
                    target,
                    remote_path,
                    contents,
                    mode,
                    ..
                } => {
                    let targets = target.select(hosts);
                    let executor = self.executor.clone();
                    let remote_path = Arc::new(remote_path.clone());
                    let contents = Arc::new(contents.clone().into_bytes());
                    let mode = *mode;
                    let results = scheduler::dispatch_with(&targets, &self.options, move |host| {
                        let executor = executor.clone();
                        let remote_path = remote_path.clone();
                        let contents = contents.clone();
                        async move {
                            let transfer = executor
                                .upload(&host, &remote_path, &contents, mode)
                                .await?;
                            Ok::<_, DispatchError>(CommandOutput {
                                exit_code: if transfer.success { 0 } else { 1 },
                                stdout: transfer.message,
                                stderr: String::new(),
                            })
                        }
                    })
                    .await?;
                    aggregator::print_report(step.name(), &results);
                    Some(aggregator::summarize(&results))
                }
                Step::AttachDisk { disk, .. } => {
                    let cloud = self.cloud.ok_or_else(|| {
                        DispatchError::NotImplemented("attach disk needs gcloud".to_string())
                    })?;
                    let instance = cloud.head_instance_name(group).await?;
                    cloud.attach_disk(&instance, disk).await?;
                    None
                }
            };

            if let Some(ref r) = report
                && !r.is_clean()
            {
                warn!(
                    "Step '{}' failed on {} host(s): {:?}",
                    step.name(),
                    r.failed,
                    r.failed_hosts
                );
            }
            outcome.steps.push(StepOutcome {
                name: step.name().to_string(),
                report,
            });
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<Host> {
        vec![Host::new("10.0.0.1"), Host::new("10.0.0.2"), Host::new("10.0.0.3")]
    }

    #[test]
    fn test_target_selection() {
        let list = hosts();
        assert_eq!(Target::All.select(&list).len(), 3);
        assert_eq!(Target::Head.select(&list), vec![Host::new("10.0.0.1")]);
        assert_eq!(
            Target::AllButHead.select(&list),
            vec![Host::new("10.0.0.2"), Host::new("10.0.0.3")]
        );
        assert!(Target::Head.select(&[]).is_empty());
    }

    #[test]
    fn test_mount_disk_plan() {
        let plan = Workflow::MountDisk {
            mount_location: "/mnt/disks/vision".to_string(),
            device: "sdb".to_string(),
        }
        .plan(&hosts())
        .unwrap();

        assert_eq!(plan.steps.len(), 1);
        match &plan.steps[0] {
            Step::Run { commands, target, .. } => {
                assert_eq!(*target, Target::All);
                assert_eq!(
                    commands.render(),
                    "sudo mkdir -p /mnt/disks/vision && sudo chmod a+w /mnt/disks/vision && \
                     sudo mount -o discard,defaults /dev/sdb /mnt/disks/vision"
                );
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_copy_from_head_uses_head_address() {
        let plan = Workflow::CopyFromHead {
            file_dir: "/home/u/code/".to_string(),
            file_name: "xla_distributed.py".to_string(),
        }
        .plan(&hosts())
        .unwrap();

        match &plan.steps[0] {
            Step::Run {
                target,
                commands,
                max_parallelism,
                ..
            } => {
                assert_eq!(*target, Target::AllButHead);
                assert_eq!(*max_parallelism, Some(4));
                assert_eq!(
                    commands.commands()[1],
                    "scp -oStrictHostKeyChecking=no 10.0.0.1:/home/u/code/xla_distributed.py \
                     /home/u/code/xla_distributed.py"
                );
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_copy_from_head_without_hosts_is_invalid() {
        let err = Workflow::CopyFromHead {
            file_dir: "/tmp".to_string(),
            file_name: "x".to_string(),
        }
        .plan(&[])
        .unwrap_err();
        assert!(matches!(err, DispatchError::ValidationError(_)));
    }

    #[test]
    fn test_head_node_models_plan_shape() {
        let plan = Workflow::MountHeadNodeModels {
            disk: "models1".to_string(),
            size_marker: default_size_marker(),
            mount_location: default_models_dir(),
            packages: default_packages(),
        }
        .plan(&hosts())
        .unwrap();

        assert!(plan.needs_cloud());
        assert!(plan.needs_head());
        let names: Vec<&str> = plan.steps.iter().map(Step::name).collect();
        assert_eq!(
            names,
            vec![
                "attach disk models1",
                "mount models disk on head",
                "create models directory"
            ]
        );
        if let Step::Run { commands, .. } = &plan.steps[1] {
            assert_eq!(
                commands.commands().last().unwrap(),
                "sudo apt-get -y install dstat"
            );
        }
    }

    #[test]
    fn test_increase_ulimit_uploads_profile() {
        let plan = Workflow::IncreaseUlimit {
            profile_path: "/home/u/.profile".to_string(),
            nofile: 500_000,
            env: CondaEnv::default(),
        }
        .plan(&hosts())
        .unwrap();

        assert!(plan.needs_upload());
        match &plan.steps[0] {
            Step::Upload { contents, remote_path, .. } => {
                assert_eq!(remote_path, "/home/u/.profile");
                assert!(contents.contains("export PATH=/anaconda3/bin:"));
                assert!(!contents.contains("ulimit"));
            }
            other => panic!("unexpected step {:?}", other),
        }
        if let Step::Run { commands, .. } = &plan.steps[1] {
            assert!(commands.render().contains("hard    nofile       500000"));
        }
    }

    #[test]
    fn test_empty_parameter_is_rejected() {
        let err = Workflow::DeployBranch {
            branch: "".to_string(),
            code_dir: "/code".to_string(),
            env: CondaEnv::default(),
        }
        .plan(&hosts())
        .unwrap_err();
        assert!(matches!(err, DispatchError::ValidationError(ref m) if m.contains("branch")));
    }

    #[test]
    fn test_workflow_from_yaml_uses_defaults() {
        let yaml = "workflow: upgrade_package\n";
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let plan = workflow.plan(&hosts()).unwrap();
        if let Step::Run { commands, .. } = &plan.steps[0] {
            assert_eq!(
                commands.commands()[0],
                "source /anaconda3/bin/activate torch-xla-nightly"
            );
            assert_eq!(commands.commands()[1], "yes | pip uninstall transformers");
        } else {
            panic!("expected a run step");
        }
    }

    #[test]
    fn test_imagenet_requires_input_dir() {
        let err = Workflow::CreateImagenet100 {
            script: "create_imagenet100.py".to_string(),
            input_dir: String::new(),
            output_dir: "/mnt/disks/vision/imagenet100".to_string(),
            env: CondaEnv::default(),
        }
        .plan(&hosts())
        .unwrap_err();

        assert!(matches!(err, DispatchError::ValidationError(ref msg) if msg.contains("input_dir")));
    }

    #[test]
    fn test_plan_with_chain_mode_rewrites_run_steps() {
        let plan = Workflow::UpgradePackage {
            package: "torch_xla".to_string(),
            source: "torch_xla-nightly.whl".to_string(),
            env: CondaEnv::default(),
        }
        .plan(&hosts())
        .unwrap()
        .with_chain_mode(ChainMode::Continue);

        match &plan.steps[0] {
            Step::Run { commands, .. } => {
                assert_eq!(commands.mode(), ChainMode::Continue);
                assert!(commands.render().contains("; yes | pip uninstall torch_xla; "));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }
}
