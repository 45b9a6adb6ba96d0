use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

/// 调用 gcloud CLI 的参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcloudSettings {
    pub binary: String,
    pub project: Option<String>,
    pub zone: Option<String>,
}

impl Default for GcloudSettings {
    fn default() -> Self {
        Self {
            binary: "gcloud".to_string(),
            project: None,
            zone: None,
        }
    }
}

/// 列出实例时使用的输出格式：每行 `名称<TAB>内网地址`
pub const INSTANCE_LIST_FORMAT: &str = "value(name,networkInterfaces[0].networkIP)";

/// gcloud 命令行的薄封装：实例清单、实例组成员、挂载磁盘
#[derive(Debug, Clone)]
pub struct GcloudCli {
    settings: GcloudSettings,
}

impl GcloudCli {
    pub fn new(settings: GcloudSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &GcloudSettings {
        &self.settings
    }

    /// 列出项目中的所有实例（原始输出）
    pub async fn list_instances(&self) -> Result<String, DispatchError> {
        let format = format!("--format={}", INSTANCE_LIST_FORMAT);
        self.run(&["compute", "instances", "list", &format], false)
            .await
            .map_err(DispatchError::ResolutionError)
    }

    /// 实例组中名称包含 `group` 的第一个实例名，即 head 节点
    pub async fn head_instance_name(&self, group: &str) -> Result<String, DispatchError> {
        let output = self
            .run(
                &[
                    "compute",
                    "instance-groups",
                    "list-instances",
                    group,
                    "--format=value(instance)",
                ],
                true,
            )
            .await
            .map_err(DispatchError::ResolutionError)?;

        first_instance_matching(&output, group).ok_or_else(|| {
            DispatchError::ResolutionError(format!(
                "Instance group {} has no instance whose name contains '{}'",
                group, group
            ))
        })
    }

    /// 把已存在的磁盘挂到实例上
    pub async fn attach_disk(&self, instance: &str, disk: &str) -> Result<(), DispatchError> {
        info!("Attaching disk {} to instance {}", disk, instance);
        self.run(
            &["compute", "instances", "attach-disk", instance, "--disk", disk],
            true,
        )
        .await
        .map(|_| ())
        .map_err(DispatchError::InvocationError)
    }

    async fn run(&self, args: &[&str], needs_zone: bool) -> Result<String, String> {
        let mut command = Command::new(&self.settings.binary);
        command.args(args);
        if needs_zone {
            let zone = self
                .settings
                .zone
                .as_deref()
                .ok_or_else(|| format!("gcloud {} requires a zone", args.join(" ")))?;
            command.args(["--zone", zone]);
        }
        if let Some(ref project) = self.settings.project {
            command.args(["--project", project]);
        }

        debug!("Running {} {}", self.settings.binary, args.join(" "));

        let output = command.output().await.map_err(|e| {
            format!("Failed to execute {}: {}", self.settings.binary, e)
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{} {} failed with exit code {}: {}",
                self.settings.binary,
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| format!("{} output is not valid UTF-8: {}", self.settings.binary, e))
    }
}

/// 从实例组成员列表中取第一个名称包含 `group` 的实例
///
/// gcloud 可能输出完整的资源 URL，只保留最后一段。
pub fn first_instance_matching(output: &str, group: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.contains(group))
        .filter_map(|line| line.split_whitespace().next())
        .map(|token| token.rsplit('/').next().unwrap_or(token).to_string())
        .next()
}
