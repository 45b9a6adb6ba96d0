use crate::cloud::GcloudSettings;
use crate::error::DispatchError;
use crate::scheduler::DispatchOptions;
use crate::sequence::ChainMode;
use crate::transport::TransportKind;
use crate::types::SshSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// 主机组的来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverConfig {
    /// 通过 gcloud 实例清单动态发现，同时用于挂载磁盘
    Gcloud(GcloudSettings),
    /// 使用 `groups` 中写死的地址
    Static,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig::Gcloud(GcloudSettings::default())
    }
}

impl ResolverConfig {
    pub fn gcloud(&self) -> Option<&GcloudSettings> {
        match self {
            ResolverConfig::Gcloud(settings) => Some(settings),
            ResolverConfig::Static => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub ssh: SshSettings,
    pub transport: TransportKind,
    pub resolver: ResolverConfig,
    pub groups: BTreeMap<String, Vec<String>>,
    pub max_parallelism: Option<usize>,
    pub invocation_timeout_secs: Option<u64>,
    pub chain_mode: ChainMode,
}

impl FleetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根据扩展名加载：`.json` 按 JSON，其余按 YAML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DispatchError> {
        let is_json = path
            .as_ref()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_file(path)
        } else {
            Self::from_yaml_file(path)
        }
    }

    /// 从YAML文件加载配置
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, DispatchError> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DispatchError::ConfigError(format!("Failed to read config file: {}", e)))?;

        serde_yaml::from_str(&content)
            .map_err(|e| DispatchError::ConfigError(format!("Failed to parse YAML: {}", e)))
    }

    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, DispatchError> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DispatchError::ConfigError(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| DispatchError::ConfigError(format!("Failed to parse JSON: {}", e)))
    }

    /// 保存配置到YAML文件
    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), DispatchError> {
        let yaml_content = serde_yaml::to_string(self).map_err(|e| {
            DispatchError::FileOperationError(format!("Failed to serialize to YAML: {}", e))
        })?;

        std::fs::write(path, yaml_content)
            .map_err(|e| DispatchError::FileOperationError(format!("Failed to write file: {}", e)))
    }

    /// 保存配置到JSON文件
    pub fn save_to_json<P: AsRef<Path>>(&self, path: P) -> Result<(), DispatchError> {
        let json_content = serde_json::to_string_pretty(self).map_err(|e| {
            DispatchError::FileOperationError(format!("Failed to serialize to JSON: {}", e))
        })?;

        std::fs::write(path, json_content)
            .map_err(|e| DispatchError::FileOperationError(format!("Failed to write file: {}", e)))
    }

    /// 添加主机到指定组
    pub fn add_host_to_group(&mut self, address: String, group_name: String) {
        self.groups.entry(group_name).or_default().push(address);
    }

    /// 获取组内所有主机
    pub fn get_hosts_in_group(&self, group_name: &str) -> Vec<String> {
        self.groups.get(group_name).cloned().unwrap_or_default()
    }

    /// 获取所有组名
    pub fn get_groups(&self) -> Vec<&String> {
        self.groups.keys().collect()
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions::new()
            .with_max_parallelism(self.max_parallelism)
            .with_invocation_timeout(self.invocation_timeout_secs.map(Duration::from_secs))
    }

    /// 只检查解析主机组需要的部分，列出主机时不要求传输层凭据
    pub fn validate_resolver(&self) -> Result<(), DispatchError> {
        if self.resolver == ResolverConfig::Static && self.groups.is_empty() {
            return Err(DispatchError::ConfigError(
                "static resolver needs at least one entry in groups".to_string(),
            ));
        }
        Ok(())
    }

    /// 检查会让整个 dispatch 失败的配置错误
    pub fn validate(&self) -> Result<(), DispatchError> {
        self.validate_resolver()?;
        if self.max_parallelism == Some(0) {
            return Err(DispatchError::ConfigError(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        if self.invocation_timeout_secs == Some(0) {
            return Err(DispatchError::ConfigError(
                "invocation_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.transport == TransportKind::Ssh2
            && self.ssh.private_key_path.is_none()
            && self.ssh.password.is_none()
        {
            return Err(DispatchError::ConfigError(
                "ssh2 transport needs ssh.private_key_path or ssh.password".to_string(),
            ));
        }
        if self.transport != TransportKind::Local && self.ssh.username.is_empty() {
            return Err(DispatchError::ConfigError("ssh.username is empty".to_string()));
        }
        Ok(())
    }
}
