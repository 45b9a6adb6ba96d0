use crate::cloud::GcloudCli;
use crate::error::DispatchError;
use crate::types::Host;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use tracing::info;

/// 把组名解析为有序的主机地址列表
///
/// 返回空列表不是错误，由调用方决定如何处理。
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, group: &str) -> Result<Vec<Host>, DispatchError>;
}

fn ensure_group(group: &str) -> Result<(), DispatchError> {
    if group.trim().is_empty() {
        return Err(DispatchError::ResolutionError(
            "Group identifier must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn listing_line() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| Regex::new(r"^\s*(\S+)\s+(\S+)").expect("valid regex"))
}

/// 解析 `名称 地址` 形式的实例清单，保留名称包含 `group` 的行
///
/// 保持清单顺序，重复地址只保留第一次出现。没有地址的实例（例如已停止）
/// 会被跳过。
pub fn parse_instance_listing(output: &str, group: &str) -> Vec<Host> {
    let mut seen = HashSet::new();
    output
        .lines()
        .filter_map(|line| listing_line().captures(line))
        .filter(|caps| caps[1].contains(group))
        .map(|caps| caps[2].to_string())
        .filter(|address| seen.insert(address.clone()))
        .map(Host::from)
        .collect()
}

/// 通过 gcloud 实例清单动态解析
pub struct GcloudResolver {
    cli: GcloudCli,
}

impl GcloudResolver {
    pub fn new(cli: GcloudCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl HostResolver for GcloudResolver {
    async fn resolve(&self, group: &str) -> Result<Vec<Host>, DispatchError> {
        ensure_group(group)?;
        let listing = self.cli.list_instances().await?;
        let hosts = parse_instance_listing(&listing, group);
        info!("Found {} hosts in group {}", hosts.len(), group);
        Ok(hosts)
    }
}

/// 使用配置文件中写死的组
///
/// 名称完全匹配的组优先；否则合并所有名称包含该标记的组（按组名排序）。
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    groups: BTreeMap<String, Vec<String>>,
}

impl StaticResolver {
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, group: &str) -> Result<Vec<Host>, DispatchError> {
        ensure_group(group)?;

        let members: Vec<&String> = match self.groups.get(group) {
            Some(exact) => exact.iter().collect(),
            None => self
                .groups
                .iter()
                .filter(|(name, _)| name.contains(group))
                .flat_map(|(_, hosts)| hosts.iter())
                .collect(),
        };

        let mut seen: HashSet<&String> = HashSet::new();
        let hosts: Vec<Host> = members
            .into_iter()
            .filter(|address| seen.insert(*address))
            .map(|address| Host::new(address.as_str()))
            .collect();

        info!("Found {} hosts in group {}", hosts.len(), group);
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
matthewp-tpu-group-23-0001\t10.164.0.2
other-instance\t10.164.0.9
matthewp-tpu-group-23-0002\t10.164.0.3
matthewp-tpu-group-23-0003\t10.164.0.4
matthewp-tpu-group-23-0004
";

    #[test]
    fn test_parse_keeps_matching_rows_in_order() {
        let hosts = parse_instance_listing(LISTING, "tpu-group-23");
        assert_eq!(
            hosts,
            vec![
                Host::new("10.164.0.2"),
                Host::new("10.164.0.3"),
                Host::new("10.164.0.4"),
            ]
        );
    }

    #[test]
    fn test_parse_no_match_is_empty() {
        assert!(parse_instance_listing(LISTING, "gpu-pool").is_empty());
        assert!(parse_instance_listing("", "tpu").is_empty());
    }

    #[test]
    fn test_parse_drops_duplicate_addresses() {
        let listing = "g-1 10.0.0.1\ng-2 10.0.0.1\ng-3 10.0.0.2\n";
        assert_eq!(parse_instance_listing(listing, "g-").len(), 2);
    }

    fn static_groups() -> StaticResolver {
        let mut groups = BTreeMap::new();
        groups.insert("workers".to_string(), vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        groups.insert("workers-b".to_string(), vec!["10.0.1.1".to_string(), "10.0.0.2".to_string()]);
        StaticResolver::new(groups)
    }

    #[tokio::test]
    async fn test_static_exact_match_wins() {
        let hosts = static_groups().resolve("workers").await.unwrap();
        assert_eq!(hosts, vec![Host::new("10.0.0.1"), Host::new("10.0.0.2")]);
    }

    #[tokio::test]
    async fn test_static_substring_match_merges_unique() {
        let hosts = static_groups().resolve("work").await.unwrap();
        assert_eq!(
            hosts,
            vec![Host::new("10.0.0.1"), Host::new("10.0.0.2"), Host::new("10.0.1.1")]
        );
    }

    #[tokio::test]
    async fn test_empty_group_is_resolution_error() {
        let err = static_groups().resolve("  ").await.unwrap_err();
        assert!(matches!(err, DispatchError::ResolutionError(_)));
    }

    #[tokio::test]
    async fn test_unknown_group_resolves_empty() {
        assert!(static_groups().resolve("gpu").await.unwrap().is_empty());
    }
}
