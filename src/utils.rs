use sha2::{Digest, Sha256};

/// 生成唯一的临时文件后缀
///
/// 使用纳秒级时间戳 + 随机数，确保多台主机同时上传时不会产生文件名冲突。
pub fn generate_temp_suffix() -> String {
    let now = chrono::Utc::now();
    let timestamp = now.timestamp();
    let nanos = now.timestamp_subsec_nanos();
    let random_suffix: u32 = rand::random();

    format!("{}.{}.{}", timestamp, nanos, random_suffix)
}

/// 生成远程临时文件路径
///
/// # 示例
/// ```
/// let temp_path = fleet_dispatch::utils::generate_remote_temp_path("/home/ubuntu/.profile");
/// assert!(temp_path.starts_with("/home/ubuntu/.profile.tmp."));
/// ```
pub fn generate_remote_temp_path(base_path: &str) -> String {
    format!("{}.tmp.{}", base_path, generate_temp_suffix())
}

/// 用单引号包裹字符串，内部的 `'` 替换为 `'\''`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

/// 把整条命令链交给指定 shell 执行，例如 `bash -c '...'`
pub fn wrap_in_shell(shell: Option<&str>, command: &str) -> String {
    match shell {
        Some(shell) if !shell.is_empty() => format!("{} -c {}", shell, shell_quote(command)),
        _ => command.to_string(),
    }
}

/// 计算内容的 SHA256（十六进制小写）
pub fn sha256_hex(contents: &[u8]) -> String {
    let digest = Sha256::digest(contents);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_temp_suffix_uniqueness() {
        let mut suffixes = HashSet::new();

        for _ in 0..1000 {
            let suffix = generate_temp_suffix();
            assert!(
                suffixes.insert(suffix.clone()),
                "Generated duplicate suffix: {}",
                suffix
            );
        }
    }

    #[test]
    fn test_remote_temp_path_format() {
        let path = generate_remote_temp_path("/etc/security/limits.conf");
        assert!(path.starts_with("/etc/security/limits.conf.tmp."));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("echo 'x'"), r#"'echo '\''x'\'''"#);
    }

    #[test]
    fn test_wrap_in_shell() {
        assert_eq!(
            wrap_in_shell(Some("bash"), "cd /tmp && ls"),
            "bash -c 'cd /tmp && ls'"
        );
        assert_eq!(wrap_in_shell(None, "cd /tmp && ls"), "cd /tmp && ls");
        assert_eq!(wrap_in_shell(Some(""), "ls"), "ls");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
