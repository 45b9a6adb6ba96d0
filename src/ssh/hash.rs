use crate::error::DispatchError;
use crate::ssh::client::SshClient;
use crate::types::FileHashInfo;
use crate::utils::shell_quote;

impl SshClient {
    /// 获取远程文件的 SHA256，文件不存在时返回 None
    pub(super) fn get_remote_file_hash(
        &self,
        remote_path: &str,
    ) -> Result<Option<FileHashInfo>, DispatchError> {
        let quoted = shell_quote(remote_path);
        let cmd = format!(
            "test -f {0} && sha256sum {0} && stat -c %s {0} || echo not_exists",
            quoted
        );
        let result = self.execute_command(&cmd)?;
        Ok(parse_hash_output(&result.stdout))
    }
}

/// 解析 `sha256sum` + `stat -c %s` 的输出
fn parse_hash_output(stdout: &str) -> Option<FileHashInfo> {
    let mut lines = stdout.lines();
    let first = lines.next()?.trim();
    if first == "not_exists" {
        return None;
    }
    let hash = first.split_whitespace().next()?.to_string();
    let size = lines.next()?.trim().parse::<u64>().ok()?;
    Some(FileHashInfo {
        algorithm: "sha256".to_string(),
        hash,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_existing_file() {
        let out = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  /home/u/.profile\n3\n";
        let info = parse_hash_output(out).unwrap();
        assert_eq!(
            info.hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(info.size, 3);
    }

    #[test]
    fn test_parse_missing_file() {
        assert!(parse_hash_output("not_exists\n").is_none());
        assert!(parse_hash_output("").is_none());
    }
}
