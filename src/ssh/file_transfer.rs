use crate::error::DispatchError;
use crate::ssh::client::SshClient;
use crate::types::{FileHashInfo, FileTransferResult};
use crate::utils::{generate_remote_temp_path, sha256_hex, shell_quote};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

impl SshClient {
    /// 把内存中的内容写到远程文件
    ///
    /// 远程文件内容相同时跳过传输；否则先写临时文件再 `mv`，保证目标文件
    /// 不会出现写了一半的状态。
    pub fn upload_contents(
        &self,
        remote_path: &str,
        contents: &[u8],
        mode: i32,
    ) -> Result<FileTransferResult, DispatchError> {
        let local_hash = FileHashInfo {
            algorithm: "sha256".to_string(),
            hash: sha256_hex(contents),
            size: contents.len() as u64,
        };

        if let Some(remote_hash) = self.get_remote_file_hash(remote_path)?
            && remote_hash.hash == local_hash.hash
            && remote_hash.size == local_hash.size
        {
            info!(
                "Remote file {} on {} unchanged (hash: {}), skipping transfer",
                remote_path, self.host, remote_hash.hash
            );
            return Ok(FileTransferResult {
                success: true,
                bytes_transferred: 0,
                message: format!("File unchanged (hash: {})", remote_hash.hash),
            });
        }

        let temp_remote_path = generate_remote_temp_path(remote_path);
        debug!("Uploading {} bytes to {}:{}", contents.len(), self.host, temp_remote_path);

        let mut remote_file = self.session.scp_send(
            Path::new(&temp_remote_path),
            mode,
            contents.len() as u64,
            None,
        )?;
        remote_file.write_all(contents).map_err(|e| {
            DispatchError::FileOperationError(format!("Failed to transfer file: {}", e))
        })?;
        remote_file.send_eof()?;
        remote_file.wait_eof()?;
        remote_file.close()?;
        remote_file.wait_close()?;

        let mv_cmd = format!(
            "mv -f {} {}",
            shell_quote(&temp_remote_path),
            shell_quote(remote_path)
        );
        let mv_result = self.execute_command(&mv_cmd)?;
        if !mv_result.success() {
            let _ = self.execute_command(&format!("rm -f {}", shell_quote(&temp_remote_path)));
            return Err(DispatchError::FileOperationError(format!(
                "Failed to move {} into place: {}",
                temp_remote_path, mv_result.stderr
            )));
        }

        info!(
            "Uploaded {} bytes to {}:{}",
            contents.len(),
            self.host,
            remote_path
        );

        Ok(FileTransferResult {
            success: true,
            bytes_transferred: contents.len() as u64,
            message: format!("Successfully transferred {} bytes", contents.len()),
        })
    }
}
