use crate::error::DispatchError;
use crate::types::{CommandOutput, Host, SshSettings};
use ssh2::Session;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 非阻塞读取时两个流都没有数据时的等待间隔
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 单台主机的 SSH 会话，每次调用新建，用完即释放
pub struct SshClient {
    pub(super) session: Session,
    pub(super) host: Host,
    command_timeout: Option<Duration>,
}

impl SshClient {
    /// 创建新的 SSH 连接
    ///
    /// `connect_attempts` 大于 1 时在连接失败后重试，只针对建立连接，
    /// 命令本身从不重试。
    pub fn connect(host: &Host, settings: &SshSettings) -> Result<Self, DispatchError> {
        let max_attempts = settings.connect_attempts.max(1);
        let retry_delay = Duration::from_millis(1000);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                info!(
                    "Retrying SSH connection to {}:{} (Attempt {}/{})",
                    host, settings.port, attempt, max_attempts
                );
                thread::sleep(retry_delay * (attempt - 1));
            }

            match Self::connect_once(host, settings) {
                Ok(client) => return Ok(client),
                Err(e) => {
                    warn!("SSH connection failed for {}:{}: {}", host, settings.port, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DispatchError::SshConnectionError(format!("Failed to connect to {}", host))
        }))
    }

    /// 执行单次连接尝试
    fn connect_once(host: &Host, settings: &SshSettings) -> Result<Self, DispatchError> {
        let connect_error = |e: io::Error| {
            DispatchError::SshConnectionError(format!(
                "Failed to connect to {}:{}: {}",
                host, settings.port, e
            ))
        };
        let addr = (host.address(), settings.port)
            .to_socket_addrs()
            .map_err(connect_error)?
            .next()
            .ok_or_else(|| {
                DispatchError::SshConnectionError(format!("No address found for {}", host))
            })?;
        let connect_timeout = Duration::from_millis(u64::from(settings.connect_timeout_ms.max(1)));
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(connect_error)?;

        // 禁用 Nagle 算法，减少握手阶段的小包延迟
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(settings.connect_timeout_ms);

        session.handshake().map_err(|e| {
            DispatchError::SshConnectionError(format!("SSH Handshake with {} failed: {}", host, e))
        })?;

        // 认证
        if let Some(ref private_key_path) = settings.private_key_path {
            let passphrase = settings.passphrase.as_deref();
            session.userauth_pubkey_file(
                &settings.username,
                None,
                Path::new(private_key_path),
                passphrase,
            )?;
        } else if let Some(ref password) = settings.password {
            session.userauth_password(&settings.username, password)?;
        } else {
            return Err(DispatchError::AuthenticationError(
                "No authentication method provided".to_string(),
            ));
        }

        if !session.authenticated() {
            return Err(DispatchError::AuthenticationError(format!(
                "Authentication to {} as {} failed",
                host, settings.username
            )));
        }

        // 握手完成后不再限制读写时间，长命令会一直阻塞到退出
        session.set_timeout(0);

        debug!("Successfully connected to {}", host);

        Ok(Self {
            session,
            host: host.clone(),
            command_timeout: None,
        })
    }

    /// 限制之后每条命令（以及上传）的总耗时
    ///
    /// 超时后阻塞线程自行返回 `InvocationError`，不会一直挂在远程命令上。
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        let millis = timeout
            .map(|t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX).max(1))
            .unwrap_or(0);
        self.session.set_timeout(millis);
        self.command_timeout = timeout;
        self
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// 执行远程命令
    ///
    /// stdout 和 stderr 共用一个通道窗口，必须交替读取，否则一方写满后
    /// 远程命令会卡住。
    pub fn execute_command(&self, command: &str) -> Result<CommandOutput, DispatchError> {
        let deadline = self.command_timeout.map(|t| Instant::now() + t);

        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        self.session.set_blocking(false);
        let drained = {
            let mut out = channel.stream(0);
            let mut err = channel.stderr();
            drain_streams(&mut out, &mut err, || channel.eof(), deadline)
        };
        self.session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(|e| match e {
            DispatchError::InvocationError(msg) => {
                DispatchError::InvocationError(format!("{} on {}", msg, self.host))
            }
            other => other,
        })?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        debug!(
            "Command '{}' on '{}' executed with exit code: {}",
            command, self.host, exit_code
        );

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// 读一次，返回是否读到了数据；此刻没有数据不算错误
fn read_available<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    sink: &mut Vec<u8>,
) -> Result<bool, DispatchError> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                sink.extend_from_slice(&buf[..n]);
                return Ok(true);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// 交替读取两个非阻塞流直到 `finished` 且没有剩余数据
fn drain_streams<O, E, F>(
    out: &mut O,
    err: &mut E,
    finished: F,
    deadline: Option<Instant>,
) -> Result<(Vec<u8>, Vec<u8>), DispatchError>
where
    O: Read,
    E: Read,
    F: Fn() -> bool,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 32 * 1024];

    loop {
        let mut progressed = read_available(out, &mut buf, &mut stdout)?;
        progressed |= read_available(err, &mut buf, &mut stderr)?;

        if !progressed && finished() {
            return Ok((stdout, stderr));
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return Err(DispatchError::InvocationError(
                "Remote command timed out".to_string(),
            ));
        }
        if !progressed {
            thread::sleep(POLL_INTERVAL);
        }
    }
}
