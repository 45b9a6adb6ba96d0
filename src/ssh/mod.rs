// ssh2 会话与基于它的远程执行器
mod client;
mod executor;
mod file_transfer;
mod hash;

pub use client::SshClient;
pub use executor::SshExecutor;
