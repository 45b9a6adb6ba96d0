use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_dispatch::{
    ChainMode, CommandSequence, FleetConfig, FleetManager, HostResolver, TransportKind, Workflow,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

#[derive(Parser)]
#[command(name = "fleet", version, about = "Run command sequences across a group of hosts in parallel batches")]
struct Cli {
    /// YAML 或 JSON 配置文件
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SSH 私钥路径
    #[arg(short, long, global = true)]
    key: Option<String>,

    /// 远程用户名
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// ssh2, openssh 或 local
    #[arg(short, long, global = true)]
    transport: Option<TransportKind>,

    /// 每批主机数，不指定则所有主机一批
    #[arg(short = 'p', long, global = true)]
    max_parallelism: Option<usize>,

    /// 单次调用超时（秒）
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 列出组内主机
    Resolve { group: String },
    /// 在组内主机上执行命令，每个参数是命令链中的一条命令
    Run {
        group: String,
        /// 只在 head 节点上执行
        #[arg(long)]
        head_only: bool,
        /// 用 `;` 连接命令，前面的命令失败也继续执行
        #[arg(long)]
        keep_going: bool,
        #[arg(required = true, last = true)]
        commands: Vec<String>,
    },
    /// 执行 YAML/JSON 文件中定义的流程
    Workflow { group: String, file: PathBuf },
    /// 打印流程计划而不执行
    Plan { group: String, file: PathBuf },
}

fn load_config(cli: &Cli) -> anyhow::Result<FleetConfig> {
    let mut config = match cli.config {
        Some(ref path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FleetConfig::new(),
    };

    if let Some(ref key) = cli.key {
        config.ssh.private_key_path = Some(key.clone());
    }
    if let Some(ref user) = cli.user {
        config.ssh.username = user.clone();
    }
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    if cli.max_parallelism.is_some() {
        config.max_parallelism = cli.max_parallelism;
    }
    if cli.timeout.is_some() {
        config.invocation_timeout_secs = cli.timeout;
    }
    Ok(config)
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    let workflow = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(workflow)
}

fn exit_code(failures: usize) -> ExitCode {
    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // 初始化tracing日志，日志写到 stderr，主机输出写到 stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Resolve { ref group } => {
            // 列出主机只需要解析器，不要求 SSH 凭据
            let resolver = FleetManager::resolver_from_config(&config)?;
            let hosts = resolver.resolve(group).await?;
            println!("Found {} hosts:", hosts.len());
            for host in &hosts {
                println!("{}", host);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            ref group,
            head_only,
            keep_going,
            ref commands,
        } => {
            let manager = FleetManager::from_config(&config)?;
            let mode = if keep_going {
                ChainMode::Continue
            } else {
                config.chain_mode
            };
            let sequence = CommandSequence::new(commands.iter().cloned()).with_mode(mode);
            let report = manager.run(group, &sequence, None, head_only).await?;
            info!("{} of {} hosts failed", report.failed, report.attempted);
            Ok(exit_code(report.failed))
        }
        Command::Workflow { ref group, ref file } => {
            let manager = FleetManager::from_config(&config)?;
            let workflow = load_workflow(file)?;
            let outcome = manager.run_workflow(group, &workflow).await?;
            let failures = outcome.total_failures();
            info!("Workflow {} finished with {} host failure(s)", outcome.workflow, failures);
            Ok(exit_code(failures))
        }
        Command::Plan { ref group, ref file } => {
            let workflow = load_workflow(file)?;
            let resolver = FleetManager::resolver_from_config(&config)?;
            let hosts = resolver.resolve(group).await?;
            let plan = workflow.plan(&hosts)?.with_chain_mode(config.chain_mode);
            println!("{}", serde_yaml::to_string(&plan)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
