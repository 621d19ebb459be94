use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use flux_config::{AgentConfig, ConfigLoader};
use flux_gb28181_agent::manscdp::LoggingPtzController;
use flux_gb28181_agent::sip::SipUdpEngine;
use flux_gb28181_agent::{Agent, AgentDeps};
use tracing_subscriber::EnvFilter;

mod settings;
mod signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "GB28181 device-side agent")]
struct Args {
    /// agent.toml 所在目录
    #[arg(long, default_value = "./config")]
    config_dir: PathBuf,

    /// 日志过滤（覆盖 RUST_LOG）
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    device_id: Option<String>,

    #[arg(long)]
    sip_bind: Option<String>,

    #[arg(long)]
    platform_ip: Option<String>,

    #[arg(long)]
    platform_port: Option<u16>,

    /// 打印合并后的配置并退出
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(device_id) = &self.device_id {
            config.device.device_id = device_id.clone();
        }
        if let Some(bind) = &self.sip_bind {
            config.sip.bind_addr = bind.clone();
        }
        if let Some(ip) = &self.platform_ip {
            config.platform.ip = ip.clone();
        }
        if let Some(port) = self.platform_port {
            config.platform.port = port;
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let mut config = ConfigLoader::new(&args.config_dir).load_agent()?;
    args.apply(&mut config);
    config.validate()?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let identity = settings::identity(&config);
    let (engine, events) = SipUdpEngine::bind(settings::engine_config(&config), Arc::new(identity.clone())).await?;

    let deps = AgentDeps {
        signaling: engine.clone(),
        pipeline: settings::pipeline(&config),
        directory: Arc::new(settings::channel_directory(&config)),
        ptz: Arc::new(LoggingPtzController),
    };
    let agent = Arc::new(Agent::new(
        identity,
        settings::profile(&config),
        settings::agent_settings(&config),
        deps,
    )?);

    if let Err(e) = agent.start(events).await {
        engine.shutdown().await;
        return Err(e.into());
    }

    tracing::info!(
        target: "gb28181d",
        device_id = %config.device.device_id,
        platform = %format!("{}:{}", config.platform.ip, config.platform.port),
        "GB28181 agent running"
    );

    let signal = signal::wait_for_shutdown().await?;
    tracing::info!(target: "gb28181d", ?signal, "Shutting down");

    agent.stop().await;
    engine.shutdown().await;
    Ok(())
}
