//! PFx Brick 命令行工具
//!
//! 通过 BLE 连接 PFx Brick，读取设备信息或发送遥控器事件。

mod link;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pfxlink_core::{
    Channel, HeldRemote, RemoteEvent, Session, SessionEvent, Settings, remote_command,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pfxlink", version, about = "PFx Brick BLE 工具")]
struct Cli {
    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 读取设备信息
    Info {
        /// 设备地址 (默认使用保存的地址)
        #[arg(short, long)]
        address: Option<String>,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 发送遥控器事件
    Remote {
        /// 事件名，例如 joy-left-fwd、speed-both、ev3-beacon
        event: RemoteEvent,
        /// 设备地址 (默认使用保存的地址)
        #[arg(short, long)]
        address: Option<String>,
        /// 遥控通道 1 ~ 4
        #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u8).range(1..=4))]
        channel: u8,
        /// 按住的时间 (毫秒)，期间重复发送
        #[arg(long)]
        hold_ms: Option<u64>,
    },
    /// 查看或修改设置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 显示当前设置
    Show,
    /// 保存默认设备地址
    SetAddress { address: String },
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（pfxlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default = if verbose {
        "debug"
    } else {
        "info,pfxlink_core=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .try_init();
}

fn resolve_address(address: Option<String>, settings: &Settings) -> Result<String> {
    address
        .or_else(|| settings.default_address.clone())
        .context("No device address given and no default saved (pfxlink config set-address)")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load();
    init_logging(cli.verbose || settings.verbose);

    match cli.command {
        Commands::Info { address, json } => {
            let address = resolve_address(address, &settings)?;
            let session = Session::spawn_btleplug(&settings).await;
            let mut events = link::open(&session, &settings, &address).await?;

            if !settings.auto_query {
                session.query_device_info().await?;
            }
            link::wait_for(&mut events, |e| matches!(e, SessionEvent::QueueIdle)).await?;

            let info = session.brick_info().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("PFx Brick {address}");
                print!("{info}");
            }
            link::close(&session).await?;
        }
        Commands::Remote {
            event,
            address,
            channel,
            hold_ms,
        } => {
            let address = resolve_address(address, &settings)?;
            let channel = Channel::new(channel).context("Channel must be 1 to 4")?;
            let session = Session::spawn_btleplug(&settings).await;
            let mut events = link::open(&session, &settings, &address).await?;

            match hold_ms {
                Some(ms) => {
                    println!("Holding {event} on channel {channel} for {ms} ms");
                    let held = HeldRemote::press(
                        session.clone(),
                        event,
                        channel,
                        settings.repeat_interval(),
                    );
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    held.release().await?;
                }
                None => {
                    println!("Sending {event} on channel {channel}");
                    session
                        .send_command(remote_command(event, channel))
                        .await?;
                }
            }
            link::settle(&mut events).await?;
            link::close(&session).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("Config file:        {}", Settings::config_path().display());
                println!(
                    "Default address:    {}",
                    settings.default_address.as_deref().unwrap_or("-")
                );
                println!("Scan timeout:       {} s", settings.scan_timeout_secs);
                println!("Write retry delay:  {} ms", settings.retry_delay_ms);
                println!("Repeat interval:    {} ms", settings.repeat_interval_ms);
                println!("Auto query:         {}", settings.auto_query);
                println!("Verbose:            {}", settings.verbose);
            }
            ConfigAction::SetAddress { address } => {
                let address = address.to_uppercase();
                settings.default_address = Some(address.clone());
                settings.save()?;
                println!("Default address set to {address}");
            }
        },
    }

    Ok(())
}
