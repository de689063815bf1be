use anyhow::Result;
use clap::Parser;
use ssh_remote::{cli::Cli, config::Config, run};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_filter()))
        .init();

    eprintln!(
        "Target: {}@{}:{}",
        config.credentials.username, config.credentials.host, config.credentials.port
    );

    if let Err(e) = run(config).await {
        eprintln!("\n❌ {:#}\n", e);
        std::process::exit(1);
    }

    Ok(())
}
