use anyhow::{Context, Result};
use dbus_relay::{DBusConnector, Params, ProxyConfig, Relay, Settings};
use env_logger::{Builder, Env, Target};
use log::info;
use std::fs::{self, OpenOptions};
use structopt::StructOpt;

fn init_logging(config: &ProxyConfig) -> Result<()> {
    let level = if config.verbose() { "debug" } else { "info" };
    let mut builder = Builder::from_env(Env::default().default_filter_or(level));
    if let Some(path) = config.log_file() {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
                _ = term.recv() => info!("terminated"),
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupted")
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let params = Params::from_args();
    let settings = Settings::from_params(&params)?;
    if let Some(path) = &params.create_config {
        fs::write(path, settings.template()?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("wrote configuration template to {}", path.display());
        return Ok(());
    }
    let config = settings.validate()?;
    if params.show_config {
        print!("{}", config.settings().to_toml()?);
        return Ok(());
    }
    init_logging(&config)?;
    let mut relay = Relay::new(config);
    relay.start(&DBusConnector).await?;
    relay.run(shutdown_signal()).await?;
    Ok(())
}
