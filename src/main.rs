use std::path::PathBuf;

use anyhow::{Context, Result};
use blink_host::{Config, Host, Rect};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

struct Args {
    url: String,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut url = None;
    let mut config = std::env::var("BLINK_CONFIG").ok().map(PathBuf::from);
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            _ if url.is_none() => url = Some(arg),
            other => anyhow::bail!("unexpected argument {other:?}"),
        }
    }
    Ok(Args {
        url: url.unwrap_or_else(|| String::from("about:blank")),
        config,
    })
}

fn main() -> Result<()> {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let args = parse_args()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let _guard = rt.enter();

    let config = Config::load(args.config).context("failed to load configuration")?;
    let host = Host::launch(config).context("failed to start engine")?;
    tracing::info!(
        version = %host.version_string().unwrap_or_default(),
        "engine ready"
    );

    host.handle("ping", |value: Value| value);

    let view = host
        .create_popup_window(Rect::default())
        .context("failed to open window")?;
    view.load_url(&args.url)?;
    view.show()?;

    rt.block_on(view.wait_destroyed());
    host.shutdown();
    Ok(())
}
