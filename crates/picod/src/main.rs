use anyhow::Context;
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = picod::Args::parse();

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(format!("picod={log_level}"))
        .context("parsing LOG_LEVEL environment filter failed")?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    // Run until signaled, then gracefully stop.
    let result = runtime.block_on(picod::run(args));

    // Shut down without waiting for blocking background tasks: a child
    // process read may never complete once we are exiting.
    runtime.shutdown_background();

    let () = result?;
    tracing::debug!(message = "picod exiting");
    Ok(())
}
