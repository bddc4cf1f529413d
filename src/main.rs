use clap::Parser;
use tracing_subscriber::EnvFilter;

mod config;
mod detect;
mod error;
mod extract;
mod fallback;
mod fetch;
mod http;
mod images;
mod markdown;
mod models;
mod output;
mod pipeline;
mod proxy;
mod session;

use config::Cli;
use error::FetchError;
use session::SessionState;

#[tokio::main]
async fn main() {
    for (name, value) in config::env_aliases(|name| std::env::var(name).ok()) {
        std::env::set_var(name, value);
    }
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        tracing::error!(code = e.code(), "{}", e);
        match serde_json::to_string(&e.payload()) {
            Ok(payload) => eprintln!("{}", payload),
            Err(_) => eprintln!("{}", e),
        }
        std::process::exit(e.exit_code());
    }
}

/// Logs go to stderr so stdout stays clean for the article.
fn init_tracing(verbose: bool) {
    let default = if verbose {
        format!("{}=debug,info", env!("CARGO_CRATE_NAME"))
    } else {
        "info".to_string()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), FetchError> {
    let config = cli.resolve()?;

    let pool = proxy::resolve(
        &config.proxy,
        config.lease.as_ref(),
        config.render_api.is_some(),
    )
    .await?;
    if !pool.is_empty() {
        tracing::info!(proxies = pool.len(), "proxy pool ready");
    }
    let session = SessionState::load(&config.session);
    if !session.is_empty() {
        tracing::info!(cookies = session.cookies().len(), "session cookies loaded");
    }

    let artifact = pipeline::run(&config, pool, &session).await?;
    output::write_artifacts(&config.output.out_dir, &artifact)?;

    if !config.output.quiet {
        println!("{}", output::render_stdout(config.target.format, &artifact)?);
    }
    Ok(())
}
