use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use tokio::runtime::Runtime;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use booru_curator::api::Api;
use booru_curator::cli::{Cli, CommandFactory, Parser};
use booru_curator::config::Config;
use booru_curator::download::Saver;
use booru_curator::engine::Engine;
use booru_curator::store::Store;
use booru_curator::ui::{self, SetupChoice};

#[inline]
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("booru_curator={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[inline]
fn build_client(config: &Config) -> reqwest::Result<Client> {
    let client_builder = Client::builder().user_agent(&config.user_agent);
    let client_builder = if config.timeout > 0 {
        client_builder.timeout(Duration::from_secs(config.timeout))
    } else {
        client_builder
    };
    client_builder.build()
}

#[inline]
async fn async_main(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.data_dir)
        .await
        .context("Unable to ensure the existence of the data directory")?;

    if ui::setup(&store).await? == SetupChoice::Quit {
        return Ok(());
    }

    let client = build_client(&config).context("failed to build reqwest client")?;
    let api = Api::build(client.clone(), &config.base_url).context("invalid base_url")?;
    let saver = Saver::session(client, &config.download_dir)
        .ensure()
        .await
        .context("Unable to ensure the existence of the download directory")?;

    let mut engine = Engine::open(api, store, config.retry_policy())
        .await
        .context("failed to load saved progress")?;

    ui::run(&mut engine, &saver).await
}

fn main() -> anyhow::Result<ExitCode> {
    // here, if parse fails, the program will be `abort`ed, and no `Drop` will be called,
    // but it's okay, because we don't need to clean up anything.
    let mut cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match cli.resolve_config(&mut Cli::command()) {
        Ok(config) => config,
        // if we can't get the config from the editor, we drop the whole program.
        Err(err) => {
            let _ = err.print();
            return Ok(ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(2)));
        }
    };

    let runtime = Runtime::new().context("failed to build tokio runtime")?;
    let result = runtime.block_on(async {
        tokio::select! {
            result = async_main(config) => {result},
            result = signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c signal")?;
                println!("Ctrl-C received, exiting...");
                Ok(())
            },
        }
    });
    // a prompt may still be waiting for input on a blocking thread
    runtime.shutdown_background();
    result?;

    Ok(ExitCode::SUCCESS)
}
