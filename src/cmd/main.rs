use clap::Parser;
use overtun::app::App;
use overtun::config::Config;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_line_number(true)
            .with_file(true)
            .finish(),
    )
    .unwrap();

    let mut config = Config::parse();
    if let Some(path) = config.config.clone() {
        config = match Config::load(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!("load config fail: {:?}", e);
                std::process::exit(1);
            }
        };
    }

    tracing::info!(
        "starting {} with tun {} mtu {}",
        if config.server_mode { "server" } else { "client" },
        config.ip,
        config.mtu
    );

    let app = App::new(config);
    tokio::select! {
        result = app.run() => {
            if let Err(e) = result {
                tracing::error!("run fail: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown on ctrl-c");
        }
    }
}
