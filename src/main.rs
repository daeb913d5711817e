#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("Error: flowlat requires Linux to attach tc programs");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() {
    use clap::Parser;
    use flowlat::cli::Cli;
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting flowlat v{}", flowlat::VERSION);

    let result = match cli.resolve_config() {
        Ok(config) => flowlat::cli::commands::run(config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
