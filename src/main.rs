use tracing_subscriber::EnvFilter;

#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    let config = campus_chat::config::Config::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!("starting campus-chat on {}", config.http_addr);

    let _rocket = campus_chat::build_rocket(config).launch().await?;
    Ok(())
}
