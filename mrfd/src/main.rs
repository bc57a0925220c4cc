use mrfd::config::{Config, ConfigError};
use mrfd::media::MediaRepoCollection;
use mrfd::{Runtime, http_api, server};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("starting mrfd {}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e @ ConfigError::MissingMediaDir) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(1);
        }
    };

    tracing::info!("loading prompt files from {}", config.media_dir);
    let media = match MediaRepoCollection::load(&config.repo_name, &config.media_dir) {
        Ok(media) => media,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };
    tracing::info!(
        "repository {:?} holds {} prompts",
        config.repo_name,
        media.prompt_count(&config.repo_name).unwrap_or(0)
    );

    // bind the SIP socket, retrying once with an auto-picked private
    // address when the configured one is unusable
    let socket = match server::bind(config.server_ipv4, config.sip_udp_port).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!(
                "cannot bind {}:{}: {e}",
                config.server_ipv4,
                config.sip_udp_port
            );

            match mrfd::config::fallback_ipv4(config.server_ipv4) {
                Some(ip) => {
                    config.server_ipv4 = ip;
                    match server::bind(ip, config.sip_udp_port).await {
                        Ok(socket) => socket,
                        Err(e) => {
                            tracing::error!("bind retry on {ip} failed: {e}");
                            return ExitCode::from(2);
                        }
                    }
                }
                None => {
                    tracing::error!("no alternative IPv4 interface to retry on");
                    return ExitCode::from(2);
                }
            }
        }
    };

    let rt = Runtime::new(config, media);
    rt.set_sip_socket(socket);
    rt.start_background_tasks();

    server::start(rt.clone());

    {
        let rt = rt.clone();
        tokio::spawn(async move {
            if let Err(e) = http_api::serve(rt).await {
                tracing::error!("admin API failed: {e}");
            }
        });
    }

    tracing::info!(
        "ready on sip:{}:{} (rate limit {})",
        rt.config.server_ipv4,
        rt.config.sip_udp_port,
        rt.config.rate_limit
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutting down"),
        Err(e) => tracing::error!("signal handling failed: {e}"),
    }

    ExitCode::SUCCESS
}
