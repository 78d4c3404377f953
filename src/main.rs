use clap::Parser;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{error, info};
use tokio::signal;
use tunnel_bridge::client::build_client;
use tunnel_bridge::{Gateway, Settings};

#[derive(Parser)]
#[command(
    version,
    about = "Transport-aware reverse proxy frontend for tunneled protocols"
)]
struct Args {
    #[arg(short, long, value_name = "ADDR", help = "Listen address (e.g., 0.0.0.0:8080)")]
    listen: Option<String>,

    #[arg(long, value_name = "LEVEL", help = "Log filter when RUST_LOG is unset")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = args.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut settings = Settings::from_env();
    if let Some(listen) = &args.listen {
        settings.listen_addr = listen.parse()?;
    }

    let listen_addr = settings.listen_addr;
    let gateway = Gateway::new(settings, build_client());

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("tunnel-bridge listening on {}", listen_addr);

    let server = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        continue;
                    }
                };

                let gateway = gateway.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let gateway = gateway.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                gateway.handle(req, remote_addr).await,
                            )
                        }
                    });

                    if let Err(err) = ServerBuilder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        log::debug!("Connection error from {}: {}", remote_addr, err);
                    }
                });
            }
        })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server => {
            if let Err(e) = result {
                error!("Server task error: {}", e);
            }
        }
    }

    Ok(())
}
