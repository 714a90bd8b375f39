use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxgate::config::GatewayConfig;
use voxgate::core::audio::{CodecFactory, FrameCodec, OpusCodec};
use voxgate::core::pipeline::{
    AudioIngestPipeline, LoopbackBackend, OutboundSink, ReplyDispatcher,
};
use voxgate::core::session::SessionRegistry;
use voxgate::core::vad::{DetectorFactory, EnergyVad};
use voxgate::routes::create_device_router;
use voxgate::signaling::{
    ControlPublisher, MqttPublisher, SignalingChannel, SignalingHandler, mqtt_client,
};
use voxgate::state::AppState;
use voxgate::transport::{ConnectionRegistry, OutboundRouter, UdpAudioServer, UdpOutbound};

/// Voxgate - real-time voice gateway for embedded assistant devices
#[derive(Parser, Debug)]
#[command(name = "voxgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the HTTP/WebSocket listen host
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Override the HTTP/WebSocket listen port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration from file or environment
    let mut config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        GatewayConfig::from_file(&config_path)?
    } else {
        GatewayConfig::from_env()?
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    let config = Arc::new(config);

    let shutdown = CancellationToken::new();
    let sessions = Arc::new(SessionRegistry::new());
    let connections = Arc::new(ConnectionRegistry::new());

    // One shared socket serves every device; peer addresses are learned
    // from inbound traffic.
    let udp_socket = Arc::new(UdpSocket::bind(config.udp.address()).await?);

    let (mqtt, eventloop) = mqtt_client(&config.mqtt);
    let publisher: Arc<dyn ControlPublisher> = Arc::new(MqttPublisher::new(mqtt.clone()));

    let udp_outbound = Arc::new(UdpOutbound::new(
        Arc::clone(&udp_socket),
        Arc::clone(&sessions),
    ));
    let sink: Arc<dyn OutboundSink> = Arc::new(OutboundRouter::new(
        Arc::clone(&connections),
        Arc::clone(&sessions),
        udp_outbound,
        Arc::clone(&publisher),
    ));

    let codec_factory: CodecFactory = Arc::new(|| {
        let codec = OpusCodec::new()?;
        Ok(Box::new(codec) as Box<dyn FrameCodec>)
    });
    let energy_threshold = config.vad.energy_threshold;
    let detector_factory: DetectorFactory =
        Arc::new(move || Box::new(EnergyVad::new(energy_threshold)));

    let dispatcher = Arc::new(ReplyDispatcher::new(sink, Arc::clone(&codec_factory)));
    let pipeline = Arc::new(AudioIngestPipeline::new(
        config.vad.clone(),
        codec_factory,
        detector_factory,
        Arc::new(LoopbackBackend::default()),
        Arc::clone(&dispatcher),
        Arc::clone(&sessions),
    ));

    let control = Arc::new(SignalingHandler::new(
        Arc::clone(&config),
        Arc::clone(&sessions),
        Arc::clone(&pipeline),
        Arc::clone(&dispatcher),
    ));

    let channel = SignalingChannel::new(
        mqtt,
        eventloop,
        Arc::clone(&control),
        Arc::clone(&publisher),
        shutdown.clone(),
    );
    let udp_server = UdpAudioServer::new(
        Arc::clone(&udp_socket),
        Arc::clone(&sessions),
        Arc::clone(&pipeline),
        config.udp.echo_mode,
        shutdown.clone(),
    );

    tokio::spawn(Arc::clone(&pipeline).run_timeout_sweeper(shutdown.clone()));

    // Idle sessions are reaped in the background so devices that vanish
    // without a goodbye do not pin registry entries forever.
    {
        let sessions = Arc::clone(&sessions);
        let pipeline = Arc::clone(&pipeline);
        let shutdown = shutdown.clone();
        let idle_timeout = Duration::from_secs(config.session.idle_timeout_secs);
        let sweep_interval = Duration::from_secs(config.session.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for expired in sessions.remove_idle(idle_timeout) {
                            info!(
                                "Session {} for {} expired after {}s idle",
                                expired.session_id,
                                expired.device_id,
                                idle_timeout.as_secs()
                            );
                            if sessions.device_session_count(&expired.device_id) == 0 {
                                pipeline.abandon(&expired.device_id);
                            }
                        }
                    }
                }
            }
        });
    }

    let app_state = Arc::new(AppState::new(
        Arc::clone(&config),
        Arc::clone(&sessions),
        Arc::clone(&connections),
        Arc::clone(&pipeline),
        control,
    ));
    let app = create_device_router().with_state(app_state);

    let address = config.server.address();
    let listener = TcpListener::bind(&address).await?;
    info!("Device gateway listening on http://{}", address);

    let udp_task = tokio::spawn(udp_server.run());
    let mut signaling_task = tokio::spawn(channel.run());
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let mut server_task = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server_task => {
            shutdown.cancel();
            match result {
                Ok(Ok(())) => info!("HTTP server stopped"),
                Ok(Err(err)) => return Err(anyhow!("HTTP server error: {}", err)),
                Err(err) => return Err(anyhow!("HTTP server task failed: {}", err)),
            }
        }
        result = &mut signaling_task => {
            shutdown.cancel();
            match result {
                Ok(Ok(())) => info!("Signaling channel stopped"),
                Ok(Err(err)) => return Err(anyhow!("Signaling channel failed: {}", err)),
                Err(err) => return Err(anyhow!("Signaling task failed: {}", err)),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping gateway");
            shutdown.cancel();
            let _ = server_task.await;
            let _ = signaling_task.await;
            let _ = udp_task.await;
        }
    }

    info!("Gateway stopped");
    Ok(())
}
