//! Wiring from [`Config`] to a running [`TcpServer`].

use std::sync::Arc;

use quay_config::{Config, FramingMode};
use quay_net::{
    DelimiterFraming, EventBus, EventKind, FramingStrategy, LengthPrefixedFraming, LineFraming,
    Middleware, ServerConfig, TcpServer, TcpServerBuilder,
};

use crate::handlers::{LoggingMiddleware, request_handler};

pub fn server_config(config: &Config) -> ServerConfig {
    ServerConfig {
        host: config.server.host.clone(),
        idle_timeout: config.keepalive.idle_timeout(),
        sweep_interval: config.keepalive.sweep_interval(),
        max_connections: config.server.max_connections,
        backpressure_capacity: config.server.backpressure_capacity,
        dispatch_delay: config.server.dispatch_delay(),
        write_timeout: config.server.write_timeout(),
        shutdown_grace: config.server.shutdown_grace(),
        ..ServerConfig::default()
    }
}

pub fn framing(config: &Config) -> anyhow::Result<Arc<dyn FramingStrategy>> {
    let max = config.framing.max_frame_size;
    Ok(match config.framing.strategy {
        FramingMode::Line => Arc::new(LineFraming::new(max)),
        FramingMode::Delimiter => {
            Arc::new(DelimiterFraming::new(config.framing.delimiter_byte()?, max))
        }
        FramingMode::LengthPrefixed => Arc::new(LengthPrefixedFraming::new(max)),
    })
}

/// Assemble the server for `config`.
pub fn build_server(config: &Config, events: Arc<EventBus>) -> anyhow::Result<TcpServer> {
    config.validate()?;
    let middleware: Vec<Arc<dyn Middleware>> = vec![Arc::new(LoggingMiddleware)];
    let handler = request_handler(config.dispatch.mode, &middleware);

    let builder = TcpServerBuilder::new(handler)
        .config(server_config(config))
        .framing(framing(config)?)
        .event_bus(events);
    Ok(middleware.into_iter().fold(builder, TcpServerBuilder::middleware).build())
}

/// Mirror every event-bus notification to the log.
pub fn spawn_event_logger(events: &EventBus) -> Vec<tokio::task::JoinHandle<()>> {
    EventKind::ALL
        .into_iter()
        .map(|kind| {
            let mut subscription = events.on_event(kind);
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    match event.kind {
                        EventKind::ServerError | EventKind::SessionError => tracing::warn!(
                            event = kind.as_str(),
                            correlation_id = %event.correlation_id,
                            properties = ?event.properties,
                            "event"
                        ),
                        EventKind::MessageReceived => tracing::trace!(
                            event = kind.as_str(),
                            correlation_id = %event.correlation_id,
                            properties = ?event.properties,
                            "event"
                        ),
                        _ => tracing::debug!(
                            event = kind.as_str(),
                            correlation_id = %event.correlation_id,
                            properties = ?event.properties,
                            "event"
                        ),
                    }
                }
            })
        })
        .collect()
}

/// Serve until Ctrl-C, then shut down gracefully.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let events = Arc::new(EventBus::new(config.events.buffer));
    let loggers = spawn_event_logger(&events);
    let server = Arc::new(build_server(&config, events)?);

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        framing = ?config.framing.strategy,
        mode = ?config.dispatch.mode,
        "starting server"
    );

    let mut serving = {
        let server = Arc::clone(&server);
        let port = config.server.port;
        tokio::spawn(async move { server.start(port).await })
    };

    let outcome = tokio::select! {
        result = &mut serving => Some(result),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
            }
            tracing::info!("shutdown requested");
            None
        }
    };

    server.stop().await;
    let result = match outcome {
        Some(result) => result,
        None => serving.await,
    };
    for logger in loggers {
        logger.abort();
    }
    result??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_config::DispatchMode;
    use std::time::Duration;

    #[test]
    fn test_server_config_mapping() {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".into();
        config.keepalive.idle_timeout_secs = 90;
        config.server.dispatch_delay_ms = 250;
        config.server.backpressure_capacity = 8;

        let mapped = server_config(&config);
        assert_eq!(mapped.host, "127.0.0.1");
        assert_eq!(mapped.idle_timeout, Duration::from_secs(90));
        assert_eq!(mapped.sweep_interval, Duration::from_secs(10));
        assert_eq!(mapped.dispatch_delay, Duration::from_millis(250));
        assert_eq!(mapped.backpressure_capacity, 8);
        assert_eq!(mapped.max_connections, 1024);
    }

    #[test]
    fn test_framing_selection() {
        let mut config = Config::default();
        assert_eq!(framing(&config).unwrap().name(), LineFraming::default().name());

        config.framing.strategy = FramingMode::Delimiter;
        config.framing.delimiter = '|';
        assert_eq!(framing(&config).unwrap().name(), DelimiterFraming::new(b'|', 16).name());

        config.framing.strategy = FramingMode::LengthPrefixed;
        assert_eq!(framing(&config).unwrap().name(), LengthPrefixedFraming::default().name());

        config.framing.strategy = FramingMode::Delimiter;
        config.framing.delimiter = '→';
        assert!(framing(&config).is_err());
    }

    #[tokio::test]
    async fn test_build_server_for_each_mode() {
        for mode in [DispatchMode::Command, DispatchMode::Structured] {
            let mut config = Config::default();
            config.dispatch.mode = mode;
            let server = build_server(&config, Arc::new(EventBus::default())).unwrap();
            assert!(!server.is_running());
            assert!(server.registry().is_empty());
        }
    }

    #[tokio::test]
    async fn test_build_server_rejects_invalid_config() {
        let mut config = Config::default();
        config.server.max_connections = 0;
        assert!(build_server(&config, Arc::new(EventBus::default())).is_err());
    }
}
