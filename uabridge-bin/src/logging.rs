use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uabridge_error::{BridgeError, BridgeResult};

/// Console plus daily-rolling file output. The returned guard must stay
/// alive for the process lifetime or buffered file output is lost.
pub fn init(level: &str) -> BridgeResult<WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily("logs", "uabridge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| BridgeError::ConfigError(format!("bad log level {level:?}: {e}")))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .map_err(|e| BridgeError::Msg(format!("logger init: {e}")))?;
    Ok(guard)
}
