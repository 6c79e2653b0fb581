use std::fmt;
use std::time::{Instant, SystemTime};

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    Console,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "console" => Some(LogFormat::Console),
            _ => None,
        }
    }

    /// Format selected through `QUILT_LOG_FORMAT`, console when unset or unknown.
    pub fn from_env() -> Self {
        std::env::var("QUILT_LOG_FORMAT")
            .ok()
            .and_then(|s| Self::parse(&s))
            .unwrap_or(LogFormat::Console)
    }
}

struct Rfc3339Millis;

impl FormatTime for Rfc3339Millis {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", humantime::format_rfc3339_millis(SystemTime::now()))
    }
}

pub struct Logger;

impl Logger {
    /// Install the global subscriber. Safe to call more than once; later calls are ignored.
    pub fn init() {
        Self::init_with(LogFormat::from_env());
    }

    pub fn init_with(format: LogFormat) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(false)
                .try_init(),
            LogFormat::Console => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_timer(Rfc3339Millis)
                .with_target(false)
                .try_init(),
        };

        if result.is_err() {
            tracing::debug!("Global subscriber already installed");
        }
    }
}

/// Timing helper for measuring operation duration
pub struct Timer {
    start: Instant,
    event: String,
    network: Option<String>,
}

impl Timer {
    pub fn new(event: &str) -> Self {
        Self {
            start: Instant::now(),
            event: event.to_string(),
            network: None,
        }
    }

    pub fn with_network(event: &str, network: &str) -> Self {
        Self {
            start: Instant::now(),
            event: event.to_string(),
            network: Some(network.to_string()),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn log_completion(self) {
        let duration_ms = self.elapsed_ms();
        match self.network {
            Some(network) => {
                tracing::debug!(network = %network, duration_ms, "{}", self.event)
            }
            None => tracing::debug!(duration_ms, "{}", self.event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("console"), Some(LogFormat::Console));
        assert_eq!(LogFormat::parse("xml"), None);

        std::env::set_var("QUILT_LOG_FORMAT", "json");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
        std::env::remove_var("QUILT_LOG_FORMAT");
        assert_eq!(LogFormat::from_env(), LogFormat::Console);
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        Logger::init_with(LogFormat::Console);
        Logger::init_with(LogFormat::Json);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::with_network("network setup", "lxdbr0");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10);
        timer.log_completion();
    }
}
