use tracing::Level;
use tracing_subscriber::{
    filter::FromEnvError, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid RUST_LOG: {0}")]
    Filter(#[from] FromEnvError),
}

pub struct TracingBuilder {
    level: Level,
    json: bool,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,
            json: false,
        }
    }
}

impl TracingBuilder {
    /// Set the log level. RUST_LOG still has a higher priority over this value.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Log one JSON object per line instead of the compact text format.
    pub fn json(mut self, json: bool) -> TracingBuilder {
        self.json = json;
        self
    }

    /// Installs the global subscriber: an EnvFilter based on the provided log
    /// level (RUST_LOG still has a higher priority over the configured value)
    /// and a stderr writer output layer.
    pub fn build(self) -> Result<(), Error> {
        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;

        tracing_subscriber::registry()
            .with(filter)
            .with((!self.json).then(|| {
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(std::io::stderr)
                    .compact()
            }))
            .with(self.json.then(|| {
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(std::io::stderr)
                    .json()
            }))
            .try_init()?;

        Ok(())
    }
}
