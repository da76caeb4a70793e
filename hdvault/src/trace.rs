use anyhow::Result;
use std::path::Path;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Installs the global subscriber: a terminal layer on stderr and a JSON
/// file layer at `<dir>/hdvault.log`. `dir: None` disables the file.
pub fn init(level: LevelFilter, json_format: bool, dir: Option<&Path>) -> Result<()> {
    if level == LevelFilter::OFF {
        return Ok(());
    }

    let is_terminal = atty::is(atty::Stream::Stderr);
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if let Some(dir) = dir {
        layers.push(
            fmt::layer()
                .with_writer(tracing_appender::rolling::never(dir, "hdvault.log"))
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_target(false)
                .json()
                .boxed(),
        );
    }

    let terminal_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(is_terminal)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    // the formatters differ in type, boxing lets either share the stack
    layers.push(if json_format {
        terminal_layer.json().boxed()
    } else {
        terminal_layer.boxed()
    });

    tracing_subscriber::registry()
        .with(layers)
        .with(EnvFilter::new(format!("hdvault={}", level)))
        .try_init()?;

    tracing::info!(%level, "Initialized tracing");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn installs_file_and_terminal_layers() {
        let dir = tempdir().unwrap();

        init(LevelFilter::DEBUG, false, Some(dir.path())).unwrap();
        tracing::info!("written to the log file");

        assert!(dir.path().join("hdvault.log").exists());
        assert!(init(LevelFilter::DEBUG, true, None).is_err());
    }

    #[test]
    fn off_installs_nothing() {
        init(LevelFilter::OFF, true, None).unwrap();
    }
}
