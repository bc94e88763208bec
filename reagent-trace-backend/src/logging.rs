use camino::Utf8Path;
use tracing::Level;
use tracing_subscriber::{filter::Targets, prelude::*};

/// Pretty logs on stderr without a log directory, daily-rolled JSON files inside it otherwise.
/// Stdout is left to command output.
pub fn initialize_logging(log_dir: Option<&Utf8Path>) {
    let log_layer = tracing_subscriber::fmt::layer();

    match log_dir {
        None => {
            let dev_log_filter = Targets::new()
                .with_target("reagent_trace_backend", Level::DEBUG)
                .with_target("reagent_trace", Level::DEBUG);
            let log_layer = log_layer
                .pretty()
                .with_writer(std::io::stderr)
                .with_filter(dev_log_filter);

            tracing_subscriber::registry().with(log_layer).init();
        }
        Some(path) => {
            let log_writer = tracing_appender::rolling::daily(path, "reagent-trace.log");
            let prod_log_filter = Targets::new()
                .with_target("reagent_trace_backend", Level::INFO)
                .with_target("reagent_trace", Level::INFO);
            let log_layer = log_layer
                .json()
                .with_writer(log_writer)
                .with_filter(prod_log_filter);

            tracing_subscriber::registry().with(log_layer).init();
        }
    }
}
