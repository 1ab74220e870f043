//! provides logging helpers

use std::io::Stderr;

use tracing::Subscriber;
use tracing_subscriber::fmt::format::DefaultFields;
use tracing_subscriber::fmt::format::Format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::registry::LookupSpan;

/// Console layer shared by every binary in the workspace: human readable,
/// written to stderr, with the event target included.
pub fn get_fmt_layer<S>() -> Layer<S, DefaultFields, Format, fn() -> Stderr>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer()
        .with_writer(std::io::stderr as fn() -> Stderr)
        .with_target(true)
}
