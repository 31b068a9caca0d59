//! provides logging helpers

use std::fmt::{self};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Writes the pre-encoded line protocol carried in an event's `msg` field.
struct LineProtocolFormatter;

#[derive(Default)]
struct MsgVisitor {
    msg: Option<String>,
}

impl Visit for MsgVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "msg" {
            self.msg = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "msg" {
            self.msg = Some(format!("{value:?}"));
        }
    }
}

impl<S, N> FormatEvent<S, N> for LineProtocolFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MsgVisitor::default();
        event.record(&mut visitor);

        let Some(line) = visitor.msg else {
            return Ok(());
        };
        // The encoder already terminates lines.
        write!(writer, "{line}")?;
        if !line.ends_with('\n') {
            writeln!(writer)?;
        }
        Ok(())
    }
}

fn is_metrics(target: &str) -> bool {
    target.contains("metrics")
}

/// initiate the global tracing subscriber
pub(crate) fn init(metrics_file: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let path = metrics_file
        .parent()
        .context("metrics file has no parent directory")?;
    let file = metrics_file
        .file_name()
        .and_then(|f| f.to_str())
        .context("metrics file name is not valid UTF-8")?;

    let fmt_layer = utils::logging::get_fmt_layer().with_filter(
        utils::logging::env_filter()
            .and(filter::filter_fn(|metadata| !is_metrics(metadata.target()))),
    );

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(3)
        .build(path)
        .context("failed to create rolling file appender")?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let metrics_layer = layer()
        .event_format(LineProtocolFormatter)
        .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| is_metrics(metadata.target())));

    registry().with(fmt_layer).with(metrics_layer).init();
    Ok(file_guard)
}
