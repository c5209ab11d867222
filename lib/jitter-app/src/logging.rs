//! Logging.

use std::{
    fmt::{self, Write as _},
    sync::OnceLock,
};

use chrono::{
    format::{DelayedFormat, Item, StrftimeItems},
    Local,
};
use tracing::{field, level_filters::LevelFilter, Event, Subscriber};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields},
    layer::SubscriberExt as _,
    registry::LookupSpan,
    util::SubscriberInitExt as _,
    EnvFilter, Layer,
};

const LOG_LEVEL_ENV_VAR: &str = "JITTER_LOG_LEVEL";
const LOG_FORMAT_JSON_ENV_VAR: &str = "JITTER_LOG_FORMAT_JSON";
const APP_NAME: &str = "jitter";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// This function reads the `JITTER_LOG_LEVEL` environment variable to determine the log filtering directives to use.
/// If the environment variable is not set, `default_level` is used, falling back to `INFO` if no default level was
/// given. Additionally, it reads the `JITTER_LOG_FORMAT_JSON` environment variable to determine which output format to
/// use. If it is set to `true` or `1`, the logs will be formatted as JSON. If it is set to any other value, or not set
/// at all, the logs will default to a human-readable format modeled after the Datadog Agent's.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let is_json = std::env::var(LOG_FORMAT_JSON_ENV_VAR)
        .map(|s| is_truthy(&s))
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    if is_json {
        tracing_subscriber::registry()
            .with(initialize_tracing_json().with_filter(level_filter))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(initialize_tracing_pretty().with_filter(level_filter))
            .try_init()?;
    }

    Ok(())
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value == "true" || value == "1"
}

fn initialize_tracing_json<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
}

fn initialize_tracing_pretty<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new().event_format(AgentLikeFormatter::new(APP_NAME))
}

struct AgentLikeFormatter {
    app_name: String,
}

impl AgentLikeFormatter {
    fn new(app_name: &str) -> Self {
        // Turns something like "jitter-gen" or "Jitter Gen" into "JITTERGEN".
        let app_name = app_name.to_uppercase().replace("-", "").replace(" ", "");

        Self { app_name }
    }
}

impl<S, N> FormatEvent<S, N> for AgentLikeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();

        // Write the basic log header bits: time, application identifier, level, and file/line information:
        write!(
            writer,
            "{} | {} | {} | ",
            get_delayed_format_now(),
            self.app_name,
            metadata.level()
        )?;

        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            write!(writer, "({}:{})", file, line)?;
        } else {
            write!(writer, "(unknown:0)")?;
        }

        // Spans are written outermost first, each as `name{fields}`.
        if let Some(scope) = ctx.event_scope() {
            let mut spans_written = 0;
            for span in scope.from_root() {
                let prefix = if spans_written == 0 { " | " } else { " " };
                let extensions = span.extensions();
                match extensions.get::<FormattedFields<N>>() {
                    Some(fields) if !fields.is_empty() => write!(writer, "{}{}{{{}}}", prefix, span.name(), fields)?,
                    _ => write!(writer, "{}{}", prefix, span.name())?,
                }
                spans_written += 1;
            }
        }

        // Structured fields come first, then the message.
        let mut fields = EventFields::default();
        event.record(&mut fields);
        if !fields.fields.is_empty() {
            write!(writer, " | {}", fields.fields)?;
        }
        if !fields.message.is_empty() {
            write!(writer, " | {}", fields.message)?;
        }

        writeln!(writer)
    }
}

/// Collects event fields as comma-separated `key:value` pairs, keeping the message separately.
#[derive(Default)]
struct EventFields {
    fields: String,
    message: String,
}

impl EventFields {
    fn push(&mut self, field: &field::Field, value: fmt::Arguments<'_>) {
        // Writing to a `String` cannot fail.
        if field.name() == "message" {
            let _ = self.message.write_fmt(value);
        } else {
            if !self.fields.is_empty() {
                self.fields.push(',');
            }
            let _ = write!(self.fields, "{}:{}", field.name(), value);
        }
    }
}

impl field::Visit for EventFields {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.push(field, format_args!("{:?}", value));
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.push(field, format_args!("{}", value));
    }
}

/// Gets a delayed formatter for the current local time.
fn get_delayed_format_now() -> DelayedFormat<impl Iterator<Item = &'static Item<'static>> + Clone> {
    // Timestamp format to end up with the equivalent of `2024-12-31 23:59:59 +00:00`.
    static FORMAT_ITEMS: OnceLock<Vec<Item<'static>>> = OnceLock::new();
    let format_items = FORMAT_ITEMS.get_or_init(|| StrftimeItems::new("%Y-%m-%d %H:%M:%S %:z").collect());

    Local::now().format_with_items(format_items.iter())
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use tracing::{info, info_span};
    use tracing_subscriber::{layer::SubscriberExt as _, Registry};

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture<F: FnOnce()>(f: F) -> String {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let subscriber = Registry::default().with(
            tracing_subscriber::fmt::Layer::new()
                .event_format(AgentLikeFormatter::new("jitter"))
                .with_writer(move || writer.clone()),
        );

        tracing::subscriber::with_default(subscriber, f);
        buffer.contents()
    }

    #[test]
    fn agent_like_format_fields_then_message() {
        let output = capture(|| info!(result = 200, delay_ms = 12, "Request handled."));

        let sections = output.trim_end().split(" | ").collect::<Vec<_>>();
        assert_eq!(sections.len(), 6, "unexpected output: {}", output);
        assert_eq!(sections[1], "JITTER");
        assert_eq!(sections[2], "INFO");
        assert!(sections[3].starts_with("(") && sections[3].contains("logging.rs:"));
        assert_eq!(sections[4], "result:200,delay_ms:12");
        assert_eq!(sections[5], "Request handled.");
    }

    #[test]
    fn agent_like_format_includes_spans() {
        let output = capture(|| {
            let span = info_span!("http_request", path = "/healthz");
            let _entered = span.enter();
            info!("Probe answered.");
        });

        assert!(output.contains(" | http_request{path=\"/healthz\"} | Probe answered."), "unexpected output: {}", output);
    }

    #[test]
    fn agent_like_format_message_only() {
        let output = capture(|| info!("Started."));
        assert!(output.trim_end().ends_with(") | Started."), "unexpected output: {}", output);
    }

    #[test]
    fn app_name_normalized() {
        assert_eq!(AgentLikeFormatter::new("jitter-gen").app_name, "JITTERGEN");
        assert_eq!(AgentLikeFormatter::new("Jitter Gen").app_name, "JITTERGEN");
    }

    #[test]
    fn json_flag_parsing() {
        assert!(is_truthy("true"));
        assert!(is_truthy(" TRUE "));
        assert!(is_truthy("1"));
        assert!(!is_truthy("json"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }
}
