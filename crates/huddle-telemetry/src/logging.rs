//! Warn and error events persisted to SQLite.
//!
//! `conn_id` and `room_id` get their own columns. An event that does not
//! carry them inherits them from the innermost enclosing span that does,
//! including values recorded on the span after it was created.

use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        conn_id TEXT,
        room_id TEXT,
        fields TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_ts ON logs(ts);
    CREATE INDEX IF NOT EXISTS idx_logs_conn ON logs(conn_id);
    CREATE INDEX IF NOT EXISTS idx_logs_room ON logs(room_id);
";

const INSERT: &str = "INSERT INTO logs (ts, level, target, message, conn_id, room_id, fields)
                      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Append-only SQLite log table.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write(&self, row: &LogRow) {
        let conn = self.conn.lock();
        let Ok(mut stmt) = conn.prepare_cached(INSERT) else {
            return;
        };
        let _ = stmt.execute(rusqlite::params![
            row.ts,
            row.level,
            row.target,
            row.message,
            row.ids.conn_id,
            row.ids.room_id,
            row.fields,
        ]);
    }
}

struct LogRow<'a> {
    ts: String,
    level: &'a str,
    target: &'a str,
    message: String,
    ids: CorrelationIds,
    fields: Option<String>,
}

/// Field values of one event or span, as JSON.
#[derive(Default)]
struct CollectedFields(Map<String, Value>);

impl CollectedFields {
    fn of_event(event: &Event<'_>) -> Self {
        let mut fields = Self::default();
        event.record(&mut fields);
        fields
    }

    fn take_text(&mut self, name: &str) -> Option<String> {
        match self.0.remove(name)? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    fn into_json(self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            serde_json::to_string(&self.0).ok()
        }
    }
}

impl Visit for CollectedFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().into(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().into(), Value::String(value.into()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().into(), value.into());
    }
}

/// Connection and room a log line belongs to. Also stored as a span
/// extension.
#[derive(Clone, Debug, Default)]
struct CorrelationIds {
    conn_id: Option<String>,
    room_id: Option<String>,
}

impl CorrelationIds {
    /// Move the id fields out of `fields`, overwriting what is already set.
    fn take_from(&mut self, fields: &mut CollectedFields) {
        if let Some(conn_id) = fields.take_text("conn_id") {
            self.conn_id = Some(conn_id);
        }
        if let Some(room_id) = fields.take_text("room_id") {
            self.room_id = Some(room_id);
        }
    }

    /// Fill only the ids that are still missing.
    fn inherit(&mut self, outer: &CorrelationIds) {
        if self.conn_id.is_none() {
            self.conn_id.clone_from(&outer.conn_id);
        }
        if self.room_id.is_none() {
            self.room_id.clone_from(&outer.room_id);
        }
    }

    fn is_complete(&self) -> bool {
        self.conn_id.is_some() && self.room_id.is_some()
    }

    fn is_empty(&self) -> bool {
        self.conn_id.is_none() && self.room_id.is_none()
    }
}

/// `tracing` layer writing warn and error events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = CollectedFields::default();
        attrs.record(&mut fields);
        let mut ids = CorrelationIds::default();
        ids.take_from(&mut fields);
        if ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(ids);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut fields = CollectedFields::default();
        values.record(&mut fields);
        let Some(span) = ctx.span(id) else { return };

        let mut extensions = span.extensions_mut();
        if let Some(ids) = extensions.get_mut::<CorrelationIds>() {
            ids.take_from(&mut fields);
            return;
        }
        let mut ids = CorrelationIds::default();
        ids.take_from(&mut fields);
        if !ids.is_empty() {
            extensions.insert(ids);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::WARN {
            return;
        }

        let mut fields = CollectedFields::of_event(event);
        let message = fields.take_text("message").unwrap_or_default();
        let mut ids = CorrelationIds::default();
        ids.take_from(&mut fields);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if ids.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<CorrelationIds>() {
                    ids.inherit(outer);
                }
            }
        }

        self.sink.write(&LogRow {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: metadata.level().as_str(),
            target: metadata.target(),
            message,
            ids,
            fields: fields.into_json(),
        });
    }
}
