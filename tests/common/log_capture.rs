//! Captures tracing events so tests can assert on what was logged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Level, Subscriber, dispatcher};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone)]
pub struct CapturedLog {
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

pub type Captured = Arc<Mutex<Vec<CapturedLog>>>;

struct CaptureLayer {
    logs: Captured,
}

struct Fields<'a>(&'a mut BTreeMap<String, String>);

impl Visit for Fields<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = BTreeMap::new();
        event.record(&mut Fields(&mut fields));
        let message = fields.remove("message").unwrap_or_default();
        self.logs.lock().unwrap().push(CapturedLog {
            level: *event.metadata().level(),
            message,
            fields,
        });
    }
}

/// Capture every event on the current thread until the guard drops.
pub fn capture() -> (Captured, dispatcher::DefaultGuard) {
    let logs = Captured::default();
    let subscriber = tracing_subscriber::registry()
        .with(CaptureLayer { logs: logs.clone() })
        .with(LevelFilter::TRACE);
    let guard = dispatcher::set_default(&Dispatch::new(subscriber));
    (logs, guard)
}

pub fn messages(logs: &Captured, level: Level) -> Vec<String> {
    logs.lock()
        .unwrap()
        .iter()
        .filter(|l| l.level == level)
        .map(|l| l.message.clone())
        .collect()
}
