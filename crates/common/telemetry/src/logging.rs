// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Global `tracing` subscriber setup for diskq binaries and tests.
//!
//! Layers, all behind one level filter:
//! - stdout, text or JSON (`append_stdout`)
//! - hourly rolling file with every event (`dir`)
//! - hourly rolling file with errors only (`dir`)

use std::{
    env,
    io::IsTerminal,
    sync::{Arc, Mutex, Once},
};

use bon::Builder;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Registry, filter, layer::SubscriberExt, prelude::*};

/// Deserializes a string, falling back to `T::default()` when it is empty.
///
/// # Errors
/// Returns an error if the non-empty string is not a valid `T`.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Filter used when neither `LoggingOptions::level` nor `RUST_LOG` is set.
const DEFAULT_LOG_TARGETS: &str = "info";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for rolling log files. Empty disables file logging.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Filter in `RUST_LOG` syntax, e.g. `info,diskq=debug`.
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log, 720 hourly files being 30 days.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

impl LoggingOptions {
    /// Level filter from the options, then `RUST_LOG`, then `info`.
    ///
    /// # Errors
    /// Returns an error if the chosen filter string does not parse.
    pub fn targets(&self) -> Result<filter::Targets, filter::ParseError> {
        let from_env = env::var(EnvFilter::DEFAULT_ENV).ok();
        self.level
            .as_deref()
            .or(from_env.as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS)
            .parse()
    }
}

#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with span context.
    Json,
    #[default]
    Text,
}

static GLOBAL_UT_LOG_GUARD: Lazy<Arc<Mutex<Option<Vec<WorkerGuard>>>>> =
    Lazy::new(|| Arc::new(Mutex::new(None)));

/// Logging for tests; safe to call from every test.
///
/// Reads `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) and
/// `UNITTEST_LOG_LEVEL` (default `debug`, with redb quieted).
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let mut g = GLOBAL_UT_LOG_GUARD.as_ref().lock().unwrap();

        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level =
            env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug,redb=info".to_string());
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            ..Default::default()
        };
        *g = Some(init_global_logging("unittest", &opts));

        tracing::info!("logs dir = {}", dir);
    });
}

/// Installs the global subscriber. Only the first call has any effect.
///
/// The returned guards flush the non-blocking writers when dropped and must
/// live as long as logging is wanted.
///
/// # Panics
/// Panics if the log directory cannot be used, the level filter does not
/// parse, or another global subscriber is already installed.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        LogTracer::init().expect("log tracer must be valid");

        let stdout_logging_layer = if opts.append_stdout {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);

            let ansi = std::io::stdout().is_terminal();
            Some(match opts.log_format {
                LogFormat::Json => tracing_subscriber::fmt::Layer::new()
                    .json()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_current_span(true)
                    .with_span_list(true)
                    .boxed(),
                LogFormat::Text => tracing_subscriber::fmt::Layer::new()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .boxed(),
            })
        } else {
            None
        };

        let file_logging_layer = if opts.dir.is_empty() {
            None
        } else {
            let (writer, guard) =
                tracing_appender::non_blocking(rolling_appender(opts, app_name));
            guards.push(guard);

            Some(match opts.log_format {
                LogFormat::Json => tracing_subscriber::fmt::Layer::new()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_current_span(true)
                    .with_span_list(true)
                    .boxed(),
                LogFormat::Text => tracing_subscriber::fmt::Layer::new()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed(),
            })
        };

        let err_file_logging_layer = if opts.dir.is_empty() {
            None
        } else {
            let prefix = format!("{app_name}-err");
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(opts, &prefix));
            guards.push(guard);

            Some(match opts.log_format {
                LogFormat::Json => tracing_subscriber::fmt::Layer::new()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter::LevelFilter::ERROR)
                    .boxed(),
                LogFormat::Text => tracing_subscriber::fmt::Layer::new()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter::LevelFilter::ERROR)
                    .boxed(),
            })
        };

        let filter = opts.targets().expect("error parsing log level string");
        let subscriber = Registry::default()
            .with(filter)
            .with(stdout_logging_layer)
            .with(file_logging_layer)
            .with(err_file_logging_layer);
        tracing::subscriber::set_global_default(subscriber)
            .expect("error setting global tracing subscriber");
    });

    guards
}

fn rolling_appender(opts: &LoggingOptions, prefix: &str) -> RollingFileAppender {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .unwrap_or_else(|e| {
            panic!(
                "initializing rolling file appender at {} failed: {}",
                &opts.dir, e
            )
        })
}
