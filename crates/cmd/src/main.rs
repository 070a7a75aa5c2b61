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

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use diskq::{Codec, EngineKind, Queue, QueueBuilder, QueueConfig, QueueError};
use diskq_common_telemetry::{LoggingOptions, init_global_logging, set_panic_hook};
use snafu::{ResultExt, Whatever};
use tokio::task::JoinSet;

#[derive(Debug, Parser)]
#[clap(
name = "diskq",
about = "Inspect and exercise crash-durable diskq queues",
author = env!("CARGO_PKG_AUTHORS"),
version)]
struct Cli {
    /// Log filter in RUST_LOG syntax.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory for rolling log files; stdout only when omitted.
    #[arg(long, global = true, default_value = "")]
    log_dir: String,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Demo(DemoArgs),
    Inspect(InspectArgs),
    Drain(DrainArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineArg {
    Snapshot,
    AppendLog,
    Indexed,
}

impl From<EngineArg> for EngineKind {
    fn from(value: EngineArg) -> Self {
        match value {
            EngineArg::Snapshot => Self::Snapshot,
            EngineArg::AppendLog => Self::AppendLog,
            EngineArg::Indexed => Self::Indexed,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodecArg {
    Bincode,
    Json,
}

impl From<CodecArg> for Codec {
    fn from(value: CodecArg) -> Self {
        match value {
            CodecArg::Bincode => Self::Bincode,
            CodecArg::Json => Self::Json,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct QueueArgs {
    /// Data file of the queue.
    #[arg(long)]
    path: PathBuf,

    #[arg(long, value_enum, default_value_t = EngineArg::Indexed)]
    engine: EngineArg,

    #[arg(long, value_enum, default_value_t = CodecArg::Bincode)]
    codec: CodecArg,

    /// Capacity bound; 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    maxsize: usize,
}

impl QueueArgs {
    fn config(&self) -> QueueConfig {
        QueueConfig {
            path:    self.path.clone(),
            maxsize: self.maxsize,
            engine:  self.engine.into(),
            codec:   self.codec.into(),
        }
    }

    async fn open(&self) -> Result<Arc<Queue<String>>, Whatever> {
        let queue = QueueBuilder::from_config(self.config())
            .build()
            .await
            .with_whatever_context(|_| {
                format!("failed to open queue at {}", self.path.display())
            })?;
        Ok(Arc::new(queue))
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Runs producers and consumers against one queue and waits until every item is
acknowledged. Items left over from an earlier run are discarded first.
Examples:

diskq demo --path /tmp/demo.db --producers 4 --consumers 2 --items 26

")]
struct DemoArgs {
    #[command(flatten)]
    queue: QueueArgs,

    #[arg(long, default_value_t = 4)]
    producers: usize,

    #[arg(
        long,
        default_value_t = 2,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    consumers: usize,

    /// Items put by each producer.
    #[arg(long, default_value_t = 100)]
    items: usize,
}

impl DemoArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let queue = self.queue.open().await?;
        let mut leftovers = 0_usize;
        loop {
            match queue.get_nowait().await {
                Ok(_) => leftovers += 1,
                Err(err) if err.is_empty() => break,
                Err(err) => return Err(err).whatever_context("failed to discard leftover items"),
            }
        }
        if leftovers > 0 {
            tracing::info!(leftovers, "Discarded items from an earlier run");
        }

        let total = self.producers * self.items;
        let claimed = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let mut tasks: JoinSet<Result<(), QueueError>> = JoinSet::new();
        for producer in 0..self.producers {
            let queue = Arc::clone(&queue);
            let items = self.items;
            tasks.spawn(async move {
                for n in 0..items {
                    queue.put(format!("producer {producer}: item {n}")).await?;
                }
                Ok(())
            });
        }
        for _ in 0..self.consumers {
            let queue = Arc::clone(&queue);
            let claimed = Arc::clone(&claimed);
            tasks.spawn(async move {
                while claimed.fetch_add(1, Ordering::AcqRel) < total {
                    let item = queue.get().await?;
                    tracing::debug!(%item, "Consumed");
                    queue.task_done()?;
                }
                Ok(())
            });
        }

        queue.join().await;
        while let Some(result) = tasks.join_next().await {
            result
                .whatever_context("demo task panicked")?
                .whatever_context("demo task failed")?;
        }

        let elapsed = started.elapsed();
        println!(
            "{total} items through {} in {elapsed:?} ({:.0} items/s), peak size {}",
            queue.path().display(),
            total as f64 / elapsed.as_secs_f64(),
            queue.peak_size()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Opens a queue and prints how many items it holds.
Examples:

diskq inspect --path /tmp/demo.log --engine append-log

")]
struct InspectArgs {
    #[command(flatten)]
    queue: QueueArgs,
}

impl InspectArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let queue = self.queue.open().await?;
        println!(
            "{}: {:?} engine, {} items, maxsize {}",
            queue.path().display(),
            queue.engine_kind(),
            queue.qsize().await,
            queue.maxsize()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Removes every item from a queue, printing one item per line.
Examples:

diskq drain --path /tmp/demo.db

")]
struct DrainArgs {
    #[command(flatten)]
    queue: QueueArgs,

    /// Stop after this many items.
    #[arg(long)]
    limit: Option<usize>,
}

impl DrainArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let queue = self.queue.open().await?;
        let limit = self.limit.unwrap_or(usize::MAX);
        let mut drained = 0;
        while drained < limit {
            match queue.get_nowait().await {
                Ok(item) => {
                    println!("{item}");
                    drained += 1;
                }
                Err(err) if err.is_empty() => break,
                Err(err) => return Err(err).whatever_context("failed to drain queue"),
            }
        }
        let remaining = queue.qsize().await;
        tracing::info!(drained, remaining, "Drained queue");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();

    let logging = LoggingOptions {
        dir: cli.log_dir.clone(),
        level: cli.log_level.clone(),
        ..Default::default()
    };
    let _guards = init_global_logging("diskq", &logging);
    set_panic_hook();

    match cli.commands {
        Commands::Demo(args) => args.run().await,
        Commands::Inspect(args) => args.run().await,
        Commands::Drain(args) => args.run().await,
    }
}
