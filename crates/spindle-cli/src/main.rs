//! spindle CLI: run a dispatch server or enqueue tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use spindle_core::config::parse_queues;
use spindle_core::impls::RedisBroker;
use spindle_core::secrecy::ExposeSecret;
use spindle_core::{
    BoxError, Client, Config, EnqueueOptions, Handler, HandlerRegistry, PriorityMode, Server, Task,
    TaskContext,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spindle", about = "Priority-aware task queue on Redis")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server with the bundled demo handlers until Ctrl-C
    Serve {
        /// Maximum handlers running at once
        #[arg(long)]
        concurrency: Option<usize>,
        /// Weight table, e.g. critical:6,default:3,low:1
        #[arg(long)]
        queues: Option<String>,
        /// Always try the heaviest queue first
        #[arg(long)]
        strict: bool,
    },
    /// Enqueue tasks and print their IDs
    Enqueue {
        /// Task type, e.g. email:deliver
        #[arg(long = "type")]
        task_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value = spindle_core::app::DEFAULT_QUEUE)]
        queue: String,
        /// How long the finished record is kept
        #[arg(long)]
        retention_secs: Option<u64>,
        /// Task ID (only valid with --count 1)
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let broker = Arc::new(
        RedisBroker::connect(config.redis_url.expose_secret())
            .await
            .context("connect to redis")?,
    );

    match cli.command {
        Command::Serve {
            concurrency,
            queues,
            strict,
        } => {
            let mut server_config = config.server;
            if let Some(n) = concurrency {
                server_config.concurrency = n;
            }
            if let Some(raw) = queues {
                server_config.queues = parse_queues(&raw)?;
            }
            if strict {
                server_config.priority = PriorityMode::Strict;
            }

            let server = Server::new(broker, demo_handlers()?, server_config)?;
            let handle = server.start();

            tokio::signal::ctrl_c().await?;
            info!("ctrl-c received, shutting down");
            handle.shutdown().await;
            Ok(())
        }
        Command::Enqueue {
            task_type,
            payload,
            queue,
            retention_secs,
            id,
            count,
        } => {
            if id.is_some() && count != 1 {
                anyhow::bail!("--id can only be used with --count 1");
            }
            // reject malformed JSON before it reaches a handler
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let payload = serde_json::to_vec(&payload)?;

            let client = Client::new(broker);
            for _ in 0..count {
                let mut opts = EnqueueOptions::new().queue(queue.as_str());
                if let Some(secs) = retention_secs {
                    opts = opts.retention(Duration::from_secs(secs));
                }
                if let Some(id) = &id {
                    opts = opts.task_id(id.as_str());
                }

                let info = client
                    .enqueue(Task::new(task_type.as_str(), payload.clone()), opts)
                    .await?;
                println!("{}", info.id);
            }
            Ok(())
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmailPayload {
    to: String,
    #[serde(default)]
    subject: String,
}

#[derive(Debug, Deserialize)]
struct ResizePayload {
    src: String,
    width: u32,
    height: u32,
}

/// Resizes images. Stands in for real work with a sleep.
struct ImageResizer {
    delay: Duration,
}

#[async_trait]
impl Handler for ImageResizer {
    async fn process_task(&self, mut ctx: TaskContext, task: Task) -> Result<(), BoxError> {
        let p: ResizePayload = serde_json::from_slice(task.payload())?;
        info!(
            task_id = %ctx.task_id(),
            src = %p.src,
            width = p.width,
            height = p.height,
            "resizing image"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(()),
            _ = ctx.shutdown_requested() => Err("interrupted by shutdown".into()),
        }
    }
}

fn demo_handlers() -> anyhow::Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    registry.handle_fn("email:deliver", |ctx: TaskContext, task: Task| async move {
        let p: EmailPayload = serde_json::from_slice(task.payload())?;
        if !p.to.contains('@') {
            return Err(BoxError::from(format!("bad recipient {:?}", p.to)));
        }
        info!(task_id = %ctx.task_id(), to = %p.to, subject = %p.subject, "sending email");
        Ok::<(), BoxError>(())
    })?;
    registry.handle(
        "image:resize",
        ImageResizer {
            delay: Duration::from_millis(500),
        },
    )?;

    Ok(registry)
}
