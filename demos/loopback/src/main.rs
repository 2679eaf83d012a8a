//! Loads two loopback tools, calls into them, and moves data between them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::info;

use toolbridge::BridgeRuntime;
use toolbridge::config::loader;
use toolbridge::kernel::ContextFactory;
use toolbridge::kernel::loopback::{LoopbackFactory, MemoryContainer};
use toolbridge::primitives::{Capability, SandboxPolicy, ToolConfig, ToolDescriptor, ToolId};
use toolbridge::telemetry::init_tracing;

const ORIGIN: &str = "loopback://demo";

#[derive(Debug, Parser)]
#[command(about = "Drive loopback tools through the toolbridge runtime")]
struct Args {
    /// JSON configuration file; falls back to `TOOLBRIDGE_CONFIG`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep the runtime up for this many seconds (or until Ctrl-C) before
    /// shutting down, so health checks can be observed.
    #[arg(long, default_value_t = 0)]
    hold_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = loader::load(args.config.as_deref())?;
    init_tracing(&config.telemetry.filter)?;

    if !config.channel.allowed_origins.is_empty() {
        config.channel.allowed_origins.push(ORIGIN.to_owned());
    }
    let runtime = BridgeRuntime::from_config(config, |channel| {
        let contexts: Arc<dyn ContextFactory> =
            Arc::new(LoopbackFactory::new(Arc::clone(channel), ORIGIN));
        contexts
    })?;
    let manager = runtime.manager();
    let container = Arc::new(MemoryContainer::new());

    let viewer = manager
        .load_tool(
            Arc::new(viewer_descriptor()?),
            container.clone(),
            Some(json!({"document": "report.pdf"})),
        )
        .await
        .context("loading viewer")?;
    let annotator = manager
        .load_tool(Arc::new(annotator_descriptor()?), container.clone(), None)
        .await
        .context("loading annotator")?;

    let page = manager
        .execute_capability(viewer.instance_id, "render_page", json!({"page": 1}))
        .await?;
    info!(%page, "viewer rendered a page");

    let ack = manager
        .transfer_data(
            viewer.instance_id,
            annotator.instance_id,
            json!({"selection": {"page": 1, "text": "Q3 revenue"}}),
        )
        .await?;
    info!(%ack, "annotator received the selection");

    for instance in manager.get_all_instances() {
        info!(
            instance_id = %instance.instance_id,
            tool_id = %instance.tool_id,
            status = %instance.status,
            "instance"
        );
    }

    if args.hold_secs > 0 {
        info!(seconds = args.hold_secs, "holding; press Ctrl-C to stop early");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.hold_secs)) => {}
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }
        for (instance_id, record) in manager.all_health_statuses() {
            info!(%instance_id, status = ?record.status, latency = ?record.last_latency, "health");
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn viewer_descriptor() -> Result<ToolDescriptor> {
    Ok(ToolDescriptor::builder(ToolId::new("pdf-viewer")?)
        .name("PDF Viewer")?
        .version("2.4.0")?
        .source(format!("{ORIGIN}/pdf-viewer"))
        .capability(
            Capability::builder("render_page")
                .description("Render one page")
                .build()?,
        )
        .capability(
            Capability::builder("export")
                .description("Export the document")
                .asynchronous(true)
                .build()?,
        )
        .config(
            ToolConfig::default()
                .with_sandbox(SandboxPolicy::new(["allow-scripts"]))
                .with_load_timeout(Duration::from_secs(10)),
        )
        .build()?)
}

fn annotator_descriptor() -> Result<ToolDescriptor> {
    Ok(ToolDescriptor::builder(ToolId::new("annotator")?)
        .name("Annotator")?
        .version("0.9.1")?
        .source(format!("{ORIGIN}/annotator"))
        .capability(Capability::builder("highlight").build()?)
        .build()?)
}
