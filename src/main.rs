use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reader_agent_runtime::agent::{
    AgentCategory, AgentJob, AgentJobContext, AgentPhase, AgentRuntimeEngine, AgentTaskRunner,
    Owner, RequestSource, RuntimeEvent, TaskSpec,
};
use reader_agent_runtime::config::RuntimeConfig;
use reader_agent_runtime::error::JobError;
use reader_agent_runtime::queue::{ExecutionQueue, JobEvent};
use tracing::info;

/// Simulated model call: request, stream a few chunks, persist.
struct SimulatedJob {
    chunks: u32,
    chunk_delay: Duration,
}

#[async_trait]
impl AgentJob for SimulatedJob {
    async fn run(&self, ctx: AgentJobContext) -> Result<(), JobError> {
        ctx.set_phase(AgentPhase::Requesting, Some("Contacting model".into()), None)
            .await;
        ctx.operation()
            .run_until_cancelled(tokio::time::sleep(self.chunk_delay))
            .await?;

        for chunk in 1..=self.chunks {
            let progress = f64::from(chunk) / f64::from(self.chunks);
            ctx.set_phase(
                AgentPhase::Generating,
                Some(format!("Chunk {chunk}/{}", self.chunks)),
                Some(progress),
            )
            .await;
            ctx.operation()
                .run_until_cancelled(tokio::time::sleep(self.chunk_delay))
                .await?;
        }

        ctx.check_cancelled()?;
        ctx.set_phase(AgentPhase::Persisting, Some("Saving".into()), Some(1.0))
            .await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = RuntimeConfig::from_env()?;
    eprintln!("📚 Reader agent runtime v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Jobs: {} global, {} per category",
        config.queue.max_concurrent_jobs, config.queue.default_category_limit
    );

    let engine = Arc::new(AgentRuntimeEngine::from_config(&config.agent));
    let queue = ExecutionQueue::new(config.queue.clone());
    let runner = AgentTaskRunner::new(Arc::clone(&engine), queue.clone(), config.agent.clone());

    // Print every agent event as a JSON line on stdout.
    let (history, mut agent_rx) = engine.subscribe_with_history().await;
    for event in history {
        println!("{}", serde_json::to_string(&event)?);
    }
    let printer = tokio::spawn(async move {
        while let Ok(event) = agent_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
            }
            if let RuntimeEvent::Promoted { to: None, from } = &event.event
                && from.category == AgentCategory::Summary
                && from.entity_id == 3
            {
                break;
            }
        }
    });

    let mut jobs = queue.events().await;
    let job_log = tokio::spawn(async move {
        while let Some(event) = jobs.recv().await {
            if let JobEvent::Upsert { record } = event
                && record.status.is_terminal()
            {
                info!(title = %record.title, status = %record.status, "Job record settled");
            }
        }
    });

    let job = |chunks| -> Arc<dyn AgentJob> {
        Arc::new(SimulatedJob {
            chunks,
            chunk_delay: Duration::from_millis(150),
        })
    };

    // The reader flips through three entries; summaries queue behind the first.
    for entity_id in 1..=3 {
        let owner = Owner::new(AgentCategory::Summary, entity_id, "default");
        let decision = runner
            .submit(TaskSpec::new(owner, RequestSource::Auto), job(3))
            .await;
        info!(entity_id, decision = ?decision, "Summary requested");
    }
    // Translation runs in its own category, beside the summaries.
    let translation = Owner::new(AgentCategory::Translation, 1, "ja");
    runner
        .submit(TaskSpec::new(translation.clone(), RequestSource::Manual), job(5))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    runner.cancel(&translation).await;

    tokio::time::timeout(Duration::from_secs(30), printer).await??;
    job_log.abort();
    Ok(())
}
