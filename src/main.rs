use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;

use crew_scheduler::config::SchedulerConfig;
use crew_scheduler::error::WorkError;
use crew_scheduler::execution::{
    ExecutionCategory, ExecutionEvent, ExecutionScheduler, InMemoryCatalog, ProgressReporter,
    SubmitRequest, TargetInfo, WorkRequest, WorkUnit, work_fn,
};
use crew_scheduler::store::{ExecutionStore, LibSqlStore};

/// Stand-in for an LLM crew run: walks through `default_steps` steps,
/// reporting progress and honoring cancellation between steps.
fn simulated_work(label: &'static str, default_steps: u64) -> Arc<dyn WorkUnit> {
    work_fn(move |request: WorkRequest, reporter: &ProgressReporter| {
        let steps = request
            .inputs
            .get("steps")
            .and_then(|v| v.as_u64())
            .unwrap_or(default_steps)
            .max(1);
        let fail_rate = request
            .inputs
            .get("fail_rate")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let mut rng = rand::thread_rng();

        reporter.log(format!("Starting {label} {}", request.target_id));
        for step in 1..=steps {
            if reporter.is_cancelled() {
                reporter.log(format!("Stopped at step {step}/{steps}"));
                return Err(WorkError::Cancelled);
            }
            reporter.step(format!("Step {step}/{steps}"));
            std::thread::sleep(Duration::from_millis(rng.gen_range(40..120)));
            reporter.progress(step as f64 / steps as f64 * 100.0);
        }

        if rng.gen_bool(fail_rate) {
            return Err(WorkError::failed(format!("{label} returned an unusable answer")));
        }
        Ok(json!({
            "summary": format!("{label} {} finished after {steps} steps", request.target_id),
            "steps": steps,
        }))
    })
}

async fn seed_catalog() -> Arc<InMemoryCatalog> {
    let catalog = Arc::new(InMemoryCatalog::new());
    for id in 1..=8 {
        catalog
            .insert(
                ExecutionCategory::Task,
                id,
                TargetInfo::executable(format!("research-brief-{id}"))
                    .with_metadata("task_type", "research"),
            )
            .await;
    }
    for (id, mode) in [(1, "sequential"), (2, "hierarchical"), (3, "sequential")] {
        catalog
            .insert(
                ExecutionCategory::Workflow,
                id,
                TargetInfo::executable(format!("market-report-{id}"))
                    .with_metadata("workflow_type", "crew")
                    .with_metadata("execution_mode", mode),
            )
            .await;
    }
    for (id, role) in [(1, "analyst"), (2, "editor")] {
        catalog
            .insert(
                ExecutionCategory::Agent,
                id,
                TargetInfo::executable(format!("{role}-agent")).with_metadata("agent_role", role),
            )
            .await;
    }
    catalog
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
        .init();

    let config = SchedulerConfig::from_env()?;

    eprintln!("Crew Scheduler v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Capacity: tasks {}, workflows {}, agents {}",
        config.max_concurrent_tasks,
        config.max_concurrent_workflows,
        config
            .max_concurrent_agents
            .map_or_else(|| "uncapped".to_string(), |n| n.to_string()),
    );
    eprintln!("   Worker pool: {}", config.worker_pool_size);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn ExecutionStore> = match std::env::var("CREW_DB_PATH") {
        Ok(path) => {
            eprintln!("   Database: {path}");
            Arc::new(LibSqlStore::new_local(Path::new(&path)).await?)
        }
        Err(_) => {
            eprintln!("   Database: in-memory");
            Arc::new(LibSqlStore::new_memory().await?)
        }
    };

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = ExecutionScheduler::builder(config, seed_catalog().await)
        .work_unit(ExecutionCategory::Task, simulated_work("task", 10))
        .work_unit(ExecutionCategory::Workflow, simulated_work("workflow", 6))
        .work_unit(ExecutionCategory::Agent, simulated_work("agent", 5))
        .store(Arc::clone(&store))
        .build()?;

    // ── Event stream ─────────────────────────────────────────────────────
    let mut events = BroadcastStream::new(scheduler.subscribe());
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(ExecutionEvent::Progress { .. }) => {}
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => eprintln!("   event {line}"),
                    Err(e) => tracing::warn!(error = %e, "Failed to render event"),
                },
                Err(e) => tracing::warn!(error = %e, "Event stream lagged"),
            }
        }
    });

    // ── Burst of submissions ─────────────────────────────────────────────
    let mut submitted = Vec::new();
    for id in 1..=8 {
        let request = SubmitRequest::task(id)
            .with_user("demo")
            .with_inputs(json!({"topic": format!("topic-{id}"), "fail_rate": 0.2}));
        submitted.push(scheduler.submit(request).await?);
    }
    for id in 1..=3 {
        submitted.push(scheduler.submit(SubmitRequest::workflow(id)).await?);
    }
    for id in 1..=2 {
        let request = SubmitRequest::agent(id)
            .with_inputs(json!({"steps": 3}))
            .with_metadata("task_description", "Review the latest brief");
        submitted.push(scheduler.submit(request).await?);
    }

    // The last task is still waiting for a slot.
    if let Some(&last_task) = submitted.get(7) {
        let outcome = scheduler.cancel(last_task).await?;
        eprintln!("   cancel {last_task}: {outcome:?}");
    }

    let finished = futures::future::join_all(
        submitted
            .iter()
            .map(|id| scheduler.wait_for_completion(*id)),
    )
    .await;

    eprintln!("\nResults:");
    for record in finished.into_iter().flatten().flatten() {
        eprintln!(
            "   {:<8} {:<22} {:<9} {:>5.1}%  {}",
            record.category,
            record.target_name().unwrap_or("?"),
            record.status,
            record.progress,
            record.error.as_deref().unwrap_or(""),
        );
    }

    let stats = scheduler.get_statistics().await?;
    eprintln!("\nStatistics:\n{}", serde_json::to_string_pretty(&stats)?);

    scheduler.shutdown().await?;
    printer.abort();

    if let Some(target) = store.get_target_stats(ExecutionCategory::Task, 1).await? {
        eprintln!(
            "\nTask 1 history: {} runs, {} ok, {} failed, avg {:?}s",
            target.execution_count,
            target.success_count,
            target.failure_count,
            target.average_execution_secs,
        );
    }

    Ok(())
}
