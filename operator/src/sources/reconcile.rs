use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use leastpriv_types::AuditSource;
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::actions;
use crate::args::Args;
use crate::pipeline;
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// How long leadership is considered valid without renewal.
const LEASE_TTL: Duration = Duration::from_secs(15);
const RENEW_EVERY: Duration = Duration::from_secs(5);

/// Bound on waiting for a pipeline to wind down (it may run a final flush).
const PIPELINE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Entrypoint for the `AuditSource` controller. Only the leaseholder runs
/// the reconciler and its pipelines; on leadership loss everything stops and
/// the next leader resumes from the positions persisted in Source status.
pub async fn run(client: Client, args: Args, shutdown: CancellationToken) -> Result<(), Error> {
    println!("{}", "⚙️ Starting AuditSource controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = args
        .pod_name
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| format!("leastpriv-operator-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &args.namespace,
        LeaseLockParams {
            holder_id,
            lease_name: args.lease_name.clone(),
            lease_ttl: LEASE_TTL,
        },
    );

    leastpriv_common::signal_ready();

    // We run indefinitely; only the leader runs the controller.
    // On leadership loss, we abort the controller and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(RENEW_EVERY);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                context.stop_all().await;
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update the Lease,
                // assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    context.stop_all().await;
                    eprintln!("stopped controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure the controller is running.
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let api: Api<AuditSource> = Api::all(client.clone());
                let context_for_controller = context.clone();
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 AuditSource controller started.".green());
                    Controller::new(api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure the controller and pipelines stop.
            eprintln!("lost leadership; stopping controller");
            task.abort();
            context.stop_all().await;
        }
    }
}

/// Context injected with each `reconcile` and `on_error` invocation.
struct ContextData {
    client: Client,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    /// Running pipelines keyed by (namespace, name).
    pipelines: Mutex<HashMap<(String, String), PipelineHandle>>,
}

struct PipelineHandle {
    generation: Option<i64>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ContextData {
    pub fn new(client: Client) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                metrics: ControllerMetrics::new("sources"),
                pipelines: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                pipelines: Mutex::new(HashMap::new()),
            }
        }
    }

    /// Cancel and await every pipeline; used on shutdown and leadership loss.
    async fn stop_all(&self) {
        let handles: Vec<((String, String), PipelineHandle)> =
            self.pipelines.lock().await.drain().collect();
        for ((namespace, name), handle) in handles {
            stop_handle(&namespace, &name, handle).await;
        }
    }
}

async fn stop_handle(namespace: &str, name: &str, handle: PipelineHandle) {
    handle.cancel.cancel();
    let abort = handle.task.abort_handle();
    if tokio::time::timeout(PIPELINE_STOP_TIMEOUT, handle.task)
        .await
        .is_err()
    {
        eprintln!(
            "⚠️ {namespace}/{name} pipeline did not stop within {:?}",
            PIPELINE_STOP_TIMEOUT
        );
        abort.abort();
    }
}

/// Action to be taken upon an `AuditSource` during reconciliation.
#[derive(Debug, PartialEq, Clone)]
enum SourceAction {
    /// Bind a fresh pipeline to the current generation.
    StartPipeline { reason: String },

    StopPipeline { reason: String },

    /// The running pipeline matches the observed generation.
    NoOp,
}

impl SourceAction {
    fn to_str(&self) -> &str {
        match self {
            SourceAction::StartPipeline { .. } => "StartPipeline",
            SourceAction::StopPipeline { .. } => "StopPipeline",
            SourceAction::NoOp => "NoOp",
        }
    }
}

/// Reconciliation function for the `AuditSource` resource.
async fn reconcile(instance: Arc<AuditSource>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected AuditSource resource to be namespaced.".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    // Benchmark the read phase of reconciliation.
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Read phase of reconciliation determines goal during the write phase.
    let action = determine_action(&context, &namespace, &name, &instance).await;

    if action != SourceAction::NoOp {
        println!(
            "🔧 {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " ACTION: ".color(FG1),
            format!("{:?}", action).color(FG2),
        );
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    // Benchmark the write phase of reconciliation.
    #[cfg(feature = "metrics")]
    let timer = match action {
        SourceAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    let result = match action {
        SourceAction::StartPipeline { .. } => {
            start_pipeline(&context, client, &namespace, &name, &instance).await?;
            Action::requeue(PROBE_INTERVAL)
        }
        SourceAction::StopPipeline { reason } => {
            let key = (namespace.clone(), name.clone());
            if let Some(handle) = context.pipelines.lock().await.remove(&key) {
                println!("🛑 {namespace}/{name} stopping pipeline: {reason}");
                stop_handle(&namespace, &name, handle).await;
            }
            Action::await_change()
        }
        SourceAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// Decide what the write phase should do for the observed Source state.
async fn determine_action(
    context: &ContextData,
    namespace: &str,
    name: &str,
    instance: &AuditSource,
) -> SourceAction {
    let pipelines = context.pipelines.lock().await;
    let key = (namespace.to_string(), name.to_string());

    if instance.metadata.deletion_timestamp.is_some() {
        return if pipelines.contains_key(&key) {
            SourceAction::StopPipeline {
                reason: "resource is being deleted".to_string(),
            }
        } else {
            SourceAction::NoOp
        };
    }

    match pipelines.get(&key) {
        Some(handle) if handle.task.is_finished() => SourceAction::StartPipeline {
            reason: "pipeline exited; restarting".to_string(),
        },
        // Anti-thrash: a live pipeline at the observed generation is a no-op.
        Some(handle) if handle.generation == instance.metadata.generation => SourceAction::NoOp,
        Some(handle) => SourceAction::StartPipeline {
            reason: format!(
                "generation advanced from {:?} to {:?}",
                handle.generation, instance.metadata.generation
            ),
        },
        None => SourceAction::StartPipeline {
            reason: "no pipeline running".to_string(),
        },
    }
}

/// Stop any existing pipeline for the source, then start one bound to the
/// current generation. The map lock is held throughout so concurrent
/// reconciles of the same object serialize here.
async fn start_pipeline(
    context: &ContextData,
    client: Client,
    namespace: &str,
    name: &str,
    instance: &Arc<AuditSource>,
) -> Result<(), Error> {
    let key = (namespace.to_string(), name.to_string());
    let mut pipelines = context.pipelines.lock().await;

    if let Some(handle) = pipelines.remove(&key) {
        stop_handle(namespace, name, handle).await;
    }

    let updated = actions::pipeline_starting(client.clone(), instance.as_ref()).await?;
    let source = Arc::new(updated);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        let source = source.clone();
        async move {
            if let Err(e) = pipeline::run(client.clone(), source.clone(), cancel).await {
                eprintln!(
                    "{}",
                    format!(
                        "❌ {}/{} pipeline failed: {e}",
                        source.namespace().unwrap_or_default(),
                        source.name_any()
                    )
                    .red()
                );
                let _ = actions::pipeline_failed(
                    client,
                    source.as_ref(),
                    e.startup_reason(),
                    &e.to_string(),
                )
                .await;
            }
        }
    });
    pipelines.insert(
        key,
        PipelineHandle {
            generation: instance.metadata.generation,
            cancel,
            task,
        },
    );
    Ok(())
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
fn on_error(instance: Arc<AuditSource>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error: {error:?} on {}/{}",
            instance.namespace().unwrap_or_default(),
            instance.name_any()
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}
