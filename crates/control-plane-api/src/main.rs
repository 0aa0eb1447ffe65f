use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use control_plane::{Reaper, SessionIndex, UserClientCache, WarmPoolController, WatchAdapter};
use object_store::{ClientFactory, MemoryClientFactory, MemoryStore, ObjectStore, WarmPoolSpec};
use tokio_util::sync::CancellationToken;

#[derive(clap::Parser, Debug)]
#[clap(about = "AgentCube control-plane API server.")]
struct Args {
    /// Address to listen on.
    #[clap(long, env = "AGENTCUBE_API_ADDRESS", default_value = "0.0.0.0:8080")]
    address: String,

    /// Namespace in which sandbox objects are managed.
    #[clap(long, env = "AGENTCUBE_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Warm pool to draw sandboxes from. Optional.
    #[clap(long, env = "AGENTCUBE_WARM_POOL")]
    warm_pool: Option<String>,

    /// Desired warm replica count, applied when --warm-pool is set.
    #[clap(long, env = "AGENTCUBE_WARM_REPLICAS", default_value_t = 2)]
    warm_replicas: u32,

    /// Image used for sandboxes that do not request one.
    #[clap(
        long,
        env = "AGENTCUBE_DEFAULT_IMAGE",
        default_value = "agentcube/sandbox:latest"
    )]
    default_image: String,

    /// Port picod listens on inside each sandbox pod.
    #[clap(long, env = "AGENTCUBE_IN_POD_PORT", default_value_t = 8888)]
    in_pod_port: u16,

    /// Static bearer tokens for the in-memory store, PRINCIPAL=TOKEN.
    /// Real deployments resolve tokens through the orchestrator instead.
    #[clap(long = "user-token")]
    user_tokens: Vec<String>,

    /// Mark created sandboxes Ready automatically. The in-memory store
    /// has no orchestrator behind it, so local sandboxes need this to
    /// leave Pending.
    #[clap(long, env = "AGENTCUBE_AUTO_READY", default_value_t = true)]
    auto_ready: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(format!(
        "agentcube_api={log_level},control_plane_api={log_level},control_plane={log_level},object_store={log_level}"
    ))
    .context("parsing LOG_LEVEL environment filter failed")?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = runtime.block_on(run(args));
    runtime.shutdown_background();
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let store = MemoryStore::new();
    let factory = MemoryClientFactory::new(store.clone());
    for pair in &args.user_tokens {
        let (principal, token) = pair
            .split_once('=')
            .with_context(|| format!("malformed --user-token {pair:?}, expected PRINCIPAL=TOKEN"))?;
        factory.register_token(token, principal);
    }

    let index = Arc::new(SessionIndex::new());
    let (scheduler, scheduler_rx) = control_plane::Scheduler::new();
    let watch = WatchAdapter::new(index.clone(), scheduler.clone());

    let reaper = Arc::new(Reaper::new(factory.system_client()));
    tokio::spawn(control_plane::scheduler::run(
        scheduler_rx,
        reaper,
        shutdown.clone(),
    ));

    tokio::spawn(watch.clone().run(
        factory.system_client(),
        args.namespace.clone(),
        shutdown.clone(),
    ));

    if args.auto_ready {
        let store = store.clone();
        let namespace = args.namespace.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticks.tick() => {
                        let Ok(sandboxes) = store
                            .list_sandboxes(&namespace, &object_store::Selector::everything())
                            .await
                        else {
                            continue;
                        };
                        for sandbox in sandboxes.into_iter().filter(|s| s.ready.is_none()) {
                            let _ = store.set_sandbox_ready(
                                &namespace,
                                &sandbox.meta.name,
                                true,
                                Some("127.0.0.1"),
                            );
                        }
                    }
                }
            }
        });
    }

    let warm_poke = match &args.warm_pool {
        Some(pool) => {
            store.put_warm_pool(
                &args.namespace,
                pool,
                WarmPoolSpec {
                    template: object_store::PodTemplate {
                        image: args.default_image.clone(),
                        ..Default::default()
                    },
                    desired_replicas: args.warm_replicas,
                },
            );
            let controller = WarmPoolController::new(
                factory.system_client(),
                args.namespace.clone(),
                pool.clone(),
            );
            let (poke_tx, poke_rx) = tokio::sync::mpsc::channel(1);
            tokio::spawn(controller.run(poke_rx, shutdown.clone()));
            Some(poke_tx)
        }
        None => None,
    };

    let app = Arc::new(control_plane_api::App {
        index: index.clone(),
        watch,
        factory: factory.clone() as Arc<dyn ClientFactory>,
        clients: UserClientCache::default(),
        policy: Box::new(control_plane_api::CreatorOrSystem {
            system_principal: factory.system_principal().to_string(),
        }),
        warm_poke,
        config: control_plane_api::Config {
            namespace: args.namespace.clone(),
            warm_pool: args.warm_pool.clone(),
            in_pod_port: args.in_pod_port,
            default_image: args.default_image.clone(),
            ..Default::default()
        },
    });

    // Background sweeps release memory; reads already mask expired state.
    {
        let app = app.clone();
        let index = index.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticks.tick() => {
                        let sessions = index.clean_expired();
                        let clients = app.clients.clean_expired();
                        if sessions + clients > 0 {
                            tracing::debug!(sessions, clients, "swept expired entries");
                        }
                    }
                }
            }
        });
    }

    let router = control_plane_api::build_router(app);
    let listener = tokio::net::TcpListener::bind(&args.address)
        .await
        .with_context(|| format!("binding {}", args.address))?;
    tracing::info!(address = %args.address, namespace = %args.namespace, "agentcube-api started");

    // Gracefully exit on either SIGINT (ctrl-c) or SIGTERM.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            use tokio::signal::unix;
            let mut sigint = unix::signal(unix::SignalKind::interrupt()).unwrap();
            let mut sigterm = unix::signal(unix::SignalKind::terminate()).unwrap();
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
            tracing::info!("caught signal to exit");
            shutdown.cancel();
        });
    }

    control_plane_api::serve(listener, router, shutdown).await
}
