#[macro_use]
extern crate log;

use anyhow::Context;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use kube_runtime::{WatchStreamExt, reflector, watcher};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use rustrial_k8s_deployment_exposer_apis::ExposePolicy;
use std::{collections::HashSet, future::Future, net::SocketAddr, str::FromStr, time::Duration};

mod cache;
mod controller;
mod errors;
mod notifier;
mod prometheus_exporter;
mod rate_limiter;
mod reconciler;
mod utils;
mod work_queue;

#[cfg(test)]
mod test_utils;

use cache::ReflectorCache;
use controller::{Controller, ControllerSettings};
use errors::ControllerError;
use notifier::EventNotifier;
use prometheus_exporter::start_prometheus_metrics_server;
use rate_limiter::default_controller_rate_limiter;
use reconciler::{KubeServiceApi, ServiceReconciler};
use work_queue::WorkQueue;

const QUEUE_NAME: &'static str = "deployments";

#[derive(Clone, Debug)]
struct Configuration {
    watch_namespaces: Option<HashSet<String>>,
    controller: ControllerSettings,
    policy: ExposePolicy,
    metrics_addr: SocketAddr,
}

impl Configuration {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(env_var)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        fn normalize(hs: HashSet<String>) -> Option<HashSet<String>> {
            if hs.is_empty() || hs.contains("*") || hs.contains("") {
                None
            } else {
                Some(hs)
            }
        }
        let watch_namespaces: Option<HashSet<String>> = lookup("WATCH_NAMESPACES")
            .map(|v| normalize(v.split(",").map(|v| v.trim().to_string()).collect()))
            .flatten();
        let defaults = ControllerSettings::default();
        let workers = parse(&lookup, "WORKERS")?.unwrap_or(defaults.workers);
        if workers == 0 {
            anyhow::bail!("WORKERS must be at least 1");
        }
        let resync_period = match parse::<u64>(&lookup, "RESYNC_PERIOD_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.resync_period,
        };
        let cache_sync_timeout = parse(&lookup, "CACHE_SYNC_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_sync_timeout);
        let max_retries = parse(&lookup, "MAX_RETRIES")?;
        let policy = match lookup("EXPOSE_POLICY_FILE") {
            Some(path) => {
                let yaml = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read EXPOSE_POLICY_FILE {}", path))?;
                ExposePolicy::from_yaml(&yaml)
                    .with_context(|| format!("invalid expose policy in {}", path))?
            }
            None => ExposePolicy::default(),
        };
        let metrics_addr = lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port)
            .parse::<SocketAddr>()
            .context("invalid METRICS_LISTEN_ADDR or METRICS_LISTEN_PORT")?;
        Ok(Configuration {
            watch_namespaces,
            controller: ControllerSettings {
                workers,
                resync_period,
                cache_sync_timeout,
                max_retries,
            },
            policy,
            metrics_addr,
        })
    }

    fn deployment_api(&self, client: Client) -> Api<Deployment> {
        let mut tmp = self.watch_namespaces.iter().flatten();
        if let (Some(ns), None) = (tmp.next(), tmp.next()) {
            // Optimize for the use-case where exactly one watch-namespace is provided.
            info!("Controller is only watching deployments in namespace {}", ns);
            Api::namespaced(client, ns.as_str())
        } else {
            if let Some(namespaces) = &self.watch_namespaces {
                let namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
                info!(
                    "Controller is watching deployments in namespaces: {}",
                    namespaces.join(",")
                );
            } else {
                info!("Controller is watching deployments in all namespaces");
            }
            Api::all(client)
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| {
            v.parse::<T>()
                .with_context(|| format!("invalid value {:?} for {}", v, name))
        })
        .transpose()
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for SIGINT: {}", e);
            futures::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();
    tokio::select! {
        _ = interrupt => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let configuration = Configuration::from_env()?;
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());

    let client = Client::try_default().await?;
    let (reader, writer) = reflector::store();
    let (cache, cache_sync) = ReflectorCache::new(reader);
    let deployment_events = watcher::watcher(
        configuration.deployment_api(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff()
    .reflect(writer);
    let queue = WorkQueue::new(QUEUE_NAME, default_controller_rate_limiter());
    let notifier = EventNotifier::new(queue.clone(), cache_sync);
    let reconciler = ServiceReconciler::new(
        cache.clone(),
        KubeServiceApi::new(client),
        configuration.policy.clone(),
        configuration.watch_namespaces.clone(),
    );
    let controller = Controller::new(
        reconciler,
        cache.clone(),
        queue,
        configuration.controller.clone(),
    );

    let notifier = tokio::spawn(notifier.run(deployment_events));
    let metrics_server = start_prometheus_metrics_server(
        configuration.metrics_addr,
        registry,
        cache,
        controller.state(),
    );
    info!("start controller ...");
    let result = run_with_metrics_server(controller.run(shutdown_signal()), metrics_server).await;
    notifier.abort();
    if let Err(e) = meter_provider.shutdown() {
        debug!("failed to shut down meter provider: {}", e);
    }
    result
}

/// Drive the controller until it returns, or fail as soon as the metrics
/// server does.
async fn run_with_metrics_server(
    controller: impl Future<Output = Result<(), ControllerError>>,
    metrics_server: impl Future<Output = anyhow::Result<()>>,
) -> anyhow::Result<()> {
    tokio::select! {
        result = controller => Ok(result?),
        result = metrics_server => {
            let e = result
                .err()
                .unwrap_or_else(|| anyhow::anyhow!("metrics server terminated"));
            error!("metrics server failed: {:#}", e);
            Err(e.context("metrics server failed"))
        }
    }
}
