use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use shepherd_abm::{AbmClient, OAuth1Credentials};
use shepherd_apple::{ApnsClient, ApnsCredentialCache};
use shepherd_api::{build_app, AppState};
use shepherd_config::load_config;
use shepherd_pki::{CertificateAuthority, ScepServer};
use shepherd_reconciler::reconcile::{reconcile, ReconcileParams};
use shepherd_reconciler::{enrollment, escrow, match_flow};
use shepherd_store::{RedbStore, Store};
use shepherd_worker::{Schedule, Worker, RECONCILER_SCHEDULE, ROSTER_SYNC_SCHEDULE};
use tracing::{info, warn};

pub async fn serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let store: Arc<dyn Store> = Arc::new(RedbStore::open(&config.data_dir.join("state.redb"))?);

    // First run: mint the enrollment-profile capability token.
    let mut settings = store.get_settings().await?;
    if settings.enroll_profile_token.is_empty() {
        settings.enroll_profile_token = shepherd_pki::opaque_token();
        store.put_settings(&settings).await?;
    }

    let pki_dir = config.data_dir.join("pki");
    let scep_ca = Arc::new(CertificateAuthority::load_or_generate(
        &pki_dir,
        "scep",
        "Shepherd SCEP CA",
        "Shepherd",
    )?);
    let wstep_ca = Arc::new(CertificateAuthority::load_or_generate(
        &pki_dir,
        "wstep",
        "Shepherd WSTEP CA",
        "Shepherd",
    )?);

    let push_cert = std::fs::read_to_string(&config.apns.cert_path)
        .with_context(|| format!("reading {}", config.apns.cert_path.display()))?;
    let push_key = std::fs::read_to_string(&config.apns.key_path)
        .with_context(|| format!("reading {}", config.apns.key_path.display()))?;
    // Push credentials are cached per topic and shared by every caller.
    let apns_cache = ApnsCredentialCache::new();
    let apns = match apns_cache.get(&config.apns.topic).await {
        Some(client) => client,
        None => {
            apns_cache
                .insert(ApnsClient::new(
                    &push_cert,
                    &push_key,
                    config.apns.topic.clone(),
                )?)
                .await
        }
    };

    let abm = config.abm.as_ref().map(|abm| {
        Arc::new(AbmClient::new(OAuth1Credentials {
            consumer_key: abm.consumer_key.clone(),
            consumer_secret: abm.consumer_secret.clone(),
            access_token: abm.access_token.clone(),
            access_secret: abm.access_secret.clone(),
        }))
    });

    // ── Schedules ─────────────────────────────────────────────────────────────

    let reconciler_schedule = {
        let store = store.clone();
        let apns = apns.clone();
        let server_url = config.server_url.clone();
        let scep_ca = scep_ca.clone();
        let wstep_ca = wstep_ca.clone();
        Schedule::new(
            RECONCILER_SCHEDULE,
            Duration::from_secs(config.reconcile_interval_secs),
            move || {
                let store = store.clone();
                let apns = apns.clone();
                let server_url = server_url.clone();
                let scep_ca = scep_ca.clone();
                let wstep_ca = wstep_ca.clone();
                async move {
                    let report = reconcile(ReconcileParams {
                        store: store.as_ref(),
                        server_url: &server_url,
                        apns: Some(apns.as_ref()),
                    })
                    .await
                    .map_err(|e| e.to_string())?;

                    // Piggybacked housekeeping: escrow probe + buffer GC.
                    let cas = escrow::EscrowCas { scep: &scep_ca, wstep: &wstep_ca };
                    if let Err(e) = escrow::probe_decryptability(store.as_ref(), &cas).await {
                        warn!(error = %e, "decryptability probe failed");
                    }
                    if let Err(e) = match_flow::gc_preassigned(store.as_ref(), Utc::now()).await {
                        warn!(error = %e, "preassign GC failed");
                    }

                    Ok(format!(
                        "{} hosts, {} commands, {} errors",
                        report.hosts_seen,
                        report.commands_enqueued,
                        report.errors.len()
                    ))
                }
            },
        )
    };

    let mut schedules: HashMap<String, Schedule> = HashMap::new();
    schedules.insert(RECONCILER_SCHEDULE.to_string(), reconciler_schedule.clone());

    if let Some(abm_client) = abm.clone() {
        let store = store.clone();
        let server_url = config.server_url.clone();
        let roster_schedule = Schedule::new(
            ROSTER_SYNC_SCHEDULE,
            Duration::from_secs(config.dep_sync_interval_secs),
            move || {
                let store = store.clone();
                let abm_client = abm_client.clone();
                let server_url = server_url.clone();
                async move {
                    let settings = store.get_settings().await.map_err(|e| e.to_string())?;
                    let urls = shepherd_abm::ProfileUrls {
                        enroll_url: format!(
                            "{}/mdm/apple/enroll?token={}",
                            server_url, settings.enroll_profile_token
                        ),
                    };
                    let report = shepherd_abm::sync_roster(store.as_ref(), &abm_client, &urls)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(format!(
                        "{} added, {} modified, {} deleted",
                        report.added.len(),
                        report.modified.len(),
                        report.deleted.len()
                    ))
                }
            },
        );
        schedules.insert(ROSTER_SYNC_SCHEDULE.to_string(), roster_schedule);
    }
    let schedules = Arc::new(schedules);

    // ── Worker ────────────────────────────────────────────────────────────────

    let worker = {
        let store = store.clone();
        let server_url = config.server_url.clone();
        let reconciler = reconciler_schedule.clone();
        Worker::new(
            store.clone(),
            Arc::new(move |job: shepherd_store::Job| {
                let store = store.clone();
                let server_url = server_url.clone();
                let reconciler = reconciler.clone();
                Box::pin(async move {
                    let handled = enrollment::handle_job(
                        store.as_ref(),
                        &server_url,
                        &job.kind,
                        &job.args,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                    if handled && job.kind == enrollment::JOB_POST_DEP_ENROLLMENT {
                        // Chain a reconcile so the fresh device converges
                        // without waiting for the next tick.
                        if let Err(e) = reconciler.trigger().await {
                            warn!(error = %e, "post-enrollment reconcile failed");
                        }
                    }
                    Ok(handled)
                })
            }),
        )
    };

    // ── Serve ─────────────────────────────────────────────────────────────────

    let state = AppState {
        store,
        scep: Arc::new(ScepServer::new(scep_ca.clone(), config.scep.challenge.clone())),
        scep_ca,
        wstep_ca,
        apns: Some(apns),
        abm,
        server_url: Arc::new(config.server_url.clone()),
        api_token: Arc::new(config.api_token.clone()),
        scep_challenge: Arc::new(config.scep.challenge.clone()),
        apns_topic: Arc::new(config.apns.topic.clone()),
        http: reqwest::Client::new(),
        schedules: schedules.clone(),
        organization: Arc::new("Shepherd".to_string()),
    };
    let app = build_app(state);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = Vec::new();
    for schedule in schedules.values() {
        tasks.push(schedule.start(shutdown_rx.clone()));
    }
    tasks.push(worker.start(shutdown_rx.clone()));

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(listen = %config.listen, server_url = %config.server_url, "shepherd serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

fn remote_or_default(remote: Option<String>) -> String {
    remote.unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
}

pub async fn status(remote: Option<String>, token: Option<String>) -> Result<()> {
    let base = remote_or_default(remote);
    let token = token.ok_or_else(|| anyhow!("--token (or SHEPHERD_API_TOKEN) is required"))?;
    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/status", base))
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn trigger(schedule: String, remote: Option<String>, token: Option<String>) -> Result<()> {
    let base = remote_or_default(remote);
    let token = token.ok_or_else(|| anyhow!("--token (or SHEPHERD_API_TOKEN) is required"))?;
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/schedules/{}/trigger", base, schedule))
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
