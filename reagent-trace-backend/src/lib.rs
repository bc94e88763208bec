use anyhow::Context;
use serde::Serialize;
use valuable::Valuable;

use crate::{
    codegen::CodeSynthesizer,
    config::{Cli, Command, ImpactTarget, Operation},
    db::{PgStore, Store},
    engine::{ExperimentAlert, ImpactEngine, TransitionReport},
    impact::ImpactSummary,
    model::{Alert, AlertLink, Aliquot, AuditLogEntry, GenerateAliquots, StorageLocation, Usage},
    notify::{AnyNotifier, Notifier},
};

pub mod codegen;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod impact;
mod logging;
pub mod model;
pub mod notify;

#[derive(Serialize)]
struct AlertWithLinks {
    #[serde(flatten)]
    alert: Alert,
    links: Vec<AlertLink>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Output {
    Migrated { migrated: bool },
    Aliquots(Vec<Aliquot>),
    Aliquot(Aliquot),
    Impact(ImpactSummary),
    Transition(Box<TransitionReport>),
    Usage(Usage),
    Detached { detached: bool },
    Acknowledged(AlertLink),
    Alerts(Vec<AlertWithLinks>),
    ExperimentAlerts(Vec<ExperimentAlert>),
    Audit(Vec<AuditLogEntry>),
}

async fn execute<S: Store, N: Notifier>(
    engine: &ImpactEngine<S, N>,
    operation: Operation,
) -> error::Result<Output> {
    use Operation::{
        Acknowledge, Alerts, AssignLocation, Attach, Audit, Detach, ExperimentAlerts, FailQc,
        GenerateAliquots as Generate, Impact, MarkContaminated, Release, UpdateStatus,
    };

    let transition = |report| Output::Transition(Box::new(report));

    let output = match operation {
        Generate {
            sample_id,
            count,
            made_on,
            volume,
            concentration,
            unit,
            actor,
        } => {
            let request = GenerateAliquots {
                volume,
                concentration,
                unit,
                created_by: actor,
                ..GenerateAliquots::new(sample_id, count, made_on)
            };

            Output::Aliquots(
                CodeSynthesizer::new()
                    .generate_aliquots(engine.store(), request)
                    .await?,
            )
        }
        Impact { target } => Output::Impact(match target {
            ImpactTarget::Aliquot { id } => engine.aliquot_impact(id).await?,
            ImpactTarget::Batch { id } => engine.batch_impact(id).await?,
        }),
        MarkContaminated {
            aliquot_id,
            reason,
            actor,
        } => transition(
            engine
                .mark_aliquot_contaminated(aliquot_id, reason, actor)
                .await?,
        ),
        UpdateStatus {
            aliquot_id,
            status,
            reason,
            actor,
        } => transition(
            engine
                .update_aliquot_status(aliquot_id, status, reason, actor)
                .await?,
        ),
        FailQc { batch_id, actor } => transition(engine.fail_batch_qc(batch_id, actor).await?),
        Release { batch_id, actor } => transition(engine.release_batch(batch_id, actor).await?),
        Attach {
            experiment_id,
            aliquot,
            notes,
        } => Output::Usage(engine.attach_aliquot(experiment_id, &aliquot, notes).await?),
        Detach {
            experiment_id,
            aliquot_id,
        } => {
            engine.detach_aliquot(experiment_id, aliquot_id).await?;

            Output::Detached { detached: true }
        }
        AssignLocation {
            aliquot_id,
            freezer,
            box_label,
            position,
            actor,
        } => {
            let location = StorageLocation::new(
                freezer.as_deref(),
                box_label.as_deref(),
                position.as_deref(),
            );

            Output::Aliquot(engine.assign_location(aliquot_id, location, actor).await?)
        }
        Acknowledge {
            alert_id,
            experiment_id,
            actor,
        } => Output::Acknowledged(
            engine
                .acknowledge_alert(alert_id, experiment_id, actor)
                .await?,
        ),
        Alerts {
            entity_type,
            entity_id,
        } => {
            let mut alerts = Vec::new();
            for alert in engine.alerts_for(entity_type, entity_id).await? {
                let links = engine.alert_links(alert.id).await?;
                alerts.push(AlertWithLinks { alert, links });
            }

            Output::Alerts(alerts)
        }
        ExperimentAlerts { experiment_id } => {
            Output::ExperimentAlerts(engine.experiment_alerts(experiment_id).await?)
        }
        Audit {
            entity_type,
            entity_id,
            limit,
        } => Output::Audit(engine.audit_trail(entity_type, entity_id, limit).await?),
    };

    Ok(output)
}

/// Runs one command against the configured database and prints its result as JSON on stdout
///
/// # Errors
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        mut config,
        log_dir,
        command,
    } = cli;

    logging::initialize_logging(log_dir.as_deref());

    config
        .read_secrets()
        .context("failed to read secrets directory")?;

    let store = PgStore::connect(&config.db_url(), config.db_max_connections())
        .context("failed to create database connection pool")?;

    let output = match command {
        Command::Migrate => {
            store
                .run_migrations()
                .await
                .context("failed to run database migrations")?;
            tracing::info!("ran database migrations");

            Output::Migrated { migrated: true }
        }
        Command::Operation(operation) => {
            let notifier = AnyNotifier::from_webhook(config.notify_webhook_url().cloned());
            let engine = ImpactEngine::new(store, notifier);

            match execute(&engine, operation).await {
                Ok(output) => output,
                Err(err) => {
                    tracing::error!(error = err.as_value(), "command failed");
                    println!("{}", serde_json::to_string_pretty(&err)?);

                    return Err(err).context("command failed");
                }
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
