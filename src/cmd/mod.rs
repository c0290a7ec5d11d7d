//! CLI command implementations.
//!
//! Thin handlers over the coordination core: open the store, run one
//! operation, print the outcome. The classify command and push transport
//! are the CLI-level stand-ins for their production collaborators.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use tokio::sync::mpsc;

use siteflow::config::SiteflowConfig;
use siteflow::errors::FlowError;
use siteflow::flow::{self, AdvanceOutcome, FlowEngine};
use siteflow::mediation::{CommandClassifier, Mediator};
use siteflow::notify::{spawn_notification_worker, LogTransport, NotificationRouter};
use siteflow::store::models::{GateStatus, MaterialRequestStatus, Role, Sender, Urgency};
use siteflow::store::{DbHandle, StoreDb};
use siteflow::sync::{QueuedOp, SyncManager};
use siteflow::timeline::TimelineHub;

pub fn open_store(db_path: &Path) -> Result<DbHandle> {
    let db = StoreDb::new(db_path)
        .with_context(|| format!("Failed to open store at {}", db_path.display()))?;
    db.seed_phases(&flow::PHASES)?;
    Ok(DbHandle::new(db))
}

pub fn cmd_init(db_path: &Path) -> Result<()> {
    open_store(db_path)?;
    println!("Initialized site store at {}", db_path.display());
    println!("Phase catalog:");
    for phase in &flow::PHASES {
        println!("  {}. {} ({})", phase.ordinal, phase.name, phase.id);
    }
    println!("Gate transitions:");
    for transition in &flow::TRANSITIONS {
        println!("  {} (enters phase {})", transition.id, transition.enters_ordinal);
    }
    Ok(())
}

pub async fn cmd_site_add(db: &DbHandle, name: String, org_id: i64) -> Result<()> {
    let site_id = db.call(move |db| db.insert_site(&name, org_id)).await?;
    println!("site {}", site_id);
    Ok(())
}

pub async fn cmd_lot_add(db: &DbHandle, site_id: i64, number: String, phase: u32) -> Result<()> {
    anyhow::ensure!(
        flow::phase_by_ordinal(phase).is_some(),
        "phase ordinal {} is outside the catalog",
        phase
    );
    let lot_id = db
        .call(move |db| db.insert_lot(site_id, &number, phase))
        .await?;
    println!("lot {}", lot_id);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn cmd_post(
    db: &DbHandle,
    config: &SiteflowConfig,
    site_id: i64,
    lot_id: Option<i64>,
    sender_id: i64,
    role: String,
    name: String,
    content: String,
) -> Result<()> {
    let sender = Sender {
        user_id: sender_id,
        role: Role::from_str(&role).map_err(|e| anyhow::anyhow!(e))?,
        display_name: name,
    };
    let hub = TimelineHub::new(
        db.clone(),
        config.timeline.channel_capacity,
        config.timeline.backlog_limit,
    );
    let message_id = hub.post_message(site_id, lot_id, &sender, &content).await?;
    println!("message {}", message_id);
    Ok(())
}

pub async fn cmd_messages(
    db: &DbHandle,
    config: &SiteflowConfig,
    site_id: i64,
    lot_id: Option<i64>,
    limit: Option<usize>,
) -> Result<()> {
    let hub = TimelineHub::new(
        db.clone(),
        config.timeline.channel_capacity,
        config.timeline.backlog_limit,
    );
    let messages = hub.backlog(site_id, lot_id, limit).await?;
    for message in messages {
        let scope = message
            .lot_id
            .map(|id| format!(" [lot {}]", id))
            .unwrap_or_default();
        println!(
            "#{}{} {} ({}): {}",
            message.id,
            scope,
            message.sender.display_name,
            message.sender.role.as_str(),
            message.content
        );
        if let Some(interpretation) = message.ai_interpretation {
            println!("    {}", style(interpretation).dim());
        }
    }
    Ok(())
}

pub async fn cmd_mediate(db: &DbHandle, config: &SiteflowConfig, message_id: i64) -> Result<()> {
    let classifier = Arc::new(
        CommandClassifier::new(&config.mediation.classify_cmd)
            .with_timeout(Duration::from_secs(config.mediation.classify_timeout_secs)),
    );
    let router = NotificationRouter::new(
        db.clone(),
        Arc::new(LogTransport),
        config.notify.batch_size,
    );
    let (tx, rx) = mpsc::channel(config.notify.channel_capacity);
    let worker = spawn_notification_worker(router, rx);

    let mediator =
        Mediator::new(db.clone(), classifier, config.mediation.clone()).with_notifier(tx);
    let result = mediator.mediate(message_id).await?;

    // Dropping the mediator closes the channel; let the worker drain.
    drop(mediator);
    worker.await.context("notification worker panicked")?;

    if result.is_fallback() {
        println!("note (uninterpreted)");
    } else {
        println!(
            "{} ({:.2}): {}",
            result.event_type.as_str(),
            result.confidence,
            result.title
        );
    }
    Ok(())
}

pub async fn cmd_advance(db: &DbHandle, lot_id: i64) -> Result<()> {
    let engine = FlowEngine::new(db.clone());
    match engine.advance_phase(lot_id).await {
        Ok(AdvanceOutcome::Advanced { new_phase }) => {
            let name = flow::phase_by_ordinal(new_phase)
                .map(|p| p.name)
                .unwrap_or("?");
            println!(
                "{} lot {} now at phase {} ({})",
                style("Advanced:").green(),
                lot_id,
                new_phase,
                name
            );
            Ok(())
        }
        Ok(AdvanceOutcome::Blocked(reason)) => {
            println!("{} {}", style("Blocked:").yellow(), reason);
            Ok(())
        }
        Err(FlowError::Conflict { .. }) => {
            anyhow::bail!("lot {} was advanced concurrently; re-run to retry", lot_id)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn cmd_status(db: &DbHandle, lot_id: i64) -> Result<()> {
    let engine = FlowEngine::new(db.clone());
    let status = engine.flow_status(lot_id).await?;
    println!("lot {} at phase {}", status.lot_id, status.current_phase);
    for phase in &status.phases {
        let marker = match phase.status {
            flow::PhaseDisplayStatus::Done => style("done").green(),
            flow::PhaseDisplayStatus::Blocked => style("blocked").red(),
            flow::PhaseDisplayStatus::Active => style("active").cyan(),
            flow::PhaseDisplayStatus::Pending => style("pending").dim(),
        };
        let items = if phase.open_items > 0 {
            format!(" ({} open)", phase.open_items)
        } else {
            String::new()
        };
        println!("  {}. {} {}{}", phase.ordinal, phase.name, marker, items);
    }
    let mut gates: Vec<_> = status.gate_status.iter().collect();
    gates.sort_by_key(|(id, _)| {
        flow::transition_by_id(id.as_str())
            .map(|t| t.enters_ordinal)
            .unwrap_or(u32::MAX)
    });
    for (transition_id, gate_status) in gates {
        println!("  gate {}: {}", transition_id, gate_status);
    }
    Ok(())
}

pub async fn cmd_block(db: &DbHandle, lot_id: i64, phase: u32, title: String) -> Result<()> {
    anyhow::ensure!(
        flow::phase_by_ordinal(phase).is_some(),
        "phase ordinal {} is outside the catalog",
        phase
    );
    let item_id = db
        .call(move |db| db.insert_blocking_item(lot_id, phase, &title))
        .await?;
    println!("blocking item {}", item_id);
    Ok(())
}

pub async fn cmd_resolve(db: &DbHandle, item_id: i64) -> Result<()> {
    let closed = db.call(move |db| db.close_blocking_item(item_id)).await?;
    if closed {
        println!("resolved item {}", item_id);
    } else {
        println!("item {} was not open", item_id);
    }
    Ok(())
}

pub async fn cmd_gate(
    db: &DbHandle,
    lot_id: i64,
    transition_id: String,
    status: String,
) -> Result<()> {
    if flow::transition_by_id(&transition_id).is_none() {
        return Err(FlowError::UnknownTransition { transition_id }.into());
    }
    let status = GateStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?;
    db.call(move |db| db.upsert_gate_check(lot_id, &transition_id, status))
        .await?;
    println!("gate recorded");
    Ok(())
}

pub async fn cmd_material_list(db: &DbHandle, site_id: i64) -> Result<()> {
    let requests = db
        .call(move |db| db.material_requests_for_site(site_id))
        .await?;
    for request in requests {
        let quantity = match (request.quantity, &request.unit) {
            (Some(q), Some(u)) => format!(" {} {}", q, u),
            (Some(q), None) => format!(" {}", q),
            _ => String::new(),
        };
        println!(
            "#{} {}{} [{}] {}",
            request.id,
            request.material,
            quantity,
            request.urgency.as_str(),
            request.status.as_str()
        );
    }
    Ok(())
}

pub async fn cmd_material_set(db: &DbHandle, request_id: i64, status: String) -> Result<()> {
    let status = MaterialRequestStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?;
    db.call(move |db| db.update_material_status(request_id, status))
        .await?;
    println!("request {} now {}", request_id, status.as_str());
    Ok(())
}

pub async fn cmd_device_register(
    db: &DbHandle,
    user_id: i64,
    app: String,
    token: String,
    disabled: bool,
) -> Result<()> {
    db.call(move |db| db.upsert_device(user_id, &app, Some(&token), !disabled))
        .await?;
    println!("device registered");
    Ok(())
}

pub async fn cmd_assign(db: &DbHandle, site_id: i64, user_id: i64, inactive: bool) -> Result<()> {
    db.call(move |db| db.upsert_site_assignment(site_id, user_id, !inactive))
        .await?;
    println!("assignment recorded");
    Ok(())
}

pub async fn cmd_member(db: &DbHandle, org_id: i64, user_id: i64, role: String) -> Result<()> {
    let role = Role::from_str(&role).map_err(|e| anyhow::anyhow!(e))?;
    db.call(move |db| db.upsert_org_membership(org_id, user_id, role))
        .await?;
    println!("membership recorded");
    Ok(())
}

// ── Offline queue commands ───────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn cmd_queue_post(
    db: &DbHandle,
    config: &SiteflowConfig,
    site_id: i64,
    lot_id: Option<i64>,
    sender_id: i64,
    role: String,
    name: String,
    content: String,
) -> Result<()> {
    let sender = Sender {
        user_id: sender_id,
        role: Role::from_str(&role).map_err(|e| anyhow::anyhow!(e))?,
        display_name: name,
    };
    let manager = SyncManager::new(db.clone(), config.sync.clone());
    let op_id = manager
        .queue()
        .enqueue(QueuedOp::PostMessage {
            site_id,
            lot_id,
            sender,
            content,
        })
        .await?;
    println!("queued {}", op_id);
    Ok(())
}

pub async fn cmd_queue_close_item(
    db: &DbHandle,
    config: &SiteflowConfig,
    item_id: i64,
) -> Result<()> {
    let manager = SyncManager::new(db.clone(), config.sync.clone());
    let op_id = manager
        .queue()
        .enqueue(QueuedOp::CloseBlockingItem { item_id })
        .await?;
    println!("queued {}", op_id);
    Ok(())
}

pub async fn cmd_queue_material(
    db: &DbHandle,
    config: &SiteflowConfig,
    site_id: i64,
    lot_id: Option<i64>,
    material: String,
    quantity: Option<f64>,
    unit: Option<String>,
    urgency: String,
) -> Result<()> {
    let urgency = Urgency::from_str(&urgency).map_err(|e| anyhow::anyhow!(e))?;
    let manager = SyncManager::new(db.clone(), config.sync.clone());
    let op_id = manager
        .queue()
        .enqueue(QueuedOp::CreateMaterialRequest {
            site_id,
            lot_id,
            material,
            quantity,
            unit,
            urgency,
        })
        .await?;
    println!("queued {}", op_id);
    Ok(())
}

/// One connectivity cycle: replay everything pending.
pub async fn cmd_queue_flush(db: &DbHandle, config: &SiteflowConfig) -> Result<()> {
    let manager = SyncManager::new(db.clone(), config.sync.clone());
    let report = manager.flush().await?;
    println!(
        "flushed {} failed {} quarantined {}",
        report.flushed, report.failed, report.quarantined
    );
    Ok(())
}

pub async fn cmd_queue_list(db: &DbHandle, config: &SiteflowConfig) -> Result<()> {
    let manager = SyncManager::new(db.clone(), config.sync.clone());
    for item in manager.queue().pending().await? {
        println!(
            "{} captured {} attempts {}: {}",
            item.op_id, item.captured_at, item.attempts, item.payload
        );
    }
    Ok(())
}

pub async fn cmd_queue_quarantined(db: &DbHandle, config: &SiteflowConfig) -> Result<()> {
    let manager = SyncManager::new(db.clone(), config.sync.clone());
    let items = manager.queue().quarantined().await?;
    if items.is_empty() {
        println!("quarantine empty");
        return Ok(());
    }
    for item in items {
        println!(
            "{} {} captured {} attempts {}: {}",
            style("quarantined").red(),
            item.op_id,
            item.captured_at,
            item.attempts,
            item.payload
        );
    }
    Ok(())
}
