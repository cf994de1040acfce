//! Print the call history kept by the dashboard API.
//!
//! `call_history` lists every call; `call_history <call_id>` shows one.

use anyhow::{Context, Result};
use callbot::backend::{BackendClient, CallRecord, CallStatus};
use callbot::ClientConfig;
use tracing_subscriber::EnvFilter;

fn status_label(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Resolved => "✅ resolved",
        CallStatus::Ended => "📴 ended",
        CallStatus::Escalated => "🙋 escalated",
        CallStatus::Active => "📞 active",
        CallStatus::Unknown => "❔ unknown",
    }
}

fn print_record(record: &CallRecord) {
    println!(
        "{:<12} {:<24} {:<16} {:<14} {:<20} {}",
        record.call_id(),
        record.user_name.as_deref().unwrap_or("-"),
        record.phone_number.as_deref().unwrap_or("-"),
        status_label(record.status()),
        record.start_time.as_deref().unwrap_or("-"),
        record.agent_name.as_deref().unwrap_or(""),
    );
    if let Some(summary) = record.summary.as_deref().filter(|s| !s.is_empty()) {
        println!("    {}", summary);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = ClientConfig::from_env();
    let backend = BackendClient::new(&config.backend_url, &config.dashboard_url);

    if let Some(call_id) = std::env::args().nth(1) {
        match backend.get_call(&call_id).await.context("call lookup failed")? {
            Some(record) => print_record(&record),
            None => println!("No call with id {}", call_id),
        }
        return Ok(());
    }

    let records = backend.list_calls().await.context("could not load call history")?;
    println!("📚 {} calls", records.len());
    for record in &records {
        print_record(record);
    }

    let escalated = records
        .iter()
        .filter(|r| r.status() == CallStatus::Escalated)
        .count();
    println!("\n{} escalated to an agent", escalated);
    Ok(())
}
