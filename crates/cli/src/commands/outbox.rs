use fleetsync_core::domain::outbox::{AttemptId, AttemptStatus};

use crate::commands::{load_config, open_pool, runtime, sync_engine, to_data, CommandResult, Failure};

pub fn list(status: Option<&str>, limit: u32) -> CommandResult {
    let result = parse_status(status).and_then(|status| {
        let config = load_config()?;
        runtime()?.block_on(async {
            let pool = open_pool(&config).await?;
            let engine = sync_engine(pool.clone(), &config)?;
            let entries = engine.list_outbox(status, limit.max(1)).await;
            pool.close().await;
            Ok(entries?)
        })
    });

    match result {
        Ok(entries) => CommandResult::success_with(
            "outbox list",
            format!("{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" }),
            to_data(&entries),
        ),
        Err(failure) => failure.into_result("outbox list"),
    }
}

pub fn stats() -> CommandResult {
    let result = load_config().and_then(|config| {
        runtime()?.block_on(async {
            let pool = open_pool(&config).await?;
            let engine = sync_engine(pool.clone(), &config)?;
            let stats = engine.outbox_stats().await;
            pool.close().await;
            Ok(stats?)
        })
    });

    match result {
        Ok(stats) => CommandResult::success_with(
            "outbox stats",
            format!("{} failure(s) in the last 24h", stats.failed_since),
            to_data(&stats),
        ),
        Err(failure) => failure.into_result("outbox stats"),
    }
}

/// Re-runs one entry through the same path the server uses.
pub fn replay(attempt_id: &str) -> CommandResult {
    let result = load_config().and_then(|config| {
        runtime()?.block_on(async {
            let pool = open_pool(&config).await?;
            let engine = sync_engine(pool.clone(), &config)?;
            let attempt = engine.replay(&AttemptId(attempt_id.to_string())).await;
            pool.close().await;
            Ok(attempt?)
        })
    });

    match result {
        Ok(attempt) => CommandResult::success_with(
            "outbox replay",
            format!("entry {} is {}", attempt.id, attempt.status.as_str()),
            to_data(&attempt),
        ),
        Err(failure) => failure.into_result("outbox replay"),
    }
}

fn parse_status(raw: Option<&str>) -> Result<Option<AttemptStatus>, Failure> {
    match raw {
        None => Ok(None),
        Some(raw) => AttemptStatus::parse(raw).map(Some).ok_or_else(|| {
            Failure::new(
                "invalid_argument",
                format!("unknown status `{raw}`; use pending, processing, completed or failed"),
                2,
            )
        }),
    }
}
