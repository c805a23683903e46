use crate::commands::{load_config, open_pool, runtime, sync_engine, to_data, CommandResult, Failure};

/// Resets `in_progress` bookings whose lock is older than the threshold. The
/// threshold comes from the flag, else `sync.stale_lock_after_secs`; with
/// neither set the command refuses to guess.
pub fn run(older_than_secs: Option<u64>) -> CommandResult {
    let result = load_config().and_then(|config| {
        let seconds = older_than_secs.or(config.sync.stale_lock_after_secs).ok_or_else(|| {
            Failure::new(
                "config_validation",
                "stale lock release is disabled; pass --older-than-secs or set sync.stale_lock_after_secs",
                2,
            )
        })?;
        let budget = config.sync.provisioning_budget_secs();
        if seconds <= budget {
            return Err(Failure::new(
                "invalid_argument",
                format!(
                    "threshold must exceed {budget}s so locks of running provisioning attempts are kept"
                ),
                2,
            ));
        }
        let older_than = i64::try_from(seconds)
            .ok()
            .filter(|seconds| *seconds > 0)
            .map(chrono::Duration::seconds)
            .ok_or_else(|| Failure::new("invalid_argument", "threshold must be a positive number of seconds", 2))?;

        runtime()?.block_on(async {
            let pool = open_pool(&config).await?;
            let engine = sync_engine(pool.clone(), &config)?;
            let released = engine.release_stale_locks(older_than).await;
            pool.close().await;
            Ok(released?)
        })
    });

    match result {
        Ok(released) => CommandResult::success_with(
            "release-locks",
            format!("released {} stale lock(s)", released.len()),
            to_data(&released),
        ),
        Err(failure) => failure.into_result("release-locks"),
    }
}
