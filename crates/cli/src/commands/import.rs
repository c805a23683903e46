use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetsync_core::domain::import::{DateRange, ImportRunStatus};
use fleetsync_engine::http::HttpCrmGateway;
use fleetsync_engine::BulkImporter;

use crate::commands::{load_config, open_pool, runtime, to_data, CommandResult, Failure};

/// Which creation window to import.
#[derive(Clone, Copy, Debug)]
pub enum ImportWindow {
    Year(i32),
    Range { from: DateTime<Utc>, to: DateTime<Utc> },
}

impl ImportWindow {
    fn range(self) -> Result<DateRange, Failure> {
        match self {
            Self::Year(year) => DateRange::for_year(year),
            Self::Range { from, to } => DateRange::new(from, to),
        }
        .map_err(|error| Failure::new("invalid_range", error.to_string(), 7))
    }
}

/// Runs a bulk import to completion in the foreground.
pub fn run(window: ImportWindow) -> CommandResult {
    let result = load_config().and_then(|config| {
        let range = window.range()?;
        runtime()?.block_on(async {
            let pool = open_pool(&config).await?;
            let crm = HttpCrmGateway::new(&config.crm)
                .map_err(|error| Failure::new("client_setup", error.to_string(), 6))?;
            let importer = BulkImporter::from_config(pool.clone(), &config, Arc::new(crm));
            let run = importer.run(range).await;
            pool.close().await;
            Ok(run?)
        })
    });

    match result {
        Ok(run) if run.status == ImportRunStatus::Failed => CommandResult::failure(
            "import",
            "import_failed",
            format!(
                "run {} failed after {} page(s): {}",
                run.id,
                run.pages_fetched,
                run.error.as_deref().unwrap_or("unknown error")
            ),
            7,
        ),
        Ok(run) => CommandResult::success_with(
            "import",
            format!(
                "run {} finished as {}: {} bookings, {} clients, {} vehicles, {} rejected",
                run.id,
                run.status.as_str(),
                run.counts.leads,
                run.counts.contacts,
                run.counts.vehicles,
                run.counts.rejected
            ),
            to_data(&run),
        ),
        Err(failure) => failure.into_result("import"),
    }
}
