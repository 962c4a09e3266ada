//! The dump plan: which tasks a run consists of.
//!
//! Pure configuration data. Per product kind: a task per publication state,
//! each with day/week last-modified variants, plus a published slice per
//! publishing channel under `bychannel/<channel>/`.

use std::path::PathBuf;

use chrono::NaiveDate;

use crate::query::Query;
use crate::sched::Task;

pub const PRODUCTS: [&str; 5] = [
    "accommodation",
    "permanent_offering",
    "reca",
    "temporary_offering",
    "meetingroom",
];

pub const CHANNELS: [&str; 15] = [
    "westtoer",
    "brugse_ommeland",
    "westhoek",
    "de_kust",
    "leiestreek",
    "fietsen_en_wandelen",
    "kenniscentrum",
    "dagtrips_voor_groepen",
    "flanders_fields",
    "meetingkust",
    "autoroutes",
    "itrip_coast",
    "kustwandelroute",
    "west-vlinderen",
    "300_jaar_grens",
];

const PERIODS: [(&str, i64); 2] = [("week", 7), ("day", 1)];
const PUB_STATES: [&str; 2] = ["all", "pub"];

/// Build the full, deterministic task list for a run ending `today`.
pub fn build_plan(today: NaiveDate) -> Vec<Task> {
    let mut tasks = Vec::new();

    for product in PRODUCTS {
        let base = Query::product().for_resources([product]);

        for state in PUB_STATES {
            let staged = match state {
                "pub" => base.clone().published(),
                _ => base.clone().ignore_published(),
            };
            let stem = format!("{product}-{state}");
            tasks.push(Task {
                directory: PathBuf::new(),
                name: stem.clone(),
                query: staged.clone(),
            });
            for (period, days) in PERIODS {
                let from = today - chrono::Duration::days(days);
                tasks.push(Task {
                    directory: PathBuf::new(),
                    name: format!(
                        "{stem}-{period}-{}-{}",
                        from.format("%Y%m%d"),
                        today.format("%Y%m%d")
                    ),
                    query: staged.clone().modified_between(Some(from), Some(today)),
                });
            }
        }

        for channel in CHANNELS {
            tasks.push(Task {
                directory: PathBuf::from("bychannel").join(channel),
                name: format!("{product}-{channel}-pub"),
                query: base
                    .clone()
                    .published()
                    .for_channels([format!("{channel}*")]),
            });
        }
    }

    tasks
}
