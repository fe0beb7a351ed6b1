use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;

use crate::types::{RawPayload, Reading, TelemetryType, UnifiedRecord};

/// Merge per-type payloads into one record per distinct `end_at`, ascending.
///
/// Pure: no I/O, no clock. A type that is missing from `payloads` or has no
/// reading at a timestamp leaves its fields `None`. When a payload repeats a
/// timestamp the later occurrence wins. Intervals whose `end_at` cannot be
/// represented as a date are dropped.
pub fn merge(
    payloads: &BTreeMap<TelemetryType, RawPayload>,
    system_id: u64,
    tz: Tz,
    interval_secs: u64,
) -> Vec<UnifiedRecord> {
    let mut rows: BTreeMap<i64, Row> = BTreeMap::new();

    for payload in payloads.values() {
        for interval in &payload.intervals {
            let row = rows.entry(interval.end_at).or_default();
            // Later duplicates overwrite earlier ones within the same type.
            match interval.reading {
                Reading::Production { wh_del } => row.production = Some(wh_del),
                Reading::Consumption { wh_used } => row.consumption = Some(wh_used),
                Reading::Battery { charge_wh, discharge_wh, soc_percent } => {
                    row.battery = Some((charge_wh, discharge_wh, soc_percent))
                }
                Reading::Import { wh_imported } => row.import = Some(wh_imported),
                Reading::Export { wh_exported } => row.export = Some(wh_exported),
            }
        }
    }

    rows.into_iter()
        .filter_map(|(end_at, row)| {
            let timestamp_local = to_local(end_at, tz)?;
            Some(row.into_record(end_at, timestamp_local, system_id, interval_secs))
        })
        .collect()
}

/// UTC epoch seconds to wall-clock time in `tz`, with the offset in force at
/// that instant.
pub fn to_local(end_at: i64, tz: Tz) -> Option<DateTime<FixedOffset>> {
    let utc = DateTime::<Utc>::from_timestamp(end_at, 0)?;
    Some(utc.with_timezone(&tz).fixed_offset())
}

/// Average power over an interval from the energy delivered in it.
fn watts(wh: f64, interval_secs: u64) -> f64 {
    wh * 3600.0 / interval_secs as f64
}

#[derive(Default)]
struct Row {
    production: Option<Option<f64>>,
    consumption: Option<Option<f64>>,
    battery: Option<(Option<f64>, Option<f64>, Option<f64>)>,
    import: Option<Option<f64>>,
    export: Option<Option<f64>>,
}

impl Row {
    fn into_record(
        self,
        timestamp_utc: i64,
        timestamp_local: DateTime<FixedOffset>,
        system_id: u64,
        interval_secs: u64,
    ) -> UnifiedRecord {
        let production_wh = self.production.flatten();
        let consumption_wh = self.consumption.flatten();
        let (charge, discharge, soc) = self.battery.unwrap_or((None, None, None));

        let battery_power_w = match (charge, discharge) {
            (None, None) => None,
            (c, d) => Some(watts(c.unwrap_or(0.0) - d.unwrap_or(0.0), interval_secs)),
        };

        UnifiedRecord {
            timestamp_utc,
            timestamp_local,
            production_wh,
            production_w: production_wh.map(|wh| watts(wh, interval_secs)),
            consumption_wh,
            consumption_w: consumption_wh.map(|wh| watts(wh, interval_secs)),
            battery_percent: soc,
            battery_power_w,
            grid_import_wh: self.import.flatten(),
            grid_export_wh: self.export.flatten(),
            system_id,
        }
    }
}
