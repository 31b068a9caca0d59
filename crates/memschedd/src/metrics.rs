use std::time::{SystemTime, UNIX_EPOCH};

use influxdb_line_protocol::LineProtocolBuilder;
use memsched::UnitSnapshot;

/// Measurement written for every regulated CPU.
pub const UNIT_MEASUREMENT: &str = "memsched_unit";

pub fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Encodes one CPU's statistics as an InfluxDB line.
pub fn encode_unit(snapshot: &UnitSnapshot, node_name: &str, timestamp: i64) -> String {
    let stats = &snapshot.stats;
    let lp = LineProtocolBuilder::new()
        .measurement(UNIT_MEASUREMENT)
        .tag("node", node_name)
        .tag("cpu", &snapshot.unit.to_string())
        .field("budget", snapshot.budget)
        .field("cur_budget", snapshot.cur_budget)
        .field("intensity", u64::from(snapshot.intensity))
        .field("throttled", snapshot.throttled)
        .field("idle", snapshot.idle)
        .field("usage_hl2", snapshot.ewma.hl2)
        .field("periods", stats.periods)
        .field("used_total", stats.used_total)
        .field("assigned_total", stats.assigned_total)
        .field("utilization_pct", stats.utilization_pct())
        .field("throttled_periods", stats.throttled_periods)
        .field("throttled_time_ns", stats.throttled_time_ns)
        .field("false_throttles", stats.false_throttles)
        .field("reclaimed_events", stats.reclaimed_events)
        .field("donated_events", stats.donated_events)
        .field("stale_signals", stats.stale_signals)
        .field("throttle_failures", stats.throttle_failures)
        .field("idle_periods", stats.idle_periods)
        .timestamp(timestamp)
        .close_line()
        .build();
    String::from_utf8_lossy(&lp).into_owned()
}
